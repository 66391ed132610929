use thiserror::Error;


pub type Result<T> = std::result::Result<T, Error>;


/// Anything that can go wrong while compiling or evaluating a network.
///
/// Compile-time diagnostics carry a slash-separated path locating the
/// offending element within the definition tree, e.g.
/// `/joe19/default/bar/body/e1`.

#[derive(Debug, Error)]
pub enum Error {
  /// The definition source is not valid JSON.
  #[error("JSON error. {0}")]
  Parse(#[from] serde_json::Error),

  /// The definition violates the network grammar.
  #[error("{message} at '{path}'.")]
  Schema { path: String, message: String },

  /// An imported function could not be resolved or compiled.
  #[error("Import '{function}' from '{user}:{library}' failed. {source}")]
  Import {
    user: String,
    library: String,
    function: String,
    #[source]
    source: Box<Error>,
  },

  /// A kernel precondition does not hold.
  #[error("{0}")]
  Shape(String),

  /// An operation was driven in an invalid state.
  #[error("{0}")]
  State(String),
}

impl Error {
  pub(crate) fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Schema { path: path.into(), message: message.into() }
  }

  pub(crate) fn shape(message: impl Into<String>) -> Self {
    Self::Shape(message.into())
  }

  pub(crate) fn state(message: impl Into<String>) -> Self {
    Self::State(message.into())
  }

  /// Attach a location to a schema diagnostic raised without one.

  pub(crate) fn locate(self, path: &str) -> Self {
    match self {
      Self::Schema { path: p, message } if p.is_empty() => {
        Self::Schema { path: path.into(), message }
      },
      other => other,
    }
  }
}
