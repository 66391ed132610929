use serde_json::{ Map, Value };
use tracing::debug;

use crate::{
  definition::{ Definition, Dictionary },
  error::{ Error, Result },
};


/// Fetches the JSON source of an imported function. Only consulted
/// during compilation, never at runtime.

pub trait Resolver {
  fn resolve(&mut self, user: &str, library: &str, function: &str) -> Result<String>;
}


/// Compiles a JSON network definition into a [Definition] and stores it
/// in a [Dictionary], recursively resolving and compiling imports.
///
/// A typical definition:
///
/// ```json
/// {
///   "network" : {
///     "name" : "foo",
///     "variables" : ["x", "y", "z"],
///     "constants" : ["a", "b"],
///     "imports" : {
///       "bar" : { "user" : "joe19", "library" : "default" }
///     },
///     "body" : {
///       "e1" : ["*", "a", "x"],
///       "e2" : ["**", "b", "y"],
///       "e3" : ["bar", "z"],
///       "e4" : ["*", { "e2" : -1 }, "e3"],
///       "return" : ["+", "e1", "e2", "e3", "e4"]
///     }
///   }
/// }
/// ```
///
/// Every diagnostic carries a slash path into the definition tree,
/// prefixed by the `(user, library, function)` triple the compiler was
/// created with.

pub struct Compiler {
  user: String,
  library: String,
  function: String,
}

impl Compiler {
  pub fn new(user: &str, library: &str, function: &str) -> Self {
    Self {
      user: user.into(),
      library: library.into(),
      function: function.into(),
    }
  }

  /// Compile `json` into the dictionary and return its key there.

  pub fn compile(&self, json: &str, dict: &mut Dictionary, resolver: &mut dyn Resolver) -> Result<u64> {
    let doc: Value = serde_json::from_str(json)?;

    let mut def = Definition::new();
    let mut path = vec![];
    self.compile_document(&doc, &mut def, dict, resolver, &mut path)?;

    debug!(
      function = def.name(),
      symbols = def.symbols(),
      recurrent = def.recurrent(),
      "compiled definition",
    );

    let id = Dictionary::id(&self.user, &self.library, def.name());
    dict.put(id, def);
    Ok(id)
  }

  fn compile_document(
    &self, doc: &Value, def: &mut Definition,
    dict: &mut Dictionary, resolver: &mut dyn Resolver, path: &mut Vec<String>,
  ) -> Result<()> {
    let doc = self.object(doc, path)?;

    let mut network = false;
    for (key, value) in doc {
      path.push(key.clone());
      if key == "network" {
        self.compile_network(value, def, dict, resolver, path)?;
        network = true;
      } else {
        return Err(self.unexpected_element(key, path));
      }
      path.pop();
    }

    self.require(network, "network", path)
  }

  fn compile_network(
    &self, node: &Value, def: &mut Definition,
    dict: &mut Dictionary, resolver: &mut dyn Resolver, path: &mut Vec<String>,
  ) -> Result<()> {
    let node = self.object(node, path)?;

    let mut name = false;
    let mut body = None;
    for (key, value) in node {
      path.push(key.clone());
      match key.as_str() {
        "name" => {
          let value = self.string(value, path)?;
          self.defined(value, "name", path)?;
          def.set_name(value);
          name = true;
        },
        "variables" => self.compile_variables(value, def, path)?,
        "constants" => self.compile_constants(value, def, path)?,
        "imports" => self.compile_imports(value, def, dict, resolver, path)?,
        "body" => body = Some(value),
        _ => return Err(self.unexpected_element(key, path)),
      }
      path.pop();
    }

    // imports, variables and constants are optional
    self.require(name, "name", path)?;
    self.require(body.is_some(), "body", path)?;

    path.push("body".into());
    let result = self.compile_body(body.expect("checked above"), def, path);
    path.pop();
    result
  }

  fn compile_variables(&self, node: &Value, def: &mut Definition, path: &mut Vec<String>) -> Result<()> {
    let node = self.array(node, path)?;
    for (i, value) in node.iter().enumerate() {
      path.push(format!("[{i}]"));
      let name = self.string(value, path)?;
      def.add_variable(name).map_err(|e| e.locate(&self.str(path)) )?;
      path.pop();
    }
    Ok(())
  }

  fn compile_constants(&self, node: &Value, def: &mut Definition, path: &mut Vec<String>) -> Result<()> {
    let node = self.array(node, path)?;
    for (i, value) in node.iter().enumerate() {
      path.push(format!("[{i}]"));
      let name = self.string(value, path)?;
      def.add_constant(name).map_err(|e| e.locate(&self.str(path)) )?;
      path.pop();
    }
    Ok(())
  }

  fn compile_imports(
    &self, node: &Value, def: &mut Definition,
    dict: &mut Dictionary, resolver: &mut dyn Resolver, path: &mut Vec<String>,
  ) -> Result<()> {
    let node = self.object(node, path)?;
    for (name, value) in node {
      path.push(name.clone());
      self.compile_import(name, value, def, dict, resolver, path)?;
      path.pop();
    }
    Ok(())
  }

  fn compile_import(
    &self, name: &str, node: &Value, def: &mut Definition,
    dict: &mut Dictionary, resolver: &mut dyn Resolver, path: &mut Vec<String>,
  ) -> Result<()> {
    let node = self.object(node, path)?;

    let mut user = None;
    let mut library = None;
    for (key, value) in node {
      path.push(key.clone());
      let value = self.string(value, path)?;
      match key.as_str() {
        "user" => user = Some(value),
        "library" => library = Some(value),
        _ => return Err(self.unexpected_element(key, path)),
      }
      path.pop();
    }

    self.require(user.is_some(), "user", path)?;
    self.require(library.is_some(), "library", path)?;
    let (user, library) = (user.expect("checked above"), library.expect("checked above"));

    // skip resolution if imported already
    let key = Dictionary::id(user, library, name);
    if let Some(existing) = dict.get(key) {
      let recurrent = existing.recurrent();
      return def.add_import(name, key, recurrent).map_err(|e| e.locate(&self.str(path)) );
    }

    // resolve and compile the import
    let wrap = |source: Error| Error::Import {
      user: user.into(),
      library: library.into(),
      function: name.into(),
      source: Box::new(source),
    };
    let json = resolver.resolve(user, library, name).map_err(wrap)?;
    let import = Compiler::new(user, library, name);
    let key = import.compile(&json, dict, resolver).map_err(wrap)?;

    let recurrent = dict.get(key).is_some_and(|import| import.recurrent() );
    def.add_import(name, key, recurrent).map_err(|e| e.locate(&self.str(path)) )
  }

  fn compile_body(&self, node: &Value, def: &mut Definition, path: &mut Vec<String>) -> Result<()> {
    let node = self.object(node, path)?;

    let mut ret = false;
    for (name, value) in node {
      path.push(name.clone());
      ret = ret || name == "return";
      self.compile_expression(name, value, def, path)?;
      path.pop();
    }

    self.require(ret, "return", path)
  }

  fn compile_expression(&self, name: &str, node: &Value, def: &mut Definition, path: &mut Vec<String>) -> Result<()> {
    let node = self.array(node, path)?;

    let mut op = None;
    let mut args = vec![];
    let mut times = vec![];
    for (i, value) in node.iter().enumerate() {
      path.push(format!("[{i}]"));
      match value {
        Value::String(value) if op.is_none() => {
          self.defined(value, "operator", path)?;
          op = Some(value.as_str());
        },
        Value::String(value) if op.is_some() => {
          self.defined(value, "argument", path)?;
          args.push(value.as_str());
          times.push(0);
        },
        Value::Object(value) if op.is_some() => {
          self.compile_argument(value, &mut args, &mut times, path)?;
        },
        _ => return Err(self.unexpected_element(&format!("[{i}]"), path)),
      }
      path.pop();
    }

    self.require(op.is_some(), "operator", path)?;
    def.add_expression(name, op.expect("checked above"), &args, &times)
      .map_err(|e| e.locate(&self.str(path)) )
  }

  fn compile_argument<'a>(
    &self, node: &'a Map<String, Value>,
    args: &mut Vec<&'a str>, times: &mut Vec<i32>, path: &mut Vec<String>,
  ) -> Result<()> {
    for (count, (name, value)) in node.iter().enumerate() {
      path.push(name.clone());
      if count > 0 {
        return Err(self.unexpected_element(name, path));
      }

      self.defined(name, "argument", path)?;
      if !value.is_number() {
        return Err(self.type_error(value, "Number", path));
      }
      let time = value.as_i64().ok_or_else(|| {
        Error::schema(self.str(path), format!("Time offset '{value}' of argument '{name}' is not an integer"))
      })?;
      if time > 0 {
        return Err(Error::schema(self.str(path), format!(
          "Argument '{name}' refers to future values",
        )));
      }

      args.push(name.as_str());
      times.push(time as i32);
      path.pop();
    }
    Ok(())
  }

  // convert definition path to string
  fn str(&self, path: &[String]) -> String {
    let mut p = format!("/{}/{}/{}", self.user, self.library, self.function);
    for key in path {
      p.push('/');
      p.push_str(key);
    }
    p
  }

  fn object<'a>(&self, node: &'a Value, path: &[String]) -> Result<&'a Map<String, Value>> {
    node.as_object().ok_or_else(|| self.type_error(node, "Object", path) )
  }

  fn array<'a>(&self, node: &'a Value, path: &[String]) -> Result<&'a Vec<Value>> {
    node.as_array().ok_or_else(|| self.type_error(node, "Array", path) )
  }

  fn string<'a>(&self, node: &'a Value, path: &[String]) -> Result<&'a str> {
    node.as_str().ok_or_else(|| self.type_error(node, "String", path) )
  }

  fn type_error(&self, node: &Value, expected: &str, path: &[String]) -> Error {
    Error::schema(self.str(path), format!(
      "Unexpected JSON type '{}'. Expected '{expected}' type", type_name(node),
    ))
  }

  fn defined(&self, value: &str, key: &str, path: &[String]) -> Result<()> {
    if value.is_empty() {
      return Err(Error::schema(self.str(path), format!("Undefined value '{key}'")));
    }
    Ok(())
  }

  fn require(&self, present: bool, key: &str, path: &[String]) -> Result<()> {
    if !present {
      return Err(Error::schema(self.str(path), format!("Missing element '{key}'")));
    }
    Ok(())
  }

  fn unexpected_element(&self, key: &str, path: &[String]) -> Error {
    Error::schema(self.str(path), format!("Unexpected element '{key}'"))
  }
}

fn type_name(node: &Value) -> &'static str {
  match node {
    Value::Null => "Null",
    Value::Bool(false) => "False",
    Value::Bool(true) => "True",
    Value::Object(_) => "Object",
    Value::Array(_) => "Array",
    Value::String(_) => "String",
    Value::Number(_) => "Number",
  }
}
