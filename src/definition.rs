use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{ Hash, Hasher };

use serde::{ Serialize, Deserialize };

use crate::error::{ Error, Result };


/// Tape record types. The discriminants are persisted - do not change them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
  /// Generic user defined function
  Function = 0,
  /// Variable for weights learning
  Variable = 1,
  /// Constant for function input
  Constant = 2,
  /// Function +
  Add = 3,
  /// Function -
  Sub = 4,
  /// Matrix-wise *
  Product = 5,
  /// Element-wise *
  Element = 6,
  /// Transpose
  Transpose = 7,
  /// Exponent
  Exponent = 8,
}

impl OpCode {
  fn from_i32(value: i32) -> Option<Self> {
    match value {
      0 => Some(Self::Function),
      1 => Some(Self::Variable),
      2 => Some(Self::Constant),
      3 => Some(Self::Add),
      4 => Some(Self::Sub),
      5 => Some(Self::Product),
      6 => Some(Self::Element),
      7 => Some(Self::Transpose),
      8 => Some(Self::Exponent),
      _ => None,
    }
  }
}


/// One parsed tape record.
///
/// `args` are local ids of earlier records; `times` are the matching
/// time offsets, zero or negative. `variant` is the import slot for
/// [Function](OpCode::Function) records and -1 otherwise.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
  pub op: OpCode,
  pub variant: i32,
  pub id: usize,
  pub args: Vec<usize>,
  pub times: Vec<i32>,
}


#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImportSlot {
  key: u64,
  recurrent: bool,
}


/// Compiled intermediate representation of one network function.
///
/// The tape is a flat integer sequence of records laid out as
/// `TYPE, VARIANT, ID, ARG_COUNT, arg_1 … arg_n, time_1 … time_n`,
/// appended in declaration order, leaves first: every argument id is
/// smaller than the id of the record referencing it. Imports are
/// recorded as slots holding [Dictionary] keys; the Dictionary owns the
/// definitions themselves.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Definition {
  name: String,
  tape: Vec<i32>,
  names: Vec<String>,
  index: HashMap<String, usize>,
  import_index: HashMap<String, usize>,
  import_defs: Vec<ImportSlot>,
  variables: Vec<usize>,
  constants: Vec<usize>,
  recurrent: bool,
}

impl Definition {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn set_name(&mut self, name: &str) {
    self.name = name.into();
  }

  /// Name of the symbol with the given local id.

  pub fn symbol(&self, id: usize) -> &str {
    &self.names[id]
  }

  /// Local id of a named symbol.

  pub fn symbol_id(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  /// Number of symbols, which is also the id the next record gets.

  pub fn symbols(&self) -> usize {
    self.names.len()
  }

  /// Local ids of trainable variables, in declaration order.

  pub fn variables(&self) -> &[usize] {
    &self.variables
  }

  /// Local ids of input constants, in declaration order.

  pub fn constants(&self) -> &[usize] {
    &self.constants
  }

  /// True iff the tape references past values, directly or through a
  /// recurrent import.

  pub fn recurrent(&self) -> bool {
    self.recurrent
  }

  /// Import slot of a named import.

  pub fn import_id(&self, name: &str) -> Option<usize> {
    self.import_index.get(name).copied()
  }

  /// Dictionary key held by an import slot.

  pub fn import_key(&self, slot: i32) -> Result<u64> {
    if slot >= 0 && (slot as usize) < self.import_defs.len() {
      Ok(self.import_defs[slot as usize].key)
    } else {
      Err(Error::state(format!(
        "Import definition out of range. Index {slot} not below size {}.",
        self.import_defs.len(),
      )))
    }
  }

  /// Iterate the tape records in declaration order.

  pub fn records(&self) -> Records {
    Records { definition: self, offset: 0 }
  }

  /// Parse the record at `offset`, returning it together with the
  /// number of tape integers consumed, or `None` at the end of the tape.

  pub fn get_record(&self, offset: usize) -> Option<(Record, usize)> {
    if offset >= self.tape.len() {
      return None;
    }
    let op = OpCode::from_i32(self.tape[offset])?;
    let variant = self.tape[offset + 1];
    let id = self.tape[offset + 2] as usize;
    let arg_count = self.tape[offset + 3] as usize;
    let args = self.tape[offset + 4..offset + 4 + arg_count]
      .iter()
      .map(|&arg| arg as usize )
      .collect();
    let times = self.tape[offset + 4 + arg_count..offset + 4 + 2 * arg_count].to_vec();
    Some((Record { op, variant, id, args, times }, 4 + 2 * arg_count))
  }

  /// Register an imported function under its local name. The
  /// definition itself stays in the [Dictionary] under `key`.

  pub fn add_import(&mut self, name: &str, key: u64, recurrent: bool) -> Result<()> {
    if self.import_index.contains_key(name) {
      return Err(Error::schema("", format!("Function '{name}' imported multiple times")));
    }
    self.unique(name)?;
    self.import_index.insert(name.into(), self.import_defs.len());
    self.import_defs.push(ImportSlot { key, recurrent });
    Ok(())
  }

  pub fn add_variable(&mut self, name: &str) -> Result<()> {
    self.variables.push(self.names.len());
    self.add_record(OpCode::Variable, -1, name, &[], &[])
      .inspect_err(|_| { self.variables.pop(); } )
  }

  pub fn add_constant(&mut self, name: &str) -> Result<()> {
    self.constants.push(self.names.len());
    self.add_record(OpCode::Constant, -1, name, &[], &[])
      .inspect_err(|_| { self.constants.pop(); } )
  }

  /// Append an expression applying `function` to the named arguments,
  /// each taken at its (zero or negative) time offset. The function is
  /// either one of the built-in operators `+`, `-`, `*`, `**`, `T`,
  /// `E`, or a registered import.

  pub fn add_expression(&mut self, name: &str, function: &str, args: &[&str], times: &[i32]) -> Result<()> {
    // check imports first, then all default functions
    if let Some(slot) = self.import_index.get(function).copied() {
      self.add_record(OpCode::Function, slot as i32, name, args, times)?;
      if self.import_defs[slot].recurrent {
        self.recurrent = true;
      }
      return Ok(());
    }
    let op = match function {
      "+" => OpCode::Add,
      "-" => OpCode::Sub,
      "*" => OpCode::Product,
      "**" => OpCode::Element,
      "T" => OpCode::Transpose,
      "E" => OpCode::Exponent,
      _ => return Err(Error::schema("", format!(
        "Undefined function '{function}' in expression '{name}'",
      ))),
    };
    self.add_record(op, -1, name, args, times)
  }

  fn add_record(&mut self, op: OpCode, variant: i32, name: &str, args: &[&str], times: &[i32]) -> Result<()> {
    if args.len() != times.len() {
      return Err(Error::schema("", format!(
        "Mismatched input and time arguments in expression '{name}'",
      )));
    }

    // resolve argument names before this record gets its own id,
    // so that forward and self references fail
    let mut ids = Vec::with_capacity(args.len());
    for symbol in args {
      match self.index.get(*symbol) {
        Some(&id) => ids.push(id),
        None => return Err(Error::schema("", format!(
          "Undefined symbol '{symbol}' referenced as argument in expression '{name}'",
        ))),
      }
    }

    self.unique(name)?;
    let id = self.names.len();

    // TYPE, VARIANT, ID, ARG_COUNT
    self.tape.push(op as i32);
    self.tape.push(variant);
    self.tape.push(id as i32);
    self.tape.push(ids.len() as i32);

    // [ARG_1,...,ARG_N]
    for arg in ids {
      self.tape.push(arg as i32);
    }

    // [TIME_1,...,TIME_N]
    for &time in times {
      self.tape.push(time);
      if time < 0 {
        self.recurrent = true;
      }
    }

    self.index.insert(name.into(), id);
    self.names.push(name.into());
    Ok(())
  }

  fn unique(&self, name: &str) -> Result<()> {
    if self.index.contains_key(name) || self.import_index.contains_key(name) {
      return Err(Error::schema("", format!("Symbol '{name}' multiply defined")));
    }
    Ok(())
  }
}


/// Iterator over a [Definition]'s tape records.

pub struct Records<'a> {
  definition: &'a Definition,
  offset: usize,
}

impl Iterator for Records<'_> {
  type Item = Record;

  fn next(&mut self) -> Option<Self::Item> {
    let (record, consumed) = self.definition.get_record(self.offset)?;
    self.offset += consumed;
    Some(record)
  }
}


/// Process-level registry of compiled definitions, keyed by the hash of
/// `user ":" library ":" function`. The dictionary owns every
/// definition put into it; definitions reference each other only
/// through these keys.

#[derive(Debug, Default)]
pub struct Dictionary {
  index: HashMap<u64, Definition>,
}

impl Dictionary {
  pub fn new() -> Self {
    Self::default()
  }

  /// Key matching user:library:function.

  pub fn id(user: &str, library: &str, function: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    format!("{user}:{library}:{function}").hash(&mut hasher);
    hasher.finish()
  }

  /// Add a definition under the given key, replacing any previous one.

  pub fn put(&mut self, id: u64, definition: Definition) {
    self.index.insert(id, definition);
  }

  pub fn get(&self, id: u64) -> Option<&Definition> {
    self.index.get(&id)
  }

  pub fn len(&self) -> usize {
    self.index.len()
  }

  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }

  pub fn clear(&mut self) {
    self.index.clear();
  }
}
