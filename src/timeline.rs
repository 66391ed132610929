use std::collections::HashMap;

use itertools::Itertools;
use tracing::trace;

use crate::{
  backend::Backend,
  definition::{ Definition, Dictionary, OpCode, Record },
  error::{ Error, Result },
  function::{ Kind, NodeId, Nodes },
};


/// A concrete expression graph instance for one (definition, time)
/// pair: node ids parallel to the definition's symbol order, with the
/// variable and constant subsets broken out, plus the main node - the
/// last-added expression, by convention the `return` binding.

#[derive(Debug, Default)]
pub struct Runtime {
  expressions: Vec<NodeId>,
  variables: Vec<NodeId>,
  constants: Vec<NodeId>,
  main: Option<NodeId>,
}

impl Runtime {
  pub fn expressions(&self) -> &[NodeId] {
    &self.expressions
  }

  pub fn variables(&self) -> &[NodeId] {
    &self.variables
  }

  pub fn constants(&self) -> &[NodeId] {
    &self.constants
  }

  pub fn main(&self) -> Option<NodeId> {
    self.main
  }

  fn add_expression(&mut self, id: NodeId) {
    self.expressions.push(id);
    self.main = Some(id);
  }

  fn add_variable(&mut self, id: NodeId) {
    self.expressions.push(id);
    self.variables.push(id);
  }

  fn add_constant(&mut self, id: NodeId) {
    self.expressions.push(id);
    self.constants.push(id);
  }
}


/// The unrolled time axis of a network: frame `t` holds the runtimes
/// instantiated for time step `t`, and the timeline's node arena owns
/// every expression node of every frame.
///
/// Weights are shared across time: a Variable instantiated at `t > 0`
/// is the frame-0 node at the same position, so backward passes at any
/// time accumulate into the same derivative buffer.

#[derive(Debug, Default)]
pub struct Timeline<B: Backend> {
  nodes: Nodes<B>,
  frames: Vec<Vec<Runtime>>,
}

impl<B: Backend> Timeline<B> {
  pub fn new() -> Self {
    Self {
      nodes: Nodes::new(),
      frames: vec![],
    }
  }

  /// Timeline size in time.

  pub fn time_size(&self) -> usize {
    self.frames.len()
  }

  /// Number of runtimes in the first frame.

  pub fn space_size(&self) -> usize {
    self.frames.first().map_or(0, |frame| frame.len() )
  }

  pub fn runtime(&self, time: usize, space: usize) -> Option<&Runtime> {
    self.frames.get(time).and_then(|frame| frame.get(space) )
  }

  pub fn nodes(&self) -> &Nodes<B> {
    &self.nodes
  }

  pub fn nodes_mut(&mut self) -> &mut Nodes<B> {
    &mut self.nodes
  }

  /// Invalidate every cached value on the timeline.

  pub fn refresh(&mut self) {
    self.nodes.refresh_all();
  }

  pub fn clear(&mut self) {
    self.nodes = Nodes::new();
    self.frames.clear();
  }

  /// Instantiate `def` into the given time frame and return the new
  /// runtime's index within it. Walks the tape in record order:
  /// imported functions recurse with their resolved inputs as
  /// constants, variables at `time > 0` reuse the frame-0 nodes, and
  /// arguments with a time offset resolve into earlier frames - or
  /// into a [ZeroFeed](Kind::ZeroFeed) when the offset reaches before
  /// the start of the timeline.

  pub fn add_runtime(&mut self, time: usize, dict: &Dictionary, def: &Definition, constants: &[NodeId]) -> Result<usize> {
    while self.frames.len() <= time {
      self.frames.push(vec![]);
    }
    let rt_index = self.frames[time].len();
    self.frames[time].push(Runtime::default());
    trace!(function = def.name(), time, space = rt_index, "instantiating runtime");

    let mut constants_index = 0;
    for record in def.records() {
      // resolve this record's inputs
      let mut finput = Vec::with_capacity(record.args.len());
      for (&arg, &t_off) in record.args.iter().zip(&record.times) {
        finput.push(self.resolve_input(time, rt_index, arg, t_off)?);
      }

      match record.op {
        OpCode::Function => {
          let key = def.import_key(record.variant)?;
          let child_def = dict.get(key).ok_or_else(|| Error::state(format!(
            "Import '{}' is missing from the dictionary.", def.symbol(record.id),
          )))?;
          let child_index = self.add_runtime(time, dict, child_def, &finput)?;
          let main = self.frames[time][child_index].main.ok_or_else(|| Error::state(format!(
            "Imported function '{}' has no expressions.", child_def.name(),
          )))?;
          let id = self.nodes.push(Kind::Call { main, space: child_index });
          self.frames[time][rt_index].add_expression(id);
        },
        OpCode::Variable => {
          // take the weight from the start of the timeline, or create one
          let id = if time > 0 {
            self.frames[0][rt_index].expressions[record.id]
          } else {
            self.nodes.push(Kind::Variable)
          };
          self.frames[time][rt_index].add_variable(id);
        },
        OpCode::Constant => {
          // take the input from the arguments, or create one
          let id = if constants_index < constants.len() {
            constants_index += 1;
            constants[constants_index - 1]
          } else {
            self.nodes.push(Kind::Constant)
          };
          self.frames[time][rt_index].add_constant(id);
        },
        OpCode::Add => {
          let id = self.nodes.push(Kind::Add(input(&finput, 0, def, &record)?, input(&finput, 1, def, &record)?));
          self.frames[time][rt_index].add_expression(id);
        },
        OpCode::Sub => {
          let id = self.nodes.push(Kind::Sub(input(&finput, 0, def, &record)?, input(&finput, 1, def, &record)?));
          self.frames[time][rt_index].add_expression(id);
        },
        OpCode::Product => {
          let id = self.nodes.push(Kind::MatMul(input(&finput, 0, def, &record)?, input(&finput, 1, def, &record)?));
          self.frames[time][rt_index].add_expression(id);
        },
        OpCode::Element => {
          let id = self.nodes.push(Kind::Hadamard(input(&finput, 0, def, &record)?, input(&finput, 1, def, &record)?));
          self.frames[time][rt_index].add_expression(id);
        },
        OpCode::Transpose => {
          let id = self.nodes.push(Kind::Transpose(input(&finput, 0, def, &record)?));
          self.frames[time][rt_index].add_expression(id);
        },
        OpCode::Exponent => {
          let id = self.nodes.push(Kind::Exp(input(&finput, 0, def, &record)?));
          self.frames[time][rt_index].add_expression(id);
        },
      }
    }

    Ok(rt_index)
  }

  fn resolve_input(&mut self, time: usize, rt_index: usize, arg: usize, t_off: i32) -> Result<NodeId> {
    if t_off == 0 {
      // current time
      Ok(self.frames[time][rt_index].expressions[arg])
    } else if time as i32 + t_off >= 0 {
      // available passed time
      let passed = (time as i32 + t_off) as usize;
      let passed_rt = self.frames.get(passed).and_then(|frame| frame.get(rt_index) )
        .ok_or_else(|| Error::state(format!("No runtime at time {passed}, space {rt_index}.")))?;
      Ok(passed_rt.expressions[arg])
    } else {
      // unavailable passed time
      let delegate = self.frames[time][rt_index].expressions[arg];
      Ok(self.nodes.push(Kind::ZeroFeed(delegate)))
    }
  }

  /// Map every trainable variable reachable from a runtime to its
  /// node, keyed by dotted path - `"w"` for the runtime's own
  /// variables, `"subfn.w"` through imported functions.

  pub fn variables(&self, time: usize, space: usize, dict: &Dictionary, def: &Definition) -> Result<HashMap<String, NodeId>> {
    let mut out = HashMap::new();
    let mut path = vec![];
    self.collect_variables(time, space, dict, def, &mut path, &mut out)?;
    Ok(out)
  }

  fn collect_variables(
    &self, time: usize, space: usize, dict: &Dictionary, def: &Definition,
    path: &mut Vec<String>, out: &mut HashMap<String, NodeId>,
  ) -> Result<()> {
    let rt = self.runtime(time, space)
      .ok_or_else(|| Error::state(format!("No runtime at time {time}, space {space}.")))?;

    for record in def.records() {
      match record.op {
        OpCode::Function => {
          path.push(def.symbol(record.id).into());
          if let Kind::Call { space: child, .. } = self.nodes.kind(rt.expressions[record.id]) {
            let key = def.import_key(record.variant)?;
            let child_def = dict.get(key).ok_or_else(|| Error::state(format!(
              "Import '{}' is missing from the dictionary.", def.symbol(record.id),
            )))?;
            self.collect_variables(time, child, dict, child_def, path, out)?;
          }
          path.pop();
        },
        OpCode::Variable => {
          path.push(def.symbol(record.id).into());
          out.insert(path.iter().join("."), rt.expressions[record.id]);
          path.pop();
        },
        _ => {},
      }
    }
    Ok(())
  }
}

fn input(finput: &[NodeId], index: usize, def: &Definition, record: &Record) -> Result<NodeId> {
  finput.get(index).copied().ok_or_else(|| Error::state(format!(
    "Expression '{}' is missing argument {index}.", def.symbol(record.id),
  )))
}


#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use super::*;
  use crate::backend::Context;
  use crate::cpu::CpuBackend;
  use crate::matrix::Matrix;

  type Cpu = CpuBackend<f32>;

  fn ctx() -> Rc<Context<Cpu>> {
    Context::shared(CpuBackend::new())
  }

  // return = (w · x)ᵀ
  fn product() -> Definition {
    let mut def = Definition::new();
    def.set_name("product");
    def.add_variable("w").unwrap();
    def.add_constant("x").unwrap();
    def.add_expression("e1", "*", &["w", "x"], &[0, 0]).unwrap();
    def.add_expression("return", "T", &["e1"], &[0]).unwrap();
    def
  }

  // return = e1 + e1[t-1] with e1 = w · x
  fn accumulator() -> Definition {
    let mut def = Definition::new();
    def.set_name("accumulator");
    def.add_variable("w").unwrap();
    def.add_constant("x").unwrap();
    def.add_expression("e1", "*", &["w", "x"], &[0, 0]).unwrap();
    def.add_expression("return", "+", &["e1", "e1"], &[0, -1]).unwrap();
    def
  }

  #[test]
  fn instantiate_and_forward() {
    let ctx = ctx();
    let dict = Dictionary::new();
    let def = product();
    let mut timeline = Timeline::new();
    timeline.add_runtime(0, &dict, &def, &[]).unwrap();

    assert_eq!(timeline.time_size(), 1);
    assert_eq!(timeline.space_size(), 1);
    let rt = timeline.runtime(0, 0).unwrap();
    assert_eq!(rt.expressions().len(), 4);
    assert_eq!(rt.variables().len(), 1);
    assert_eq!(rt.constants().len(), 1);
    let (w, x, main) = (rt.variables()[0], rt.constants()[0], rt.main().unwrap());

    timeline.nodes_mut().set(w, Matrix::from_data(&ctx, 2, 3, &[1., 2., 3., 4., 5., 6.])).unwrap();
    timeline.nodes_mut().set(x, Matrix::from_data(&ctx, 3, 2, &[2., 3., 4., 5., 6., 7.])).unwrap();
    let value = timeline.nodes_mut().forward(main).unwrap();
    assert_eq!(value.to_vec(), vec![28., 64., 34., 79.]);
  }

  #[test]
  fn missing_argument() {
    let mut def = Definition::new();
    def.set_name("broken");
    def.add_variable("w").unwrap();
    // the compiler does not check arity; instantiation does
    def.add_expression("return", "+", &["w"], &[0]).unwrap();

    let dict = Dictionary::new();
    let mut timeline = Timeline::<Cpu>::new();
    assert!(timeline.add_runtime(0, &dict, &def, &[]).is_err());
  }

  #[test]
  fn unreachable_past_becomes_zero_feed() {
    let ctx = ctx();
    let dict = Dictionary::new();
    let def = accumulator();
    let mut timeline = Timeline::new();
    timeline.add_runtime(0, &dict, &def, &[]).unwrap();

    let rt = timeline.runtime(0, 0).unwrap();
    let (w, x, main) = (rt.variables()[0], rt.constants()[0], rt.main().unwrap());
    timeline.nodes_mut().set(w, Matrix::from_data(&ctx, 1, 1, &[2.])).unwrap();
    timeline.nodes_mut().set(x, Matrix::from_data(&ctx, 1, 1, &[3.])).unwrap();

    // return(0) = e1 + 0
    assert_eq!(timeline.nodes_mut().forward(main).unwrap().to_vec(), vec![6.]);
  }

  #[test]
  fn unrolled_frames_share_weights_and_constants_stay_per_frame() {
    let dict = Dictionary::new();
    let def = accumulator();
    let mut timeline = Timeline::<Cpu>::new();
    timeline.add_runtime(0, &dict, &def, &[]).unwrap();
    timeline.add_runtime(1, &dict, &def, &[]).unwrap();

    let rt0 = timeline.runtime(0, 0).unwrap();
    let rt1 = timeline.runtime(1, 0).unwrap();
    assert_eq!(rt0.variables(), rt1.variables());
    assert_ne!(rt0.constants(), rt1.constants());
    assert_ne!(rt0.main(), rt1.main());
  }

  #[test]
  fn unroll_reaches_back_into_the_previous_frame() {
    let ctx = ctx();
    let dict = Dictionary::new();
    let def = accumulator();
    let mut timeline = Timeline::new();
    timeline.add_runtime(0, &dict, &def, &[]).unwrap();
    let constants = timeline.runtime(0, 0).unwrap().constants().to_vec();
    timeline.add_runtime(1, &dict, &def, &constants).unwrap();

    let rt0 = timeline.runtime(0, 0).unwrap();
    let (w, x) = (rt0.variables()[0], rt0.constants()[0]);
    let main0 = rt0.main().unwrap();
    let main1 = timeline.runtime(1, 0).unwrap().main().unwrap();

    timeline.nodes_mut().set(w, Matrix::from_data(&ctx, 1, 1, &[2.])).unwrap();
    timeline.nodes_mut().set(x, Matrix::from_data(&ctx, 1, 1, &[3.])).unwrap();

    // return(1) = e1(1) + e1(0), both frames fed by the same w and x
    assert_eq!(timeline.nodes_mut().forward(main0).unwrap().to_vec(), vec![6.]);
    assert_eq!(timeline.nodes_mut().forward(main1).unwrap().to_vec(), vec![12.]);

    // backward through time accumulates into the shared weight
    let seed = Matrix::from_data(&ctx, 1, 1, &[1.]);
    timeline.nodes_mut().backward(main1, &seed).unwrap();
    assert_eq!(timeline.nodes().derivative(w).unwrap().to_vec(), vec![6.]);
    timeline.nodes_mut().backward(main0, &seed).unwrap();
    assert_eq!(timeline.nodes().derivative(w).unwrap().to_vec(), vec![9.]);
  }

  #[test]
  fn imported_function_is_inlined() {
    let ctx = ctx();
    let mut dict = Dictionary::new();
    let key = Dictionary::id("joe19", "default", "product");
    dict.put(key, product());

    // return = sub(x) + w with sub the imported product network
    let mut def = Definition::new();
    def.set_name("outer");
    def.add_import("sub", key, false).unwrap();
    def.add_variable("w").unwrap();
    def.add_constant("x").unwrap();
    def.add_expression("e1", "sub", &["x"], &[0]).unwrap();
    def.add_expression("return", "+", &["e1", "w"], &[0, 0]).unwrap();

    let mut timeline = Timeline::new();
    timeline.add_runtime(0, &dict, &def, &[]).unwrap();

    // the child runtime occupies the same frame, after its parent
    assert_eq!(timeline.frames[0].len(), 2);
    let rt = timeline.runtime(0, 0).unwrap();
    let (x, main) = (rt.constants()[0], rt.main().unwrap());
    // the child's constant is the parent's x
    assert_eq!(timeline.runtime(0, 1).unwrap().constants(), &[x]);

    let vars = timeline.variables(0, 0, &dict, &def).unwrap();
    assert_eq!(vars.len(), 2);
    assert!(vars.contains_key("w"));
    assert!(vars.contains_key("e1.w"));

    // f = (w_sub · x)ᵀ + w
    timeline.nodes_mut().set(vars["e1.w"], Matrix::from_data(&ctx, 2, 2, &[1., 2., 3., 4.])).unwrap();
    timeline.nodes_mut().set(vars["w"], Matrix::from_data(&ctx, 2, 2, &[1., 1., 1., 1.])).unwrap();
    timeline.nodes_mut().set(x, Matrix::from_data(&ctx, 2, 2, &[1., 0., 0., 1.])).unwrap();

    let value = timeline.nodes_mut().forward(main).unwrap();
    assert_eq!(value.to_vec(), vec![2., 4., 3., 5.]);
  }

  #[test]
  fn refresh_recomputes() {
    let ctx = ctx();
    let dict = Dictionary::new();
    let def = product();
    let mut timeline = Timeline::new();
    timeline.add_runtime(0, &dict, &def, &[]).unwrap();

    let rt = timeline.runtime(0, 0).unwrap();
    let (w, x, main) = (rt.variables()[0], rt.constants()[0], rt.main().unwrap());
    timeline.nodes_mut().set(w, Matrix::from_data(&ctx, 1, 1, &[2.])).unwrap();
    timeline.nodes_mut().set(x, Matrix::from_data(&ctx, 1, 1, &[3.])).unwrap();
    assert_eq!(timeline.nodes_mut().forward(main).unwrap().to_vec(), vec![6.]);

    timeline.nodes_mut().set(x, Matrix::from_data(&ctx, 1, 1, &[5.])).unwrap();
    assert_eq!(timeline.nodes_mut().forward(main).unwrap().to_vec(), vec![6.]);
    timeline.refresh();
    assert_eq!(timeline.nodes_mut().forward(main).unwrap().to_vec(), vec![10.]);
  }
}
