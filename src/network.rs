use std::collections::HashMap;

use tracing::debug;

use crate::{
  backend::Backend,
  compiler::{ Compiler, Resolver },
  definition::{ Definition, Dictionary },
  error::{ Error, Result },
  function::NodeId,
  matrix::Matrix,
  timeline::Timeline,
};


/// Facade over one compiled network: owns the dictionary of
/// definitions and the timeline of instantiated runtimes, and drives
/// forward and backward passes at a time cursor.
///
/// Non-recurrent networks always evaluate at time 0. For recurrent
/// networks, [step](Network::step) advances the cursor and
/// [forward](Network::forward) unrolls missing frames on demand;
/// [backward](Network::backward) seeds the cursor's frame and retreats
/// one step, so driving it repeatedly propagates through time back to
/// the start of the timeline.

pub struct Network<B: Backend> {
  dictionary: Dictionary,
  timeline: Timeline<B>,
  definition: Option<u64>,
  time: isize,
}

impl<B: Backend> Network<B> {
  pub fn new() -> Self {
    Self {
      dictionary: Dictionary::new(),
      timeline: Timeline::new(),
      definition: None,
      time: -1,
    }
  }

  /// Drop all compiled definitions and instantiated runtimes.

  pub fn clear(&mut self) {
    self.timeline.clear();
    self.dictionary.clear();
    self.definition = None;
    self.time = -1;
  }

  /// Compile a network definition and instantiate its time-0 runtime.

  pub fn load(&mut self, json: &str, resolver: &mut dyn Resolver) -> Result<()> {
    self.clear();

    let key = Compiler::new("", "", "").compile(json, &mut self.dictionary, resolver)?;
    let def = self.dictionary.get(key)
      .ok_or_else(|| Error::state("Undefined Network. No definition available."))?;
    self.timeline.add_runtime(0, &self.dictionary, def, &[])?;

    debug!(network = def.name(), recurrent = def.recurrent(), "loaded network");
    self.definition = Some(key);
    self.time = 0;
    Ok(())
  }

  /// The compiled root definition.

  pub fn definition(&self) -> Result<&Definition> {
    self.definition
      .and_then(|key| self.dictionary.get(key) )
      .ok_or_else(|| Error::state("Undefined Network. No definition available."))
  }

  pub fn dictionary(&self) -> &Dictionary {
    &self.dictionary
  }

  pub fn timeline(&self) -> &Timeline<B> {
    &self.timeline
  }

  /// Current time cursor.

  pub fn time(&self) -> isize {
    self.time
  }

  /// Constant nodes of the current frame's root runtime, in
  /// declaration order. Constants alias across frames, so these are
  /// the same nodes at every time step.

  pub fn input(&self) -> Result<&[NodeId]> {
    let time = self.time.max(0) as usize;
    if self.definition.is_none() || self.timeline.time_size() <= time {
      return Err(Error::state("Undefined Network. No input available."));
    }
    Ok(self.timeline.runtime(time, 0).map(|rt| rt.constants() ).unwrap_or(&[]))
  }

  /// All trainable variables of the network, keyed by dotted path.

  pub fn variables(&self) -> Result<HashMap<String, NodeId>> {
    let def = self.definition()?;
    self.timeline.variables(0, 0, &self.dictionary, def)
  }

  /// Replace a leaf node's value, returning the previous one.

  pub fn set(&mut self, id: NodeId, value: Matrix<B>) -> Result<Option<Matrix<B>>> {
    self.timeline.nodes_mut().set(id, value)
  }

  pub fn value(&self, id: NodeId) -> Option<&Matrix<B>> {
    self.timeline.nodes().value(id)
  }

  pub fn derivative(&self, id: NodeId) -> Option<&Matrix<B>> {
    self.timeline.nodes().derivative(id)
  }

  /// Evaluate the main node at the current time, unrolling any missing
  /// frames first.

  pub fn forward(&mut self) -> Result<&Matrix<B>> {
    let key = self.definition
      .ok_or_else(|| Error::state("Undefined Network. No definition available."))?;
    let def = self.dictionary.get(key)
      .ok_or_else(|| Error::state("Undefined Network. No definition available."))?;

    let time = self.time.max(0) as usize;
    if time >= self.timeline.time_size() {
      let constants = self.timeline.runtime(0, 0)
        .map(|rt| rt.constants().to_vec() )
        .unwrap_or_default();
      while self.timeline.time_size() <= time {
        let frame = self.timeline.time_size();
        self.timeline.add_runtime(frame, &self.dictionary, def, &constants)?;
      }
    }

    let main = self.main(time)?;
    self.timeline.nodes_mut().forward(main)
  }

  /// Advance the time cursor of a recurrent network.

  pub fn step(&mut self) -> Result<()> {
    if !self.definition()?.recurrent() {
      return Err(Error::state("Cannot step a non-recurrent network."));
    }
    self.time += 1;
    Ok(())
  }

  /// Seed the main node at the current time with `d`. For recurrent
  /// networks the cursor retreats one step afterwards, so repeated
  /// calls walk the gradient back through the unrolled frames.

  pub fn backward(&mut self, d: &Matrix<B>) -> Result<()> {
    let recurrent = self.definition()?.recurrent();
    if recurrent && self.time < 0 {
      return Err(Error::state("Backward called at negative time."));
    }
    let time = if recurrent { self.time as usize } else { 0 };
    let main = self.main(time)?;
    self.timeline.nodes_mut().backward(main, d)?;
    if recurrent {
      self.time -= 1;
    }
    Ok(())
  }

  /// Invalidate every cached value and rewind the time cursor.

  pub fn refresh(&mut self) {
    self.timeline.refresh();
    if self.definition.is_some() {
      self.time = 0;
    }
  }

  fn main(&self, time: usize) -> Result<NodeId> {
    self.timeline.runtime(time, 0)
      .and_then(|rt| rt.main() )
      .ok_or_else(|| Error::state(format!("No runtime instantiated at time {time}.")))
  }
}

impl<B: Backend> Default for Network<B> {
  fn default() -> Self {
    Self::new()
  }
}


#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use super::*;
  use crate::backend::Context;
  use crate::cpu::CpuBackend;

  type Cpu = CpuBackend<f32>;

  const FOO: &str = r#"{
    "network" : {
      "name" : "foo",
      "variables" : ["x", "y", "z"],
      "constants" : ["a", "b"],
      "imports" : {
        "bar" : { "user" : "joe19", "library" : "default" }
      },
      "body" : {
        "e1" : ["*", "a", "x"],
        "e2" : ["**", "b", "y"],
        "e3" : ["bar", "z"],
        "e4" : ["*", { "e2" : -1 }, "e3"],
        "return" : ["+", "e1", "e2", "e3", "e4"]
      }
    }
  }"#;

  const BAR: &str = r#"{
    "network" : {
      "name" : "bar",
      "variables" : ["x", "y"],
      "constants" : ["a"],
      "body" : {
        "e1" : ["*", "x", "a"],
        "return" : ["+", "e1", "y"]
      }
    }
  }"#;

  const PRODUCT: &str = r#"{
    "network" : {
      "name" : "product",
      "variables" : ["w"],
      "constants" : ["x"],
      "body" : {
        "return" : ["*", "w", "x"]
      }
    }
  }"#;

  const ACCUMULATOR: &str = r#"{
    "network" : {
      "name" : "accumulator",
      "variables" : ["w"],
      "constants" : ["x"],
      "body" : {
        "e1" : ["*", "w", "x"],
        "return" : ["+", "e1", { "e1" : -1 }]
      }
    }
  }"#;

  struct Bar;

  impl Resolver for Bar {
    fn resolve(&mut self, _user: &str, _library: &str, _function: &str) -> Result<String> {
      Ok(BAR.into())
    }
  }

  fn ctx() -> Rc<Context<Cpu>> {
    Context::shared(CpuBackend::new())
  }

  #[test]
  fn load() {
    let mut net = Network::<Cpu>::new();
    net.load(FOO, &mut Bar).unwrap();
    assert_eq!(net.definition().unwrap().name(), "foo");
    assert!(net.definition().unwrap().recurrent());
    assert_eq!(net.time(), 0);
    assert_eq!(net.input().unwrap().len(), 2);
  }

  #[test]
  fn unloaded_network() {
    let net = Network::<Cpu>::new();
    assert!(net.definition().is_err());
    assert!(net.input().is_err());
    assert!(net.variables().is_err());
  }

  #[test]
  fn load_after_failure_starts_clean() {
    let mut net = Network::<Cpu>::new();
    assert!(net.load(r#"{ "network" : { "name" : "foo" } }"#, &mut Bar).is_err());
    assert!(net.definition().is_err());
    net.load(PRODUCT, &mut Bar).unwrap();
    assert_eq!(net.definition().unwrap().name(), "product");
  }

  #[test]
  fn variables() {
    let mut net = Network::<Cpu>::new();
    net.load(FOO, &mut Bar).unwrap();

    let vars = net.variables().unwrap();
    assert_eq!(vars.len(), 5);
    assert!(vars.contains_key("x"));
    assert!(vars.contains_key("y"));
    assert!(vars.contains_key("z"));
    assert!(vars.contains_key("e3.x"));
    assert!(vars.contains_key("e3.y"));
  }

  #[test]
  fn forward() {
    let ctx = ctx();
    let mut net = Network::new();
    net.load(PRODUCT, &mut Bar).unwrap();

    let vars = net.variables().unwrap();
    net.set(vars["w"], Matrix::from_data(&ctx, 2, 3, &[1., 2., 3., 4., 5., 6.])).unwrap();
    let input = net.input().unwrap().to_vec();
    net.set(input[0], Matrix::from_data(&ctx, 3, 2, &[2., 3., 4., 5., 6., 7.])).unwrap();

    assert_eq!(net.forward().unwrap().to_vec(), vec![28., 34., 64., 79.]);
  }

  #[test]
  fn backward() {
    let ctx = ctx();
    let mut net = Network::new();
    net.load(PRODUCT, &mut Bar).unwrap();

    let vars = net.variables().unwrap();
    let w = vars["w"];
    net.set(w, Matrix::from_data(&ctx, 1, 1, &[2.])).unwrap();
    let input = net.input().unwrap().to_vec();
    net.set(input[0], Matrix::from_data(&ctx, 1, 1, &[3.])).unwrap();
    net.forward().unwrap();

    net.backward(&Matrix::from_data(&ctx, 1, 1, &[1.])).unwrap();
    assert_eq!(net.derivative(w).unwrap().to_vec(), vec![3.]);

    // a non-recurrent network keeps its cursor at time 0
    assert_eq!(net.time(), 0);
    net.backward(&Matrix::from_data(&ctx, 1, 1, &[1.])).unwrap();
    assert_eq!(net.derivative(w).unwrap().to_vec(), vec![6.]);
  }

  #[test]
  fn step_requires_recurrence() {
    let mut net = Network::<Cpu>::new();
    net.load(PRODUCT, &mut Bar).unwrap();
    assert!(net.step().is_err());
  }

  #[test]
  fn recurrent_unroll() {
    let ctx = ctx();
    let mut net = Network::new();
    net.load(ACCUMULATOR, &mut Bar).unwrap();

    let vars = net.variables().unwrap();
    let w = vars["w"];
    net.set(w, Matrix::from_data(&ctx, 1, 1, &[2.])).unwrap();
    let input = net.input().unwrap().to_vec();
    net.set(input[0], Matrix::from_data(&ctx, 1, 1, &[3.])).unwrap();

    // the past is zero at the start of the timeline
    assert_eq!(net.forward().unwrap().to_vec(), vec![6.]);

    net.step().unwrap();
    assert_eq!(net.forward().unwrap().to_vec(), vec![12.]);
    assert_eq!(net.timeline().time_size(), 2);

    // constants alias across frames
    assert_eq!(net.input().unwrap().to_vec(), input);

    // gradients propagate through time into the shared weight
    let seed = Matrix::from_data(&ctx, 1, 1, &[1.]);
    net.backward(&seed).unwrap();
    assert_eq!(net.derivative(w).unwrap().to_vec(), vec![6.]);
    net.backward(&seed).unwrap();
    assert_eq!(net.derivative(w).unwrap().to_vec(), vec![9.]);
    assert!(net.backward(&seed).is_err());
  }

  #[test]
  fn refresh_rewinds() {
    let ctx = ctx();
    let mut net = Network::new();
    net.load(ACCUMULATOR, &mut Bar).unwrap();

    let vars = net.variables().unwrap();
    net.set(vars["w"], Matrix::from_data(&ctx, 1, 1, &[2.])).unwrap();
    let input = net.input().unwrap().to_vec();
    net.set(input[0], Matrix::from_data(&ctx, 1, 1, &[3.])).unwrap();

    net.forward().unwrap();
    net.step().unwrap();
    net.forward().unwrap();
    assert_eq!(net.time(), 1);

    net.refresh();
    assert_eq!(net.time(), 0);

    // a new input flows through the invalidated caches
    net.set(input[0], Matrix::from_data(&ctx, 1, 1, &[5.])).unwrap();
    assert_eq!(net.forward().unwrap().to_vec(), vec![10.]);
  }
}
