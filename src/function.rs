use num_traits::One;

use crate::{
  backend::Backend,
  error::{ Error, Result },
  matrix::Matrix,
};


/// Index of a node in its [Nodes] arena.

pub type NodeId = usize;


/// Expression node variants. Operator nodes reference their inputs by
/// arena index, never by pointer, so cross-time edges cannot form
/// ownership cycles.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  /// Trainable leaf. Accumulates gradient contributions.
  Variable,
  /// Input leaf. Its gradient stays zero.
  Constant,
  Add(NodeId, NodeId),
  Sub(NodeId, NodeId),
  MatMul(NodeId, NodeId),
  Hadamard(NodeId, NodeId),
  Transpose(NodeId),
  Exp(NodeId),
  Sum(NodeId),
  /// Stands in for a reference to an unreachable past time: produces a
  /// zero matrix of the delegate's shape and ignores backward.
  ZeroFeed(NodeId),
  /// An inlined sub-network used as a function. Forward and backward
  /// delegate to the child runtime's main node; `space` is the child
  /// runtime's index within its frame.
  Call { main: NodeId, space: usize },
}

#[derive(Debug)]
struct Node<B: Backend> {
  kind: Kind,
  value: Option<Matrix<B>>,
  valid: bool,
  derivative: Option<Matrix<B>>,
}


/// Flat arena owning every expression node of a
/// [Timeline](crate::Timeline).
///
/// [forward](Nodes::forward) memoizes: a node is recomputed only when
/// its cache has been invalidated by [refresh](Nodes::refresh).
/// [backward](Nodes::backward) distributes a seed gradient towards the
/// leaves; every path through the graph contributes to a Variable's
/// derivative by summation.

#[derive(Debug)]
pub struct Nodes<B: Backend> {
  nodes: Vec<Node<B>>,
}

impl<B: Backend> Nodes<B> {
  pub fn new() -> Self {
    Self { nodes: vec![] }
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn push(&mut self, kind: Kind) -> NodeId {
    self.nodes.push(Node { kind, value: None, valid: false, derivative: None });
    self.nodes.len() - 1
  }

  pub fn kind(&self, id: NodeId) -> Kind {
    self.nodes[id].kind
  }

  /// Evaluate the node and return its value.

  pub fn forward(&mut self, id: NodeId) -> Result<&Matrix<B>> {
    self.eval(id)?;
    Ok(self.value_ref(id))
  }

  /// The node's current value, if it has been set or evaluated.

  pub fn value(&self, id: NodeId) -> Option<&Matrix<B>> {
    self.nodes[self.resolve(id)].value.as_ref()
  }

  /// The gradient accumulated into a leaf by [backward](Nodes::backward).

  pub fn derivative(&self, id: NodeId) -> Option<&Matrix<B>> {
    self.nodes[id].derivative.as_ref()
  }

  /// Replace a leaf's value, returning the previous one. Allows
  /// swapping weights without rebuilding the graph.

  pub fn set(&mut self, id: NodeId, value: Matrix<B>) -> Result<Option<Matrix<B>>> {
    match self.nodes[id].kind {
      Kind::Variable | Kind::Constant => {
        let node = &mut self.nodes[id];
        let previous = node.value.replace(value);
        node.valid = true;
        Ok(previous)
      },
      _ => Err(Error::state("Cannot set the value of a computed expression.")),
    }
  }

  /// Invalidate the node's cache and, transitively, the caches of
  /// everything it depends on.

  pub fn refresh(&mut self, id: NodeId) {
    self.nodes[id].valid = false;
    match self.nodes[id].kind {
      Kind::Variable | Kind::Constant | Kind::ZeroFeed(_) => {},
      Kind::Add(l, r) | Kind::Sub(l, r) | Kind::MatMul(l, r) | Kind::Hadamard(l, r) => {
        self.refresh(l);
        self.refresh(r);
      },
      Kind::Transpose(a) | Kind::Exp(a) | Kind::Sum(a) => self.refresh(a),
      Kind::Call { main, .. } => self.refresh(main),
    }
  }

  /// Invalidate every cache in the arena.

  pub fn refresh_all(&mut self) {
    for node in &mut self.nodes {
      node.valid = false;
    }
  }

  fn eval(&mut self, id: NodeId) -> Result<()> {
    if self.nodes[id].valid && self.nodes[id].value.is_some() {
      return Ok(());
    }
    match self.nodes[id].kind {
      Kind::Variable | Kind::Constant => {
        if self.nodes[id].value.is_none() {
          return Err(Error::state("Variable is not set."));
        }
        self.nodes[id].valid = true;
      },
      Kind::Add(l, r) => {
        self.eval(l)?;
        self.eval(r)?;
        let v = self.value_ref(l) + self.value_ref(r);
        self.store(id, v);
      },
      Kind::Sub(l, r) => {
        self.eval(l)?;
        self.eval(r)?;
        let v = self.value_ref(l) - self.value_ref(r);
        self.store(id, v);
      },
      Kind::MatMul(l, r) => {
        self.eval(l)?;
        self.eval(r)?;
        let v = self.value_ref(l) * self.value_ref(r);
        self.store(id, v);
      },
      Kind::Hadamard(l, r) => {
        self.eval(l)?;
        self.eval(r)?;
        let v = self.value_ref(l) & self.value_ref(r);
        self.store(id, v);
      },
      Kind::Transpose(a) => {
        self.eval(a)?;
        let v = self.value_ref(a).t();
        self.store(id, v);
      },
      Kind::Exp(a) => {
        self.eval(a)?;
        let v = self.value_ref(a).exp();
        self.store(id, v);
      },
      Kind::Sum(a) => {
        self.eval(a)?;
        let a = self.value_ref(a);
        let mut v = Matrix::new(a.context(), 1, 1);
        v.fill(a.sum());
        self.store(id, v);
      },
      Kind::ZeroFeed(delegate) => {
        // Allocated once from the delegate's shape; survives refresh
        if self.nodes[id].value.is_none() {
          self.eval(delegate)?;
          let delegate = self.value_ref(delegate);
          let v = Matrix::zeros(delegate.context(), delegate.rows(), delegate.cols());
          self.store(id, v);
        }
      },
      Kind::Call { main, .. } => self.eval(main)?,
    }
    Ok(())
  }

  /// Distribute the seed gradient `d` from this node towards the
  /// leaves, following each operator's local Jacobian.

  pub fn backward(&mut self, id: NodeId, d: &Matrix<B>) -> Result<()> {
    match self.nodes[id].kind {
      Kind::Variable => {
        let sum = match &self.nodes[id].derivative {
          Some(derivative) => derivative + d,
          None => {
            let zero = Matrix::zeros(d.context(), d.rows(), d.cols());
            &zero + d
          },
        };
        self.nodes[id].derivative = Some(sum);
      },
      Kind::Constant => {
        if self.nodes[id].derivative.is_none() {
          self.nodes[id].derivative =
            Some(Matrix::zeros(d.context(), d.rows(), d.cols()));
        }
      },
      Kind::Add(l, r) => {
        self.backward(l, d)?;
        self.backward(r, d)?;
      },
      Kind::Sub(l, r) => {
        let dr = d * -B::Elem::one();
        self.backward(l, d)?;
        self.backward(r, &dr)?;
      },
      Kind::MatMul(l, r) => {
        self.eval(l)?;
        self.eval(r)?;
        let dl = (self.value_ref(r) * d).t();
        let dr = (d * self.value_ref(l)).t();
        self.backward(l, &dl)?;
        self.backward(r, &dr)?;
      },
      Kind::Hadamard(l, r) => {
        self.eval(l)?;
        self.eval(r)?;
        let dl = self.value_ref(r) & d;
        let dr = d & self.value_ref(l);
        self.backward(l, &dl)?;
        self.backward(r, &dr)?;
      },
      Kind::Transpose(a) => {
        let da = d.t();
        self.backward(a, &da)?;
      },
      Kind::Exp(a) => {
        self.eval(id)?;
        let da = d & self.value_ref(id);
        self.backward(a, &da)?;
      },
      Kind::Sum(a) => {
        self.eval(a)?;
        let value = self.value_ref(a);
        let mut da = Matrix::new(value.context(), value.rows(), value.cols());
        da.fill(d.sum());
        self.backward(a, &da)?;
      },
      Kind::ZeroFeed(_) => {},
      Kind::Call { main, .. } => self.backward(main, d)?,
    }
    Ok(())
  }

  fn store(&mut self, id: NodeId, value: Matrix<B>) {
    let node = &mut self.nodes[id];
    node.value = Some(value);
    node.valid = true;
  }

  // Call nodes have no storage of their own
  fn resolve(&self, mut id: NodeId) -> NodeId {
    while let Kind::Call { main, .. } = self.nodes[id].kind {
      id = main;
    }
    id
  }

  fn value_ref(&self, id: NodeId) -> &Matrix<B> {
    self.nodes[self.resolve(id)].value.as_ref().expect("node has been evaluated")
  }
}

impl<B: Backend> Default for Nodes<B> {
  fn default() -> Self {
    Self::new()
  }
}
