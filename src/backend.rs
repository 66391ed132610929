use std::cell::RefCell;
use std::collections::{ HashMap, VecDeque };
use std::rc::Rc;

use crate::{
  error::Result,
  scalar::Real,
};


/// Contract of a dense matrix compute backend.
///
/// A backend allocates shaped buffers and implements the element-wise
/// and linear-algebra kernels the expression nodes are built from.
/// Shape preconditions are the backend's responsibility: kernels return
/// a [Shape](crate::Error::Shape) error when they do not hold.

pub trait Backend {
  type Elem: Real;
  type Buffer;

  /// Allocate a fresh `rows` by `cols` buffer.
  fn create(&self, rows: usize, cols: usize) -> Self::Buffer;

  fn rows(&self, a: &Self::Buffer) -> usize;
  fn cols(&self, a: &Self::Buffer) -> usize;

  /// Set every element to `v`.
  fn fill(&self, r: &mut Self::Buffer, v: Self::Elem);

  /// Overwrite the buffer with row-major `data`.
  fn write(&self, r: &mut Self::Buffer, data: &[Self::Elem]);

  /// Read the buffer into `out` in row-major order.
  fn read(&self, a: &Self::Buffer, out: &mut Vec<Self::Elem>);

  /// Duplicate `a` into `r`.
  fn copy(&self, a: &Self::Buffer, r: &mut Self::Buffer);

  /// r = a + b, shapes equal.
  fn add(&self, a: &Self::Buffer, b: &Self::Buffer, r: &mut Self::Buffer) -> Result<()>;

  /// r = a - b, shapes equal.
  fn sub(&self, a: &Self::Buffer, b: &Self::Buffer, r: &mut Self::Buffer) -> Result<()>;

  /// r = a · b, a.cols == b.rows.
  fn prod(&self, a: &Self::Buffer, b: &Self::Buffer, r: &mut Self::Buffer) -> Result<()>;

  /// r = a * s.
  fn scale(&self, a: &Self::Buffer, s: Self::Elem, r: &mut Self::Buffer) -> Result<()>;

  /// r = a ⊙ b, shapes equal.
  fn mul(&self, a: &Self::Buffer, b: &Self::Buffer, r: &mut Self::Buffer) -> Result<()>;

  /// r = exp(a), element-wise.
  fn exp(&self, a: &Self::Buffer, r: &mut Self::Buffer) -> Result<()>;

  /// r = aᵀ.
  fn transpose(&self, a: &Self::Buffer, r: &mut Self::Buffer) -> Result<()>;

  /// Σ a.
  fn sum(&self, a: &Self::Buffer) -> Self::Elem;
}


pub type ErrorHandler = Box<dyn Fn(&str)>;


/// Owns a backend instance together with a shape-keyed buffer pool and
/// the error sink for kernel precondition failures.
///
/// Every operator allocates a result matrix, so released buffers are
/// kept in per-shape FIFO queues and handed back out by
/// [get_matrix](Context::get_matrix) instead of reallocating.

pub struct Context<B: Backend> {
  backend: B,
  cache: RefCell<HashMap<u64, VecDeque<B::Buffer>>>,
  handler: RefCell<Option<ErrorHandler>>,
}

impl<B: Backend> Context<B> {
  pub fn new(backend: B) -> Self {
    Self {
      backend,
      cache: RefCell::new(HashMap::new()),
      handler: RefCell::new(None),
    }
  }

  /// Create a context ready to be shared between matrices.

  pub fn shared(backend: B) -> Rc<Self> {
    Rc::new(Self::new(backend))
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  /// Get a pooled buffer of the given shape, or create one. The
  /// contents of a pooled buffer are whatever its last user left in it.

  pub fn get_matrix(&self, rows: usize, cols: usize) -> B::Buffer {
    let mut cache = self.cache.borrow_mut();
    match cache.get_mut(&shape_key(rows, cols)).and_then(|queue| queue.pop_front() ) {
      Some(buffer) => buffer,
      None => self.backend.create(rows, cols),
    }
  }

  /// Return a buffer to the pool.

  pub fn put_matrix(&self, buffer: B::Buffer) {
    let key = shape_key(self.backend.rows(&buffer), self.backend.cols(&buffer));
    self.cache.borrow_mut()
      .entry(key)
      .or_default()
      .push_back(buffer);
  }

  /// Number of pooled buffers across all shapes.

  pub fn matrix_count(&self) -> usize {
    self.cache.borrow().values().map(|queue| queue.len() ).sum()
  }

  /// Number of pooled buffers of one shape.

  pub fn matrix_count_of(&self, rows: usize, cols: usize) -> usize {
    self.cache.borrow()
      .get(&shape_key(rows, cols))
      .map_or(0, |queue| queue.len() )
  }

  /// Install a callback for kernel precondition failures. Without one,
  /// [on_error](Context::on_error) panics with the diagnostic.

  pub fn set_error_handler(&self, handler: impl Fn(&str) + 'static) {
    *self.handler.borrow_mut() = Some(Box::new(handler));
  }

  pub fn on_error(&self, message: &str) {
    match self.handler.borrow().as_ref() {
      Some(handler) => handler(message),
      None => panic!("{message}"),
    }
  }

  /// Route a kernel failure through the error sink.

  pub(crate) fn check(&self, result: Result<()>) {
    if let Err(error) = result {
      self.on_error(&error.to_string());
    }
  }
}


// hash of a 2D matrix shape
fn shape_key(rows: usize, cols: usize) -> u64 {
  ((rows as u64) << 32) | cols as u64
}


#[cfg(test)]
mod tests {
  use std::cell::Cell;

  use super::*;
  use crate::cpu::CpuBackend;

  #[test]
  fn pool_counts() {
    let ctx = Context::new(CpuBackend::<f32>::new());
    let m1 = ctx.get_matrix(2, 3);
    let m2 = ctx.get_matrix(2, 3);
    let m3 = ctx.get_matrix(3, 2);
    ctx.put_matrix(m1);
    ctx.put_matrix(m2);
    ctx.put_matrix(m3);

    assert_eq!(ctx.matrix_count(), 3);
    assert_eq!(ctx.matrix_count_of(2, 3), 2);
    assert_eq!(ctx.matrix_count_of(3, 2), 1);

    let _m = ctx.get_matrix(2, 3);
    assert_eq!(ctx.matrix_count_of(2, 3), 1);
  }

  #[test]
  fn pool_is_fifo() {
    let ctx = Context::new(CpuBackend::<f32>::new());
    let mut first = ctx.get_matrix(1, 2);
    ctx.backend().fill(&mut first, 1.0);
    let mut second = ctx.get_matrix(1, 2);
    ctx.backend().fill(&mut second, 2.0);
    ctx.put_matrix(first);
    ctx.put_matrix(second);

    let mut out = vec![];
    ctx.backend().read(&ctx.get_matrix(1, 2), &mut out);
    assert_eq!(out, vec![1.0, 1.0]);
  }

  #[test]
  fn error_handler() {
    let ctx = Context::new(CpuBackend::<f32>::new());
    let seen = Rc::new(Cell::new(false));
    let flag = seen.clone();
    ctx.set_error_handler(move |_msg| flag.set(true) );
    ctx.on_error("dimension mismatch in matrix addition");
    assert!(seen.get());
  }

  #[test]
  #[should_panic(expected = "dimension mismatch")]
  fn error_panics_without_handler() {
    let ctx = Context::new(CpuBackend::<f32>::new());
    ctx.on_error("dimension mismatch in matrix addition");
  }
}
