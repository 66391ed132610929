use std::rc::Rc;

use num_traits::Zero;

use crate::backend::{ Backend, Context };


/// Value-semantic matrix over a pooled backend buffer.
///
/// Cloning copies the contents into a fresh buffer; dropping returns
/// the buffer to the context's pool. Arithmetic operators allocate
/// their result through the same pool, so temporary churn stays cheap.
///
/// A 1×1 operand of `*` or `&` broadcasts as a scalar factor; all
/// other shape rules are enforced by the backend kernels through the
/// context's error sink.

pub struct Matrix<B: Backend> {
  ctx: Rc<Context<B>>,
  buffer: Option<B::Buffer>,
}

impl<B: Backend> Matrix<B> {
  /// Take a buffer of the given shape from the pool. Its contents are
  /// unspecified until [fill](Matrix::fill) or [set](Matrix::set).

  pub fn new(ctx: &Rc<Context<B>>, rows: usize, cols: usize) -> Self {
    Self {
      ctx: ctx.clone(),
      buffer: Some(ctx.get_matrix(rows, cols)),
    }
  }

  pub fn zeros(ctx: &Rc<Context<B>>, rows: usize, cols: usize) -> Self {
    let mut m = Self::new(ctx, rows, cols);
    m.fill(B::Elem::zero());
    m
  }

  pub fn from_data(ctx: &Rc<Context<B>>, rows: usize, cols: usize, data: &[B::Elem]) -> Self {
    let mut m = Self::new(ctx, rows, cols);
    m.set(data);
    m
  }

  pub fn context(&self) -> &Rc<Context<B>> {
    &self.ctx
  }

  pub fn rows(&self) -> usize {
    self.ctx.backend().rows(self.buffer())
  }

  pub fn cols(&self) -> usize {
    self.ctx.backend().cols(self.buffer())
  }

  /// Set every element to `v`.

  pub fn fill(&mut self, v: B::Elem) {
    let ctx = self.ctx.clone();
    ctx.backend().fill(self.buffer_mut(), v);
  }

  /// Overwrite the contents with row-major `data`.

  pub fn set(&mut self, data: &[B::Elem]) {
    assert_eq!(self.rows() * self.cols(), data.len(),
      "{} values don't fill a {}x{} matrix", data.len(), self.rows(), self.cols());
    let ctx = self.ctx.clone();
    ctx.backend().write(self.buffer_mut(), data);
  }

  /// Read the contents in row-major order.

  pub fn to_vec(&self) -> Vec<B::Elem> {
    let mut out = vec![];
    self.ctx.backend().read(self.buffer(), &mut out);
    out
  }

  /// Transposed copy.

  pub fn t(&self) -> Self {
    let mut r = Self::new(&self.ctx, self.cols(), self.rows());
    let result = self.ctx.backend().transpose(self.buffer(), r.buffer_mut());
    self.ctx.check(result);
    r
  }

  /// Element-wise exponential.

  pub fn exp(&self) -> Self {
    let mut r = Self::new(&self.ctx, self.rows(), self.cols());
    let result = self.ctx.backend().exp(self.buffer(), r.buffer_mut());
    self.ctx.check(result);
    r
  }

  /// Sum of all elements.

  pub fn sum(&self) -> B::Elem {
    self.ctx.backend().sum(self.buffer())
  }

  fn buffer(&self) -> &B::Buffer {
    self.buffer.as_ref().expect("matrix buffer present until drop")
  }

  fn buffer_mut(&mut self) -> &mut B::Buffer {
    self.buffer.as_mut().expect("matrix buffer present until drop")
  }
}

impl<B: Backend> Clone for Matrix<B> {
  fn clone(&self) -> Self {
    let mut buffer = self.ctx.get_matrix(self.rows(), self.cols());
    self.ctx.backend().copy(self.buffer(), &mut buffer);
    Self { ctx: self.ctx.clone(), buffer: Some(buffer) }
  }
}

impl<B: Backend> Drop for Matrix<B> {
  fn drop(&mut self) {
    if let Some(buffer) = self.buffer.take() {
      self.ctx.put_matrix(buffer);
    }
  }
}

impl<B: Backend> PartialEq for Matrix<B> {
  fn eq(&self, rhs: &Self) -> bool {
    self.rows() == rhs.rows() &&
    self.cols() == rhs.cols() &&
    self.to_vec() == rhs.to_vec()
  }
}

impl<B: Backend> std::ops::Add for &Matrix<B> {
  type Output = Matrix<B>;

  fn add(self, rhs: Self) -> Matrix<B> {
    let mut r = Matrix::new(self.context(), self.rows(), self.cols());
    let result = self.ctx.backend().add(self.buffer(), rhs.buffer(), r.buffer_mut());
    self.ctx.check(result);
    r
  }
}

impl<B: Backend> std::ops::Sub for &Matrix<B> {
  type Output = Matrix<B>;

  fn sub(self, rhs: Self) -> Matrix<B> {
    let mut r = Matrix::new(self.context(), self.rows(), self.cols());
    let result = self.ctx.backend().sub(self.buffer(), rhs.buffer(), r.buffer_mut());
    self.ctx.check(result);
    r
  }
}

impl<B: Backend> std::ops::Mul for &Matrix<B> {
  type Output = Matrix<B>;

  fn mul(self, rhs: Self) -> Matrix<B> {
    if self.rows() == 1 && self.cols() == 1 {
      rhs * self.sum()
    } else if rhs.rows() == 1 && rhs.cols() == 1 {
      self * rhs.sum()
    } else {
      let mut r = Matrix::new(self.context(), self.rows(), rhs.cols());
      let result = self.ctx.backend().prod(self.buffer(), rhs.buffer(), r.buffer_mut());
      self.ctx.check(result);
      r
    }
  }
}

impl<B: Backend> std::ops::Mul<B::Elem> for &Matrix<B> {
  type Output = Matrix<B>;

  fn mul(self, s: B::Elem) -> Matrix<B> {
    let mut r = Matrix::new(self.context(), self.rows(), self.cols());
    let result = self.ctx.backend().scale(self.buffer(), s, r.buffer_mut());
    self.ctx.check(result);
    r
  }
}

impl<B: Backend> std::ops::BitAnd for &Matrix<B> {
  type Output = Matrix<B>;

  fn bitand(self, rhs: Self) -> Matrix<B> {
    if self.rows() == 1 && self.cols() == 1 {
      rhs * self.sum()
    } else if rhs.rows() == 1 && rhs.cols() == 1 {
      self * rhs.sum()
    } else {
      let mut r = Matrix::new(self.context(), self.rows(), self.cols());
      let result = self.ctx.backend().mul(self.buffer(), rhs.buffer(), r.buffer_mut());
      self.ctx.check(result);
      r
    }
  }
}

impl<B: Backend> std::fmt::Debug for Matrix<B> {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Matrix[{} x {}]", self.rows(), self.cols())
  }
}

impl<B: Backend> std::fmt::Display for Matrix<B> {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let cols = self.cols();
    write!(f, "[{} x {}]", self.rows(), cols)?;
    for (i, v) in self.to_vec().iter().enumerate() {
      write!(f, "{}{:?},", if i % cols == 0 { "\n" } else { " " }, v)?;
    }
    Ok(())
  }
}
