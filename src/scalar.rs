use num_traits::{ Num, NumAssignOps, NumCast };


/// All numeric types a backend may compute with.
///
/// This trait gets implemented automatically for all types
/// that satisfy its dependent traits.

pub trait Numeric:
  PartialEq + PartialOrd + Clone + Copy + Send + Sync + std::fmt::Debug +
  Num + NumCast + NumAssignOps + std::iter::Sum {}
impl<T:
  PartialEq + PartialOrd + Clone + Copy + Send + Sync + std::fmt::Debug +
  Num + NumCast + NumAssignOps + std::iter::Sum> Numeric for T {}


/// All continuous numeric types.
///
/// This trait gets implemented automatically for all types
/// that satisfy its dependent traits.

pub trait Real: Numeric + num_traits::real::Real {}
impl<T: Numeric + num_traits::real::Real> Real for T {}
