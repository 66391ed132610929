//! Compile declarative, JSON-encoded network descriptions into compact
//! IR tapes and run them as differentiable expression graphs.
//! Tiny. Few dependencies. CPU reference backend included.
//!
//! # Features
//!
//! - **Declarative networks** — Functions are described in JSON: named
//! variables, constants and expressions over a small operator algebra,
//! with imports of other functions resolved through a pluggable
//! [Resolver].
//!
//! - **Compact IR** — Compilation produces a flat integer tape per
//! function, stored in a [Dictionary] and cheap to persist or inspect.
//!
//! - **Reverse-mode autodiff** — Runtime graphs evaluate forward with
//! memoization and distribute seed gradients backward; every path of
//! the graph contributes to a variable's derivative by summation.
//!
//! - **Recurrent unrolling** — Expressions may reference their own
//! past values. The [Timeline] unrolls frames per time step, shares
//! weights across time and feeds zeros where the past is out of range,
//! so backpropagation through time falls out of ordinary backward
//! passes.
//!
//! - **Pluggable backends** — Matrix storage and kernels live behind
//! the [Backend] trait; the shape-keyed buffer pool in [Context] keeps
//! operator temporaries cheap.
//!
//! # Example
//!
//! ```
//! use tapenet::{ Context, CpuBackend, Matrix, Network, Resolver, Result };
//!
//! struct NoImports;
//!
//! impl Resolver for NoImports {
//!   fn resolve(&mut self, _user: &str, _library: &str, _function: &str) -> Result<String> {
//!     unreachable!("this network has no imports")
//!   }
//! }
//!
//! fn main() -> Result<()> {
//!   let json = r#"{
//!     "network" : {
//!       "name" : "dot",
//!       "variables" : ["w"],
//!       "constants" : ["x"],
//!       "body" : { "return" : ["*", "w", "x"] }
//!     }
//!   }"#;
//!
//!   let ctx = Context::shared(CpuBackend::<f32>::new());
//!   let mut net = Network::new();
//!   net.load(json, &mut NoImports)?;
//!
//!   let vars = net.variables()?;
//!   net.set(vars["w"], Matrix::from_data(&ctx, 1, 2, &[2.0, 3.0]))?;
//!   let input = net.input()?.to_vec();
//!   net.set(input[0], Matrix::from_data(&ctx, 2, 1, &[4.0, 5.0]))?;
//!
//!   assert_eq!(net.forward()?.to_vec(), vec![23.0]);
//!
//!   net.backward(&Matrix::from_data(&ctx, 1, 1, &[1.0]))?;
//!   assert_eq!(net.derivative(vars["w"]).unwrap().to_vec(), vec![4.0, 5.0]);
//!   Ok(())
//! }
//! ```
//!
//! # Optional features
//!
//! Some features can be toggled in your `Cargo.toml`.
//!
//! - `unsafe` *(default)* — Accelerated matrix math using [matrixmultiply] crate.

mod backend;
mod compiler;
mod cpu;
mod definition;
mod error;
mod function;
mod matrix;
mod network;
mod timeline;

pub mod scalar;

pub use backend::{ Backend, Context, ErrorHandler };
pub use compiler::{ Compiler, Resolver };
pub use cpu::{ CpuBackend, CpuMatrix, Gemm };
pub use definition::{ Definition, Dictionary, OpCode, Record, Records };
pub use error::{ Error, Result };
pub use function::{ Kind, NodeId, Nodes };
pub use matrix::Matrix;
pub use network::Network;
pub use timeline::{ Runtime, Timeline };
