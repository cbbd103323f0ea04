//! Composable computational-graph function kernels.
//!
//! A [`Function`] is a cheap-to-copy handle over one immutable graph node.
//! Nodes are built from a scalar symbolic algebra ([`ExprGraph`] /
//! [`SymVec`]), evaluated numerically, analyzed with bit-vector sparsity
//! propagation, differentiated in forward and reverse mode, and combined
//! into larger graphs with `map`, `mapaccum`, `conditional` and `slice`.
//!
//! ## A quick guide
//! - Create an [`ExprGraph`] and symbolic ports with [`SymVec::sym`].
//! - Combine them with the usual arithmetic; nothing is computed yet.
//! - Freeze the graph into a [`Function`] with [`Function::new`]. Ports,
//!   name and sparsity are validated once and never change afterwards.
//! - Evaluate with [`Function::call`] (or [`Function::call_named`], which
//!   fills absent inputs with port defaults).
//! - Differentiate with [`Function::forward`], [`Function::reverse`],
//!   [`Function::jacobian`] or the [`Function::factory`] naming protocol.
//! - For concurrent evaluation, give each thread its own scratch slot via
//!   [`Function::checkout`] and [`Function::call_in_slot`].
//!
//! ## What can you do with it?
//! ```
//! use graphfn_core::{ExprGraph, Function, Opts, Sparsity, SymVec};
//!
//! let g = ExprGraph::new();
//! let x = SymVec::sym(&g, "x", Sparsity::scalar());
//! let y = SymVec::sym(&g, "y", Sparsity::scalar());
//! let z = &(&x * &y) + &x.sin();
//! let f = Function::new("f", &[x, y], &[z], &Opts::new()).unwrap();
//!
//! let out = f.call(&[vec![2.0], vec![3.0]]).unwrap();
//! assert!((out[0][0] - (6.0 + 2.0_f64.sin())).abs() < 1e-12);
//!
//! let df = f.forward(1).unwrap();
//! let out = df.call(&[vec![2.0], vec![3.0], vec![1.0], vec![0.0]]).unwrap();
//! assert!((out[1][0] - (3.0 + 2.0_f64.cos())).abs() < 1e-12);
//! ```

mod codegen;
mod dispatch;
mod error;
mod expr;
mod function;
mod map;
mod mapaccum;
mod node;
mod pool;
mod primitive;
mod slice;
mod sparsity;
mod spline;
mod switch;

pub use codegen::CodeGenerator;
pub use error::{Error, Result};
pub use expr::{BinaryOp, Expr, ExprGraph, SymVec, UnaryOp};
pub use function::Function;
pub use map::MapStrategy;
pub use node::{NodeKind, OptVal, Opts, Port, WorkSizes};
pub use pool::{PoolMetrics, WorkPool};
pub use sparsity::Sparsity;
