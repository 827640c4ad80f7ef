//! Weighted finite-state automata with reverse-mode differentiation.
//!
//! A [`Graph`] is built node by node and arc by arc, or with one of the
//! constructors in this crate. Operators built on top of it create their
//! output with [`Graph::derived`] and record how to differentiate it with
//! [`Graph::attach_backward`]; [`Graph::backward`] then pushes a gradient
//! back to every graph the output was computed from.

mod creations;
mod device;
pub mod error;
mod graph;
mod tape;

pub use creations::{linear_graph, scalar_graph};
pub use device::Device;
pub use error::{GraphError, IndexKind, Result};
pub use graph::{Graph, EPSILON};
pub use tape::{BackwardOptions, GradFn};
