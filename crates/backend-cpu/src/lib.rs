//! CPU backend for accelmul: the drop-in alternative to the GPU path.

pub mod planner;
pub mod runtime;

pub use planner::*;
pub use runtime::*;
