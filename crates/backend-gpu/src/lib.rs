//! GPU backend for accelmul, built on wgpu compute pipelines.

pub mod buffers;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod planner;
pub mod program;
pub mod runtime;
pub mod scope;

pub use wgpu;

pub use buffers::*;
pub use device::*;
pub use dispatch::*;
pub use error::*;
pub use planner::*;
pub use program::*;
pub use runtime::*;
pub use scope::*;
