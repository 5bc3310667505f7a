//! Shared problem descriptions, reference kernels and the backend
//! contract for accelmul.

pub mod backend;
pub mod config;
pub mod reference;
pub mod utils;

pub use backend::*;
pub use config::*;
pub use reference::*;
pub use utils::*;
