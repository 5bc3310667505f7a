//! accelmul harness: backend sessions, the evaluation suite and the CLI.

#[cfg(feature = "cli")]
pub mod cli;
pub mod eval;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use eval::*;
pub use session::*;
