//! Convenience re-exports for error handling.

pub use crate::Result;
pub use crate::error::UpdateError;
pub use crate::kind::{ErrorKind, ExitCode};
