//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod retry;

pub use errors::{EngineError, Result};
