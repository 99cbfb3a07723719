//! Shared utilities: the broker error type and logging setup.

pub mod error;
pub mod logging;
