//! Process-wide tracing setup.

pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat, init};
