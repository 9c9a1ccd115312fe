//! Structured logging for store operations
//!
//! One log line = one event, JSON-encoded, written synchronously with
//! deterministic key ordering so output is diffable across runs.

mod logger;

pub use logger::{Logger, Severity};
