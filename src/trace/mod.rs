//! Trace events: the schema, the global logger sink, and export formats.

pub mod event;
pub mod export;

pub use event::{Payload, Status, TraceEvent, TraceLogger, TransactionType};
