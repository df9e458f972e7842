//! Background services

pub mod records;

pub use records::{RecordEvent, RecordRegistry, RecordSink, RecordStats, RecordStore};
