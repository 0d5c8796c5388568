//! Durable node state

pub mod sequence_number_map;

pub use sequence_number_map::{MapValue, SequenceNumberEntry, SequenceNumberMap, StorageError};
