//! Storage layer: rating records, their write-ahead log, and aggregates

pub mod aggregates;
pub mod ratings;
pub mod wal;

pub use aggregates::*;
pub use ratings::*;
pub use wal::*;
