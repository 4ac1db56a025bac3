//! Core data types: identifiers, rating records, write events, aggregates

pub mod aggregate;
pub mod document;
pub mod event;
pub mod path;
pub mod rating;
pub mod temporal;

pub use aggregate::*;
pub use document::{decode_change, decode_change_str, decode_change_with, MissingWriteTime};
pub use event::*;
pub use path::*;
pub use rating::*;
pub use temporal::*;
