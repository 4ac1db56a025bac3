//! Aggregation trigger, its transactional update protocol, and dispatch

pub mod aggregation;
pub mod dispatcher;
pub mod transaction;

pub use aggregation::*;
pub use dispatcher::*;
pub use transaction::*;
