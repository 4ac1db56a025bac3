//! truck-ratings: transactional rating aggregation for food trucks
//!
//! Raters write one rating per truck. A trigger fires on every write and
//! folds the new value into the truck's aggregate document inside an
//! optimistic transaction, so concurrent writes never lose an update.
//!
//! # Core Concepts
//!
//! - **Rating records**: one per (truck, rater), overwritten in place
//! - **Aggregates**: `avgRating` and `numRatings`, merged into the truck document
//! - **Trigger**: stateless fold of one write, retried on commit conflicts
//! - **Dispatcher**: at-least-once, concurrent delivery of writes to the trigger
//!
//! # Example
//!
//! ```no_run
//! use truck_ratings::prelude::*;
//!
//! # async fn example() -> truck_ratings::error::Result<()> {
//! let mut db = RatingsDB::in_memory().await?;
//!
//! db.submit_rating("taco-truck", "alice", 3.0).await?;
//! db.submit_rating("taco-truck", "bob", 1.0).await?;
//! db.close().await?;
//!
//! let state = db.aggregate(&EntityId::new("taco-truck")?).await?;
//! assert_eq!(state.num_ratings(), 2);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod storage;
pub mod trigger;

/// Main database type
pub mod db;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::core::*;
    pub use crate::db::RatingsDB;
    pub use crate::error::{Error, Result};
    pub use crate::storage::*;
    pub use crate::trigger::*;
}
