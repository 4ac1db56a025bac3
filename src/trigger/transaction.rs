//! Optimistic read-compute-commit against one aggregate document.
//!
//! The body runs against a snapshot and returns the fields to merge. The
//! commit is a compare-and-set on the snapshot's version; if another
//! transaction committed first, the whole sequence runs again on fresh state.
//! Concurrent transactions on one entity therefore serialize, and
//! transactions on different entities never touch each other.

use crate::core::rating::EntityId;
use crate::error::{Error, Result};
use crate::storage::aggregates::{AggregateStore, Snapshot, Version};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Conflict retry budget and backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2,
            max_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` conflicting attempts.
    ///
    /// Exponential with full jitter so contending writers spread out.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(self.max_backoff_ms);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

/// What the transaction body decided for one snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    /// Merge `fields` into the document and report `output`
    Write { fields: Map<String, Value>, output: T },
    /// Leave the document untouched
    Skip(T),
}

/// Result of a finished transaction
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub output: T,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Document version after the transaction
    pub version: Version,
    /// Whether anything was written
    pub wrote: bool,
}

/// Run `body` as an optimistic transaction on `entity_id`'s document.
///
/// `body` must be a pure function of the snapshot: it may run once per
/// attempt. Errors from `body` and non-conflict store errors abort at once.
/// After `retry.max_attempts` conflicts the result is
/// `Error::RetriesExhausted`.
pub async fn run_transaction<T, F>(
    store: &dyn AggregateStore,
    entity_id: &EntityId,
    retry: &RetryPolicy,
    mut body: F,
) -> Result<Committed<T>>
where
    F: FnMut(&Snapshot) -> Result<Mutation<T>>,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let snapshot = store.read(entity_id).await?;

        let (fields, output) = match body(&snapshot)? {
            Mutation::Skip(output) => {
                return Ok(Committed {
                    output,
                    attempts: attempt,
                    version: snapshot.version,
                    wrote: false,
                })
            }
            Mutation::Write { fields, output } => (fields, output),
        };

        match store.commit(entity_id, snapshot.version, fields).await {
            Ok(version) => {
                return Ok(Committed {
                    output,
                    attempts: attempt,
                    version,
                    wrote: true,
                })
            }
            Err(Error::Conflict(reason)) if attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                debug!(
                    entity = %entity_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "Aggregate changed underneath transaction, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(Error::Conflict(_)) => {
                return Err(Error::RetriesExhausted {
                    entity_id: entity_id.to_string(),
                    attempts: attempt,
                })
            }
            Err(e) => return Err(e),
        }
    }
}
