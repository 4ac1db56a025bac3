//! The aggregation trigger: folds each rating write into its entity's aggregate

use crate::core::aggregate::{AggregateRecord, AggregateState, FoldPolicy, RatingChange};
use crate::core::event::{RatingWriteEvent, WriteKind};
use crate::error::Result;
use crate::storage::aggregates::AggregateStore;
use crate::trigger::transaction::{run_transaction, Mutation, RetryPolicy};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};

/// Per-rater write markers kept on the aggregate document when replays are
/// deduplicated: `{ "<raterId>": <writtenAt nanos> }`
pub const RATER_WRITES_FIELD: &str = "raterWrites";

/// What one trigger invocation did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerOutcome {
    /// The rating was folded in
    Applied {
        record: AggregateRecord,
        attempts: u32,
    },
    /// The write was already folded in by an earlier delivery
    Duplicate,
    /// Deletes do not change the aggregate
    IgnoredDelete,
}

/// Reacts to rating writes by updating the entity's aggregate.
///
/// Stateless between invocations: everything comes from the event and a
/// fresh read of the aggregate, so any number of invocations may run at once.
pub struct AggregationTrigger {
    store: Arc<dyn AggregateStore>,
    fold_policy: FoldPolicy,
    dedup_replays: bool,
    retry: RetryPolicy,
}

impl AggregationTrigger {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            fold_policy: FoldPolicy::default(),
            dedup_replays: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_fold_policy(mut self, fold_policy: FoldPolicy) -> Self {
        self.fold_policy = fold_policy;
        self
    }

    /// Remember the last folded write per rater and skip redeliveries of it
    pub fn with_dedup_replays(mut self, dedup_replays: bool) -> Self {
        self.dedup_replays = dedup_replays;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Fold one rating write into the aggregate.
    ///
    /// Not idempotent unless replay deduplication is on: handling the same
    /// event twice counts it twice.
    #[instrument(
        skip_all,
        fields(event_id = %event.id, entity = %event.entity_id(), rater = %event.rater_id())
    )]
    pub async fn handle(&self, event: &RatingWriteEvent) -> Result<TriggerOutcome> {
        if event.kind() == WriteKind::Delete {
            info!("Rating deleted, aggregate left unchanged");
            return Ok(TriggerOutcome::IgnoredDelete);
        }

        let change = self.change_for(event)?;
        let entity_id = event.entity_id();
        let rater = event.rater_id().as_str();
        let marker = if self.dedup_replays {
            event.written_at().map(|ts| ts.as_nanos())
        } else {
            None
        };

        let committed = run_transaction(self.store.as_ref(), entity_id, &self.retry, |snapshot| {
            if let Some(written_at) = marker {
                let last = snapshot
                    .fields
                    .get(RATER_WRITES_FIELD)
                    .and_then(|writes| writes.get(rater))
                    .and_then(Value::as_i64);
                if last.is_some_and(|last| written_at <= last) {
                    return Ok(Mutation::Skip(None));
                }
            }

            let record = AggregateState::from_fields(entity_id, &snapshot.fields)?.apply(change)?;
            let mut fields = record.to_fields();
            if let Some(written_at) = marker {
                let mut writes = Map::new();
                writes.insert(rater.to_string(), Value::from(written_at));
                fields.insert(RATER_WRITES_FIELD.to_string(), Value::Object(writes));
            }
            Ok(Mutation::Write {
                fields,
                output: Some(record),
            })
        })
        .await?;

        match committed.output {
            Some(record) => {
                info!(
                    avg_rating = record.avg_rating,
                    num_ratings = record.num_ratings,
                    attempts = committed.attempts,
                    "Folded rating into aggregate"
                );
                Ok(TriggerOutcome::Applied {
                    record,
                    attempts: committed.attempts,
                })
            }
            None => {
                info!("Write already folded in, skipping redelivery");
                Ok(TriggerOutcome::Duplicate)
            }
        }
    }

    fn change_for(&self, event: &RatingWriteEvent) -> Result<RatingChange> {
        let current = event.new_value()?;
        let previous = event.before.and_then(|prior| prior.checked_value().ok());
        Ok(match (self.fold_policy, previous) {
            (FoldPolicy::ReplacePrior, Some(previous)) => RatingChange::Replaced { previous, current },
            _ => RatingChange::Added(current),
        })
    }
}
