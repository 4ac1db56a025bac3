//! Delivers rating write events to the aggregation trigger.
//!
//! Plays the part of the hosting runtime: each event becomes one invocation,
//! invocations run concurrently (several may target the same entity), and an
//! invocation that fails transiently is delivered again. Delivery is
//! at-least-once. Events for the same rating record are handled one at a
//! time, in the order they were sent.

use crate::core::event::{EventId, RatingWriteEvent};
use crate::core::path::RatingPath;
use crate::trigger::aggregation::{AggregationTrigger, TriggerOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, warn};

/// Concurrency and redelivery limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Invocations allowed in flight at once
    pub max_concurrency: usize,
    /// Extra deliveries after a transient failure
    pub max_redeliveries: u32,
    pub redelivery_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 64,
            max_redeliveries: 3,
            redelivery_backoff_ms: 50,
        }
    }
}

/// An event that could not be folded in
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDelivery {
    pub event_id: EventId,
    pub path: String,
    pub error: String,
    pub attempts: u32,
}

/// Totals over every event the dispatcher handled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub delivered: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub ignored: u64,
    /// Deliveries beyond the first, across all events
    pub redeliveries: u64,
    pub failed: Vec<FailedDelivery>,
    pub panicked: u64,
}

impl DispatchReport {
    fn record(&mut self, finished: std::result::Result<Delivery, JoinError>) {
        let delivery = match finished {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Trigger invocation panicked");
                self.panicked += 1;
                return;
            }
        };

        self.delivered += 1;
        self.redeliveries += u64::from(delivery.attempts.saturating_sub(1));
        match delivery.result {
            Ok(TriggerOutcome::Applied { .. }) => self.applied += 1,
            Ok(TriggerOutcome::Duplicate) => self.duplicates += 1,
            Ok(TriggerOutcome::IgnoredDelete) => self.ignored += 1,
            Err(error) => self.failed.push(FailedDelivery {
                event_id: delivery.event_id,
                path: delivery.path.to_string(),
                error,
                attempts: delivery.attempts,
            }),
        }
    }

    /// Whether every event was handled without error
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked == 0
    }
}

struct Delivery {
    /// Position in the dispatcher's intake order
    seq: u64,
    event_id: EventId,
    path: RatingPath,
    attempts: u32,
    result: std::result::Result<TriggerOutcome, String>,
}

/// Fans rating write events out to concurrent trigger invocations
pub struct TriggerDispatcher {
    trigger: Arc<AggregationTrigger>,
    config: DispatchConfig,
}

impl TriggerDispatcher {
    pub fn new(trigger: Arc<AggregationTrigger>, config: DispatchConfig) -> Self {
        Self { trigger, config }
    }

    /// Start dispatching on a background task.
    ///
    /// Events sent on the returned channel are delivered until every sender
    /// is dropped; the task then drains in-flight invocations and yields the
    /// report.
    pub fn spawn(self) -> (mpsc::UnboundedSender<RatingWriteEvent>, JoinHandle<DispatchReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Deliver events from `events` until the channel closes
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<RatingWriteEvent>) -> DispatchReport {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks: JoinSet<Delivery> = JoinSet::new();
        let mut report = DispatchReport::default();
        // Latest queued invocation per record; the next one waits for it
        let mut tails: HashMap<RatingPath, (u64, oneshot::Receiver<()>)> = HashMap::new();
        let mut seq = 0u64;

        loop {
            tokio::select! {
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Ok(delivery) = &finished {
                        if tails.get(&delivery.path).is_some_and(|(last, _)| *last == delivery.seq) {
                            tails.remove(&delivery.path);
                        }
                    }
                    report.record(finished);
                }
                received = events.recv() => {
                    let Some(event) = received else { break };
                    let Ok(permit) = permits.clone().acquire_owned().await else { break };
                    seq += 1;
                    let (done, turn) = oneshot::channel::<()>();
                    let previous = tails.insert(event.path.clone(), (seq, turn));
                    let trigger = self.trigger.clone();
                    let config = self.config.clone();
                    let this = seq;
                    tasks.spawn(async move {
                        if let Some((_, previous)) = previous {
                            // Resolves when the earlier invocation ends, however it ends
                            let _ = previous.await;
                        }
                        let delivery = deliver(&trigger, event, &config, this).await;
                        drop(done);
                        drop(permit);
                        delivery
                    });
                }
            }
        }

        while let Some(finished) = tasks.join_next().await {
            report.record(finished);
        }
        report
    }
}

/// One event, delivered again while it fails transiently
async fn deliver(
    trigger: &AggregationTrigger,
    event: RatingWriteEvent,
    config: &DispatchConfig,
    seq: u64,
) -> Delivery {
    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        match trigger.handle(&event).await {
            Ok(outcome) => break Ok(outcome),
            Err(e) if e.is_transient() && attempts <= config.max_redeliveries => {
                warn!(
                    event_id = %event.id,
                    path = %event.path,
                    attempt = attempts,
                    error = %e,
                    "Trigger invocation failed, redelivering"
                );
                tokio::time::sleep(Duration::from_millis(config.redelivery_backoff_ms)).await;
            }
            Err(e) => {
                error!(
                    event_id = %event.id,
                    path = %event.path,
                    attempts,
                    error = %e,
                    "Trigger invocation failed"
                );
                break Err(e.to_string());
            }
        }
    };

    Delivery {
        seq,
        event_id: event.id,
        path: event.path,
        attempts,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aggregate::{AggregateState, FoldPolicy};
    use crate::core::path::RatingPath;
    use crate::core::rating::{EntityId, RatingRecord};
    use crate::error::{Error, Result};
    use crate::storage::aggregates::{AggregateStore, InMemoryAggregateStore, Snapshot, Version};
    use crate::trigger::transaction::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store whose first `failures` reads fail as if the backend were down
    struct FlakyStore {
        inner: InMemoryAggregateStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl AggregateStore for FlakyStore {
        async fn read(&self, entity_id: &EntityId) -> Result<Snapshot> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(Error::Storage("backend unavailable".into()));
            }
            self.inner.read(entity_id).await
        }

        async fn commit(
            &self,
            entity_id: &EntityId,
            expected: Version,
            fields: Map<String, Value>,
        ) -> Result<Version> {
            self.inner.commit(entity_id, expected, fields).await
        }

        async fn merge(&self, entity_id: &EntityId, fields: Map<String, Value>) -> Result<Version> {
            self.inner.merge(entity_id, fields).await
        }

        async fn entities(&self) -> Result<Vec<EntityId>> {
            self.inner.entities().await
        }
    }

    fn event(entity: &str, rater: &str, value: f64) -> RatingWriteEvent {
        let path = RatingPath::parse(&format!("ratings/{entity}/ratings/{rater}")).unwrap();
        RatingWriteEvent::created(path, RatingRecord::now(value))
    }

    fn patient_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10_000,
            initial_backoff_ms: 0,
            max_backoff_ms: 1,
        }
    }

    fn quick_dispatch(max_concurrency: usize) -> DispatchConfig {
        DispatchConfig {
            max_concurrency,
            max_redeliveries: 3,
            redelivery_backoff_ms: 0,
        }
    }

    async fn state_of(store: &dyn AggregateStore, entity: &str) -> AggregateState {
        let entity = EntityId::new(entity).unwrap();
        let snapshot = store.read(&entity).await.unwrap();
        AggregateState::from_fields(&entity, &snapshot.fields).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ratings_for_one_entity_are_all_counted() {
        let store = Arc::new(InMemoryAggregateStore::new());
        let trigger = Arc::new(AggregationTrigger::new(store.clone()).with_retry(patient_retry()));
        let (tx, handle) = TriggerDispatcher::new(trigger, quick_dispatch(32)).spawn();

        let values: Vec<f64> = (0..200).map(|i| (i % 3 + 1) as f64).collect();
        for (i, value) in values.iter().enumerate() {
            tx.send(event("taco-truck", &format!("rater-{i}"), *value)).unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.applied, 200);

        let record = *state_of(store.as_ref(), "taco-truck").await.record().unwrap();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert_eq!(record.num_ratings, 200);
        assert!((record.avg_rating - mean).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_entities_are_isolated() {
        let store = Arc::new(InMemoryAggregateStore::new());
        let trigger = Arc::new(AggregationTrigger::new(store.clone()).with_retry(patient_retry()));
        let (tx, handle) = TriggerDispatcher::new(trigger, quick_dispatch(16)).spawn();

        for i in 0..50 {
            tx.send(event("taco-truck", &format!("r{i}"), 3.0)).unwrap();
            tx.send(event("pho-cart", &format!("r{i}"), 1.0)).unwrap();
        }
        drop(tx);
        assert!(handle.await.unwrap().is_clean());

        let taco = *state_of(store.as_ref(), "taco-truck").await.record().unwrap();
        let pho = *state_of(store.as_ref(), "pho-cart").await.record().unwrap();
        assert_eq!((taco.avg_rating, taco.num_ratings), (3.0, 50));
        assert_eq!((pho.avg_rating, pho.num_ratings), (1.0, 50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_record_events_run_in_order() {
        let store = Arc::new(InMemoryAggregateStore::new());
        let trigger = Arc::new(
            AggregationTrigger::new(store.clone())
                .with_fold_policy(FoldPolicy::ReplacePrior)
                .with_retry(patient_retry()),
        );
        let (tx, handle) = TriggerDispatcher::new(trigger, quick_dispatch(64)).spawn();

        for i in 0..100 {
            let path = RatingPath::parse(&format!("ratings/taco-truck/ratings/r{i}")).unwrap();
            let first = RatingRecord::now(1.0);
            tx.send(RatingWriteEvent::created(path.clone(), first)).unwrap();
            tx.send(RatingWriteEvent::new(path, Some(first), Some(RatingRecord::now(3.0))))
                .unwrap();
        }
        drop(tx);

        let report = handle.await.unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.applied, 200);

        // Each rater counted once, at their latest value
        let record = *state_of(store.as_ref(), "taco-truck").await.record().unwrap();
        assert_eq!(record.num_ratings, 100);
        assert!((record.avg_rating - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transient_failure_is_redelivered() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAggregateStore::new(),
            failures: AtomicU32::new(2),
        });
        let trigger = Arc::new(AggregationTrigger::new(store.clone()));
        let (tx, handle) = TriggerDispatcher::new(trigger, quick_dispatch(4)).spawn();

        tx.send(event("taco-truck", "alice", 3.0)).unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.redeliveries, 2);
        assert_eq!(state_of(store.as_ref(), "taco-truck").await.num_ratings(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_budget_exhausted() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAggregateStore::new(),
            failures: AtomicU32::new(100),
        });
        let trigger = Arc::new(AggregationTrigger::new(store));
        let (tx, handle) = TriggerDispatcher::new(trigger, quick_dispatch(4)).spawn();

        tx.send(event("taco-truck", "alice", 3.0)).unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 4);
        assert_eq!(report.failed[0].path, "ratings/taco-truck/ratings/alice");
    }

    #[tokio::test]
    async fn test_malformed_event_is_not_redelivered() {
        let store = Arc::new(InMemoryAggregateStore::new());
        let trigger = Arc::new(AggregationTrigger::new(store.clone()));
        let (tx, handle) = TriggerDispatcher::new(trigger, quick_dispatch(4)).spawn();

        tx.send(event("taco-truck", "alice", f64::NAN)).unwrap();
        tx.send(event("taco-truck", "bob", 2.0)).unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.redeliveries, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].attempts, 1);
        assert_eq!(state_of(store.as_ref(), "taco-truck").await.num_ratings(), 1);
    }
}
