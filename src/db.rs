//! Main database implementation

use crate::config::Config;
use crate::core::aggregate::AggregateState;
use crate::core::document::{decode_change_str, MissingWriteTime};
use crate::core::event::RatingWriteEvent;
use crate::core::path::RatingPath;
use crate::core::rating::{EntityId, RaterId, RatingRecord};
use crate::error::{Error, Result};
use crate::storage::aggregates::{AggregateStore, InMemoryAggregateStore};
use crate::storage::ratings::{InMemoryRatingStore, RatingStore};
use crate::storage::wal::FileWAL;
use crate::trigger::aggregation::{AggregationTrigger, TriggerOutcome};
use crate::trigger::dispatcher::{DispatchReport, TriggerDispatcher};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Rating records, their aggregates, and the trigger wiring between them.
///
/// Every accepted write is logged, stored, and then handed to the dispatcher,
/// which folds it into the entity's aggregate in the background.
pub struct RatingsDB {
    ratings: Arc<InMemoryRatingStore>,
    aggregates: Arc<InMemoryAggregateStore>,
    trigger: Arc<AggregationTrigger>,
    /// Event feed into the dispatcher; `None` once closed
    feed: Option<UnboundedSender<RatingWriteEvent>>,
    dispatcher: Option<JoinHandle<DispatchReport>>,
    /// Held across store write and feed send so events queue in log order
    ordering: Mutex<()>,
    missing_write_time: MissingWriteTime,
}

impl RatingsDB {
    /// Open with `config`, recovering ratings from the WAL under `data_dir`.
    ///
    /// Aggregates are not persisted: they are rebuilt by folding every
    /// recovered write, in log order, before new writes are accepted.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let ratings = match config.wal_path() {
            Some(path) => InMemoryRatingStore::with_wal(FileWAL::open(&path)?),
            None => InMemoryRatingStore::new(),
        };
        let ratings = Arc::new(ratings);
        let aggregates = Arc::new(InMemoryAggregateStore::new());
        let trigger = Arc::new(
            AggregationTrigger::new(aggregates.clone())
                .with_fold_policy(config.fold_policy)
                .with_dedup_replays(config.dedup_replays)
                .with_retry(config.retry.clone()),
        );

        let recovered = ratings.recover().await?;
        let mut skipped = 0usize;
        for event in &recovered {
            match trigger.handle(event).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(path = %event.path, error = %e, "Skipping unfoldable write during recovery");
                    skipped += 1;
                }
            }
        }
        if !recovered.is_empty() {
            info!(
                writes = recovered.len(),
                skipped,
                ratings = ratings.len(),
                "Rebuilt aggregates from WAL"
            );
        }

        let (feed, dispatcher) =
            TriggerDispatcher::new(trigger.clone(), config.dispatch.clone()).spawn();

        Ok(Self {
            ratings,
            aggregates,
            trigger,
            feed: Some(feed),
            dispatcher: Some(dispatcher),
            ordering: Mutex::new(()),
            missing_write_time: if config.dedup_replays {
                MissingWriteTime::Reject
            } else {
                MissingWriteTime::StampNow
            },
        })
    }

    /// Database with default settings and no persistence
    pub async fn in_memory() -> Result<Self> {
        Self::open(&Config::default()).await
    }

    /// Rate `entity_id` on behalf of `rater_id`, stamped with the current time
    pub async fn submit_rating(&self, entity_id: &str, rater_id: &str, value: f64) -> Result<RatingPath> {
        let path = RatingPath::new(EntityId::new(entity_id)?, RaterId::new(rater_id)?);
        self.submit(&path, RatingRecord::now(value)).await?;
        Ok(path)
    }

    /// Store `record` at `path` and queue the write for aggregation.
    ///
    /// Returns once the write is durable in the log; the aggregate catches up
    /// asynchronously. Nothing is stored once the database is closed.
    pub async fn submit(&self, path: &RatingPath, record: RatingRecord) -> Result<()> {
        record.checked_value()?;
        let _order = self.ordering.lock().await;
        let feed = self.open_feed()?;
        let event = self.ratings.put(path, record).await?;
        Self::enqueue(feed, event)
    }

    /// Store `record` at `path` and fold it in before returning
    pub async fn submit_and_wait(&self, path: &RatingPath, record: RatingRecord) -> Result<TriggerOutcome> {
        record.checked_value()?;
        let event = self.ratings.put(path, record).await?;
        self.trigger.handle(&event).await
    }

    /// Store and queue a write observed elsewhere, such as a decoded
    /// document change.
    ///
    /// The change is logged with its own before and after images, so it is
    /// folded the same way again when aggregates are rebuilt.
    pub async fn deliver(&self, event: RatingWriteEvent) -> Result<()> {
        if event.after.is_some() {
            event.new_value()?;
        }
        let _order = self.ordering.lock().await;
        let feed = self.open_feed()?;
        self.ratings.record(&event).await?;
        Self::enqueue(feed, event)
    }

    /// Decode one document-change payload and [`deliver`](Self::deliver) it.
    ///
    /// With replay deduplication on, a change without a write time is
    /// rejected rather than stamped with the current time.
    pub async fn deliver_change(&self, payload: &str) -> Result<()> {
        let event = decode_change_str(payload, self.missing_write_time)?;
        self.deliver(event).await
    }

    fn open_feed(&self) -> Result<&UnboundedSender<RatingWriteEvent>> {
        match &self.feed {
            Some(feed) if !feed.is_closed() => Ok(feed),
            Some(_) => Err(Error::Storage("trigger dispatcher has stopped".into())),
            None => Err(Error::Storage("database is closed".into())),
        }
    }

    fn enqueue(feed: &UnboundedSender<RatingWriteEvent>, event: RatingWriteEvent) -> Result<()> {
        feed.send(event)
            .map_err(|_| Error::Storage("trigger dispatcher has stopped".into()))
    }

    /// Current aggregate for `entity_id`
    pub async fn aggregate(&self, entity_id: &EntityId) -> Result<AggregateState> {
        let snapshot = self.aggregates.read(entity_id).await?;
        AggregateState::from_fields(entity_id, &snapshot.fields)
    }

    /// Aggregates of every rated entity, ordered by entity
    pub async fn aggregates(&self) -> Result<Vec<(EntityId, AggregateState)>> {
        let entities = self.aggregates.entities().await?;
        try_join_all(entities.into_iter().map(|entity_id| async move {
            let state = self.aggregate(&entity_id).await?;
            Ok::<_, Error>((entity_id, state))
        }))
        .await
    }

    pub async fn rating(&self, path: &RatingPath) -> Result<Option<RatingRecord>> {
        self.ratings.get(path).await
    }

    pub async fn ratings_for(&self, entity_id: &EntityId) -> Result<Vec<(RaterId, RatingRecord)>> {
        self.ratings.ratings_for(entity_id).await
    }

    /// Stop accepting writes, wait for queued aggregation, and sync the WAL.
    ///
    /// Reads keep working afterwards. A second call returns an empty report.
    pub async fn close(&mut self) -> Result<DispatchReport> {
        drop(self.feed.take());
        let report = match self.dispatcher.take() {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Storage(format!("trigger dispatcher failed: {e}")))?,
            None => DispatchReport::default(),
        };
        self.ratings.sync().await?;

        if !report.is_clean() {
            warn!(
                failed = report.failed.len(),
                panicked = report.panicked,
                "Some rating writes were not folded into aggregates"
            );
        }
        Ok(report)
    }
}
