//! Rating record store: one record per (entity, rater), overwritten in place

use crate::core::event::RatingWriteEvent;
use crate::core::path::RatingPath;
use crate::core::rating::{EntityId, RaterId, RatingRecord};
use crate::error::Result;
use crate::storage::wal::{InMemoryWAL, WalEntry, WriteAheadLog};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Trait for rating store implementations
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Create or overwrite the record at `path`.
    ///
    /// Returns the change event carrying the record before and after the
    /// write, which is what the aggregation trigger consumes.
    async fn put(&self, path: &RatingPath, record: RatingRecord) -> Result<RatingWriteEvent>;

    /// Apply a change observed elsewhere, logging it with both images as given
    async fn record(&self, event: &RatingWriteEvent) -> Result<()>;

    /// Get the record at `path`, if any
    async fn get(&self, path: &RatingPath) -> Result<Option<RatingRecord>>;

    /// All records for one entity, ordered by rater
    async fn ratings_for(&self, entity_id: &EntityId) -> Result<Vec<(RaterId, RatingRecord)>>;

    /// Flush logged writes to stable storage
    async fn sync(&self) -> Result<()>;
}

/// Rating store held in memory and made durable by a write-ahead log
pub struct InMemoryRatingStore {
    records: DashMap<RatingPath, RatingRecord>,
    /// Held across log append and map update so log order is apply order
    wal: Mutex<Box<dyn WriteAheadLog>>,
}

impl InMemoryRatingStore {
    /// Store without durability
    pub fn new() -> Self {
        Self::with_wal(InMemoryWAL::new())
    }

    pub fn with_wal<W: WriteAheadLog + 'static>(wal: W) -> Self {
        Self {
            records: DashMap::new(),
            wal: Mutex::new(Box::new(wal)),
        }
    }

    /// Rebuild records from the log.
    ///
    /// Returns the change events in log order, as the original writes
    /// produced them, so derived state can be rebuilt by replaying them.
    pub async fn recover(&self) -> Result<Vec<RatingWriteEvent>> {
        let wal = self.wal.lock().await;
        let entries = wal.replay()?;
        let events = entries
            .into_iter()
            .map(|entry| self.apply(entry.path(), entry.record))
            .collect::<Vec<_>>();
        debug!(entries = events.len(), "Recovered rating records from WAL");
        Ok(events)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn apply(&self, event: &RatingWriteEvent) {
        match event.after {
            Some(record) => {
                self.records.insert(event.path.clone(), record);
            }
            None => {
                self.records.remove(&event.path);
            }
        }
    }
}

impl Default for InMemoryRatingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RatingStore for InMemoryRatingStore {
    async fn put(&self, path: &RatingPath, record: RatingRecord) -> Result<RatingWriteEvent> {
        let mut wal = self.wal.lock().await;
        let before = self.records.get(path).map(|r| *r.value());
        let event = RatingWriteEvent::new(path.clone(), before, Some(record));
        wal.append(&WalEntry::from_event(&event))?;
        self.apply(&event);
        Ok(event)
    }

    async fn record(&self, event: &RatingWriteEvent) -> Result<()> {
        let mut wal = self.wal.lock().await;
        wal.append(&WalEntry::from_event(event))?;
        self.apply(event);
        Ok(())
    }

    async fn get(&self, path: &RatingPath) -> Result<Option<RatingRecord>> {
        Ok(self.records.get(path).map(|r| *r.value()))
    }

    async fn ratings_for(&self, entity_id: &EntityId) -> Result<Vec<(RaterId, RatingRecord)>> {
        let mut ratings: Vec<(RaterId, RatingRecord)> = self
            .records
            .iter()
            .filter(|r| &r.key().entity_id == entity_id)
            .map(|r| (r.key().rater_id.clone(), *r.value()))
            .collect();
        ratings.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ratings)
    }

    async fn sync(&self) -> Result<()> {
        self.wal.lock().await.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::WriteKind;
    use crate::core::temporal::Timestamp;
    use crate::storage::wal::FileWAL;
    use tempfile::TempDir;

    fn path(entity: &str, rater: &str) -> RatingPath {
        RatingPath::parse(&format!("ratings/{entity}/ratings/{rater}")).unwrap()
    }

    #[tokio::test]
    async fn test_put_reports_before_and_after() {
        let store = InMemoryRatingStore::new();
        let first = RatingRecord::new(3.0, Timestamp::from_secs(1));
        let second = RatingRecord::new(2.0, Timestamp::from_secs(2));

        let created = store.put(&path("taco-truck", "alice"), first).await.unwrap();
        assert_eq!(created.kind(), WriteKind::Create);
        assert_eq!(created.after, Some(first));

        let updated = store.put(&path("taco-truck", "alice"), second).await.unwrap();
        assert_eq!(updated.kind(), WriteKind::Update);
        assert_eq!(updated.before, Some(first));
        assert_eq!(updated.after, Some(second));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&path("taco-truck", "alice")).await.unwrap(), Some(second));
        assert_eq!(store.get(&path("taco-truck", "bob")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ratings_for_entity() {
        let store = InMemoryRatingStore::new();
        store.put(&path("taco-truck", "bob"), RatingRecord::now(1.0)).await.unwrap();
        store.put(&path("taco-truck", "alice"), RatingRecord::now(3.0)).await.unwrap();
        store.put(&path("pho-cart", "alice"), RatingRecord::now(2.0)).await.unwrap();

        let ratings = store
            .ratings_for(&EntityId::new("taco-truck").unwrap())
            .await
            .unwrap();
        let raters: Vec<&str> = ratings.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(raters, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_recover_from_file_wal() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("ratings.wal");

        {
            let store = InMemoryRatingStore::with_wal(FileWAL::open(&wal_path).unwrap());
            store.put(&path("taco-truck", "alice"), RatingRecord::now(3.0)).await.unwrap();
            store.put(&path("taco-truck", "alice"), RatingRecord::now(2.0)).await.unwrap();
            store.sync().await.unwrap();
        }

        let store = InMemoryRatingStore::with_wal(FileWAL::open(&wal_path).unwrap());
        let events = store.recover().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), WriteKind::Create);
        assert_eq!(events[1].kind(), WriteKind::Update);
        assert_eq!(events[1].before.unwrap().value, 3.0);

        let current = store.get(&path("taco-truck", "alice")).await.unwrap().unwrap();
        assert_eq!(current.value, 2.0);
    }

    #[tokio::test]
    async fn test_record_observed_changes() {
        let temp_dir = TempDir::new().unwrap();
        let wal_path = temp_dir.path().join("ratings.wal");
        let earlier = RatingRecord::new(3.0, Timestamp::from_secs(1));
        let later = RatingRecord::new(2.0, Timestamp::from_secs(2));
        // The prior image comes from the change, not from this store
        let update = RatingWriteEvent::new(path("taco-truck", "alice"), Some(earlier), Some(later));
        let removed = RatingWriteEvent::new(path("taco-truck", "bob"), Some(earlier), None);

        {
            let store = InMemoryRatingStore::with_wal(FileWAL::open(&wal_path).unwrap());
            store.put(&path("taco-truck", "bob"), earlier).await.unwrap();
            store.record(&update).await.unwrap();
            store.record(&removed).await.unwrap();
            assert_eq!(store.get(&path("taco-truck", "alice")).await.unwrap(), Some(later));
            assert_eq!(store.get(&path("taco-truck", "bob")).await.unwrap(), None);
            store.sync().await.unwrap();
        }

        let store = InMemoryRatingStore::with_wal(FileWAL::open(&wal_path).unwrap());
        let events = store.recover().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], update);
        assert_eq!(events[2], removed);
        assert_eq!(store.len(), 1);
    }
}
