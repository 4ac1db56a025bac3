//! Write events delivered to the aggregation trigger

use crate::core::path::RatingPath;
use crate::core::rating::{EntityId, RaterId, RatingRecord};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    /// UUID of the event
    pub id: Uuid,
}

impl EventId {
    /// Generate a new event ID
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self { id: uuid }
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// What a write did to the rating record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// A change to one rating record, with the record before and after the write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingWriteEvent {
    pub id: EventId,
    pub path: RatingPath,
    /// Record before the write, `None` on create
    pub before: Option<RatingRecord>,
    /// Record after the write, `None` on delete
    pub after: Option<RatingRecord>,
}

impl RatingWriteEvent {
    pub fn new(path: RatingPath, before: Option<RatingRecord>, after: Option<RatingRecord>) -> Self {
        Self {
            id: EventId::new(),
            path,
            before,
            after,
        }
    }

    /// Event for a rater's first rating of an entity
    pub fn created(path: RatingPath, record: RatingRecord) -> Self {
        Self::new(path, None, Some(record))
    }

    /// Same event under an existing id, such as one read back from the log
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn kind(&self) -> WriteKind {
        match (&self.before, &self.after) {
            (_, None) => WriteKind::Delete,
            (None, Some(_)) => WriteKind::Create,
            (Some(_), Some(_)) => WriteKind::Update,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.path.entity_id
    }

    pub fn rater_id(&self) -> &RaterId {
        &self.path.rater_id
    }

    /// The rating value after the write
    pub fn new_value(&self) -> Result<f64> {
        self.after
            .as_ref()
            .ok_or_else(|| Error::MalformedInput(format!("{} has no value after write", self.path)))?
            .checked_value()
    }

    /// Write time of the new record, used as the replay marker
    pub fn written_at(&self) -> Option<Timestamp> {
        self.after.as_ref().map(|r| r.written_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> RatingPath {
        RatingPath::parse("ratings/taco-truck/ratings/alice").unwrap()
    }

    #[test]
    fn test_write_kind() {
        let r1 = RatingRecord::new(3.0, Timestamp::from_secs(1));
        let r2 = RatingRecord::new(2.0, Timestamp::from_secs(2));

        assert_eq!(RatingWriteEvent::created(path(), r1).kind(), WriteKind::Create);
        assert_eq!(
            RatingWriteEvent::new(path(), Some(r1), Some(r2)).kind(),
            WriteKind::Update
        );
        assert_eq!(
            RatingWriteEvent::new(path(), Some(r1), None).kind(),
            WriteKind::Delete
        );
    }

    #[test]
    fn test_new_value() {
        let event = RatingWriteEvent::created(path(), RatingRecord::new(3.0, Timestamp::from_secs(1)));
        assert_eq!(event.new_value().unwrap(), 3.0);
        assert_eq!(event.entity_id().as_str(), "taco-truck");
        assert_eq!(event.rater_id().as_str(), "alice");

        let deleted = RatingWriteEvent::new(path(), event.after, None);
        assert!(matches!(deleted.new_value(), Err(Error::MalformedInput(_))));
    }
}
