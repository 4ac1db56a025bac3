//! Per-entity rating aggregates and the incremental fold that maintains them

use crate::core::rating::EntityId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Field holding the running mean
pub const AVG_RATING_FIELD: &str = "avgRating";

/// Field holding the number of folded ratings
pub const NUM_RATINGS_FIELD: &str = "numRatings";

/// Running mean and count of the ratings folded into one entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub avg_rating: f64,
    pub num_ratings: u64,
}

impl AggregateRecord {
    /// Aggregate holding a single rating
    pub fn first(value: f64) -> Self {
        Self {
            avg_rating: value,
            num_ratings: 1,
        }
    }

    /// Fields to merge onto the aggregate document
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(AVG_RATING_FIELD.to_string(), Value::from(self.avg_rating));
        fields.insert(NUM_RATINGS_FIELD.to_string(), Value::from(self.num_ratings));
        fields
    }
}

/// How one rating write changes the aggregate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RatingChange {
    /// Fold in one more rating
    Added(f64),
    /// Swap a rater's earlier contribution for a new one
    Replaced { previous: f64, current: f64 },
}

/// Aggregate as read from the store
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateState {
    /// No rating has been folded in yet
    Absent,
    Present(AggregateRecord),
}

impl AggregateState {
    /// Decode the aggregate fields of an entity document.
    ///
    /// Documents may carry unrelated fields (display name, links); only
    /// `avgRating` and `numRatings` are inspected.
    pub fn from_fields(entity_id: &EntityId, fields: &Map<String, Value>) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedAggregate {
            entity_id: entity_id.to_string(),
            reason,
        };

        let avg = fields.get(AVG_RATING_FIELD);
        let count = match fields.get(NUM_RATINGS_FIELD) {
            None if avg.is_none() => return Ok(Self::Absent),
            None => return Err(malformed(format!("{AVG_RATING_FIELD} without {NUM_RATINGS_FIELD}"))),
            Some(raw) => raw
                .as_u64()
                .ok_or_else(|| malformed(format!("{NUM_RATINGS_FIELD} {raw} is not a count")))?,
        };
        if count == 0 {
            return Ok(Self::Absent);
        }

        let avg_rating = avg
            .and_then(Value::as_f64)
            .filter(|a| a.is_finite())
            .ok_or_else(|| {
                malformed(format!(
                    "{NUM_RATINGS_FIELD} is {count} but {AVG_RATING_FIELD} is not a finite number"
                ))
            })?;

        Ok(Self::Present(AggregateRecord {
            avg_rating,
            num_ratings: count,
        }))
    }

    pub fn record(&self) -> Option<&AggregateRecord> {
        match self {
            Self::Absent => None,
            Self::Present(record) => Some(record),
        }
    }

    pub fn num_ratings(&self) -> u64 {
        self.record().map_or(0, |r| r.num_ratings)
    }

    /// Fold one change into the aggregate.
    ///
    /// The mean is moved by each value's share rather than rebuilt from the
    /// sum, so large finite ratings cannot overflow an intermediate total. A
    /// fold whose result is still not finite is `MalformedInput`.
    pub fn apply(&self, change: RatingChange) -> Result<AggregateRecord> {
        let record = match (self, change) {
            (Self::Absent, RatingChange::Added(value))
            | (Self::Absent, RatingChange::Replaced { current: value, .. }) => {
                AggregateRecord::first(value)
            }
            (Self::Present(prior), RatingChange::Added(value)) => {
                let num_ratings = prior.num_ratings + 1;
                let n = num_ratings as f64;
                AggregateRecord {
                    avg_rating: prior.avg_rating + (value / n - prior.avg_rating / n),
                    num_ratings,
                }
            }
            (Self::Present(prior), RatingChange::Replaced { previous, current }) => {
                let n = prior.num_ratings as f64;
                AggregateRecord {
                    avg_rating: prior.avg_rating + (current / n - previous / n),
                    num_ratings: prior.num_ratings,
                }
            }
        };

        if !record.avg_rating.is_finite() {
            return Err(Error::MalformedInput(format!(
                "folding {change:?} into {self:?} does not give a finite average"
            )));
        }
        Ok(record)
    }
}
