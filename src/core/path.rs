//! Document paths for rating records and aggregates

use crate::core::rating::{EntityId, RaterId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level collection holding per-rater rating records
pub const RATINGS_COLLECTION: &str = "ratings";

/// Collection holding one aggregate document per entity
pub const AGGREGATES_COLLECTION: &str = "trucks";

/// Path pattern the aggregation trigger is registered against
pub const RATING_PATH_PATTERN: &str = "ratings/{entityId}/ratings/{raterId}";

/// Separator between a fully qualified resource name and the document path
const DOCUMENTS_MARKER: &str = "/documents/";

/// Location of one rating record: `ratings/{entityId}/ratings/{raterId}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RatingPath {
    pub entity_id: EntityId,
    pub rater_id: RaterId,
}

impl RatingPath {
    pub fn new(entity_id: EntityId, rater_id: RaterId) -> Self {
        Self {
            entity_id,
            rater_id,
        }
    }

    /// Parse a document path matching [`RATING_PATH_PATTERN`].
    ///
    /// Fully qualified names such as
    /// `projects/p/databases/(default)/documents/ratings/t/ratings/u` are
    /// accepted; everything up to `/documents/` is dropped.
    pub fn parse(path: &str) -> Result<Self> {
        let relative = match path.find(DOCUMENTS_MARKER) {
            Some(idx) => &path[idx + DOCUMENTS_MARKER.len()..],
            None => path,
        };
        let segments: Vec<&str> = relative.trim_matches('/').split('/').collect();

        match segments.as_slice() {
            [outer, entity, inner, rater]
                if *outer == RATINGS_COLLECTION && *inner == RATINGS_COLLECTION =>
            {
                Ok(Self::new(EntityId::new(*entity)?, RaterId::new(*rater)?))
            }
            _ => Err(Error::InvalidPath(format!(
                "{path:?} does not match {RATING_PATH_PATTERN}"
            ))),
        }
    }

    /// Path of the aggregate document this rating rolls up into
    pub fn aggregate_path(&self) -> String {
        aggregate_path(&self.entity_id)
    }
}

impl fmt::Display for RatingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{RATINGS_COLLECTION}/{}/{RATINGS_COLLECTION}/{}",
            self.entity_id, self.rater_id
        )
    }
}

/// `trucks/{entityId}`
pub fn aggregate_path(entity_id: &EntityId) -> String {
    format!("{AGGREGATES_COLLECTION}/{entity_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_path() {
        let path = RatingPath::parse("ratings/taco-truck/ratings/alice").unwrap();
        assert_eq!(path.entity_id.as_str(), "taco-truck");
        assert_eq!(path.rater_id.as_str(), "alice");
        assert_eq!(path.to_string(), "ratings/taco-truck/ratings/alice");
        assert_eq!(path.aggregate_path(), "trucks/taco-truck");
    }

    #[test]
    fn test_parse_resource_name() {
        let path = RatingPath::parse(
            "projects/food/databases/(default)/documents/ratings/pho-cart/ratings/uid9",
        )
        .unwrap();
        assert_eq!(path.entity_id.as_str(), "pho-cart");
        assert_eq!(path.rater_id.as_str(), "uid9");
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        assert!(RatingPath::parse("trucks/taco-truck").is_err());
        assert!(RatingPath::parse("ratings/taco-truck/votes/alice").is_err());
        assert!(RatingPath::parse("ratings//ratings/alice").is_err());
        assert!(RatingPath::parse("ratings/a/ratings/b/extra").is_err());
    }
}
