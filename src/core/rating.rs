//! Rated entities, raters, and their rating records

use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! key_segment {
    ($(#[$doc:meta])* $name:ident, $what:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a single path segment
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                if id.is_empty() {
                    return Err(Error::InvalidPath(format!("empty {}", $what)));
                }
                if id.contains('/') {
                    return Err(Error::InvalidPath(format!(
                        "{} {:?} contains '/'",
                        $what, id
                    )));
                }
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }
    };
}

key_segment!(
    /// Identifier of a rated entity (a food truck)
    EntityId,
    "entity id"
);

key_segment!(
    /// Identifier of the user submitting a rating
    RaterId,
    "rater id"
);

/// A single rater's rating of one entity.
///
/// Stored at `ratings/{entityId}/ratings/{raterId}`; a later write by the
/// same rater replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRecord {
    /// Star rating. The UI offers 1..=3 but nothing enforces a range.
    #[serde(alias = "rating")]
    pub value: f64,
    /// Time of the last write
    pub written_at: Timestamp,
}

impl RatingRecord {
    pub fn new(value: f64, written_at: Timestamp) -> Self {
        Self { value, written_at }
    }

    /// Record stamped with the current time
    pub fn now(value: f64) -> Self {
        Self::new(value, Timestamp::now())
    }

    /// The value, if it can be folded into an average.
    pub fn checked_value(&self) -> Result<f64> {
        if self.value.is_finite() {
            Ok(self.value)
        } else {
            Err(Error::MalformedInput(format!(
                "rating value {} is not a finite number",
                self.value
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_segment_validation() {
        assert_eq!(EntityId::new("taco-truck").unwrap().as_str(), "taco-truck");
        assert!(EntityId::new("").is_err());
        assert!(RaterId::new("a/b").is_err());
        let rater: RaterId = "uid-42".parse().unwrap();
        assert_eq!(rater.to_string(), "uid-42");
    }

    #[test]
    fn test_record_accepts_legacy_field_name() {
        let record: RatingRecord =
            serde_json::from_value(serde_json::json!({"rating": 2.0, "writtenAt": {"nanos": 7}}))
                .unwrap();
        assert_eq!(record.value, 2.0);
        assert_eq!(record.written_at, Timestamp::from_nanos(7));

        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["value"], 2.0);
    }

    #[test]
    fn test_checked_value() {
        assert_eq!(RatingRecord::now(3.0).checked_value().unwrap(), 3.0);
        // Out of the UI range but still accepted
        assert_eq!(RatingRecord::now(7.0).checked_value().unwrap(), 7.0);
        assert!(matches!(
            RatingRecord::now(f64::NAN).checked_value(),
            Err(Error::MalformedInput(_))
        ));
    }
}
