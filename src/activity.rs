//! Normalized activity events delivered to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{MonotonicSeq, SourceKind};

/// Activity discriminant. Numeric values match the wire enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    /// A film rating.
    Rating = 0,
    /// A film bookmark.
    Bookmark = 1,
    /// A film review.
    Review = 2,
}

impl ActivityType {
    /// Wire value of this activity type.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<SourceKind> for ActivityType {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Bookmark => Self::Bookmark,
            SourceKind::Review => Self::Review,
            SourceKind::Rating => Self::Rating,
        }
    }
}

/// Type-specific part of an activity.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityPayload {
    Bookmark { film_id: String },
    Review { film_id: String, review_text: String },
    Rating { film_id: String, rating: i32 },
}

impl ActivityPayload {
    /// Film the activity refers to.
    #[must_use]
    pub fn film_id(&self) -> &str {
        match self {
            Self::Bookmark { film_id } | Self::Review { film_id, .. } | Self::Rating { film_id, .. } => {
                film_id
            }
        }
    }
}

/// The normalized output unit of the feed.
///
/// Built from exactly one `SourceRecord` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Id of the source document.
    pub id: String,
    /// Acting user.
    pub user_id: String,
    /// Activity discriminant.
    pub activity_type: ActivityType,
    /// When the source document was created.
    pub created_at: DateTime<Utc>,
    /// Type-specific fields.
    pub payload: ActivityPayload,
    /// Sequence of the source document. Not part of the wire shape.
    #[serde(skip)]
    pub seq: MonotonicSeq,
}

impl ActivityEvent {
    /// Source collection this event was read from.
    #[must_use]
    pub const fn source_kind(&self) -> SourceKind {
        match self.activity_type {
            ActivityType::Bookmark => SourceKind::Bookmark,
            ActivityType::Review => SourceKind::Review,
            ActivityType::Rating => SourceKind::Rating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(ActivityType::Rating.as_i32(), 0);
        assert_eq!(ActivityType::Bookmark.as_i32(), 1);
        assert_eq!(ActivityType::Review.as_i32(), 2);
    }

    #[test]
    fn payload_serializes_tagged() {
        let payload = ActivityPayload::Rating {
            film_id: "f1".to_string(),
            rating: 7,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["type"], "rating");
        assert_eq!(v["rating"], 7);
        assert_eq!(payload.film_id(), "f1");
    }
}
