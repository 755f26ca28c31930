//! Raw records read from the watched collections.
//!
//! A `SourceRecord` is exactly what a document source hands back: the fields
//! every collection shares (`id`, `created_at`, `monotonic_seq`) are typed, the
//! rest of the document stays untyped until the transformer validates it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Document body: the type-specific fields of a record.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Position of a record in its source's total write order.
///
/// Sequence numbers are handed out by an atomic counter at write time and are
/// strictly increasing per source. `0` means "nothing seen yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonotonicSeq(u64);

impl MonotonicSeq {
    /// Cursor value before any record has been processed.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw sequence value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw sequence value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MonotonicSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MonotonicSeq {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One watched collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// User bookmarks (`film_bookmarks`).
    Bookmark,
    /// User reviews (`film_reviews`).
    Review,
    /// User ratings (`film_scores`).
    Rating,
}

impl SourceKind {
    /// Every watched source, in the order one-shot queries report them.
    pub const ALL: [Self; 3] = [Self::Bookmark, Self::Review, Self::Rating];

    /// Stable lowercase name, used in cursor keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bookmark => "bookmark",
            Self::Review => "review",
            Self::Rating => "rating",
        }
    }

    /// Name of the backing collection.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Bookmark => "film_bookmarks",
            Self::Review => "film_reviews",
            Self::Rating => "film_scores",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bookmark" | "bookmarks" => Ok(Self::Bookmark),
            "review" | "reviews" => Ok(Self::Review),
            "rating" | "ratings" | "score" | "scores" => Ok(Self::Rating),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// A raw record from one watched collection.
///
/// Immutable once written; pollers only ever read records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Document id.
    pub id: Uuid,
    /// Write-time sequence number.
    pub monotonic_seq: MonotonicSeq,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Remaining document fields (`user_id`, `film_id`, `review_text`, `film_score`, ...).
    #[serde(default)]
    pub fields: Document,
}

impl SourceRecord {
    /// Create a record that has not been assigned a sequence number yet.
    ///
    /// The write path stamps `monotonic_seq` before the record becomes visible.
    #[must_use]
    pub fn unsequenced(fields: Document) -> Self {
        Self {
            id: Uuid::new_v4(),
            monotonic_seq: MonotonicSeq::ZERO,
            created_at: Utc::now(),
            fields,
        }
    }

    /// Bookmark body.
    #[must_use]
    pub fn bookmark(user_id: &str, film_id: &str) -> Self {
        let mut fields = Document::new();
        fields.insert("user_id".to_string(), user_id.into());
        fields.insert("film_id".to_string(), film_id.into());
        Self::unsequenced(fields)
    }

    /// Review body.
    #[must_use]
    pub fn review(user_id: &str, film_id: &str, review_text: &str, film_score: i64) -> Self {
        let mut fields = Document::new();
        fields.insert("user_id".to_string(), user_id.into());
        fields.insert("film_id".to_string(), film_id.into());
        fields.insert("review_text".to_string(), review_text.into());
        fields.insert("film_score".to_string(), film_score.into());
        Self::unsequenced(fields)
    }

    /// Rating body.
    #[must_use]
    pub fn rating(user_id: &str, film_id: &str, film_score: i64) -> Self {
        let mut fields = Document::new();
        fields.insert("user_id".to_string(), user_id.into());
        fields.insert("film_id".to_string(), film_id.into());
        fields.insert("film_score".to_string(), film_score.into());
        Self::unsequenced(fields)
    }

    /// Returns this record with the given sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: MonotonicSeq) -> Self {
        self.monotonic_seq = seq;
        self
    }

    /// Owner of the record, if present and a string.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.fields.get("user_id").and_then(serde_json::Value::as_str)
    }
}
