//! Mapping from raw source records to activity events.
//!
//! Transformers are pure and stateless. A record that lacks a required field
//! is rejected with a `RecordError`; nothing is coerced or defaulted.

use serde_json::Value as JsonValue;

use crate::activity::{ActivityEvent, ActivityPayload, ActivityType};
use crate::error::RecordError;
use crate::record::{SourceKind, SourceRecord};

/// Maximum accepted rating.
pub const MAX_RATING: i64 = 10;

/// Signature shared by all per-source transformers.
pub type TransformFn = fn(&SourceRecord) -> Result<ActivityEvent, RecordError>;

/// Transformer for the given source.
#[must_use]
pub fn transformer_for(kind: SourceKind) -> TransformFn {
    match kind {
        SourceKind::Bookmark => transform_bookmark,
        SourceKind::Review => transform_review,
        SourceKind::Rating => transform_rating,
    }
}

/// Transform a record read from `kind`.
pub fn transform(kind: SourceKind, record: &SourceRecord) -> Result<ActivityEvent, RecordError> {
    transformer_for(kind)(record)
}

/// Bookmark document to `BOOKMARK` activity.
pub fn transform_bookmark(record: &SourceRecord) -> Result<ActivityEvent, RecordError> {
    let kind = SourceKind::Bookmark;
    let user_id = required_id(kind, record, "user_id")?;
    let film_id = required_id(kind, record, "film_id")?;
    Ok(build(kind, record, user_id, ActivityPayload::Bookmark { film_id }))
}

/// Review document to `REVIEW` activity.
pub fn transform_review(record: &SourceRecord) -> Result<ActivityEvent, RecordError> {
    let kind = SourceKind::Review;
    let user_id = required_id(kind, record, "user_id")?;
    let film_id = required_id(kind, record, "film_id")?;
    let review_text = match field(kind, record, "review_text")? {
        JsonValue::String(s) => s.clone(),
        other => return Err(invalid(kind, record, "review_text", format!("expected string, got {other}"))),
    };
    Ok(build(
        kind,
        record,
        user_id,
        ActivityPayload::Review { film_id, review_text },
    ))
}

/// Score document to `RATING` activity.
pub fn transform_rating(record: &SourceRecord) -> Result<ActivityEvent, RecordError> {
    let kind = SourceKind::Rating;
    let user_id = required_id(kind, record, "user_id")?;
    let film_id = required_id(kind, record, "film_id")?;
    let raw = field(kind, record, "film_score")?;
    let score = raw
        .as_i64()
        .ok_or_else(|| invalid(kind, record, "film_score", format!("expected integer, got {raw}")))?;
    if !(0..=MAX_RATING).contains(&score) {
        return Err(invalid(
            kind,
            record,
            "film_score",
            format!("{score} is outside 0..={MAX_RATING}"),
        ));
    }
    #[allow(clippy::cast_possible_truncation)]
    let rating = score as i32;
    Ok(build(kind, record, user_id, ActivityPayload::Rating { film_id, rating }))
}

fn build(kind: SourceKind, record: &SourceRecord, user_id: String, payload: ActivityPayload) -> ActivityEvent {
    ActivityEvent {
        id: record.id.to_string(),
        user_id,
        activity_type: ActivityType::from(kind),
        created_at: record.created_at,
        payload,
        seq: record.monotonic_seq,
    }
}

fn field<'a>(kind: SourceKind, record: &'a SourceRecord, name: &'static str) -> Result<&'a JsonValue, RecordError> {
    match record.fields.get(name) {
        None | Some(JsonValue::Null) => Err(RecordError::MissingField {
            kind,
            seq: record.monotonic_seq,
            field: name,
        }),
        Some(v) => Ok(v),
    }
}

fn required_id(kind: SourceKind, record: &SourceRecord, name: &'static str) -> Result<String, RecordError> {
    match field(kind, record, name)? {
        JsonValue::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        JsonValue::String(_) => Err(invalid(kind, record, name, "must not be empty".to_string())),
        other => Err(invalid(kind, record, name, format!("expected string, got {other}"))),
    }
}

fn invalid(kind: SourceKind, record: &SourceRecord, name: &'static str, reason: String) -> RecordError {
    RecordError::InvalidField {
        kind,
        seq: record.monotonic_seq,
        field: name,
        reason,
    }
}
