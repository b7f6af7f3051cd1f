//! Core domain model for the daily highlights collector.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dhc-core";

/// Stable identifier of a [`Label`], generated by the persisted store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub i32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named source of events, e.g. `New-York-Times`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

/// Canonical record every source is normalized into before reconciliation.
///
/// `timestamp` is the moment the fact pertains to (dates are stored at midnight),
/// not the time it was fetched. Empty strings stand for absent links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: NaiveDateTime,
    pub title: String,
    pub text: String,
    pub link: String,
    pub label_id: LabelId,
    pub image_link: String,
    pub media_link: String,
}

impl Event {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            label_id: self.label_id,
            timestamp: self.timestamp,
            title: self.title.clone(),
        }
    }

    /// Copy the mutable fields of `other` onto `self`, leaving the natural key alone.
    pub fn apply_mutable_fields(&mut self, other: &Event) {
        self.text = other.text.clone();
        self.link = other.link.clone();
        self.image_link = other.image_link.clone();
        self.media_link = other.media_link.clone();
    }
}

/// `(label, timestamp, title)`: at most one stored event exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub label_id: LabelId,
    pub timestamp: NaiveDateTime,
    pub title: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.label_id, self.timestamp, self.title)
    }
}

/// Midnight of `date`, the timestamp used by sources that only know the day.
pub fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

/// Parse the timestamp formats sources hand us: `YYYY-MM-DD`, naive date-times,
/// and RFC 3339 / `+0000`-style offsets (normalized to UTC).
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, RecordMappingError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(midnight(date));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Ok(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    Err(RecordMappingError::InvalidTimestamp(raw.to_string()))
}

/// Equality predicate over the mutable fields of an existing and a fetched event.
pub type EqualFn<'a> = dyn Fn(&Event, &Event) -> bool + Send + Sync + 'a;

/// Compares `link`, `image_link`, `media_link` and `text`.
pub fn same_mutable_fields(existing: &Event, fetched: &Event) -> bool {
    existing.link == fetched.link
        && existing.image_link == fetched.image_link
        && existing.media_link == fetched.media_link
        && existing.text == fetched.text
}

/// Counters of one reconciliation run. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Events that could not be looked up, or that collided with an earlier
    /// event of the same batch.
    pub skipped: usize,
}

impl ReconciliationOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.skipped
    }
}

/// A single fetched item could not become a canonical [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordMappingError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("title filtered out: {0}")]
    Filtered(String),
    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str, link: &str) -> Event {
        Event {
            timestamp: midnight(NaiveDate::from_ymd_opt(2018, 6, 15).unwrap()),
            title: "A".into(),
            text: text.into(),
            link: link.into(),
            label_id: LabelId(1),
            image_link: String::new(),
            media_link: String::new(),
        }
    }

    #[test]
    fn timestamps_from_every_source_format_parse() {
        let day = parse_timestamp("2018-06-15").unwrap();
        assert_eq!(day.to_string(), "2018-06-15 00:00:00");
        let nyt = parse_timestamp("2018-06-15T04:30:00+0000").unwrap();
        assert_eq!(nyt.to_string(), "2018-06-15 04:30:00");
        let rfc = parse_timestamp("2018-06-15T04:30:00+02:00").unwrap();
        assert_eq!(rfc.to_string(), "2018-06-15 02:30:00");
        assert!(matches!(
            parse_timestamp("June 15"),
            Err(RecordMappingError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn every_mutable_field_takes_part_in_equality() {
        let existing = event("x", "l1");
        assert!(same_mutable_fields(&existing, &event("x", "l1")));
        assert!(!same_mutable_fields(&existing, &event("y", "l1")));
        assert!(!same_mutable_fields(&existing, &event("x", "l2")));

        let mut other_media = event("x", "l1");
        other_media.media_link = "https://www.youtube.com/watch?v=1".into();
        assert!(!same_mutable_fields(&existing, &other_media));
    }

    #[test]
    fn applying_mutable_fields_keeps_the_natural_key() {
        let mut stored = event("x", "l1");
        let key = stored.natural_key();
        let mut fetched = event("y", "l2");
        fetched.title = "B".into();
        stored.apply_mutable_fields(&fetched);
        assert_eq!(stored.text, "y");
        assert_eq!(stored.link, "l2");
        assert_eq!(stored.natural_key(), key);
    }

    #[test]
    fn label_id_serializes_as_plain_integer() {
        let json = serde_json::to_string(&LabelId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
