//! Offset value type

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Progress of one source: a timestamp watermark and/or an incrementing id
///
/// Serialised as `{"timestamp": <epoch millis>, "timestamp_nanos": <nanos>,
/// "incrementing": <id>}` with absent components omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "OffsetRepr", into = "OffsetRepr")]
pub struct Offset {
    /// Last timestamp seen
    pub timestamp: Option<NaiveDateTime>,
    /// Last incrementing id seen
    pub incrementing: Option<i64>,
}

/// Lower bound used when no incrementing offset exists yet
pub const NO_INCREMENTING_OFFSET: i64 = -1;

impl Offset {
    /// Offset carrying only a timestamp
    pub fn from_timestamp(timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp: Some(timestamp),
            incrementing: None,
        }
    }

    /// Offset carrying only an incrementing id
    pub fn from_incrementing(incrementing: i64) -> Self {
        Self {
            timestamp: None,
            incrementing: Some(incrementing),
        }
    }

    /// Whether neither component is set
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.incrementing.is_none()
    }

    /// Timestamp component, or the Unix epoch when unset
    pub fn timestamp_or_epoch(&self) -> NaiveDateTime {
        // NaiveDateTime::default() is 1970-01-01 00:00:00
        self.timestamp.unwrap_or_default()
    }

    /// Incrementing component, or -1 when unset
    pub fn incrementing_or_default(&self) -> i64 {
        self.incrementing.unwrap_or(NO_INCREMENTING_OFFSET)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.timestamp, self.incrementing) {
            (Some(ts), Some(id)) => write!(f, "{ts}/{id}"),
            (Some(ts), None) => write!(f, "{ts}"),
            (None, Some(id)) => write!(f, "{id}"),
            (None, None) => write!(f, "<none>"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OffsetRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp_nanos: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    incrementing: Option<i64>,
}

impl From<Offset> for OffsetRepr {
    fn from(offset: Offset) -> Self {
        let utc = offset.timestamp.map(|ts| ts.and_utc());
        Self {
            timestamp: utc.map(|ts| ts.timestamp_millis()),
            timestamp_nanos: utc.map(|ts| ts.timestamp_subsec_nanos()),
            incrementing: offset.incrementing,
        }
    }
}

impl TryFrom<OffsetRepr> for Offset {
    type Error = String;

    fn try_from(repr: OffsetRepr) -> Result<Self, Self::Error> {
        let timestamp = match repr.timestamp {
            None => None,
            Some(millis) => {
                let secs = millis.div_euclid(1000);
                let nanos = repr
                    .timestamp_nanos
                    .unwrap_or((millis.rem_euclid(1000) * 1_000_000) as u32);
                let ts = DateTime::from_timestamp(secs, nanos)
                    .ok_or_else(|| format!("timestamp offset out of range: {millis}"))?;
                Some(ts.naive_utc())
            }
        };

        Ok(Self {
            timestamp,
            incrementing: repr.incrementing,
        })
    }
}
