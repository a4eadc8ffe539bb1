use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

pub mod query;
pub mod rule;

pub use query::{Aggregator, PointValue, QueryPoint, RangeExpr, SeriesQuery, TagFilter};
pub use rule::{Command, NewRule, Operator, Rule, StoredRule};

/// A typed value stored in a point's field set.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// One normalized time-series point, created per inbound message and written once.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesRecord {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: OffsetDateTime,
}

impl TimeSeriesRecord {
    pub fn new(measurement: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// A record without a measurement or without fields is never written.
    pub fn is_writable(&self) -> bool {
        !self.measurement.is_empty() && !self.fields.is_empty()
    }
}

/// A single dashboard entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Number(f64),
    Text(String),
}

impl StatusValue {
    pub const OFFLINE: &'static str = "offline";
    pub const ONLINE: &'static str = "online";

    pub fn offline() -> Self {
        StatusValue::Text(Self::OFFLINE.to_string())
    }
}

/// Dashboard snapshot, rebuilt from scratch every cycle and published as one flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub values: BTreeMap<String, StatusValue>,
    pub last_update: String,
}

impl StatusSnapshot {
    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.values.get(key)
    }
}
