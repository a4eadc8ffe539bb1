//! Maps `(topic, payload)` pairs published by field devices onto time-series records.
//!
//! Routing is an ordered table of topic patterns; the first structural match decides
//! how the payload is read. Anything that does not fit is dropped without an error.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::domain::{FieldValue, TimeSeriesRecord};

pub const GPIO_STATE_MEASUREMENT: &str = "gpio_state";
pub const DEVICE_STATUS_MEASUREMENT: &str = "device_status";
pub const DEVICE_ID_TAG: &str = "device_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Float,
    Integer,
}

/// Declared field set per sensor type. Fields outside this set are ignored.
const SENSOR_SCHEMAS: &[(&str, &[(&str, FieldKind)])] = &[
    (
        "bmp280",
        &[
            ("temperature", FieldKind::Float),
            ("pressure", FieldKind::Float),
            ("pressure_sea_level", FieldKind::Float),
        ],
    ),
    ("dht11", &[("temperature", FieldKind::Float), ("humidity", FieldKind::Float)]),
    ("mq135", &[("adc_raw", FieldKind::Integer), ("ppm", FieldKind::Float)]),
    ("ldr", &[("ldr_raw", FieldKind::Integer)]),
];

struct Route {
    /// Slash-delimited pattern; `+` captures exactly one non-empty segment.
    pattern: &'static str,
    extract: fn(&[&str], &Payload<'_>) -> Option<Extracted>,
}

const ROUTES: &[Route] = &[
    Route { pattern: "+/sensor/+", extract: sensor_reading },
    Route { pattern: "+/gpio/+/state", extract: gpio_state },
    Route { pattern: "+/status", extract: device_status },
    Route { pattern: "+/system/status", extract: device_status },
];

struct Extracted {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: BTreeMap<String, FieldValue>,
}

struct Payload<'a> {
    text: &'a str,
    json: Option<Value>,
}

impl<'a> Payload<'a> {
    fn parse(raw: &'a [u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        Some(Self { text, json: serde_json::from_str(text).ok() })
    }

    fn object(&self) -> Option<&Map<String, Value>> {
        self.json.as_ref()?.as_object()
    }

    /// Scalar reading of the payload: a JSON string's content, otherwise the trimmed text.
    fn scalar(&self) -> String {
        match &self.json {
            Some(Value::String(s)) => s.clone(),
            _ => self.text.trim().to_string(),
        }
    }
}

/// Normalize a message received now.
pub fn normalize(topic: &str, payload: &[u8]) -> Option<TimeSeriesRecord> {
    normalize_at(topic, payload, OffsetDateTime::now_utc())
}

pub fn normalize_at(topic: &str, payload: &[u8], received_at: OffsetDateTime) -> Option<TimeSeriesRecord> {
    let payload = Payload::parse(payload)?;
    let (route, captures) = ROUTES
        .iter()
        .find_map(|route| match_topic(route.pattern, topic).map(|captures| (route, captures)))?;

    let extracted = (route.extract)(&captures, &payload)?;

    let mut record = TimeSeriesRecord::new(extracted.measurement, received_at)
        .with_tag(DEVICE_ID_TAG, captures[0]);
    for (key, value) in extracted.tags {
        record.tags.insert(key, value);
    }
    record.fields = extracted.fields;

    record.is_writable().then_some(record)
}

fn match_topic<'t>(pattern: &str, topic: &'t str) -> Option<Vec<&'t str>> {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');
    let mut captures = Vec::new();
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (None, None) => return Some(captures),
            (Some("+"), Some(segment)) if !segment.is_empty() => captures.push(segment),
            (Some(literal), Some(segment)) if literal != "+" && literal == segment => {}
            _ => return None,
        }
    }
}

fn sensor_reading(captures: &[&str], payload: &Payload<'_>) -> Option<Extracted> {
    let sensor = captures[1];
    let data = payload.object()?;
    let (_, schema) = SENSOR_SCHEMAS.iter().find(|(name, _)| *name == sensor)?;

    let fields = schema
        .iter()
        .filter_map(|(name, kind)| {
            let value = coerce(data.get(*name)?, *kind)?;
            Some((name.to_string(), value))
        })
        .collect();

    Some(Extracted { measurement: sensor.to_string(), tags: Vec::new(), fields })
}

fn gpio_state(captures: &[&str], payload: &Payload<'_>) -> Option<Extracted> {
    let pin = captures[1];
    let pin = if pin.starts_with("gpio") { pin.to_string() } else { format!("gpio{pin}") };
    let state = payload.scalar().to_uppercase();
    if state.is_empty() {
        return None;
    }
    Some(Extracted {
        measurement: GPIO_STATE_MEASUREMENT.to_string(),
        tags: vec![("pin".to_string(), pin)],
        fields: BTreeMap::from([("state".to_string(), FieldValue::Text(state))]),
    })
}

fn device_status(_captures: &[&str], payload: &Payload<'_>) -> Option<Extracted> {
    let status = payload.scalar();
    if status.is_empty() {
        return None;
    }
    Some(Extracted {
        measurement: DEVICE_STATUS_MEASUREMENT.to_string(),
        tags: Vec::new(),
        fields: BTreeMap::from([("status".to_string(), FieldValue::Text(status))]),
    })
}

fn coerce(value: &Value, kind: FieldKind) -> Option<FieldValue> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !number.is_finite() {
        return None;
    }
    match kind {
        FieldKind::Float => Some(FieldValue::Float(number)),
        FieldKind::Integer => {
            if let Value::Number(n) = value {
                if let Some(i) = n.as_i64() {
                    return Some(FieldValue::Integer(i));
                }
            }
            let truncated = number.trunc();
            if truncated < i64::MIN as f64 || truncated > i64::MAX as f64 {
                return None;
            }
            Some(FieldValue::Integer(truncated as i64))
        }
    }
}
