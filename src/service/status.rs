use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::domain::{Aggregator, PointValue, SeriesQuery, StatusSnapshot, StatusValue, TagFilter};
use crate::ports::{MessageBroker, TimeSeriesSink};
use crate::service::normalizer::{DEVICE_STATUS_MEASUREMENT, GPIO_STATE_MEASUREMENT};

/// How a probe's raw value is rendered on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFormat {
    Numeric { precision: u32 },
    /// Switch state, passed through as `ON` / `OFF`.
    State,
    /// Device status text; `heartbeat` and `online` both mean online.
    Status,
}

#[derive(Debug, Clone)]
pub struct Probe {
    pub measurement: String,
    pub field: String,
    pub filter: Option<TagFilter>,
    pub key: String,
    pub format: ProbeFormat,
    pub check_staleness: bool,
}

impl Probe {
    pub fn numeric(measurement: &str, field: &str, key: &str, precision: u32) -> Self {
        Self {
            measurement: measurement.into(),
            field: field.into(),
            filter: None,
            key: key.into(),
            format: ProbeFormat::Numeric { precision },
            check_staleness: false,
        }
    }

    pub fn filtered(mut self, filter: TagFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn stale_after_timeout(mut self) -> Self {
        self.check_staleness = true;
        self
    }

    fn with_format(mut self, format: ProbeFormat) -> Self {
        self.format = format;
        self
    }
}

/// The dashboard's probe table.
pub fn default_probes() -> Vec<Probe> {
    vec![
        Probe::numeric(DEVICE_STATUS_MEASUREMENT, "status", "device_status", 0)
            .with_format(ProbeFormat::Status)
            .filtered(TagFilter::eq("device_id", "esp32_02"))
            .stale_after_timeout(),
        Probe::numeric("dht11", "temperature", "dht11_temperature", 1),
        Probe::numeric("dht11", "humidity", "dht11_humidity", 1),
        Probe::numeric("bmp280", "temperature", "bmp280_temperature", 1),
        Probe::numeric("bmp280", "pressure", "bmp280_pressure", 2),
        Probe::numeric("bmp280", "pressure_sea_level", "bmp280_sea_level_pressure", 2),
        Probe::numeric("mq135", "ppm", "mq135_ppm", 2),
        Probe::numeric("ldr", "ldr_raw", "ldr_raw", 0),
        Probe::numeric(GPIO_STATE_MEASUREMENT, "state", "gpio2_state", 0)
            .with_format(ProbeFormat::State)
            .filtered(TagFilter::eq("pin", "gpio2")),
    ]
}

/// Builds and publishes the dashboard snapshot.
pub struct StatusAggregator {
    sink: Arc<dyn TimeSeriesSink>,
    broker: Arc<dyn MessageBroker>,
    probes: Vec<Probe>,
    offline_timeout: Duration,
    topic: String,
}

impl StatusAggregator {
    pub fn new(
        sink: Arc<dyn TimeSeriesSink>,
        broker: Arc<dyn MessageBroker>,
        probes: Vec<Probe>,
        offline_timeout: Duration,
        topic: impl Into<String>,
    ) -> Self {
        Self { sink, broker, probes, offline_timeout, topic: topic.into() }
    }

    /// Query every probe once. Probes without data, or whose query fails, are left out.
    pub async fn build_snapshot(&self, now: OffsetDateTime) -> anyhow::Result<StatusSnapshot> {
        let mut values = BTreeMap::new();

        for probe in &self.probes {
            let query = SeriesQuery {
                aggregator: Aggregator::Last,
                measurement: probe.measurement.clone(),
                field: probe.field.clone(),
                range: None,
                filter: probe.filter.clone(),
            };

            let point = match self.sink.query(&query).await {
                Ok(Some(point)) => point,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %probe.key, "Status probe query failed: {:?}", e);
                    continue;
                }
            };

            let age = now - point.timestamp;
            let value = if probe.check_staleness && age > self.offline_timeout {
                StatusValue::offline()
            } else {
                format_value(probe.format, point.value)
            };
            values.insert(probe.key.clone(), value);
        }

        Ok(StatusSnapshot { values, last_update: now.format(&Rfc3339)? })
    }

    /// Build the snapshot and publish it as a single message.
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn publish(&self) -> anyhow::Result<StatusSnapshot> {
        let snapshot = self.build_snapshot(OffsetDateTime::now_utc()).await?;
        self.broker.publish(&self.topic, serde_json::to_vec(&snapshot)?).await?;
        metrics::counter!("status_publish_total", 1);
        debug!(keys = snapshot.values.len(), "Status snapshot published");
        Ok(snapshot)
    }
}

fn format_value(format: ProbeFormat, value: PointValue) -> StatusValue {
    match (format, value) {
        (ProbeFormat::Numeric { precision }, PointValue::Number(v)) => StatusValue::Number(round_to(v, precision)),
        (ProbeFormat::State, PointValue::Text(s)) => StatusValue::Text(s.to_uppercase()),
        (ProbeFormat::Status, PointValue::Text(s)) if s == "heartbeat" || s == StatusValue::ONLINE => {
            StatusValue::Text(StatusValue::ONLINE.to_string())
        }
        (_, PointValue::Text(s)) => StatusValue::Text(s),
        (_, PointValue::Number(v)) => StatusValue::Number(v),
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueryPoint;
    use crate::service::test_support::{MockBroker, MockSink};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn aggregator(sink: Arc<MockSink>, broker: Arc<MockBroker>) -> StatusAggregator {
        StatusAggregator::new(sink, broker, default_probes(), Duration::from_secs(60), "dashboard/status")
    }

    fn point(value: PointValue, age_secs: i64) -> QueryPoint {
        QueryPoint { value, timestamp: NOW - time::Duration::seconds(age_secs) }
    }

    #[tokio::test]
    async fn missing_points_are_omitted() {
        let sink = Arc::new(MockSink::new());
        sink.answer("dht11", "temperature", point(PointValue::Number(23.456), 5));

        let snapshot = aggregator(sink, Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        assert_eq!(snapshot.values.len(), 1);
        assert_eq!(snapshot.get("dht11_temperature"), Some(&StatusValue::Number(23.5)));
        assert!(snapshot.get("dht11_humidity").is_none());
        assert_eq!(snapshot.last_update, "2024-05-01T12:00:00Z");
    }

    #[tokio::test]
    async fn stale_status_reports_offline() {
        let sink = Arc::new(MockSink::new());
        sink.answer("device_status", "status", point(PointValue::Text("heartbeat".into()), 61));

        let snapshot = aggregator(sink, Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        assert_eq!(snapshot.get("device_status"), Some(&StatusValue::offline()));
    }

    #[tokio::test]
    async fn fresh_heartbeat_normalizes_to_online() {
        let sink = Arc::new(MockSink::new());
        sink.answer("device_status", "status", point(PointValue::Text("heartbeat".into()), 60));

        let snapshot = aggregator(sink, Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        assert_eq!(snapshot.get("device_status"), Some(&StatusValue::Text("online".into())));
    }

    #[tokio::test]
    async fn staleness_only_applies_to_flagged_probes() {
        let sink = Arc::new(MockSink::new());
        sink.answer("ldr", "ldr_raw", point(PointValue::Number(2048.0), 86_400));

        let snapshot = aggregator(sink, Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        assert_eq!(snapshot.get("ldr_raw"), Some(&StatusValue::Number(2048.0)));
    }

    #[tokio::test]
    async fn formats_state_and_precision() {
        let sink = Arc::new(MockSink::new());
        sink.answer("gpio_state", "state", point(PointValue::Text("on".into()), 1));
        sink.answer("bmp280", "pressure", point(PointValue::Number(1013.2567), 1));
        sink.answer("device_status", "status", point(PointValue::Text("rebooting".into()), 1));

        let snapshot = aggregator(sink, Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        assert_eq!(snapshot.get("gpio2_state"), Some(&StatusValue::Text("ON".into())));
        assert_eq!(snapshot.get("bmp280_pressure"), Some(&StatusValue::Number(1013.26)));
        assert_eq!(snapshot.get("device_status"), Some(&StatusValue::Text("rebooting".into())));
    }

    #[tokio::test]
    async fn failing_probe_is_left_out() {
        let sink = Arc::new(MockSink::new());
        sink.fail_query("mq135", "ppm", "boom");
        sink.answer("dht11", "humidity", point(PointValue::Number(55.0), 1));

        let snapshot = aggregator(sink, Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        assert!(snapshot.get("mq135_ppm").is_none());
        assert_eq!(snapshot.get("dht11_humidity"), Some(&StatusValue::Number(55.0)));
    }

    #[tokio::test]
    async fn probes_query_latest_value_with_their_filters() {
        let sink = Arc::new(MockSink::new());

        aggregator(sink.clone(), Arc::new(MockBroker::new())).build_snapshot(NOW).await.unwrap();

        let queries = sink.queries.lock().unwrap();
        assert_eq!(queries.len(), default_probes().len());
        assert!(queries.iter().all(|q| q.aggregator == Aggregator::Last && q.range.is_none()));

        let status = queries.iter().find(|q| q.measurement == "device_status").unwrap();
        assert_eq!(status.field, "status");
        assert_eq!(status.filter, Some(TagFilter::eq("device_id", "esp32_02")));

        let gpio = queries.iter().find(|q| q.measurement == "gpio_state").unwrap();
        assert_eq!(gpio.filter, Some(TagFilter::eq("pin", "gpio2")));

        let ldr = queries.iter().find(|q| q.measurement == "ldr").unwrap();
        assert_eq!(ldr.filter, None);
    }

    #[tokio::test]
    async fn publishes_exactly_one_message() {
        let sink = Arc::new(MockSink::new());
        sink.answer("dht11", "temperature", point(PointValue::Number(20.0), 1));
        sink.answer("dht11", "humidity", point(PointValue::Number(40.0), 1));
        let broker = Arc::new(MockBroker::new());

        aggregator(sink, broker.clone()).publish().await.unwrap();

        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "dashboard/status");
        let json: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert!(json.get("last_update").is_some());
    }
}
