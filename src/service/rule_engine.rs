use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{Aggregator, PointValue, Rule, SeriesQuery, StoredRule};
use crate::error::GatewayError;
use crate::ports::{MessageBroker, RuleStore, TimeSeriesSink};
use crate::service::normalizer::GPIO_STATE_MEASUREMENT;

/// Evaluates every stored rule against the time-series store and publishes the
/// action of each rule whose condition holds. Holds no state between cycles.
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    sink: Arc<dyn TimeSeriesSink>,
    broker: Arc<dyn MessageBroker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub evaluated: usize,
    pub fired: usize,
    /// Rules whose query returned no data.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Fired,
    Held,
    NoData,
}

/// Discrete state must reflect its current value, never an average.
pub fn aggregator_for(rule: &Rule) -> Aggregator {
    if rule.spec.measurement == GPIO_STATE_MEASUREMENT {
        Aggregator::Last
    } else {
        Aggregator::Mean
    }
}

/// Numeric view of a queried value; switch states compare as `ON` = 1, `OFF` = 0.
fn comparable(value: &PointValue) -> Option<f64> {
    match value {
        PointValue::Number(v) => Some(*v),
        PointValue::Text(s) if s.eq_ignore_ascii_case("ON") => Some(1.0),
        PointValue::Text(s) if s.eq_ignore_ascii_case("OFF") => Some(0.0),
        PointValue::Text(_) => None,
    }
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>, sink: Arc<dyn TimeSeriesSink>, broker: Arc<dyn MessageBroker>) -> Self {
        Self { store, sink, broker }
    }

    /// One evaluation pass. Rule failures are logged and counted, never propagated;
    /// only a failure to load the rule list fails the cycle.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let start = std::time::Instant::now();
        let entries = self.store.load().await?;
        let mut report = CycleReport::default();

        for rule in entries.iter().filter_map(StoredRule::as_rule) {
            report.evaluated += 1;
            metrics::counter!("rules_evaluated_total", 1);

            match self.evaluate(rule).await {
                Ok(Outcome::Fired) => report.fired += 1,
                Ok(Outcome::Held) => {}
                Ok(Outcome::NoData) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(rule_id = %rule.id, rule_name = %rule.spec.name, "Rule evaluation failed: {:?}", e);
                    metrics::counter!("rule_failures_total", 1, "rule_id" => rule.id.clone());
                }
            }
        }

        metrics::histogram!("rule_cycle_duration_seconds", start.elapsed().as_secs_f64());
        if report.failed > 0 {
            warn!(?report, "Rule cycle finished with failures");
        } else {
            debug!(?report, "Rule cycle finished");
        }
        Ok(report)
    }

    async fn evaluate(&self, rule: &Rule) -> anyhow::Result<Outcome> {
        let spec = &rule.spec;
        let query = SeriesQuery {
            aggregator: aggregator_for(rule),
            measurement: spec.measurement.clone(),
            field: spec.field.clone(),
            range: Some(spec.range.clone()),
            filter: spec.filter.clone(),
        };

        let Some(point) = self.sink.query(&query).await? else {
            debug!(rule_id = %rule.id, "No data for rule, skipping");
            return Ok(Outcome::NoData);
        };

        let value = comparable(&point.value).ok_or_else(|| GatewayError::NonNumericValue {
            measurement: spec.measurement.clone(),
            field: spec.field.clone(),
        })?;

        if !spec.operator.evaluate(value, spec.threshold) {
            return Ok(Outcome::Held);
        }

        self.broker
            .publish(&spec.action_topic, spec.action_payload.clone().into_bytes())
            .await?;
        info!(
            rule_id = %rule.id,
            "Rule '{}' fired: {}({}.{}) = {} {} {} -> {}",
            spec.name,
            query.aggregator.function(),
            spec.measurement,
            spec.field,
            value,
            spec.operator.symbol(),
            spec.threshold,
            spec.action_topic
        );
        metrics::counter!("rules_fired_total", 1, "rule_id" => rule.id.clone());
        Ok(Outcome::Fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewRule, Operator, QueryPoint, RangeExpr, TagFilter};
    use crate::service::test_support::{MemoryRuleStore, MockBroker, MockSink};
    use time::OffsetDateTime;

    fn rule(id: &str, measurement: &str, field: &str, operator: Operator, threshold: f64, topic: &str) -> Rule {
        NewRule {
            name: format!("rule {id}"),
            measurement: measurement.into(),
            field: field.into(),
            range: RangeExpr::parse("5m").unwrap(),
            filter: None,
            operator,
            threshold,
            action_topic: topic.into(),
            action_payload: "ON".into(),
        }
        .with_id(id.into())
    }

    fn number(v: f64) -> QueryPoint {
        QueryPoint { value: PointValue::Number(v), timestamp: OffsetDateTime::now_utc() }
    }

    fn engine(rules: Vec<Rule>, sink: Arc<MockSink>, broker: Arc<MockBroker>) -> RuleEngine {
        RuleEngine::new(Arc::new(MemoryRuleStore::with_rules(rules)), sink, broker)
    }

    #[tokio::test]
    async fn fires_when_threshold_exceeded() {
        let sink = Arc::new(MockSink::new());
        sink.answer("dht11", "temperature", number(31.0));
        let broker = Arc::new(MockBroker::new());
        let rules = vec![rule("r1", "dht11", "temperature", Operator::GreaterThan, 30.0, "esp32_02/gpio/2/set")];

        let report = engine(rules, sink.clone(), broker.clone()).run_cycle().await.unwrap();

        assert_eq!(report, CycleReport { evaluated: 1, fired: 1, skipped: 0, failed: 0 });
        let published = broker.published.lock().unwrap();
        assert_eq!(published[0], ("esp32_02/gpio/2/set".to_string(), b"ON".to_vec()));
        assert_eq!(sink.aggregators_for("dht11"), vec![Aggregator::Mean]);
    }

    #[tokio::test]
    async fn gpio_state_rules_use_last_never_mean() {
        let sink = Arc::new(MockSink::new());
        let broker = Arc::new(MockBroker::new());
        let rules = vec![
            rule("r1", GPIO_STATE_MEASUREMENT, "state", Operator::Equal, 1.0, "t"),
            rule("r2", "mq135", "ppm", Operator::GreaterThan, 1000.0, "t"),
        ];

        engine(rules, sink.clone(), broker).run_cycle().await.unwrap();

        assert_eq!(sink.aggregators_for(GPIO_STATE_MEASUREMENT), vec![Aggregator::Last]);
        assert_eq!(sink.aggregators_for("mq135"), vec![Aggregator::Mean]);
    }

    #[tokio::test]
    async fn equality_fires_once_per_cycle_while_it_holds() {
        let sink = Arc::new(MockSink::new());
        sink.answer("ldr", "ldr_raw", number(512.0));
        let broker = Arc::new(MockBroker::new());
        let engine = engine(
            vec![rule("r1", "ldr", "ldr_raw", Operator::Equal, 512.0, "lamp/set")],
            sink,
            broker.clone(),
        );

        for cycle in 1..=3 {
            let report = engine.run_cycle().await.unwrap();
            assert_eq!(report.fired, 1);
            assert_eq!(broker.topics().len(), cycle);
        }
    }

    #[tokio::test]
    async fn switch_state_compares_as_one_or_zero() {
        let sink = Arc::new(MockSink::new());
        sink.answer(GPIO_STATE_MEASUREMENT, "state", QueryPoint {
            value: PointValue::Text("ON".into()),
            timestamp: OffsetDateTime::now_utc(),
        });
        let broker = Arc::new(MockBroker::new());
        let rules = vec![rule("r1", GPIO_STATE_MEASUREMENT, "state", Operator::Equal, 1.0, "esp32_02/gpio/4/set")];

        let report = engine(rules, sink, broker.clone()).run_cycle().await.unwrap();

        assert_eq!(report.fired, 1);
        assert_eq!(broker.topics(), vec!["esp32_02/gpio/4/set".to_string()]);
    }

    #[tokio::test]
    async fn missing_data_is_skipped_silently() {
        let sink = Arc::new(MockSink::new());
        let broker = Arc::new(MockBroker::new());
        let rules = vec![rule("r1", "bmp280", "pressure", Operator::LessThan, 900.0, "t")];

        let report = engine(rules, sink, broker.clone()).run_cycle().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn failing_rule_does_not_stop_the_others() {
        let sink = Arc::new(MockSink::new());
        sink.fail_query("dht11", "temperature", "timeout");
        sink.answer("device_status", "status", QueryPoint {
            value: PointValue::Text("online".into()),
            timestamp: OffsetDateTime::now_utc(),
        });
        sink.answer("mq135", "ppm", number(1500.0));
        let broker = Arc::new(MockBroker::new());
        let rules = vec![
            rule("r1", "dht11", "temperature", Operator::GreaterThan, 30.0, "a"),
            rule("r2", "device_status", "status", Operator::Equal, 1.0, "b"),
            rule("r3", "mq135", "ppm", Operator::GreaterThan, 1000.0, "c"),
        ];

        let report = engine(rules, sink, broker.clone()).run_cycle().await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.fired, 1);
        assert_eq!(broker.topics(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn condition_not_met_publishes_nothing() {
        let sink = Arc::new(MockSink::new());
        sink.answer("dht11", "humidity", number(40.0));
        let broker = Arc::new(MockBroker::new());
        let rules = vec![rule("r1", "dht11", "humidity", Operator::GreaterThan, 80.0, "t")];

        let report = engine(rules, sink, broker.clone()).run_cycle().await.unwrap();

        assert_eq!(report, CycleReport { evaluated: 1, ..Default::default() });
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn query_carries_rule_range_and_filter() {
        let sink = Arc::new(MockSink::new());
        let broker = Arc::new(MockBroker::new());
        let mut filtered = rule("r1", "dht11", "temperature", Operator::GreaterThan, 30.0, "t");
        filtered.spec.filter = Some(TagFilter::eq("device_id", "esp32_01"));

        engine(vec![filtered], sink.clone(), broker).run_cycle().await.unwrap();

        let queries = sink.queries.lock().unwrap();
        assert_eq!(
            *queries,
            vec![SeriesQuery {
                aggregator: Aggregator::Mean,
                measurement: "dht11".into(),
                field: "temperature".into(),
                range: Some(RangeExpr::parse("5m").unwrap()),
                filter: Some(TagFilter::eq("device_id", "esp32_01")),
            }]
        );
    }

    #[tokio::test]
    async fn undecodable_entries_are_not_evaluated() {
        let sink = Arc::new(MockSink::new());
        sink.answer("mq135", "ppm", number(1500.0));
        let broker = Arc::new(MockBroker::new());
        let store = MemoryRuleStore::with_entries(vec![
            StoredRule::Undecodable(serde_json::json!({"id": "legacy", "range": "30min"})),
            rule("r1", "mq135", "ppm", Operator::GreaterThan, 1000.0, "fan/set").into(),
        ]);

        let report = RuleEngine::new(Arc::new(store), sink, broker.clone()).run_cycle().await.unwrap();

        assert_eq!(report, CycleReport { evaluated: 1, fired: 1, skipped: 0, failed: 0 });
        assert_eq!(broker.topics(), vec!["fan/set".to_string()]);
    }

    #[tokio::test]
    async fn store_failure_fails_the_cycle() {
        let engine = RuleEngine::new(
            Arc::new(MemoryRuleStore::failing()),
            Arc::new(MockSink::new()),
            Arc::new(MockBroker::new()),
        );
        assert!(engine.run_cycle().await.is_err());
    }
}
