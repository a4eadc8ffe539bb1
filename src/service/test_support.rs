//! In-memory port implementations shared by the service tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{Aggregator, QueryPoint, Rule, SeriesQuery, StoredRule, TimeSeriesRecord};
use crate::ports::{MessageBroker, RuleStore, TimeSeriesSink};

/// Sink that records writes and answers queries from a canned table keyed by
/// `(measurement, field)`. Entries set to `Err` simulate a failing query.
#[derive(Default)]
pub struct MockSink {
    pub written: Mutex<Vec<TimeSeriesRecord>>,
    pub queries: Mutex<Vec<SeriesQuery>>,
    answers: Mutex<HashMap<(String, String), Result<QueryPoint, String>>>,
    fail_writes: bool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes() -> Self {
        Self { fail_writes: true, ..Self::default() }
    }

    pub fn answer(&self, measurement: &str, field: &str, point: QueryPoint) {
        self.answers
            .lock()
            .unwrap()
            .insert((measurement.to_string(), field.to_string()), Ok(point));
    }

    pub fn fail_query(&self, measurement: &str, field: &str, error: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert((measurement.to_string(), field.to_string()), Err(error.to_string()));
    }

    pub fn aggregators_for(&self, measurement: &str) -> Vec<Aggregator> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.measurement == measurement)
            .map(|q| q.aggregator)
            .collect()
    }
}

#[async_trait]
impl TimeSeriesSink for MockSink {
    async fn write(&self, record: &TimeSeriesRecord) -> anyhow::Result<()> {
        if self.fail_writes {
            anyhow::bail!("sink unavailable");
        }
        self.written.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn query(&self, query: &SeriesQuery) -> anyhow::Result<Option<QueryPoint>> {
        self.queries.lock().unwrap().push(query.clone());
        let key = (query.measurement.clone(), query.field.clone());
        match self.answers.lock().unwrap().get(&key) {
            Some(Ok(point)) => Ok(Some(point.clone())),
            Some(Err(e)) => Err(anyhow::anyhow!(e.clone())),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryRuleStore {
    pub entries: Mutex<Vec<StoredRule>>,
    pub saves: Mutex<usize>,
    pub fail: bool,
}

impl MemoryRuleStore {
    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self::with_entries(rules.into_iter().map(StoredRule::from).collect())
    }

    pub fn with_entries(entries: Vec<StoredRule>) -> Self {
        Self { entries: Mutex::new(entries), ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn snapshot(&self) -> Vec<StoredRule> {
        self.entries.lock().unwrap().clone()
    }

    /// Decoded rules only.
    pub fn rules(&self) -> Vec<Rule> {
        self.snapshot().iter().filter_map(StoredRule::as_rule).cloned().collect()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load(&self) -> anyhow::Result<Vec<StoredRule>> {
        if self.fail {
            anyhow::bail!("store unavailable");
        }
        Ok(self.snapshot())
    }

    async fn save(&self, rules: &[StoredRule]) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("store unavailable");
        }
        *self.entries.lock().unwrap() = rules.to_vec();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockBroker {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub retained: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn last_retained_json(&self, topic: &str) -> Option<serde_json::Value> {
        self.retained
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.retained.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}
