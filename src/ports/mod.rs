use async_trait::async_trait;
use crate::domain::{QueryPoint, SeriesQuery, StoredRule, TimeSeriesRecord};

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Append a single point. Callers only pass writable records.
    async fn write(&self, record: &TimeSeriesRecord) -> anyhow::Result<()>;

    /// Run an aggregate query and return the most recent matching row, if any.
    async fn query(&self, query: &SeriesQuery) -> anyhow::Result<Option<QueryPoint>>;
}

/// Whole-document persistence of the rule list. No partial updates.
///
/// Entries that no longer decode come back as `StoredRule::Undecodable` and
/// must round-trip through `save` untouched.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Vec<StoredRule>>;

    async fn save(&self, rules: &[StoredRule]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish data to a specific topic.
    /// QoS 1 implied.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Publish a full-state document that late subscribers should still receive.
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.publish(topic, payload).await
    }
}
