use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::Context;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub enum RuleBackend {
    Postgres { url: String },
    File { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Local broker carrying device telemetry.
    pub local_broker: BrokerConfig,
    /// Topic filters subscribed on the local broker, wildcards allowed.
    pub ingest_topics: Vec<String>,
    /// Remote broker carrying the control channel, dashboard and rule actions.
    pub remote_broker: BrokerConfig,
    pub influx: InfluxConfig,
    pub rules: RuleBackend,
    pub rules_manage_topic: String,
    pub rules_list_topic: String,
    pub dashboard_status_topic: String,
    pub rule_interval: Duration,
    pub status_interval: Duration,
    pub offline_timeout: Duration,
    pub ingest_workers: usize,
    pub metrics_listen: SocketAddr,
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{key} has an invalid value `{raw}`")),
        None => Ok(default),
    }
}

fn flag(key: &str, default: bool) -> anyhow::Result<bool> {
    match optional(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => anyhow::bail!("{key} must be a boolean, got `{v}`"),
    }
}

/// Parse the `MQTT_TOPICS_JSON` list, e.g. `["esp32_01/#", "esp32_02/#"]`.
pub fn parse_topics(raw: &str) -> anyhow::Result<Vec<String>> {
    let topics: Vec<String> = serde_json::from_str(raw).context("MQTT_TOPICS_JSON must be a JSON array of strings")?;
    Ok(topics.into_iter().filter(|t| !t.trim().is_empty()).collect())
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not

        // Network profile picks which host variables apply, e.g. HOME_MQTT_BROKER_HOST.
        let profile = optional("ACTIVE_NETWORK").unwrap_or_else(|| "HOME".to_string()).to_uppercase();
        let instance_id = optional("INSTANCE_ID").unwrap_or_else(|| "1".to_string());
        let client_id_prefix = optional("MQTT_CLIENT_ID_PREFIX").unwrap_or_else(|| "telemetry_gateway".to_string());

        let local_broker = BrokerConfig {
            host: optional(&format!("{profile}_MQTT_BROKER_HOST"))
                .with_context(|| format!("{profile}_MQTT_BROKER_HOST must be set"))?,
            port: parsed("MQTT_BROKER_PORT", 1883)?,
            username: optional("MQTT_USERNAME"),
            password: optional("MQTT_PASSWORD"),
            client_id: format!("{client_id_prefix}_local_{instance_id}"),
            tls: false,
        };

        let remote_broker = BrokerConfig {
            host: optional("REMOTE_MQTT_HOST").context("REMOTE_MQTT_HOST must be set")?,
            port: parsed("REMOTE_MQTT_PORT", 8883)?,
            username: optional("REMOTE_MQTT_USERNAME"),
            password: optional("REMOTE_MQTT_PASSWORD"),
            client_id: format!("{client_id_prefix}_remote_{instance_id}"),
            tls: flag("REMOTE_MQTT_TLS", true)?,
        };

        let influx = InfluxConfig {
            host: optional(&format!("{profile}_INFLUXDB_HOST"))
                .with_context(|| format!("{profile}_INFLUXDB_HOST must be set"))?,
            port: parsed("INFLUXDB_PORT", 8086)?,
            username: optional("INFLUXDB_USERNAME"),
            password: optional("INFLUXDB_PASSWORD"),
            database: optional("INFLUXDB_DATABASE").unwrap_or_else(|| "esp32_dados".to_string()),
        };

        let rules = match optional("RULES_DATABASE_URL") {
            Some(url) => RuleBackend::Postgres { url },
            None => RuleBackend::File {
                path: optional("RULES_FILE").unwrap_or_else(|| "rules.json".to_string()).into(),
            },
        };

        let rule_secs: u64 = parsed("RULE_INTERVAL_SECS", 15)?;
        let status_secs: u64 = parsed("STATUS_INTERVAL_SECS", rule_secs)?;
        if rule_secs == 0 || status_secs == 0 {
            anyhow::bail!("RULE_INTERVAL_SECS and STATUS_INTERVAL_SECS must be positive");
        }

        let config = AppConfig {
            local_broker,
            ingest_topics: parse_topics(&optional("MQTT_TOPICS_JSON").unwrap_or_else(|| "[]".to_string()))?,
            remote_broker,
            influx,
            rules,
            rules_manage_topic: optional("RULES_MANAGE_TOPIC").unwrap_or_else(|| "rules/manage".to_string()),
            rules_list_topic: optional("RULES_LIST_TOPIC").unwrap_or_else(|| "rules/list".to_string()),
            dashboard_status_topic: optional("DASHBOARD_STATUS_TOPIC")
                .unwrap_or_else(|| "dashboard/status".to_string()),
            rule_interval: Duration::from_secs(rule_secs),
            status_interval: Duration::from_secs(status_secs),
            offline_timeout: Duration::from_secs(parsed("OFFLINE_TIMEOUT_SECS", 60)?),
            ingest_workers: parsed("INGEST_WORKERS", 4)?,
            metrics_listen: parsed("METRICS_LISTEN", SocketAddr::from(([0, 0, 0, 0], 9000)))?,
        };

        Ok(config)
    }
}
