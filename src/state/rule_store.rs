use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::path::PathBuf;
use tracing::{info, warn};
use crate::domain::StoredRule;
use crate::ports::RuleStore;

/// Decode a stored rule document. Entries that no longer decode are logged and
/// kept in raw form, so one bad rule neither blocks the others nor gets lost on save.
pub fn decode_rules(document: serde_json::Value) -> anyhow::Result<Vec<StoredRule>> {
    let serde_json::Value::Array(entries) = document else {
        anyhow::bail!("rule document is not a JSON array");
    };

    let mut rules = Vec::with_capacity(entries.len());
    for entry in entries {
        match StoredRule::decode(entry) {
            Ok(rule) => rules.push(rule),
            Err((e, raw)) => {
                let stored = StoredRule::Undecodable(raw);
                warn!(rule_id = stored.id().unwrap_or("<no id>"), "Stored rule does not decode: {}", e);
                rules.push(stored);
            }
        }
    }
    Ok(rules)
}

/// Rule list stored as one JSONB document in PostgreSQL.
pub struct PgRuleStore {
    pool: PgPool,
    document: String,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, document: "default".to_string() }
    }

    /// Create the backing table if needed.
    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rule_documents (
                name TEXT PRIMARY KEY,
                rules JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("Rule document table ready");
        Ok(())
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn load(&self) -> anyhow::Result<Vec<StoredRule>> {
        let row = sqlx::query("SELECT rules FROM rule_documents WHERE name = $1")
            .bind(&self.document)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => decode_rules(row.try_get("rules")?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, rules: &[StoredRule]) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_documents (name, rules, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (name) DO UPDATE
            SET rules = EXCLUDED.rules,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.document)
        .bind(serde_json::to_value(rules)?)
        .execute(&self.pool)
        .await?;

        info!("Saved {} rules", rules.len());
        Ok(())
    }
}

/// Rule list stored as a JSON file. A missing file is an empty list.
pub struct JsonFileRuleStore {
    path: PathBuf,
}

impl JsonFileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleStore for JsonFileRuleStore {
    async fn load(&self) -> anyhow::Result<Vec<StoredRule>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let document = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        decode_rules(document)
    }

    async fn save(&self, rules: &[StoredRule]) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(rules)?;
        // Readers never see a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
