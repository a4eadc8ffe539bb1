use serde::{Deserialize, Serialize};

use super::query::{optional_filter, RangeExpr, TagFilter};

/// Comparison applied between the aggregated value and the rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    /// Exact float equality, no tolerance band.
    #[serde(rename = "==")]
    Equal,
}

impl Operator {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::GreaterThan => value > threshold,
            Operator::LessThan => value < threshold,
            #[allow(clippy::float_cmp)]
            Operator::Equal => value == threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::GreaterThan => ">",
            Operator::LessThan => "<",
            Operator::Equal => "==",
        }
    }
}

/// Threshold automation rule. The `id` is assigned on creation and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(flatten)]
    pub spec: NewRule,
}

/// One entry of the stored rule document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StoredRule {
    Valid(Rule),
    /// Entry that no longer decodes. Written back unchanged on every save.
    Undecodable(serde_json::Value),
}

impl StoredRule {
    pub fn decode(entry: serde_json::Value) -> Result<Self, (serde_json::Error, serde_json::Value)> {
        match serde_json::from_value::<Rule>(entry.clone()) {
            Ok(rule) => Ok(StoredRule::Valid(rule)),
            Err(e) => Err((e, entry)),
        }
    }

    /// The entry's id, read from the raw document when it does not decode.
    pub fn id(&self) -> Option<&str> {
        match self {
            StoredRule::Valid(rule) => Some(&rule.id),
            StoredRule::Undecodable(raw) => raw.get("id").and_then(|v| v.as_str()),
        }
    }

    pub fn as_rule(&self) -> Option<&Rule> {
        match self {
            StoredRule::Valid(rule) => Some(rule),
            StoredRule::Undecodable(_) => None,
        }
    }
}

impl From<Rule> for StoredRule {
    fn from(rule: Rule) -> Self {
        StoredRule::Valid(rule)
    }
}

/// Rule body as submitted over the control channel, before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub measurement: String,
    pub field: String,
    pub range: RangeExpr,
    #[serde(
        default,
        deserialize_with = "optional_filter::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub filter: Option<TagFilter>,
    pub operator: Operator,
    pub threshold: f64,
    pub action_topic: String,
    pub action_payload: String,
}

impl NewRule {
    /// Rejects bodies that decode but could never be evaluated or acted on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.measurement.trim().is_empty() {
            anyhow::bail!("rule measurement is empty");
        }
        if self.field.trim().is_empty() {
            anyhow::bail!("rule field is empty");
        }
        if self.action_topic.trim().is_empty() {
            anyhow::bail!("rule action_topic is empty");
        }
        if !self.threshold.is_finite() {
            anyhow::bail!("rule threshold is not finite");
        }
        Ok(())
    }

    pub fn with_id(self, id: String) -> Rule {
        Rule { id, spec: self }
    }
}

/// Remote management command, one per control message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    AddRule { rule: NewRule },
    DeleteRule { rule_id: String },
    /// Republish the current list without changing it.
    GetList,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddRule { .. } => "add_rule",
            Command::DeleteRule { .. } => "delete_rule",
            Command::GetList => "get_list",
        }
    }
}
