pub mod rule_store;

pub use rule_store::{JsonFileRuleStore, PgRuleStore};
