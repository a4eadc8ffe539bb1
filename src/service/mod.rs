pub mod control;
pub mod gateway;
pub mod ingest;
pub mod normalizer;
pub mod rule_engine;
pub mod status;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_support;
