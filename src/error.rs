use thiserror::Error;

/// Errors raised while decoding rule definitions or talking to the time-series store.
///
/// Service-level code wraps these in `anyhow::Error`; the variants exist so
/// callers and tests can tell a bad rule apart from a store failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid range expression `{0}` (expected e.g. 30s, 5m, 1h)")]
    InvalidRange(String),

    #[error("invalid tag filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: &'static str },

    #[error("field `{field}` of `{measurement}` is not numeric")]
    NonNumericValue { measurement: String, field: String },

    #[error("influxdb error: {0}")]
    Influx(String),

    #[error("malformed influxdb response: {0}")]
    MalformedResponse(String),
}
