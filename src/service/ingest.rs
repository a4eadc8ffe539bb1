use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::ports::TimeSeriesSink;
use crate::service::normalizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Written,
    /// Unrecognized topic or unusable payload.
    Dropped,
    WriteFailed,
}

/// Normalizes one inbound telemetry message and appends it to the sink.
pub struct IngestPipeline {
    sink: Arc<dyn TimeSeriesSink>,
}

impl IngestPipeline {
    pub fn new(sink: Arc<dyn TimeSeriesSink>) -> Self {
        Self { sink }
    }

    #[instrument(skip(self, payload), fields(topic = %topic, payload_len = payload.len()))]
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        metrics::counter!("messages_received_total", 1);

        let Some(record) = normalizer::normalize(topic, payload) else {
            debug!("Message dropped by normalizer");
            metrics::counter!("messages_dropped_total", 1);
            return IngestOutcome::Dropped;
        };

        match self.sink.write(&record).await {
            Ok(()) => {
                debug!(measurement = %record.measurement, "Record written");
                metrics::counter!("records_written_total", 1, "measurement" => record.measurement.clone());
                IngestOutcome::Written
            }
            Err(e) => {
                error!(measurement = %record.measurement, "Sink write failed: {:?}", e);
                metrics::counter!("sink_write_errors_total", 1);
                IngestOutcome::WriteFailed
            }
        }
    }
}
