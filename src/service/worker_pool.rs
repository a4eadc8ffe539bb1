use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{error, info};
use crate::service::ingest::IngestPipeline;

#[derive(Debug)]
pub struct RawIngestMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Runs ingestion off the MQTT event loop so slow sink writes never stall polling.
pub struct WorkerPool {
    pipeline: Arc<IngestPipeline>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<IngestPipeline>, concurrency: usize) -> Self {
        Self { pipeline, concurrency: concurrency.max(1) }
    }

    /// Consume until the sender side closes, then wait for in-flight writes.
    pub async fn run(self, mut receiver: Receiver<RawIngestMessage>) {
        info!("WorkerPool starting with {} workers", self.concurrency);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let active_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        while let Some(msg) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("Semaphore closed");
                    break;
                }
            };

            let pipeline = self.pipeline.clone();
            let active_count = active_count.clone();

            tokio::spawn(async move {
                let _permit = permit; // Hold permit until task completion

                let current = active_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                metrics::gauge!("worker_active_count", current as f64);
                let start = std::time::Instant::now();

                pipeline.handle(&msg.topic, &msg.payload).await;

                metrics::histogram!("worker_processing_duration_seconds", start.elapsed().as_secs_f64());
                let remaining = active_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) - 1;
                metrics::gauge!("worker_active_count", remaining as f64);
            });
        }

        // Every permit back means every spawned write has finished.
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("WorkerPool shutting down");
    }
}
