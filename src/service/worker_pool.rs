use crate::domain::Measurement;
use crate::service::coordinator::IngestionCoordinator;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

/// Device-sharded ingestion workers.
///
/// Every device hashes to one shard and each shard drains its queue in
/// order, so a device's measurements are processed in bridge arrival order
/// while different devices run concurrently.
pub struct WorkerPool {
    shards: Vec<Sender<Measurement>>,
}

impl WorkerPool {
    pub fn spawn(coordinator: Arc<IngestionCoordinator>, concurrency: usize, queue_capacity: usize) -> (Self, Vec<JoinHandle<()>>) {
        let concurrency = concurrency.max(1);
        let per_shard = (queue_capacity / concurrency).max(1);
        info!("WorkerPool starting with {} workers ({} queued per worker)", concurrency, per_shard);

        let mut shards = Vec::with_capacity(concurrency);
        let mut handles = Vec::with_capacity(concurrency);
        for shard in 0..concurrency {
            let (tx, rx) = mpsc::channel(per_shard);
            shards.push(tx);
            let coordinator = coordinator.clone();
            let span = tracing::info_span!("ingest_worker", shard);
            handles.push(tokio::spawn(run_worker(rx, coordinator).instrument(span)));
        }

        (Self { shards }, handles)
    }

    /// Queue a measurement without waiting. Returns false if it was dropped.
    pub fn submit(&self, measurement: Measurement) -> bool {
        let shard = self.shard_for(&measurement.device_id);
        match self.shards[shard].try_send(measurement) {
            Ok(()) => true,
            Err(TrySendError::Full(m)) => {
                warn!(device_id = %m.device_id, shard, "Ingest queue full, dropping measurement");
                metrics::counter!("ingest_dropped_total", 1, "reason" => "queue_full");
                false
            }
            Err(TrySendError::Closed(m)) => {
                warn!(device_id = %m.device_id, shard, "Ingest worker stopped, dropping measurement");
                metrics::counter!("ingest_dropped_total", 1, "reason" => "closed");
                false
            }
        }
    }

    fn shard_for(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

async fn run_worker(mut receiver: Receiver<Measurement>, coordinator: Arc<IngestionCoordinator>) {
    while let Some(measurement) = receiver.recv().await {
        let start = std::time::Instant::now();
        coordinator.on_measurement(measurement).await;
        metrics::histogram!("ingest_processing_duration_seconds", start.elapsed().as_secs_f64());
    }
    info!("Ingest worker shutting down");
}
