//! Background usage write queue
//!
//! The request path calls `submit`, which never blocks: records go into a
//! bounded channel, and a worker batches them into `UsageMeter::record_batch`
//! on size or interval. A full queue drops the record with a warning and a
//! `gateway_usage_dropped_total` increment. `shutdown` stops intake and
//! drains whatever is still queued.

use std::sync::Arc;
use std::time::Duration;

use store::UsageRecord;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::meter::{BATCH_SIZE, UsageMeter};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: BATCH_SIZE,
            flush_interval: Duration::from_millis(500),
        }
    }
}

pub struct UsageWriter {
    tx: mpsc::Sender<UsageRecord>,
    capacity: usize,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UsageWriter {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(meter: Arc<UsageMeter>, config: WriterConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(worker(
            meter,
            rx,
            shutdown_rx,
            config.batch_size.max(1),
            config.flush_interval,
        ));

        Self {
            tx,
            capacity,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a record without waiting. Returns whether it was accepted.
    pub fn submit(&self, record: UsageRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                metrics::counter!("gateway_usage_dropped_total").increment(1);
                warn!(request_id = %record.request_id, "usage queue full, dropping record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                metrics::counter!("gateway_usage_dropped_total").increment(1);
                warn!(request_id = %record.request_id, "usage writer stopped, dropping record");
                false
            }
        }
    }

    /// Records waiting in the queue.
    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting records, flush everything queued, and wait for the
    /// worker to exit. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "usage writer task failed");
        }
    }
}

async fn worker(
    meter: Arc<UsageMeter>,
    mut rx: mpsc::Receiver<UsageRecord>,
    mut shutdown_rx: oneshot::Receiver<()>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(record) = rx.recv() => {
                buffer.push(record);
                if buffer.len() >= batch_size {
                    flush(&meter, &mut buffer).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&meter, &mut buffer).await;
                }
            }
            _ = &mut shutdown_rx => {
                rx.close();
                while let Some(record) = rx.recv().await {
                    buffer.push(record);
                }
                let drained = buffer.len();
                flush(&meter, &mut buffer).await;
                info!(drained, "usage writer drained");
                break;
            }
            else => {
                flush(&meter, &mut buffer).await;
                break;
            }
        }
    }
}

async fn flush(meter: &UsageMeter, buffer: &mut Vec<UsageRecord>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    match meter.record_batch(batch).await {
        Ok(inserted) => debug!(count, inserted, "flushed usage records"),
        Err(e) => warn!(count, error = %e, "failed to persist usage records"),
    }
}
