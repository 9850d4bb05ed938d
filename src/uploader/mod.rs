//! # Batched Uploader
//!
//! Collects telemetry items and ships them to the aggregator in batches.
//!
//! This module handles:
//! - Non-blocking `add_item` from producers
//! - A periodic flush loop that sends one `batch_upload` packet per tick
//! - Retrying failed batches (every member's `retry_count` goes up by one,
//!   members whose count exceeds [`MAX_RETRY`] are dropped and counted)
//! - Keeping batches the sink refuses outright (`should_retry == false`)
//!   without spending their retries
//! - Spooling unsent items to disk on `stop()` and reloading them on `start()`
//!
//! The dequeue/send/requeue sequence is one critical section, serialized by
//! an async mutex, so a failed batch goes back to the head of the queue ahead
//! of anything added while it was in flight.

pub mod spool;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use spool::Spool;

use crate::codec::Codec;
use crate::config::UploaderConfig;
use crate::error::{Result, UploadError};
use crate::protocol::packet::TYPE_BATCH_UPLOAD;
use crate::protocol::{now_millis, BatchData, RawPacket};
use crate::transport::{ReconnectableClient, SendResult};

/// Retries an item gets after its first failed send
pub const MAX_RETRY: u32 = 3;

/// Pause between batches in [`BatchUploader::force_flush_all`]
pub const FORCE_FLUSH_PAUSE: Duration = Duration::from_millis(100);

/// One queued telemetry item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    pub payload: Value,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploaderStats {
    pub uploaded: u64,
    pub failed_batches: u64,
    pub dropped: u64,
    pub pending: usize,
}

/// Outcome of [`BatchUploader::force_flush_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
}

/// Where batches go
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Deliver one encoded batch message
    async fn send_batch(&self, text: String) -> SendResult;
}

#[async_trait]
impl BatchSink for ReconnectableClient {
    fn is_connected(&self) -> bool {
        ReconnectableClient::is_connected(self)
    }

    async fn send_batch(&self, text: String) -> SendResult {
        self.try_send(text).await
    }
}

struct FlushTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

struct UploaderInner {
    device_id: String,
    config: UploaderConfig,
    codec: Codec,
    sink: Arc<dyn BatchSink>,
    spool: Spool,
    queue: Mutex<VecDeque<OutboundItem>>,
    flush_lock: tokio::sync::Mutex<()>,
    stats: Mutex<UploaderStats>,
    task: Mutex<Option<FlushTask>>,
}

impl UploaderInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<OutboundItem>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, UploaderStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task(&self) -> MutexGuard<'_, Option<FlushTask>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Batching uploader. Cheap to clone.
#[derive(Clone)]
pub struct BatchUploader {
    inner: Arc<UploaderInner>,
}

impl std::fmt::Debug for BatchUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUploader")
            .field("device_id", &self.inner.device_id)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl BatchUploader {
    /// Create an uploader
    ///
    /// # Arguments
    ///
    /// * `device_id` - Stamped on every batch packet
    /// * `config` - Uploader section of the configuration
    /// * `codec` - Applied to every batch before it is sent
    /// * `sink` - Usually the [`ReconnectableClient`]
    pub fn new(device_id: String, config: UploaderConfig, codec: Codec, sink: Arc<dyn BatchSink>) -> Self {
        let spool = Spool::new(&config.spool_path);
        Self {
            inner: Arc::new(UploaderInner {
                device_id,
                config,
                codec,
                sink,
                spool,
                queue: Mutex::new(VecDeque::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                stats: Mutex::new(UploaderStats::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Queue an item. Never blocks and never fails.
    pub fn add_item(&self, kind: impl Into<String>, payload: Value) {
        let item = OutboundItem {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: now_millis(),
            payload,
            retry_count: 0,
        };
        self.inner.queue().push_back(item);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn stats(&self) -> UploaderStats {
        let mut stats = *self.inner.stats();
        stats.pending = self.pending_count();
        stats
    }

    /// Snapshot of the queue, oldest first
    pub fn pending_items(&self) -> Vec<OutboundItem> {
        self.inner.queue().iter().cloned().collect()
    }

    /// Reload the spool and start the periodic flush loop
    ///
    /// Calling `start()` on a running uploader does nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the spool exists but cannot be read or removed
    pub fn start(&self) -> Result<()> {
        let mut task = self.inner.task();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }

        let restored = self.inner.spool.load()?;
        if !restored.is_empty() {
            let mut queue = self.inner.queue();
            for item in restored.into_iter().rev() {
                queue.push_front(item);
            }
            info!("Restored {} item(s) from spool", queue.len());
        }
        self.inner.spool.remove()?;

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(flush_loop(self.clone(), stop_rx));
        *task = Some(FlushTask { handle, stop });
        Ok(())
    }

    /// Stop the flush loop and spool whatever is still queued
    ///
    /// Waits for an in-flight batch to settle first. After a successful
    /// return the queue is empty and every pending item is in the spool.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Spool` if the spool cannot be written; the
    /// items stay queued in that case
    pub async fn stop(&self) -> Result<()> {
        let task = self.inner.task().take();
        if let Some(FlushTask { handle, stop }) = task {
            let _ = stop.send(true);
            let _ = handle.await;
        }

        let _flushing = self.inner.flush_lock.lock().await;
        let items: Vec<OutboundItem> = self.inner.queue().iter().cloned().collect();
        self.inner.spool.save(&items)?;
        self.inner.queue().clear();
        info!("Uploader stopped with {} item(s) spooled", items.len());
        Ok(())
    }

    /// Send one batch of up to `max_batch_size` items
    ///
    /// # Returns
    ///
    /// * `Ok(n)` - `n` items were uploaded (0 if the queue was empty)
    ///
    /// # Errors
    ///
    /// Returns `UploadError::BatchFailed` if the batch could not be
    /// delivered and `UploadError::GaveUp` if the sink refused it for good.
    /// Either way its items are back at the head of the queue; only
    /// `BatchFailed` costs them a retry.
    pub async fn flush_once(&self) -> std::result::Result<usize, UploadError> {
        let _flushing = self.inner.flush_lock.lock().await;

        let batch: Vec<OutboundItem> = {
            let mut queue = self.inner.queue();
            let n = queue.len().min(self.inner.config.max_batch_size);
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        let result = match self.encode_batch(&batch) {
            Ok(text) => self.inner.sink.send_batch(text).await,
            Err(e) => {
                warn!("Failed to encode batch: {}", e);
                SendResult::GIVE_UP
            }
        };

        if result.ok {
            self.inner.stats().uploaded += count as u64;
            debug!("Uploaded batch of {} item(s)", count);
            return Ok(count);
        }

        if !result.should_retry {
            warn!("Sink gave up on batch of {} item(s), keeping them queued", count);
            self.requeue_kept(batch);
            return Err(UploadError::GaveUp(count));
        }

        self.requeue_failed(batch);
        Err(UploadError::BatchFailed(count))
    }

    /// Flush batches until the queue is empty, a batch fails or the sink
    /// goes offline. Nothing is attempted while offline.
    pub async fn force_flush_all(&self) -> UploadReport {
        let mut report = UploadReport::default();

        loop {
            if !self.inner.sink.is_connected() {
                debug!("Sink offline, forced flush leaves {} item(s) queued", self.pending_count());
                break;
            }

            match self.flush_once().await {
                Ok(0) => break,
                Ok(n) => report.uploaded_count += n,
                Err(UploadError::BatchFailed(n)) | Err(UploadError::GaveUp(n)) => {
                    report.failed_count = n;
                    break;
                }
                Err(e) => {
                    warn!("Forced flush stopped: {}", e);
                    break;
                }
            }

            if self.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(FORCE_FLUSH_PAUSE).await;
        }

        report.pending_count = self.pending_count();
        info!(
            "Forced flush: {} uploaded, {} failed, {} pending",
            report.uploaded_count, report.failed_count, report.pending_count
        );
        report
    }

    fn encode_batch(&self, batch: &[OutboundItem]) -> Result<String> {
        let items = batch
            .iter()
            .map(|item| RawPacket {
                kind: item.kind.clone(),
                timestamp: item.timestamp,
                device_id: self.inner.device_id.clone(),
                data: item.payload.clone(),
            })
            .collect::<Vec<_>>();

        let packet = RawPacket {
            kind: TYPE_BATCH_UPLOAD.to_string(),
            timestamp: now_millis(),
            device_id: self.inner.device_id.clone(),
            data: serde_json::to_value(BatchData { count: items.len(), items })?,
        };
        let json = serde_json::to_string(&packet)?;

        if self.inner.codec.is_passthrough() {
            Ok(json)
        } else {
            self.inner.codec.encode_envelope(json.as_bytes())
        }
    }

    /// Put a refused batch back at the head, in order, retries untouched
    fn requeue_kept(&self, batch: Vec<OutboundItem>) {
        let mut queue = self.inner.queue();
        for item in batch.into_iter().rev() {
            queue.push_front(item);
        }
        drop(queue);
        self.inner.stats().failed_batches += 1;
    }

    /// Put a failed batch back at the head, in order, one retry older
    fn requeue_failed(&self, batch: Vec<OutboundItem>) {
        let mut dropped = 0u64;
        let mut queue = self.inner.queue();

        for mut item in batch.into_iter().rev() {
            item.retry_count += 1;
            if item.retry_count > MAX_RETRY {
                dropped += 1;
                continue;
            }
            queue.push_front(item);
        }
        drop(queue);

        let mut stats = self.inner.stats();
        stats.failed_batches += 1;
        stats.dropped += dropped;
        if dropped > 0 {
            warn!("Dropped {} item(s) after {} retries", dropped, MAX_RETRY);
        }
    }
}

async fn flush_loop(uploader: BatchUploader, mut stop: watch::Receiver<bool>) {
    let period = uploader.inner.config.upload_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if uploader.inner.sink.is_connected() && uploader.pending_count() > 0 {
                    if let Err(e) = uploader.flush_once().await {
                        debug!("Batch upload failed, will retry: {}", e);
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
}
