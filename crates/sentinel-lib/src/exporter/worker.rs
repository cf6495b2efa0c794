//! Background flush worker
//!
//! A single task owns delivery, so at most one batch is in flight and
//! batches leave in queue order. It wakes on whichever comes first: the
//! queue reaching `batch_size`, `batch_interval` elapsing since the oldest
//! queued entry, or a retry timer after a failed delivery.

use super::queue::EventQueue;
use super::transport::BatchTransport;
use super::ExporterConfig;
use crate::backoff::ExponentialBackoff;
use crate::models::CapturedRequest;
use crate::observability::PipelineMetrics;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Used as the sleep target when nothing is queued
const IDLE_WAIT: Duration = Duration::from_secs(3_600);

/// State shared by the exporter handle and its worker
pub(crate) struct Shared {
    pub(crate) config: ExporterConfig,
    pub(crate) queue: Mutex<EventQueue>,
    pub(crate) notify: Notify,
    pub(crate) metrics: PipelineMetrics,
}

impl Shared {
    /// Poisoning only means another thread panicked mid-push; the queue
    /// itself is still consistent
    pub(crate) fn lock(&self) -> MutexGuard<'_, EventQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum FlushOutcome {
    Sent,
    Requeued,
    Dropped,
}

pub(crate) struct FlushWorker {
    shared: Arc<Shared>,
    transport: Arc<dyn BatchTransport>,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
}

impl FlushWorker {
    pub(crate) fn new(shared: Arc<Shared>, transport: Arc<dyn BatchTransport>) -> Self {
        let backoff = ExponentialBackoff::new(
            shared.config.initial_backoff,
            shared.config.max_backoff,
            2,
        );
        Self {
            shared,
            transport,
            backoff,
            retry_at: None,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.shared.config.batch_size,
            batch_interval_ms = self.shared.config.batch_interval.as_millis() as u64,
            "Starting exporter flush worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (len, oldest) = {
                let queue = self.shared.lock();
                (queue.len(), queue.oldest_enqueued_at())
            };
            if len == 0 {
                self.retry_at = None;
            }
            let now = Instant::now();
            let deadline = match (self.retry_at, oldest) {
                (Some(retry_at), _) => Some(retry_at),
                (None, Some(oldest)) => Some(oldest + self.shared.config.batch_interval),
                (None, None) => None,
            };
            let full = self.retry_at.is_none() && len >= self.shared.config.batch_size;
            let due = len > 0 && deadline.is_some_and(|d| d <= now);

            if full || due {
                self.flush_once().await;
                continue;
            }

            let wake_at = deadline.unwrap_or_else(|| now + IDLE_WAIT);
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.final_flush().await;
        info!("Exporter flush worker stopped");
    }

    async fn flush_once(&mut self) -> FlushOutcome {
        let batch = self.shared.lock().drain_batch(self.shared.config.batch_size);
        self.deliver(batch).await
    }

    async fn deliver(&mut self, batch: Vec<(CapturedRequest, Instant)>) -> FlushOutcome {
        if batch.is_empty() {
            self.retry_at = None;
            return FlushOutcome::Sent;
        }

        let requests: Vec<CapturedRequest> = batch.iter().map(|(r, _)| r.clone()).collect();
        let outcome = match self.transport.send(&requests).await {
            Ok(()) => {
                debug!(events = requests.len(), "Flushed batch to collector");
                self.shared.metrics.inc_exporter_batches_sent();
                self.backoff.reset();
                self.retry_at = None;
                FlushOutcome::Sent
            }
            Err(e) if e.is_retryable() => {
                let delay = self.backoff.next_delay();
                let evicted = self.shared.lock().requeue_front(batch);
                if evicted > 0 {
                    self.shared.metrics.add_exporter_events_dropped(evicted as u64);
                }
                warn!(
                    events = requests.len(),
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Batch delivery failed, requeued"
                );
                self.retry_at = Some(Instant::now() + delay);
                FlushOutcome::Requeued
            }
            Err(e) => {
                self.shared
                    .metrics
                    .add_exporter_events_dropped(requests.len() as u64);
                self.shared.lock().record_dropped(requests.len());
                error!(
                    events = requests.len(),
                    error = %e,
                    "Collector refused batch, dropping it"
                );
                self.backoff.reset();
                self.retry_at = None;
                FlushOutcome::Dropped
            }
        };

        self.shared
            .metrics
            .set_exporter_queue_depth(self.shared.lock().len() as i64);
        outcome
    }

    /// One pass over everything still queued, each send bounded by the
    /// request timeout. Stops at the first batch that would be requeued.
    async fn final_flush(&mut self) {
        let timeout = self.shared.config.request_timeout;
        loop {
            if self.shared.lock().is_empty() {
                break;
            }
            let batch = self.shared.lock().drain_batch(self.shared.config.batch_size);
            let in_flight = batch.len();
            match tokio::time::timeout(timeout, self.deliver(batch)).await {
                Ok(FlushOutcome::Sent) | Ok(FlushOutcome::Dropped) => {}
                Ok(FlushOutcome::Requeued) => break,
                Err(_) => {
                    // The cancelled send took its batch with it
                    self.shared
                        .metrics
                        .add_exporter_events_dropped(in_flight as u64);
                    self.shared.lock().record_dropped(in_flight);
                    warn!(events = in_flight, "Final flush timed out, batch lost");
                    break;
                }
            }
        }

        let remaining = {
            let mut queue = self.shared.lock();
            let remaining = queue.len();
            queue.record_dropped(remaining);
            remaining
        };
        if remaining > 0 {
            self.shared
                .metrics
                .add_exporter_events_dropped(remaining as u64);
            warn!(events = remaining, "Exporter stopped with undelivered events");
        }
    }
}
