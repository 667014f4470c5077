//! Check-in delivery: transport boundary, courier and background queue.
//!
//! The transport is an external capability. The courier drives the delivery
//! status of one check-in through conditional store transitions, so every
//! step is idempotent: a check-in is sent at most once and confirmed at most
//! once, whatever the order in which retries and confirmations arrive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::models::{CheckIn, DeliveryMethod, DeliveryStatus};
use crate::store::PulseStore;

/// What the transport knows after accepting a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// True when the transport confirmed delivery synchronously. Otherwise the
    /// confirmation arrives later through [`Courier::confirm`].
    pub confirmed: bool,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn method(&self) -> DeliveryMethod;

    async fn deliver(
        &self,
        message: &str,
        recipient_token: &str,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Transport that only writes a log line. Used by the CLI.
#[derive(Debug, Clone, Copy)]
pub struct LogNotifier {
    pub method: DeliveryMethod,
}

#[async_trait]
impl Notifier for LogNotifier {
    fn method(&self) -> DeliveryMethod {
        self.method
    }

    async fn deliver(
        &self,
        message: &str,
        recipient_token: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        info!(
            recipient = recipient_token,
            method = %self.method,
            chars = message.len(),
            "check-in handed to transport"
        );
        Ok(DeliveryReceipt { confirmed: true })
    }
}

/// Sends single check-ins and records every status change.
pub struct Courier {
    store: Arc<dyn PulseStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: DeliveryConfig,
}

impl Courier {
    pub fn new(
        store: Arc<dyn PulseStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            config,
        }
    }

    pub fn method(&self) -> DeliveryMethod {
        self.notifier.method()
    }

    /// Deliver a pending check-in. Never fails: errors end up as `failed`.
    pub async fn send(&self, check_in: &CheckIn) -> DeliveryStatus {
        let id = check_in.id;
        match self
            .store
            .transition_delivery(id, DeliveryStatus::Pending, DeliveryStatus::Sent, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(check_in_id = %id, "check-in no longer pending, skipping send");
                return self.current_status(id).await;
            }
            Err(e) => {
                error!(check_in_id = %id, error = %e, "could not mark check-in as sent");
                return DeliveryStatus::Pending;
            }
        }

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .notifier
                .deliver(
                    &check_in.check_in_data.message,
                    check_in.student_anonymized_id.as_str(),
                )
                .await
            {
                Ok(receipt) if receipt.confirmed => {
                    self.confirm(id).await;
                    return DeliveryStatus::Delivered;
                }
                Ok(_) => return DeliveryStatus::Sent,
                Err(e) if attempt < attempts => {
                    warn!(check_in_id = %id, attempt, error = %e, "delivery attempt failed, retrying");
                    let backoff = self.config.backoff_ms.saturating_mul(u64::from(attempt));
                    if backoff > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
                Err(e) => {
                    error!(check_in_id = %id, attempts, error = %e, "delivery failed");
                }
            }
        }

        self.mark(id, DeliveryStatus::Sent, DeliveryStatus::Failed).await;
        DeliveryStatus::Failed
    }

    /// Completion callback: `sent -> delivered` at most once.
    pub async fn confirm(&self, id: Uuid) -> bool {
        self.mark(id, DeliveryStatus::Sent, DeliveryStatus::Delivered).await
    }

    /// Withdraw a check-in that has not been sent yet.
    pub async fn cancel(&self, id: Uuid) -> bool {
        self.mark(id, DeliveryStatus::Pending, DeliveryStatus::Failed).await
    }

    async fn mark(&self, id: Uuid, from: DeliveryStatus, to: DeliveryStatus) -> bool {
        match self.store.transition_delivery(id, from, to, self.clock.now()).await {
            Ok(applied) => {
                if applied {
                    debug!(check_in_id = %id, from = %from, to = %to, "delivery status changed");
                }
                applied
            }
            Err(e) => {
                error!(check_in_id = %id, to = %to, error = %e, "failed to record delivery status");
                false
            }
        }
    }

    async fn current_status(&self, id: Uuid) -> DeliveryStatus {
        match self.store.find_check_in(id).await {
            Ok(Some(check_in)) => check_in.delivery.status,
            _ => DeliveryStatus::Failed,
        }
    }
}

#[derive(Debug)]
struct DeliveryJob {
    check_in: CheckIn,
}

/// Producer side of the delivery queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<DeliveryJob>,
}

/// Handle of the background worker draining a [`DeliveryQueue`].
pub struct DeliveryWorker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<usize>,
}

impl DeliveryQueue {
    /// Start a worker task on the current tokio runtime.
    pub fn spawn(courier: Arc<Courier>, capacity: usize) -> (Self, DeliveryWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_worker(courier, rx, stop_rx));
        (
            Self { tx },
            DeliveryWorker {
                stop: stop_tx,
                handle,
            },
        )
    }

    /// Queue a check-in without waiting. False when the queue is full or closed.
    pub fn enqueue(&self, check_in: CheckIn) -> bool {
        let id = check_in.id;
        match self.tx.try_send(DeliveryJob { check_in }) {
            Ok(()) => true,
            Err(e) => {
                warn!(check_in_id = %id, error = %e, "delivery queue rejected check-in");
                false
            }
        }
    }
}

impl DeliveryWorker {
    /// Stop after draining already-queued jobs. Returns how many jobs ran.
    pub async fn shutdown(self) -> usize {
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(processed) => processed,
            Err(e) => {
                error!(error = %e, "delivery worker panicked");
                0
            }
        }
    }
}

async fn run_worker(
    courier: Arc<Courier>,
    mut rx: mpsc::Receiver<DeliveryJob>,
    mut stop: oneshot::Receiver<()>,
) -> usize {
    let mut processed = 0;
    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => {
                    courier.send(&job.check_in).await;
                    processed += 1;
                }
                None => break,
            },
            _ = &mut stop => {
                rx.close();
                while let Some(job) = rx.recv().await {
                    courier.send(&job.check_in).await;
                    processed += 1;
                }
                break;
            }
        }
    }
    debug!(processed, "delivery worker stopped");
    processed
}
