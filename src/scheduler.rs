//! Idle-triggered dispatch of queued productions.
//!
//! An item starts only when the user is idle, no run is active and something
//! is queued. All three conditions are re-evaluated after every completion
//! and whenever one of the underlying signals changes.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityMonitor;
use crate::automation::{AutomationEngine, AutomationError, RunRequest};
use crate::queue::WorkQueue;

/// Error message stored on an item whose run was cancelled.
pub const CANCELLED_MESSAGE: &str = "cancelled";

pub struct Scheduler {
    engine: Arc<AutomationEngine>,
    monitor: Arc<ActivityMonitor>,
    queue: WorkQueue,
}

impl Scheduler {
    pub fn new(engine: Arc<AutomationEngine>, monitor: Arc<ActivityMonitor>, queue: WorkQueue) -> Self {
        Self {
            engine,
            monitor,
            queue,
        }
    }

    /// Run the oldest queued item if the user is idle and the engine is free.
    /// Returns whether an item was taken to completion.
    #[instrument(skip_all)]
    pub async fn process_next_item(&self) -> Result<bool> {
        if !self.monitor.is_idle() || self.engine.is_running() {
            return Ok(false);
        }
        let Some(item) = self.queue.claim_next().await? else {
            return Ok(false);
        };
        let id = item.request.id;
        info!(%id, name = %item.request.name, "starting queued production");

        match self.engine.run(RunRequest::from(&item.request)).await {
            Ok(Some(url)) => {
                info!(%id, %url, "queued production finished");
                if let Err(err) = self.queue.mark_done(id).await {
                    error!(%id, ?err, "could not mark item done");
                    let message = format!("finished at {url} but status update failed: {err}");
                    self.settle_error(id, &message).await?;
                }
            }
            Ok(None) => {
                info!(%id, "queued production cancelled");
                self.settle_error(id, CANCELLED_MESSAGE).await?;
            }
            Err(AutomationError::AlreadyRunning) => {
                // A user-started run won the race after the idle check.
                self.queue.requeue(id).await?;
                debug!(%id, "engine busy; item returned to queue");
                return Ok(false);
            }
            Err(err) => {
                warn!(%id, error = %err, "queued production failed");
                self.settle_error(id, &err.to_string()).await?;
            }
        }
        Ok(true)
    }

    /// Mark a finished item as failed, or requeue it if that write fails.
    /// A row left `processing` blocks every later claim.
    async fn settle_error(&self, id: Uuid, message: &str) -> Result<()> {
        if let Err(err) = self.queue.mark_error(id, message).await {
            error!(%id, ?err, "could not mark item failed; returning it to the queue");
            self.queue.requeue(id).await?;
        }
        Ok(())
    }

    /// Dispatch loop. Returns once `shutdown` fires; an item interrupted by
    /// shutdown stays `processing` and is recovered by `requeue_stale`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut idle_rx = self.monitor.subscribe_idle();
        let mut running_rx = self.engine.subscribe_running();
        info!("scheduler started");

        loop {
            loop {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    outcome = self.process_next_item() => outcome,
                };
                match outcome {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        error!(?err, "scheduler dispatch error");
                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        break;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                res = idle_rx.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                    debug!(idle = *idle_rx.borrow(), "idle changed");
                }
                res = running_rx.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
                _ = self.queue.notified() => debug!("queue changed"),
            }
        }
    }
}
