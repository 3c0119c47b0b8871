//! Idle detection from passive input-activity signals.
//!
//! Pure signal source: it knows nothing about the engine or the queue.
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Key,
    Scroll,
    Touch,
    Click,
}

#[derive(Debug)]
pub struct ActivityMonitor {
    threshold: Duration,
    tick: Duration,
    last_activity: Mutex<Instant>,
    idle: watch::Sender<bool>,
    elapsed_secs: watch::Sender<u64>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_THRESHOLD, DEFAULT_TICK)
    }
}

impl ActivityMonitor {
    pub fn new(threshold: Duration, tick: Duration) -> Self {
        let (idle, _) = watch::channel(false);
        let (elapsed_secs, _) = watch::channel(0);
        Self {
            threshold,
            tick,
            last_activity: Mutex::new(Instant::now()),
            idle,
            elapsed_secs,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// An input event: resets the elapsed counter and re-arms the idle timer.
    pub fn record(&self, kind: ActivityKind) {
        *self.last_activity.lock() = Instant::now();
        self.elapsed_secs.send_if_modified(|secs| std::mem::replace(secs, 0) != 0);
        let woke = self.idle.send_if_modified(|idle| std::mem::replace(idle, false));
        if woke {
            info!(?kind, "activity resumed; no longer idle");
        } else {
            debug!(?kind, "activity");
        }
    }

    /// Recompute both signals from the clock. Returns the idle flag.
    pub fn refresh(&self) -> bool {
        let idle_for = self.idle_for();
        let secs = idle_for.as_secs();
        self.elapsed_secs
            .send_if_modified(|current| std::mem::replace(current, secs) != secs);
        let now_idle = idle_for >= self.threshold;
        let flipped = self
            .idle
            .send_if_modified(|idle| std::mem::replace(idle, now_idle) != now_idle);
        if flipped && now_idle {
            info!(idle_secs = secs, "user idle");
        }
        now_idle
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }

    /// Seconds since the last input, as of the latest tick.
    pub fn elapsed_secs(&self) -> u64 {
        *self.elapsed_secs.borrow()
    }

    pub fn subscribe_idle(&self) -> watch::Receiver<bool> {
        self.idle.subscribe()
    }

    pub fn subscribe_elapsed(&self) -> watch::Receiver<u64> {
        self.elapsed_secs.subscribe()
    }

    /// Refresh on a fixed cadence until `shutdown` fires.
    pub fn spawn_ticker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(monitor.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.refresh();
                    }
                }
            }
        })
    }
}
