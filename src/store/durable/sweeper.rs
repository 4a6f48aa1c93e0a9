//! Background TTL sweeper for the durable backend.
//!
//! The sweeper wakes once per interval and asks its [`Purge`] target to
//! delete every record whose TTL has elapsed. Failures are logged and retried
//! on the next tick; nothing is propagated to callers. Reads never depend on
//! the sweeper for correctness, since they filter expired rows themselves.
//!
//! ## States
//!
//! - **Idle**: waiting for the next tick
//! - **Running**: a purge is in progress
//! - **Stopped**: shutdown was observed; the task has exited
//!
//! A purge in progress always completes before shutdown is observed.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Something the sweeper can purge expired records from.
#[async_trait]
pub trait Purge: Send + Sync + 'static {
    /// Deletes every expired record and returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Observable sweeper state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweeperState {
    Idle,
    Running,
    Stopped,
}

impl SweeperState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Handle to a running sweeper task.
pub struct TtlSweeper {
    shutdown_tx: watch::Sender<bool>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl TtlSweeper {
    /// Spawns the sweeper task on the current tokio runtime.
    ///
    /// The first sweep runs one full `interval` after start.
    pub fn start<P: Purge>(target: Arc<P>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(SweeperState::Idle as u8));

        info!(interval = ?interval, "Starting TTL sweeper");
        let handle = tokio::spawn(sweep_loop(target, interval, shutdown_rx, Arc::clone(&state)));

        Self {
            shutdown_tx,
            state,
            handle: Some(handle),
            interval,
        }
    }

    /// Current state of the sweeper task.
    pub fn state(&self) -> SweeperState {
        SweeperState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Signals shutdown and waits for the task to exit.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "TTL sweeper task ended abnormally");
        }
        self.state
            .store(SweeperState::Stopped as u8, Ordering::Release);
    }
}

impl Drop for TtlSweeper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn sweep_loop<P: Purge>(
    target: Arc<P>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    state: Arc<AtomicU8>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if *shutdown_rx.borrow() {
                    break;
                }

                state.store(SweeperState::Running as u8, Ordering::Release);
                match target.purge_expired().await {
                    Ok(0) => {},
                    Ok(removed) => debug!(removed, "Purged expired records"),
                    Err(e) => warn!(error = %e, "TTL sweep failed, retrying next interval"),
                }
                state.store(SweeperState::Idle as u8, Ordering::Release);
            }
        }
    }

    state.store(SweeperState::Stopped as u8, Ordering::Release);
    info!("TTL sweeper stopped");
}
