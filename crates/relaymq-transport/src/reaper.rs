//! Background reaping tasks for connection pools.
//!
//! A [`ReaperDaemon`] owns the periodic dead connection scan and every pending
//! one-shot idle scan of one pool. It is started when the pool gains its first
//! connection and cancelled when the pool empties or closes, so an empty pool
//! has no background tasks.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PoolConfig;

/// Scans driven by the reaper daemon.
pub(crate) trait Reapable: Send + Sync + 'static {
    /// Destroys connections that have gone unleased for the idle period.
    fn reap_idle(&self);

    /// Pings quiet connections and destroys those that stopped answering.
    fn reap_dead(&self);
}

pub(crate) struct ReaperDaemon {
    runtime: Handle,
    token: CancellationToken,
    idle_period: Duration,
}

impl ReaperDaemon {
    /// Starts the daemon on the current tokio runtime.
    ///
    /// Returns `None` outside of a runtime; the pool then runs without reaping.
    pub(crate) fn start<T: Reapable>(target: Weak<T>, config: &PoolConfig) -> Option<Self> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No tokio runtime available, connection reaping disabled");
                return None;
            }
        };
        let token = CancellationToken::new();

        if config.dead_reaping_enabled() {
            let period = config.reap_interval;
            let cancelled = token.clone();
            runtime.spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancelled.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(target) = target.upgrade() else { break };
                            target.reap_dead();
                        }
                    }
                }
                debug!("Dead connection reaper stopped");
            });
        }

        debug!(
            reap_interval_ms = config.reap_interval.as_millis() as u64,
            idle_period_ms = config.idle_period.as_millis() as u64,
            "Reaper started"
        );
        Some(Self {
            runtime,
            token,
            idle_period: config.idle_period,
        })
    }

    /// Schedules one idle scan after the idle period.
    pub(crate) fn schedule_idle<T: Reapable>(&self, target: Weak<T>) {
        let cancelled = self.token.clone();
        let delay = self.idle_period;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(target) = target.upgrade() {
                        target.reap_idle();
                    }
                }
            }
        });
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the periodic scan and every pending idle scan.
    pub(crate) fn stop(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
            debug!("Reaper stopped");
        }
    }
}

impl Drop for ReaperDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
