//! Periodic background tasks
//!
//! Each task runs on its own interval. A cycle always finishes before the
//! next tick is taken, and missed ticks are delayed rather than bunched up.
//! All tasks stop when the shared shutdown signal flips to `true`.

use crate::core::EngineResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// A unit of background work run once per tick
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> EngineResult<()>;
}

/// Spawn `task` every `period` until `shutdown` signals
pub fn spawn_periodic(
    task: Arc<dyn PeriodicTask>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Started {} task (every {:?})", task.name(), period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = task.run_once().await {
                        log::warn!("{} cycle failed: {}", task.name(), e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Stopped {} task", task.name());
    })
}
