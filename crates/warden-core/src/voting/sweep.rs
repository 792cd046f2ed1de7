use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::engine::VotingEngine;

/// Run [`VotingEngine::sweep_expired`] every `interval` until `shutdown`
/// flips to `true`. The first sweep runs immediately.
pub fn spawn_expiration_sweeper(
    engine: Arc<VotingEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => match engine.sweep_expired().await {
                    Ok(expired) if !expired.is_empty() => {
                        info!(count = expired.len(), "expired stale proposals");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "expiration sweep failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
