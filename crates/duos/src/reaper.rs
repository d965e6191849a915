use crate::hub::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Spawn the periodic liveness sweep.
///
/// The task stops when `shutdown` changes or its sender is dropped.
pub fn spawn_reaper(
    hub: Arc<Hub>,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = hub.reap();
                    if reaped > 0 {
                        debug!(reaped, "liveness sweep finished");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reaper stopping");
                    break;
                }
            }
        }
    })
}
