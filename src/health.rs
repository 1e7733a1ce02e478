// ===============================
// src/health.rs (periodic DLL health monitor)
// ===============================
use std::sync::Arc;

use tokio::{
    sync::watch,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::connections::ConnectionManager;

/// Run `check_health` every `period` until `stop` flips to true.
pub async fn run(manager: Arc<ConnectionManager>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "health monitor started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let flipped = manager.check_health();
                debug!(flipped, active = manager.active_count(), "health check");
            }
            _ = stop.changed() => break,
        }
    }
    info!("health monitor stopped");
}
