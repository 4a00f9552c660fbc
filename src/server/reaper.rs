use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, trace};

use crate::session::session_table::SessionTable;

/// Periodically evicts sessions that were idle for `max_life_time` or longer, until `shutdown`
///  becomes `true` or its sender is dropped
pub async fn run_reaper(sessions: Arc<SessionTable>, max_life_time: Duration, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow_and_update() {
        return;
    }
    debug!("starting session reaper with interval {:?}", interval);

    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticks.tick() => {
                let evicted = sessions.evict_idle(max_life_time).await;
                trace!("reaper evicted {} sessions", evicted.len());
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("session reaper finished");
}
