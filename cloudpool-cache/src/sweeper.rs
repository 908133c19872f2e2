//! Background TTL expiry.
//!
//! Expired entries are already invisible to `get`; the sweeper reclaims
//! their disk space without waiting for eviction pressure.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::CacheStore;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Run `sweep_expired` every half TTL until `cancel` fires.
pub fn spawn_ttl_sweeper(store: Arc<CacheStore>, cancel: CancellationToken) -> JoinHandle<()> {
    let period = (store.ttl() / 2).max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing has aged yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("TTL sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let removed = store.sweep_expired();
                    if removed > 0 {
                        info!(removed, "Swept expired cache entries");
                    } else {
                        debug!("TTL sweep found nothing to remove");
                    }
                }
            }
        }
    })
}
