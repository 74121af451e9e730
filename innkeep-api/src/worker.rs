use innkeep_booking::{OutboxDispatcher, Reconciler};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Retries outbox entries the request path could not publish.
pub async fn start_outbox_worker(dispatcher: OutboxDispatcher, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Outbox worker started, dispatching every {:?}", every);

    loop {
        ticker.tick().await;
        if let Err(e) = dispatcher.dispatch_pending().await {
            error!("Outbox dispatch failed: {}", e);
        }
    }
}

pub async fn start_reconciliation_worker(reconciler: Reconciler, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Reconciliation worker started, sweeping every {:?}", every);

    loop {
        ticker.tick().await;
        if let Err(e) = reconciler.run_once().await {
            error!("Reconciliation pass failed: {}", e);
        }
    }
}
