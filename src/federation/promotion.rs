/// Promotion deadline watchdog
///
/// Deadlines are persisted on the promotion rows, so a restart loses nothing;
/// this loop only has to keep checking the store.
use std::sync::Arc;
use std::time::Duration;

use super::FederationManager;

const WATCHDOG_POLL_MS: u64 = 1000;

pub async fn run_promotion_watchdog(manager: Arc<FederationManager>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(WATCHDOG_POLL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match manager.check_promotion_deadlines().await {
            Ok(0) => {}
            Ok(settled) => {
                tracing::info!("Watchdog settled {} overdue promotion request(s)", settled)
            }
            Err(err) => tracing::warn!("Promotion watchdog pass failed: {}", err),
        }
    }
}
