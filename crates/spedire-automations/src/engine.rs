//! Ticker: an in-process stand-in for the external cron trigger.
//! Uses tokio::interval, so it sleeps between ticks. Ticks never overlap:
//! a slow tick delays the next one instead of running beside it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::dispatcher::Dispatcher;

/// Run the dispatcher every `check_interval_secs` forever.
/// Spawn it on the runtime; it only returns if the task is aborted.
pub async fn spawn_ticker(dispatcher: Arc<Dispatcher>, check_interval_secs: u64, tolerance_minutes: u32) {
    let period = Duration::from_secs(check_interval_secs.max(1));
    tracing::info!(
        "⏰ Automation ticker started (every {}s, tolerance {}m)",
        period.as_secs(),
        tolerance_minutes
    );

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let batch = dispatcher.run_dispatcher(tolerance_minutes).await;
        for summary in &batch.results {
            tracing::debug!(
                "📣 [{}] {} ({} processed, {} failed)",
                summary.slug,
                summary.status,
                summary.items_processed,
                summary.items_failed
            );
        }
    }
}
