// service/background_jobs.rs
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::AppState;

/// Runs auto-completion and escrow reconciliation every `every`.
pub async fn start_settlement_sweep(app_state: Arc<AppState>, every: Duration) {
    let mut interval = interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now = Utc::now();

        match app_state.shift_service.auto_complete_overdue(now).await {
            Ok(completed) if !completed.is_empty() => {
                tracing::info!(count = completed.len(), "overdue applications auto-completed")
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Auto-complete sweep failed: {}", e),
        }

        if let Err(e) = app_state.escrow_service.reconcile(now).await {
            tracing::error!("Escrow reconciliation failed: {}", e);
        }
    }
}
