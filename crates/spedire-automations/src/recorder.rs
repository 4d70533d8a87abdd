//! Run Recorder: one history row per execution attempt, plus the cached
//! `last_run_*` fields on the automation.
//!
//! Writes after the handler has run are best effort: a failed write is logged
//! and the in-memory run is still returned. Handler side effects are never
//! rolled back.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use spedire_core::Result;

use crate::model::{
    Automation, AutomationRun, HandlerResult, LOCK_NOT_ACQUIRED_MESSAGE, NewRun, RunStatus,
    RunUpdate, Trigger,
};
use crate::store::{AutomationStore, RunStore};

/// How an attempt ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Handler returned normally.
    Handler(HandlerResult),
    /// Handler failed, panicked, or was missing.
    HandlerError(String),
    /// Another holder owns the lock (or the store denied it fail-closed).
    LockDenied,
}

impl RunOutcome {
    fn into_update(self, completed_at: DateTime<Utc>, duration_ms: i64) -> RunUpdate {
        match self {
            RunOutcome::Handler(result) => RunUpdate {
                status: result.status(),
                completed_at,
                duration_ms,
                result: result.details.unwrap_or_else(|| serde_json::json!({})),
                error_message: result.error,
                items_processed: result.items_processed,
                items_failed: result.items_failed,
            },
            RunOutcome::HandlerError(message) => RunUpdate {
                status: RunStatus::Failure,
                completed_at,
                duration_ms,
                result: serde_json::json!({}),
                error_message: Some(message),
                items_processed: 0,
                items_failed: 0,
            },
            RunOutcome::LockDenied => RunUpdate {
                status: RunStatus::Failure,
                completed_at,
                duration_ms,
                result: serde_json::json!({}),
                error_message: Some(LOCK_NOT_ACQUIRED_MESSAGE.to_string()),
                items_processed: 0,
                items_failed: 0,
            },
        }
    }
}

#[derive(Clone)]
pub struct RunRecorder {
    automations: Arc<dyn AutomationStore>,
    runs: Arc<dyn RunStore>,
}

impl RunRecorder {
    pub fn new(automations: Arc<dyn AutomationStore>, runs: Arc<dyn RunStore>) -> Self {
        Self { automations, runs }
    }

    /// Insert the `running` row.
    pub async fn start(
        &self,
        automation: &Automation,
        trigger: Trigger,
        user_id: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<AutomationRun> {
        self.runs
            .insert_run(&NewRun {
                automation_id: automation.id.clone(),
                triggered_by: trigger,
                triggered_by_user_id: user_id.map(str::to_string),
                started_at,
            })
            .await
    }

    /// Terminal run for an attempt whose row could not be inserted.
    /// Not persisted; carries a fresh id so callers can still report it.
    pub fn unsaved_failure(
        automation: &Automation,
        trigger: Trigger,
        user_id: Option<&str>,
        started: Instant,
        started_at: DateTime<Utc>,
        error: &str,
    ) -> AutomationRun {
        AutomationRun {
            id: uuid::Uuid::new_v4().to_string(),
            automation_id: automation.id.clone(),
            triggered_by: trigger,
            triggered_by_user_id: user_id.map(str::to_string),
            status: RunStatus::Failure,
            started_at,
            completed_at: Some(Utc::now()),
            duration_ms: Some(started.elapsed().as_millis() as i64),
            result: serde_json::json!({}),
            error_message: Some(format!("Impossibile registrare l'esecuzione: {error}")),
            items_processed: 0,
            items_failed: 0,
        }
    }

    /// Finalize the run and, unless the lock was denied, refresh the
    /// automation's cached last-run fields.
    pub async fn complete(
        &self,
        mut run: AutomationRun,
        automation: &Automation,
        outcome: RunOutcome,
        started: Instant,
    ) -> AutomationRun {
        let touches_cache = !matches!(outcome, RunOutcome::LockDenied);
        let completed_at = Utc::now();
        let update = outcome.into_update(completed_at, started.elapsed().as_millis() as i64);

        if let Err(e) = self.runs.update_run(&run.id, &update).await {
            tracing::error!(
                "❌ Failed to record run {} of '{}': {e}",
                run.id,
                automation.slug
            );
        }
        run.apply(&update);

        if touches_cache
            && let Err(e) = self
                .automations
                .update_automation_cache(&automation.id, completed_at, run.status)
                .await
        {
            tracing::error!("❌ Failed to update last-run cache of '{}': {e}", automation.slug);
        }
        run
    }
}
