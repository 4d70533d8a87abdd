//! Dispatcher: the cron-tick entry point.
//!
//! One tick loads the enabled catalog, gates each automation by schedule and
//! registered handler, then runs it under its lock. Automations are processed
//! sequentially in load order. Failures are contained per automation; the
//! batch always returns what it managed to do.
//!
//! Each attempt runs on its own tokio task. Dropping the caller (an HTTP
//! client hanging up, a timeout) detaches from the attempt instead of
//! cancelling it, so the run still reaches a terminal state and the lock is
//! still released. A dropped batch does not start the automations it had not
//! reached yet.
//!
//! Nothing here cancels a slow handler. If a handler outlives the lock TTL the
//! next tick can acquire the lock and run the same automation concurrently.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::cron;
use crate::lock::AutomationLock;
use crate::model::{Automation, AutomationRun, BatchResult, RunStatus, RunSummary, Trigger};
use crate::recorder::{RunOutcome, RunRecorder};
use crate::registry::HandlerRegistry;
use crate::store::{AutomationStore, RunStore};

#[derive(Clone)]
pub struct Dispatcher {
    automations: Arc<dyn AutomationStore>,
    lock: Arc<AutomationLock>,
    registry: Arc<HandlerRegistry>,
    recorder: RunRecorder,
}

impl Dispatcher {
    pub fn new(
        automations: Arc<dyn AutomationStore>,
        runs: Arc<dyn RunStore>,
        lock: Arc<AutomationLock>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let recorder = RunRecorder::new(automations.clone(), runs);
        Self {
            automations,
            lock,
            registry,
            recorder,
        }
    }

    pub fn lock(&self) -> &Arc<AutomationLock> {
        &self.lock
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// One dispatcher tick at the current time.
    pub async fn run_dispatcher(&self, tolerance_minutes: u32) -> BatchResult {
        self.run_dispatcher_at(tolerance_minutes, Utc::now()).await
    }

    /// One dispatcher tick evaluated at `now`.
    ///
    /// A catalog load error yields the zeroed batch; callers should treat an
    /// all-zero result as "check the logs".
    pub async fn run_dispatcher_at(&self, tolerance_minutes: u32, now: DateTime<Utc>) -> BatchResult {
        let automations = match self.automations.load_enabled_automations().await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("❌ Dispatcher could not load automations: {e}");
                return BatchResult::default();
            }
        };

        tracing::info!(
            "⏰ Dispatcher tick at {}: {} enabled automation(s), tolerance {tolerance_minutes}m",
            now.format("%Y-%m-%d %H:%M"),
            automations.len()
        );

        let mut batch = BatchResult {
            checked: automations.len(),
            ..Default::default()
        };

        for automation in &automations {
            if !cron::should_run_now(&automation.schedule, tolerance_minutes, now) {
                if !cron::is_valid_cron(&automation.schedule) {
                    tracing::warn!(
                        "⚠️ Invalid schedule '{}' for '{}', skipping",
                        automation.schedule,
                        automation.slug
                    );
                }
                batch.skipped += 1;
                continue;
            }

            if !self.registry.contains(&automation.slug) {
                tracing::warn!("⚠️ No handler registered for '{}', skipping", automation.slug);
                batch.skipped += 1;
                continue;
            }

            let run = self.execute_automation(automation, Trigger::Cron, None).await;
            batch.executed += 1;
            batch.results.push(RunSummary::from_run(&automation.slug, &run));
        }

        tracing::info!(
            "⏰ Dispatcher tick done: checked {}, executed {}, skipped {}",
            batch.checked,
            batch.executed,
            batch.skipped
        );
        batch
    }

    /// Execute one automation under its lock and return the terminal run.
    ///
    /// Never fails: insert errors give an unsaved `failure` run, lock denial
    /// and handler errors give recorded `failure` runs. The lock is released
    /// only when this call acquired it.
    ///
    /// The attempt is spawned; dropping the returned future does not stop it.
    pub async fn execute_automation(
        &self,
        automation: &Automation,
        trigger: Trigger,
        user_id: Option<&str>,
    ) -> AutomationRun {
        let started = Instant::now();
        let started_at = Utc::now();
        let this = self.clone();
        let owned = automation.clone();
        let user = user_id.map(str::to_string);
        let attempt = tokio::spawn(async move {
            this.attempt(&owned, trigger, user.as_deref(), started, started_at)
                .await
        });

        match attempt.await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!("❌ Attempt for '{}' aborted: {e}", automation.slug);
                RunRecorder::unsaved_failure(
                    automation,
                    trigger,
                    user_id,
                    started,
                    started_at,
                    &e.to_string(),
                )
            }
        }
    }

    async fn attempt(
        &self,
        automation: &Automation,
        trigger: Trigger,
        user_id: Option<&str>,
        started: Instant,
        started_at: DateTime<Utc>,
    ) -> AutomationRun {
        let slug = automation.slug.as_str();
        tracing::info!("▶️ Running '{slug}' (trigger: {trigger})");

        let run = match self.recorder.start(automation, trigger, user_id, started_at).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!("❌ Could not create run for '{slug}': {e}");
                return RunRecorder::unsaved_failure(
                    automation,
                    trigger,
                    user_id,
                    started,
                    started_at,
                    &e.to_string(),
                );
            }
        };

        let lock_acquired = match AssertUnwindSafe(self.lock.acquire(slug)).catch_unwind().await {
            Ok(acquired) => acquired,
            Err(panic) => {
                tracing::error!(
                    "❌ Lock acquisition for '{slug}' panicked: {}",
                    panic_message(panic.as_ref())
                );
                false
            }
        };

        if !lock_acquired {
            let run = self
                .recorder
                .complete(run, automation, RunOutcome::LockDenied, started)
                .await;
            tracing::info!("⏭️ '{slug}' not run: lock not acquired");
            return run;
        }

        let outcome = match self.registry.get(slug) {
            None => RunOutcome::HandlerError(format!("Nessun handler registrato per '{slug}'")),
            Some(handler) => {
                let call = handler.run(&automation.config, automation);
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(Ok(result)) => RunOutcome::Handler(result),
                    Ok(Err(e)) => RunOutcome::HandlerError(format!("{e:#}")),
                    Err(panic) => RunOutcome::HandlerError(format!(
                        "Handler panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                }
            }
        };

        let run = self.recorder.complete(run, automation, outcome, started).await;
        self.lock.release(slug).await;

        if run.status == RunStatus::Failure {
            tracing::warn!(
                "⚠️ '{slug}' failed in {}ms: {}",
                run.duration_ms.unwrap_or_default(),
                run.error_message.as_deref().unwrap_or("unknown error")
            );
        } else {
            tracing::info!(
                "✅ '{slug}' finished {} in {}ms ({} processed, {} failed)",
                run.status,
                run.duration_ms.unwrap_or_default(),
                run.items_processed,
                run.items_failed
            );
        }
        run
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
