//! Storage seams for automation definitions and run history.
//! The dispatcher only sees these traits; [`crate::persistence::AutomationDb`]
//! is the SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spedire_core::Result;

use crate::model::{Automation, AutomationRun, NewAutomation, NewRun, RunStatus, RunUpdate};

/// Automation definitions plus the cached last-run fields.
#[async_trait]
pub trait AutomationStore: Send + Sync {
    /// Enabled automations in stable order (creation time, then slug).
    async fn load_enabled_automations(&self) -> Result<Vec<Automation>>;

    /// Update the cached `last_run_at` / `last_run_status`.
    async fn update_automation_cache(
        &self,
        automation_id: &str,
        last_run_at: DateTime<Utc>,
        status: RunStatus,
    ) -> Result<()>;

    /// Every automation, enabled or not, in the same stable order.
    async fn list_automations(&self) -> Result<Vec<Automation>>;

    /// Lookup by slug. `Ok(None)` when absent.
    async fn get_automation(&self, slug: &str) -> Result<Option<Automation>>;

    /// Flip the enabled flag. Returns the updated automation.
    async fn set_enabled(&self, slug: &str, enabled: bool) -> Result<Automation>;

    /// Replace the config object. Returns the updated automation.
    async fn update_config(&self, slug: &str, config: &serde_json::Value) -> Result<Automation>;

    /// Create a new (disabled) automation. Fails if the slug exists.
    async fn create_automation(&self, new: &NewAutomation) -> Result<Automation>;
}

/// Append-only run history.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a run in the `running` state and return it with its id.
    async fn insert_run(&self, run: &NewRun) -> Result<AutomationRun>;

    /// Apply the terminal update to a run.
    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<()>;

    /// Most recent runs first.
    async fn list_runs(&self, automation_id: &str, limit: usize) -> Result<Vec<AutomationRun>>;

    /// The most recent run, if any.
    async fn latest_run(&self, automation_id: &str) -> Result<Option<AutomationRun>> {
        Ok(self.list_runs(automation_id, 1).await?.into_iter().next())
    }
}
