//! Automation definitions: the core data model for scheduled platform work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use spedire_core::SpedireError;

/// Error message recorded when another holder owns the automation lock.
pub const LOCK_NOT_ACQUIRED_MESSAGE: &str = "Lock non acquisito — esecuzione già in corso";

/// A named, independently toggleable unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Automation {
    /// Opaque primary key.
    pub id: String,
    /// Stable key used to resolve the handler.
    pub slug: String,
    pub name: String,
    pub description: String,
    /// Display grouping ("billing", "notifications", ...).
    pub category: String,
    pub enabled: bool,
    /// Five-field cron expression, see [`crate::cron`].
    pub schedule: String,
    /// Passed verbatim to the handler.
    pub config: serde_json::Value,
    /// JSON-schema-like description of `config`, consumed by admin UIs.
    pub config_schema: serde_json::Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating an automation. New automations always start disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutomation {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub schedule: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default = "empty_object")]
    pub config_schema: serde_json::Value,
}

fn default_category() -> String { "general".into() }
fn empty_object() -> serde_json::Value { serde_json::json!({}) }

/// What started an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Cron,
    Manual,
    Api,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Cron => "cron",
            Trigger::Manual => "manual",
            Trigger::Api => "api",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = SpedireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Trigger::Cron),
            "manual" => Ok(Trigger::Manual),
            "api" => Ok(Trigger::Api),
            other => Err(SpedireError::InvalidInput(format!("unknown trigger '{other}'"))),
        }
    }
}

/// Run state machine: `Running` → exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Terminal status for a handler that returned normally.
    pub fn from_result(result: &HandlerResult) -> Self {
        match (result.success, result.items_failed) {
            (false, _) => RunStatus::Failure,
            (true, 0) => RunStatus::Success,
            (true, _) => RunStatus::Partial,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SpedireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failure" => Ok(RunStatus::Failure),
            other => Err(SpedireError::InvalidInput(format!("unknown run status '{other}'"))),
        }
    }
}

/// One recorded execution attempt. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationRun {
    pub id: String,
    pub automation_id: String,
    pub triggered_by: Trigger,
    /// Set only for manual triggers.
    pub triggered_by_user_id: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Handler-specific detail payload.
    pub result: serde_json::Value,
    pub error_message: Option<String>,
    pub items_processed: u32,
    pub items_failed: u32,
}

impl AutomationRun {
    /// Apply a terminal update in memory (mirrors what the store persisted).
    pub fn apply(&mut self, update: &RunUpdate) {
        self.status = update.status;
        self.completed_at = Some(update.completed_at);
        self.duration_ms = Some(update.duration_ms);
        self.result = update.result.clone();
        self.error_message = update.error_message.clone();
        self.items_processed = update.items_processed;
        self.items_failed = update.items_failed;
    }
}

/// Insert payload for a run entering the `running` state.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub automation_id: String,
    pub triggered_by: Trigger,
    pub triggered_by_user_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Terminal update for a run.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub result: serde_json::Value,
    pub error_message: Option<String>,
    pub items_processed: u32,
    pub items_failed: u32,
}

/// Value returned by a handler. Wire shape is camelCase for remote workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResult {
    pub success: bool,
    #[serde(default)]
    pub items_processed: u32,
    #[serde(default)]
    pub items_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandlerResult {
    /// Successful result with `processed` items.
    pub fn ok(processed: u32) -> Self {
        Self {
            success: true,
            items_processed: processed,
            ..Default::default()
        }
    }

    /// Failed result carrying an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_failed(mut self, failed: u32) -> Self {
        self.items_failed = failed;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_result(self)
    }
}

/// Per-automation entry of a batch result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub slug: String,
    pub status: RunStatus,
    pub items_processed: u32,
    pub items_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn from_run(slug: &str, run: &AutomationRun) -> Self {
        Self {
            slug: slug.to_string(),
            status: run.status,
            items_processed: run.items_processed,
            items_failed: run.items_failed,
            error: run.error_message.clone(),
        }
    }
}

/// Aggregate of one dispatcher tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchResult {
    pub checked: usize,
    pub executed: usize,
    pub skipped: usize,
    pub results: Vec<RunSummary>,
}

/// Admin listing row: an automation plus its most recent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationWithLastRun {
    #[serde(flatten)]
    pub automation: Automation,
    pub last_run: Option<AutomationRun>,
}
