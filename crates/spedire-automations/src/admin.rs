//! Admin operations over the automation catalog: listing, toggling,
//! config edits, manual runs and run history.

use std::sync::Arc;

use spedire_core::{Result, SpedireError};

use crate::cron;
use crate::dispatcher::Dispatcher;
use crate::model::{Automation, AutomationRun, AutomationWithLastRun, NewAutomation, Trigger};
use crate::store::{AutomationStore, RunStore};

/// Upper bound for a run history page.
pub const MAX_RUNS_LIMIT: usize = 200;

pub struct AutomationAdmin {
    automations: Arc<dyn AutomationStore>,
    runs: Arc<dyn RunStore>,
    dispatcher: Arc<Dispatcher>,
}

impl AutomationAdmin {
    pub fn new(
        automations: Arc<dyn AutomationStore>,
        runs: Arc<dyn RunStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            automations,
            runs,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Every automation with its most recent run.
    pub async fn get_automations(&self) -> Result<Vec<AutomationWithLastRun>> {
        let automations = self.automations.list_automations().await?;
        let mut rows = Vec::with_capacity(automations.len());
        for automation in automations {
            let last_run = self.runs.latest_run(&automation.id).await?;
            rows.push(AutomationWithLastRun {
                automation,
                last_run,
            });
        }
        Ok(rows)
    }

    pub async fn toggle_automation_enabled(&self, slug: &str, enabled: bool) -> Result<Automation> {
        let automation = self.automations.set_enabled(slug, enabled).await?;
        tracing::info!(
            "🔀 Automation '{slug}' {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(automation)
    }

    /// Replace the config. Keys declared in `config_schema.properties` are
    /// type-checked; undeclared keys pass through.
    pub async fn update_automation_config(
        &self,
        slug: &str,
        config: serde_json::Value,
    ) -> Result<Automation> {
        if !config.is_object() {
            return Err(SpedireError::InvalidInput(
                "config must be a JSON object".into(),
            ));
        }
        let current = self.require(slug).await?;
        validate_config(&current.config_schema, &config)?;

        let updated = self.automations.update_config(slug, &config).await?;
        tracing::info!("🛠️ Config updated for '{slug}'");
        Ok(updated)
    }

    /// Run now on behalf of `user_id`, bypassing schedule and enabled flag.
    pub async fn run_automation_manually(&self, slug: &str, user_id: &str) -> Result<AutomationRun> {
        self.trigger(slug, Trigger::Manual, Some(user_id)).await
    }

    /// Run now for an API caller.
    pub async fn run_automation_api(&self, slug: &str) -> Result<AutomationRun> {
        self.trigger(slug, Trigger::Api, None).await
    }

    async fn trigger(
        &self,
        slug: &str,
        trigger: Trigger,
        user_id: Option<&str>,
    ) -> Result<AutomationRun> {
        let automation = self.require(slug).await?;
        Ok(self
            .dispatcher
            .execute_automation(&automation, trigger, user_id)
            .await)
    }

    /// Newest first; `limit` is clamped to `1..=200`.
    pub async fn get_automation_runs(&self, slug: &str, limit: usize) -> Result<Vec<AutomationRun>> {
        let automation = self.require(slug).await?;
        self.runs
            .list_runs(&automation.id, limit.clamp(1, MAX_RUNS_LIMIT))
            .await
    }

    /// Create an automation. It always starts disabled.
    pub async fn create_automation(&self, new: NewAutomation) -> Result<Automation> {
        validate_slug(&new.slug)?;
        if new.name.trim().is_empty() {
            return Err(SpedireError::InvalidInput("name must not be empty".into()));
        }
        if let Err(e) = cron::CronSchedule::parse(&new.schedule) {
            return Err(SpedireError::InvalidInput(e));
        }
        if !new.config.is_object() {
            return Err(SpedireError::InvalidInput(
                "config must be a JSON object".into(),
            ));
        }
        validate_config(&new.config_schema, &new.config)?;

        let created = self.automations.create_automation(&new).await?;
        tracing::info!("📅 Automation created: '{}' ({})", created.slug, created.schedule);
        Ok(created)
    }

    async fn require(&self, slug: &str) -> Result<Automation> {
        self.automations
            .get_automation(slug)
            .await?
            .ok_or_else(|| SpedireError::NotFound(format!("automation '{slug}'")))
    }
}

/// Lowercase letters, digits and `-`, at most 64 chars.
fn validate_slug(slug: &str) -> Result<()> {
    let valid = !slug.is_empty()
        && slug.len() <= 64
        && !slug.starts_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SpedireError::InvalidInput(format!("invalid slug '{slug}'")))
    }
}

/// Check declared property types of `config` against `schema`.
pub fn validate_config(schema: &serde_json::Value, config: &serde_json::Value) -> Result<()> {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for (key, property) in properties {
        let Some(value) = config.get(key) else {
            continue;
        };
        let Some(expected) = property.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        let ok = match expected {
            "boolean" => value.is_boolean(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "string" => value.is_string(),
            _ => true,
        };
        if !ok {
            return Err(SpedireError::InvalidInput(format!(
                "config.{key} must be a {expected}"
            )));
        }
    }
    Ok(())
}
