//! SQLite-backed persistence for automations and their run history.
//! Survives restarts; one connection behind a mutex, WAL for concurrent readers.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision and a `Z`
//! suffix, so lexical order equals chronological order.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use spedire_core::{Result, SpedireError};

use crate::model::{
    Automation, AutomationRun, NewAutomation, NewRun, RunStatus, RunUpdate, Trigger,
};
use crate::store::{AutomationStore, RunStore};

const AUTOMATION_COLUMNS: &str = "id, slug, name, description, category, enabled, schedule, \
     config, config_schema, last_run_at, last_run_status, created_at, updated_at";

const RUN_COLUMNS: &str = "id, automation_id, triggered_by, triggered_by_user_id, status, \
     started_at, completed_at, duration_ms, result, error_message, items_processed, items_failed";

/// SQLite store for the automation catalog and run history.
pub struct AutomationDb {
    conn: Mutex<Connection>,
}

impl AutomationDb {
    /// Open or create the automation database, migrate and seed it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SpedireError::Database(format!("DB open error: {e}")))?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SpedireError::Database(format!("DB open error: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        db.seed_defaults()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SpedireError::Database(format!("Lock: {e}")))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'general',
                enabled INTEGER NOT NULL DEFAULT 0,
                schedule TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',          -- JSON, passed to the handler
                config_schema TEXT NOT NULL DEFAULT '{}',   -- JSON schema for admin UIs
                last_run_at TEXT,
                last_run_status TEXT,                       -- running/success/partial/failure
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS automation_runs (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                triggered_by TEXT NOT NULL,                 -- cron/manual/api
                triggered_by_user_id TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                duration_ms INTEGER,
                result TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                items_processed INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (automation_id) REFERENCES automations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_automations_enabled ON automations(enabled);
            CREATE INDEX IF NOT EXISTS idx_automation_runs_started
                ON automation_runs(automation_id, started_at);
            ",
        )
        .map_err(|e| SpedireError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Seed the built-in catalog. Existing rows are left untouched.
    fn seed_defaults(&self) -> Result<()> {
        let now = timestamp(Utc::now());
        let seeds = [
            (
                "postpaid-monthly-billing",
                "Fatturazione mensile postpagato",
                "Genera le fatture del mese precedente per tutti gli utenti postpagato",
                "billing",
                "0 2 1 * *",
                serde_json::json!({
                    "dryRun": false,
                    "notifyAdmin": true,
                    "notifyWorkspaceOwner": true
                }),
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "dryRun": {"type": "boolean", "title": "Dry run"},
                        "notifyAdmin": {"type": "boolean", "title": "Notifica admin"},
                        "notifyWorkspaceOwner": {"type": "boolean", "title": "Notifica owner workspace"}
                    }
                }),
            ),
            (
                "low-balance-alert",
                "Avviso saldo basso",
                "Notifica gli utenti con saldo wallet sotto la soglia configurata",
                "notifications",
                "0 9 * * *",
                serde_json::json!({"threshold": 10}),
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "threshold": {"type": "number", "title": "Soglia (EUR)", "minimum": 0}
                    }
                }),
            ),
        ];

        let conn = self.conn()?;
        for (slug, name, description, category, schedule, config, schema) in seeds {
            conn.execute(
                "INSERT OR IGNORE INTO automations
                 (id, slug, name, description, category, enabled, schedule, config, config_schema,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?9)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    slug,
                    name,
                    description,
                    category,
                    schedule,
                    config.to_string(),
                    schema.to_string(),
                    now,
                ],
            )
            .map_err(|e| SpedireError::Database(format!("Seed {slug}: {e}")))?;
        }
        Ok(())
    }

    fn query_automations(&self, filter: &str) -> Result<Vec<Automation>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {AUTOMATION_COLUMNS} FROM automations {filter} ORDER BY created_at, slug"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SpedireError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map([], row_to_automation)
            .map_err(|e| SpedireError::Database(format!("Load automations: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SpedireError::Database(format!("Read automation row: {e}")))
    }

    fn find_by_slug(conn: &Connection, slug: &str) -> Result<Option<Automation>> {
        conn.query_row(
            &format!("SELECT {AUTOMATION_COLUMNS} FROM automations WHERE slug = ?1"),
            [slug],
            row_to_automation,
        )
        .optional()
        .map_err(|e| SpedireError::Database(format!("Get automation: {e}")))
    }

    fn require_by_slug(conn: &Connection, slug: &str) -> Result<Automation> {
        Self::find_by_slug(conn, slug)?
            .ok_or_else(|| SpedireError::NotFound(format!("automation '{slug}'")))
    }
}

#[async_trait]
impl AutomationStore for AutomationDb {
    async fn load_enabled_automations(&self) -> Result<Vec<Automation>> {
        self.query_automations("WHERE enabled = 1")
    }

    async fn update_automation_cache(
        &self,
        automation_id: &str,
        last_run_at: DateTime<Utc>,
        status: RunStatus,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE automations SET last_run_at = ?1, last_run_status = ?2 WHERE id = ?3",
                params![timestamp(last_run_at), status.as_str(), automation_id],
            )
            .map_err(|e| SpedireError::Database(format!("Update cache: {e}")))?;
        if changed == 0 {
            return Err(SpedireError::NotFound(format!("automation id '{automation_id}'")));
        }
        Ok(())
    }

    async fn list_automations(&self) -> Result<Vec<Automation>> {
        self.query_automations("")
    }

    async fn get_automation(&self, slug: &str) -> Result<Option<Automation>> {
        let conn = self.conn()?;
        Self::find_by_slug(&conn, slug)
    }

    async fn set_enabled(&self, slug: &str, enabled: bool) -> Result<Automation> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE automations SET enabled = ?1, updated_at = ?2 WHERE slug = ?3",
            params![enabled as i32, timestamp(Utc::now()), slug],
        )
        .map_err(|e| SpedireError::Database(format!("Toggle automation: {e}")))?;
        Self::require_by_slug(&conn, slug)
    }

    async fn update_config(&self, slug: &str, config: &serde_json::Value) -> Result<Automation> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE automations SET config = ?1, updated_at = ?2 WHERE slug = ?3",
            params![config.to_string(), timestamp(Utc::now()), slug],
        )
        .map_err(|e| SpedireError::Database(format!("Update config: {e}")))?;
        Self::require_by_slug(&conn, slug)
    }

    async fn create_automation(&self, new: &NewAutomation) -> Result<Automation> {
        let conn = self.conn()?;
        if Self::find_by_slug(&conn, &new.slug)?.is_some() {
            return Err(SpedireError::InvalidInput(format!(
                "automation '{}' already exists",
                new.slug
            )));
        }
        let now = timestamp(Utc::now());
        conn.execute(
            "INSERT INTO automations
             (id, slug, name, description, category, enabled, schedule, config, config_schema,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?9)",
            params![
                uuid::Uuid::new_v4().to_string(),
                new.slug,
                new.name,
                new.description,
                new.category,
                new.schedule,
                new.config.to_string(),
                new.config_schema.to_string(),
                now,
            ],
        )
        .map_err(|e| SpedireError::Database(format!("Create automation: {e}")))?;
        Self::require_by_slug(&conn, &new.slug)
    }
}

#[async_trait]
impl RunStore for AutomationDb {
    async fn insert_run(&self, run: &NewRun) -> Result<AutomationRun> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO automation_runs
             (id, automation_id, triggered_by, triggered_by_user_id, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
            params![
                id,
                run.automation_id,
                run.triggered_by.as_str(),
                run.triggered_by_user_id,
                timestamp(run.started_at),
            ],
        )
        .map_err(|e| SpedireError::Database(format!("Insert run: {e}")))?;

        Ok(AutomationRun {
            id,
            automation_id: run.automation_id.clone(),
            triggered_by: run.triggered_by,
            triggered_by_user_id: run.triggered_by_user_id.clone(),
            status: RunStatus::Running,
            started_at: run.started_at,
            completed_at: None,
            duration_ms: None,
            result: serde_json::json!({}),
            error_message: None,
            items_processed: 0,
            items_failed: 0,
        })
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE automation_runs SET status = ?1, completed_at = ?2, duration_ms = ?3,
                 result = ?4, error_message = ?5, items_processed = ?6, items_failed = ?7
                 WHERE id = ?8",
                params![
                    update.status.as_str(),
                    timestamp(update.completed_at),
                    update.duration_ms,
                    update.result.to_string(),
                    update.error_message,
                    update.items_processed,
                    update.items_failed,
                    run_id,
                ],
            )
            .map_err(|e| SpedireError::Database(format!("Update run: {e}")))?;
        if changed == 0 {
            return Err(SpedireError::NotFound(format!("run '{run_id}'")));
        }
        Ok(())
    }

    async fn list_runs(&self, automation_id: &str, limit: usize) -> Result<Vec<AutomationRun>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM automation_runs WHERE automation_id = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT ?2"
            ))
            .map_err(|e| SpedireError::Database(format!("Prepare: {e}")))?;
        let rows = stmt
            .query_map(params![automation_id, limit as i64], row_to_run)
            .map_err(|e| SpedireError::Database(format!("List runs: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SpedireError::Database(format!("Read run row: {e}")))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
}

fn row_to_automation(row: &Row<'_>) -> rusqlite::Result<Automation> {
    let config: String = row.get(7)?;
    let config_schema: String = row.get(8)?;
    let last_run_at: Option<String> = row.get(9)?;
    let last_run_status: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(Automation {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        enabled: row.get::<_, i32>(5)? != 0,
        schedule: row.get(6)?,
        config: parse_json(&config),
        config_schema: parse_json(&config_schema),
        last_run_at: last_run_at.as_deref().and_then(parse_timestamp),
        last_run_status: last_run_status.and_then(|s| s.parse().ok()),
        created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<AutomationRun> {
    let triggered_by: String = row.get(2)?;
    let status: String = row.get(4)?;
    let started_at: String = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    let result: String = row.get(8)?;

    Ok(AutomationRun {
        id: row.get(0)?,
        automation_id: row.get(1)?,
        triggered_by: triggered_by.parse().unwrap_or(Trigger::Cron),
        triggered_by_user_id: row.get(3)?,
        status: status.parse().unwrap_or(RunStatus::Failure),
        started_at: parse_timestamp(&started_at).unwrap_or_else(Utc::now),
        completed_at: completed_at.as_deref().and_then(parse_timestamp),
        duration_ms: row.get(7)?,
        result: parse_json(&result),
        error_message: row.get(9)?,
        items_processed: row.get(10)?,
        items_failed: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_run(automation_id: &str, started_at: DateTime<Utc>) -> NewRun {
        NewRun {
            automation_id: automation_id.into(),
            triggered_by: Trigger::Manual,
            triggered_by_user_id: Some("user-1".into()),
            started_at,
        }
    }

    #[tokio::test]
    async fn test_seed_catalog_is_disabled() {
        let db = AutomationDb::open_in_memory().unwrap();
        let all = db.list_automations().await.unwrap();
        let slugs: Vec<&str> = all.iter().map(|a| a.slug.as_str()).collect();
        assert_eq!(slugs, vec!["low-balance-alert", "postpaid-monthly-billing"]);
        assert!(all.iter().all(|a| !a.enabled));
        assert!(db.load_enabled_automations().await.unwrap().is_empty());

        let billing = db.get_automation("postpaid-monthly-billing").await.unwrap().unwrap();
        assert_eq!(billing.schedule, "0 2 1 * *");
        assert_eq!(billing.category, "billing");
        assert_eq!(billing.config_schema["properties"]["dryRun"]["type"], "boolean");
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("spedire-test-seed-{}", uuid::Uuid::new_v4()));
        let path = dir.join("automations.db");
        {
            let db = AutomationDb::open(&path).unwrap();
            db.set_enabled("low-balance-alert", true).await.unwrap();
        }
        let db = AutomationDb::open(&path).unwrap();
        assert_eq!(db.list_automations().await.unwrap().len(), 2);
        // reopening must not reset admin changes
        let alert = db.get_automation("low-balance-alert").await.unwrap().unwrap();
        assert!(alert.enabled);
        drop(db);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_toggle_and_config() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = db.set_enabled("low-balance-alert", true).await.unwrap();
        assert!(a.enabled);
        let enabled = db.load_enabled_automations().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].slug, "low-balance-alert");

        let a = db
            .update_config("low-balance-alert", &serde_json::json!({"threshold": 25}))
            .await
            .unwrap();
        assert_eq!(a.config["threshold"], 25);

        let missing = db.set_enabled("nope", true).await;
        assert!(matches!(missing, Err(SpedireError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_automation() {
        let db = AutomationDb::open_in_memory().unwrap();
        let new = NewAutomation {
            slug: "nightly-sync".into(),
            name: "Nightly sync".into(),
            description: String::new(),
            category: "general".into(),
            schedule: "30 1 * * *".into(),
            config: serde_json::json!({}),
            config_schema: serde_json::json!({}),
        };
        let created = db.create_automation(&new).await.unwrap();
        assert!(!created.enabled);
        assert!(created.last_run_at.is_none());
        assert!(matches!(
            db.create_automation(&new).await,
            Err(SpedireError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_run_lifecycle_and_ordering() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = db.get_automation("low-balance-alert").await.unwrap().unwrap();
        let t0 = Utc::now();

        let first = db.insert_run(&new_run(&a.id, t0)).await.unwrap();
        assert_eq!(first.status, RunStatus::Running);
        let second = db
            .insert_run(&new_run(&a.id, t0 + Duration::seconds(1)))
            .await
            .unwrap();

        db.update_run(
            &first.id,
            &RunUpdate {
                status: RunStatus::Partial,
                completed_at: t0 + Duration::milliseconds(40),
                duration_ms: 40,
                result: serde_json::json!({"sent": 3}),
                error_message: None,
                items_processed: 3,
                items_failed: 1,
            },
        )
        .await
        .unwrap();

        let runs = db.list_runs(&a.id, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].status, RunStatus::Partial);
        assert_eq!(runs[1].items_failed, 1);
        assert_eq!(runs[1].result["sent"], 3);
        assert_eq!(runs[1].triggered_by_user_id.as_deref(), Some("user-1"));

        let latest = db.latest_run(&a.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_insert_run_for_unknown_automation_fails() {
        let db = AutomationDb::open_in_memory().unwrap();
        let result = db.insert_run(&new_run("missing-id", Utc::now())).await;
        assert!(matches!(result, Err(SpedireError::Database(_))));
    }

    #[tokio::test]
    async fn test_update_cache() {
        let db = AutomationDb::open_in_memory().unwrap();
        let a = db.get_automation("postpaid-monthly-billing").await.unwrap().unwrap();
        let at = Utc::now();
        db.update_automation_cache(&a.id, at, RunStatus::Success).await.unwrap();
        let a = db.get_automation("postpaid-monthly-billing").await.unwrap().unwrap();
        assert_eq!(a.last_run_status, Some(RunStatus::Success));
        assert_eq!(timestamp(a.last_run_at.unwrap()), timestamp(at));
    }
}
