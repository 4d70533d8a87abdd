//! # Spedire Automations
//!
//! Cron-driven automation dispatcher with per-automation distributed locking
//! and run-history bookkeeping.
//!
//! ## Architecture
//! ```text
//! trigger (HTTP cron endpoint / ticker / admin action)
//!   └── Dispatcher::run_dispatcher(tolerance)
//!         ├── AutomationStore::load_enabled_automations()
//!         └── for each automation, in load order:
//!               ├── cron::should_run_now(schedule, tolerance)   → else skipped
//!               ├── HandlerRegistry::contains(slug)             → else skipped
//!               └── execute_automation(automation, cron)
//!                     ├── RunRecorder::start()        running row
//!                     ├── AutomationLock::acquire()   SET NX EX, fail-open/closed
//!                     ├── AutomationHandler::run()    errors and panics contained
//!                     ├── RunRecorder::complete()     terminal row + last-run cache
//!                     └── AutomationLock::release()   only if acquired
//! ```
//!
//! Storage is SQLite ([`persistence::AutomationDb`]); the lock store is Redis
//! or in-memory ([`lock`]). Handlers are in-process closures or remote
//! webhooks ([`webhook`]).

pub mod admin;
pub mod cron;
pub mod dispatcher;
pub mod engine;
pub mod lock;
pub mod model;
pub mod persistence;
pub mod recorder;
pub mod registry;
pub mod store;
pub mod webhook;

#[cfg(test)]
mod testlog;

pub use admin::AutomationAdmin;
pub use dispatcher::Dispatcher;
pub use engine::spawn_ticker;
pub use lock::{AutomationLock, LockStats, LockStore, LockStoreError, MemoryLockStore, RedisLockStore};
pub use model::{
    Automation, AutomationRun, AutomationWithLastRun, BatchResult, HandlerResult, NewAutomation,
    RunStatus, RunSummary, Trigger,
};
pub use persistence::AutomationDb;
pub use recorder::{RunOutcome, RunRecorder};
pub use registry::{AutomationHandler, FnHandler, HandlerRegistry};
pub use store::{AutomationStore, RunStore};
pub use webhook::{WebhookHandler, register_webhooks};
