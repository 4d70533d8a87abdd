//! Handler Registry: slug → the code that performs an automation's work.
//!
//! Built once at startup and handed to the dispatcher, so tests can inject
//! doubles without touching process-wide state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Automation, HandlerResult};

/// Domain work behind an automation slug.
///
/// Returning `Err` (or panicking) records a `failure` run with the error text.
/// Handlers may run twice for the same period (crash between completion and
/// run write, or TTL expiry while still running) and must tolerate it.
#[async_trait]
pub trait AutomationHandler: Send + Sync {
    async fn run(
        &self,
        config: &serde_json::Value,
        automation: &Automation,
    ) -> anyhow::Result<HandlerResult>;
}

/// Adapter for async closures taking owned `(config, automation)`.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> AutomationHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, Automation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerResult>> + Send + 'static,
{
    async fn run(
        &self,
        config: &serde_json::Value,
        automation: &Automation,
    ) -> anyhow::Result<HandlerResult> {
        (self.f)(config.clone(), automation.clone()).await
    }
}

/// Registry of handlers keyed by automation slug.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn AutomationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `slug`.
    pub fn register(&mut self, slug: impl Into<String>, handler: Arc<dyn AutomationHandler>) {
        let slug = slug.into();
        if self.handlers.insert(slug.clone(), handler).is_some() {
            tracing::warn!("🔁 Handler replaced: {slug}");
        } else {
            tracing::debug!("🧩 Handler registered: {slug}");
        }
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, slug: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value, Automation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HandlerResult>> + Send + 'static,
    {
        self.register(slug, Arc::new(FnHandler::new(f)));
    }

    /// Lookup. An unknown slug is `None`, not an error.
    pub fn get(&self, slug: &str) -> Option<Arc<dyn AutomationHandler>> {
        self.handlers.get(slug).cloned()
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.handlers.contains_key(slug)
    }

    /// Registered slugs, sorted.
    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<_> = self.handlers.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
