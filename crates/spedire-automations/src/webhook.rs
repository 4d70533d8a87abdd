//! Remote handlers: the automation's work runs in another service and is
//! reached over HTTP.
//!
//! Request: `POST <url>` with `{"slug", "config", "automation"}` as JSON and an
//! optional bearer token. Response: a [`HandlerResult`] in camelCase. Any
//! non-2xx status or unparsable body is a handler error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use spedire_core::config::WebhookHandlerConfig;

use crate::model::{Automation, HandlerResult};
use crate::registry::{AutomationHandler, HandlerRegistry};

/// Longest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 300;

pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl WebhookHandler {
    pub fn new(url: impl Into<String>, bearer_token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer_token: bearer_token.filter(|t| !t.is_empty()),
            timeout,
        }
    }

    pub fn from_config(config: &WebhookHandlerConfig) -> Self {
        Self::new(
            config.url.clone(),
            Some(config.bearer_token.clone()),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AutomationHandler for WebhookHandler {
    async fn run(
        &self,
        config: &serde_json::Value,
        automation: &Automation,
    ) -> anyhow::Result<HandlerResult> {
        let body = serde_json::json!({
            "slug": automation.slug,
            "config": config,
            "automation": automation,
        });

        let mut req = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        tracing::debug!("🌐 Calling webhook for '{}': {}", automation.slug, self.url);
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook {} unreachable: {e}", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(MAX_ERROR_BODY).collect();
            anyhow::bail!("Webhook {} returned {status}: {snippet}", self.url);
        }

        resp.json::<HandlerResult>()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook {} returned an invalid result: {e}", self.url))
    }
}

/// Register one [`WebhookHandler`] per configured entry.
pub fn register_webhooks(registry: &mut HandlerRegistry, webhooks: &[WebhookHandlerConfig]) {
    for hook in webhooks {
        tracing::info!("🌐 Webhook handler: {} → {}", hook.slug, hook.url);
        registry.register(hook.slug.clone(), Arc::new(WebhookHandler::from_config(hook)));
    }
}
