use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use visitflow_core::config::EmailConfig;
use visitflow_core::error::Result;
use visitflow_core::traits::{EmailMessage, EmailProvider, HttpRequest, HttpTransport};

use super::status_error;

/// Resend-compatible transactional email API.
pub struct ResendEmailProvider {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    from: String,
    base_url: String,
    classify_errors: bool,
}

impl ResendEmailProvider {
    pub fn new(transport: Arc<dyn HttpTransport>, api_key: &str, config: &EmailConfig) -> Self {
        Self {
            transport,
            api_key: api_key.to_string(),
            from: config.from.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            classify_errors: false,
        }
    }

    pub fn classify_errors(mut self, classify: bool) -> Self {
        self.classify_errors = classify;
        self
    }
}

impl EmailProvider for ResendEmailProvider {
    fn name(&self) -> &str {
        "resend"
    }

    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut headers = BTreeMap::new();
            headers.insert("Authorization".to_string(), format!("Bearer {}", self.api_key));
            headers.insert("Content-Type".to_string(), "application/json".to_string());
            let body = json!({
                "from": self.from,
                "to": [message.to],
                "subject": message.subject,
                "html": message.body,
            });

            let response = self
                .transport
                .send(HttpRequest {
                    method: "POST".into(),
                    url: format!("{}/emails", self.base_url),
                    headers,
                    body: Some(body.to_string()),
                })
                .await?;
            if !response.is_success() {
                return Err(status_error(
                    "Send Email",
                    response.status,
                    format!("Email failed: {} {}", response.status, response.body.trim()),
                    self.classify_errors,
                ));
            }
            Ok(())
        })
    }
}

/// Logs instead of sending. Used when no provider key is configured.
pub struct SimulatedEmailProvider;

impl EmailProvider for SimulatedEmailProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(to = %message.to, subject = %message.subject, "Email delivery simulated");
            Ok(())
        })
    }
}

/// The configured provider, or the simulator when no API key is set.
pub fn email_provider(
    config: &EmailConfig,
    transport: Arc<dyn HttpTransport>,
    classify_errors: bool,
) -> Arc<dyn EmailProvider> {
    match config.effective_api_key() {
        Some(key) => Arc::new(
            ResendEmailProvider::new(transport, key, config).classify_errors(classify_errors),
        ),
        None => Arc::new(SimulatedEmailProvider),
    }
}
