use std::collections::BTreeMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use visitflow_core::config::WebhookConfig;
use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::settings::WebhookSettings;
use visitflow_core::traits::{HttpRequest, HttpTransport};
use visitflow_core::types::Job;

use super::status_error;
use crate::template::Template;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VisitflowError::Config(format!("webhook secret: {}", e)))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Builds and delivers webhook requests. Retrying is the caller's concern.
pub struct WebhookSender {
    transport: Arc<dyn HttpTransport>,
    hmac_secret: Option<String>,
    signature_header: String,
    classify_errors: bool,
}

impl WebhookSender {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &WebhookConfig) -> Self {
        Self {
            transport,
            hmac_secret: config
                .hmac_secret
                .clone()
                .filter(|s| !s.trim().is_empty() && !s.starts_with("${")),
            signature_header: config.signature_header.clone(),
            classify_errors: false,
        }
    }

    pub fn classify_errors(mut self, classify: bool) -> Self {
        self.classify_errors = classify;
        self
    }

    /// Substitute templates and assemble the signed request.
    ///
    /// The payload always carries the visitor identity and forwarded
    /// localStorage values. A JSON object body is merged over it; any other
    /// body is attached as `customData`.
    pub fn build_request(
        &self,
        settings: &WebhookSettings,
        job: &Job,
        template: &Template<'_>,
    ) -> Result<HttpRequest> {
        let mut payload = Map::new();
        payload.insert("visitorId".into(), Value::String(job.visitor_id.clone()));
        payload.insert(
            "identifiedUser".into(),
            serde_json::to_value(&job.identified_user)?,
        );
        payload.insert(
            "localStorageData".into(),
            serde_json::to_value(&job.local_storage)?,
        );
        payload.insert(
            "timestamp".into(),
            Value::String(template.timestamp().to_string()),
        );

        if let Some(body) = &settings.body {
            let rendered = template.render(body);
            match serde_json::from_str::<Value>(&rendered) {
                Ok(Value::Object(custom)) => payload.extend(custom),
                _ => {
                    warn!(url = %settings.url, "Webhook body is not a JSON object, sending as customData");
                    payload.insert("customData".into(), Value::String(rendered));
                }
            }
        }
        let body = serde_json::to_string(&Value::Object(payload))?;

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        for (name, value) in &settings.headers {
            headers.insert(name.clone(), template.render(value));
        }
        if let Some(secret) = &self.hmac_secret {
            headers.insert(self.signature_header.clone(), sign(secret, &body)?);
        }

        let sends_body = !matches!(settings.method.as_str(), "GET" | "HEAD");
        Ok(HttpRequest {
            method: settings.method.clone(),
            url: template.render(&settings.url),
            headers,
            body: sends_body.then_some(body),
        })
    }

    /// One delivery attempt. Any non-2xx status is an error.
    pub async fn send(&self, request: HttpRequest) -> Result<()> {
        let url = request.url.clone();
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(status_error(
                "Webhook",
                response.status,
                format!("Webhook failed: {} {}", response.status, response.body.trim()),
                self.classify_errors,
            ));
        }
        debug!(url = %url, status = response.status, "Webhook delivered");
        Ok(())
    }
}
