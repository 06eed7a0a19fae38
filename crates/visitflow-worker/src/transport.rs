use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method};

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::traits::{HttpRequest, HttpResponse, HttpTransport};

/// `HttpTransport` over a shared reqwest client.
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| VisitflowError::Http(e.to_string()))?;
        Ok(Self { http })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| {
                VisitflowError::Validation(format!("invalid HTTP method '{}'", request.method))
            })?;
            let mut builder = self.http.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| VisitflowError::Http(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Ok(HttpResponse { status, body })
        })
    }
}
