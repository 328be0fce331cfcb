//! HTTP request step — call external APIs from a pipeline.
//!
//! Every request holds a resource-gate slot for its duration, so the
//! process-wide cap on concurrent outbound calls holds across all running
//! pipelines.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use pipeclaw_core::{PipeclawError, Result};
use pipeclaw_pipeline::{DataStore, Step, StepOutput};
use pipeclaw_scheduler::ResourceGate;

pub struct HttpRequestStep {
    gate: Arc<ResourceGate>,
}

impl HttpRequestStep {
    pub fn new(gate: Arc<ResourceGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Step for HttpRequestStep {
    fn name(&self) -> &str {
        "http_request"
    }

    async fn execute(&self, params: &Map<String, Value>, _store: &DataStore) -> Result<StepOutput> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipeclawError::step_fatal("http_request", "Missing 'url' param"))?;
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let timeout = params
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(15);

        // Block requests to cloud metadata endpoints.
        let lower_url = url.to_lowercase();
        if lower_url.contains("169.254.") || lower_url.contains("metadata.google") {
            return Err(PipeclawError::step_fatal(
                "http_request",
                "Blocked: cannot access cloud metadata endpoints",
            ));
        }

        let client = reqwest::Client::builder()
            .user_agent("PipeClaw/0.2")
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
            .map_err(|e| PipeclawError::step_fatal("http_request", format!("Client error: {e}")))?;

        let mut request = match method.as_str() {
            "GET" => client.get(url),
            "POST" => client.post(url),
            "PUT" => client.put(url),
            "DELETE" => client.delete(url),
            "PATCH" => client.patch(url),
            "HEAD" => client.head(url),
            _ => {
                return Err(PipeclawError::step_fatal(
                    "http_request",
                    format!("Unsupported method: {method}"),
                ));
            }
        };

        if let Some(headers) = params.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key.as_str(), val_str);
                }
            }
        }

        if let Some(body) = params.get("body").and_then(|v| v.as_str()) {
            request = request.body(body.to_string());
            if body.starts_with('{') || body.starts_with('[') {
                request = request.header("Content-Type", "application/json");
            }
        }

        // Hold a gate slot only for the call itself.
        let response = {
            let _permit = self.gate.acquire().await?;
            request
                .send()
                .await
                .map_err(|e| PipeclawError::step("http_request", format!("Request failed: {e}")))?
        };

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| PipeclawError::step("http_request", format!("Read body failed: {e}")))?;

        if status.is_server_error() {
            return Err(PipeclawError::step(
                "http_request",
                format!("HTTP {status} from {url}"),
            ));
        }
        if status.is_client_error() {
            // 4xx won't improve on retry.
            return Err(PipeclawError::step_fatal(
                "http_request",
                format!("HTTP {status} from {url}"),
            ));
        }

        // Truncate very large responses.
        let body_display = if body_text.len() > 8000 {
            let mut end = 8000;
            while end > 0 && !body_text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}… [truncated, {} total bytes]", &body_text[..end], body_text.len())
        } else {
            body_text
        };

        tracing::info!("🌐 http_request {method} {url} → {status}");
        Ok(StepOutput::empty()
            .context("http_response", body_display)
            .value("http_status", status.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step() -> HttpRequestStep {
        HttpRequestStep::new(Arc::new(ResourceGate::new(2)))
    }

    fn store() -> DataStore {
        DataStore::new(json!({}), Map::new())
    }

    #[tokio::test]
    async fn test_missing_url_is_fatal() {
        let err = step().execute(&Map::new(), &store()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_metadata_endpoint_blocked() {
        let mut params = Map::new();
        params.insert("url".into(), json!("http://169.254.169.254/latest/meta-data"));
        let err = step().execute(&params, &store()).await.unwrap_err();
        assert!(err.to_string().contains("metadata"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unsupported_method_is_fatal() {
        let mut params = Map::new();
        params.insert("url".into(), json!("https://example.com"));
        params.insert("method".into(), json!("TRACE"));
        let err = step().execute(&params, &store()).await.unwrap_err();
        assert!(err.to_string().contains("Unsupported method"));
    }
}
