use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::delegate::{DelegateError, HostDelegate};
use crate::error::{PlugletError, Result};
use crate::marshal::{body_to_data, headers_to_map, FetchResponse};
use crate::shim::FETCH_SHIM;

/// Request options a plugin may pass as the second `fetch` argument.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FetchArgs {
    url: String,
    #[serde(default)]
    options: FetchOptions,
}

/// Network fetch capability backed by one shared HTTP client.
pub struct FetchDelegate {
    client: Client,
    config: FetchConfig,
}

impl FetchDelegate {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PlugletError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Perform one request. No retries: a failed call fails the delegate.
    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> std::result::Result<FetchResponse, DelegateError> {
        let parsed = Url::parse(url)
            .map_err(|e| DelegateError::new(format!("Invalid URL '{}': {}", url, e)))?;

        if !self
            .config
            .allowed_schemes
            .iter()
            .any(|s| s == parsed.scheme())
        {
            return Err(DelegateError::new(format!(
                "URL scheme '{}' is not allowed",
                parsed.scheme()
            )));
        }

        let method_name = options
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| DelegateError::new(format!("Invalid HTTP method '{}'", method_name)))?;

        debug!(url = %url, method = %method, "Delegate: starting fetch");

        let mut request = self.client.request(method, parsed);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match options.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text),
            Some(other) => request.json(&other),
        };

        let mut response = request.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Delegate: fetch failed");
            DelegateError::from(e)
        })?;

        let status = response.status();
        let headers = headers_to_map(response.headers());
        let max = self.config.max_body_bytes;

        if response.content_length().is_some_and(|len| len as usize > max) {
            return Err(body_too_large(max));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > max {
                return Err(body_too_large(max));
            }
            body.extend_from_slice(&chunk);
        }

        info!(
            url = %url,
            status = status.as_u16(),
            bytes = body.len(),
            "Delegate: fetch completed"
        );

        Ok(FetchResponse::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            headers,
            body_to_data(&body),
        ))
    }
}

fn body_too_large(max: usize) -> DelegateError {
    DelegateError::new(format!("Response body exceeds {} bytes", max))
}

#[async_trait]
impl HostDelegate for FetchDelegate {
    fn name(&self) -> &str {
        "fetch"
    }

    fn shim(&self) -> &str {
        FETCH_SHIM
    }

    async fn call(&self, args: Value) -> std::result::Result<Value, DelegateError> {
        let args: FetchArgs = serde_json::from_value(args)
            .map_err(|e| DelegateError::new(format!("Invalid fetch arguments: {}", e)))?;
        let response = self.fetch(&args.url, args.options).await?;
        serde_json::to_value(response).map_err(|e| DelegateError::new(e.to_string()))
    }
}
