//! HTTP requests.

use crate::{hand_back, runtime};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serialq_core::{Completion, Config, Instance, Status, Task, TaskError, Value};
use tracing::{debug, warn};
use ulid::Ulid;

/// `sq.Http` defaults.
pub(crate) fn defaults() -> Config {
    Config::new()
        .with("type", "GET")
        .with("contentType", "application/x-www-form-urlencoded")
        .with("accepts", "*/*")
        .with("cache", false)
        .with("dataType", "json")
}

/// Sends one request and records the response body.
///
/// A 2xx response sets `success` with the body parsed per `dataType` (`json`
/// or anything else for text). Any other status, a transport error or an
/// unparseable JSON body sets `failure`.
pub struct HttpTask {
    client: reqwest::Client,
}

impl HttpTask {
    /// Create the adapter over `client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataType {
    Json,
    Text,
}

impl Task for HttpTask {
    fn execute(&self, instance: &Instance, done: Completion) -> Result<(), TaskError> {
        let config = instance.configure();
        let url = request_url(config.require_str("url")?, config.bool("cache").unwrap_or(false));
        let method_name = config.str("type").unwrap_or("GET");
        let method = Method::from_bytes(method_name.to_ascii_uppercase().as_bytes())
            .map_err(|_| TaskError::Other(format!("invalid request method `{method_name}`")))?;
        let data_type = match config.str("dataType") {
            Some("json") | None => DataType::Json,
            Some(_) => DataType::Text,
        };

        let mut request = self
            .client
            .request(method, &url)
            .header(CONTENT_TYPE, config.str("contentType").unwrap_or_default())
            .header(ACCEPT, config.str("accepts").unwrap_or("*/*"));
        if let Some(user) = config.str("user").filter(|u| !u.is_empty()) {
            request = request.basic_auth(user, config.str("password"));
        }
        match config.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => request = request.body(s.clone()),
            Some(other) => request = request.body(other.to_json().to_string()),
        }
        let rt = runtime(instance)?;

        let instance = instance.clone();
        rt.spawn(async move {
            debug!(task = %instance.id(), url = %url, "sending request");
            match fetch(request, data_type).await {
                Ok(results) => {
                    instance.set_status(Status::Success);
                    instance.set_results(results);
                }
                Err(reason) => {
                    warn!(task = %instance.id(), url = %url, reason = %reason, "request failed");
                    instance.set_status(Status::Failure);
                }
            }
            hand_back(&instance, done);
        });
        Ok(())
    }
}

async fn fetch(request: reqwest::RequestBuilder, data_type: DataType) -> Result<Value, String> {
    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("status {status}"));
    }
    let text = response.text().await.map_err(|e| e.to_string())?;
    match data_type {
        DataType::Json => serde_json::from_str::<serde_json::Value>(&text)
            .map(Value::from)
            .map_err(|e| format!("invalid JSON body: {e}")),
        DataType::Text => Ok(Value::String(text)),
    }
}

/// Append a cache buster unless caching is allowed.
fn request_url(url: &str, cache: bool) -> String {
    if cache {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}_={}", cache_token())
}

/// Eight characters from the random part of a fresh ULID.
fn cache_token() -> String {
    let ulid = Ulid::new().to_string();
    ulid[ulid.len() - 8..].to_string()
}
