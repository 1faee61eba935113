//src/invoke.rs

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{DeploymentMode, HeatmapConfig};
use crate::error::{HeatmapError, ItemFailure, Result};

/// Synchronous request/response call to an out-of-band job (indexing, eviction).
pub trait FunctionInvoker: Send + Sync {
    fn invoke(&self, function_name: &str, payload: &Value) -> Result<Value>;
}

/// Local function emulator: `POST {endpoint}/2015-03-31/functions/{name}/invocations`.
pub struct LocalHttpInvoker {
    endpoint: String,
    client: Client,
}

impl LocalHttpInvoker {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

impl FunctionInvoker for LocalHttpInvoker {
    fn invoke(&self, function_name: &str, payload: &Value) -> Result<Value> {
        let url = format!(
            "{}/2015-03-31/functions/{}/invocations",
            self.endpoint, function_name
        );
        send_invocation(self.client.post(&url).json(payload), function_name)
    }
}

/// Managed invocation gateway: `POST {endpoint}/functions/{name}/invoke`, bearer-authenticated.
pub struct ManagedFunctionInvoker {
    endpoint: String,
    token: Option<String>,
    client: Client,
}

impl ManagedFunctionInvoker {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

impl FunctionInvoker for ManagedFunctionInvoker {
    fn invoke(&self, function_name: &str, payload: &Value) -> Result<Value> {
        let url = format!("{}/functions/{}/invoke", self.endpoint, function_name);
        let mut request = self.client.post(&url).json(payload);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        send_invocation(request, function_name)
    }
}

fn send_invocation(request: RequestBuilder, function_name: &str) -> Result<Value> {
    let invocation_error = |message: String| HeatmapError::Invocation {
        function: function_name.to_string(),
        message,
    };
    let response = request.send().map_err(|e| invocation_error(e.to_string()))?;
    let status = response.status();
    let text = response.text().map_err(|e| invocation_error(e.to_string()))?;
    if !status.is_success() {
        return Err(invocation_error(format!("status {status}: {}", text.trim())));
    }
    let value: Value = serde_json::from_str(&text)?;
    unwrap_function_response(value).map_err(invocation_error)
}

/// Strips gateway envelopes and turns function-level crashes into errors.
///
/// A `{"statusCode": .., "body": "<json>"}` envelope is unwrapped; `errorMessage`
/// means the function itself failed.
pub fn unwrap_function_response(value: Value) -> std::result::Result<Value, String> {
    if let Some(message) = value.get("errorMessage").and_then(Value::as_str) {
        return Err(message.to_string());
    }
    match (value.get("statusCode").and_then(Value::as_u64), value.get("body")) {
        (Some(code), _) if code >= 300 => Err(format!("function returned status {code}")),
        (Some(_), Some(Value::String(body))) => {
            serde_json::from_str(body).map_err(|e| format!("function body is not JSON: {e}"))
        }
        (Some(_), Some(body)) => Ok(body.clone()),
        _ => Ok(value),
    }
}

/// Per-item failures reported by a batch job, e.g.
/// `{"errors": [{"pipeline_run_id": 7, "background_id": 26, "error": "..."}]}`.
pub fn item_failures(response: &Value) -> Vec<ItemFailure> {
    let Some(errors) = response.get("errors").and_then(Value::as_array) else {
        return Vec::new();
    };
    errors
        .iter()
        .map(|e| ItemFailure {
            pipeline_run_id: e.get("pipeline_run_id").and_then(Value::as_u64),
            background_id: e.get("background_id").and_then(Value::as_u64),
            message: e
                .get("error")
                .or_else(|| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HeatmapConfig) -> Self {
        Self {
            attempts: config.retry_attempts,
            backoff: config.retry_backoff(),
        }
    }
}

/// Invokes with a fixed backoff between attempts; the last error is returned once attempts run out.
pub fn invoke_with_retry(
    invoker: &dyn FunctionInvoker,
    function_name: &str,
    payload: &Value,
    policy: RetryPolicy,
) -> Result<Value> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match invoker.invoke(function_name, payload) {
            Ok(response) => return Ok(response),
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Invocation of {function_name} failed (attempt {attempt}/{attempts}): {e}; retrying in {:?}",
                    policy.backoff
                );
                thread::sleep(policy.backoff);
                attempt += 1;
            }
            Err(e) => {
                log::error!("Invocation of {function_name} failed after {attempts} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}

/// Picks the transport once, at startup, from the deployment mode.
pub fn invoker_from_config(config: &HeatmapConfig) -> Result<Arc<dyn FunctionInvoker>> {
    Ok(match config.deployment_mode {
        DeploymentMode::Local => Arc::new(LocalHttpInvoker::new(
            &config.function_endpoint,
            config.timeout(),
        )?),
        DeploymentMode::Managed => Arc::new(ManagedFunctionInvoker::new(
            &config.function_endpoint,
            config.function_token.clone(),
            config.timeout(),
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInvoker;
    use serde_json::json;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn no_wait(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn retry_succeeds_on_second_attempt() {
        let failures = AtomicUsize::new(0);
        let invoker = FakeInvoker::new(move |_, _| {
            if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HeatmapError::Invocation {
                    function: "taxon-indexing".into(),
                    message: "connection reset".into(),
                })
            } else {
                Ok(json!({"status": "ok"}))
            }
        });
        let response =
            invoke_with_retry(&invoker, "taxon-indexing", &json!({}), no_wait(2)).unwrap();
        assert_eq!(response, json!({"status": "ok"}));
        assert_eq!(invoker.calls().len(), 2);
    }

    #[test]
    fn retry_gives_up_after_configured_attempts() {
        let invoker = FakeInvoker::new(|name, _| {
            Err(HeatmapError::Invocation {
                function: name.to_string(),
                message: "timed out".into(),
            })
        });
        let err = invoke_with_retry(&invoker, "taxon-indexing", &json!({}), no_wait(2)).unwrap_err();
        assert!(matches!(err, HeatmapError::Invocation { ref message, .. } if message == "timed out"));
        assert_eq!(invoker.calls().len(), 2);
    }

    #[test]
    fn default_policy_is_two_attempts_three_seconds_apart() {
        assert_eq!(
            RetryPolicy::from_config(&HeatmapConfig::default()),
            RetryPolicy {
                attempts: 2,
                backoff: Duration::from_secs(3),
            }
        );
    }

    #[test]
    fn backoff_sleeps_between_attempts_only() {
        let backoff = Duration::from_millis(50);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let invoker = FakeInvoker::new(move |name, _| {
            recorder.lock().push(Instant::now());
            Err(HeatmapError::Invocation {
                function: name.to_string(),
                message: "connection refused".into(),
            })
        });
        let policy = RetryPolicy { attempts: 3, backoff };

        assert!(invoke_with_retry(&invoker, "taxon-indexing", &json!({}), policy).is_err());
        let returned = Instant::now();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[1] - seen[0] >= backoff);
        assert!(seen[2] - seen[1] >= backoff);
        assert!(returned - seen[2] < backoff);
    }

    #[test]
    fn gateway_envelope_is_unwrapped() {
        let wrapped = json!({"statusCode": 200, "body": "{\"errors\": []}"});
        assert_eq!(unwrap_function_response(wrapped).unwrap(), json!({"errors": []}));
        assert!(unwrap_function_response(json!({"statusCode": 502, "body": ""})).is_err());
        assert!(unwrap_function_response(json!({"errorMessage": "boom"})).is_err());
        assert_eq!(
            unwrap_function_response(json!({"status": "ok"})).unwrap(),
            json!({"status": "ok"})
        );
    }

    #[test]
    fn item_failures_are_extracted() {
        let response = json!({"errors": [
            {"pipeline_run_id": 7, "background_id": 26, "error": "no report"},
            {"message": "unknown"}
        ]});
        let failures = item_failures(&response);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].pipeline_run_id, Some(7));
        assert_eq!(failures[0].message, "no report");
        assert_eq!(failures[1].pipeline_run_id, None);
        assert!(item_failures(&json!({"status": "ok"})).is_empty());
    }
}
