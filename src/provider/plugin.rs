//! Out-of-process provider plugin client
//!
//! A plugin is an executable that reads one JSON request per line on stdin
//! and writes one JSON response per line on stdout. Responses carry the
//! request's `id`, so the plugin may answer out of order and the client may
//! issue calls concurrently.
//!
//! Request framing:
//!
//! ```text
//! {"id": 7, "op": "create", "type": "random:index:Pet", "inputs": {...}}
//! {"id": 7, "ok": {"id": "pet-42", ...}}
//! {"id": 8, "error": {"kind": "rejected", "message": "length must be > 0"}}
//! ```
//!
//! A reader task routes each response to the waiting caller through a
//! pending-request map keyed by id. Callers wait under a deadline; expiry
//! and a dead plugin both surface as [`ProviderError::Unavailable`].

use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::{DiffResponse, ProviderClient, ProviderError};
use crate::value::Value;

/// Outcome routed back to a waiting caller
type WireResult = Result<serde_json::Value, ProviderError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    id: u64,
    op: &'static str,
    #[serde(rename = "type")]
    resource_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inputs: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    desired: Option<&'a Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default)]
    ok: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    kind: String,
    message: String,
}

impl From<WireError> for ProviderError {
    fn from(e: WireError) -> Self {
        match e.kind.as_str() {
            "rejected" => ProviderError::Rejected(e.message),
            _ => ProviderError::Unavailable(e.message),
        }
    }
}

struct PluginInner {
    name: String,
    pending: DashMap<u64, oneshot::Sender<WireResult>>,
    next_id: AtomicU64,
    stdin: Mutex<ChildStdin>,
    deadline: Duration,
}

/// Client for one plugin process
///
/// Cloning is cheap and shares the underlying process. The process is
/// killed when the last clone drops.
#[derive(Clone)]
pub struct PluginClient {
    inner: Arc<PluginInner>,
    _child: Arc<Mutex<Child>>,
}

impl PluginClient {
    /// Spawn a plugin executable and connect to its stdio
    ///
    /// Every request issued through the returned client carries `deadline`;
    /// expiry surfaces as [`ProviderError::Unavailable`].
    pub fn spawn(
        program: impl AsRef<OsStr>,
        args: &[&str],
        deadline: Duration,
    ) -> Result<Self, ProviderError> {
        let name = program.as_ref().to_string_lossy().into_owned();
        let mut child = Command::new(program.as_ref())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::unavailable(format!("spawning {name}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::unavailable("plugin stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::unavailable("plugin stdout not captured"))?;

        let inner = Arc::new(PluginInner {
            name,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(stdin),
            deadline,
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WireResponse>(&line) {
                        Ok(response) => reader_inner.dispatch(response),
                        Err(e) => {
                            warn!(
                                plugin = %reader_inner.name,
                                error = %e,
                                "Discarding malformed plugin response"
                            );
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(plugin = %reader_inner.name, error = %e, "Plugin read failed");
                        break;
                    }
                }
            }
            reader_inner.fail_all_pending("plugin exited");
        });

        Ok(Self {
            inner,
            _child: Arc::new(Mutex::new(child)),
        })
    }

    async fn request(
        &self,
        op: &'static str,
        resource_type: &str,
        resource_id: Option<&str>,
        inputs: Option<&Value>,
        prior: Option<&Value>,
        desired: Option<&Value>,
    ) -> WireResult {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WireRequest {
            id,
            op,
            resource_type,
            resource_id,
            inputs,
            prior,
            desired,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| ProviderError::unavailable(format!("encoding request: {e}")))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        {
            let mut stdin = self.inner.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.inner.pending.remove(&id);
                return Err(ProviderError::unavailable(format!(
                    "writing to plugin {}: {e}",
                    self.inner.name
                )));
            }
            if let Err(e) = stdin.flush().await {
                self.inner.pending.remove(&id);
                return Err(ProviderError::unavailable(format!(
                    "flushing plugin {}: {e}",
                    self.inner.name
                )));
            }
        }

        debug!(plugin = %self.inner.name, request_id = id, op, "Dispatched plugin request");

        match tokio::time::timeout(self.inner.deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProviderError::unavailable(format!(
                "plugin {} dropped the request",
                self.inner.name
            ))),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(ProviderError::unavailable(format!(
                    "plugin {} deadline of {:?} exceeded",
                    self.inner.name, self.inner.deadline
                )))
            }
        }
    }
}

impl PluginInner {
    fn dispatch(&self, response: WireResponse) {
        let Some((_, tx)) = self.pending.remove(&response.id) else {
            warn!(
                plugin = %self.name,
                request_id = response.id,
                "Response for unknown request id"
            );
            return;
        };
        let result = match (response.ok, response.error) {
            (_, Some(error)) => Err(error.into()),
            (Some(ok), None) => Ok(ok),
            (None, None) => Ok(serde_json::Value::Null),
        };
        // Receiver may have timed out; nothing to do then
        let _ = tx.send(result);
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(ProviderError::unavailable(format!(
                    "{}: {reason}",
                    self.name
                ))));
            }
        }
    }
}

#[async_trait::async_trait]
impl ProviderClient for PluginClient {
    async fn diff(
        &self,
        resource_type: &str,
        prior_inputs: &Value,
        desired_inputs: &Value,
    ) -> Result<DiffResponse, ProviderError> {
        let ok = self
            .request(
                "diff",
                resource_type,
                None,
                None,
                Some(prior_inputs),
                Some(desired_inputs),
            )
            .await?;
        serde_json::from_value(ok)
            .map_err(|e| ProviderError::unavailable(format!("malformed diff response: {e}")))
    }

    async fn create(
        &self,
        resource_type: &str,
        inputs: &Value,
    ) -> Result<Value, ProviderError> {
        let ok = self
            .request("create", resource_type, None, Some(inputs), None, None)
            .await?;
        Ok(Value::from_json(&ok))
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        prior_inputs: &Value,
        desired_inputs: &Value,
    ) -> Result<Value, ProviderError> {
        let ok = self
            .request(
                "update",
                resource_type,
                Some(id),
                None,
                Some(prior_inputs),
                Some(desired_inputs),
            )
            .await?;
        Ok(Value::from_json(&ok))
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), ProviderError> {
        self.request("delete", resource_type, Some(id), None, None, None)
            .await?;
        Ok(())
    }
}
