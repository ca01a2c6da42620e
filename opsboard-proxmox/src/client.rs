//! reqwest-based implementation of [`ClusterApi`] for Proxmox VE.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{is_transient, ProxmoxError, Result};
use crate::traits::ClusterApi;
use crate::types::*;

/// Floor for the per-call deadline, so a very short configured wait does
/// not starve slow cluster operations.
const MIN_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff before the single transport retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(400);

/// Upper bound of the random jitter added to the backoff.
const RETRY_JITTER_MS: u64 = 160;

/// Body signature Proxmox sends when a request field is not part of the
/// exec schema of that cluster version.
pub(crate) const SCHEMA_REJECTION: &str = "property is not defined in schema";

/// Connection settings for [`ProxmoxClient`].
#[derive(Debug, Clone)]
pub struct ProxmoxSettings {
    /// API base URL, e.g. `https://pve.example:8006/api2/json`.
    pub base_url: String,
    /// API token id, e.g. `ops@pam!board`.
    pub token_id: String,
    /// API token secret.
    pub token_secret: String,
    /// Configured wait for remote calls; floored to 30s per call.
    pub default_wait: Duration,
    /// Accept self-signed cluster certificates.
    pub insecure_tls: bool,
}

/// Low-level typed client for the Proxmox control API.
///
/// Every call attaches the static token header, is bounded by
/// `max(30s, default_wait)`, and retries once with backoff and jitter on
/// transient transport errors. Non-2xx responses become
/// [`ProxmoxError::Api`] with the numeric status and raw body.
pub struct ProxmoxClient {
    http: reqwest::Client,
    settings: ProxmoxSettings,
    call_timeout: Duration,
}

impl ProxmoxClient {
    /// Build the client. Logs a masked form of the auth header so a
    /// misconfigured token is visible without leaking the secret.
    pub fn new(settings: ProxmoxSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.insecure_tls)
            .build()?;

        let call_timeout = settings.default_wait.max(MIN_CALL_TIMEOUT);

        let client = Self {
            http,
            settings,
            call_timeout,
        };
        info!(auth = %mask_secret(&client.auth_header()), "Proxmox client ready");
        Ok(client)
    }

    fn auth_header(&self) -> String {
        format!(
            "PVEAPIToken={}={}",
            self.settings.token_id, self.settings.token_secret
        )
    }

    /// Generic authenticated GET returning the raw JSON response
    /// (including the `data` envelope). Used by discovery helpers.
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await.and_then(data)
    }

    async fn post_value(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.request(Method::POST, path, body).await
    }

    /// POST to a lifecycle endpoint; the response `data` is the task id.
    async fn post_task(&self, path: &str) -> Result<String> {
        self.post_value(path, None).await.and_then(data::<String>)
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        match self.send_once(method.clone(), path, body.as_ref()).await {
            Err(ProxmoxError::Transport(err)) if is_transient(&err) => {
                let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
                let backoff = RETRY_BACKOFF + Duration::from_millis(jitter);
                debug!(
                    path,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient transport error, retrying once"
                );
                tokio::time::sleep(backoff).await;
                self.send_once(method, path, body.as_ref()).await
            }
            other => other,
        }
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.settings.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header(header::AUTHORIZATION, self.auth_header())
            .header(header::ACCEPT, "application/json")
            .timeout(self.call_timeout);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxmoxError::api(status.as_u16(), body));
        }
        Ok(resp.json::<Value>().await?)
    }
}

#[async_trait]
impl ClusterApi for ProxmoxClient {
    async fn start_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.post_task(&format!("/nodes/{node}/qemu/{vmid}/status/start"))
            .await
    }

    async fn shutdown_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.post_task(&format!("/nodes/{node}/qemu/{vmid}/status/shutdown"))
            .await
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.post_task(&format!("/nodes/{node}/qemu/{vmid}/status/stop"))
            .await
    }

    async fn reset_vm(&self, node: &str, vmid: u32) -> Result<String> {
        self.post_task(&format!("/nodes/{node}/qemu/{vmid}/status/reset"))
            .await
    }

    async fn vm_current_status(&self, node: &str, vmid: u32) -> Result<VmCurrentStatus> {
        self.get_data(&format!("/nodes/{node}/qemu/{vmid}/status/current"))
            .await
    }

    async fn agent_ping(&self, node: &str, vmid: u32) -> Result<()> {
        self.get_json(&format!("/nodes/{node}/qemu/{vmid}/agent/ping"))
            .await
            .map(|_| ())
    }

    async fn agent_os_info(&self, node: &str, vmid: u32) -> Result<OsInfo> {
        // get-osinfo nests the payload one level deeper: {"data":{"result":{...}}}
        let value = self
            .get_json(&format!("/nodes/{node}/qemu/{vmid}/agent/get-osinfo"))
            .await?;
        let inner = value
            .pointer("/data/result")
            .cloned()
            .unwrap_or_else(|| value.get("data").cloned().unwrap_or(Value::Null));
        serde_json::from_value(inner).map_err(|e| ProxmoxError::Decode(e.to_string()))
    }

    async fn agent_network_interfaces(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<Vec<NetworkInterface>> {
        let value = self
            .get_json(&format!(
                "/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"
            ))
            .await?;
        let inner = value
            .pointer("/data/result")
            .cloned()
            .unwrap_or_else(|| value.get("data").cloned().unwrap_or(Value::Null));
        serde_json::from_value(inner).map_err(|e| ProxmoxError::Decode(e.to_string()))
    }

    async fn guest_exec(
        &self,
        node: &str,
        vmid: u32,
        command: &[String],
        input: Option<&str>,
    ) -> Result<u32> {
        if command.is_empty() {
            return Err(ProxmoxError::InvalidRequest(
                "command must contain at least the program".into(),
            ));
        }
        let path = format!("/nodes/{node}/qemu/{vmid}/agent/exec");
        let array_form = exec_payload_array(command, input);
        let split_form = exec_payload_split(command, input);
        negotiate_exec(array_form, split_form, |body| {
            self.post_value(&path, Some(body))
        })
        .await
    }

    async fn guest_exec_status(&self, node: &str, vmid: u32, pid: u32) -> Result<ExecStatus> {
        self.get_data(&format!(
            "/nodes/{node}/qemu/{vmid}/agent/exec-status?pid={pid}"
        ))
        .await
    }

    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>> {
        self.get_data("/cluster/resources?type=vm").await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeListItem>> {
        self.get_data("/nodes").await
    }

    async fn list_node_vms(&self, node: &str, kind: VmKind) -> Result<Vec<VmListItem>> {
        self.get_data(&format!("/nodes/{node}/{kind}")).await
    }
}

/// Unwrap the `{"data": ...}` envelope into a typed value.
fn data<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value::<ApiEnvelope<T>>(value)
        .map(|envelope| envelope.data)
        .map_err(|e| ProxmoxError::Decode(e.to_string()))
}

fn exec_pid(value: Value) -> Result<u32> {
    data::<GuestExecStarted>(value).map(|started| started.pid)
}

/// Array-form exec payload: `{"command": [prog, args...]}`.
pub(crate) fn exec_payload_array(command: &[String], input: Option<&str>) -> Value {
    let mut payload = json!({ "command": command });
    if let Some(input) = input.filter(|s| !s.is_empty()) {
        payload["input-data"] = Value::String(input.to_string());
    }
    payload
}

/// Split-form exec payload: `{"command": prog, "args": [args...]}`.
/// Older cluster versions only accept this shape.
pub(crate) fn exec_payload_split(command: &[String], input: Option<&str>) -> Value {
    let (program, args) = match command.split_first() {
        Some((program, args)) => (program.as_str(), args),
        None => ("", &[] as &[String]),
    };
    let mut payload = json!({ "command": program, "args": args });
    if let Some(input) = input.filter(|s| !s.is_empty()) {
        payload["input-data"] = Value::String(input.to_string());
    }
    payload
}

/// A 4xx whose body carries the schema-rejection signature. Only this
/// triggers the split-form fallback.
pub(crate) fn is_schema_rejection(err: &ProxmoxError) -> bool {
    matches!(
        err,
        ProxmoxError::Api { status, body }
            if (400..500).contains(status) && body.contains(SCHEMA_REJECTION)
    )
}

/// Submit a guest command, negotiating the request shape.
///
/// Sends the array form first; if (and only if) the cluster rejects it
/// with the schema signature, retries exactly once with the split form.
/// Any other failure propagates unchanged. The outcome is never cached:
/// every call re-attempts array-first.
pub(crate) async fn negotiate_exec<F, Fut>(
    array_form: Value,
    split_form: Value,
    mut post: F,
) -> Result<u32>
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    match post(array_form).await {
        Ok(value) => exec_pid(value),
        Err(err) if is_schema_rejection(&err) => {
            debug!("array-form exec payload rejected by schema, retrying with split form");
            post(split_form).await.and_then(exec_pid)
        }
        Err(err) => Err(err),
    }
}

/// Mask the secret part of the auth header for logging.
fn mask_secret(header: &str) -> String {
    match header.rfind('=') {
        Some(idx) => {
            let (prefix, secret) = header.split_at(idx + 1);
            let keep: String = secret.chars().take(4).collect();
            format!("{prefix}{keep}********")
        }
        None => header.to_string(),
    }
}
