//! Per-session worker lifecycle: containers and local child processes.
//!
//! A *worker* hosts one agent loop behind a small HTTP surface (`POST /query`
//! streaming SSE lines, `GET /health`). The [`ContainerProvider`] contract
//! abstracts how workers are brought up and torn down; two implementations
//! ship here:
//!
//! - [`DockerProvider`] drives an external container runtime through its CLI,
//!   with enforced cpu/memory limits and a named virtual network.
//! - [`ProcessProvider`] spawns the worker as a local child process bound to
//!   `127.0.0.1` on an incrementing port, for development without a runtime.
//!
//! Both block in `create_container` until the worker answers `/health`, and
//! both stream `/query` responses line-by-line to the caller.

use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Lazy sequence of server-sent lines from a worker.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const DEFAULT_WORKER_PORT: u16 = 3000;
const DEFAULT_BASE_PORT: u16 = 3100;
const QUERY_TIMEOUT: Duration = Duration::from_secs(300);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Opaque handle to a running worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Which provider produced this handle ("docker" or "process").
    pub provider: String,
    pub agent_id: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Resource limits for a worker.
///
/// `cpu_quota` follows the preset convention: values >= 100 are
/// microseconds-per-100ms (100000 = 1 CPU); smaller values are CPU counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Agent configuration injected into a worker as `AGENT_CONFIG_JSON`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

/// Abstract worker lifecycle.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Create a worker and block until it is healthy.
    async fn create_container(
        &self,
        session_id: &str,
        agent_id: &str,
        config: &WorkerConfig,
        api_key: &str,
    ) -> Result<ContainerInfo>;

    /// Tear the worker down. Idempotent.
    async fn stop_container(&self, info: &ContainerInfo) -> Result<()>;

    /// Stream a query through the worker, one server-sent line at a time.
    async fn execute_query(
        &self,
        info: &ContainerInfo,
        message: &str,
        history: &[Message],
    ) -> Result<LineStream>;

    /// Whether the worker currently answers its health endpoint.
    async fn health_check(&self, info: &ContainerInfo) -> bool;
}

/// Interpret a configured cpu quota as a CPU count, clamped to [0.01, 14.0].
pub(crate) fn cpus_from_quota(quota: Option<f64>) -> f64 {
    let cpus = match quota {
        Some(q) if q >= 100.0 => q / 100_000.0,
        Some(q) if q > 0.0 => q,
        _ => 2.0,
    };
    cpus.clamp(0.01, 14.0)
}

/// Split a byte stream into non-empty lines, tolerating fragments that break
/// mid-line.
pub(crate) fn lines_stream(response: reqwest::Response) -> LineStream {
    struct LinesCtx {
        source: Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>,
        buffer: String,
        ready: VecDeque<String>,
        done: bool,
    }

    let ctx = LinesCtx {
        source: Box::pin(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()))),
        buffer: String::new(),
        ready: VecDeque::new(),
        done: false,
    };

    let stream = futures::stream::try_unfold(ctx, |mut ctx| async move {
        loop {
            if let Some(line) = ctx.ready.pop_front() {
                return Ok(Some((line, ctx)));
            }
            if ctx.done {
                return Ok(None);
            }

            match ctx.source.next().await {
                Some(Ok(bytes)) => {
                    ctx.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = ctx.buffer.find('\n') {
                        let line = ctx.buffer[..pos].trim_end_matches('\r').to_string();
                        ctx.buffer.drain(..=pos);
                        if !line.is_empty() {
                            ctx.ready.push_back(line);
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(crate::providers::error_from_transport(e));
                }
                None => {
                    ctx.done = true;
                    let rest = std::mem::take(&mut ctx.buffer);
                    let rest = rest.trim_end_matches('\r');
                    if !rest.is_empty() {
                        ctx.ready.push_back(rest.to_string());
                    }
                }
            }
        }
    });

    Box::pin(stream)
}

async fn post_query(
    http: &reqwest::Client,
    info: &ContainerInfo,
    message: &str,
    history: &[Message],
) -> Result<LineStream> {
    let url = format!("http://{}:{}/query", info.host, info.port);
    let response = http
        .post(&url)
        .timeout(QUERY_TIMEOUT)
        .header("Accept", "text/event-stream")
        .json(&serde_json::json!({"message": message, "history": history}))
        .send()
        .await
        .map_err(crate::providers::error_from_transport)?;

    if !response.status().is_success() {
        return Err(Error::provider(
            "worker",
            format!("query failed with status {}", response.status()),
            Some(response.status().as_u16()),
        ));
    }

    Ok(lines_stream(response))
}

async fn probe_health(http: &reqwest::Client, host: &str, port: u16) -> bool {
    let url = format!("http://{}:{}/health", host, port);
    match http.get(&url).timeout(HEALTH_PROBE_TIMEOUT).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Poll `/health` until 200 OK or the deadline passes.
async fn wait_for_healthy(
    http: &reqwest::Client,
    host: &str,
    port: u16,
    deadline: Duration,
) -> Result<()> {
    let started = tokio::time::Instant::now();
    loop {
        if probe_health(http, host, port).await {
            log::info!("worker healthy at {}:{}", host, port);
            return Ok(());
        }
        if started.elapsed() >= deadline {
            return Err(Error::HealthCheckTimeout(deadline));
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

fn worker_env(session_id: &str, config: &WorkerConfig, api_key: &str) -> Vec<(String, String)> {
    vec![
        (
            "ANTHROPIC_API_KEY".to_string(),
            std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| api_key.to_string()),
        ),
        (
            "OPENAI_API_KEY".to_string(),
            std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| api_key.to_string()),
        ),
        (
            "AGENT_CONFIG_JSON".to_string(),
            serde_json::to_string(config).unwrap_or_else(|_| "{}".to_string()),
        ),
        ("SESSION_ID".to_string(), session_id.to_string()),
    ]
}

// ============================================================================
// DOCKER PROVIDER
// ============================================================================

/// Worker provider backed by an external container runtime CLI.
pub struct DockerProvider {
    network: String,
    image: String,
    health_timeout: Duration,
    http: reqwest::Client,
}

impl DockerProvider {
    pub fn new(network: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            image: image.into(),
            health_timeout: Duration::from_secs(60),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ContainerStart(format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ContainerStart(format!(
                "docker {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerProvider for DockerProvider {
    async fn create_container(
        &self,
        session_id: &str,
        agent_id: &str,
        config: &WorkerConfig,
        api_key: &str,
    ) -> Result<ContainerInfo> {
        let container_name = format!("uas-{}", agent_id);
        let workspace_volume = format!("uas-workspace-{}", agent_id);

        let cpus = cpus_from_quota(config.resource_limits.cpu_quota);
        let memory = config
            .resource_limits
            .memory_limit
            .clone()
            .unwrap_or_else(|| "4g".to_string());

        let cpus_arg = format!("{}", cpus);
        let volume_arg = format!("{}:/workspace", workspace_volume);
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            container_name.clone(),
            "--network".into(),
            self.network.clone(),
            "-v".into(),
            volume_arg,
            "--cpus".into(),
            cpus_arg,
            "--memory".into(),
            memory,
        ];
        for (key, value) in worker_env(session_id, config, api_key) {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let container_id = self.docker(&arg_refs).await?;
        log::info!(
            "created container {} ({})",
            container_name,
            &container_id[..container_id.len().min(12)]
        );

        // Resolve the worker's address on the named network
        let container_ip = self
            .docker(&[
                "inspect",
                "-f",
                "{{range.NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
                &container_name,
            ])
            .await?;

        let info = ContainerInfo {
            provider: "docker".to_string(),
            agent_id: agent_id.to_string(),
            host: container_ip,
            port: DEFAULT_WORKER_PORT,
            container_id: Some(container_id),
            container_name: Some(container_name),
            workspace: Some(workspace_volume),
            pid: None,
        };

        if let Err(e) = wait_for_healthy(&self.http, &info.host, info.port, self.health_timeout).await
        {
            // Don't leak the container when the worker never came up
            if let Err(stop_err) = self.stop_container(&info).await {
                log::warn!("cleanup after failed start also failed: {}", stop_err);
            }
            return Err(e);
        }

        Ok(info)
    }

    async fn stop_container(&self, info: &ContainerInfo) -> Result<()> {
        if let Some(name) = &info.container_name {
            for args in [vec!["stop", name.as_str()], vec!["rm", name.as_str()]] {
                if let Err(e) = self.docker(&args).await {
                    log::warn!("container teardown step failed: {}", e);
                }
            }
            log::info!("stopped container {}", name);
        }
        if let Some(volume) = &info.workspace {
            if let Err(e) = self.docker(&["volume", "rm", volume]).await {
                log::warn!("volume removal failed: {}", e);
            }
        }
        Ok(())
    }

    async fn execute_query(
        &self,
        info: &ContainerInfo,
        message: &str,
        history: &[Message],
    ) -> Result<LineStream> {
        post_query(&self.http, info, message, history).await
    }

    async fn health_check(&self, info: &ContainerInfo) -> bool {
        probe_health(&self.http, &info.host, info.port).await
    }
}

// ============================================================================
// LOCAL PROCESS PROVIDER
// ============================================================================

/// Worker provider spawning local child processes, for development without a
/// container runtime.
pub struct ProcessProvider {
    /// Command that starts the worker server; receives its config via env.
    command: PathBuf,
    workspace_base: PathBuf,
    base_port: u16,
    next_offset: AtomicU16,
    health_timeout: Duration,
    children: Mutex<HashMap<String, Child>>,
    http: reqwest::Client,
}

impl ProcessProvider {
    pub fn new(command: impl Into<PathBuf>, workspace_base: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workspace_base: workspace_base.into(),
            base_port: DEFAULT_BASE_PORT,
            next_offset: AtomicU16::new(0),
            health_timeout: Duration::from_secs(30),
            children: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    fn next_port(&self) -> u16 {
        self.base_port + self.next_offset.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerProvider for ProcessProvider {
    async fn create_container(
        &self,
        session_id: &str,
        agent_id: &str,
        config: &WorkerConfig,
        api_key: &str,
    ) -> Result<ContainerInfo> {
        let port = self.next_port();
        let workspace = self.workspace_base.join(agent_id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| Error::ContainerStart(format!("workspace creation failed: {}", e)))?;

        let mut command = Command::new(&self.command);
        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env("WORKSPACE_DIR", &workspace)
            .env("PORT", port.to_string());
        for (key, value) in worker_env(session_id, config, api_key) {
            command.env(key, value);
        }

        let child = command
            .spawn()
            .map_err(|e| Error::ContainerStart(format!("failed to spawn worker: {}", e)))?;
        let pid = child.id();

        self.children
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), child);

        let info = ContainerInfo {
            provider: "process".to_string(),
            agent_id: agent_id.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            container_id: None,
            container_name: None,
            workspace: Some(workspace.to_string_lossy().to_string()),
            pid,
        };

        if let Err(e) = wait_for_healthy(&self.http, &info.host, info.port, self.health_timeout).await
        {
            if let Err(stop_err) = self.stop_container(&info).await {
                log::warn!("cleanup after failed start also failed: {}", stop_err);
            }
            return Err(e);
        }

        log::info!("started worker process on port {}", port);
        Ok(info)
    }

    async fn stop_container(&self, info: &ContainerInfo) -> Result<()> {
        let child = self.children.lock().unwrap().remove(&info.agent_id);

        let Some(mut child) = child else {
            return Ok(());
        };

        // Graceful termination first, force-kill after the grace period
        if let Some(pid) = child.id() {
            let _ = Command::new("kill").arg(pid.to_string()).output().await;
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(e) = child.kill().await {
                    log::warn!("force-kill failed for {}: {}", info.agent_id, e);
                }
            }
        }

        log::info!("stopped worker process {}", info.agent_id);
        Ok(())
    }

    async fn execute_query(
        &self,
        info: &ContainerInfo,
        message: &str,
        history: &[Message],
    ) -> Result<LineStream> {
        post_query(&self.http, info, message, history).await
    }

    async fn health_check(&self, info: &ContainerInfo) -> bool {
        probe_health(&self.http, &info.host, info.port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quota_conversion() {
        // Microseconds-per-100ms form
        assert_eq!(cpus_from_quota(Some(100_000.0)), 1.0);
        assert_eq!(cpus_from_quota(Some(200_000.0)), 2.0);
        // Direct CPU count form
        assert_eq!(cpus_from_quota(Some(1.5)), 1.5);
        // Defaults and clamping
        assert_eq!(cpus_from_quota(None), 2.0);
        assert_eq!(cpus_from_quota(Some(5_000_000.0)), 14.0);
        assert_eq!(cpus_from_quota(Some(100.0)), 0.01);
        assert_eq!(cpus_from_quota(Some(0.001)), 0.01);
    }

    #[test]
    fn test_worker_config_serialization() {
        let config = WorkerConfig {
            provider: "anthropic".to_string(),
            model: Some("claude-sonnet-4-20250514".to_string()),
            allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
            resource_limits: ResourceLimits {
                cpu_quota: Some(200_000.0),
                memory_limit: Some("4g".to_string()),
            },
            ..WorkerConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["provider"], "anthropic");
        assert_eq!(json["allowed_tools"][1], "Grep");
        assert_eq!(json["resource_limits"]["memory_limit"], "4g");

        let back: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.model.as_deref(), Some("claude-sonnet-4-20250514"));
    }

    #[test]
    fn test_worker_config_defaults_from_empty_json() {
        let config: WorkerConfig = serde_json::from_str("{}").unwrap();
        assert!(config.allowed_tools.is_empty());
        assert!(!config.enable_thinking);
        assert!(config.resource_limits.cpu_quota.is_none());
    }

    #[test]
    fn test_process_provider_port_allocation() {
        let provider = ProcessProvider::new("worker", "/tmp/uas").with_base_port(4000);
        assert_eq!(provider.next_port(), 4000);
        assert_eq!(provider.next_port(), 4001);
        assert_eq!(provider.next_port(), 4002);
    }

    #[test]
    fn test_container_info_roundtrip() {
        let info = ContainerInfo {
            provider: "docker".to_string(),
            agent_id: "agent-1".to_string(),
            host: "172.18.0.2".to_string(),
            port: 3000,
            container_id: Some("abc123".to_string()),
            container_name: Some("uas-agent-1".to_string()),
            workspace: Some("uas-workspace-agent-1".to_string()),
            pid: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("pid").is_none());
        let back: ContainerInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }
}
