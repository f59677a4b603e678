//! Session manager: one record per live agent worker.
//!
//! The manager exclusively owns [`AgentSession`] records; each record
//! exclusively owns its container handle. External callers hold only a
//! `session_id` and go through the manager for every operation.
//!
//! A background task sweeps on a 60-second cadence and evicts sessions whose
//! idle time exceeds the configured timeout. Cleanup removes the record from
//! the map *before* the potentially slow container stop, so lookups can never
//! race with partial teardown, and `stop_container` runs exactly once per
//! session.

use crate::container::{ContainerInfo, ContainerProvider, LineStream, WorkerConfig};
use crate::types::Message;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Compact random identifier fragment.
pub(crate) fn random_hex(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Lifecycle state of a session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Idle,
    Stopped,
    Error,
}

/// One live agent session and its worker handle.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub session_id: String,
    pub agent_id: String,
    pub config_id: Option<String>,
    pub config_name: String,
    pub api_key: String,
    pub container_info: ContainerInfo,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    /// Monotonic activity marker used by the eviction sweep.
    last_activity: Instant,
    /// Wall-clock mirror of `last_activity` for summaries.
    last_activity_wall: SystemTime,
    pub message_count: u32,
    pub history: Vec<Message>,
}

impl AgentSession {
    fn new(
        session_id: String,
        agent_id: String,
        config_id: Option<String>,
        config_name: String,
        api_key: String,
        container_info: ContainerInfo,
    ) -> Self {
        Self {
            session_id,
            agent_id,
            config_id,
            config_name,
            api_key,
            container_info,
            status: SessionStatus::Running,
            created_at: SystemTime::now(),
            last_activity: Instant::now(),
            last_activity_wall: SystemTime::now(),
            message_count: 0,
            history: Vec::new(),
        }
    }

    /// Refresh the activity timestamps.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_wall = SystemTime::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            config_id: self.config_id.clone(),
            config_name: self.config_name.clone(),
            status: self.status,
            created_at: self.created_at,
            last_activity: self.last_activity_wall,
            message_count: self.message_count,
        }
    }
}

/// Serializable session summary for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    pub config_name: String,
    pub status: SessionStatus,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    pub message_count: u32,
}

struct Inner {
    sessions: Mutex<HashMap<String, AgentSession>>,
    containers: Arc<dyn ContainerProvider>,
    idle_timeout: Duration,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Process-wide session registry with background idle eviction.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(containers: Arc<dyn ContainerProvider>, idle_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                containers,
                idle_timeout,
                eviction_task: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Start the background eviction task.
    pub async fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        sweep(&inner).await;
                    }
                }
            }
        });

        *self.inner.eviction_task.lock().unwrap() = Some(handle);
        log::info!("session manager started");
    }

    /// Cancel the eviction task, await it, then clean up every session.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self.inner.eviction_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let ids: Vec<String> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for session_id in ids {
            self.cleanup_session(&session_id).await;
        }
        log::info!("session manager stopped");
    }

    /// Create the worker and register a session for it.
    ///
    /// The container is torn down before a start failure propagates, so a
    /// failed launch leaves nothing behind.
    pub async fn launch(
        &self,
        config: &WorkerConfig,
        api_key: &str,
        config_id: Option<String>,
        config_name: &str,
    ) -> Result<SessionInfo> {
        let session_id = format!("sess-{}", random_hex(12));
        let agent_id = format!("agent-{}", random_hex(8));

        let container_info = self
            .inner
            .containers
            .create_container(&session_id, &agent_id, config, api_key)
            .await?;

        let session = AgentSession::new(
            session_id.clone(),
            agent_id,
            config_id,
            config_name.to_string(),
            api_key.to_string(),
            container_info,
        );
        let info = session.to_info();

        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session_id.clone(), session);
        log::info!(
            "created session {} with config {}",
            session_id,
            info.config_id.as_deref().unwrap_or("inline")
        );
        Ok(info)
    }

    /// Register a session for an already-created worker.
    pub fn create_session(
        &self,
        api_key: &str,
        config_id: Option<String>,
        config_name: &str,
        container_info: ContainerInfo,
    ) -> SessionInfo {
        let session_id = format!("sess-{}", random_hex(12));
        let agent_id = format!("agent-{}", random_hex(8));
        let session = AgentSession::new(
            session_id.clone(),
            agent_id,
            config_id,
            config_name.to_string(),
            api_key.to_string(),
            container_info,
        );
        let info = session.to_info();
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session_id, session);
        info
    }

    /// Snapshot of a session record.
    pub fn get_session(&self, session_id: &str) -> Result<AgentSession> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Snapshot of all session summaries.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|session| session.to_info())
            .collect()
    }

    /// Refresh a session's activity timestamp.
    pub fn touch(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.inner.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.touch();
        Ok(())
    }

    /// Append a message to a session's history and bump its counters.
    pub fn record_message(&self, session_id: &str, message: Message) -> Result<()> {
        let mut sessions = self.inner.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.history.push(message);
        session.message_count += 1;
        session.touch();
        Ok(())
    }

    /// Conversation history snapshot.
    pub fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.get_session(session_id)?.history)
    }

    /// Route a user message to the session's worker and stream its output.
    pub async fn send(&self, session_id: &str, message: &str) -> Result<LineStream> {
        // Snapshot what the query needs, then record the message
        let (container_info, history) = {
            let sessions = self.inner.sessions.lock().unwrap();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            (session.container_info.clone(), session.history.clone())
        };
        self.record_message(session_id, Message::user(message))?;

        self.inner
            .containers
            .execute_query(&container_info, message, &history)
            .await
    }

    /// Whether a session's worker answers its health endpoint.
    pub async fn health_check(&self, session_id: &str) -> Result<bool> {
        let session = self.get_session(session_id)?;
        Ok(self
            .inner
            .containers
            .health_check(&session.container_info)
            .await)
    }

    /// Remove a session and stop its worker. Safe to call repeatedly; the
    /// container stop runs at most once.
    pub async fn cleanup_session(&self, session_id: &str) {
        cleanup(&self.inner, session_id).await;
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.lock().unwrap().is_empty()
    }
}

async fn cleanup(inner: &Inner, session_id: &str) {
    // Remove from the map first so lookups can't observe partial teardown
    let session = inner.sessions.lock().unwrap().remove(session_id);
    if let Some(mut session) = session {
        session.status = SessionStatus::Stopped;
        if let Err(e) = inner.containers.stop_container(&session.container_info).await {
            log::error!("error cleaning up session {}: {}", session_id, e);
        } else {
            log::info!("cleaned up session {}", session_id);
        }
    }
}

async fn sweep(inner: &Inner) {
    let expired: Vec<String> = {
        let sessions = inner.sessions.lock().unwrap();
        sessions
            .iter()
            .filter(|(_, session)| session.last_activity.elapsed() > inner.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect()
    };

    for session_id in expired {
        log::info!("cleaning up idle session {}", session_id);
        cleanup(inner, &session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_shape() {
        let id = random_hex(12);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // Practically never equal
        assert_ne!(random_hex(12), random_hex(12));
    }

    #[test]
    fn test_session_ids_have_prefixes() {
        let session_id = format!("sess-{}", random_hex(12));
        let agent_id = format!("agent-{}", random_hex(8));
        assert!(session_id.starts_with("sess-"));
        assert_eq!(session_id.len(), 5 + 12);
        assert!(agent_id.starts_with("agent-"));
        assert_eq!(agent_id.len(), 6 + 8);
    }

    #[tokio::test]
    async fn test_session_touch_resets_idle() {
        let mut session = AgentSession::new(
            "sess-1".into(),
            "agent-1".into(),
            None,
            "default".into(),
            "key".into(),
            ContainerInfo::default(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.idle_for() >= Duration::from_millis(10));
        session.touch();
        assert!(session.idle_for() < Duration::from_millis(10));
    }

    #[test]
    fn test_session_info_serialization() {
        let session = AgentSession::new(
            "sess-1".into(),
            "agent-1".into(),
            Some("cfg-9".into()),
            "coder".into(),
            "key".into(),
            ContainerInfo::default(),
        );
        let info = session.to_info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["session_id"], "sess-1");
        assert_eq!(json["status"], "running");
        assert_eq!(json["config_id"], "cfg-9");
    }
}
