//! Session manager lifecycle: eviction, exactly-once teardown, shutdown.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use universal_agent::container::{
    ContainerInfo, ContainerProvider, LineStream, WorkerConfig,
};
use universal_agent::session::{SessionManager, SessionStatus};
use universal_agent::{Error, Message};

/// Container provider stub that counts lifecycle calls.
struct CountingContainers {
    creates: AtomicUsize,
    stops: AtomicUsize,
    fail_create: bool,
}

impl CountingContainers {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_create: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_create: true,
        })
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerProvider for CountingContainers {
    async fn create_container(
        &self,
        _session_id: &str,
        agent_id: &str,
        _config: &WorkerConfig,
        _api_key: &str,
    ) -> universal_agent::Result<ContainerInfo> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(Error::ContainerStart("image missing".to_string()));
        }
        Ok(ContainerInfo {
            provider: "counting".to_string(),
            agent_id: agent_id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ContainerInfo::default()
        })
    }

    async fn stop_container(&self, _info: &ContainerInfo) -> universal_agent::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute_query(
        &self,
        _info: &ContainerInfo,
        _message: &str,
        _history: &[Message],
    ) -> universal_agent::Result<LineStream> {
        let lines = vec![
            Ok(r#"data: {"event_type":"content_block_start"}"#.to_string()),
            Ok(r#"data: {"done":true}"#.to_string()),
        ];
        Ok(Box::pin(futures::stream::iter(lines)))
    }

    async fn health_check(&self, _info: &ContainerInfo) -> bool {
        true
    }
}

fn dummy_info() -> ContainerInfo {
    ContainerInfo {
        provider: "counting".to_string(),
        agent_id: "agent-test".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ContainerInfo::default()
    }
}

// S6: an idle session is evicted exactly once
#[tokio::test(start_paused = true)]
async fn test_idle_session_evicted_once() {
    let containers = CountingContainers::new();
    let manager = SessionManager::new(containers.clone(), Duration::from_secs(30));
    manager.start().await;

    let info = manager.create_session("key", None, "default", dummy_info());
    assert_eq!(manager.len(), 1);

    // Past the idle timeout plus one sweep interval
    tokio::time::sleep(Duration::from_secs(95)).await;

    assert_eq!(containers.stops(), 1, "container stopped exactly once");
    assert!(matches!(
        manager.get_session(&info.session_id),
        Err(Error::SessionNotFound(_))
    ));

    // Repeated cleanup is a no-op
    manager.cleanup_session(&info.session_id).await;
    assert_eq!(containers.stops(), 1);

    manager.stop().await;
    assert_eq!(containers.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_touch_defers_eviction() {
    let containers = CountingContainers::new();
    let manager = SessionManager::new(containers.clone(), Duration::from_secs(50));
    manager.start().await;

    let info = manager.create_session("key", None, "default", dummy_info());

    // Activity at t=25 keeps idle time at 35s when the t=60 sweep runs;
    // without the touch it would be 60s and over the limit
    tokio::time::sleep(Duration::from_secs(25)).await;
    manager.touch(&info.session_id).unwrap();
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(manager.get_session(&info.session_id).is_ok());
    assert_eq!(containers.stops(), 0);

    // No further activity: idle time is 95s at the t=120 sweep
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(manager.get_session(&info.session_id).is_err());
    assert_eq!(containers.stops(), 1);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cleans_all_sessions() {
    let containers = CountingContainers::new();
    let manager = SessionManager::new(containers.clone(), Duration::from_secs(3600));
    manager.start().await;

    for _ in 0..3 {
        manager.create_session("key", None, "default", dummy_info());
    }
    assert_eq!(manager.len(), 3);
    assert_eq!(manager.list_sessions().len(), 3);

    manager.stop().await;
    assert!(manager.is_empty());
    assert_eq!(containers.stops(), 3);
}

#[tokio::test]
async fn test_launch_failure_leaves_no_session() {
    let containers = CountingContainers::failing();
    let manager = SessionManager::new(containers.clone(), Duration::from_secs(3600));

    let result = manager
        .launch(&WorkerConfig::default(), "key", None, "default")
        .await;
    assert!(matches!(result, Err(Error::ContainerStart(_))));
    assert!(manager.is_empty());
    assert_eq!(containers.stops(), 0);
}

#[tokio::test]
async fn test_launch_and_send() {
    let _ = env_logger::builder().is_test(true).try_init();

    let containers = CountingContainers::new();
    let manager = SessionManager::new(containers.clone(), Duration::from_secs(3600));

    let info = manager
        .launch(
            &WorkerConfig {
                provider: "anthropic".to_string(),
                ..WorkerConfig::default()
            },
            "key",
            Some("cfg-1".to_string()),
            "coder",
        )
        .await
        .unwrap();

    assert!(info.session_id.starts_with("sess-"));
    assert!(info.agent_id.starts_with("agent-"));
    assert_eq!(info.status, SessionStatus::Running);
    assert_eq!(info.config_id.as_deref(), Some("cfg-1"));

    let mut lines = manager.send(&info.session_id, "hello").await.unwrap();
    let mut collected = Vec::new();
    while let Some(line) = lines.next().await {
        collected.push(line.unwrap());
    }
    assert_eq!(collected.len(), 2);
    assert!(collected[0].starts_with("data: "));

    // The user message landed in history and bumped the counter
    let session = manager.get_session(&info.session_id).unwrap();
    assert_eq!(session.message_count, 1);
    assert_eq!(session.history.len(), 1);
    assert!(matches!(session.history[0], Message::User(_)));

    manager.cleanup_session(&info.session_id).await;
    assert_eq!(containers.stops(), 1);
}

#[tokio::test]
async fn test_record_and_history() {
    let containers = CountingContainers::new();
    let manager = SessionManager::new(containers, Duration::from_secs(3600));

    let info = manager.create_session("key", None, "default", dummy_info());
    manager
        .record_message(&info.session_id, Message::user("question"))
        .unwrap();
    manager
        .record_message(&info.session_id, Message::assistant(vec![]))
        .unwrap();

    let history = manager.history(&info.session_id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        manager.get_session(&info.session_id).unwrap().message_count,
        2
    );

    assert!(matches!(
        manager.history("sess-missing"),
        Err(Error::SessionNotFound(_))
    ));
}
