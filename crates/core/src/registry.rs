//! Session registry
//!
//! The single source of truth for all live sessions. Every component
//! mutates session state through here; the map and the allocator
//! counters are the only shared mutable structures in the process, and
//! both sit behind locks. Initialized explicitly at startup and torn
//! down explicitly via `shutdown_all`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::{distributions::Alphanumeric, Rng};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use browsercast_common::{
    generate_session_id, ActionRequest, ActionResult, Error, HealthReport, HealthStatus,
    PageContent, Resolution, Result, SessionStatus, SessionSummary,
};

use crate::allocator::Allocator;
use crate::browser::{BrowserHandle, BrowserLaunch};
use crate::config::DaemonConfig;
use crate::dispatcher;
use crate::hub::{self, FrameHub, StreamEvent};
use crate::supervisor::{SupervisedProcess, Supervisor};

/// Options for session creation
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Caller-supplied id; generated when absent
    pub id: Option<String>,
    pub resolution: Resolution,
    pub enable_recording: bool,
}

/// Child processes owned by one session, stored in teardown order
#[derive(Default)]
struct ProcessSet {
    browser: Option<SupervisedProcess>,
    profile_dir: Option<TempDir>,
    vnc: Option<SupervisedProcess>,
    display: Option<SupervisedProcess>,
}

/// One live session: display stack, browser attachment, viewer set
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub display_slot: u32,
    pub control_port: u16,
    pub devtools_port: u16,
    pub control_password: String,
    pub resolution: Resolution,
    status: RwLock<SessionStatus>,
    stopping: AtomicBool,
    /// Fair mutex: waiters acquire in submission order, which gives the
    /// per-session FIFO action guarantee.
    pub(crate) handle: tokio::sync::Mutex<Option<BrowserHandle>>,
    processes: tokio::sync::Mutex<ProcessSet>,
    pub(crate) hub: Arc<FrameHub>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    recording: Mutex<Option<TempDir>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("display_slot", &self.display_slot)
            .field("control_port", &self.control_port)
            .field("devtools_port", &self.devtools_port)
            .field("resolution", &self.resolution)
            .finish()
    }
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub fn frame_count(&self) -> u64 {
        self.hub.frame_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn detach_subscriber(&self, subscriber_id: u64) {
        self.hub.unsubscribe(subscriber_id);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status(),
            created_at: self.created_at,
            frame_count: self.frame_count(),
            subscriber_count: self.subscriber_count(),
        }
    }
}

/// Registry of all sessions, shared across tasks
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: DaemonConfig,
    allocator: Allocator,
    supervisor: Supervisor,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: DaemonConfig) -> Self {
        let allocator = Allocator::new(config.display.display_base, config.vnc.scan_attempts);
        let supervisor = Supervisor::new(config.display.clone(), config.vnc.clone());
        Self {
            inner: Arc::new(RegistryInner {
                config,
                allocator,
                supervisor,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    /// Create a session: reserve resources, bring up the display stack
    /// and browser, and mark ready. Any failure tears down whatever was
    /// already acquired and surfaces one aggregate error.
    pub async fn create_session(&self, opts: CreateSessionOptions) -> Result<Arc<Session>> {
        let id = opts.id.unwrap_or_else(generate_session_id);

        let session = {
            let mut sessions = self.inner.sessions.write();
            match sessions.get(&id) {
                Some(existing) if existing.status() != SessionStatus::Stopped => {
                    return Err(Error::Conflict { id });
                }
                Some(_) => {
                    // A stopped leftover; the id becomes reusable once
                    // the stale entry is gone.
                    sessions.remove(&id);
                }
                None => {}
            }

            let display_slot = self.inner.allocator.next_display_slot();
            let control_port = self
                .inner
                .allocator
                .reserve_port(self.inner.config.vnc.port_start)?;
            let devtools_port = match self
                .inner
                .allocator
                .reserve_port(self.inner.config.browser.devtools_port_start)
            {
                Ok(port) => port,
                Err(e) => {
                    self.inner.allocator.release_port(control_port);
                    return Err(e);
                }
            };

            let session = Arc::new(Session {
                id: id.clone(),
                created_at: chrono::Utc::now().timestamp(),
                display_slot,
                control_port,
                devtools_port,
                control_password: generate_password(),
                resolution: opts.resolution,
                status: RwLock::new(SessionStatus::Initializing),
                stopping: AtomicBool::new(false),
                handle: tokio::sync::Mutex::new(None),
                processes: tokio::sync::Mutex::new(ProcessSet::default()),
                hub: Arc::new(FrameHub::new(id.clone(), &self.inner.config.stream)),
                capture_task: Mutex::new(None),
                recording: Mutex::new(None),
            });
            sessions.insert(id.clone(), session.clone());
            session
        };

        match self.build_stack(&session, opts.enable_recording).await {
            Ok(()) => {
                if session.stopping.load(Ordering::SeqCst) {
                    // A stop raced initialization and saw partial state;
                    // rerun teardown over what was built since.
                    warn!("session {} was stopped during initialization", id);
                    session.stopping.store(false, Ordering::SeqCst);
                    self.shutdown_session(&session).await;
                    self.inner.sessions.write().remove(&id);
                    return Err(Error::NotFound { id });
                }
                session.set_status(SessionStatus::Ready);
                info!(
                    "session {} ready on display :{}, VNC port {}",
                    session.id, session.display_slot, session.control_port
                );
                Ok(session)
            }
            Err(e) => {
                error!("session {} failed to initialize: {}", id, e);
                session.set_status(SessionStatus::Error);
                self.shutdown_session(&session).await;
                self.inner.sessions.write().remove(&id);
                Err(e)
            }
        }
    }

    /// Bring up Xvfb, x11vnc and Chromium for a freshly created session,
    /// in that order, each only after the previous settled.
    async fn build_stack(&self, session: &Arc<Session>, enable_recording: bool) -> Result<()> {
        let headless = self.inner.config.browser.headless;

        if !headless {
            let display = self
                .inner
                .supervisor
                .start_display(session.display_slot, session.resolution)
                .await?;
            session.processes.lock().await.display = Some(display);

            let vnc = self
                .inner
                .supervisor
                .start_vnc(
                    session.display_slot,
                    session.control_port,
                    &session.control_password,
                )
                .await?;
            session.processes.lock().await.vnc = Some(vnc);
        }

        let BrowserLaunch {
            process,
            profile_dir,
            handle,
        } = BrowserHandle::launch(
            (!headless).then_some(session.display_slot),
            session.devtools_port,
            session.resolution,
            &self.inner.config.browser,
        )
        .await?;
        {
            let mut processes = session.processes.lock().await;
            processes.browser = Some(process);
            processes.profile_dir = Some(profile_dir);
        }

        *session.handle.lock().await = Some(handle);

        if enable_recording {
            let dir = tempfile::Builder::new()
                .prefix(&format!("browsercast-rec-{}-", session.id))
                .tempdir()?;
            debug!(
                "session {} recording frames to {}",
                session.id,
                dir.path().display()
            );
            *session.recording.lock() = Some(dir);
        }

        Ok(())
    }

    /// Look up a session by id
    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.to_string() })
    }

    /// Execute one action against a session, FIFO per session
    pub async fn execute_action(&self, id: &str, request: ActionRequest) -> Result<ActionResult> {
        let session = self.get(id)?;
        dispatcher::execute(&session, request).await
    }

    /// Introspect a session's page
    pub async fn introspect(&self, id: &str) -> Result<PageContent> {
        let session = self.get(id)?;
        dispatcher::introspect(&session).await
    }

    /// Attach a viewer to a session's frame stream. The first attach
    /// starts the screencast; capture then persists for the session's
    /// lifetime so late joiners resume at the next frame.
    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<(Arc<Session>, u64, mpsc::Receiver<StreamEvent>)> {
        let session = self.get(id)?;
        if session.status() != SessionStatus::Ready {
            return Err(Error::NotReady {
                id: id.to_string(),
                status: session.status().to_string(),
            });
        }

        let (subscriber_id, rx) = session.hub.subscribe();

        if session.hub.claim_capture_start() {
            if let Err(e) = self.start_capture(&session).await {
                session.hub.release_capture_claim();
                session.hub.unsubscribe(subscriber_id);
                return Err(e);
            }
        }

        Ok((session, subscriber_id, rx))
    }

    async fn start_capture(&self, session: &Arc<Session>) -> Result<()> {
        let feed = {
            let guard = session.handle.lock().await;
            let handle = guard.as_ref().ok_or_else(|| Error::NotReady {
                id: session.id.clone(),
                status: session.status().to_string(),
            })?;
            handle.start_screencast(&self.inner.config.stream).await?
        };

        let recording = session
            .recording
            .lock()
            .as_ref()
            .map(|dir| dir.path().to_path_buf());

        let task = tokio::spawn(hub::run_capture(session.hub.clone(), feed, recording));
        *session.capture_task.lock() = Some(task);
        debug!("capture task started for session {}", session.id);
        Ok(())
    }

    /// List summaries of all sessions
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.inner
            .sessions
            .read()
            .values()
            .map(|s| s.summary())
            .collect()
    }

    /// Degraded when any session has been `initializing` longer than the
    /// configured timeout.
    pub fn health(&self) -> HealthReport {
        let now = chrono::Utc::now().timestamp();
        let limit = self.inner.config.init_stuck_secs as i64;
        let sessions = self.inner.sessions.read();
        let stuck: Vec<String> = sessions
            .values()
            .filter(|s| s.status() == SessionStatus::Initializing && now - s.created_at > limit)
            .map(|s| s.id.clone())
            .collect();
        HealthReport {
            status: if stuck.is_empty() {
                HealthStatus::Ok
            } else {
                HealthStatus::Degraded
            },
            sessions: sessions.len(),
            stuck_sessions: stuck,
        }
    }

    /// Stop a session and release everything it owns. Idempotent:
    /// stopping an unknown or already-stopped id succeeds.
    pub async fn stop_session(&self, id: &str) -> Result<()> {
        let session = self.inner.sessions.read().get(id).cloned();
        let Some(session) = session else {
            debug!("stop for unknown session {} ignored", id);
            return Ok(());
        };

        self.shutdown_session(&session).await;
        self.inner.sessions.write().remove(id);
        Ok(())
    }

    /// Tear a session down in the required order: cancel capture,
    /// notify viewers, close the browser handle, then terminate
    /// browser -> x11vnc -> Xvfb, then release ports. Every step is
    /// best-effort; a failed step is logged and never blocks the rest.
    async fn shutdown_session(&self, session: &Arc<Session>) {
        if session.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping session {}", session.id);
        let grace = Duration::from_secs(self.inner.config.stop_grace_secs);

        if let Some(task) = session.capture_task.lock().take() {
            task.abort();
        }

        session.hub.shutdown("session stopped");

        // An in-flight action may finish within the grace period, after
        // which teardown proceeds regardless; the engine process is
        // killed below either way.
        match tokio::time::timeout(grace, session.handle.lock()).await {
            Ok(mut guard) => {
                if let Some(mut handle) = guard.take() {
                    handle.close().await;
                }
            }
            Err(_) => warn!(
                "action still running in session {} after {:?}, tearing down anyway",
                session.id, grace
            ),
        }

        let mut failures: Vec<&'static str> = Vec::new();
        {
            let mut processes = session.processes.lock().await;
            for process in [
                processes.browser.take(),
                processes.vnc.take(),
                processes.display.take(),
            ] {
                if let Some(mut process) = process {
                    if !process.terminate(grace).await {
                        failures.push(process.name());
                    }
                }
            }
            processes.profile_dir = None;
        }

        self.inner.allocator.release_port(session.control_port);
        self.inner.allocator.release_port(session.devtools_port);
        *session.recording.lock() = None;

        if !failures.is_empty() {
            let e = Error::PartialCleanup(format!(
                "processes not confirmed dead: {}",
                failures.join(", ")
            ));
            warn!("session {}: {}", session.id, e);
        }

        session.set_status(SessionStatus::Stopped);
        info!("session {} stopped", session.id);
    }

    /// Stop every session; called once at daemon shutdown
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_session(&id).await {
                warn!("failed to stop session {} during shutdown: {}", id, e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_stub(
        &self,
        id: &str,
        status: SessionStatus,
        created_at: i64,
    ) -> Arc<Session> {
        let display_slot = self.inner.allocator.next_display_slot();
        let session = Arc::new(Session {
            id: id.to_string(),
            created_at,
            display_slot,
            control_port: 45000 + display_slot as u16,
            devtools_port: 48000 + display_slot as u16,
            control_password: generate_password(),
            resolution: Resolution::default(),
            status: RwLock::new(status),
            stopping: AtomicBool::new(false),
            handle: tokio::sync::Mutex::new(None),
            processes: tokio::sync::Mutex::new(ProcessSet::default()),
            hub: Arc::new(FrameHub::new(id, &self.inner.config.stream)),
            capture_task: Mutex::new(None),
            recording: Mutex::new(None),
        });
        self.inner
            .sessions
            .write()
            .insert(id.to_string(), session.clone());
        session
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use browsercast_common::ActionKind;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(DaemonConfig::default())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn duplicate_live_id_conflicts() {
        let registry = registry();
        registry.insert_stub("dup", SessionStatus::Ready, now());

        let err = registry
            .create_session(CreateSessionOptions {
                id: Some("dup".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn lookup_unknown_session_is_not_found() {
        let err = registry().get("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = registry();
        assert!(registry.stop_session("never-existed").await.is_ok());

        registry.insert_stub("s1", SessionStatus::Ready, now());
        assert!(registry.stop_session("s1").await.is_ok());
        assert!(registry.get("s1").is_err());
        assert!(registry.stop_session("s1").await.is_ok());
    }

    #[tokio::test]
    async fn stopped_session_rejects_actions_as_not_found() {
        let registry = registry();
        registry.insert_stub("s1", SessionStatus::Ready, now());
        registry.stop_session("s1").await.unwrap();

        let err = registry
            .execute_action("s1", ActionRequest::navigate("https://example.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn initializing_session_rejects_actions() {
        let registry = registry();
        registry.insert_stub("s1", SessionStatus::Initializing, now());

        let err = registry
            .execute_action(
                "s1",
                ActionRequest {
                    kind: ActionKind::Screenshot,
                    selector: None,
                    value: None,
                    coordinates: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test]
    async fn summaries_cover_all_sessions() {
        let registry = registry();
        registry.insert_stub("a", SessionStatus::Ready, now());
        registry.insert_stub("b", SessionStatus::Initializing, now());

        let mut summaries = registry.list_sessions();
        summaries.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "a");
        assert_eq!(summaries[0].status, SessionStatus::Ready);
        assert_eq!(summaries[1].status, SessionStatus::Initializing);
    }

    #[tokio::test]
    async fn stub_sessions_get_distinct_display_slots() {
        let registry = registry();
        let a = registry.insert_stub("a", SessionStatus::Ready, now());
        let b = registry.insert_stub("b", SessionStatus::Ready, now());
        assert_ne!(a.display_slot, b.display_slot);
    }

    #[tokio::test]
    async fn health_degrades_on_stuck_initializing() {
        let registry = registry();
        assert_eq!(registry.health().status, HealthStatus::Ok);

        registry.insert_stub("fresh", SessionStatus::Initializing, now());
        assert_eq!(registry.health().status, HealthStatus::Ok);

        registry.insert_stub("stuck", SessionStatus::Initializing, now() - 3600);
        let report = registry.health();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.stuck_sessions, vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn subscribe_requires_ready_session() {
        let registry = registry();
        registry.insert_stub("s1", SessionStatus::Initializing, now());

        let err = registry.subscribe("s1").await.unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test]
    async fn failed_capture_start_detaches_and_releases_claim() {
        let registry = registry();
        // Ready but with no browser handle: capture start must fail.
        let session = registry.insert_stub("s1", SessionStatus::Ready, now());

        assert!(registry.subscribe("s1").await.is_err());
        assert_eq!(session.subscriber_count(), 0);
        // The claim was released, so a later attach retries the start.
        assert!(!session.hub.capture_started());
    }

    #[tokio::test]
    async fn shutdown_all_empties_the_registry() {
        let registry = registry();
        registry.insert_stub("a", SessionStatus::Ready, now());
        registry.insert_stub("b", SessionStatus::Error, now());

        registry.shutdown_all().await;
        assert!(registry.list_sessions().is_empty());
    }

    #[test]
    fn passwords_are_random_and_opaque() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
