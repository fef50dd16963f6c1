//! Connection Manager (C10).
//!
//! Owns the `id → Session` map, restores a session's conversation on
//! connect for clients presenting a stable `client_id`, and persists a
//! process-wide snapshot file on a fixed interval and at shutdown using
//! atomic write-rename (spec.md §4.10, §6.6). Follows `server::AuthState`'s
//! shape (an `RwLock`-guarded shared-state struct reused across requests)
//! and the atomic-write helpers in `config::Config::save`.

use super::orchestrator::OutboundFrame;
use super::session::Session;
use super::types::SessionSnapshot;
use super::vad::{EnergyClassifier, SpeechClassifier, VadGate, VadGateConfig};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Builds a fresh classifier per session (REDESIGN FLAGS: the VAD backend
/// is one explicit config choice for the whole process, but each session
/// still needs its own hysteresis/model state, so the manager holds a
/// factory rather than a single shared `VadGate`).
pub type ClassifierFactory = Arc<dyn Fn() -> Box<dyn SpeechClassifier> + Send + Sync>;

pub fn energy_classifier_factory() -> ClassifierFactory {
    Arc::new(|| Box::new(EnergyClassifier::default()) as Box<dyn SpeechClassifier>)
}

/// One row of `GET /api/admin/sessions` (spec.md §6.5).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub connection_id: String,
    pub client_id: Option<String>,
    pub state: &'static str,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
}

/// Maintains every live session, handing out exclusive access per id.
/// Spec.md §3: "the Connection Manager exclusively owns each Session; the
/// Pipeline Orchestrator borrows it for the duration of a turn" — modeled
/// here as a `tokio::sync::Mutex<Session>` behind the map so a turn holds
/// the session lock for its whole run, while the map itself is only ever
/// locked briefly to look an id up.
pub struct ConnectionManager {
    sessions: RwLock<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    /// Each connection's outbound frame sender, registered once the `/ws`
    /// handler has set up its channel — lets the background sweep push a
    /// `state(idle)` frame on a speaking timeout (spec.md §8 scenario 6)
    /// without the connection manager owning any networking itself.
    outbound: RwLock<HashMap<String, mpsc::Sender<OutboundFrame>>>,
    classifier_factory: ClassifierFactory,
    vad_config: VadGateConfig,
    system_prompt: String,
    max_entries: usize,
    snapshot_path: PathBuf,
}

impl ConnectionManager {
    pub fn new(
        classifier_factory: ClassifierFactory,
        vad_config: VadGateConfig,
        system_prompt: impl Into<String>,
        max_entries: usize,
        snapshot_path: PathBuf,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
            classifier_factory,
            vad_config,
            system_prompt: system_prompt.into(),
            max_entries,
            snapshot_path,
        }
    }

    fn new_vad_gate(&self) -> VadGate {
        VadGate::new((self.classifier_factory)(), self.vad_config)
    }

    /// Accepts a connection: creates a Session, restoring its conversation
    /// if `client_id` is `Some` and a persisted snapshot exists for it
    /// (spec.md §4.10: "restoration only applies when clients present a
    /// stable id").
    pub async fn connect(&self, connection_id: impl Into<String>, client_id: Option<String>) -> Arc<tokio::sync::Mutex<Session>> {
        let connection_id = connection_id.into();
        let mut session = Session::new(&connection_id, self.system_prompt.clone(), self.max_entries, self.new_vad_gate());

        if let Some(cid) = &client_id {
            match self.load_snapshot_for(cid).await {
                Ok(Some(snapshot)) => {
                    info!(client_id = %cid, "restored session snapshot");
                    session.restore_from(snapshot, self.max_entries);
                }
                Ok(None) => {
                    session.client_id = Some(cid.clone());
                }
                Err(e) => {
                    warn!(client_id = %cid, error = %e, "failed to load session snapshot, starting fresh");
                    session.client_id = Some(cid.clone());
                }
            }

            match crate::config::ClientSettings::load(cid) {
                Ok(settings) if !settings.is_empty() => {
                    debug!(client_id = %cid, "restored per-client settings");
                    session.settings = settings;
                }
                Ok(_) => {}
                Err(e) => warn!(client_id = %cid, error = %e, "failed to load per-client settings, using defaults"),
            }
        }

        let handle = Arc::new(tokio::sync::Mutex::new(session));
        self.sessions.write().await.insert(connection_id.clone(), handle.clone());
        debug!(connection = %connection_id, "client_connected");
        handle
    }

    pub async fn disconnect(&self, connection_id: &str) {
        self.sessions.write().await.remove(connection_id);
        self.outbound.write().await.remove(connection_id);
        debug!(connection = %connection_id, "client_disconnected");
    }

    /// Registers the `/ws` handler's outbound channel for this connection
    /// so background tasks (the speaking-timeout sweep) can notify the
    /// client without holding a session lock themselves.
    pub async fn register_outbound(&self, connection_id: &str, sender: mpsc::Sender<OutboundFrame>) {
        self.outbound.write().await.insert(connection_id.to_string(), sender);
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<tokio::sync::Mutex<Session>>> {
        self.sessions.read().await.get(connection_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of every live session's identity and state, for the admin
    /// sessions endpoint (spec.md §6.5).
    pub async fn list_summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for (id, handle) in sessions.iter() {
            let session = handle.lock().await;
            out.push(SessionSummary {
                connection_id: id.clone(),
                client_id: session.client_id.clone(),
                state: session.state().as_str(),
                created_at: session.created_at,
                last_activity_at: session.last_activity_at,
            });
        }
        out
    }

    /// Moves every Speaking session whose `speaking_started_at` is more
    /// than 30 s in the past back to Idle (spec.md §4.8 stuck-state
    /// timeout). Intended to be called by a periodic sweep task.
    pub async fn sweep_speaking_timeouts(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut timed_out = Vec::new();
        for (id, handle) in sessions.iter() {
            let mut session = handle.lock().await;
            if session.speaking_timed_out() {
                session.apply(super::session::SessionEvent::SpeakingTimeout);
                timed_out.push(id.clone());
            }
        }
        drop(sessions);

        if !timed_out.is_empty() {
            let outbound = self.outbound.read().await;
            for id in &timed_out {
                if let Some(sender) = outbound.get(id) {
                    let _ = sender.send(OutboundFrame::State { state: "idle" }).await;
                }
            }
        }
        timed_out
    }

    /// Writes every session with a known `client_id` to the snapshot file
    /// via atomic write-rename (spec.md §4.10, §6.6).
    pub async fn persist_snapshot(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        let mut map: HashMap<String, SessionSnapshot> = HashMap::new();
        for handle in sessions.values() {
            let session = handle.lock().await;
            if let Some(snapshot) = session.snapshot() {
                map.insert(snapshot.client_id.clone(), snapshot);
            }
        }
        drop(sessions);

        if map.is_empty() {
            return Ok(());
        }

        crate::config::write_json_atomic(&self.snapshot_path, &map)
    }

    async fn load_snapshot_for(&self, client_id: &str) -> Result<Option<SessionSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.snapshot_path)
            .await
            .context("failed to read sessions snapshot file")?;
        let map: HashMap<String, SessionSnapshot> =
            serde_json::from_str(&contents).context("failed to parse sessions snapshot file")?;
        Ok(map.get(client_id).cloned())
    }

    /// Spawns the periodic snapshot + speaking-timeout sweep task. `0`
    /// disables periodic snapshotting (spec.md §4.10); the timeout sweep
    /// still runs every 5 s regardless.
    pub fn spawn_background_sweep(self: &Arc<Self>, snapshot_interval_secs: u64) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
            let mut elapsed_since_snapshot = 0u64;
            loop {
                tick.tick().await;
                let timed_out = manager.sweep_speaking_timeouts().await;
                for id in timed_out {
                    warn!(session = %id, "speaking timeout elapsed, session reset to idle");
                }

                if snapshot_interval_secs == 0 {
                    continue;
                }
                elapsed_since_snapshot += 5;
                if elapsed_since_snapshot >= snapshot_interval_secs {
                    elapsed_since_snapshot = 0;
                    if let Err(e) = manager.persist_snapshot().await {
                        warn!(error = %e, "periodic session snapshot failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(snapshot_path: PathBuf) -> ConnectionManager {
        ConnectionManager::new(energy_classifier_factory(), VadGateConfig::default(), "sys", 100, snapshot_path)
    }

    #[tokio::test]
    async fn connect_without_client_id_creates_fresh_session() {
        let dir = std::env::temp_dir().join(format!("voicebridge-test-{}", uuid::Uuid::new_v4()));
        let manager = manager(dir.join("sessions.json"));
        let handle = manager.connect("conn-1", None).await;
        let session = handle.lock().await;
        assert!(session.client_id.is_none());
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_removes_session_from_map() {
        let dir = std::env::temp_dir().join(format!("voicebridge-test-{}", uuid::Uuid::new_v4()));
        let manager = manager(dir.join("sessions.json"));
        manager.connect("conn-1", None).await;
        assert_eq!(manager.session_count().await, 1);
        manager.disconnect("conn-1").await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn speaking_timeout_sweep_notifies_registered_outbound_channel() {
        let dir = std::env::temp_dir().join(format!("voicebridge-test-{}", uuid::Uuid::new_v4()));
        let manager = manager(dir.join("sessions.json"));
        let handle = manager.connect("conn-1", None).await;
        {
            let mut session = handle.lock().await;
            session.apply(super::super::session::SessionEvent::StartListening);
            session.apply(super::super::session::SessionEvent::SpeechEndedLongEnough);
            session.apply(super::super::session::SessionEvent::ReplyReady);
            session.speaking_started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(31));
        }

        let (tx, mut rx) = mpsc::channel(4);
        manager.register_outbound("conn-1", tx).await;

        let timed_out = manager.sweep_speaking_timeouts().await;
        assert_eq!(timed_out, vec!["conn-1".to_string()]);

        let frame = rx.try_recv().expect("expected a state(idle) frame");
        match frame {
            OutboundFrame::State { state } => assert_eq!(state, "idle"),
            other => panic!("expected State frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_restore() {
        let dir = std::env::temp_dir().join(format!("voicebridge-test-{}", uuid::Uuid::new_v4()));
        let snapshot_path = dir.join("sessions.json");
        let manager = manager(snapshot_path.clone());

        let handle = manager.connect("conn-1", Some("client-abc".to_string())).await;
        {
            let mut session = handle.lock().await;
            session.conversation.append_user("remember this");
        }
        manager.persist_snapshot().await.unwrap();
        manager.disconnect("conn-1").await;

        let restored_handle = manager.connect("conn-2", Some("client-abc".to_string())).await;
        let restored = restored_handle.lock().await;
        assert_eq!(restored.conversation.messages().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
