//! Session registry.
//!
//! This module provides a thread-safe session manager that creates sessions,
//! owns one [`PtyManager`] per session, and cascades teardown to it. It is
//! constructed explicitly and handed to whatever protocol layer exposes it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::PtyError;
use super::id::{IdGenerator, UuidV7Generator, MAX_ID_ATTEMPTS};
use super::limit::Slots;
use super::pty::{PtyDefaults, PtyInfo, PtyOptions, PtyProcess};
use super::registry::PtyManager;
use super::{PtyId, SessionId};
use crate::config::Config;

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, not yet confirmed by the owning connection.
    Initializing,
    /// In use.
    Active,
    /// Torn down; its PTYs have been terminated.
    Terminated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Current status.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: SystemTime,
    /// Number of PTYs currently registered.
    pub pty_count: usize,
}

/// Operations exposed to the protocol layer.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a new, empty session.
    fn create_session(&self) -> Result<SessionId, PtyError>;

    /// Returns the PTY registry of a session.
    fn get_pty_manager(&self, session_id: &str) -> Option<PtyManager>;

    /// Transitions a session's status.
    ///
    /// Moving to `Terminated` shuts down the session's registry and removes
    /// the session. Status never moves backwards.
    fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), PtyError>;

    /// Spawns a PTY within a session.
    fn create_pty(&self, session_id: &str, options: PtyOptions) -> Result<PtyId, PtyError>;

    /// Removes a PTY from a session, terminating it in the background.
    ///
    /// Returns false if the session has no such PTY.
    fn remove_pty(&self, session_id: &str, pty_id: &str) -> Result<bool, PtyError>;

    /// Lists the PTYs of a session in creation order.
    fn get_all_ptys(&self, session_id: &str) -> Result<Vec<PtyInfo>, PtyError>;

    /// Looks up a PTY.
    fn get_pty(&self, session_id: &str, pty_id: &str) -> Result<Arc<PtyProcess>, PtyError>;

    /// Starts terminating a PTY without removing it.
    ///
    /// Returns false if it was already terminating or terminated.
    fn kill_pty(&self, session_id: &str, pty_id: &str) -> Result<bool, PtyError> {
        Ok(self.get_pty(session_id, pty_id)?.kill())
    }

    /// Returns a PTY's captured output.
    fn get_output_buffer(
        &self,
        session_id: &str,
        pty_id: &str,
        strip_ansi: bool,
    ) -> Result<String, PtyError> {
        Ok(self.get_pty(session_id, pty_id)?.get_output_buffer(strip_ansi))
    }

    /// Writes data to a PTY's input.
    async fn write(&self, session_id: &str, pty_id: &str, data: &[u8]) -> Result<(), PtyError>;

    /// Resizes a PTY's terminal.
    async fn resize(
        &self,
        session_id: &str,
        pty_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), PtyError>;

    /// Lists all live sessions.
    fn list_sessions(&self) -> Vec<SessionInfo>;

    /// Gets information about a specific session.
    fn session_info(&self, session_id: &str) -> Option<SessionInfo>;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

/// A session and the registry it owns.
struct Session {
    id: SessionId,
    created_at: SystemTime,
    status: Mutex<SessionStatus>,
    registry: PtyManager,
    /// Ids registered through this session. Reporting only: the registry
    /// stays the source of truth for whether a PTY exists.
    pty_ids: Mutex<BTreeSet<PtyId>>,
}

impl Session {
    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pty_ids(&self) -> MutexGuard<'_, BTreeSet<PtyId>> {
        self.pty_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            status: self.status(),
            created_at: self.created_at,
            pty_count: self.registry.len(),
        }
    }
}

/// Thread-safe session manager implementation using DashMap.
pub struct SessionManagerImpl {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    ids: Arc<dyn IdGenerator>,
    defaults: PtyDefaults,
    session_slots: Slots,
    max_ptys_per_session: Option<usize>,
}

impl SessionManagerImpl {
    /// Creates a session manager with the given PTY defaults and no limits.
    pub fn new(defaults: PtyDefaults) -> Self {
        Self {
            sessions: DashMap::new(),
            ids: Arc::new(UuidV7Generator),
            defaults,
            session_slots: Slots::new(None),
            max_ptys_per_session: None,
        }
    }

    /// Creates a session manager from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(PtyDefaults::from(&config.pty)).with_limits(
            Some(config.sessions.max_sessions),
            Some(config.sessions.max_ptys_per_session),
        )
    }

    /// Replaces the identifier generator.
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Sets the session and per-session PTY limits.
    pub fn with_limits(mut self, max_sessions: Option<usize>, max_ptys: Option<usize>) -> Self {
        self.session_slots = Slots::new(max_sessions);
        self.max_ptys_per_session = max_ptys;
        self
    }

    /// Records a PTY id in a session's bookkeeping.
    pub fn add_pty(&self, session_id: &str, pty_id: &str) -> Result<(), PtyError> {
        let session = self.session(session_id)?;
        session.pty_ids().insert(pty_id.to_string());
        Ok(())
    }

    /// Ids recorded in a session's bookkeeping, pruned of entries the
    /// registry no longer holds.
    pub fn tracked_ptys(&self, session_id: &str) -> Result<Vec<PtyId>, PtyError> {
        let session = self.session(session_id)?;
        let mut ids = session.pty_ids();
        ids.retain(|id| session.registry.contains(id));
        Ok(ids.iter().cloned().collect())
    }

    /// Terminates every session.
    pub fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Err(e) = self.update_status(id, SessionStatus::Terminated) {
                // Already torn down by a concurrent caller.
                debug!(session_id = %id, error = %e, "Session vanished during shutdown");
            }
        }
        info!(count = ids.len(), "Session manager shut down");
    }

    /// Terminates every session and waits up to `timeout` in total for their
    /// PTYs to exit. Returns the number of PTYs still running at the deadline.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        // Signal everything first so no session's grace period waits on another's.
        let mut swept = Vec::new();
        for session in sessions {
            if self.sessions.remove(&session.id).is_some() {
                self.session_slots.release();
            }
            *session.status.lock().unwrap_or_else(PoisonError::into_inner) =
                SessionStatus::Terminated;
            session.pty_ids().clear();
            swept.extend(session.registry.shutdown());
        }

        let mut stragglers = 0;
        for pty in swept {
            if tokio::time::timeout_at(deadline, pty.wait_for_exit())
                .await
                .is_err()
            {
                warn!(pty_id = %pty.id(), "PTY did not exit before shutdown deadline");
                stragglers += 1;
            }
        }
        info!(stragglers = stragglers, "Session manager shut down");
        stragglers
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, PtyError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PtyError::SessionNotFound(session_id.to_string()))
    }

    fn registry(&self, session_id: &str) -> Result<PtyManager, PtyError> {
        Ok(self.session(session_id)?.registry.clone())
    }
}

impl Default for SessionManagerImpl {
    fn default() -> Self {
        Self::new(PtyDefaults::default())
    }
}

impl SessionManager for SessionManagerImpl {
    fn create_session(&self) -> Result<SessionId, PtyError> {
        let reservation = self.session_slots.try_reserve().ok_or_else(|| {
            PtyError::LimitReached(format!(
                "{} sessions already open",
                self.session_slots.max().unwrap_or_default()
            ))
        })?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.ids.generate();
            if id.is_empty() {
                continue;
            }
            match self.sessions.entry(id.clone()) {
                Entry::Occupied(_) => {
                    debug!(session_id = %id, "Session id collision, regenerating");
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Session {
                        id: id.clone(),
                        created_at: SystemTime::now(),
                        status: Mutex::new(SessionStatus::Initializing),
                        registry: PtyManager::new(
                            id.clone(),
                            Arc::clone(&self.ids),
                            self.defaults.clone(),
                            self.max_ptys_per_session,
                        ),
                        pty_ids: Mutex::new(BTreeSet::new()),
                    }));
                    reservation.commit();
                    info!(session_id = %id, "Created session");
                    return Ok(id);
                }
            }
        }
        Err(PtyError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    fn get_pty_manager(&self, session_id: &str) -> Option<PtyManager> {
        self.registry(session_id).ok()
    }

    fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), PtyError> {
        let session = self.session(session_id)?;

        let previous = {
            let mut current = session.status.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *current;
            if status < previous {
                warn!(
                    session_id = %session_id,
                    from = %previous,
                    to = %status,
                    "Ignoring backwards session status transition"
                );
                return Ok(());
            }
            *current = status;
            previous
        };

        if previous == status {
            return Ok(());
        }
        info!(session_id = %session_id, from = %previous, to = %status, "Session status changed");

        if status == SessionStatus::Terminated {
            if self.sessions.remove(session_id).is_some() {
                self.session_slots.release();
            }
            session.registry.shutdown();
            session.pty_ids().clear();
        }
        Ok(())
    }

    fn create_pty(&self, session_id: &str, options: PtyOptions) -> Result<PtyId, PtyError> {
        let session = self.session(session_id)?;
        let pty_id = session.registry.create_pty(options)?;
        session.pty_ids().insert(pty_id.clone());
        Ok(pty_id)
    }

    fn remove_pty(&self, session_id: &str, pty_id: &str) -> Result<bool, PtyError> {
        let session = self.session(session_id)?;
        session.pty_ids().remove(pty_id);
        Ok(session.registry.remove_pty(pty_id))
    }

    fn get_all_ptys(&self, session_id: &str) -> Result<Vec<PtyInfo>, PtyError> {
        Ok(self.registry(session_id)?.list())
    }

    fn get_pty(&self, session_id: &str, pty_id: &str) -> Result<Arc<PtyProcess>, PtyError> {
        self.registry(session_id)?
            .get_pty(pty_id)
            .ok_or_else(|| PtyError::PtyNotFound(pty_id.to_string()))
    }

    async fn write(&self, session_id: &str, pty_id: &str, data: &[u8]) -> Result<(), PtyError> {
        let pty = self.get_pty(session_id, pty_id)?;
        pty.write(data).await
    }

    async fn resize(
        &self,
        session_id: &str,
        pty_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), PtyError> {
        let pty = self.get_pty(session_id, pty_id)?;
        pty.resize(cols, rows).await
    }

    fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.session(session_id).ok().map(|session| session.info())
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}
