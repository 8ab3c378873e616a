//! Per-session registry of PTY processes.
//!
//! Every session owns exactly one [`PtyManager`]. Registries never share
//! state, so a PTY id is only resolvable through the registry that created
//! it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::error::PtyError;
use super::id::{IdGenerator, MAX_ID_ATTEMPTS};
use super::limit::Slots;
use super::pty::{ExitObserver, PtyDefaults, PtyInfo, PtyOptions, PtyProcess};
use super::{PtyId, SessionId};

struct PtyEntry {
    /// Creation order within this registry.
    seq: u64,
    pty: Arc<PtyProcess>,
}

struct PtyManagerInner {
    session_id: SessionId,
    ptys: DashMap<PtyId, PtyEntry>,
    next_seq: AtomicU64,
    ids: Arc<dyn IdGenerator>,
    defaults: PtyDefaults,
    slots: Slots,
    shut_down: AtomicBool,
}

/// Thread-safe registry of the PTYs belonging to one session.
///
/// Cloning yields another handle to the same registry. Map locks are only
/// held for the duration of a single insert, lookup or removal; spawning and
/// signalling always happen outside of them.
#[derive(Clone)]
pub struct PtyManager {
    inner: Arc<PtyManagerInner>,
}

impl PtyManager {
    /// Creates an empty registry for `session_id`.
    pub fn new(
        session_id: SessionId,
        ids: Arc<dyn IdGenerator>,
        defaults: PtyDefaults,
        max_ptys: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(PtyManagerInner {
                session_id,
                ptys: DashMap::new(),
                next_seq: AtomicU64::new(0),
                ids,
                defaults,
                slots: Slots::new(max_ptys),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the owning session id.
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Spawns a PTY and registers it, returning its id.
    pub fn create_pty(&self, options: PtyOptions) -> Result<PtyId, PtyError> {
        self.create_pty_handle(options).map(|pty| pty.id().clone())
    }

    /// Spawns a PTY and registers it, returning the controller itself.
    ///
    /// The handle stays usable after the entry is removed, which is how
    /// callers read the output of an auto-disposed process.
    pub fn create_pty_handle(&self, options: PtyOptions) -> Result<Arc<PtyProcess>, PtyError> {
        let inner = &self.inner;

        if inner.shut_down.load(Ordering::Acquire) {
            return Err(PtyError::SessionClosed(inner.session_id.clone()));
        }
        // Held across the spawn; dropping it on an early return frees the slot.
        let reservation = inner.slots.try_reserve().ok_or_else(|| {
            PtyError::LimitReached(format!(
                "session {} already has {} ptys",
                inner.session_id,
                inner.slots.max().unwrap_or_default()
            ))
        })?;

        let id = self.allocate_id()?;
        let auto_dispose = options.auto_dispose_on_exit;
        let observer = auto_dispose.then(|| self.dispose_observer());

        let pty = PtyProcess::spawn(id.clone(), options, &inner.defaults, observer)?;

        let inserted = match inner.ptys.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(PtyEntry {
                    seq: inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    pty: Arc::clone(&pty),
                });
                true
            }
        };
        if !inserted {
            // Another caller registered the same id while we were spawning.
            warn!(session_id = %inner.session_id, pty_id = %id, "Id taken during spawn");
            pty.kill();
            return Err(PtyError::IdExhausted(1));
        }
        reservation.commit();

        // A shutdown that ran while we were spawning missed this entry.
        if inner.shut_down.load(Ordering::Acquire) {
            if inner.ptys.remove(&id).is_some() {
                inner.slots.release();
            }
            pty.kill();
            return Err(PtyError::SessionClosed(inner.session_id.clone()));
        }

        // The process may have exited before it was registered, in which
        // case the observer found nothing to remove.
        if auto_dispose && pty.is_terminated() {
            if inner
                .ptys
                .remove_if(&id, |_, entry| entry.pty.is_terminated())
                .is_some()
            {
                inner.slots.release();
            }
        }

        info!(
            session_id = %inner.session_id,
            pty_id = %id,
            pid = ?pty.pid(),
            "Registered PTY"
        );

        Ok(pty)
    }

    /// Removes a PTY, terminating it in the background.
    ///
    /// The entry disappears immediately; the SIGTERM/SIGKILL sequence
    /// continues after this returns. Returns false if no such entry exists.
    pub fn remove_pty(&self, pty_id: &str) -> bool {
        let Some((id, entry)) = self.inner.ptys.remove(pty_id) else {
            return false;
        };
        self.inner.slots.release();

        let started = entry.pty.kill();
        info!(
            session_id = %self.inner.session_id,
            pty_id = %id,
            kill_started = started,
            "Removed PTY"
        );
        true
    }

    /// Looks up a PTY by id.
    pub fn get_pty(&self, pty_id: &str) -> Option<Arc<PtyProcess>> {
        self.inner
            .ptys
            .get(pty_id)
            .map(|entry| Arc::clone(&entry.value().pty))
    }

    /// Returns every registered PTY in creation order.
    pub fn get_all_ptys(&self) -> Vec<Arc<PtyProcess>> {
        let mut entries: Vec<(u64, Arc<PtyProcess>)> = self
            .inner
            .ptys
            .iter()
            .map(|entry| (entry.value().seq, Arc::clone(&entry.value().pty)))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, pty)| pty).collect()
    }

    /// Returns status snapshots of every registered PTY in creation order.
    pub fn list(&self) -> Vec<PtyInfo> {
        self.get_all_ptys().iter().map(|pty| pty.info()).collect()
    }

    /// Whether a PTY with this id is registered.
    pub fn contains(&self, pty_id: &str) -> bool {
        self.inner.ptys.contains_key(pty_id)
    }

    /// Number of registered PTYs.
    pub fn len(&self) -> usize {
        self.inner.ptys.len()
    }

    /// Whether no PTYs are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.ptys.is_empty()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Terminates and removes every PTY, and refuses new ones afterwards.
    ///
    /// Returns the controllers that were swept so callers can wait for them.
    pub fn shutdown(&self) -> Vec<Arc<PtyProcess>> {
        self.inner.shut_down.store(true, Ordering::Release);

        let ids: Vec<PtyId> = self
            .inner
            .ptys
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = Vec::with_capacity(ids.len());
        for id in ids {
            // Entries can vanish concurrently (auto-dispose, removePty).
            let Some((id, entry)) = self.inner.ptys.remove(&id) else {
                continue;
            };
            self.inner.slots.release();
            if !entry.pty.kill() {
                debug!(
                    session_id = %self.inner.session_id,
                    pty_id = %id,
                    "PTY already stopping during shutdown"
                );
            }
            swept.push(entry.pty);
        }

        info!(
            session_id = %self.inner.session_id,
            count = swept.len(),
            "PTY registry shut down"
        );
        swept
    }

    /// Shuts down and waits up to `timeout` for every swept PTY to exit.
    ///
    /// Returns the number of PTYs that had not terminated by the deadline.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stragglers = 0;

        for pty in self.shutdown() {
            if tokio::time::timeout_at(deadline, pty.wait_for_exit())
                .await
                .is_err()
            {
                warn!(
                    session_id = %self.inner.session_id,
                    pty_id = %pty.id(),
                    "PTY did not exit before shutdown deadline"
                );
                stragglers += 1;
            }
        }
        stragglers
    }

    fn allocate_id(&self) -> Result<PtyId, PtyError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.inner.ids.generate();
            if !id.is_empty() && !self.inner.ptys.contains_key(&id) {
                return Ok(id);
            }
            debug!(session_id = %self.inner.session_id, pty_id = %id, "Id collision, regenerating");
        }
        Err(PtyError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Observer that removes an exited PTY from this registry.
    ///
    /// Holds only a weak reference so a controller never keeps its registry
    /// alive.
    fn dispose_observer(&self) -> ExitObserver {
        let inner = Arc::downgrade(&self.inner);
        Box::new(move |pty_id: &PtyId| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner
                .ptys
                .remove_if(pty_id, |_, entry| entry.pty.is_terminated())
                .is_some()
            {
                inner.slots.release();
                info!(
                    session_id = %inner.session_id,
                    pty_id = %pty_id,
                    "Auto-disposed exited PTY"
                );
            }
        })
    }
}

impl std::fmt::Debug for PtyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyManager")
            .field("session_id", &self.inner.session_id)
            .field("ptys", &self.inner.ptys.len())
            .finish()
    }
}
