//! Registry of active client sessions.
//!
//! The registry is the only shared mutable state of the connect server core.
//! Its lock is held for the duration of a single insert or remove and never
//! across I/O or callbacks. Observers are woken through a change generation
//! after the lock has been released, so they must re-read the registry rather
//! than trust the order of notifications.

use crate::session::{Session, SessionId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// Thread-safe set of currently active sessions.
///
/// Besides the registered sessions the registry counts *admissions*:
/// connections that passed the accept policies but are still handshaking.
/// [`occupancy`](Self::occupancy) covers both, so a session cap evaluated at
/// accept time also sees the connections it already approved.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// Mirror of the map size, updated under the write lock
    count: AtomicUsize,
    /// Approved connections not registered yet
    pending: AtomicUsize,
    changed: watch::Sender<u64>,
}

impl SessionRegistry {
    /// Creates an empty registry with a change generation of zero.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            changed,
        }
    }

    /// Inserts a session. Returns `false` if it was already registered.
    ///
    /// Fires the change signal on success.
    pub fn add(&self, session: Arc<Session>) -> bool {
        let inserted = self.insert(session, false);
        if inserted {
            self.notify_changed();
        }
        inserted
    }

    /// Reserves a place for an approved connection that is not registered yet.
    ///
    /// The reservation counts towards [`occupancy`](Self::occupancy) until it
    /// is either turned into a registration with [`Admission::register`] or
    /// dropped.
    pub fn admit(self: &Arc<Self>) -> Admission {
        self.pending.fetch_add(1, Ordering::SeqCst);
        Admission {
            registry: self.clone(),
            settled: false,
        }
    }

    fn insert(&self, session: Arc<Session>, admitted: bool) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let inserted = match sessions.entry(session.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        };
        self.count.store(sessions.len(), Ordering::SeqCst);
        // Released only after the count includes the session, so occupancy
        // never dips while an admission turns into a registration.
        if admitted {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        inserted
    }

    /// Removes a session. Removing an absent session is a no-op.
    ///
    /// Fires the change signal only if something was removed.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions.remove(&id);
            self.count.store(sessions.len(), Ordering::SeqCst);
            removed
        };

        if removed.is_some() {
            self.notify_changed();
        }
        removed
    }

    /// Consistent copy of the current sessions, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Looks up a registered session by id.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Whether a session with this id is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of sessions. May trail an insert or remove in flight.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approved connections that are still handshaking.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Registered sessions plus outstanding admissions.
    ///
    /// May briefly count a session twice while it is being registered, never
    /// zero times.
    pub fn occupancy(&self) -> usize {
        let pending = self.pending.load(Ordering::SeqCst);
        pending + self.count.load(Ordering::SeqCst)
    }

    /// Subscribes to the change signal.
    ///
    /// The value is a generation counter bumped once per successful insert or
    /// remove; it carries no other information.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// How many times the change signal has fired.
    pub fn changes(&self) -> u64 {
        *self.changed.borrow()
    }

    fn notify_changed(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}

/// A reserved place in a [`SessionRegistry`] for a connection that was
/// approved but not registered yet. Dropping it releases the place.
pub struct Admission {
    registry: Arc<SessionRegistry>,
    settled: bool,
}

impl Admission {
    /// Registers the session in place of the reservation.
    ///
    /// Returns `false` if the session was already registered. Fires the change
    /// signal on success.
    pub fn register(mut self, session: Arc<Session>) -> bool {
        self.settled = true;
        let inserted = self.registry.insert(session, true);
        if inserted {
            self.registry.notify_changed();
        }
        inserted
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").field("settled", &self.settled).finish()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("pending", &self.pending())
            .field("changes", &self.changes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::TracingInterpreter;
    use crate::transport::{MemoryPeerOptions, MemoryTransport, Transport};
    use std::time::Duration;

    async fn sessions(count: usize) -> Vec<Arc<Session>> {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen(9300, 256).await.unwrap();
        let connector = transport.connector();
        let mut sessions = Vec::new();
        for _ in 0..count {
            let _peer = connector.connect(9300, MemoryPeerOptions::default()).unwrap();
            let connection = listener.accept().await.unwrap().accept().unwrap();
            sessions.push(Arc::new(Session::new(
                connection,
                Duration::from_secs(1),
                6,
                &TracingInterpreter::factory(),
            )));
        }
        sessions
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = SessionRegistry::new();
        let session = sessions(1).await.remove(0);

        assert!(registry.add(session.clone()));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(session.id()));
        assert_eq!(registry.get(session.id()).map(|s| s.id()), Some(session.id()));

        assert!(registry.remove(session.id()).is_some());
        assert!(registry.is_empty());
        assert!(!registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected() {
        let registry = SessionRegistry::new();
        let session = sessions(1).await.remove(0);

        assert!(registry.add(session.clone()));
        assert!(!registry.add(session));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.changes(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let mut all = sessions(2).await;
        let kept = all.pop().unwrap();
        let removed = all.pop().unwrap();
        registry.add(kept.clone());
        registry.add(removed.clone());

        assert!(registry.remove(removed.id()).is_some());
        let changes = registry.changes();
        assert!(registry.remove(removed.id()).is_none());

        assert_eq!(registry.changes(), changes);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(kept.id()));
    }

    #[tokio::test]
    async fn test_change_signal_wakes_subscribers() {
        let registry = SessionRegistry::new();
        let session = sessions(1).await.remove(0);
        let mut changes = registry.subscribe();

        registry.add(session.clone());
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 1);

        registry.remove(session.id());
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_adds_and_snapshots() {
        let registry = Arc::new(SessionRegistry::new());
        let all = sessions(200).await;

        let writers: Vec<_> = all
            .iter()
            .cloned()
            .map(|session| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.add(session) })
            })
            .collect();

        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let snapshot = registry.snapshot();
                    let mut ids: Vec<_> = snapshot.iter().map(|s| s.id()).collect();
                    ids.sort();
                    ids.dedup();
                    assert_eq!(ids.len(), snapshot.len());
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            assert!(writer.await.unwrap());
        }
        reader.await.unwrap();

        assert_eq!(registry.len(), 200);
        assert_eq!(registry.snapshot().len(), 200);
        assert_eq!(registry.changes(), 200);
    }

    #[tokio::test]
    async fn test_admission_counts_towards_occupancy() {
        let registry = Arc::new(SessionRegistry::new());
        let session = sessions(1).await.remove(0);

        let admitted = registry.admit();
        let abandoned = registry.admit();
        assert_eq!(registry.pending(), 2);
        assert_eq!(registry.occupancy(), 2);
        assert!(registry.is_empty());

        drop(abandoned);
        assert_eq!(registry.occupancy(), 1);
        assert_eq!(registry.changes(), 0);

        assert!(admitted.register(session.clone()));
        assert_eq!(registry.pending(), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.occupancy(), 1);
        assert_eq!(registry.changes(), 1);
        assert!(registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_duplicate_admission_releases_reservation() {
        let registry = Arc::new(SessionRegistry::new());
        let session = sessions(1).await.remove(0);
        registry.add(session.clone());

        assert!(!registry.admit().register(session));
        assert_eq!(registry.pending(), 0);
        assert_eq!(registry.occupancy(), 1);
        assert_eq!(registry.changes(), 1);
    }
}
