use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use uuid::Uuid;

use crate::connection::Connection;

/// Peer id -> live connection. First writer wins; removal is conditional on
/// the entry still pointing at the caller's connection.
#[derive(Clone, Default)]
pub struct IdentityRegistry {
    peers: Arc<DashMap<String, Connection>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub connection_id: Uuid,
    pub state: &'static str,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to `connection` iff nothing is bound yet.
    pub fn register(&self, id: &str, connection: &Connection) -> bool {
        match self.peers.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                true
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Connection> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    /// Remove `id` only while it still refers to `expected`.
    pub fn remove(&self, id: &str, expected: &Connection) -> bool {
        self.peers
            .remove_if(id, |_, current| current.same_as(expected))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|entry| PeerSnapshot {
                id: entry.key().clone(),
                connection_id: entry.value().id(),
                state: entry.value().state().as_str(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test_timeout::timeout]
    fn first_registration_wins() {
        let registry = IdentityRegistry::new();
        let (first, _rx1) = Connection::open(None);
        let (second, _rx2) = Connection::open(None);

        assert!(registry.register("A", &first));
        assert!(!registry.register("A", &second));

        let bound = registry.lookup("A").expect("A is bound");
        assert!(bound.same_as(&first));
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn lookup_unknown_is_none() {
        let registry = IdentityRegistry::new();
        assert!(registry.lookup("nobody").is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn remove_ignores_other_connections() {
        let registry = IdentityRegistry::new();
        let (owner, _rx1) = Connection::open(None);
        let (stranger, _rx2) = Connection::open(None);
        registry.register("A", &owner);

        assert!(!registry.remove("A", &stranger));
        assert!(registry.lookup("A").is_some());

        assert!(registry.remove("A", &owner));
        assert!(registry.lookup("A").is_none());
        assert!(!registry.remove("A", &owner));
    }

    #[test_timeout::timeout]
    fn stale_cleanup_does_not_clobber_new_binding() {
        let registry = IdentityRegistry::new();
        let (old, _rx1) = Connection::open(None);
        let (new, _rx2) = Connection::open(None);

        registry.register("A", &old);
        assert!(registry.remove("A", &old));
        assert!(registry.register("A", &new));

        // late cleanup from the old connection
        assert!(!registry.remove("A", &old));
        assert!(registry.lookup("A").expect("still bound").same_as(&new));
    }

    #[test_timeout::timeout]
    fn concurrent_registration_has_single_winner() {
        const THREADS: usize = 16;
        let registry = IdentityRegistry::new();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let (connection, rx) = Connection::open(None);
                    barrier.wait();
                    let won = registry.register("contested", &connection);
                    (won, connection, rx)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked"))
            .collect();

        let winners: Vec<_> = results.iter().filter(|(won, _, _)| *won).collect();
        assert_eq!(winners.len(), 1);
        let bound = registry.lookup("contested").expect("bound");
        assert!(bound.same_as(&winners[0].1));
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn snapshot_lists_peers_sorted() {
        let registry = IdentityRegistry::new();
        let (b, _rx1) = Connection::open(None);
        let (a, _rx2) = Connection::open(None);
        registry.register("b", &b);
        registry.register("a", &a);
        a.begin_close();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(snapshot[0].state, "closing");
        assert_eq!(snapshot[0].connection_id, a.id());
        assert_eq!(snapshot[1].id, "b");
        assert_eq!(snapshot[1].state, "open");
    }
}
