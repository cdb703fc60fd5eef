//! Per-connection authentication records.
//!
//! Each client connection has at most one record, holding the identity it
//! authenticated as and/or the handshake it is in the middle of. Records are only
//! touched by requests of their own connection; the map is concurrent so that
//! different connections never wait on each other.
use std::fmt;

use dashmap::DashMap;

use crate::Mechanism;

/// Identifies one client transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> ConnectionId {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The connection's request-sequence marker as seen by the boundary.
///
/// A client that re-sends credentials under a different generation than the one an
/// identity was cached at is re-authenticating, not merely reusing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Generation {
        Generation(self.0.wrapping_add(1))
    }
}

impl From<u64> for Generation {
    fn from(generation: u64) -> Generation {
        Generation(generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    pub user: String,
    pub mechanism: Mechanism,
    pub generation: Generation,
}

/// A handshake that has issued at least one challenge on this connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingHandshake {
    pub mechanism: Mechanism,
    pub challenges: u32,
}

#[derive(Debug, Default)]
struct ConnectionEntry {
    identity: Option<CachedIdentity>,
    pending: Option<PendingHandshake>,
}

/// Result of [`ConnectionAuthCache::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCheck {
    /// The cached identity stands for this request
    Reuse(CachedIdentity),
    /// The client re-authenticated; the record was dropped
    Invalidated(CachedIdentity),
    /// No identity cached for the connection
    Miss,
}

#[derive(Debug, Default)]
pub struct ConnectionAuthCache {
    entries: DashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionAuthCache {
    pub fn new() -> ConnectionAuthCache {
        ConnectionAuthCache::default()
    }

    pub fn lookup(&self, connection: ConnectionId) -> Option<CachedIdentity> {
        self.entries.get(&connection).and_then(|entry| entry.identity.clone())
    }

    /// Record a successful authentication. Any pending handshake is finished.
    pub fn store(&self, connection: ConnectionId, identity: CachedIdentity) {
        let mut entry = self.entries.entry(connection).or_default();
        entry.identity = Some(identity);
        entry.pending = None;
    }

    /// Drop everything recorded for `connection`. Returns whether there was a record.
    pub fn invalidate(&self, connection: ConnectionId) -> bool {
        self.entries.remove(&connection).is_some()
    }

    /// Decide whether the cached identity covers a new request.
    ///
    /// The identity is reused when the request carries no credentials, or when it
    /// does but the connection is still at the generation the identity was stored
    /// at. Otherwise the whole record is dropped.
    pub fn check(&self, connection: ConnectionId, generation: Generation, has_credentials: bool) -> CacheCheck {
        let stale = {
            let Some(entry) = self.entries.get(&connection) else {
                return CacheCheck::Miss;
            };
            match entry.identity {
                None => return CacheCheck::Miss,
                Some(ref identity) if !has_credentials || identity.generation == generation => {
                    return CacheCheck::Reuse(identity.clone());
                }
                Some(ref identity) => identity.clone(),
            }
        };
        self.entries.remove(&connection);
        CacheCheck::Invalidated(stale)
    }

    pub fn pending(&self, connection: ConnectionId) -> Option<PendingHandshake> {
        self.entries.get(&connection).and_then(|entry| entry.pending)
    }

    /// Note that a challenge was sent for `mechanism` and return how many have been
    /// sent in the current handshake. A different mechanism starts a new count.
    pub fn note_challenge(&self, connection: ConnectionId, mechanism: Mechanism) -> u32 {
        let mut entry = self.entries.entry(connection).or_default();
        let challenges = match entry.pending {
            Some(pending) if pending.mechanism == mechanism => pending.challenges.saturating_add(1),
            _ => 1,
        };
        entry.identity = None;
        entry.pending = Some(PendingHandshake { mechanism, challenges });
        challenges
    }

    /// Number of connections with a record
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
