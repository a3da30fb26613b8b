//! Registry of live TLS sessions and the library state they share.
//!
//! # Responsibilities
//! - Hand out opaque session handles and connection IDs
//! - Refuse a second session for the same connection and role
//! - Initialise the process-wide TLS library state on first use and tear it
//!   down when the last session goes away
//!
//! # Design Decisions
//! - Sessions are held by RAII leases; dropping the lease is the only way a
//!   session leaves the registry, so every exit path releases it
//! - Relaxed counters are enough for IDs; only uniqueness matters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use rustls::crypto::CryptoProvider;

use crate::observability::metrics;
use crate::session::Role;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an SMTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque handle to a live TLS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tls-{}", self.0)
    }
}

/// What the registry knows about a live session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub connection: ConnectionId,
    pub role: Role,
    pub started: Instant,
}

/// Returned when a connection already has a session in the same role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("TLS {role} session already active on {connection}")]
pub struct AlreadyActive {
    pub connection: ConnectionId,
    pub role: Role,
}

/// Live sessions plus the process-wide TLS library state.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: DashMap<SessionHandle, SessionEntry>,
    next_handle: AtomicU64,
    library: Mutex<Option<Arc<CryptoProvider>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `connection` in `role`.
    pub fn acquire(
        self: &Arc<Self>,
        connection: ConnectionId,
        role: Role,
    ) -> Result<SessionLease, AlreadyActive> {
        if self.is_active(connection, role) {
            return Err(AlreadyActive { connection, role });
        }

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.insert(
            handle,
            SessionEntry {
                connection,
                role,
                started: Instant::now(),
            },
        );
        metrics::record_active_sessions(self.entries.len());
        tracing::trace!(session = %handle, connection_id = %connection, role = %role, "TLS session registered");

        Ok(SessionLease {
            registry: Arc::clone(self),
            handle,
        })
    }

    pub fn is_active(&self, connection: ConnectionId, role: Role) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.connection == connection && entry.role == role)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<SessionEntry> {
        self.entries.get(&handle).map(|entry| entry.clone())
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Crypto provider for new sessions, initialising the library on first use.
    pub fn ensure_library(&self) -> Arc<CryptoProvider> {
        let mut slot = self.library.lock();
        if let Some(provider) = slot.as_ref() {
            return Arc::clone(provider);
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        tracing::debug!("TLS library initialised");
        *slot = Some(Arc::clone(&provider));
        provider
    }

    pub fn library_initialised(&self) -> bool {
        self.library.lock().is_some()
    }

    fn release(&self, handle: SessionHandle) {
        if let Some((_, entry)) = self.entries.remove(&handle) {
            tracing::trace!(
                session = %handle,
                connection_id = %entry.connection,
                role = %entry.role,
                lifetime_ms = entry.started.elapsed().as_millis() as u64,
                "TLS session released"
            );
        }
        metrics::record_active_sessions(self.entries.len());

        if self.entries.is_empty() && self.library.lock().take().is_some() {
            tracing::debug!("no TLS sessions remain, library state torn down");
        }
    }
}

/// Keeps a session registered; releases it on drop.
#[derive(Debug)]
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    handle: SessionHandle,
}

impl SessionLease {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(self.handle);
    }
}
