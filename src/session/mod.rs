//! Per-connection TLS session state.
//!
//! # Responsibilities
//! - Hold negotiation and post-negotiation data for one TLS-protected connection
//! - Track the negotiation phase (Idle → Initializing → CredentialBound →
//!   Negotiating → Established, or Failed)
//! - Own the receive buffer the record layer serves bytes from
//!
//! # Design Decisions
//! - Every session is its own value; callbacks get it by reference instead of
//!   through a process-wide slot
//! - `reset` re-establishes documented defaults rather than zero-filling
//! - Live sessions are tracked in [`registry::SessionRegistry`] so the
//!   "already active" rule and library teardown do not need globals

pub mod registry;

use std::fmt;
use std::net::IpAddr;

use crate::credentials::{CredentialSet, RawCredentials};
use crate::verify::VerificationOutcome;

pub use registry::{ConnectionId, SessionHandle, SessionLease, SessionRegistry};

/// Which end of the TLS handshake this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Inbound connection (STARTTLS received, or TLS on connect).
    Server,
    /// Outbound delivery connection.
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strictly the peer certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyRequirement {
    /// Never inspect the peer certificate.
    #[default]
    None,
    /// Inspect and record the outcome, never reject.
    Optional,
    /// Inspect and reject the connection on failure.
    Required,
}

/// Identity of the remote end, as far as it is known.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerHost {
    pub name: Option<String>,
    pub address: Option<IpAddr>,
}

impl PeerHost {
    pub fn new(name: Option<String>, address: Option<IpAddr>) -> Self {
        Self { name, address }
    }

    pub fn from_address(address: IpAddr) -> Self {
        Self {
            name: None,
            address: Some(address),
        }
    }
}

impl fmt::Display for PeerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.address) {
            (Some(name), Some(addr)) => write!(f, "{} [{}]", name, addr),
            (Some(name), None) => f.write_str(name),
            (None, Some(addr)) => write!(f, "[{}]", addr),
            (None, None) => f.write_str("<unknown>"),
        }
    }
}

/// Negotiation phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initializing,
    CredentialBound,
    Negotiating,
    Established,
    Failed,
}

/// Receive buffer with low and high water marks (`lwm <= hwm`).
#[derive(Debug)]
pub struct XferBuffer {
    buf: Box<[u8]>,
    lwm: usize,
    hwm: usize,
    eof: bool,
    error: bool,
}

impl XferBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            lwm: 0,
            hwm: 0,
            eof: false,
            error: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.lwm >= self.hwm
    }

    /// Bytes received but not yet handed to the caller.
    pub fn pending(&self) -> usize {
        self.hwm - self.lwm
    }

    /// Whole buffer, for a refill. Only meaningful once exhausted.
    pub fn fill_target(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Record that `n` bytes were written into [`fill_target`](Self::fill_target).
    pub fn filled(&mut self, n: usize) {
        self.lwm = 0;
        self.hwm = n.min(self.buf.len());
    }

    pub fn take(&mut self) -> Option<u8> {
        if self.is_exhausted() {
            return None;
        }
        let byte = self.buf[self.lwm];
        self.lwm += 1;
        Some(byte)
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn has_error(&self) -> bool {
        self.error
    }
}

/// State of one TLS session, server or client.
#[derive(Debug)]
pub struct SessionState {
    role: Role,
    phase: Phase,
    peer: Option<PeerHost>,
    verify_requirement: VerifyRequirement,
    raw: RawCredentials,
    resolved: Option<CredentialSet>,
    received_sni: Option<String>,
    trigger_sni_changes: bool,
    cipher: Option<String>,
    bits: u32,
    peer_dn: Option<String>,
    peer_dn_extracted: bool,
    certificate_verified: bool,
    outcome: Option<VerificationOutcome>,
    xfer: XferBuffer,
}

impl SessionState {
    pub fn new(role: Role, peer: Option<PeerHost>, xfer_capacity: usize) -> Self {
        Self {
            role,
            phase: Phase::Idle,
            peer,
            verify_requirement: VerifyRequirement::None,
            raw: RawCredentials::default(),
            resolved: None,
            received_sni: None,
            trigger_sni_changes: false,
            cipher: None,
            bits: 0,
            peer_dn: None,
            peer_dn_extracted: false,
            certificate_verified: false,
            outcome: None,
            xfer: XferBuffer::new(xfer_capacity),
        }
    }

    /// Return the slot to its defaults for a new negotiation in `role`.
    /// The peer and buffer capacity are kept. The engine builds a fresh
    /// state per negotiation; this is for embedders that reuse one.
    pub fn reset(&mut self, role: Role) {
        let peer = self.peer.take();
        let capacity = self.xfer.capacity();
        *self = Self::new(role, peer, capacity);
    }

    /// Whether a negotiation or an established session occupies the slot.
    /// [`SmtpChannel::is_tls_active`](crate::channel::SmtpChannel::is_tls_active)
    /// answers through this, and the engine refuses a second STARTTLS on it.
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Failed)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, phase: Phase) {
        tracing::trace!(role = %self.role, from = ?self.phase, to = ?phase, "TLS session phase");
        self.phase = phase;
    }

    pub fn peer(&self) -> Option<&PeerHost> {
        self.peer.as_ref()
    }

    pub fn verify_requirement(&self) -> VerifyRequirement {
        self.verify_requirement
    }

    pub fn set_verify_requirement(&mut self, requirement: VerifyRequirement) {
        self.verify_requirement = requirement;
    }

    pub fn raw_credentials(&self) -> &RawCredentials {
        &self.raw
    }

    pub fn set_raw_credentials(&mut self, raw: RawCredentials) {
        self.raw = raw;
    }

    pub fn resolved_credentials(&self) -> Option<&CredentialSet> {
        self.resolved.as_ref()
    }

    /// Store a fresh resolution, returning the one it replaces.
    pub fn replace_credentials(&mut self, set: CredentialSet) -> Option<CredentialSet> {
        self.resolved.replace(set)
    }

    pub fn received_sni(&self) -> Option<&str> {
        self.received_sni.as_deref()
    }

    pub fn set_received_sni(&mut self, sni: String) {
        self.received_sni = Some(sni);
    }

    /// Whether a received hint forces credential re-resolution.
    pub fn trigger_sni_changes(&self) -> bool {
        self.trigger_sni_changes
    }

    pub fn set_trigger_sni_changes(&mut self, trigger: bool) {
        self.trigger_sni_changes = trigger;
    }

    pub fn cipher(&self) -> Option<&str> {
        self.cipher.as_deref()
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn set_cipher(&mut self, descriptor: String, bits: u32) {
        self.cipher = Some(descriptor);
        self.bits = bits;
    }

    pub fn peer_dn(&self) -> Option<&str> {
        self.peer_dn.as_deref()
    }

    /// Store the peer DN, once. Later calls are ignored even if the first
    /// extraction found nothing.
    pub fn record_peer_dn(&mut self, extract: impl FnOnce() -> Option<String>) {
        if self.peer_dn_extracted {
            return;
        }
        self.peer_dn_extracted = true;
        self.peer_dn = extract();
    }

    pub fn certificate_verified(&self) -> bool {
        self.certificate_verified
    }

    pub fn outcome(&self) -> Option<&VerificationOutcome> {
        self.outcome.as_ref()
    }

    /// Store the verification outcome. Computed at most once per session.
    pub fn record_outcome(&mut self, outcome: VerificationOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.certificate_verified = outcome.verified;
        self.outcome = Some(outcome);
    }

    pub fn xfer(&self) -> &XferBuffer {
        &self.xfer
    }

    pub fn xfer_mut(&mut self) -> &mut XferBuffer {
        &mut self.xfer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xfer_buffer_serves_filled_bytes() {
        let mut xfer = XferBuffer::new(8);
        assert!(xfer.is_exhausted());
        xfer.fill_target()[..3].copy_from_slice(b"abc");
        xfer.filled(3);
        assert_eq!(xfer.pending(), 3);
        assert_eq!(xfer.take(), Some(b'a'));
        assert_eq!(xfer.take(), Some(b'b'));
        assert_eq!(xfer.take(), Some(b'c'));
        assert_eq!(xfer.take(), None);
        assert!(xfer.is_exhausted());
    }

    #[test]
    fn reset_restores_defaults() {
        let mut state = SessionState::new(Role::Server, None, 4096);
        state.advance(Phase::Negotiating);
        state.set_received_sni("mail.example.org".into());
        state.set_trigger_sni_changes(true);
        state.set_cipher("TLS1.3:TLS13_AES_128_GCM_SHA256:128".into(), 128);
        assert!(state.is_active());

        state.reset(Role::Client);
        assert_eq!(state.role(), Role::Client);
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_active());
        assert!(state.received_sni().is_none());
        assert!(!state.trigger_sni_changes());
        assert!(state.cipher().is_none());
        assert_eq!(state.xfer().capacity(), 4096);
    }

    #[test]
    fn peer_dn_is_extracted_once() {
        let mut state = SessionState::new(Role::Client, None, 16);
        state.record_peer_dn(|| None);
        state.record_peer_dn(|| Some("CN=late".into()));
        assert_eq!(state.peer_dn(), None);
    }

    #[test]
    fn peer_host_display() {
        let peer = PeerHost::new(Some("mx.example.org".into()), "192.0.2.1".parse().ok());
        assert_eq!(peer.to_string(), "mx.example.org [192.0.2.1]");
        assert_eq!(PeerHost::default().to_string(), "<unknown>");
    }
}
