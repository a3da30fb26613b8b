//! Negotiation error taxonomy.
//!
//! # Responsibilities
//! - Carry the failing operation, the underlying cause and the role/peer
//!   context of every start failure
//! - Map each failure onto the `Defer` / `Fail` outcome the SMTP layer acts on
//!
//! # Design Decisions
//! - Setup failures on the server role defer (the session may continue in
//!   clear); everything on the client role, and everything after negotiation
//!   started, fails
//! - Timeouts are a distinct kind so callers know the socket was left alone

use std::fmt;

use crate::session::{PeerHost, Role};

/// What the caller should do with the connection after a failed start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Setup failed before negotiation; the connection may continue unencrypted.
    Defer,
    /// The connection is not usable for this attempt.
    Fail,
}

/// Broad class of a start failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credential, parameter or configuration problem before negotiation.
    Setup,
    /// A TLS layer is already active for this connection and role.
    AlreadyActive,
    /// The handshake deadline expired.
    TimedOut,
    /// The TLS library reported a protocol failure.
    Protocol,
    /// The underlying socket failed or closed.
    Io,
    /// The peer certificate was rejected under a Required policy.
    Verification,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Setup => "setup",
            ErrorKind::AlreadyActive => "already_active",
            ErrorKind::TimedOut => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
            ErrorKind::Verification => "verification",
        }
    }
}

/// Role and peer an error relates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    /// Inbound connection; the peer may not be known (in-memory transports).
    Inbound { peer: Option<PeerHost> },
    /// Outbound connection to a delivery host.
    Outbound { host: PeerHost },
}

impl ErrorContext {
    pub fn role(&self) -> Role {
        match self {
            ErrorContext::Inbound { .. } => Role::Server,
            ErrorContext::Outbound { .. } => Role::Client,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::Inbound { peer: Some(peer) } => write!(f, "connection from {}", peer),
            ErrorContext::Inbound { peer: None } => write!(f, "incoming connection"),
            ErrorContext::Outbound { host } => write!(f, "connection to {}", host),
        }
    }
}

/// A failed attempt to start or run a TLS session.
#[derive(Debug, Clone)]
pub struct TlsError {
    kind: ErrorKind,
    operation: String,
    cause: Option<String>,
    context: ErrorContext,
}

impl TlsError {
    pub fn new(
        kind: ErrorKind,
        context: ErrorContext,
        operation: impl Into<String>,
        cause: Option<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            cause,
            context,
        }
    }

    /// Setup failure before any TLS bytes were exchanged.
    pub fn setup(context: ErrorContext, operation: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Setup, context, operation, Some(cause.to_string()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Name of the step that failed, e.g. `tls_certificate` or `handshake`.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// The `Defer` / `Fail` outcome of the failed start.
    pub fn disposition(&self) -> Disposition {
        match (self.context.role(), self.kind) {
            (Role::Server, ErrorKind::Setup) => Disposition::Defer,
            _ => Disposition::Fail,
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS error on {} ({})", self.context, self.operation)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for TlsError {}
