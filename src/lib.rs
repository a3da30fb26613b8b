//! Encrypted transport for an SMTP mail transfer agent.
//!
//! Establishes, maintains and tears down TLS sessions layered over an
//! already-open SMTP connection, inbound (after STARTTLS or on connect) and
//! outbound (before delivery), and hands the rest of the mail engine a byte
//! stream with the same contract as the plaintext socket.
//!
//! # Architecture Overview
//!
//! ```text
//!   SMTP connection (plaintext)
//!        │
//!        ▼
//!   ┌─────────────┐  start_server / start_client   ┌──────────────────────┐
//!   │ SmtpChannel │ ─────────────────────────────▶ │      TlsEngine       │
//!   │  (channel)  │                                │  (engine/handshake)  │
//!   └──────┬──────┘                                └──────────┬───────────┘
//!          │                                                  │
//!          │          ┌──────────────┬──────────────┬─────────┴─────┬──────────────┐
//!          │          ▼              ▼              ▼               ▼              ▼
//!          │    credentials      dh cache       priority       hint hook       verify
//!          │   (expand, pem)   (spool file)   (versions,     (SNI, rebind)   (policy,
//!          │                                   suites)                        judgement)
//!          │                                                  │
//!          ▼                                                  ▼
//!   record layer (next_byte / read_into / write / close) ◀── established session
//!          │                                                  │
//!          └─ TLS EOF: fall back to plaintext bindings        └─ session registry lease
//! ```

pub mod channel;
pub mod config;
pub mod credentials;
pub mod dh;
pub mod engine;
pub mod error;
pub mod expand;
pub mod hosts;
pub mod net;
pub mod observability;
pub mod priority;
pub mod random;
pub mod session;
pub mod verify;

pub use channel::{IntegrityFeed, SmtpChannel, TlsInfo};
pub use config::{ClientTlsOptions, TlsConfig};
pub use engine::{TlsEngine, TlsEngineBuilder};
pub use error::{Disposition, TlsError};
pub use session::{PeerHost, Role, VerifyRequirement};
