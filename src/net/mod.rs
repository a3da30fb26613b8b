//! Network layer for the demo daemon.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → SmtpChannel (plaintext, optionally TLS on connect)
//!     → SMTP dialogue, STARTTLS → TlsEngine::start_server
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - The permit lives as long as the connection task

pub mod listener;
