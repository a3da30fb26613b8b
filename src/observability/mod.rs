//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Engine, channel, DH cache and verifier produce:
//!     → logging.rs (structured log events, `panic = true` marks events that
//!       would take the whole process down in a forking MTA)
//!     → metrics.rs (handshake, verification and DH counters, session gauge)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → whatever recorder the embedding process installs
//! ```
//!
//! # Design Decisions
//! - Metrics go through the `metrics` facade; the embedding process picks
//!   the exporter
//! - No span-per-session; fields carry role and peer instead

pub mod logging;
pub mod metrics;
