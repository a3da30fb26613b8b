//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TlsConfig (validated, immutable)
//!     → shared via Arc by the engine and every session it starts
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a new engine
//! - All fields have defaults to allow minimal configs
//! - Path options stay unexpanded templates; they are expanded per session
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::ClientTlsOptions;
pub use schema::ServerTlsConfig;
pub use schema::TlsConfig;
