//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (buffer sizes, DH strength)
//! - Check host lists and literal priority expressions parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TlsConfig → Result<(), Vec<ValidationError>>
//! - Templated options (containing `$`) are only checked after expansion,
//!   per session

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::TlsConfig;
use crate::dh::group_for_bits;
use crate::hosts::HostList;
use crate::priority::Priority;

/// Largest accepted record-layer buffer.
const MAX_XFER_BUFFER_SIZE: usize = 1 << 20;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &TlsConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.spool_directory.as_os_str().is_empty() {
        errors.push(ValidationError::new("spool_directory", "must not be empty"));
    }

    let prefix = &config.dh.cache_prefix;
    if prefix.is_empty() || prefix.contains('/') {
        errors.push(ValidationError::new(
            "dh.cache_prefix",
            format!("\"{}\" is not a plain file name prefix", prefix),
        ));
    }

    let bits = config.dh.target_bits();
    if group_for_bits(bits).is_none() {
        errors.push(ValidationError::new(
            "dh.bits",
            format!("no standard DH group provides {} bits", bits),
        ));
    }

    if config.xfer_buffer_size == 0 || config.xfer_buffer_size > MAX_XFER_BUFFER_SIZE {
        errors.push(ValidationError::new(
            "xfer_buffer_size",
            format!("must be between 1 and {}", MAX_XFER_BUFFER_SIZE),
        ));
    }

    for (field, list) in [
        ("server.verify_hosts", &config.server.verify_hosts),
        ("server.try_verify_hosts", &config.server.try_verify_hosts),
    ] {
        if let Err(e) = HostList::parse(list.as_slice()) {
            errors.push(ValidationError::new(field, e.to_string()));
        }
    }

    if let Some(expr) = config.server.require_ciphers.as_deref() {
        if !expr.contains('$') {
            let provider = rustls::crypto::ring::default_provider();
            if let Err(e) = Priority::parse(expr, &provider) {
                errors.push(ValidationError::new("server.require_ciphers", e.to_string()));
            }
        }
    }

    if config.server.on_connect && config.server.certificate.is_none() {
        errors.push(ValidationError::new(
            "server.on_connect",
            "requires server.certificate",
        ));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("\"{}\" is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
