//! ClientHello hook: record the SNI and, when the certificate template
//! depends on it, rebind credentials before the handshake continues.

use std::sync::Arc;

use rustls::ServerConfig;

use crate::engine::bind::ServerBinder;
use crate::error::{ErrorKind, TlsError};
use crate::session::SessionState;

/// Longest host name accepted as a hint.
pub const MAX_HINT_LEN: usize = 255;

pub(crate) fn on_client_hello(
    session: &mut SessionState,
    binder: &ServerBinder<'_>,
    bound: Arc<ServerConfig>,
    server_name: Option<&str>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let Some(name) = server_name else {
        tracing::debug!("no SNI presented in handshake");
        return Ok(bound);
    };
    if name.len() > MAX_HINT_LEN {
        tracing::debug!(len = name.len(), "ignoring oversized SNI");
        return Ok(bound);
    }

    session.set_received_sni(name.to_string());
    let trigger = session.trigger_sni_changes();
    tracing::debug!(
        sni = name,
        used_for_certificate = trigger,
        "received TLS SNI"
    );
    if !trigger {
        return Ok(bound);
    }

    // Credentials were accepted once already; a failure now can only abort.
    let (config, previous) = binder.bind(session, Some(name)).map_err(|e| {
        TlsError::new(
            ErrorKind::Protocol,
            e.context().clone(),
            format!("SNI rebind: {}", e.operation()),
            e.cause().map(str::to_string),
        )
    })?;

    match (previous, session.resolved_credentials()) {
        (Some(previous), Some(current)) if previous.same_identity(current) => {
            tracing::debug!(sni = name, "TLS SNI: cert and key unchanged");
        }
        _ => {
            tracing::debug!(sni = name, "TLS SNI: have a changed cert/key pair");
        }
    }
    Ok(config)
}
