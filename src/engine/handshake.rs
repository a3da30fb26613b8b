//! Handshake loops.
//!
//! Both roles run the library until it stops handshaking, one record at a
//! time, under an absolute deadline. A deadline expiry is reported apart from
//! protocol failures because the caller treats the socket differently.

use std::io;
use std::sync::Arc;

use rustls::server::{Acceptor, ServerConnection};
use rustls::{Connection, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::channel::record::{self, with_deadline, RecordError, RecordFramer};
use crate::error::{ErrorContext, ErrorKind, TlsError};

/// Fatal `internal_error` alert as a plaintext record. Nothing is encrypted
/// before the server's first flight, so this is valid for every version.
const INTERNAL_ERROR_ALERT: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x50];

#[derive(Debug, thiserror::Error)]
pub(crate) enum HandshakeFailure {
    #[error("timed out")]
    TimedOut,

    #[error("{0}")]
    Protocol(rustls::Error),

    #[error("{0}")]
    Io(io::Error),

    #[error("connection closed during handshake")]
    PeerClosed,

    #[error("{0}")]
    Callback(TlsError),
}

impl From<RecordError> for HandshakeFailure {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::TimedOut => HandshakeFailure::TimedOut,
            RecordError::Closed => HandshakeFailure::PeerClosed,
            RecordError::Tls(e) => HandshakeFailure::Protocol(e),
            RecordError::Io(e) => HandshakeFailure::Io(e),
            oversized @ RecordError::Oversized(_) => {
                HandshakeFailure::Io(io::Error::new(io::ErrorKind::InvalidData, oversized.to_string()))
            }
        }
    }
}

impl HandshakeFailure {
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, HandshakeFailure::TimedOut)
    }

    pub(crate) fn into_error(self, context: ErrorContext) -> TlsError {
        match self {
            HandshakeFailure::Callback(e) => e,
            HandshakeFailure::TimedOut => {
                TlsError::new(ErrorKind::TimedOut, context, "handshake", Some("timed out".into()))
            }
            HandshakeFailure::Protocol(e) => {
                TlsError::new(ErrorKind::Protocol, context, "handshake", Some(e.to_string()))
            }
            other @ (HandshakeFailure::Io(_) | HandshakeFailure::PeerClosed) => {
                TlsError::new(ErrorKind::Io, context, "handshake", Some(other.to_string()))
            }
        }
    }
}

/// Read the ClientHello, let `on_hello` pick the config, and start the
/// server connection.
pub(crate) async fn accept<S, F>(
    stream: &mut S,
    framer: &mut RecordFramer,
    deadline: Option<Instant>,
    on_hello: F,
) -> Result<ServerConnection, HandshakeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(Option<&str>) -> Result<Arc<ServerConfig>, TlsError>,
{
    let mut acceptor = Acceptor::default();
    let accepted = loop {
        let record = framer.next_record(stream, deadline).await?;
        let mut rd = &record[..];
        while !rd.is_empty() {
            acceptor.read_tls(&mut rd).map_err(HandshakeFailure::Io)?;
        }
        match acceptor.accept() {
            Ok(Some(accepted)) => break accepted,
            Ok(None) => continue,
            Err((e, mut alert)) => {
                let mut out = Vec::new();
                if alert.write(&mut out).is_ok() {
                    send_raw(stream, &out, deadline).await;
                }
                return Err(HandshakeFailure::Protocol(e));
            }
        }
    };

    let config = match on_hello(accepted.client_hello().server_name()) {
        Ok(config) => config,
        Err(e) => {
            send_raw(stream, &INTERNAL_ERROR_ALERT, deadline).await;
            return Err(HandshakeFailure::Callback(e));
        }
    };

    match accepted.into_connection(config) {
        Ok(conn) => Ok(conn),
        Err((e, mut alert)) => {
            let mut out = Vec::new();
            if alert.write(&mut out).is_ok() {
                send_raw(stream, &out, deadline).await;
            }
            Err(HandshakeFailure::Protocol(e))
        }
    }
}

/// Step the handshake until the library reports it complete.
pub(crate) async fn drive<S>(
    conn: &mut Connection,
    framer: &mut RecordFramer,
    stream: &mut S,
    deadline: Option<Instant>,
) -> Result<(), HandshakeFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        record::flush(conn, stream, deadline).await?;
        if !conn.is_handshaking() {
            return Ok(());
        }
        let record = framer.next_record(stream, deadline).await?;
        if let Err(e) = record::absorb(conn, &record) {
            record::flush_alert(conn, stream, deadline).await;
            return Err(e.into());
        }
    }
}

async fn send_raw<S>(stream: &mut S, bytes: &[u8], deadline: Option<Instant>)
where
    S: AsyncWrite + Unpin,
{
    if let Ok(Err(e)) = with_deadline(deadline, stream.write_all(bytes)).await {
        tracing::debug!(error = %e, "failed to send TLS alert");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    fn client_hello() -> Vec<u8> {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let name = rustls::pki_types::ServerName::try_from("mx.example.org").unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut hello = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut hello).unwrap();
        }
        hello
    }

    #[tokio::test]
    async fn refused_hello_gets_a_fatal_alert() {
        let (mut server, mut client) = tokio::io::duplex(16 * 1024);
        let mut framer = RecordFramer::with_initial(client_hello());

        let result = accept(&mut server, &mut framer, None, |name| {
            assert_eq!(name, Some("mx.example.org"));
            Err(TlsError::new(
                ErrorKind::Protocol,
                ErrorContext::Inbound { peer: None },
                "SNI rebind: tls_certificate",
                None,
            ))
        })
        .await;
        assert!(matches!(result, Err(HandshakeFailure::Callback(_))));
        drop(server);

        let mut sent = Vec::new();
        client.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, INTERNAL_ERROR_ALERT);
    }
}
