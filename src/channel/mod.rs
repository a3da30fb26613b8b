//! SMTP byte channel over plaintext or TLS.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → plain.rs (PlainBuffer, before STARTTLS and after fallback)
//!     → record.rs (RecordFramer → library → XferBuffer, while TLS is active)
//!         → IntegrityFeed (next_byte refills only)
//!     → SMTP layer via next_byte / read_line / read_into
//! ```
//!
//! # Design Decisions
//! - One channel value per connection; switching between plaintext and TLS
//!   is a field change, so the SMTP layer never rebinds function pointers
//! - I/O failures become an error flag plus end-of-stream; callers only see
//!   absence of data
//! - A close_notify from the peer drops back to plaintext transparently

pub mod plain;
pub mod record;

use std::fmt;
use std::time::Duration;

use rustls::Connection;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::config::schema::DEFAULT_XFER_BUFFER_SIZE;
use crate::observability::metrics;
use crate::session::{ConnectionId, PeerHost, SessionLease, SessionState};

use self::plain::PlainBuffer;
use self::record::{with_deadline, RecordError, RecordFramer};

/// Longest SMTP line [`SmtpChannel::read_line`] collects.
pub const MAX_LINE_LEN: usize = 4096;

/// Downstream consumer of decrypted message bytes (DKIM verification).
pub trait IntegrityFeed: Send {
    fn feed(&mut self, bytes: &[u8]);
}

impl<F> IntegrityFeed for F
where
    F: FnMut(&[u8]) + Send,
{
    fn feed(&mut self, bytes: &[u8]) {
        self(bytes)
    }
}

/// What the rest of the MTA may know about the TLS layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    pub active: bool,
    /// `protocol:suite:bits`, no whitespace.
    pub cipher: Option<String>,
    pub bits: u32,
    pub certificate_verified: bool,
    pub peer_dn: Option<String>,
    pub sni: Option<String>,
    /// Base64 of the exported channel-binding value.
    pub channel_binding: Option<String>,
}

impl TlsInfo {
    pub(crate) fn from_session(session: &SessionState, channel_binding: Option<String>) -> Self {
        Self {
            active: true,
            cipher: session.cipher().map(str::to_string),
            bits: session.bits(),
            certificate_verified: session.certificate_verified(),
            peer_dn: session.peer_dn().map(str::to_string),
            sni: session.received_sni().map(str::to_string),
            channel_binding,
        }
    }
}

/// Negotiated TLS layer of a channel.
pub(crate) struct ActiveTls {
    pub(crate) conn: Connection,
    pub(crate) state: SessionState,
    pub(crate) framer: RecordFramer,
    pub(crate) lease: SessionLease,
}

impl fmt::Debug for ActiveTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTls")
            .field("session", &self.lease.handle())
            .field("role", &self.state.role())
            .field("framer_buffered", &self.framer.buffered())
            .finish()
    }
}

/// One SMTP connection, plaintext or TLS.
pub struct SmtpChannel<S> {
    id: ConnectionId,
    peer: Option<PeerHost>,
    stream: S,
    plain: PlainBuffer,
    tls: Option<ActiveTls>,
    info: TlsInfo,
    feed: Option<Box<dyn IntegrityFeed>>,
    receive_timeout: Option<Duration>,
}

impl<S> fmt::Debug for SmtpChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpChannel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("tls", &self.tls)
            .field("info", &self.info)
            .finish()
    }
}

impl<S> SmtpChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: Option<PeerHost>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            stream,
            plain: PlainBuffer::new(DEFAULT_XFER_BUFFER_SIZE),
            tls: None,
            info: TlsInfo::default(),
            feed: None,
            receive_timeout: None,
        }
    }

    /// Deadline applied to each socket read; `None` waits forever.
    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn set_integrity_feed(&mut self, feed: Option<Box<dyn IntegrityFeed>>) {
        self.feed = feed;
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<&PeerHost> {
        self.peer.as_ref()
    }

    pub fn tls_info(&self) -> &TlsInfo {
        &self.info
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.state.is_active())
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn deadline(&self) -> Option<Instant> {
        self.receive_timeout.map(|t| Instant::now() + t)
    }

    pub fn is_eof(&self) -> bool {
        match &self.tls {
            Some(tls) => tls.state.xfer().is_eof(),
            None => self.plain.is_eof(),
        }
    }

    pub fn has_error(&self) -> bool {
        match &self.tls {
            Some(tls) => tls.state.xfer().has_error(),
            None => self.plain.has_error(),
        }
    }

    /// Whether received bytes are waiting to be consumed.
    pub fn buffered(&self) -> bool {
        match &self.tls {
            Some(tls) => tls.state.xfer().pending() > 0,
            None => self.plain.pending() > 0,
        }
    }

    /// Next received byte, or `None` at end of stream.
    pub async fn next_byte(&mut self) -> Option<u8> {
        if self.tls.is_none() {
            let deadline = self.deadline();
            return self.plain.next_byte(&mut self.stream, deadline).await;
        }

        let deadline = self.deadline();
        let tls = self.tls.as_mut()?;
        if let Some(byte) = tls.state.xfer_mut().take() {
            return Some(byte);
        }
        if tls.state.xfer().is_eof() {
            return None;
        }

        let ActiveTls {
            conn, state, framer, ..
        } = tls;
        let xfer = state.xfer_mut();
        match record::recv(conn, framer, &mut self.stream, xfer.fill_target(), deadline).await {
            Ok(0) => {
                self.fall_back_to_plaintext();
                self.plain.next_byte(&mut self.stream, deadline).await
            }
            Ok(n) => {
                xfer.filled(n);
                if let Some(feed) = self.feed.as_mut() {
                    feed.feed(&xfer.fill_target()[..n]);
                }
                xfer.take()
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.id,
                    timed_out = e.is_timeout(),
                    error = %e,
                    "TLS read failed"
                );
                xfer.set_error();
                xfer.set_eof();
                None
            }
        }
    }

    /// One line including its terminator, lossily decoded. `None` at end of
    /// stream with nothing read.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = Vec::new();
        while line.len() < MAX_LINE_LEN {
            match self.next_byte().await {
                Some(byte) => {
                    line.push(byte);
                    if byte == b'\n' {
                        break;
                    }
                }
                None if line.is_empty() => return None,
                None => break,
            }
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bulk read that bypasses the byte buffer. Not fed to the integrity hook.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, RecordError> {
        let deadline = self.deadline();
        let Some(tls) = self.tls.as_mut() else {
            return self.plain.read_into(&mut self.stream, buf, deadline).await;
        };

        let pending = tls.state.xfer().pending();
        if pending > 0 {
            tracing::warn!(
                connection_id = %self.id,
                pending,
                "bulk TLS read while bytes are still buffered for next_byte"
            );
        }

        let ActiveTls {
            conn, state, framer, ..
        } = tls;
        match record::recv(conn, framer, &mut self.stream, buf, deadline).await {
            Ok(n) => Ok(n),
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "TLS read failed");
                state.xfer_mut().set_error();
                Err(e)
            }
        }
    }

    /// Send all of `buf`, or fail.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, RecordError> {
        let deadline = self.deadline();
        match self.tls.as_mut() {
            Some(tls) => {
                let result = record::send(&mut tls.conn, &mut self.stream, buf, deadline).await;
                if let Err(e) = &result {
                    tracing::warn!(connection_id = %self.id, error = %e, "TLS write failed");
                }
                result
            }
            None => {
                with_deadline(deadline, self.stream.write_all(buf)).await??;
                with_deadline(deadline, self.stream.flush()).await??;
                Ok(buf.len())
            }
        }
    }

    /// Tear the TLS layer down, optionally sending close_notify first.
    ///
    /// Peer DN and cipher stay readable in [`tls_info`](Self::tls_info).
    pub async fn close_tls(&mut self, send_shutdown: bool) {
        let Some(mut tls) = self.tls.take() else {
            return;
        };
        if send_shutdown {
            tracing::debug!(connection_id = %self.id, "shutting down TLS");
            tls.conn.send_close_notify();
            let deadline = self.deadline();
            if let Err(e) = record::flush(&mut tls.conn, &mut self.stream, deadline).await {
                tracing::debug!(connection_id = %self.id, error = %e, "failed to send close_notify");
            }
        }
        self.plain.restore(std::mem::take(&mut tls.framer).into_inner());
        self.info.active = false;
    }

    fn fall_back_to_plaintext(&mut self) {
        let Some(tls) = self.tls.take() else {
            return;
        };
        tracing::info!(
            connection_id = %self.id,
            session = %tls.lease.handle(),
            "TLS closed by peer, reverting to plaintext"
        );
        self.plain.restore(tls.framer.into_inner());
        self.info = TlsInfo::default();
        metrics::record_fallback();
    }

    pub(crate) fn activate(&mut self, tls: ActiveTls, info: TlsInfo) {
        self.tls = Some(tls);
        self.info = info;
    }

    /// Plaintext the peer sent before the TLS layer took over.
    pub(crate) fn take_buffered_plaintext(&mut self) -> Vec<u8> {
        self.plain.take_all()
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Write a protocol response in the clear.
    pub(crate) async fn respond_plain(&mut self, line: &str) -> Result<(), RecordError> {
        let deadline = self.deadline();
        with_deadline(deadline, self.stream.write_all(line.as_bytes())).await??;
        with_deadline(deadline, self.stream.flush()).await??;
        Ok(())
    }

    /// Close the write side after a protocol failure.
    pub(crate) async fn shutdown_transport(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(connection_id = %self.id, error = %e, "transport shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plaintext_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = SmtpChannel::new(a, None);
        let mut right = SmtpChannel::new(b, None);

        assert_eq!(left.write(b"250 OK\r\n").await.unwrap(), 8);
        assert_eq!(right.read_line().await.as_deref(), Some("250 OK\r\n"));
        assert!(!right.buffered());
        assert!(!right.is_tls_active());
        assert_eq!(right.tls_info(), &TlsInfo::default());
    }

    #[tokio::test]
    async fn eof_without_error() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut right = SmtpChannel::new(b, None);
        assert_eq!(right.next_byte().await, None);
        assert!(right.is_eof());
        assert!(!right.has_error());
    }

    #[tokio::test]
    async fn close_without_tls_is_a_no_op() {
        let (a, _b) = tokio::io::duplex(64);
        let mut chan = SmtpChannel::new(a, None);
        chan.close_tls(true).await;
        assert!(!chan.is_tls_active());
    }
}
