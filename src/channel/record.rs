//! Record-level plumbing between a socket and the TLS library.
//!
//! The library is handed exactly one complete TLS record at a time. Bytes
//! after the record stay in the [`RecordFramer`], so plaintext that follows a
//! close_notify is never swallowed by the library and can be handed back to
//! the plaintext reader.

use std::future::Future;
use std::io::{self, Read, Write};

use rustls::Connection;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// TLS record header: type, version, length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest ciphertext record length a peer may send.
pub const MAX_RECORD_LEN: usize = 16384 + 2048;

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("timed out")]
    TimedOut,

    #[error("connection closed by peer")]
    Closed,

    #[error("record of {0} bytes exceeds the maximum record size")]
    Oversized(usize),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Tls(#[from] rustls::Error),
}

impl RecordError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RecordError::TimedOut)
    }
}

/// Run `fut` under an optional absolute deadline.
pub async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Result<F::Output, RecordError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| RecordError::TimedOut),
        None => Ok(fut.await),
    }
}

/// Buffers socket bytes until a complete TLS record is available.
#[derive(Debug, Default)]
pub struct RecordFramer {
    buf: Vec<u8>,
}

impl RecordFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer primed with bytes already read from the socket.
    pub fn with_initial(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed bytes, for the plaintext reader.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn complete_len(&self) -> Result<Option<usize>, RecordError> {
        if self.buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let body = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
        if body > MAX_RECORD_LEN {
            return Err(RecordError::Oversized(body));
        }
        let total = RECORD_HEADER_LEN + body;
        Ok((self.buf.len() >= total).then_some(total))
    }

    /// Read from `stream` until one whole record is buffered, and return it.
    pub async fn next_record<S>(&mut self, stream: &mut S, deadline: Option<Instant>) -> Result<Vec<u8>, RecordError>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(len) = self.complete_len()? {
                return Ok(self.buf.drain(..len).collect());
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = with_deadline(deadline, stream.read(&mut chunk)).await??;
            if n == 0 {
                return Err(RecordError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Hand one record to the library and process it.
pub fn absorb(conn: &mut Connection, record: &[u8]) -> Result<(), RecordError> {
    let mut rd = record;
    while !rd.is_empty() {
        conn.read_tls(&mut rd)?;
    }
    conn.process_new_packets()?;
    Ok(())
}

/// Write everything the library has queued for the peer.
pub async fn flush<S>(conn: &mut Connection, stream: &mut S, deadline: Option<Instant>) -> Result<(), RecordError>
where
    S: AsyncWrite + Unpin,
{
    if !conn.wants_write() {
        return Ok(());
    }
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out)?;
    }
    with_deadline(deadline, stream.write_all(&out)).await??;
    with_deadline(deadline, stream.flush()).await??;
    Ok(())
}

/// Best-effort flush of a pending alert after a library error.
pub async fn flush_alert<S>(conn: &mut Connection, stream: &mut S, deadline: Option<Instant>)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = flush(conn, stream, deadline).await {
        tracing::debug!(error = %e, "failed to send TLS alert");
    }
}

/// Receive decrypted bytes into `buf`.
///
/// `Ok(0)` means the peer closed the TLS layer with close_notify.
pub async fn recv<S>(
    conn: &mut Connection,
    framer: &mut RecordFramer,
    stream: &mut S,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize, RecordError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        match conn.reader().read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        let record = framer.next_record(stream, deadline).await?;
        if let Err(e) = absorb(conn, &record) {
            flush_alert(conn, stream, deadline).await;
            return Err(e);
        }
        // Key updates and session tickets may want a reply.
        flush(conn, stream, deadline).await?;
    }
}

/// Encrypt and send all of `buf`.
pub async fn send<S>(
    conn: &mut Connection,
    stream: &mut S,
    buf: &[u8],
    deadline: Option<Instant>,
) -> Result<usize, RecordError>
where
    S: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < buf.len() {
        let n = conn.writer().write(&buf[sent..])?;
        flush(conn, stream, deadline).await?;
        if n == 0 {
            return Err(RecordError::Closed);
        }
        sent += n;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framer_returns_whole_records_and_keeps_the_rest() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut bytes = vec![0x17, 0x03, 0x03, 0x00, 0x03, b'a', b'b', b'c'];
        bytes.extend_from_slice(b"QUIT\r\n");
        client.write_all(&bytes).await.unwrap();
        drop(client);

        let mut framer = RecordFramer::new();
        let record = framer.next_record(&mut server, None).await.unwrap();
        assert_eq!(record, &bytes[..8]);
        assert_eq!(framer.into_inner(), b"QUIT\r\n");
    }

    #[tokio::test]
    async fn framer_reports_close_and_oversize() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let mut framer = RecordFramer::with_initial(vec![0x17, 0x03]);
        assert!(matches!(
            framer.next_record(&mut server, None).await,
            Err(RecordError::Closed)
        ));

        let mut framer = RecordFramer::with_initial(vec![0x17, 0x03, 0x03, 0xff, 0xff]);
        assert!(matches!(
            framer.next_record(&mut server, None).await,
            Err(RecordError::Oversized(0xffff))
        ));
    }

    #[tokio::test]
    async fn framer_honours_deadline() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut framer = RecordFramer::new();
        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        let err = framer.next_record(&mut server, Some(deadline)).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
