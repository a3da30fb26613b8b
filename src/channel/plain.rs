//! Plaintext receive buffer.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

use super::record::{with_deadline, RecordError};

/// Bytes read from the socket but not yet consumed, plus EOF/error flags.
#[derive(Debug)]
pub struct PlainBuffer {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
    eof: bool,
    error: bool,
}

impl PlainBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            pos: 0,
            capacity: capacity.max(1),
            eof: false,
            error: false,
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Put bytes back in front of whatever is still pending.
    pub fn restore(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = bytes;
        merged.extend_from_slice(&self.buf[self.pos..]);
        self.buf = merged;
        self.pos = 0;
        self.eof = false;
    }

    /// Remove and return everything pending.
    pub fn take_all(&mut self) -> Vec<u8> {
        let rest = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;
        rest
    }

    fn take(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    async fn refill<S>(&mut self, stream: &mut S, deadline: Option<Instant>) -> Result<usize, RecordError>
    where
        S: AsyncRead + Unpin,
    {
        self.buf.clear();
        self.pos = 0;
        self.buf.resize(self.capacity, 0);
        let result = with_deadline(deadline, stream.read(&mut self.buf)).await;
        let n = match result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.buf.clear();
                return Err(e.into());
            }
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };
        self.buf.truncate(n);
        Ok(n)
    }

    pub async fn next_byte<S>(&mut self, stream: &mut S, deadline: Option<Instant>) -> Option<u8>
    where
        S: AsyncRead + Unpin,
    {
        if let Some(byte) = self.take() {
            return Some(byte);
        }
        if self.eof || self.error {
            return None;
        }
        match self.refill(stream, deadline).await {
            Ok(0) => {
                self.eof = true;
                None
            }
            Ok(_) => self.take(),
            Err(e) => {
                tracing::debug!(error = %e, "plaintext read failed");
                self.error = true;
                self.eof = true;
                None
            }
        }
    }

    /// Bulk read: pending bytes first, then the socket.
    pub async fn read_into<S>(
        &mut self,
        stream: &mut S,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<usize, RecordError>
    where
        S: AsyncRead + Unpin,
    {
        if buf.is_empty() {
            return Ok(0);
        }
        let pending = self.pending();
        if pending > 0 {
            let n = pending.min(buf.len());
            buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        if self.eof {
            return Ok(0);
        }
        match with_deadline(deadline, stream.read(buf)).await {
            Ok(Ok(0)) => {
                self.eof = true;
                Ok(0)
            }
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                self.error = true;
                Err(e.into())
            }
            Err(e) => {
                self.error = true;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn serves_socket_bytes_then_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"EHLO x\r\n").await.unwrap();
        drop(client);

        let mut plain = PlainBuffer::new(4);
        let mut out = Vec::new();
        while let Some(b) = plain.next_byte(&mut server, None).await {
            out.push(b);
        }
        assert_eq!(out, b"EHLO x\r\n");
        assert!(plain.is_eof());
        assert!(!plain.has_error());
    }

    #[tokio::test]
    async fn restored_bytes_come_first() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"C").await.unwrap();
        drop(client);

        let mut plain = PlainBuffer::new(16);
        plain.restore(b"AB".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(plain.read_into(&mut server, &mut buf, None).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"AB");
        assert_eq!(plain.next_byte(&mut server, None).await, Some(b'C'));
        assert_eq!(plain.next_byte(&mut server, None).await, None);
    }

    #[test]
    fn take_all_drains_pending() {
        let mut plain = PlainBuffer::new(16);
        plain.restore(b"MAIL FROM:<a@b>\r\n".to_vec());
        assert_eq!(plain.take_all(), b"MAIL FROM:<a@b>\r\n");
        assert_eq!(plain.pending(), 0);
    }
}
