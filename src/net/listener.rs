//! Plain SMTP listener for the demo server. Each accepted socket carries a
//! slot from a fixed pool; the slot returns to the pool when dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::schema::ListenerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("cannot listen on {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("accept: {0}")]
    Accept(#[source] io::Error),

    #[error("slot pool shut down")]
    Closed,
}

#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    slots: Arc<Semaphore>,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: config.bind_address.clone(),
            source,
        };
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let socket = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local = socket.local_addr().map_err(bind_err)?;

        tracing::info!(
            address = %local,
            slots = config.max_connections,
            "listening for SMTP"
        );
        Ok(Self {
            socket,
            slots: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Wait for a free slot, then for a connection. Keep the permit alive
    /// until the session ends.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, OwnedSemaphorePermit), ListenerError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;
        let (stream, peer) = self.socket.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(%peer, free_slots = self.slots.available_permits(), "SMTP connection");
        Ok((stream, peer, slot))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slots_follow_open_connections() {
        let config = ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            hostname: "localhost".into(),
            max_connections: 2,
        };
        let listener = Listener::bind(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.free_slots(), 1);
        drop(permit);
        assert_eq!(listener.free_slots(), 2);
    }

    #[tokio::test]
    async fn bad_address_is_a_bind_error() {
        let config = ListenerConfig {
            bind_address: "not an address".into(),
            ..ListenerConfig::default()
        };
        assert!(matches!(Listener::bind(&config).await, Err(ListenerError::Bind { .. })));
    }
}
