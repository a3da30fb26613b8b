//! Record-layer behaviour once a session is established.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::DuplexStream;

use mta_tls::{SmtpChannel, TlsInfo, VerifyRequirement};

use common::*;

struct Established {
    _pki: TestPki,
    _spool: tempfile::TempDir,
    server: SmtpChannel<DuplexStream>,
    client: SmtpChannel<DuplexStream>,
}

async fn established() -> Established {
    let pki = TestPki::generate();
    let spool = tempfile::tempdir().unwrap();
    let server_engine = server_engine(server_config(&pki, spool.path()), VerifyRequirement::None);
    let client_engine = client_engine(client_config(spool.path()));
    let options = client_options(&pki, None);

    let (mut server, mut client) = channel_pair();
    let (server_result, client_result) =
        starttls(&server_engine, &mut server, &client_engine, &mut client, &options).await;
    server_result.unwrap();
    client_result.unwrap();

    Established {
        _pki: pki,
        _spool: spool,
        server,
        client,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn read_bytes(channel: &mut SmtpChannel<DuplexStream>, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        out.push(channel.next_byte().await.unwrap());
    }
    out
}

async fn read_bulk(channel: &mut SmtpChannel<DuplexStream>, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 1000];
    while out.len() < len {
        let n = channel.read_into(&mut buf).await.unwrap();
        assert!(n > 0, "unexpected end of stream");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[tokio::test]
async fn byte_reads_preserve_data_across_buffer_boundaries() {
    let Established {
        mut server, mut client, ..
    } = established().await;

    for len in [0, 1, 4095, 4096, 4097, 3 * 4096 + 17] {
        let data = payload(len);
        let (written, received) = tokio::join!(client.write(&data), read_bytes(&mut server, len));
        assert_eq!(written.unwrap(), len);
        assert_eq!(received, data, "length {}", len);
    }
    assert!(!server.buffered());
}

#[tokio::test]
async fn bulk_reads_preserve_data_in_both_directions() {
    let Established {
        mut server, mut client, ..
    } = established().await;

    for len in [1, 4096, 3 * 4096 + 17] {
        let data = payload(len);
        let (written, received) = tokio::join!(server.write(&data), read_bulk(&mut client, len));
        assert_eq!(written.unwrap(), len);
        assert_eq!(received, data);

        let (written, received) = tokio::join!(client.write(&data), read_bulk(&mut server, len));
        assert_eq!(written.unwrap(), len);
        assert_eq!(received, data);
    }
}

#[tokio::test]
async fn close_notify_falls_back_to_plaintext() {
    let Established {
        mut server, mut client, ..
    } = established().await;

    client.write(b"NOOP\r\n").await.unwrap();
    client.close_tls(true).await;
    assert!(!client.is_tls_active());
    assert!(client.tls_info().cipher.is_some());
    client.write(b"QUIT\r\n").await.unwrap();

    assert_eq!(server.read_line().await.as_deref(), Some("NOOP\r\n"));
    assert_eq!(server.read_line().await.as_deref(), Some("QUIT\r\n"));
    assert!(!server.is_tls_active());
    assert_eq!(server.tls_info(), &TlsInfo::default());
    assert!(!server.has_error());
}

#[tokio::test]
async fn close_without_shutdown_keeps_session_details() {
    let Established { mut server, .. } = established().await;

    let before = server.tls_info().clone();
    server.close_tls(false).await;
    assert!(!server.is_tls_active());
    assert!(!server.tls_info().active);
    assert_eq!(server.tls_info().cipher, before.cipher);
    assert_eq!(server.tls_info().channel_binding, before.channel_binding);

    // Closing twice is a no-op.
    server.close_tls(true).await;
    assert!(!server.is_tls_active());
}

#[tokio::test]
async fn integrity_feed_sees_byte_reads_only() {
    let Established {
        mut server, mut client, ..
    } = established().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    server.set_integrity_feed(Some(Box::new(move |bytes: &[u8]| {
        sink.lock().extend_from_slice(bytes);
    })));

    client.write(b"DKIM-Signature: v=1\r\n").await.unwrap();
    assert_eq!(
        server.read_line().await.as_deref(),
        Some("DKIM-Signature: v=1\r\n")
    );
    assert_eq!(seen.lock().as_slice(), b"DKIM-Signature: v=1\r\n");

    client.write(b"bulk").await.unwrap();
    assert_eq!(read_bulk(&mut server, 4).await, b"bulk");
    assert_eq!(seen.lock().len(), b"DKIM-Signature: v=1\r\n".len());
}

#[tokio::test]
async fn peer_disconnect_reports_end_of_stream() {
    let Established { mut server, client, .. } = established().await;

    drop(client);
    assert_eq!(server.next_byte().await, None);
    assert!(server.is_eof());
}
