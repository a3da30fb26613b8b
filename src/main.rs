//! Minimal STARTTLS-capable SMTP listener.
//!
//! Speaks just enough SMTP (EHLO/HELO, STARTTLS, NOOP, QUIT) to exercise the
//! TLS engine end to end, including TLS on connect.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpStream;

use mta_tls::config::loader::load_config;
use mta_tls::error::ErrorKind;
use mta_tls::net::listener::Listener;
use mta_tls::observability::logging;
use mta_tls::{Disposition, PeerHost, SmtpChannel, TlsConfig, TlsEngine};

#[derive(Parser)]
#[command(name = "mta-tls")]
#[command(about = "Demo SMTP listener with STARTTLS", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TlsConfig::default(),
    };
    logging::init(&config.observability.log_filter);

    tracing::info!("mta-tls v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        on_connect = config.server.on_connect,
        receive_timeout_secs = config.receive_timeout_secs,
        "Configuration loaded"
    );

    let listener = Listener::bind(&config.listener).await?;
    let hostname: Arc<str> = Arc::from(config.listener.hostname.as_str());
    let engine = Arc::new(TlsEngine::new(config)?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr, permit) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let engine = Arc::clone(&engine);
                let hostname = Arc::clone(&hostname);
                tokio::spawn(async move {
                    let peer = PeerHost::from_address(addr.ip());
                    serve(engine, stream, peer, &hostname).await;
                    drop(permit);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

async fn serve(engine: Arc<TlsEngine>, stream: TcpStream, peer: PeerHost, hostname: &str) {
    let mut channel = SmtpChannel::new(stream, Some(peer)).with_receive_timeout(engine.config().receive_timeout());

    if engine.config().server.on_connect {
        if let Err(e) = engine.start_server(&mut channel, None).await {
            tracing::info!(error = %e, "TLS on connect failed, dropping connection");
            return;
        }
    }

    if reply(&mut channel, &format!("220 {} ESMTP\r\n", hostname)).await.is_err() {
        return;
    }

    while let Some(line) = channel.read_line().await {
        let command = line.trim_end().to_ascii_uppercase();
        let verb = command.split_whitespace().next().unwrap_or("");
        let response = match verb {
            "EHLO" => {
                if channel.is_tls_active() {
                    format!("250-{}\r\n250 PIPELINING\r\n", hostname)
                } else {
                    format!("250-{}\r\n250-PIPELINING\r\n250 STARTTLS\r\n", hostname)
                }
            }
            "HELO" => format!("250 {}\r\n", hostname),
            "NOOP" => "250 OK\r\n".to_string(),
            "STARTTLS" => {
                match engine.start_server(&mut channel, None).await {
                    Ok(()) => continue,
                    Err(e) if e.kind() == ErrorKind::AlreadyActive => continue,
                    Err(e) if e.disposition() == Disposition::Defer => {
                        "454 TLS currently unavailable\r\n".to_string()
                    }
                    Err(_) => return,
                }
            }
            "QUIT" => {
                let _ = reply(&mut channel, &format!("221 {} closing connection\r\n", hostname)).await;
                channel.close_tls(true).await;
                return;
            }
            _ => "500 unrecognized command\r\n".to_string(),
        };
        if reply(&mut channel, &response).await.is_err() {
            return;
        }
    }

    tracing::debug!(
        connection_id = %channel.id(),
        error = channel.has_error(),
        "connection ended"
    );
}

async fn reply(channel: &mut SmtpChannel<TcpStream>, response: &str) -> Result<(), ()> {
    channel.write(response.as_bytes()).await.map(|_| ()).map_err(|e| {
        tracing::debug!(error = %e, "write failed");
    })
}
