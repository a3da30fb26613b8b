//! Handshake orchestration.
//!
//! # Data Flow
//! ```text
//! start_server / start_client
//!     → registry (one session per connection and role, library init)
//!     → credentials (resolve + load) → bind.rs (library config)
//!     → dh (server only) → priority
//!     → handshake.rs (accept → hint.rs → drive)
//!     → verify (peer DN, outcome)
//!     → channel (record I/O takes over)
//! ```
//!
//! # Design Decisions
//! - Each negotiation owns its [`SessionState`]; the ClientHello hook gets it
//!   by reference, so concurrent sessions never share a slot
//! - Server setup failures defer, anything after the go-ahead fails
//! - A timed-out handshake leaves the socket to the caller; any other
//!   handshake failure shuts the transport down at once

pub mod bind;
pub mod handshake;
pub mod hint;

use std::sync::Arc;

use base64::Engine as _;
use rustls::client::ClientConnection;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{Connection, ProtocolVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::channel::record::RecordFramer;
use crate::channel::{ActiveTls, SmtpChannel, TlsInfo};
use crate::config::schema::{ClientTlsOptions, TlsConfig};
use crate::credentials::{Provisioner, RawCredentials};
use crate::dh::DhParamCache;
use crate::error::{ErrorContext, ErrorKind, TlsError};
use crate::expand::{ExpansionVars, Expander, VariableExpander};
use crate::hosts::{HostListPolicy, HostPatternError, VerifyPolicy};
use crate::observability::metrics;
use crate::priority::{suite_key_bits, Priority, DEFAULT_PRIORITY};
use crate::session::{PeerHost, Phase, Role, SessionLease, SessionRegistry, SessionState, VerifyRequirement};
use crate::verify::{self, JudgementCell};

use self::bind::ServerBinder;
use self::handshake::HandshakeFailure;

/// Smallest finite-field group a client will accept.
pub const CLIENT_DH_MIN_BITS: usize = 1024;

/// Response to STARTTLS before the handshake.
pub const GO_AHEAD: &str = "220 TLS go ahead\r\n";

/// Response to STARTTLS on a connection that already runs TLS.
pub const ALREADY_ACTIVE: &str = "554 Already in TLS\r\n";

const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-Channel-Binding";
const CHANNEL_BINDING_LEN: usize = 32;

/// Starts TLS sessions on SMTP channels.
#[derive(Debug)]
pub struct TlsEngine {
    config: Arc<TlsConfig>,
    expander: Arc<dyn Expander>,
    policy: Arc<dyn VerifyPolicy>,
    dh: Arc<DhParamCache>,
    registry: Arc<SessionRegistry>,
}

/// Builder for [`TlsEngine`]; collaborators default to the bundled ones.
#[derive(Debug)]
pub struct TlsEngineBuilder {
    config: TlsConfig,
    expander: Option<Arc<dyn Expander>>,
    policy: Option<Arc<dyn VerifyPolicy>>,
    registry: Option<Arc<SessionRegistry>>,
}

impl TlsEngineBuilder {
    pub fn expander(mut self, expander: Arc<dyn Expander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn VerifyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<TlsEngine, HostPatternError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => Arc::new(HostListPolicy::from_config(&self.config.server)?),
        };
        Ok(TlsEngine {
            dh: Arc::new(DhParamCache::from_config(&self.config)),
            expander: self.expander.unwrap_or_else(|| Arc::new(VariableExpander::new())),
            registry: self.registry.unwrap_or_default(),
            policy,
            config: Arc::new(self.config),
        })
    }
}

impl TlsEngine {
    pub fn builder(config: TlsConfig) -> TlsEngineBuilder {
        TlsEngineBuilder {
            config,
            expander: None,
            policy: None,
            registry: None,
        }
    }

    pub fn new(config: TlsConfig) -> Result<Self, HostPatternError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn dh_cache(&self) -> &DhParamCache {
        &self.dh
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Answer STARTTLS (or TLS on connect) and negotiate as the server.
    ///
    /// `allowed_ciphers` overrides the configured priority template.
    pub async fn start_server<S>(
        &self,
        channel: &mut SmtpChannel<S>,
        allowed_ciphers: Option<&str>,
    ) -> Result<(), TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let context = ErrorContext::Inbound {
            peer: channel.peer().cloned(),
        };
        let lease = match self.acquire(channel, Role::Server) {
            Some(lease) => lease,
            None => {
                tracing::error!(connection_id = %channel.id(), "STARTTLS received after TLS started");
                if let Err(e) = channel.write(ALREADY_ACTIVE.as_bytes()).await {
                    tracing::debug!(error = %e, "failed to send already-active response");
                }
                return Err(self.fail(None, TlsError::new(
                    ErrorKind::AlreadyActive,
                    context,
                    "STARTTLS received after TLS started",
                    None,
                )));
            }
        };
        tracing::debug!(connection_id = %channel.id(), session = %lease.handle(), "initialising TLS as a server");

        let library = self.registry.ensure_library();
        let mut session = SessionState::new(Role::Server, channel.peer().cloned(), self.config.xfer_buffer_size);
        session.advance(Phase::Initializing);

        let template = allowed_ciphers.or(self.config.server.require_ciphers.as_deref());
        let mut priority = match self.priority(template, &library, &context) {
            Ok(priority) => priority,
            Err(e) => return Err(self.fail(Some(&mut session), e)),
        };

        let bits = self.config.dh.target_bits();
        match self.dh.ensure_params(bits) {
            Ok(params) => {
                if priority.prefer_group(params.group()) {
                    tracing::debug!(group = ?params.group(), "DH parameters bound");
                } else {
                    tracing::debug!(
                        group = ?params.group(),
                        "finite-field group not offered by this priority; elliptic-curve exchange only"
                    );
                }
            }
            Err(e) => {
                let err = TlsError::setup(context, "DH parameters", e);
                return Err(self.fail(Some(&mut session), err));
            }
        }

        let provisioner = Provisioner::new(self.expander.as_ref(), Role::Server);
        session.set_raw_credentials(RawCredentials::from_server(&self.config.server));
        session.set_trigger_sni_changes(provisioner.references_hint(session.raw_credentials()));

        let requirement = self.policy.requirement(channel.peer());
        match requirement {
            VerifyRequirement::Required => tracing::debug!("a client certificate will be required"),
            VerifyRequirement::Optional => {
                tracing::debug!("a client certificate will be requested but not required")
            }
            VerifyRequirement::None => tracing::debug!("a client certificate will not be requested"),
        }
        session.set_verify_requirement(requirement);

        let cell = JudgementCell::new();
        let binder = ServerBinder {
            provisioner,
            priority: &priority,
            base: &library,
            cell: cell.clone(),
            context: &context,
        };
        let bound = match binder.bind(&mut session, None) {
            Ok((config, _)) => config,
            Err(e) => return Err(self.fail(Some(&mut session), e)),
        };
        session.advance(Phase::CredentialBound);

        let buffered = channel.take_buffered_plaintext();
        let initial = if self.config.server.on_connect {
            buffered
        } else {
            if !buffered.is_empty() {
                tracing::warn!(
                    connection_id = %channel.id(),
                    bytes = buffered.len(),
                    "discarding plaintext pipelined after STARTTLS"
                );
            }
            if let Err(e) = channel.respond_plain(GO_AHEAD).await {
                let err = TlsError::new(ErrorKind::Io, context, "sending go-ahead", Some(e.to_string()));
                return Err(self.fail(Some(&mut session), err));
            }
            Vec::new()
        };

        session.advance(Phase::Negotiating);
        let deadline = self.config.receive_timeout().map(|t| Instant::now() + t);
        let mut framer = RecordFramer::with_initial(initial);

        let accepted = handshake::accept(channel.stream_mut(), &mut framer, deadline, |server_name| {
            hint::on_client_hello(&mut session, &binder, bound, server_name)
        })
        .await;
        let mut conn = match accepted {
            Ok(server) => Connection::Server(server),
            Err(failure) => return Err(self.handshake_failed(channel, &mut session, failure, context).await),
        };
        if let Err(failure) = handshake::drive(&mut conn, &mut framer, channel.stream_mut(), deadline).await {
            return Err(self.handshake_failed(channel, &mut session, failure, context).await);
        }
        tracing::debug!("TLS handshake was successful");

        drop(binder);

        self.establish(channel, conn, session, framer, lease, &cell, context)
            .await
    }

    /// Negotiate as the client on an outbound connection to `host`.
    pub async fn start_client<S>(
        &self,
        channel: &mut SmtpChannel<S>,
        host: &PeerHost,
        options: &ClientTlsOptions,
    ) -> Result<(), TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let context = ErrorContext::Outbound { host: host.clone() };
        let Some(lease) = self.acquire(channel, Role::Client) else {
            return Err(self.fail(None, TlsError::new(
                ErrorKind::AlreadyActive,
                context,
                "client TLS already active",
                None,
            )));
        };
        tracing::debug!(connection_id = %channel.id(), session = %lease.handle(), host = %host, "initialising TLS as a client");

        let library = self.registry.ensure_library();
        let mut session = SessionState::new(Role::Client, Some(host.clone()), self.config.xfer_buffer_size);
        session.advance(Phase::Initializing);

        let sni = match options.sni.as_deref() {
            Some(template) => match self.expander.expand(template, &ExpansionVars::default()) {
                Ok(sni) if sni.is_empty() => None,
                Ok(sni) => Some(sni),
                Err(e) => {
                    let err = TlsError::setup(context, "tls_sni", e);
                    return Err(self.fail(Some(&mut session), err));
                }
            },
            None => None,
        };
        if let Some(sni) = &sni {
            tracing::debug!(sni = %sni, "setting TLS client SNI");
            session.set_received_sni(sni.clone());
        }

        let mut priority = match self.priority(options.require_ciphers.as_deref(), &library, &context) {
            Ok(priority) => priority,
            Err(e) => return Err(self.fail(Some(&mut session), e)),
        };
        priority.retain_min_dh_bits(CLIENT_DH_MIN_BITS);

        let requirement = if options.verify_certificates.is_some() {
            tracing::debug!("server certificate verification required");
            VerifyRequirement::Required
        } else {
            tracing::debug!("server certificate verification not required");
            VerifyRequirement::None
        };
        session.set_verify_requirement(requirement);

        let provisioner = Provisioner::new(self.expander.as_ref(), Role::Client);
        session.set_raw_credentials(RawCredentials::from_client(options));
        let loaded = provisioner
            .resolve(session.raw_credentials(), sni.as_deref())
            .and_then(|set| {
                session.replace_credentials(set.clone());
                provisioner.load(set)
            });
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                let err = TlsError::setup(context, e.operation(), e);
                return Err(self.fail(Some(&mut session), err));
            }
        };

        let cell = JudgementCell::new();
        let config = match bind::client_config(loaded, &priority, &library, requirement, cell.clone(), sni.is_some()) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                let err = TlsError::setup(context, "binding client credentials", e);
                return Err(self.fail(Some(&mut session), err));
            }
        };

        let server_name = match reference_name(sni.as_deref(), host) {
            Some(name) => name,
            None => {
                let err = TlsError::setup(context, "server name", "no usable host name or address");
                return Err(self.fail(Some(&mut session), err));
            }
        };
        let client = match ClientConnection::new(config, server_name) {
            Ok(client) => client,
            Err(e) => {
                let err = TlsError::setup(context, "starting client session", e);
                return Err(self.fail(Some(&mut session), err));
            }
        };
        session.advance(Phase::CredentialBound);

        session.advance(Phase::Negotiating);
        let deadline = options.timeout().map(|t| Instant::now() + t);
        let mut framer = RecordFramer::with_initial(channel.take_buffered_plaintext());
        let mut conn = Connection::Client(client);
        if let Err(failure) = handshake::drive(&mut conn, &mut framer, channel.stream_mut(), deadline).await {
            return Err(self.handshake_failed(channel, &mut session, failure, context).await);
        }
        tracing::debug!("TLS handshake was successful");

        self.establish(channel, conn, session, framer, lease, &cell, context)
            .await
    }

    fn acquire<S>(&self, channel: &SmtpChannel<S>, role: Role) -> Option<SessionLease>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if channel.is_tls_active() {
            return None;
        }
        self.registry.acquire(channel.id(), role).ok()
    }

    fn priority(
        &self,
        template: Option<&str>,
        base: &CryptoProvider,
        context: &ErrorContext,
    ) -> Result<Priority, TlsError> {
        let expression = match template {
            Some(template) => self
                .expander
                .expand(template, &ExpansionVars::default())
                .map_err(|e| TlsError::setup(context.clone(), "require_ciphers", e))?,
            None => String::new(),
        };
        let expression = if expression.is_empty() {
            tracing::debug!(priority = DEFAULT_PRIORITY, "using default TLS priority");
            DEFAULT_PRIORITY
        } else {
            tracing::debug!(priority = %expression, "using configured TLS priority");
            expression.as_str()
        };

        let priority = Priority::parse(expression, base)
            .map_err(|e| TlsError::setup(context.clone(), "setting TLS priority", e))?;
        if self.config.compat_mode && !priority.compat() {
            return Ok(priority.with_compat(base));
        }
        Ok(priority)
    }

    /// Peer status, verification and channel activation after a handshake.
    #[allow(clippy::too_many_arguments)]
    async fn establish<S>(
        &self,
        channel: &mut SmtpChannel<S>,
        conn: Connection,
        mut session: SessionState,
        framer: RecordFramer,
        lease: SessionLease,
        cell: &JudgementCell,
        context: ErrorContext,
    ) -> Result<(), TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let peer_certs = conn.peer_certificates().map(|certs| certs.to_vec());
        let outcome = verify::verify_peer(&mut session, peer_certs.as_deref(), cell);

        if session.verify_requirement() == VerifyRequirement::Required && !outcome.verified {
            abandon(channel, conn).await;
            let cause = outcome.failure.map(|reason| reason.to_string());
            let err = TlsError::new(ErrorKind::Verification, context, "certificate verification failed", cause);
            return Err(self.fail(Some(&mut session), err));
        }

        let (descriptor, bits) = cipher_descriptor(&conn);
        session.set_cipher(descriptor, bits);

        let channel_binding = conn
            .export_keying_material(vec![0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
            .map(|material| base64::engine::general_purpose::STANDARD.encode(material))
            .map_err(|e| tracing::debug!(error = %e, "no channel binding available"))
            .ok();

        session.advance(Phase::Established);

        let role = session.role();
        let info = TlsInfo::from_session(&session, channel_binding);
        tracing::info!(
            connection_id = %channel.id(),
            session = %lease.handle(),
            role = %role,
            peer = %context,
            cipher = info.cipher.as_deref().unwrap_or(""),
            verified = info.certificate_verified,
            peer_dn = info.peer_dn.as_deref().unwrap_or("<unset>"),
            sni = info.sni.as_deref().unwrap_or(""),
            "TLS session established"
        );
        metrics::record_handshake(role.as_str(), "ok");

        channel.activate(
            ActiveTls {
                conn,
                state: session,
                framer,
                lease,
            },
            info,
        );
        Ok(())
    }

    async fn handshake_failed<S>(
        &self,
        channel: &mut SmtpChannel<S>,
        session: &mut SessionState,
        failure: HandshakeFailure,
        context: ErrorContext,
    ) -> TlsError
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !failure.is_timeout() {
            channel.shutdown_transport().await;
        }
        let err = failure.into_error(context);
        self.fail(Some(session), err)
    }

    fn fail(&self, session: Option<&mut SessionState>, err: TlsError) -> TlsError {
        let role = err.context().role();
        if let Some(session) = session {
            session.advance(Phase::Failed);
        }
        tracing::error!(
            role = %role,
            kind = err.kind().as_str(),
            disposition = ?err.disposition(),
            "{}",
            err
        );
        metrics::record_handshake(role.as_str(), err.kind().as_str());
        err
    }
}

/// End a session whose peer failed verification after the handshake.
/// rustls cannot emit a fatal alert once keys are in use and close_notify
/// would read as a clean close, so the transport is cut instead.
async fn abandon<S>(channel: &mut SmtpChannel<S>, conn: Connection)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    drop(conn);
    channel.shutdown_transport().await;
}

/// Name the client verifies the server against.
fn reference_name(sni: Option<&str>, host: &PeerHost) -> Option<ServerName<'static>> {
    if let Some(name) = sni.or(host.name.as_deref()) {
        if let Ok(name) = ServerName::try_from(name.to_string()) {
            return Some(name);
        }
    }
    host.address.map(ServerName::from)
}

/// `protocol:suite:bits` for the negotiated session.
fn cipher_descriptor(conn: &Connection) -> (String, u32) {
    let protocol = match conn.protocol_version() {
        Some(ProtocolVersion::TLSv1_3) => "TLS1.3".to_string(),
        Some(ProtocolVersion::TLSv1_2) => "TLS1.2".to_string(),
        Some(other) => format!("{:?}", other),
        None => "unknown".to_string(),
    };
    let (suite, bits) = match conn.negotiated_cipher_suite() {
        Some(suite) => (format!("{:?}", suite.suite()), suite_key_bits(&suite)),
        None => ("unknown".to_string(), 0),
    };
    let descriptor = format!("{}:{}:{}", protocol, suite, bits)
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect();
    (descriptor, bits)
}
