//! Shared fixtures for the integration tests: a throwaway PKI, engine
//! configs and an in-memory connection pair.

#![allow(dead_code)]

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use tempfile::TempDir;
use tokio::io::DuplexStream;

use mta_tls::expand::{ExpandError, Expander, ExpansionVars, VariableExpander};
use mta_tls::{ClientTlsOptions, PeerHost, SmtpChannel, TlsConfig, TlsEngine, VerifyRequirement};

pub const SERVER_NAME: &str = "mx.example.org";
pub const CLIENT_NAME: &str = "client.example.org";

const REVOKED_SERIAL: u64 = 0x5eed;

/// CA, server, client and revoked-client material written as PEM files.
pub struct TestPki {
    pub dir: TempDir,
    pub ca: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub revoked_cert: PathBuf,
    pub revoked_key: PathBuf,
    pub crl: PathBuf,
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "Test Mail CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let (server, server_key) = leaf(SERVER_NAME, 1, &ca, &ca_key);
        let (client, client_key) = leaf(CLIENT_NAME, 2, &ca, &ca_key);
        let (revoked, revoked_key) = leaf("revoked.example.org", REVOKED_SERIAL, &ca, &ca_key);

        let crl = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: vec![RevokedCertParams {
                serial_number: SerialNumber::from(REVOKED_SERIAL),
                revocation_time: date_time_ymd(2024, 1, 1),
                reason_code: Some(RevocationReason::KeyCompromise),
                invalidity_date: None,
            }],
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&ca, &ca_key)
        .unwrap();

        let write = |name: &str, contents: &str| {
            let path = dir.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        };

        Self {
            ca: write("ca.pem", &ca.pem()),
            server_cert: write("server.pem", &server.pem()),
            server_key: write("server.key", &server_key.serialize_pem()),
            client_cert: write("client.pem", &client.pem()),
            client_key: write("client.key", &client_key.serialize_pem()),
            revoked_cert: write("revoked.pem", &revoked.pem()),
            revoked_key: write("revoked.key", &revoked_key.serialize_pem()),
            crl: write("ca.crl", &crl.pem().unwrap()),
            dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn leaf(name: &str, serial: u64, ca: &Certificate, ca_key: &KeyPair) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.serial_number = Some(SerialNumber::from(serial));
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    (cert, key)
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Server config with the test certificate, the CA as trust store and a
/// private spool directory.
pub fn server_config(pki: &TestPki, spool: &Path) -> TlsConfig {
    let mut config = TlsConfig {
        spool_directory: spool.to_path_buf(),
        receive_timeout_secs: 10,
        ..TlsConfig::default()
    };
    config.server.certificate = Some(path_str(&pki.server_cert));
    config.server.privatekey = Some(path_str(&pki.server_key));
    config.server.verify_certificates = Some(path_str(&pki.ca));
    config
}

pub fn client_config(spool: &Path) -> TlsConfig {
    TlsConfig {
        spool_directory: spool.to_path_buf(),
        receive_timeout_secs: 10,
        ..TlsConfig::default()
    }
}

/// Client options trusting the test CA, optionally presenting a certificate.
pub fn client_options(pki: &TestPki, identity: Option<(&Path, &Path)>) -> ClientTlsOptions {
    let mut options = ClientTlsOptions {
        verify_certificates: Some(path_str(&pki.ca)),
        timeout_secs: 10,
        ..ClientTlsOptions::default()
    };
    if let Some((cert, key)) = identity {
        options.certificate = Some(path_str(cert));
        options.privatekey = Some(path_str(key));
    }
    options
}

pub fn server_engine(config: TlsConfig, requirement: VerifyRequirement) -> TlsEngine {
    TlsEngine::builder(config)
        .policy(Arc::new(requirement))
        .build()
        .unwrap()
}

pub fn client_engine(config: TlsConfig) -> TlsEngine {
    TlsEngine::new(config).unwrap()
}

pub fn server_host() -> PeerHost {
    PeerHost::new(Some(SERVER_NAME.to_string()), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

/// Server and client channels joined by an in-memory pipe.
pub fn channel_pair() -> (SmtpChannel<DuplexStream>, SmtpChannel<DuplexStream>) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = SmtpChannel::new(server_io, Some(PeerHost::from_address(IpAddr::V4(Ipv4Addr::LOCALHOST))))
        .with_receive_timeout(Some(std::time::Duration::from_secs(10)));
    let client = SmtpChannel::new(client_io, Some(server_host()))
        .with_receive_timeout(Some(std::time::Duration::from_secs(10)));
    (server, client)
}

/// Run STARTTLS on both ends: the server answers, the client reads the
/// go-ahead and negotiates.
pub async fn starttls(
    server_engine: &TlsEngine,
    server: &mut SmtpChannel<DuplexStream>,
    client_engine: &TlsEngine,
    client: &mut SmtpChannel<DuplexStream>,
    options: &ClientTlsOptions,
) -> (Result<(), mta_tls::TlsError>, Result<(), mta_tls::TlsError>) {
    let host = server_host();
    tokio::join!(server_engine.start_server(server, None), async {
        let go_ahead = client.read_line().await;
        assert_eq!(go_ahead.as_deref(), Some("220 TLS go ahead\r\n"));
        client_engine.start_client(client, &host, options).await
    })
}

/// Expander that counts how often one template is expanded.
#[derive(Debug)]
pub struct CountingExpander {
    inner: VariableExpander,
    watched: String,
    hits: AtomicUsize,
}

impl CountingExpander {
    pub fn new(watched: impl Into<String>) -> Self {
        Self {
            inner: VariableExpander::new(),
            watched: watched.into(),
            hits: AtomicUsize::new(0),
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Expander for CountingExpander {
    fn expand(&self, template: &str, vars: &ExpansionVars<'_>) -> Result<String, ExpandError> {
        if template == self.watched {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.expand(template, vars)
    }
}
