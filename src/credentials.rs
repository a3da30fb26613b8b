//! Credential provisioning.
//!
//! # Responsibilities
//! - Expand the certificate, key, trust-store and CRL templates of a session
//! - Apply the path rules (server needs a certificate, key defaults to the
//!   certificate, empty trust store disables verification, CRL needs a
//!   trust store)
//! - Load the PEM material the TLS library binds
//!
//! # Design Decisions
//! - Resolution and loading are separate so a hint-triggered re-resolution
//!   can be compared with the previous paths before anything is read
//! - Loaded material is never mutated; a rebind builds a new library config

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::config::schema::{ClientTlsOptions, ServerTlsConfig};
use crate::expand::{ExpandError, Expander, ExpansionVars, TLS_SNI};
use crate::session::Role;

/// Unexpanded credential options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCredentials {
    pub certificate: Option<String>,
    pub privatekey: Option<String>,
    pub verify_certificates: Option<String>,
    pub crl: Option<String>,
}

impl RawCredentials {
    pub fn from_server(config: &ServerTlsConfig) -> Self {
        Self {
            certificate: config.certificate.clone(),
            privatekey: config.privatekey.clone(),
            verify_certificates: config.verify_certificates.clone(),
            crl: config.crl.clone(),
        }
    }

    pub fn from_client(options: &ClientTlsOptions) -> Self {
        Self {
            certificate: options.certificate.clone(),
            privatekey: options.privatekey.clone(),
            verify_certificates: options.verify_certificates.clone(),
            crl: options.crl.clone(),
        }
    }
}

/// Expanded credential paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    pub certificate: Option<PathBuf>,
    pub privatekey: Option<PathBuf>,
    /// Trust store, only when it names a non-empty regular file.
    pub trust: Option<PathBuf>,
    /// Only honoured together with `trust`.
    pub crl: Option<PathBuf>,
}

impl CredentialSet {
    /// Same certificate and key paths as `other`.
    pub fn same_identity(&self, other: &CredentialSet) -> bool {
        self.certificate == other.certificate && self.privatekey == other.privatekey
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("expansion of {option} failed: {source}")]
    Expansion {
        option: &'static str,
        source: ExpandError,
    },

    #[error("no TLS server certificate is specified")]
    MissingServerCertificate,

    #[error("failed to stat {path}: {source}")]
    TrustStat { path: PathBuf, source: io::Error },

    #[error("{path} is a directory")]
    TrustIsDirectory { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        option: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("no certificates found in {path}")]
    NoCertificates { path: PathBuf },

    #[error("no private key found in {path}")]
    NoPrivateKey { path: PathBuf },
}

impl CredentialError {
    /// Option the failure relates to, used as the operation name in errors.
    pub fn operation(&self) -> &'static str {
        match self {
            CredentialError::Expansion { option, .. } | CredentialError::Read { option, .. } => *option,
            CredentialError::MissingServerCertificate | CredentialError::NoCertificates { .. } => {
                "tls_certificate"
            }
            CredentialError::TrustStat { .. } | CredentialError::TrustIsDirectory { .. } => {
                "tls_verify_certificates"
            }
            CredentialError::NoPrivateKey { .. } => "tls_privatekey",
        }
    }
}

/// PEM material ready to bind.
#[derive(Debug)]
pub struct LoadedCredentials {
    pub set: CredentialSet,
    pub chain: Vec<CertificateDer<'static>>,
    pub key: Option<PrivateKeyDer<'static>>,
    pub roots: Option<Arc<RootCertStore>>,
    pub crls: Vec<CertificateRevocationListDer<'static>>,
}

/// Resolves and loads credentials for one role.
#[derive(Debug, Clone, Copy)]
pub struct Provisioner<'a> {
    expander: &'a dyn Expander,
    role: Role,
}

impl<'a> Provisioner<'a> {
    pub fn new(expander: &'a dyn Expander, role: Role) -> Self {
        Self { expander, role }
    }

    /// Whether a received hint must trigger re-resolution.
    pub fn references_hint(&self, raw: &RawCredentials) -> bool {
        raw.certificate
            .as_deref()
            .is_some_and(|template| self.expander.references(template, TLS_SNI))
    }

    pub fn resolve(&self, raw: &RawCredentials, hint: Option<&str>) -> Result<CredentialSet, CredentialError> {
        let vars = ExpansionVars { tls_sni: hint };

        let certificate = self.expand("tls_certificate", raw.certificate.as_deref(), &vars)?;
        if certificate.is_none() && self.role == Role::Server {
            return Err(CredentialError::MissingServerCertificate);
        }

        let privatekey = match self.expand("tls_privatekey", raw.privatekey.as_deref(), &vars)? {
            Some(key) => Some(key),
            None => certificate.clone(),
        };

        let trust = match self.expand("tls_verify_certificates", raw.verify_certificates.as_deref(), &vars)? {
            Some(path) => check_trust_path(path)?,
            None => {
                tracing::debug!(role = %self.role, "tls_verify_certificates not set or empty, ignoring");
                None
            }
        };

        // Without a trust store the CRL is ignored too.
        let crl = match trust {
            Some(_) => self.expand("tls_crl", raw.crl.as_deref(), &vars)?,
            None => None,
        };

        Ok(CredentialSet {
            certificate,
            privatekey,
            trust,
            crl,
        })
    }

    pub fn load(&self, set: CredentialSet) -> Result<LoadedCredentials, CredentialError> {
        let (chain, key) = match (&set.certificate, &set.privatekey) {
            (Some(cert_path), Some(key_path)) => {
                let chain = read_certs("tls_certificate", cert_path)?;
                if chain.is_empty() {
                    return Err(CredentialError::NoCertificates {
                        path: cert_path.clone(),
                    });
                }
                let key = read_key(key_path)?;
                tracing::debug!(
                    role = %self.role,
                    certificate = %cert_path.display(),
                    key = %key_path.display(),
                    "loaded certificate and key"
                );
                (chain, Some(key))
            }
            _ => (Vec::new(), None),
        };

        let mut roots = None;
        let mut crls = Vec::new();
        if let Some(trust_path) = &set.trust {
            let certs = read_certs("tls_verify_certificates", trust_path)?;
            let mut store = RootCertStore::empty();
            let (added, ignored) = store.add_parsable_certificates(certs);
            tracing::debug!(path = %trust_path.display(), added, ignored, "loaded trust store");
            if added == 0 {
                tracing::warn!(path = %trust_path.display(), "no usable certificates in trust store");
            } else {
                roots = Some(Arc::new(store));
            }

            if let (Some(crl_path), Some(_)) = (&set.crl, &roots) {
                crls = read_crls(crl_path)?;
                tracing::debug!(path = %crl_path.display(), count = crls.len(), "loaded CRLs");
            }
        }

        Ok(LoadedCredentials {
            set,
            chain,
            key,
            roots,
            crls,
        })
    }

    fn expand(
        &self,
        option: &'static str,
        template: Option<&str>,
        vars: &ExpansionVars<'_>,
    ) -> Result<Option<PathBuf>, CredentialError> {
        let Some(template) = template else {
            return Ok(None);
        };
        let expanded = self
            .expander
            .expand(template, vars)
            .map_err(|source| CredentialError::Expansion { option, source })?;
        if expanded.is_empty() {
            tracing::debug!(option, "expanded to an empty string, ignoring");
            return Ok(None);
        }
        Ok(Some(PathBuf::from(expanded)))
    }
}

/// Trust-store rules: a directory is a misconfiguration, an empty file
/// means "no verification configured".
fn check_trust_path(path: PathBuf) -> Result<Option<PathBuf>, CredentialError> {
    let metadata = match fs::metadata(&path) {
        Ok(m) => m,
        Err(source) => {
            tracing::error!(panic = true, path = %path.display(), error = %source, "failed to stat tls_verify_certificates");
            return Err(CredentialError::TrustStat { path, source });
        }
    };

    if metadata.is_dir() {
        tracing::error!(panic = true, path = %path.display(), "tls_verify_certificates is a directory");
        return Err(CredentialError::TrustIsDirectory { path });
    }

    if metadata.len() == 0 {
        tracing::debug!(path = %path.display(), "tls_verify_certificates is empty, ignoring");
        return Ok(None);
    }

    Ok(Some(path))
}

fn open(option: &'static str, path: &Path) -> Result<BufReader<File>, CredentialError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CredentialError::Read {
            option,
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(option: &'static str, path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let mut reader = open(option, path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::Read {
            option,
            path: path.to_path_buf(),
            source,
        })
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, CredentialError> {
    let mut reader = open("tls_privatekey", path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CredentialError::Read {
            option: "tls_privatekey",
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CredentialError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

fn read_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, CredentialError> {
    let mut reader = open("tls_crl", path)?;
    rustls_pemfile::crls(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::Read {
            option: "tls_crl",
            path: path.to_path_buf(),
            source,
        })
}
