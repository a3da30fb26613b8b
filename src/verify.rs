//! Peer certificate verification.
//!
//! # Responsibilities
//! - Wrap the TLS library's certificate verifiers so the judgement on the
//!   peer chain is recorded instead of always aborting the handshake
//! - Turn the recorded judgement into a [`VerificationOutcome`] under the
//!   session's None / Optional / Required policy
//! - Extract the peer distinguished name once per session
//!
//! # Design Decisions
//! - Under Required the wrapped verifier returns the error in-handshake, so
//!   the library sends the fatal alert to the peer itself
//! - Under Optional (and for the client role without a trust store) the
//!   chain is judged but the handshake continues; handshake signatures are
//!   always checked
//! - Client-role verification checks the chain only; MX host names rarely
//!   match certificates
//! - Chain validation and revocation are the library's; nothing here
//!   re-implements X.509 path building

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, Error, RootCertStore, SignatureScheme};

use crate::observability::metrics;
use crate::session::{SessionState, VerifyRequirement};

/// Why a peer certificate did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The peer sent no certificate.
    Absent,
    /// The certificate is not X.509 the library can evaluate.
    UnsupportedType,
    /// The chain did not validate.
    Invalid,
    /// The certificate is revoked.
    Revoked,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Absent => "absent",
            FailureReason::UnsupportedType => "unsupported certificate type",
            FailureReason::Invalid => "invalid",
            FailureReason::Revoked => "revoked",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking the peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub failure: Option<FailureReason>,
    /// Library text for `Invalid` judgements.
    pub detail: Option<String>,
}

impl VerificationOutcome {
    fn unchecked() -> Self {
        Self {
            verified: false,
            failure: None,
            detail: None,
        }
    }

    fn failed(reason: FailureReason, detail: Option<String>) -> Self {
        Self {
            verified: false,
            failure: Some(reason),
            detail,
        }
    }
}

/// What the library concluded about the peer chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Judgement {
    Trusted,
    Unsupported,
    Revoked,
    Invalid(String),
}

impl Judgement {
    fn from_result(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Judgement::Trusted,
            Err(Error::InvalidCertificate(CertificateError::Revoked)) => Judgement::Revoked,
            Err(e) => Judgement::Invalid(e.to_string()),
        }
    }

    fn into_error(self) -> Option<Error> {
        match self {
            Judgement::Trusted => None,
            Judgement::Unsupported => Some(Error::InvalidCertificate(CertificateError::BadEncoding)),
            Judgement::Revoked => Some(Error::InvalidCertificate(CertificateError::Revoked)),
            Judgement::Invalid(_) => Some(Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }
}

/// Shared slot the wrapped verifiers record their judgement in.
#[derive(Debug, Clone, Default)]
pub struct JudgementCell(Arc<Mutex<Option<Judgement>>>);

impl JudgementCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Judgement> {
        self.0.lock().clone()
    }

    fn record(&self, judgement: Judgement) {
        *self.0.lock() = Some(judgement);
    }
}

fn is_x509(der: &CertificateDer<'_>) -> bool {
    x509_parser::parse_x509_certificate(der.as_ref()).is_ok()
}

/// Subject DN of the leaf certificate.
pub fn subject_dn(leaf: &CertificateDer<'_>) -> Option<String> {
    x509_parser::parse_x509_certificate(leaf.as_ref())
        .ok()
        .map(|(_, cert)| cert.subject().to_string())
}

fn is_name_mismatch(err: &Error) -> bool {
    match err {
        Error::InvalidCertificate(CertificateError::NotValidForName) => true,
        // Newer library versions attach the names to the variant.
        Error::InvalidCertificate(other) => format!("{:?}", other).starts_with("NotValidForName"),
        _ => false,
    }
}

/// Server-side verifier for client certificates.
#[derive(Debug)]
pub struct RecordingClientVerifier {
    inner: Option<Arc<dyn ClientCertVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    requirement: VerifyRequirement,
    cell: JudgementCell,
}

impl RecordingClientVerifier {
    pub fn new(
        roots: Option<Arc<RootCertStore>>,
        crls: Vec<CertificateRevocationListDer<'static>>,
        provider: Arc<CryptoProvider>,
        requirement: VerifyRequirement,
        cell: JudgementCell,
    ) -> Result<Self, VerifierBuilderError> {
        let algorithms = provider.signature_verification_algorithms;
        let inner = match roots {
            Some(roots) => {
                let mut builder = WebPkiClientVerifier::builder_with_provider(roots, provider);
                if !crls.is_empty() {
                    builder = builder
                        .with_crls(crls)
                        .only_check_end_entity_revocation()
                        .allow_unknown_revocation_status();
                }
                Some(builder.build()?)
            }
            None => None,
        };
        Ok(Self {
            inner,
            algorithms,
            requirement,
            cell,
        })
    }
}

impl ClientCertVerifier for RecordingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.requirement != VerifyRequirement::None
    }

    fn client_auth_mandatory(&self) -> bool {
        self.requirement == VerifyRequirement::Required
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.inner {
            Some(inner) => inner.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        let judgement = if !is_x509(end_entity) {
            Judgement::Unsupported
        } else {
            match &self.inner {
                Some(inner) => Judgement::from_result(
                    inner.verify_client_cert(end_entity, intermediates, now).map(|_| ()),
                ),
                None => Judgement::Invalid("no trust anchors configured".into()),
            }
        };
        self.cell.record(judgement.clone());

        match (self.requirement, judgement.into_error()) {
            (VerifyRequirement::Required, Some(err)) => Err(err),
            _ => Ok(ClientCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client-side verifier for server certificates.
#[derive(Debug)]
pub struct RecordingServerVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
    requirement: VerifyRequirement,
    cell: JudgementCell,
}

impl RecordingServerVerifier {
    pub fn new(
        roots: Option<Arc<RootCertStore>>,
        crls: Vec<CertificateRevocationListDer<'static>>,
        provider: Arc<CryptoProvider>,
        requirement: VerifyRequirement,
        cell: JudgementCell,
    ) -> Result<Self, VerifierBuilderError> {
        let algorithms = provider.signature_verification_algorithms;
        let inner = match roots {
            Some(roots) => {
                let mut builder = WebPkiServerVerifier::builder_with_provider(roots, provider);
                if !crls.is_empty() {
                    builder = builder
                        .with_crls(crls)
                        .only_check_end_entity_revocation()
                        .allow_unknown_revocation_status();
                }
                Some(builder.build()?)
            }
            None => None,
        };
        Ok(Self {
            inner,
            algorithms,
            requirement,
            cell,
        })
    }
}

impl ServerCertVerifier for RecordingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let judgement = if !is_x509(end_entity) {
            Judgement::Unsupported
        } else {
            match &self.inner {
                Some(inner) => {
                    let result = inner
                        .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                        .map(|_| ());
                    match result {
                        Err(e) if is_name_mismatch(&e) => Judgement::Trusted,
                        other => Judgement::from_result(other),
                    }
                }
                None => Judgement::Invalid("no trust anchors configured".into()),
            }
        };
        self.cell.record(judgement.clone());

        match (self.requirement, judgement.into_error()) {
            (VerifyRequirement::Required, Some(err)) => Err(err),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Evaluate the peer certificate of an established session.
///
/// Records the peer DN (once) and the outcome on `session`. Under Required
/// a returned failure means the connection must be rejected.
pub fn verify_peer(
    session: &mut SessionState,
    peer_certs: Option<&[CertificateDer<'static>]>,
    cell: &JudgementCell,
) -> VerificationOutcome {
    let leaf = peer_certs.and_then(|certs| certs.first());
    session.record_peer_dn(|| leaf.and_then(subject_dn));

    let requirement = session.verify_requirement();
    let outcome = if requirement == VerifyRequirement::None {
        VerificationOutcome::unchecked()
    } else {
        match leaf {
            None => VerificationOutcome::failed(FailureReason::Absent, None),
            Some(leaf) if !is_x509(leaf) => VerificationOutcome::failed(FailureReason::UnsupportedType, None),
            Some(_) => match cell.get() {
                Some(Judgement::Trusted) => VerificationOutcome {
                    verified: true,
                    failure: None,
                    detail: None,
                },
                Some(Judgement::Unsupported) => {
                    VerificationOutcome::failed(FailureReason::UnsupportedType, None)
                }
                Some(Judgement::Revoked) => VerificationOutcome::failed(FailureReason::Revoked, None),
                Some(Judgement::Invalid(detail)) => {
                    VerificationOutcome::failed(FailureReason::Invalid, Some(detail))
                }
                None => VerificationOutcome::failed(
                    FailureReason::Invalid,
                    Some("certificate was not evaluated".into()),
                ),
            },
        }
    };

    let dn = session.peer_dn().unwrap_or("<unset>").to_string();
    match (&outcome.failure, requirement) {
        (None, VerifyRequirement::None) => {}
        (None, _) => {
            tracing::debug!(role = %session.role(), peer_dn = %dn, "peer certificate verified");
        }
        (Some(reason), VerifyRequirement::Required) => {
            tracing::error!(
                role = %session.role(),
                peer_dn = %dn,
                reason = %reason,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "TLS verification failure"
            );
        }
        (Some(reason), _) => {
            tracing::warn!(
                role = %session.role(),
                peer_dn = %dn,
                reason = %reason,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "TLS verification failure, continuing unverified"
            );
        }
    }

    let label = match (&outcome.failure, outcome.verified) {
        (_, true) => "verified",
        (Some(reason), false) => reason.as_str(),
        (None, false) => "unchecked",
    };
    metrics::record_verification(session.role().as_str(), label);

    session.record_outcome(outcome.clone());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    fn session(requirement: VerifyRequirement) -> SessionState {
        let mut s = SessionState::new(Role::Server, None, 64);
        s.set_verify_requirement(requirement);
        s
    }

    #[test]
    fn policy_none_never_verifies() {
        let mut s = session(VerifyRequirement::None);
        let cell = JudgementCell::new();
        cell.record(Judgement::Trusted);
        let outcome = verify_peer(&mut s, None, &cell);
        assert!(!outcome.verified);
        assert_eq!(outcome.failure, None);
        assert!(!s.certificate_verified());
    }

    #[test]
    fn absent_certificate_under_optional() {
        let mut s = session(VerifyRequirement::Optional);
        let outcome = verify_peer(&mut s, Some(&[]), &JudgementCell::new());
        assert_eq!(outcome.failure, Some(FailureReason::Absent));
        assert!(!s.certificate_verified());
        assert_eq!(s.peer_dn(), None);
    }

    #[test]
    fn garbage_certificate_is_unsupported() {
        let mut s = session(VerifyRequirement::Required);
        let certs = vec![CertificateDer::from(vec![1u8, 2, 3])];
        let outcome = verify_peer(&mut s, Some(&certs), &JudgementCell::new());
        assert_eq!(outcome.failure, Some(FailureReason::UnsupportedType));
    }

    #[test]
    fn judgement_maps_library_errors() {
        assert_eq!(
            Judgement::from_result(Err(Error::InvalidCertificate(CertificateError::Revoked))),
            Judgement::Revoked
        );
        assert!(matches!(
            Judgement::from_result(Err(Error::InvalidCertificate(CertificateError::Expired))),
            Judgement::Invalid(_)
        ));
        assert_eq!(Judgement::Trusted.into_error(), None);
    }

    #[test]
    fn name_mismatch_is_recognised() {
        assert!(is_name_mismatch(&Error::InvalidCertificate(CertificateError::NotValidForName)));
        assert!(!is_name_mismatch(&Error::InvalidCertificate(CertificateError::UnknownIssuer)));
    }

    #[test]
    fn outcome_is_recorded_once() {
        let mut s = session(VerifyRequirement::Optional);
        let cell = JudgementCell::new();
        let certs = vec![CertificateDer::from(vec![0u8])];
        verify_peer(&mut s, Some(&certs), &cell);
        cell.record(Judgement::Trusted);
        verify_peer(&mut s, Some(&certs), &cell);
        assert_eq!(s.outcome().and_then(|o| o.failure), Some(FailureReason::UnsupportedType));
    }
}
