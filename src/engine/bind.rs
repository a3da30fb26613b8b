//! Credential binding: loaded material plus priority into a library config.
//!
//! Library configs are immutable once built, so every (re)bind produces a
//! fresh one.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::VerifierBuilderError;
use rustls::{ClientConfig, ServerConfig};

use crate::credentials::{CredentialError, CredentialSet, LoadedCredentials, Provisioner};
use crate::error::{ErrorContext, TlsError};
use crate::priority::Priority;
use crate::session::{SessionState, VerifyRequirement};
use crate::verify::{JudgementCell, RecordingClientVerifier, RecordingServerVerifier};

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("{0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("{0}")]
    Library(#[from] rustls::Error),

    #[error("no private key loaded")]
    MissingKey,
}

pub(crate) fn server_config(
    loaded: LoadedCredentials,
    priority: &Priority,
    base: &CryptoProvider,
    requirement: VerifyRequirement,
    cell: JudgementCell,
) -> Result<ServerConfig, BindError> {
    let provider = Arc::new(priority.provider(base));
    let verifier = RecordingClientVerifier::new(
        loaded.roots,
        loaded.crls,
        Arc::clone(&provider),
        requirement,
        cell,
    )?;
    let key = loaded.key.ok_or(BindError::MissingKey)?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(priority.versions())?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(loaded.chain, key)?;
    config.ignore_client_order = priority.server_precedence();
    config.require_ems = !priority.compat();
    Ok(config)
}

pub(crate) fn client_config(
    loaded: LoadedCredentials,
    priority: &Priority,
    base: &CryptoProvider,
    requirement: VerifyRequirement,
    cell: JudgementCell,
    enable_sni: bool,
) -> Result<ClientConfig, BindError> {
    let provider = Arc::new(priority.provider(base));
    let verifier = RecordingServerVerifier::new(
        loaded.roots,
        loaded.crls,
        Arc::clone(&provider),
        requirement,
        cell,
    )?;

    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(priority.versions())?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));
    let mut config = match loaded.key {
        Some(key) if !loaded.chain.is_empty() => builder.with_client_auth_cert(loaded.chain, key)?,
        _ => builder.with_no_client_auth(),
    };
    config.enable_sni = enable_sni;
    config.require_ems = !priority.compat();
    Ok(config)
}

/// Everything needed to (re)bind server credentials for one session.
#[derive(Debug)]
pub(crate) struct ServerBinder<'a> {
    pub(crate) provisioner: Provisioner<'a>,
    pub(crate) priority: &'a Priority,
    pub(crate) base: &'a CryptoProvider,
    pub(crate) cell: JudgementCell,
    pub(crate) context: &'a ErrorContext,
}

impl ServerBinder<'_> {
    /// Resolve, load and bind the session's credentials for `hint`.
    ///
    /// Returns the new config and the credential paths it replaced.
    pub(crate) fn bind(
        &self,
        session: &mut SessionState,
        hint: Option<&str>,
    ) -> Result<(Arc<ServerConfig>, Option<CredentialSet>), TlsError> {
        let set = self
            .provisioner
            .resolve(session.raw_credentials(), hint)
            .map_err(|e| self.credential_error(e))?;
        let previous = session.replace_credentials(set.clone());
        let loaded = self.provisioner.load(set).map_err(|e| self.credential_error(e))?;

        let config = server_config(
            loaded,
            self.priority,
            self.base,
            session.verify_requirement(),
            self.cell.clone(),
        )
        .map_err(|e| TlsError::setup(self.context.clone(), "binding server credentials", e))?;
        Ok((Arc::new(config), previous))
    }

    fn credential_error(&self, e: CredentialError) -> TlsError {
        TlsError::setup(self.context.clone(), e.operation(), e)
    }
}
