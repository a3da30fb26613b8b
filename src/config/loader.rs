//! Reading the TLS configuration file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::schema::TlsConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed TLS configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid TLS configuration: {}", list(.0))]
    Validation(Vec<ValidationError>),
}

fn list(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Read `path` and parse it with [`parse_config`].
pub fn load_config(path: &Path) -> Result<TlsConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<TlsConfig, ConfigError> {
    let config: TlsConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mta.toml");
        fs::write(
            &path,
            "spool_directory = \"/var/spool/mta\"\n[server]\ncertificate = \"/etc/mta/cert.pem\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.certificate.as_deref(), Some("/etc/mta/cert.pem"));
    }

    #[test]
    fn reports_every_validation_problem() {
        let err = parse_config("xfer_buffer_size = 0\n[dh]\ncache_prefix = \"a/b\"\n").unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/mta.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
