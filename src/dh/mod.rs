//! Diffie-Hellman parameter cache.
//!
//! # Responsibilities
//! - Provide DH parameters for the server role, keyed by bit strength
//! - Persist them under `<spool>/<prefix>-<bits>` so later processes skip
//!   regeneration
//! - Never expose a half-written cache file
//!
//! # Design Decisions
//! - Parameters come from the RFC 7919 named FFDHE groups the TLS library
//!   ships; "generating" selects the smallest group covering the bit strength
//! - Writes go to a uniquely named temp file in the spool directory, are
//!   synced, then renamed over the canonical path; concurrent writers waste
//!   work but cannot corrupt the file
//! - Each strength is loaded at most once per cache instance

pub mod pkcs3;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::ffdhe_groups::{self, FfdheGroup};
use rustls::NamedGroup;
use serde::{Deserialize, Serialize};

use crate::config::schema::{ServiceOwner, TlsConfig};
use crate::observability::metrics;
use pkcs3::DhParameters;

/// Bit strength used when nothing else is configured.
pub const DEFAULT_DH_BITS: u32 = 2048;

const STANDARD_GROUPS: [(u32, NamedGroup); 5] = [
    (2048, NamedGroup::FFDHE2048),
    (3072, NamedGroup::FFDHE3072),
    (4096, NamedGroup::FFDHE4096),
    (6144, NamedGroup::FFDHE6144),
    (8192, NamedGroup::FFDHE8192),
];

/// Operator-facing strength policy for DH parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Normal,
    High,
    Ultra,
}

impl SecurityLevel {
    pub fn bits(&self) -> u32 {
        match self {
            SecurityLevel::Low => 1024,
            SecurityLevel::Normal => DEFAULT_DH_BITS,
            SecurityLevel::High => 3072,
            SecurityLevel::Ultra => 4096,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DhError {
    #[error("unable to open DH parameter cache {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("unable to read DH parameter cache {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("no standard DH group provides {0} bits")]
    UnsupportedBits(u32),

    #[error("unable to write DH parameter cache {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("unable to set owner of DH parameter cache {path}: {source}")]
    Chown { path: PathBuf, source: io::Error },

    #[error("unable to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Where a set of parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamsOrigin {
    Cache,
    Generated,
}

impl ParamsOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamsOrigin::Cache => "cache",
            ParamsOrigin::Generated => "generated",
        }
    }
}

/// DH parameters bound to the server role.
#[derive(Debug, Clone)]
pub struct DhParams {
    bits: u32,
    group: NamedGroup,
    path: PathBuf,
    origin: ParamsOrigin,
}

impl DhParams {
    /// Requested bit strength (the cache key).
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn group(&self) -> NamedGroup {
        self.group
    }

    /// Size of the prime actually in use.
    pub fn prime_bits(&self) -> usize {
        self.ffdhe().map_or(0, |g| g.p.len() * 8)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin(&self) -> ParamsOrigin {
        self.origin
    }

    pub fn ffdhe(&self) -> Option<FfdheGroup<'static>> {
        FfdheGroup::from_named_group(self.group)
    }
}

/// Smallest standard group at least `bits` strong.
pub fn group_for_bits(bits: u32) -> Option<NamedGroup> {
    STANDARD_GROUPS
        .iter()
        .find(|(size, _)| *size >= bits)
        .map(|(_, group)| *group)
}

/// Process-lifetime DH parameter cache backed by the spool directory.
#[derive(Debug)]
pub struct DhParamCache {
    spool_directory: PathBuf,
    prefix: String,
    owner: Option<ServiceOwner>,
    loaded: Mutex<HashMap<u32, Arc<DhParams>>>,
}

impl DhParamCache {
    pub fn new(spool_directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            spool_directory: spool_directory.into(),
            prefix: prefix.into(),
            owner: None,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &TlsConfig) -> Self {
        let mut cache = Self::new(&config.spool_directory, &config.dh.cache_prefix);
        cache.owner = config.service_owner;
        cache
    }

    /// Owner applied to freshly written cache files.
    pub fn with_owner(mut self, owner: ServiceOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn path_for(&self, bits: u32) -> PathBuf {
        self.spool_directory.join(format!("{}-{}", self.prefix, bits))
    }

    /// Already-loaded parameters for `bits`, if any.
    pub fn cached(&self, bits: u32) -> Option<Arc<DhParams>> {
        self.loaded.lock().get(&bits).cloned()
    }

    /// Load parameters for `bits` from the spool file, or generate and
    /// persist them.
    pub fn ensure_params(&self, bits: u32) -> Result<Arc<DhParams>, DhError> {
        let mut loaded = self.loaded.lock();
        if let Some(params) = loaded.get(&bits) {
            return Ok(Arc::clone(params));
        }

        let group = group_for_bits(bits).ok_or(DhError::UnsupportedBits(bits))?;
        let path = self.path_for(bits);

        let params = match read_cached(&path, group)? {
            Some(found) => {
                tracing::debug!(path = %path.display(), group = ?found, "DH parameters read from cache");
                DhParams {
                    bits,
                    group: found,
                    path,
                    origin: ParamsOrigin::Cache,
                }
            }
            None => {
                tracing::debug!(path = %path.display(), bits, "generating DH parameters");
                let ffdhe = FfdheGroup::from_named_group(group).ok_or(DhError::UnsupportedBits(bits))?;
                let pem = pkcs3::encode_pem(&DhParameters {
                    prime: ffdhe.p.to_vec(),
                    generator: ffdhe.g.to_vec(),
                });
                self.write_atomically(&path, pem.as_bytes())?;
                tracing::info!(path = %path.display(), bits, "wrote DH parameters to cache");
                DhParams {
                    bits,
                    group,
                    path,
                    origin: ParamsOrigin::Generated,
                }
            }
        };
        metrics::record_dh_params(params.origin.as_str());

        let params = Arc::new(params);
        loaded.insert(bits, Arc::clone(&params));
        Ok(params)
    }

    fn write_atomically(&self, path: &Path, contents: &[u8]) -> Result<(), DhError> {
        let (temp_path, mut file) = create_temp(path)?;
        let guard = TempFile::new(temp_path);

        file.write_all(contents)
            .map_err(|source| DhError::Write { path: guard.path.clone(), source })?;

        #[cfg(unix)]
        if let Some(owner) = self.owner {
            std::os::unix::fs::fchown(&file, Some(owner.uid), Some(owner.gid))
                .map_err(|source| DhError::Chown { path: guard.path.clone(), source })?;
        }

        file.sync_all()
            .map_err(|source| DhError::Write { path: guard.path.clone(), source })?;
        drop(file);

        fs::rename(&guard.path, path).map_err(|source| DhError::Rename {
            from: guard.path.clone(),
            to: path.to_path_buf(),
            source,
        })?;
        guard.persist();
        Ok(())
    }
}

/// Parameters named by the cache file, `None` on a miss.
///
/// A missing file, a non-regular file, or contents other than the `expected`
/// standard group all count as a miss. Open and read errors do not.
fn read_cached(path: &Path, expected: NamedGroup) -> Result<Option<NamedGroup>, DhError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "DH parameter cache does not exist");
            return Ok(None);
        }
        Err(source) => {
            return Err(DhError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let metadata = file.metadata().map_err(|source| DhError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_file() {
        tracing::warn!(path = %path.display(), "DH parameter cache is not a regular file");
        return Ok(None);
    }

    let mut contents = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut contents).map_err(|source| DhError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let params = match pkcs3::decode_pem(&contents) {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "DH parameter cache unreadable, regenerating");
            return Ok(None);
        }
    };

    let group = ffdhe_groups::FfdheGroup::from_params_trimming_leading_zeros(
        &params.prime,
        &params.generator,
    )
    .named_group();
    match group {
        Some(group) if group == expected => Ok(Some(group)),
        Some(group) => {
            tracing::warn!(
                path = %path.display(),
                found = ?group,
                expected = ?expected,
                "DH parameter cache holds a group of the wrong strength, regenerating"
            );
            Ok(None)
        }
        None => {
            tracing::warn!(path = %path.display(), "DH parameter cache holds non-standard parameters, regenerating");
            Ok(None)
        }
    }
}

fn create_temp(path: &Path) -> Result<(PathBuf, File), DhError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    loop {
        let suffix: String = std::iter::repeat_with(fastrand::alphanumeric).take(8).collect();
        let candidate = dir.join(format!("{}.{}", name, suffix));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(DhError::Write {
                    path: candidate,
                    source,
                })
            }
        }
    }
}

/// Removes the temp file on drop unless it was renamed into place.
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn persist(mut self) {
        self.keep = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_selection_rounds_up() {
        assert_eq!(group_for_bits(1024), Some(NamedGroup::FFDHE2048));
        assert_eq!(group_for_bits(2048), Some(NamedGroup::FFDHE2048));
        assert_eq!(group_for_bits(2049), Some(NamedGroup::FFDHE3072));
        assert_eq!(group_for_bits(8192), Some(NamedGroup::FFDHE8192));
        assert_eq!(group_for_bits(8193), None);
    }

    #[test]
    fn generates_once_then_reads_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DhParamCache::new(dir.path(), "dh-params");

        let first = cache.ensure_params(2048).unwrap();
        assert_eq!(first.origin(), ParamsOrigin::Generated);
        assert_eq!(first.path(), dir.path().join("dh-params-2048"));
        assert_eq!(first.prime_bits(), 2048);

        // Same instance: served from memory.
        let again = cache.ensure_params(2048).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // A fresh instance (a later process) reads the file.
        let modified = fs::metadata(first.path()).unwrap().modified().unwrap();
        let later = DhParamCache::new(dir.path(), "dh-params");
        let read = later.ensure_params(2048).unwrap();
        assert_eq!(read.origin(), ParamsOrigin::Cache);
        assert_eq!(read.group(), NamedGroup::FFDHE2048);
        assert_eq!(fs::metadata(read.path()).unwrap().modified().unwrap(), modified);

        // No temp files left behind.
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn corrupt_cache_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DhParamCache::new(dir.path(), "p");
        fs::write(cache.path_for(3072), b"garbage").unwrap();

        let params = cache.ensure_params(3072).unwrap();
        assert_eq!(params.origin(), ParamsOrigin::Generated);
        assert_eq!(params.group(), NamedGroup::FFDHE3072);
        let contents = fs::read(cache.path_for(3072)).unwrap();
        assert!(contents.starts_with(b"-----BEGIN DH PARAMETERS-----"));
    }

    #[test]
    fn cache_of_another_strength_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DhParamCache::new(dir.path(), "p");
        cache.ensure_params(2048).unwrap();
        fs::copy(cache.path_for(2048), cache.path_for(4096)).unwrap();

        let later = DhParamCache::new(dir.path(), "p");
        let params = later.ensure_params(4096).unwrap();
        assert_eq!(params.origin(), ParamsOrigin::Generated);
        assert_eq!(params.group(), NamedGroup::FFDHE4096);
        assert_eq!(params.prime_bits(), 4096);
    }

    #[test]
    fn unsupported_strength_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DhParamCache::new(dir.path(), "p");
        assert!(matches!(
            cache.ensure_params(16_384),
            Err(DhError::UnsupportedBits(16_384))
        ));
    }

    #[test]
    fn missing_spool_directory_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DhParamCache::new(dir.path().join("absent"), "p");
        assert!(matches!(cache.ensure_params(2048), Err(DhError::Write { .. })));
        assert!(cache.cached(2048).is_none());
    }
}
