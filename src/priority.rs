//! Priority expressions.
//!
//! Operators restrict protocol versions, ciphers and key-exchange groups with
//! colon-separated expressions in the style MTA administrators know:
//!
//! ```text
//! NORMAL
//! SECURE256:-VERS-TLS1.2
//! NONE:+VERS-TLS1.3:+AES-256-GCM:+GROUP-X25519
//! PERFORMANCE:%SERVER_PRECEDENCE
//! ```
//!
//! A bare keyword replaces the whole selection, `+ITEM` appends, `-ITEM` or
//! `!ITEM` removes and `%FLAG` sets a flag. MAC, key-exchange, signature,
//! compression and certificate-type items are accepted and ignored since the
//! TLS library fixes them per suite. The result is applied to a base crypto
//! provider.

use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::ffdhe_groups::FfdheGroup;
use rustls::{NamedGroup, ProtocolVersion, SupportedCipherSuite, SupportedProtocolVersion};

/// Priority used when no expression is configured.
pub const DEFAULT_PRIORITY: &str = "NORMAL";

const IGNORED_PREFIXES: [&str; 6] = ["MAC-", "KX-", "SIGN-", "COMP-", "CTYPE-", "CURVE-"];

const ALL_VERSIONS: [ProtocolVersion; 2] = [ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2];

const ALL_GROUPS: [NamedGroup; 8] = [
    NamedGroup::X25519,
    NamedGroup::secp256r1,
    NamedGroup::secp384r1,
    NamedGroup::FFDHE2048,
    NamedGroup::FFDHE3072,
    NamedGroup::FFDHE4096,
    NamedGroup::FFDHE6144,
    NamedGroup::FFDHE8192,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("priority \"{expression}\" failed at offset {offset}, \"{token}\": {reason}")]
pub struct PriorityError {
    pub expression: String,
    pub offset: usize,
    pub token: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherClass {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl CipherClass {
    const ALL: [CipherClass; 3] = [
        CipherClass::Aes256Gcm,
        CipherClass::Aes128Gcm,
        CipherClass::Chacha20Poly1305,
    ];

    fn of(suite: &SupportedCipherSuite) -> Option<Self> {
        let name = format!("{:?}", suite.suite());
        if name.contains("AES_128_GCM") {
            Some(CipherClass::Aes128Gcm)
        } else if name.contains("AES_256_GCM") {
            Some(CipherClass::Aes256Gcm)
        } else if name.contains("CHACHA20_POLY1305") {
            Some(CipherClass::Chacha20Poly1305)
        } else {
            None
        }
    }
}

/// Symmetric key size of a negotiated suite.
pub fn suite_key_bits(suite: &SupportedCipherSuite) -> u32 {
    match CipherClass::of(suite) {
        Some(CipherClass::Aes128Gcm) => 128,
        Some(CipherClass::Aes256Gcm) | Some(CipherClass::Chacha20Poly1305) => 256,
        None => 0,
    }
}

#[derive(Debug, Clone, Default)]
struct Selection {
    versions: Vec<ProtocolVersion>,
    ciphers: Vec<CipherClass>,
    groups: Vec<NamedGroup>,
}

impl Selection {
    fn keyword(word: &str) -> Option<Self> {
        let all = || Selection {
            versions: ALL_VERSIONS.to_vec(),
            ciphers: CipherClass::ALL.to_vec(),
            groups: ALL_GROUPS.to_vec(),
        };
        match word {
            "NORMAL" | "SECURE" | "SECURE128" => Some(all()),
            "PERFORMANCE" => Some(Selection {
                ciphers: vec![
                    CipherClass::Aes128Gcm,
                    CipherClass::Chacha20Poly1305,
                    CipherClass::Aes256Gcm,
                ],
                ..all()
            }),
            "SECURE192" | "SECURE256" => Some(Selection {
                ciphers: vec![CipherClass::Aes256Gcm, CipherClass::Chacha20Poly1305],
                groups: vec![
                    NamedGroup::secp384r1,
                    NamedGroup::FFDHE8192,
                    NamedGroup::FFDHE6144,
                    NamedGroup::FFDHE4096,
                ],
                ..all()
            }),
            "NONE" => Some(Selection::default()),
            _ => None,
        }
    }
}

enum Item {
    Versions(Vec<ProtocolVersion>),
    Ciphers(Vec<CipherClass>),
    Groups(Vec<NamedGroup>),
    Ignored,
}

fn item(name: &str) -> Option<Item> {
    let item = match name {
        "VERS-TLS1.3" => Item::Versions(vec![ProtocolVersion::TLSv1_3]),
        "VERS-TLS1.2" => Item::Versions(vec![ProtocolVersion::TLSv1_2]),
        "VERS-ALL" | "VERS-TLS-ALL" => Item::Versions(ALL_VERSIONS.to_vec()),
        // Older versions are never negotiated.
        "VERS-TLS1.0" | "VERS-TLS1.1" | "VERS-SSL3.0" => Item::Ignored,
        "AES-128-GCM" => Item::Ciphers(vec![CipherClass::Aes128Gcm]),
        "AES-256-GCM" => Item::Ciphers(vec![CipherClass::Aes256Gcm]),
        "CHACHA20-POLY1305" => Item::Ciphers(vec![CipherClass::Chacha20Poly1305]),
        "CIPHER-ALL" => Item::Ciphers(CipherClass::ALL.to_vec()),
        "GROUP-X25519" => Item::Groups(vec![NamedGroup::X25519]),
        "GROUP-SECP256R1" => Item::Groups(vec![NamedGroup::secp256r1]),
        "GROUP-SECP384R1" => Item::Groups(vec![NamedGroup::secp384r1]),
        "GROUP-FFDHE2048" => Item::Groups(vec![NamedGroup::FFDHE2048]),
        "GROUP-FFDHE3072" => Item::Groups(vec![NamedGroup::FFDHE3072]),
        "GROUP-FFDHE4096" => Item::Groups(vec![NamedGroup::FFDHE4096]),
        "GROUP-FFDHE6144" => Item::Groups(vec![NamedGroup::FFDHE6144]),
        "GROUP-FFDHE8192" => Item::Groups(vec![NamedGroup::FFDHE8192]),
        "GROUP-ALL" => Item::Groups(ALL_GROUPS.to_vec()),
        other if IGNORED_PREFIXES.iter().any(|p| other.starts_with(p)) => Item::Ignored,
        _ => return None,
    };
    Some(item)
}

fn add<T: PartialEq + Copy>(list: &mut Vec<T>, items: &[T]) {
    for item in items {
        if !list.contains(item) {
            list.push(*item);
        }
    }
}

fn remove<T: PartialEq>(list: &mut Vec<T>, items: &[T]) {
    list.retain(|x| !items.contains(x));
}

/// Versions, suites and groups selected by a priority expression.
#[derive(Debug, Clone)]
pub struct Priority {
    expression: String,
    versions: Vec<&'static SupportedProtocolVersion>,
    ciphers: Vec<CipherClass>,
    cipher_suites: Vec<SupportedCipherSuite>,
    kx_groups: Vec<&'static dyn SupportedKxGroup>,
    compat: bool,
    server_precedence: bool,
}

impl Priority {
    pub fn parse(expression: &str, base: &CryptoProvider) -> Result<Self, PriorityError> {
        let fail = |offset: usize, token: &str, reason: &'static str| PriorityError {
            expression: expression.to_string(),
            offset,
            token: token.to_string(),
            reason,
        };

        let mut selection = Selection::default();
        let mut compat = false;
        let mut server_precedence = false;
        let mut offset = 0;

        for token in expression.split(':') {
            let start = offset;
            offset += token.len() + 1;

            let upper = token.trim().to_ascii_uppercase();
            if upper.is_empty() {
                return Err(fail(start, token, "empty element"));
            }

            if let Some(flag) = upper.strip_prefix('%') {
                match flag {
                    "COMPAT" => compat = true,
                    "SERVER_PRECEDENCE" => server_precedence = true,
                    _ => return Err(fail(start, token, "unknown flag")),
                }
                continue;
            }

            let (op, name) = match upper.as_bytes()[0] {
                b'+' => (Some(true), &upper[1..]),
                b'-' | b'!' => (Some(false), &upper[1..]),
                _ => (None, upper.as_str()),
            };

            match op {
                None => {
                    selection = Selection::keyword(name).ok_or_else(|| fail(start, token, "unknown keyword"))?;
                }
                Some(adding) => {
                    let item = item(name).ok_or_else(|| fail(start, token, "unknown item"))?;
                    match (item, adding) {
                        (Item::Versions(v), true) => add(&mut selection.versions, &v),
                        (Item::Versions(v), false) => remove(&mut selection.versions, &v),
                        (Item::Ciphers(c), true) => add(&mut selection.ciphers, &c),
                        (Item::Ciphers(c), false) => remove(&mut selection.ciphers, &c),
                        (Item::Groups(g), true) => add(&mut selection.groups, &g),
                        (Item::Groups(g), false) => remove(&mut selection.groups, &g),
                        (Item::Ignored, _) => {}
                    }
                }
            }
        }

        let mut priority = Priority {
            expression: expression.to_string(),
            versions: Vec::new(),
            ciphers: selection.ciphers.clone(),
            cipher_suites: Vec::new(),
            kx_groups: Vec::new(),
            compat: false,
            server_precedence,
        };
        priority.select(base, &selection.versions, &selection.groups);

        if compat {
            priority = priority.with_compat(base);
        }

        let end = expression.len();
        if priority.versions.is_empty() {
            return Err(fail(end, "", "no protocol versions enabled"));
        }
        if priority.cipher_suites.is_empty() {
            return Err(fail(end, "", "no usable cipher suites"));
        }
        if priority.kx_groups.is_empty() {
            return Err(fail(end, "", "no usable key exchange groups"));
        }
        Ok(priority)
    }

    fn select(&mut self, base: &CryptoProvider, versions: &[ProtocolVersion], groups: &[NamedGroup]) {
        self.versions = versions
            .iter()
            .filter_map(|v| match v {
                ProtocolVersion::TLSv1_3 => Some(&rustls::version::TLS13),
                ProtocolVersion::TLSv1_2 => Some(&rustls::version::TLS12),
                _ => None,
            })
            .collect();

        let mut suites: Vec<(usize, SupportedCipherSuite)> = base
            .cipher_suites
            .iter()
            .filter(|s| versions.contains(&s.version().version))
            .filter_map(|s| {
                let class = CipherClass::of(s)?;
                let rank = self.ciphers.iter().position(|c| *c == class)?;
                Some((rank, *s))
            })
            .collect();
        suites.sort_by_key(|(rank, _)| *rank);
        self.cipher_suites = suites.into_iter().map(|(_, s)| s).collect();

        let mut kx: Vec<(usize, &'static dyn SupportedKxGroup)> = base
            .kx_groups
            .iter()
            .filter_map(|g| Some((groups.iter().position(|n| *n == g.name())?, *g)))
            .collect();
        kx.sort_by_key(|(rank, _)| *rank);
        self.kx_groups = kx.into_iter().map(|(_, g)| g).collect();
    }

    /// Keep TLS 1.2 available whatever the expression removed.
    pub fn with_compat(mut self, base: &CryptoProvider) -> Self {
        self.compat = true;
        if self.ciphers.is_empty() {
            self.ciphers = CipherClass::ALL.to_vec();
        }
        let mut versions: Vec<ProtocolVersion> = self.versions.iter().map(|v| v.version).collect();
        add(&mut versions, &[ProtocolVersion::TLSv1_2]);
        let groups: Vec<NamedGroup> = if self.kx_groups.is_empty() {
            ALL_GROUPS.to_vec()
        } else {
            self.kx_groups.iter().map(|g| g.name()).collect()
        };
        self.select(base, &versions, &groups);
        self
    }

    /// Drop finite-field groups smaller than `min_bits`.
    pub fn retain_min_dh_bits(&mut self, min_bits: usize) {
        self.kx_groups.retain(|g| {
            FfdheGroup::from_named_group(g.name()).map_or(true, |ffdhe| ffdhe.p.len() * 8 >= min_bits)
        });
    }

    /// Move `group` to the front of the key-exchange preference list.
    /// Returns false when the provider does not offer it.
    pub fn prefer_group(&mut self, group: NamedGroup) -> bool {
        match self.kx_groups.iter().position(|g| g.name() == group) {
            Some(pos) => {
                let preferred = self.kx_groups.remove(pos);
                self.kx_groups.insert(0, preferred);
                true
            }
            None => false,
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn versions(&self) -> &[&'static SupportedProtocolVersion] {
        &self.versions
    }

    pub fn cipher_suites(&self) -> &[SupportedCipherSuite] {
        &self.cipher_suites
    }

    pub fn kx_groups(&self) -> &[&'static dyn SupportedKxGroup] {
        &self.kx_groups
    }

    pub fn compat(&self) -> bool {
        self.compat
    }

    pub fn server_precedence(&self) -> bool {
        self.server_precedence
    }

    /// `base` restricted to the selected suites and groups.
    pub fn provider(&self, base: &CryptoProvider) -> CryptoProvider {
        CryptoProvider {
            cipher_suites: self.cipher_suites.clone(),
            kx_groups: self.kx_groups.clone(),
            ..base.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CryptoProvider {
        rustls::crypto::ring::default_provider()
    }

    fn versions(p: &Priority) -> Vec<ProtocolVersion> {
        p.versions().iter().map(|v| v.version).collect()
    }

    #[test]
    fn normal_enables_everything() {
        let p = Priority::parse(DEFAULT_PRIORITY, &base()).unwrap();
        assert_eq!(versions(&p), vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2]);
        assert_eq!(p.cipher_suites().len(), base().cipher_suites.len());
        assert_eq!(p.kx_groups()[0].name(), NamedGroup::X25519);
        assert!(!p.compat());
    }

    #[test]
    fn removes_versions_and_ciphers() {
        let p = Priority::parse("SECURE256:-VERS-TLS1.2", &base()).unwrap();
        assert_eq!(versions(&p), vec![ProtocolVersion::TLSv1_3]);
        assert!(p.cipher_suites().iter().all(|s| suite_key_bits(s) == 256));
        assert!(p.cipher_suites().iter().all(|s| s.version().version == ProtocolVersion::TLSv1_3));
        assert_eq!(p.kx_groups()[0].name(), NamedGroup::secp384r1);
    }

    #[test]
    fn builds_up_from_none() {
        let p = Priority::parse("none:+VERS-TLS1.3:+AES-128-GCM:+GROUP-X25519:+MAC-ALL", &base()).unwrap();
        assert_eq!(p.cipher_suites().len(), 1);
        assert_eq!(format!("{:?}", p.cipher_suites()[0].suite()), "TLS13_AES_128_GCM_SHA256");
        assert_eq!(p.kx_groups().len(), 1);
    }

    #[test]
    fn reports_offset_of_bad_token() {
        let err = Priority::parse("NORMAL:-VERS-TLS1.2:+BOGUS", &base()).unwrap_err();
        assert_eq!(err.offset, 20);
        assert_eq!(err.token, "+BOGUS");
        assert_eq!(
            err.to_string(),
            "priority \"NORMAL:-VERS-TLS1.2:+BOGUS\" failed at offset 20, \"+BOGUS\": unknown item"
        );

        let err = Priority::parse("NORMAL::%COMPAT", &base()).unwrap_err();
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn empty_selection_fails_at_end() {
        let err = Priority::parse("NONE:+VERS-TLS1.3", &base()).unwrap_err();
        assert_eq!(err.offset, "NONE:+VERS-TLS1.3".len());
        assert_eq!(err.reason, "no usable cipher suites");
    }

    #[test]
    fn compat_keeps_tls12() {
        let p = Priority::parse("NORMAL:-VERS-TLS1.2:%COMPAT", &base()).unwrap();
        assert!(p.compat());
        assert!(versions(&p).contains(&ProtocolVersion::TLSv1_2));
        assert!(p
            .cipher_suites()
            .iter()
            .any(|s| s.version().version == ProtocolVersion::TLSv1_2));
    }

    #[test]
    fn flags_and_group_preference() {
        let mut p = Priority::parse("PERFORMANCE:%SERVER_PRECEDENCE", &base()).unwrap();
        assert!(p.server_precedence());
        assert!(p.prefer_group(NamedGroup::secp384r1));
        assert_eq!(p.kx_groups()[0].name(), NamedGroup::secp384r1);
        assert!(!p.prefer_group(NamedGroup::FFDHE2048));
        assert!(Priority::parse("NORMAL:%BOGUS", &base()).is_err());
    }
}
