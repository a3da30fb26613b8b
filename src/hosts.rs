//! Host lists and the peer verification policy.
//!
//! # Responsibilities
//! - Parse operator host lists (`*`, addresses, CIDR blocks, names,
//!   `*.domain` suffixes, `!` negation)
//! - Decide the verification requirement for an inbound peer
//!
//! # Design Decisions
//! - First matching entry wins; a negated match ends the search with "no"
//! - A peer with no known address or name only matches `*`

use std::fmt;
use std::net::IpAddr;

use crate::config::schema::ServerTlsConfig;
use crate::session::{PeerHost, VerifyRequirement};

/// Looks up how strictly a peer's certificate must be checked.
pub trait VerifyPolicy: Send + Sync + fmt::Debug {
    fn requirement(&self, peer: Option<&PeerHost>) -> VerifyRequirement;
}

/// A fixed requirement for every peer.
impl VerifyPolicy for VerifyRequirement {
    fn requirement(&self, _peer: Option<&PeerHost>) -> VerifyRequirement {
        *self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid host list entry \"{entry}\": {reason}")]
pub struct HostPatternError {
    pub entry: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Any,
    Address(IpAddr),
    Network { base: IpAddr, prefix: u8 },
    Name(String),
    Suffix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    negated: bool,
    pattern: Pattern,
}

/// Ordered list of host patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostList {
    entries: Vec<Entry>,
}

impl HostList {
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, HostPatternError> {
        let entries = items
            .iter()
            .map(|item| parse_entry(item.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, peer: Option<&PeerHost>) -> bool {
        for entry in &self.entries {
            if pattern_matches(&entry.pattern, peer) {
                return !entry.negated;
            }
        }
        false
    }
}

fn parse_entry(item: &str) -> Result<Entry, HostPatternError> {
    let err = |reason| HostPatternError {
        entry: item.to_string(),
        reason,
    };

    let (negated, body) = match item.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, item),
    };
    if body.is_empty() {
        return Err(err("empty pattern"));
    }

    let pattern = if body == "*" {
        Pattern::Any
    } else if let Some((addr, prefix)) = body.split_once('/') {
        let base: IpAddr = addr.parse().map_err(|_| err("bad network address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| err("bad prefix length"))?;
        let max = if base.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(err("prefix length out of range"));
        }
        Pattern::Network { base, prefix }
    } else if let Ok(addr) = body.parse::<IpAddr>() {
        Pattern::Address(addr)
    } else if let Some(domain) = body.strip_prefix("*.") {
        if domain.is_empty() || domain.contains('*') {
            return Err(err("bad wildcard"));
        }
        Pattern::Suffix(format!(".{}", domain.to_ascii_lowercase()))
    } else if body.contains('*') {
        return Err(err("wildcards are only allowed as a leading \"*.\""));
    } else {
        Pattern::Name(body.to_ascii_lowercase())
    };

    Ok(Entry { negated, pattern })
}

fn pattern_matches(pattern: &Pattern, peer: Option<&PeerHost>) -> bool {
    let name = peer.and_then(|p| p.name.as_deref()).map(str::to_ascii_lowercase);
    let address = peer.and_then(|p| p.address);

    match pattern {
        Pattern::Any => true,
        Pattern::Address(want) => address == Some(*want),
        Pattern::Network { base, prefix } => address.is_some_and(|a| in_network(a, *base, *prefix)),
        Pattern::Name(want) => name.as_deref() == Some(want.as_str()),
        Pattern::Suffix(suffix) => name.is_some_and(|n| n.ends_with(suffix.as_str())),
    }
}

fn in_network(addr: IpAddr, base: IpAddr, prefix: u8) -> bool {
    match (addr, base) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(a) & mask == u32::from(b) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(a) & mask == u128::from(b) & mask
        }
        _ => false,
    }
}

/// Requirement derived from `verify_hosts` (Required) and
/// `try_verify_hosts` (Optional).
#[derive(Debug, Clone, Default)]
pub struct HostListPolicy {
    verify: HostList,
    try_verify: HostList,
}

impl HostListPolicy {
    pub fn new(verify: HostList, try_verify: HostList) -> Self {
        Self { verify, try_verify }
    }

    pub fn from_config(config: &ServerTlsConfig) -> Result<Self, HostPatternError> {
        Ok(Self {
            verify: HostList::parse(config.verify_hosts.as_slice())?,
            try_verify: HostList::parse(config.try_verify_hosts.as_slice())?,
        })
    }
}

impl VerifyPolicy for HostListPolicy {
    fn requirement(&self, peer: Option<&PeerHost>) -> VerifyRequirement {
        if self.verify.matches(peer) {
            VerifyRequirement::Required
        } else if self.try_verify.matches(peer) {
            VerifyRequirement::Optional
        } else {
            VerifyRequirement::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: Option<&str>, addr: &str) -> PeerHost {
        PeerHost::new(name.map(String::from), addr.parse().ok())
    }

    #[test]
    fn matches_addresses_and_networks() {
        let list = HostList::parse(&["192.0.2.10", "198.51.100.0/24", "2001:db8::/32"]).unwrap();
        assert!(list.matches(Some(&peer(None, "192.0.2.10"))));
        assert!(!list.matches(Some(&peer(None, "192.0.2.11"))));
        assert!(list.matches(Some(&peer(None, "198.51.100.77"))));
        assert!(list.matches(Some(&peer(None, "2001:db8::1"))));
        assert!(!list.matches(Some(&peer(None, "2001:db9::1"))));
        assert!(!list.matches(None));
    }

    #[test]
    fn matches_names_and_suffixes() {
        let list = HostList::parse(&["mx.example.org", "*.example.net"]).unwrap();
        assert!(list.matches(Some(&peer(Some("MX.example.org"), "192.0.2.1"))));
        assert!(list.matches(Some(&peer(Some("a.b.example.net"), "192.0.2.1"))));
        assert!(!list.matches(Some(&peer(Some("example.net"), "192.0.2.1"))));
    }

    #[test]
    fn negation_stops_the_search() {
        let list = HostList::parse(&["!192.0.2.1", "*"]).unwrap();
        assert!(!list.matches(Some(&peer(None, "192.0.2.1"))));
        assert!(list.matches(Some(&peer(None, "192.0.2.2"))));
        assert!(list.matches(None));
    }

    #[test]
    fn zero_prefix_matches_family() {
        let list = HostList::parse(&["0.0.0.0/0"]).unwrap();
        assert!(list.matches(Some(&peer(None, "203.0.113.9"))));
        assert!(!list.matches(Some(&peer(None, "::1"))));
    }

    #[test]
    fn rejects_bad_entries() {
        assert!(HostList::parse(&["10.0.0.0/33"]).is_err());
        assert!(HostList::parse(&["mail.*.org"]).is_err());
        assert!(HostList::parse(&["!"]).is_err());
    }

    #[test]
    fn required_wins_over_optional() {
        let policy = HostListPolicy::new(
            HostList::parse(&["192.0.2.0/24"]).unwrap(),
            HostList::parse(&["*"]).unwrap(),
        );
        assert_eq!(policy.requirement(Some(&peer(None, "192.0.2.5"))), VerifyRequirement::Required);
        assert_eq!(policy.requirement(Some(&peer(None, "10.1.1.1"))), VerifyRequirement::Optional);
        assert_eq!(HostListPolicy::default().requirement(None), VerifyRequirement::None);
    }
}
