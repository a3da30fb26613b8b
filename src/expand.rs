//! Option template expansion.
//!
//! Certificate, key, trust-store, CRL, SNI and priority options are templates
//! expanded per session. The engine only needs two things from an expander:
//! the expanded string, and whether a template mentions a given variable
//! (used to decide if a received SNI forces credential re-resolution).
//!
//! [`VariableExpander`] understands `$name`, `${name}`, `${name:-fallback}`
//! and `\` escapes.

use std::collections::HashMap;
use std::fmt;

/// Name of the variable bound to the received SNI.
pub const TLS_SNI: &str = "tls_sni";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    #[error("unknown variable name \"{name}\"")]
    UnknownVariable { name: String },

    #[error("missing '}}' after \"${{\" at offset {offset}")]
    Unterminated { offset: usize },

    #[error("bad variable reference at offset {offset}")]
    BadReference { offset: usize },

    #[error("{0}")]
    Failed(String),
}

/// Per-session values visible to templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpansionVars<'a> {
    /// SNI received from the peer (server role) or announced (client role).
    pub tls_sni: Option<&'a str>,
}

pub trait Expander: Send + Sync + fmt::Debug {
    fn expand(&self, template: &str, vars: &ExpansionVars<'_>) -> Result<String, ExpandError>;

    /// Whether `template` refers to `variable`.
    fn references(&self, template: &str, variable: &str) -> bool {
        match tokenize(template) {
            Ok(tokens) => tokens.iter().any(|t| matches!(t, Token::Var { name, .. } if *name == variable)),
            // Unparseable templates fail at expansion; a plain substring
            // check is good enough here.
            Err(_) => template.contains(variable),
        }
    }
}

/// Default expander: session variables plus fixed global variables.
#[derive(Debug, Clone, Default)]
pub struct VariableExpander {
    globals: HashMap<String, String>,
}

impl VariableExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.globals.insert(name.into(), value.into());
        self
    }

    fn lookup<'a>(&'a self, name: &str, vars: &ExpansionVars<'a>) -> Result<&'a str, ExpandError> {
        if name == TLS_SNI {
            return Ok(vars.tls_sni.unwrap_or(""));
        }
        self.globals
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ExpandError::UnknownVariable {
                name: name.to_string(),
            })
    }
}

impl Expander for VariableExpander {
    fn expand(&self, template: &str, vars: &ExpansionVars<'_>) -> Result<String, ExpandError> {
        let mut out = String::with_capacity(template.len());
        for token in tokenize(template)? {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Char(c) => out.push(c),
                Token::Var { name, fallback } => {
                    let value = self.lookup(name, vars)?;
                    match fallback {
                        Some(fallback) if value.is_empty() => out.push_str(fallback),
                        _ => out.push_str(value),
                    }
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'t> {
    Text(&'t str),
    Char(char),
    Var {
        name: &'t str,
        fallback: Option<&'t str>,
    },
}

fn tokenize(template: &str) -> Result<Vec<Token<'_>>, ExpandError> {
    let mut tokens = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while !rest.is_empty() {
        let Some(pos) = rest.find(['$', '\\']) else {
            tokens.push(Token::Text(rest));
            break;
        };
        if pos > 0 {
            tokens.push(Token::Text(&rest[..pos]));
        }
        offset += pos;
        rest = &rest[pos..];

        if let Some(escaped) = rest.strip_prefix('\\') {
            match escaped.chars().next() {
                Some(c) => {
                    tokens.push(Token::Char(c));
                    let used = 1 + c.len_utf8();
                    offset += used;
                    rest = &rest[used..];
                }
                None => {
                    tokens.push(Token::Char('\\'));
                    break;
                }
            }
            continue;
        }

        let after = &rest[1..];
        if let Some(braced) = after.strip_prefix('{') {
            let close = braced
                .find('}')
                .ok_or(ExpandError::Unterminated { offset })?;
            let inner = &braced[..close];
            let (name, fallback) = match inner.split_once(":-") {
                Some((name, fallback)) => (name, Some(fallback)),
                None => (inner, None),
            };
            if !is_name(name) {
                return Err(ExpandError::BadReference { offset });
            }
            tokens.push(Token::Var { name, fallback });
            let used = 2 + close + 1;
            offset += used;
            rest = &rest[used..];
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            let name = &after[..len];
            if !is_name(name) {
                return Err(ExpandError::BadReference { offset });
            }
            tokens.push(Token::Var { name, fallback: None });
            offset += 1 + len;
            rest = &rest[1 + len..];
        }
    }

    Ok(tokens)
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sni(value: &str) -> ExpansionVars<'_> {
        ExpansionVars {
            tls_sni: Some(value),
        }
    }

    #[test]
    fn plain_text_is_unchanged() {
        let e = VariableExpander::new();
        assert_eq!(e.expand("/etc/mta/cert.pem", &ExpansionVars::default()).unwrap(), "/etc/mta/cert.pem");
    }

    #[test]
    fn substitutes_sni_and_globals() {
        let e = VariableExpander::new().with_variable("confdir", "/etc/mta");
        assert_eq!(
            e.expand("$confdir/${tls_sni}.pem", &sni("mx.example.org")).unwrap(),
            "/etc/mta/mx.example.org.pem"
        );
    }

    #[test]
    fn fallback_applies_when_empty() {
        let e = VariableExpander::new();
        let template = "/certs/${tls_sni:-default}.pem";
        assert_eq!(e.expand(template, &ExpansionVars::default()).unwrap(), "/certs/default.pem");
        assert_eq!(e.expand(template, &sni("a.test")).unwrap(), "/certs/a.test.pem");
    }

    #[test]
    fn escapes_and_errors() {
        let e = VariableExpander::new();
        assert_eq!(e.expand("cost \\$5", &ExpansionVars::default()).unwrap(), "cost $5");
        assert_eq!(
            e.expand("$nope", &ExpansionVars::default()),
            Err(ExpandError::UnknownVariable { name: "nope".into() })
        );
        assert_eq!(
            e.expand("ab${tls_sni", &ExpansionVars::default()),
            Err(ExpandError::Unterminated { offset: 2 })
        );
        assert_eq!(
            e.expand("x$-", &ExpansionVars::default()),
            Err(ExpandError::BadReference { offset: 1 })
        );
    }

    #[test]
    fn detects_references() {
        let e = VariableExpander::new();
        assert!(e.references("/certs/${tls_sni:-x}.pem", TLS_SNI));
        assert!(e.references("/certs/$tls_sni.pem", TLS_SNI));
        assert!(!e.references("/certs/$tls_snippet.pem", TLS_SNI));
        assert!(!e.references("/certs/\\$tls_sni.pem", TLS_SNI));
    }
}
