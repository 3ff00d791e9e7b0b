use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::caveat::{Caveat, error_caveat};
use crate::{BakeryError, Result};

/// Schema URI of the standard caveat conditions.
pub const STD_NAMESPACE: &str = "std";

/// Maps caveat schema URIs to the short prefixes used on the wire.
///
/// Multiple URIs may share a prefix (backward-compatible schema
/// versions), but each URI registers at most once. Every macaroon
/// carries the namespace it was minted with, so conditions added later
/// resolve consistently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Namespace {
    uri_to_prefix: BTreeMap<String, String>,
}

impl Namespace {
    /// An empty namespace with no registered URIs.
    pub fn new() -> Self {
        Self::default()
    }

    /// A namespace with the standard schema registered under the empty
    /// prefix, the common configuration.
    pub fn std() -> Self {
        let mut ns = Self::new();
        ns.register(STD_NAMESPACE, "");
        ns
    }

    /// Associates `uri` with `prefix`. Registering an already-present
    /// URI is a no-op, preserving the original prefix.
    ///
    /// # Panics
    /// Panics when the URI or prefix contains whitespace or colons, or
    /// when the URI is empty. Registration is a setup-time operation.
    pub fn register(&mut self, uri: &str, prefix: &str) {
        assert!(
            is_valid_schema_uri(uri),
            "cannot register invalid namespace URI {uri:?}"
        );
        assert!(
            is_valid_prefix(prefix),
            "cannot register invalid prefix {prefix:?} for namespace URI {uri:?}"
        );
        self.uri_to_prefix
            .entry(uri.to_string())
            .or_insert_with(|| prefix.to_string());
    }

    /// Returns the prefix registered for `uri`, if any.
    pub fn resolve(&self, uri: &str) -> Option<&str> {
        self.uri_to_prefix.get(uri).map(String::as_str)
    }

    /// Resolves a first-party caveat's condition to its on-the-wire
    /// form, applying the prefix registered for the caveat's namespace.
    ///
    /// A caveat in an unregistered namespace becomes an `error` caveat
    /// so it can never pass verification silently. Third-party caveats
    /// are returned unchanged; their conditions travel encrypted.
    pub fn resolve_caveat(&self, cav: &Caveat) -> Caveat {
        if cav.is_third_party() {
            return cav.clone();
        }
        match self.resolve(&cav.namespace) {
            Some(prefix) => Caveat {
                condition: condition_with_prefix(prefix, &cav.condition),
                namespace: cav.namespace.clone(),
                location: None,
            },
            None => error_caveat(format!(
                "caveat {:?} in unregistered namespace {:?}",
                cav.condition, cav.namespace
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uri_to_prefix.is_empty()
    }
}

/// Prepends `prefix:` to a condition; the empty prefix leaves the
/// condition untouched.
pub fn condition_with_prefix(prefix: &str, condition: &str) -> String {
    if prefix.is_empty() {
        condition.to_string()
    } else {
        format!("{prefix}:{condition}")
    }
}

fn is_valid_schema_uri(uri: &str) -> bool {
    !uri.is_empty() && !uri.contains(|c: char| c.is_whitespace() || c == ':')
}

fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.contains(|c: char| c.is_whitespace() || c == ':')
}

impl fmt::Display for Namespace {
    /// Serializes as space-separated `URI:prefix` tokens sorted by URI.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uri, prefix) in &self.uri_to_prefix {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{uri}:{prefix}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Namespace {
    type Err = BakeryError;

    fn from_str(s: &str) -> Result<Self> {
        let mut ns = Namespace::new();
        for token in s.split_whitespace() {
            let (uri, prefix) = token.split_once(':').ok_or_else(|| {
                BakeryError::InvalidFormat(format!("no prefix in namespace field {token:?}"))
            })?;
            if !is_valid_schema_uri(uri) {
                return Err(BakeryError::InvalidFormat(format!(
                    "invalid URI {uri:?} in namespace field"
                )));
            }
            if !is_valid_prefix(prefix) {
                return Err(BakeryError::InvalidFormat(format!(
                    "invalid prefix {prefix:?} in namespace field"
                )));
            }
            if ns.uri_to_prefix.contains_key(uri) {
                return Err(BakeryError::InvalidFormat(format!(
                    "duplicate URI {uri:?} in namespace field"
                )));
            }
            ns.register(uri, prefix);
        }
        Ok(ns)
    }
}
