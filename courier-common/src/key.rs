//! Correlation keys linking an outbound request to its asynchronous response
//!
//! A key is either a bare unique id (`"<uuid>"`) or an id qualified by a
//! namespace (`"<namespace>-<uuid>"`). Namespaces let several logical callers
//! share one id space while still telling their responses apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between a namespace and the unique id
const NAMESPACE_SEPARATOR: char = '-';

/// Unique token for one outbound request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Generate a fresh key with no namespace
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Generate a fresh key inside `namespace`
    pub fn generate_in(namespace: &str) -> Self {
        Self::with_namespace(namespace, &Uuid::new_v4().to_string())
    }

    /// Build the key `"<namespace>-<id>"`
    pub fn with_namespace(namespace: &str, id: &str) -> Self {
        Self(format!("{namespace}{NAMESPACE_SEPARATOR}{id}"))
    }

    /// The full key string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace this key lives in, if it is qualified
    ///
    /// Only a leading segment that is not part of a UUID counts, so a bare
    /// UUID (which itself contains hyphens) reports no namespace.
    pub fn namespace(&self) -> Option<&str> {
        if Uuid::parse_str(&self.0).is_ok() {
            return None;
        }
        self.0
            .split_once(NAMESPACE_SEPARATOR)
            .map(|(namespace, _)| namespace)
            .filter(|namespace| !namespace.is_empty())
    }

    /// The unique id part, with any namespace stripped
    pub fn id(&self) -> &str {
        match self.namespace() {
            Some(namespace) => &self.0[namespace.len() + NAMESPACE_SEPARATOR.len_utf8()..],
            None => &self.0,
        }
    }

    /// Returns true if this key is qualified by `namespace`
    pub fn is_in(&self, namespace: &str) -> bool {
        self.namespace() == Some(namespace)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CorrelationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl AsRef<str> for CorrelationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
