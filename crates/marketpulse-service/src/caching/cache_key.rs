use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// A stable key identifying one cached query result.
///
/// The key consists of a query category and a set of normalized named parameters. Equality and
/// hashing only consider the SHA-256 hash of that human readable description.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    category: Arc<str>,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metadata)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Create a [`CacheKeyBuilder`] for a key of the given query `category`.
    pub fn builder(category: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            category: category.to_owned(),
            params: BTreeMap::new(),
        }
    }

    /// The query category this key belongs to, e.g. `"price"`.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The hex-formatted SHA-256 hash of this key.
    pub fn hash_hex(&self) -> String {
        self.hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// A builder for [`CacheKey`]s.
///
/// Parameters are sorted by name, so the order in which they are added does not matter.
pub struct CacheKeyBuilder {
    category: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    /// Adds a named parameter. Adding the same name twice overwrites the previous value.
    pub fn param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.params.insert(name.to_owned(), value.to_string());
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let params: Vec<_> = self
            .params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        let metadata = format!("{}({})", self.category, params.join(","));
        let hash: [u8; 32] = Sha256::digest(metadata.as_bytes()).into();

        CacheKey {
            category: self.category.into(),
            metadata: metadata.into(),
            hash,
        }
    }
}
