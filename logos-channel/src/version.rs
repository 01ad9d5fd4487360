//! Version signatures: (version number, content hash) pairs.
//!
//! A signature is the unit of optimistic-concurrency comparison. Two
//! signatures at the same version with different hashes mean the client and
//! the server have diverged.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::DocumentName;

/// A document version paired with the hash of the history that produced it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionSignature {
    version: u64,
    hash: Vec<u8>,
}

impl VersionSignature {
    pub fn new(version: u64, hash: impl Into<Vec<u8>>) -> Self {
        Self { version, hash: hash.into() }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// Same version but a different hash.
    pub fn diverges_from(&self, other: &VersionSignature) -> bool {
        self.version == other.version && self.hash != other.hash
    }
}

impl Ord for VersionSignature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for VersionSignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.version)?;
        for byte in &self.hash {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for VersionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Produces the signature of a document that has no history yet.
pub trait HashedVersionFactory {
    fn version_zero(&self, name: &DocumentName) -> VersionSignature;
}

/// Version-zero signatures whose hash is the document's URI.
///
/// Both ends must agree on this hash for a locally created document to be
/// accepted by the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct UriHashFactory;

impl HashedVersionFactory for UriHashFactory {
    fn version_zero(&self, name: &DocumentName) -> VersionSignature {
        VersionSignature::new(0, format!("wave://{name}").into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CollectionId, DocumentId};

    #[test]
    fn test_signatures_order_by_version() {
        let a = VersionSignature::new(10, [9u8]);
        let b = VersionSignature::new(11, [1u8]);
        assert!(a < b);
        assert_eq!(a.version(), 10);
    }

    #[test]
    fn test_divergence_requires_same_version() {
        let a = VersionSignature::new(10, [1u8]);
        let b = VersionSignature::new(10, [2u8]);
        let c = VersionSignature::new(11, [2u8]);
        assert!(a.diverges_from(&b));
        assert!(!a.diverges_from(&c));
        assert!(!a.diverges_from(&a.clone()));
    }

    #[test]
    fn test_display_is_version_and_hex_hash() {
        let sig = VersionSignature::new(42, [0xab, 0x01]);
        assert_eq!(sig.to_string(), "42:ab01");
    }

    #[test]
    fn test_version_zero_is_stable_per_document() {
        let factory = UriHashFactory;
        let name = DocumentName::new(CollectionId::new("w+1"), DocumentId::new("conv+root"));
        let other = DocumentName::new(CollectionId::new("w+1"), DocumentId::new("conv+other"));

        let v0 = factory.version_zero(&name);
        assert_eq!(v0.version(), 0);
        assert_eq!(v0, factory.version_zero(&name));
        assert_ne!(v0, factory.version_zero(&other));
    }

    #[test]
    fn test_version_zero_hash_is_the_uri() {
        let name = DocumentName::new(CollectionId::new("w+1"), DocumentId::new("conv+root"));
        let v0 = UriHashFactory.version_zero(&name);
        assert_eq!(v0.hash(), b"wave://w+1/conv+root");
    }
}
