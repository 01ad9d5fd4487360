//! Identifiers for collections, documents and participants.
//!
//! All ids are opaque strings. A document is addressed on the wire by its
//! [`DocumentName`], the pair of its collection and its own id.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id of a collection of documents (a "wave").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of one synchronized document within a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id with the given prefix, e.g. `conv+3f2a...`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}+{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully-qualified document address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentName {
    pub collection: CollectionId,
    pub document: DocumentId,
}

impl DocumentName {
    pub fn new(collection: CollectionId, document: DocumentId) -> Self {
        Self { collection, document }
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.document)
    }
}

/// Author of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects which documents of a collection a session is interested in.
///
/// A document is accepted when its id is listed explicitly or starts with
/// one of the prefixes. The empty prefix accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdFilter {
    ids: BTreeSet<DocumentId>,
    prefixes: Vec<String>,
}

impl IdFilter {
    /// Filter accepting every document.
    pub fn all() -> Self {
        Self::of_prefixes([""])
    }

    pub fn of_ids(ids: impl IntoIterator<Item = DocumentId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            prefixes: Vec::new(),
        }
    }

    pub fn of_prefixes<P: Into<String>>(prefixes: impl IntoIterator<Item = P>) -> Self {
        Self {
            ids: BTreeSet::new(),
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.ids.insert(id);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn accepts(&self, id: &DocumentId) -> bool {
        self.ids.contains(id) || self.prefixes.iter().any(|p| id.as_str().starts_with(p.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.ids.iter()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}
