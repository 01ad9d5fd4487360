//! Document model capability and document-level data.
//!
//! The channel stack never looks inside operations or document state. Both
//! are supplied by a [`DocumentModel`], together with the OT transform.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::id::{DocumentId, DocumentName, ParticipantId};
use crate::version::VersionSignature;

/// The operation algebra of a document type.
pub trait DocumentModel {
    type Operation: Clone + PartialEq + fmt::Debug;
    type State: Clone + fmt::Debug;

    /// Transform a concurrent client/server operation pair.
    ///
    /// Returns `(client', server')` such that applying `server` then
    /// `client'` equals applying `client` then `server'`.
    fn transform(
        client: &Self::Operation,
        server: &Self::Operation,
    ) -> Result<(Self::Operation, Self::Operation), TransformError>;

    /// Build the synthetic no-op that tells consumers the version advanced.
    ///
    /// `template` is the acknowledged operation the update stands in for.
    fn version_update(
        template: &Self::Operation,
        increment: u64,
        signature: Option<&VersionSignature>,
    ) -> Self::Operation;

    /// State of a freshly created document.
    fn empty_state(name: &DocumentName, creator: &ParticipantId) -> Self::State;
}

/// What the local participant may do with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Accessibility {
    #[default]
    ReadableWritable,
    ReadOnly,
    Inaccessible,
}

impl Accessibility {
    pub fn is_readable(self) -> bool {
        !matches!(self, Self::Inaccessible)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadableWritable)
    }
}

/// Full document state at a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S> {
    pub state: S,
    pub version: VersionSignature,
}

impl<S> Snapshot<S> {
    pub fn new(state: S, version: VersionSignature) -> Self {
        Self { state, version }
    }
}

/// Cached state the client already holds for a document at open time.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDocument<S> {
    pub document: DocumentId,
    pub snapshot: Snapshot<S>,
    pub committed: VersionSignature,
    pub accessibility: Accessibility,
}

impl<S> KnownDocument<S> {
    pub fn new(
        document: DocumentId,
        snapshot: Snapshot<S>,
        committed: VersionSignature,
        accessibility: Accessibility,
    ) -> Self {
        Self {
            document,
            snapshot,
            committed,
            accessibility,
        }
    }
}
