//! Wire-session message shapes and their binary frame codec.
//!
//! Message flow for one session:
//! ```text
//! client                                   server
//!   │ ── Open {filter, known versions} ───────► │
//!   │ ◄────────────── Update {channel_id} ───── │  first update: channel id only
//!   │ ◄── Update {doc, snapshot | deltas, ...} ─ │  one or more per document
//!   │ ◄──────────────────── Update {marker} ─── │  open finished
//!   │ ── Submit {doc, delta, channel_id} ─────► │
//!   │ ◄──── SubmitResponse {applied, version} ─ │
//!   │ ── Close {channel_id} ──────────────────► │
//! ```
//!
//! Frames are bincode-encoded (standard config). The transport that carries
//! them is supplied by the embedding application.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::delta::{ClientDelta, TransformedDelta};
use crate::error::{ChannelError, ResponseCode};
use crate::id::{CollectionId, DocumentId, DocumentName, IdFilter};
use crate::model::{Accessibility, Snapshot};
use crate::version::VersionSignature;

/// Request to open a view of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub collection: CollectionId,
    pub filter: IdFilter,
    /// Candidate resync versions per known document, strictly increasing.
    pub known: BTreeMap<DocumentId, Vec<VersionSignature>>,
}

/// One message of the open response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewUpdate<O, S> {
    pub channel_id: Option<String>,
    pub document: Option<DocumentId>,
    pub snapshot: Option<Snapshot<S>>,
    pub accessibility: Option<Accessibility>,
    pub deltas: Vec<TransformedDelta<O>>,
    pub last_committed: Option<VersionSignature>,
    pub current: Option<VersionSignature>,
    /// Open-finished marker.
    pub marker: bool,
}

impl<O, S> Default for ViewUpdate<O, S> {
    fn default() -> Self {
        Self {
            channel_id: None,
            document: None,
            snapshot: None,
            accessibility: None,
            deltas: Vec::new(),
            last_committed: None,
            current: None,
            marker: false,
        }
    }
}

impl<O, S> ViewUpdate<O, S> {
    /// The first update of a session, naming the server-side channel.
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Self::default()
        }
    }

    pub fn snapshot(document: DocumentId, snapshot: Snapshot<S>, committed: VersionSignature) -> Self {
        Self {
            document: Some(document),
            current: Some(snapshot.version.clone()),
            snapshot: Some(snapshot),
            last_committed: Some(committed),
            ..Self::default()
        }
    }

    pub fn deltas(
        document: DocumentId,
        deltas: Vec<TransformedDelta<O>>,
        committed: Option<VersionSignature>,
    ) -> Self {
        Self {
            document: Some(document),
            deltas,
            last_committed: committed,
            ..Self::default()
        }
    }

    pub fn marker() -> Self {
        Self {
            marker: true,
            ..Self::default()
        }
    }

    pub fn with_current(mut self, current: VersionSignature) -> Self {
        self.current = Some(current);
        self
    }

    pub fn with_accessibility(mut self, accessibility: Accessibility) -> Self {
        self.accessibility = Some(accessibility);
        self
    }

    fn has_document_data(&self) -> bool {
        self.document.is_some()
            || self.snapshot.is_some()
            || !self.deltas.is_empty()
            || self.last_committed.is_some()
            || self.current.is_some()
    }

    /// Structural rules every update must satisfy.
    pub fn check_restrictions(&self) -> Result<(), ChannelError> {
        if self.channel_id.is_some() {
            if self.has_document_data() || self.marker {
                return Err(ChannelError::protocol("Channel id update carries other data"));
            }
            return Ok(());
        }
        if self.document.is_none() && (self.has_document_data() || !self.marker) {
            return Err(ChannelError::protocol("Update is missing a document id"));
        }
        if self.snapshot.is_some() && !self.deltas.is_empty() {
            return Err(ChannelError::protocol("Update has both a snapshot and deltas"));
        }
        Ok(())
    }
}

/// Request to submit one delta on an open channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest<O> {
    pub name: DocumentName,
    pub delta: ClientDelta<O>,
    pub channel_id: String,
}

/// Server reply to a submit request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub ops_applied: u32,
    pub version: Option<VersionSignature>,
    pub error: Option<String>,
    pub code: ResponseCode,
}

impl SubmitResponse {
    pub fn ok(ops_applied: u32, version: VersionSignature) -> Self {
        Self {
            ops_applied,
            version: Some(version),
            error: None,
            code: ResponseCode::Ok,
        }
    }

    pub fn failed(code: ResponseCode, error: impl Into<String>) -> Self {
        Self {
            ops_applied: 0,
            version: None,
            error: Some(error.into()),
            code,
        }
    }

    /// Effective response code; a soft error under `Ok` is an internal error.
    pub fn effective_code(&self) -> ResponseCode {
        match (self.code, &self.error) {
            (ResponseCode::Ok, Some(_)) => ResponseCode::InternalError,
            (code, _) => code,
        }
    }
}

/// Request to close a server-side view channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub collection: CollectionId,
    pub channel_id: String,
}

/// Envelope for every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame<O, S> {
    Open(OpenRequest),
    Update(ViewUpdate<O, S>),
    Submit(SubmitRequest<O>),
    SubmitResponse {
        document: DocumentId,
        response: SubmitResponse,
    },
    Close(CloseRequest),
}

impl<O: Serialize, S: Serialize> Frame<O, S> {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl<O: DeserializeOwned, S: DeserializeOwned> Frame<O, S> {
    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

impl<O, S> Frame<O, S> {
    /// Convert a server-to-client frame into the callback it represents.
    pub fn into_service_message(self) -> Result<ServiceMessage<O, S>, ProtocolError> {
        match self {
            Self::Update(update) => Ok(ServiceMessage::Update(update)),
            Self::SubmitResponse { document, response } => {
                Ok(ServiceMessage::SubmitSucceeded { document, response })
            }
            Self::Open(_) | Self::Submit(_) | Self::Close(_) => Err(ProtocolError::UnexpectedFrame),
        }
    }
}

/// Transport callbacks delivered to a wire session.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceMessage<O, S> {
    /// One message of the open response stream.
    Update(ViewUpdate<O, S>),
    /// The open stream ended, optionally with a server error.
    OpenFinished { error: Option<String> },
    /// The open stream failed at the transport level.
    OpenFailed(String),
    SubmitSucceeded {
        document: DocumentId,
        response: SubmitResponse,
    },
    SubmitFailed {
        document: DocumentId,
        reason: String,
    },
    /// Transport-level fault; the session is unusable afterwards.
    Exception(ChannelError),
}

/// Frame codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame is not valid in this direction")]
    UnexpectedFrame,
}
