//! Channel error taxonomy.
//!
//! Every failure in the channel stack is one of:
//! - a local **rejection** of an API call (the caller misused the channel;
//!   nothing is corrupted),
//! - a **recoverable** fault (stale base version, transport failure), which
//!   is resolved by reconnecting,
//! - an **unrecoverable** fault (version gap, echoed delta, signature
//!   mismatch), which marks the document and its collection corrupt.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::DocumentId;
use crate::model::Accessibility;

/// Server response codes carried by submit responses and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    BadRequest,
    InternalError,
    NotAuthorized,
    VersionError,
    InvalidOperation,
    SchemaViolation,
    SizeLimitExceeded,
    PolicyViolation,
    Quarantined,
    /// The delta's base version is older than the server keeps history for.
    TooOld,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::BadRequest => "BAD_REQUEST",
            Self::InternalError => "INTERNAL_ERROR",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::VersionError => "VERSION_ERROR",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::SchemaViolation => "SCHEMA_VIOLATION",
            Self::SizeLimitExceeded => "SIZE_LIMIT_EXCEEDED",
            Self::PolicyViolation => "POLICY_VIOLATION",
            Self::Quarantined => "QUARANTINED",
            Self::TooOld => "TOO_OLD",
        };
        f.write_str(name)
    }
}

/// Whether a fault can be resolved by reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverable {
    Recoverable,
    NotRecoverable,
}

/// Failure of the op-transform capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors raised by the channel stack.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("A submission is already outstanding")]
    SubmissionPending,

    #[error("Document is not writable ({0:?})")]
    NotWritable(Accessibility),

    #[error("Channel is closed")]
    Closed,

    #[error("Unknown document")]
    UnknownDocument,

    #[error("Version gap: expected {expected}, received {received}")]
    VersionGap { expected: u64, received: u64 },

    #[error("Out of sequence message starting at {received}, last server version {last}")]
    OutOfSequence { received: u64, last: u64 },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Delta rejected ({code}): {message}")]
    Nack { code: ResponseCode, message: String },

    #[error("Submit failed: {0}")]
    SubmitFailed(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Reconnection signature mismatch: {0}")]
    ReconnectMismatch(String),

    #[error("Server did not acknowledge known documents: {0:?}")]
    AccessLost(Vec<DocumentId>),

    #[error("Reconnection abandoned after {attempts} attempts")]
    ReconnectAbandoned { attempts: u32 },

    #[error("{source} (document {document})")]
    InDocument {
        document: DocumentId,
        #[source]
        source: Box<ChannelError>,
    },
}

impl ChannelError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Attach the document this error concerns, once.
    pub fn with_document(self, document: &DocumentId) -> Self {
        match self {
            Self::InDocument { .. } => self,
            other => Self::InDocument {
                document: document.clone(),
                source: Box::new(other),
            },
        }
    }

    pub fn document(&self) -> Option<&DocumentId> {
        match self {
            Self::InDocument { document, .. } => Some(document),
            _ => None,
        }
    }

    /// The error without its document annotation.
    pub fn root(&self) -> &ChannelError {
        match self {
            Self::InDocument { source, .. } => source.root(),
            other => other,
        }
    }

    /// Local API misuse that leaves all channel state intact.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.root(),
            Self::SubmissionPending | Self::NotWritable(_) | Self::Closed | Self::UnknownDocument
        )
    }

    pub fn recoverable(&self) -> Recoverable {
        match self.root() {
            Self::SubmitFailed(_) | Self::Transport(_) => Recoverable::Recoverable,
            Self::Nack { code: ResponseCode::TooOld, .. } => Recoverable::Recoverable,
            _ => Recoverable::NotRecoverable,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable() == Recoverable::Recoverable
    }

    pub fn response_code(&self) -> ResponseCode {
        match self.root() {
            Self::SubmissionPending | Self::UnknownDocument => ResponseCode::BadRequest,
            Self::NotWritable(_) | Self::AccessLost(_) => ResponseCode::NotAuthorized,
            Self::Nack { code, .. } => *code,
            Self::Transform(_) => ResponseCode::InvalidOperation,
            Self::VersionGap { .. } | Self::OutOfSequence { .. } | Self::ReconnectMismatch(_) => {
                ResponseCode::VersionError
            }
            _ => ResponseCode::InternalError,
        }
    }
}

/// Description of the fault that made a multiplexer fail.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionDetail {
    pub code: ResponseCode,
    pub description: String,
    pub cause: Option<ChannelError>,
}

impl CorruptionDetail {
    pub fn new(code: ResponseCode, description: impl Into<String>, cause: Option<ChannelError>) -> Self {
        Self {
            code,
            description: description.into(),
            cause,
        }
    }
}

impl fmt::Display for CorruptionDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}
