//! # logos-channel: Client-side concurrency control for Logos documents
//!
//! Keeps a client's documents in step with an authoritative server using
//! operational transformation over one multiplexed session per collection.
//!
//! ## Architecture
//!
//! ```text
//!  editor                                                       server
//!    │ send / receive                                             ▲
//!    ▼                                                            │
//! ┌────────────────────┐   ┌──────────────────┐   ┌─────────────┐ │
//! │ OperationChannel   │◄──│  DeltaSequencer  │◄──│             │ │
//! │ ReconciliationCore │──►│ (version order)  │──►│ WireSession │─┘
//! └────────────────────┘   └──────────────────┘   │             │
//!          ▲  one stack per document              └──────┬──────┘
//!          └──────────────── Multiplexer ────────────────┘
//!                      (reconnects, clobbering, failure)
//! ```
//!
//! The stack is sans-IO. The transport is an injected [`WaveService`] and
//! its callbacks are fed back in as [`ServiceMessage`]s. [`Driver`] runs a
//! multiplexer on tokio when that is convenient.
//!
//! ## Modules
//!
//! - [`id`] / [`version`] / [`model`] / [`delta`]: Data model
//! - [`protocol`]: Wire messages and the bincode frame codec
//! - [`session`]: One server view per collection
//! - [`sequencer`]: Strict version ordering per document
//! - [`reconcile`]: OT against the one unacknowledged delta
//! - [`channel`]: The per-document API the editor uses
//! - [`multiplexer`]: All documents of a collection, reconnection
//! - [`scheduler`] / [`config`]: Reconnection backoff
//! - [`driver`]: Tokio event loop

pub mod id;
pub mod version;
pub mod error;
pub mod model;
pub mod delta;
pub mod protocol;
pub mod session;
pub mod sequencer;
pub mod unsaved;
pub mod reconcile;
pub mod channel;
pub mod config;
pub mod scheduler;
pub mod multiplexer;
pub mod driver;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use id::{CollectionId, DocumentId, DocumentName, IdFilter, ParticipantId};
pub use version::{HashedVersionFactory, UriHashFactory, VersionSignature};
pub use error::{ChannelError, CorruptionDetail, Recoverable, ResponseCode, TransformError};
pub use model::{Accessibility, DocumentModel, KnownDocument, Snapshot};
pub use delta::{transform_ops, ClientDelta, TransformedDelta};
pub use protocol::{
    CloseRequest, Frame, OpenRequest, ProtocolError, ServiceMessage,
    SubmitRequest, SubmitResponse, ViewUpdate,
};
pub use session::{SessionEvent, SessionId, SessionState, WaveService, WireSession};
pub use sequencer::{DeltaSequencer, SequencerEvent, SequencerState, Submission};
pub use unsaved::{UnsavedDataInfo, UnsavedDataListener, UnsavedDataListenerFactory};
pub use reconcile::ReconciliationCore;
pub use channel::{ChannelState, OperationChannel, OperationListener};
pub use config::BackoffConfig;
pub use scheduler::{BackoffScheduler, ImmediateScheduler, ReconnectCommand, Scheduler};
pub use multiplexer::{ConnectionState, MuxEvent, MuxState, Multiplexer};
pub use driver::{Driver, ServiceSink};
