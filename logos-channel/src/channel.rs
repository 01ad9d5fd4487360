//! Per-document operation channel: the API the editor layer uses.
//!
//! The channel wraps a [`ReconciliationCore`], enforces accessibility, and
//! consumes the ordered [`SequencerEvent`]s of its document.

use std::fmt;

use crate::delta::ClientDelta;
use crate::error::ChannelError;
use crate::id::DocumentId;
use crate::model::{Accessibility, DocumentModel};
use crate::reconcile::ReconciliationCore;
use crate::sequencer::SequencerEvent;
use crate::unsaved::UnsavedDataInfo;
use crate::version::VersionSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotConnected,
    Connected,
    Closed,
}

/// Callback fired once per non-empty batch of received operations.
pub type OperationListener = Box<dyn FnMut(&DocumentId)>;

/// Send/receive operations for one document.
pub struct OperationChannel<M: DocumentModel> {
    document: DocumentId,
    state: ChannelState,
    accessibility: Accessibility,
    cc: ReconciliationCore<M>,
    listener: Option<OperationListener>,
    received: bool,
}

impl<M: DocumentModel> OperationChannel<M> {
    pub fn new(document: DocumentId, cc: ReconciliationCore<M>, accessibility: Accessibility) -> Self {
        Self {
            document,
            state: ChannelState::NotConnected,
            accessibility,
            cc,
            listener: None,
            received: false,
        }
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn accessibility(&self) -> Accessibility {
        self.accessibility
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn set_listener(&mut self, listener: Option<OperationListener>) {
        self.listener = listener;
    }

    /// Queue local operations for submission.
    ///
    /// Fails without side effects when the channel is closed, not writable,
    /// or already has a submission outstanding.
    pub fn send(&mut self, ops: Vec<M::Operation>) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        if !self.accessibility.is_writable() {
            return Err(ChannelError::NotWritable(self.accessibility));
        }
        self.cc.on_client_operations(ops)
    }

    /// Next received operation, if any.
    pub fn receive(&mut self) -> Option<M::Operation> {
        if self.state == ChannelState::Closed {
            log::error!("Cannot receive from closed channel {}", self.document);
            return None;
        }
        self.cc.receive()
    }

    pub fn peek(&self) -> Option<&M::Operation> {
        if self.state == ChannelState::Closed {
            log::error!("Cannot peek at closed channel {}", self.document);
            return None;
        }
        self.cc.peek()
    }

    pub fn reconnect_versions(&self) -> Result<Vec<VersionSignature>, ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        Ok(self.cc.reconnection_versions())
    }

    pub fn has_pending_submission(&self) -> bool {
        self.cc.has_pending_submission()
    }

    pub fn unsaved_info(&self) -> UnsavedDataInfo {
        self.cc.unsaved_info()
    }

    /// Deliver one ordered event from the document's sequencer.
    pub fn deliver(&mut self, event: SequencerEvent<M::Operation>) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            log::trace!("Dropping {event:?} for closed channel {}", self.document);
            return Ok(());
        }
        let result = match event {
            SequencerEvent::Connection { connect, current } => self.on_connection(&connect, &current),
            SequencerEvent::Delta(delta) => self.cc.on_server_deltas(vec![delta]),
            SequencerEvent::Ack { ops_applied, version } => self.cc.on_ack(ops_applied, version),
            SequencerEvent::Nack { code, message, version } => {
                log::warn!("Delta on {} rejected at {version}: {code} {message}", self.document);
                let error = ChannelError::Nack { code, message };
                if error.is_recoverable() {
                    self.reset();
                }
                Err(error)
            }
            SequencerEvent::Commit(version) => {
                self.cc.on_commit(version);
                Ok(())
            }
        };
        if self.cc.take_operations_signal() {
            self.received = true;
            if let Some(listener) = self.listener.as_mut() {
                listener(&self.document);
            }
        }
        result.map_err(|e| e.with_document(&self.document))
    }

    /// Delta composed by the reconciliation core, ready for the sequencer.
    pub fn take_submission(&mut self) -> Option<ClientDelta<M::Operation>> {
        self.cc.take_submission()
    }

    /// Whether operations arrived since the last call.
    pub fn take_received(&mut self) -> bool {
        std::mem::take(&mut self.received)
    }

    /// Forget the connection; the channel waits for the next `Connection`.
    pub fn reset(&mut self) {
        if self.state == ChannelState::Connected {
            self.state = ChannelState::NotConnected;
        }
        self.cc.set_connected(false);
    }

    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        log::debug!("Closing operation channel {}", self.document);
        self.state = ChannelState::Closed;
        self.listener = None;
        self.cc.close();
    }

    fn on_connection(&mut self, connect: &VersionSignature, current: &VersionSignature) -> Result<(), ChannelError> {
        if self.state != ChannelState::NotConnected {
            return Err(ChannelError::protocol(format!(
                "Connection at {connect} while {:?}",
                self.state
            )));
        }
        self.state = ChannelState::Connected;
        self.cc.set_connected(true);
        self.cc.on_open(connect, current)
    }
}

impl<M: DocumentModel> fmt::Debug for OperationChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationChannel")
            .field("document", &self.document)
            .field("state", &self.state)
            .field("accessibility", &self.accessibility)
            .field("cc", &self.cc)
            .finish()
    }
}
