//! Client-side OT reconciliation.
//!
//! Holds the one unacknowledged local delta and transforms every incoming
//! server delta against it (and against anything queued for resubmission),
//! producing the operation stream the editor consumes.
//!
//! Besides the pending submission, the core remembers the *inferred server
//! path*: deltas the server acknowledged but has not yet committed. Their ack
//! signatures are the versions the channel can resume from after a
//! reconnection, which lets it decide which of its deltas the server already
//! has and which must be sent again.

use std::collections::VecDeque;
use std::fmt;

use crate::delta::{transform_ops, ClientDelta, TransformedDelta};
use crate::error::ChannelError;
use crate::id::ParticipantId;
use crate::model::DocumentModel;
use crate::unsaved::{UnsavedDataInfo, UnsavedDataListener};
use crate::version::VersionSignature;

#[derive(Debug, Clone, PartialEq)]
struct AckInfo {
    ops_applied: u32,
    version: VersionSignature,
}

#[derive(Debug, Clone, PartialEq)]
struct AckedDelta<O> {
    delta: ClientDelta<O>,
    ack: AckInfo,
}

/// OT engine for one document channel.
pub struct ReconciliationCore<M: DocumentModel> {
    author: ParticipantId,
    /// Earliest version the channel can resume from.
    start_signature: VersionSignature,
    /// Server version at reconnection; deltas below it may echo our own.
    end_of_starting_delta: Option<VersionSignature>,
    inferred_server_path: VecDeque<AckedDelta<M::Operation>>,
    acks: VecDeque<AckInfo>,
    last_commit_version: u64,
    unacknowledged: Option<ClientDelta<M::Operation>>,
    /// Op batches waiting to be sent, oldest first.
    client_queue: VecDeque<Vec<M::Operation>>,
    /// Transformed server ops not yet taken by the editor.
    server_operations: VecDeque<M::Operation>,
    connected: bool,
    outgoing: Option<ClientDelta<M::Operation>>,
    operations_received: bool,
    unsaved: Option<Box<dyn UnsavedDataListener>>,
}

impl<M: DocumentModel> ReconciliationCore<M> {
    pub fn new(author: ParticipantId, start_signature: VersionSignature, last_commit_version: u64) -> Self {
        Self {
            author,
            start_signature,
            end_of_starting_delta: None,
            inferred_server_path: VecDeque::new(),
            acks: VecDeque::new(),
            last_commit_version,
            unacknowledged: None,
            client_queue: VecDeque::new(),
            server_operations: VecDeque::new(),
            connected: false,
            outgoing: None,
            operations_received: false,
            unsaved: None,
        }
    }

    pub fn set_unsaved_listener(&mut self, listener: Option<Box<dyn UnsavedDataListener>>) {
        self.unsaved = listener;
    }

    /// Sending is only possible while the delta channel is connected.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn start_signature(&self) -> &VersionSignature {
        &self.start_signature
    }

    pub fn unacknowledged(&self) -> Option<&ClientDelta<M::Operation>> {
        self.unacknowledged.as_ref()
    }

    /// Whether a delta is in flight or waiting to be (re)sent.
    pub fn has_pending_submission(&self) -> bool {
        self.unacknowledged.is_some() || !self.client_queue.is_empty()
    }

    /// The delta to hand to the sequencer, if one was just composed.
    pub fn take_submission(&mut self) -> Option<ClientDelta<M::Operation>> {
        self.outgoing.take()
    }

    /// Whether new server operations arrived since the last call.
    pub fn take_operations_signal(&mut self) -> bool {
        std::mem::take(&mut self.operations_received)
    }

    /// Versions this channel can resynchronize from.
    ///
    /// Always includes the start signature, even at version zero, so the
    /// server replays deltas instead of clobbering the document.
    pub fn reconnection_versions(&self) -> Vec<VersionSignature> {
        std::iter::once(self.start_signature.clone())
            .chain(self.inferred_server_path.iter().map(|d| d.ack.version.clone()))
            .collect()
    }

    /// The delta channel connected at `connect`; the server is at `current`.
    pub fn on_open(&mut self, connect: &VersionSignature, current: &VersionSignature) -> Result<(), ChannelError> {
        if current.version() < connect.version() {
            return Err(ChannelError::protocol(format!(
                "Invalid connect versions: connect {connect}, current {current}"
            )));
        }

        let start_resend = if self.start_signature == *connect {
            Some(0)
        } else {
            self.inferred_server_path
                .iter()
                .position(|d| d.ack.version == *connect)
                .map(|i| i + 1)
        };
        let Some(start_resend) = start_resend else {
            let known = self.reconnection_versions();
            let reason = if known.iter().any(|v| v.diverges_from(connect)) {
                "history diverged at"
            } else {
                "no matching signature for"
            };
            return Err(ChannelError::ReconnectMismatch(format!(
                "{reason} connect {connect}, current {current}, known {known:?}"
            )));
        };

        let path_len = self.inferred_server_path.len();
        if start_resend < path_len || (start_resend == path_len && connect == current) {
            // The server cannot have anything after `connect`, so resend.
            self.merge_to_client_queue(start_resend);
        } else {
            log::trace!("All reconnection signatures matched; waiting for server deltas");
        }
        self.forget_acks_after(self.start_signature.version());
        self.end_of_starting_delta = Some(current.clone());
        self.send_delta();
        Ok(())
    }

    /// Local operations from the editor.
    ///
    /// Rejected while a submission is outstanding; the pending submission is
    /// left untouched.
    pub fn on_client_operations(&mut self, ops: Vec<M::Operation>) -> Result<(), ChannelError> {
        if self.has_pending_submission() {
            return Err(ChannelError::SubmissionPending);
        }
        if ops.is_empty() {
            return Ok(());
        }
        // Client ops were composed after every server op the editor has seen,
        // but not after those still waiting in `server_operations`.
        let pending: Vec<_> = self.server_operations.drain(..).collect();
        let (client, server) = transform_ops::<M>(ops, pending)?;
        self.server_operations.extend(server);
        if !client.is_empty() {
            self.client_queue.push_back(client);
        }
        self.trigger_unsaved();
        self.send_delta();
        Ok(())
    }

    pub fn on_server_deltas(&mut self, deltas: Vec<TransformedDelta<M::Operation>>) -> Result<(), ChannelError> {
        if deltas.is_empty() {
            log::error!("Unexpected empty server delta batch");
            return Ok(());
        }
        for delta in deltas {
            self.transform_and_notify(delta)?;
        }
        if !self.server_operations.is_empty() {
            self.operations_received = true;
        }
        self.trigger_unsaved();
        self.send_delta();
        Ok(())
    }

    /// The server applied `ops_applied` ops of the unacknowledged delta.
    pub fn on_ack(&mut self, ops_applied: u32, signature: VersionSignature) -> Result<(), ChannelError> {
        let Some(unacknowledged) = self.unacknowledged.take() else {
            return Err(ChannelError::protocol(format!(
                "Ack at {signature} with nothing unacknowledged"
            )));
        };
        let expected = unacknowledged.target_version().version() + u64::from(ops_applied);
        if ops_applied as usize > unacknowledged.len() || signature.version() != expected {
            let message = format!(
                "Ack of {ops_applied} ops at {signature} does not match delta of {} ops at {}",
                unacknowledged.len(),
                unacknowledged.target_version()
            );
            self.unacknowledged = Some(unacknowledged);
            return Err(ChannelError::protocol(message));
        }
        if let Some(last) = self.acks.back() {
            if signature.version() <= last.version.version() {
                let message = format!("Ack at {signature} is not after previous ack at {}", last.version);
                self.unacknowledged = Some(unacknowledged);
                return Err(ChannelError::protocol(message));
            }
        }
        if unacknowledged.target_version().version() < self.start_signature.version() {
            log::error!(
                "Ack for delta at {} before start version {}",
                unacknowledged.target_version(),
                self.start_signature
            );
        }

        let ack = AckInfo {
            ops_applied,
            version: signature.clone(),
        };
        let version_ops = Self::version_update_ops(&unacknowledged, ops_applied, &signature);
        if !unacknowledged.is_empty() {
            self.inferred_server_path.push_back(AckedDelta {
                delta: unacknowledged,
                ack: ack.clone(),
            });
        }
        self.acks.push_back(ack);

        let version_ops = self.transform_against_queue(version_ops)?;
        self.server_operations.extend(version_ops);
        if !self.server_operations.is_empty() {
            self.operations_received = true;
        }
        self.trigger_unsaved();
        self.send_delta();
        Ok(())
    }

    pub fn on_commit(&mut self, committed: u64) {
        while let Some(front) = self.inferred_server_path.front() {
            if front.ack.version.version() > committed {
                break;
            }
            self.start_signature = front.ack.version.clone();
            self.inferred_server_path.pop_front();
        }
        while self.acks.front().is_some_and(|ack| ack.version.version() <= committed) {
            self.acks.pop_front();
        }
        self.last_commit_version = committed;
        log::trace!(
            "Commit at {committed}, inferred path {}, unacknowledged {}",
            self.inferred_server_path.len(),
            self.unacknowledged.is_some()
        );
        self.trigger_unsaved();
    }

    /// Next server operation for the editor, if any.
    pub fn receive(&mut self) -> Option<M::Operation> {
        self.server_operations.pop_front()
    }

    pub fn peek(&self) -> Option<&M::Operation> {
        self.server_operations.front()
    }

    pub fn unsaved_info(&self) -> UnsavedDataInfo {
        let in_flight = self.unacknowledged.as_ref().map_or(0, ClientDelta::len);
        let queued: usize = self.client_queue.iter().map(Vec::len).sum();
        let acked_uncommitted: usize = self.acks.iter().map(|a| a.ops_applied as usize).sum();
        UnsavedDataInfo {
            in_flight_size: in_flight,
            unacknowledged_size: in_flight + queued,
            uncommitted_size: in_flight + queued + acked_uncommitted,
            last_ack_version: self
                .acks
                .back()
                .map_or(self.start_signature.version(), |a| a.version.version()),
            last_commit_version: self.last_commit_version,
        }
    }

    /// Release the channel; reports whether everything reached the server's store.
    pub fn close(&mut self) {
        let info = self.unsaved_info();
        if !self.client_queue.is_empty() {
            log::error!(
                "Closing with {} unsent ops, last commit {}",
                info.unacknowledged_size - info.in_flight_size,
                self.last_commit_version
            );
        }
        self.connected = false;
        if let Some(mut listener) = self.unsaved.take() {
            listener.on_close(info.everything_committed());
        }
    }

    fn last_signature(&self) -> VersionSignature {
        self.inferred_server_path
            .back()
            .map_or_else(|| self.start_signature.clone(), |d| d.ack.version.clone())
    }

    fn version_update_ops(
        acked: &ClientDelta<M::Operation>,
        ops_applied: u32,
        signature: &VersionSignature,
    ) -> Vec<M::Operation> {
        let Some(first) = acked.ops().first() else {
            return Vec::new();
        };
        if ops_applied == 0 {
            // Everything was transformed away, but the version still moved on.
            return vec![M::version_update(first, 0, Some(signature))];
        }
        let count = ops_applied as usize;
        acked.ops()[..count]
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let signed = (i + 1 == count).then_some(signature);
                M::version_update(op, 1, signed)
            })
            .collect()
    }

    fn transform_and_notify(&mut self, delta: TransformedDelta<M::Operation>) -> Result<(), ChannelError> {
        let latest = self
            .inferred_server_path
            .back()
            .map_or(self.start_signature.version(), |d| d.ack.version.version());
        if delta.applied_at_version() < latest {
            return Err(ChannelError::protocol(format!(
                "Server delta at {} is older than the inferred server path end {latest}",
                delta.applied_at_version()
            )));
        }
        if self.detect_echo_back(&delta)? {
            return Ok(());
        }

        // Past a foreign server delta the acked deltas can no longer be resent.
        self.inferred_server_path.clear();
        self.start_signature = delta.resulting_version().clone();

        let resulting = delta.resulting_version().clone();
        let applied_at = delta.applied_at_version();
        let mut server_ops = delta.into_ops();
        if let Some(unacknowledged) = self.unacknowledged.take() {
            if applied_at != unacknowledged.target_version().version() {
                let message = format!(
                    "Server delta at {applied_at} does not apply at unacknowledged version {}",
                    unacknowledged.target_version()
                );
                self.unacknowledged = Some(unacknowledged);
                return Err(ChannelError::protocol(message));
            }
            let author = unacknowledged.author().clone();
            let (client, server) = transform_ops::<M>(unacknowledged.into_ops(), server_ops)?;
            self.unacknowledged = Some(ClientDelta::new(author, resulting, client));
            server_ops = server;
        }
        let server_ops = self.transform_against_queue(server_ops)?;
        self.server_operations.extend(server_ops);
        Ok(())
    }

    /// A server delta that reproduces our unacknowledged delta after a
    /// reconnection is its ack.
    fn detect_echo_back(&mut self, delta: &TransformedDelta<M::Operation>) -> Result<bool, ChannelError> {
        let Some(end) = &self.end_of_starting_delta else {
            return Ok(false);
        };
        if end.version() <= delta.applied_at_version() {
            return Ok(false);
        }
        let end_reached = end == delta.resulting_version();

        if self.unacknowledged.as_ref().is_some_and(|u| delta.echoes(u)) {
            log::debug!("Server echoed our delta at {}", delta.applied_at_version());
            self.on_ack(delta.len() as u32, delta.resulting_version().clone())?;
            return Ok(true);
        }
        if end_reached {
            // The server never saw our delta; resend it.
            self.merge_to_client_queue(self.inferred_server_path.len());
        }
        Ok(false)
    }

    /// Move acked deltas from `start` on, and the unacknowledged delta, back
    /// to the head of the client queue.
    fn merge_to_client_queue(&mut self, start: usize) {
        let mut deltas: Vec<Vec<M::Operation>> = Vec::new();
        if start < self.inferred_server_path.len() {
            deltas.extend(self.inferred_server_path.drain(start..).map(|d| d.delta.into_ops()));
        }
        if let Some(unacknowledged) = self.unacknowledged.take() {
            deltas.push(unacknowledged.into_ops());
        }
        for ops in deltas.into_iter().rev() {
            self.client_queue.push_front(ops);
        }
    }

    fn forget_acks_after(&mut self, version: u64) {
        self.acks.retain(|ack| ack.version.version() <= version);
    }

    /// Transform server ops against every queued client batch.
    fn transform_against_queue(&mut self, server_ops: Vec<M::Operation>) -> Result<Vec<M::Operation>, ChannelError> {
        let mut server_ops = server_ops;
        for queued in self.client_queue.iter_mut() {
            let (client, server) = transform_ops::<M>(std::mem::take(queued), server_ops)?;
            *queued = client;
            server_ops = server;
        }
        Ok(server_ops)
    }

    fn send_delta(&mut self) {
        if !self.connected {
            log::trace!("Not sending: delta channel is not connected");
            return;
        }
        if self.unacknowledged.is_some() {
            return;
        }
        let Some(ops) = self.client_queue.pop_front() else {
            self.trigger_unsaved();
            return;
        };
        // Sending means we know where we are on the server path.
        self.end_of_starting_delta = None;
        let delta = ClientDelta::new(self.author.clone(), self.last_signature(), ops);
        log::trace!("Sending {} ops at {}", delta.len(), delta.target_version());
        self.unacknowledged = Some(delta.clone());
        self.outgoing = Some(delta);
        self.trigger_unsaved();
    }

    fn trigger_unsaved(&mut self) {
        if self.unsaved.is_some() {
            let info = self.unsaved_info();
            if let Some(listener) = self.unsaved.as_mut() {
                listener.on_update(&info);
            }
        }
    }
}

impl<M: DocumentModel> fmt::Debug for ReconciliationCore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationCore")
            .field("start_signature", &self.start_signature)
            .field("end_of_starting_delta", &self.end_of_starting_delta)
            .field("inferred_server_path", &self.inferred_server_path.len())
            .field("acks", &self.acks.len())
            .field("last_commit_version", &self.last_commit_version)
            .field("unacknowledged", &self.unacknowledged)
            .field("client_queue", &self.client_queue.len())
            .field("server_operations", &self.server_operations.len())
            .field("connected", &self.connected)
            .finish()
    }
}
