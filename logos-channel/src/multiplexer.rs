//! Multiplexer: every document channel of a collection over one wire session.
//!
//! Architecture:
//! ```text
//!                    ┌───────────────────────────────┐
//!   editor ─send──►  │ Multiplexer                   │
//!   editor ◄receive─ │   doc A ─ Stacklet            │
//!                    │   doc B ─ Stacklet            │ ─submit/open/close─► WaveService
//!   MuxEvent ◄────── │   ...                         │ ◄──ServiceMessage─── (transport)
//!                    │   WireSession (current tag)   │
//!                    └───────────────────────────────┘
//!   Stacklet = DeltaSequencer ─► OperationChannel ─► ReconciliationCore
//! ```
//!
//! Each wire session carries a tag. Reconnection and shutdown bump the tag,
//! so messages from a defunct session are dropped on arrival. Channels
//! survive reconnection; only the session is replaced.
//!
//! Nothing is called back synchronously. Notifications queue up as
//! [`MuxEvent`]s and are taken with [`Multiplexer::poll_event`] or
//! [`Multiplexer::drain_events`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use crate::channel::{OperationChannel, OperationListener};
use crate::delta::TransformedDelta;
use crate::error::{ChannelError, CorruptionDetail, ResponseCode};
use crate::id::{CollectionId, DocumentId, DocumentName, IdFilter, ParticipantId};
use crate::model::{Accessibility, DocumentModel, KnownDocument, Snapshot};
use crate::protocol::{ServiceMessage, SubmitResponse};
use crate::reconcile::ReconciliationCore;
use crate::scheduler::{ReconnectCommand, Scheduler};
use crate::sequencer::{DeltaSequencer, SequencerEvent};
use crate::session::{SessionEvent, SessionId, WaveService, WireSession};
use crate::unsaved::{UnsavedDataInfo, UnsavedDataListenerFactory};
use crate::version::{HashedVersionFactory, UriHashFactory, VersionSignature};

/// Lifecycle of the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

/// State of the underlying wire connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// Notifications for the application, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxEvent<S> {
    /// The initial open completed. Emitted once.
    OpenFinished,
    ChannelCreated {
        document: DocumentId,
        snapshot: Snapshot<S>,
        accessibility: Accessibility,
    },
    ChannelRemoved {
        document: DocumentId,
    },
    /// Operations are ready to `receive` on a channel.
    OperationsReceived {
        document: DocumentId,
    },
    /// Call [`Multiplexer::execute`] with `command` once `delay` has elapsed.
    ReconnectScheduled {
        command: ReconnectCommand,
        delay: Duration,
    },
    /// The multiplexer shut down after unrecoverable corruption.
    Failed(CorruptionDetail),
}

/// One document's channel stack.
struct Stacklet<M: DocumentModel> {
    sequencer: DeltaSequencer<M::Operation>,
    channel: OperationChannel<M>,
    first_message_received: bool,
    /// Set for locally created documents, whose first server snapshot
    /// duplicates the one faked at creation.
    drop_additional_snapshot: bool,
}

impl<M: DocumentModel> Stacklet<M> {
    fn new(channel: OperationChannel<M>, tag_floor: u32, drop_additional_snapshot: bool) -> Self {
        Self {
            sequencer: DeltaSequencer::with_tag_floor(tag_floor),
            channel,
            first_message_received: false,
            drop_additional_snapshot,
        }
    }

    fn expecting_snapshot(&self) -> bool {
        self.drop_additional_snapshot
    }

    fn on_snapshot(
        &mut self,
        version: VersionSignature,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    ) -> Result<(), ChannelError> {
        if !self.first_message_received {
            self.first_message_received = true;
        } else if self.drop_additional_snapshot {
            log::debug!("Dropping server snapshot at {version} for {}", self.channel.document());
            self.drop_additional_snapshot = false;
            return Ok(());
        }
        let events = self.sequencer.on_snapshot(version, last_committed, current)?;
        self.deliver(events)
    }

    fn on_update(
        &mut self,
        deltas: Vec<TransformedDelta<M::Operation>>,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    ) -> Result<(), ChannelError> {
        self.first_message_received = true;
        let events = self.sequencer.on_update(deltas, last_committed, current)?;
        self.deliver(events)
    }

    fn on_submit_response(&mut self, tag: u32, result: Result<SubmitResponse, String>) -> Result<(), ChannelError> {
        let events = self.sequencer.on_submit_response(tag, result)?;
        self.deliver(events)
    }

    fn send(&mut self, ops: Vec<M::Operation>) -> Result<(), ChannelError> {
        self.channel.send(ops)?;
        self.forward_submission()
    }

    fn deliver(&mut self, events: Vec<SequencerEvent<M::Operation>>) -> Result<(), ChannelError> {
        for event in events {
            self.channel.deliver(event)?;
        }
        self.forward_submission()
    }

    /// Hand a delta composed by the channel to the sequencer.
    fn forward_submission(&mut self) -> Result<(), ChannelError> {
        if let Some(delta) = self.channel.take_submission() {
            self.sequencer.submit(delta)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.sequencer.reset();
        self.channel.reset();
    }

    fn close(&mut self) {
        self.sequencer.detach();
        self.channel.close();
    }
}

/// A reconnection waiting for its scheduled delay.
struct PendingReconnect {
    command: ReconnectCommand,
    known: BTreeMap<DocumentId, Vec<VersionSignature>>,
}

/// Multiplexes the document channels of one collection over a wire session,
/// reconnecting when the session fails.
pub struct Multiplexer<M, W, S>
where
    M: DocumentModel,
    W: WaveService<M::Operation, M::State>,
    S: Scheduler,
{
    collection: CollectionId,
    participant: ParticipantId,
    service: W,
    scheduler: S,
    versions: Box<dyn HashedVersionFactory>,
    unsaved: Option<Box<dyn UnsavedDataListenerFactory>>,

    state: MuxState,
    connection: ConnectionState,
    open_finished: bool,
    /// Id of the current session; bumped on reconnection and shutdown.
    connection_tag: SessionId,
    session: Option<WireSession<M::Operation, M::State>>,
    filter: IdFilter,

    channels: HashMap<DocumentId, Stacklet<M>>,
    /// Highest sequencer tag of any removed channel; new channels start above it.
    tag_floor: u32,
    /// Resync anchors the current session was opened with.
    expected: BTreeMap<DocumentId, Vec<VersionSignature>>,
    /// Expected documents not yet heard from; `None` after open finished.
    missing: Option<BTreeSet<DocumentId>>,
    /// Locally created channels to connect once the session is up.
    pending_local: Vec<(DocumentId, VersionSignature)>,
    pending_reconnect: Option<PendingReconnect>,

    events: VecDeque<MuxEvent<M::State>>,
}

impl<M, W, S> Multiplexer<M, W, S>
where
    M: DocumentModel,
    W: WaveService<M::Operation, M::State>,
    S: Scheduler,
{
    pub fn new(collection: CollectionId, participant: ParticipantId, service: W, scheduler: S) -> Self {
        Self {
            collection,
            participant,
            service,
            scheduler,
            versions: Box::new(UriHashFactory),
            unsaved: None,
            state: MuxState::Created,
            connection: ConnectionState::Disconnected,
            open_finished: false,
            connection_tag: 0,
            session: None,
            filter: IdFilter::all(),
            channels: HashMap::new(),
            tag_floor: 0,
            expected: BTreeMap::new(),
            missing: None,
            pending_local: Vec::new(),
            pending_reconnect: None,
            events: VecDeque::new(),
        }
    }

    pub fn with_version_factory(mut self, versions: Box<dyn HashedVersionFactory>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_unsaved_data_factory(mut self, factory: Box<dyn UnsavedDataListenerFactory>) -> Self {
        self.unsaved = Some(factory);
        self
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    pub fn state(&self) -> MuxState {
        self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_open_finished(&self) -> bool {
        self.open_finished
    }

    /// Id of the live session, if one is open.
    pub fn current_session(&self) -> Option<SessionId> {
        self.session.as_ref().map(WireSession::id)
    }

    pub fn service(&self) -> &W {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut W {
        &mut self.service
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Open the collection.
    ///
    /// `known` documents get channels straight away. The readable ones are
    /// offered to the server as resync anchors at their snapshot version.
    pub fn open(&mut self, filter: IdFilter, known: Vec<KnownDocument<M::State>>) {
        if self.state != MuxState::Created {
            log::error!("Multiplexer for {} opened twice", self.collection);
            return;
        }
        log::info!("Opening {} with {} known documents", self.collection, known.len());
        self.state = MuxState::Opening;
        self.filter = filter;

        let mut anchors = BTreeMap::new();
        for doc in known {
            if doc.accessibility.is_readable() {
                anchors.insert(doc.document.clone(), vec![doc.snapshot.version.clone()]);
            }
            let last_commit = doc.committed.version();
            if let Err(e) = self.add_channel(doc.document, doc.snapshot, last_commit, doc.accessibility, false) {
                self.shutdown(e.response_code(), "Multiplexer open failed", Some(e));
                return;
            }
        }
        if let Err(e) = self.connect(anchors) {
            self.shutdown(e.response_code(), "Multiplexer open failed", Some(e));
        }
    }

    /// Create a channel for a brand-new document, at version zero.
    pub fn create_operation_channel(&mut self, document: DocumentId) -> Result<(), ChannelError> {
        if self.is_shut_down() {
            return Err(ChannelError::Closed);
        }
        if self.channels.contains_key(&document) {
            return Err(ChannelError::protocol(format!(
                "Operation channel already exists for {document}"
            )));
        }
        if !self.filter.accepts(&document) {
            log::warn!("Creating {document}, which the open filter excludes");
        }

        let name = DocumentName::new(self.collection.clone(), document.clone());
        let v0 = self.versions.version_zero(&name);
        let snapshot = Snapshot::new(M::empty_state(&name, &self.participant), v0.clone());
        self.add_channel(document.clone(), snapshot, 0, Accessibility::ReadableWritable, true)?;

        if self.connection == ConnectionState::Connected {
            if let Err(e) = self.connect_local(&document, v0) {
                self.shutdown(e.response_code(), "Creating operation channel failed", Some(e.clone()));
                return Err(e);
            }
        } else {
            self.pending_local.push((document, v0));
        }
        Ok(())
    }

    /// Send local operations on a document.
    ///
    /// Rejections (pending submission, read-only, closed) leave everything
    /// as it was. Any other failure also takes the multiplexer through its
    /// error handling before being returned.
    pub fn send(&mut self, document: &DocumentId, ops: Vec<M::Operation>) -> Result<(), ChannelError> {
        if self.is_shut_down() {
            return Err(ChannelError::Closed);
        }
        let stacklet = self.channels.get_mut(document).ok_or(ChannelError::UnknownDocument)?;
        let result = stacklet.send(ops).and_then(|()| self.transmit(document));
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_rejection() => Err(e),
            Err(e) => {
                let e = e.with_document(document);
                self.on_channel_exception(e.clone());
                Err(e)
            }
        }
    }

    /// Next received operation for a document.
    pub fn receive(&mut self, document: &DocumentId) -> Option<M::Operation> {
        self.channels.get_mut(document)?.channel.receive()
    }

    pub fn peek(&self, document: &DocumentId) -> Option<&M::Operation> {
        self.channels.get(document)?.channel.peek()
    }

    pub fn channel(&self, document: &DocumentId) -> Option<&OperationChannel<M>> {
        self.channels.get(document).map(|s| &s.channel)
    }

    pub fn set_listener(
        &mut self,
        document: &DocumentId,
        listener: Option<OperationListener>,
    ) -> Result<(), ChannelError> {
        let stacklet = self.channels.get_mut(document).ok_or(ChannelError::UnknownDocument)?;
        stacklet.channel.set_listener(listener);
        Ok(())
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentId> {
        self.channels.keys()
    }

    pub fn reconnect_versions(&self, document: &DocumentId) -> Result<Vec<VersionSignature>, ChannelError> {
        self.channels
            .get(document)
            .ok_or(ChannelError::UnknownDocument)?
            .channel
            .reconnect_versions()
    }

    pub fn unsaved_info(&self, document: &DocumentId) -> Option<UnsavedDataInfo> {
        self.channels.get(document).map(|s| s.channel.unsaved_info())
    }

    /// Feed one transport callback for session `session`.
    pub fn handle(&mut self, session: SessionId, message: ServiceMessage<M::Operation, M::State>) {
        let events = match self.session.as_mut() {
            Some(current) if current.id() == session => current.handle(&mut self.service, message),
            _ => {
                log::trace!("Dropping message from defunct session {session}");
                return;
            }
        };
        for event in events {
            // An earlier event may have replaced or closed the session.
            if self.connection_tag != session || self.is_shut_down() {
                log::trace!("Dropping remaining events from replaced session {session}");
                break;
            }
            if let Err(e) = self.on_session_event(event) {
                self.on_channel_exception(e);
            }
        }
    }

    /// Run a reconnection announced by [`MuxEvent::ReconnectScheduled`].
    pub fn execute(&mut self, command: ReconnectCommand) {
        let pending = match self.pending_reconnect.take() {
            Some(pending) if pending.command == command && command.tag() == self.connection_tag => pending,
            other => {
                self.pending_reconnect = other;
                log::trace!("Ignoring stale reconnect command {}", command.tag());
                return;
            }
        };
        if let Err(e) = self.connect(pending.known) {
            self.shutdown(e.response_code(), "Reconnection failed", Some(e));
        }
    }

    /// Close the multiplexer and every channel. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.shutdown(ResponseCode::Ok, "Multiplexer closed", None);
    }

    pub fn poll_event(&mut self) -> Option<MuxEvent<M::State>> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<MuxEvent<M::State>> {
        self.events.drain(..).collect()
    }

    fn is_shut_down(&self) -> bool {
        matches!(self.state, MuxState::Closing | MuxState::Closed)
    }

    fn on_session_event(&mut self, event: SessionEvent<M::Operation, M::State>) -> Result<(), ChannelError> {
        match event {
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::Snapshot {
                document,
                snapshot,
                accessibility,
                last_committed,
                current,
            } => self
                .on_snapshot(&document, snapshot, accessibility, last_committed, current)
                .map_err(|e| e.with_document(&document)),
            SessionEvent::Update {
                document,
                deltas,
                last_committed,
                current,
            } => self
                .on_update(&document, deltas, last_committed, current)
                .map_err(|e| e.with_document(&document)),
            SessionEvent::OpenFinished => self.on_open_finished(),
            SessionEvent::SubmitResult { document, tag, result } => {
                let Some(stacklet) = self.channels.get_mut(&document) else {
                    log::warn!("Submit result for {document}, which has no channel");
                    return Ok(());
                };
                stacklet
                    .on_submit_response(tag, result)
                    .and_then(|()| self.transmit(&document))
                    .map_err(|e| e.with_document(&document))
            }
            SessionEvent::Exception(e) => Err(e),
            SessionEvent::Closed => {
                self.reconnect();
                Ok(())
            }
        }
    }

    fn on_connected(&mut self) -> Result<(), ChannelError> {
        log::info!("Session {} connected for {}", self.connection_tag, self.collection);
        self.connection = ConnectionState::Connected;
        for (document, v0) in std::mem::take(&mut self.pending_local) {
            self.connect_local(&document, v0)?;
        }
        Ok(())
    }

    /// Connect a locally created channel with a faked version-zero snapshot.
    fn connect_local(&mut self, document: &DocumentId, v0: VersionSignature) -> Result<(), ChannelError> {
        let Some(stacklet) = self.channels.get_mut(document) else {
            return Ok(());
        };
        stacklet
            .on_snapshot(v0.clone(), Some(v0.clone()), Some(v0))
            .and_then(|()| self.transmit(document))
            .map_err(|e| e.with_document(document))
    }

    fn on_snapshot(
        &mut self,
        document: &DocumentId,
        snapshot: Snapshot<M::State>,
        accessibility: Option<Accessibility>,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    ) -> Result<(), ChannelError> {
        self.mark_seen(document);
        let version = snapshot.version.clone();
        match self.channels.get(document).map(Stacklet::expecting_snapshot) {
            Some(true) => {}
            existing => {
                if existing.is_some() {
                    log::info!("Server replaced {document} with a snapshot at {version}");
                    self.remove_channel(document);
                }
                let last_commit = last_committed.as_ref().map_or(0, VersionSignature::version);
                self.add_channel(
                    document.clone(),
                    snapshot,
                    last_commit,
                    accessibility.unwrap_or_default(),
                    false,
                )?;
            }
        }
        let stacklet = self.channels.get_mut(document).ok_or(ChannelError::UnknownDocument)?;
        stacklet.on_snapshot(version, last_committed, current)?;
        self.transmit(document)
    }

    fn on_update(
        &mut self,
        document: &DocumentId,
        deltas: Vec<TransformedDelta<M::Operation>>,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    ) -> Result<(), ChannelError> {
        self.mark_seen(document);
        // Any delta, even an empty resync, shows the connection works.
        if !deltas.is_empty() {
            self.scheduler.reset();
        }
        let Some(stacklet) = self.channels.get_mut(document) else {
            log::warn!("Dropping update for {document}, which has no channel");
            return Ok(());
        };
        stacklet.on_update(deltas, last_committed, current)?;
        self.transmit(document)
    }

    fn on_open_finished(&mut self) -> Result<(), ChannelError> {
        let missing = self
            .missing
            .take()
            .ok_or_else(|| ChannelError::protocol("Open finished twice in one session"))?;

        let mut lost = Vec::new();
        for document in missing {
            let from_zero = self
                .expected
                .get(&document)
                .and_then(|versions| versions.first())
                .is_some_and(|first| first.version() == 0);
            if !from_zero {
                lost.push(document);
                continue;
            }
            // The server has never seen this document; resubmit from version zero.
            let name = DocumentName::new(self.collection.clone(), document.clone());
            let v0 = self.versions.version_zero(&name);
            let stacklet = self
                .channels
                .get_mut(&document)
                .ok_or_else(|| ChannelError::protocol(format!("No channel to resync {document}")))?;
            log::debug!("Faking version zero resync for {document}");
            stacklet
                .on_update(vec![TransformedDelta::resync(v0.clone())], Some(v0.clone()), Some(v0))
                .and_then(|()| self.transmit(&document))
                .map_err(|e| e.with_document(&document))?;
        }

        if !lost.is_empty() {
            return Err(ChannelError::AccessLost(lost));
        }
        if !self.open_finished {
            self.open_finished = true;
            self.state = MuxState::Open;
            self.events.push_back(MuxEvent::OpenFinished);
        }
        Ok(())
    }

    fn mark_seen(&mut self, document: &DocumentId) {
        if let Some(missing) = self.missing.as_mut() {
            missing.remove(document);
        }
    }

    /// Pass a document's ready submission to the session and surface
    /// received operations.
    fn transmit(&mut self, document: &DocumentId) -> Result<(), ChannelError> {
        let Some(stacklet) = self.channels.get_mut(document) else {
            return Ok(());
        };
        if stacklet.channel.take_received() {
            self.events.push_back(MuxEvent::OperationsReceived {
                document: document.clone(),
            });
        }
        if let Some(submission) = stacklet.sequencer.take_submission() {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| ChannelError::protocol("Submission with no session"))?;
            session.submit_delta(&mut self.service, document.clone(), submission.delta, submission.tag)?;
        }
        Ok(())
    }

    fn add_channel(
        &mut self,
        document: DocumentId,
        snapshot: Snapshot<M::State>,
        last_commit_version: u64,
        accessibility: Accessibility,
        drop_additional_snapshot: bool,
    ) -> Result<(), ChannelError> {
        if self.channels.contains_key(&document) {
            return Err(ChannelError::protocol(format!("Duplicate channel for {document}")));
        }
        let mut cc = ReconciliationCore::new(self.participant.clone(), snapshot.version.clone(), last_commit_version);
        if let Some(factory) = self.unsaved.as_mut() {
            cc.set_unsaved_listener(Some(factory.create(&document)));
        }
        let mut stacklet = Stacklet::new(
            OperationChannel::new(document.clone(), cc, accessibility),
            self.tag_floor,
            drop_additional_snapshot,
        );
        stacklet.reset();
        self.channels.insert(document.clone(), stacklet);
        log::debug!("Channel created for {document} at {}", snapshot.version);

        self.events.push_back(MuxEvent::ChannelCreated {
            document,
            snapshot,
            accessibility,
        });
        Ok(())
    }

    fn remove_channel(&mut self, document: &DocumentId) {
        if let Some(mut stacklet) = self.channels.remove(document) {
            self.tag_floor = self.tag_floor.max(stacklet.sequencer.connection_tag());
            stacklet.close();
            if let Some(factory) = self.unsaved.as_mut() {
                factory.destroy(document);
            }
            self.pending_local.retain(|(pending, _)| pending != document);
            self.events.push_back(MuxEvent::ChannelRemoved {
                document: document.clone(),
            });
        }
    }

    fn connect(&mut self, mut known: BTreeMap<DocumentId, Vec<VersionSignature>>) -> Result<(), ChannelError> {
        self.check_connect_versions(&mut known)?;
        let mut session = WireSession::new(self.connection_tag, self.collection.clone());
        self.expected = known.clone();
        self.missing = Some(known.keys().cloned().collect());
        session.open(&mut self.service, self.filter.clone(), known)?;
        self.session = Some(session);
        Ok(())
    }

    /// Reconnect versions must be strictly increasing. Filtered ids are dropped.
    fn check_connect_versions(&self, known: &mut BTreeMap<DocumentId, Vec<VersionSignature>>) -> Result<(), ChannelError> {
        let filter = &self.filter;
        known.retain(|document, _| {
            let accepted = filter.accepts(document);
            if !accepted {
                log::error!("Dropping resync versions for filtered document {document}");
            }
            accepted
        });
        for (document, versions) in known.iter() {
            if versions.windows(2).any(|pair| pair[1].version() <= pair[0].version()) {
                return Err(ChannelError::protocol(format!(
                    "Invalid reconnect versions for {document}: {versions:?}"
                )));
            }
        }
        Ok(())
    }

    fn on_channel_exception(&mut self, error: ChannelError) {
        if self.is_shut_down() {
            log::trace!("Ignoring failure after shutdown: {error}");
            return;
        }
        if error.is_recoverable() {
            log::warn!("Recoverable failure on {}, reconnecting: {error}", self.collection);
            self.reconnect();
        } else {
            self.shutdown(error.response_code(), "Channel exception", Some(error));
        }
    }

    /// Replace the session, keeping every channel.
    fn reconnect(&mut self) {
        if self.is_shut_down() {
            return;
        }
        log::info!("Session {} for {} lost, reconnecting", self.connection_tag, self.collection);
        self.connection = ConnectionState::Reconnecting;

        let mut known = BTreeMap::new();
        for (document, stacklet) in self.channels.iter_mut() {
            stacklet.reset();
            if !stacklet.channel.accessibility().is_readable() {
                continue;
            }
            match stacklet.channel.reconnect_versions() {
                Ok(versions) => {
                    known.insert(document.clone(), versions);
                }
                Err(e) => log::warn!("No reconnect versions for {document}: {e}"),
            }
        }

        self.connection_tag += 1;
        self.close_session();

        let command = ReconnectCommand {
            tag: self.connection_tag,
        };
        match self.scheduler.schedule() {
            Some(delay) if delay.is_zero() => {
                if let Err(e) = self.connect(known) {
                    self.shutdown(e.response_code(), "Reconnection failed", Some(e));
                }
            }
            Some(delay) => {
                log::debug!("Reconnecting {} in {delay:?}", self.collection);
                self.pending_reconnect = Some(PendingReconnect { command, known });
                self.events.push_back(MuxEvent::ReconnectScheduled { command, delay });
            }
            None => {
                let e = ChannelError::ReconnectAbandoned {
                    attempts: self.scheduler.attempts(),
                };
                self.shutdown(e.response_code(), "Reconnection abandoned", Some(e));
            }
        }
    }

    fn close_session(&mut self) {
        self.missing = None;
        if let Some(mut session) = self.session.take() {
            // The session's own Closed event is moot; the tag has moved on.
            let _ = session.close(&mut self.service);
        }
    }

    /// Shut down permanently. Only the first call has any effect.
    fn shutdown(&mut self, code: ResponseCode, description: &str, cause: Option<ChannelError>) {
        if self.is_shut_down() {
            return;
        }
        self.state = MuxState::Closing;
        let notify = code != ResponseCode::Ok;
        match &cause {
            Some(cause) if notify => log::error!("{description} on {}: {cause}", self.collection),
            _ if notify => log::error!("{description} on {}", self.collection),
            _ => log::info!("{description}: {}", self.collection),
        }

        self.connection_tag += 1;
        self.connection = ConnectionState::Disconnected;
        for (_, mut stacklet) in self.channels.drain() {
            stacklet.close();
        }
        self.pending_local.clear();
        self.pending_reconnect = None;
        self.close_session();

        if notify {
            self.events
                .push_back(MuxEvent::Failed(CorruptionDetail::new(code, description, cause)));
        }
        self.state = MuxState::Closed;
    }
}

impl<M, W, S> fmt::Debug for Multiplexer<M, W, S>
where
    M: DocumentModel,
    W: WaveService<M::Operation, M::State>,
    S: Scheduler,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("collection", &self.collection)
            .field("state", &self.state)
            .field("connection", &self.connection)
            .field("connection_tag", &self.connection_tag)
            .field("documents", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}
