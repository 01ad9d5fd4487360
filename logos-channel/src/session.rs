//! Wire session: one logical server connection for a whole collection.
//!
//! The session is a state machine over an injected [`WaveService`]
//! transport. Transport callbacks are fed in through [`WireSession::handle`],
//! which returns the resulting [`SessionEvent`]s in delivery order.
//!
//! ```text
//! Initial ──open──► Connecting ──channel id──► Connected
//!    │                  │                          │
//!    │                close                     close/fault
//!    │                  ▼                          │
//!    │               Closing ──channel id/end──►   │
//!    └───────────────────────────────────────► Closed
//! ```
//!
//! A session supports exactly one open/close cycle.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::delta::{ClientDelta, TransformedDelta};
use crate::error::ChannelError;
use crate::id::{CollectionId, DocumentId, DocumentName, IdFilter};
use crate::model::{Accessibility, Snapshot};
use crate::protocol::{CloseRequest, OpenRequest, ServiceMessage, SubmitRequest, SubmitResponse, ViewUpdate};
use crate::version::VersionSignature;

/// Identifies one session instance; echoed back with every transport callback.
pub type SessionId = u64;

/// The RPC transport a session talks through.
pub trait WaveService<O, S> {
    fn open(&mut self, session: SessionId, request: OpenRequest);
    fn submit(&mut self, session: SessionId, request: SubmitRequest<O>);
    fn close(&mut self, session: SessionId, request: CloseRequest);
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Events a session delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent<O, S> {
    /// The transport is established.
    Connected,
    Snapshot {
        document: DocumentId,
        snapshot: Snapshot<S>,
        accessibility: Option<Accessibility>,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    },
    Update {
        document: DocumentId,
        deltas: Vec<TransformedDelta<O>>,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    },
    /// Every known document has been accounted for.
    OpenFinished,
    SubmitResult {
        document: DocumentId,
        tag: u32,
        result: Result<SubmitResponse, String>,
    },
    Exception(ChannelError),
    Closed,
}

/// Client side of one view of a collection.
#[derive(Debug)]
pub struct WireSession<O, S> {
    id: SessionId,
    collection: CollectionId,
    state: SessionState,
    channel_id: Option<String>,
    /// Connection tags of submissions awaiting a result, per document.
    submits: HashMap<DocumentId, VecDeque<u32>>,
    /// Whether the owner still expects a `Closed` event.
    listening: bool,
    _marker: std::marker::PhantomData<fn() -> (O, S)>,
}

impl<O, S> WireSession<O, S> {
    pub fn new(id: SessionId, collection: CollectionId) -> Self {
        Self {
            id,
            collection,
            state: SessionState::Initial,
            channel_id: None,
            submits: HashMap::new(),
            listening: false,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    /// Open the view. Valid once, from `Initial`.
    pub fn open<W: WaveService<O, S>>(
        &mut self,
        service: &mut W,
        filter: IdFilter,
        known: BTreeMap<DocumentId, Vec<VersionSignature>>,
    ) -> Result<(), ChannelError> {
        if self.state != SessionState::Initial {
            return Err(ChannelError::protocol(format!(
                "Cannot open session {} in state {:?}",
                self.id, self.state
            )));
        }
        log::debug!("Opening session {} on {}", self.id, self.collection);
        self.state = SessionState::Connecting;
        self.listening = true;
        service.open(
            self.id,
            OpenRequest {
                collection: self.collection.clone(),
                filter,
                known,
            },
        );
        Ok(())
    }

    /// Submit one delta. `tag` is returned with the result.
    pub fn submit_delta<W: WaveService<O, S>>(
        &mut self,
        service: &mut W,
        document: DocumentId,
        delta: ClientDelta<O>,
        tag: u32,
    ) -> Result<(), ChannelError> {
        let channel_id = match (&self.state, &self.channel_id) {
            (SessionState::Connected, Some(id)) => id.clone(),
            _ => {
                return Err(ChannelError::protocol(format!(
                    "Cannot submit on session {} in state {:?}",
                    self.id, self.state
                )))
            }
        };
        self.submits.entry(document.clone()).or_default().push_back(tag);
        service.submit(
            self.id,
            SubmitRequest {
                name: DocumentName::new(self.collection.clone(), document),
                delta,
                channel_id,
            },
        );
        Ok(())
    }

    /// Close the session. `Closed` is delivered now if the server channel is
    /// known, otherwise once the open completes.
    pub fn close<W: WaveService<O, S>>(&mut self, service: &mut W) -> Vec<SessionEvent<O, S>> {
        let mut events = Vec::new();
        self.terminate(service, &mut events);
        events
    }

    /// Feed one transport callback through the state machine.
    pub fn handle<W: WaveService<O, S>>(
        &mut self,
        service: &mut W,
        message: ServiceMessage<O, S>,
    ) -> Vec<SessionEvent<O, S>> {
        let mut events = Vec::new();
        match message {
            ServiceMessage::Update(update) => self.on_update(service, update, &mut events),
            ServiceMessage::OpenFinished { error } => self.on_open_finished(service, error, &mut events),
            ServiceMessage::OpenFailed(reason) => {
                log::warn!("Session {} open failed: {reason}", self.id);
                self.on_open_ended(service, &mut events);
            }
            ServiceMessage::SubmitSucceeded { document, response } => {
                self.on_submit_result(document, Ok(response), &mut events)
            }
            ServiceMessage::SubmitFailed { document, reason } => {
                self.on_submit_result(document, Err(reason), &mut events)
            }
            ServiceMessage::Exception(error) => {
                if self.state != SessionState::Closed {
                    events.push(SessionEvent::Exception(error));
                    self.terminate(service, &mut events);
                }
            }
        }
        events
    }

    fn on_update<W: WaveService<O, S>>(
        &mut self,
        service: &mut W,
        update: ViewUpdate<O, S>,
        events: &mut Vec<SessionEvent<O, S>>,
    ) {
        if let Err(e) = update.check_restrictions() {
            let e = match &update.document {
                Some(document) => e.with_document(document),
                None => e,
            };
            events.push(SessionEvent::Exception(e));
            self.terminate(service, events);
            return;
        }

        match self.state {
            SessionState::Initial => {
                log::error!("Session {} received an update before open", self.id);
            }
            SessionState::Connecting => match update.channel_id {
                Some(channel_id) => {
                    log::debug!("Session {} connected on channel {channel_id}", self.id);
                    self.channel_id = Some(channel_id);
                    self.state = SessionState::Connected;
                    events.push(SessionEvent::Connected);
                }
                None => {
                    events.push(SessionEvent::Exception(ChannelError::protocol(
                        "First update did not contain a channel id",
                    )));
                    self.terminate(service, events);
                }
            },
            SessionState::Connected => self.deliver_update(update, events),
            SessionState::Closing => {
                match update.channel_id {
                    Some(channel_id) => {
                        self.channel_id = Some(channel_id);
                        self.request_close(service);
                    }
                    None => {
                        log::warn!("Session {} closing without a channel id", self.id);
                    }
                }
                self.finish_close(events);
            }
            SessionState::Closed => {
                log::trace!("Session {} dropping update after close", self.id);
            }
        }
    }

    fn deliver_update(&mut self, update: ViewUpdate<O, S>, events: &mut Vec<SessionEvent<O, S>>) {
        if let Some(channel_id) = &update.channel_id {
            log::trace!("Session {} ignoring repeated channel id {channel_id}", self.id);
            return;
        }
        let ViewUpdate {
            document,
            snapshot,
            accessibility,
            deltas,
            last_committed,
            current,
            marker,
            ..
        } = update;

        if let Some(document) = document {
            if let Some(snapshot) = snapshot {
                events.push(SessionEvent::Snapshot {
                    document,
                    snapshot,
                    accessibility,
                    last_committed,
                    current,
                });
            } else if !deltas.is_empty() || last_committed.is_some() || current.is_some() {
                events.push(SessionEvent::Update {
                    document,
                    deltas,
                    last_committed,
                    current,
                });
            }
        }
        if marker {
            events.push(SessionEvent::OpenFinished);
        }
    }

    fn on_open_finished<W: WaveService<O, S>>(
        &mut self,
        service: &mut W,
        error: Option<String>,
        events: &mut Vec<SessionEvent<O, S>>,
    ) {
        match (self.state, error) {
            (SessionState::Connecting | SessionState::Connected, Some(error)) => {
                events.push(SessionEvent::Exception(ChannelError::protocol(format!(
                    "Server closed the view with error: {error}"
                ))));
                self.on_open_ended(service, events);
            }
            _ => self.on_open_ended(service, events),
        }
    }

    fn on_open_ended<W: WaveService<O, S>>(&mut self, service: &mut W, events: &mut Vec<SessionEvent<O, S>>) {
        match self.state {
            // No channel id ever arrived, so there is nothing to close server-side.
            SessionState::Connecting | SessionState::Closing => self.finish_close(events),
            SessionState::Connected => self.terminate(service, events),
            SessionState::Initial | SessionState::Closed => {}
        }
    }

    fn on_submit_result(
        &mut self,
        document: DocumentId,
        result: Result<SubmitResponse, String>,
        events: &mut Vec<SessionEvent<O, S>>,
    ) {
        // Results for one document arrive in submission order.
        match self.submits.get_mut(&document).and_then(VecDeque::pop_front) {
            Some(tag) => events.push(SessionEvent::SubmitResult { document, tag, result }),
            None => log::warn!("Session {} got a submit result for {document} with nothing in flight", self.id),
        }
    }

    fn terminate<W: WaveService<O, S>>(&mut self, service: &mut W, events: &mut Vec<SessionEvent<O, S>>) {
        match self.state {
            SessionState::Closed | SessionState::Closing => {}
            SessionState::Initial => self.state = SessionState::Closed,
            SessionState::Connecting | SessionState::Connected => {
                if self.channel_id.is_some() {
                    self.request_close(service);
                    self.finish_close(events);
                } else {
                    log::debug!("Session {} closing before its channel id is known", self.id);
                    self.state = SessionState::Closing;
                }
            }
        }
    }

    fn request_close<W: WaveService<O, S>>(&mut self, service: &mut W) {
        if let Some(channel_id) = &self.channel_id {
            service.close(
                self.id,
                CloseRequest {
                    collection: self.collection.clone(),
                    channel_id: channel_id.clone(),
                },
            );
        }
    }

    fn finish_close(&mut self, events: &mut Vec<SessionEvent<O, S>>) {
        self.state = SessionState::Closed;
        self.submits.clear();
        if std::mem::take(&mut self.listening) {
            log::debug!("Session {} closed", self.id);
            events.push(SessionEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResponseCode;
    use crate::test_support::*;

    #[derive(Default)]
    struct Recorder {
        opens: Vec<OpenRequest>,
        submits: Vec<SubmitRequest<TextOp>>,
        closes: Vec<CloseRequest>,
    }

    impl WaveService<TextOp, String> for Recorder {
        fn open(&mut self, _session: SessionId, request: OpenRequest) {
            self.opens.push(request);
        }
        fn submit(&mut self, _session: SessionId, request: SubmitRequest<TextOp>) {
            self.submits.push(request);
        }
        fn close(&mut self, _session: SessionId, request: CloseRequest) {
            self.closes.push(request);
        }
    }

    type Session = WireSession<TextOp, String>;
    type Update = ViewUpdate<TextOp, String>;

    fn doc() -> DocumentId {
        DocumentId::new("conv+root")
    }

    fn opened() -> (Session, Recorder) {
        let mut service = Recorder::default();
        let mut session = Session::new(1, CollectionId::new("w+1"));
        session.open(&mut service, IdFilter::all(), BTreeMap::new()).unwrap();
        (session, service)
    }

    fn connected() -> (Session, Recorder) {
        let (mut session, mut service) = opened();
        let events = session.handle(&mut service, ServiceMessage::Update(Update::channel("ch1")));
        assert_eq!(events, vec![SessionEvent::Connected]);
        (session, service)
    }

    #[test]
    fn test_open_twice_fails() {
        let (mut session, mut service) = opened();
        assert!(session.open(&mut service, IdFilter::all(), BTreeMap::new()).is_err());
        assert_eq!(service.opens.len(), 1);
    }

    #[test]
    fn test_first_update_must_carry_channel_id() {
        let (mut session, mut service) = opened();
        let update = Update::deltas(doc(), vec![server_delta(1, 1)], Some(sig(1)));

        let events = session.handle(&mut service, ServiceMessage::Update(update));

        assert!(matches!(events[0], SessionEvent::Exception(_)));
        // No channel id yet, so the close is deferred.
        assert_eq!(session.state(), SessionState::Closing);
        assert!(service.closes.is_empty());
    }

    #[test]
    fn test_snapshot_update_and_marker_delivery() {
        let (mut session, mut service) = connected();

        let snapshot = Update::snapshot(doc(), Snapshot::new("hi".to_string(), sig(4)), sig(3));
        let events = session.handle(&mut service, ServiceMessage::Update(snapshot));
        assert!(matches!(&events[..], [SessionEvent::Snapshot { document, .. }] if *document == doc()));

        let update = Update::deltas(doc(), vec![server_delta(4, 2)], None);
        let events = session.handle(&mut service, ServiceMessage::Update(update));
        assert!(matches!(&events[..], [SessionEvent::Update { deltas, .. }] if deltas.len() == 1));

        let events = session.handle(&mut service, ServiceMessage::Update(Update::marker()));
        assert_eq!(events, vec![SessionEvent::OpenFinished]);
    }

    #[test]
    fn test_restriction_violation_terminates() {
        let (mut session, mut service) = connected();
        let mut update = Update::snapshot(doc(), Snapshot::new(String::new(), sig(4)), sig(4));
        update.deltas.push(server_delta(4, 1));

        let events = session.handle(&mut service, ServiceMessage::Update(update));

        assert!(matches!(&events[0], SessionEvent::Exception(e) if e.document() == Some(&doc())));
        assert_eq!(events[1], SessionEvent::Closed);
        assert_eq!(service.closes.len(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_submit_requires_connection_and_returns_tag() {
        let (mut session, mut service) = opened();
        assert!(session
            .submit_delta(&mut service, doc(), client_delta(1, 1), 7)
            .is_err());

        let (mut session, mut service) = connected();
        session
            .submit_delta(&mut service, doc(), client_delta(1, 1), 7)
            .unwrap();
        assert_eq!(service.submits[0].channel_id, "ch1");

        let events = session.handle(
            &mut service,
            ServiceMessage::SubmitSucceeded {
                document: doc(),
                response: SubmitResponse::ok(1, sig(2)),
            },
        );
        assert_eq!(
            events,
            vec![SessionEvent::SubmitResult {
                document: doc(),
                tag: 7,
                result: Ok(SubmitResponse::ok(1, sig(2))),
            }]
        );
    }

    #[test]
    fn test_submit_results_keep_their_own_tags() {
        let (mut session, mut service) = connected();
        session.submit_delta(&mut service, doc(), client_delta(1, 1), 1).unwrap();
        session.submit_delta(&mut service, doc(), client_delta(20, 1), 2).unwrap();

        let tags: Vec<u32> = [6, 21]
            .into_iter()
            .flat_map(|version| {
                session.handle(
                    &mut service,
                    ServiceMessage::SubmitSucceeded {
                        document: doc(),
                        response: SubmitResponse::ok(1, sig(version)),
                    },
                )
            })
            .map(|event| match event {
                SessionEvent::SubmitResult { tag, .. } => tag,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(tags, vec![1, 2]);
    }

    #[test]
    fn test_close_when_connected_is_synchronous() {
        let (mut session, mut service) = connected();
        let events = session.close(&mut service);

        assert_eq!(events, vec![SessionEvent::Closed]);
        assert_eq!(service.closes[0].channel_id, "ch1");
        assert!(session.close(&mut service).is_empty());
    }

    #[test]
    fn test_close_while_connecting_waits_for_channel_id() {
        let (mut session, mut service) = opened();
        assert!(session.close(&mut service).is_empty());
        assert_eq!(session.state(), SessionState::Closing);

        let events = session.handle(&mut service, ServiceMessage::Update(Update::channel("ch9")));

        assert_eq!(events, vec![SessionEvent::Closed]);
        assert_eq!(service.closes[0].channel_id, "ch9");
    }

    #[test]
    fn test_open_stream_error_is_exception() {
        let (mut session, mut service) = connected();
        let events = session.handle(
            &mut service,
            ServiceMessage::OpenFinished {
                error: Some("boom".into()),
            },
        );
        assert!(matches!(&events[0], SessionEvent::Exception(e) if !e.is_recoverable()));
        assert_eq!(events[1], SessionEvent::Closed);
    }

    #[test]
    fn test_open_failure_closes_without_exception() {
        let (mut session, mut service) = connected();
        let events = session.handle(&mut service, ServiceMessage::OpenFailed("reset".into()));
        assert_eq!(events, vec![SessionEvent::Closed]);
    }

    #[test]
    fn test_open_failure_before_channel_id_closes() {
        let (mut session, mut service) = opened();
        let events = session.handle(&mut service, ServiceMessage::OpenFailed("refused".into()));

        assert_eq!(events, vec![SessionEvent::Closed]);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(service.closes.is_empty());
    }

    #[test]
    fn test_messages_after_close_are_dropped() {
        let (mut session, mut service) = connected();
        session.close(&mut service);

        let events = session.handle(&mut service, ServiceMessage::Update(Update::marker()));
        assert!(events.is_empty());
        let events = session.handle(
            &mut service,
            ServiceMessage::SubmitSucceeded {
                document: doc(),
                response: SubmitResponse::failed(ResponseCode::TooOld, "old"),
            },
        );
        assert!(events.is_empty());
    }
}
