//! Per-document delta sequencer.
//!
//! Interleaves the one outstanding local submission with the stream of
//! server deltas and commit notices, so the consumer sees every event in
//! strict version order:
//!
//! ```text
//!   server deltas ─┐
//!   commit notices ─┼─► sorted queue ─► flush while head.start == last ─► events
//!   submit results ─┘        (start, end)
//! ```
//!
//! Every queued message covers a version range `[start, end)`. A message can
//! be delivered once everything before `start` has been delivered. The only
//! legal hole in the queue is at its head, where the server may have applied
//! the in-flight submission before deltas we have already received; it can be
//! at most as large as that submission.

use std::collections::VecDeque;

use crate::delta::{ClientDelta, TransformedDelta};
use crate::error::{ChannelError, ResponseCode};
use crate::protocol::SubmitResponse;
use crate::version::VersionSignature;

/// Ordered events delivered to the sequencer's consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencerEvent<O> {
    /// Connected at `connect`; the server is currently at `current`.
    Connection {
        connect: VersionSignature,
        current: VersionSignature,
    },
    Delta(TransformedDelta<O>),
    Ack {
        ops_applied: u32,
        version: VersionSignature,
    },
    Nack {
        code: ResponseCode,
        message: String,
        version: u64,
    },
    Commit(u64),
}

/// A delta ready to be handed to the wire session.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission<O> {
    pub delta: ClientDelta<O>,
    /// Connection tag the response must carry to be accepted.
    pub tag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Initial,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
enum ServerMessage<O> {
    Delta(TransformedDelta<O>),
    Commit { sequence: u64, committed: u64 },
    Ack { ops_applied: u32, version: VersionSignature },
    Nack { sequence: u64, code: ResponseCode, message: String },
}

impl<O> ServerMessage<O> {
    fn start_version(&self) -> u64 {
        match self {
            Self::Delta(delta) => delta.applied_at_version(),
            Self::Commit { sequence, .. } | Self::Nack { sequence, .. } => *sequence,
            Self::Ack { ops_applied, version } => version.version() - u64::from(*ops_applied),
        }
    }

    fn end_version(&self) -> u64 {
        match self {
            Self::Delta(delta) => delta.applied_at_version() + delta.len() as u64,
            Self::Commit { sequence, .. } | Self::Nack { sequence, .. } => *sequence,
            Self::Ack { version, .. } => version.version(),
        }
    }

    fn key(&self) -> (u64, u64) {
        (self.start_version(), self.end_version())
    }

    fn into_event(self) -> SequencerEvent<O> {
        match self {
            Self::Delta(delta) => SequencerEvent::Delta(delta),
            Self::Commit { committed, .. } => SequencerEvent::Commit(committed),
            Self::Ack { ops_applied, version } => SequencerEvent::Ack { ops_applied, version },
            Self::Nack { sequence, code, message } => SequencerEvent::Nack {
                code,
                message,
                version: sequence,
            },
        }
    }
}

/// Orders server messages and local submissions for one document.
#[derive(Debug)]
pub struct DeltaSequencer<O> {
    state: SequencerState,
    connection_tag: u32,
    /// Delta waiting for the queue to drain before it can be transmitted.
    unsent: Option<ClientDelta<O>>,
    /// Op count of the transmitted, unanswered delta.
    in_flight: Option<usize>,
    outgoing: Option<Submission<O>>,
    last_server_version: u64,
    last_acked: Option<VersionSignature>,
    queue: VecDeque<ServerMessage<O>>,
    /// Events are dropped while no consumer is attached.
    attached: bool,
}

impl<O> Default for DeltaSequencer<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> DeltaSequencer<O> {
    pub fn new() -> Self {
        Self {
            state: SequencerState::Initial,
            connection_tag: 0,
            unsent: None,
            in_flight: None,
            outgoing: None,
            last_server_version: 0,
            last_acked: None,
            queue: VecDeque::new(),
            attached: false,
        }
    }

    /// A sequencer whose first connection gets a tag above `floor`.
    ///
    /// Tags must not repeat for a document, or a response meant for a
    /// replaced sequencer would be accepted by its successor.
    pub fn with_tag_floor(floor: u32) -> Self {
        Self {
            connection_tag: floor,
            ..Self::new()
        }
    }

    /// Return to the initial state and (re)attach the consumer.
    pub fn reset(&mut self) {
        self.clear();
        self.attached = true;
    }

    /// Return to the initial state and drop all future events.
    pub fn detach(&mut self) {
        self.clear();
        self.attached = false;
    }

    fn clear(&mut self) {
        self.state = SequencerState::Initial;
        self.unsent = None;
        self.in_flight = None;
        self.outgoing = None;
        self.last_server_version = 0;
        self.queue.clear();
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn connection_tag(&self) -> u32 {
        self.connection_tag
    }

    pub fn last_server_version(&self) -> Option<u64> {
        (self.state == SequencerState::Connected).then_some(self.last_server_version)
    }

    pub fn last_acked_version(&self) -> Option<&VersionSignature> {
        self.last_acked.as_ref()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Queue a delta for transmission. Only one may be outstanding.
    pub fn submit(&mut self, delta: ClientDelta<O>) -> Result<(), ChannelError> {
        if self.state != SequencerState::Connected {
            return Err(ChannelError::protocol("Cannot submit a delta before the channel is connected"));
        }
        if self.unsent.is_some() || self.in_flight.is_some() {
            return Err(ChannelError::SubmissionPending);
        }
        self.unsent = Some(delta);
        self.try_transmit();
        Ok(())
    }

    /// The delta the wire session should send now, if any.
    pub fn take_submission(&mut self) -> Option<Submission<O>> {
        self.outgoing.take()
    }

    /// First message for a document: a full snapshot at `version`.
    pub fn on_snapshot(
        &mut self,
        version: VersionSignature,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    ) -> Result<Vec<SequencerEvent<O>>, ChannelError> {
        if self.state != SequencerState::Initial {
            return Err(ChannelError::protocol(format!(
                "Unexpected snapshot at {version} on a connected channel"
            )));
        }
        let mut events = Vec::new();
        self.process_connect(version, last_committed, current, &mut events)?;
        Ok(events)
    }

    /// Deltas and/or a commit notice.
    ///
    /// Before connection, the first delta must be the empty resync delta
    /// naming the version to connect at.
    pub fn on_update(
        &mut self,
        deltas: Vec<TransformedDelta<O>>,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
    ) -> Result<Vec<SequencerEvent<O>>, ChannelError> {
        let mut events = Vec::new();
        match self.state {
            SequencerState::Initial => {
                let mut deltas = deltas.into_iter();
                let first = deltas
                    .next()
                    .ok_or_else(|| ChannelError::protocol("Connect update has no deltas"))?;
                if !first.is_empty() {
                    return Err(ChannelError::protocol(format!(
                        "Connect update starts with a non-empty delta at {}",
                        first.applied_at_version()
                    )));
                }
                let connect = VersionSignature::new(
                    first.applied_at_version(),
                    first.resulting_version().hash().to_vec(),
                );
                self.process_connect(connect, last_committed, current, &mut events)?;
                let rest: Vec<_> = deltas.collect();
                if !rest.is_empty() {
                    self.process_deltas(rest, None, &mut events)?;
                }
            }
            SequencerState::Connected => {
                if deltas.is_empty() && last_committed.is_none() {
                    return Err(ChannelError::protocol("Update has neither deltas nor a committed version"));
                }
                self.process_deltas(deltas, last_committed, &mut events)?;
            }
        }
        Ok(events)
    }

    /// Result of the submission transmitted under `tag`.
    pub fn on_submit_response(
        &mut self,
        tag: u32,
        result: Result<SubmitResponse, String>,
    ) -> Result<Vec<SequencerEvent<O>>, ChannelError> {
        if self.state != SequencerState::Connected || tag != self.connection_tag || self.in_flight.is_none() {
            log::trace!(
                "Dropping submit response for tag {tag}, current tag {} in {:?}, in flight {:?}",
                self.connection_tag,
                self.state,
                self.in_flight
            );
            return Ok(Vec::new());
        }
        let response = result.map_err(ChannelError::SubmitFailed)?;
        let code = response.effective_code();
        let message = response.error.clone().unwrap_or_default();

        let mut response_start = self.last_server_version;
        if response.ops_applied > 0 || code == ResponseCode::Ok {
            // Fewer ops than submitted is legal: the server may transform ops away.
            let version = response
                .version
                .ok_or_else(|| ChannelError::protocol("Ack without a resulting version"))?;
            if u64::from(response.ops_applied) > version.version() {
                return Err(ChannelError::protocol(format!(
                    "Ack of {} ops at version {version}",
                    response.ops_applied
                )));
            }
            response_start = version.version() - u64::from(response.ops_applied);
            self.last_acked = Some(version.clone());
            self.on_server_message(ServerMessage::Ack {
                ops_applied: response.ops_applied,
                version,
            })?;
        }

        if code == ResponseCode::TooOld {
            return Err(ChannelError::Nack { code, message });
        } else if code != ResponseCode::Ok {
            let sequence = if response.ops_applied > 0 {
                self.last_acked
                    .as_ref()
                    .map_or(self.last_server_version, VersionSignature::version)
            } else {
                self.last_server_version
            };
            response_start = sequence;
            self.on_server_message(ServerMessage::Nack { sequence, code, message })?;
        }

        self.in_flight = None;
        let mut events = Vec::new();
        self.flush(&mut events);

        if let Some(head) = self.queue.front() {
            if head.start_version() != response_start {
                return Err(ChannelError::VersionGap {
                    expected: self.last_server_version,
                    received: head.start_version(),
                });
            }
        }
        Ok(events)
    }

    fn process_connect(
        &mut self,
        connect: VersionSignature,
        last_committed: Option<VersionSignature>,
        current: Option<VersionSignature>,
        events: &mut Vec<SequencerEvent<O>>,
    ) -> Result<(), ChannelError> {
        let last_committed = last_committed
            .ok_or_else(|| ChannelError::protocol("Connect message lacks a committed version"))?;
        self.state = SequencerState::Connected;
        self.connection_tag = self.connection_tag.wrapping_add(1);
        self.last_server_version = connect.version();
        log::debug!("Sequencer connected at {connect}, tag {}", self.connection_tag);

        if self.attached {
            let current = current.unwrap_or_else(|| connect.clone());
            events.push(SequencerEvent::Connection { connect, current });
        }
        self.process_last_committed(Some(last_committed))?;
        self.flush(events);
        Ok(())
    }

    fn process_deltas(
        &mut self,
        deltas: Vec<TransformedDelta<O>>,
        last_committed: Option<VersionSignature>,
        events: &mut Vec<SequencerEvent<O>>,
    ) -> Result<(), ChannelError> {
        for delta in deltas {
            let pos = self.on_server_message(ServerMessage::Delta(delta))?;
            self.check_for_missing(pos)?;
        }
        self.process_last_committed(last_committed)?;
        self.flush(events);
        Ok(())
    }

    fn process_last_committed(&mut self, committed: Option<VersionSignature>) -> Result<(), ChannelError> {
        if let Some(committed) = committed {
            // A commit at or below the delivered version has no ordering dependency.
            let sequence = committed.version().max(self.last_server_version);
            self.on_server_message(ServerMessage::Commit {
                sequence,
                committed: committed.version(),
            })?;
        }
        Ok(())
    }

    /// Insert a message in (start, end) order; returns its queue position.
    fn on_server_message(&mut self, message: ServerMessage<O>) -> Result<usize, ChannelError> {
        if message.start_version() < self.last_server_version {
            return Err(ChannelError::OutOfSequence {
                received: message.start_version(),
                last: self.last_server_version,
            });
        }
        let key = message.key();
        let mut pos = self.queue.len();
        while pos > 0 && self.queue[pos - 1].key() > key {
            pos -= 1;
        }
        self.queue.insert(pos, message);
        Ok(pos)
    }

    fn check_for_missing(&self, pos: usize) -> Result<(), ChannelError> {
        let expected = match pos {
            0 => self.last_server_version,
            _ => self.queue[pos - 1].end_version(),
        };
        let received = self.queue[pos].start_version();
        if received > expected {
            let gap = received - expected;
            let covered = pos == 0 && self.in_flight.is_some_and(|len| gap <= len as u64);
            if !covered {
                log::error!(
                    "Message missing: expected version {expected}, received {received}, in flight {:?}",
                    self.in_flight
                );
                return Err(ChannelError::VersionGap { expected, received });
            }
        }
        Ok(())
    }

    fn flush(&mut self, events: &mut Vec<SequencerEvent<O>>) {
        while self
            .queue
            .front()
            .is_some_and(|head| head.start_version() == self.last_server_version)
        {
            let Some(message) = self.queue.pop_front() else { break };
            self.last_server_version = message.end_version();
            if self.attached {
                events.push(message.into_event());
            }
        }
        self.try_transmit();
    }

    fn try_transmit(&mut self) {
        if self.state != SequencerState::Connected || !self.queue.is_empty() || self.in_flight.is_some() {
            return;
        }
        if let Some(delta) = self.unsent.take() {
            self.in_flight = Some(delta.len());
            self.outgoing = Some(Submission {
                delta,
                tag: self.connection_tag,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    fn connected_at(version: u64) -> DeltaSequencer<TextOp> {
        let mut seq = DeltaSequencer::new();
        seq.reset();
        let events = seq.on_snapshot(sig(version), Some(sig(version)), None).unwrap();
        assert_eq!(
            events,
            vec![
                SequencerEvent::Connection {
                    connect: sig(version),
                    current: sig(version),
                },
                SequencerEvent::Commit(version),
            ]
        );
        seq
    }

    /// Submit an `n`-op delta and return its tag.
    fn transmit(seq: &mut DeltaSequencer<TextOp>, target: u64, n: usize) -> u32 {
        seq.submit(client_delta(target, n)).unwrap();
        let submission = seq.take_submission().expect("delta should be transmitted");
        assert_eq!(submission.delta.len(), n);
        submission.tag
    }

    fn ack(n: u32, version: u64) -> Result<SubmitResponse, String> {
        Ok(SubmitResponse::ok(n, sig(version)))
    }

    fn update(seq: &mut DeltaSequencer<TextOp>, deltas: Vec<TransformedDelta<TextOp>>) -> Vec<SequencerEvent<TextOp>> {
        seq.on_update(deltas, None, None).unwrap()
    }

    #[test]
    fn test_connect_via_resync_update() {
        let mut seq = DeltaSequencer::<TextOp>::new();
        seq.reset();

        let events = seq
            .on_update(vec![resync(20), server_delta(20, 2)], Some(sig(18)), Some(sig(22)))
            .unwrap();

        assert_eq!(
            events[0],
            SequencerEvent::Connection {
                connect: sig(20),
                current: sig(22),
            }
        );
        assert_eq!(events[1], SequencerEvent::Commit(18));
        assert_eq!(events[2], SequencerEvent::Delta(server_delta(20, 2)));
        assert_eq!(seq.last_server_version(), Some(22));
    }

    #[test]
    fn test_connect_requires_committed_version() {
        let mut seq = DeltaSequencer::<TextOp>::new();
        seq.reset();
        assert!(seq.on_snapshot(sig(3), None, None).is_err());
    }

    #[test]
    fn test_connect_update_must_start_empty() {
        let mut seq = DeltaSequencer::<TextOp>::new();
        seq.reset();
        assert!(seq.on_update(vec![server_delta(3, 1)], Some(sig(3)), None).is_err());
        assert!(seq.on_update(Vec::new(), Some(sig(3)), None).is_err());
    }

    #[test]
    fn test_second_snapshot_is_rejected() {
        let mut seq = connected_at(3);
        assert!(seq.on_snapshot(sig(5), Some(sig(5)), None).is_err());
    }

    #[test]
    fn test_synchronized_ack() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);

        let events = seq.on_submit_response(tag, ack(1, 11)).unwrap();

        assert_eq!(
            events,
            vec![SequencerEvent::Ack {
                ops_applied: 1,
                version: sig(11),
            }]
        );
        assert_eq!(seq.last_acked_version(), Some(&sig(11)));
        assert!(!seq.has_in_flight());
    }

    #[test]
    fn test_late_ack_after_reflected_deltas() {
        // Server applied our 2 ops at 10, then someone else's delta at 12.
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 2);

        assert!(update(&mut seq, vec![server_delta(12, 3)]).is_empty());
        assert_eq!(seq.queued_messages(), 1);

        let events = seq.on_submit_response(tag, ack(2, 12)).unwrap();
        assert_eq!(
            events,
            vec![
                SequencerEvent::Ack {
                    ops_applied: 2,
                    version: sig(12),
                },
                SequencerEvent::Delta(server_delta(12, 3)),
            ]
        );
        assert_eq!(seq.last_server_version(), Some(15));
    }

    #[test]
    fn test_early_ack_waits_for_preceding_deltas() {
        // Someone else's delta at 10 was applied before ours.
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);

        assert!(seq.on_submit_response(tag, ack(1, 13)).unwrap().is_empty());

        let events = update(&mut seq, vec![server_delta(10, 2)]);
        assert_eq!(
            events,
            vec![
                SequencerEvent::Delta(server_delta(10, 2)),
                SequencerEvent::Ack {
                    ops_applied: 1,
                    version: sig(13),
                },
            ]
        );
    }

    #[test]
    fn test_shrunk_ack_reports_true_count() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 3);

        let events = seq.on_submit_response(tag, ack(1, 11)).unwrap();
        assert_eq!(
            events,
            vec![SequencerEvent::Ack {
                ops_applied: 1,
                version: sig(11),
            }]
        );

        let events = update(&mut seq, vec![server_delta(11, 1)]);
        assert_eq!(events, vec![SequencerEvent::Delta(server_delta(11, 1))]);
    }

    #[test]
    fn test_zero_op_ack_is_delivered() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 2);

        let events = seq.on_submit_response(tag, ack(0, 10)).unwrap();
        assert_eq!(
            events,
            vec![SequencerEvent::Ack {
                ops_applied: 0,
                version: sig(10),
            }]
        );
    }

    #[test]
    fn test_reflected_delta_after_ack_is_fatal() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);
        seq.on_submit_response(tag, ack(1, 11)).unwrap();

        let err = seq
            .on_update(vec![server_delta(10, 1)], None, None)
            .unwrap_err();
        assert_eq!(err, ChannelError::OutOfSequence { received: 10, last: 11 });
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_ack_for_received_delta_is_fatal() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);
        update(&mut seq, vec![server_delta(10, 1)]);

        assert!(seq.on_submit_response(tag, ack(1, 11)).is_err());
    }

    #[test]
    fn test_gap_without_submission_is_fatal() {
        let mut seq = connected_at(10);
        let err = seq.on_update(vec![server_delta(12, 1)], None, None).unwrap_err();
        assert_eq!(err, ChannelError::VersionGap { expected: 10, received: 12 });
    }

    #[test]
    fn test_gap_larger_than_submission_is_fatal() {
        let mut seq = connected_at(10);
        transmit(&mut seq, 10, 1);

        let err = seq.on_update(vec![server_delta(12, 1)], None, None).unwrap_err();
        assert_eq!(err, ChannelError::VersionGap { expected: 10, received: 12 });
    }

    #[test]
    fn test_gap_behind_queued_message_is_fatal() {
        let mut seq = connected_at(10);
        transmit(&mut seq, 10, 2);

        assert!(update(&mut seq, vec![server_delta(11, 1)]).is_empty());
        let err = seq.on_update(vec![server_delta(14, 1)], None, None).unwrap_err();
        assert_eq!(err, ChannelError::VersionGap { expected: 12, received: 14 });
    }

    #[test]
    fn test_commit_is_delivered_immediately_while_waiting() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);
        assert!(update(&mut seq, vec![server_delta(11, 1)]).is_empty());

        // Commit of an already-delivered version jumps the queue.
        let events = seq.on_update(Vec::new(), Some(sig(9)), None).unwrap();
        assert_eq!(events, vec![SequencerEvent::Commit(9)]);

        let events = seq.on_submit_response(tag, ack(1, 11)).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_commit_waits_for_covered_versions() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);

        assert!(seq.on_update(Vec::new(), Some(sig(11)), None).unwrap().is_empty());

        let events = seq.on_submit_response(tag, ack(1, 11)).unwrap();
        assert_eq!(
            events,
            vec![
                SequencerEvent::Ack {
                    ops_applied: 1,
                    version: sig(11),
                },
                SequencerEvent::Commit(11),
            ]
        );
    }

    #[test]
    fn test_only_one_submission_at_a_time() {
        let mut seq = connected_at(10);
        transmit(&mut seq, 10, 1);
        assert_eq!(seq.submit(client_delta(10, 1)), Err(ChannelError::SubmissionPending));
    }

    #[test]
    fn test_transmission_waits_for_queue_to_drain() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);
        update(&mut seq, vec![server_delta(11, 1)]);
        assert_eq!(seq.submit(client_delta(10, 1)), Err(ChannelError::SubmissionPending));

        seq.on_submit_response(tag, ack(1, 11)).unwrap();
        let next = transmit(&mut seq, 12, 1);
        assert_eq!(next, tag);
    }

    #[test]
    fn test_too_old_nack_is_recoverable() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);

        let err = seq
            .on_submit_response(tag, Ok(SubmitResponse::failed(ResponseCode::TooOld, "too old")))
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_nack_is_delivered() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);

        let events = seq
            .on_submit_response(tag, Ok(SubmitResponse::failed(ResponseCode::InvalidOperation, "bad")))
            .unwrap();
        assert_eq!(
            events,
            vec![SequencerEvent::Nack {
                code: ResponseCode::InvalidOperation,
                message: "bad".into(),
                version: 10,
            }]
        );
    }

    #[test]
    fn test_submit_failure_is_recoverable() {
        let mut seq = connected_at(10);
        let tag = transmit(&mut seq, 10, 1);
        let err = seq.on_submit_response(tag, Err("connection reset".into())).unwrap_err();
        assert_eq!(err, ChannelError::SubmitFailed("connection reset".into()));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_stale_response_after_reconnect_is_ignored() {
        let mut seq = connected_at(10);
        let old_tag = transmit(&mut seq, 10, 1);

        seq.reset();
        seq.on_snapshot(sig(10), Some(sig(10)), None).unwrap();

        let events = seq.on_submit_response(old_tag, ack(1, 11)).unwrap();
        assert!(events.is_empty());
        assert_eq!(seq.last_server_version(), Some(10));
    }

    #[test]
    fn test_response_with_nothing_in_flight_is_ignored() {
        let mut seq = connected_at(10);
        let tag = seq.connection_tag();

        let events = seq.on_submit_response(tag, ack(1, 11)).unwrap();
        assert!(events.is_empty());
        assert_eq!(seq.last_server_version(), Some(10));
        assert_eq!(seq.queued_messages(), 0);
    }

    #[test]
    fn test_tag_floor_keeps_tags_unique() {
        let old = connected_at(10);
        let mut new = DeltaSequencer::<TextOp>::with_tag_floor(old.connection_tag());
        new.reset();
        new.on_snapshot(sig(20), Some(sig(20)), None).unwrap();
        assert!(new.connection_tag() > old.connection_tag());
    }

    #[test]
    fn test_detached_sequencer_drops_events() {
        let mut seq = DeltaSequencer::<TextOp>::new();
        let events = seq.on_snapshot(sig(4), Some(sig(4)), None).unwrap();
        assert!(events.is_empty());
        assert_eq!(seq.last_server_version(), Some(4));
    }

    #[test]
    fn test_delivery_is_version_ordered_for_every_ack_position() {
        // Our 1-op delta lands at version 10 + k among five 1-op server deltas.
        for k in 0..=5u64 {
            for ack_after in 0..=5usize {
                let mut seq = connected_at(10);
                let tag = transmit(&mut seq, 10, 1);
                let server: Vec<_> = (0..5u64)
                    .map(|i| server_delta(if i < k { 10 + i } else { 11 + i }, 1))
                    .collect();

                let mut delivered = Vec::new();
                for (i, delta) in server.iter().enumerate() {
                    if i == ack_after {
                        delivered.extend(seq.on_submit_response(tag, ack(1, 11 + k)).unwrap());
                    }
                    delivered.extend(update(&mut seq, vec![delta.clone()]));
                }
                if ack_after == 5 {
                    delivered.extend(seq.on_submit_response(tag, ack(1, 11 + k)).unwrap());
                }

                let starts: Vec<u64> = delivered
                    .iter()
                    .map(|event| match event {
                        SequencerEvent::Delta(d) => d.applied_at_version(),
                        SequencerEvent::Ack { version, ops_applied } => version.version() - u64::from(*ops_applied),
                        other => panic!("unexpected event {other:?}"),
                    })
                    .collect();
                assert_eq!(starts, (10..16).collect::<Vec<_>>(), "k={k} ack_after={ack_after}");
            }
        }
    }
}
