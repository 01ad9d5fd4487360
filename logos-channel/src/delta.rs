//! Deltas: ordered operation batches plus the version they apply to.

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::id::ParticipantId;
use crate::model::DocumentModel;
use crate::version::VersionSignature;

/// A delta authored locally, composed against `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDelta<O> {
    author: ParticipantId,
    target: VersionSignature,
    ops: Vec<O>,
}

impl<O> ClientDelta<O> {
    pub fn new(author: ParticipantId, target: VersionSignature, ops: Vec<O>) -> Self {
        Self { author, target, ops }
    }

    pub fn author(&self) -> &ParticipantId {
        &self.author
    }

    pub fn target_version(&self) -> &VersionSignature {
        &self.target
    }

    /// Version the server reaches if it applies every op unchanged.
    pub fn resulting_version(&self) -> u64 {
        self.target.version() + self.ops.len() as u64
    }

    pub fn ops(&self) -> &[O] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<O> {
        self.ops
    }
}

/// A delta resolved by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedDelta<O> {
    author: Option<ParticipantId>,
    applied_at: u64,
    resulting: VersionSignature,
    timestamp_ms: u64,
    ops: Vec<O>,
}

impl<O> TransformedDelta<O> {
    pub fn new(
        author: Option<ParticipantId>,
        applied_at: u64,
        resulting: VersionSignature,
        timestamp_ms: u64,
        ops: Vec<O>,
    ) -> Self {
        Self {
            author,
            applied_at,
            resulting,
            timestamp_ms,
            ops,
        }
    }

    /// Empty delta marking a resynchronization point at `version`.
    pub fn resync(version: VersionSignature) -> Self {
        Self {
            author: None,
            applied_at: version.version(),
            resulting: version,
            timestamp_ms: 0,
            ops: Vec::new(),
        }
    }

    pub fn author(&self) -> Option<&ParticipantId> {
        self.author.as_ref()
    }

    pub fn applied_at_version(&self) -> u64 {
        self.applied_at
    }

    pub fn resulting_version(&self) -> &VersionSignature {
        &self.resulting
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn ops(&self) -> &[O] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<O> {
        self.ops
    }
}

impl<O: PartialEq> TransformedDelta<O> {
    /// Whether this server delta is the unmodified application of `client`.
    pub fn echoes(&self, client: &ClientDelta<O>) -> bool {
        self.applied_at == client.target.version() && self.ops == client.ops
    }
}

/// Transform a client op sequence against a server op sequence.
///
/// Returns `(client', server')`: the client ops as they apply after the
/// server ops, and the server ops as they apply after the client ops.
pub fn transform_ops<M: DocumentModel>(
    client: Vec<M::Operation>,
    server: Vec<M::Operation>,
) -> Result<(Vec<M::Operation>, Vec<M::Operation>), TransformError> {
    let mut client = client;
    let mut transformed_server = Vec::with_capacity(server.len());
    for op in server {
        let mut server_op = op;
        for client_op in client.iter_mut() {
            let (c, s) = M::transform(client_op, &server_op)?;
            *client_op = c;
            server_op = s;
        }
        transformed_server.push(server_op);
    }
    Ok((client, transformed_server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_client_delta_resulting_version() {
        let delta = client_delta(10, 3);
        assert_eq!(delta.resulting_version(), 13);
        assert_eq!(delta.len(), 3);
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_resync_delta_is_empty_at_version() {
        let delta: TransformedDelta<TextOp> = TransformedDelta::resync(sig(7));
        assert_eq!(delta.applied_at_version(), 7);
        assert_eq!(delta.resulting_version(), &sig(7));
        assert!(delta.is_empty());
        assert!(delta.author().is_none());
    }

    #[test]
    fn test_echo_detection_compares_base_and_ops() {
        let client = client_delta(5, 2);
        let echo = TransformedDelta::new(Some(author()), 5, sig(7), 0, client.ops().to_vec());
        let moved = TransformedDelta::new(Some(author()), 6, sig(8), 0, client.ops().to_vec());

        assert!(echo.echoes(&client));
        assert!(!moved.echoes(&client));
        assert!(!server_delta(5, 2).echoes(&client));
    }

    #[test]
    fn test_transform_ops_shifts_both_sides() {
        let client = vec![ins(0, "ab")];
        let server = vec![ins(0, "xyz"), ins(5, "q")];

        let (c, s) = transform_ops::<TextModel>(client, server).unwrap();

        // Client wins ties, so the server inserts move right.
        assert_eq!(c, vec![ins(0, "ab")]);
        assert_eq!(s, vec![ins(2, "xyz"), ins(7, "q")]);
    }

    #[test]
    fn test_transform_ops_with_empty_side() {
        let (c, s) = transform_ops::<TextModel>(Vec::new(), vec![ins(1, "a")]).unwrap();
        assert!(c.is_empty());
        assert_eq!(s, vec![ins(1, "a")]);
    }
}
