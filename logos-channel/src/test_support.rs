//! Plain-text document model and fixtures shared by the unit tests.

use serde::{Deserialize, Serialize};

use crate::delta::{ClientDelta, TransformedDelta};
use crate::error::TransformError;
use crate::id::{DocumentName, ParticipantId};
use crate::model::DocumentModel;
use crate::version::VersionSignature;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TextOp {
    Insert { pos: usize, text: String },
    VersionUpdate { increment: u64, signature: Option<VersionSignature> },
}

#[derive(Debug, Clone, Copy)]
pub struct TextModel;

impl DocumentModel for TextModel {
    type Operation = TextOp;
    type State = String;

    fn transform(client: &TextOp, server: &TextOp) -> Result<(TextOp, TextOp), TransformError> {
        match (client, server) {
            (TextOp::Insert { pos: cp, text: ct }, TextOp::Insert { pos: sp, text: st }) => {
                if cp <= sp {
                    Ok((
                        client.clone(),
                        TextOp::Insert { pos: sp + ct.len(), text: st.clone() },
                    ))
                } else {
                    Ok((
                        TextOp::Insert { pos: cp + st.len(), text: ct.clone() },
                        server.clone(),
                    ))
                }
            }
            _ => Ok((client.clone(), server.clone())),
        }
    }

    fn version_update(_template: &TextOp, increment: u64, signature: Option<&VersionSignature>) -> TextOp {
        TextOp::VersionUpdate {
            increment,
            signature: signature.cloned(),
        }
    }

    fn empty_state(_name: &DocumentName, _creator: &ParticipantId) -> String {
        String::new()
    }
}

pub fn sig(version: u64) -> VersionSignature {
    VersionSignature::new(version, format!("h{version}").into_bytes())
}

pub fn ins(pos: usize, text: &str) -> TextOp {
    TextOp::Insert { pos, text: text.to_string() }
}

pub fn ops(n: usize) -> Vec<TextOp> {
    (0..n).map(|i| ins(i, "x")).collect()
}

pub fn author() -> ParticipantId {
    ParticipantId::new("me@example.com")
}

pub fn client_delta(target: u64, n: usize) -> ClientDelta<TextOp> {
    ClientDelta::new(author(), sig(target), ops(n))
}

/// Server delta by another participant applied at `applied_at`.
pub fn server_delta(applied_at: u64, n: usize) -> TransformedDelta<TextOp> {
    TransformedDelta::new(
        Some(ParticipantId::new("other@example.com")),
        applied_at,
        sig(applied_at + n as u64),
        0,
        (0..n).map(|i| ins(100 + i, "s")).collect(),
    )
}

/// The empty delta a server sends to resynchronize at `version`.
pub fn resync(version: u64) -> TransformedDelta<TextOp> {
    TransformedDelta::resync(sig(version))
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
