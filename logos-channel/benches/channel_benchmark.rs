use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logos_channel::delta::{transform_ops, TransformedDelta};
use logos_channel::error::TransformError;
use logos_channel::id::{DocumentId, DocumentName, ParticipantId};
use logos_channel::model::DocumentModel;
use logos_channel::protocol::{Frame, ViewUpdate};
use logos_channel::sequencer::DeltaSequencer;
use logos_channel::version::VersionSignature;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Op {
    Insert(usize),
    Version(u64),
}

struct Positions;

impl DocumentModel for Positions {
    type Operation = Op;
    type State = Vec<u8>;

    fn transform(client: &Op, server: &Op) -> Result<(Op, Op), TransformError> {
        match (client, server) {
            (Op::Insert(c), Op::Insert(s)) if c <= s => Ok((Op::Insert(*c), Op::Insert(s + 1))),
            (Op::Insert(c), Op::Insert(s)) => Ok((Op::Insert(c + 1), Op::Insert(*s))),
            _ => Ok((client.clone(), server.clone())),
        }
    }

    fn version_update(_template: &Op, increment: u64, _signature: Option<&VersionSignature>) -> Op {
        Op::Version(increment)
    }

    fn empty_state(_name: &DocumentName, _creator: &ParticipantId) -> Vec<u8> {
        Vec::new()
    }
}

fn sig(version: u64) -> VersionSignature {
    VersionSignature::new(version, version.to_be_bytes())
}

fn deltas(count: u64) -> Vec<TransformedDelta<Op>> {
    let author = ParticipantId::new("bench@example.com");
    (0..count)
        .map(|v| TransformedDelta::new(Some(author.clone()), v, sig(v + 1), 0, vec![Op::Insert(v as usize)]))
        .collect()
}

fn bench_sequencer_in_order(c: &mut Criterion) {
    let batch = deltas(1_000);

    c.bench_function("sequencer_1K_in_order", |b| {
        b.iter(|| {
            let mut seq = DeltaSequencer::new();
            seq.reset();
            seq.on_snapshot(sig(0), Some(sig(0)), None).unwrap();
            black_box(seq.on_update(black_box(batch.clone()), None, None).unwrap());
        })
    });
}

fn bench_sequencer_update_per_delta(c: &mut Criterion) {
    // One delta per update, each carrying the commit of the version before it.
    let updates: Vec<(TransformedDelta<Op>, VersionSignature)> =
        deltas(100).into_iter().map(|d| (d.clone(), sig(d.applied_at_version()))).collect();

    c.bench_function("sequencer_100_single_updates", |b| {
        b.iter(|| {
            let mut seq = DeltaSequencer::new();
            seq.reset();
            seq.on_snapshot(sig(0), Some(sig(0)), None).unwrap();
            for (delta, committed) in &updates {
                black_box(seq.on_update(vec![delta.clone()], Some(committed.clone()), None).unwrap());
            }
        })
    });
}

fn bench_transform_ops(c: &mut Criterion) {
    let client: Vec<Op> = (0..100).map(Op::Insert).collect();
    let server: Vec<Op> = (0..100).map(|i| Op::Insert(i * 2)).collect();

    c.bench_function("transform_100x100", |b| {
        b.iter(|| {
            black_box(transform_ops::<Positions>(black_box(client.clone()), black_box(server.clone())).unwrap());
        })
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let update: ViewUpdate<Op, Vec<u8>> =
        ViewUpdate::deltas(DocumentId::new("conv+root"), deltas(16), Some(sig(16)));
    let frame = Frame::Update(update);

    c.bench_function("frame_roundtrip_16_deltas", |b| {
        b.iter(|| {
            let encoded = frame.encode().unwrap();
            black_box(Frame::<Op, Vec<u8>>::decode(&encoded).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_sequencer_in_order,
    bench_sequencer_update_per_delta,
    bench_transform_ops,
    bench_frame_roundtrip,
);
criterion_main!(benches);
