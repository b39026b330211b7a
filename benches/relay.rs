//! Performance benchmarks for a3s-relay
//!
//! Run with: cargo bench

use a3s_relay::codec::{pack, unpack};
use a3s_relay::endpoint::sim::frames_by_word;
use a3s_relay::persistence::SnapshotPayload;
use a3s_relay::{
    CompletionDetector, ConversationSession, DetectorConfig, EndpointId, GzipCodec, Observation,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;
use tokio::time::Instant;

fn bench_detector(c: &mut Criterion) {
    let frames = frames_by_word(
        "Tides are driven mostly by the moon, though the sun contributes a smaller share \
         of the pull and the shape of each coastline decides how high the water climbs.",
    );

    c.bench_function("CompletionDetector stream", |b| {
        b.iter(|| {
            let mut detector = CompletionDetector::new(DetectorConfig::default());
            let start = Instant::now();
            detector.begin(start, None);
            for (i, frame) in frames.iter().enumerate() {
                let observation = Observation {
                    candidate: Some(frame.clone()),
                    in_progress: false,
                };
                detector.on_mutations(&observation, start + Duration::from_millis(i as u64 * 50));
            }
            let last = Observation {
                candidate: frames.last().cloned(),
                in_progress: false,
            };
            detector.on_timer(&last, start + Duration::from_secs(5))
        });
    });
}

fn bench_snapshot_codec(c: &mut Criterion) {
    let mut session = ConversationSession::new(
        [EndpointId(1), EndpointId(2)],
        ["https://a.example".into(), "https://b.example".into()],
        "tides",
        0,
    );
    for turn in 0..50u64 {
        let speaker = session.current_speaker;
        let text = format!("Statement {} with a few sentences of argument in it.", turn);
        let _ = session.accept_reply(speaker, &text, turn * 1_000);
    }
    let payload = SnapshotPayload {
        session,
        log_session_id: Some("ses-bench".into()),
        entries: Vec::new(),
    };
    let codec = GzipCodec::default();

    c.bench_function("snapshot pack", |b| {
        b.iter(|| pack(&codec, &payload).unwrap());
    });

    let data = pack(&codec, &payload).unwrap();
    c.bench_function("snapshot unpack", |b| {
        b.iter(|| unpack::<SnapshotPayload>(&codec, &data).unwrap());
    });
}

criterion_group!(benches, bench_detector, bench_snapshot_codec);
criterion_main!(benches);
