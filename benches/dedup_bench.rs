//! Benchmarks for the per-message hot path: duplicate suppression and
//! envelope encoding.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use peerlink::network::dedup_filter::DuplicateMessageWindow;
use peerlink::network::message::{Message, MessageBody, RpcKind, RpcMessage};
use peerlink::network::offerer::offerer;
use peerlink::network::wire;
use peerlink::types::{IdGenerator, PeerAddress, PeerDescriptor};

fn bench_duplicate_window(c: &mut Criterion) {
    let ids: Vec<String> = {
        let generator = IdGenerator::with_prefix(7);
        (0..20_000).map(|_| generator.next_id()).collect()
    };

    c.bench_function("dedup_insert_full_window", |b| {
        let window = DuplicateMessageWindow::new(10_000);
        let mut i = 0usize;
        b.iter(|| {
            let id = &ids[i % ids.len()];
            i += 1;
            black_box(window.check_and_insert(id))
        })
    });
}

fn bench_offerer(c: &mut Criterion) {
    let local = PeerAddress::from_node_id(&[0x11; 20]);
    let remote = PeerAddress::from_node_id(&[0x22; 20]);

    c.bench_function("offerer", |b| {
        b.iter(|| offerer(black_box(&local), black_box(&remote)))
    });
}

fn bench_wire(c: &mut Criterion) {
    let message = Message {
        service_id: "bench/echo".to_string(),
        message_id: "0000000000000007-1".to_string(),
        source: Some(PeerDescriptor::new(vec![1u8; 20]).with_websocket("127.0.0.1", 4000, false)),
        target: Some(PeerDescriptor::new(vec![2u8; 20])),
        body: MessageBody::Rpc(RpcMessage {
            request_id: "0000000000000007-2".to_string(),
            method: "echo".to_string(),
            kind: RpcKind::Notification,
            payload: vec![0xab; 512],
            error: None,
        }),
    };

    c.bench_function("wire_roundtrip_512b", |b| {
        b.iter(|| {
            let bytes = wire::serialize_message(black_box(&message)).unwrap();
            wire::parse_message(&bytes).unwrap()
        })
    });
}

criterion_group!(benches, bench_duplicate_window, bench_offerer, bench_wire);
criterion_main!(benches);
