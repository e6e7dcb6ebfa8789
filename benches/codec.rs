use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use netsync::core::bits::{BitReader, BitWriter};
use netsync::network::message::{frame_kind, ApprovalLayout, ConnectionApproved, MessageKind};
use netsync::network::channel::DEFAULT_MESSAGE_CHANNEL;
use netsync::network::{LoopbackHub, TransportKind};
use netsync::{ClientId, NetworkConfig, Session};

fn approval() -> ConnectionApproved {
    ConnectionApproved {
        client_id: ClientId(7),
        scene_index: Some(2),
        server_share: Some(vec![0x42; 32]),
        signature: None,
        time: 12.5,
        timestamp: 123_456,
        peers: (1..=64).map(ClientId).collect(),
        objects: None,
    }
}

fn bench_bits(c: &mut Criterion) {
    let mut group = c.benchmark_group("bits");

    group.bench_function("var_u64_write", |b| {
        b.iter(|| {
            let mut writer = BitWriter::with_capacity(1024);
            for i in 0..128u64 {
                writer.write_var_u64(black_box(i * 1_000_003));
                writer.write_bool(i % 3 == 0);
            }
            writer.into_bytes()
        })
    });

    let mut writer = BitWriter::with_capacity(1024);
    for i in 0..128u64 {
        writer.write_var_u64(i * 1_000_003);
        writer.write_bool(i % 3 == 0);
    }
    let bytes = writer.into_bytes();
    group.bench_function("var_u64_read", |b| {
        b.iter(|| {
            let mut reader = BitReader::new(black_box(&bytes));
            for _ in 0..128 {
                let _ = reader.read_var_u64();
                let _ = reader.read_bool();
            }
        })
    });

    group.finish();
}

fn bench_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("messages");
    let layout = ApprovalLayout {
        scene_switching: true,
        encryption: true,
        signing: false,
        spawning: false,
    };

    group.bench_function("approval_encode", |b| {
        b.iter_batched(
            approval,
            |message| {
                let mut writer = frame_kind(MessageKind::ConnectionApproved);
                message.encode(&mut writer);
                writer.into_bytes()
            },
            BatchSize::SmallInput,
        )
    });

    let mut writer = BitWriter::new();
    approval().encode(&mut writer);
    let blob = writer.into_bytes();
    group.bench_function("approval_decode", |b| {
        b.iter(|| ConnectionApproved::decode(&mut BitReader::new(black_box(&blob)), layout))
    });

    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let step = Duration::from_micros(15_625);
    let config = NetworkConfig {
        transport: TransportKind::Custom,
        ..NetworkConfig::default()
    };
    let hub = LoopbackHub::new();
    let mut server = Session::new(config.clone()).with_transport(hub.endpoint());
    let mut client = Session::new(config).with_transport(hub.endpoint());
    server.start_server().unwrap();
    client.start_client().unwrap();
    for _ in 0..4 {
        server.tick(step);
        client.tick(step);
    }

    c.bench_function("custom_message_round", |b| {
        b.iter(|| {
            for _ in 0..32 {
                let _ = server.send_custom_message(ClientId(1), DEFAULT_MESSAGE_CHANNEL, b"state");
            }
            server.tick(step);
            client.tick(step);
        })
    });
}

criterion_group!(benches, bench_bits, bench_messages, bench_session);
criterion_main!(benches);
