use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use slotgate::coordination::SlotAssignment;
use slotgate::pool::{PoolConfig, PoolRegistry};
use slotgate::protocol::{Command, RespParser};
use slotgate::router::{Router, RouterConfig};
use slotgate::slots::{slot_for_key, SlotOwner, SlotTable, DEFAULT_SLOT_COUNT};
use slotgate::stats::ProxyStats;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn populated_table() -> Arc<SlotTable> {
    let table = SlotTable::new(DEFAULT_SLOT_COUNT);
    let assignments: Vec<SlotAssignment> = (0..DEFAULT_SLOT_COUNT)
        .map(|slot| SlotAssignment::online(slot, (slot % 4) as u32 + 1))
        .collect();
    table.rebuild(&assignments).unwrap();
    Arc::new(table)
}

fn bench_slot_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_hashing");

    for len in [8usize, 64, 512].iter() {
        let key = vec![b'k'; *len];
        group.bench_with_input(BenchmarkId::new("plain_key", len), &key, |b, key| {
            b.iter(|| black_box(slot_for_key(black_box(key), DEFAULT_SLOT_COUNT)));
        });
    }

    let tagged = b"{user:1000}.followers".to_vec();
    group.bench_function("hash_tag", |b| {
        b.iter(|| black_box(slot_for_key(black_box(&tagged), DEFAULT_SLOT_COUNT)));
    });

    group.finish();
}

fn bench_slot_table(c: &mut Criterion) {
    let table = populated_table();
    let mut group = c.benchmark_group("slot_table");

    group.bench_function("owner_lookup", |b| {
        let mut slot = 0;
        b.iter(|| {
            slot = (slot + 7) % DEFAULT_SLOT_COUNT;
            black_box(table.owner(slot).unwrap())
        });
    });

    group.bench_function("range_update", |b| {
        let mut group_id = 1;
        b.iter(|| {
            group_id = group_id % 4 + 1;
            table
                .apply_range_update(0, 127, SlotOwner::online(group_id))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_request_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = Arc::new(Router::new(
        populated_table(),
        Arc::new(PoolRegistry::new(PoolConfig::default())),
        Arc::new(ProxyStats::default()),
        RouterConfig::default(),
    ));
    let mut group = c.benchmark_group("request_path");

    let pipeline: Vec<u8> = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:100\r\n$5\r\nhello\r\n".repeat(16);
    group.bench_function("decode_pipeline", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&pipeline[..]);
            black_box(RespParser::parse_requests(&mut buf).unwrap())
        });
    });

    let set = Command::from_parts(&[&b"SET"[..], &b"user:100"[..], &b"hello"[..]]).unwrap();
    group.bench_function("plan_keyed", |b| {
        b.iter(|| black_box(router.plan(black_box(&set)).unwrap()));
    });

    let ping = Command::from_parts(&[&b"PING"[..]]).unwrap();
    group.bench_function("route_local", |b| {
        b.to_async(&rt).iter(|| async { black_box(router.route(&ping).await) });
    });

    group.finish();
}

criterion_group!(benches, bench_slot_hashing, bench_slot_table, bench_request_path);
criterion_main!(benches);
