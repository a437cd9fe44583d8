//! Benchmarks for the tickvault write and scan paths.
//!
//! Run with: cargo bench --package alopex-tickvault
//!
//! ## Benchmark Categories
//!
//! - **Addressing**: time to index and tick conversions
//! - **Write**: write_csm including the WAL flush, FIXED and VARIABLE
//! - **Scan**: forward, backward and ranged reads

use alopex_tickvault::format::timeindex::{interval_ticks, time_from_ticks, time_to_index};
use alopex_tickvault::{
    BucketKey, Column, ColumnSeries, ColumnSeriesMap, Direction, Query, StorageConfig,
    StorageContext, SyncMode,
};
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use tempfile::TempDir;

const BASE_EPOCH: i64 = 1_609_459_200; // 2021-01-01

fn create_bench_context(temp_dir: &TempDir) -> StorageContext {
    let config = StorageConfig::new(temp_dir.path())
        .with_background_flusher(false)
        .with_sync_mode(SyncMode::None);
    StorageContext::open(config).unwrap()
}

/// Minute bars with slowly varying prices.
fn generate_bars(start: i64, count: usize) -> ColumnSeries {
    let mut close = 100.0f32;
    let mut closes = Vec::with_capacity(count);
    for i in 0..count {
        close += (i as f32 * 0.1).sin() * 0.05;
        closes.push(close);
    }
    ColumnSeries::new()
        .with_column("Epoch", Column::Int64((0..count as i64).map(|i| start + i * 60).collect()))
        .with_column("Open", Column::Float32(closes.clone()))
        .with_column("High", Column::Float32(closes.iter().map(|c| c + 0.1).collect()))
        .with_column("Low", Column::Float32(closes.iter().map(|c| c - 0.1).collect()))
        .with_column("Close", Column::Float32(closes))
        .with_column("Volume", Column::Int32(vec![1_000; count]))
}

/// Trades, several per second.
fn generate_trades(start: i64, count: usize) -> ColumnSeries {
    ColumnSeries::new()
        .with_column("Epoch", Column::Int64((0..count as i64).map(|i| start + i / 4).collect()))
        .with_column("Price", Column::Float64((0..count).map(|i| 50.0 + i as f64 * 0.01).collect()))
        .with_column("Size", Column::Uint32(vec![100; count]))
        .with_column(
            "Nanoseconds",
            Column::Int32((0..count as i32).map(|i| (i % 4) * 250_000_000).collect()),
        )
}

fn single(key: &BucketKey, series: ColumnSeries) -> ColumnSeriesMap {
    let mut csm = ColumnSeriesMap::new();
    csm.insert(key.clone(), series);
    csm
}

fn bench_addressing(c: &mut Criterion) {
    let t = Utc.with_ymd_and_hms(2021, 6, 15, 13, 37, 12).unwrap();
    let minute = Duration::from_secs(60);

    c.bench_function("time_to_index", |b| b.iter(|| time_to_index(black_box(t), minute)));
    c.bench_function("ticks_round_trip", |b| {
        b.iter(|| {
            let index = time_to_index(black_box(t), minute);
            let ticks = interval_ticks(t, index, 1440);
            time_from_ticks(BASE_EPOCH, 1440, ticks)
        })
    });
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_csm");
    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("fixed", count), &count, |b, &count| {
            let temp_dir = TempDir::new().unwrap();
            let ctx = create_bench_context(&temp_dir);
            let key = BucketKey::new("BENCH", "1Min", "OHLCV").unwrap();
            let csm = single(&key, generate_bars(BASE_EPOCH, count));
            b.iter(|| ctx.write_csm(black_box(&csm), false).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("variable", count), &count, |b, &count| {
            let temp_dir = TempDir::new().unwrap();
            let ctx = create_bench_context(&temp_dir);
            let key = BucketKey::new("BENCH", "1Min", "TRADES").unwrap();
            let csm = single(&key, generate_trades(BASE_EPOCH, count));
            b.iter(|| ctx.write_csm(black_box(&csm), true).unwrap());
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let ctx = create_bench_context(&temp_dir);
    let key = BucketKey::new("BENCH", "1Min", "OHLCV").unwrap();
    let rows = 100_000;
    ctx.write_csm(&single(&key, generate_bars(BASE_EPOCH, rows)), false)
        .unwrap();

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(rows as u64));
    group.bench_function("forward_all", |b| {
        b.iter(|| ctx.read(Query::for_key(key.clone())).unwrap())
    });
    group.finish();

    c.bench_function("scan_last_100", |b| {
        b.iter(|| {
            ctx.read(Query::for_key(key.clone()).with_limit(100, Direction::Last))
                .unwrap()
        })
    });
    let start = Utc.timestamp_opt(BASE_EPOCH + 30_000 * 60, 0).unwrap();
    let end = Utc.timestamp_opt(BASE_EPOCH + 31_000 * 60, 0).unwrap();
    c.bench_function("scan_range_1000", |b| {
        b.iter(|| ctx.read(Query::for_key(key.clone()).with_range(start, end)).unwrap())
    });
}

criterion_group!(benches, bench_addressing, bench_write, bench_scan);
criterion_main!(benches);
