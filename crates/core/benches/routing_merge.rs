//! Routing and aggregation micro-benchmark
//! Measures shard placement throughput, Hot-store scan latency, and merge cost
//!
//! Usage: cargo bench -p tidemark-core --bench routing_merge

use chrono::Utc;
use std::time::Instant;
use tidemark_core::record::{HotRecord, Metadata, Tier};
use tidemark_core::search::{merge, SearchHit};
use tidemark_core::storage::HotStore;
use tidemark_core::ShardRouter;

const OWNERS: usize = 200_000;
const DIM: usize = 384;
const RECORDS: usize = 20_000;
const QUERIES: usize = 100;

/// Deterministic pseudo-random vector (no rand dependency).
fn make_vector(seed: usize) -> Vec<f32> {
    let mut state = (seed as u64).wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..DIM)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
        })
        .collect()
}

fn bench_routing() {
    println!("--- Shard placement ---");
    let owners: Vec<String> = (0..OWNERS).map(|i| format!("source-system-{i}")).collect();
    for shard_count in [16u32, 256, 4096] {
        let router = ShardRouter::new(shard_count).unwrap();
        let mut counts = vec![0usize; shard_count as usize];
        let t0 = Instant::now();
        for owner in &owners {
            counts[router.shard_for(owner) as usize] += 1;
        }
        let elapsed = t0.elapsed();
        let mean = OWNERS as f64 / shard_count as f64;
        let max = *counts.iter().max().unwrap() as f64;
        println!(
            "  {shard_count:>5} shards | {:>10.0} ids/s | max/mean load {:.2}",
            OWNERS as f64 / elapsed.as_secs_f64(),
            max / mean
        );
    }
}

fn bench_hot_search() {
    println!();
    println!("--- Hot store exact search ({RECORDS} x {DIM}d) ---");
    let router = ShardRouter::new(1).unwrap();
    let store = HotStore::in_memory(0, router, DIM);
    let t0 = Instant::now();
    for i in 0..RECORDS {
        let record = HotRecord::new(
            format!("owner-{}", i % 50),
            format!("rec-{i}"),
            format!("Record number {i}."),
            make_vector(i),
            Utc::now(),
            Metadata::new(),
        );
        store.write(record).unwrap();
    }
    println!("  Load time: {:.2}s", t0.elapsed().as_secs_f64());

    let queries: Vec<Vec<f32>> = (0..QUERIES).map(|i| make_vector(1_000_000 + i)).collect();
    let t0 = Instant::now();
    for q in &queries {
        let hits = store.search_similar(q, None, 10, 0.0).unwrap();
        assert!(hits.len() <= 10);
    }
    let elapsed = t0.elapsed();
    println!(
        "  QPS: {:.1} | avg latency {:.2}ms",
        QUERIES as f64 / elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1000.0 / QUERIES as f64
    );
}

fn bench_merge() {
    println!();
    println!("--- Aggregation ---");
    for (shards, per_shard) in [(16usize, 10usize), (256, 10), (256, 100)] {
        let sets: Vec<Vec<SearchHit>> = (0..shards)
            .map(|s| {
                (0..per_shard)
                    .map(|i| SearchHit {
                        owner_id: format!("owner-{s}"),
                        // Every other shard repeats ids to exercise dedup.
                        record_id: format!("rec-{}-{i}", s / 2),
                        content_or_summary: String::new(),
                        timestamp: Utc::now(),
                        metadata: Metadata::new(),
                        similarity: ((s * 31 + i * 17) % 1000) as f32 / 1000.0,
                        tier: Tier::Hot,
                    })
                    .collect()
            })
            .collect();
        let t0 = Instant::now();
        let merged = merge(sets, 10);
        println!(
            "  {shards:>3} shards x {per_shard:>3} hits -> {} in {:.3}ms",
            merged.len(),
            t0.elapsed().as_secs_f64() * 1000.0
        );
    }
}

fn main() {
    println!("=== tidemark routing / search / merge ===");
    println!();
    bench_routing();
    bench_hot_search();
    bench_merge();
}
