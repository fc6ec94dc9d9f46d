//! Alloc/free churn through the guard engine.
//!
//! The engine trades throughput for diagnostics (every allocation is an
//! arena range plus protection traffic), so the interesting numbers are
//! relative: cache on vs. off, write-protect vs. unmap, lookup cost.

use std::hint::black_box;
use std::time::Instant;

use guardzone::engine::{AllocFlags, GuardAllocator};
use guardzone::zone::{Zone, ZoneStats};

const MAP_SIZE: usize = 64 << 20;

/// Measure alloc/free latency for a given element size, N iterations.
fn bench_alloc_free(args: &str, elem_size: usize, iterations: usize) -> f64 {
    let engine = GuardAllocator::from_boot_args(args);
    engine.init_vm(MAP_SIZE);
    let zone = Zone::new("bench objects", elem_size);
    engine.zone_init(&zone);
    let stats = ZoneStats::new();

    // Warmup: populate the free-VA cache to its steady state.
    for _ in 0..1000 {
        let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
        unsafe {
            std::ptr::write_bytes(p, 0xAB, elem_size.min(64));
            engine.free(&zone, &stats, black_box(p));
        }
    }

    let start = Instant::now();
    for _ in 0..iterations {
        let p = engine.alloc(&zone, &stats, black_box(AllocFlags::NONE));
        unsafe {
            std::ptr::write_bytes(p, 0xAB, elem_size.min(64));
            engine.free(&zone, &stats, black_box(p));
        }
    }
    let elapsed = start.elapsed();
    elapsed.as_nanos() as f64 / iterations as f64
}

/// Measure reverse-lookup latency against a working set of live elements.
fn bench_reverse_lookup(elem_size: usize, iterations: usize) -> f64 {
    let engine = GuardAllocator::from_boot_args("enable min=1 fc_size=64");
    engine.init_vm(MAP_SIZE);
    let zone = Zone::new("bench objects", elem_size);
    engine.zone_init(&zone);
    let stats = ZoneStats::new();

    let live: Vec<*mut u8> = (0..128)
        .map(|_| engine.alloc(&zone, &stats, AllocFlags::NONE))
        .collect();

    let start = Instant::now();
    for i in 0..iterations {
        let p = live[i % live.len()];
        let probe = unsafe { p.add(i % elem_size.max(1)) };
        let found = unsafe { engine.element_size(black_box(probe)) };
        assert!(found.is_some());
    }
    let elapsed = start.elapsed();

    for p in live {
        unsafe { engine.free(&zone, &stats, p) };
    }
    elapsed.as_nanos() as f64 / iterations as f64
}

fn main() {
    let iterations: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(50_000);

    println!("guardzone churn, {} iterations per row", iterations);
    println!("{:<30} {:>10}", "configuration", "ns/op");

    for &size in &[32usize, 200, 1024, 4000] {
        let ns = bench_alloc_free("enable min=1 fc_size=64", size, iterations);
        println!("{:<30} {:>10.1}", format!("alloc/free {}B cached", size), ns);
    }
    for &size in &[32usize, 1024] {
        let ns = bench_alloc_free("enable min=1 fc_size=0", size, iterations);
        println!("{:<30} {:>10.1}", format!("alloc/free {}B uncached", size), ns);
        let ns = bench_alloc_free("enable min=1 fc_size=64 wp", size, iterations);
        println!("{:<30} {:>10.1}", format!("alloc/free {}B wp", size), ns);
    }
    for &size in &[32usize, 1024] {
        let ns = bench_reverse_lookup(size, iterations);
        println!("{:<30} {:>10.1}", format!("reverse lookup {}B", size), ns);
    }
}
