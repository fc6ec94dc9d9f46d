//! Detection scenarios that must end the process: either a diagnostic panic
//! from the engine or a hardware fault from a guard page or a protected
//! freed range.
//!
//! Each scenario runs as a subprocess: the test re-invokes its own binary
//! with `GUARDZONE_FAULT_SCENARIO` set, and the parent asserts on how the
//! child died and what it printed.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::ptr;

use guardzone::engine::{AllocFlags, GuardAllocator};
use guardzone::header::HEADER_SIZE;
use guardzone::zone::{Zone, ZoneStats};

const SCENARIO_ENV: &str = "GUARDZONE_FAULT_SCENARIO";
const TEST_MAP_SIZE: usize = 4 << 20;

fn engine_with(args: &str) -> GuardAllocator {
    let engine = GuardAllocator::from_boot_args(args);
    engine.init_vm(TEST_MAP_SIZE);
    engine
}

fn setup(args: &str, elem_size: usize) -> (GuardAllocator, Zone, ZoneStats) {
    let engine = engine_with(args);
    let zone = Zone::new("victim", elem_size);
    engine.zone_init(&zone);
    assert!(zone.is_tracked());
    (engine, zone, ZoneStats::new())
}

fn run_scenario(name: &str) -> std::process::Output {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    Command::new(&exe)
        .env(SCENARIO_ENV, name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess")
}

/// The child must have panicked (test harness exit) with `expected_msg` on
/// stderr.
fn expect_panic_subprocess(name: &str, expected_msg: &str) {
    let output = run_scenario(name);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "scenario '{}' should have panicked. stderr:\n{}",
        name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
        name,
        expected_msg,
        stderr
    );
}

/// The child must have died on a signal (SIGSEGV/SIGBUS from a guard page
/// or a protected freed range).
fn expect_fault_subprocess(name: &str) {
    let output = run_scenario(name);
    assert!(
        output.status.signal().is_some(),
        "scenario '{}' should have faulted, but exited with {:?}. stderr:\n{}",
        name,
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
}

// ---------------------------------------------------------------------------
// Scenario driver
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var(SCENARIO_ENV) {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "residue_underrun" => scenario_residue_underrun(),
        "linear_overrun" => scenario_linear_overrun(),
        "double_free" => scenario_double_free(),
        "use_after_free_read" => scenario_use_after_free_read(),
        "wp_write_after_free" => scenario_wp_write_after_free(),
        "underflow_write" => scenario_underflow_write(),
        "underflow_residue_overrun" => scenario_underflow_residue_overrun(),
        "signature_corruption" => scenario_signature_corruption(),
        "size_field_corruption" => scenario_size_field_corruption(),
        "zone_mismatch" => scenario_zone_mismatch(),
        "unaligned_free" => scenario_unaligned_free(),
        other => panic!("unknown scenario: {}", other),
    }
}

/// Underrun in overflow mode: a write below the element's header lands in
/// the stamped residue and is flagged at free time. (A shallower underrun
/// corrupts the header instead and dies on the signature check.)
fn scenario_residue_underrun() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        p.sub(HEADER_SIZE + 1).write(0);
        engine.free(&zone, &stats, p);
    }
    unreachable!("residue corruption was not detected");
}

/// Overrun in overflow mode: the element abuts the guard page, so the first
/// byte past it faults immediately.
fn scenario_linear_overrun() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        p.add(64).write(0xAA);
    }
    unreachable!("guard page did not fault");
}

fn scenario_double_free() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        engine.free(&zone, &stats, p);
        engine.free(&zone, &stats, p);
    }
    unreachable!("double free was not detected");
}

fn scenario_use_after_free_read() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        engine.free(&zone, &stats, p);
        let _ = ptr::read_volatile(p);
    }
    unreachable!("use-after-free read did not fault");
}

/// Under `wp` freed ranges stay readable; only the write faults.
fn scenario_wp_write_after_free() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4 wp", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        engine.free(&zone, &stats, p);
        let _ = ptr::read_volatile(p); // reads survive
        ptr::write_volatile(p, 0xAA);
    }
    unreachable!("use-after-free write did not fault under wp");
}

/// Underflow mode puts the guard page before the element: `p[-1]` faults.
fn scenario_underflow_write() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4 uf_mode", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        p.sub(1).write(0xAA);
    }
    unreachable!("leading guard page did not fault");
}

/// Overruns in underflow mode land in the residue past the trailing header
/// and are flagged at free time.
fn scenario_underflow_residue_overrun() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4 uf_mode", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        p.add(64 + HEADER_SIZE).write(0);
        engine.free(&zone, &stats, p);
    }
    unreachable!("underflow-mode residue corruption was not detected");
}

fn scenario_signature_corruption() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        // The signature is the last word of the header below the element.
        (p.sub(4) as *mut u32).write_unaligned(0);
        engine.free(&zone, &stats, p);
    }
    unreachable!("signature corruption was not detected");
}

fn scenario_size_field_corruption() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        // The recorded element size sits between the owner and the signature.
        (p.sub(8) as *mut u32).write_unaligned(999);
        engine.free(&zone, &stats, p);
    }
    unreachable!("header size corruption was not detected");
}

fn scenario_zone_mismatch() {
    let engine = engine_with("enable min=64 max=64 fc_size=4");
    let zone_a = Zone::new("zone a", 64);
    let zone_b = Zone::new("zone b", 64);
    engine.zone_init(&zone_a);
    engine.zone_init(&zone_b);
    let stats = ZoneStats::new();
    let p = engine.alloc(&zone_a, &stats, AllocFlags::NONE);
    unsafe {
        engine.free(&zone_b, &stats, p);
    }
    unreachable!("mismatched free was not detected");
}

fn scenario_unaligned_free() {
    let (engine, zone, stats) = setup("enable min=64 max=64 fc_size=4", 64);
    let p = engine.alloc(&zone, &stats, AllocFlags::NONE);
    unsafe {
        engine.free(&zone, &stats, p.add(1));
    }
    unreachable!("misaligned free address was not detected");
}

// ---------------------------------------------------------------------------
// Parent-side assertions
// ---------------------------------------------------------------------------

#[test]
fn residue_underrun_panics_at_free() {
    expect_panic_subprocess("residue_underrun", "doesn't match fill pattern");
}

#[test]
fn linear_overrun_faults_on_guard_page() {
    expect_fault_subprocess("linear_overrun");
}

#[test]
fn double_free_panics_with_ring_indices() {
    expect_panic_subprocess("double_free", "double free detected, freed address");
    // The second free sees the first still parked at slot 0 while the ring
    // index has advanced to 1.
    let output = run_scenario("double_free");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("current free cache index: 1, freed index: 0"),
        "unexpected ring indices in diagnostic:\n{}",
        stderr
    );
}

#[test]
fn use_after_free_read_faults() {
    expect_fault_subprocess("use_after_free_read");
}

#[test]
fn wp_keeps_reads_but_faults_writes() {
    expect_fault_subprocess("wp_write_after_free");
}

#[test]
fn underflow_write_faults_on_leading_guard() {
    expect_fault_subprocess("underflow_write");
}

#[test]
fn underflow_residue_overrun_panics_at_free() {
    expect_panic_subprocess("underflow_residue_overrun", "doesn't match fill pattern");
}

#[test]
fn signature_corruption_panics() {
    expect_panic_subprocess("signature_corruption", "signature mismatch for element");
}

#[test]
fn size_field_corruption_panics() {
    expect_panic_subprocess("size_field_corruption", "recorded size: 0x3e7");
}

#[test]
fn zone_mismatch_panics() {
    expect_panic_subprocess("zone_mismatch", "mismatched zone or under/overflow");
}

#[test]
fn unaligned_free_panics() {
    expect_panic_subprocess("unaligned_free", "invalid free address");
}
