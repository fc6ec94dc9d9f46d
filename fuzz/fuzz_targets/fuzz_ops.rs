#![no_main]

use guardzone::engine::{AllocFlags, GuardAllocator};
use guardzone::zone::{Zone, ZoneStats};
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

/// Fuzz target that interprets a byte slice as a sequence of guard-engine
/// operations over a few tracked zones.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=free, 2=reverse lookup at base,
///           3=reverse lookup mid-element)
///   byte 1: zone index
///   byte 2: slot index (which tracked pointer to operate on)
///   byte 3: offset seed for mid-element probes
///
/// Any panic or fault is a finding; the sequences generated here are all
/// legal uses of the engine.
const MAX_SLOTS: usize = 32;

struct Harness {
    engine: GuardAllocator,
    zones: Vec<(Zone, ZoneStats)>,
}

fn harness() -> &'static Harness {
    static HARNESS: OnceLock<Harness> = OnceLock::new();
    HARNESS.get_or_init(|| {
        let engine = GuardAllocator::from_boot_args("enable min=1 fc_size=16 wp");
        engine.init_vm(16 << 20);
        let zones = vec![
            (Zone::new("fuzz small", 32), ZoneStats::new()),
            (Zone::new("fuzz medium", 200), ZoneStats::new()),
            (Zone::new("fuzz large", 1024), ZoneStats::new()),
        ];
        for (zone, _) in &zones {
            engine.zone_init(zone);
        }
        Harness { engine, zones }
    })
}

fuzz_target!(|data: &[u8]| {
    let h = harness();
    let mut slots: [(usize, *mut u8); MAX_SLOTS] = [(0, std::ptr::null_mut()); MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let zone_idx = (data[i + 1] as usize) % h.zones.len();
        let slot = (data[i + 2] as usize) % MAX_SLOTS;
        let offset_seed = data[i + 3] as usize;
        i += 4;

        let (zone, stats) = &h.zones[zone_idx];
        match opcode {
            0 => {
                // Allocate into the slot, freeing any previous occupant.
                let (old_zone, old_ptr) = slots[slot];
                if !old_ptr.is_null() {
                    let (z, s) = &h.zones[old_zone];
                    unsafe { h.engine.free(z, s, old_ptr) };
                }
                let ptr = h.engine.alloc(zone, stats, AllocFlags::NONE);
                assert!(!ptr.is_null());
                slots[slot] = (zone_idx, ptr);
            }
            1 => {
                let (owner, ptr) = slots[slot];
                if !ptr.is_null() {
                    let (z, s) = &h.zones[owner];
                    unsafe { h.engine.free(z, s, ptr) };
                    slots[slot] = (0, std::ptr::null_mut());
                }
            }
            2 => {
                let (owner, ptr) = slots[slot];
                if !ptr.is_null() {
                    let (z, _) = &h.zones[owner];
                    let looked_up = unsafe { h.engine.element_size(ptr) };
                    let (found, size) = looked_up.expect("live element must be found");
                    assert!(std::ptr::eq(found, z as *const Zone));
                    assert_eq!(size, z.elem_size());
                }
            }
            3 => {
                let (owner, ptr) = slots[slot];
                if !ptr.is_null() {
                    let (z, _) = &h.zones[owner];
                    let offset = offset_seed % z.elem_size().max(1);
                    let looked_up = unsafe { h.engine.element_size(ptr.add(offset)) };
                    assert_eq!(looked_up.map(|(_, size)| size), Some(z.elem_size()));
                }
            }
            _ => unreachable!(),
        }
    }

    // Cleanup so live elements don't accumulate across runs.
    for (owner, ptr) in slots {
        if !ptr.is_null() {
            let (z, s) = &h.zones[owner];
            unsafe { h.engine.free(z, s, ptr) };
        }
    }
});
