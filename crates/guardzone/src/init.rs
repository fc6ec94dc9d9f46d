//! Process-global engine instance, for consumers that want the C-shaped
//! surface (`enabled()`, `zone_init()`, ...) rather than holding a
//! [`GuardAllocator`] themselves. Configuration comes from the
//! `GUARDZONE_BOOT_ARGS` environment variable, the userspace stand-in for
//! the boot-argument parser.

use crate::config::Config;
use crate::engine::{AllocFlags, GuardAllocator};
use crate::zone::{Zone, ZoneStats};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

/// Environment variable holding the boot-token string.
pub const BOOT_ARGS_ENV: &str = "GUARDZONE_BOOT_ARGS";

const UNCONFIGURED: u8 = 0;
const CONFIGURING: u8 = 1;
const CONFIGURED: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNCONFIGURED);

struct EngineHolder(UnsafeCell<Option<GuardAllocator>>);
unsafe impl Sync for EngineHolder {}

static ENGINE: EngineHolder = EngineHolder(UnsafeCell::new(None));

/// Configure the global engine from an explicit boot-token string. First
/// configuration wins; later calls (and the env-var fallback) are no-ops.
pub fn configure(args: &str) {
    install(Config::from_boot_args(args));
}

/// Configure the global engine from `GUARDZONE_BOOT_ARGS` (absent means
/// disabled).
pub fn configure_from_env() {
    let args = std::env::var(BOOT_ARGS_ENV).unwrap_or_default();
    configure(&args);
}

fn install(config: Config) {
    match STATE.compare_exchange(UNCONFIGURED, CONFIGURING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            unsafe {
                *ENGINE.0.get() = Some(GuardAllocator::new(config));
            }
            STATE.store(CONFIGURED, Ordering::Release);
        }
        Err(_) => {
            while STATE.load(Ordering::Acquire) == CONFIGURING {
                core::hint::spin_loop();
            }
        }
    }
}

/// The global engine, configuring it from the environment on first use.
pub fn engine() -> &'static GuardAllocator {
    if STATE.load(Ordering::Acquire) != CONFIGURED {
        configure_from_env();
    }
    unsafe {
        (*ENGINE.0.get())
            .as_ref()
            .expect("guardzone: engine configuration did not complete")
    }
}

/// Declare the VM ready: bring up the global engine's arena, sized from
/// the parent zone map.
pub fn vm_ready(zone_map_size: usize) {
    engine().init_vm(zone_map_size);
}

pub fn enabled() -> bool {
    engine().enabled()
}

pub fn zone_init(zone: &Zone) {
    engine().zone_init(zone);
}

pub fn alloc(zone: &Zone, stats: &ZoneStats, flags: AllocFlags) -> *mut u8 {
    engine().alloc(zone, stats, flags)
}

/// # Safety
/// See [`GuardAllocator::free`].
pub unsafe fn free(zone: &Zone, stats: &ZoneStats, addr: *mut u8) {
    engine().free(zone, stats, addr)
}

pub fn empty_free_cache(zone: &Zone) {
    engine().empty_free_cache(zone);
}

/// # Safety
/// See [`GuardAllocator::element_size`].
pub unsafe fn element_size(addr: *const u8) -> Option<(*const Zone, usize)> {
    engine().element_size(addr)
}
