//! Guard-mode zone allocator, used to trap use-after-free errors, overruns,
//! underruns, mismatched allocations/frees and writes to freed storage.
//!
//! Every allocation from a tracked zone is placed on its own page-aligned
//! virtual range with an adjoining inaccessible guard page. Freed ranges are
//! made inaccessible (or read-only) and parked in a per-zone free-VA cache,
//! evicted least-recently-freed, so that lingering accesses fault long after
//! the free.
//!
//! The engine is configured by a flat string of boot tokens (see
//! [`config::Config::from_boot_args`]), read from the `GUARDZONE_BOOT_ARGS`
//! environment variable when the process-global engine is used:
//!
//! * `enable` -- turn the engine on with defaults (track zones >= 1024 bytes)
//! * `min=<n>` / `max=<n>` -- track zones by element-size range
//! * `size=<n>` -- track zones with exactly this element size
//! * `fc_size=<n>` -- free-VA cache capacity per zone (default 1536)
//! * `wp` -- write-protect rather than unmap freed allocations, which keeps
//!   their headers inspectable and distinguishes bad reads from bad writes
//! * `uf_mode` -- underflow mode: the guard page precedes the element
//! * `no_dfree_check` -- skip the linear double-free scan on free
//! * `noconsistency` -- skip signature/size/fill-pattern validation on free
//! * `zscale=<n>` -- arena size multiplier relative to the parent zone map
//! * `name=<s>` -- track a zone by name regardless of size; a period in the
//!   token matches a space in the zone name
//! * `disable` -- hard off, wins over everything above

pub mod arena;
pub mod cache;
pub mod config;
pub mod engine;
pub mod header;
pub mod init;
pub mod platform;
pub mod preempt;
pub mod reserve;
pub mod sync;
pub mod util;
pub mod zone;

pub use config::{Config, FreeProtection, LayoutMode};
pub use engine::{AllocFlags, CounterSnapshot, GuardAllocator};
pub use zone::{Zone, ZoneStats};
