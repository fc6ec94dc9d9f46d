use crate::util::{FREE_CACHE_DEFAULT, MIN_SIZE_DEFAULT, RESERVE_SIZE_DEFAULT};

/// Where the guard page sits relative to the element.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LayoutMode {
    /// Guard page after the element's range; residue before the element
    /// catches underruns at free time, the guard catches overruns live.
    Overflow,
    /// Guard page before the element; the guard catches underruns live,
    /// residue after the trailing header catches overruns at free time.
    Underflow,
}

/// What happens to a freed range while it sits in the free-VA cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FreeProtection {
    /// Inaccessible: any touch of the freed element faults.
    None,
    /// Read-only: writes fault, reads (and header inspection) still work.
    ReadOnly,
}

/// Frozen engine configuration, produced once from boot tokens.
#[derive(Clone, Debug)]
pub struct Config {
    pub enabled: bool,
    /// Track zones with element size in `min_elem_size..=max_elem_size`.
    pub min_elem_size: u32,
    pub max_elem_size: u32,
    /// Free-VA cache capacity per tracked zone; 0 releases on free.
    pub free_cache_size: u32,
    pub prot_on_free: FreeProtection,
    pub layout_mode: LayoutMode,
    pub consistency_checks: bool,
    pub double_free_check: bool,
    /// Arena size multiplier relative to the parent zone map.
    pub zonemap_scale: u32,
    /// Zone tracked by name regardless of size.
    pub named_zone: Option<String>,
    /// Pre-VM bootstrap reserve size; no boot token, constructor-settable.
    pub reserve_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Config {
    pub fn disabled() -> Self {
        Config {
            enabled: false,
            min_elem_size: u32::MAX,
            max_elem_size: 0,
            free_cache_size: FREE_CACHE_DEFAULT,
            prot_on_free: FreeProtection::None,
            layout_mode: LayoutMode::Overflow,
            consistency_checks: true,
            double_free_check: true,
            zonemap_scale: 1,
            named_zone: None,
            reserve_size: RESERVE_SIZE_DEFAULT,
        }
    }

    /// Parse a flat string of boot tokens.
    ///
    /// Tokens are applied in a fixed order regardless of their position in
    /// the string, so `max=512 min=64` and `min=64 max=512` agree: `enable`
    /// first, then `min=`, `max=`, `size=`, then the tuning tokens, then
    /// `name=`, and `disable` last (it wins over every enable). Unknown
    /// tokens and unparsable values are ignored.
    pub fn from_boot_args(args: &str) -> Config {
        let mut cfg = Config::disabled();

        if has_flag(args, "enable") {
            cfg.enabled = true;
            cfg.min_elem_size = MIN_SIZE_DEFAULT;
            cfg.max_elem_size = u32::MAX;
        }

        if let Some(min) = value_of(args, "min") {
            cfg.enabled = true;
            cfg.min_elem_size = min;
            cfg.max_elem_size = u32::MAX;
        }

        if let Some(max) = value_of(args, "max") {
            cfg.enabled = true;
            cfg.max_elem_size = max;
            if cfg.min_elem_size == u32::MAX {
                cfg.min_elem_size = 0;
            }
        }

        if let Some(size) = value_of(args, "size") {
            cfg.enabled = true;
            cfg.min_elem_size = size;
            cfg.max_elem_size = size;
        }

        if let Some(fc) = value_of(args, "fc_size") {
            cfg.free_cache_size = fc;
        }

        if has_flag(args, "wp") {
            cfg.prot_on_free = FreeProtection::ReadOnly;
        }

        if has_flag(args, "uf_mode") {
            cfg.layout_mode = LayoutMode::Underflow;
        }

        if has_flag(args, "no_dfree_check") {
            cfg.double_free_check = false;
        }

        if let Some(scale) = value_of(args, "zscale") {
            cfg.zonemap_scale = scale;
        }

        if has_flag(args, "noconsistency") {
            cfg.consistency_checks = false;
        }

        if let Some(name) = raw_value_of(args, "name") {
            cfg.enabled = true;
            cfg.named_zone = Some(name.to_string());
        }

        if has_flag(args, "disable") {
            cfg.enabled = false;
        }

        cfg
    }

    /// The tracking predicate: a zone is routed through the engine iff the
    /// engine is enabled and the zone matches by name or by size range.
    pub fn tracks_zone(&self, name: &str, elem_size: usize) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(pattern) = &self.named_zone {
            if zone_name_matches(name, pattern) {
                return true;
            }
        }
        elem_size >= self.min_elem_size as usize && elem_size <= self.max_elem_size as usize
    }
}

/// Zone-name matching for the `name=` token: characters must agree, except
/// that a period in the pattern matches a space in the zone name.
pub fn zone_name_matches(zone_name: &str, pattern: &str) -> bool {
    if pattern.is_empty() || zone_name.len() != pattern.len() {
        return false;
    }
    zone_name
        .bytes()
        .zip(pattern.bytes())
        .all(|(z, p)| z == p || (z == b' ' && p == b'.'))
}

fn has_flag(args: &str, flag: &str) -> bool {
    args.split_whitespace().any(|t| t == flag)
}

fn raw_value_of<'a>(args: &'a str, key: &str) -> Option<&'a str> {
    args.split_whitespace().find_map(|t| {
        let rest = t.strip_prefix(key)?;
        rest.strip_prefix('=')
    })
}

fn value_of(args: &str, key: &str) -> Option<u32> {
    raw_value_of(args, key)?.parse().ok()
}
