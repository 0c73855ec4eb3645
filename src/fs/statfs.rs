//! `STATFS`: host-filesystem capacity for a root (`spec.md` §4.5).
//!
//! The crate's dependency stack carries no `statvfs`/platform-stats crate
//! (the predecessor never needed one), and `spec.md` explicitly allows
//! `total`/`free` to read `0` "on unknown platforms" rather than requiring
//! one be added just for this. `used` is always meaningful: it comes from
//! [`crate::fs::compute_usage`] / the usage cache, not from this module.

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub total: u32,
    pub free: u32,
}

/// Best-effort host capacity; `(0, 0)` until a platform-stats source is
/// wired in (`spec.md` §9 open question (a) territory: this crate declines
/// to guess rather than approximate).
pub fn statfs() -> StatFs {
    StatFs::default()
}

pub fn clamp_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_large_values_to_u32_max() {
        assert_eq!(clamp_u32(u64::MAX), u32::MAX);
        assert_eq!(clamp_u32(42), 42);
    }
}
