//! Per-token policy, per `spec.md` §3 "Token context".

use std::path::PathBuf;

/// The effective, flattened policy captured once at request entry — no
/// runtime reflection, per `spec.md` §9.
#[derive(Debug, Clone)]
pub struct Policy {
    pub root: PathBuf,
    pub display_name: Option<String>,
    pub read_only: bool,
    /// Quota in bytes, `0` = unlimited.
    pub quota_bytes: u64,
    /// Per-file cap in bytes, `0` = unlimited.
    pub per_file_cap: u64,
    pub disk_images_enabled: bool,
    pub disk_images_write_enabled: bool,
    pub disk_images_auto_resize_enabled: bool,
    pub disk_images_allow_rename_convert: bool,
    pub trash_enabled: bool,
    pub trash_dir: String,
    pub overwrite_enabled: bool,
    pub errmsg_enabled: bool,
    pub mkdir_parents_enabled: bool,
    pub rmdir_recursive_enabled: bool,
    pub cp_recursive_enabled: bool,
}

impl Policy {
    /// Combines a global server-wide policy with a token-specific override.
    /// Booleans combine by logical-OR (global wins if it restricts); quotas
    /// combine by min-nonzero (the tighter of the two, ignoring zero =
    /// unlimited), per `spec.md` §3.
    pub fn combine(global: &Policy, token: &Policy) -> Policy {
        Policy {
            root: token.root.clone(),
            display_name: token.display_name.clone(),
            read_only: global.read_only || token.read_only,
            quota_bytes: min_nonzero(global.quota_bytes, token.quota_bytes),
            per_file_cap: min_nonzero(global.per_file_cap, token.per_file_cap),
            disk_images_enabled: global.disk_images_enabled && token.disk_images_enabled,
            disk_images_write_enabled: global.disk_images_write_enabled
                && token.disk_images_write_enabled,
            disk_images_auto_resize_enabled: global.disk_images_auto_resize_enabled
                && token.disk_images_auto_resize_enabled,
            disk_images_allow_rename_convert: global.disk_images_allow_rename_convert
                && token.disk_images_allow_rename_convert,
            trash_enabled: global.trash_enabled || token.trash_enabled,
            trash_dir: token.trash_dir.clone(),
            overwrite_enabled: global.overwrite_enabled && token.overwrite_enabled,
            errmsg_enabled: global.errmsg_enabled && token.errmsg_enabled,
            mkdir_parents_enabled: global.mkdir_parents_enabled && token.mkdir_parents_enabled,
            rmdir_recursive_enabled: global.rmdir_recursive_enabled
                && token.rmdir_recursive_enabled,
            cp_recursive_enabled: global.cp_recursive_enabled && token.cp_recursive_enabled,
        }
    }
}

fn min_nonzero(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, 0) => 0,
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(root: &str) -> Policy {
        Policy {
            root: PathBuf::from(root),
            display_name: None,
            read_only: false,
            quota_bytes: 0,
            per_file_cap: 0,
            disk_images_enabled: true,
            disk_images_write_enabled: true,
            disk_images_auto_resize_enabled: true,
            disk_images_allow_rename_convert: false,
            trash_enabled: false,
            trash_dir: ".TRASH".to_string(),
            overwrite_enabled: true,
            errmsg_enabled: true,
            mkdir_parents_enabled: true,
            rmdir_recursive_enabled: true,
            cp_recursive_enabled: true,
        }
    }

    #[test]
    fn read_only_is_logical_or() {
        let mut global = base("/g");
        let token = base("/t");
        global.read_only = true;
        assert!(Policy::combine(&global, &token).read_only);
    }

    #[test]
    fn quota_is_min_nonzero() {
        let mut global = base("/g");
        let mut token = base("/t");
        global.quota_bytes = 1000;
        token.quota_bytes = 0;
        assert_eq!(Policy::combine(&global, &token).quota_bytes, 1000);

        token.quota_bytes = 500;
        assert_eq!(Policy::combine(&global, &token).quota_bytes, 500);
    }

    #[test]
    fn disk_image_toggles_require_both_enabled() {
        let mut global = base("/g");
        let token = base("/t");
        global.disk_images_write_enabled = false;
        assert!(!Policy::combine(&global, &token).disk_images_write_enabled);
    }
}
