//! `MV` on the host filesystem (`spec.md` §4.5): rename/move with a
//! rename fast path and a copy+delete fallback across devices. Moves that
//! cross a disk-image mount boundary are rejected by the dispatcher before
//! reaching here (`NOT_SUPPORTED`).

use std::path::Path;

use super::cp::{copy_dir_recursive, copy_file};
use crate::status::{Error, Status};

pub fn mv(src: &Path, dst: &Path, overwrite: bool) -> Result<(), Error> {
    if dst.exists() && !overwrite {
        return Err(Error::Status(Status::AlreadyExists));
    }
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Likely cross-device; fall back to copy+delete.
            if src.is_dir() {
                copy_dir_recursive(src, dst, overwrite)?;
                std::fs::remove_dir_all(src)?;
            } else {
                copy_file(src, dst, overwrite)?;
                std::fs::remove_file(src)?;
            }
            Ok(())
        }
    }
}

/// Applies `spec.md` §4.5 `MV`'s disk-image-extension rule: renaming a
/// mounted image's extension away is refused unless the token opts in
/// (`disk_images_allow_rename_convert`); an omitted extension is silently
/// reattached rather than treated as a conversion.
pub fn reconcile_image_extension(
    old_name: &str,
    new_name: &str,
    allow_convert: bool,
) -> Result<String, Error> {
    let old_ext = old_name.rsplit_once('.').map(|(_, e)| e.to_ascii_uppercase());
    let Some(old_ext) = old_ext else { return Ok(new_name.to_string()) };
    if !matches!(old_ext.as_str(), "D64" | "D71" | "D81") {
        return Ok(new_name.to_string());
    }

    match new_name.rsplit_once('.') {
        Some((_, new_ext)) if new_ext.eq_ignore_ascii_case(&old_ext) => Ok(new_name.to_string()),
        Some(_) if !allow_convert => Err(Error::Status(Status::NotSupported)),
        Some(_) => Ok(new_name.to_string()),
        None => Ok(format!("{new_name}.{old_ext}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn renames_within_same_directory() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("OLD.TXT");
        std::fs::write(&src, b"hi").unwrap();
        let dst = dir.path().join("NEW.TXT");
        mv(&src, &dst, false).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"hi");
    }

    #[test]
    fn refuses_overwrite_without_flag() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("A.TXT");
        let dst = dir.path().join("B.TXT");
        std::fs::write(&src, b"a").unwrap();
        std::fs::write(&dst, b"b").unwrap();
        assert!(matches!(mv(&src, &dst, false), Err(Error::Status(Status::AlreadyExists))));
    }

    #[test]
    fn extension_omitted_is_reattached() {
        let result = reconcile_image_extension("DISK.D64", "RENAMED", false).unwrap();
        assert_eq!(result, "RENAMED.D64");
    }

    #[test]
    fn extension_change_refused_without_opt_in() {
        let err = reconcile_image_extension("DISK.D64", "DISK.D71", false).unwrap_err();
        assert!(matches!(err, Error::Status(Status::NotSupported)));
    }

    #[test]
    fn extension_change_allowed_with_opt_in() {
        let result = reconcile_image_extension("DISK.D64", "DISK.D71", true).unwrap();
        assert_eq!(result, "DISK.D71");
    }

    #[test]
    fn same_extension_passes_through() {
        let result = reconcile_image_extension("DISK.D64", "RENAMED.D64", false).unwrap();
        assert_eq!(result, "RENAMED.D64");
    }
}
