//! `CP` on the host filesystem (`spec.md` §4.5). Transitions that cross a
//! disk-image mount boundary are orchestrated by the dispatcher, which
//! reads/writes through the image codecs directly; this module only
//! handles the host-to-host leg (a plain file, or a recursive directory,
//! entirely outside any `.d64`/`.d71`/`.d81`).

use std::path::Path;

use super::is_a_dir;
use crate::status::{Error, Status};

/// Copies a single file, honoring the overwrite gate (`spec.md` §4.5 `CP`,
/// mirroring `WRITE_RANGE`'s semantics).
pub fn copy_file(src: &Path, dst: &Path, overwrite: bool) -> Result<u64, Error> {
    if src.is_dir() {
        return Err(is_a_dir());
    }
    if dst.exists() && !overwrite {
        return Err(Error::Status(Status::AlreadyExists));
    }
    let bytes = std::fs::copy(src, dst)?;
    Ok(bytes)
}

/// Recursively copies a directory tree. `overwrite` gates pre-existing
/// files at the destination; directories are merged.
pub fn copy_dir_recursive(src: &Path, dst: &Path, overwrite: bool) -> Result<(), Error> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to, overwrite)?;
        } else {
            copy_file(&from, &to, overwrite)?;
        }
    }
    Ok(())
}

/// If `dst` names an existing directory, appends `src`'s basename to form
/// the real destination path (`spec.md` §4.5 `CP`).
pub fn resolve_destination(src: &Path, dst: &Path) -> std::path::PathBuf {
    if dst.is_dir() {
        match src.file_name() {
            Some(name) => dst.join(name),
            None => dst.to_path_buf(),
        }
    } else {
        dst.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copies_file_contents() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dst = dir.path().join("b.txt");
        copy_file(&src, &dst, false).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn refuses_overwrite_without_flag() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dst = dir.path().join("b.txt");
        std::fs::write(&dst, b"existing").unwrap();
        assert!(matches!(copy_file(&src, &dst, false), Err(Error::Status(Status::AlreadyExists))));
        copy_file(&src, &dst, true).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn destination_directory_appends_basename() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("SUB");
        std::fs::create_dir(&sub).unwrap();
        let src = dir.path().join("FILE.TXT");
        let resolved = resolve_destination(&src, &sub);
        assert_eq!(resolved, sub.join("FILE.TXT"));
    }

    #[test]
    fn recursive_copy_preserves_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), b"1").unwrap();
        std::fs::write(src.join("nested/b.txt"), b"2").unwrap();

        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst, false).unwrap();
        assert_eq!(std::fs::read(dst.join("a.txt")).unwrap(), b"1");
        assert_eq!(std::fs::read(dst.join("nested/b.txt")).unwrap(), b"2");
    }
}
