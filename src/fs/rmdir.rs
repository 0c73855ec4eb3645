//! `RMDIR` on the host filesystem (`spec.md` §4.5). Removing a disk-image
//! mount itself, or a D81 partition, is handled by the dispatcher before it
//! reaches here.

use std::path::Path;

use super::not_a_dir;
use crate::status::{Error, Status};

pub fn rmdir(path: &Path, recursive: bool) -> Result<(), Error> {
    if !path.is_dir() {
        if path.exists() {
            return Err(not_a_dir());
        }
        return Err(Error::Status(Status::NotFound));
    }
    let is_empty = std::fs::read_dir(path)?.next().is_none();
    if is_empty {
        std::fs::remove_dir(path)?;
    } else if recursive {
        std::fs::remove_dir_all(path)?;
    } else {
        return Err(Error::Status(Status::DirNotEmpty));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn removes_empty_directory() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("SUB");
        std::fs::create_dir(&sub).unwrap();
        rmdir(&sub, false).unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn non_empty_without_recursive_fails() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("SUB");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("a.txt"), b"x").unwrap();
        assert!(matches!(rmdir(&sub, false), Err(Error::Status(Status::DirNotEmpty))));
    }

    #[test]
    fn non_empty_with_recursive_succeeds() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("SUB");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("a.txt"), b"x").unwrap();
        rmdir(&sub, true).unwrap();
        assert!(!sub.exists());
    }
}
