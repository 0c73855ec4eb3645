//! `RM`: deletes a single host file (`spec.md` §4.5). Trash diversion is
//! decided by the dispatcher, which calls [`crate::trash::divert`] instead
//! of this function when trash is enabled and the target isn't already
//! reserved.

use std::path::Path;

use super::is_a_dir;
use crate::status::{Error, Status};

pub fn rm(path: &Path) -> Result<u64, Error> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Status(Status::NotFound)
        } else {
            e.into()
        }
    })?;
    if meta.is_dir() {
        return Err(is_a_dir());
    }
    let size = meta.len();
    std::fs::remove_file(path)?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn removes_file_and_returns_its_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(rm(&path).unwrap(), 5);
        assert!(!path.exists());
    }

    #[test]
    fn directory_target_is_is_a_dir() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("SUB");
        std::fs::create_dir(&sub).unwrap();
        assert!(matches!(rm(&sub), Err(Error::Status(Status::IsADir))));
    }

    #[test]
    fn missing_target_is_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(rm(&dir.path().join("nope")), Err(Error::Status(Status::NotFound))));
    }
}
