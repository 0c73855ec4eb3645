//! `MKDIR` on the host filesystem (`spec.md` §4.5). Disk-image creation
//! (`foo.d64`/`.d71`/`.d81` leaves, D81 partitions) is handled by the
//! dispatcher before it reaches here — this module only ever sees plain
//! host directories.

use std::path::Path;

use crate::status::{Error, Status};

pub fn mkdir(path: &Path, parents: bool) -> Result<(), Error> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(Error::Status(Status::AlreadyExists));
    }
    if parents {
        std::fs::create_dir_all(path)?;
    } else {
        let Some(parent) = path.parent() else { return Err(Error::Status(Status::NotFound)) };
        if !parent.is_dir() {
            return Err(Error::Status(Status::NotFound));
        }
        std::fs::create_dir(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_new_directory() {
        let dir = tempdir().unwrap();
        mkdir(&dir.path().join("SUB"), false).unwrap();
        assert!(dir.path().join("SUB").is_dir());
    }

    #[test]
    fn existing_directory_is_ok() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("SUB");
        std::fs::create_dir(&sub).unwrap();
        mkdir(&sub, false).unwrap();
    }

    #[test]
    fn existing_file_is_already_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("F");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(mkdir(&path, false), Err(Error::Status(Status::AlreadyExists))));
    }

    #[test]
    fn missing_parent_without_parents_flag_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A/B");
        assert!(matches!(mkdir(&path, false), Err(Error::Status(Status::NotFound))));
    }

    #[test]
    fn parents_flag_creates_intermediate_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A/B/C");
        mkdir(&path, true).unwrap();
        assert!(path.is_dir());
    }
}
