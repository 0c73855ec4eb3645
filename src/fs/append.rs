//! `APPEND`: append bytes to the end of a file (`spec.md` §4.5).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::status::{Error, Status};

/// Appends `data` to `path`. `create` permits creating the file when
/// missing; otherwise a missing target is `NOT_FOUND`. Returns the byte
/// delta to apply to the root's usage cache.
pub fn append(path: &Path, data: &[u8], create: bool) -> Result<i64, Error> {
    if !path.exists() && !create {
        return Err(Error::Status(Status::NotFound));
    }
    let mut file = OpenOptions::new().append(true).create(create).open(path)?;
    file.write_all(data)?;
    Ok(data.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let delta = append(&path, b" world", false).unwrap();
        assert_eq!(delta, 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn missing_without_create_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert!(matches!(append(&path, b"x", false), Err(Error::Status(Status::NotFound))));
    }

    #[test]
    fn create_flag_creates_new_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.txt");
        append(&path, b"abc", true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
