//! `WRITE_RANGE`: offset write with create/truncate/overwrite gating
//! (`spec.md` §4.5).

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::status::{Error, Status};

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    pub create: bool,
    pub truncate: bool,
    pub overwrite: bool,
}

/// The byte size the file would have after the write, without performing
/// any I/O. Used by the dispatcher to pre-check per-file cap and quota
/// before opening the file (`spec.md` §4.5, §4.7).
pub fn projected_size(old_size: u64, offset: u32, data_len: usize, truncate: bool) -> u64 {
    if truncate {
        data_len as u64
    } else {
        (offset as u64 + data_len as u64).max(old_size)
    }
}

/// Validates the gating rules. Must be called before any write happens.
pub fn validate(
    exists: bool,
    old_size: u64,
    offset: u32,
    flags: WriteFlags,
    overwrite_feature_enabled: bool,
) -> Result<(), Error> {
    if flags.truncate && offset != 0 {
        return Err(Error::Status(Status::BadRequest));
    }
    if !exists && !flags.create {
        return Err(Error::Status(Status::NotFound));
    }
    if exists && old_size > 0 {
        if !flags.truncate && offset == 0 {
            return Err(Error::Status(Status::AlreadyExists));
        }
        if flags.truncate && overwrite_feature_enabled && !flags.overwrite {
            return Err(Error::Status(Status::AlreadyExists));
        }
    }
    if offset as u64 > old_size {
        return Err(Error::Status(Status::RangeInvalid));
    }
    Ok(())
}

/// Performs the write and returns the signed byte delta to apply to the
/// root's cached usage (`spec.md` §4.7).
pub fn write_range(path: &Path, offset: u32, data: &[u8], flags: WriteFlags) -> Result<i64, Error> {
    let old_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let mut file = OpenOptions::new().write(true).create(flags.create).truncate(false).open(path)?;
    if flags.truncate {
        file.set_len(0)?;
    }
    file.seek(SeekFrom::Start(offset as u64))?;
    file.write_all(data)?;

    let new_size = projected_size(old_size, offset, data.len(), flags.truncate);
    Ok(new_size as i64 - old_size as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_file_at_offset_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let flags = WriteFlags { create: true, truncate: false, overwrite: false };
        validate(false, 0, 0, flags, true).unwrap();
        let delta = write_range(&path, 0, b"hello", flags).unwrap();
        assert_eq!(delta, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn write_into_existing_nonempty_without_truncate_is_already_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"existing").unwrap();
        let flags = WriteFlags { create: false, truncate: false, overwrite: false };
        let err = validate(true, 8, 0, flags, true).unwrap_err();
        assert!(matches!(err, Error::Status(Status::AlreadyExists)));
    }

    #[test]
    fn truncate_requires_offset_zero() {
        let flags = WriteFlags { create: false, truncate: true, overwrite: true };
        let err = validate(true, 8, 4, flags, true).unwrap_err();
        assert!(matches!(err, Error::Status(Status::BadRequest)));
    }

    #[test]
    fn truncate_over_nonempty_requires_overwrite_when_feature_enabled() {
        let flags = WriteFlags { create: false, truncate: true, overwrite: false };
        let err = validate(true, 8, 0, flags, true).unwrap_err();
        assert!(matches!(err, Error::Status(Status::AlreadyExists)));

        let flags_ok = WriteFlags { create: false, truncate: true, overwrite: true };
        validate(true, 8, 0, flags_ok, true).unwrap();
    }

    #[test]
    fn sparse_write_past_eof_is_range_invalid() {
        let flags = WriteFlags { create: true, truncate: false, overwrite: false };
        let err = validate(true, 3, 10, flags, true).unwrap_err();
        assert!(matches!(err, Error::Status(Status::RangeInvalid)));
    }

    #[test]
    fn projected_size_accounts_for_truncate() {
        assert_eq!(projected_size(100, 0, 10, true), 10);
        assert_eq!(projected_size(100, 50, 10, false), 100);
        assert_eq!(projected_size(100, 95, 10, false), 105);
    }
}
