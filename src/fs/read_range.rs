//! `READ_RANGE`: bounded read from an offset (`spec.md` §4.5).

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::status::{Error, Status};

/// Reads up to `length` bytes starting at `offset`. `offset > size` is
/// `RANGE_INVALID`; `offset == size` succeeds with an empty result.
pub fn read_range(path: &Path, offset: u32, length: u16) -> Result<Vec<u8>, Error> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    if offset as u64 > size {
        return Err(Error::Status(Status::RangeInvalid));
    }
    if offset as u64 == size {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(offset as u64))?;
    let available = size - offset as u64;
    let to_read = (length as u64).min(available) as usize;
    let mut buf = vec![0u8; to_read];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_middle_slice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        assert_eq!(read_range(&path, 2, 4).unwrap(), b"2345");
    }

    #[test]
    fn offset_equal_size_is_empty_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(read_range(&path, 5, 10).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn offset_past_eof_is_range_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert!(matches!(read_range(&path, 6, 1), Err(Error::Status(Status::RangeInvalid))));
    }

    #[test]
    fn length_clamped_to_remaining_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(read_range(&path, 3, 100).unwrap(), b"lo");
    }
}
