//! `HASH`: CRC32 of a host file's contents (`spec.md` §4.5, §6 `ALGO`).
//! SHA-1 (`ALGO=1`) is an advertised-but-unimplemented bit per `spec.md`
//! §1 Non-goals; the dispatcher rejects it with `NOT_SUPPORTED` before
//! reaching here.

use std::io::Read;
use std::path::Path;

use crate::status::Error;

pub fn hash_crc32(path: &Path) -> Result<u32, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn matches_crc32fast_of_raw_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let payload = vec![0x01, 0x08, 0x0B, 0x08, 0x01, 0x00, 0x9E];
        std::fs::write(&path, &payload).unwrap();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        assert_eq!(hash_crc32(&path).unwrap(), hasher.finalize());
    }
}
