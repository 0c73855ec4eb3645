//! `STAT`: type, size, mtime for a host file or directory (`spec.md` §4.5).

use std::path::Path;

use super::mtime_unix;
use crate::status::Error;

pub struct Stat {
    pub is_dir: bool,
    pub size: u32,
    pub mtime_unix: u32,
}

pub fn stat(path: &Path) -> Result<Stat, Error> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok(Stat { is_dir: meta.is_dir(), size: meta.len().min(u32::MAX as u64) as u32, mtime_unix: mtime_unix(&meta) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stats_file_and_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let s = stat(&dir.path().join("a.txt")).unwrap();
        assert!(!s.is_dir);
        assert_eq!(s.size, 5);

        let d = stat(dir.path()).unwrap();
        assert!(d.is_dir);
    }
}
