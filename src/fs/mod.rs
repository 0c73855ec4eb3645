//! Host-filesystem operations, one file per opcode, mirroring the
//! predecessor crate's `vfs/`-per-procedure layout (`spec.md` §4.5 "FS
//! operations").
//!
//! Every function here operates on an already-sandbox-resolved absolute
//! host [`Path`]; path normalization and sandbox confinement happen in
//! [`crate::path`] and [`crate::sandbox`] before a handler reaches these.

pub mod append;
pub mod cp;
pub mod hash;
pub mod ls;
pub mod mkdir;
pub mod mv;
pub mod read_range;
pub mod rm;
pub mod rmdir;
pub mod search;
pub mod stat;
pub mod statfs;
pub mod write_range;

use std::fs;
use std::path::Path;

use crate::status::{Error, Status};

/// Wire shape of a single `LS` entry (`spec.md` §3 "Directory entry (wire)").
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub is_dir: bool,
    pub size: u32,
    pub mtime_unix: u32,
    pub name: String,
}

pub(crate) fn mtime_unix(meta: &fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// Lists the immediate children of `dir`, sorted by ASCII-uppercase name
/// (stable), per `spec.md` §4.5 `LS`. Disk-image files are reported to the
/// caller by name only; whether they present as `type=1` to the wire is
/// decided by the dispatcher (it knows `policy.disk_images_enabled`).
pub fn list_dir(dir: &Path) -> Result<Vec<DirEntry>, Error> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let Ok(name) = entry.file_name().into_string() else { continue };
        out.push(DirEntry {
            is_dir: meta.is_dir(),
            size: meta.len().min(u32::MAX as u64) as u32,
            mtime_unix: mtime_unix(&meta),
            name,
        });
    }
    out.sort_by(|a, b| a.name.to_ascii_uppercase().cmp(&b.name.to_ascii_uppercase()));
    Ok(out)
}

/// Sums the byte length of every regular file at or below `root`, for the
/// per-root usage cache (`spec.md` §4.7).
pub fn compute_usage(root: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

pub(crate) fn not_a_dir() -> Error {
    Error::Status(Status::NotADir)
}

pub(crate) fn is_a_dir() -> Error {
    Error::Status(Status::IsADir)
}

pub(crate) fn not_found() -> Error {
    Error::Status(Status::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn list_dir_sorted_uppercase() {
        let dir = tempdir().unwrap();
        for name in ["banana.txt", "Apple.txt", "cherry.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let entries = list_dir(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["Apple.txt", "banana.txt", "cherry.txt"]);
    }

    #[test]
    fn usage_sums_nested_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), vec![0u8; 20]).unwrap();
        assert_eq!(compute_usage(dir.path()).unwrap(), 30);
    }
}
