//! Maps a normalized client path into an absolute host path confined to a
//! token's root, per `spec.md` §4.3.

use std::fs;
use std::path::{Path, PathBuf};

use crate::path::NormalizedPath;
use crate::status::{Error, Status};

/// Resolves `path` against `root`, walking one segment at a time.
///
/// For each existing segment, the parent directory is listed and a
/// case-insensitive match is chosen (lexicographically smallest on
/// collisions). The walk stops descending at a symlink or a non-directory
/// intermediate; any remaining suffix is appended lexically (this is what
/// lets creation paths name a not-yet-existing leaf). The result is checked
/// to remain within `root` after cleaning.
pub fn resolve(root: &Path, path: &NormalizedPath) -> Result<PathBuf, Error> {
    let root = clean(root);
    let mut current = root.clone();

    for segment in path.segments() {
        if is_symlink(&current) {
            return Err(invalid());
        }
        if current.is_dir() {
            match find_case_insensitive(&current, segment) {
                Some(existing) => current = current.join(existing),
                None => current = current.join(segment),
            }
        } else if current.exists() {
            // Intermediate component exists but is not a directory.
            return Err(Error::Status(Status::NotADir));
        } else {
            current = current.join(segment);
        }
    }

    if is_symlink(&current) {
        return Err(invalid());
    }

    let cleaned = clean(&current);
    if !cleaned.starts_with(&root) {
        return Err(invalid());
    }
    Ok(cleaned)
}

/// Finds the child of `dir` matching `name` case-insensitively, returning
/// the smallest byte-ordered match on collisions.
fn find_case_insensitive(dir: &Path, name: &str) -> Option<String> {
    let entries = fs::read_dir(dir).ok()?;
    let mut best: Option<String> = None;
    for entry in entries.flatten() {
        let Ok(file_name) = entry.file_name().into_string() else { continue };
        if file_name.eq_ignore_ascii_case(name) {
            best = Some(match best {
                Some(prev) if prev.as_bytes() <= file_name.as_bytes() => prev,
                _ => file_name,
            });
        }
    }
    best
}

fn is_symlink(p: &Path) -> bool {
    fs::symlink_metadata(p).map(|m| m.file_type().is_symlink()).unwrap_or(false)
}

/// Lexical clean (no symlink resolution): collapses `.`/`..` components.
/// Equivalent in spirit to Go's `filepath.Clean`, referenced by `spec.md`.
fn clean(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        use std::path::Component::*;
        match comp {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Walks every component of `p` (relative to nothing; `p` must be absolute)
/// and confirms none of them, including the final one if it exists, is a
/// symlink. Used by operations that must guarantee no symlink was traversed
/// anywhere along a path they already resolved.
pub fn assert_no_symlinks(p: &Path) -> Result<(), Error> {
    let mut current = PathBuf::new();
    for comp in p.components() {
        current.push(comp);
        if current.exists() && is_symlink(&current) {
            return Err(invalid());
        }
    }
    Ok(())
}

fn invalid() -> Error {
    Error::Status(Status::InvalidPath)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::normalize;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn norm(s: &str) -> NormalizedPath {
        normalize(s, 1024, 255, false).unwrap()
    }

    #[test]
    fn resolves_inside_root() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("FOO.TXT"), b"hi").unwrap();
        let resolved = resolve(dir.path(), &norm("/foo.txt")).unwrap();
        assert_eq!(resolved, dir.path().join("FOO.TXT"));
    }

    #[test]
    fn case_insensitive_collision_picks_smallest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bbb.txt"), b"1").unwrap();
        fs::write(dir.path().join("AAA.txt"), b"2").unwrap();
        let resolved = resolve(dir.path(), &norm("/aaa.txt")).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "AAA.txt");
    }

    #[test]
    fn rejects_symlink_in_path() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("real");
        fs::create_dir(&target).unwrap();
        let link = dir.path().join("LINK");
        symlink(&target, &link).unwrap();
        let result = resolve(dir.path(), &norm("/link/file.txt"));
        assert!(matches!(result, Err(Error::Status(Status::InvalidPath))));
    }

    #[test]
    fn never_escapes_root() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        // Normalizer already strips `..`, but defend in depth here too.
        let resolved = resolve(&sub, &norm("/file.txt")).unwrap();
        assert!(resolved.starts_with(&sub));
    }

    #[test]
    fn missing_leaf_resolves_lexically_for_creation() {
        let dir = tempdir().unwrap();
        let resolved = resolve(dir.path(), &norm("/newfile.txt")).unwrap();
        assert_eq!(resolved, dir.path().join("NEWFILE.TXT"));
    }
}
