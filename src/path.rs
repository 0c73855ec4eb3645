//! Client path normalization, per `spec.md` §4.2.
//!
//! Pure function over `&str`: no filesystem access happens here. Grounded on
//! the predecessor's `vfs::MAX_NAME_LEN` / `MAX_PATH_LEN` constants, adapted
//! to the ASCII-uppercase canonicalization rule this protocol requires.

use crate::status::{Error, Status};

/// Windows-reserved device names, checked case-insensitively per segment.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const ILLEGAL_PUNCTUATION: &[char] = &[':', '"', '<', '>', '|'];

/// A normalized, canonical path: always begins with `/`, uppercase ASCII,
/// `/`-separated, free of `..`, trailing slashes (except root), and illegal
/// characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, excluding the leading empty segment from `/`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Final segment, or `None` for the root path.
    pub fn basename(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Parent path, or `None` for the root path.
    pub fn parent(&self) -> Option<NormalizedPath> {
        let segs: Vec<&str> = self.segments().collect();
        if segs.is_empty() {
            return None;
        }
        let parent_segs = &segs[..segs.len() - 1];
        Some(NormalizedPath(format!("/{}", parent_segs.join("/"))))
    }

    pub fn join(&self, child: &str) -> NormalizedPath {
        if self.is_root() {
            NormalizedPath(format!("/{child}"))
        } else {
            NormalizedPath(format!("{}/{child}", self.0))
        }
    }

    /// Builds a canonical path from segments already known to be uppercase
    /// and validated (e.g. a prefix split off another normalized path by
    /// [`crate::image::split_at_mount`]). Used by the dispatcher to resolve
    /// the host path of the image file itself, separately from the path
    /// inside it.
    pub(crate) fn from_segments(segments: &[String]) -> NormalizedPath {
        if segments.is_empty() {
            NormalizedPath("/".to_string())
        } else {
            NormalizedPath(format!("/{}", segments.join("/")))
        }
    }
}

fn is_reserved_name(segment: &str) -> bool {
    let upper = segment.to_ascii_uppercase();
    let stem = upper.split('.').next().unwrap_or(&upper);
    RESERVED_NAMES.contains(&stem)
}

/// Normalizes a raw client path string.
///
/// `allow_wildcard` permits `*`/`?` confined to the final segment only (used
/// by `read_path` parsing for ops that support wildcard bulk copy, per
/// `spec.md` §4.5 `CP`).
pub fn normalize(
    raw: &str,
    max_path: usize,
    max_name: usize,
    allow_wildcard: bool,
) -> Result<NormalizedPath, Error> {
    if raw.is_empty() {
        return Ok(NormalizedPath("/".to_string()));
    }
    if raw.contains('\\') || raw.contains('\0') {
        return Err(invalid());
    }
    if raw.chars().any(|c| c.is_control() || c == '\u{7F}') {
        return Err(invalid());
    }
    if raw.chars().any(|c| ILLEGAL_PUNCTUATION.contains(&c)) {
        return Err(invalid());
    }

    let raw_segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();

    let mut segments: Vec<String> = Vec::with_capacity(raw_segments.len());
    for (i, seg) in raw_segments.iter().enumerate() {
        if *seg == ".." {
            return Err(invalid());
        }
        if *seg == "." {
            continue;
        }
        let is_last = i == raw_segments.len() - 1;
        let has_wildcard = seg.contains('*') || seg.contains('?');
        if has_wildcard && !(allow_wildcard && is_last) {
            return Err(invalid());
        }
        if seg.len() > max_name {
            return Err(invalid());
        }
        if seg.ends_with(' ') || seg.ends_with('.') {
            return Err(invalid());
        }
        if is_reserved_name(seg) {
            return Err(invalid());
        }
        segments.push(seg.to_ascii_uppercase());
    }

    let canonical = if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    };

    if canonical.len() > max_path {
        return Err(invalid());
    }

    Ok(NormalizedPath(canonical))
}

fn invalid() -> Error {
    Error::Status(Status::InvalidPath)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_PATH: usize = 1024;
    const MAX_NAME: usize = 255;

    fn n(raw: &str) -> Result<NormalizedPath, Error> {
        normalize(raw, MAX_PATH, MAX_NAME, false)
    }

    #[test]
    fn empty_is_root() {
        assert_eq!(n("").unwrap().as_str(), "/");
    }

    #[test]
    fn uppercases_and_collapses_slashes() {
        assert_eq!(n("/foo//bar/./baz").unwrap().as_str(), "/FOO/BAR/BAZ");
    }

    #[test]
    fn rejects_dotdot() {
        assert!(n("/../ETC/PASSWD").is_err());
        assert!(n("/A/B/../../C").is_err());
    }

    #[test]
    fn rejects_backslash_nul_control_del() {
        assert!(n("/A\\B").is_err());
        assert!(n("/A\0B").is_err());
        assert!(n("/A\nB").is_err());
        assert!(n("/A\u{7F}B").is_err());
    }

    #[test]
    fn rejects_reserved_device_names() {
        assert!(n("/CON").is_err());
        assert!(n("/com1").is_err());
        assert!(n("/LPT3.TXT").is_err());
    }

    #[test]
    fn rejects_trailing_space_or_dot_segment() {
        assert!(n("/FOO ").is_err());
        assert!(n("/FOO.").is_err());
    }

    #[test]
    fn wildcard_rejected_unless_enabled_and_final_segment() {
        assert!(n("/FOO*/BAR").is_err());
        assert!(normalize("/FOO*/BAR", MAX_PATH, MAX_NAME, true).is_err());
        assert!(normalize("/FOO/BAR*", MAX_PATH, MAX_NAME, true).is_ok());
        assert!(normalize("/FOO/BAR*", MAX_PATH, MAX_NAME, false).is_err());
    }

    #[test]
    fn idempotent() {
        for raw in ["/a/b/c", "/FOO//BAR/./BAZ", ""] {
            let once = n(raw).unwrap();
            let twice = n(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn canonical_invariant_under_case() {
        let lower = n("/foo/bar").unwrap();
        let upper = n("/FOO/BAR").unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn segment_and_total_length_limits() {
        let long_name = "A".repeat(300);
        assert!(normalize(&format!("/{long_name}"), MAX_PATH, MAX_NAME, false).is_err());

        let long_path = format!("/{}", "AB/".repeat(1000));
        assert!(normalize(&long_path, MAX_PATH, MAX_NAME, false).is_err());
    }

    #[test]
    fn basename_and_parent() {
        let p = n("/SUB/GAME.PRG").unwrap();
        assert_eq!(p.basename(), Some("GAME.PRG"));
        assert_eq!(p.parent().unwrap().as_str(), "/SUB");
        assert_eq!(n("/").unwrap().parent(), None);
    }
}
