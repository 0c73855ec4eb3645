//! `SEARCH`: bounded byte search across files under a base path
//! (`spec.md` §4.5).

use std::fs;
use std::path::{Path, PathBuf};

use crate::status::Error;

const PREVIEW_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    pub offset: u32,
    pub preview: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub case_insensitive: bool,
    pub recursive: bool,
    pub whole_word: bool,
    pub max_results: u16,
    pub max_scan_bytes: u32,
}

pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    /// `true` when the whole corpus was scanned without being cut short by
    /// `max_results` or `max_scan_bytes` — the caller sets `next_index` to
    /// `0xFFFF` in that case, `start_index + hits.len()` otherwise.
    pub complete: bool,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn normalize_case(bytes: &[u8], case_insensitive: bool) -> Vec<u8> {
    if case_insensitive {
        bytes.to_ascii_uppercase()
    } else {
        bytes.to_vec()
    }
}

/// Files under `base` in deterministic sorted-uppercase-path order
/// (`spec.md` §4.5 "Streams files deterministically").
fn candidate_files(base: &Path, recursive: bool) -> Result<Vec<PathBuf>, Error> {
    let mut out = Vec::new();
    if recursive {
        let mut stack = vec![base.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }
    } else {
        for entry in fs::read_dir(base)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(entry.path());
            }
        }
    }
    out.sort_by(|a, b| {
        a.to_string_lossy().to_ascii_uppercase().cmp(&b.to_string_lossy().to_ascii_uppercase())
    });
    Ok(out)
}

/// Searches `base` (and, if `opts.recursive`, everything below it) for
/// `query`, resuming at the `start_index`-th match. `label` turns an
/// absolute host path into the client-facing path string for a hit.
pub fn search(
    base: &Path,
    query: &[u8],
    start_index: u16,
    opts: &SearchOptions,
    label: impl Fn(&Path) -> String,
) -> Result<SearchResult, Error> {
    let files = candidate_files(base, opts.recursive)?;
    let needle = normalize_case(query, opts.case_insensitive);
    if needle.is_empty() {
        return Ok(SearchResult { hits: Vec::new(), complete: true });
    }

    let mut global_index: u32 = 0;
    let mut hits = Vec::new();
    let mut scanned: u32 = 0;
    let mut complete = true;

    'files: for path in &files {
        let Ok(data) = fs::read(path) else { continue };
        let haystack = normalize_case(&data, opts.case_insensitive);

        let mut pos = 0usize;
        while pos + needle.len() <= haystack.len() {
            if scanned >= opts.max_scan_bytes {
                complete = false;
                break 'files;
            }
            scanned += 1;

            if haystack[pos..pos + needle.len()] == needle[..] {
                let word_ok = !opts.whole_word || {
                    let before_ok = pos == 0 || !is_word_byte(haystack[pos - 1]);
                    let after = pos + needle.len();
                    let after_ok = after >= haystack.len() || !is_word_byte(haystack[after]);
                    before_ok && after_ok
                };
                if word_ok {
                    if global_index >= start_index as u32 {
                        if hits.len() >= opts.max_results as usize {
                            complete = false;
                            break 'files;
                        }
                        let preview_end = (pos + PREVIEW_LEN).min(data.len());
                        hits.push(SearchHit {
                            path: label(path),
                            offset: pos as u32,
                            preview: data[pos..preview_end].to_vec(),
                        });
                    }
                    global_index += 1;
                }
            }
            pos += 1;
        }
    }

    Ok(SearchResult { hits, complete })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts() -> SearchOptions {
        SearchOptions {
            case_insensitive: false,
            recursive: false,
            whole_word: false,
            max_results: 100,
            max_scan_bytes: 1_000_000,
        }
    }

    #[test]
    fn finds_match_with_offset_and_preview() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.TXT"), b"hello world, hello again").unwrap();
        let result = search(dir.path(), b"hello", 0, &opts(), |p| p.display().to_string()).unwrap();
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[0].offset, 0);
        assert_eq!(result.hits[1].offset, 13);
        assert!(result.complete);
    }

    #[test]
    fn case_insensitive_flag_matches_regardless_of_case() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.TXT"), b"Hello HELLO hello").unwrap();
        let mut o = opts();
        o.case_insensitive = true;
        let result = search(dir.path(), b"hello", 0, &o, |p| p.display().to_string()).unwrap();
        assert_eq!(result.hits.len(), 3);
    }

    #[test]
    fn whole_word_excludes_substring_matches() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.TXT"), b"cat catalog cat").unwrap();
        let mut o = opts();
        o.whole_word = true;
        let result = search(dir.path(), b"cat", 0, &o, |p| p.display().to_string()).unwrap();
        assert_eq!(result.hits.len(), 2);
    }

    #[test]
    fn max_results_truncates_and_reports_incomplete() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.TXT"), b"aaaa").unwrap();
        let mut o = opts();
        o.max_results = 1;
        let result = search(dir.path(), b"a", 0, &o, |p| p.display().to_string()).unwrap();
        assert_eq!(result.hits.len(), 1);
        assert!(!result.complete);
    }

    #[test]
    fn start_index_resumes_mid_corpus() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.TXT"), b"aaaa").unwrap();
        let result = search(dir.path(), b"a", 2, &opts(), |p| p.display().to_string()).unwrap();
        assert_eq!(result.hits.len(), 2);
    }

    #[test]
    fn recursive_descends_into_subdirectories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("SUB")).unwrap();
        std::fs::write(dir.path().join("SUB/B.TXT"), b"needle here").unwrap();
        let mut o = opts();
        o.recursive = true;
        let result = search(dir.path(), b"needle", 0, &o, |p| p.display().to_string()).unwrap();
        assert_eq!(result.hits.len(), 1);
    }
}
