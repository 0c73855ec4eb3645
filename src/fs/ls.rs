//! `LS`: paginated directory listing (`spec.md` §4.5).

use std::path::Path;

use super::{list_dir, not_a_dir, DirEntry};
use crate::status::Error;

/// Index returned when the listing is complete.
pub const END_OF_LIST: u16 = 0xFFFF;

pub struct Page {
    pub entries: Vec<DirEntry>,
    pub next_index: u16,
}

/// Returns up to `max_entries` entries starting at `start_index`, stopping
/// early if a caller-supplied `fits` predicate says the next entry would
/// overflow the response payload budget (`spec.md` §4.5 `LS`).
pub fn list_page(
    dir: &Path,
    start_index: u16,
    max_entries: u16,
    mut fits: impl FnMut(&DirEntry) -> bool,
) -> Result<Page, Error> {
    if !dir.is_dir() {
        return Err(not_a_dir());
    }
    let all = list_dir(dir)?;
    let start = start_index as usize;
    if start >= all.len() {
        return Ok(Page { entries: Vec::new(), next_index: END_OF_LIST });
    }

    let mut entries = Vec::new();
    let mut idx = start;
    while idx < all.len() && entries.len() < max_entries as usize {
        if !fits(&all[idx]) {
            break;
        }
        entries.push(all[idx].clone());
        idx += 1;
    }

    let next_index = if idx >= all.len() { END_OF_LIST } else { idx as u16 };
    Ok(Page { entries, next_index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup(n: usize) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for i in 0..n {
            fs::write(dir.path().join(format!("{:02}.TXT", i)), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn paginates_in_fixed_size_pages() {
        let dir = setup(26);
        let page1 = list_page(dir.path(), 0, 10, |_| true).unwrap();
        assert_eq!(page1.entries.len(), 10);
        assert_eq!(page1.next_index, 10);

        let page2 = list_page(dir.path(), 10, 10, |_| true).unwrap();
        assert_eq!(page2.entries.len(), 10);
        assert_eq!(page2.next_index, 20);

        let page3 = list_page(dir.path(), 20, 10, |_| true).unwrap();
        assert_eq!(page3.entries.len(), 6);
        assert_eq!(page3.next_index, END_OF_LIST);
    }

    #[test]
    fn empty_directory_yields_end_of_list() {
        let dir = tempdir().unwrap();
        let page = list_page(dir.path(), 0, 10, |_| true).unwrap();
        assert_eq!(page.entries.len(), 0);
        assert_eq!(page.next_index, END_OF_LIST);
    }

    #[test]
    fn stops_early_when_payload_budget_exhausted() {
        let dir = setup(10);
        let mut seen = 0;
        let page = list_page(dir.path(), 0, 10, |_| {
            seen += 1;
            seen <= 3
        })
        .unwrap();
        assert_eq!(page.entries.len(), 3);
        assert_eq!(page.next_index, 3);
    }
}
