//! Glue between the dispatcher and the three per-format codecs.
//!
//! D64 and D71 address files by a single flat, uppercased name; D81 adds
//! subdirectory partitions and therefore addresses files by a segment path.
//! Both shapes are flattened here into one [`ImageTree`]-shaped API
//! (`spec.md` §3 "CBM file entry", §4.10) so [`crate::dispatch`] doesn't
//! need to match on [`ImageKind`] at every call site.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{ImageCacheKey, ImageParseCache};
use crate::fs::mtime_unix;
use crate::image::{
    d64, d71, d81, unpad_name, CbmFileEntry, CbmFileType, ImageKind, ImageTree, SectorAddr,
};
use crate::status::{Error, Status};

/// An image parsed (or served from cache) plus the raw bytes it was parsed
/// from, since several operations (read, hash) index back into the byte
/// buffer via the tree's sector offsets.
pub struct Loaded {
    pub data: Vec<u8>,
    pub tree: Arc<ImageTree>,
}

/// Loads `path` from disk and parses it, reusing a cached parse when the
/// file's `(mtime, size)` still matches (`spec.md` §3 Lifecycle).
pub fn load(cache: &ImageParseCache, path: &Path, kind: ImageKind) -> Result<Loaded, Error> {
    let data = std::fs::read(path)?;
    let meta = std::fs::metadata(path)?;
    let key = ImageCacheKey { mtime_unix: mtime_unix(&meta) as u64, size: data.len() as u64 };

    let path_buf = path.to_path_buf();
    if let Some(tree) = cache.get(&path_buf, key) {
        return Ok(Loaded { data, tree });
    }
    let tree = parse_by_kind(kind, &data)?;
    let tree = Arc::new(tree);
    cache.set(path_buf, key, tree.clone());
    Ok(Loaded { data, tree })
}

fn parse_by_kind(kind: ImageKind, data: &[u8]) -> Result<ImageTree, Error> {
    match kind {
        ImageKind::D64 => d64::parse(data),
        ImageKind::D71 => d71::parse(data),
        ImageKind::D81 => d81::parse(data),
    }
}

pub fn format_empty(kind: ImageKind, disk_name: &str, disk_id: &str) -> Vec<u8> {
    match kind {
        ImageKind::D64 => d64::format_empty(disk_name, disk_id),
        ImageKind::D71 => d71::format_empty(disk_name, disk_id),
        ImageKind::D81 => d81::format_empty(disk_name, disk_id),
    }
}

pub fn formatted_free_blocks(kind: ImageKind) -> u16 {
    match kind {
        ImageKind::D64 => d64::FORMATTED_FREE_BLOCKS,
        ImageKind::D71 => d71::FORMATTED_FREE_BLOCKS,
        ImageKind::D81 => d81::FORMATTED_FREE_BLOCKS,
    }
}

/// What a resolved in-image path names.
pub enum Target<'a> {
    /// The image's mount root itself (`inner_segments` was empty).
    Root,
    /// A D81 subdirectory partition.
    Dir(&'a ImageTree),
    File(&'a CbmFileEntry),
}

/// Descends `tree` through `inner` (already-uppercased path segments past
/// the image file itself). D64/D71 trees never populate `dirs`, so any
/// attempt to descend through a non-leaf segment there naturally falls
/// through to `NotADir`/`NotFound` without per-kind branching.
pub fn navigate<'a>(
    tree: &'a ImageTree,
    inner: &[String],
    prg_fallback_enabled: bool,
) -> Result<Target<'a>, Error> {
    if inner.is_empty() {
        return Ok(Target::Root);
    }
    let mut node = tree;
    for (i, seg) in inner.iter().enumerate() {
        let is_last = i == inner.len() - 1;
        if is_last {
            if let Some(f) = node.files.get(seg) {
                return Ok(Target::File(f));
            }
            if let Some(d) = node.dirs.get(seg) {
                return Ok(Target::Dir(d));
            }
            if prg_fallback_enabled && !seg.ends_with(".PRG") {
                let with_ext = format!("{seg}.PRG");
                if let Some(f) = node.files.get(&with_ext) {
                    return Ok(Target::File(f));
                }
            }
            return Err(Error::Status(Status::NotFound));
        } else if let Some(d) = node.dirs.get(seg) {
            node = d;
        } else if node.files.contains_key(seg) {
            return Err(Error::Status(Status::NotADir));
        } else {
            return Err(Error::Status(Status::NotFound));
        }
    }
    unreachable!("loop always returns on the last segment")
}

/// The name a client should see for a file entry, stripping a trailing
/// `.PRG` when the PRG-fallback compatibility rule is on (`spec.md` §3
/// invariant (c)).
pub fn display_name(entry: &CbmFileEntry, prg_fallback_enabled: bool) -> &str {
    if prg_fallback_enabled && entry.file_type == CbmFileType::Prg && entry.name.ends_with(".PRG")
    {
        &entry.name[..entry.name.len() - 4]
    } else {
        &entry.name
    }
}

/// Lists the immediate children of `dir` (or the root, when `dir` is
/// `None`), applying PRG-fallback display names.
pub fn list_entries(dir: &ImageTree, prg_fallback_enabled: bool) -> Vec<(String, bool, u32, u32)> {
    let mut out = Vec::new();
    for entry in dir.files.values() {
        out.push((display_name(entry, prg_fallback_enabled).to_string(), false, entry.size, 0));
    }
    for name in dir.dirs.keys() {
        out.push((name.clone(), true, 0, 0));
    }
    out
}

fn read_header_name_id(kind: ImageKind, data: &[u8]) -> (String, String) {
    match kind {
        ImageKind::D64 | ImageKind::D71 => {
            let bam_off = d64::sector_offset(SectorAddr::new(18, 0)).unwrap();
            let name = unpad_name(&data[bam_off + 0x90..bam_off + 0xA0]);
            let id = unpad_name(&data[bam_off + 0xA2..bam_off + 0xA4]);
            (name, id)
        }
        ImageKind::D81 => {
            let off = d81::sector_offset(SectorAddr::new(d81::HEADER_TRACK, 0)).unwrap();
            let name = unpad_name(&data[off + 4..off + 20]);
            let id = unpad_name(&data[off + 0x16..off + 0x18]);
            (name, id)
        }
    }
}

/// Writes `data` to `path` atomically (temp file + rename), matching the
/// D81 repack write path (`spec.md` §4.10 step 5) for D64/D71 full-image
/// rewrites as well, so a reader never observes a half-written image.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), Error> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".w64ftmp");
    PathBuf::from(os)
}

/// A single in-image mutation to apply before the image is re-serialized
/// and written back to disk.
pub enum Mutation<'a> {
    Put { segments: &'a [String], file_type: CbmFileType, bytes: Vec<u8> },
    Delete { segments: &'a [String] },
    Rename { segments: &'a [String], new_name: &'a str },
    MkdirPartition { segments: &'a [String] },
    RmdirPartition { segments: &'a [String], recursive: bool },
}

/// Computes `mutation`'s resulting image bytes without writing anything: for
/// D64/D71, mutates a clone of the already-allocated fixed-size buffer in
/// place (`spec.md` §4.8-§4.9, always same length, so `delta == 0`); for
/// D81, mutates the in-memory [`ImageTree`] and repacks (`spec.md` §4.10
/// steps 1-4). Callers pre-check quota against the returned host-byte delta
/// before committing it (`spec.md` §4.7) - D64/D71 writes never move bytes
/// on the host, only D81's repack can grow or shrink the file.
pub fn plan_mutation(
    kind: ImageKind,
    loaded: &Loaded,
    mutation: Mutation<'_>,
) -> Result<(Vec<u8>, i64), Error> {
    let old_len = loaded.data.len() as i64;
    let new_data = match kind {
        ImageKind::D64 | ImageKind::D71 => {
            let mut data = loaded.data.clone();
            apply_flat_mutation(kind, &mut data, &mutation)?;
            data
        }
        ImageKind::D81 => {
            let mut tree = (*loaded.tree).clone();
            apply_tree_mutation(&mut tree, &mutation)?;
            let (disk_name, disk_id) = read_header_name_id(kind, &loaded.data);
            d81::repack(&tree, &disk_name, &disk_id)?
        }
    };
    let delta = new_data.len() as i64 - old_len;
    Ok((new_data, delta))
}

/// Writes `new_data` out (temp+rename, step 5 of `spec.md` §4.10) and
/// invalidates the parse cache entry for `path`.
pub fn commit_mutation(cache: &ImageParseCache, path: &Path, new_data: &[u8]) -> Result<(), Error> {
    atomic_write(path, new_data)?;
    cache.invalidate(&path.to_path_buf());
    Ok(())
}

/// Plans and immediately commits `mutation`. Returns the signed byte delta
/// to the host file's size, for the usage cache (`spec.md` §4.7). Callers
/// that need to pre-check quota against the delta before committing should
/// call [`plan_mutation`]/[`commit_mutation`] directly instead.
pub fn apply_mutation(
    cache: &ImageParseCache,
    path: &Path,
    kind: ImageKind,
    loaded: &Loaded,
    mutation: Mutation<'_>,
) -> Result<i64, Error> {
    let (new_data, delta) = plan_mutation(kind, loaded, mutation)?;
    commit_mutation(cache, path, &new_data)?;
    Ok(delta)
}

fn single_segment<'a>(segments: &'a [String]) -> Result<&'a str, Error> {
    match segments {
        [name] => Ok(name.as_str()),
        _ => Err(Error::Status(Status::NotSupported)),
    }
}

fn apply_flat_mutation(kind: ImageKind, data: &mut [u8], mutation: &Mutation<'_>) -> Result<(), Error> {
    match mutation {
        Mutation::Put { segments, file_type, bytes } => {
            let name = single_segment(segments)?;
            match kind {
                ImageKind::D64 => d64::write_file(data, name, *file_type, bytes),
                ImageKind::D71 => d71::write_file(data, name, *file_type, bytes),
                ImageKind::D81 => unreachable!(),
            }
        }
        Mutation::Delete { segments } => {
            let name = single_segment(segments)?;
            match kind {
                ImageKind::D64 => d64::delete_file(data, name),
                ImageKind::D71 => d71::delete_file(data, name),
                ImageKind::D81 => unreachable!(),
            }
        }
        Mutation::Rename { segments, new_name } => {
            let name = single_segment(segments)?;
            match kind {
                ImageKind::D64 => d64::rename_file(data, name, new_name),
                ImageKind::D71 => d71::rename_file(data, name, new_name),
                ImageKind::D81 => unreachable!(),
            }
        }
        Mutation::MkdirPartition { .. } | Mutation::RmdirPartition { .. } => {
            Err(Error::Status(Status::NotSupported))
        }
    }
}

fn apply_tree_mutation(tree: &mut ImageTree, mutation: &Mutation<'_>) -> Result<(), Error> {
    let segs = |s: &[String]| -> Vec<&str> { s.iter().map(|s| s.as_str()).collect() };
    match mutation {
        Mutation::Put { segments, file_type, bytes } => {
            d81::tree_put_file(tree, &segs(segments), *file_type, bytes.clone())
        }
        Mutation::Delete { segments } => d81::tree_delete_file(tree, &segs(segments)),
        Mutation::Rename { segments, new_name } => {
            d81::tree_rename_file(tree, &segs(segments), new_name)
        }
        Mutation::MkdirPartition { segments } => d81::tree_mkdir_partition(tree, &segs(segments)),
        Mutation::RmdirPartition { segments, recursive } => {
            d81::tree_rmdir_partition(tree, &segs(segments), *recursive)
        }
    }
}

/// Reads a file's raw bytes out of an already-loaded image.
pub fn read_file(loaded: &Loaded, entry: &CbmFileEntry) -> Vec<u8> {
    crate::image::read_chain_data(&loaded.data, &entry.sectors)
}

pub fn hash_file(loaded: &Loaded, entry: &CbmFileEntry) -> u32 {
    crate::image::hash_chain(&loaded.data, &entry.sectors)
}
