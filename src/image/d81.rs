//! D81 codec: single-sided 1581 disk images with subdirectory partitions
//! and tree-repack writes (`spec.md` §4.10).
//!
//! Unlike D64/D71, every mutation here is a full parse → mutate-in-memory
//! → repack → atomic-write cycle (`spec.md` §4.10 steps 1-5), because 1581
//! partitions must occupy contiguous track ranges and incremental on-disk
//! edits can't preserve that. The in-memory [`ImageTree`] is the single
//! source of truth for a repack; nothing here mutates bytes incrementally.

use std::collections::HashMap;

use super::{
    disambiguate, hash_chain, pad_name, read_chain_data, unpad_name, walk_chain, CbmFileEntry,
    CbmFileType, ImageTree, SectorAddr, SectorSlice,
};
use crate::status::{Error, Status};

pub const TRACKS: u8 = 80;
pub const SECTORS_PER_TRACK: u8 = 40;
pub const SECTOR_LEN: usize = 256;
pub const HEADER_TRACK: u8 = 40;
pub const BAM1_SECTOR: u8 = 1;
pub const BAM2_SECTOR: u8 = 2;
pub const DIR_FIRST_SECTOR: u8 = 3;
/// 3200 total sectors minus the 40 reserved on the header track (`spec.md` §4.10, §8).
pub const FORMATTED_FREE_BLOCKS: u16 = 3160;
/// Tracks reserved per partition beyond its current content, to permit
/// future in-place growth without an immediate repack (`spec.md` §4.10
/// step 3, `d81RepackBufferTracks`).
pub const REPACK_BUFFER_TRACKS: u8 = 2;

pub fn track_offset(track: u8) -> usize {
    (track as usize - 1) * SECTORS_PER_TRACK as usize * SECTOR_LEN
}

pub fn sector_offset(addr: SectorAddr) -> Option<usize> {
    if addr.track == 0 || addr.track > TRACKS || addr.sector >= SECTORS_PER_TRACK {
        return None;
    }
    Some(track_offset(addr.track) + addr.sector as usize * SECTOR_LEN)
}

fn bam_sector_for(track: u8) -> SectorAddr {
    if track <= 40 {
        SectorAddr::new(HEADER_TRACK, BAM1_SECTOR)
    } else {
        SectorAddr::new(HEADER_TRACK, BAM2_SECTOR)
    }
}

const BAM_ENTRY_BASE: usize = 0x10;

fn bam_entry_offset(bam_off: usize, track: u8) -> usize {
    let local = if track <= 40 { track } else { track - 40 };
    bam_off + BAM_ENTRY_BASE + (local as usize - 1) * 6
}

/// Marks every sector of `track` used (count=0, bitmap=0) or free (count=40,
/// bitmap all-ones) in the root BAM.
fn set_track_state(data: &mut [u8], track: u8, free: bool) {
    let bam_addr = bam_sector_for(track);
    let bam_off = sector_offset(bam_addr).unwrap();
    let entry_off = bam_entry_offset(bam_off, track);
    if free {
        data[entry_off] = SECTORS_PER_TRACK;
        data[entry_off + 1..entry_off + 6].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    } else {
        data[entry_off] = 0;
        data[entry_off + 1..entry_off + 6].copy_from_slice(&[0, 0, 0, 0, 0]);
    }
}

fn track_free_count(data: &[u8], track: u8) -> u8 {
    let bam_off = sector_offset(bam_sector_for(track)).unwrap();
    data[bam_entry_offset(bam_off, track)]
}

pub fn blocks_free(data: &[u8]) -> u16 {
    (1..=TRACKS).filter(|&t| t != HEADER_TRACK).map(|t| track_free_count(data, t) as u16).sum()
}

/// Builds a freshly formatted, empty D81 image.
pub fn format_empty(disk_name: &str, disk_id: &str) -> Vec<u8> {
    let mut data = vec![0u8; TRACKS as usize * SECTORS_PER_TRACK as usize * SECTOR_LEN];

    let header_off = sector_offset(SectorAddr::new(HEADER_TRACK, 0)).unwrap();
    data[header_off] = HEADER_TRACK;
    data[header_off + 1] = BAM1_SECTOR;
    data[header_off + 2] = b'D';
    data[header_off + 4..header_off + 20].copy_from_slice(&pad_name(disk_name, 16));
    data[header_off + 0x16] = pad_name(disk_id, 2)[0];
    data[header_off + 0x17] = pad_name(disk_id, 2)[1];
    data[header_off + 0x19] = b'3';
    data[header_off + 0x1A] = b'D';

    let bam1_off = sector_offset(SectorAddr::new(HEADER_TRACK, BAM1_SECTOR)).unwrap();
    data[bam1_off] = HEADER_TRACK;
    data[bam1_off + 1] = BAM2_SECTOR;
    data[bam1_off + 2] = b'D';
    let bam2_off = sector_offset(SectorAddr::new(HEADER_TRACK, BAM2_SECTOR)).unwrap();
    data[bam2_off] = 0;
    data[bam2_off + 1] = 0xFF;
    data[bam2_off + 2] = b'D';

    for track in 1..=TRACKS {
        set_track_state(&mut data, track, track != HEADER_TRACK);
    }

    let dir_off = sector_offset(SectorAddr::new(HEADER_TRACK, DIR_FIRST_SECTOR)).unwrap();
    data[dir_off] = 0;
    data[dir_off + 1] = 0xFF;

    data
}

/// Recursively parses a directory chain starting at `start`. Type 5/6
/// entries are partitions: their `start` points at the first sector of
/// their own nested directory chain, and their track span is encoded at
/// entry offset 22 (`first_track`) / 23 (`last_track`) — an encoding local
/// to this codec, since `spec.md` leaves the malformed/encoding specifics
/// open (§9 open question (a)).
fn parse_dir_chain(data: &[u8], start: SectorAddr) -> Result<ImageTree, Error> {
    let mut tree = ImageTree::default();
    let mut current = start;
    let mut visited = std::collections::HashSet::new();

    loop {
        if !visited.insert((current.track, current.sector)) {
            return Err(Error::Codec("cyclic directory chain"));
        }
        let offset = sector_offset(current).ok_or(Error::Codec("directory sector out of range"))?;
        let sector = &data[offset..offset + SECTOR_LEN];

        for slot in 0..8 {
            let entry = &sector[slot * 32..slot * 32 + 32];
            let type_byte = entry[2];
            if type_byte == 0 {
                continue;
            }
            let Some(file_type) = CbmFileType::from_code(type_byte) else { continue };
            let entry_start = SectorAddr::new(entry[3], entry[4]);
            let raw_name = unpad_name(&entry[5..21]);

            if file_type.is_directory_like() {
                let sub = parse_dir_chain(data, entry_start)?;
                let name = disambiguate(&mut tree, raw_name);
                tree.dirs.insert(name, sub);
            } else {
                let blocks = u16::from_le_bytes([entry[30], entry[31]]);
                let (sectors, size) = walk_chain(data, entry_start, sector_offset)?;
                let name = disambiguate(&mut tree, raw_name);
                tree.files.insert(
                    name.clone(),
                    CbmFileEntry {
                        name,
                        file_type,
                        size,
                        blocks,
                        start: entry_start,
                        sectors,
                        partition_span: None,
                    },
                );
            }
        }

        let next_track = sector[0];
        let next_sector = sector[1];
        if next_track == 0 {
            break;
        }
        current = SectorAddr::new(next_track, next_sector);
    }

    Ok(tree)
}

pub fn parse(data: &[u8]) -> Result<ImageTree, Error> {
    if data.len() < TRACKS as usize * SECTORS_PER_TRACK as usize * SECTOR_LEN {
        return Err(Error::Codec("image too small for D81 layout"));
    }
    parse_dir_chain(data, SectorAddr::new(HEADER_TRACK, DIR_FIRST_SECTOR))
}

/// Resolves a `/`-free path of uppercased segments to the file entry and
/// its owning tree, descending through partitions.
pub fn lookup<'a>(tree: &'a ImageTree, segments: &[&str]) -> Option<&'a CbmFileEntry> {
    match segments.split_last() {
        None => None,
        Some((leaf, dirs)) => {
            let mut node = tree;
            for d in dirs {
                node = node.dirs.get(*d)?;
            }
            node.files.get(*leaf)
        }
    }
}

pub fn read_file(data: &[u8], tree: &ImageTree, segments: &[&str]) -> Result<Vec<u8>, Error> {
    let entry = lookup(tree, segments).ok_or(Error::Status(Status::NotFound))?;
    Ok(read_chain_data(data, &entry.sectors))
}

pub fn hash_file(data: &[u8], tree: &ImageTree, segments: &[&str]) -> Result<u32, Error> {
    let entry = lookup(tree, segments).ok_or(Error::Status(Status::NotFound))?;
    Ok(hash_chain(data, &entry.sectors))
}

/// Mutable view of the tree that owns `segments[..len-1]`, creating
/// intermediate partitions on the way is NOT done here (mkdir is explicit);
/// missing intermediates are a `NOT_FOUND`.
fn dir_mut<'a>(tree: &'a mut ImageTree, dirs: &[&str]) -> Result<&'a mut ImageTree, Error> {
    let mut node = tree;
    for d in dirs {
        node = node.dirs.get_mut(*d).ok_or(Error::Status(Status::NotFound))?;
    }
    Ok(node)
}

/// Inserts or overwrites a file at `segments` in the in-memory tree. Actual
/// track/sector assignment happens in [`repack`].
pub fn tree_put_file(
    tree: &mut ImageTree,
    segments: &[&str],
    file_type: CbmFileType,
    bytes: Vec<u8>,
) -> Result<(), Error> {
    let (leaf, dirs) = segments.split_last().ok_or(Error::Status(Status::InvalidPath))?;
    let node = dir_mut(tree, dirs)?;
    let blocks = (bytes.len().div_ceil(254).max(1)) as u16;
    node.files.insert(
        leaf.to_string(),
        CbmFileEntry {
            name: leaf.to_string(),
            file_type,
            size: bytes.len() as u32,
            blocks,
            start: SectorAddr::new(0, 0),
            sectors: vec![SectorSlice { data_offset: 0, data_len: bytes.len() }],
            partition_span: None,
        },
    );
    node.pending_bytes(leaf, bytes);
    Ok(())
}

pub fn tree_delete_file(tree: &mut ImageTree, segments: &[&str]) -> Result<(), Error> {
    let (leaf, dirs) = segments.split_last().ok_or(Error::Status(Status::InvalidPath))?;
    let node = dir_mut(tree, dirs)?;
    node.files.remove(*leaf).ok_or(Error::Status(Status::NotFound))?;
    node.pending.remove(*leaf);
    Ok(())
}

pub fn tree_rename_file(tree: &mut ImageTree, segments: &[&str], new_name: &str) -> Result<(), Error> {
    let (leaf, dirs) = segments.split_last().ok_or(Error::Status(Status::InvalidPath))?;
    let node = dir_mut(tree, dirs)?;
    let mut entry = node.files.remove(*leaf).ok_or(Error::Status(Status::NotFound))?;
    entry.name = new_name.to_string();
    let bytes = node.pending.remove(*leaf);
    node.files.insert(new_name.to_string(), entry);
    if let Some(b) = bytes {
        node.pending.insert(new_name.to_string(), b);
    }
    Ok(())
}

pub fn tree_mkdir_partition(tree: &mut ImageTree, segments: &[&str]) -> Result<(), Error> {
    let (leaf, dirs) = segments.split_last().ok_or(Error::Status(Status::InvalidPath))?;
    let node = dir_mut(tree, dirs)?;
    if node.files.contains_key(*leaf) {
        return Err(Error::Status(Status::AlreadyExists));
    }
    if node.dirs.contains_key(*leaf) {
        return Err(Error::Status(Status::AlreadyExists));
    }
    node.dirs.insert(leaf.to_string(), ImageTree::default());
    Ok(())
}

pub fn tree_rmdir_partition(
    tree: &mut ImageTree,
    segments: &[&str],
    recursive: bool,
) -> Result<(), Error> {
    let (leaf, dirs) = segments.split_last().ok_or(Error::Status(Status::InvalidPath))?;
    let node = dir_mut(tree, dirs)?;
    let sub = node.dirs.get(*leaf).ok_or(Error::Status(Status::NotFound))?;
    if !recursive && (!sub.files.is_empty() || !sub.dirs.is_empty()) {
        return Err(Error::Status(Status::DirNotEmpty));
    }
    node.dirs.remove(*leaf);
    Ok(())
}

/// A contiguous track assignment for one node of the tree.
struct Plan {
    first_track: u8,
    last_track: u8,
}

/// Assigns contiguous track ranges to every partition in the tree (a
/// simple first-fit bin-pack, each reserving [`REPACK_BUFFER_TRACKS`]
/// beyond its estimated content), then re-emits the whole image.
///
/// Partition nesting below the first level is intentionally not supported:
/// a partition's own `dirs` map, if populated, is rejected with
/// `NOT_SUPPORTED` rather than silently flattened (`spec.md` leaves nested
/// partitions unspecified; this codec declines rather than guesses).
pub fn repack(tree: &ImageTree, disk_name: &str, disk_id: &str) -> Result<Vec<u8>, Error> {
    let mut data = format_empty(disk_name, disk_id);

    let mut next_track: u8 = 1;
    let mut plans: HashMap<String, Plan> = HashMap::new();

    for (name, sub) in &tree.dirs {
        if !sub.dirs.is_empty() {
            return Err(Error::Status(Status::NotSupported));
        }
        let blocks: u64 = sub.files.values().map(|f| f.blocks as u64).sum();
        let tracks_needed =
            (blocks.div_ceil(SECTORS_PER_TRACK as u64) as u8).max(1) + REPACK_BUFFER_TRACKS;
        let first = next_track;
        let last = first + tracks_needed - 1;
        if last >= HEADER_TRACK {
            return Err(Error::Status(Status::TooLarge));
        }
        plans.insert(name.clone(), Plan { first_track: first, last_track: last });
        next_track = last + 1;
    }

    // Root-level files occupy tracks after the last partition (or track 1).
    let root_first_track = next_track;

    write_root_files(&mut data, tree, root_first_track)?;

    for (name, sub) in &tree.dirs {
        let plan = &plans[name];
        write_partition(&mut data, name, sub, plan)?;
        let dir_entry_start = SectorAddr::new(plan.first_track, 1);
        add_dir_entry(
            &mut data,
            SectorAddr::new(HEADER_TRACK, DIR_FIRST_SECTOR),
            name,
            CbmFileType::Dir,
            dir_entry_start,
            0,
            Some((plan.first_track, plan.last_track)),
        )?;
        for track in plan.first_track..=plan.last_track {
            set_track_state(&mut data, track, false);
        }
    }

    Ok(data)
}

fn write_root_files(data: &mut [u8], tree: &ImageTree, first_track: u8) -> Result<(), Error> {
    let mut track = first_track;
    let mut sector: u8 = 0;

    for (name, entry) in &tree.files {
        let bytes = tree.pending.get(name).cloned().unwrap_or_default();
        let (start, used_tracks) = write_chain_from(data, track, sector, &bytes)?;
        track = used_tracks.0;
        sector = used_tracks.1;
        add_dir_entry(
            data,
            SectorAddr::new(HEADER_TRACK, DIR_FIRST_SECTOR),
            name,
            entry.file_type,
            start,
            entry.blocks,
            None,
        )?;
    }
    for t in first_track..track.max(first_track) {
        set_track_state(data, t, false);
    }
    if sector > 0 {
        set_track_state(data, track, false);
    }
    Ok(())
}

fn write_partition(
    data: &mut [u8],
    _name: &str,
    sub: &ImageTree,
    plan: &Plan,
) -> Result<(), Error> {
    // The partition's own directory chain starts at sector 1 of its first
    // track; sector 0 is left as a small reserved header sector mirroring
    // the root's convention.
    let dir_start = SectorAddr::new(plan.first_track, 1);
    {
        let off = sector_offset(dir_start).ok_or(Error::Codec("partition out of range"))?;
        data[off] = 0;
        data[off + 1] = 0xFF;
    }

    let mut track = plan.first_track;
    let mut sector: u8 = 2;

    for (name, entry) in &sub.files {
        let bytes = sub.pending.get(name).cloned().unwrap_or_default();
        let (start, (next_track, next_sector)) =
            write_chain_from(data, track, sector, &bytes)?;
        track = next_track;
        sector = next_sector;
        if track > plan.last_track {
            return Err(Error::Status(Status::TooLarge));
        }
        add_dir_entry(data, dir_start, name, entry.file_type, start, entry.blocks, None)?;
    }
    Ok(())
}

/// Writes `bytes` as a sector chain starting at the first free-looking
/// cursor position `(track, sector)`, advancing linearly through sectors
/// and tracks (repack always writes into freshly zeroed space, so no BAM
/// bookkeeping is needed mid-write — only the final per-track state is
/// flipped by the caller).
fn write_chain_from(
    data: &mut [u8],
    mut track: u8,
    mut sector: u8,
    bytes: &[u8],
) -> Result<(SectorAddr, (u8, u8)), Error> {
    if bytes.is_empty() {
        let start = SectorAddr::new(track, sector);
        let off = sector_offset(start).ok_or(Error::Codec("out of space"))?;
        data[off] = 0;
        data[off + 1] = 0;
        advance(&mut track, &mut sector)?;
        return Ok((start, (track, sector)));
    }

    let start = SectorAddr::new(track, sector);
    let chunks: Vec<&[u8]> = bytes.chunks(254).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let addr = SectorAddr::new(track, sector);
        let off = sector_offset(addr).ok_or(Error::Status(Status::TooLarge))?;
        let is_last = i == chunks.len() - 1;
        if is_last {
            data[off] = 0;
            data[off + 1] = chunk.len() as u8;
            data[off + 2..off + 2 + chunk.len()].copy_from_slice(chunk);
        } else {
            let mut next_track = track;
            let mut next_sector = sector;
            advance(&mut next_track, &mut next_sector)?;
            data[off] = next_track;
            data[off + 1] = next_sector;
            data[off + 2..off + 256].copy_from_slice(chunk);
            advance(&mut track, &mut sector)?;
        }
    }
    advance(&mut track, &mut sector)?;
    Ok((start, (track, sector)))
}

fn advance(track: &mut u8, sector: &mut u8) -> Result<(), Error> {
    *sector += 1;
    if *sector >= SECTORS_PER_TRACK {
        *sector = 0;
        *track += 1;
    }
    if *track >= HEADER_TRACK {
        return Err(Error::Status(Status::TooLarge));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn add_dir_entry(
    data: &mut [u8],
    dir_start: SectorAddr,
    name: &str,
    file_type: CbmFileType,
    start: SectorAddr,
    blocks: u16,
    span: Option<(u8, u8)>,
) -> Result<(), Error> {
    let entry_off = find_or_alloc_dir_slot(data, dir_start)?;
    data[entry_off + 2] = file_type.code();
    data[entry_off + 3] = start.track;
    data[entry_off + 4] = start.sector;
    data[entry_off + 5..entry_off + 21].copy_from_slice(&pad_name(name, 16));
    if let Some((first, last)) = span {
        data[entry_off + 22] = first;
        data[entry_off + 23] = last;
    }
    data[entry_off + 30] = (blocks & 0xFF) as u8;
    data[entry_off + 31] = (blocks >> 8) as u8;
    Ok(())
}

fn find_or_alloc_dir_slot(data: &mut [u8], dir_start: SectorAddr) -> Result<usize, Error> {
    let mut current = dir_start;
    loop {
        let offset = sector_offset(current).ok_or(Error::Codec("directory overflow"))?;
        for slot in 0..8 {
            let entry_off = offset + slot * 32;
            if data[entry_off + 2] == 0 {
                return Ok(entry_off);
            }
        }
        let next_track = data[offset];
        let next_sector = data[offset + 1];
        if next_track == 0 {
            return Err(Error::Status(Status::TooLarge));
        }
        current = SectorAddr::new(next_track, next_sector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_empty_has_expected_free_blocks() {
        let data = format_empty("TEST DISK", "AA");
        assert_eq!(blocks_free(&data), FORMATTED_FREE_BLOCKS);
        assert!(parse(&data).unwrap().files.is_empty());
    }

    #[test]
    fn repack_write_then_read_roundtrips() {
        let mut tree = ImageTree::default();
        tree_put_file(&mut tree, &["HELLO.PRG"], CbmFileType::Prg, vec![1, 2, 3, 4]).unwrap();
        let data = repack(&tree, "TEST", "AA").unwrap();
        let parsed = parse(&data).unwrap();
        assert_eq!(read_file(&data, &parsed, &["HELLO.PRG"]).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn partition_create_write_read_and_remove() {
        let mut tree = ImageTree::default();
        tree_mkdir_partition(&mut tree, &["SUB"]).unwrap();
        tree_put_file(&mut tree, &["SUB", "A"], CbmFileType::Seq, vec![9, 9, 9]).unwrap();
        let data = repack(&tree, "TEST", "AA").unwrap();
        let parsed = parse(&data).unwrap();
        assert_eq!(read_file(&data, &parsed, &["SUB", "A"]).unwrap(), vec![9, 9, 9]);

        let err = tree_rmdir_partition(&mut tree, &["SUB"], false).unwrap_err();
        assert!(matches!(err, Error::Status(Status::DirNotEmpty)));
        tree_rmdir_partition(&mut tree, &["SUB"], true).unwrap();
        assert!(!tree.dirs.contains_key("SUB"));
    }

    #[test]
    fn rename_preserves_bytes_through_repack() {
        let mut tree = ImageTree::default();
        tree_put_file(&mut tree, &["OLD"], CbmFileType::Prg, vec![4, 5, 6]).unwrap();
        tree_rename_file(&mut tree, &["OLD"], "NEW").unwrap();
        let data = repack(&tree, "TEST", "AA").unwrap();
        let parsed = parse(&data).unwrap();
        assert!(!parsed.files.contains_key("OLD"));
        assert_eq!(read_file(&data, &parsed, &["NEW"]).unwrap(), vec![4, 5, 6]);
    }
}
