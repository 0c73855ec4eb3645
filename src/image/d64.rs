//! D64 codec: single-sided 1541 disk images (`spec.md` §4.8).

use super::{
    disambiguate, hash_chain, pad_name, read_chain_data, unpad_name, walk_chain, CbmFileEntry,
    CbmFileType, ImageTree, SectorAddr, SectorSlice,
};
use crate::status::{Error, Status};

pub const TRACKS: u8 = 35;
pub const SECTOR_LEN: usize = 256;
pub const DIR_TRACK: u8 = 18;
pub const BAM_SECTOR: u8 = 0;
pub const DIR_FIRST_SECTOR: u8 = 1;
/// Free blocks on a freshly formatted disk: 683 total sectors minus the 19
/// reserved on track 18 (`spec.md` §4.8, §8).
pub const FORMATTED_FREE_BLOCKS: u16 = 664;

/// Sectors-per-track for a standard 1541, indexed by `track - 1`.
pub fn sectors_in_track(track: u8) -> u8 {
    match track {
        1..=17 => 21,
        18..=24 => 19,
        25..=30 => 18,
        31..=35 => 17,
        _ => 0,
    }
}

pub fn total_sectors() -> u32 {
    (1..=TRACKS).map(|t| sectors_in_track(t) as u32).sum()
}

/// Byte offset of the start of `track` within the image file.
pub fn track_offset(track: u8) -> usize {
    let mut offset = 0usize;
    for t in 1..track {
        offset += sectors_in_track(t) as usize * SECTOR_LEN;
    }
    offset
}

pub fn sector_offset(addr: SectorAddr) -> Option<usize> {
    if addr.track == 0 || addr.track > TRACKS || addr.sector >= sectors_in_track(addr.track) {
        return None;
    }
    Some(track_offset(addr.track) + addr.sector as usize * SECTOR_LEN)
}

const BAM_ENTRY_BASE: usize = 0x04;

fn bam_entry_offset(bam_off: usize, track: u8) -> usize {
    bam_off + BAM_ENTRY_BASE + (track as usize - 1) * 4
}

/// Parses an image into an [`ImageTree`], walking the directory chain
/// starting at 18/1.
pub fn parse(data: &[u8]) -> Result<ImageTree, Error> {
    if data.len() < track_offset(TRACKS + 1) {
        return Err(Error::Codec("image too small for D64 layout"));
    }

    let mut tree = ImageTree::default();
    let mut current = SectorAddr::new(DIR_TRACK, DIR_FIRST_SECTOR);
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
            let start = SectorAddr::new(entry[3], entry[4]);
            let raw_name = unpad_name(&entry[5..21]);
            let blocks = u16::from_le_bytes([entry[30], entry[31]]);

            let (sectors, size) = match walk_chain(data, start, sector_offset) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let name = disambiguate(&mut tree, raw_name);
            tree.files.insert(
                name.clone(),
                CbmFileEntry {
                    name,
                    file_type,
                    size,
                    blocks,
                    start,
                    sectors,
                    partition_span: None,
                },
            );
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

/// Reads the raw bytes of `name` (already disambiguated/uppercased).
pub fn read_file(data: &[u8], tree: &ImageTree, name: &str) -> Result<Vec<u8>, Error> {
    let entry = tree.files.get(name).ok_or(Error::Status(Status::NotFound))?;
    Ok(read_chain_data(data, &entry.sectors))
}

pub fn hash_file(data: &[u8], tree: &ImageTree, name: &str) -> Result<u32, Error> {
    let entry = tree.files.get(name).ok_or(Error::Status(Status::NotFound))?;
    Ok(hash_chain(data, &entry.sectors))
}

/// Builds a freshly formatted, empty D64 image.
pub fn format_empty(disk_name: &str, disk_id: &str) -> Vec<u8> {
    let mut data = vec![0u8; total_sectors() as usize * SECTOR_LEN];

    let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
    data[bam_off] = DIR_TRACK;
    data[bam_off + 1] = DIR_FIRST_SECTOR;
    data[bam_off + 2] = 0x41;

    for track in 1..=TRACKS {
        let entry_off = bam_entry_offset(bam_off, track);
        if track == DIR_TRACK {
            data[entry_off] = 0;
            data[entry_off + 1] = 0;
            data[entry_off + 2] = 0;
            data[entry_off + 3] = 0;
        } else {
            let count = sectors_in_track(track);
            data[entry_off] = count;
            let mask: u32 = if count >= 24 { 0xFF_FFFF } else { (1u32 << count) - 1 };
            data[entry_off + 1] = (mask & 0xFF) as u8;
            data[entry_off + 2] = ((mask >> 8) & 0xFF) as u8;
            data[entry_off + 3] = ((mask >> 16) & 0xFF) as u8;
        }
    }

    let name_bytes = pad_name(disk_name, 16);
    data[bam_off + 0x90..bam_off + 0xA0].copy_from_slice(&name_bytes);
    let id_bytes = pad_name(disk_id, 2);
    data[bam_off + 0xA2..bam_off + 0xA4].copy_from_slice(&id_bytes);
    data[bam_off + 0xA4] = 0xA0;
    data[bam_off + 0xA5] = b'2';
    data[bam_off + 0xA6] = b'A';
    for b in &mut data[bam_off + 0xA7..bam_off + 0xAB] {
        *b = 0xA0;
    }

    let dir_off = sector_offset(SectorAddr::new(DIR_TRACK, DIR_FIRST_SECTOR)).unwrap();
    data[dir_off] = 0;
    data[dir_off + 1] = 0xFF;

    data
}

/// Allocates a free chain of sectors (outside track 18) large enough to
/// hold `len` bytes, marking them used in the BAM, and writes `bytes`
/// through the chain. Returns the start address and block count.
fn allocate_and_write(
    data: &mut [u8],
    bam_off: usize,
    bytes: &[u8],
) -> Result<(SectorAddr, u16), Error> {
    let blocks_needed = bytes.len().div_ceil(254).max(1);
    let mut free: Vec<SectorAddr> = Vec::new();

    'outer: for track in (1..=TRACKS).filter(|&t| t != DIR_TRACK) {
        let entry_off = bam_entry_offset(bam_off, track);
        let mask = data[entry_off + 1] as u32
            | (data[entry_off + 2] as u32) << 8
            | (data[entry_off + 3] as u32) << 16;
        for sector in 0..sectors_in_track(track) {
            if mask & (1 << sector) != 0 {
                free.push(SectorAddr::new(track, sector));
                if free.len() == blocks_needed {
                    break 'outer;
                }
            }
        }
    }

    if free.len() < blocks_needed {
        return Err(Error::Status(Status::TooLarge));
    }

    for (i, addr) in free.iter().enumerate() {
        let entry_off = bam_entry_offset(bam_off, addr.track);
        data[entry_off] -= 1;
        let bit = 1u32 << addr.sector;
        let mut mask = data[entry_off + 1] as u32
            | (data[entry_off + 2] as u32) << 8
            | (data[entry_off + 3] as u32) << 16;
        mask &= !bit;
        data[entry_off + 1] = (mask & 0xFF) as u8;
        data[entry_off + 2] = ((mask >> 8) & 0xFF) as u8;
        data[entry_off + 3] = ((mask >> 16) & 0xFF) as u8;

        let offset = sector_offset(*addr).unwrap();
        let chunk_start = i * 254;
        let remaining = bytes.len() - chunk_start;
        if remaining > 254 {
            let next = free[i + 1];
            data[offset] = next.track;
            data[offset + 1] = next.sector;
            data[offset + 2..offset + 256].copy_from_slice(&bytes[chunk_start..chunk_start + 254]);
        } else {
            data[offset] = 0;
            data[offset + 1] = remaining as u8;
            data[offset + 2..offset + 2 + remaining]
                .copy_from_slice(&bytes[chunk_start..chunk_start + remaining]);
            for b in &mut data[offset + 2 + remaining..offset + 256] {
                *b = 0;
            }
        }
    }

    Ok((free[0], blocks_needed as u16))
}

fn free_chain(data: &mut [u8], bam_off: usize, start: SectorAddr) -> Result<(), Error> {
    let mut visited = std::collections::HashSet::new();
    let mut current = start;
    loop {
        if !visited.insert((current.track, current.sector)) {
            return Err(Error::Codec("cyclic sector chain on delete"));
        }
        let offset = sector_offset(current).ok_or(Error::Codec("sector out of range"))?;
        let next_track = data[offset];
        let next_sector = data[offset + 1];

        let entry_off = bam_entry_offset(bam_off, current.track);
        data[entry_off] += 1;
        let bit = 1u32 << current.sector;
        let mut mask = data[entry_off + 1] as u32
            | (data[entry_off + 2] as u32) << 8
            | (data[entry_off + 3] as u32) << 16;
        mask |= bit;
        data[entry_off + 1] = (mask & 0xFF) as u8;
        data[entry_off + 2] = ((mask >> 8) & 0xFF) as u8;
        data[entry_off + 3] = ((mask >> 16) & 0xFF) as u8;

        if next_track == 0 {
            break;
        }
        current = SectorAddr::new(next_track, next_sector);
    }
    Ok(())
}

/// Finds an empty directory slot, or allocates and links a new directory
/// sector on track 18 when none remain.
fn find_or_alloc_dir_slot(data: &mut [u8]) -> Result<usize, Error> {
    let mut current = SectorAddr::new(DIR_TRACK, DIR_FIRST_SECTOR);
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
            let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
            for candidate in (DIR_FIRST_SECTOR + 1)..sectors_in_track(DIR_TRACK) {
                let candidate_off =
                    sector_offset(SectorAddr::new(DIR_TRACK, candidate)).unwrap();
                let entry_off = bam_entry_offset(bam_off, DIR_TRACK);
                let bit = 1u32 << candidate;
                let mask = data[entry_off + 1] as u32
                    | (data[entry_off + 2] as u32) << 8
                    | (data[entry_off + 3] as u32) << 16;
                if mask & bit != 0 {
                    continue;
                }
                if data[candidate_off..candidate_off + SECTOR_LEN].iter().all(|&b| b == 0) {
                    data[offset] = DIR_TRACK;
                    data[offset + 1] = candidate;
                    data[candidate_off] = 0;
                    data[candidate_off + 1] = 0xFF;
                    return Ok(candidate_off);
                }
            }
            return Err(Error::Status(Status::TooLarge));
        }
        current = SectorAddr::new(next_track, next_sector);
    }
}

/// Writes a new file, allocating directory slot + sector chain.
pub fn write_file(
    data: &mut [u8],
    name: &str,
    file_type: CbmFileType,
    bytes: &[u8],
) -> Result<(), Error> {
    let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
    let (start, blocks) = allocate_and_write(data, bam_off, bytes)?;
    let entry_off = find_or_alloc_dir_slot(data)?;

    data[entry_off + 2] = file_type.code();
    data[entry_off + 3] = start.track;
    data[entry_off + 4] = start.sector;
    data[entry_off + 5..entry_off + 21].copy_from_slice(&pad_name(name, 16));
    data[entry_off + 30] = (blocks & 0xFF) as u8;
    data[entry_off + 31] = (blocks >> 8) as u8;
    Ok(())
}

/// Finds the directory entry slot offset for `name`, if present.
fn find_dir_entry(data: &[u8], name: &str) -> Option<usize> {
    let mut current = SectorAddr::new(DIR_TRACK, DIR_FIRST_SECTOR);
    loop {
        let offset = sector_offset(current)?;
        for slot in 0..8 {
            let entry_off = offset + slot * 32;
            if data[entry_off + 2] == 0 {
                continue;
            }
            let entry_name = unpad_name(&data[entry_off + 5..entry_off + 21]);
            if entry_name == name {
                return Some(entry_off);
            }
        }
        let next_track = data[offset];
        let next_sector = data[offset + 1];
        if next_track == 0 {
            return None;
        }
        current = SectorAddr::new(next_track, next_sector);
    }
}

pub fn delete_file(data: &mut [u8], name: &str) -> Result<(), Error> {
    let entry_off = find_dir_entry(data, name).ok_or(Error::Status(Status::NotFound))?;
    let start = SectorAddr::new(data[entry_off + 3], data[entry_off + 4]);
    let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
    free_chain(data, bam_off, start)?;
    data[entry_off + 2] = 0;
    Ok(())
}

pub fn rename_file(data: &mut [u8], old: &str, new: &str) -> Result<(), Error> {
    let entry_off = find_dir_entry(data, old).ok_or(Error::Status(Status::NotFound))?;
    data[entry_off + 5..entry_off + 21].copy_from_slice(&pad_name(new, 16));
    Ok(())
}

pub fn blocks_free(data: &[u8]) -> u16 {
    let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
    (1..=TRACKS)
        .filter(|&t| t != DIR_TRACK)
        .map(|t| data[bam_entry_offset(bam_off, t)] as u16)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_empty_has_expected_free_blocks() {
        let data = format_empty("TEST DISK", "AA");
        assert_eq!(blocks_free(&data), FORMATTED_FREE_BLOCKS);
        let tree = parse(&data).unwrap();
        assert!(tree.files.is_empty());
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mut data = format_empty("TEST", "AA");
        let payload = vec![0x01, 0x08, 0x0B, 0x08, 0x01, 0x00, 0x9E];
        write_file(&mut data, "HELLO.PRG", CbmFileType::Prg, &payload).unwrap();
        let tree = parse(&data).unwrap();
        let readback = read_file(&data, &tree, "HELLO.PRG").unwrap();
        assert_eq!(readback, payload);
    }

    #[test]
    fn delete_then_rewrite_reuses_space() {
        let mut data = format_empty("TEST", "AA");
        write_file(&mut data, "A", CbmFileType::Prg, &[1, 2, 3]).unwrap();
        delete_file(&mut data, "A").unwrap();
        write_file(&mut data, "A", CbmFileType::Prg, &[9, 9]).unwrap();
        let tree = parse(&data).unwrap();
        assert_eq!(read_file(&data, &tree, "A").unwrap(), vec![9, 9]);
    }

    #[test]
    fn rename_preserves_content() {
        let mut data = format_empty("TEST", "AA");
        write_file(&mut data, "OLD", CbmFileType::Seq, &[5, 6, 7]).unwrap();
        rename_file(&mut data, "OLD", "NEW").unwrap();
        let tree = parse(&data).unwrap();
        assert!(!tree.files.contains_key("OLD"));
        assert_eq!(read_file(&data, &tree, "NEW").unwrap(), vec![5, 6, 7]);
    }

    #[test]
    fn large_file_spans_multiple_sectors() {
        let mut data = format_empty("TEST", "AA");
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        write_file(&mut data, "BIG", CbmFileType::Prg, &payload).unwrap();
        let tree = parse(&data).unwrap();
        assert_eq!(read_file(&data, &tree, "BIG").unwrap(), payload);
    }

    #[test]
    fn hash_matches_crc32_of_raw_bytes() {
        let mut data = format_empty("TEST", "AA");
        let payload = vec![0x01, 0x08, 0x0B, 0x08];
        write_file(&mut data, "HELLO.PRG", CbmFileType::Prg, &payload).unwrap();
        let tree = parse(&data).unwrap();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        assert_eq!(hash_file(&data, &tree, "HELLO.PRG").unwrap(), hasher.finalize());
    }
}
