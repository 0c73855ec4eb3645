//! D71 codec: double-sided 1571 disk images, dual BAM (`spec.md` §4.9).

use super::{
    d64, disambiguate, hash_chain, pad_name, read_chain_data, unpad_name, walk_chain,
    CbmFileEntry, CbmFileType, ImageTree, SectorAddr, SectorSlice,
};
use crate::status::{Error, Status};

pub const TRACKS: u8 = 70;
pub const SECTOR_LEN: usize = d64::SECTOR_LEN;
pub const DIR_TRACK: u8 = d64::DIR_TRACK;
pub const BAM_SECTOR: u8 = d64::BAM_SECTOR;
pub const DIR_FIRST_SECTOR: u8 = d64::DIR_FIRST_SECTOR;
/// Second BAM sector, side 2, holding the 36-70 track bitmaps.
pub const SIDE2_BAM_TRACK: u8 = 53;
pub const SIDE2_BAM_SECTOR: u8 = 0;
/// 1366 total sectors minus 19 (track 18) minus 19 (track 53): `spec.md` §4.9, §8.
pub const FORMATTED_FREE_BLOCKS: u16 = 1328;

pub fn sectors_in_track(track: u8) -> u8 {
    if track == 0 || track > TRACKS {
        return 0;
    }
    let local = ((track - 1) % 35) + 1;
    d64::sectors_in_track(local)
}

pub fn total_sectors() -> u32 {
    (1..=TRACKS).map(|t| sectors_in_track(t) as u32).sum()
}

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

const BAM1_ENTRY_BASE: usize = 0x04;
const SIDE2_COUNT_BASE: usize = 0xDD;

fn bam1_entry_offset(bam_off: usize, track: u8) -> usize {
    bam_off + BAM1_ENTRY_BASE + (track as usize - 1) * 4
}

fn side2_count_offset(bam_off: usize, track: u8) -> usize {
    bam_off + SIDE2_COUNT_BASE + (track as usize - 36)
}

fn side2_bitmap_offset(side2_off: usize, track: u8) -> usize {
    side2_off + (track as usize - 36) * 3
}

fn get_free_count(data: &[u8], bam_off: usize, track: u8) -> u8 {
    if track <= 35 {
        data[bam1_entry_offset(bam_off, track)]
    } else {
        data[side2_count_offset(bam_off, track)]
    }
}

fn set_free_count(data: &mut [u8], bam_off: usize, track: u8, count: u8) {
    if track <= 35 {
        data[bam1_entry_offset(bam_off, track)] = count;
    } else {
        data[side2_count_offset(bam_off, track)] = count;
    }
}

fn get_bitmap(data: &[u8], bam_off: usize, side2_off: usize, track: u8) -> u32 {
    if track <= 35 {
        let off = bam1_entry_offset(bam_off, track);
        data[off + 1] as u32 | (data[off + 2] as u32) << 8 | (data[off + 3] as u32) << 16
    } else {
        let off = side2_bitmap_offset(side2_off, track);
        data[off] as u32 | (data[off + 1] as u32) << 8 | (data[off + 2] as u32) << 16
    }
}

fn set_bitmap(data: &mut [u8], bam_off: usize, side2_off: usize, track: u8, mask: u32) {
    if track <= 35 {
        let off = bam1_entry_offset(bam_off, track);
        data[off + 1] = (mask & 0xFF) as u8;
        data[off + 2] = ((mask >> 8) & 0xFF) as u8;
        data[off + 3] = ((mask >> 16) & 0xFF) as u8;
    } else {
        let off = side2_bitmap_offset(side2_off, track);
        data[off] = (mask & 0xFF) as u8;
        data[off + 1] = ((mask >> 8) & 0xFF) as u8;
        data[off + 2] = ((mask >> 16) & 0xFF) as u8;
    }
}

pub fn parse(data: &[u8]) -> Result<ImageTree, Error> {
    if data.len() < track_offset(TRACKS + 1) {
        return Err(Error::Codec("image too small for D71 layout"));
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

pub fn read_file(data: &[u8], tree: &ImageTree, name: &str) -> Result<Vec<u8>, Error> {
    let entry = tree.files.get(name).ok_or(Error::Status(Status::NotFound))?;
    Ok(read_chain_data(data, &entry.sectors))
}

pub fn hash_file(data: &[u8], tree: &ImageTree, name: &str) -> Result<u32, Error> {
    let entry = tree.files.get(name).ok_or(Error::Status(Status::NotFound))?;
    Ok(hash_chain(data, &entry.sectors))
}

pub fn format_empty(disk_name: &str, disk_id: &str) -> Vec<u8> {
    let mut data = vec![0u8; total_sectors() as usize * SECTOR_LEN];

    let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
    let side2_off = sector_offset(SectorAddr::new(SIDE2_BAM_TRACK, SIDE2_BAM_SECTOR)).unwrap();

    data[bam_off] = DIR_TRACK;
    data[bam_off + 1] = DIR_FIRST_SECTOR;
    data[bam_off + 2] = 0x41;
    data[bam_off + 3] = 0x80;

    for track in (1..=TRACKS).filter(|&t| t != DIR_TRACK && t != SIDE2_BAM_TRACK) {
        let count = sectors_in_track(track);
        set_free_count(&mut data, bam_off, track, count);
        let mask: u32 = if count >= 24 { 0xFF_FFFF } else { (1u32 << count) - 1 };
        set_bitmap(&mut data, bam_off, side2_off, track, mask);
    }
    set_free_count(&mut data, bam_off, DIR_TRACK, 0);
    set_bitmap(&mut data, bam_off, side2_off, DIR_TRACK, 0);
    set_free_count(&mut data, bam_off, SIDE2_BAM_TRACK, 0);
    set_bitmap(&mut data, bam_off, side2_off, SIDE2_BAM_TRACK, 0);

    let name_bytes = pad_name(disk_name, 16);
    data[bam_off + 0x90..bam_off + 0xA0].copy_from_slice(&name_bytes);
    let id_bytes = pad_name(disk_id, 2);
    data[bam_off + 0xA2..bam_off + 0xA4].copy_from_slice(&id_bytes);
    data[bam_off + 0xA4] = 0xA0;
    data[bam_off + 0xA5] = b'2';
    data[bam_off + 0xA6] = b'A';

    let dir_off = sector_offset(SectorAddr::new(DIR_TRACK, DIR_FIRST_SECTOR)).unwrap();
    data[dir_off] = 0;
    data[dir_off + 1] = 0xFF;

    data
}

fn allocate_and_write(
    data: &mut [u8],
    bam_off: usize,
    side2_off: usize,
    bytes: &[u8],
) -> Result<(SectorAddr, u16), Error> {
    let blocks_needed = bytes.len().div_ceil(254).max(1);
    let mut free: Vec<SectorAddr> = Vec::new();

    'outer: for track in (1..=TRACKS).filter(|&t| t != DIR_TRACK && t != SIDE2_BAM_TRACK) {
        let mask = get_bitmap(data, bam_off, side2_off, track);
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
        let count = get_free_count(data, bam_off, addr.track);
        set_free_count(data, bam_off, addr.track, count - 1);
        let mut mask = get_bitmap(data, bam_off, side2_off, addr.track);
        mask &= !(1u32 << addr.sector);
        set_bitmap(data, bam_off, side2_off, addr.track, mask);

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

fn free_chain(
    data: &mut [u8],
    bam_off: usize,
    side2_off: usize,
    start: SectorAddr,
) -> Result<(), Error> {
    let mut visited = std::collections::HashSet::new();
    let mut current = start;
    loop {
        if !visited.insert((current.track, current.sector)) {
            return Err(Error::Codec("cyclic sector chain on delete"));
        }
        let offset = sector_offset(current).ok_or(Error::Codec("sector out of range"))?;
        let next_track = data[offset];
        let next_sector = data[offset + 1];

        let count = get_free_count(data, bam_off, current.track);
        set_free_count(data, bam_off, current.track, count + 1);
        let mut mask = get_bitmap(data, bam_off, side2_off, current.track);
        mask |= 1u32 << current.sector;
        set_bitmap(data, bam_off, side2_off, current.track, mask);

        if next_track == 0 {
            break;
        }
        current = SectorAddr::new(next_track, next_sector);
    }
    Ok(())
}

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
            for candidate in (DIR_FIRST_SECTOR + 1)..sectors_in_track(DIR_TRACK) {
                let candidate_off = sector_offset(SectorAddr::new(DIR_TRACK, candidate)).unwrap();
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

pub fn write_file(
    data: &mut [u8],
    name: &str,
    file_type: CbmFileType,
    bytes: &[u8],
) -> Result<(), Error> {
    let bam_off = sector_offset(SectorAddr::new(DIR_TRACK, BAM_SECTOR)).unwrap();
    let side2_off = sector_offset(SectorAddr::new(SIDE2_BAM_TRACK, SIDE2_BAM_SECTOR)).unwrap();
    let (start, blocks) = allocate_and_write(data, bam_off, side2_off, bytes)?;
    let entry_off = find_or_alloc_dir_slot(data)?;

    data[entry_off + 2] = file_type.code();
    data[entry_off + 3] = start.track;
    data[entry_off + 4] = start.sector;
    data[entry_off + 5..entry_off + 21].copy_from_slice(&pad_name(name, 16));
    data[entry_off + 30] = (blocks & 0xFF) as u8;
    data[entry_off + 31] = (blocks >> 8) as u8;
    Ok(())
}

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
    let side2_off = sector_offset(SectorAddr::new(SIDE2_BAM_TRACK, SIDE2_BAM_SECTOR)).unwrap();
    free_chain(data, bam_off, side2_off, start)?;
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
        .filter(|&t| t != DIR_TRACK && t != SIDE2_BAM_TRACK)
        .map(|t| get_free_count(data, bam_off, t) as u16)
        .sum()
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
    fn write_then_read_roundtrips_on_side_two() {
        let mut data = format_empty("TEST", "AA");
        // Fill past side 1's capacity so the allocator is forced onto side 2.
        for i in 0..40 {
            write_file(&mut data, &format!("FILLER{i}"), CbmFileType::Prg, &[0u8; 5000])
                .unwrap();
        }
        let payload = vec![1, 2, 3, 4, 5];
        write_file(&mut data, "LAST", CbmFileType::Seq, &payload).unwrap();
        let tree = parse(&data).unwrap();
        assert_eq!(read_file(&data, &tree, "LAST").unwrap(), payload);
    }

    #[test]
    fn delete_frees_blocks_back() {
        let mut data = format_empty("TEST", "AA");
        let before = blocks_free(&data);
        write_file(&mut data, "A", CbmFileType::Prg, &[1, 2, 3]).unwrap();
        assert!(blocks_free(&data) < before);
        delete_file(&mut data, "A").unwrap();
        assert_eq!(blocks_free(&data), before);
    }
}
