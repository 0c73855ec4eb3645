//! Shared CBM disk-image types and sector-chain walking, used by the
//! [`d64`], [`d71`], and [`d81`] codecs (`spec.md` §4.8-§4.10).
//!
//! The sector-chain walk is the one piece of logic identical across all
//! three formats (256-byte sectors linked by a 2-byte `(next_track,
//! next_sector)` header, with `(0, data_len)` marking the final sector);
//! it is factored out here instead of being duplicated per codec, the way
//! the predecessor crate factors `allocator::chain::Chain` out from its
//! three buffer-owning call sites.

pub mod d64;
pub mod d71;
pub mod d81;
pub mod locate;
pub mod ops;

pub use locate::{split_at_mount, ImageKind, MountSplit};

use std::collections::{HashMap, HashSet};

use crate::status::{Error, Status};

/// A (track, sector) address. Tracks and sectors are both 1-based in CBM
/// DOS convention for data tracks, though sector numbers themselves start
/// at 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SectorAddr {
    pub track: u8,
    pub sector: u8,
}

impl SectorAddr {
    pub fn new(track: u8, sector: u8) -> Self {
        Self { track, sector }
    }

    fn key(self) -> u16 {
        ((self.track as u16) << 8) | self.sector as u16
    }
}

/// CBM DOS file type code, shared across D64/D71/D81 directory entries.
/// D81 additionally uses 5/6 for partitions (`spec.md` §4.10).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CbmFileType {
    Seq,
    Prg,
    Usr,
    DirPartition,
    Dir,
}

impl CbmFileType {
    pub fn code(self) -> u8 {
        match self {
            CbmFileType::Seq => 2,
            CbmFileType::Prg => 3,
            CbmFileType::Usr => 4,
            CbmFileType::DirPartition => 5,
            CbmFileType::Dir => 6,
        }
    }

    pub fn from_code(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(CbmFileType::Seq),
            3 => Some(CbmFileType::Prg),
            4 => Some(CbmFileType::Usr),
            5 => Some(CbmFileType::DirPartition),
            6 => Some(CbmFileType::Dir),
            _ => None,
        }
    }

    pub fn is_directory_like(self) -> bool {
        matches!(self, CbmFileType::DirPartition | CbmFileType::Dir)
    }
}

/// One sector's worth of file data: its byte offset in the image file, and
/// how many of its 254 data bytes belong to the file (254 for interior
/// sectors, `link_byte` for the terminal sector).
#[derive(Debug, Copy, Clone)]
pub struct SectorSlice {
    pub data_offset: usize,
    pub data_len: usize,
}

/// An in-memory CBM file entry, shared in shape across all three formats
/// (`spec.md` §3 "CBM file entry").
#[derive(Debug, Clone)]
pub struct CbmFileEntry {
    pub name: String,
    pub file_type: CbmFileType,
    pub size: u32,
    pub blocks: u16,
    pub start: SectorAddr,
    pub sectors: Vec<SectorSlice>,
    /// For D81 partitions: the track range `[first, last]` the partition
    /// owns. Unused for plain files.
    pub partition_span: Option<(u8, u8)>,
}

/// An in-memory tree of files and, for D81, subdirectory partitions, keyed
/// by uppercased name (`spec.md` §4.10, §9). D64/D71 only ever populate
/// `files` with `dirs` empty, since neither format supports subdirectories.
#[derive(Debug, Clone, Default)]
pub struct ImageTree {
    pub files: HashMap<String, CbmFileEntry>,
    pub dirs: HashMap<String, ImageTree>,
    /// Byte content staged for a file entry that hasn't been assigned a
    /// sector chain yet. Populated by the D81 mutate-then-repack path
    /// (`spec.md` §4.10 steps 1-2); drained by `repack`'s writer.
    pub pending: HashMap<String, Vec<u8>>,
}

impl ImageTree {
    pub fn total_blocks_used(&self) -> u64 {
        let own: u64 = self.files.values().map(|f| f.blocks as u64).sum();
        let nested: u64 = self.dirs.values().map(|d| d.total_blocks_used()).sum();
        own + nested
    }

    pub fn pending_bytes(&mut self, name: &str, bytes: Vec<u8>) {
        self.pending.insert(name.to_string(), bytes);
    }
}

/// Walks a sector chain starting at `start`, given sector-size `SECTOR_LEN`
/// (always 256 across these formats, first two bytes are the link header)
/// and a function mapping a `(track, sector)` to its byte offset in the
/// image. Detects cycles with a visited-set keyed by `(track, sector)`
/// (`spec.md` §3 invariant (a)).
pub fn walk_chain(
    data: &[u8],
    start: SectorAddr,
    offset_of: impl Fn(SectorAddr) -> Option<usize>,
) -> Result<(Vec<SectorSlice>, u32), Error> {
    const SECTOR_LEN: usize = 256;

    let mut sectors = Vec::new();
    let mut total_len: u32 = 0;
    let mut visited = HashSet::new();
    let mut current = start;

    loop {
        if !visited.insert(current.key()) {
            return Err(Error::Codec("cyclic sector chain"));
        }
        let offset = offset_of(current).ok_or(Error::Codec("sector address out of range"))?;
        if offset + SECTOR_LEN > data.len() {
            return Err(Error::Codec("sector out of bounds"));
        }
        let next_track = data[offset];
        let next_sector = data[offset + 1];

        if next_track == 0 {
            let data_len = next_sector as usize;
            sectors.push(SectorSlice { data_offset: offset + 2, data_len });
            total_len += data_len as u32;
            break;
        } else {
            sectors.push(SectorSlice { data_offset: offset + 2, data_len: 254 });
            total_len += 254;
            current = SectorAddr::new(next_track, next_sector);
        }
    }

    Ok((sectors, total_len))
}

/// Reads the logical bytes of a file given its already-walked sector chain.
pub fn read_chain_data(data: &[u8], sectors: &[SectorSlice]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sectors.iter().map(|s| s.data_len).sum());
    for s in sectors {
        out.extend_from_slice(&data[s.data_offset..s.data_offset + s.data_len]);
    }
    out
}

/// CRC32 of a file's sector-chain contents, for `HASH` (`spec.md` §4.5
/// `HASH`, §8 scenario 4).
pub fn hash_chain(data: &[u8], sectors: &[SectorSlice]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for s in sectors {
        hasher.update(&data[s.data_offset..s.data_offset + s.data_len]);
    }
    hasher.finalize()
}

/// PETSCII-ish name padding used by the on-disk directory format: names are
/// stored in a 16-byte field padded with `$A0`.
pub fn pad_name(name: &str, len: usize) -> Vec<u8> {
    let mut out = name.as_bytes().to_vec();
    out.truncate(len);
    while out.len() < len {
        out.push(0xA0);
    }
    out
}

pub fn unpad_name(bytes: &[u8]) -> String {
    let trimmed_len = bytes.iter().rposition(|&b| b != 0xA0 && b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..trimmed_len]).to_string()
}

/// Ensures loaded directory names are unique by appending `~n`, per
/// `spec.md` §3 invariant (b).
pub fn disambiguate(tree: &mut ImageTree, mut name: String) -> String {
    if !tree.files.contains_key(&name) && !tree.dirs.contains_key(&name) {
        return name;
    }
    let base = name.clone();
    let mut n = 1;
    loop {
        let candidate = format!("{base}~{n}");
        if !tree.files.contains_key(&candidate) && !tree.dirs.contains_key(&candidate) {
            name = candidate;
            return name;
        }
        n += 1;
    }
}

pub fn not_supported() -> Error {
    Error::Status(Status::NotSupported)
}
