use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{MAGIC_NUMBER, MvMapError, Result};

/// Current blob format revision.
///
/// The index section stores the CHD seed and displacements, not the hashes
/// themselves, so a blob is only readable while `foldhash::fast::FixedState`
/// produces the same output. `foldhash` is pinned to an exact version for
/// this reason; moving to another release that changes its output requires a
/// new format version.
pub const FORMAT_VERSION: u32 = 1;

/// Location of one section inside a blob.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MvMapSection {
    /// Absolute offset of the section.
    pub offset: u64,
    /// Length of the section in bytes.
    pub length: u64,
}

impl MvMapSection {
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Fixed-size header at the start of every blob.
///
/// All integers are little-endian:
///
/// ```text
/// [magic: 4][version: u32][num_keys: u32][num_values: u32]
/// [values: u64 offset, u64 len][keys: u64 offset, u64 len][index: u64 offset, u64 len]
/// [flags: u32]
/// ```
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MvMapHeader {
    pub version: u32,
    pub num_keys: u32,
    pub num_values: u32,
    pub values: MvMapSection,
    pub keys: MvMapSection,
    pub index: MvMapSection,
    pub flags: u32,
}

impl MvMapHeader {
    pub const SIZE: usize = 4 + 4 * 3 + 8 * 6 + 4;

    /// Per-key value lists were deduplicated at finalize time.
    pub const FLAG_UNIQUE_ITEMS: u32 = 1;
    /// Per-key value lists are delta/varint compressed.
    pub const FLAG_COMPRESSED: u32 = 1 << 1;

    pub fn unique_items(&self) -> bool {
        self.flags & Self::FLAG_UNIQUE_ITEMS != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & Self::FLAG_COMPRESSED != 0
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[..4].copy_from_slice(&MAGIC_NUMBER);
        LittleEndian::write_u32(&mut data[4..8], self.version);
        LittleEndian::write_u32(&mut data[8..12], self.num_keys);
        LittleEndian::write_u32(&mut data[12..16], self.num_values);
        let sections = [self.values, self.keys, self.index];
        for (i, section) in sections.iter().enumerate() {
            let at = 16 + i * 16;
            LittleEndian::write_u64(&mut data[at..at + 8], section.offset);
            LittleEndian::write_u64(&mut data[at + 8..at + 16], section.length);
        }
        LittleEndian::write_u32(&mut data[64..68], self.flags);
        data
    }

    /// Parses and checks magic and version. Section bounds are checked by
    /// the map on load.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(MvMapError::corrupt(
                data.len() as u64,
                format!("blob of {} bytes is shorter than its header", data.len()),
            ));
        }
        if data[..4] != MAGIC_NUMBER {
            return Err(MvMapError::corrupt(
                0,
                format!("Invalid magic number: {:?}", &data[..4]),
            ));
        }
        let version = LittleEndian::read_u32(&data[4..8]);
        if version != FORMAT_VERSION {
            return Err(MvMapError::corrupt(
                4,
                format!("Unsupported format version: {}", version),
            ));
        }
        let section = |at: usize| MvMapSection {
            offset: LittleEndian::read_u64(&data[at..at + 8]),
            length: LittleEndian::read_u64(&data[at + 8..at + 16]),
        };
        Ok(MvMapHeader {
            version,
            num_keys: LittleEndian::read_u32(&data[8..12]),
            num_values: LittleEndian::read_u32(&data[12..16]),
            values: section(16),
            keys: section(32),
            index: section(48),
            flags: LittleEndian::read_u32(&data[64..68]),
        })
    }
}

/// Summary of a blob, returned by [`MvMap::info`](crate::MvMap::info).
#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq)]
pub struct MvMapInfo {
    /// Total size of the blob in bytes.
    pub blob_length: u64,
    /// Number of distinct keys.
    pub key_count: u64,
    /// Number of distinct values.
    pub value_count: u64,
    /// Number of stored (key, value) pairs, duplicates included.
    pub item_count: u64,
    /// Whether duplicate pairs were collapsed at finalize time.
    pub unique_items: bool,
    /// Whether per-key lists are compressed.
    pub compressed: bool,
    /// Parsed header.
    pub header: MvMapHeader,
}
