//! Encoding of per-key value id lists.
//!
//! Compressed lists are a LEB128 count followed by LEB128 deltas between
//! ascending ids. Uncompressed lists are a little-endian `u32` count followed
//! by raw little-endian `u32` ids.

use byteorder::{ByteOrder, LittleEndian};

/// Encode an unsigned integer as LEB128 into `buf`.
pub(crate) fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 integer from `buf` at `*pos`, advancing `*pos`.
///
/// Returns `None` on truncated input or overflow past 64 bits.
pub(crate) fn decode_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;

        let payload = (byte & 0x7F) as u64;
        if shift >= 63 && payload > 1 {
            return None;
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

/// Appends the encoding of `ids` to `buf`. `ids` must be sorted ascending.
pub(crate) fn encode_id_list(ids: &[u32], compressed: bool, buf: &mut Vec<u8>) {
    if compressed {
        encode_varint(ids.len() as u64, buf);
        let mut last = 0u32;
        for &id in ids {
            encode_varint((id - last) as u64, buf);
            last = id;
        }
    } else {
        let start = buf.len();
        buf.resize(start + 4 * (ids.len() + 1), 0);
        LittleEndian::write_u32(&mut buf[start..start + 4], ids.len() as u32);
        LittleEndian::write_u32_into(ids, &mut buf[start + 4..]);
    }
}

/// Checks that `data` holds exactly one well-formed list whose ids are all
/// below `num_values`. Returns a description of the first problem found.
pub(crate) fn validate_id_list(
    data: &[u8],
    compressed: bool,
    num_values: u32,
) -> std::result::Result<(), String> {
    if compressed {
        let mut pos = 0;
        let count = decode_varint(data, &mut pos).ok_or("truncated list count")?;
        let mut id = 0u64;
        for i in 0..count {
            let delta = decode_varint(data, &mut pos).ok_or("truncated list entry")?;
            id = id.checked_add(delta).ok_or("list entry overflow")?;
            if id >= num_values as u64 {
                return Err(format!("value id {} at entry {} out of range", id, i));
            }
        }
        if pos != data.len() {
            return Err(format!("{} trailing bytes after list", data.len() - pos));
        }
    } else {
        if data.len() < 4 {
            return Err("truncated list count".to_string());
        }
        let count = LittleEndian::read_u32(data) as usize;
        if data.len() != 4 + count * 4 {
            return Err(format!(
                "list length {} does not match count {}",
                data.len(),
                count
            ));
        }
        for (i, chunk) in data[4..].chunks_exact(4).enumerate() {
            let id = LittleEndian::read_u32(chunk);
            if id >= num_values {
                return Err(format!("value id {} at entry {} out of range", id, i));
            }
        }
    }
    Ok(())
}

/// Lazily decoded list of value ids stored under one key.
///
/// The list length is read from its prefix, so [`len`](ExactSizeIterator::len)
/// is O(1) before iteration starts.
#[derive(Debug, Clone)]
pub struct ValueIdList<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u32,
    last: u32,
    compressed: bool,
}

impl<'a> ValueIdList<'a> {
    /// Wraps a list that already passed [`validate_id_list`].
    pub(crate) fn new(data: &'a [u8], compressed: bool) -> Self {
        let mut pos = 0;
        let remaining = if compressed {
            decode_varint(data, &mut pos).unwrap_or(0) as u32
        } else if data.len() >= 4 {
            pos = 4;
            LittleEndian::read_u32(data)
        } else {
            0
        };
        ValueIdList {
            data,
            pos,
            remaining,
            last: 0,
            compressed,
        }
    }

    pub(crate) fn empty() -> Self {
        ValueIdList {
            data: &[],
            pos: 0,
            remaining: 0,
            last: 0,
            compressed: true,
        }
    }
}

impl Iterator for ValueIdList<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        let id = if self.compressed {
            let delta = decode_varint(self.data, &mut self.pos)?;
            self.last.wrapping_add(delta as u32)
        } else {
            let chunk = self.data.get(self.pos..self.pos + 4)?;
            self.pos += 4;
            LittleEndian::read_u32(chunk)
        };
        self.last = id;
        self.remaining -= 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for ValueIdList<'_> {}
