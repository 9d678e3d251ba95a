use std::fmt;
use std::fs::File;
use std::io::{Error, ErrorKind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::encoding::validate_id_list;
use crate::{
    MvMapDefaultHashLoader, MvMapError, MvMapHashLoader, MvMapHeader, MvMapInfo, MvMapReader,
    PerfectHash, Result, ValueIdList,
};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Chunk size used when streaming a blob out of a [`MvMapReader`].
const LOAD_CHUNK_SIZE: u64 = 16 << 20;

/// Offset table plus byte region, as stored for keys, values and id lists.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Arena<'a> {
    offsets: &'a [u8],
    bytes: &'a [u8],
}

impl<'a> Arena<'a> {
    #[inline]
    fn offset(&self, i: usize) -> usize {
        LittleEndian::read_u64(&self.offsets[i * 8..i * 8 + 8]) as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.offsets.len() / 8 - 1
    }

    #[inline]
    pub(crate) fn get(&self, i: usize) -> &'a [u8] {
        &self.bytes[self.offset(i)..self.offset(i + 1)]
    }
}

/// Positions of every region inside the blob, resolved once on load.
#[derive(Debug, Clone, Copy, Default)]
struct Layout {
    value_offsets: usize,
    value_bytes: usize,
    value_bytes_len: usize,
    key_offsets: usize,
    list_offsets: usize,
    key_bytes: usize,
    key_bytes_len: usize,
    list_bytes: usize,
    list_bytes_len: usize,
}

/// Immutable key to multi-value map backed by a serialized blob.
///
/// The blob is validated once when the map is constructed. Afterwards
/// lookups evaluate the perfect hash, compare the stored key at the resulting
/// slot and decode its value id list without further bounds checks.
///
/// # Type Parameters
/// - `B`: byte container holding the blob, e.g. `Vec<u8>`, `&[u8]` or [`Mmap`].
/// - `H`: perfect hash loader the blob was built with.
pub struct MvMap<B: AsRef<[u8]> = Vec<u8>, H: MvMapHashLoader = MvMapDefaultHashLoader> {
    /// Parsed blob header.
    pub header: MvMapHeader,
    data: B,
    layout: Layout,
    index: Option<H::Function>,
    instance: u64,
}

impl<B: AsRef<[u8]>, H: MvMapHashLoader> fmt::Debug for MvMap<B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvMap")
            .field("header", &self.header)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl<B: AsRef<[u8]>> MvMap<B> {
    /// Constructs a map over an in-memory blob built with the default hash.
    ///
    /// # Errors
    ///
    /// Returns [`MvMapError::CorruptBlob`] when the header or any section
    /// fails validation.
    pub fn from_bytes(data: B) -> Result<Self> {
        Self::parse(data)
    }
}

impl MvMap<Vec<u8>> {
    /// Reads a blob from a [`MvMapReader`] (typically a file) into memory.
    pub fn load<R: MvMapReader>(reader: R) -> Result<Self> {
        Self::read_from(reader)
    }
}

impl MvMap<Mmap> {
    /// Memory-maps the blob stored at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::map_file(path)
    }
}

impl<H: MvMapHashLoader> MvMap<Vec<u8>, H> {
    /// Reads a blob built with loader `H` from `reader`.
    ///
    /// The header is read first to learn the blob length, then the blob is
    /// read in chunks so that a corrupt length fails on the first short read
    /// instead of a huge allocation.
    pub fn read_from<R: MvMapReader>(reader: R) -> Result<Self> {
        let head = reader
            .read_vec_at(0, MvMapHeader::SIZE as u64)
            .map_err(truncated(0))?;
        let header = MvMapHeader::deserialize(&head)?;

        let mut total = MvMapHeader::SIZE as u64;
        for section in [header.values, header.keys, header.index] {
            let end = section
                .end()
                .ok_or_else(|| MvMapError::corrupt(section.offset, "section end overflows"))?;
            total = total.max(end);
        }

        let mut data = head;
        let mut offset = data.len() as u64;
        while offset < total {
            let chunk = std::cmp::min(total - offset, LOAD_CHUNK_SIZE);
            reader
                .read_exact_at(offset, chunk, |bytes| {
                    data.extend_from_slice(bytes);
                    Ok(())
                })
                .map_err(truncated(offset))?;
            offset += chunk;
        }
        Self::parse(data)
    }
}

impl<H: MvMapHashLoader> MvMap<Mmap, H> {
    /// Memory-maps a blob built with loader `H`.
    pub fn map_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        // The mapping is read-only and blobs are never modified once written.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(mmap)
    }
}

fn truncated(offset: u64) -> impl FnOnce(Error) -> MvMapError {
    move |e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            MvMapError::corrupt(offset, "blob is truncated")
        } else {
            MvMapError::Io(e)
        }
    }
}

/// Checks an offset table of `count + 1` entries at `at`: it starts at zero,
/// never decreases and ends at `bytes_len`.
fn check_offsets(data: &[u8], at: usize, count: usize, bytes_len: usize) -> Result<()> {
    let mut previous = 0u64;
    for i in 0..=count {
        let pos = at + i * 8;
        let offset = LittleEndian::read_u64(&data[pos..pos + 8]);
        if (i == 0 && offset != 0) || offset < previous || offset > bytes_len as u64 {
            return Err(MvMapError::corrupt(
                pos as u64,
                format!("offset {} of entry {} is out of order or range", offset, i),
            ));
        }
        previous = offset;
    }
    if previous != bytes_len as u64 {
        return Err(MvMapError::corrupt(
            (at + count * 8) as u64,
            format!("offset table ends at {} instead of {}", previous, bytes_len),
        ));
    }
    Ok(())
}

impl<B: AsRef<[u8]>, H: MvMapHashLoader> MvMap<B, H> {
    /// Validates `data` and constructs a map over it.
    ///
    /// # Errors
    ///
    /// Returns [`MvMapError::CorruptBlob`] naming the offending offset when the
    /// magic number or version is wrong, a section lies outside the blob or
    /// overlaps another, an offset table is inconsistent, an id list is
    /// malformed or references an unknown value, or the index section does not
    /// map every stored key to its own slot.
    pub fn parse(data: B) -> Result<Self> {
        let bytes = data.as_ref();
        let header = MvMapHeader::deserialize(bytes)?;
        let total = bytes.len() as u64;

        let mut sections = [
            ("values", header.values),
            ("keys", header.keys),
            ("index", header.index),
        ];
        for (name, section) in sections {
            let end = section.end().ok_or_else(|| {
                MvMapError::corrupt(section.offset, format!("{} section end overflows", name))
            })?;
            if section.offset < MvMapHeader::SIZE as u64 || end > total {
                return Err(MvMapError::corrupt(
                    section.offset,
                    format!(
                        "{} section {}..{} lies outside blob of {} bytes",
                        name, section.offset, end, total
                    ),
                ));
            }
        }
        sections.sort_by_key(|(_, section)| section.offset);
        for pair in sections.windows(2) {
            let (name, first) = pair[0];
            let (next, second) = pair[1];
            if first.offset + first.length > second.offset {
                return Err(MvMapError::corrupt(
                    second.offset,
                    format!("{} section overlaps {} section", next, name),
                ));
            }
        }

        let num_keys = header.num_keys as usize;
        let num_values = header.num_values as usize;

        let value_table = 8 * (num_values as u64 + 1);
        if header.values.length < value_table {
            return Err(MvMapError::corrupt(
                header.values.offset,
                format!("values section too short for {} values", num_values),
            ));
        }
        let value_offsets = header.values.offset as usize;
        let value_bytes_len = (header.values.length - value_table) as usize;
        check_offsets(bytes, value_offsets, num_values, value_bytes_len)?;

        let key_tables = 16 * (num_keys as u64 + 1);
        if header.keys.length < key_tables {
            return Err(MvMapError::corrupt(
                header.keys.offset,
                format!("keys section too short for {} keys", num_keys),
            ));
        }
        let key_offsets = header.keys.offset as usize;
        let list_offsets = key_offsets + 8 * (num_keys + 1);
        let key_bytes_len = LittleEndian::read_u64(&bytes[list_offsets - 8..list_offsets]);
        let list_bytes_len = LittleEndian::read_u64(
            &bytes[list_offsets + 8 * num_keys..list_offsets + 8 * (num_keys + 1)],
        );
        let expected = key_tables
            .checked_add(key_bytes_len)
            .and_then(|n| n.checked_add(list_bytes_len));
        if expected != Some(header.keys.length) {
            return Err(MvMapError::corrupt(
                header.keys.offset,
                format!(
                    "keys section length {} does not match its tables",
                    header.keys.length
                ),
            ));
        }
        let key_bytes_len = key_bytes_len as usize;
        let list_bytes_len = list_bytes_len as usize;
        check_offsets(bytes, key_offsets, num_keys, key_bytes_len)?;
        check_offsets(bytes, list_offsets, num_keys, list_bytes_len)?;

        let layout = Layout {
            value_offsets,
            value_bytes: value_offsets + value_table as usize,
            value_bytes_len,
            key_offsets,
            list_offsets,
            key_bytes: list_offsets + 8 * (num_keys + 1),
            key_bytes_len,
            list_bytes: list_offsets + 8 * (num_keys + 1) + key_bytes_len,
            list_bytes_len,
        };

        let lists = Self::arena(
            bytes,
            layout.list_offsets,
            num_keys,
            layout.list_bytes,
            list_bytes_len,
        );
        for slot in 0..num_keys {
            validate_id_list(lists.get(slot), header.compressed(), header.num_values).map_err(
                |reason| {
                    MvMapError::corrupt(
                        (layout.list_bytes + lists.offset(slot)) as u64,
                        format!("value list of key {}: {}", slot, reason),
                    )
                },
            )?;
        }

        let index_range =
            header.index.offset as usize..(header.index.offset + header.index.length) as usize;
        let index = if num_keys >= 2 {
            let function = H::unpack(&bytes[index_range]).map_err(|e| match e {
                MvMapError::CorruptBlob { offset, reason } => {
                    MvMapError::corrupt(header.index.offset + offset, reason)
                }
                other => other,
            })?;
            if function.len() != num_keys {
                return Err(MvMapError::corrupt(
                    header.index.offset,
                    format!(
                        "hash function covers {} slots but the map has {} keys",
                        function.len(),
                        num_keys
                    ),
                ));
            }
            let keys = Self::arena(
                bytes,
                layout.key_offsets,
                num_keys,
                layout.key_bytes,
                key_bytes_len,
            );
            for slot in 0..num_keys {
                let hashed = function.slot(keys.get(slot));
                if hashed != slot {
                    return Err(MvMapError::corrupt(
                        (layout.key_bytes + keys.offset(slot)) as u64,
                        format!("key stored in slot {} hashes to slot {}", slot, hashed),
                    ));
                }
            }
            Some(function)
        } else {
            if header.index.length != 0 {
                return Err(MvMapError::corrupt(
                    header.index.offset,
                    format!("unexpected index section for {} keys", num_keys),
                ));
            }
            None
        };

        tracing::debug!(
            keys = num_keys,
            values = num_values,
            bytes = total,
            "loaded mvmap blob"
        );
        Ok(MvMap {
            header,
            data,
            layout,
            index,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn arena(
        data: &[u8],
        offsets: usize,
        count: usize,
        bytes: usize,
        bytes_len: usize,
    ) -> Arena<'_> {
        Arena {
            offsets: &data[offsets..offsets + 8 * (count + 1)],
            bytes: &data[bytes..bytes + bytes_len],
        }
    }

    pub(crate) fn key_arena(&self) -> Arena<'_> {
        let l = &self.layout;
        Self::arena(
            self.data.as_ref(),
            l.key_offsets,
            self.len(),
            l.key_bytes,
            l.key_bytes_len,
        )
    }

    pub(crate) fn list_arena(&self) -> Arena<'_> {
        let l = &self.layout;
        Self::arena(
            self.data.as_ref(),
            l.list_offsets,
            self.len(),
            l.list_bytes,
            l.list_bytes_len,
        )
    }

    pub(crate) fn value_arena(&self) -> Arena<'_> {
        let l = &self.layout;
        Self::arena(
            self.data.as_ref(),
            l.value_offsets,
            self.num_values(),
            l.value_bytes,
            l.value_bytes_len,
        )
    }

    pub(crate) fn instance(&self) -> u64 {
        self.instance
    }

    /// Returns the number of distinct keys.
    pub fn len(&self) -> usize {
        self.header.num_keys as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.num_keys == 0
    }

    /// Returns the number of distinct values.
    pub fn num_values(&self) -> usize {
        self.header.num_values as usize
    }

    /// Whether duplicate (key, value) pairs were collapsed at finalize time.
    pub fn unique_items(&self) -> bool {
        self.header.unique_items()
    }

    pub fn is_compressed(&self) -> bool {
        self.header.compressed()
    }

    /// The raw blob.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn slot(&self, key: &[u8]) -> Option<usize> {
        let slot = match (self.len(), &self.index) {
            (0, _) => return None,
            (1, _) => 0,
            (_, Some(index)) => index.slot(key),
            (_, None) => return None,
        };
        (self.key_arena().get(slot) == key).then_some(slot)
    }

    pub(crate) fn key_at(&self, slot: usize) -> &[u8] {
        self.key_arena().get(slot)
    }

    pub(crate) fn ids_at(&self, slot: usize) -> ValueIdList<'_> {
        ValueIdList::new(self.list_arena().get(slot), self.is_compressed())
    }

    /// Returns the value ids stored under `key`, or `None` if it is absent.
    pub fn get_ids(&self, key: impl AsRef<[u8]>) -> Option<ValueIdList<'_>> {
        self.slot(key.as_ref()).map(|slot| self.ids_at(slot))
    }

    /// Returns the values stored under `key`, ordered by value id.
    ///
    /// An absent key yields an empty iterator. Duplicates are preserved unless
    /// the map was finalized with unique items.
    pub fn get(&self, key: impl AsRef<[u8]>) -> MvMapValues<'_> {
        MvMapValues {
            ids: self.get_ids(key).unwrap_or_else(ValueIdList::empty),
            values: self.value_arena(),
        }
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> bool {
        self.slot(key.as_ref()).is_some()
    }

    /// Resolves a value id to its bytes.
    pub fn value(&self, id: u32) -> Option<&[u8]> {
        ((id as usize) < self.num_values()).then(|| self.value_arena().get(id as usize))
    }

    /// Finds the id of `value` by scanning the value section.
    pub fn value_id(&self, value: impl AsRef<[u8]>) -> Option<u32> {
        let value = value.as_ref();
        self.values().position(|v| v == value).map(|id| id as u32)
    }

    /// Iterates over all keys in storage order.
    pub fn keys(&self) -> MvMapIter<'_> {
        MvMapIter {
            arena: self.key_arena(),
            next: 0,
        }
    }

    /// Iterates over all distinct values in id order.
    pub fn values(&self) -> MvMapIter<'_> {
        MvMapIter {
            arena: self.value_arena(),
            next: 0,
        }
    }

    /// Iterates over every stored (key, value) pair, key by key in storage
    /// order.
    pub fn items(&self) -> MvMapItems<'_> {
        MvMapItems {
            keys: self.key_arena(),
            lists: self.list_arena(),
            values: self.value_arena(),
            compressed: self.is_compressed(),
            slot: 0,
            current: None,
        }
    }

    /// Summarizes the blob. Counting items decodes every list prefix.
    pub fn info(&self) -> MvMapInfo {
        let item_count = (0..self.len())
            .map(|slot| self.ids_at(slot).len() as u64)
            .sum();
        MvMapInfo {
            blob_length: self.as_bytes().len() as u64,
            key_count: self.len() as u64,
            value_count: self.num_values() as u64,
            item_count,
            unique_items: self.unique_items(),
            compressed: self.is_compressed(),
            header: self.header,
        }
    }
}

/// Values stored under one key, returned by [`MvMap::get`].
#[derive(Debug, Clone)]
pub struct MvMapValues<'a> {
    ids: ValueIdList<'a>,
    values: Arena<'a>,
}

impl<'a> MvMapValues<'a> {
    /// The underlying value ids.
    pub fn ids(&self) -> ValueIdList<'a> {
        self.ids.clone()
    }
}

impl<'a> Iterator for MvMapValues<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        Some(self.values.get(id as usize))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

impl ExactSizeIterator for MvMapValues<'_> {}

/// Iterator over the keys or the distinct values of a [`MvMap`].
#[derive(Debug, Clone)]
pub struct MvMapIter<'a> {
    arena: Arena<'a>,
    next: usize,
}

impl<'a> Iterator for MvMapIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.arena.len() {
            return None;
        }
        let item = self.arena.get(self.next);
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.arena.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MvMapIter<'_> {}

/// Iterator over all (key, value) pairs of a [`MvMap`].
#[derive(Debug, Clone)]
pub struct MvMapItems<'a> {
    keys: Arena<'a>,
    lists: Arena<'a>,
    values: Arena<'a>,
    compressed: bool,
    slot: usize,
    current: Option<(&'a [u8], ValueIdList<'a>)>,
}

impl<'a> Iterator for MvMapItems<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, ids)) = &mut self.current {
                if let Some(id) = ids.next() {
                    return Some((*key, self.values.get(id as usize)));
                }
            }

            if self.slot >= self.keys.len() {
                return None;
            }
            let key = self.keys.get(self.slot);
            let ids = ValueIdList::new(self.lists.get(self.slot), self.compressed);
            self.current = Some((key, ids));
            self.slot += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use rand::Rng;
    use rand::seq::SliceRandom;

    use crate::*;

    fn build(entries: &[(&str, &str)], unique_items: bool) -> MvMap {
        let mut builder = MvMapBuilder::new();
        for (key, value) in entries {
            builder.add(key, value).unwrap();
        }
        builder.finalize(unique_items).unwrap().into_map().unwrap()
    }

    fn strings<'a>(iter: impl Iterator<Item = &'a [u8]>) -> Vec<String> {
        iter.map(|b| String::from_utf8(b.to_vec()).unwrap()).collect()
    }

    #[test]
    fn test_single_pair() {
        let map = build(&[("k", "v")], true);
        assert_eq!(map.len(), 1);
        assert_eq!(strings(map.keys()), vec!["k"]);
        assert_eq!(strings(map.values()), vec!["v"]);
        assert_eq!(strings(map.get("k")), vec!["v"]);
        assert_eq!(map.get("x").count(), 0);
        assert!(map.contains_key("k"));
        assert!(!map.contains_key(""));
    }

    #[test]
    fn test_basic_lookup() {
        let entries = [
            ("fruit", "apple"),
            ("fruit", "banana"),
            ("red", "apple"),
            ("red", "cherry"),
            ("yellow", "banana"),
            ("fruit", "apple"),
        ];
        let map = build(&entries, false);
        assert_eq!(map.len(), 3);
        assert_eq!(map.num_values(), 3);
        assert_eq!(strings(map.get("fruit")), vec!["apple", "apple", "banana"]);
        assert_eq!(map.get("fruit").len(), 3);
        assert_eq!(map.get_ids("red").unwrap().len(), 2);
        assert!(map.get_ids("blue").is_none());
        assert_eq!(map.value_id("cherry"), Some(2));
        assert_eq!(map.value(2), Some(&b"cherry"[..]));
        assert_eq!(map.value(3), None);

        let info = map.info();
        assert_eq!(info.item_count, 6);
        assert_eq!(info.blob_length, map.as_bytes().len() as u64);
        assert!(!info.unique_items);

        let map = build(&entries, true);
        assert_eq!(strings(map.get("fruit")), vec!["apple", "banana"]);
        assert_eq!(map.info().item_count, 5);
    }

    #[test]
    fn test_empty_map() {
        let mut builder = MvMapBuilder::new();
        let blob = builder.finalize(true).unwrap();
        assert_eq!(blob.header().num_keys, 0);
        let map = blob.into_map().unwrap();
        assert!(map.is_empty());
        assert_eq!(map.keys().count(), 0);
        assert_eq!(map.values().count(), 0);
        assert_eq!(map.items().count(), 0);
        assert_eq!(map.get("anything").count(), 0);
        assert!(map.query_str("a | !b", None).unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_random() {
        let mut rng = rand::thread_rng();
        let mut pairs: Vec<(String, String)> = (0..5000)
            .map(|_| {
                let key = format!("key{}", rng.gen_range(0..700));
                let value = format!("value{}", rng.gen_range(0..300));
                (key, value)
            })
            .collect();

        let mut builder = MvMapBuilder::new();
        for (k, v) in &pairs {
            builder.add(k, v).unwrap();
        }
        let map = builder.finalize(false).unwrap().into_map().unwrap();

        let mut items: Vec<(String, String)> = map
            .items()
            .map(|(k, v)| {
                (
                    String::from_utf8(k.to_vec()).unwrap(),
                    String::from_utf8(v.to_vec()).unwrap(),
                )
            })
            .collect();
        items.sort();
        pairs.sort();
        assert_eq!(items, pairs);

        // Independent of insertion order, and unique items collapse duplicates.
        pairs.shuffle(&mut rng);
        let mut builder = MvMapBuilder::new();
        for (k, v) in &pairs {
            builder.add(k, v).unwrap();
        }
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        let mut expected: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (k, v) in &pairs {
            expected.entry(k.as_str()).or_default().insert(v.as_str());
        }
        assert_eq!(map.len(), expected.len());
        for (key, values) in &expected {
            let got: BTreeSet<String> = strings(map.get(key)).into_iter().collect();
            let want: BTreeSet<String> = values.iter().map(|v| v.to_string()).collect();
            assert_eq!(got, want);
        }
        for i in 700..1000 {
            assert_eq!(map.get(format!("key{}", i)).count(), 0);
        }
    }

    #[test]
    fn test_absent_keys_never_hit() {
        let keys: Vec<String> = (0..2000).map(|i| format!("{:08}", i)).collect();
        let mut builder = MvMapBuilder::new();
        for key in &keys {
            builder.add(key, "v").unwrap();
        }
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        for i in 2000..20000 {
            let key = format!("{:08}", i);
            assert!(!map.contains_key(&key));
            assert_eq!(map.get(&key).count(), 0);
        }
        // Prefixes and extensions of stored keys share bytes but must miss.
        assert!(!map.contains_key("0000000"));
        assert!(!map.contains_key("000000000"));
        for key in &keys {
            assert_eq!(map.get(key).count(), 1);
        }
    }

    #[test]
    fn test_iteration_is_restartable() {
        let map = build(&[("a", "1"), ("b", "2"), ("c", "3"), ("c", "4")], true);
        let first: Vec<_> = map.items().collect();
        let second: Vec<_> = map.items().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert_eq!(map.keys().len(), 3);
        let partial: Vec<_> = map.items().skip(1).take(2).collect();
        assert_eq!(partial, first[1..3].to_vec());
    }

    #[test]
    fn test_uncompressed_lists() {
        let mut builder = MvMapBuilder::new().with_compression(false);
        for i in 0..100 {
            builder.add(format!("k{}", i % 7), format!("v{}", i)).unwrap();
        }
        let map = builder.finalize(false).unwrap().into_map().unwrap();
        assert!(!map.is_compressed());
        assert_eq!(map.items().count(), 100);
        assert_eq!(map.get("k0").count(), 15);
    }

    #[test]
    fn test_load_and_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.mvm");
        let mut builder = MvMapBuilder::new();
        for i in 0..1000 {
            builder.add(format!("k{}", i % 100), format!("v{}", i % 37)).unwrap();
        }
        let blob = builder.finalize(true).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        blob.dump(&file).unwrap();

        let map = MvMap::load(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(map.as_bytes(), blob.as_bytes());
        assert_eq!(map.len(), 100);

        let mapped = MvMap::open(&path).unwrap();
        assert_eq!(mapped.info(), map.info());
        for i in 0..100 {
            let key = format!("k{}", i);
            assert_eq!(
                mapped.get(&key).collect::<Vec<_>>(),
                map.get(&key).collect::<Vec<_>>()
            );
        }
    }

    fn corrupt_at(blob: &[u8], offset: usize, data: &[u8]) -> Vec<u8> {
        let mut bytes = blob.to_vec();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        bytes
    }

    fn assert_corrupt(result: Result<MvMap<Vec<u8>>>) {
        match result {
            Err(MvMapError::CorruptBlob { .. }) => {}
            other => panic!("expected corrupt blob, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_data() {
        let mut builder = MvMapBuilder::new();
        for i in 0..100 {
            builder.add(format!("k{}", i), format!("v{}", i % 10)).unwrap();
        }
        let blob = builder.finalize(true).unwrap();
        let bytes = blob.as_bytes();
        let header = *blob.header();
        MvMap::from_bytes(bytes.to_vec()).unwrap();

        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, 0, b"NOPE")));
        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, 4, &2u32.to_le_bytes())));
        assert_corrupt(MvMap::from_bytes(bytes[..bytes.len() - 1].to_vec()));
        assert_corrupt(MvMap::from_bytes(bytes[..40].to_vec()));
        assert_corrupt(MvMap::from_bytes(Vec::new()));

        // Section pointing past the end of the blob.
        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, 48, &u64::MAX.to_le_bytes())));
        // More values claimed than stored.
        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, 12, &1000u32.to_le_bytes())));
        // Fewer values than referenced by lists.
        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, 12, &5u32.to_le_bytes())));

        // Broken value offset table.
        let at = header.values.offset as usize + 8;
        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, at, &u64::MAX.to_le_bytes())));

        // Garbage in the index section.
        let at = header.index.offset as usize;
        assert_corrupt(MvMap::from_bytes(corrupt_at(bytes, at, &[0xc1; 8])));

        // Swapping two keys breaks the slot check.
        let map = MvMap::from_bytes(bytes.to_vec()).unwrap();
        let key_bytes_at = header.keys.offset as usize + 16 * 101;
        let first = map.key_at(0).to_vec();
        let second = map.key_at(1).to_vec();
        if first.len() == second.len() && first != second {
            let mut swapped = corrupt_at(bytes, key_bytes_at, &second);
            swapped[key_bytes_at + first.len()..key_bytes_at + 2 * first.len()]
                .copy_from_slice(&first);
            assert_corrupt(MvMap::from_bytes(swapped));
        }
    }

    #[test]
    fn test_load_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.mvm");
        let mut builder = MvMapBuilder::new();
        for i in 0..100 {
            builder.add(format!("k{}", i), "v").unwrap();
        }
        let blob = builder.finalize(true).unwrap();
        std::fs::write(&path, &blob.as_bytes()[..blob.length() as usize - 10]).unwrap();
        assert_corrupt(MvMap::load(std::fs::File::open(&path).unwrap()));

        std::fs::write(&path, b"").unwrap();
        assert_corrupt(MvMap::load(std::fs::File::open(&path).unwrap()));
    }

    #[test]
    fn test_shared_across_threads() {
        const P: usize = 8;
        const N: usize = 10_000;
        let mut builder = MvMapBuilder::new();
        for i in 0..N {
            builder.add(i.to_string(), (i * 2).to_string()).unwrap();
        }
        let map = Arc::new(builder.finalize(true).unwrap().into_map().unwrap());

        let mut threads = Vec::with_capacity(P);
        for p in 0..P {
            let map = map.clone();
            threads.push(std::thread::spawn(move || {
                for i in (p..N).step_by(P) {
                    let values: Vec<_> = map.get(i.to_string()).collect();
                    assert_eq!(values, vec![(i * 2).to_string().as_bytes()]);
                }
                assert_eq!(map.keys().count(), N);
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_binary_keys_and_values() {
        let mut builder = MvMapBuilder::new();
        let mut rng = rand::thread_rng();
        let mut expected: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>> = BTreeMap::new();
        for _ in 0..500 {
            let key: Vec<u8> = (0..rng.gen_range(0..6)).map(|_| rng.r#gen::<u8>()).collect();
            let value: Vec<u8> = (0..rng.gen_range(0..4)).map(|_| rng.r#gen::<u8>()).collect();
            builder.add(&key, &value).unwrap();
            expected.entry(key).or_default().insert(value);
        }
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(map.len(), expected.len());
        for (key, values) in &expected {
            let got: BTreeSet<Vec<u8>> = map.get(key).map(|v| v.to_vec()).collect();
            assert_eq!(&got, values);
        }
    }
}
