use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::time::Instant;

use byteorder::{LittleEndian, WriteBytesExt};
use foldhash::fast::RandomState;

use crate::encoding::encode_id_list;
use crate::{
    FORMAT_VERSION, Interner, MvMap, MvMapDefaultHashLoader, MvMapError, MvMapHashConfig,
    MvMapHashLoader, MvMapHeader, MvMapInfo, MvMapSection, MvMapWriter, MvMapWriterWrapper,
    PerfectHash, Result,
};

/// Largest number of distinct keys or values a blob can describe.
const MAX_ENTRIES: usize = u32::MAX as usize;

/// Step between the seeds of consecutive perfect hash attempts.
const SEED_STEP: u64 = 0x9E37_79B9_7F4A_7C15;

/// Accumulates (key, value) pairs and finalizes them into an [`MvMapBlob`].
///
/// Keys and values are interned as they arrive; each key keeps the list of
/// value ids added under it. The builder is single-writer: every mutation
/// takes `&mut self`.
///
/// A successful [`finalize`](Self::finalize) resets the builder to empty,
/// keeping its configuration, so it can be reused. A failed finalize leaves
/// the accumulated pairs untouched.
///
/// The loader type parameter `H` allows swapping in a custom
/// [`MvMapHashLoader`].
#[derive(Debug)]
pub struct MvMapBuilder<H: MvMapHashLoader = MvMapDefaultHashLoader> {
    hash_config: MvMapHashConfig,
    compressed: bool,
    writer_buffer_size: usize,
    keys: Interner,
    values: Interner,
    lists: Vec<Vec<u32>>,
    item_count: u64,
    phantom: std::marker::PhantomData<H>,
}

impl<H: MvMapHashLoader> Default for MvMapBuilder<H> {
    fn default() -> Self {
        Self {
            hash_config: MvMapHashConfig::default(),
            compressed: true,
            writer_buffer_size: 16 << 20, // 16 MiB
            keys: Interner::new(),
            values: Interner::new(),
            lists: Vec::new(),
            item_count: 0,
            phantom: std::marker::PhantomData,
        }
    }
}

impl MvMapBuilder {
    /// Creates an empty builder with the default hash loader.
    pub fn new() -> Self {
        <Self as Default>::default()
    }

    /// Creates an empty builder with the default hash loader.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        <Self as Default>::default()
    }
}

impl<H: MvMapHashLoader> MvMapBuilder<H> {
    /// Replaces the perfect hash configuration.
    pub fn with_hash_config(mut self, config: MvMapHashConfig) -> Self {
        self.hash_config = config;
        self
    }

    /// Overrides the seed of the first perfect hash attempt.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        match self.hash_config.parameters.as_object_mut() {
            Some(parameters) => {
                parameters.insert("seed".to_string(), seed.into());
            }
            None => self.hash_config.parameters = serde_json::json!({ "seed": seed }),
        }
        self
    }

    /// Controls whether value id lists are delta/varint compressed.
    ///
    /// Uncompressed lists store raw `u32` ids; they are larger but decode
    /// without any arithmetic.
    pub fn with_compression(mut self, value: bool) -> Self {
        self.compressed = value;
        self
    }

    /// Adjusts the capacity of the buffered writer used by
    /// [`finalize_to`](Self::finalize_to).
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    pub fn hash_config(&self) -> &MvMapHashConfig {
        &self.hash_config
    }

    /// Number of distinct keys added so far.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of (key, value) pairs added so far, duplicates included.
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Records that `value` is associated with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MvMapError::TooLarge`] once the number of distinct keys or
    /// values, or the number of values under one key, would exceed `u32`.
    pub fn add(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let key_id = self.intern_key(key.as_ref())?;
        let value_id = self.intern_value(value.as_ref())?;
        self.push(key_id, value_id)
    }

    /// Re-inserts every (key, value) pair of `map`.
    ///
    /// With `collapse_duplicates`, a value already present under a key is not
    /// added again, whether it came from this builder or from `map`.
    pub fn merge<B: AsRef<[u8]>, H2: MvMapHashLoader>(
        &mut self,
        map: &MvMap<B, H2>,
        collapse_duplicates: bool,
    ) -> Result<()> {
        let mut translate = vec![u32::MAX; map.num_values()];
        for slot in 0..map.len() {
            let key_id = self.intern_key(map.key_at(slot))?;
            let mut seen: Option<HashSet<u32, RandomState>> = collapse_duplicates
                .then(|| self.lists[key_id as usize].iter().copied().collect());
            for id in map.ids_at(slot) {
                let local = match translate[id as usize] {
                    u32::MAX => {
                        let value = map.value(id).unwrap_or_default();
                        let local = self.intern_value(value)?;
                        translate[id as usize] = local;
                        local
                    }
                    local => local,
                };
                if let Some(seen) = &mut seen {
                    if !seen.insert(local) {
                        continue;
                    }
                }
                self.push(key_id, local)?;
            }
        }
        tracing::debug!(
            keys = map.len(),
            total_keys = self.len(),
            collapse_duplicates,
            "merged mvmap into builder"
        );
        Ok(())
    }

    /// Adds every key of `map`, replacing each of its values with `value`.
    ///
    /// The key set of `map` is preserved, as is the number of values under
    /// each key.
    pub fn merge_with_explicit_value<B: AsRef<[u8]>, H2: MvMapHashLoader>(
        &mut self,
        map: &MvMap<B, H2>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        // Interned on first use so a value is never stored without a key.
        let mut value_id = None;
        for slot in 0..map.len() {
            let key_id = self.intern_key(map.key_at(slot))?;
            for _ in map.ids_at(slot) {
                let id = match value_id {
                    Some(id) => id,
                    None => *value_id.insert(self.intern_value(value.as_ref())?),
                };
                self.push(key_id, id)?;
            }
        }
        Ok(())
    }

    /// Finalizes the accumulated pairs into an in-memory blob.
    ///
    /// Value ids under each key are sorted; with `unique_items` duplicates
    /// are dropped. On success the builder is reset to empty.
    ///
    /// # Errors
    ///
    /// Returns [`MvMapError::Construction`] when no seed yields a perfect hash
    /// within the configured attempts, or [`MvMapError::InvalidConfig`] for a
    /// bad hash configuration. The builder keeps its contents in both cases.
    ///
    /// # Examples
    ///
    /// ```
    /// use mvmap::MvMapBuilder;
    ///
    /// # fn main() -> mvmap::Result<()> {
    /// let mut builder = MvMapBuilder::new();
    /// builder.add("k", "v")?;
    /// let blob = builder.finalize(true)?;
    /// assert_eq!(blob.header().num_keys, 1);
    /// assert!(builder.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub fn finalize(&mut self, unique_items: bool) -> Result<MvMapBlob> {
        let mut data = Vec::new();
        let info = self.finalize_into(&mut data, unique_items)?;
        Ok(MvMapBlob {
            header: info.header,
            data,
        })
    }

    /// Finalizes straight into `writer` starting at offset zero, buffering
    /// writes by the configured writer buffer size.
    pub fn finalize_to<W: MvMapWriter>(
        &mut self,
        writer: &W,
        unique_items: bool,
    ) -> Result<MvMapInfo> {
        let mut buf_writer = BufWriter::with_capacity(
            self.writer_buffer_size,
            MvMapWriterWrapper::new(writer, 0),
        );
        self.finalize_into(&mut buf_writer, unique_items)
    }

    fn finalize_into<O: Write>(&mut self, out: &mut O, unique_items: bool) -> Result<MvMapInfo> {
        let start = Instant::now();
        tracing::debug!(
            keys = self.len(),
            values = self.values.len(),
            items = self.item_count,
            unique_items,
            "finalizing mvmap"
        );
        let info = self.write_blob(out, unique_items)?;
        out.flush()?;
        tracing::debug!(
            keys = info.key_count,
            values = info.value_count,
            items = info.item_count,
            bytes = info.blob_length,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "finalized mvmap"
        );
        self.reset();
        Ok(info)
    }

    fn reset(&mut self) {
        self.keys = Interner::new();
        self.values = Interner::new();
        self.lists.clear();
        self.item_count = 0;
    }

    fn intern_key(&mut self, key: &[u8]) -> Result<u32> {
        if self.keys.len() >= MAX_ENTRIES && self.keys.lookup(key).is_none() {
            return Err(MvMapError::TooLarge(format!(
                "more than {} distinct keys",
                MAX_ENTRIES
            )));
        }
        let id = self.keys.intern(key);
        if id as usize == self.lists.len() {
            self.lists.push(Vec::new());
        }
        Ok(id)
    }

    fn intern_value(&mut self, value: &[u8]) -> Result<u32> {
        if self.values.len() >= MAX_ENTRIES && self.values.lookup(value).is_none() {
            return Err(MvMapError::TooLarge(format!(
                "more than {} distinct values",
                MAX_ENTRIES
            )));
        }
        Ok(self.values.intern(value))
    }

    fn push(&mut self, key_id: u32, value_id: u32) -> Result<()> {
        let list = &mut self.lists[key_id as usize];
        if list.len() >= MAX_ENTRIES {
            return Err(MvMapError::TooLarge(format!(
                "more than {} values under one key",
                MAX_ENTRIES
            )));
        }
        list.push(value_id);
        self.item_count += 1;
        Ok(())
    }

    /// Builds the perfect hash and returns, for each slot, the id of the key
    /// stored there. Maps with at most one key need no hash function.
    fn slot_order(&self) -> Result<(Vec<u32>, Option<H::Function>)> {
        let n = self.keys.len();
        if n <= 1 {
            return Ok(((0..n as u32).collect(), None));
        }

        let keys: Vec<&[u8]> = self.keys.iter().collect();
        let first_seed = self.hash_config.seed()?;
        let attempts = self.hash_config.max_attempts()?;
        for attempt in 0..attempts {
            let seed = first_seed.wrapping_add((attempt as u64).wrapping_mul(SEED_STEP));
            if let Some(function) = H::build(&self.hash_config, &keys, seed)? {
                if let Some(order) = Self::place(&function, &keys) {
                    return Ok((order, Some(function)));
                }
            }
            if attempt + 1 < attempts {
                tracing::warn!(
                    attempt,
                    seed,
                    keys = n,
                    "perfect hash construction failed, retrying with a new seed"
                );
            }
        }
        Err(MvMapError::Construction { keys: n, attempts })
    }

    /// Inverts `function` over `keys`, or returns `None` if it is not a
    /// bijection onto `[0, keys.len())`.
    fn place(function: &H::Function, keys: &[&[u8]]) -> Option<Vec<u32>> {
        if function.len() != keys.len() {
            return None;
        }
        let mut order = vec![u32::MAX; keys.len()];
        for (id, key) in keys.iter().enumerate() {
            let entry = order.get_mut(function.slot(key))?;
            if *entry != u32::MAX {
                return None;
            }
            *entry = id as u32;
        }
        Some(order)
    }

    fn write_blob<O: Write>(&self, out: &mut O, unique_items: bool) -> Result<MvMapInfo> {
        let (order, function) = self.slot_order()?;
        let index = match &function {
            Some(function) => H::pack(function)?,
            None => Vec::new(),
        };

        let mut list_bytes = Vec::new();
        let mut list_offsets = Vec::with_capacity(order.len() + 1);
        list_offsets.push(0u64);
        let mut scratch: Vec<u32> = Vec::new();
        let mut item_count = 0u64;
        for &key_id in &order {
            scratch.clear();
            scratch.extend_from_slice(&self.lists[key_id as usize]);
            scratch.sort_unstable();
            if unique_items {
                scratch.dedup();
            }
            item_count += scratch.len() as u64;
            encode_id_list(&scratch, self.compressed, &mut list_bytes);
            list_offsets.push(list_bytes.len() as u64);
        }

        let num_keys = order.len();
        let num_values = self.values.len();
        let values_length = 8 * (num_values as u64 + 1) + self.values.byte_len() as u64;
        let keys_length = 16 * (num_keys as u64 + 1)
            + self.keys.byte_len() as u64
            + list_bytes.len() as u64;

        let mut flags = 0;
        if unique_items {
            flags |= MvMapHeader::FLAG_UNIQUE_ITEMS;
        }
        if self.compressed {
            flags |= MvMapHeader::FLAG_COMPRESSED;
        }
        let values = MvMapSection {
            offset: MvMapHeader::SIZE as u64,
            length: values_length,
        };
        let keys = MvMapSection {
            offset: values.offset + values.length,
            length: keys_length,
        };
        let index_section = MvMapSection {
            offset: keys.offset + keys.length,
            length: index.len() as u64,
        };
        let header = MvMapHeader {
            version: FORMAT_VERSION,
            num_keys: num_keys as u32,
            num_values: num_values as u32,
            values,
            keys,
            index: index_section,
            flags,
        };

        out.write_all(&header.serialize())?;

        out.write_u64::<LittleEndian>(0)?;
        let mut offset = 0u64;
        for value in self.values.iter() {
            offset += value.len() as u64;
            out.write_u64::<LittleEndian>(offset)?;
        }
        for value in self.values.iter() {
            out.write_all(value)?;
        }

        out.write_u64::<LittleEndian>(0)?;
        let mut offset = 0u64;
        for &key_id in &order {
            offset += self.keys.get(key_id).unwrap_or_default().len() as u64;
            out.write_u64::<LittleEndian>(offset)?;
        }
        for &offset in &list_offsets {
            out.write_u64::<LittleEndian>(offset)?;
        }
        for &key_id in &order {
            out.write_all(self.keys.get(key_id).unwrap_or_default())?;
        }
        out.write_all(&list_bytes)?;
        out.write_all(&index)?;

        Ok(MvMapInfo {
            blob_length: index_section.offset + index_section.length,
            key_count: num_keys as u64,
            value_count: num_values as u64,
            item_count,
            unique_items,
            compressed: self.compressed,
            header,
        })
    }
}

/// A finalized, self-contained serialized map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvMapBlob {
    header: MvMapHeader,
    data: Vec<u8>,
}

impl MvMapBlob {
    pub fn header(&self) -> &MvMapHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Size of the blob in bytes.
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Writes the blob to `writer` at offset zero.
    pub fn dump<W: MvMapWriter>(&self, writer: &W) -> Result<()> {
        writer.write_all_at(&self.data, 0)?;
        Ok(())
    }

    /// Writes the blob to a stream.
    pub fn dump_to<O: Write>(&self, mut out: O) -> Result<()> {
        out.write_all(&self.data)?;
        out.flush()?;
        Ok(())
    }

    /// Opens the blob as a map built with the default hash loader.
    pub fn into_map(self) -> Result<MvMap> {
        MvMap::from_bytes(self.data)
    }
}

/// Combines existing maps into a fresh [`MvMapBuilder`].
///
/// Inputs are only read; the returned builder is finalized like any other.
#[derive(Debug, Clone)]
pub struct MvMapMerger {
    hash_config: MvMapHashConfig,
    compressed: bool,
}

impl Default for MvMapMerger {
    fn default() -> Self {
        Self {
            hash_config: MvMapHashConfig::default(),
            compressed: true,
        }
    }
}

impl MvMapMerger {
    /// Hash configuration handed to the produced builder.
    pub fn with_hash_config(mut self, config: MvMapHashConfig) -> Self {
        self.hash_config = config;
        self
    }

    /// Compression setting handed to the produced builder.
    pub fn with_compression(mut self, value: bool) -> Self {
        self.compressed = value;
        self
    }

    fn builder(&self) -> MvMapBuilder {
        MvMapBuilder::new()
            .with_hash_config(self.hash_config.clone())
            .with_compression(self.compressed)
    }

    /// Merges two maps key by key.
    ///
    /// Values under a key shared by both inputs accumulate; with
    /// `collapse_duplicates` each distinct value is kept once per key.
    pub fn merge<B1, B2, H1, H2>(
        &self,
        first: &MvMap<B1, H1>,
        second: &MvMap<B2, H2>,
        collapse_duplicates: bool,
    ) -> Result<MvMapBuilder>
    where
        B1: AsRef<[u8]>,
        B2: AsRef<[u8]>,
        H1: MvMapHashLoader,
        H2: MvMapHashLoader,
    {
        let mut builder = self.builder();
        builder.merge(first, collapse_duplicates)?;
        builder.merge(second, collapse_duplicates)?;
        Ok(builder)
    }

    /// Merges any number of maps of the same kind.
    pub fn merge_all<B: AsRef<[u8]>, H: MvMapHashLoader>(
        &self,
        maps: &[&MvMap<B, H>],
        collapse_duplicates: bool,
    ) -> Result<MvMapBuilder> {
        let mut builder = self.builder();
        for map in maps {
            builder.merge(map, collapse_duplicates)?;
        }
        Ok(builder)
    }

    /// Merges `primary` as is and `secondary` with every value replaced by
    /// `value`.
    pub fn merge_with_explicit_value<B1, B2, H1, H2>(
        &self,
        primary: &MvMap<B1, H1>,
        secondary: &MvMap<B2, H2>,
        value: impl AsRef<[u8]>,
    ) -> Result<MvMapBuilder>
    where
        B1: AsRef<[u8]>,
        B2: AsRef<[u8]>,
        H1: MvMapHashLoader,
        H2: MvMapHashLoader,
    {
        let mut builder = self.builder();
        builder.merge(primary, false)?;
        builder.merge_with_explicit_value(secondary, value)?;
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use rand::Rng;

    use crate::*;

    #[derive(Debug, Default)]
    struct MemoryWriter {
        data: Mutex<Vec<u8>>,
        limit: Option<u64>,
    }

    impl MvMapWriter for MemoryWriter {
        fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
            let end = offset + buf.len() as u64;
            if self.limit.is_some_and(|limit| end > limit) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Write exceeds limit",
                ));
            }
            let mut data = self.data.lock().unwrap();
            if data.len() < end as usize {
                data.resize(end as usize, 0);
            }
            data[offset as usize..end as usize].copy_from_slice(buf);
            Ok(())
        }
    }

    fn sorted_values(map: &MvMap, key: &str) -> Vec<String> {
        let mut values: Vec<String> = map
            .get(key)
            .map(|v| String::from_utf8(v.to_vec()).unwrap())
            .collect();
        values.sort();
        values
    }

    fn map_of(entries: &[(&str, &str)]) -> MvMap {
        let mut builder = MvMapBuilder::new();
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finalize(false).unwrap().into_map().unwrap()
    }

    #[test]
    fn test_builder_resets_after_finalize() {
        let mut builder = MvMapBuilder::new().with_hash_seed(7);
        builder.add("a", "1").unwrap();
        builder.add("a", "1").unwrap();
        builder.add("b", "2").unwrap();
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.item_count(), 3);

        let first = builder.finalize(false).unwrap();
        assert!(builder.is_empty());
        assert_eq!(builder.item_count(), 0);
        assert_eq!(builder.hash_config().seed().unwrap(), 7);

        builder.add("c", "3").unwrap();
        let second = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(second.len(), 1);
        assert!(second.contains_key("c"));
        assert!(!second.contains_key("a"));

        let first = first.into_map().unwrap();
        assert_eq!(first.get("a").count(), 2);
    }

    #[test]
    fn test_construction_error_preserves_builder() {
        let config = MvMapHashConfig {
            parameters: serde_json::json!({ "max_probes": 1, "max_attempts": 3 }),
            ..Default::default()
        };
        let mut builder = MvMapBuilder::new().with_hash_config(config);
        for i in 0..1000 {
            builder.add(i.to_string(), "v").unwrap();
        }
        match builder.finalize(true) {
            Err(MvMapError::Construction { keys, attempts }) => {
                assert_eq!(keys, 1000);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(builder.len(), 1000);
        assert_eq!(builder.item_count(), 1000);

        // Retry with a usable configuration.
        let mut builder = builder.with_hash_config(MvMapHashConfig::default());
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(map.len(), 1000);
        assert_eq!(map.get("999").count(), 1);
    }

    #[test]
    fn test_invalid_hash_config() {
        let config = MvMapHashConfig {
            name: "unknown".to_string(),
            ..Default::default()
        };
        let mut builder = MvMapBuilder::new().with_hash_config(config);
        builder.add("a", "1").unwrap();
        builder.add("b", "1").unwrap();
        assert!(matches!(
            builder.finalize(true),
            Err(MvMapError::InvalidConfig(_))
        ));
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_blob_is_deterministic() {
        let build = |seed: u64| {
            let mut builder = MvMapBuilder::new().with_hash_seed(seed);
            for i in 0..500 {
                builder.add(format!("k{}", i % 50), format!("v{}", i)).unwrap();
            }
            builder.finalize(true).unwrap()
        };
        assert_eq!(build(3), build(3));
        let (a, b) = (build(3).into_map().unwrap(), build(4).into_map().unwrap());
        assert_eq!(a.len(), b.len());
        for (key, values) in a.items().fold(BTreeMap::new(), |mut acc, (k, v)| {
            acc.entry(k).or_insert_with(Vec::new).push(v);
            acc
        }) {
            assert_eq!(b.get(key).collect::<Vec<_>>(), values);
        }
    }

    #[test]
    fn test_finalize_to_writer() {
        let mut builder = MvMapBuilder::new().with_writer_buffer_size(64);
        for i in 0..300 {
            builder.add(format!("k{}", i % 30), format!("v{}", i % 7)).unwrap();
        }
        let writer = MemoryWriter::default();
        let info = builder.finalize_to(&writer, true).unwrap();
        assert_eq!(info.key_count, 30);
        assert_eq!(info.value_count, 7);
        let data = writer.data.into_inner().unwrap();
        assert_eq!(info.blob_length, data.len() as u64);

        let map = MvMap::from_bytes(data).unwrap();
        assert_eq!(map.info(), info);

        let mut builder = MvMapBuilder::new();
        for i in 0..300 {
            builder.add(format!("k{}", i), "v").unwrap();
        }
        let writer = MemoryWriter {
            limit: Some(1000),
            ..Default::default()
        };
        builder.finalize_to(&writer, true).unwrap_err();
        assert_eq!(builder.len(), 300);
    }

    #[test]
    fn test_dump_to_stream() {
        let mut builder = MvMapBuilder::new();
        builder.add("k", "v").unwrap();
        let blob = builder.finalize(true).unwrap();
        let mut out = Vec::new();
        blob.dump_to(&mut out).unwrap();
        assert_eq!(out, blob.as_bytes());
        assert_eq!(blob.length(), out.len() as u64);
        assert_eq!(blob.into_bytes(), out);
    }

    #[test]
    fn test_merge_collapses_duplicates() {
        let b = {
            let mut builder = MvMapBuilder::new();
            builder.add("k", "v").unwrap();
            builder.finalize(true).unwrap().into_map().unwrap()
        };

        let mut builder = MvMapBuilder::new();
        builder.add("k", "2").unwrap();
        builder.add("k", "3").unwrap();
        builder.add("k", "2").unwrap();
        builder.merge(&b, false).unwrap();
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(sorted_values(&map, "k"), vec!["2", "3", "v"]);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![&b"k"[..]]);

        // The merged map still merges with an explicit value.
        let mut relabeled = MvMapBuilder::new();
        relabeled
            .merge_with_explicit_value(&map, "new_value_for_all_keys")
            .unwrap();
        let relabeled = relabeled.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(
            relabeled.values().collect::<Vec<_>>(),
            vec![&b"new_value_for_all_keys"[..]]
        );
        assert_eq!(sorted_values(&relabeled, "k"), vec!["new_value_for_all_keys"]);
    }

    #[test]
    fn test_merge_collapse_flag() {
        let a = map_of(&[("k", "1"), ("k", "1"), ("j", "2")]);
        let b = map_of(&[("k", "1"), ("k", "3")]);

        let mut merged = MvMapMerger::default().merge(&a, &b, false).unwrap();
        assert_eq!(merged.item_count(), 5);
        let map = merged.finalize(false).unwrap().into_map().unwrap();
        assert_eq!(sorted_values(&map, "k"), vec!["1", "1", "1", "3"]);

        let mut merged = MvMapMerger::default().merge(&a, &b, true).unwrap();
        let map = merged.finalize(false).unwrap().into_map().unwrap();
        assert_eq!(sorted_values(&map, "k"), vec!["1", "3"]);
        assert_eq!(sorted_values(&map, "j"), vec!["2"]);
    }

    #[test]
    fn test_merge_random() {
        let mut rng = rand::thread_rng();
        let mut random_map = || {
            let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            let mut builder = MvMapBuilder::new();
            for _ in 0..2000 {
                let key = format!("k{}", rng.gen_range(0..300));
                let value = format!("v{}", rng.gen_range(0..500));
                builder.add(&key, &value).unwrap();
                expected.entry(key).or_default().insert(value);
            }
            (builder.finalize(true).unwrap().into_map().unwrap(), expected)
        };
        let (a, mut expected) = random_map();
        let (b, expected_b) = random_map();
        for (key, values) in expected_b {
            expected.entry(key).or_default().extend(values);
        }

        let mut builder = MvMapMerger::default().merge(&a, &b, true).unwrap();
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(map.len(), expected.len());
        for (key, values) in &expected {
            let got: BTreeSet<String> = sorted_values(&map, key).into_iter().collect();
            assert_eq!(&got, values);
        }
        // Inputs are untouched.
        assert_eq!(a.keys().count(), a.len());
        assert_eq!(b.keys().count(), b.len());
    }

    #[test]
    fn test_merge_all_and_explicit_value() {
        let a = map_of(&[("x", "1"), ("y", "2")]);
        let b = map_of(&[("y", "3")]);
        let c = map_of(&[("z", "1")]);

        let mut builder = MvMapMerger::default()
            .with_compression(false)
            .merge_all(&[&a, &b, &c], true)
            .unwrap();
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert!(!map.is_compressed());
        assert_eq!(map.len(), 3);
        assert_eq!(sorted_values(&map, "y"), vec!["2", "3"]);
        assert_eq!(map.num_values(), 3);

        let mut builder = MvMapMerger::default()
            .merge_with_explicit_value(&a, &b, "tag")
            .unwrap();
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(sorted_values(&map, "x"), vec!["1"]);
        assert_eq!(sorted_values(&map, "y"), vec!["2", "tag"]);
        assert!(!map.contains_key("z"));
    }

    #[test]
    fn test_merge_empty_maps() {
        let empty = MvMapBuilder::new().finalize(true).unwrap().into_map().unwrap();
        let mut builder = MvMapMerger::default().merge(&empty, &empty, true).unwrap();
        assert!(builder.is_empty());
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_explicit_value_from_empty_map_adds_nothing() {
        let empty = MvMapBuilder::new().finalize(true).unwrap().into_map().unwrap();

        let mut builder = MvMapBuilder::new();
        builder.merge_with_explicit_value(&empty, "tag").unwrap();
        assert!(builder.is_empty());
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(map.len(), 0);
        assert_eq!(map.num_values(), 0);
        assert_eq!(map.values().count(), 0);
        assert!(map.query_str("!x", None).unwrap().is_empty());

        let mut builder = MvMapMerger::default()
            .merge_with_explicit_value(&empty, &empty, "tag")
            .unwrap();
        let map = builder.finalize(true).unwrap().into_map().unwrap();
        assert_eq!(map.num_values(), 0);
        assert!(map.query_str("!x", None).unwrap().is_empty());

        // A non-empty map still gets the value, and only once.
        let one = map_of(&[("k", "1"), ("k", "2")]);
        let mut builder = MvMapBuilder::new();
        builder.merge_with_explicit_value(&one, "tag").unwrap();
        let map = builder.finalize(false).unwrap().into_map().unwrap();
        assert_eq!(map.num_values(), 1);
        assert_eq!(sorted_values(&map, "k"), vec!["tag", "tag"]);
    }
}
