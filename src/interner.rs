use std::collections::HashMap;
use std::hash::BuildHasher;

use foldhash::fast::{FixedState, RandomState};

const INTERNER_SEED: u64 = 0x6d76_6d61_7069_6e74;
const NO_NEXT: u32 = u32::MAX;

/// Deduplicating arena of byte strings.
///
/// Every distinct byte string is stored once in a single buffer and gets a
/// dense `u32` id in first-seen order. The lookup table keys on the content
/// hash; ids sharing a hash are chained through `next`.
#[derive(Debug)]
pub(crate) struct Interner {
    bytes: Vec<u8>,
    offsets: Vec<u64>,
    heads: HashMap<u64, u32, RandomState>,
    next: Vec<u32>,
    hash_state: FixedState,
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            bytes: Vec::new(),
            offsets: vec![0],
            heads: HashMap::with_hasher(RandomState::default()),
            next: Vec::new(),
            hash_state: FixedState::with_seed(INTERNER_SEED),
        }
    }

    /// Returns the id for `data`, storing it first if it is new.
    pub fn intern(&mut self, data: &[u8]) -> u32 {
        let hash = self.hash_state.hash_one(data);
        let head = self.heads.get(&hash).copied();
        if let Some(id) = self.find(head, data) {
            return id;
        }

        let id = self.next.len() as u32;
        self.bytes.extend_from_slice(data);
        self.offsets.push(self.bytes.len() as u64);
        self.next.push(head.unwrap_or(NO_NEXT));
        self.heads.insert(hash, id);
        id
    }

    /// Returns the id of `data` if it was interned.
    pub fn lookup(&self, data: &[u8]) -> Option<u32> {
        let hash = self.hash_state.hash_one(data);
        self.find(self.heads.get(&hash).copied(), data)
    }

    /// Resolves an id to its bytes.
    pub fn get(&self, id: u32) -> Option<&[u8]> {
        let id = id as usize;
        if id + 1 >= self.offsets.len() {
            return None;
        }
        Some(&self.bytes[self.offsets[id] as usize..self.offsets[id + 1] as usize])
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    /// Total number of stored bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Iterates entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.offsets
            .windows(2)
            .map(|w| &self.bytes[w[0] as usize..w[1] as usize])
    }

    fn find(&self, mut cursor: Option<u32>, data: &[u8]) -> Option<u32> {
        while let Some(id) = cursor {
            if self.get(id) == Some(data) {
                return Some(id);
            }
            cursor = match self.next[id as usize] {
                NO_NEXT => None,
                next => Some(next),
            };
        }
        None
    }
}
