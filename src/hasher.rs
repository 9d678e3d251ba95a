use std::hash::BuildHasher;

use foldhash::fast::FixedState;
use serde::{Deserialize, Serialize};

use crate::{MvMapError, Result};

/// Configuration for the perfect hash function built over a map's keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MvMapHashConfig {
    /// Name of the perfect hash algorithm.
    pub name: String,
    /// Parameters for the algorithm.
    pub parameters: serde_json::Value,
}

impl Default for MvMapHashConfig {
    fn default() -> Self {
        MvMapHashConfig {
            name: MvMapDefaultHashLoader::NAME.to_string(),
            parameters: serde_json::json!({
                "seed": 0,
                "lambda": 5,
                "max_probes": 0,
                "max_attempts": 16,
            }),
        }
    }
}

impl MvMapHashConfig {
    /// Seed of the first construction attempt.
    pub fn seed(&self) -> Result<u64> {
        self.parameter("seed", 0)
    }

    /// Number of seeds tried before construction gives up.
    pub fn max_attempts(&self) -> Result<u32> {
        let attempts = self.parameter("max_attempts", 16)?;
        if attempts == 0 || attempts > u32::MAX as u64 {
            return Err(MvMapError::InvalidConfig(format!(
                "max_attempts must be in 1..={}, got {}",
                u32::MAX,
                attempts
            )));
        }
        Ok(attempts as u32)
    }

    /// Reads an unsigned parameter, falling back to `default` when absent.
    pub fn parameter(&self, name: &str, default: u64) -> Result<u64> {
        match self.parameters.get(name) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| {
                MvMapError::InvalidConfig(format!(
                    "parameter '{}' of hash '{}' must be an unsigned integer, got {}",
                    name, self.name, value
                ))
            }),
        }
    }
}

/// A function mapping every key of its build set to a distinct slot in
/// `[0, len)`.
///
/// Keys outside the build set map to an arbitrary slot in range; callers must
/// verify the stored key before trusting a hit.
pub trait PerfectHash {
    fn slot(&self, key: &[u8]) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pluggable perfect hash algorithm.
///
/// Implementations build a function for a fixed key set and a seed, and
/// convert it to and from the bytes stored in a blob's index section.
pub trait MvMapHashLoader {
    type Function: PerfectHash;

    /// Attempts construction with `seed`. `Ok(None)` means this seed did not
    /// work and another one may be tried.
    fn build(config: &MvMapHashConfig, keys: &[&[u8]], seed: u64)
    -> Result<Option<Self::Function>>;

    fn pack(function: &Self::Function) -> Result<Vec<u8>>;

    fn unpack(data: &[u8]) -> Result<Self::Function>;
}

/// Compress-hash-displace perfect hashing over seeded `foldhash`.
///
/// Keys are split into buckets of about `lambda` keys. Buckets are placed
/// largest first, each with the first displacement pair `(d1, d2)` that sends
/// all of its keys to free slots.
#[derive(Debug, Default)]
pub struct MvMapDefaultHashLoader;

impl MvMapDefaultHashLoader {
    pub const NAME: &'static str = "chd";
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChdFunction {
    seed: u64,
    slots: u32,
    /// `d1 << 32 | d2` per bucket.
    displacements: Vec<u64>,
    #[serde(skip, default)]
    states: ChdStates,
}

#[derive(Debug, Clone, Copy)]
struct ChdStates {
    primary: FixedState,
    secondary: FixedState,
}

impl Default for ChdStates {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl PartialEq for ChdFunction {
    fn eq(&self, other: &Self) -> bool {
        self.seed == other.seed
            && self.slots == other.slots
            && self.displacements == other.displacements
    }
}

impl Eq for ChdFunction {}

impl ChdStates {
    fn with_seed(seed: u64) -> Self {
        ChdStates {
            primary: FixedState::with_seed(seed),
            secondary: FixedState::with_seed(seed ^ 0x9E37_79B9_7F4A_7C15),
        }
    }

    #[inline]
    fn hashes(&self, key: &[u8]) -> (u64, u32, u32) {
        let h1 = self.primary.hash_one(key);
        let h2 = self.secondary.hash_one(key);
        (h1 >> 32, h1 as u32, h2 as u32)
    }
}

#[inline]
fn displace(f1: u32, f2: u32, d1: u32, d2: u32, slots: u64) -> usize {
    ((f2 as u64)
        .wrapping_add((f1 as u64).wrapping_mul(d1 as u64))
        .wrapping_add(d2 as u64)
        % slots) as usize
}

impl PerfectHash for ChdFunction {
    #[inline]
    fn slot(&self, key: &[u8]) -> usize {
        let (g, f1, f2) = self.states.hashes(key);
        let bucket = (g % self.displacements.len() as u64) as usize;
        let d = self.displacements[bucket];
        displace(f1, f2, (d >> 32) as u32, d as u32, self.slots as u64)
    }

    fn len(&self) -> usize {
        self.slots as usize
    }
}

impl MvMapHashLoader for MvMapDefaultHashLoader {
    type Function = ChdFunction;

    fn build(
        config: &MvMapHashConfig,
        keys: &[&[u8]],
        seed: u64,
    ) -> Result<Option<Self::Function>> {
        if config.name != Self::NAME {
            return Err(MvMapError::InvalidConfig(format!(
                "Unsupported hash type: {}",
                config.name
            )));
        }
        let lambda = config.parameter("lambda", 5)?.max(1) as usize;
        let max_probes = config.parameter("max_probes", 0)?;
        if keys.is_empty() || keys.len() > u32::MAX as usize {
            return Err(MvMapError::InvalidConfig(format!(
                "cannot build a perfect hash over {} keys",
                keys.len()
            )));
        }

        let n = keys.len();
        let states = ChdStates::with_seed(seed);
        let bucket_count = n.div_ceil(lambda);
        let hashes: Vec<(u64, u32, u32)> = keys.iter().map(|k| states.hashes(k)).collect();

        let mut buckets: Vec<(usize, Vec<usize>)> =
            (0..bucket_count).map(|i| (i, Vec::new())).collect();
        for (i, &(g, _, _)) in hashes.iter().enumerate() {
            buckets[(g % bucket_count as u64) as usize].1.push(i);
        }
        buckets.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut occupied = vec![false; n];
        let mut generation = 0u64;
        let mut try_map = vec![0u64; n];
        let mut pending: Vec<usize> = Vec::with_capacity(buckets[0].1.len());
        let mut displacements = vec![0u64; bucket_count];
        let mut total_probes = 0u64;

        'buckets: for (bucket, members) in &buckets {
            if members.is_empty() {
                break;
            }
            let mut probes = 0u64;
            for d1 in 0..n as u32 {
                'disps: for d2 in 0..n as u32 {
                    if max_probes != 0 && probes >= max_probes {
                        tracing::trace!(seed, bucket, probes, "chd bucket placement failed");
                        return Ok(None);
                    }
                    probes += 1;
                    generation += 1;
                    pending.clear();
                    for &key in members {
                        let (_, f1, f2) = hashes[key];
                        let slot = displace(f1, f2, d1, d2, n as u64);
                        if occupied[slot] || try_map[slot] == generation {
                            continue 'disps;
                        }
                        try_map[slot] = generation;
                        pending.push(slot);
                    }
                    for &slot in &pending {
                        occupied[slot] = true;
                    }
                    displacements[*bucket] = ((d1 as u64) << 32) | d2 as u64;
                    total_probes += probes;
                    continue 'buckets;
                }
            }
            tracing::trace!(seed, bucket, "chd displacement space exhausted");
            return Ok(None);
        }

        tracing::trace!(
            seed,
            keys = n,
            buckets = bucket_count,
            probes = total_probes,
            "chd construction succeeded"
        );
        Ok(Some(ChdFunction {
            seed,
            slots: n as u32,
            displacements,
            states,
        }))
    }

    fn pack(function: &Self::Function) -> Result<Vec<u8>> {
        rmp_serde::to_vec(&(Self::NAME, function)).map_err(|e| {
            MvMapError::Io(std::io::Error::other(format!(
                "Fail to serialize hash function: {}",
                e
            )))
        })
    }

    fn unpack(data: &[u8]) -> Result<Self::Function> {
        let (name, mut function): (String, ChdFunction) = rmp_serde::from_slice(data)
            .map_err(|e| {
                MvMapError::corrupt(0, format!("Failed to deserialize hash function: {}", e))
            })?;
        if name != Self::NAME {
            return Err(MvMapError::corrupt(
                0,
                format!("Unsupported hash type: {}", name),
            ));
        }
        if function.slots == 0 || function.displacements.is_empty() {
            return Err(MvMapError::corrupt(0, "empty hash function"));
        }
        function.states = ChdStates::with_seed(function.seed);
        Ok(function)
    }
}
