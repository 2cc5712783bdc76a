//! A from-scratch Cuckoo filter with partial-key relocation, fingerprints
//! derived deterministically from a seeded RNG so that `add` is
//! reproducible given the same key and filter parameters.
//!
//! Bucket capacities and fingerprint width are both derived from
//! `item_num`/`fpp` up front, so callers never choose a bucket count by
//! hand.

use crate::hash::hash32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_KICKS: u32 = 500;

#[derive(Error, Debug)]
pub enum CuckooError {
    #[error("cuckoo filter is full after exhausting max kicks")]
    Full,
}

type Result<T> = std::result::Result<T, CuckooError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuckooFilter {
    buckets: Vec<Vec<u32>>,
    bucket_size: usize,
    capacity: usize,
    fingerprint_bits: u32,
    max_kicks: u32,
    size: usize,
    fpp: f64,
}

impl CuckooFilter {
    pub fn new(item_num: usize, fpp: f64) -> Self {
        let (bucket_size, alpha) = if fpp >= 0.002 { (2usize, 0.84) } else { (4usize, 0.95) };
        let capacity = ((item_num.max(1) as f64) / alpha).ceil() as usize;
        let capacity = capacity.max(1);
        let fingerprint_bits = (((1.0 / fpp).log2()) + ((2 * bucket_size) as f64).log2() + 1.0)
            .ceil()
            .max(1.0) as u32;

        CuckooFilter {
            buckets: vec![Vec::with_capacity(bucket_size); capacity],
            bucket_size,
            capacity,
            fingerprint_bits,
            max_kicks: DEFAULT_MAX_KICKS,
            size: 0,
            fpp,
        }
    }

    pub fn add(&mut self, key: &str) -> Result<bool> {
        self.size += 1;
        let fingerprint = self.fingerprint(key);
        let (i1, i2) = self.index_pair(key, fingerprint);

        if self.bucket_has(i1, fingerprint) || self.bucket_has(i2, fingerprint) {
            return Ok(true);
        }
        if self.try_place(i1, fingerprint) {
            return Ok(true);
        }
        if self.try_place(i2, fingerprint) {
            return Ok(true);
        }

        let mut index = if rand::random::<bool>() { i1 } else { i2 };
        let mut fingerprint = fingerprint;
        for _ in 0..self.max_kicks {
            fingerprint = self.swap(fingerprint, index);
            index = self.alt_index(index, fingerprint);
            if self.try_place(index, fingerprint) {
                return Ok(true);
            }
        }
        self.size -= 1;
        Err(CuckooError::Full)
    }

    /// Used during filter merging: inserts a pre-computed fingerprint at a
    /// specific primary index, reusing the source filter's bucket layout.
    /// Requires that `self` and the source filter share `capacity` and
    /// `bucket_size` (enforced by the compaction engine before calling
    /// this).
    pub fn add_by_fingerprint(&mut self, fingerprint: u32, index: usize) -> Result<bool> {
        self.size += 1;
        let mut index = index % self.capacity;

        if self.bucket_has(index, fingerprint) {
            return Ok(true);
        }
        if self.try_place(index, fingerprint) {
            return Ok(true);
        }

        let mut fingerprint = fingerprint;
        for _ in 0..self.max_kicks {
            fingerprint = self.swap(fingerprint, index);
            index = self.alt_index(index, fingerprint);
            if self.try_place(index, fingerprint) {
                return Ok(true);
            }
        }
        self.size -= 1;
        Err(CuckooError::Full)
    }

    pub fn contains(&self, key: &str) -> bool {
        let fingerprint = self.fingerprint(key);
        let (i1, i2) = self.index_pair(key, fingerprint);
        self.bucket_has(i1, fingerprint) || self.bucket_has(i2, fingerprint)
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let fingerprint = self.fingerprint(key);
        let (i1, i2) = self.index_pair(key, fingerprint);
        if self.remove_from(i1, fingerprint) || self.remove_from(i2, fingerprint) {
            self.size -= 1;
            return true;
        }
        false
    }

    pub fn load_factor(&self) -> f64 {
        self.size as f64 / (self.capacity * self.bucket_size) as f64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn fingerprint_bits(&self) -> u32 {
        self.fingerprint_bits
    }

    pub fn fpp(&self) -> f64 {
        self.fpp
    }

    /// Iterates every (bucket_index, fingerprint) slot currently occupied,
    /// in bucket order. Used by the compaction engine to fold one filter's
    /// fingerprints into another via `add_by_fingerprint`.
    pub fn occupied_slots(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .flat_map(|(idx, bucket)| bucket.iter().map(move |&fp| (idx, fp)))
    }

    fn bucket_has(&self, index: usize, fingerprint: u32) -> bool {
        self.buckets[index].contains(&fingerprint)
    }

    fn try_place(&mut self, index: usize, fingerprint: u32) -> bool {
        if self.buckets[index].len() < self.bucket_size {
            self.buckets[index].push(fingerprint);
            true
        } else {
            false
        }
    }

    fn remove_from(&mut self, index: usize, fingerprint: u32) -> bool {
        if let Some(pos) = self.buckets[index].iter().position(|&fp| fp == fingerprint) {
            self.buckets[index].remove(pos);
            true
        } else {
            false
        }
    }

    fn swap(&mut self, fingerprint: u32, index: usize) -> u32 {
        let bucket = &mut self.buckets[index];
        let slot = rand::thread_rng().gen_range(0, bucket.len());
        std::mem::replace(&mut bucket[slot], fingerprint)
    }

    fn alt_index(&self, index: usize, fingerprint: u32) -> usize {
        (index ^ self.hash_to_capacity(&fingerprint.to_le_bytes(), 1)) % self.capacity
    }

    fn index_pair(&self, key: &str, fingerprint: u32) -> (usize, usize) {
        let i1 = self.hash_to_capacity(key.as_bytes(), 0);
        let i2 = i1 ^ self.hash_to_capacity(&fingerprint.to_le_bytes(), 1);
        (i1, i2 % self.capacity)
    }

    fn hash_to_capacity(&self, data: &[u8], seed: u32) -> usize {
        (hash32(data, seed) as usize) % self.capacity
    }

    fn fingerprint(&self, key: &str) -> u32 {
        let seed = hash32(key.as_bytes(), 2) as u64;
        let mut rng = StdRng::seed_from_u64(seed);
        let mask = if self.fingerprint_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.fingerprint_bits) - 1
        };
        let candidate = rng.gen::<u32>() & mask;
        // Reserve 0 as the "empty" sentinel so a freshly-allocated bucket
        // slot can never be confused with a real fingerprint.
        if candidate == 0 {
            1
        } else {
            candidate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_keys_are_found() {
        let mut ckf = CuckooFilter::new(100, 0.02);
        for i in 0..50 {
            ckf.add(&format!("k{}", i)).unwrap();
        }
        for i in 0..50 {
            assert!(ckf.contains(&format!("k{}", i)));
        }
    }

    #[test]
    fn delete_removes_membership() {
        let mut ckf = CuckooFilter::new(100, 0.02);
        ckf.add("k1").unwrap();
        assert!(ckf.contains("k1"));
        assert!(ckf.delete("k1"));
        assert!(!ckf.contains("k1"));
    }

    #[test]
    fn delete_of_absent_key_returns_false() {
        let mut ckf = CuckooFilter::new(100, 0.02);
        assert!(!ckf.delete("missing"));
    }

    #[test]
    fn load_factor_tracks_occupancy() {
        let mut ckf = CuckooFilter::new(10, 0.02);
        assert_eq!(ckf.load_factor(), 0.0);
        ckf.add("k1").unwrap();
        assert!(ckf.load_factor() > 0.0);
    }

    #[test]
    fn bucket_size_selection_follows_fpp() {
        assert_eq!(CuckooFilter::new(10, 0.5).bucket_size(), 2);
        assert_eq!(CuckooFilter::new(10, 0.001).bucket_size(), 4);
    }
}
