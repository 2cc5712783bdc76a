//! A from-scratch Bloom filter sized from the classic `m`/`k` formulas,
//! storing its bit array in a [`bit_vec::BitVec`] so it serializes cleanly
//! alongside the rest of the metadata blob.
//!
//! This crate hand-rolls the filter rather than depending on a published
//! bloom-filter crate because the compaction engine needs to inspect and
//! rebuild the bit array directly.

use crate::hash::hash_str;
use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: BitVec,
    num_hashes: u32,
    capacity_hint: usize,
    fpp: f64,
}

impl BloomFilter {
    /// Builds a filter sized for `expected_items` at a target false-positive
    /// probability `fpp`, per m = ceil(-n*ln(p) / ln(2)^2), k = ceil((m/n)*ln 2).
    pub fn new(expected_items: usize, fpp: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let m = (-(n * fpp.ln()) / (std::f64::consts::LN_2.powi(2))).ceil();
        let m = m.max(1.0) as usize;
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil().max(1.0) as u32;

        BloomFilter {
            bits: BitVec::from_elem(m, false),
            num_hashes: k,
            capacity_hint: expected_items,
            fpp,
        }
    }

    pub fn add(&mut self, key: &str) {
        let m = self.bits.len() as u32;
        for seed in 0..self.num_hashes {
            let index = hash_str(key, seed) % m;
            self.bits.set(index as usize, true);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let m = self.bits.len() as u32;
        (0..self.num_hashes).all(|seed| {
            let index = hash_str(key, seed) % m;
            self.bits.get(index as usize).unwrap_or(false)
        })
    }

    pub fn capacity_hint(&self) -> usize {
        self.capacity_hint
    }

    pub fn fpp(&self) -> f64 {
        self.fpp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_keys_are_always_reported_present() {
        let mut bf = BloomFilter::new(1000, 0.2);
        for i in 0..200 {
            bf.add(&format!("key-{}", i));
        }
        for i in 0..200 {
            assert!(bf.contains(&format!("key-{}", i)));
        }
    }

    #[test]
    fn sizing_matches_formula() {
        let bf = BloomFilter::new(1000, 0.2);
        // m = ceil(-1000 * ln(0.2) / ln(2)^2) = 3352 (exact formula value).
        let expected_m =
            (-(1000_f64 * 0.2_f64.ln()) / std::f64::consts::LN_2.powi(2)).ceil() as usize;
        assert_eq!(bf.bits.len(), expected_m);
    }

    #[test]
    fn empty_filter_reports_nothing_present() {
        let bf = BloomFilter::new(100, 0.01);
        assert!(!bf.contains("anything"));
    }
}
