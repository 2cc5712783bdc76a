//! The approximate-membership filter (AMF) abstraction consulted by the
//! read and delete paths before a segment is ever opened.
//!
//! An `Amf` is one of the two concrete filter kinds; the engine is generic
//! over which kind a given database was built with (set once, at
//! `LSMBuilder` time) but treats every filter instance uniformly through
//! this enum, mirroring how a single database only ever grows one kind of
//! filter.

use crate::bloom::BloomFilter;
use crate::cuckoo::{CuckooError, CuckooFilter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error(transparent)]
    Full(#[from] CuckooError),
}

type Result<T> = std::result::Result<T, FilterError>;

/// Which filter design a database was configured to use. Chosen once, at
/// `LSMBuilder` time, and carried in the metadata blob thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmfKind {
    Bloom,
    Cuckoo,
}

impl AmfKind {
    pub fn prefix(self) -> &'static str {
        match self {
            AmfKind::Bloom => "bf",
            AmfKind::Cuckoo => "ckf",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Amf {
    Bloom(BloomFilter),
    Cuckoo(CuckooFilter),
}

impl Amf {
    pub fn new(kind: AmfKind, expected_items: usize, fpp: f64) -> Self {
        match kind {
            AmfKind::Bloom => Amf::Bloom(BloomFilter::new(expected_items, fpp)),
            AmfKind::Cuckoo => Amf::Cuckoo(CuckooFilter::new(expected_items, fpp)),
        }
    }

    pub fn kind(&self) -> AmfKind {
        match self {
            Amf::Bloom(_) => AmfKind::Bloom,
            Amf::Cuckoo(_) => AmfKind::Cuckoo,
        }
    }

    pub fn add(&mut self, key: &str) -> Result<()> {
        match self {
            Amf::Bloom(bf) => {
                bf.add(key);
                Ok(())
            }
            Amf::Cuckoo(ckf) => {
                ckf.add(key)?;
                Ok(())
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            Amf::Bloom(bf) => bf.contains(key),
            Amf::Cuckoo(ckf) => ckf.contains(key),
        }
    }

    /// Only the Cuckoo variant can reclaim a single entry; a Bloom filter
    /// has no way to unset a bit without risking false negatives for other
    /// keys, so it always reports no deletion performed.
    pub fn delete(&mut self, key: &str) -> bool {
        match self {
            Amf::Bloom(_) => false,
            Amf::Cuckoo(ckf) => ckf.delete(key),
        }
    }

    pub fn load_factor(&self) -> Option<f64> {
        match self {
            Amf::Bloom(_) => None,
            Amf::Cuckoo(ckf) => Some(ckf.load_factor()),
        }
    }

    pub fn as_cuckoo(&self) -> Option<&CuckooFilter> {
        match self {
            Amf::Cuckoo(ckf) => Some(ckf),
            _ => None,
        }
    }

    pub fn as_cuckoo_mut(&mut self) -> Option<&mut CuckooFilter> {
        match self {
            Amf::Cuckoo(ckf) => Some(ckf),
            _ => None,
        }
    }
}

/// Builds an AMF instance name of the form `<kind>-<count>-<timestamp>`.
pub fn amf_name(kind: AmfKind, count: usize, timestamp: &str) -> String {
    format!("{}-{}-{}", kind.prefix(), count, timestamp)
}

/// Parses the `<count>` component out of an AMF name, used when summing how
/// many flush-sized filters a merged AMF represents.
pub fn amf_count(name: &str) -> usize {
    name.split('-')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_never_false_negatives() {
        let mut amf = Amf::new(AmfKind::Bloom, 100, 0.1);
        amf.add("k1").unwrap();
        assert!(amf.contains("k1"));
        assert!(!amf.delete("k1"));
    }

    #[test]
    fn cuckoo_supports_delete() {
        let mut amf = Amf::new(AmfKind::Cuckoo, 100, 0.1);
        amf.add("k1").unwrap();
        assert!(amf.contains("k1"));
        assert!(amf.delete("k1"));
        assert!(!amf.contains("k1"));
    }

    #[test]
    fn amf_name_round_trips_count() {
        let name = amf_name(AmfKind::Cuckoo, 3, "20260101000000000000");
        assert_eq!(name, "ckf-3-20260101000000000000");
        assert_eq!(amf_count(&name), 3);
    }
}
