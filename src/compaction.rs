//! Decides when segments within a level should merge, when merged segments
//! should be promoted, and how the merging segments' AMFs are combined.
//!
//! Runs unconditionally after every flush, rather than being gated on a
//! separate trigger.

use crate::filter::{amf_count, amf_name, Amf, AmfKind, FilterError};
use crate::metadata::{AmfId, Level, MetadataStore};
use crate::segment::{SegmentError, SegmentStore};
use crate::timestamp::next_timestamp;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

type Result<T> = std::result::Result<T, CompactionError>;

/// Merged-AMF-set size above which a fresh filter is rebuilt from scratch
/// instead of attempting in-place compression.
const FRESH_FILTER_THRESHOLD: usize = 3;
/// Combined Cuckoo load factor at or below which two filters may be folded
/// into one via `add_by_fingerprint` instead of staying attached separately.
const COMPRESSION_LOAD_FACTOR: f64 = 0.50;

pub struct CompactionEngine {
    time_threshold_hours: f64,
    lvl1_size_mb: f64,
    lvl2_size_mb: f64,
    size_threshold: usize,
    fpp: f64,
}

impl CompactionEngine {
    pub fn new(
        time_threshold_hours: f64,
        lvl1_size_mb: f64,
        lvl2_size_mb: f64,
        size_threshold: usize,
        fpp: f64,
    ) -> Self {
        CompactionEngine {
            time_threshold_hours,
            lvl1_size_mb,
            lvl2_size_mb,
            size_threshold,
            fpp,
        }
    }

    /// Runs one compaction pass: for each level in order, attempt a
    /// time-gated merge of its two oldest segments, combine their filters,
    /// then promote any oversized segment to the next level.
    pub fn run(&self, segments: &SegmentStore, meta: &mut MetadataStore) -> Result<()> {
        self.compact_level(Level::L1, 1, segments, meta)?;
        self.compact_level(Level::L2, 1, segments, meta)?;
        self.compact_level(Level::L3, 4, segments, meta)?;
        Ok(())
    }

    fn compact_level(
        &self,
        level: Level,
        trigger_len: usize,
        segments: &SegmentStore,
        meta: &mut MetadataStore,
    ) -> Result<()> {
        let mut ids = meta.levels.level(level).clone();
        if ids.len() <= trigger_len {
            return Ok(());
        }
        ids.sort();
        let oldest = &ids[0];
        let age_hours = segments.modified_hours_ago(oldest)?;
        if age_hours < self.time_threshold_hours {
            log::debug!(
                "level {:?}: oldest segment {} not yet eligible ({:.4}h < {:.4}h)",
                level,
                oldest,
                age_hours,
                self.time_threshold_hours
            );
            return Ok(());
        }

        let older = ids[0].clone();
        let newer = ids[1].clone();
        let new_id = format!("{}-{}", segment_prefix(&older), next_timestamp());
        log::info!("level {:?}: merging {} and {} into {}", level, older, newer, new_id);
        segments.merge(&older, &newer, &new_id)?;

        let combined = self.combine_filters(&older, &newer, &new_id, segments, meta)?;

        meta.segment_amfs.remove(&older);
        meta.segment_amfs.remove(&newer);
        meta.segment_amfs.insert(new_id.clone(), combined);

        let level_vec = meta.levels.level_mut(level);
        level_vec.retain(|id| id != &older && id != &newer);
        level_vec.push(new_id.clone());
        meta.last_segment_name = Some(new_id);

        segments.remove(&older)?;
        segments.remove(&newer)?;

        self.promote(level, segments, meta)?;
        Ok(())
    }

    /// `older`/`newer` are the two just-merged segments (now superseded by
    /// `new_segment`); returns the AMF id list the new segment should be
    /// associated with.
    fn combine_filters(
        &self,
        older: &str,
        newer: &str,
        new_segment: &str,
        segments: &SegmentStore,
        meta: &mut MetadataStore,
    ) -> Result<Vec<AmfId>> {
        let mut combined: Vec<AmfId> = Vec::new();
        if let Some(ids) = meta.segment_amfs.get(older) {
            combined.extend(ids.iter().cloned());
        }
        if let Some(ids) = meta.segment_amfs.get(newer) {
            combined.extend(ids.iter().cloned());
        }

        if combined.len() > FRESH_FILTER_THRESHOLD {
            return self.rebuild_fresh_filter(&combined, new_segment, segments, meta);
        }

        if combined.len() == 2 && meta.amf_kind == AmfKind::Cuckoo {
            if let Some(merged) = self.try_compress_pair(&combined[0], &combined[1], meta)? {
                return Ok(vec![merged]);
            }
        }

        Ok(combined)
    }

    fn rebuild_fresh_filter(
        &self,
        stale: &[AmfId],
        new_segment: &str,
        segments: &SegmentStore,
        meta: &mut MetadataStore,
    ) -> Result<Vec<AmfId>> {
        let total_count: usize = stale.iter().map(|id| amf_count(id)).sum::<usize>().max(1);
        let capacity = self.size_threshold.saturating_mul(total_count);

        let mut fresh = Amf::new(meta.amf_kind, capacity, self.fpp);
        for key in segments.scan_keys(new_segment)? {
            fresh.add(&key)?;
        }

        let name = amf_name(meta.amf_kind, total_count, &next_timestamp());
        for id in stale {
            meta.amfs.remove(id);
        }
        meta.last_amf_name = Some(name.clone());
        meta.amfs.insert(name.clone(), fresh);
        log::info!(
            "rebuilt fresh {:?} filter {} from {} retired filters",
            meta.amf_kind,
            name,
            stale.len()
        );
        Ok(vec![name])
    }

    /// Folds `second`'s fingerprints into `first` if their combined load
    /// factor permits it, returning the surviving filter's new name.
    /// `None` means compression was skipped and both filters stay attached.
    fn try_compress_pair(
        &self,
        first_id: &str,
        second_id: &str,
        meta: &mut MetadataStore,
    ) -> Result<Option<AmfId>> {
        let combined_load = meta.amfs.get(first_id).and_then(Amf::load_factor).unwrap_or(0.0)
            + meta.amfs.get(second_id).and_then(Amf::load_factor).unwrap_or(0.0);
        if combined_load > COMPRESSION_LOAD_FACTOR {
            return Ok(None);
        }

        let slots: Vec<(usize, u32)> = match meta.amfs.get(second_id).and_then(Amf::as_cuckoo) {
            Some(ckf) => ckf.occupied_slots().collect(),
            None => return Ok(None),
        };

        if let Some(first) = meta.amfs.get_mut(first_id).and_then(Amf::as_cuckoo_mut) {
            for (index, fingerprint) in slots {
                first.add_by_fingerprint(fingerprint, index).map_err(FilterError::from)?;
            }
        } else {
            return Ok(None);
        }

        let merged = meta.amfs.remove(first_id).expect("just compressed");
        meta.amfs.remove(second_id);
        let new_count = amf_count(first_id) + amf_count(second_id);
        let new_name = format!("{}-{}-{}", AmfKind::Cuckoo.prefix(), new_count, next_timestamp());
        meta.last_amf_name = Some(new_name.clone());
        meta.amfs.insert(new_name.clone(), merged);
        log::info!("compressed cuckoo filters {} + {} into {}", first_id, second_id, new_name);
        Ok(Some(new_name))
    }

    fn promote(&self, level: Level, segments: &SegmentStore, meta: &mut MetadataStore) -> Result<()> {
        let threshold = match level {
            Level::L1 => self.lvl1_size_mb,
            Level::L2 => self.lvl2_size_mb,
            Level::L3 => return Ok(()),
        };
        let next = level.next().expect("L3 handled above");

        let ids = meta.levels.level(level).clone();
        for id in ids {
            let size = segments.size_mb(&id)?;
            if size > threshold {
                meta.levels.level_mut(level).retain(|x| x != &id);
                meta.levels.level_mut(next).push(id.clone());
                log::info!(
                    "promoted segment {} from {:?} to {:?} ({:.3}MB > {:.3}MB)",
                    id,
                    level,
                    next,
                    size,
                    threshold
                );
            }
        }
        Ok(())
    }
}

/// Extracts the naming prefix shared by every segment (everything before the
/// final `-<timestamp>` suffix).
fn segment_prefix(name: &str) -> &str {
    name.rsplitn(2, '-').nth(1).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AmfKind;
    use tempfile::tempdir;

    fn new_store() -> (tempfile::TempDir, SegmentStore) {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn below_trigger_length_is_a_no_op() {
        let (_dir, segments) = new_store();
        let mut meta = MetadataStore::new(AmfKind::Bloom, 0.2, 0.0);
        meta.levels.level_mut(Level::L1).push("segment-only".into());

        let engine = CompactionEngine::new(0.0, 35.0, 100.0, 50_000, 0.2);
        engine.run(&segments, &mut meta).unwrap();

        assert_eq!(meta.levels.level(Level::L1).len(), 1);
    }

    #[test]
    fn merges_two_oldest_once_time_threshold_elapsed() {
        let (_dir, segments) = new_store();
        let mut filter_a = Amf::new(AmfKind::Bloom, 10, 0.2);
        let mut filter_b = Amf::new(AmfKind::Bloom, 10, 0.2);
        segments
            .flush("segment-a", vec![("a", "1"), ("b", "2")].into_iter(), &mut filter_a, 100)
            .unwrap();
        segments
            .flush("segment-b", vec![("b", "3"), ("c", "4")].into_iter(), &mut filter_b, 100)
            .unwrap();

        let mut meta = MetadataStore::new(AmfKind::Bloom, 0.2, 0.0);
        meta.levels.level_mut(Level::L1).push("segment-a".into());
        meta.levels.level_mut(Level::L1).push("segment-b".into());
        meta.amfs.insert("bf-1-a".into(), filter_a);
        meta.amfs.insert("bf-1-b".into(), filter_b);
        meta.segment_amfs.insert("segment-a".into(), vec!["bf-1-a".into()]);
        meta.segment_amfs.insert("segment-b".into(), vec!["bf-1-b".into()]);

        let engine = CompactionEngine::new(0.0, 35.0, 100.0, 50_000, 0.2);
        engine.run(&segments, &mut meta).unwrap();

        assert_eq!(meta.levels.level(Level::L1).len(), 1);
        let merged_id = meta.levels.level(Level::L1)[0].clone();
        assert!(!segments.exists("segment-a"));
        assert!(!segments.exists("segment-b"));
        assert_eq!(segments.search(&merged_id, "a", None).unwrap(), Some("1".into()));
        assert_eq!(segments.search(&merged_id, "b", None).unwrap(), Some("3".into()));
    }

    #[test]
    fn oversized_segment_is_promoted() {
        let (_dir, segments) = new_store();
        let mut filter = Amf::new(AmfKind::Bloom, 10, 0.2);
        let big_value = "x".repeat(200);
        segments
            .flush("segment-a", vec![("a", big_value.as_str())].into_iter(), &mut filter, 100)
            .unwrap();

        let mut meta = MetadataStore::new(AmfKind::Bloom, 0.2, 0.0);
        meta.levels.level_mut(Level::L1).push("segment-a".into());

        let engine = CompactionEngine::new(0.0, 0.0001, 100.0, 50_000, 0.2);
        engine.promote(Level::L1, &segments, &mut meta).unwrap();

        assert!(meta.levels.level(Level::L1).is_empty());
        assert_eq!(meta.levels.level(Level::L2), &vec!["segment-a".to_string()]);
    }

    #[test]
    fn segment_prefix_strips_timestamp_suffix() {
        assert_eq!(segment_prefix("segment-20260101000000000000"), "segment");
    }
}
