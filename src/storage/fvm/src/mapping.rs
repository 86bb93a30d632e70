// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-partition virtual-to-physical slice maps.  Each map is a sorted run
//! vector rebuilt from the slice allocation table at bind time and patched
//! incrementally by extend and shrink; the I/O path binary-searches a shared
//! immutable snapshot.

use crate::errors::FvmError;
use crate::format::{Metadata, MAX_VSLICES};
use std::collections::HashMap;
use tracing::warn;

/// A contiguous run of virtual slices backed by physically contiguous
/// slices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub vslice: u64,
    pub pslice: u64,
    pub count: u64,
}

impl Mapping {
    pub fn end(&self) -> u64 {
        self.vslice + self.count
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SliceMap {
    runs: Vec<Mapping>,
}

/// Rebuilds every partition's map from the allocation table.  Entries that
/// name a dead partition or repeat a virtual slice are dropped with a
/// warning; the consistency checker reports them as corruption.
pub fn build(metadata: &Metadata) -> HashMap<u16, SliceMap> {
    let mut maps: HashMap<u16, SliceMap> = HashMap::new();
    for (&index, _) in &metadata.partitions {
        maps.insert(index, SliceMap::default());
    }
    for (i, entry) in metadata.allocations.iter().enumerate() {
        let pslice = i as u64 + 1;
        if entry.is_free() {
            continue;
        }
        let Some(map) = maps.get_mut(&entry.partition_index()) else {
            warn!("Slice entry {:#x} points to a free partition", entry.raw());
            continue;
        };
        let vslice = entry.vslice();
        let runs = &mut map.runs;
        match runs.binary_search_by(|m: &Mapping| m.vslice.cmp(&vslice)) {
            Ok(_) => warn!("Duplicate slice entry: {:#x}", entry.raw()),
            Err(index) => {
                if index > 0 && runs[index - 1].end() > vslice {
                    warn!("Duplicate slice entry: {:#x}", entry.raw());
                } else if index > 0
                    && runs[index - 1].end() == vslice
                    && runs[index - 1].pslice + runs[index - 1].count == pslice
                {
                    runs[index - 1].count += 1;
                } else {
                    runs.insert(index, Mapping { vslice, pslice, count: 1 });
                }
            }
        }
    }
    maps
}

/// Groups an allocation's physical slices into physically contiguous runs;
/// the virtual slices are `vslice_start..`.
pub fn runs_from_allocation(vslice_start: u64, pslices: &[u64]) -> Vec<Mapping> {
    let mut runs: Vec<Mapping> = Vec::new();
    let mut vslice = vslice_start;
    for &pslice in pslices {
        match runs.last_mut() {
            Some(run) if run.pslice + run.count == pslice => run.count += 1,
            _ => runs.push(Mapping { vslice, pslice, count: 1 }),
        }
        vslice += 1;
    }
    runs
}

impl SliceMap {
    pub fn translate(&self, vslice: u64) -> Option<u64> {
        match self.runs.binary_search_by(|m: &Mapping| m.vslice.cmp(&vslice)) {
            Ok(index) => Some(self.runs[index].pslice),
            Err(index) if index > 0 => {
                let run = &self.runs[index - 1];
                (vslice < run.end()).then(|| run.pslice + (vslice - run.vslice))
            }
            _ => None,
        }
    }

    pub fn slice_count(&self) -> u64 {
        self.runs.iter().map(|r| r.count).sum()
    }

    /// Virtual slices `0..end` are all mapped; clients see this many slices
    /// as the partition's nominal size.
    pub fn mapped_prefix_end(&self) -> u64 {
        match self.runs.first() {
            Some(run) if run.vslice == 0 => self.coalesced_end(0),
            _ => 0,
        }
    }

    /// Whether `vslice` is allocated and the length of the contiguous
    /// same-state run beginning there.
    pub fn query(&self, vslice: u64) -> (bool, u64) {
        match self.runs.binary_search_by(|m: &Mapping| m.vslice.cmp(&vslice)) {
            Ok(index) => (true, self.coalesced_end(index) - vslice),
            Err(index) => {
                if index > 0 && self.runs[index - 1].end() > vslice {
                    (true, self.coalesced_end(index - 1) - vslice)
                } else if index < self.runs.len() {
                    (false, self.runs[index].vslice - vslice)
                } else {
                    (false, MAX_VSLICES - vslice)
                }
            }
        }
    }

    /// The end of the virtually contiguous region that `runs[index]` opens:
    /// fold forward until the first gap between runs.
    fn coalesced_end(&self, index: usize) -> u64 {
        self.runs[index..]
            .iter()
            .try_fold(self.runs[index].vslice, |end, run| {
                if run.vslice == end {
                    Ok(run.end())
                } else {
                    Err(end)
                }
            })
            .unwrap_or_else(|end| end)
    }

    /// Validates an extend of `[vslice_start, vslice_start + count)` and
    /// returns the insertion index for the new runs.  The range must clear
    /// both neighbours: the run before it may not reach into it, and the
    /// run at the insertion point may not begin before it ends.
    pub fn check_extend(&self, vslice_start: u64, count: u64) -> Result<usize, FvmError> {
        let end = vslice_start.checked_add(count).ok_or(FvmError::OutOfRange)?;
        if end > MAX_VSLICES {
            return Err(FvmError::OutOfRange);
        }
        let index = self.runs.partition_point(|run| run.vslice < vslice_start);
        let clear_below =
            index == 0 || self.runs[index - 1].end() <= vslice_start;
        let clear_above = self.runs.get(index).map_or(true, |run| run.vslice >= end);
        if clear_below && clear_above {
            Ok(index)
        } else {
            Err(FvmError::AlreadyAllocated)
        }
    }

    pub fn insert_runs(&mut self, mut index: usize, runs: Vec<Mapping>) {
        for run in runs {
            self.runs.insert(index, run);
            index += 1;
        }
    }

    /// Unmaps the mapped portion of `[vslice_start, vslice_start + count)`
    /// and returns the freed physical runs.  Fails with NotAllocated only
    /// when a non-empty range contains no mapped slice.
    pub fn remove_range(
        &mut self,
        vslice_start: u64,
        count: u64,
    ) -> Result<Vec<Mapping>, FvmError> {
        let end = vslice_start.checked_add(count).ok_or(FvmError::OutOfRange)?;
        if end > MAX_VSLICES {
            return Err(FvmError::OutOfRange);
        }
        let mut freed = Vec::new();
        let mut kept = Vec::with_capacity(self.runs.len() + 1);
        for run in self.runs.drain(..) {
            let overlap_start = std::cmp::max(run.vslice, vslice_start);
            let overlap_end = std::cmp::min(run.end(), end);
            if overlap_start >= overlap_end {
                kept.push(run);
                continue;
            }
            freed.push(Mapping {
                vslice: overlap_start,
                pslice: run.pslice + (overlap_start - run.vslice),
                count: overlap_end - overlap_start,
            });
            if run.vslice < overlap_start {
                kept.push(Mapping { vslice: run.vslice, pslice: run.pslice, count: overlap_start - run.vslice });
            }
            if overlap_end < run.end() {
                kept.push(Mapping {
                    vslice: overlap_end,
                    pslice: run.pslice + (overlap_end - run.vslice),
                    count: run.end() - overlap_end,
                });
            }
        }
        self.runs = kept;
        if freed.is_empty() && count > 0 {
            return Err(FvmError::NotAllocated);
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::{build, runs_from_allocation, Mapping, SliceMap};
    use crate::errors::FvmError;
    use crate::format::{
        Geometry, Metadata, PartitionEntry, PartitionFlags, SliceEntry, MAX_VSLICES,
    };

    fn map_of(runs: &[(u64, u64, u64)]) -> SliceMap {
        let mut map = SliceMap::default();
        for &(vslice, pslice, count) in runs {
            let index = map.check_extend(vslice, count).unwrap();
            map.insert_runs(index, vec![Mapping { vslice, pslice, count }]);
        }
        map
    }

    #[test]
    fn test_translate() {
        let map = map_of(&[(0, 10, 2), (5, 3, 3)]);
        assert_eq!(map.translate(0), Some(10));
        assert_eq!(map.translate(1), Some(11));
        assert_eq!(map.translate(2), None);
        assert_eq!(map.translate(5), Some(3));
        assert_eq!(map.translate(7), Some(5));
        assert_eq!(map.translate(8), None);
        assert_eq!(map.slice_count(), 5);
    }

    #[test]
    fn test_mappings_are_disjoint() {
        // Distinct virtual slices always land on distinct physical slices.
        let map = map_of(&[(0, 1, 4), (10, 5, 4)]);
        let mut seen = std::collections::HashSet::new();
        for vslice in (0..4).chain(10..14) {
            assert!(seen.insert(map.translate(vslice).unwrap()));
        }
    }

    #[test]
    fn test_check_extend_rejects_overlap() {
        let map = map_of(&[(2, 1, 2), (8, 10, 20)]);
        assert_eq!(map.check_extend(2, 1), Err(FvmError::AlreadyAllocated));
        assert_eq!(map.check_extend(3, 1), Err(FvmError::AlreadyAllocated));
        assert_eq!(map.check_extend(0, 4), Err(FvmError::AlreadyAllocated));
        assert_eq!(map.check_extend(5, 20), Err(FvmError::AlreadyAllocated));
        assert_eq!(map.check_extend(4, 4), Ok(1));
        assert_eq!(map.check_extend(28, 1), Ok(2));
        assert_eq!(map.check_extend(MAX_VSLICES - 1, 2), Err(FvmError::OutOfRange));
        assert_eq!(map.check_extend(u64::MAX, 2), Err(FvmError::OutOfRange));
    }

    #[test]
    fn test_query_coalesces_adjacent_runs() {
        let map = map_of(&[(0, 7, 1), (1, 20, 2), (5, 1, 1)]);
        assert_eq!(map.query(0), (true, 3));
        assert_eq!(map.query(1), (true, 2));
        assert_eq!(map.query(2), (true, 1));
        assert_eq!(map.query(3), (false, 2));
        assert_eq!(map.query(5), (true, 1));
        assert_eq!(map.query(6), (false, MAX_VSLICES - 6));
        assert_eq!(map.mapped_prefix_end(), 3);
    }

    #[test]
    fn test_remove_range_frees_only_mapped() {
        // Spans a hole: only the mapped portions come back.
        let mut map = map_of(&[(0, 1, 4), (10, 20, 4)]);
        let freed = map.remove_range(2, 10).unwrap();
        assert_eq!(
            freed,
            vec![Mapping { vslice: 2, pslice: 3, count: 2 }, Mapping { vslice: 10, pslice: 20, count: 2 }]
        );
        assert_eq!(map.query(0), (true, 2));
        assert_eq!(map.query(2), (false, 10));
        assert_eq!(map.translate(12), Some(22));
    }

    #[test]
    fn test_remove_range_fully_unmapped_fails() {
        let mut map = map_of(&[(0, 1, 4)]);
        assert_eq!(map.remove_range(10, 5), Err(FvmError::NotAllocated));
        // The map is untouched.
        assert_eq!(map.slice_count(), 4);
        // A zero-length shrink is a no-op success.
        assert_eq!(map.remove_range(10, 0).unwrap(), vec![]);
    }

    #[test]
    fn test_remove_range_splits_run() {
        let mut map = map_of(&[(0, 1, 10)]);
        let freed = map.remove_range(3, 4).unwrap();
        assert_eq!(freed, vec![Mapping { vslice: 3, pslice: 4, count: 4 }]);
        assert_eq!(map.translate(2), Some(3));
        assert_eq!(map.translate(3), None);
        assert_eq!(map.translate(6), None);
        assert_eq!(map.translate(7), Some(8));
        assert_eq!(map.mapped_prefix_end(), 3);
        assert_eq!(map.slice_count(), 6);
    }

    #[test]
    fn test_build_from_allocation_table() {
        let geometry = Geometry::new(64 << 20, 512, 65536).unwrap();
        let mut metadata = Metadata::format(&geometry);
        metadata.partitions.insert(
            1,
            PartitionEntry::new([1; 16], [2; 16], "a", PartitionFlags::empty()).unwrap(),
        );
        metadata.partitions.insert(
            2,
            PartitionEntry::new([1; 16], [3; 16], "b", PartitionFlags::empty()).unwrap(),
        );
        // Partition 1: vslices 0..3 on pslices 1..=3 (one physical run),
        // vslice 7 on pslice 6.  Partition 2: vslice 0 on pslice 4.
        metadata.allocations[0] = SliceEntry::new(1, 0);
        metadata.allocations[1] = SliceEntry::new(1, 1);
        metadata.allocations[2] = SliceEntry::new(1, 2);
        metadata.allocations[3] = SliceEntry::new(2, 0);
        metadata.allocations[5] = SliceEntry::new(1, 7);
        // Orphan: partition 9 does not exist.
        metadata.allocations[7] = SliceEntry::new(9, 0);
        // Duplicate of partition 1's vslice 1.
        metadata.allocations[8] = SliceEntry::new(1, 1);

        let maps = build(&metadata);
        assert_eq!(maps.len(), 2);
        let map = &maps[&1];
        assert_eq!(map.translate(0), Some(1));
        assert_eq!(map.translate(2), Some(3));
        assert_eq!(map.translate(7), Some(6));
        assert_eq!(map.slice_count(), 4);
        assert_eq!(map.mapped_prefix_end(), 3);
        assert_eq!(maps[&2].translate(0), Some(4));
    }

    #[test]
    fn test_runs_from_allocation() {
        assert_eq!(
            runs_from_allocation(5, &[7, 8, 9, 20, 2, 3]),
            vec![
                Mapping { vslice: 5, pslice: 7, count: 3 },
                Mapping { vslice: 8, pslice: 20, count: 1 },
                Mapping { vslice: 9, pslice: 2, count: 2 },
            ]
        );
        assert_eq!(runs_from_allocation(0, &[]), vec![]);
    }
}
