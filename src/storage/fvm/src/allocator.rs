// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Free/allocated bookkeeping for the physical slice region.  The allocator
//! sweeps the slice allocation table next-fit; callers must not depend on
//! the returned slices being contiguous.

use crate::errors::FvmError;
use crate::format::SliceEntry;

pub struct SliceAllocator {
    /// Zero-based table index where the next sweep starts.
    cursor: usize,
}

impl SliceAllocator {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }

    /// Claims one free physical slice per virtual slice in `vslices`, stamps
    /// the table with the owner, and returns the physical slice numbers in
    /// the same order.  On failure the table is left partially stamped; the
    /// caller discards the staged copy.
    pub fn allocate(
        &mut self,
        table: &mut [SliceEntry],
        partition_index: u16,
        vslices: std::ops::Range<u64>,
    ) -> Result<Vec<u64>, FvmError> {
        let count = (vslices.end - vslices.start) as usize;
        let mut vslices = vslices;
        let mut pslices = Vec::with_capacity(count);
        if count == 0 {
            return Ok(pslices);
        }
        if self.cursor >= table.len() {
            self.cursor = 0;
        }
        for probe in 0..table.len() {
            let index = (self.cursor + probe) % table.len();
            if !table[index].is_free() {
                continue;
            }
            let vslice = vslices.next().unwrap();
            table[index] = SliceEntry::new(partition_index, vslice);
            pslices.push(index as u64 + 1);
            if pslices.len() == count {
                self.cursor = (index + 1) % table.len();
                return Ok(pslices);
            }
        }
        Err(FvmError::NoSpace)
    }

    /// Releases a physical slice.  Freeing a slice that is already free is
    /// fine within a single staged transaction.
    pub fn free(table: &mut [SliceEntry], pslice: u64) {
        debug_assert!(pslice >= 1 && pslice as usize <= table.len());
        table[pslice as usize - 1] = SliceEntry::FREE;
    }

    pub fn allocated_count(table: &[SliceEntry]) -> u64 {
        table.iter().filter(|e| !e.is_free()).count() as u64
    }

    pub fn free_count(table: &[SliceEntry]) -> u64 {
        table.len() as u64 - Self::allocated_count(table)
    }
}
