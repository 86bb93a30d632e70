// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The two-copy commit.  Mutations are staged on a clone of the live
//! metadata; committing writes the clone to the inactive copy, flushes, and
//! only then does the caller adopt the clone and the new slot.  The active
//! copy is never written by the transaction that was derived from it, so a
//! torn write cannot take the volume down.

use crate::errors::FvmError;
use crate::format::{Geometry, Metadata, Slot};
use anyhow::{anyhow, Context, Error};
use block_device::BlockDevice;

pub struct Transaction {
    pub metadata: Metadata,
    active_slot: Slot,
    active_generation: u64,
}

impl Transaction {
    /// Stages a transaction against the live state.  Dropping the
    /// transaction abandons the staged mutations.
    pub fn begin(active_slot: Slot, metadata: &Metadata) -> Self {
        Self {
            metadata: metadata.clone(),
            active_slot,
            active_generation: metadata.superblock.generation,
        }
    }

    /// Bumps the generation, writes the staged metadata to the inactive
    /// copy and flushes.  On success the returned slot and metadata are the
    /// new live state; on failure the caller's state is untouched.
    pub fn commit(mut self, device: &dyn BlockDevice) -> Result<(Slot, Metadata), Error> {
        self.metadata.superblock.generation = self
            .active_generation
            .checked_add(1)
            .ok_or_else(|| anyhow!(FvmError::BadState).context("generation overflow"))?;
        let bytes = self.metadata.encode(device.block_size())?;
        let geometry = Geometry::from_superblock(&self.metadata.superblock, device.block_size())?;
        let target = self.active_slot.other();
        device
            .write_at(&bytes, geometry.metadata_offset(target))
            .context("writing inactive metadata copy")?;
        device.flush().context("flushing metadata commit")?;
        Ok((target, self.metadata))
    }
}
