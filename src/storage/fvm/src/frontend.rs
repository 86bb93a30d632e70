// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-partition block front-end.  It holds only a partition index and a
//! reference to the manager; client block ranges are translated through the
//! partition's slice-map snapshot and dispatched against the backing device.

use crate::format::MAX_VSLICES;
use crate::volume::VolumeManager;
use block_device::BlockDevice;
use block_server::{Interface, PartitionInfo, SharedBuffer, Status};
use std::sync::Arc;
use tracing::warn;

pub struct PartitionFrontEnd {
    partition_index: u16,
    manager: Arc<VolumeManager>,
}

impl PartitionFrontEnd {
    pub fn new(manager: Arc<VolumeManager>, partition_index: u16) -> Self {
        Self { partition_index, manager }
    }

    /// What the published child block device reports: the visible block
    /// count covers the contiguous run of mapped virtual slices starting at
    /// zero.  Mapped slices past a hole are still served.
    pub fn partition_info(&self) -> Result<PartitionInfo, anyhow::Error> {
        let descriptor = self.manager.partition_descriptor(self.partition_index)?;
        let snapshot = self.manager.snapshot(self.partition_index)?;
        let geometry = self.manager.geometry();
        let block_size = self.manager.device().block_size();
        Ok(PartitionInfo {
            block_count: snapshot.mapped_prefix_end() * (geometry.slice_size / block_size as u64),
            block_size,
            type_guid: descriptor.type_guid,
            instance_guid: descriptor.instance_guid,
            name: descriptor.name,
        })
    }

    /// Resolves a client block range into physical byte runs, failing the
    /// whole request before any I/O if a touched virtual slice is unmapped.
    fn resolve(
        &self,
        device_block_offset: u64,
        block_count: u32,
    ) -> Result<Vec<(u64, u64)>, Status> {
        let snapshot =
            self.manager.snapshot(self.partition_index).map_err(|_| Status::BadState)?;
        let geometry = self.manager.geometry();
        let block_size = self.manager.device().block_size() as u64;
        let slice_size = geometry.slice_size;

        let mut offset =
            device_block_offset.checked_mul(block_size).ok_or(Status::OutOfRange)?;
        let mut remaining = (block_count as u64)
            .checked_mul(block_size)
            .filter(|len| offset.checked_add(*len).is_some())
            .ok_or(Status::OutOfRange)?;

        let mut runs = Vec::new();
        while remaining > 0 {
            let vslice = offset / slice_size;
            if vslice >= MAX_VSLICES {
                return Err(Status::OutOfRange);
            }
            let Some(pslice) = snapshot.translate(vslice) else {
                warn!(
                    partition = self.partition_index,
                    vslice, "I/O to unmapped virtual slice"
                );
                return Err(Status::OutOfRange);
            };
            let within = offset % slice_size;
            let chunk = std::cmp::min(slice_size - within, remaining);
            runs.push((geometry.slice_offset(pslice) + within, chunk));
            offset += chunk;
            remaining -= chunk;
        }
        Ok(runs)
    }
}

impl Interface for PartitionFrontEnd {
    fn read(
        &self,
        device_block_offset: u64,
        block_count: u32,
        buffer: &SharedBuffer,
        buffer_block_offset: u64,
    ) -> Result<(), Status> {
        let block_size = self.manager.device().block_size() as u64;
        let mut buffer_offset =
            buffer_block_offset.checked_mul(block_size).ok_or(Status::OutOfRange)?;
        for (physical_offset, len) in self.resolve(device_block_offset, block_count)? {
            let mut chunk = vec![0u8; len as usize];
            self.manager.device().read_at(&mut chunk, physical_offset).map_err(|error| {
                warn!(?error, "Read failed");
                Status::Io
            })?;
            buffer.write(&chunk, buffer_offset)?;
            buffer_offset += len;
        }
        Ok(())
    }

    fn write(
        &self,
        device_block_offset: u64,
        block_count: u32,
        buffer: &SharedBuffer,
        buffer_block_offset: u64,
    ) -> Result<(), Status> {
        let block_size = self.manager.device().block_size() as u64;
        let mut buffer_offset =
            buffer_block_offset.checked_mul(block_size).ok_or(Status::OutOfRange)?;
        for (physical_offset, len) in self.resolve(device_block_offset, block_count)? {
            let mut chunk = vec![0u8; len as usize];
            buffer.read(&mut chunk, buffer_offset)?;
            self.manager.device().write_at(&chunk, physical_offset).map_err(|error| {
                warn!(?error, "Write failed");
                Status::Io
            })?;
            buffer_offset += len;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), Status> {
        self.manager.device().flush().map_err(|error| {
            warn!(?error, "Flush failed");
            Status::Io
        })
    }

    fn trim(&self, device_block_offset: u64, block_count: u32) -> Result<(), Status> {
        for (physical_offset, len) in self.resolve(device_block_offset, block_count)? {
            self.manager
                .device()
                .trim(physical_offset, len)
                .map_err(|_| Status::NotSupported)?;
        }
        Ok(())
    }
}
