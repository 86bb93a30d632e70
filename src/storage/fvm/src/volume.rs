// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The volume manager: owns the partition table, the slice allocator and the
//! per-partition slice maps, and funnels every mutation through a single
//! committed transaction.  Readers on the I/O path take an `Arc` snapshot of
//! a partition's map and never block on commits.

use crate::allocator::SliceAllocator;
use crate::errors::FvmError;
use crate::format::{
    pick_active, Geometry, Metadata, PartitionFlags, Slot, MAGIC, MAJOR_VERSION, MAX_VSLICES,
    SUPERBLOCK_SIZE,
};
use crate::mapping::{self, SliceMap};
use crate::partitions;
use crate::transaction::Transaction;
use anyhow::{anyhow, bail, ensure, Context, Error};
use block_device::BlockDevice;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;
use zerocopy::FromBytes;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ManagerInfo {
    pub slice_size: u64,
    pub pslice_count: u64,
    pub allocated_count: u64,
    pub max_vslices: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VsliceRange {
    pub allocated: bool,
    pub count: u64,
}

#[derive(Clone, Debug)]
pub struct PartitionDescriptor {
    pub index: u16,
    pub name: String,
    pub type_guid: [u8; 16],
    pub instance_guid: [u8; 16],
    pub active: bool,
}

pub struct VolumeManager {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager").field("geometry", &self.geometry).finish()
    }
}

struct Inner {
    slot: Slot,
    metadata: Metadata,
    maps: HashMap<u16, Arc<SliceMap>>,
    allocator: SliceAllocator,
}

/// Writes a fresh metadata pair: copy A at generation 1, copy B at 0.
pub fn format(device: &dyn BlockDevice, slice_size: u64) -> Result<(), Error> {
    let geometry = Geometry::new(device.size(), device.block_size(), slice_size)?;
    let mut metadata = Metadata::format(&geometry);
    metadata.superblock.generation = 1;
    device
        .write_at(&metadata.encode(device.block_size())?, geometry.metadata_offset(Slot::A))
        .context("writing metadata copy A")?;
    metadata.superblock.generation = 0;
    device
        .write_at(&metadata.encode(device.block_size())?, geometry.metadata_offset(Slot::B))
        .context("writing metadata copy B")?;
    device.flush()?;
    info!(
        slice_size,
        pslice_count = geometry.pslice_count,
        "Formatted device"
    );
    Ok(())
}

fn read_superblock_area(device: &dyn BlockDevice, offset: u64) -> Result<Vec<u8>, Error> {
    let len = (SUPERBLOCK_SIZE as usize).next_multiple_of(device.block_size() as usize);
    let mut buffer = vec![0u8; len];
    device.read_at(&mut buffer, offset)?;
    Ok(buffer)
}

fn plausible_superblock(bytes: &[u8], device: &dyn BlockDevice) -> Option<Geometry> {
    let superblock = crate::format::Superblock::read_from_prefix(bytes)?;
    if superblock.magic != MAGIC || superblock.major_version != MAJOR_VERSION {
        return None;
    }
    Geometry::from_superblock(&superblock, device.block_size()).ok()
}

/// Finds the on-disk geometry.  Copy A's superblock sits at offset zero; if
/// it is unreadable (for instance a commit to copy A tore in its first
/// block), copy B is located by retrying every slice size the device could
/// have been formatted with.
pub fn probe_geometry(device: &dyn BlockDevice) -> Result<Geometry, Error> {
    if let Some(geometry) = plausible_superblock(&read_superblock_area(device, 0)?, device) {
        return Ok(geometry);
    }
    let mut slice_size = device.block_size() as u64;
    while slice_size <= device.size() {
        if let Ok(geometry) = Geometry::new(device.size(), device.block_size(), slice_size) {
            if let Some(found) =
                plausible_superblock(&read_superblock_area(device, geometry.metadata_size)?, device)
            {
                if found == geometry {
                    return Ok(geometry);
                }
            }
        }
        slice_size = match slice_size.checked_mul(2) {
            Some(s) => s,
            None => break,
        };
    }
    bail!(FvmError::NoFvm);
}

fn read_copy(device: &dyn BlockDevice, geometry: &Geometry, slot: Slot) -> Result<Metadata, Error> {
    let mut buffer = vec![0u8; geometry.metadata_size as usize];
    device.read_at(&mut buffer, geometry.metadata_offset(slot))?;
    Metadata::decode(&buffer, device.block_size())
}

impl VolumeManager {
    /// Formats `device` and binds it.
    pub fn init(device: Arc<dyn BlockDevice>, slice_size: u64) -> Result<Arc<Self>, Error> {
        format(device.as_ref(), slice_size)?;
        Self::bind(device)
    }

    /// Reads both metadata copies, selects the active one and builds the
    /// in-memory state.  Nothing uncommitted survives a rebind.
    pub fn bind(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>, Error> {
        let geometry = probe_geometry(device.as_ref())?;
        let (slot, metadata) = pick_active(
            read_copy(device.as_ref(), &geometry, Slot::A),
            read_copy(device.as_ref(), &geometry, Slot::B),
        )
        .ok_or(FvmError::NoFvm)?;
        ensure!(
            metadata.superblock.slice_size == geometry.slice_size
                && metadata.superblock.pslice_count == geometry.pslice_count,
            FvmError::BadStructure
        );
        let maps =
            mapping::build(&metadata).into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        info!(
            slot = ?slot,
            generation = metadata.superblock.generation,
            partitions = metadata.partitions.len(),
            "Bound FVM device"
        );
        Ok(Arc::new(Self {
            device,
            geometry,
            inner: Mutex::new(Inner { slot, metadata, maps, allocator: SliceAllocator::new() }),
        }))
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn info(&self) -> ManagerInfo {
        let inner = self.inner.lock().unwrap();
        ManagerInfo {
            slice_size: self.geometry.slice_size,
            pslice_count: self.geometry.pslice_count,
            allocated_count: inner.metadata.allocated_count(),
            max_vslices: MAX_VSLICES,
        }
    }

    pub fn list_partitions(&self) -> Vec<PartitionDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .metadata
            .partitions
            .iter()
            .map(|(&index, p)| PartitionDescriptor {
                index,
                name: p.name().into_owned(),
                type_guid: p.type_guid,
                instance_guid: p.instance_guid,
                active: p.is_active(),
            })
            .collect()
    }

    pub fn partition_descriptor(&self, partition_index: u16) -> Result<PartitionDescriptor, Error> {
        let inner = self.inner.lock().unwrap();
        let entry =
            inner.metadata.partitions.get(&partition_index).ok_or(FvmError::NotFound)?;
        Ok(PartitionDescriptor {
            index: partition_index,
            name: entry.name().into_owned(),
            type_guid: entry.type_guid,
            instance_guid: entry.instance_guid,
            active: entry.is_active(),
        })
    }

    /// Looks up an *active* partition by instance GUID.
    pub fn lookup_partition(&self, instance_guid: &[u8; 16]) -> Result<u16, Error> {
        let inner = self.inner.lock().unwrap();
        let index = partitions::lookup_by_instance(&inner.metadata.partitions, instance_guid)
            .ok_or(FvmError::NotFound)?;
        ensure!(inner.metadata.partitions[&index].is_active(), FvmError::NotFound);
        Ok(index)
    }

    /// The immutable slice-map snapshot the I/O path runs against.
    pub fn snapshot(&self, partition_index: u16) -> Result<Arc<SliceMap>, Error> {
        self.inner
            .lock()
            .unwrap()
            .maps
            .get(&partition_index)
            .cloned()
            .ok_or_else(|| anyhow!(FvmError::NotFound))
    }

    /// Allocates a partition entry plus `slice_count` slices mapped at
    /// virtual slices `0..slice_count`.  An all-zero instance GUID asks for
    /// a freshly generated one.
    pub fn create_partition(
        &self,
        type_guid: [u8; 16],
        instance_guid: [u8; 16],
        name: &str,
        slice_count: u64,
        flags: PartitionFlags,
    ) -> Result<u16, Error> {
        ensure!(slice_count >= 1 && slice_count <= MAX_VSLICES, FvmError::OutOfRange);
        let instance_guid = if instance_guid == [0; 16] {
            Uuid::new_v4().to_bytes_le()
        } else {
            instance_guid
        };
        let mut inner = self.inner.lock().unwrap();
        let mut txn = Transaction::begin(inner.slot, &inner.metadata);
        let index =
            partitions::create(&mut txn.metadata.partitions, type_guid, instance_guid, name, flags)?;
        let pslices =
            inner.allocator.allocate(&mut txn.metadata.allocations, index, 0..slice_count)?;
        let runs = mapping::runs_from_allocation(0, &pslices);
        let (slot, metadata) = txn.commit(self.device.as_ref())?;
        inner.slot = slot;
        inner.metadata = metadata;
        let mut map = SliceMap::default();
        map.insert_runs(0, runs);
        inner.maps.insert(index, Arc::new(map));
        Ok(index)
    }

    /// Frees the partition entry and every slice it owns.
    pub fn destroy_partition(&self, partition_index: u16) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut txn = Transaction::begin(inner.slot, &inner.metadata);
        partitions::destroy(&mut txn.metadata.partitions, partition_index)?;
        for entry in txn.metadata.allocations.iter_mut() {
            if !entry.is_free() && entry.partition_index() == partition_index {
                *entry = crate::format::SliceEntry::FREE;
            }
        }
        let (slot, metadata) = txn.commit(self.device.as_ref())?;
        inner.slot = slot;
        inner.metadata = metadata;
        inner.maps.remove(&partition_index);
        Ok(())
    }

    pub fn extend(
        &self,
        partition_index: u16,
        vslice_start: u64,
        count: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let map = inner.maps.get(&partition_index).cloned().ok_or(FvmError::NotFound)?;
        if count == 0 {
            return Ok(());
        }
        let insert_index = map.check_extend(vslice_start, count)?;
        let mut txn = Transaction::begin(inner.slot, &inner.metadata);
        let pslices = inner.allocator.allocate(
            &mut txn.metadata.allocations,
            partition_index,
            vslice_start..vslice_start + count,
        )?;
        let runs = mapping::runs_from_allocation(vslice_start, &pslices);
        let (slot, metadata) = txn.commit(self.device.as_ref())?;
        inner.slot = slot;
        inner.metadata = metadata;
        let mut new_map = (*map).clone();
        new_map.insert_runs(insert_index, runs);
        inner.maps.insert(partition_index, Arc::new(new_map));
        Ok(())
    }

    /// Frees the mapped portion of the range; fails with NotAllocated only
    /// when nothing in a non-empty range was mapped.
    pub fn shrink(
        &self,
        partition_index: u16,
        vslice_start: u64,
        count: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let map = inner.maps.get(&partition_index).cloned().ok_or(FvmError::NotFound)?;
        if count == 0 {
            return Ok(());
        }
        let mut new_map = (*map).clone();
        let freed = new_map.remove_range(vslice_start, count)?;
        let mut txn = Transaction::begin(inner.slot, &inner.metadata);
        for run in &freed {
            for pslice in run.pslice..run.pslice + run.count {
                SliceAllocator::free(&mut txn.metadata.allocations, pslice);
            }
        }
        let (slot, metadata) = txn.commit(self.device.as_ref())?;
        inner.slot = slot;
        inner.metadata = metadata;
        inner.maps.insert(partition_index, Arc::new(new_map));
        Ok(())
    }

    pub fn query_ranges(
        &self,
        partition_index: u16,
        vslice_starts: &[u64],
    ) -> Result<Vec<VsliceRange>, Error> {
        let map = self.snapshot(partition_index)?;
        let mut results = Vec::with_capacity(vslice_starts.len());
        for &start in vslice_starts {
            if start >= MAX_VSLICES {
                bail!(FvmError::OutOfRange);
            }
            let (allocated, count) = map.query(start);
            results.push(VsliceRange { allocated, count });
        }
        Ok(results)
    }

    /// The upgrade protocol of the partition table, as one transaction.
    pub fn activate(
        &self,
        old_instance_guid: &[u8; 16],
        new_instance_guid: &[u8; 16],
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut txn = Transaction::begin(inner.slot, &inner.metadata);
        partitions::activate(&mut txn.metadata.partitions, old_instance_guid, new_instance_guid)?;
        let (slot, metadata) = txn.commit(self.device.as_ref())?;
        inner.slot = slot;
        inner.metadata = metadata;
        Ok(())
    }
}
