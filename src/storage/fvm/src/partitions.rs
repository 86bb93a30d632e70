// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Partition table operations.  These mutate a staged copy of the metadata;
//! nothing here touches the device.

use crate::errors::FvmError;
use crate::format::{PartitionEntry, PartitionFlags, PARTITION_TABLE_ENTRIES};
use std::collections::BTreeMap;

/// Finds the lowest unused table index; entry 0 is reserved.
fn find_free_index(partitions: &BTreeMap<u16, PartitionEntry>) -> Result<u16, FvmError> {
    let mut proposed = 1u16;
    for (&index, _) in partitions {
        if proposed != index {
            break;
        }
        proposed = index.checked_add(1).ok_or(FvmError::NoFreeEntry)?;
    }
    if proposed as u64 >= PARTITION_TABLE_ENTRIES {
        return Err(FvmError::NoFreeEntry);
    }
    Ok(proposed)
}

pub fn create(
    partitions: &mut BTreeMap<u16, PartitionEntry>,
    type_guid: [u8; 16],
    instance_guid: [u8; 16],
    name: &str,
    flags: PartitionFlags,
) -> Result<u16, FvmError> {
    if type_guid == [0; 16] {
        return Err(FvmError::BadGuid);
    }
    if partitions
        .values()
        .any(|p| p.instance_guid == instance_guid && p.type_guid == type_guid)
    {
        return Err(FvmError::DuplicateInstance);
    }
    let index = find_free_index(partitions)?;
    partitions.insert(index, PartitionEntry::new(type_guid, instance_guid, name, flags)?);
    Ok(index)
}

/// Removes the entry; the caller frees the partition's slices in the same
/// transaction.
pub fn destroy(
    partitions: &mut BTreeMap<u16, PartitionEntry>,
    index: u16,
) -> Result<PartitionEntry, FvmError> {
    partitions.remove(&index).ok_or(FvmError::NotFound)
}

pub fn lookup_by_instance(
    partitions: &BTreeMap<u16, PartitionEntry>,
    instance_guid: &[u8; 16],
) -> Option<u16> {
    partitions.iter().find(|(_, p)| &p.instance_guid == instance_guid).map(|(&index, _)| index)
}

/// The upgrade protocol: retire whichever entry matches `old_instance_guid`
/// and publish the one matching `new_instance_guid`.  The new entry must
/// exist; the old may not, and `old == new` re-activates in place.
pub fn activate(
    partitions: &mut BTreeMap<u16, PartitionEntry>,
    old_instance_guid: &[u8; 16],
    new_instance_guid: &[u8; 16],
) -> Result<(), FvmError> {
    let new_index =
        lookup_by_instance(partitions, new_instance_guid).ok_or(FvmError::NotFound)?;
    if let Some(old_index) = lookup_by_instance(partitions, old_instance_guid) {
        partitions.get_mut(&old_index).unwrap().set_active(false);
    }
    partitions.get_mut(&new_index).unwrap().set_active(true);
    Ok(())
}
