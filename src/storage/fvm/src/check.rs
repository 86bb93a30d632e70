// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The offline consistency checker.  Reads both metadata copies, selects the
//! active one the same way bind does, and verifies the semantic invariants
//! the codec cannot see on its own.  Pure read; never repairs.

use crate::errors::FvmError;
use crate::format::{
    pick_active, Geometry, Metadata, Slot, MAX_VSLICES, PARTITION_TABLE_ENTRIES,
};
use crate::volume::probe_geometry;
use anyhow::{Context, Error};
use block_device::BlockDevice;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Findings {
    Valid,
    Corrupted { reasons: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct InactiveReport {
    pub slot: Slot,
    /// The copy's generation if it decodes, otherwise why it does not.
    pub status: Result<u64, String>,
}

#[derive(Clone, Debug)]
pub struct Report {
    pub slot: Slot,
    pub generation: u64,
    pub findings: Findings,
    pub inactive: InactiveReport,
}

impl Report {
    pub fn is_valid(&self) -> bool {
        self.findings == Findings::Valid
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "active copy: {:?} (generation {})", self.slot, self.generation)?;
        match &self.inactive.status {
            Ok(generation) => {
                writeln!(f, "inactive copy: {:?} (generation {generation})", self.inactive.slot)?
            }
            Err(reason) => writeln!(f, "inactive copy: {:?} invalid: {reason}", self.inactive.slot)?,
        }
        match &self.findings {
            Findings::Valid => write!(f, "volume is consistent"),
            Findings::Corrupted { reasons } => {
                writeln!(f, "volume is corrupted:")?;
                for reason in reasons {
                    writeln!(f, "  {reason}")?;
                }
                Ok(())
            }
        }
    }
}

/// Verifies the invariants a structurally valid copy can still break.
pub fn verify_invariants(metadata: &Metadata, device: &dyn BlockDevice) -> Vec<String> {
    let mut reasons = Vec::new();

    match Geometry::from_superblock(&metadata.superblock, device.block_size()) {
        Ok(geometry) => {
            if 2 * geometry.metadata_size + geometry.pslice_count * geometry.slice_size
                > device.size()
            {
                reasons.push(format!(
                    "slice region ({} slices of {} bytes) exceeds the device",
                    geometry.pslice_count, geometry.slice_size
                ));
            }
        }
        Err(error) => reasons.push(format!("unusable geometry: {error:#}")),
    }

    if metadata.partitions.len() as u64 >= PARTITION_TABLE_ENTRIES {
        reasons.push(format!("{} partitions exceed the table", metadata.partitions.len()));
    }

    // Allocated slices must name a live partition and repeat no virtual
    // slice within it.
    let mut seen: HashSet<(u16, u64)> = HashSet::new();
    for (i, entry) in metadata.allocations.iter().enumerate() {
        if entry.is_free() {
            continue;
        }
        let pslice = i as u64 + 1;
        if !metadata.partitions.contains_key(&entry.partition_index()) {
            reasons.push(format!(
                "physical slice {pslice} owned by free partition entry {}",
                entry.partition_index()
            ));
            continue;
        }
        if entry.vslice() >= MAX_VSLICES {
            reasons.push(format!(
                "physical slice {pslice} maps virtual slice {} past the addressable bound",
                entry.vslice()
            ));
        }
        if !seen.insert((entry.partition_index(), entry.vslice())) {
            reasons.push(format!(
                "virtual slice {} of partition {} mapped more than once",
                entry.vslice(),
                entry.partition_index()
            ));
        }
    }

    // (instance GUID, type GUID) pairs are unique across active partitions.
    let mut pairs: HashMap<([u8; 16], [u8; 16]), u16> = HashMap::new();
    for (&index, partition) in &metadata.partitions {
        if !partition.is_active() {
            continue;
        }
        if let Some(other) =
            pairs.insert((partition.instance_guid, partition.type_guid), index)
        {
            reasons.push(format!(
                "partitions {other} and {index} share an instance and type GUID"
            ));
        }
    }

    reasons
}

fn read_copy(device: &dyn BlockDevice, geometry: &Geometry, slot: Slot) -> Result<Metadata, Error> {
    let mut buffer = vec![0u8; geometry.metadata_size as usize];
    device
        .read_at(&mut buffer, geometry.metadata_offset(slot))
        .with_context(|| format!("reading metadata copy {slot:?}"))?;
    Metadata::decode(&buffer, device.block_size())
}

/// Validates the volume.  Fails with NoFvm when neither copy decodes; any
/// surviving inconsistency is reported as findings, not an error.
pub fn check(device: &dyn BlockDevice) -> Result<Report, Error> {
    let geometry = probe_geometry(device)?;
    let a = read_copy(device, &geometry, Slot::A);
    let b = read_copy(device, &geometry, Slot::B);

    let inactive_status = |copy: &Result<Metadata, Error>| match copy {
        Ok(metadata) => Ok(metadata.superblock.generation),
        Err(error) => Err(format!("{error:#}")),
    };
    let inactive = |slot: Slot, copy: &Result<Metadata, Error>| InactiveReport {
        slot,
        status: inactive_status(copy),
    };

    let inactive_report = match (&a, &b) {
        (Ok(a_meta), Ok(b_meta)) => {
            if b_meta.superblock.generation > a_meta.superblock.generation {
                inactive(Slot::A, &a)
            } else {
                inactive(Slot::B, &b)
            }
        }
        (Ok(_), Err(_)) => inactive(Slot::B, &b),
        _ => inactive(Slot::A, &a),
    };

    let (slot, metadata) = pick_active(a, b).ok_or(FvmError::NoFvm)?;
    let reasons = verify_invariants(&metadata, device);
    Ok(Report {
        slot,
        generation: metadata.superblock.generation,
        findings: if reasons.is_empty() {
            Findings::Valid
        } else {
            Findings::Corrupted { reasons }
        },
        inactive: inactive_report,
    })
}
