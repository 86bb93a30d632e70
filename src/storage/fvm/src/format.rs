// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The on-disk format.  Two metadata copies sit at the front of the device,
//! each holding a superblock, the partition table and the slice allocation
//! table; the slice region follows.  Everything here is pure: reading and
//! writing the copies is the transaction engine's job.

use crate::errors::FvmError;
use anyhow::{anyhow, bail, ensure, Error};
use bitflags::bitflags;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Formatter;
use tracing::warn;
use uuid::Uuid;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// "FVM PART" in little-endian.
pub const MAGIC: u64 = 0x54524150204d5646;

pub const MAJOR_VERSION: u64 = 1;
pub const MINOR_VERSION: u64 = 0;

pub const SUPERBLOCK_SIZE: u64 = 512;

/// Fixed partition table bound; entry 0 is reserved so that a slice entry's
/// partition index of zero can mean "free".
pub const PARTITION_TABLE_ENTRIES: u64 = 1024;

pub const PARTITION_NAME_LEN: usize = 24;

/// Virtual slice numbers fit the 32-bit field of a slice entry; the largest
/// addressable virtual slice is one less than this.
pub const MAX_VSLICES: u64 = u32::MAX as u64;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, FromBytes, FromZeroes, AsBytes)]
pub struct Superblock {
    pub magic: u64,
    pub major_version: u64,
    pub minor_version: u64,
    pub slice_size: u64,
    pub partition_table_entry_count: u64,
    pub pslice_count: u64,
    pub generation: u64,
    reserved: [u8; 448],
    pub checksum: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Superblock>(), 512);

const CHECKSUM_OFFSET: usize = std::mem::size_of::<Superblock>() - 8;

impl Superblock {
    fn new(slice_size: u64, pslice_count: u64) -> Self {
        let mut superblock = Self::new_zeroed();
        superblock.magic = MAGIC;
        superblock.major_version = MAJOR_VERSION;
        superblock.minor_version = MINOR_VERSION;
        superblock.slice_size = slice_size;
        superblock.partition_table_entry_count = PARTITION_TABLE_ENTRIES;
        superblock.pslice_count = pslice_count;
        superblock
    }
}

/// Which of the two metadata copies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// Byte geometry of a formatted device, derived from the device size, its
/// block size and the slice size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub slice_size: u64,
    pub pslice_count: u64,
    pub metadata_size: u64,
}

pub fn partition_table_size() -> u64 {
    PARTITION_TABLE_ENTRIES * std::mem::size_of::<PartitionEntry>() as u64
}

fn metadata_size_for(pslice_count: u64, block_size: u32) -> Result<u64, Error> {
    (SUPERBLOCK_SIZE + partition_table_size())
        .checked_add(pslice_count.checked_mul(8).ok_or_else(|| anyhow!("pslice overflow"))?)
        .and_then(|n| n.checked_next_multiple_of(block_size as u64))
        .ok_or_else(|| anyhow!("metadata size overflow"))
}

fn check_slice_size(slice_size: u64, block_size: u32) -> Result<(), Error> {
    ensure!(
        slice_size >= block_size as u64
            && slice_size % block_size as u64 == 0
            && (slice_size / block_size as u64).is_power_of_two(),
        anyhow!(FvmError::OutOfRange)
            .context(format!("slice size {slice_size} unusable with block size {block_size}"))
    );
    Ok(())
}

impl Geometry {
    /// Computes the geometry for a fresh device: the largest physical slice
    /// count such that both metadata copies and the slice region fit.
    pub fn new(device_size: u64, block_size: u32, slice_size: u64) -> Result<Geometry, Error> {
        check_slice_size(slice_size, block_size)?;
        let mut pslice_count = device_size / slice_size;
        loop {
            let metadata_size = metadata_size_for(pslice_count, block_size)?;
            let reserved = 2 * metadata_size;
            if reserved + pslice_count * slice_size <= device_size {
                ensure!(pslice_count > 0, FvmError::DeviceTooSmall);
                return Ok(Geometry { slice_size, pslice_count, metadata_size });
            }
            if device_size <= reserved {
                bail!(FvmError::DeviceTooSmall);
            }
            pslice_count = (device_size - reserved) / slice_size;
        }
    }

    /// The geometry a decoded superblock implies.
    pub fn from_superblock(superblock: &Superblock, block_size: u32) -> Result<Geometry, Error> {
        check_slice_size(superblock.slice_size, block_size)?;
        Ok(Geometry {
            slice_size: superblock.slice_size,
            pslice_count: superblock.pslice_count,
            metadata_size: metadata_size_for(superblock.pslice_count, block_size)?,
        })
    }

    pub fn metadata_offset(&self, slot: Slot) -> u64 {
        match slot {
            Slot::A => 0,
            Slot::B => self.metadata_size,
        }
    }

    pub fn data_start(&self) -> u64 {
        2 * self.metadata_size
    }

    /// Byte offset of a physical slice; physical slices are numbered 1..=P.
    pub fn slice_offset(&self, pslice: u64) -> u64 {
        debug_assert!(pslice >= 1 && pslice <= self.pslice_count);
        self.data_start() + (pslice - 1) * self.slice_size
    }
}

bitflags! {
    pub struct PartitionFlags: u32 {
        /// The partition was provisioned but not yet activated; it is hidden
        /// from clients until an upgrade publishes it.
        const INACTIVE = 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, FromBytes, FromZeroes, AsBytes)]
pub struct PartitionEntry {
    pub type_guid: [u8; 16],
    pub instance_guid: [u8; 16],
    name: [u8; PARTITION_NAME_LEN],
    flags: u32,
    reserved: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<PartitionEntry>(), 64);

impl std::fmt::Debug for PartitionEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PartitionEntry")
            .field("type_guid", &Uuid::from_slice(&self.type_guid).unwrap())
            .field("instance_guid", &Uuid::from_slice(&self.instance_guid).unwrap())
            .field("name", &self.name())
            .field("flags", &self.flags)
            .finish()
    }
}

impl PartitionEntry {
    pub fn new(
        type_guid: [u8; 16],
        instance_guid: [u8; 16],
        name_str: &str,
        flags: PartitionFlags,
    ) -> Result<Self, FvmError> {
        let name_len = name_str.as_bytes().len();
        if name_len > PARTITION_NAME_LEN {
            return Err(FvmError::NameTooLong);
        }
        let mut name = [0; PARTITION_NAME_LEN];
        name[..name_len].copy_from_slice(name_str.as_bytes());
        Ok(Self { type_guid, instance_guid, name, flags: flags.bits(), reserved: 0 })
    }

    pub fn is_allocated(&self) -> bool {
        self.type_guid != [0; 16]
    }

    /// The field is NUL padded on disk; bytes that are not valid UTF-8
    /// render as replacement characters rather than failing the decode.
    pub fn name(&self) -> Cow<'_, str> {
        let raw = self.name.split(|b| *b == 0).next().unwrap_or_default();
        String::from_utf8_lossy(raw)
    }

    pub fn flags(&self) -> PartitionFlags {
        PartitionFlags::from_bits_truncate(self.flags)
    }

    pub fn is_active(&self) -> bool {
        !self.flags().contains(PartitionFlags::INACTIVE)
    }

    pub fn set_active(&mut self, active: bool) {
        let mut flags = self.flags();
        flags.set(PartitionFlags::INACTIVE, !active);
        self.flags = flags.bits();
    }
}

/// One entry per physical slice: the owning partition index in the low 16
/// bits and the virtual slice number in the next 32.
#[repr(C)]
#[derive(Clone, Copy, Default, Eq, PartialEq, FromBytes, FromZeroes, AsBytes)]
pub struct SliceEntry(u64);

impl std::fmt::Debug for SliceEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("SliceEntry")
            .field("partition_index", &self.partition_index())
            .field("vslice", &self.vslice())
            .finish()
    }
}

impl SliceEntry {
    pub const FREE: SliceEntry = SliceEntry(0);

    pub fn new(partition_index: u16, vslice: u64) -> Self {
        debug_assert!(vslice <= MAX_VSLICES);
        Self(partition_index as u64 | vslice << 16)
    }

    pub fn partition_index(&self) -> u16 {
        self.0 as u16
    }

    pub fn vslice(&self) -> u64 {
        self.0 >> 16 & 0xffff_ffff
    }

    pub fn is_free(&self) -> bool {
        self.partition_index() == 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    /// The checksum and generation fields are only up to date on a copy that
    /// just went through encode or decode.
    pub superblock: Superblock,

    pub partitions: BTreeMap<u16, PartitionEntry>,
    pub allocations: Vec<SliceEntry>,
}

impl Metadata {
    /// A freshly formatted, empty volume.
    pub fn format(geometry: &Geometry) -> Self {
        Self {
            superblock: Superblock::new(geometry.slice_size, geometry.pslice_count),
            partitions: BTreeMap::new(),
            allocations: vec![SliceEntry::FREE; geometry.pslice_count as usize],
        }
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocations.iter().filter(|e| !e.is_free()).count() as u64
    }

    /// Produces the exact on-disk bytes of one metadata copy, checksum last.
    pub fn encode(&self, block_size: u32) -> Result<Vec<u8>, Error> {
        let geometry = Geometry::from_superblock(&self.superblock, block_size)?;
        ensure!(
            self.allocations.len() as u64 == geometry.pslice_count,
            "allocation table has {} entries, expected {}",
            self.allocations.len(),
            geometry.pslice_count
        );
        let mut buffer = vec![0u8; geometry.metadata_size as usize];

        let mut superblock = self.superblock;
        superblock.checksum = 0;
        buffer[..SUPERBLOCK_SIZE as usize].copy_from_slice(superblock.as_bytes());

        for (&index, partition) in &self.partitions {
            ensure!(
                index >= 1 && (index as u64) < PARTITION_TABLE_ENTRIES,
                "partition index {index} out of table bounds"
            );
            let offset = (SUPERBLOCK_SIZE as usize)
                + std::mem::size_of::<PartitionEntry>() * index as usize;
            buffer[offset..offset + std::mem::size_of::<PartitionEntry>()]
                .copy_from_slice(partition.as_bytes());
        }

        let table_start = (SUPERBLOCK_SIZE + partition_table_size()) as usize;
        for (i, entry) in self.allocations.iter().enumerate() {
            let offset = table_start + i * 8;
            buffer[offset..offset + 8].copy_from_slice(entry.as_bytes());
        }

        let checksum = metadata_checksum(&buffer);
        buffer[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].copy_from_slice(&checksum.to_le_bytes());
        Ok(buffer)
    }

    /// Validates and decodes one metadata copy.  The error's root cause is
    /// one of BadMagic, BadVersion, BadChecksum or BadStructure.
    pub fn decode(bytes: &[u8], block_size: u32) -> Result<Self, Error> {
        let superblock = Superblock::read_from_prefix(bytes)
            .ok_or_else(|| anyhow!(FvmError::BadStructure).context("buffer too small"))?;
        if superblock.magic != MAGIC {
            bail!(FvmError::BadMagic);
        }
        if superblock.major_version != MAJOR_VERSION {
            bail!(anyhow!(FvmError::BadVersion)
                .context(format!("major version {}", superblock.major_version)));
        }
        if superblock.partition_table_entry_count != PARTITION_TABLE_ENTRIES {
            bail!(anyhow!(FvmError::BadStructure).context(format!(
                "partition table bound {}",
                superblock.partition_table_entry_count
            )));
        }
        let geometry = Geometry::from_superblock(&superblock, block_size)
            .map_err(|e| anyhow!(FvmError::BadStructure).context(e))?;
        if bytes.len() as u64 != geometry.metadata_size {
            bail!(anyhow!(FvmError::BadStructure).context(format!(
                "metadata is {} bytes, expected {}",
                bytes.len(),
                geometry.metadata_size
            )));
        }

        if metadata_checksum(bytes) != superblock.checksum {
            bail!(FvmError::BadChecksum);
        }

        let entry_size = std::mem::size_of::<PartitionEntry>();
        let table = &bytes[SUPERBLOCK_SIZE as usize..(SUPERBLOCK_SIZE + partition_table_size()) as usize];
        let mut partitions = BTreeMap::new();
        // Index 0 is reserved and never decoded.
        for index in 1..PARTITION_TABLE_ENTRIES as usize {
            let entry =
                PartitionEntry::read_from(&table[index * entry_size..(index + 1) * entry_size])
                    .unwrap();
            if !entry.is_allocated() {
                continue;
            }
            if PartitionFlags::from_bits(entry.flags).is_none() {
                bail!(anyhow!(FvmError::BadStructure)
                    .context(format!("partition {index} has unknown flags {:#x}", entry.flags)));
            }
            partitions.insert(index as u16, entry);
        }

        let table_start = (SUPERBLOCK_SIZE + partition_table_size()) as usize;
        let allocations: Vec<SliceEntry> = bytes
            [table_start..table_start + geometry.pslice_count as usize * 8]
            .chunks_exact(8)
            .map(|e| SliceEntry::read_from(e).unwrap())
            .collect();
        for (i, entry) in allocations.iter().enumerate() {
            if entry.is_free() {
                continue;
            }
            if entry.partition_index() as u64 >= PARTITION_TABLE_ENTRIES || entry.raw() >> 48 != 0 {
                bail!(anyhow!(FvmError::BadStructure)
                    .context(format!("slice {} entry {:#x}", i + 1, entry.raw())));
            }
        }

        Ok(Self { superblock, partitions, allocations })
    }
}

/// The 64-bit metadata checksum: the first eight bytes of the SHA-256 digest
/// of the copy with its checksum field zeroed.
pub fn metadata_checksum(buffer: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(&buffer[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 8]);
    hasher.update(&buffer[SUPERBLOCK_SIZE as usize..]);
    u64::from_le_bytes(hasher.finalize()[..8].try_into().unwrap())
}

/// Selects the live copy: whichever validly decodes with the greater
/// generation, preferring A on a tie.
pub fn pick_active(
    a: Result<Metadata, Error>,
    b: Result<Metadata, Error>,
) -> Option<(Slot, Metadata)> {
    match (a, b) {
        (Ok(a), Ok(b)) => {
            if b.superblock.generation > a.superblock.generation {
                Some((Slot::B, b))
            } else {
                Some((Slot::A, a))
            }
        }
        (Ok(a), Err(error)) => {
            warn!(?error, "Metadata copy B invalid");
            Some((Slot::A, a))
        }
        (Err(error), Ok(b)) => {
            warn!(?error, "Metadata copy A invalid");
            Some((Slot::B, b))
        }
        (Err(error_a), Err(error_b)) => {
            warn!(?error_a, ?error_b, "No valid metadata");
            None
        }
    }
}
