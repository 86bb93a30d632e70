// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A minimal block device abstraction.  Everything above this layer addresses
//! the device in whole blocks; offsets and lengths are in bytes but must be
//! block aligned.

use anyhow::{anyhow, bail, ensure, Error};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    /// Reads `buf.len()` bytes starting at byte `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error>;

    /// Writes `buf` starting at byte `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error>;

    /// Ensures all previously written data has made it to durable storage.
    fn flush(&self) -> Result<(), Error>;

    /// Discards the given range.  Devices that cannot discard may treat this
    /// as a no-op; devices that do not support it at all return an error.
    fn trim(&self, _offset: u64, _len: u64) -> Result<(), Error> {
        bail!("trim not supported");
    }

    fn size(&self) -> u64 {
        self.block_count() * self.block_size() as u64
    }
}

fn check_range(device: &dyn BlockDevice, offset: u64, len: usize) -> Result<(), Error> {
    let bs = device.block_size() as u64;
    ensure!(
        offset % bs == 0 && len as u64 % bs == 0,
        "unaligned block range ({offset}, {len})"
    );
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| anyhow!("range overflow ({offset}, {len})"))?;
    ensure!(end <= device.size(), "range ({offset}, {len}) past end of device");
    Ok(())
}

/// An in-memory device.
pub struct RamDisk {
    block_size: u32,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            data: Mutex::new(vec![0u8; (block_count * block_size as u64) as usize]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.data.lock().unwrap().len() as u64 / self.block_size as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        check_range(self, offset, buf.len())?;
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[offset as usize..offset as usize + buf.len()]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        check_range(self, offset, buf.len())?;
        let mut data = self.data.lock().unwrap();
        data[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn trim(&self, offset: u64, len: u64) -> Result<(), Error> {
        check_range(self, offset, len as usize)?;
        let mut data = self.data.lock().unwrap();
        data[offset as usize..(offset + len) as usize].fill(0);
        Ok(())
    }
}

/// A device backed by a regular file, used by the host tools.
pub struct FileBlockDevice {
    file: File,
    block_size: u32,
    block_count: u64,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        ensure!(block_size > 0, "bad block size {block_size}");
        Ok(Self { file, block_size, block_count: size / block_size as u64 })
    }

    /// Creates (or truncates) a file of `size` bytes.
    pub fn create(path: impl AsRef<Path>, block_size: u32, size: u64) -> Result<Self, Error> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(size)?;
        ensure!(block_size > 0, "bad block size {block_size}");
        Ok(Self { file, block_size, block_count: size / block_size as u64 })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        check_range(self, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        check_range(self, offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Wraps another device and, once armed, accepts only a limited number of
/// further written bytes.  A write that exceeds the remaining budget persists
/// its prefix and then fails, and every write after that fails outright, so
/// tests can simulate a torn write at an arbitrary byte offset followed by
/// the device going away.
pub struct FaultyBlockDevice<D> {
    inner: D,
    budget: Mutex<Option<u64>>,
    failed: AtomicBool,
}

impl<D: BlockDevice> FaultyBlockDevice<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, budget: Mutex::new(None), failed: AtomicBool::new(false) }
    }

    /// Allows `bytes` more written bytes before the device starts failing.
    pub fn arm(&self, bytes: u64) {
        *self.budget.lock().unwrap() = Some(bytes);
        self.failed.store(false, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        *self.budget.lock().unwrap() = None;
        self.failed.store(false, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: BlockDevice> BlockDevice for FaultyBlockDevice<D> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        if self.failed.load(Ordering::SeqCst) {
            bail!("device failed");
        }
        let allowed = {
            let mut budget = self.budget.lock().unwrap();
            match &mut *budget {
                None => None,
                Some(remaining) => {
                    let allowed = std::cmp::min(*remaining, buf.len() as u64);
                    *remaining -= allowed;
                    Some(allowed)
                }
            }
        };
        match allowed {
            None => self.inner.write_at(buf, offset),
            Some(allowed) if allowed == buf.len() as u64 => self.inner.write_at(buf, offset),
            Some(allowed) => {
                // Tear the write: persist the prefix, rounded down to a block,
                // then overwrite the remainder of the first torn block with
                // garbage so the failure is not silently clean.
                self.failed.store(true, Ordering::SeqCst);
                let bs = self.block_size() as u64;
                let whole = allowed / bs * bs;
                if whole > 0 {
                    self.inner.write_at(&buf[..whole as usize], offset)?;
                }
                if whole < buf.len() as u64 {
                    let mut block = vec![0u8; bs as usize];
                    self.inner.read_at(&mut block, offset + whole)?;
                    let torn = (allowed - whole) as usize;
                    block[..torn].copy_from_slice(&buf[whole as usize..allowed as usize]);
                    self.inner.write_at(&block, offset + whole)?;
                }
                warn!(offset, allowed, "Injecting write fault");
                bail!("injected write fault at offset {}", offset + allowed);
            }
        }
    }

    fn flush(&self) -> Result<(), Error> {
        if self.failed.load(Ordering::SeqCst) {
            bail!("device failed");
        }
        self.inner.flush()
    }

    fn trim(&self, offset: u64, len: u64) -> Result<(), Error> {
        self.inner.trim(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockDevice, FaultyBlockDevice, FileBlockDevice, RamDisk};

    #[test]
    fn test_ramdisk_read_write() {
        let device = RamDisk::new(512, 16);
        let buf = vec![0xab; 1024];
        device.write_at(&buf, 512).unwrap();
        let mut read_buf = vec![0; 512];
        device.read_at(&mut read_buf, 1024).unwrap();
        assert_eq!(&read_buf, &[0xab; 512]);
        device.read_at(&mut read_buf, 0).unwrap();
        assert_eq!(&read_buf, &[0; 512]);
    }

    #[test]
    fn test_unaligned_rejected() {
        let device = RamDisk::new(512, 16);
        let mut buf = vec![0; 512];
        assert!(device.read_at(&mut buf, 100).is_err());
        assert!(device.write_at(&buf[..100], 0).is_err());
        assert!(device.read_at(&mut buf, 16 * 512).is_err());
    }

    #[test]
    fn test_trim_zeroes() {
        let device = RamDisk::new(512, 16);
        device.write_at(&vec![0xff; 1024], 0).unwrap();
        device.trim(512, 512).unwrap();
        let mut buf = vec![0xab; 512];
        device.read_at(&mut buf, 512).unwrap();
        assert_eq!(&buf, &[0; 512]);
        device.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, &[0xff; 512]);
    }

    #[test]
    fn test_file_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image");
        let device = FileBlockDevice::create(&path, 512, 8192).unwrap();
        assert_eq!(device.block_count(), 16);
        device.write_at(&vec![7u8; 512], 4096).unwrap();
        device.flush().unwrap();
        drop(device);

        let device = FileBlockDevice::open(&path, 512).unwrap();
        let mut buf = vec![0; 512];
        device.read_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, &[7u8; 512]);
    }

    #[test]
    fn test_faulty_device_tears_write() {
        let device = FaultyBlockDevice::new(RamDisk::new(512, 16));
        device.write_at(&vec![1u8; 2048], 0).unwrap();

        // Allow 700 bytes: one whole block plus a torn second block.
        device.arm(700);
        assert!(device.write_at(&vec![2u8; 2048], 0).is_err());
        assert!(device.write_at(&vec![3u8; 512], 0).is_err());
        assert!(device.flush().is_err());

        device.disarm();
        let mut buf = vec![0; 2048];
        device.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..700], &[2u8; 700][..]);
        assert_eq!(&buf[700..1024], &[1u8; 324][..]);
        assert_eq!(&buf[1024..], &[1u8; 1024][..]);
    }
}
