// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Eq, Error, Clone, Debug, PartialEq)]
pub enum FvmError {
    #[error("No space")]
    NoSpace,
    #[error("No free partition entry")]
    NoFreeEntry,
    #[error("Device too small")]
    DeviceTooSmall,
    #[error("Out of range")]
    OutOfRange,
    #[error("Name too long")]
    NameTooLong,
    #[error("Bad GUID")]
    BadGuid,
    #[error("Already allocated")]
    AlreadyAllocated,
    #[error("Not allocated")]
    NotAllocated,
    #[error("Duplicate instance GUID")]
    DuplicateInstance,
    #[error("Not found")]
    NotFound,
    #[error("Bad state")]
    BadState,
    #[error("Bad magic")]
    BadMagic,
    #[error("Unsupported format version")]
    BadVersion,
    #[error("Bad checksum")]
    BadChecksum,
    #[error("Bad structure")]
    BadStructure,
    #[error("Not an FVM device")]
    NoFvm,
    #[error("I/O error")]
    Io,
    #[error("Channel closed")]
    ChannelClosed,
}

impl FvmError {
    /// A helper to match this FvmError against the root cause of an
    /// anyhow::Error.
    pub fn matches(&self, error: &anyhow::Error) -> bool {
        if let Some(root_cause) = error.root_cause().downcast_ref::<FvmError>() {
            self == root_cause
        } else {
            false
        }
    }

    /// Maps an error chain back to its typed kind; anything that did not
    /// originate as an FvmError is reported as an I/O failure.
    pub fn kind(error: &anyhow::Error) -> FvmError {
        error.root_cause().downcast_ref::<FvmError>().cloned().unwrap_or(FvmError::Io)
    }
}
