// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The control transport: typed request/response messages over channel
//! pairs.  Manager-wide operations ride one channel; each opened partition
//! gets its own channel, and block sessions hang off those.  The service
//! owns the published block servers so destroying a partition can cancel
//! its in-flight I/O before the metadata commit.

use crate::errors::FvmError;
use crate::format::PartitionFlags;
use crate::frontend::PartitionFrontEnd;
use crate::volume::{ManagerInfo, PartitionDescriptor, VolumeManager, VsliceRange};
use anyhow::{anyhow, Error};
use block_server::{BlockServer, PartitionInfo, SessionProxy};
use crossbeam::channel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug)]
pub enum ManagerRequest {
    AllocatePartition {
        type_guid: [u8; 16],
        instance_guid: [u8; 16],
        name: String,
        slice_count: u64,
        flags: PartitionFlags,
    },
    Info,
    ListPartitions,
    Activate { old_instance_guid: [u8; 16], new_instance_guid: [u8; 16] },
    OpenPartition { instance_guid: [u8; 16] },
}

#[derive(Debug)]
pub enum ManagerResponse {
    AllocatePartition(Result<u16, FvmError>),
    Info(ManagerInfo),
    ListPartitions(Vec<PartitionDescriptor>),
    Activate(Result<(), FvmError>),
    OpenPartition(Result<PartitionClient, FvmError>),
}

#[derive(Debug)]
pub enum PartitionRequest {
    GetInfo,
    Extend { vslice_start: u64, count: u64 },
    Shrink { vslice_start: u64, count: u64 },
    QueryRanges { vslice_starts: Vec<u64> },
    Destroy,
    OpenSession,
}

pub enum PartitionResponse {
    GetInfo(Result<PartitionInfo, FvmError>),
    Extend(Result<(), FvmError>),
    Shrink(Result<(), FvmError>),
    QueryRanges(Result<Vec<VsliceRange>, FvmError>),
    Destroy(Result<(), FvmError>),
    OpenSession(Result<SessionProxy, FvmError>),
}

impl std::fmt::Debug for PartitionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionResponse::GetInfo(r) => f.debug_tuple("GetInfo").field(r).finish(),
            PartitionResponse::Extend(r) => f.debug_tuple("Extend").field(r).finish(),
            PartitionResponse::Shrink(r) => f.debug_tuple("Shrink").field(r).finish(),
            PartitionResponse::QueryRanges(r) => f.debug_tuple("QueryRanges").field(r).finish(),
            PartitionResponse::Destroy(r) => f.debug_tuple("Destroy").field(r).finish(),
            PartitionResponse::OpenSession(r) => {
                f.debug_tuple("OpenSession").field(&r.as_ref().map(|_| "session")).finish()
            }
        }
    }
}

pub struct Service {
    manager: Arc<VolumeManager>,
    servers: Mutex<HashMap<u16, Arc<BlockServer<PartitionFrontEnd>>>>,
}

impl Service {
    pub fn new(manager: Arc<VolumeManager>) -> Arc<Self> {
        Arc::new(Self { manager, servers: Mutex::new(HashMap::new()) })
    }

    pub fn manager(&self) -> &Arc<VolumeManager> {
        &self.manager
    }

    /// The block server publishing `partition_index` as a child device,
    /// created on first use.
    pub fn block_server(
        self: &Arc<Self>,
        partition_index: u16,
    ) -> Result<Arc<BlockServer<PartitionFrontEnd>>, Error> {
        if let Some(server) = self.servers.lock().unwrap().get(&partition_index) {
            return Ok(server.clone());
        }
        let frontend = PartitionFrontEnd::new(self.manager.clone(), partition_index);
        let info = frontend.partition_info()?;
        let server = BlockServer::new(info, Arc::new(frontend));
        Ok(self
            .servers
            .lock()
            .unwrap()
            .entry(partition_index)
            .or_insert(server)
            .clone())
    }

    /// Cancels the partition's sessions and then commits the destroy.
    pub fn destroy_partition(&self, partition_index: u16) -> Result<(), Error> {
        let server = self.servers.lock().unwrap().remove(&partition_index);
        if let Some(server) = server {
            server.shutdown();
        }
        self.manager.destroy_partition(partition_index)
    }

    /// Spawns the manager channel's serving thread.
    pub fn serve_manager(self: &Arc<Self>) -> ManagerClient {
        let (request_tx, request_rx) = channel::unbounded::<ManagerRequest>();
        let (response_tx, response_rx) = channel::unbounded::<ManagerResponse>();
        let service = self.clone();
        std::thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                if response_tx.send(service.handle_manager_request(request)).is_err() {
                    break;
                }
            }
        });
        ManagerClient { requests: request_tx, responses: response_rx }
    }

    fn handle_manager_request(self: &Arc<Self>, request: ManagerRequest) -> ManagerResponse {
        match request {
            ManagerRequest::AllocatePartition {
                type_guid,
                instance_guid,
                name,
                slice_count,
                flags,
            } => ManagerResponse::AllocatePartition(
                self.manager
                    .create_partition(type_guid, instance_guid, &name, slice_count, flags)
                    .map_err(|e| FvmError::kind(&e)),
            ),
            ManagerRequest::Info => ManagerResponse::Info(self.manager.info()),
            ManagerRequest::ListPartitions => {
                ManagerResponse::ListPartitions(self.manager.list_partitions())
            }
            ManagerRequest::Activate { old_instance_guid, new_instance_guid } => {
                ManagerResponse::Activate(
                    self.manager
                        .activate(&old_instance_guid, &new_instance_guid)
                        .map_err(|e| FvmError::kind(&e)),
                )
            }
            ManagerRequest::OpenPartition { instance_guid } => ManagerResponse::OpenPartition(
                self.manager
                    .lookup_partition(&instance_guid)
                    .map(|index| self.serve_partition(index))
                    .map_err(|e| FvmError::kind(&e)),
            ),
        }
    }

    /// Spawns a serving thread for one partition's control channel.
    fn serve_partition(self: &Arc<Self>, partition_index: u16) -> PartitionClient {
        let (request_tx, request_rx) = channel::unbounded::<PartitionRequest>();
        let (response_tx, response_rx) = channel::unbounded::<PartitionResponse>();
        let service = self.clone();
        std::thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                let response = service.handle_partition_request(partition_index, request);
                if response_tx.send(response).is_err() {
                    break;
                }
            }
        });
        PartitionClient { requests: request_tx, responses: response_rx }
    }

    fn handle_partition_request(
        self: &Arc<Self>,
        partition_index: u16,
        request: PartitionRequest,
    ) -> PartitionResponse {
        let kind = |e: Error| FvmError::kind(&e);
        match request {
            PartitionRequest::GetInfo => PartitionResponse::GetInfo(
                PartitionFrontEnd::new(self.manager.clone(), partition_index)
                    .partition_info()
                    .map_err(kind),
            ),
            PartitionRequest::Extend { vslice_start, count } => PartitionResponse::Extend(
                self.manager.extend(partition_index, vslice_start, count).map_err(kind),
            ),
            PartitionRequest::Shrink { vslice_start, count } => PartitionResponse::Shrink(
                self.manager.shrink(partition_index, vslice_start, count).map_err(kind),
            ),
            PartitionRequest::QueryRanges { vslice_starts } => PartitionResponse::QueryRanges(
                self.manager.query_ranges(partition_index, &vslice_starts).map_err(kind),
            ),
            PartitionRequest::Destroy => {
                PartitionResponse::Destroy(self.destroy_partition(partition_index).map_err(kind))
            }
            PartitionRequest::OpenSession => PartitionResponse::OpenSession(
                self.block_server(partition_index)
                    .map(|server| server.create_session())
                    .map_err(|e| {
                        warn!(partition_index, error = ?e, "Failed to open session");
                        FvmError::kind(&e)
                    }),
            ),
        }
    }
}

/// Client end of the manager channel.
pub struct ManagerClient {
    requests: channel::Sender<ManagerRequest>,
    responses: channel::Receiver<ManagerResponse>,
}

fn closed() -> Error {
    anyhow!(FvmError::ChannelClosed)
}

impl ManagerClient {
    fn transact(&self, request: ManagerRequest) -> Result<ManagerResponse, Error> {
        self.requests.send(request).map_err(|_| closed())?;
        self.responses.recv().map_err(|_| closed())
    }

    pub fn allocate_partition(
        &self,
        type_guid: [u8; 16],
        instance_guid: [u8; 16],
        name: &str,
        slice_count: u64,
        flags: PartitionFlags,
    ) -> Result<u16, Error> {
        match self.transact(ManagerRequest::AllocatePartition {
            type_guid,
            instance_guid,
            name: name.to_string(),
            slice_count,
            flags,
        })? {
            ManagerResponse::AllocatePartition(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn info(&self) -> Result<ManagerInfo, Error> {
        match self.transact(ManagerRequest::Info)? {
            ManagerResponse::Info(info) => Ok(info),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn list_partitions(&self) -> Result<Vec<PartitionDescriptor>, Error> {
        match self.transact(ManagerRequest::ListPartitions)? {
            ManagerResponse::ListPartitions(partitions) => Ok(partitions),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn activate(
        &self,
        old_instance_guid: [u8; 16],
        new_instance_guid: [u8; 16],
    ) -> Result<(), Error> {
        match self.transact(ManagerRequest::Activate { old_instance_guid, new_instance_guid })? {
            ManagerResponse::Activate(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn open_partition(&self, instance_guid: [u8; 16]) -> Result<PartitionClient, Error> {
        match self.transact(ManagerRequest::OpenPartition { instance_guid })? {
            ManagerResponse::OpenPartition(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }
}

/// Client end of one partition's control channel.
#[derive(Debug)]
pub struct PartitionClient {
    requests: channel::Sender<PartitionRequest>,
    responses: channel::Receiver<PartitionResponse>,
}

impl PartitionClient {
    fn transact(&self, request: PartitionRequest) -> Result<PartitionResponse, Error> {
        self.requests.send(request).map_err(|_| closed())?;
        self.responses.recv().map_err(|_| closed())
    }

    pub fn get_info(&self) -> Result<PartitionInfo, Error> {
        match self.transact(PartitionRequest::GetInfo)? {
            PartitionResponse::GetInfo(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn extend(&self, vslice_start: u64, count: u64) -> Result<(), Error> {
        match self.transact(PartitionRequest::Extend { vslice_start, count })? {
            PartitionResponse::Extend(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn shrink(&self, vslice_start: u64, count: u64) -> Result<(), Error> {
        match self.transact(PartitionRequest::Shrink { vslice_start, count })? {
            PartitionResponse::Shrink(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn query_ranges(&self, vslice_starts: &[u64]) -> Result<Vec<VsliceRange>, Error> {
        match self
            .transact(PartitionRequest::QueryRanges { vslice_starts: vslice_starts.to_vec() })?
        {
            PartitionResponse::QueryRanges(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn destroy(&self) -> Result<(), Error> {
        match self.transact(PartitionRequest::Destroy)? {
            PartitionResponse::Destroy(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }

    pub fn open_session(&self) -> Result<SessionProxy, Error> {
        match self.transact(PartitionRequest::OpenSession)? {
            PartitionResponse::OpenSession(result) => Ok(result?),
            _ => Err(anyhow!(FvmError::BadState)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Service;
    use crate::errors::FvmError;
    use crate::format::PartitionFlags;
    use crate::volume::VolumeManager;
    use block_device::RamDisk;
    use std::sync::Arc;

    const BLOCK_SIZE: u32 = 512;
    const SLICE_SIZE: u64 = 65536;

    fn service() -> Arc<Service> {
        let device = Arc::new(RamDisk::new(BLOCK_SIZE, (64 << 20) / BLOCK_SIZE as u64));
        Service::new(VolumeManager::init(device, SLICE_SIZE).unwrap())
    }

    #[test]
    fn test_manager_channel() {
        let service = service();
        let client = service.serve_manager();

        let info = client.info().unwrap();
        assert_eq!(info.slice_size, SLICE_SIZE);
        assert_eq!(info.allocated_count, 0);

        client
            .allocate_partition([1; 16], [2; 16], "data", 2, PartitionFlags::empty())
            .unwrap();
        assert_eq!(client.info().unwrap().allocated_count, 2);
        assert_eq!(client.list_partitions().unwrap().len(), 1);

        let err = client
            .allocate_partition([1; 16], [2; 16], "data", 1, PartitionFlags::empty())
            .unwrap_err();
        assert!(FvmError::DuplicateInstance.matches(&err));
    }

    #[test]
    fn test_partition_channel() {
        let service = service();
        let client = service.serve_manager();
        client
            .allocate_partition([1; 16], [2; 16], "data", 1, PartitionFlags::empty())
            .unwrap();

        let partition = client.open_partition([2; 16]).unwrap();
        assert_eq!(partition.get_info().unwrap().name, "data");
        partition.extend(1, 2).unwrap();
        assert!(FvmError::AlreadyAllocated.matches(&partition.extend(0, 1).unwrap_err()));
        partition.shrink(1, 2).unwrap();

        let ranges = partition.query_ranges(&[0, 1]).unwrap();
        assert!(ranges[0].allocated);
        assert!(!ranges[1].allocated);

        partition.destroy().unwrap();
        assert!(FvmError::NotFound.matches(&partition.extend(1, 1).unwrap_err()));
        assert!(FvmError::NotFound.matches(&client.open_partition([2; 16]).unwrap_err()));
    }

    #[test]
    fn test_session_via_channel() {
        let service = service();
        let client = service.serve_manager();
        client
            .allocate_partition([1; 16], [2; 16], "data", 1, PartitionFlags::empty())
            .unwrap();
        let partition = client.open_partition([2; 16]).unwrap();
        let session = partition.open_session().unwrap();

        let buffer = Arc::new(block_server::SharedBuffer::new(512));
        let bufid = session.attach_buffer(buffer.clone());
        buffer.write(&[9u8; 512], 0).unwrap();
        let response = session
            .transact(block_server::BlockFifoRequest {
                opcode: block_server::BLOCK_OP_WRITE,
                reqid: 1,
                bufid,
                length: 1,
                dev_offset: 0,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, block_server::STATUS_OK);

        // Destroying the partition cancels the session.
        partition.destroy().unwrap();
        assert!(session.recv().is_err());
    }

    #[test]
    fn test_open_inactive_partition_fails() {
        let service = service();
        let client = service.serve_manager();
        client
            .allocate_partition([1; 16], [7; 16], "staged", 1, PartitionFlags::INACTIVE)
            .unwrap();
        assert!(FvmError::NotFound.matches(&client.open_partition([7; 16]).unwrap_err()));
        client.activate([0; 16], [7; 16]).unwrap();
        client.open_partition([7; 16]).unwrap();
    }
}
