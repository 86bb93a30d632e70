// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A per-partition block server.  Clients register shared buffers and then
//! submit fixed-size requests over a FIFO; each session is served on its own
//! thread.  Requests that share a group id are applied in submission order
//! and acknowledged with a single response when the group-last flag arrives.

use anyhow::{anyhow, Error};
use crossbeam::channel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use tracing::warn;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

mod session;

use session::Session;

pub const BLOCK_OP_READ: u32 = 1;
pub const BLOCK_OP_WRITE: u32 = 2;
pub const BLOCK_OP_FLUSH: u32 = 3;
pub const BLOCK_OP_TRIM: u32 = 4;
pub const BLOCK_OP_CLOSE_BUFFER: u32 = 5;

/// The request is part of a group and expects no individual response.
pub const REQUEST_GROUP_ITEM: u32 = 1;
/// The request completes its group; one response covers every member.
pub const REQUEST_GROUP_LAST: u32 = 2;

/// Set on every response that retires its request (or its whole group).
pub const RESPONSE_DONE: u32 = 1;

pub const STATUS_OK: u32 = 0;

/// Error statuses carried on FIFO responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    OutOfRange,
    NoSpace,
    Io,
    BadState,
    NotSupported,
}

impl Status {
    pub fn to_raw(self) -> u32 {
        match self {
            Status::OutOfRange => 1,
            Status::NoSpace => 2,
            Status::Io => 3,
            Status::BadState => 4,
            Status::NotSupported => 5,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Status::OutOfRange),
            2 => Some(Status::NoSpace),
            3 => Some(Status::Io),
            4 => Some(Status::BadState),
            5 => Some(Status::NotSupported),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, FromZeroes, AsBytes)]
pub struct BlockFifoRequest {
    pub opcode: u32,
    pub flags: u32,
    pub reqid: u32,
    pub group: u16,
    pub bufid: u16,
    /// Length in blocks.
    pub length: u32,
    pub _reserved: u32,
    /// Offset into the registered buffer, in blocks.
    pub buf_offset: u64,
    /// Offset into the device, in blocks.
    pub dev_offset: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, FromZeroes, AsBytes)]
pub struct BlockFifoResponse {
    pub status: u32,
    pub reqid: u32,
    pub group: u16,
    pub _reserved: u16,
    pub flags: u32,
    /// Number of requests retired by this response.
    pub count: u32,
}

/// A shared memory region registered with a session; the host-side stand-in
/// for a VMO.
pub struct SharedBuffer {
    data: RwLock<Box<[u8]>>,
}

impl SharedBuffer {
    pub fn new(size: usize) -> Self {
        Self { data: RwLock::new(vec![0u8; size].into_boxed_slice()) }
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out of the buffer at byte `offset`.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<(), Status> {
        let data = self.data.read().unwrap();
        let end = (offset as usize).checked_add(buf.len()).ok_or(Status::OutOfRange)?;
        if end > data.len() {
            return Err(Status::OutOfRange);
        }
        buf.copy_from_slice(&data[offset as usize..end]);
        Ok(())
    }

    /// Copies into the buffer at byte `offset`.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<(), Status> {
        let mut data = self.data.write().unwrap();
        let end = (offset as usize).checked_add(buf.len()).ok_or(Status::OutOfRange)?;
        if end > data.len() {
            return Err(Status::OutOfRange);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }
}

/// What a session needs from the volume behind it.  Offsets are in blocks of
/// the partition's block size; implementations are responsible for bounds
/// checks and translation.
pub trait Interface: Send + Sync + 'static {
    fn read(
        &self,
        device_block_offset: u64,
        block_count: u32,
        buffer: &SharedBuffer,
        buffer_block_offset: u64,
    ) -> Result<(), Status>;

    fn write(
        &self,
        device_block_offset: u64,
        block_count: u32,
        buffer: &SharedBuffer,
        buffer_block_offset: u64,
    ) -> Result<(), Status>;

    fn flush(&self) -> Result<(), Status>;

    fn trim(&self, device_block_offset: u64, block_count: u32) -> Result<(), Status>;
}

#[derive(Clone, Debug)]
pub struct PartitionInfo {
    pub block_count: u64,
    pub block_size: u32,
    pub type_guid: [u8; 16],
    pub instance_guid: [u8; 16],
    pub name: String,
}

const FIFO_DEPTH: usize = 64;

pub struct BlockServer<I> {
    info: PartitionInfo,
    interface: Arc<I>,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_session_id: AtomicU64,
}

struct SessionEntry {
    stop: channel::Sender<()>,
    thread: JoinHandle<()>,
}

impl<I: Interface> BlockServer<I> {
    pub fn new(info: PartitionInfo, interface: Arc<I>) -> Arc<Self> {
        Arc::new(Self {
            info,
            interface,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn info(&self) -> &PartitionInfo {
        &self.info
    }

    /// Opens a new session served on its own thread.  Dropping the returned
    /// proxy closes the FIFO, cancels outstanding work and releases every
    /// registered buffer.
    pub fn create_session(self: &Arc<Self>) -> SessionProxy {
        let (request_tx, request_rx) = channel::bounded::<BlockFifoRequest>(FIFO_DEPTH);
        let (response_tx, response_rx) = channel::bounded::<BlockFifoResponse>(FIFO_DEPTH);
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let buffers = Arc::new(Mutex::new(HashMap::new()));

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(self.interface.clone(), buffers.clone());
        let server = Arc::downgrade(self);
        let thread = std::thread::spawn(move || {
            session.run(request_rx, response_tx, stop_rx);
            if let Some(server) = Weak::upgrade(&server) {
                // May already be gone if the server is shutting down.
                if let Some(entry) = server.sessions.lock().unwrap().remove(&id) {
                    // Joining ourselves would deadlock; the entry just drops.
                    drop(entry.stop);
                    drop(entry.thread);
                }
            }
        });
        self.sessions.lock().unwrap().insert(id, SessionEntry { stop: stop_tx, thread });

        SessionProxy {
            requests: request_tx,
            responses: response_rx,
            buffers,
            next_bufid: AtomicU16::new(1),
        }
    }

    /// Stops every session and waits for their threads to exit.
    pub fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for (_, entry) in sessions {
            let _ = entry.stop.send(());
            if let Err(error) = entry.thread.join() {
                warn!(?error, "Session thread panicked");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl<I> Drop for BlockServer<I> {
    fn drop(&mut self) {
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for (_, entry) in sessions {
            let _ = entry.stop.send(());
        }
    }
}

/// The client end of a session: the FIFO plus buffer registration.
pub struct SessionProxy {
    requests: channel::Sender<BlockFifoRequest>,
    responses: channel::Receiver<BlockFifoResponse>,
    buffers: Arc<Mutex<HashMap<u16, Arc<SharedBuffer>>>>,
    next_bufid: AtomicU16,
}

impl SessionProxy {
    /// Registers a shared buffer and returns the id requests refer to it by.
    pub fn attach_buffer(&self, buffer: Arc<SharedBuffer>) -> u16 {
        let bufid = self.next_bufid.fetch_add(1, Ordering::Relaxed);
        self.buffers.lock().unwrap().insert(bufid, buffer);
        bufid
    }

    pub fn send(&self, request: BlockFifoRequest) -> Result<(), Error> {
        self.requests.send(request).map_err(|_| anyhow!("session closed"))
    }

    pub fn recv(&self) -> Result<BlockFifoResponse, Error> {
        self.responses.recv().map_err(|_| anyhow!("session closed"))
    }

    /// Sends one request and waits for its response.
    pub fn transact(&self, request: BlockFifoRequest) -> Result<BlockFifoResponse, Error> {
        self.send(request)?;
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BlockFifoRequest, BlockFifoResponse, BlockServer, Interface, PartitionInfo, SharedBuffer,
        Status, BLOCK_OP_CLOSE_BUFFER, BLOCK_OP_FLUSH, BLOCK_OP_READ, BLOCK_OP_WRITE,
        REQUEST_GROUP_ITEM, REQUEST_GROUP_LAST, RESPONSE_DONE, STATUS_OK,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Backs the interface with a plain vector of blocks.
    struct TestVolume {
        blocks: Mutex<Vec<u8>>,
        flushes: AtomicU32,
    }

    const BLOCK_SIZE: usize = 512;

    impl TestVolume {
        fn new(block_count: usize) -> Arc<Self> {
            Arc::new(Self {
                blocks: Mutex::new(vec![0; block_count * BLOCK_SIZE]),
                flushes: AtomicU32::new(0),
            })
        }
    }

    impl Interface for TestVolume {
        fn read(
            &self,
            device_block_offset: u64,
            block_count: u32,
            buffer: &SharedBuffer,
            buffer_block_offset: u64,
        ) -> Result<(), Status> {
            let data = self.blocks.lock().unwrap();
            let start = device_block_offset as usize * BLOCK_SIZE;
            let end = start + block_count as usize * BLOCK_SIZE;
            if end > data.len() {
                return Err(Status::OutOfRange);
            }
            buffer.write(&data[start..end], buffer_block_offset * BLOCK_SIZE as u64)
        }

        fn write(
            &self,
            device_block_offset: u64,
            block_count: u32,
            buffer: &SharedBuffer,
            buffer_block_offset: u64,
        ) -> Result<(), Status> {
            let mut data = self.blocks.lock().unwrap();
            let start = device_block_offset as usize * BLOCK_SIZE;
            let end = start + block_count as usize * BLOCK_SIZE;
            if end > data.len() {
                return Err(Status::OutOfRange);
            }
            let mut buf = vec![0; (block_count as usize) * BLOCK_SIZE];
            buffer.read(&mut buf, buffer_block_offset * BLOCK_SIZE as u64)?;
            data[start..end].copy_from_slice(&buf);
            Ok(())
        }

        fn flush(&self) -> Result<(), Status> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn trim(&self, _device_block_offset: u64, _block_count: u32) -> Result<(), Status> {
            Err(Status::NotSupported)
        }
    }

    fn test_server(block_count: usize) -> (Arc<BlockServer<TestVolume>>, Arc<TestVolume>) {
        let volume = TestVolume::new(block_count);
        let server = BlockServer::new(
            PartitionInfo {
                block_count: block_count as u64,
                block_size: BLOCK_SIZE as u32,
                type_guid: [1; 16],
                instance_guid: [2; 16],
                name: "test".to_string(),
            },
            volume.clone(),
        );
        (server, volume)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (server, _volume) = test_server(16);
        let session = server.create_session();
        let buffer = Arc::new(SharedBuffer::new(4 * BLOCK_SIZE));
        let bufid = session.attach_buffer(buffer.clone());

        buffer.write(&[0xaa; 2 * BLOCK_SIZE], 0).unwrap();
        let response = session
            .transact(BlockFifoRequest {
                opcode: BLOCK_OP_WRITE,
                reqid: 1,
                bufid,
                length: 2,
                dev_offset: 4,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, STATUS_OK);
        assert_eq!(response.reqid, 1);
        assert_eq!(response.flags, RESPONSE_DONE);

        let response = session
            .transact(BlockFifoRequest {
                opcode: BLOCK_OP_READ,
                reqid: 2,
                bufid,
                length: 2,
                buf_offset: 2,
                dev_offset: 4,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, STATUS_OK);
        let mut readback = [0; 2 * BLOCK_SIZE];
        buffer.read(&mut readback, 2 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(&readback[..], &[0xaa; 2 * BLOCK_SIZE][..]);
    }

    #[test]
    fn test_out_of_range_and_bad_buffer() {
        let (server, _volume) = test_server(16);
        let session = server.create_session();
        let buffer = Arc::new(SharedBuffer::new(BLOCK_SIZE));
        let bufid = session.attach_buffer(buffer);

        let response = session
            .transact(BlockFifoRequest {
                opcode: BLOCK_OP_READ,
                reqid: 1,
                bufid,
                length: 1,
                dev_offset: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, Status::OutOfRange.to_raw());

        let response = session
            .transact(BlockFifoRequest {
                opcode: BLOCK_OP_READ,
                reqid: 2,
                bufid: 42,
                length: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, Status::BadState.to_raw());
    }

    #[test]
    fn test_group_single_response() {
        let (server, volume) = test_server(16);
        let session = server.create_session();
        let buffer = Arc::new(SharedBuffer::new(4 * BLOCK_SIZE));
        let bufid = session.attach_buffer(buffer.clone());
        buffer.write(&[0x11; BLOCK_SIZE], 0).unwrap();

        for i in 0..3 {
            session
                .send(BlockFifoRequest {
                    opcode: BLOCK_OP_WRITE,
                    flags: REQUEST_GROUP_ITEM,
                    reqid: i,
                    group: 7,
                    bufid,
                    length: 1,
                    dev_offset: i as u64,
                    ..Default::default()
                })
                .unwrap();
        }
        session
            .send(BlockFifoRequest {
                opcode: BLOCK_OP_FLUSH,
                flags: REQUEST_GROUP_ITEM | REQUEST_GROUP_LAST,
                reqid: 3,
                group: 7,
                ..Default::default()
            })
            .unwrap();

        let response = session.recv().unwrap();
        assert_eq!(
            response,
            BlockFifoResponse {
                status: STATUS_OK,
                reqid: 3,
                group: 7,
                flags: RESPONSE_DONE,
                count: 4,
                ..Default::default()
            }
        );
        assert_eq!(volume.flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_group_failure_poisons_rest() {
        let (server, volume) = test_server(16);
        let session = server.create_session();
        let buffer = Arc::new(SharedBuffer::new(BLOCK_SIZE));
        let bufid = session.attach_buffer(buffer);

        // Second request is out of range; the flush after it must not run.
        for (reqid, dev_offset) in [(0u32, 0u64), (1, 500)] {
            session
                .send(BlockFifoRequest {
                    opcode: BLOCK_OP_WRITE,
                    flags: REQUEST_GROUP_ITEM,
                    reqid,
                    group: 1,
                    bufid,
                    length: 1,
                    dev_offset,
                    ..Default::default()
                })
                .unwrap();
        }
        session
            .send(BlockFifoRequest {
                opcode: BLOCK_OP_FLUSH,
                flags: REQUEST_GROUP_ITEM | REQUEST_GROUP_LAST,
                reqid: 2,
                group: 1,
                ..Default::default()
            })
            .unwrap();

        let response = session.recv().unwrap();
        assert_eq!(response.status, Status::OutOfRange.to_raw());
        assert_eq!(response.count, 3);
        assert_eq!(volume.flushes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_close_buffer() {
        let (server, _volume) = test_server(16);
        let session = server.create_session();
        let buffer = Arc::new(SharedBuffer::new(BLOCK_SIZE));
        let bufid = session.attach_buffer(buffer);

        let response = session
            .transact(BlockFifoRequest {
                opcode: BLOCK_OP_CLOSE_BUFFER,
                reqid: 1,
                bufid,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, STATUS_OK);

        let response = session
            .transact(BlockFifoRequest {
                opcode: BLOCK_OP_READ,
                reqid: 2,
                bufid,
                length: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.status, Status::BadState.to_raw());
    }

    #[test]
    fn test_shutdown_cancels_sessions() {
        let (server, _volume) = test_server(16);
        let session = server.create_session();
        assert_eq!(server.session_count(), 1);
        server.shutdown();
        assert_eq!(server.session_count(), 0);
        assert!(session.recv().is_err());
    }

    #[test]
    fn test_dropping_proxy_ends_session() {
        let (server, _volume) = test_server(16);
        let session = server.create_session();
        drop(session);
        // The thread exits once it sees the closed channel; shutdown then has
        // nothing left to join.
        while server.session_count() > 0 {
            std::thread::yield_now();
        }
    }
}
