// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    BlockFifoRequest, BlockFifoResponse, Interface, SharedBuffer, Status, BLOCK_OP_CLOSE_BUFFER,
    BLOCK_OP_FLUSH, BLOCK_OP_READ, BLOCK_OP_TRIM, BLOCK_OP_WRITE, REQUEST_GROUP_ITEM,
    REQUEST_GROUP_LAST, RESPONSE_DONE, STATUS_OK,
};
use crossbeam::channel::{select, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

struct GroupState {
    status: u32,
    count: u32,
}

pub(crate) struct Session<I> {
    interface: Arc<I>,
    buffers: Arc<Mutex<HashMap<u16, Arc<SharedBuffer>>>>,
    groups: HashMap<u16, GroupState>,
}

impl<I: Interface> Session<I> {
    pub fn new(
        interface: Arc<I>,
        buffers: Arc<Mutex<HashMap<u16, Arc<SharedBuffer>>>>,
    ) -> Self {
        Self { interface, buffers, groups: HashMap::new() }
    }

    /// Serves the FIFO until the client closes it or a stop is signalled.
    pub fn run(
        mut self,
        requests: Receiver<BlockFifoRequest>,
        responses: Sender<BlockFifoResponse>,
        stop: Receiver<()>,
    ) {
        loop {
            let request = select! {
                recv(requests) -> request => match request {
                    Ok(request) => request,
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            };
            if let Some(response) = self.handle_request(request) {
                if responses.send(response).is_err() {
                    break;
                }
            }
        }
        // Outstanding buffers are released with the session.
        self.buffers.lock().unwrap().clear();
    }

    fn handle_request(&mut self, request: BlockFifoRequest) -> Option<BlockFifoResponse> {
        let in_group = request.flags & REQUEST_GROUP_ITEM != 0;
        let status = if in_group
            && self.groups.get(&request.group).map_or(false, |g| g.status != STATUS_OK)
        {
            // The group already failed; skip the work but keep counting.
            self.groups.get(&request.group).unwrap().status
        } else {
            match self.execute(&request) {
                Ok(()) => STATUS_OK,
                Err(status) => status.to_raw(),
            }
        };

        if !in_group {
            return Some(BlockFifoResponse {
                status,
                reqid: request.reqid,
                flags: RESPONSE_DONE,
                count: 1,
                ..Default::default()
            });
        }

        let group = self.groups.entry(request.group).or_insert(GroupState {
            status: STATUS_OK,
            count: 0,
        });
        group.count += 1;
        if group.status == STATUS_OK {
            group.status = status;
        }
        if request.flags & REQUEST_GROUP_LAST == 0 {
            return None;
        }
        let group = self.groups.remove(&request.group).unwrap();
        Some(BlockFifoResponse {
            status: group.status,
            reqid: request.reqid,
            group: request.group,
            flags: RESPONSE_DONE,
            count: group.count,
            ..Default::default()
        })
    }

    fn execute(&mut self, request: &BlockFifoRequest) -> Result<(), Status> {
        match request.opcode {
            BLOCK_OP_READ => {
                let buffer = self.buffer(request.bufid)?;
                self.interface.read(
                    request.dev_offset,
                    request.length,
                    &buffer,
                    request.buf_offset,
                )
            }
            BLOCK_OP_WRITE => {
                let buffer = self.buffer(request.bufid)?;
                self.interface.write(
                    request.dev_offset,
                    request.length,
                    &buffer,
                    request.buf_offset,
                )
            }
            BLOCK_OP_FLUSH => self.interface.flush(),
            BLOCK_OP_TRIM => self.interface.trim(request.dev_offset, request.length),
            BLOCK_OP_CLOSE_BUFFER => {
                self.buffers.lock().unwrap().remove(&request.bufid).map(|_| ()).ok_or(Status::BadState)
            }
            opcode => {
                warn!(opcode, "Unknown FIFO opcode");
                Err(Status::NotSupported)
            }
        }
    }

    fn buffer(&self, bufid: u16) -> Result<Arc<SharedBuffer>, Status> {
        self.buffers.lock().unwrap().get(&bufid).cloned().ok_or(Status::BadState)
    }
}
