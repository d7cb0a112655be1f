// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vigs_comm: Batching encoder for the VIGS execbuffer protocol.
//!
//! Execbuffer layout while encoding:
//!
//! ```text
//! 0                                  batch header
//! 8                                  command 1
//! ..                                 ...
//! cmd_ptr                            command in progress (cmd_size bytes)
//! cmd_ptr + cmd_size                 free space
//! ```
//!
//! Commands before `cmd_ptr` are complete.  `flush` fills in the batch
//! header, hands the buffer to the provider and moves any in-progress
//! command's bytes back down to just after the batch header.

use std::mem::size_of;

use log::error;
use log::trace;
use log::warn;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::vigs_protocol::*;
use crate::vigs_utils::*;

/// A mapped execbuffer region.  Owned by the encoder from allocation until
/// it is released back to the provider.
pub struct VigsExecbuffer {
    data: Box<[u8]>,
}

impl VigsExecbuffer {
    /// Creates a zero-initialized execbuffer of exactly `size` bytes.
    pub fn new(size: u32) -> VigsExecbuffer {
        VigsExecbuffer {
            data: vec![0; size as usize].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn write_obj<T: AsBytes>(&mut self, offset: usize, obj: &T) -> VigsResult<()> {
        let obj_size = size_of::<T>();
        let end = checked_arithmetic!(offset + obj_size)?;
        checked_range!(end; <= self.data.len())?;
        self.data[offset..end].copy_from_slice(obj.as_bytes());
        Ok(())
    }

    fn read_obj<T: FromBytes>(&self, offset: usize) -> VigsResult<T> {
        self.data
            .get(offset..)
            .and_then(T::read_from_prefix)
            .ok_or(VigsError::ExecbufferOutOfBounds)
    }
}

/// Allocates and executes execbuffers on behalf of the encoder.  Backed by
/// the DRM device in the driver; backed by plain memory in tests.
pub trait VigsExecbufferProvider {
    /// Allocates and maps a zero-initialized region of exactly `size` bytes.
    fn alloc(&mut self, size: u32) -> VigsResult<VigsExecbuffer>;

    /// Drops a mapped region.
    fn release(&mut self, _execbuffer: VigsExecbuffer) {}

    /// Hands the filled region, up through the size declared in its batch
    /// header, to the device for execution.
    fn submit(&mut self, execbuffer: &VigsExecbuffer) -> VigsResult<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum VigsCmdState {
    /// No command in progress.
    Idle,
    /// A command's header is reserved at `cmd_ptr` and `size` bytes of it
    /// (header included) have been written so far.
    Open { cmd: u32, size: u32 },
    /// Allocation failed mid-command; the command is dropped on done.
    OpenFailed { cmd: u32 },
}

/// Encodes drawing commands into execbuffer batches.
///
/// Commands are built with a prepare/append/done sequence and accumulate in
/// a single execbuffer until `flush` submits them to the provider.  The
/// encoder is single-threaded; callers serialize all operations.
pub struct VigsComm {
    provider: Box<dyn VigsExecbufferProvider>,

    /// Execbuffer will not grow beyond this.
    max_size: u32,

    /// Execbuffer that holds command data.
    execbuffer: Option<VigsExecbuffer>,

    /// Offset of the current command's request header.  Always at least
    /// one batch header into the buffer.
    cmd_ptr: usize,

    state: VigsCmdState,
}

impl VigsComm {
    /// Creates an encoder speaking `VIGS_PROTOCOL_VERSION`.
    /// `protocol_version` is the version reported by the kernel side;
    /// construction is refused on a mismatch.
    pub fn new(
        provider: Box<dyn VigsExecbufferProvider>,
        protocol_version: u32,
        max_size: u32,
    ) -> VigsResult<VigsComm> {
        if protocol_version != VIGS_PROTOCOL_VERSION {
            error!(
                "VIGS protocol version mismatch: actual {}, expected {}",
                protocol_version, VIGS_PROTOCOL_VERSION
            );
            return Err(VigsError::ProtocolVersionMismatch {
                actual: protocol_version,
                expected: VIGS_PROTOCOL_VERSION,
            });
        }
        Ok(VigsComm {
            provider,
            max_size,
            execbuffer: None,
            cmd_ptr: size_of::<VigsBatchHeader>(),
            state: VigsCmdState::Idle,
        })
    }

    fn have_cmds(&self) -> bool {
        self.execbuffer.is_some() && self.cmd_ptr > size_of::<VigsBatchHeader>()
    }

    /// Tries to allocate `size` additional bytes for the current command
    /// and returns their offset.  Grows the execbuffer if needed, copying
    /// complete commands and the in-progress command's bytes forward.
    fn execbuffer_realloc(&mut self, size: u32) -> VigsResult<usize> {
        // cmd_ptr covers the batch header, so this also reserves it on the
        // very first allocation.
        let complete_size = self.cmd_ptr as u32;
        let cmd_size = match self.state {
            VigsCmdState::Open { size, .. } => size,
            _ => 0,
        };
        let used_size = checked_arithmetic!(complete_size + cmd_size)?;
        let new_size = checked_arithmetic!(used_size + size)?;

        if let Some(execbuffer) = &self.execbuffer {
            if new_size <= execbuffer.size() {
                return Ok(self.cmd_ptr + cmd_size as usize);
            }
        }

        if new_size > self.max_size {
            warn!(
                "not allocating execbuffer of {} bytes, max allowed is {}",
                new_size, self.max_size
            );
            return Err(VigsError::ExecbufferExceedsMax {
                size: new_size,
                max_size: self.max_size,
            });
        }

        let mut new_execbuffer = match self.provider.alloc(new_size) {
            Ok(execbuffer) => execbuffer,
            Err(e) => {
                error!("unable to allocate {} byte execbuffer: {}", new_size, e);
                return Err(e);
            }
        };

        trace!("allocated {} byte execbuffer", new_size);

        if let Some(old_execbuffer) = self.execbuffer.take() {
            let used_size = used_size as usize;
            new_execbuffer.bytes_mut()[..used_size]
                .copy_from_slice(&old_execbuffer.bytes()[..used_size]);
            self.provider.release(old_execbuffer);
        }

        self.execbuffer = Some(new_execbuffer);

        Ok(self.cmd_ptr + cmd_size as usize)
    }

    /// Like `execbuffer_realloc`, but flushes complete commands and retries
    /// once on memory shortage.  Marks the current command as failed when
    /// no room can be found.
    fn cmd_alloc(&mut self, size: u32) -> VigsResult<usize> {
        let result = match self.execbuffer_realloc(size) {
            Ok(offset) => Ok(offset),
            Err(e) if !self.have_cmds() => {
                // The current command is the only occupant, so there is
                // nothing to flush.
                Err(e)
            }
            Err(_) => {
                // Flush complete commands and try again.  The outcome of
                // the flush doesn't matter here.
                let _ = self.flush();
                self.execbuffer_realloc(size)
            }
        };
        if result.is_err() {
            if let VigsCmdState::Open { cmd, .. } = self.state {
                self.state = VigsCmdState::OpenFailed { cmd };
            }
        }
        result
    }

    /// Reserves a request header plus `request_size` payload bytes for a
    /// new command and returns the payload offset.
    fn cmd_prepare(&mut self, cmd: u32, request_size: u32) -> VigsResult<usize> {
        if self.state != VigsCmdState::Idle {
            error!(
                "cannot prepare {}, another command already in progress, logic error",
                vigs_cmd_str(cmd)
            );
            return Err(VigsError::CommandInProgress);
        }

        let header_size = size_of::<VigsRequestHeader>() as u32;
        let total_size = checked_arithmetic!(header_size + request_size)?;
        let header_offset = self.cmd_alloc(total_size)?;

        self.state = VigsCmdState::Open {
            cmd,
            size: total_size,
        };

        Ok(header_offset + size_of::<VigsRequestHeader>())
    }

    /// Reserves `entry_size` more payload bytes for the command in progress
    /// and returns their offset.
    fn cmd_append(&mut self, cmd: u32, entry_size: u32) -> VigsResult<usize> {
        let cmd_size = match self.state {
            VigsCmdState::Idle => {
                error!(
                    "cannot append to {}, no command in progress, logic error",
                    vigs_cmd_str(cmd)
                );
                return Err(VigsError::NoCommandInProgress);
            }
            VigsCmdState::Open { cmd: current, .. } | VigsCmdState::OpenFailed { cmd: current }
                if current != cmd =>
            {
                error!(
                    "{} in progress, cannot append to {}, logic error",
                    vigs_cmd_str(current),
                    vigs_cmd_str(cmd)
                );
                return Err(VigsError::CommandMismatch {
                    expected: current,
                    actual: cmd,
                });
            }
            VigsCmdState::OpenFailed { .. } => {
                error!("allocation failed, not appending");
                return Err(VigsError::AllocFailed);
            }
            VigsCmdState::Open { size, .. } => size,
        };

        let offset = self.cmd_alloc(entry_size)?;

        self.state = VigsCmdState::Open {
            cmd,
            size: cmd_size + entry_size,
        };

        Ok(offset)
    }

    /// Finalizes the command in progress by writing its request header, or
    /// drops it entirely if allocation failed along the way.
    fn cmd_done(&mut self, cmd: u32) -> VigsResult<()> {
        match self.state {
            VigsCmdState::Idle => {
                error!(
                    "cannot finish {}, no command in progress, logic error",
                    vigs_cmd_str(cmd)
                );
                Err(VigsError::NoCommandInProgress)
            }
            VigsCmdState::Open { cmd: current, .. } | VigsCmdState::OpenFailed { cmd: current }
                if current != cmd =>
            {
                error!(
                    "{} in progress, cannot finish {}, logic error",
                    vigs_cmd_str(current),
                    vigs_cmd_str(cmd)
                );
                Err(VigsError::CommandMismatch {
                    expected: current,
                    actual: cmd,
                })
            }
            VigsCmdState::OpenFailed { .. } => {
                error!("allocation failed, dropping {}", vigs_cmd_str(cmd));
                self.state = VigsCmdState::Idle;
                Ok(())
            }
            VigsCmdState::Open { size, .. } => {
                let header_size = size_of::<VigsRequestHeader>() as u32;
                let payload_size = checked_arithmetic!(size - header_size)?;
                let request_header = VigsRequestHeader {
                    cmd,
                    size: payload_size,
                };
                let cmd_ptr = self.cmd_ptr;
                let execbuffer = self
                    .execbuffer
                    .as_mut()
                    .ok_or(VigsError::NoCommandInProgress)?;
                execbuffer.write_obj(cmd_ptr, &request_header)?;
                self.cmd_ptr += size as usize;
                self.state = VigsCmdState::Idle;
                Ok(())
            }
        }
    }

    fn write_request<T: AsBytes>(&mut self, offset: usize, request: &T) -> VigsResult<()> {
        match self.execbuffer.as_mut() {
            Some(execbuffer) => execbuffer.write_obj(offset, request),
            None => Err(VigsError::ExecbufferOutOfBounds),
        }
    }

    /// Increments `num_entries` of the request in progress, read back from
    /// the payload right after the request header at `cmd_ptr`.
    fn bump_entries<T: VigsEntryRequest>(&mut self) -> VigsResult<()> {
        let offset = self.cmd_ptr + size_of::<VigsRequestHeader>();
        let execbuffer = self
            .execbuffer
            .as_mut()
            .ok_or(VigsError::NoCommandInProgress)?;
        let mut request: T = execbuffer.read_obj(offset)?;
        *request.num_entries_mut() += 1;
        execbuffer.write_obj(offset, &request)
    }

    fn discard_open_cmd(&mut self) {
        if let VigsCmdState::Open { cmd, .. } = self.state {
            self.state = VigsCmdState::OpenFailed { cmd };
        }
    }

    /// Submits all complete commands to the provider and resets encoding
    /// state for the next batch.  A command still in progress is carried
    /// over into the new batch.
    ///
    /// Returns false if submission failed; the batch is considered consumed
    /// either way.
    pub fn flush(&mut self) -> bool {
        if !self.have_cmds() {
            return true;
        }

        let batch_header_size = size_of::<VigsBatchHeader>();
        let batch_header = VigsBatchHeader {
            fence_seq: 0,
            size: (self.cmd_ptr - batch_header_size) as u32,
        };
        let cmd_ptr = self.cmd_ptr;

        let execbuffer = match self.execbuffer.as_mut() {
            Some(execbuffer) => execbuffer,
            None => return true,
        };

        let mut result = true;

        if let Err(e) = execbuffer.write_obj(0, &batch_header) {
            error!("unable to write batch header: {}", e);
            result = false;
        } else if let Err(e) = self.provider.submit(execbuffer) {
            error!("{}", e);
            result = false;
        }

        if let VigsCmdState::Open { size, .. } = self.state {
            let size = size as usize;
            debug_assert!(cmd_ptr + size <= execbuffer.bytes().len());
            execbuffer
                .bytes_mut()
                .copy_within(cmd_ptr..cmd_ptr + size, batch_header_size);
        }

        self.cmd_ptr = batch_header_size;

        result
    }

    /// Encodes an update-VRAM command: the host copies `sfc_id`'s pixels
    /// from GPU storage into VRAM.
    pub fn update_vram(&mut self, sfc_id: u32) {
        let offset = match self.cmd_prepare(
            VIGS_CMD_UPDATE_VRAM,
            size_of::<VigsUpdateVramRequest>() as u32,
        ) {
            Ok(offset) => offset,
            Err(_) => return,
        };

        let request = VigsUpdateVramRequest { sfc_id };
        if let Err(e) = self.write_request(offset, &request) {
            error!("unable to write update_vram request: {}", e);
            self.discard_open_cmd();
        }

        let _ = self.cmd_done(VIGS_CMD_UPDATE_VRAM);
    }

    /// Encodes an update-GPU command: the host copies the dirty rectangles
    /// of `sfc_id` from VRAM into GPU storage.
    pub fn update_gpu(&mut self, sfc_id: u32, entries: &[VigsRect]) {
        let num_entries = entries.len() as u32;
        let request_size = size_of::<VigsUpdateGpuRequest>() as u32;
        let entry_size = size_of::<VigsRect>() as u32;

        let total_size = match checked_arithmetic!(num_entries * entry_size)
            .and_then(|entries_size| checked_arithmetic!(request_size + entries_size))
        {
            Ok(total_size) => total_size,
            Err(e) => {
                error!("update_gpu request too large: {}", e);
                return;
            }
        };

        let offset = match self.cmd_prepare(VIGS_CMD_UPDATE_GPU, total_size) {
            Ok(offset) => offset,
            Err(_) => return,
        };

        let request = VigsUpdateGpuRequest {
            sfc_id,
            num_entries,
        };
        if let Err(e) = self.write_request(offset, &request) {
            error!("unable to write update_gpu request: {}", e);
            self.discard_open_cmd();
        } else {
            for (i, entry) in entries.iter().enumerate() {
                let entry_offset = offset + request_size as usize + i * entry_size as usize;
                if let Err(e) = self.write_request(entry_offset, entry) {
                    error!("unable to write update_gpu entry: {}", e);
                    self.discard_open_cmd();
                    break;
                }
            }
        }

        let _ = self.cmd_done(VIGS_CMD_UPDATE_GPU);
    }

    /// Starts a copy command from `src_id` to `dst_id`.  Rectangles are
    /// added with `copy_entry` and the command is finished by `copy_end`.
    pub fn copy_begin(&mut self, src_id: u32, dst_id: u32) {
        let offset = match self.cmd_prepare(VIGS_CMD_COPY, size_of::<VigsCopyRequest>() as u32) {
            Ok(offset) => offset,
            Err(_) => return,
        };

        let request = VigsCopyRequest {
            src_id,
            dst_id,
            num_entries: 0,
        };
        if let Err(e) = self.write_request(offset, &request) {
            error!("unable to write copy request: {}", e);
            self.discard_open_cmd();
        }
    }

    /// Adds one rectangle to the copy command in progress.
    pub fn copy_entry(&mut self, src_x: i32, src_y: i32, dst_x: i32, dst_y: i32, w: u32, h: u32) {
        let offset = match self.cmd_append(VIGS_CMD_COPY, size_of::<VigsCopyEntry>() as u32) {
            Ok(offset) => offset,
            Err(_) => return,
        };

        let entry = VigsCopyEntry {
            from: VigsPoint { x: src_x, y: src_y },
            to: VigsPoint { x: dst_x, y: dst_y },
            size: VigsSize { w, h },
        };
        if let Err(e) = self.write_request(offset, &entry) {
            error!("unable to write copy entry: {}", e);
            self.discard_open_cmd();
            return;
        }

        if let Err(e) = self.bump_entries::<VigsCopyRequest>() {
            error!("unable to update copy entry count: {}", e);
            self.discard_open_cmd();
        }
    }

    /// Finishes the copy command in progress.
    pub fn copy_end(&mut self) {
        let _ = self.cmd_done(VIGS_CMD_COPY);
    }

    /// Starts a solid-fill command on `sfc_id` with `color`.  Rectangles
    /// are added with `solid_fill_entry` and the command is finished by
    /// `solid_fill_end`.
    pub fn solid_fill_begin(&mut self, sfc_id: u32, color: u32) {
        let offset =
            match self.cmd_prepare(VIGS_CMD_SOLID_FILL, size_of::<VigsSolidFillRequest>() as u32) {
                Ok(offset) => offset,
                Err(_) => return,
            };

        let request = VigsSolidFillRequest {
            sfc_id,
            color,
            num_entries: 0,
        };
        if let Err(e) = self.write_request(offset, &request) {
            error!("unable to write solid_fill request: {}", e);
            self.discard_open_cmd();
        }
    }

    /// Adds the rectangle `(x1, y1)`..`(x2, y2)` (exclusive) to the
    /// solid-fill command in progress.
    pub fn solid_fill_entry(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) {
        debug_assert!(x2 > x1);
        debug_assert!(y2 > y1);

        let offset = match self.cmd_append(VIGS_CMD_SOLID_FILL, size_of::<VigsRect>() as u32) {
            Ok(offset) => offset,
            Err(_) => return,
        };

        let entry = VigsRect {
            pos: VigsPoint { x: x1, y: y1 },
            size: VigsSize {
                w: x2.wrapping_sub(x1) as u32,
                h: y2.wrapping_sub(y1) as u32,
            },
        };
        if let Err(e) = self.write_request(offset, &entry) {
            error!("unable to write solid_fill entry: {}", e);
            self.discard_open_cmd();
            return;
        }

        if let Err(e) = self.bump_entries::<VigsSolidFillRequest>() {
            error!("unable to update solid_fill entry count: {}", e);
            self.discard_open_cmd();
        }
    }

    /// Finishes the solid-fill command in progress.
    pub fn solid_fill_end(&mut self) {
        let _ = self.cmd_done(VIGS_CMD_SOLID_FILL);
    }
}

impl Drop for VigsComm {
    fn drop(&mut self) {
        if let Some(execbuffer) = self.execbuffer.take() {
            self.provider.release(execbuffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const REQUEST_HEADER_SIZE: usize = size_of::<VigsRequestHeader>();

    #[derive(Default)]
    struct ProviderState {
        allocs: Vec<u32>,
        releases: Vec<u32>,
        submits: Vec<Vec<u8>>,
        refuse_alloc: bool,
        fail_submit: bool,
    }

    struct TestProvider {
        state: Rc<RefCell<ProviderState>>,
    }

    impl VigsExecbufferProvider for TestProvider {
        fn alloc(&mut self, size: u32) -> VigsResult<VigsExecbuffer> {
            let mut state = self.state.borrow_mut();
            if state.refuse_alloc {
                return Err(VigsError::AllocFailed);
            }
            state.allocs.push(size);
            Ok(VigsExecbuffer::new(size))
        }

        fn release(&mut self, execbuffer: VigsExecbuffer) {
            self.state.borrow_mut().releases.push(execbuffer.size());
        }

        fn submit(&mut self, execbuffer: &VigsExecbuffer) -> VigsResult<()> {
            let mut state = self.state.borrow_mut();
            if state.fail_submit {
                return Err(VigsError::SubmitFailed(5));
            }
            state.submits.push(execbuffer.bytes().to_vec());
            Ok(())
        }
    }

    fn new_comm(max_size: u32) -> (VigsComm, Rc<RefCell<ProviderState>>) {
        let state = Rc::new(RefCell::new(ProviderState::default()));
        let provider = Box::new(TestProvider {
            state: state.clone(),
        });
        let comm = VigsComm::new(provider, VIGS_PROTOCOL_VERSION, max_size).unwrap();
        (comm, state)
    }

    #[test]
    fn version_mismatch_refused() {
        let state = Rc::new(RefCell::new(ProviderState::default()));
        let provider = Box::new(TestProvider {
            state: state.clone(),
        });
        let err = VigsComm::new(provider, VIGS_PROTOCOL_VERSION + 1, 1024)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            VigsError::ProtocolVersionMismatch {
                expected: VIGS_PROTOCOL_VERSION,
                ..
            }
        ));
    }

    #[test]
    fn update_vram_round_trip() {
        let (mut comm, state) = new_comm(1024);

        comm.update_vram(7);
        assert!(comm.flush());

        let state = state.borrow();
        assert_eq!(state.submits.len(), 1);
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(batch.header.fence_seq, 0);
        assert_eq!(batch.header.size, (REQUEST_HEADER_SIZE + 4) as u32);
        assert_eq!(
            batch.commands,
            vec![VigsCommand::UpdateVram(VigsUpdateVramRequest { sfc_id: 7 })]
        );
    }

    #[test]
    fn copy_two_entries() {
        let (mut comm, state) = new_comm(1024);

        comm.copy_begin(1, 2);
        comm.copy_entry(0, 0, 10, 10, 5, 5);
        comm.copy_entry(1, 1, 11, 11, 5, 5);
        comm.copy_end();
        assert!(comm.flush());

        let state = state.borrow();
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            batch.commands,
            vec![VigsCommand::Copy(
                VigsCopyRequest {
                    src_id: 1,
                    dst_id: 2,
                    num_entries: 2,
                },
                vec![
                    VigsCopyEntry {
                        from: VigsPoint { x: 0, y: 0 },
                        to: VigsPoint { x: 10, y: 10 },
                        size: VigsSize { w: 5, h: 5 },
                    },
                    VigsCopyEntry {
                        from: VigsPoint { x: 1, y: 1 },
                        to: VigsPoint { x: 11, y: 11 },
                        size: VigsSize { w: 5, h: 5 },
                    },
                ],
            )]
        );
    }

    #[test]
    fn batch_framing_over_mixed_commands() {
        let (mut comm, state) = new_comm(4096);

        comm.update_vram(1);
        comm.update_gpu(
            2,
            &[
                VigsRect {
                    pos: VigsPoint { x: 0, y: 0 },
                    size: VigsSize { w: 32, h: 32 },
                },
                VigsRect {
                    pos: VigsPoint { x: 32, y: 0 },
                    size: VigsSize { w: 32, h: 32 },
                },
            ],
        );
        comm.copy_begin(2, 3);
        comm.copy_entry(0, 0, 8, 8, 16, 16);
        comm.copy_end();
        comm.solid_fill_begin(3, 0xff00ff00);
        comm.solid_fill_entry(0, 0, 4, 4);
        comm.solid_fill_entry(4, 4, 8, 8);
        comm.solid_fill_end();
        assert!(comm.flush());

        let state = state.borrow();
        assert_eq!(state.submits.len(), 1);
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();

        // 12 (update_vram) + 48 (update_gpu) + 44 (copy) + 52 (solid_fill)
        assert_eq!(batch.header.size, 156);
        assert_eq!(batch.commands.len(), 4);

        match &batch.commands[1] {
            VigsCommand::UpdateGpu(request, entries) => {
                assert_eq!(request.sfc_id, 2);
                assert_eq!(request.num_entries, 2);
                assert_eq!(entries[1].pos, VigsPoint { x: 32, y: 0 });
            }
            other => panic!("expected update_gpu, got {:?}", other),
        }
        match &batch.commands[3] {
            VigsCommand::SolidFill(request, entries) => {
                assert_eq!(request.sfc_id, 3);
                assert_eq!(request.color, 0xff00ff00);
                assert_eq!(request.num_entries, 2);
                assert_eq!(
                    entries[0],
                    VigsRect {
                        pos: VigsPoint { x: 0, y: 0 },
                        size: VigsSize { w: 4, h: 4 },
                    }
                );
            }
            other => panic!("expected solid_fill, got {:?}", other),
        }
    }

    #[test]
    fn growth_preserves_encoded_data() {
        // Every entry outgrows the buffer, forcing a realloc per append.
        let (mut comm, state) = new_comm(4096);

        comm.update_vram(1);
        comm.copy_begin(5, 6);
        for i in 0..8 {
            comm.copy_entry(i, i, i + 100, i + 100, 10, 10);
        }
        comm.copy_end();
        assert!(comm.flush());

        let state = state.borrow();
        assert!(state.allocs.len() > 2);
        assert_eq!(state.releases.len(), state.allocs.len() - 1);

        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            batch.commands[0],
            VigsCommand::UpdateVram(VigsUpdateVramRequest { sfc_id: 1 })
        );
        match &batch.commands[1] {
            VigsCommand::Copy(request, entries) => {
                assert_eq!(request.num_entries, 8);
                for (i, entry) in entries.iter().enumerate() {
                    let i = i as i32;
                    assert_eq!(entry.from, VigsPoint { x: i, y: i });
                    assert_eq!(
                        entry.to,
                        VigsPoint {
                            x: i + 100,
                            y: i + 100,
                        }
                    );
                }
            }
            other => panic!("expected copy, got {:?}", other),
        }
    }

    #[test]
    fn solid_fill_extent_spanning_coordinate_range() {
        // A rectangle from a negative origin to i32::MAX has an extent
        // wider than i32; the wire width is still a plain u32.
        let (mut comm, state) = new_comm(1024);

        comm.solid_fill_begin(1, 0);
        comm.solid_fill_entry(-2, -2, i32::MAX, i32::MAX);
        comm.solid_fill_end();
        assert!(comm.flush());

        let state = state.borrow();
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        match &batch.commands[0] {
            VigsCommand::SolidFill(request, entries) => {
                assert_eq!(request.num_entries, 1);
                assert_eq!(entries[0].pos, VigsPoint { x: -2, y: -2 });
                assert_eq!(
                    entries[0].size,
                    VigsSize {
                        w: 0x8000_0001,
                        h: 0x8000_0001,
                    }
                );
            }
            other => panic!("expected solid_fill, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_append_rejected() {
        let (mut comm, state) = new_comm(1024);

        comm.solid_fill_begin(1, 0xffffffff);
        comm.solid_fill_entry(0, 0, 4, 4);

        let before = comm.state;
        comm.copy_entry(0, 0, 1, 1, 2, 2);
        assert_eq!(comm.state, before);

        comm.solid_fill_entry(4, 4, 8, 8);
        comm.solid_fill_end();
        assert!(comm.flush());

        let state = state.borrow();
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        match &batch.commands[0] {
            VigsCommand::SolidFill(request, entries) => {
                assert_eq!(request.num_entries, 2);
                assert_eq!(entries.len(), 2);
            }
            other => panic!("expected solid_fill, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_done_rejected() {
        let (mut comm, _state) = new_comm(1024);

        comm.solid_fill_begin(1, 0);
        let err = comm.cmd_done(VIGS_CMD_COPY).unwrap_err();
        assert!(matches!(
            err,
            VigsError::CommandMismatch {
                expected: VIGS_CMD_SOLID_FILL,
                actual: VIGS_CMD_COPY,
            }
        ));
        assert!(matches!(comm.state, VigsCmdState::Open { .. }));
    }

    #[test]
    fn append_on_idle_rejected() {
        let (mut comm, state) = new_comm(1024);

        comm.copy_entry(0, 0, 1, 1, 2, 2);
        assert_eq!(comm.state, VigsCmdState::Idle);
        assert!(comm.flush());
        assert!(state.borrow().submits.is_empty());
    }

    #[test]
    fn prepare_while_open_rejected() {
        let (mut comm, state) = new_comm(1024);

        comm.copy_begin(1, 2);
        comm.update_vram(3);
        comm.solid_fill_begin(4, 0);
        comm.copy_end();
        assert!(comm.flush());

        let state = state.borrow();
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            batch.commands,
            vec![VigsCommand::Copy(
                VigsCopyRequest {
                    src_id: 1,
                    dst_id: 2,
                    num_entries: 0,
                },
                vec![],
            )]
        );
    }

    #[test]
    fn alloc_failure_discards_command() {
        // Room for the copy request plus one entry, not two.
        let (mut comm, state) = new_comm(64);

        comm.copy_begin(1, 2);
        comm.copy_entry(0, 0, 1, 1, 2, 2);
        comm.copy_entry(3, 3, 4, 4, 5, 5);
        assert_eq!(
            comm.state,
            VigsCmdState::OpenFailed {
                cmd: VIGS_CMD_COPY
            }
        );
        comm.copy_entry(6, 6, 7, 7, 8, 8);
        comm.copy_end();
        assert_eq!(comm.state, VigsCmdState::Idle);

        assert!(comm.flush());
        assert!(state.borrow().submits.is_empty());

        // The encoder stays usable.
        comm.update_vram(7);
        assert!(comm.flush());

        let state = state.borrow();
        assert_eq!(state.submits.len(), 1);
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            batch.commands,
            vec![VigsCommand::UpdateVram(VigsUpdateVramRequest { sfc_id: 7 })]
        );
    }

    #[test]
    fn provider_alloc_refusal_leaves_idle() {
        let (mut comm, state) = new_comm(1024);

        state.borrow_mut().refuse_alloc = true;
        comm.update_vram(1);
        assert_eq!(comm.state, VigsCmdState::Idle);
        assert!(comm.flush());
        assert!(state.borrow().submits.is_empty());

        state.borrow_mut().refuse_alloc = false;
        comm.update_vram(2);
        assert!(comm.flush());
        assert_eq!(state.borrow().submits.len(), 1);
    }

    #[test]
    fn shortage_flushes_complete_commands() {
        // max_size fits update_vram plus a copy with two entries; the third
        // entry only fits after the update_vram command is flushed out.
        let (mut comm, state) = new_comm(100);

        comm.update_vram(7);
        comm.copy_begin(1, 2);
        comm.copy_entry(0, 0, 1, 1, 2, 2);
        comm.copy_entry(3, 3, 4, 4, 5, 5);
        comm.copy_entry(6, 6, 7, 7, 8, 8);
        comm.copy_end();
        assert!(comm.flush());

        let state = state.borrow();
        assert_eq!(state.submits.len(), 2);

        let first = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            first.commands,
            vec![VigsCommand::UpdateVram(VigsUpdateVramRequest { sfc_id: 7 })]
        );

        let second = VigsBatch::decode(&state.submits[1]).unwrap();
        match &second.commands[0] {
            VigsCommand::Copy(request, entries) => {
                assert_eq!(request.num_entries, 3);
                assert_eq!(entries[2].from, VigsPoint { x: 6, y: 6 });
            }
            other => panic!("expected copy, got {:?}", other),
        }
    }

    #[test]
    fn open_command_carried_across_flush() {
        let (mut comm, state) = new_comm(1024);

        comm.update_vram(1);
        comm.copy_begin(5, 6);
        comm.copy_entry(0, 0, 1, 1, 2, 2);
        assert!(comm.flush());
        comm.copy_entry(3, 3, 4, 4, 5, 5);
        comm.copy_end();
        assert!(comm.flush());

        let state = state.borrow();
        assert_eq!(state.submits.len(), 2);

        let first = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            first.commands,
            vec![VigsCommand::UpdateVram(VigsUpdateVramRequest { sfc_id: 1 })]
        );

        let second = VigsBatch::decode(&state.submits[1]).unwrap();
        assert_eq!(
            second.commands,
            vec![VigsCommand::Copy(
                VigsCopyRequest {
                    src_id: 5,
                    dst_id: 6,
                    num_entries: 2,
                },
                vec![
                    VigsCopyEntry {
                        from: VigsPoint { x: 0, y: 0 },
                        to: VigsPoint { x: 1, y: 1 },
                        size: VigsSize { w: 2, h: 2 },
                    },
                    VigsCopyEntry {
                        from: VigsPoint { x: 3, y: 3 },
                        to: VigsPoint { x: 4, y: 4 },
                        size: VigsSize { w: 5, h: 5 },
                    },
                ],
            )]
        );
    }

    #[test]
    fn empty_flush_skips_submit() {
        let (mut comm, state) = new_comm(1024);

        assert!(comm.flush());
        assert!(state.borrow().submits.is_empty());

        comm.update_vram(1);
        assert!(comm.flush());
        assert!(comm.flush());
        assert_eq!(state.borrow().submits.len(), 1);
    }

    #[test]
    fn submit_failure_still_resets() {
        let (mut comm, state) = new_comm(1024);

        state.borrow_mut().fail_submit = true;
        comm.update_vram(1);
        assert!(!comm.flush());
        assert!(state.borrow().submits.is_empty());

        state.borrow_mut().fail_submit = false;
        comm.update_vram(2);
        assert!(comm.flush());

        let state = state.borrow();
        let batch = VigsBatch::decode(&state.submits[0]).unwrap();
        assert_eq!(
            batch.commands,
            vec![VigsCommand::UpdateVram(VigsUpdateVramRequest { sfc_id: 2 })]
        );
    }

    #[test]
    fn drop_releases_execbuffer() {
        let (mut comm, state) = new_comm(1024);

        comm.update_vram(1);
        drop(comm);

        assert_eq!(state.borrow().releases.len(), 1);
    }
}
