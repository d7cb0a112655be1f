// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vigs_protocol: Wire layout of the VIGS execbuffer protocol, defined
//! exactly once and shared by the encoder and the decoder.  All fields are
//! host-endian fixed-width 32-bit integers; the kernel-side decoder depends
//! on the exact field order and sizes.

use std::mem::size_of;

use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

/// Protocol version spoken by this encoder.  The kernel reports its own
/// version at device open; the encoder refuses to run on a mismatch.
pub const VIGS_PROTOCOL_VERSION: u32 = 12;

/* batch commands */
pub const VIGS_CMD_UPDATE_VRAM: u32 = 0x06;
pub const VIGS_CMD_UPDATE_GPU: u32 = 0x07;
pub const VIGS_CMD_COPY: u32 = 0x08;
pub const VIGS_CMD_SOLID_FILL: u32 = 0x09;

pub fn vigs_cmd_str(cmd: u32) -> &'static str {
    match cmd {
        VIGS_CMD_UPDATE_VRAM => "VIGS_CMD_UPDATE_VRAM",
        VIGS_CMD_UPDATE_GPU => "VIGS_CMD_UPDATE_GPU",
        VIGS_CMD_COPY => "VIGS_CMD_COPY",
        VIGS_CMD_SOLID_FILL => "VIGS_CMD_SOLID_FILL",
        _ => "UNKNOWN",
    }
}

/// Leads every batch.  `fence_seq` is always written as 0 and is owned by
/// the host from submission on.  `size` counts the bytes of all commands
/// following the header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsBatchHeader {
    pub fence_seq: u32,
    pub size: u32,
}

/// Leads every command.  `size` counts the payload bytes following this
/// header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsRequestHeader {
    pub cmd: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsPoint {
    pub x: i32,
    pub y: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsSize {
    pub w: u32,
    pub h: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsRect {
    pub pos: VigsPoint,
    pub size: VigsSize,
}

/// One repeated record of a VIGS_CMD_COPY command.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsCopyEntry {
    pub from: VigsPoint,
    pub to: VigsPoint,
    pub size: VigsSize,
}

/* VIGS_CMD_UPDATE_VRAM */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsUpdateVramRequest {
    pub sfc_id: u32,
}

/* VIGS_CMD_UPDATE_GPU: followed by `num_entries` VigsRect records */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsUpdateGpuRequest {
    pub sfc_id: u32,
    pub num_entries: u32,
}

/* VIGS_CMD_COPY: followed by `num_entries` VigsCopyEntry records */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsCopyRequest {
    pub src_id: u32,
    pub dst_id: u32,
    pub num_entries: u32,
}

/* VIGS_CMD_SOLID_FILL: followed by `num_entries` VigsRect records */
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct VigsSolidFillRequest {
    pub sfc_id: u32,
    pub color: u32,
    pub num_entries: u32,
}

/// A request whose payload ends with a run of repeated entry records.  The
/// encoder reads the count back through this accessor when appending.
pub trait VigsEntryRequest: AsBytes + FromBytes + Copy {
    fn num_entries_mut(&mut self) -> &mut u32;
}

impl VigsEntryRequest for VigsCopyRequest {
    fn num_entries_mut(&mut self) -> &mut u32 {
        &mut self.num_entries
    }
}

impl VigsEntryRequest for VigsSolidFillRequest {
    fn num_entries_mut(&mut self) -> &mut u32 {
        &mut self.num_entries
    }
}

/// An error indicating something went wrong decoding a `VigsCommand`.
#[derive(Error, Debug)]
pub enum VigsDecodeError {
    /// The opcode of the command was invalid.
    #[error("invalid command type ({0})")]
    InvalidCommand(u32),
    /// The buffer ended before the declared sizes were satisfied.
    #[error("truncated command data")]
    Truncated,
}

/// A decoded VIGS command.  Mostly useful on the host side and for
/// verifying encoded batches.
#[derive(Debug, PartialEq, Eq)]
pub enum VigsCommand {
    UpdateVram(VigsUpdateVramRequest),
    UpdateGpu(VigsUpdateGpuRequest, Vec<VigsRect>),
    Copy(VigsCopyRequest, Vec<VigsCopyEntry>),
    SolidFill(VigsSolidFillRequest, Vec<VigsRect>),
}

fn decode_entries<T: FromBytes>(buf: &[u8], num_entries: u32) -> Result<Vec<T>, VigsDecodeError> {
    let mut entries = Vec::with_capacity(num_entries as usize);
    let mut offset = 0;
    for _ in 0..num_entries {
        let entry = buf
            .get(offset..)
            .and_then(T::read_from_prefix)
            .ok_or(VigsDecodeError::Truncated)?;
        entries.push(entry);
        offset += size_of::<T>();
    }
    Ok(entries)
}

impl VigsCommand {
    /// Decodes one command from the head of `buf`, returning it along with
    /// the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(VigsCommand, usize), VigsDecodeError> {
        use self::VigsCommand::*;
        let header = VigsRequestHeader::read_from_prefix(buf).ok_or(VigsDecodeError::Truncated)?;
        let header_size = size_of::<VigsRequestHeader>();
        let total_size = header_size + header.size as usize;
        let payload = buf
            .get(header_size..total_size)
            .ok_or(VigsDecodeError::Truncated)?;
        let cmd = match header.cmd {
            VIGS_CMD_UPDATE_VRAM => UpdateVram(
                VigsUpdateVramRequest::read_from_prefix(payload).ok_or(VigsDecodeError::Truncated)?,
            ),
            VIGS_CMD_UPDATE_GPU => {
                let request = VigsUpdateGpuRequest::read_from_prefix(payload)
                    .ok_or(VigsDecodeError::Truncated)?;
                let entries = decode_entries(
                    payload
                        .get(size_of::<VigsUpdateGpuRequest>()..)
                        .ok_or(VigsDecodeError::Truncated)?,
                    request.num_entries,
                )?;
                UpdateGpu(request, entries)
            }
            VIGS_CMD_COPY => {
                let request =
                    VigsCopyRequest::read_from_prefix(payload).ok_or(VigsDecodeError::Truncated)?;
                let entries = decode_entries(
                    payload
                        .get(size_of::<VigsCopyRequest>()..)
                        .ok_or(VigsDecodeError::Truncated)?,
                    request.num_entries,
                )?;
                Copy(request, entries)
            }
            VIGS_CMD_SOLID_FILL => {
                let request = VigsSolidFillRequest::read_from_prefix(payload)
                    .ok_or(VigsDecodeError::Truncated)?;
                let entries = decode_entries(
                    payload
                        .get(size_of::<VigsSolidFillRequest>()..)
                        .ok_or(VigsDecodeError::Truncated)?,
                    request.num_entries,
                )?;
                SolidFill(request, entries)
            }
            _ => return Err(VigsDecodeError::InvalidCommand(header.cmd)),
        };
        Ok((cmd, total_size))
    }
}

/// A decoded batch: the header and every complete command that followed it.
#[derive(Debug)]
pub struct VigsBatch {
    pub header: VigsBatchHeader,
    pub commands: Vec<VigsCommand>,
}

impl VigsBatch {
    /// Decodes a full batch image, e.g. the contents of a submitted
    /// execbuffer.  Bytes past `header.size` are ignored.
    pub fn decode(buf: &[u8]) -> Result<VigsBatch, VigsDecodeError> {
        let header = VigsBatchHeader::read_from_prefix(buf).ok_or(VigsDecodeError::Truncated)?;
        let header_size = size_of::<VigsBatchHeader>();
        let body = buf
            .get(header_size..header_size + header.size as usize)
            .ok_or(VigsDecodeError::Truncated)?;
        let mut commands = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let (cmd, used) = VigsCommand::decode(&body[offset..])?;
            commands.push(cmd);
            offset += used;
        }
        Ok(VigsBatch { header, commands })
    }
}
