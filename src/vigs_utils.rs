// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vigs_utils: Error and result types shared by the rest of the crate.

use remain::sorted;
use thiserror::Error;

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum VigsError {
    /// The execbuffer provider could not satisfy an allocation, or the
    /// current command was already marked as failed.
    #[error("execbuffer allocation failed")]
    AllocFailed,
    /// Checked arithmetic error.
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// Checked range error.
    #[error("range check failed: {}({}) vs {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedRange {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
    },
    /// A command was prepared while another one is still in progress.
    #[error("another command already in progress")]
    CommandInProgress,
    /// An append or done targeted an opcode other than the one in progress.
    #[error("command mismatch: {expected} in progress, got {actual}")]
    CommandMismatch { expected: u32, actual: u32 },
    /// Growing the execbuffer would exceed the configured maximum.
    #[error("execbuffer of {size} bytes exceeds maximum of {max_size}")]
    ExecbufferExceedsMax { size: u32, max_size: u32 },
    /// An execbuffer access fell outside the mapped region.
    #[error("execbuffer access out of bounds")]
    ExecbufferOutOfBounds,
    /// An append or done was issued with no command in progress.
    #[error("no command in progress")]
    NoCommandInProgress,
    /// The kernel side speaks a different protocol version.
    #[error("protocol version mismatch: actual {actual}, expected {expected}")]
    ProtocolVersionMismatch { actual: u32, expected: u32 },
    /// The provider failed to execute a submitted execbuffer.
    #[error("failed to execute execbuffer (errno {0})")]
    SubmitFailed(i32),
}

/// The result of an operation in this crate.
pub type VigsResult<T> = std::result::Result<T, VigsError>;
