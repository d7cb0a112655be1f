// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for encoding VIGS paravirtual GPU drawing commands (VRAM/GPU
//! surface updates, copies, solid fills) into execbuffer batches consumed
//! by the kernel DRM driver.

#[macro_use]
mod macros;
mod vigs_comm;
mod vigs_protocol;
mod vigs_utils;

pub use crate::vigs_comm::VigsComm;
pub use crate::vigs_comm::VigsExecbuffer;
pub use crate::vigs_comm::VigsExecbufferProvider;
pub use crate::vigs_protocol::*;
pub use crate::vigs_utils::*;
