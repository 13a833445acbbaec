// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol between the launcher, the node daemons, and the forked
//! message handler.
//!
//! Two formats share this crate:
//! - RPC messages: 4-byte length prefix (big-endian) + JSON payload of an
//!   internally tagged [`Message`].
//! - Event-pipe frames: 4-byte tag + 4-byte payload length (both
//!   big-endian) + JSON payload, one frame per state delta.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![forbid(unsafe_code)]

mod codec;
mod frame;
mod message;

pub use codec::{
    decode, encode, read_message, read_message_from, write_message, write_message_to,
    ProtocolError, MAX_MESSAGE_SIZE,
};
pub use frame::{FrameHeader, PipeFrame, FRAME_HEADER_LEN, MAX_FRAME_SIZE};
pub use message::{
    exit_status_from_wait, wait_status_from_exit, EncodedCommon, LaunchCommon, LaunchResponse,
    Message, ReattachResponse, RC_INVALID_JOB_CREDENTIAL, TASK_PARALLEL_DEBUG,
};
