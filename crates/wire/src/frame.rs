// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event-pipe frames: tagged state deltas from the forked message
//! handler to the main process.
//!
//! Frame format: 4-byte tag, 4-byte payload length (both big-endian),
//! then a tag-determined JSON payload. The reader validates tag and
//! length before touching the payload.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use steprun_core::{DebugState, ExitStatus, HostState, JobState, TaskState};

/// Bytes in a frame header (tag + payload length).
pub const FRAME_HEADER_LEN: usize = 8;

/// Pipe frames are small state deltas; anything bigger is corruption.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// One state delta on the event pipe.
///
/// Produced only by the helper process, consumed only by the main
/// process. Tags are part of the wire contract and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeFrame {
    /// A node changed contact state
    HostState { node: u32, state: HostState },
    /// A task changed execution state
    TaskState { task: u32, state: TaskState },
    /// A task's exit status, recorded alongside its state change
    TaskExit { task: u32, status: ExitStatus },
    /// The whole launch changed state
    JobState { state: JobState },
    /// A user signal was forwarded to the step
    SignalAck { signal: i32 },
    /// Debugger process table size (sent once, before the entries)
    ProcTableSize { tasks: u32 },
    /// One debugger process table entry
    ProcDesc { task: u32, node: u32, pid: u32 },
    /// Debugger state flip: spawned or aborting
    DebugState { state: DebugState },
}

const TAG_HOST_STATE: u32 = 1;
const TAG_TASK_STATE: u32 = 2;
const TAG_TASK_EXIT: u32 = 3;
const TAG_JOB_STATE: u32 = 4;
const TAG_SIGNAL_ACK: u32 = 5;
const TAG_PROC_TABLE_SIZE: u32 = 6;
const TAG_PROC_DESC: u32 = 7;
const TAG_DEBUG_STATE: u32 = 8;

#[derive(Serialize, Deserialize)]
struct HostStatePayload {
    node: u32,
    state: HostState,
}

#[derive(Serialize, Deserialize)]
struct TaskStatePayload {
    task: u32,
    state: TaskState,
}

#[derive(Serialize, Deserialize)]
struct TaskExitPayload {
    task: u32,
    status: ExitStatus,
}

#[derive(Serialize, Deserialize)]
struct JobStatePayload {
    state: JobState,
}

#[derive(Serialize, Deserialize)]
struct SignalAckPayload {
    signal: i32,
}

#[derive(Serialize, Deserialize)]
struct ProcTableSizePayload {
    tasks: u32,
}

#[derive(Serialize, Deserialize)]
struct ProcDescPayload {
    task: u32,
    node: u32,
    pid: u32,
}

#[derive(Serialize, Deserialize)]
struct DebugStatePayload {
    state: DebugState,
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: u32,
    pub len: u32,
}

impl FrameHeader {
    /// Parse and validate a header. Rejects unknown tags and oversize
    /// payloads before any payload byte is read.
    pub fn parse(bytes: [u8; FRAME_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let tag = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if !(TAG_HOST_STATE..=TAG_DEBUG_STATE).contains(&tag) {
            return Err(ProtocolError::UnknownTag(tag));
        }
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge { len, max: MAX_FRAME_SIZE });
        }
        Ok(Self { tag, len })
    }
}

impl PipeFrame {
    pub fn tag(&self) -> u32 {
        match self {
            PipeFrame::HostState { .. } => TAG_HOST_STATE,
            PipeFrame::TaskState { .. } => TAG_TASK_STATE,
            PipeFrame::TaskExit { .. } => TAG_TASK_EXIT,
            PipeFrame::JobState { .. } => TAG_JOB_STATE,
            PipeFrame::SignalAck { .. } => TAG_SIGNAL_ACK,
            PipeFrame::ProcTableSize { .. } => TAG_PROC_TABLE_SIZE,
            PipeFrame::ProcDesc { .. } => TAG_PROC_DESC,
            PipeFrame::DebugState { .. } => TAG_DEBUG_STATE,
        }
    }

    /// Encode as a complete frame: header + payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            PipeFrame::HostState { node, state } => {
                serde_json::to_vec(&HostStatePayload { node: *node, state: *state })?
            }
            PipeFrame::TaskState { task, state } => {
                serde_json::to_vec(&TaskStatePayload { task: *task, state: *state })?
            }
            PipeFrame::TaskExit { task, status } => {
                serde_json::to_vec(&TaskExitPayload { task: *task, status: *status })?
            }
            PipeFrame::JobState { state } => serde_json::to_vec(&JobStatePayload { state: *state })?,
            PipeFrame::SignalAck { signal } => {
                serde_json::to_vec(&SignalAckPayload { signal: *signal })?
            }
            PipeFrame::ProcTableSize { tasks } => {
                serde_json::to_vec(&ProcTableSizePayload { tasks: *tasks })?
            }
            PipeFrame::ProcDesc { task, node, pid } => {
                serde_json::to_vec(&ProcDescPayload { task: *task, node: *node, pid: *pid })?
            }
            PipeFrame::DebugState { state } => {
                serde_json::to_vec(&DebugStatePayload { state: *state })?
            }
        };

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.tag().to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a payload under an already-validated header tag.
    pub fn decode(tag: u32, payload: &[u8]) -> Result<Self, ProtocolError> {
        let frame = match tag {
            TAG_HOST_STATE => {
                let p: HostStatePayload = serde_json::from_slice(payload)?;
                PipeFrame::HostState { node: p.node, state: p.state }
            }
            TAG_TASK_STATE => {
                let p: TaskStatePayload = serde_json::from_slice(payload)?;
                PipeFrame::TaskState { task: p.task, state: p.state }
            }
            TAG_TASK_EXIT => {
                let p: TaskExitPayload = serde_json::from_slice(payload)?;
                PipeFrame::TaskExit { task: p.task, status: p.status }
            }
            TAG_JOB_STATE => {
                let p: JobStatePayload = serde_json::from_slice(payload)?;
                PipeFrame::JobState { state: p.state }
            }
            TAG_SIGNAL_ACK => {
                let p: SignalAckPayload = serde_json::from_slice(payload)?;
                PipeFrame::SignalAck { signal: p.signal }
            }
            TAG_PROC_TABLE_SIZE => {
                let p: ProcTableSizePayload = serde_json::from_slice(payload)?;
                PipeFrame::ProcTableSize { tasks: p.tasks }
            }
            TAG_PROC_DESC => {
                let p: ProcDescPayload = serde_json::from_slice(payload)?;
                PipeFrame::ProcDesc { task: p.task, node: p.node, pid: p.pid }
            }
            TAG_DEBUG_STATE => {
                let p: DebugStatePayload = serde_json::from_slice(payload)?;
                PipeFrame::DebugState { state: p.state }
            }
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(frame)
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
