// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC messages exchanged with node daemons and the controller.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use steprun_core::{Credential, ExitStatus};

/// Task flag bit: the step runs under a parallel debugger.
pub const TASK_PARALLEL_DEBUG: u32 = 0x1;

/// Ack return code: the node daemon rejected the step credential.
/// Never retried; the credential is fixed for the step's lifetime.
pub const RC_INVALID_JOB_CREDENTIAL: i32 = 4004;

/// Shared payload of every launch request in a step.
///
/// Serialized exactly once per launch (see [`EncodedCommon`]); the
/// per-node request adds only `node_id`. The per-node arrays are indexed
/// by `node_id` on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommon {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub cred: Credential,
    /// Opaque switch/interconnect context
    pub switch_ctx: Vec<u8>,
    /// Flag bits, including [`TASK_PARALLEL_DEBUG`]
    pub task_flags: u32,
    /// Remote stdio filename hints; empty means stream back to the launcher
    pub ofname: Option<String>,
    pub efname: Option<String>,
    pub ifname: Option<String>,
    /// Tasks each node should start, indexed by node id
    pub tasks_to_launch: Vec<u32>,
    /// Global task ids per node, indexed by node id
    pub global_task_ids: Vec<Vec<u32>>,
    /// CPUs allocated per node, indexed by node id
    pub cpus_allocated: Vec<u32>,
    /// Port to send launch replies and task-exit notices to, per node
    pub resp_port: Vec<u16>,
    /// Port to stream task I/O to, per node
    pub io_port: Vec<u16>,
}

/// A node daemon's reply to a launch request, sent to the response port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchResponse {
    /// Authenticated uid of the sender
    pub uid: u32,
    pub srun_node_id: u32,
    pub node_name: String,
    pub return_code: i32,
    pub local_pids: Vec<u32>,
}

/// A node daemon's reply to a reattach request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachResponse {
    /// Authenticated uid of the sender
    pub uid: u32,
    pub srun_node_id: u32,
    pub node_name: String,
    pub return_code: i32,
    pub local_pids: Vec<u32>,
    /// Global task ids running on the node, parallel to `local_pids`
    pub gtids: Vec<u32>,
    pub executable_name: String,
}

/// Every message that crosses a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Launch request toward a node daemon
    LaunchTasks { common: LaunchCommon, node_id: u32 },

    /// Launch reply from a node daemon
    LaunchResponse(LaunchResponse),

    /// Reattach reply from a node daemon
    ReattachResponse(ReattachResponse),

    /// Batch of task exits from a node daemon. `return_code` is a raw
    /// wait status shared by every task in the batch.
    TaskExit { uid: u32, task_id_list: Vec<u32>, return_code: i32 },

    /// Controller liveness probe; answered inline with `ReturnCode`
    Ping { uid: u32 },

    /// Controller warning: the job approaches its time limit
    /// (`timeout` is an absolute epoch-seconds deadline)
    Timeout { uid: u32, timeout: u64 },

    /// Controller notice that nodes stopped responding
    NodeFail { uid: u32, nodelist: String },

    /// Signal fan-out toward a node daemon: deliver `signal` to every
    /// task of the step running there
    SignalTasks { job_id: u32, step_id: u32, signal: i32 },

    /// Generic return-code reply
    ReturnCode { rc: i32 },
}

/// The common launch payload, serialized once and spliced into every
/// per-node request without re-encoding.
#[derive(Debug, Clone)]
pub struct EncodedCommon {
    raw: Box<RawValue>,
}

impl EncodedCommon {
    pub fn new(common: &LaunchCommon) -> Result<Self, ProtocolError> {
        let raw = serde_json::value::to_raw_value(common)?;
        Ok(Self { raw })
    }

    /// Encode the launch request for one node around the shared payload.
    /// Byte-identical to encoding [`Message::LaunchTasks`] directly.
    pub fn encode_for_node(&self, node_id: u32) -> Result<Vec<u8>, ProtocolError> {
        #[derive(Serialize)]
        struct LaunchWire<'a> {
            #[serde(rename = "type")]
            tag: &'static str,
            common: &'a RawValue,
            node_id: u32,
        }
        let msg = LaunchWire { tag: "launch_tasks", common: &self.raw, node_id };
        Ok(serde_json::to_vec(&msg)?)
    }
}

/// Decode a raw Unix wait status into the launcher's exit model: a
/// signal death carries the signal in the low 7 bits, a normal exit
/// carries the code in bits 8..16.
pub fn exit_status_from_wait(status: i32) -> ExitStatus {
    let sig = status & 0x7f;
    if sig != 0 {
        ExitStatus::Signal(sig)
    } else {
        ExitStatus::Code((status >> 8) & 0xff)
    }
}

/// Inverse of [`exit_status_from_wait`], used by peers reporting exits.
pub fn wait_status_from_exit(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Code(c) => (c & 0xff) << 8,
        ExitStatus::Signal(s) => s & 0x7f,
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
