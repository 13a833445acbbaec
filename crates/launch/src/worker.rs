// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-node launch worker: one RPC exchange with one node daemon,
//! bounded retry, outcome recorded in the state tracker.

use crate::builder::NodeRequest;
use crate::job::JobStateCell;
use crate::pool::WorkerOutcome;
use crate::signals::CancelHandle;
use crate::tracker::StateTracker;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use steprun_core::{HostState, JobState, TaskState};
use steprun_wire::{
    decode, read_message_from, write_message_to, Message, RC_INVALID_JOB_CREDENTIAL,
};
use thiserror::Error;

/// Bounded retry: `budget` further attempts, `delay` between them.
///
/// The fixed one-second delay avoids contention storms against a busy
/// daemon; three attempts bound worst-case latency while riding out
/// brief unreachability. Credential errors never retry: the step's
/// credential is fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub budget: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { budget: 3, delay: Duration::from_secs(1) }
    }
}

/// Why a launch RPC attempt failed.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("receive timed out")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("daemon refused the request: rc {0}")]
    Denied(i32),

    #[error("invalid job credential")]
    InvalidCredential,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bad daemon address {0}")]
    BadAddr(String),
}

impl RpcError {
    /// Whether the retry budget applies. Credential and protocol errors
    /// cannot heal on their own; everything else can.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout | RpcError::Interrupted | RpcError::Connect(_) | RpcError::Denied(_)
        )
    }
}

/// Shared context every launch worker runs with.
pub struct WorkerCtx {
    pub tracker: Arc<StateTracker>,
    pub job: Arc<JobStateCell>,
    pub cancel: CancelHandle,
    pub retry: RetryPolicy,
    pub msg_timeout: Duration,
}

/// Deliver one node's launch request and record the outcome.
///
/// Success marks the host `Contacted`; the reply path upgrades it to
/// `Replied` later. Exhausted retries or a non-transient error mark the
/// host `Unreachable` and fail every task assigned to it. Cancellation
/// mid-flight records nothing: the cancellation path owns teardown.
pub fn launch_one(ctx: &WorkerCtx, req: &NodeRequest) -> WorkerOutcome {
    let mut budget = ctx.retry.budget;
    let mut first_error = true;

    loop {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(host = %req.host, "launch canceled before send");
            return WorkerOutcome::Failed;
        }

        match send_recv(&req.addr, &req.payload, ctx.msg_timeout) {
            Ok(()) => {
                ctx.tracker.set_host(req.node_index, HostState::Contacted);
                return WorkerOutcome::Done;
            }
            Err(err) => {
                if ctx.cancel.is_cancelled() {
                    tracing::debug!(host = %req.host, "launch canceled");
                    return WorkerOutcome::Failed;
                }
                if first_error {
                    tracing::debug!(host = %req.host, error = %err, "first launch error");
                    first_error = false;
                }
                if err.is_transient() && ctx.job.get() == JobState::Launching && budget > 0 {
                    budget -= 1;
                    std::thread::sleep(ctx.retry.delay);
                    continue;
                }

                tracing::error!(host = %req.host, error = %err, "launch failed");
                mark_unreachable(ctx, req);
                return WorkerOutcome::Failed;
            }
        }
    }
}

fn mark_unreachable(ctx: &WorkerCtx, req: &NodeRequest) {
    ctx.tracker.set_host(req.node_index, HostState::Unreachable);
    for task_id in &req.task_ids {
        ctx.tracker.set_task(*task_id, TaskState::Failed);
    }
}

/// One request/acknowledgement exchange with a node daemon.
fn send_recv(addr: &str, payload: &[u8], timeout: Duration) -> Result<(), RpcError> {
    let addr = addr
        .to_socket_addrs()
        .map_err(|_| RpcError::BadAddr(addr.to_string()))?
        .next()
        .ok_or_else(|| RpcError::BadAddr(addr.to_string()))?;

    let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(classify_io)?;
    stream.set_read_timeout(Some(timeout)).map_err(classify_io)?;
    stream.set_write_timeout(Some(timeout)).map_err(classify_io)?;

    write_message_to(&mut stream, payload).map_err(classify_protocol)?;
    let reply = read_message_from(&mut stream).map_err(classify_protocol)?;

    match decode::<Message>(&reply) {
        Ok(Message::ReturnCode { rc: 0 }) => Ok(()),
        Ok(Message::ReturnCode { rc: RC_INVALID_JOB_CREDENTIAL }) => {
            Err(RpcError::InvalidCredential)
        }
        Ok(Message::ReturnCode { rc }) => Err(RpcError::Denied(rc)),
        Ok(other) => Err(RpcError::Protocol(format!("unexpected ack {:?}", msg_kind(&other)))),
        Err(err) => Err(RpcError::Protocol(err.to_string())),
    }
}

fn classify_io(err: std::io::Error) -> RpcError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => RpcError::Timeout,
        ErrorKind::Interrupted => RpcError::Interrupted,
        _ => RpcError::Connect(err.to_string()),
    }
}

fn classify_protocol(err: steprun_wire::ProtocolError) -> RpcError {
    match err {
        steprun_wire::ProtocolError::Io(io) => classify_io(io),
        other => RpcError::Protocol(other.to_string()),
    }
}

fn msg_kind(msg: &Message) -> &'static str {
    match msg {
        Message::LaunchTasks { .. } => "launch_tasks",
        Message::LaunchResponse(_) => "launch_response",
        Message::ReattachResponse(_) => "reattach_response",
        Message::TaskExit { .. } => "task_exit",
        Message::Ping { .. } => "ping",
        Message::Timeout { .. } => "timeout",
        Message::NodeFail { .. } => "node_fail",
        Message::SignalTasks { .. } => "signal_tasks",
        Message::ReturnCode { .. } => "return_code",
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
