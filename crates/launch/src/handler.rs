// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The message handler: a forked helper process owning the listener
//! that node daemons and the controller connect back to.
//!
//! The helper decodes each reply and writes tagged state-delta frames
//! onto the event pipe; the main process applies them. Keeping the
//! handler in its own process isolates it from the launcher's signal
//! traffic and pins the debugger-visible process identity. The child
//! holds no launcher state beyond its pipe buffer and the small
//! bookkeeping needed to know when it is done.

use crate::error::LaunchError;
use crate::pipe::PipeWriter;
use nix::sys::signal::{kill, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use std::collections::HashSet;
use tokio::net::{TcpListener, TcpStream};

use steprun_core::{DebugState, HostState, JobState, TaskState};
use steprun_wire::{
    decode, encode, exit_status_from_wait, read_message, write_message, Message, PipeFrame,
};

/// What the helper needs to know about the launch.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Uid the cluster daemons run as
    pub daemon_uid: u32,
    /// Uid of the launching user
    pub caller_uid: u32,
    pub total_tasks: u32,
    /// Exits that finish the step (node count under one-task-per-node)
    pub completion_threshold: u32,
    /// Global task ids per node; reattach replies may update a node's row
    pub global_task_ids: Vec<Vec<u32>>,
    /// Tolerate node failure instead of force-terminating
    pub no_kill: bool,
}

impl HandlerConfig {
    fn uid_allowed(&self, uid: u32) -> bool {
        uid == self.daemon_uid || uid == 0 || uid == self.caller_uid
    }
}

struct ServeState {
    cfg: HandlerConfig,
    gtids: Vec<Vec<u32>>,
    exited: HashSet<u32>,
    proc_descs: u32,
    table_size_sent: bool,
    seen_deadlines: HashSet<u64>,
    done: bool,
}

/// Accept and translate replies until the step is over.
///
/// This is the body of the forked helper; it is a plain async function
/// so tests can drive it in-process. Pipe writes may block when the
/// pipe fills; the main process guarantees progress by consuming
/// state deltas before any further launch activity.
pub async fn serve(
    listener: TcpListener,
    mut writer: PipeWriter,
    cfg: HandlerConfig,
) -> Result<(), LaunchError> {
    let mut state = ServeState {
        gtids: cfg.global_task_ids.clone(),
        exited: HashSet::new(),
        proc_descs: 0,
        table_size_sent: false,
        seen_deadlines: HashSet::new(),
        done: false,
        cfg,
    };

    while !state.done {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
                continue;
            }
        };
        tracing::debug!(peer = %peer, "reply connection");
        if let Err(err) = handle_conn(stream, &mut state, &mut writer).await {
            // a malformed peer costs one connection, never the launch
            tracing::warn!(peer = %peer, error = %err, "dropped reply connection");
        }
    }
    Ok(())
}

async fn handle_conn(
    mut stream: TcpStream,
    state: &mut ServeState,
    writer: &mut PipeWriter,
) -> Result<(), LaunchError> {
    let bytes = read_message(&mut stream).await?;
    let msg: Message = decode(&bytes)?;

    if let Some(uid) = sender_uid(&msg) {
        if !state.cfg.uid_allowed(uid) {
            tracing::error!(uid, "security violation: message from unauthorized uid dropped");
            return Ok(());
        }
    }

    match msg {
        Message::LaunchResponse(resp) => {
            let node = resp.srun_node_id as usize;
            if node >= state.gtids.len() {
                tracing::error!(node = %resp.node_name, "bad launch response node id");
                return Ok(());
            }
            writer.write(&PipeFrame::HostState {
                node: resp.srun_node_id,
                state: HostState::Replied,
            })?;

            if resp.return_code != 0 {
                tracing::error!(
                    node = %resp.node_name,
                    rc = resp.return_code,
                    "launch failed"
                );
                let ids = state.gtids[node].clone();
                for tid in ids {
                    writer.write(&PipeFrame::TaskState { task: tid, state: TaskState::Failed })?;
                    state.exited.insert(tid);
                }
                writer.write(&PipeFrame::DebugState { state: DebugState::Aborting })?;
                check_complete(state, writer)?;
            } else {
                publish_node_procs(state, writer, node, &resp.local_pids)?;
                for tid in state.gtids[node].clone() {
                    writer.write(&PipeFrame::TaskState { task: tid, state: TaskState::Running })?;
                }
            }
        }

        Message::ReattachResponse(resp) => {
            let node = resp.srun_node_id as usize;
            if node >= state.gtids.len() {
                tracing::error!(node = %resp.node_name, "bad reattach response node id");
                return Ok(());
            }
            writer.write(&PipeFrame::HostState {
                node: resp.srun_node_id,
                state: HostState::Replied,
            })?;

            if resp.return_code != 0 {
                tracing::error!(
                    node = %resp.node_name,
                    rc = resp.return_code,
                    "reattach failed"
                );
                writer.write(&PipeFrame::JobState { state: JobState::Failed })?;
                state.done = true;
                return Ok(());
            }

            // learn the node's task layout as reported by its daemon
            state.gtids[node] = resp.gtids.clone();
            publish_node_procs(state, writer, node, &resp.local_pids)?;
            for tid in resp.gtids {
                writer.write(&PipeFrame::TaskState { task: tid, state: TaskState::Running })?;
            }
        }

        Message::TaskExit { task_id_list, return_code, .. } => {
            let status = exit_status_from_wait(return_code);
            for tid in task_id_list {
                if tid >= state.cfg.total_tasks {
                    tracing::error!(task = tid, "task exit for unknown task id");
                    continue;
                }
                let task_state =
                    if status.is_clean() { TaskState::Exited } else { TaskState::AbnormalExit };
                writer.write(&PipeFrame::TaskState { task: tid, state: task_state })?;
                writer.write(&PipeFrame::TaskExit { task: tid, status })?;
                state.exited.insert(tid);
            }
            check_complete(state, writer)?;
        }

        Message::Ping { .. } => {
            tracing::debug!("controller ping");
            reply_rc(&mut stream, 0).await?;
        }

        Message::Timeout { timeout, .. } => {
            if state.seen_deadlines.insert(timeout) {
                tracing::warn!(deadline_epoch = timeout, "job time limit approaching");
            }
            reply_rc(&mut stream, 0).await?;
        }

        Message::NodeFail { nodelist, .. } => {
            reply_rc(&mut stream, 0).await?;
            if state.cfg.no_kill {
                tracing::error!(nodes = %nodelist, "node failure tolerated, continuing");
            } else {
                tracing::error!(nodes = %nodelist, "node failure, terminating step");
                writer.write(&PipeFrame::JobState { state: JobState::ForceTerm })?;
                // ask the main process to send Ctrl-C to the remaining tasks
                writer.write(&PipeFrame::SignalAck { signal: Signal::SIGINT as i32 })?;
                state.done = true;
            }
        }

        other => {
            tracing::error!(kind = message_name(&other), "spurious message dropped");
        }
    }
    Ok(())
}

/// Emit the proc-table frames for one node's pids, and the spawned
/// debug-state flip once every task is accounted for.
fn publish_node_procs(
    state: &mut ServeState,
    writer: &mut PipeWriter,
    node: usize,
    pids: &[u32],
) -> Result<(), LaunchError> {
    if !state.table_size_sent {
        state.table_size_sent = true;
        writer.write(&PipeFrame::ProcTableSize { tasks: state.cfg.total_tasks })?;
    }
    for (tid, pid) in state.gtids[node].iter().zip(pids) {
        writer.write(&PipeFrame::ProcDesc { task: *tid, node: node as u32, pid: *pid })?;
        state.proc_descs += 1;
    }
    if state.proc_descs >= state.cfg.total_tasks {
        writer.write(&PipeFrame::DebugState { state: DebugState::Spawned })?;
    }
    Ok(())
}

fn check_complete(state: &mut ServeState, writer: &mut PipeWriter) -> Result<(), LaunchError> {
    if state.exited.len() as u32 >= state.cfg.completion_threshold {
        tracing::debug!("all tasks exited");
        writer.write(&PipeFrame::JobState { state: JobState::Terminated })?;
        state.done = true;
    }
    Ok(())
}

async fn reply_rc(stream: &mut TcpStream, rc: i32) -> Result<(), LaunchError> {
    let payload = encode(&Message::ReturnCode { rc })?;
    write_message(stream, &payload).await?;
    Ok(())
}

fn sender_uid(msg: &Message) -> Option<u32> {
    match msg {
        Message::LaunchResponse(resp) => Some(resp.uid),
        Message::ReattachResponse(resp) => Some(resp.uid),
        Message::TaskExit { uid, .. }
        | Message::Ping { uid }
        | Message::Timeout { uid, .. }
        | Message::NodeFail { uid, .. } => Some(*uid),
        Message::LaunchTasks { .. } | Message::SignalTasks { .. } | Message::ReturnCode { .. } => {
            None
        }
    }
}

fn message_name(msg: &Message) -> &'static str {
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

/// Handle on the forked helper, parent side.
pub struct HandlerProc {
    pid: Pid,
}

impl HandlerProc {
    /// Fork the helper around an already-bound reply listener.
    ///
    /// The parent keeps the pipe's read end and drops its copies of the
    /// listener and the write end; the child serves until the step is
    /// over and exits, which is the parent's EOF.
    pub fn spawn(
        listener: std::net::TcpListener,
        writer: PipeWriter,
        cfg: HandlerConfig,
    ) -> Result<Self, LaunchError> {
        // SAFETY: the child only runs async-signal-unsafe code after
        // this call returns into its own single-threaded world; it never
        // returns from this function.
        match unsafe { fork() }
            .map_err(|err| LaunchError::FatalInternal(format!("fork failed: {}", err)))?
        {
            ForkResult::Parent { child } => {
                drop(writer);
                drop(listener);
                Ok(Self { pid: child })
            }
            ForkResult::Child => {
                let code = match child_main(listener, writer, cfg) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Reap the helper, terminating it first if it has not exited.
    /// Terminating an already-exited child is a no-op; the wait always
    /// collects it, so no zombie survives the launch.
    pub fn reap(self) -> Result<i32, LaunchError> {
        let _ = kill(self.pid, Signal::SIGTERM);
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Ok(code),
            Ok(WaitStatus::Signaled(_, _, _)) => Ok(0),
            Ok(other) => {
                tracing::warn!(status = ?other, "unexpected helper wait status");
                Ok(0)
            }
            Err(err) => Err(LaunchError::FatalInternal(format!("waitpid failed: {}", err))),
        }
    }
}

fn child_main(
    listener: std::net::TcpListener,
    writer: PipeWriter,
    cfg: HandlerConfig,
) -> Result<(), LaunchError> {
    // own session: the user's Ctrl-C goes to the launcher, not here
    let _ = setsid();

    // undo the launcher's signal mask so a parent SIGTERM still works
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    let _ = nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);

    listener.set_nonblocking(true)?;
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async move {
        let listener = TcpListener::from_std(listener)?;
        serve(listener, writer, cfg).await
    })
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
