// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host, task and job state machines.
//!
//! The launch engine and the forked message handler each keep their own
//! copy of these states; the transition rules below are the contract that
//! keeps the two views consistent. Host and job transitions are monotone,
//! task transitions follow `PENDING -> RUNNING -> terminal`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-node contact state during launch.
///
/// `Unreachable` and `Replied` are final. `Replied` supersedes
/// `Contacted`: the reply connection is authoritative over the initial
/// RPC acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// No contact attempted yet
    Init,
    /// Launch RPC acknowledged by the node daemon
    Contacted,
    /// Node daemon connected back with a launch reply
    Replied,
    /// Launch RPC failed after exhausting retries
    Unreachable,
}

impl HostState {
    /// Final states accept no further writes.
    pub fn is_final(self) -> bool {
        matches!(self, HostState::Replied | HostState::Unreachable)
    }

    /// Whether a write of `next` over `self` is allowed.
    pub fn may_become(self, next: HostState) -> bool {
        match self {
            HostState::Init => true,
            // reply supersedes initial contact
            HostState::Contacted => matches!(next, HostState::Replied | HostState::Unreachable),
            HostState::Replied | HostState::Unreachable => false,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Init => "init",
            HostState::Contacted => "contacted",
            HostState::Replied => "replied",
            HostState::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// Per-task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not yet reported running by any node
    Pending,
    /// Node daemon reported the task started
    Running,
    /// Exited cleanly, output drained
    Exited,
    /// Exited with a non-zero status or by signal
    AbnormalExit,
    /// Exited but stdout/stderr still draining
    IoWait,
    /// Never ran: launch on its node failed
    Failed,
}

impl TaskState {
    /// Terminal states count toward the exited total.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// Whether a write of `next` over `self` is allowed.
    ///
    /// `IoWait` is the one terminal state with an outgoing edge: it
    /// becomes `Exited` once the streams drain. Re-writing the same
    /// terminal state is idempotent and allowed.
    pub fn may_become(self, next: TaskState) -> bool {
        match self {
            TaskState::Pending => true,
            TaskState::Running => next != TaskState::Pending,
            TaskState::IoWait => matches!(next, TaskState::Exited | TaskState::IoWait),
            terminal => next == terminal,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Exited => "exited",
            TaskState::AbnormalExit => "abnormal_exit",
            TaskState::IoWait => "io_wait",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Whole-launch state. Ordered: transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Launch RPCs being dispatched
    Launching,
    /// All launch requests sent
    Starting,
    /// First successful launch reply observed
    Running,
    /// All tasks exited and drained
    Terminated,
    /// User signal propagated to the step
    Cancelled,
    /// Unrecoverable launch or runtime error
    Failed,
    /// External force-termination
    ForceTerm,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        self >= JobState::Terminated
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Launching => "launching",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Terminated => "terminated",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
            JobState::ForceTerm => "forceterm",
        };
        write!(f, "{}", s)
    }
}

/// Debugger collaborator state, published once per launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugState {
    Unset,
    /// Every task's pid is known; the process table is complete
    Spawned,
    /// A launch reply carried an error
    Aborting,
}

/// How a task left the system, as reported by its node daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    /// The contribution of this exit to the job's exit code.
    ///
    /// Signal deaths are biased to `128 + signal`, shell-style, so they
    /// dominate ordinary non-zero exits when the maximum is taken.
    pub fn job_rc(self) -> i32 {
        match self {
            ExitStatus::Code(c) => c,
            ExitStatus::Signal(s) => 128 + s,
        }
    }

    pub fn is_clean(self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "exit code {}", c),
            ExitStatus::Signal(s) => write!(f, "signal {}", s),
        }
    }
}

/// Fold per-task exit statuses into the launcher's exit code: the
/// maximum across tasks, with signal deaths biased to `128 + signal`.
pub fn job_exit_code<I>(statuses: I) -> i32
where
    I: IntoIterator<Item = ExitStatus>,
{
    statuses.into_iter().map(ExitStatus::job_rc).max().unwrap_or(0)
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
