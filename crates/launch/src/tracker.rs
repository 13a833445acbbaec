// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authoritative per-host and per-task state for the main process.

use crate::job::JobStateCell;
use parking_lot::Mutex;
use std::sync::Arc;
use steprun_core::{job_exit_code, ExitStatus, HostState, JobState, TaskState};

/// Fixed per-launch tracker parameters.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub total_tasks: u32,
    pub node_count: usize,
    /// Exits required for completion: the task total, or the node count
    /// when the MPI collaborator declared one task per node
    pub completion_threshold: u32,
    /// Cancel the whole step on the first non-zero task exit
    pub kill_bad_exit: bool,
}

struct TrackerInner {
    hosts: Vec<HostState>,
    tasks: Vec<TaskState>,
    exits: Vec<Option<ExitStatus>>,
    exited: u32,
    /// A user-initiated signal was forwarded to the step; signal deaths
    /// after this are expected and do not bias the exit code
    signaled: bool,
    /// kill-on-bad-exit has already fired once
    cancel_latch: bool,
}

/// Single-mutex host + task state, shared between the launch workers
/// and the event-pipe reader.
///
/// Host writes are monotone (final states ignore further writes), task
/// writes follow the task state machine, and reaching the completion
/// threshold advances the job cell to `Terminated`.
pub struct StateTracker {
    cfg: TrackerConfig,
    job: Arc<JobStateCell>,
    inner: Mutex<TrackerInner>,
}

impl StateTracker {
    pub fn new(cfg: TrackerConfig, job: Arc<JobStateCell>) -> Self {
        let inner = TrackerInner {
            hosts: vec![HostState::Init; cfg.node_count],
            tasks: vec![TaskState::Pending; cfg.total_tasks as usize],
            exits: vec![None; cfg.total_tasks as usize],
            exited: 0,
            signaled: false,
            cancel_latch: false,
        };
        Self { cfg, job, inner: Mutex::new(inner) }
    }

    /// Record a host transition. Writes that the state machine forbids
    /// (anything after `Replied` or `Unreachable`) are ignored.
    /// Returns true when the state changed.
    pub fn set_host(&self, node: usize, state: HostState) -> bool {
        let mut inner = self.inner.lock();
        let Some(current) = inner.hosts.get(node).copied() else {
            tracing::warn!(node, "host state for unknown node index dropped");
            return false;
        };
        if current == state || !current.may_become(state) {
            return false;
        }
        inner.hosts[node] = state;
        true
    }

    /// Record a task transition. Forbidden transitions are ignored;
    /// terminal writes are idempotent. The first terminal entry counts
    /// toward completion.
    pub fn set_task(&self, task: u32, state: TaskState) -> bool {
        let mut inner = self.inner.lock();
        let Some(current) = inner.tasks.get(task as usize).copied() else {
            tracing::warn!(task, "task state for unknown task id dropped");
            return false;
        };
        if current == state || !current.may_become(state) {
            return false;
        }
        inner.tasks[task as usize] = state;
        if state.is_terminal() && !current.is_terminal() {
            inner.exited += 1;
            if inner.exited >= self.cfg.completion_threshold {
                drop(inner);
                self.job.advance(JobState::Terminated);
            }
        }
        true
    }

    /// Record a task's exit status alongside its state transition.
    /// Returns true when kill-on-bad-exit requires a job-wide cancel;
    /// the latch guarantees that fires at most once per launch.
    pub fn record_exit(&self, task: u32, status: ExitStatus) -> bool {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.exits.get_mut(task as usize) {
            *slot = Some(status);
        } else {
            tracing::warn!(task, "exit status for unknown task id dropped");
            return false;
        }
        if !status.is_clean() && self.cfg.kill_bad_exit && !inner.cancel_latch {
            inner.cancel_latch = true;
            return true;
        }
        false
    }

    /// Note that a signal was deliberately forwarded to the step.
    pub fn set_signaled(&self) {
        self.inner.lock().signaled = true;
    }

    pub fn signaled(&self) -> bool {
        self.inner.lock().signaled
    }

    pub fn host(&self, node: usize) -> Option<HostState> {
        self.inner.lock().hosts.get(node).copied()
    }

    pub fn task(&self, task: u32) -> Option<TaskState> {
        self.inner.lock().tasks.get(task as usize).copied()
    }

    pub fn hosts(&self) -> Vec<HostState> {
        self.inner.lock().hosts.clone()
    }

    pub fn tasks(&self) -> Vec<TaskState> {
        self.inner.lock().tasks.clone()
    }

    pub fn exited_count(&self) -> u32 {
        self.inner.lock().exited
    }

    /// Node indexes that never replied, for the launch-deadline sweep.
    pub fn unreplied_hosts(&self) -> Vec<usize> {
        self.inner
            .lock()
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != HostState::Replied)
            .map(|(i, _)| i)
            .collect()
    }

    /// The job's exit code: maximum across task exit codes, with deaths
    /// by unexpected signal biased to `128 + signal`. Signal deaths are
    /// expected (contribute nothing) once a signal was forwarded.
    pub fn exit_code(&self) -> i32 {
        let inner = self.inner.lock();
        let statuses = inner.exits.iter().flatten().copied().filter(|status| match status {
            ExitStatus::Signal(_) => !inner.signaled,
            ExitStatus::Code(_) => true,
        });
        job_exit_code(statuses)
    }
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
