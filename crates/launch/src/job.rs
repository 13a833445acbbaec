// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The job-state cell: one monotone state per launch, with waiters.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use steprun_core::JobState;

/// Shared job state with condvar-backed waiting.
///
/// Transitions are monotone: `advance` only ever moves the state
/// forward in the `Launching < Starting < Running < terminal` order, so
/// late frames and racing threads cannot roll the launch back.
pub struct JobStateCell {
    state: Mutex<JobState>,
    cond: Condvar,
}

impl JobStateCell {
    pub fn new() -> Self {
        Self { state: Mutex::new(JobState::Launching), cond: Condvar::new() }
    }

    pub fn get(&self) -> JobState {
        *self.state.lock()
    }

    /// Advance to `next` if it is ahead of the current state.
    /// Returns true when the state changed.
    pub fn advance(&self, next: JobState) -> bool {
        let mut state = self.state.lock();
        if next > *state {
            let current = *state;
            tracing::debug!(from = %current, to = %next, "job state");
            *state = next;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Block until the job reaches a terminal state.
    pub fn wait_terminal(&self) -> JobState {
        let mut state = self.state.lock();
        while !state.is_terminal() {
            self.cond.wait(&mut state);
        }
        *state
    }

    /// Block until the job reaches a terminal state or the deadline
    /// passes; returns the state either way.
    pub fn wait_terminal_until(&self, deadline: Instant) -> JobState {
        let mut state = self.state.lock();
        while !state.is_terminal() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }
}

impl Default for JobStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
