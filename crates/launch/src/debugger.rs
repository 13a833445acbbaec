// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Debugger collaborator interface.
//!
//! A parallel debugger attaches to the launcher process and reads the
//! process table once every task's pid is known. The launch driver
//! feeds this channel from the proc-desc frames; the debugger side only
//! ever reads.

use parking_lot::Mutex;
use steprun_core::DebugState;

/// One row of the debugger process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcTableEntry {
    pub task_id: u32,
    pub host: String,
    pub executable: String,
    pub pid: u32,
}

/// Where the launch engine publishes debugger state.
pub trait DebuggerChannel: Send + Sync {
    /// Publish the complete process table, once per launch.
    fn publish_proc_table(&self, entries: &[ProcTableEntry]);

    /// Flip the debugger state: spawned on success, aborting on a
    /// failed launch reply.
    fn set_debug_state(&self, state: DebugState);
}

/// In-memory debugger channel: holds whatever was last published.
#[derive(Default)]
pub struct ProcTable {
    inner: Mutex<ProcTableInner>,
}

#[derive(Default)]
struct ProcTableInner {
    entries: Vec<ProcTableEntry>,
    state: Option<DebugState>,
    state_changes: u32,
}

impl ProcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ProcTableEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn state(&self) -> Option<DebugState> {
        self.inner.lock().state
    }

    /// How many times the state flipped (a correct launch flips once).
    pub fn state_changes(&self) -> u32 {
        self.inner.lock().state_changes
    }
}

impl DebuggerChannel for ProcTable {
    fn publish_proc_table(&self, entries: &[ProcTableEntry]) {
        self.inner.lock().entries = entries.to_vec();
    }

    fn set_debug_state(&self, state: DebugState) {
        let mut inner = self.inner.lock();
        inner.state = Some(state);
        inner.state_changes += 1;
    }
}

#[cfg(test)]
#[path = "debugger_tests.rs"]
mod tests;
