// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain types for the parallel step launcher: allocations, task
//! layouts, the immutable step record, credentials, and the host, task
//! and job state machines.
//!
//! No I/O lives here. Everything is plain data plus the transition rules
//! the launch engine and message handler both have to agree on.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![forbid(unsafe_code)]

mod alloc;
mod cred;
mod layout;
mod options;
mod state;
mod step;

pub use alloc::{Allocation, AllocationError};
pub use cred::Credential;
pub use layout::{task_count_string, Distribution, LayoutError, TaskLayout};
pub use options::{LaunchOptions, LaunchOptionsBuilder};
pub use state::{job_exit_code, DebugState, ExitStatus, HostState, JobState, TaskState};
pub use step::{NodeLayout, Step, StepError, StepId};
