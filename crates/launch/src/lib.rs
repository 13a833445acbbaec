// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The parallel task-launch engine.
//!
//! Given an already-created step (allocation, layout, signed credential),
//! this crate fans the launch out across the step's nodes with a bounded
//! worker pool, tracks per-node and per-task outcomes, receives replies
//! through a forked message-handler process connected back over a framed
//! event pipe, and drives orderly teardown on success, partial failure,
//! cancellation or timeout.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod builder;
mod debugger;
mod error;
mod handler;
mod job;
mod launch;
mod pipe;
mod pool;
mod signals;
mod tracker;
mod worker;

pub use builder::{build_requests, NodeRequest};
pub use debugger::{DebuggerChannel, ProcTable, ProcTableEntry};
pub use error::LaunchError;
pub use handler::{serve, HandlerConfig, HandlerProc};
pub use job::JobStateCell;
pub use launch::{launch, LaunchDeps, LaunchReport};
pub use pipe::{event_pipe, PipeEvent, PipeReader, PipeWriter};
pub use pool::{DispatchReport, PoolConfig, WorkerOutcome, WorkerPool};
pub use signals::{forward_signal, mask_launch_signals, CancelHandle, SignalWatcher};
pub use tracker::{StateTracker, TrackerConfig};
pub use worker::{launch_one, RetryPolicy, RpcError, WorkerCtx};
