// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Launch engine errors.

use steprun_wire::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the launch engine.
///
/// Transient peer errors never reach this type: workers absorb them
/// through their retry budget and report exhaustion as node state, not
/// as an error return.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid step: {0}")]
    InvalidStep(#[from] steprun_core::StepError),

    #[error("invalid layout: {0}")]
    InvalidLayout(#[from] steprun_core::LayoutError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("event pipe closed before the job reached a terminal state")]
    PipeClosed,

    #[error("fatal: {0}")]
    FatalInternal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
