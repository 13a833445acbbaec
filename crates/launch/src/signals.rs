// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancellation and signal handling.
//!
//! The launcher masks SIGINT/SIGTERM/SIGQUIT on every thread (the mask
//! is inherited) and a dedicated watcher thread waits for them. The
//! first SIGINT during launch only flips the shared cancel flag, which
//! the worker pool polls at each admission; a second SIGINT, or any
//! signal once the job is running, is forwarded to the tasks through
//! their node daemons.

use crate::job::JobStateCell;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use steprun_core::{JobState, Step};
use steprun_wire::{encode, write_message_to, Message};

/// Shared cancellation state.
///
/// Cloned handles observe the same flag; workers poll it between RPC
/// attempts and the pool polls it at each admission.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    interrupts: AtomicU32,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                interrupts: AtomicU32::new(0),
            }),
        }
    }

    /// Request cancellation. Returns the number of requests so far,
    /// counting this one.
    pub fn request(&self) -> u32 {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.interrupts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> u32 {
        self.inner.interrupts.load(Ordering::SeqCst)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Block SIGINT/SIGTERM/SIGQUIT on the calling thread.
///
/// Call once on the main thread before spawning anything so every
/// thread inherits the mask and only the watcher consumes the signals.
pub fn mask_launch_signals() -> Result<SigSet, nix::Error> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGQUIT);
    nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    Ok(set)
}

/// The signal watcher thread.
pub struct SignalWatcher {
    handle: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Spawn the watcher over a masked signal set.
    ///
    /// `forward` delivers a signal to the step's tasks; it runs on the
    /// watcher thread. The watcher exits after forwarding a fatal
    /// signal, or silently when the process does.
    pub fn spawn<F>(
        set: SigSet,
        cancel: CancelHandle,
        job: Arc<JobStateCell>,
        forward: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(i32) + Send + 'static,
    {
        let handle = std::thread::Builder::new().name("signal-watcher".into()).spawn(move || {
            loop {
                let sig = match set.wait() {
                    Ok(sig) => sig,
                    Err(err) => {
                        tracing::warn!(error = %err, "signal wait failed");
                        return;
                    }
                };
                let state = job.get();
                if sig == Signal::SIGINT
                    && state == JobState::Launching
                    && cancel.interrupt_count() == 0
                {
                    tracing::info!("interrupt: stopping launch (interrupt again to signal tasks)");
                    cancel.request();
                    continue;
                }
                // second interrupt, or any signal after launch: forward
                // to the tasks and stop the step
                tracing::info!(signal = %sig, "forwarding signal to remaining tasks");
                cancel.request();
                forward(sig as i32);
                job.advance(JobState::Cancelled);
                return;
            }
        })?;
        Ok(Self { handle: Some(handle) })
    }

    /// Detach the watcher; it exits with the process.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

/// Send `signal` to the step's tasks on every node that was reached.
///
/// Delivery is best-effort: a node that cannot be reached is logged and
/// skipped, exactly like a dead daemon would drop the signal.
pub fn forward_signal(step: &Step, reachable: &[bool], signal: i32) {
    let msg = Message::SignalTasks {
        job_id: step.id.job_id,
        step_id: step.id.step_id,
        signal,
    };
    let payload = match encode(&msg) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "signal message encode failed");
            return;
        }
    };

    for (i, ok) in reachable.iter().enumerate() {
        if !ok {
            continue;
        }
        let addr = &step.alloc.daemon_addrs[i];
        if let Err(err) = send_to(addr, &payload) {
            tracing::debug!(host = %step.alloc.nodes[i], error = %err, "signal delivery failed");
        }
    }
}

fn send_to(addr: &str, payload: &[u8]) -> std::io::Result<()> {
    let timeout = Duration::from_secs(2);
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address"))?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    write_message_to(&mut stream, payload).map_err(std::io::Error::other)
}

#[cfg(test)]
#[path = "signals_tests.rs"]
mod tests;
