// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The launch driver: composition of builder, pool, workers, tracker,
//! forked handler and event pipe into one `launch` call.
//!
//! The calling thread consumes the event pipe; a launcher thread feeds
//! the worker pool. Teardown always joins the launcher, drains the pipe
//! to EOF and reaps the helper, whatever way the step ended.

use crate::builder::build_requests;
use crate::debugger::{DebuggerChannel, ProcTableEntry};
use crate::error::LaunchError;
use crate::handler::{HandlerConfig, HandlerProc};
use crate::job::JobStateCell;
use crate::pipe::{event_pipe, PipeEvent, PipeReader};
use crate::pool::{PoolConfig, WorkerPool};
use crate::signals::{forward_signal, CancelHandle};
use crate::tracker::{StateTracker, TrackerConfig};
use crate::worker::{launch_one, RetryPolicy, WorkerCtx};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use steprun_core::{HostState, JobState, LaunchOptions, Step, TaskState};
use steprun_wire::PipeFrame;

/// Loop tick bounding how stale a cancel-flag or deadline check can be.
const POLL_TICK: Duration = Duration::from_millis(200);

/// Everything `launch` needs from its collaborators.
pub struct LaunchDeps {
    pub step: Arc<Step>,
    pub opts: LaunchOptions,
    /// The MPI collaborator declared one task per node (queried once,
    /// at request-build time)
    pub one_task_per_node: bool,
    pub cancel: CancelHandle,
    pub debugger: Arc<dyn DebuggerChannel>,
    /// Uid the cluster daemons run as, for inbound callback auth
    pub daemon_uid: u32,
    pub retry: RetryPolicy,
}

/// What the launch amounted to.
#[derive(Debug)]
pub struct LaunchReport {
    pub job_state: JobState,
    /// Process exit code for the caller: `128 + signal` when a signal
    /// dominated, 124 for a failed launch, max task exit code otherwise
    pub exit_code: i32,
    pub host_states: Vec<HostState>,
    pub task_states: Vec<TaskState>,
    /// Launch workers that reported failure
    pub failed_launches: usize,
}

struct LauncherSummary {
    failed: usize,
}

/// Launch the step and drive it to a terminal state.
pub fn launch(deps: LaunchDeps) -> Result<LaunchReport, LaunchError> {
    let LaunchDeps { step, opts, one_task_per_node, cancel, debugger, daemon_uid, retry } = deps;

    let total_tasks = step.total_tasks;
    let threshold =
        if one_task_per_node { step.node_count() as u32 } else { total_tasks };

    let job = Arc::new(JobStateCell::new());
    let tracker = Arc::new(StateTracker::new(
        TrackerConfig {
            total_tasks,
            node_count: step.node_count(),
            completion_threshold: threshold,
            kill_bad_exit: opts.kill_bad_exit,
        },
        Arc::clone(&job),
    ));
    let rc_override: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

    // reply listener and helper; the bound port goes into every request
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let resp_port = listener.local_addr()?.port();
    let (reader, writer) = event_pipe()?;
    let helper = HandlerProc::spawn(
        listener,
        writer,
        HandlerConfig {
            daemon_uid,
            caller_uid: opts.uid,
            total_tasks,
            completion_threshold: threshold,
            global_task_ids: step.layout.global_task_ids.clone(),
            no_kill: opts.no_kill,
        },
    )?;

    tracing::debug!(
        step = %step.id,
        tasks = total_tasks,
        nodes = step.node_count(),
        resp_port,
        "launching step"
    );

    let launcher = spawn_launcher(
        Arc::clone(&step),
        opts.clone(),
        one_task_per_node,
        resp_port,
        Arc::clone(&job),
        Arc::clone(&tracker),
        cancel.clone(),
        retry,
        Arc::clone(&rc_override),
    )?;

    let mut driver = Driver {
        step: Arc::clone(&step),
        executable: opts.argv.first().cloned().unwrap_or_default(),
        job: Arc::clone(&job),
        tracker: Arc::clone(&tracker),
        cancel: cancel.clone(),
        debugger,
        rc_override: Arc::clone(&rc_override),
        proc_entries: vec![None; total_tasks as usize],
        running_seen: false,
        cancel_handled: false,
    };

    let mut reader = reader;
    let run_result = driver.run(&mut reader, &opts);
    if run_result.is_err() {
        // a broken pipe is unrecoverable: stop admissions and retries
        // so the launcher drains, then clean up before reporting
        job.advance(JobState::Failed);
    }

    // teardown: join the launcher (it joins every worker), stop and
    // reap the helper, then drain the pipe to the EOF its exit produced
    let summary = match launcher.join() {
        Ok(result) => result,
        Err(_) => Err(LaunchError::FatalInternal("launcher thread panicked".into())),
    };
    let reaped = helper.reap();
    if run_result.is_ok() {
        driver.settle(&mut reader);
    }
    run_result?;
    let summary = summary?;
    let helper_rc = reaped?;
    tracing::debug!(helper_rc, "helper reaped");

    let job_state = job.get();
    let exit_code = (*rc_override.lock()).unwrap_or_else(|| match job_state {
        // user cancellation dominates: shell-style 128 + SIGINT,
        // whichever phase ended the step
        JobState::Cancelled if cancel.is_cancelled() => 128 + nix::libc::SIGINT,
        JobState::ForceTerm => 1,
        _ => tracker.exit_code(),
    });

    Ok(LaunchReport {
        job_state,
        exit_code,
        host_states: tracker.hosts(),
        task_states: tracker.tasks(),
        failed_launches: summary.failed,
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_launcher(
    step: Arc<Step>,
    opts: LaunchOptions,
    one_task_per_node: bool,
    resp_port: u16,
    job: Arc<JobStateCell>,
    tracker: Arc<StateTracker>,
    cancel: CancelHandle,
    retry: RetryPolicy,
    rc_override: Arc<Mutex<Option<i32>>>,
) -> Result<std::thread::JoinHandle<Result<LauncherSummary, LaunchError>>, LaunchError> {
    std::thread::Builder::new()
        .name("launcher".into())
        .spawn(move || {
            let result = run_launcher(
                &step,
                &opts,
                one_task_per_node,
                resp_port,
                &job,
                &tracker,
                &cancel,
                retry,
                &rc_override,
            );
            if result.is_err() {
                // never leave the main loop waiting on a launch that
                // cannot happen
                job.advance(JobState::Failed);
            }
            result
        })
        .map_err(|err| LaunchError::FatalInternal(format!("launcher spawn failed: {}", err)))
}

#[allow(clippy::too_many_arguments)]
fn run_launcher(
    step: &Arc<Step>,
    opts: &LaunchOptions,
    one_task_per_node: bool,
    resp_port: u16,
    job: &Arc<JobStateCell>,
    tracker: &Arc<StateTracker>,
    cancel: &CancelHandle,
    retry: RetryPolicy,
    rc_override: &Mutex<Option<i32>>,
) -> Result<LauncherSummary, LaunchError> {
    let requests = build_requests(step, opts, one_task_per_node, resp_port)?;

    let pool = WorkerPool::new(PoolConfig {
        max_threads: opts.max_threads.max(1),
        ..PoolConfig::default()
    });
    let work_ctx = Arc::new(WorkerCtx {
        tracker: Arc::clone(tracker),
        job: Arc::clone(job),
        cancel: cancel.clone(),
        retry,
        msg_timeout: opts.msg_timeout,
    });

    let stop_job = Arc::clone(job);
    let stop_cancel = cancel.clone();
    let report = pool.dispatch(
        requests,
        move |req| launch_one(&work_ctx, &req),
        move || stop_cancel.is_cancelled() || stop_job.get() > JobState::Launching,
    )?;

    // requests that were never admitted: their nodes were never
    // contacted, their tasks never ran
    for (_, req) in &report.skipped {
        tracker.set_host(req.node_index, HostState::Unreachable);
        for task_id in &req.task_ids {
            tracker.set_task(*task_id, TaskState::Failed);
        }
    }

    if cancel.is_cancelled() && !job.get().is_terminal() {
        // first-phase cancel: no launch remains to wait for once the
        // in-flight workers are drained, so tear down in order
        tracing::info!("launch stopped on cancel request");
        job.advance(JobState::Cancelled);
    } else if report.failed > 0 && !job.get().is_terminal() {
        tracing::error!(failed = report.failed, "launch requests failed");
        set_rc_once(rc_override, 124);
        tracker.set_signaled();
        forward_signal(step, &reachable_nodes(tracker), nix::libc::SIGINT);
        job.advance(JobState::Failed);
    } else if report.skipped.is_empty() && report.failed == 0 {
        tracing::debug!("all task launch requests sent");
        job.advance(JobState::Starting);
    }

    Ok(LauncherSummary { failed: report.failed })
}

/// Pipe consumption and deadline bookkeeping for one launch.
struct Driver {
    step: Arc<Step>,
    executable: String,
    job: Arc<JobStateCell>,
    tracker: Arc<StateTracker>,
    cancel: CancelHandle,
    debugger: Arc<dyn DebuggerChannel>,
    rc_override: Arc<Mutex<Option<i32>>>,
    proc_entries: Vec<Option<ProcTableEntry>>,
    running_seen: bool,
    cancel_handled: bool,
}

impl Driver {
    fn run(&mut self, reader: &mut PipeReader, opts: &LaunchOptions) -> Result<(), LaunchError> {
        let mut launch_deadline = Some(Instant::now() + opts.max_launch_time);
        let mut exit_deadline: Option<Instant> = None;
        let mut exit_wait_done = false;

        while !self.job.get().is_terminal() {
            // a single interrupt during launch only stops admissions
            // (the pool polls the flag); the step's tasks are signaled
            // on the second interrupt, or on any interrupt once the
            // requests are out
            if self.cancel.is_cancelled()
                && !self.cancel_handled
                && (self.cancel.interrupt_count() >= 2
                    || self.job.get() >= JobState::Starting)
            {
                self.cancel_step();
                continue;
            }

            match reader.read_event(Some(POLL_TICK))? {
                PipeEvent::Frame(frame) => self.apply(frame),
                PipeEvent::Eof => {
                    tracing::error!("message handler exited before the step finished");
                    self.job.advance(JobState::Failed);
                    break;
                }
                PipeEvent::TimedOut => {}
            }

            let now = Instant::now();

            // launch deadline: every node must have replied by now
            if let Some(deadline) = launch_deadline {
                if self.tracker.unreplied_hosts().is_empty() {
                    launch_deadline = None;
                } else if now >= deadline && !self.job.get().is_terminal() {
                    self.launch_deadline_expired();
                }
            }

            // exit-wait deadline: starts at the first task exit
            if exit_deadline.is_none() && self.tracker.exited_count() > 0 {
                let wait = opts.max_exit_wait.unwrap_or(Duration::from_secs(60));
                exit_deadline = Some(now + wait);
            }
            if let Some(deadline) = exit_deadline {
                if now >= deadline && !exit_wait_done {
                    exit_wait_done = true;
                    self.exit_wait_expired(opts);
                }
            }
        }

        Ok(())
    }

    fn apply(&mut self, frame: PipeFrame) {
        match frame {
            PipeFrame::HostState { node, state } => {
                self.tracker.set_host(node as usize, state);
            }
            PipeFrame::TaskState { task, state } => {
                if state == TaskState::Running && !self.running_seen {
                    self.running_seen = true;
                    self.job.advance(JobState::Running);
                }
                self.tracker.set_task(task, state);
            }
            PipeFrame::TaskExit { task, status } => {
                if !status.is_clean() && !self.tracker.signaled() {
                    let host = self
                        .step
                        .node_of_task(task)
                        .map(|i| self.step.alloc.nodes[i].as_str())
                        .unwrap_or("unknown");
                    tracing::warn!(task, host, %status, "task exited abnormally");
                }
                if self.tracker.record_exit(task, status) {
                    tracing::info!(task, %status, "terminating step: task exited non-zero");
                    self.kill_step(JobState::Cancelled);
                }
            }
            PipeFrame::JobState { state } => {
                self.job.advance(state);
            }
            PipeFrame::SignalAck { signal } => {
                self.tracker.set_signaled();
                forward_signal(&self.step, &reachable_nodes(&self.tracker), signal);
            }
            PipeFrame::ProcTableSize { tasks } => {
                if tasks as usize != self.proc_entries.len() {
                    self.proc_entries.resize(tasks as usize, None);
                }
            }
            PipeFrame::ProcDesc { task, node, pid } => {
                let Some(host) = self.step.alloc.nodes.get(node as usize) else {
                    tracing::warn!(task, node, "proc desc for unknown node dropped");
                    return;
                };
                if let Some(slot) = self.proc_entries.get_mut(task as usize) {
                    *slot = Some(ProcTableEntry {
                        task_id: task,
                        host: host.clone(),
                        executable: self.executable.clone(),
                        pid,
                    });
                }
            }
            PipeFrame::DebugState { state } => {
                if state == steprun_core::DebugState::Spawned {
                    let entries: Vec<ProcTableEntry> =
                        self.proc_entries.iter().flatten().cloned().collect();
                    self.debugger.publish_proc_table(&entries);
                }
                self.debugger.set_debug_state(state);
            }
        }
    }

    /// Hard cancellation observed: signal the tasks and stop the step.
    fn cancel_step(&mut self) {
        self.cancel_handled = true;
        tracing::info!("cancel requested, signaling tasks and stopping step");
        self.kill_step(JobState::Cancelled);
    }

    /// The launch window closed with silent nodes: 124, step failed.
    fn launch_deadline_expired(&mut self) {
        for node in self.tracker.unreplied_hosts() {
            tracing::error!(
                host = %self.step.alloc.nodes[node],
                "node not responding, terminating job step"
            );
        }
        set_rc_once(&self.rc_override, 124);
        self.kill_step(JobState::Failed);
    }

    fn exit_wait_expired(&mut self, opts: &LaunchOptions) {
        let remaining: Vec<u32> = self
            .tracker
            .tasks()
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(t, _)| t as u32)
            .collect();
        if opts.max_exit_wait.is_some() {
            tracing::error!(?remaining, "first task exited too long ago, terminating step");
            self.kill_step(JobState::Failed);
        } else {
            tracing::warn!(?remaining, "first task exited and others are still running");
        }
    }

    /// Signal the step's tasks and move the job to `state`.
    fn kill_step(&mut self, state: JobState) {
        self.tracker.set_signaled();
        forward_signal(&self.step, &reachable_nodes(&self.tracker), nix::libc::SIGINT);
        self.job.advance(state);
    }

    /// Drain frames still in flight after the helper exited, so the
    /// final report reflects every delta the helper observed.
    fn settle(&mut self, reader: &mut PipeReader) {
        loop {
            match reader.read_event(None) {
                Ok(PipeEvent::Frame(frame)) => self.apply(frame),
                Ok(PipeEvent::Eof) | Ok(PipeEvent::TimedOut) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "event pipe drain failed");
                    break;
                }
            }
        }
    }
}

fn reachable_nodes(tracker: &StateTracker) -> Vec<bool> {
    tracker
        .hosts()
        .iter()
        .map(|s| matches!(s, HostState::Contacted | HostState::Replied))
        .collect()
}

fn set_rc_once(rc: &Mutex<Option<i32>>, code: i32) {
    let mut slot = rc.lock();
    if slot.is_none() {
        *slot = Some(code);
    }
}
