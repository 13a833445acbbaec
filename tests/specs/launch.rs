// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end launch scenarios.
//!
//! Every test forks the real message handler, so they are serialized.

use super::support::{make_step, spawn_daemon, wait_for_signals, DaemonPlan, FAKE_DAEMON_UID};
use serial_test::serial;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use steprun_core::{
    Distribution, ExitStatus, HostState, JobState, LaunchOptions, LaunchOptionsBuilder, Step,
    TaskState,
};
use steprun_launch::{
    launch, CancelHandle, DebuggerChannel, LaunchDeps, LaunchReport, ProcTable, RetryPolicy,
};

fn fast_retry() -> RetryPolicy {
    RetryPolicy { budget: 3, delay: Duration::from_millis(10) }
}

fn base_opts(tasks: u32) -> LaunchOptionsBuilder {
    LaunchOptions::builder(tasks)
        .argv(vec!["/bin/app".into()])
        .user(1000, 1000)
        .cwd("/tmp")
        .msg_timeout(Duration::from_secs(2))
}

fn run(
    step: Arc<Step>,
    opts: LaunchOptions,
    one_task_per_node: bool,
    cancel: CancelHandle,
    table: Arc<ProcTable>,
) -> LaunchReport {
    launch(LaunchDeps {
        step,
        opts,
        one_task_per_node,
        cancel,
        debugger: table as Arc<dyn DebuggerChannel>,
        daemon_uid: FAKE_DAEMON_UID,
        retry: fast_retry(),
    })
    .expect("launch should complete")
}

#[test]
#[serial]
fn happy_path_block_three_nodes() {
    let daemons: Vec<_> = (0..3)
        .map(|i| {
            spawn_daemon(DaemonPlan {
                auto_exits: vec![
                    (2 * i, ExitStatus::Code(0)),
                    (2 * i + 1, ExitStatus::Code(0)),
                ],
                ..DaemonPlan::default()
            })
        })
        .collect();
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![2, 2, 2], 6, Distribution::Block);
    assert_eq!(step.layout.tasks_per_node, vec![2, 2, 2]);
    assert_eq!(
        step.layout.global_task_ids,
        vec![vec![0, 1], vec![2, 3], vec![4, 5]]
    );

    let table = Arc::new(ProcTable::new());
    let opts = base_opts(6).parallel_debug(true).build();
    let report = run(step, opts, false, CancelHandle::new(), Arc::clone(&table));

    assert_eq!(report.job_state, JobState::Terminated);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.failed_launches, 0);
    assert!(report.host_states.iter().all(|s| *s == HostState::Replied));
    assert!(report.task_states.iter().all(|s| *s == TaskState::Exited));

    // the debugger saw a complete process table exactly once
    let entries = table.entries();
    assert_eq!(entries.len(), 6);
    for entry in &entries {
        assert_eq!(entry.pid, 1000 + entry.task_id);
        assert_eq!(entry.executable, "/bin/app");
    }
    assert_eq!(table.state(), Some(steprun_core::DebugState::Spawned));
}

#[test]
#[serial]
fn unreachable_node_fails_the_step() {
    let a = spawn_daemon(DaemonPlan { exit_rest_on_signal: true, ..DaemonPlan::default() });
    let c = spawn_daemon(DaemonPlan { exit_rest_on_signal: true, ..DaemonPlan::default() });

    // node B: bound, then closed; every connection is refused
    let dead = TcpListener::bind("127.0.0.1:0").expect("bind");
    let dead_addr = dead.local_addr().expect("addr").to_string();
    drop(dead);

    let step = make_step(
        vec![a.addr.clone(), dead_addr, c.addr.clone()],
        vec![2, 2, 2],
        6,
        Distribution::Block,
    );
    let report = run(step, base_opts(6).build(), false, CancelHandle::new(), Arc::new(ProcTable::new()));

    assert_eq!(report.job_state, JobState::Failed);
    assert_eq!(report.exit_code, 124);
    assert_eq!(report.failed_launches, 1);
    assert_eq!(report.host_states[1], HostState::Unreachable);
    assert_eq!(report.task_states[2], TaskState::Failed);
    assert_eq!(report.task_states[3], TaskState::Failed);

    // the kill broadcast reached the nodes that were up
    wait_for_signals(&a, 1);
    wait_for_signals(&c, 1);
    assert_eq!(a.signals.lock().as_slice(), &[2]);
    assert_eq!(c.signals.lock().as_slice(), &[2]);
}

#[test]
#[serial]
fn cancellation_during_launch() {
    // slow acks hold the first two workers in flight; with two pool
    // slots, nodes 2 and 3 are waiting on admission when cancel lands
    let daemons: Vec<_> = (0..4)
        .map(|_| {
            spawn_daemon(DaemonPlan {
                ack_delay: Duration::from_millis(300),
                respond: false,
                ..DaemonPlan::default()
            })
        })
        .collect();
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![1, 1, 1, 1], 4, Distribution::Block);
    let opts = base_opts(4).max_threads(2).build();

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.request();
    });

    let report = run(step, opts, false, cancel, Arc::new(ProcTable::new()));
    timer.join().expect("timer");

    assert_eq!(report.job_state, JobState::Cancelled);
    assert_eq!(report.exit_code, 130);

    // in-flight workers finished their RPC; the tail never launched
    assert_eq!(report.host_states[0], HostState::Contacted);
    assert_eq!(report.host_states[1], HostState::Contacted);
    assert_eq!(report.host_states[2], HostState::Unreachable);
    assert_eq!(report.host_states[3], HostState::Unreachable);
    assert_eq!(report.task_states[2], TaskState::Failed);
    assert_eq!(report.task_states[3], TaskState::Failed);

    // a single interrupt is the admission-stop phase: nothing may have
    // been signaled through the node daemons
    std::thread::sleep(Duration::from_millis(50));
    for daemon in &daemons {
        assert!(daemon.signals.lock().is_empty(), "first interrupt must not signal tasks");
    }
}

#[test]
#[serial]
fn kill_on_bad_exit_cancels_once() {
    // 16 tasks over 4 nodes; task 7 (node 1) exits with code 3
    let daemons: Vec<_> = (0..4)
        .map(|i| {
            let auto_exits = if i == 1 { vec![(7, ExitStatus::Code(3))] } else { vec![] };
            spawn_daemon(DaemonPlan {
                auto_exits,
                exit_delay: Duration::from_millis(150),
                exit_rest_on_signal: true,
                ..DaemonPlan::default()
            })
        })
        .collect();
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![4, 4, 4, 4], 16, Distribution::Block);
    let opts = base_opts(16).kill_bad_exit(true).build();
    let report = run(step, opts, false, CancelHandle::new(), Arc::new(ProcTable::new()));

    assert_eq!(report.job_state, JobState::Cancelled);
    assert_eq!(report.exit_code, 3);

    // exactly one job-wide cancel: each daemon saw exactly one signal
    for daemon in &daemons {
        wait_for_signals(daemon, 1);
        assert_eq!(daemon.signals.lock().as_slice(), &[2]);
    }
}

#[test]
#[serial]
fn one_task_per_node_coercion() {
    let daemons = vec![
        spawn_daemon(DaemonPlan {
            auto_exits: vec![(0, ExitStatus::Code(0))],
            ..DaemonPlan::default()
        }),
        spawn_daemon(DaemonPlan {
            auto_exits: vec![(4, ExitStatus::Code(0))],
            ..DaemonPlan::default()
        }),
    ];
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![4, 4], 8, Distribution::Block);
    let report =
        run(Arc::clone(&step), base_opts(8).build(), true, CancelHandle::new(), Arc::new(ProcTable::new()));

    // the wire carried one task per node; the step layout is untouched
    for daemon in &daemons {
        assert_eq!(daemon.seen_tasks_to_launch.lock().as_deref(), Some(&[1u32, 1][..]));
    }
    assert_eq!(step.layout.tasks_per_node, vec![4, 4]);

    // completion compared against the node count, not the task total
    assert_eq!(report.job_state, JobState::Terminated);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.task_states[0], TaskState::Exited);
    assert_eq!(report.task_states[4], TaskState::Exited);
}

#[test]
#[serial]
fn reattach_reply_supplies_task_layout() {
    // arbitrary placement puts exactly tasks 10 and 11 on node 2
    let list: Vec<String> = [
        "node0", "node0", "node0", "node0", "node1", "node1", "node1", "node1", "node0", "node1",
        "node2", "node2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let node0_exits: Vec<(u32, ExitStatus)> =
        [0u32, 1, 2, 3, 8].iter().map(|t| (*t, ExitStatus::Code(0))).collect();
    let node1_exits: Vec<(u32, ExitStatus)> =
        [4u32, 5, 6, 7, 9].iter().map(|t| (*t, ExitStatus::Code(0))).collect();

    let daemons = vec![
        spawn_daemon(DaemonPlan { auto_exits: node0_exits, ..DaemonPlan::default() }),
        spawn_daemon(DaemonPlan { auto_exits: node1_exits, ..DaemonPlan::default() }),
        spawn_daemon(DaemonPlan {
            reattach_gtids: Some(vec![10, 11]),
            auto_exits: vec![(10, ExitStatus::Code(0)), (11, ExitStatus::Code(0))],
            ..DaemonPlan::default()
        }),
    ];
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![5, 5, 2], 12, Distribution::Arbitrary(list));
    assert_eq!(step.layout.global_task_ids[2], vec![10, 11]);

    let table = Arc::new(ProcTable::new());
    let opts = base_opts(12).parallel_debug(true).build();
    let report = run(step, opts, false, CancelHandle::new(), Arc::clone(&table));

    assert_eq!(report.job_state, JobState::Terminated);
    assert_eq!(report.host_states[2], HostState::Replied);
    assert_eq!(report.task_states[10], TaskState::Exited);
    assert_eq!(report.task_states[11], TaskState::Exited);

    // proc-table entries for the reattached tasks came from the reply
    let entries = table.entries();
    let reattached: Vec<_> =
        entries.iter().filter(|e| e.task_id == 10 || e.task_id == 11).collect();
    assert_eq!(reattached.len(), 2);
    for entry in reattached {
        assert_eq!(entry.host, "node2");
        assert_eq!(entry.pid, 1000 + entry.task_id);
    }
}

#[test]
#[serial]
fn exit_wait_deadline_terminates_stragglers() {
    // node 0 exits its task immediately; node 1's task never exits
    let daemons = vec![
        spawn_daemon(DaemonPlan {
            auto_exits: vec![(0, ExitStatus::Code(0))],
            ..DaemonPlan::default()
        }),
        spawn_daemon(DaemonPlan { ..DaemonPlan::default() }),
    ];
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![1, 1], 2, Distribution::Block);
    let opts = base_opts(2).max_exit_wait(Duration::from_millis(300)).build();
    let report = run(step, opts, false, CancelHandle::new(), Arc::new(ProcTable::new()));

    assert_eq!(report.job_state, JobState::Failed);
    assert_eq!(report.task_states[0], TaskState::Exited);
    // the straggler was signaled when the wait ran out
    wait_for_signals(&daemons[1], 1);
    assert_eq!(daemons[1].signals.lock().as_slice(), &[2]);
}

#[test]
#[serial]
fn launch_deadline_fails_silent_nodes() {
    // daemons ack but never connect back with a reply
    let daemons: Vec<_> =
        (0..2).map(|_| spawn_daemon(DaemonPlan { respond: false, ..DaemonPlan::default() })).collect();
    let addrs = daemons.iter().map(|d| d.addr.clone()).collect();

    let step = make_step(addrs, vec![1, 1], 2, Distribution::Block);
    let opts = base_opts(2).max_launch_time(Duration::from_millis(400)).build();
    let report = run(step, opts, false, CancelHandle::new(), Arc::new(ProcTable::new()));

    assert_eq!(report.job_state, JobState::Failed);
    assert_eq!(report.exit_code, 124);
    assert!(report.host_states.iter().all(|s| *s == HostState::Contacted));
}
