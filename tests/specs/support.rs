// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake node daemons for launch scenarios.
//!
//! Each daemon owns one listener, acks launch requests, optionally
//! connects back to the response port with a launch (or reattach) reply
//! and task-exit notices, and can exit its remaining tasks when the
//! launcher forwards a signal.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use steprun_core::{Allocation, Credential, Distribution, ExitStatus, Step, StepId, TaskLayout};
use steprun_wire::{
    decode, encode, read_message_from, wait_status_from_exit, write_message_to, LaunchResponse,
    Message, ReattachResponse,
};

/// Uid the fake daemons claim in their callbacks.
pub const FAKE_DAEMON_UID: u32 = 64030;

/// Script for one fake daemon.
#[derive(Clone)]
pub struct DaemonPlan {
    /// Return code for the launch ack
    pub ack_rc: i32,
    /// Sleep before acking, to hold a worker in flight
    pub ack_delay: Duration,
    /// Connect back with a launch reply after a successful ack
    pub respond: bool,
    /// Reply with a reattach response carrying these gtids instead of a
    /// launch response
    pub reattach_gtids: Option<Vec<u32>>,
    /// Task exits to send right after the reply: `(task_id, status)`
    pub auto_exits: Vec<(u32, ExitStatus)>,
    /// Sleep between the reply and the first auto exit
    pub exit_delay: Duration,
    /// Exit every remaining task when a forwarded signal arrives
    pub exit_rest_on_signal: bool,
}

impl Default for DaemonPlan {
    fn default() -> Self {
        Self {
            ack_rc: 0,
            ack_delay: Duration::ZERO,
            respond: true,
            reattach_gtids: None,
            auto_exits: Vec::new(),
            exit_delay: Duration::ZERO,
            exit_rest_on_signal: false,
        }
    }
}

impl DaemonPlan {
    /// Ack, reply, and exit every assigned task cleanly.
    pub fn clean_exit() -> Self {
        Self { auto_exits: vec![], exit_rest_on_signal: false, ..Self::default() }
    }
}

/// A running fake daemon.
pub struct FakeDaemon {
    pub addr: String,
    /// Signals received via `signal_tasks`, in arrival order
    pub signals: Arc<Mutex<Vec<i32>>>,
    /// `tasks_to_launch` from the launch request this daemon received
    pub seen_tasks_to_launch: Arc<Mutex<Option<Vec<u32>>>>,
}

/// Spawn a daemon following `plan`. `exit_all_after_reply` exits every
/// assigned task with the given status right after the reply.
pub fn spawn_daemon(plan: DaemonPlan) -> FakeDaemon {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake daemon");
    let addr = listener.local_addr().expect("local addr").to_string();
    let signals = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(None));

    let thread_signals = Arc::clone(&signals);
    let thread_seen = Arc::clone(&seen);
    std::thread::spawn(move || daemon_main(listener, plan, thread_signals, thread_seen));

    FakeDaemon { addr, signals, seen_tasks_to_launch: seen }
}

fn daemon_main(
    listener: TcpListener,
    plan: DaemonPlan,
    signals: Arc<Mutex<Vec<i32>>>,
    seen: Arc<Mutex<Option<Vec<u32>>>>,
) {
    let mut resp_addr: Option<String> = None;
    let mut my_tasks: Vec<u32> = Vec::new();
    let mut exited: HashSet<u32> = HashSet::new();

    loop {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let Ok(bytes) = read_message_from(&mut stream) else {
            continue;
        };
        let Ok(msg) = decode::<Message>(&bytes) else {
            continue;
        };

        match msg {
            Message::LaunchTasks { common, node_id } => {
                if !plan.ack_delay.is_zero() {
                    std::thread::sleep(plan.ack_delay);
                }
                *seen.lock() = Some(common.tasks_to_launch.clone());
                let _ = send_on(&mut stream, &Message::ReturnCode { rc: plan.ack_rc });
                drop(stream);
                if plan.ack_rc != 0 {
                    continue;
                }

                let node = node_id as usize;
                let reply_to =
                    format!("127.0.0.1:{}", common.resp_port[node]);
                my_tasks = match &plan.reattach_gtids {
                    Some(gtids) => gtids.clone(),
                    None => common.global_task_ids[node].clone(),
                };
                resp_addr = Some(reply_to.clone());

                if !plan.respond {
                    continue;
                }

                let pids: Vec<u32> = my_tasks.iter().map(|tid| 1000 + tid).collect();
                let reply = match &plan.reattach_gtids {
                    Some(gtids) => Message::ReattachResponse(ReattachResponse {
                        uid: FAKE_DAEMON_UID,
                        srun_node_id: node_id,
                        node_name: format!("node{}", node_id),
                        return_code: 0,
                        local_pids: pids,
                        gtids: gtids.clone(),
                        executable_name: "/bin/app".into(),
                    }),
                    None => Message::LaunchResponse(LaunchResponse {
                        uid: FAKE_DAEMON_UID,
                        srun_node_id: node_id,
                        node_name: format!("node{}", node_id),
                        return_code: 0,
                        local_pids: pids,
                    }),
                };
                let _ = send_to(&reply_to, &reply);

                if !plan.auto_exits.is_empty() && !plan.exit_delay.is_zero() {
                    std::thread::sleep(plan.exit_delay);
                }
                for (task_id, status) in &plan.auto_exits {
                    exited.insert(*task_id);
                    let _ = send_to(
                        &reply_to,
                        &Message::TaskExit {
                            uid: FAKE_DAEMON_UID,
                            task_id_list: vec![*task_id],
                            return_code: wait_status_from_exit(*status),
                        },
                    );
                }
            }

            Message::SignalTasks { signal, .. } => {
                signals.lock().push(signal);
                if !plan.exit_rest_on_signal {
                    continue;
                }
                let Some(reply_to) = resp_addr.clone() else {
                    continue;
                };
                let rest: Vec<u32> =
                    my_tasks.iter().copied().filter(|tid| !exited.contains(tid)).collect();
                if rest.is_empty() {
                    continue;
                }
                exited.extend(rest.iter().copied());
                let _ = send_to(
                    &reply_to,
                    &Message::TaskExit {
                        uid: FAKE_DAEMON_UID,
                        task_id_list: rest,
                        return_code: wait_status_from_exit(ExitStatus::Signal(signal)),
                    },
                );
            }

            _ => {}
        }
    }
}

fn send_on(stream: &mut TcpStream, msg: &Message) -> Result<(), steprun_wire::ProtocolError> {
    let payload = encode(msg)?;
    write_message_to(stream, &payload)
}

fn send_to(addr: &str, msg: &Message) -> Result<(), steprun_wire::ProtocolError> {
    let mut stream = TcpStream::connect(addr)?;
    send_on(&mut stream, msg)
}

/// Wait until the daemon has observed `count` forwarded signals.
/// Delivery is asynchronous; gives up after two seconds.
pub fn wait_for_signals(daemon: &FakeDaemon, count: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while daemon.signals.lock().len() < count && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Build a step over the given daemon addresses.
pub fn make_step(addrs: Vec<String>, cpus: Vec<u32>, tasks: u32, dist: Distribution) -> Arc<Step> {
    let n = addrs.len();
    let nodes: Vec<String> = (0..n).map(|i| format!("node{}", i)).collect();
    let alloc = Allocation::new(nodes.clone(), addrs, cpus).expect("allocation");
    let layout = TaskLayout::compute(&alloc, tasks, &dist, true).expect("layout");
    let cred = Credential::forge(42, 7, 1000, nodes);
    Arc::new(
        Step::new(StepId::new(42, 7), alloc, layout, cred, vec![], vec![0; n], vec![0; n])
            .expect("step"),
    )
}
