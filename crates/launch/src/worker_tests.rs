// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Launch worker tests against in-process fake node daemons.

use super::*;
use crate::tracker::TrackerConfig;
use std::net::TcpListener;
use steprun_wire::encode;

/// A daemon that acks each connection with the given return codes, one
/// per accepted connection, then stops accepting.
fn fake_daemon(rcs: Vec<i32>) -> (String, std::thread::JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = std::thread::spawn(move || {
        let mut served = 0;
        for rc in rcs {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let _ = read_message_from(&mut stream);
            let reply = encode(&Message::ReturnCode { rc }).unwrap();
            write_message_to(&mut stream, &reply).unwrap();
            served += 1;
        }
        served
    });
    (addr, handle)
}

fn ctx(total_tasks: u32, nodes: usize) -> WorkerCtx {
    let job = Arc::new(JobStateCell::new());
    let tracker = Arc::new(StateTracker::new(
        TrackerConfig {
            total_tasks,
            node_count: nodes,
            completion_threshold: total_tasks,
            kill_bad_exit: false,
        },
        Arc::clone(&job),
    ));
    WorkerCtx {
        tracker,
        job,
        cancel: CancelHandle::new(),
        retry: RetryPolicy { budget: 3, delay: Duration::from_millis(5) },
        msg_timeout: Duration::from_millis(200),
    }
}

fn request(addr: &str, node_index: usize, task_ids: Vec<u32>) -> NodeRequest {
    NodeRequest {
        node_index,
        host: format!("node{}", node_index),
        addr: addr.to_string(),
        task_ids,
        payload: b"{}".to_vec(),
    }
}

#[test]
fn successful_ack_marks_host_contacted() {
    let (addr, daemon) = fake_daemon(vec![0]);
    let ctx = ctx(2, 1);
    let req = request(&addr, 0, vec![0, 1]);

    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Done);
    assert_eq!(ctx.tracker.host(0), Some(HostState::Contacted));
    assert_eq!(ctx.tracker.task(0), Some(TaskState::Pending));
    assert_eq!(daemon.join().unwrap(), 1);
}

#[test]
fn transient_denial_retries_then_succeeds() {
    let (addr, daemon) = fake_daemon(vec![1, 0]);
    let ctx = ctx(2, 1);
    let req = request(&addr, 0, vec![0, 1]);

    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Done);
    assert_eq!(ctx.tracker.host(0), Some(HostState::Contacted));
    assert_eq!(daemon.join().unwrap(), 2);
}

#[test]
fn invalid_credential_never_retries() {
    let (addr, daemon) = fake_daemon(vec![RC_INVALID_JOB_CREDENTIAL, 0]);
    let ctx = ctx(2, 1);
    let req = request(&addr, 0, vec![0, 1]);

    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Failed);
    assert_eq!(ctx.tracker.host(0), Some(HostState::Unreachable));
    assert_eq!(ctx.tracker.task(0), Some(TaskState::Failed));
    assert_eq!(ctx.tracker.task(1), Some(TaskState::Failed));

    // the daemon is still waiting for a second connection that never
    // came; unblock it so the thread can be collected
    let mut s = std::net::TcpStream::connect(&addr).unwrap();
    let _ = write_message_to(&mut s, b"{}");
    let _ = daemon.join();
}

#[test]
fn unreachable_daemon_exhausts_retries() {
    // bind a port, then drop the listener so connections are refused
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let ctx = ctx(2, 1);
    let req = request(&addr, 0, vec![0, 1]);

    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Failed);
    assert_eq!(ctx.tracker.host(0), Some(HostState::Unreachable));
    assert_eq!(ctx.tracker.task(0), Some(TaskState::Failed));
    assert_eq!(ctx.tracker.task(1), Some(TaskState::Failed));
    assert_eq!(ctx.tracker.exited_count(), 2);
}

#[test]
fn no_retry_once_job_left_launching() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let ctx = ctx(1, 1);
    ctx.job.advance(JobState::Starting);
    let req = request(&addr, 0, vec![0]);

    let start = std::time::Instant::now();
    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Failed);
    // one attempt, no retry sleeps
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(ctx.tracker.host(0), Some(HostState::Unreachable));
}

#[test]
fn cancellation_records_no_state() {
    let (addr, daemon) = fake_daemon(vec![]);
    let ctx = ctx(2, 1);
    ctx.cancel.request();
    let req = request(&addr, 0, vec![0, 1]);

    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Failed);
    // the cancellation path owns teardown: no host or task writes
    assert_eq!(ctx.tracker.host(0), Some(HostState::Init));
    assert_eq!(ctx.tracker.task(0), Some(TaskState::Pending));
    drop(daemon);
}

#[test]
fn garbage_ack_is_a_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let daemon = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_message_from(&mut stream);
        // framed, but not a message the worker understands
        write_message_to(&mut stream, b"\"nonsense\"").unwrap();
    });

    let ctx = ctx(1, 1);
    let req = request(&addr, 0, vec![0]);

    // protocol errors are non-transient: one connection, no retry
    assert_eq!(launch_one(&ctx, &req), WorkerOutcome::Failed);
    assert_eq!(ctx.tracker.host(0), Some(HostState::Unreachable));
    daemon.join().unwrap();
}

#[test]
fn error_classification() {
    assert!(RpcError::Timeout.is_transient());
    assert!(RpcError::Interrupted.is_transient());
    assert!(RpcError::Connect("refused".into()).is_transient());
    assert!(RpcError::Denied(1).is_transient());
    assert!(!RpcError::InvalidCredential.is_transient());
    assert!(!RpcError::Protocol("bad".into()).is_transient());
    assert!(!RpcError::BadAddr("nowhere".into()).is_transient());
}
