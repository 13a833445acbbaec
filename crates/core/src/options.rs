// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pre-parsed launch options.
//!
//! Command-line parsing happens upstream; the engine receives this
//! structure fully resolved.

use crate::layout::Distribution;
use std::time::Duration;

/// Everything the caller decides about a launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Total tasks in the step
    pub nprocs: u32,
    pub cpus_per_task: u32,
    /// Ceiling on concurrently dispatching launch workers
    pub max_threads: usize,
    /// Deadline for every node to reply, measured from dispatch start
    pub max_launch_time: Duration,
    /// Grace period after the first task exits; `None` warns only
    pub max_exit_wait: Option<Duration>,
    /// Per-RPC receive timeout
    pub msg_timeout: Duration,
    pub distribution: Distribution,
    /// Allow more tasks than allocated CPUs
    pub overcommit: bool,
    /// Cancel the whole step when any task exits non-zero
    pub kill_bad_exit: bool,
    /// Publish the debugger process table
    pub parallel_debug: bool,
    /// Tolerate node failure instead of force-terminating
    pub no_kill: bool,
    pub uid: u32,
    pub gid: u32,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

impl LaunchOptions {
    pub fn builder(nprocs: u32) -> LaunchOptionsBuilder {
        LaunchOptionsBuilder {
            nprocs,
            cpus_per_task: 1,
            max_threads: 10,
            max_launch_time: Duration::from_secs(60),
            max_exit_wait: None,
            msg_timeout: Duration::from_secs(10),
            distribution: Distribution::Block,
            overcommit: false,
            kill_bad_exit: false,
            parallel_debug: false,
            no_kill: false,
            uid: 0,
            gid: 0,
            argv: Vec::new(),
            env: Vec::new(),
            cwd: String::new(),
        }
    }
}

pub struct LaunchOptionsBuilder {
    nprocs: u32,
    cpus_per_task: u32,
    max_threads: usize,
    max_launch_time: Duration,
    max_exit_wait: Option<Duration>,
    msg_timeout: Duration,
    distribution: Distribution,
    overcommit: bool,
    kill_bad_exit: bool,
    parallel_debug: bool,
    no_kill: bool,
    uid: u32,
    gid: u32,
    argv: Vec<String>,
    env: Vec<String>,
    cwd: String,
}

impl LaunchOptionsBuilder {
    pub fn cpus_per_task(mut self, n: u32) -> Self {
        self.cpus_per_task = n;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn max_launch_time(mut self, d: Duration) -> Self {
        self.max_launch_time = d;
        self
    }

    pub fn max_exit_wait(mut self, d: Duration) -> Self {
        self.max_exit_wait = Some(d);
        self
    }

    pub fn msg_timeout(mut self, d: Duration) -> Self {
        self.msg_timeout = d;
        self
    }

    pub fn distribution(mut self, dist: Distribution) -> Self {
        self.distribution = dist;
        self
    }

    pub fn overcommit(mut self, yes: bool) -> Self {
        self.overcommit = yes;
        self
    }

    pub fn kill_bad_exit(mut self, yes: bool) -> Self {
        self.kill_bad_exit = yes;
        self
    }

    pub fn parallel_debug(mut self, yes: bool) -> Self {
        self.parallel_debug = yes;
        self
    }

    pub fn no_kill(mut self, yes: bool) -> Self {
        self.no_kill = yes;
        self
    }

    pub fn user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn build(self) -> LaunchOptions {
        LaunchOptions {
            nprocs: self.nprocs,
            cpus_per_task: self.cpus_per_task,
            max_threads: self.max_threads,
            max_launch_time: self.max_launch_time,
            max_exit_wait: self.max_exit_wait,
            msg_timeout: self.msg_timeout,
            distribution: self.distribution,
            overcommit: self.overcommit,
            kill_bad_exit: self.kill_bad_exit,
            parallel_debug: self.parallel_debug,
            no_kill: self.no_kill,
            uid: self.uid,
            gid: self.gid,
            argv: self.argv,
            env: self.env,
            cwd: self.cwd,
        }
    }
}
