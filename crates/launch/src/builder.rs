// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Launch request construction: one request per node around a shared,
//! once-serialized common payload.

use crate::error::LaunchError;
use steprun_core::{task_count_string, Distribution, LaunchOptions, Step};
use steprun_wire::{EncodedCommon, LaunchCommon, TASK_PARALLEL_DEBUG};

/// One node's launch request, ready to send.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub node_index: usize,
    pub host: String,
    /// The node daemon's address
    pub addr: String,
    /// Global task ids launching on this node
    pub task_ids: Vec<u32>,
    /// Pre-encoded wire bytes (common payload + node id)
    pub payload: Vec<u8>,
}

/// Build the per-node request array for a step.
///
/// The common payload is serialized exactly once and spliced into every
/// request. When the MPI collaborator declared one task per node,
/// `tasks_to_launch` is coerced to 1 per node for transmission only; the
/// step's layout (and the task ids each worker watches) is unchanged.
/// `resp_port` is the freshly bound reply listener port, stamped into
/// every request.
pub fn build_requests(
    step: &Step,
    opts: &LaunchOptions,
    one_task_per_node: bool,
    resp_port: u16,
) -> Result<Vec<NodeRequest>, LaunchError> {
    let n = step.node_count();

    let tasks_to_launch: Vec<u32> = if one_task_per_node {
        vec![1; n]
    } else {
        step.layout.tasks_per_node.clone()
    };

    let mut task_flags = 0u32;
    if opts.parallel_debug {
        task_flags |= TASK_PARALLEL_DEBUG;
    }

    let common = LaunchCommon {
        job_id: step.id.job_id,
        step_id: step.id.step_id,
        uid: opts.uid,
        gid: opts.gid,
        argv: opts.argv.clone(),
        env: opts.env.clone(),
        cwd: opts.cwd.clone(),
        cred: step.cred.clone(),
        switch_ctx: step.switch_ctx.clone(),
        task_flags,
        ofname: None,
        efname: None,
        ifname: None,
        tasks_to_launch,
        global_task_ids: step.layout.global_task_ids.clone(),
        cpus_allocated: step.alloc.cpus_per_node.clone(),
        resp_port: vec![resp_port; n],
        io_port: step.io_ports.clone(),
    };

    tracing::debug!(
        step = %step.id,
        nodes = n,
        tasks = step.total_tasks,
        task_counts = %task_count_string(&step.layout.tasks_per_node),
        "building launch requests"
    );

    let shared = EncodedCommon::new(&common)?;

    let mut requests = Vec::with_capacity(n);
    for i in 0..n {
        let layout = step
            .layout_of(i)
            .ok_or_else(|| LaunchError::FatalInternal(format!("node index {} out of range", i)))?;
        let payload = shared.encode_for_node(i as u32)?;

        tracing::info!(
            step = %step.id,
            host = layout.host,
            tasks = layout.task_count,
            task_ids = %render_task_ids(layout.task_ids, &opts.distribution),
            "launching"
        );

        requests.push(NodeRequest {
            node_index: i,
            host: layout.host.to_string(),
            addr: layout.daemon_addr.to_string(),
            task_ids: layout.task_ids.to_vec(),
            payload,
        });
    }
    Ok(requests)
}

/// Block layouts log a contiguous range, everything else the full list.
fn render_task_ids(ids: &[u32], dist: &Distribution) -> String {
    match (dist, ids.first(), ids.last()) {
        (Distribution::Block, Some(first), Some(last)) if ids.len() > 1 => {
            format!("{}-{}", first, last)
        }
        _ => ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(","),
    }
}

#[cfg(test)]
#[path = "builder_tests.rs"]
mod tests;
