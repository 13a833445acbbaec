// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The immutable step record: one execution of a program within an
//! allocation, the unit of launch.

use crate::alloc::Allocation;
use crate::cred::Credential;
use crate::layout::{LayoutError, TaskLayout};
use crate::options::LaunchOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies a step: `(job_id, step_id)`, displayed as `job.step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub job_id: u32,
    pub step_id: u32,
}

impl StepId {
    pub fn new(job_id: u32, step_id: u32) -> Self {
        Self { job_id, step_id }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_id, self.step_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("layout covers {layout} nodes, allocation has {alloc}")]
    NodeCountMismatch { layout: usize, alloc: usize },

    #[error("layout places {layout} tasks, step declares {step}")]
    TaskCountMismatch { layout: u32, step: u32 },

    #[error("task ids do not partition 0..{0}")]
    BadTaskIds(u32),

    #[error("credential hostlist does not match the allocation node list")]
    CredentialHostMismatch,

    #[error("step has {ports} response ports for {nodes} nodes")]
    PortCountMismatch { ports: usize, nodes: usize },

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Everything a launch worker needs to know about one node of the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout<'a> {
    pub node_index: usize,
    pub host: &'a str,
    pub daemon_addr: &'a str,
    pub task_count: u32,
    pub task_ids: &'a [u32],
    pub cpus: u32,
    pub resp_port: u16,
    pub io_port: u16,
}

/// Immutable record of a created step, shared read-only by every worker
/// and by the forked message handler.
///
/// Construction validates the layout/allocation/credential invariants;
/// after that the step never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub alloc: Allocation,
    pub layout: TaskLayout,
    pub total_tasks: u32,
    pub cred: Credential,
    /// Opaque switch/interconnect context, carried to the node daemons
    pub switch_ctx: Vec<u8>,
    /// Port each node's daemon should send launch replies to
    pub resp_ports: Vec<u16>,
    /// Port each node's daemon should stream task I/O to
    pub io_ports: Vec<u16>,
}

impl Step {
    pub fn new(
        id: StepId,
        alloc: Allocation,
        layout: TaskLayout,
        cred: Credential,
        switch_ctx: Vec<u8>,
        resp_ports: Vec<u16>,
        io_ports: Vec<u16>,
    ) -> Result<Self, StepError> {
        let nodes = alloc.node_count();
        if layout.tasks_per_node.len() != nodes || layout.global_task_ids.len() != nodes {
            return Err(StepError::NodeCountMismatch {
                layout: layout.tasks_per_node.len(),
                alloc: nodes,
            });
        }
        let total_tasks = layout.task_count();

        // the id lists must partition 0..total_tasks
        let mut seen = vec![false; total_tasks as usize];
        let mut count = 0u32;
        for (node_count, ids) in layout.tasks_per_node.iter().zip(&layout.global_task_ids) {
            if *node_count as usize != ids.len() {
                return Err(StepError::BadTaskIds(total_tasks));
            }
            for id in ids {
                match seen.get_mut(*id as usize) {
                    Some(slot) if !*slot => *slot = true,
                    _ => return Err(StepError::BadTaskIds(total_tasks)),
                }
                count += 1;
            }
        }
        if count != total_tasks {
            return Err(StepError::TaskCountMismatch { layout: count, step: total_tasks });
        }

        if cred.hosts() != alloc.nodes.as_slice() {
            return Err(StepError::CredentialHostMismatch);
        }

        if resp_ports.len() != nodes {
            return Err(StepError::PortCountMismatch { ports: resp_ports.len(), nodes });
        }
        if io_ports.len() != nodes {
            return Err(StepError::PortCountMismatch { ports: io_ports.len(), nodes });
        }

        Ok(Self { id, alloc, layout, total_tasks, cred, switch_ctx, resp_ports, io_ports })
    }

    /// Plan a step straight from the launch options: distribute
    /// `opts.nprocs` tasks over the allocation's task slots (CPUs
    /// divided by `cpus_per_task`) under the requested distribution.
    pub fn plan(
        id: StepId,
        alloc: Allocation,
        opts: &LaunchOptions,
        cred: Credential,
        switch_ctx: Vec<u8>,
        resp_ports: Vec<u16>,
        io_ports: Vec<u16>,
    ) -> Result<Self, StepError> {
        let cpus_per_task = opts.cpus_per_task.max(1);
        let slots: Vec<u32> =
            alloc.cpus_per_node.iter().map(|cpus| cpus / cpus_per_task).collect();
        let slot_alloc = Allocation {
            nodes: alloc.nodes.clone(),
            daemon_addrs: alloc.daemon_addrs.clone(),
            cpus_per_node: slots,
        };
        let layout =
            TaskLayout::compute(&slot_alloc, opts.nprocs, &opts.distribution, opts.overcommit)?;
        Self::new(id, alloc, layout, cred, switch_ctx, resp_ports, io_ports)
    }

    pub fn node_count(&self) -> usize {
        self.alloc.node_count()
    }

    /// The per-node slice of the step used to build its launch request.
    pub fn layout_of(&self, node_index: usize) -> Option<NodeLayout<'_>> {
        if node_index >= self.node_count() {
            return None;
        }
        Some(NodeLayout {
            node_index,
            host: &self.alloc.nodes[node_index],
            daemon_addr: &self.alloc.daemon_addrs[node_index],
            task_count: self.layout.tasks_per_node[node_index],
            task_ids: &self.layout.global_task_ids[node_index],
            cpus: self.alloc.cpus_per_node[node_index],
            resp_port: self.resp_ports[node_index],
            io_port: self.io_ports[node_index],
        })
    }

    /// Node index owning a global task id.
    pub fn node_of_task(&self, task_id: u32) -> Option<usize> {
        self.layout
            .global_task_ids
            .iter()
            .position(|ids| ids.contains(&task_id))
    }
}

#[cfg(test)]
#[path = "step_tests.rs"]
mod tests;
