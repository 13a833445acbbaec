// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task distribution: how a step's tasks are spread over its nodes.

use crate::alloc::Allocation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distribution policy for placing tasks on nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Contiguous blocks of task ids, filling each node's CPUs in node
    /// order before moving on
    Block,
    /// Task `k` on node `k mod N`
    Cyclic,
    /// User-supplied ordered node list, honored verbatim
    Arbitrary(Vec<String>),
    /// Blocks of `size` task ids placed cyclically across nodes
    Plane(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{tasks} tasks exceed {cpus} allocated cpus and overcommit is disabled")]
    Overcommit { tasks: u32, cpus: u64 },

    #[error("arbitrary distribution requires an explicit node list")]
    MissingNodeList,

    #[error("requested node {0} is not in the allocation")]
    NodeNotAllocated(String),

    #[error("step has no tasks")]
    NoTasks,

    #[error("plane size must be non-zero")]
    ZeroPlaneSize,

    #[error(
        "arbitrary node list places {listed} tasks but the step has {tasks}"
    )]
    TaskCountMismatch { listed: u32, tasks: u32 },
}

/// Per-node task counts and global task id assignment.
///
/// Invariants (checked by construction): counts sum to the task total;
/// the task id lists partition `0..tasks` and are parallel to the
/// allocation's node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLayout {
    /// Tasks placed on each node, parallel to the allocation node list
    pub tasks_per_node: Vec<u32>,
    /// Global task ids per node, parallel to `tasks_per_node`
    pub global_task_ids: Vec<Vec<u32>>,
}

impl TaskLayout {
    /// Distribute `tasks` over the allocation under `dist`.
    ///
    /// `overcommit` lifts the aggregate-CPU capacity check; per-node CPU
    /// counts still steer the block policy's fill order.
    pub fn compute(
        alloc: &Allocation,
        tasks: u32,
        dist: &Distribution,
        overcommit: bool,
    ) -> Result<Self, LayoutError> {
        if tasks == 0 {
            return Err(LayoutError::NoTasks);
        }
        if !overcommit && u64::from(tasks) > alloc.total_cpus() {
            return Err(LayoutError::Overcommit { tasks, cpus: alloc.total_cpus() });
        }

        match dist {
            Distribution::Block => Ok(Self::block(alloc, tasks)),
            Distribution::Cyclic => Ok(Self::cyclic(alloc.node_count(), tasks)),
            Distribution::Arbitrary(list) => Self::arbitrary(alloc, tasks, list),
            Distribution::Plane(size) => {
                if *size == 0 {
                    return Err(LayoutError::ZeroPlaneSize);
                }
                Ok(Self::plane(alloc.node_count(), tasks, *size))
            }
        }
    }

    pub fn task_count(&self) -> u32 {
        self.tasks_per_node.iter().sum()
    }

    /// Block: fill each node up to its CPU count in node order, then lay
    /// any overcommitted remainder one per node, lower index first.
    fn block(alloc: &Allocation, tasks: u32) -> Self {
        let n = alloc.node_count();
        let mut counts = vec![0u32; n];
        let mut remaining = tasks;

        for (i, count) in counts.iter_mut().enumerate() {
            let take = alloc.cpus_per_node[i].min(remaining);
            *count = take;
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        // overcommit remainder, one task per pass, lower node index first
        while remaining > 0 {
            for count in counts.iter_mut() {
                if remaining == 0 {
                    break;
                }
                *count += 1;
                remaining -= 1;
            }
        }

        let mut gtids = Vec::with_capacity(n);
        let mut next = 0u32;
        for count in &counts {
            gtids.push((next..next + count).collect());
            next += count;
        }
        Self { tasks_per_node: counts, global_task_ids: gtids }
    }

    /// Cyclic: task `k` lands on node `k mod n`, honoring input node order.
    fn cyclic(n: usize, tasks: u32) -> Self {
        let mut counts = vec![0u32; n];
        let mut gtids = vec![Vec::new(); n];
        for k in 0..tasks {
            let i = (k as usize) % n;
            counts[i] += 1;
            gtids[i].push(k);
        }
        Self { tasks_per_node: counts, global_task_ids: gtids }
    }

    /// Arbitrary: task `k` lands on the node named by the `k`-th list entry.
    fn arbitrary(alloc: &Allocation, tasks: u32, list: &[String]) -> Result<Self, LayoutError> {
        if list.is_empty() {
            return Err(LayoutError::MissingNodeList);
        }
        if list.len() as u32 != tasks {
            return Err(LayoutError::TaskCountMismatch { listed: list.len() as u32, tasks });
        }
        let mut counts = vec![0u32; alloc.node_count()];
        let mut gtids = vec![Vec::new(); alloc.node_count()];
        for (k, name) in list.iter().enumerate() {
            let i = alloc
                .node_index(name)
                .ok_or_else(|| LayoutError::NodeNotAllocated(name.clone()))?;
            counts[i] += 1;
            gtids[i].push(k as u32);
        }
        Ok(Self { tasks_per_node: counts, global_task_ids: gtids })
    }

    /// Plane: chunk `j` of `size` consecutive task ids lands on node
    /// `j mod n`.
    fn plane(n: usize, tasks: u32, size: u32) -> Self {
        let mut counts = vec![0u32; n];
        let mut gtids = vec![Vec::new(); n];
        let mut k = 0u32;
        let mut chunk = 0usize;
        while k < tasks {
            let i = chunk % n;
            let take = size.min(tasks - k);
            for t in k..k + take {
                gtids[i].push(t);
            }
            counts[i] += take;
            k += take;
            chunk += 1;
        }
        Self { tasks_per_node: counts, global_task_ids: gtids }
    }
}

/// Compact rendering of per-node task counts: `[2,2,2,1]` becomes
/// `"2(x3),1"`. Used in launch logging.
pub fn task_count_string(counts: &[u32]) -> String {
    let mut out = String::new();
    let mut iter = counts.iter().peekable();
    while let Some(val) = iter.next() {
        let mut reps = 1;
        while iter.peek() == Some(&val) {
            iter.next();
            reps += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if reps > 1 {
            out.push_str(&format!("{}(x{})", val, reps));
        } else {
            out.push_str(&val.to_string());
        }
    }
    out
}

#[cfg(test)]
#[path = "layout_tests.rs"]
mod tests;
