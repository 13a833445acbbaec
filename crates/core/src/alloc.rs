// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The resource allocation handed down by the controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A set of nodes granted to a job, with per-node CPU counts and the
/// address each node's daemon listens on.
///
/// Immutable once built; the step layout and every launch request derive
/// from it by node index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Ordered node names, as granted
    pub nodes: Vec<String>,
    /// Daemon address per node (`host:port`), parallel to `nodes`
    pub daemon_addrs: Vec<String>,
    /// CPUs granted per node, parallel to `nodes`
    pub cpus_per_node: Vec<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocation has {nodes} nodes but {values} {field} entries")]
    LengthMismatch { field: &'static str, nodes: usize, values: usize },

    #[error("cpu group expansion covers {covered} nodes, allocation has {nodes}")]
    BadCpuGroups { covered: usize, nodes: usize },

    #[error("allocation contains no nodes")]
    Empty,
}

impl Allocation {
    /// Build an allocation with an explicit per-node CPU vector.
    pub fn new(
        nodes: Vec<String>,
        daemon_addrs: Vec<String>,
        cpus_per_node: Vec<u32>,
    ) -> Result<Self, AllocationError> {
        if nodes.is_empty() {
            return Err(AllocationError::Empty);
        }
        if daemon_addrs.len() != nodes.len() {
            return Err(AllocationError::LengthMismatch {
                field: "daemon_addrs",
                nodes: nodes.len(),
                values: daemon_addrs.len(),
            });
        }
        if cpus_per_node.len() != nodes.len() {
            return Err(AllocationError::LengthMismatch {
                field: "cpus_per_node",
                nodes: nodes.len(),
                values: cpus_per_node.len(),
            });
        }
        Ok(Self { nodes, daemon_addrs, cpus_per_node })
    }

    /// Build an allocation from the controller's run-length-encoded CPU
    /// groups: `cpu_counts[i]` repeated `count_reps[i]` times.
    ///
    /// The controller compresses `[2,2,2,4]` as `cpu_counts=[2,4]`,
    /// `count_reps=[3,1]`; the expansion must cover the node list exactly.
    pub fn from_cpu_groups(
        nodes: Vec<String>,
        daemon_addrs: Vec<String>,
        cpu_counts: &[u32],
        count_reps: &[u32],
    ) -> Result<Self, AllocationError> {
        if cpu_counts.len() != count_reps.len() {
            return Err(AllocationError::LengthMismatch {
                field: "cpu_count_reps",
                nodes: cpu_counts.len(),
                values: count_reps.len(),
            });
        }
        let mut cpus = Vec::with_capacity(nodes.len());
        for (count, reps) in cpu_counts.iter().zip(count_reps) {
            for _ in 0..*reps {
                cpus.push(*count);
            }
        }
        if cpus.len() != nodes.len() {
            return Err(AllocationError::BadCpuGroups { covered: cpus.len(), nodes: nodes.len() });
        }
        Self::new(nodes, daemon_addrs, cpus)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total CPUs across the allocation.
    pub fn total_cpus(&self) -> u64 {
        self.cpus_per_node.iter().map(|c| u64::from(*c)).sum()
    }

    /// Index of a node by name, if allocated.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n == name)
    }
}

#[cfg(test)]
#[path = "alloc_tests.rs"]
mod tests;
