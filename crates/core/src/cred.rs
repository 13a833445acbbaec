// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step credentials.
//!
//! The launcher never inspects or verifies a credential; it only carries
//! the blob to the node daemons and checks that the embedded hostlist
//! matches the step's node list. Signing and verification belong to the
//! credential collaborator.

use serde::{Deserialize, Serialize};

/// Opaque signed blob authorizing a step on specific nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    job_id: u32,
    step_id: u32,
    uid: u32,
    /// Nodes the credential authorizes, in allocation order
    hosts: Vec<String>,
    /// One bit per allocated core, packed
    core_bitmap: Vec<u8>,
    /// Signature bytes; opaque to the launcher
    signature: Vec<u8>,
}

impl Credential {
    /// Wrap a signed credential received from the controller.
    pub fn new(
        job_id: u32,
        step_id: u32,
        uid: u32,
        hosts: Vec<String>,
        core_bitmap: Vec<u8>,
        signature: Vec<u8>,
    ) -> Self {
        Self { job_id, step_id, uid, hosts, core_bitmap, signature }
    }

    /// Create a credential with bogus signature bytes and a trivial core
    /// bitmap covering every allocated node.
    ///
    /// Used to talk to node daemons directly, bypassing the controller
    /// (which normally signs credentials), and in tests.
    pub fn forge(job_id: u32, step_id: u32, uid: u32, hosts: Vec<String>) -> Self {
        let bitmap_len = hosts.len().div_ceil(8);
        let mut core_bitmap = vec![0xffu8; bitmap_len];
        // clear bits past the node count so the bitmap is exactly node-sized
        let tail_bits = hosts.len() % 8;
        if tail_bits != 0 {
            if let Some(last) = core_bitmap.last_mut() {
                *last = (1u8 << tail_bits) - 1;
            }
        }
        Self {
            job_id,
            step_id,
            uid,
            hosts,
            core_bitmap,
            signature: b"faked-signature".to_vec(),
        }
    }

    /// The hostlist the credential was issued for.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn job_id(&self) -> u32 {
        self.job_id
    }

    pub fn step_id(&self) -> u32 {
        self.step_id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }
}

#[cfg(test)]
#[path = "cred_tests.rs"]
mod tests;
