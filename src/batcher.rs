// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Epoch batcher
//!
//! The batcher groups concurrent transactions into epochs. Read-only
//! transactions join the running epoch immediately; read-write
//! transactions arriving while an epoch is active queue up and are
//! admitted together as the next wave once every current participant has
//! left. The last participant out runs the region's commit step while it
//! still holds the batcher lock, so the step observes a quiescent region.
//!
//! A writer that arrives during an active epoch is admitted no later than
//! the epoch immediately following its arrival, which keeps the scheme
//! starvation-free for writers.

use crate::types::Access;
use log::debug;
use std::sync::{Condvar, Mutex};

#[derive(Debug)]
struct BatcherState {
    /// Number of completed epoch boundaries.
    epoch: u64,
    /// Transactions currently inside the epoch, read-only included.
    inside: usize,
    /// Read-write transactions blocked until the next boundary.
    waiting: usize,
}

#[derive(Debug)]
pub(crate) struct Batcher {
    state: Mutex<BatcherState>,
    admit: Condvar,
}

impl Batcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BatcherState {
                epoch: 0,
                inside: 0,
                waiting: 0,
            }),
            admit: Condvar::new(),
        }
    }

    /// Admits a transaction, blocking read-write entrants while an epoch is
    /// active. Whenever the lock is free `inside == 0` implies
    /// `waiting == 0`, so an idle region admits the first writer at once.
    pub fn enter(&self, access: Access) {
        let mut state = self.state.lock().expect("batcher lock poisoned");

        if access.is_read_only() || state.inside == 0 {
            state.inside += 1;
            return;
        }

        state.waiting += 1;
        let target = state.epoch + 1;
        while state.epoch < target {
            state = self.admit.wait(state).expect("batcher lock poisoned");
        }
        // the boundary that woke us already moved our slot into `inside`
    }

    /// Releases one participant. When it was the last one, runs
    /// `commit_step` on the quiescent region, closes the epoch and admits
    /// the waiting wave. Returns whether this call closed the epoch.
    pub fn leave<F>(&self, commit_step: F) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock().expect("batcher lock poisoned");
        state.inside -= 1;

        if state.inside > 0 {
            return false;
        }

        commit_step();

        state.epoch += 1;
        state.inside = state.waiting;
        state.waiting = 0;
        debug!("epoch {} closed, admitting {} writer(s)", state.epoch, state.inside);
        self.admit.notify_all();

        true
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().expect("batcher lock poisoned").epoch
    }
}
