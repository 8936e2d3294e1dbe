// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::errors::TxError;
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 7;

/// # BusyBreaker
/// [`BusyBreaker`] is kind of a circuit-breaker and busy keeper for short
/// delays on spin loops on the CPU. Each call spins twice as long as the
/// previous one and trips once the budget is exhausted, bounding how long a
/// retry loop can stay hot.
#[derive(Default, Debug)]
pub struct BusyBreaker {
    unit: AtomicUsize,
}

impl BusyBreaker {
    /// Keeps the CPU busy but hints to the CPU to reschedule the CPU time.
    ///
    /// Returns [`TxError::RetryExhausted`] once the wait budget is spent.
    pub fn spin(&self) -> Result<(), TxError> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= MAX_WAIT_UNITS => {
                for _ in 0..(1 << unit) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);

                Ok(())
            }
            _ => Err(TxError::RetryExhausted),
        }
    }

    /// Resets the breaker to zero
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

impl Clone for BusyBreaker {
    fn clone(&self) -> Self {
        Self {
            unit: AtomicUsize::new(self.unit.load(Ordering::Acquire)),
        }
    }
}
