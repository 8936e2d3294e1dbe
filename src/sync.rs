// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Lock selection for the region's shared queues. Building with the
//! `no_deadlocks` feature swaps in lock-diagnosing replacements.

#[cfg(feature = "no_deadlocks")]
pub(crate) use no_deadlocks::{Mutex, MutexGuard};

#[cfg(not(feature = "no_deadlocks"))]
pub(crate) use std::sync::{Mutex, MutexGuard};
