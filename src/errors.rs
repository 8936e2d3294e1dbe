// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Errors surfaced while constructing a [`crate::Region`].
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum RegionError {
    #[error("alignment must be a non-zero power of two")]
    InvalidAlignment,

    #[error("first segment size must be a positive multiple of the effective alignment")]
    InvalidSize,

    #[error("out of memory")]
    NoMem,
}

/// Errors surfaced by transactional operations.
///
/// [`TxError::Conflict`] and [`TxError::Aborted`] are the normal path under
/// contention; callers are expected to retry the whole transaction, either
/// by hand or through [`crate::Region::execute`]. The remaining variants are
/// propagated, not retried.
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    #[error("conflicting access on a word, transaction aborted")]
    Conflict,

    #[error("transaction has already been aborted")]
    Aborted,

    #[error("out of memory")]
    NoMem,

    #[error("address does not name a live word range of this region")]
    InvalidAccess,

    #[error("read-only transaction attempted to write")]
    ReadOnlyWrite,

    #[error("retry budget exhausted")]
    RetryExhausted,
}

impl TxError {
    /// Whether retrying the transaction can clear the error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TxError::Conflict | TxError::Aborted)
    }
}
