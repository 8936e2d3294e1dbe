// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-word dual-copy metadata
//!
//! Every aligned word of a segment carries one [`WordState`]: a single
//! atomic u64 packing which of the two physical copies is currently
//! readable, whether the word has been written during the running epoch,
//! whether a second read-write transaction has read it, and the id of the
//! first read-write transaction that touched it this epoch.
//!
//! All transitions taken by running transactions are CAS loops over the
//! packed value, so two transactions racing for an untouched word resolve
//! the `first_accessor` claim without locks. The epoch commit step runs on
//! a quiescent region and may use plain stores.

use crate::types::{TxId, TX_NONE};
use std::sync::atomic::{AtomicU64, Ordering};

/// Readable copy selector: clear = copy A, set = copy B.
const VALID_B: u64 = 1 << 63;
/// The writable copy holds a value written during the running epoch.
const WRITTEN: u64 = 1 << 62;
/// A read-write transaction other than the first accessor read the word.
const READ_MULTI: u64 = 1 << 61;
/// Remaining bits hold the first accessor id; `TX_NONE` when untouched.
const ACCESSOR: u64 = (1 << 61) - 1;

/// Outcome of the read protocol for a read-write transaction.
pub(crate) enum ReadPlan {
    /// Copy the currently readable half.
    Readable,
    /// The word holds this transaction's own tentative write.
    Writable,
    /// Another transaction owns the word this epoch.
    Abort,
}

/// Outcome of the write protocol.
pub(crate) enum WritePlan {
    /// First write of the epoch: the word is now claimed and the caller
    /// must remember it for rollback.
    Claimed,
    /// The word already holds this transaction's tentative write.
    Owned,
    /// Another transaction read or wrote the word this epoch.
    Abort,
}

#[derive(Debug)]
pub(crate) struct WordState {
    bits: AtomicU64,
}

impl WordState {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// Whether copy B is the readable half. Stable while an epoch runs,
    /// flipped only by the commit step.
    pub fn readable_is_b(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & VALID_B != 0
    }

    /// Read transition for a read-write transaction.
    ///
    /// An untouched word is claimed for `id`; a word first touched by some
    /// other transaction is flagged as read by others, which blocks that
    /// transaction from upgrading to a write later in the epoch. Reading a
    /// word already written by another transaction aborts.
    pub fn read_rw(&self, id: TxId) -> ReadPlan {
        let mut cur = self.bits.load(Ordering::SeqCst);

        loop {
            if cur & WRITTEN != 0 {
                return match cur & ACCESSOR == id {
                    true => ReadPlan::Writable,
                    false => ReadPlan::Abort,
                };
            }

            let accessor = cur & ACCESSOR;
            let next = if accessor == TX_NONE {
                (cur & !ACCESSOR) | id
            } else if accessor != id {
                cur | READ_MULTI
            } else {
                return ReadPlan::Readable;
            };

            if next == cur {
                return ReadPlan::Readable;
            }

            match self.bits.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return ReadPlan::Readable,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Write transition for a read-write transaction.
    ///
    /// Succeeds when the word is untouched, or touched only by `id` and not
    /// read by anyone else. The loser of a claim race re-reads the state and
    /// lands in one of the abort arms.
    pub fn write_rw(&self, id: TxId) -> WritePlan {
        let mut cur = self.bits.load(Ordering::SeqCst);

        loop {
            if cur & WRITTEN != 0 {
                return match cur & ACCESSOR == id {
                    true => WritePlan::Owned,
                    false => WritePlan::Abort,
                };
            }

            let accessor = cur & ACCESSOR;
            if accessor != TX_NONE && accessor != id {
                return WritePlan::Abort;
            }

            if cur & READ_MULTI != 0 {
                // someone else read the committed value this epoch
                return WritePlan::Abort;
            }

            let next = (cur & !ACCESSOR) | id | WRITTEN;
            match self.bits.compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return WritePlan::Claimed,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Rollback of a claimed write. Clears only the written flag: the
    /// epoch-boundary reset clears the remaining access marks, so an
    /// aborted transaction leaves no observable effect past the boundary.
    pub fn rollback_write(&self) {
        self.bits.fetch_and(!WRITTEN, Ordering::SeqCst);
    }

    /// Epoch-boundary reset. The caller guarantees quiescence.
    ///
    /// Flips the readable copy iff the word was written, then clears the
    /// per-epoch access metadata. Returns whether the word had been written.
    pub fn commit_reset(&self) -> bool {
        let cur = self.bits.load(Ordering::SeqCst);
        let written = cur & WRITTEN != 0;

        let valid = match written {
            true => (cur & VALID_B) ^ VALID_B,
            false => cur & VALID_B,
        };
        self.bits.store(valid, Ordering::SeqCst);

        written
    }

    /// Whether any per-epoch metadata is set. Test hook for the quiescence
    /// invariant.
    #[cfg(test)]
    pub fn is_clean(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & (WRITTEN | READ_MULTI | ACCESSOR) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reader_claims_word() {
        let w = WordState::new();

        assert!(matches!(w.read_rw(1), ReadPlan::Readable));
        // the claim survives into the write protocol
        assert!(matches!(w.write_rw(1), WritePlan::Claimed));
        assert!(matches!(w.read_rw(1), ReadPlan::Writable));
    }

    #[test]
    fn test_foreign_write_aborts_after_read() {
        let w = WordState::new();

        assert!(matches!(w.read_rw(1), ReadPlan::Readable));
        assert!(matches!(w.write_rw(2), WritePlan::Abort));
    }

    #[test]
    fn test_foreign_read_aborts_after_write() {
        let w = WordState::new();

        assert!(matches!(w.write_rw(1), WritePlan::Claimed));
        assert!(matches!(w.read_rw(2), ReadPlan::Abort));
    }

    #[test]
    fn test_second_reader_blocks_first_accessor_write() {
        let w = WordState::new();

        assert!(matches!(w.read_rw(1), ReadPlan::Readable));
        assert!(matches!(w.read_rw(2), ReadPlan::Readable));
        // tx 1 still holds the claim, but the word is no longer private
        assert!(matches!(w.write_rw(1), WritePlan::Abort));
    }

    #[test]
    fn test_rolled_back_write_does_not_flip() {
        let w = WordState::new();

        assert!(matches!(w.write_rw(1), WritePlan::Claimed));
        w.rollback_write();

        assert!(!w.commit_reset());
        assert!(!w.readable_is_b());
        assert!(w.is_clean());
    }

    #[test]
    fn test_commit_reset_flips_only_written_words() {
        let w = WordState::new();

        assert!(matches!(w.read_rw(1), ReadPlan::Readable));
        assert!(!w.commit_reset());
        assert!(!w.readable_is_b());
        assert!(w.is_clean());

        assert!(matches!(w.write_rw(2), WritePlan::Claimed));
        assert!(w.commit_reset());
        assert!(w.readable_is_b());
        assert!(w.is_clean());

        assert!(matches!(w.write_rw(3), WritePlan::Claimed));
        assert!(w.commit_reset());
        assert!(!w.readable_is_b());
    }
}
