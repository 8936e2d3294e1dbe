// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactions
//!
//! A [`Transaction`] is the per-transaction runtime state: its id, access
//! mode, abort flag and the lists of segments it allocated or freed. All
//! transactional operations run word by word against the owning region's
//! segments; the first failing word aborts the transaction and the call
//! returns immediately.
//!
//! Once a transaction has aborted, every further operation short-circuits
//! with [`TxError::Aborted`]. The transaction must still reach
//! [`Transaction::commit`] or be dropped so its batcher slot is released;
//! both paths roll an aborted transaction back completely.

use crate::{
    errors::TxError,
    region::{Region, FIRST_SLOT},
    segment::{Segment, SegmentState},
    types::{Access, Address, TxId},
    word::{ReadPlan, WritePlan},
};
use log::debug;

pub struct Transaction<'a> {
    region: &'a Region,
    pub(crate) id: TxId,
    pub(crate) access: Access,
    pub(crate) aborted: bool,
    pub(crate) local_allocs: Vec<u64>,
    pub(crate) local_frees: Vec<u64>,
    /// Words claimed for writing, `(segment slot, word index)`. The undo
    /// log: rollback clears their written flags so an abort cannot leak a
    /// tentative value through the epoch-boundary flip.
    pub(crate) writes: Vec<(u64, usize)>,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(region: &'a Region, id: TxId, access: Access) -> Self {
        Self {
            region,
            id,
            access,
            aborted: false,
            local_allocs: Vec::new(),
            local_frees: Vec::new(),
            writes: Vec::new(),
            done: false,
        }
    }

    /// The id assigned at admission. Ids are unique for the lifetime of the
    /// region.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Reads `dst.len()` bytes starting at `src` into `dst`. The length
    /// must be a positive multiple of the region alignment.
    pub fn read(&mut self, src: Address, dst: &mut [u8]) -> Result<(), TxError> {
        if self.aborted {
            return Err(TxError::Aborted);
        }

        let align = self.region.alignment();
        let (_, segment, first) = match self.resolve(src, dst.len()) {
            Some(span) => span,
            None => return Err(self.fail(TxError::InvalidAccess)),
        };

        match self.access {
            Access::ReadOnly => {
                // never touches word state, can never conflict
                for (i, chunk) in dst.chunks_exact_mut(align).enumerate() {
                    segment.read_word(first + i, false, chunk);
                }
            }
            Access::ReadWrite => {
                segment.mark_accessed();
                for (i, chunk) in dst.chunks_exact_mut(align).enumerate() {
                    match segment.word(first + i).read_rw(self.id) {
                        ReadPlan::Readable => segment.read_word(first + i, false, chunk),
                        ReadPlan::Writable => segment.read_word(first + i, true, chunk),
                        ReadPlan::Abort => {
                            debug!("tx({}): read conflict on word {}", self.id, first + i);
                            return Err(self.fail(TxError::Conflict));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Writes `src` to the shared words starting at `dst`. The length must
    /// be a positive multiple of the region alignment; the write stays
    /// private to this transaction until it commits.
    pub fn write(&mut self, src: &[u8], dst: Address) -> Result<(), TxError> {
        if self.aborted {
            return Err(TxError::Aborted);
        }
        if self.access.is_read_only() {
            return Err(self.fail(TxError::ReadOnlyWrite));
        }

        let align = self.region.alignment();
        let (slot, segment, first) = match self.resolve(dst, src.len()) {
            Some(span) => span,
            None => return Err(self.fail(TxError::InvalidAccess)),
        };

        segment.mark_accessed();
        for (i, chunk) in src.chunks_exact(align).enumerate() {
            match segment.word(first + i).write_rw(self.id) {
                WritePlan::Claimed => {
                    self.writes.push((slot, first + i));
                    segment.write_word(first + i, chunk);
                }
                WritePlan::Owned => segment.write_word(first + i, chunk),
                WritePlan::Abort => {
                    debug!("tx({}): write conflict on word {}", self.id, first + i);
                    return Err(self.fail(TxError::Conflict));
                }
            }
        }

        Ok(())
    }

    /// Allocates a fresh zero-filled segment of `size` bytes and returns
    /// its address. The segment stays private to this transaction until it
    /// commits. [`TxError::NoMem`] leaves the transaction running.
    pub fn alloc(&mut self, size: usize) -> Result<Address, TxError> {
        if self.aborted {
            return Err(TxError::Aborted);
        }
        if size == 0 || size % self.region.alignment() != 0 {
            return Err(self.fail(TxError::InvalidAccess));
        }

        match self.region.alloc_segment(size) {
            Some((slot, addr)) => {
                self.local_allocs.push(slot);
                Ok(addr)
            }
            None => Err(TxError::NoMem),
        }
    }

    /// Marks the segment at `addr` for reclamation. The address must name
    /// the start of a live segment other than the region's first one, or a
    /// segment this same transaction allocated. Reclamation happens at the
    /// epoch boundary after the transaction committed.
    pub fn free(&mut self, addr: Address) -> Result<(), TxError> {
        if self.aborted {
            return Err(TxError::Aborted);
        }

        let (slot, segment, offset) = match self.region.locate(addr) {
            Some(found) => found,
            None => return Err(self.fail(TxError::InvalidAccess)),
        };

        if offset != 0 || slot == FIRST_SLOT || self.local_frees.contains(&slot) {
            return Err(self.fail(TxError::InvalidAccess));
        }
        match segment.state() {
            SegmentState::Live => {}
            SegmentState::PendingAlloc if self.local_allocs.contains(&slot) => {}
            _ => return Err(self.fail(TxError::InvalidAccess)),
        }

        self.local_frees.push(slot);
        Ok(())
    }

    /// Ends the transaction. A clean transaction publishes its allocations
    /// and frees and reports `Ok`; an aborted one rolls back and reports
    /// [`TxError::Aborted`]. Either way the batcher slot is released, and
    /// the caller that ends up last out runs the epoch commit step.
    pub fn commit(mut self) -> Result<(), TxError> {
        let region = self.region;
        region.finish(&mut self);
        self.done = true;

        match self.aborted {
            true => Err(TxError::Aborted),
            false => Ok(()),
        }
    }

    /// Resolves `(addr, len)` to the owning segment and its first word
    /// index. `None` for unknown segments, foreign tentative segments,
    /// misaligned offsets and lengths, and out-of-bounds ranges.
    fn resolve(&self, addr: Address, len: usize) -> Option<(u64, std::sync::Arc<Segment>, usize)> {
        let align = self.region.alignment();
        let (slot, segment, offset) = self.region.locate(addr)?;

        if segment.state() == SegmentState::PendingAlloc && !self.local_allocs.contains(&slot) {
            return None;
        }
        if len == 0 || len % align != 0 || offset % align != 0 {
            return None;
        }

        let end = offset.checked_add(len)?;
        if end > segment.len() {
            return None;
        }

        Some((slot, segment, offset / align))
    }

    fn fail(&mut self, err: TxError) -> TxError {
        self.aborted = true;
        err
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            // dropped without an explicit end: roll back like an abort
            self.aborted = true;
            let region = self.region;
            region.finish(self);
            self.done = true;
        }
    }
}
