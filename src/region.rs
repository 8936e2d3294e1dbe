// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Regions
//!
//! A [`Region`] owns the segment table, the batcher and the queues of
//! segments waiting to be published or reclaimed. It is the factory for
//! [`Transaction`]s and performs the epoch commit step whenever the last
//! participant of an epoch leaves.

use crate::{
    batcher::Batcher,
    breaker::BusyBreaker,
    errors::{RegionError, TxError},
    segment::{Segment, SegmentState},
    sync::Mutex,
    transaction::Transaction,
    types::{Access, Address},
};
use log::{debug, trace};
use std::{
    collections::HashMap,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

/// Slot of the permanent first segment.
pub(crate) const FIRST_SLOT: u64 = 0;

/// How [`Region::execute`] reacts to a conflicted transaction. The internal
/// execution can either abort, retry again an unlimited number of times, or
/// retry with a busy breaker that bounds the spinning.
#[derive(Debug)]
pub enum RetryStrategy {
    /// Surface the conflict to the caller.
    Abort,

    /// Retry endlessly until the transaction commits. Conflicts are the
    /// normal path under contention, so this is the default.
    Retry,

    /// Retry with an exponential breaker. A trade-off between liveness of
    /// the calling thread and the chance that contending writers drain
    /// within the wait budget; the breaker trips with
    /// [`TxError::RetryExhausted`] once the budget is spent.
    RetryWithBreaker(BusyBreaker),
}

/// A shared memory region supporting word-granular transactions.
///
/// All state lives in process memory. The region is thread-safe: any number
/// of threads may run transactions against it concurrently, each through
/// its own [`Transaction`] value. Transactions borrow the region, so a
/// region cannot be dropped while any transaction is live; dropping the
/// region releases every segment.
#[derive(Debug)]
pub struct Region {
    /// Effective alignment: the requested one, grown to hold a machine
    /// word so client addresses stay representable.
    align: usize,
    first_size: usize,
    segments: RwLock<HashMap<u64, Arc<Segment>>>,
    next_slot: AtomicU64,
    tx_counter: AtomicU64,
    batcher: Batcher,
    pending_alloc: Mutex<Vec<u64>>,
    pending_free: Mutex<Vec<u64>>,
    strategy: RetryStrategy,
}

impl Region {
    /// Creates a region whose first segment spans `size` zeroed bytes, with
    /// [`RetryStrategy::Retry`] for [`Region::execute`].
    ///
    /// `align` must be a non-zero power of two and is the transactional
    /// access granularity for the region's lifetime; `size` must be a
    /// positive multiple of the effective alignment (see
    /// [`Region::alignment`]).
    pub fn new(size: usize, align: usize) -> Result<Region, RegionError> {
        Self::with_strategy(size, align, RetryStrategy::Retry)
    }

    /// Creates a region with a defined strategy for handling conflicted
    /// executions.
    pub fn with_strategy(
        size: usize,
        align: usize,
        strategy: RetryStrategy,
    ) -> Result<Region, RegionError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(RegionError::InvalidAlignment);
        }

        let effective = align.max(mem::size_of::<usize>());
        if size < align || size % effective != 0 {
            return Err(RegionError::InvalidSize);
        }

        let first = Segment::new(size, effective, SegmentState::Live).ok_or(RegionError::NoMem)?;
        let mut segments = HashMap::new();
        segments.insert(FIRST_SLOT, Arc::new(first));

        Ok(Region {
            align: effective,
            first_size: size,
            segments: RwLock::new(segments),
            next_slot: AtomicU64::new(FIRST_SLOT + 1),
            tx_counter: AtomicU64::new(0),
            batcher: Batcher::new(),
            pending_alloc: Mutex::new(Vec::new()),
            pending_free: Mutex::new(Vec::new()),
            strategy,
        })
    }

    /// Address of the first byte of the permanent first segment. Stable for
    /// the region's lifetime.
    pub fn start(&self) -> Address {
        Address::pack(FIRST_SLOT, 0)
    }

    /// Size of the first segment in bytes, as given at creation.
    pub fn size(&self) -> usize {
        self.first_size
    }

    /// Effective alignment and access granularity in bytes. At least the
    /// alignment requested at creation, grown to `size_of::<usize>()`.
    pub fn alignment(&self) -> usize {
        self.align
    }

    /// Number of completed epochs. Monotonic; test and monitoring hook.
    pub fn epoch(&self) -> u64 {
        self.batcher.epoch()
    }

    /// Starts a transaction. Read-only transactions are admitted
    /// immediately; a read-write transaction blocks while an epoch is
    /// active and joins the next wave at the boundary.
    pub fn begin(&self, access: Access) -> Transaction<'_> {
        self.batcher.enter(access);
        let id = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("tx({}): enter epoch {} ({:?})", id, self.batcher.epoch(), access);

        Transaction::new(self, id, access)
    }

    /// Runs `f` inside a fresh transaction, retrying conflicted attempts
    /// according to the region's [`RetryStrategy`].
    ///
    /// Non-conflict failures ([`TxError::NoMem`], [`TxError::InvalidAccess`],
    /// [`TxError::ReadOnlyWrite`]) are never retried. `f` may run many
    /// times and must not have effects outside the transaction.
    ///
    /// # Example
    /// ```
    /// use batchtm::{Access, Region};
    ///
    /// let region = Region::new(8, 8).unwrap();
    /// let start = region.start();
    ///
    /// region
    ///     .execute(Access::ReadWrite, |tx| {
    ///         let mut word = [0u8; 8];
    ///         tx.read(start, &mut word)?;
    ///         let value = u64::from_ne_bytes(word) + 1;
    ///         tx.write(&value.to_ne_bytes(), start)
    ///     })
    ///     .unwrap();
    /// ```
    pub fn execute<T, F>(&self, access: Access, f: F) -> Result<T, TxError>
    where
        F: Fn(&mut Transaction<'_>) -> Result<T, TxError>,
    {
        if let RetryStrategy::RetryWithBreaker(breaker) = &self.strategy {
            breaker.reset();
        }

        loop {
            let mut tx = self.begin(access);
            let outcome = match f(&mut tx) {
                Ok(value) => tx.commit().map(|_| value),
                Err(err) => {
                    drop(tx);
                    Err(err)
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retriable() {
                return Err(err);
            }

            match &self.strategy {
                RetryStrategy::Abort => return Err(err),
                RetryStrategy::Retry => {}
                RetryStrategy::RetryWithBreaker(breaker) => breaker.spin()?,
            }
        }
    }

    pub(crate) fn locate(&self, addr: Address) -> Option<(u64, Arc<Segment>, usize)> {
        let (slot, offset) = addr.unpack()?;
        let segment = self
            .segments
            .read()
            .expect("segment table lock poisoned")
            .get(&slot)
            .cloned()?;

        Some((slot, segment, offset))
    }

    /// Creates a tentative segment and parks it in the table under a fresh
    /// slot. `None` when the allocator refuses or the slot space is spent.
    pub(crate) fn alloc_segment(&self, size: usize) -> Option<(u64, Address)> {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        if slot >= u64::from(u32::MAX) {
            return None;
        }

        let segment = Arc::new(Segment::new(size, self.align, SegmentState::PendingAlloc)?);
        self.segments
            .write()
            .expect("segment table lock poisoned")
            .insert(slot, segment);

        Some((slot, Address::pack(slot, 0)))
    }

    /// Ends a transaction: publishes or rolls back its local segment lists,
    /// then releases its batcher slot. The last participant out runs the
    /// epoch commit step.
    pub(crate) fn finish(&self, tx: &mut Transaction<'_>) {
        if tx.aborted {
            debug!("tx({}): rollback", tx.id);
            if !tx.writes.is_empty() {
                let table = self.segments.read().expect("segment table lock poisoned");
                for (slot, word) in tx.writes.drain(..) {
                    if let Some(segment) = table.get(&slot) {
                        segment.word(word).rollback_write();
                    }
                }
            }
            if !tx.local_allocs.is_empty() {
                let mut table = self.segments.write().expect("segment table lock poisoned");
                for slot in tx.local_allocs.drain(..) {
                    // never published, nobody else holds the address
                    table.remove(&slot);
                }
            }
            tx.local_frees.clear();
        } else {
            if !tx.local_allocs.is_empty() {
                self.pending_alloc
                    .lock()
                    .expect("pending queue lock poisoned")
                    .append(&mut tx.local_allocs);
            }
            if !tx.local_frees.is_empty() {
                let table = self.segments.read().expect("segment table lock poisoned");
                let mut pending = self.pending_free.lock().expect("pending queue lock poisoned");
                for slot in tx.local_frees.drain(..) {
                    if let Some(segment) = table.get(&slot) {
                        segment.set_state(SegmentState::PendingFree);
                    }
                    pending.push(slot);
                }
            }
        }

        self.batcher.leave(|| self.epoch_commit());
    }

    /// The epoch commit step. Runs on a quiescent region, under the batcher
    /// lock, exactly once per epoch:
    ///
    /// 1. flip written words of every segment touched this epoch and reset
    ///    their per-epoch metadata,
    /// 2. publish segments allocated by committed transactions,
    /// 3. reclaim segments freed by committed transactions.
    fn epoch_commit(&self) {
        {
            let table = self.segments.read().expect("segment table lock poisoned");
            for segment in table.values() {
                if segment.take_accessed() {
                    segment.commit_words();
                }
            }
        }

        let published: Vec<u64> = {
            let mut pending = self.pending_alloc.lock().expect("pending queue lock poisoned");
            pending.drain(..).collect()
        };
        if !published.is_empty() {
            let table = self.segments.read().expect("segment table lock poisoned");
            for slot in published {
                if let Some(segment) = table.get(&slot) {
                    // a segment both allocated and freed by its transaction
                    // is already PendingFree and falls to the step below
                    if segment.state() == SegmentState::PendingAlloc {
                        segment.set_state(SegmentState::Live);
                    }
                }
            }
        }

        let reclaimed: Vec<u64> = {
            let mut pending = self.pending_free.lock().expect("pending queue lock poisoned");
            pending.drain(..).collect()
        };
        if !reclaimed.is_empty() {
            let mut table = self.segments.write().expect("segment table lock poisoned");
            for slot in reclaimed {
                // dropping the last Arc zeroizes and frees the buffers
                table.remove(&slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_segment(region: &Region) -> Arc<Segment> {
        region
            .segments
            .read()
            .unwrap()
            .get(&FIRST_SLOT)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        assert_eq!(Region::new(16, 0).unwrap_err(), RegionError::InvalidAlignment);
        assert_eq!(Region::new(16, 6).unwrap_err(), RegionError::InvalidAlignment);
        assert_eq!(Region::new(4, 8).unwrap_err(), RegionError::InvalidSize);
        assert_eq!(Region::new(12, 8).unwrap_err(), RegionError::InvalidSize);
        assert!(Region::new(16, 8).is_ok());
    }

    #[test]
    fn test_alignment_grows_to_machine_word() {
        let region = Region::new(64, 1).unwrap();
        assert_eq!(region.alignment(), mem::size_of::<usize>());
        assert_eq!(region.size(), 64);
    }

    #[test]
    fn test_word_state_is_clean_outside_epochs() {
        let region = Region::new(16, 8).unwrap();

        let mut tx = region.begin(Access::ReadWrite);
        tx.write(&[7u8; 8], region.start()).unwrap();
        tx.commit().unwrap();

        let seg = first_segment(&region);
        assert!(seg.word(0).is_clean());
        assert!(seg.word(1).is_clean());
    }

    #[test]
    fn test_read_only_leaves_no_trace() {
        let region = Region::new(16, 8).unwrap();

        let mut buf = [0u8; 16];
        let mut tx = region.begin(Access::ReadOnly);
        tx.read(region.start(), &mut buf).unwrap();

        // still inside the epoch: a read-only pass mutated nothing
        let seg = first_segment(&region);
        assert!(seg.word(0).is_clean());
        assert!(seg.word(1).is_clean());
        assert!(!seg.take_accessed());

        tx.commit().unwrap();
    }

    #[test]
    fn test_aborted_alloc_is_unlinked_immediately() {
        let region = Region::new(8, 8).unwrap();

        let mut tx = region.begin(Access::ReadWrite);
        let addr = tx.alloc(32).unwrap();
        // an invalid free aborts the transaction
        assert_eq!(tx.free(region.start()), Err(TxError::InvalidAccess));
        assert_eq!(tx.commit(), Err(TxError::Aborted));

        assert!(region.locate(addr).is_none());
        assert_eq!(region.segments.read().unwrap().len(), 1);
    }

    #[test]
    fn test_dropped_transaction_releases_its_slot() {
        let region = Region::new(8, 8).unwrap();

        {
            let mut tx = region.begin(Access::ReadWrite);
            tx.write(&[1u8; 8], region.start()).unwrap();
            // dropped without commit
        }
        assert_eq!(region.epoch(), 1);

        // the tentative write never became readable
        let mut buf = [0xFFu8; 8];
        let mut tx = region.begin(Access::ReadOnly);
        tx.read(region.start(), &mut buf).unwrap();
        tx.commit().unwrap();
        assert_eq!(buf, [0u8; 8]);
    }
}
