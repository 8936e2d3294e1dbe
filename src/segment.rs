// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Segments
//!
//! A segment is a contiguous run of words sharing the region alignment. It
//! owns the two physical copies of its payload and the parallel
//! [`WordState`] array that arbitrates access to them. Which of the two
//! copies is readable is tracked per word, so the commit step never moves
//! bytes; it only flips selectors.

use crate::word::WordState;
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};
use zeroize::Zeroize;

/// Lifecycle of a segment inside its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentState {
    /// Published; readable by every transaction that holds its address.
    Live,
    /// Allocated by a transaction that has not committed yet.
    PendingAlloc,
    /// Freed by a committed transaction; reclaimed at the epoch boundary.
    PendingFree,
}

impl SegmentState {
    fn from_u8(raw: u8) -> SegmentState {
        match raw {
            0 => SegmentState::Live,
            1 => SegmentState::PendingAlloc,
            _ => SegmentState::PendingFree,
        }
    }
}

/// Heap buffer aligned to the region alignment, zero-filled at birth and
/// zeroized before it is returned to the allocator.
#[derive(Debug)]
struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    fn zeroed(len: usize, align: usize) -> Option<AlignedBuf> {
        let layout = Layout::from_size_align(len, align).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map(|ptr| AlignedBuf { ptr, layout })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()).zeroize();
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

#[derive(Debug)]
pub(crate) struct Segment {
    len: usize,
    align: usize,
    copy_a: AlignedBuf,
    copy_b: AlignedBuf,
    words: Box<[WordState]>,
    state: AtomicU8,
    /// Set on the first word-state mutation of the running epoch; lets the
    /// commit step skip segments no read-write transaction touched.
    accessed: AtomicBool,
}

// The word protocol gives the writable half of each word a single writer
// per epoch and keeps the readable half immutable while the epoch runs;
// the commit step only runs on a quiescent region.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocates a zero-filled segment of `len` payload bytes. Returns
    /// `None` when the allocator refuses either copy.
    pub fn new(len: usize, align: usize, state: SegmentState) -> Option<Segment> {
        debug_assert!(len > 0 && len % align == 0);

        let copy_a = AlignedBuf::zeroed(len, align)?;
        let copy_b = AlignedBuf::zeroed(len, align)?;
        let words = (0..len / align).map(|_| WordState::new()).collect();

        Some(Segment {
            len,
            align,
            copy_a,
            copy_b,
            words,
            state: AtomicU8::new(state as u8),
            accessed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn word(&self, index: usize) -> &WordState {
        &self.words[index]
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SegmentState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::SeqCst);
    }

    pub fn take_accessed(&self) -> bool {
        self.accessed.swap(false, Ordering::SeqCst)
    }

    /// Copies word `index` into `dst`. `from_writable` selects the
    /// tentative half instead of the committed one; callers use it only for
    /// words they own this epoch.
    pub fn read_word(&self, index: usize, from_writable: bool, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.align);

        let use_b = self.words[index].readable_is_b() ^ from_writable;
        let copy = if use_b { &self.copy_b } else { &self.copy_a };

        unsafe {
            let src = copy.as_ptr().add(index * self.align);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), self.align);
        }
    }

    /// Overwrites the writable half of word `index` with `src`. The caller
    /// must have claimed the word through [`WordState::write_rw`].
    pub fn write_word(&self, index: usize, src: &[u8]) {
        debug_assert_eq!(src.len(), self.align);

        let use_b = !self.words[index].readable_is_b();
        let copy = if use_b { &self.copy_b } else { &self.copy_a };

        unsafe {
            let dst = copy.as_ptr().add(index * self.align);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, self.align);
        }
    }

    /// Epoch-boundary pass over the word-state array.
    pub fn commit_words(&self) {
        for word in self.words.iter() {
            word.commit_reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_segment_is_zeroed() {
        let seg = Segment::new(32, 8, SegmentState::Live).unwrap();
        let mut buf = [0xFFu8; 8];

        for w in 0..4 {
            seg.read_word(w, false, &mut buf);
            assert_eq!(buf, [0u8; 8]);
        }
    }

    #[test]
    fn test_written_word_becomes_readable_after_commit() {
        let seg = Segment::new(16, 8, SegmentState::Live).unwrap();
        let pattern = [0xABu8; 8];
        let mut buf = [0u8; 8];

        assert!(matches!(
            seg.word(0).write_rw(1),
            crate::word::WritePlan::Claimed
        ));
        seg.write_word(0, &pattern);

        // tentative: the committed half still reads zero
        seg.read_word(0, false, &mut buf);
        assert_eq!(buf, [0u8; 8]);
        seg.read_word(0, true, &mut buf);
        assert_eq!(buf, pattern);

        seg.commit_words();

        seg.read_word(0, false, &mut buf);
        assert_eq!(buf, pattern);
        // the untouched neighbour word did not flip
        seg.read_word(1, false, &mut buf);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_state_round_trip() {
        let seg = Segment::new(8, 8, SegmentState::PendingAlloc).unwrap();

        assert_eq!(seg.state(), SegmentState::PendingAlloc);
        seg.set_state(SegmentState::Live);
        assert_eq!(seg.state(), SegmentState::Live);
        seg.set_state(SegmentState::PendingFree);
        assert_eq!(seg.state(), SegmentState::PendingFree);
    }
}
