//! The resident-frame table (§4.2): two views over the same set of frames,
//! a hash keyed by frame address for `frame_find`/`frame_pin`/`frame_free`,
//! and a clock-ordered list the eviction sweep walks.
//!
//! Per design note §9 ("clock pointer fragility"), the clock position here
//! is a plain [`Frame`] value re-seated on removal, not a pointer that could
//! dangle; the frame-sharing index (§9 "shared-frame index by `bid`") is a
//! direct `BTreeMap<Bid, Frame>` rather than the source's linear scan.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::debug;

use shared::memory::alloc::FrameAllocator;
use shared::memory::page::Frame;

use super::page::{Bid, PageHandle};
use super::pagedir::PagedirId;

struct Entry {
    pin: bool,
    pages: Vec<PageHandle>,
}

struct Inner {
    allocator: Box<dyn FrameAllocator + Send>,
    entries: BTreeMap<Frame, Entry>,
    by_bid: BTreeMap<Bid, Frame>,
    clock: Vec<Frame>,
    clock_pos: usize,
}

/// The resident-frame table. All mutating operations take `&self`; internal
/// mutability is via a single `spin::Mutex` covering the hash, the clock
/// list, and every frame's page list. The source's lock hierarchy (§5)
/// separates the table lock from a per-frame page-list lock to let readers
/// of different frames proceed concurrently; this crate collapses the two
/// since nothing here does enough per-frame work under lock to make that
/// split pay for itself, and a single lock keeps the eviction-termination
/// argument in `VmCore::evict_one` easy to see is correct.
pub(crate) struct FrameTable {
    inner: spin::Mutex<Inner>,
    eviction_lock: spin::Mutex<()>,
}

impl FrameTable {
    pub fn new(allocator: Box<dyn FrameAllocator + Send>) -> Self {
        FrameTable {
            inner: spin::Mutex::new(Inner {
                allocator,
                entries: BTreeMap::new(),
                by_bid: BTreeMap::new(),
                clock: Vec::new(),
                clock_pos: 0,
            }),
            eviction_lock: spin::Mutex::new(()),
        }
    }

    /// Attempts a fresh allocation. On success, the new frame is inserted
    /// into both indexes already pinned (§4.2: "newly-minted frames are born
    /// pinned"). Returns `None` on allocator exhaustion so the caller can
    /// force an eviction pass and retry.
    pub fn try_allocate(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let frame = inner.allocator.allocate()?;
        inner.entries.insert(
            frame,
            Entry {
                pin: true,
                pages: Vec::new(),
            },
        );
        inner.clock.push(frame);
        debug!("frame_new: allocated {frame:?}");
        Some(frame)
    }

    /// `frame_page` (§4.2): associates `page` with `frame`'s page list, and,
    /// if `bid` is given, registers the frame under that bid so a future
    /// `frame_lookup` can find it.
    pub fn page(&self, frame: Frame, page: PageHandle, bid: Option<Bid>) {
        let mut inner = self.inner.lock();
        if let Some(bid) = bid {
            inner.by_bid.insert(bid, frame);
        }
        inner
            .entries
            .get_mut(&frame)
            .expect("frame_page on a frame absent from the table")
            .pages
            .push(page);
    }

    /// `frame_lookup` (§4.2): finds a frame already hosting `bid`, re-pinning
    /// it as a side effect so it survives until the caller finishes `page_in`.
    pub fn lookup_bid(&self, bid: Bid) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let frame = *inner.by_bid.get(&bid)?;
        inner
            .entries
            .get_mut(&frame)
            .expect("by_bid points at a missing frame")
            .pin = true;
        Some(frame)
    }

    /// Pins `frame`, excluding it from eviction. A no-op on an already
    /// torn-down frame (§9: unlike the source, pin/unpin here always act,
    /// since their only precondition is that the frame is still resident).
    pub fn pin(&self, frame: Frame) {
        if let Some(e) = self.inner.lock().entries.get_mut(&frame) {
            e.pin = true;
        }
    }

    pub fn unpin(&self, frame: Frame) {
        if let Some(e) = self.inner.lock().entries.get_mut(&frame) {
            e.pin = false;
        }
    }

    pub fn is_pinned(&self, frame: Frame) -> bool {
        self.inner
            .lock()
            .entries
            .get(&frame)
            .map(|e| e.pin)
            .unwrap_or(false)
    }

    /// A snapshot of the handles currently sharing `frame`.
    pub fn pages_of(&self, frame: Frame) -> Vec<PageHandle> {
        self.inner
            .lock()
            .entries
            .get(&frame)
            .map(|e| e.pages.clone())
            .unwrap_or_default()
    }

    pub fn page_count(&self, frame: Frame) -> usize {
        self.inner
            .lock()
            .entries
            .get(&frame)
            .map(|e| e.pages.len())
            .unwrap_or(0)
    }

    /// Removes and returns the one descriptor owned by `pagedir`, for the
    /// per-process branch of `frame_free`.
    pub fn remove_page(&self, frame: Frame, pagedir: PagedirId) -> Option<PageHandle> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&frame)?;
        let idx = entry
            .pages
            .iter()
            .position(|p| p.lock().pagedir == pagedir)?;
        Some(entry.pages.remove(idx))
    }

    /// Empties a frame's page list outright, for the whole-frame-teardown
    /// branch of `frame_free` (every descriptor has already been paged out
    /// by the caller).
    pub fn clear_pages(&self, frame: Frame) {
        if let Some(e) = self.inner.lock().entries.get_mut(&frame) {
            e.pages.clear();
        }
    }

    /// If `frame`'s page list is empty, removes it from both indexes and
    /// returns the physical page to the allocator.
    pub fn remove_if_empty(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        let empty = inner
            .entries
            .get(&frame)
            .map(|e| e.pages.is_empty())
            .unwrap_or(false);
        if !empty {
            return;
        }
        inner.entries.remove(&frame);
        inner.by_bid.retain(|_, f| *f != frame);
        if let Some(pos) = inner.clock.iter().position(|f| *f == frame) {
            inner.clock.remove(pos);
            if inner.clock_pos > pos {
                inner.clock_pos -= 1;
            }
            if !inner.clock.is_empty() {
                inner.clock_pos %= inner.clock.len();
            } else {
                inner.clock_pos = 0;
            }
        }
        inner.allocator.deallocate(frame);
        debug!("frame_free: released {frame:?} to the allocator");
    }

    /// One tick of the second-chance clock (§4.2 `get_next`): returns the
    /// next frame in cycle order without judging or removing it.
    pub fn clock_next(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if inner.clock.is_empty() {
            return None;
        }
        let frame = inner.clock[inner.clock_pos];
        inner.clock_pos = (inner.clock_pos + 1) % inner.clock.len();
        Some(frame)
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Acquires the eviction-serialization lock (§5): held for the full
    /// extent of either a `frame_free` call or an eviction sweep, so the two
    /// never interleave.
    pub fn lock_for_eviction(&self) -> spin::MutexGuard<'_, ()> {
        self.eviction_lock.lock()
    }
}

impl super::VmCore {
    /// `frame_free` (§4.2): tears down one frame's association with either
    /// every descriptor it holds (`pagedir = None`, eviction/full teardown)
    /// or just the one owned by `pagedir` (per-process unmap), paging out
    /// each before removing it, then reclaims the frame once its page list
    /// is empty.
    pub fn frame_free(&self, frame: Frame, pagedir: Option<PagedirId>) {
        let _guard = self.frames.lock_for_eviction();
        self.frame_free_locked(frame, pagedir);
    }

    pub(super) fn frame_free_locked(&self, frame: Frame, pagedir: Option<PagedirId>) {
        match pagedir {
            None => {
                for page in self.frames.pages_of(frame) {
                    self.page_out(&page);
                }
                self.frames.clear_pages(frame);
            }
            Some(pd) => {
                if let Some(page) = self.frames.remove_page(frame, pd) {
                    self.page_out(&page);
                }
            }
        }
        self.frames.remove_if_empty(frame);
    }

    /// One pass of the second-chance eviction clock (§4.2). Halts via
    /// assertion if every resident frame is pinned, per the resolved design
    /// note in §9: spinning forever inside a fault handler is worse than a
    /// clear panic.
    pub(crate) fn evict_one(&self) {
        let _guard = self.frames.lock_for_eviction();

        let budget = self.frames.frame_count().max(1) * 2;
        for _ in 0..budget {
            let frame = self
                .frames
                .clock_next()
                .expect("evict_one invoked with no resident frames");

            if self.frames.is_pinned(frame) {
                continue;
            }

            let pages = self.frames.pages_of(frame);
            let mut referenced = false;
            for page in &pages {
                let (pagedir, address) = {
                    let p = page.lock();
                    (p.pagedir, p.address)
                };
                let dir = self.directories.get(pagedir);
                let mut dir = dir.lock();
                if dir.is_accessed(address) {
                    dir.set_accessed(address, false);
                    referenced = true;
                }
            }
            if referenced {
                continue;
            }

            debug!("evict_one: selected {frame:?} as victim");
            self.frame_free_locked(frame, None);
            return;
        }

        panic!("eviction found no unpinned frame: every frame is pinned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::vm::testing::{new_test_core, TEST_ADDR};

    #[test_log::test]
    fn frame_new_is_born_pinned() {
        let core = new_test_core();
        let frame = core.frames.try_allocate().unwrap();
        assert!(core.frames.is_pinned(frame));
    }

    #[test_log::test]
    fn remove_if_empty_frees_to_allocator_and_advances_clock_cleanly() {
        let core = new_test_core();
        let a = core.frames.try_allocate().unwrap();
        let b = core.frames.try_allocate().unwrap();
        let c = core.frames.try_allocate().unwrap();

        core.frames.unpin(a);
        core.frames.unpin(b);
        core.frames.unpin(c);

        core.frames.remove_if_empty(b);
        assert_eq!(core.frames.frame_count(), 2);

        // The clock must still only ever yield resident frames.
        for _ in 0..10 {
            let f = core.frames.clock_next().unwrap();
            assert!(f == a || f == c);
        }
    }

    #[test_log::test]
    fn evict_one_skips_pinned_frames() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let pinned = core.page_zero(dir_id, TEST_ADDR, true).unwrap();
        core.page_in(&pinned, true).unwrap();
        let pinned_frame = pinned.lock().kpage.unwrap();
        assert!(core.frames.is_pinned(pinned_frame));

        let victim_addr = shared::memory::addr::VirtAddress::from_raw(TEST_ADDR.as_raw() + 0x1000);
        let victim = core.page_zero(dir_id, victim_addr, true).unwrap();
        core.page_in(&victim, false).unwrap();

        core.evict_one();

        assert!(pinned.lock().loaded, "pinned frame must never be evicted");
        assert!(!victim.lock().loaded, "unpinned frame should be the victim");
    }
}
