//! Page descriptors (§3 `Page`) and the paging protocol that moves their
//! contents between a frame, a file, and swap (§4.3).
//!
//! A descriptor never moves or is duplicated once created: every other
//! table holds a [`PageHandle`], a clonable reference to the same backing
//! state, so that a frame's page list and a page directory's descriptor slot
//! always observe the same `loaded`/`kpage` transition.

use alloc::sync::Arc;

use log::{debug, error, trace};

use shared::memory::addr::VirtAddress;
use shared::memory::page::Frame;

use super::error::VmError;
use super::file::{FileHandle, SharedFile};
use super::pagedir::PagedirId;
use super::swap::SwapIndex;
use super::{VmCore, PAGE_SIZE_BYTES};

/// Block identity for file-backed sharing: a stable function of `(inode,
/// offset)` in the source kernel, opaque here. `NO_SHARE` suppresses the
/// frame-sharing lookup entirely, which is what every mmap page uses (§4.4).
pub type Bid = i64;
pub const NO_SHARE: Bid = -1;

/// What a `FILE`-typed descriptor reads its contents from.
pub struct FileBacking {
    pub file: SharedFile,
    pub ofs: u64,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub bid: Bid,
    /// True iff this descriptor is a live entry of some `Mfile` mapping
    /// (§4.4), as opposed to an executable's file-backed load segment. This
    /// is the resolved test from §9's open question on `page_out` policy: a
    /// dirty mmap page writes back, a dirty non-mmap file page swaps.
    pub is_mmap: bool,
}

/// The current backing of a page descriptor (§3 `type`).
pub enum Backing {
    File(FileBacking),
    Zero,
    Swap(SwapIndex),
}

/// One user virtual page's worth of bookkeeping (§3 `Page`).
pub struct Page {
    pub backing: Backing,
    pub writable: bool,
    pub loaded: bool,
    pub pagedir: PagedirId,
    pub address: VirtAddress,
    pub kpage: Option<Frame>,
}

/// A shared handle to a [`Page`]: installed in exactly one page directory
/// slot and, while resident, listed in exactly one frame's page list (two,
/// transiently, only for FILE descriptors sharing a `bid`).
pub type PageHandle = Arc<spin::Mutex<Page>>;

enum FillPlan {
    File {
        file: SharedFile,
        ofs: u64,
        read_bytes: usize,
        zero_bytes: usize,
    },
    Zero,
    Swap(SwapIndex),
}

impl VmCore {
    /// `page_file` (§4.3): allocates a FILE descriptor and installs it in
    /// `dir`'s descriptor slot for `addr`. Lazy: nothing is paged in yet.
    ///
    /// Fails with [`VmError::OutOfMemory`] if the descriptor's backing
    /// allocation can't be satisfied — the one bookkeeping-allocation
    /// failure §7 classifies as user-fatal, as distinct from physical-frame
    /// exhaustion, which `frame_new` resolves by eviction instead.
    pub fn page_file(
        &self,
        dir_id: PagedirId,
        addr: VirtAddress,
        file: SharedFile,
        ofs: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
        bid: Bid,
        is_mmap: bool,
    ) -> Result<PageHandle, VmError> {
        let page = Arc::try_new(spin::Mutex::new(Page {
            backing: Backing::File(FileBacking {
                file,
                ofs,
                read_bytes,
                zero_bytes,
                bid,
                is_mmap,
            }),
            writable,
            loaded: false,
            pagedir: dir_id,
            address: addr,
            kpage: None,
        }))
        .map_err(|_| VmError::OutOfMemory)?;
        self.install_slot(dir_id, addr, page.clone());
        Ok(page)
    }

    /// `page_zero` (§4.3): allocates a ZERO descriptor and installs it. See
    /// [`VmCore::page_file`] for the `OutOfMemory` failure mode.
    pub fn page_zero(&self, dir_id: PagedirId, addr: VirtAddress, writable: bool) -> Result<PageHandle, VmError> {
        let page = Arc::try_new(spin::Mutex::new(Page {
            backing: Backing::Zero,
            writable,
            loaded: false,
            pagedir: dir_id,
            address: addr,
            kpage: None,
        }))
        .map_err(|_| VmError::OutOfMemory)?;
        self.install_slot(dir_id, addr, page.clone());
        Ok(page)
    }

    pub(super) fn install_slot(&self, dir_id: PagedirId, addr: VirtAddress, page: PageHandle) {
        self.directories.get(dir_id).lock().add_page(addr, page);
    }

    /// `page_lookup` (§6): the descriptor slot for `addr` in `dir_id`'s page
    /// directory, independent of whether the hardware PTE is present.
    pub fn page_lookup(&self, dir_id: PagedirId, addr: VirtAddress) -> Option<PageHandle> {
        self.directories.get(dir_id).lock().find_page(addr)
    }

    /// `page_in` (§4.3). Brings `p` into a resident frame and installs the
    /// hardware mapping, sharing an existing FILE-backed frame when the
    /// descriptor's `bid` matches one already resident. Returns `Ok(())` on
    /// idempotent no-op if already loaded.
    pub fn page_in(&self, page: &PageHandle, pin: bool) -> Result<(), VmError> {
        let _serialize = self.page_in_lock.lock();

        if page.lock().loaded {
            return Ok(());
        }

        let pagedir = page.lock().pagedir;

        let bid = match &page.lock().backing {
            Backing::File(fb) if fb.bid != NO_SHARE => Some(fb.bid),
            _ => None,
        };

        let frame = match bid.and_then(|b| self.frames.lookup_bid(b)) {
            Some(frame) => {
                debug!("page_in: sharing resident frame for bid {bid:?}");
                frame
            }
            None => self.frame_new(),
        };

        self.frames.page(frame, page.clone(), bid);

        let fill_plan = {
            let p = page.lock();
            match &p.backing {
                Backing::File(fb) => FillPlan::File {
                    file: fb.file.clone(),
                    ofs: fb.ofs,
                    read_bytes: fb.read_bytes as usize,
                    zero_bytes: fb.zero_bytes as usize,
                },
                Backing::Zero => FillPlan::Zero,
                Backing::Swap(idx) => FillPlan::Swap(*idx),
            }
        };

        // SAFETY: `frame` was just allocated or re-pinned above, so it is
        // resident and reserved for our exclusive use until we unpin it
        // below (or leave it pinned for the caller).
        let dst = unsafe {
            core::slice::from_raw_parts_mut(self.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };

        match fill_plan {
            FillPlan::File {
                file,
                ofs,
                read_bytes,
                zero_bytes,
            } => {
                trace!("page_in: reading {read_bytes} bytes at ofs {ofs}");
                let n = self.fs_lock.with(|| {
                    let mut f = file.lock();
                    f.seek(ofs);
                    f.read(&mut dst[..read_bytes])
                });
                if n != read_bytes {
                    error!("page_in: short read ({n} of {read_bytes} bytes), killing process");
                    let _guard = self.frames.lock_for_eviction();
                    self.frames.remove_page(frame, pagedir);
                    self.frames.remove_if_empty(frame);
                    return Err(VmError::ShortRead);
                }
                dst[read_bytes..read_bytes + zero_bytes].fill(0);
            }
            FillPlan::Zero => dst.fill(0),
            FillPlan::Swap(idx) => {
                trace!("page_in: reading swap slot {idx:?}");
                self.swap.read_into(idx, dst);
                self.swap.free(idx);
            }
        }

        let (address, writable) = {
            let p = page.lock();
            (p.address, p.writable)
        };
        let dir = self.directories.get(pagedir);
        {
            let mut dir = dir.lock();
            dir.clear_page(address);
            dir.set_page(address, frame, writable)?;
            dir.set_dirty(address, false);
            dir.set_accessed(address, true);
        }

        {
            let mut p = page.lock();
            p.loaded = true;
            p.kpage = Some(frame);
        }

        if !pin {
            self.frames.unpin(frame);
        }

        Ok(())
    }

    /// `page_out` (§4.3): moves a resident descriptor's contents to their
    /// long-term home (file writeback for a dirty shared mmap page, swap for
    /// any other dirty page, discard for a clean one) and tears down the
    /// hardware mapping. A no-op if `p` isn't resident.
    pub fn page_out(&self, page: &PageHandle) {
        let _serialize = self.page_out_lock.lock();

        let (frame, pagedir, address) = {
            let p = page.lock();
            match p.kpage {
                Some(frame) => (frame, p.pagedir, p.address),
                None => return,
            }
        };

        let dir = self.directories.get(pagedir);
        let dirty = dir.lock().is_dirty(address);

        let is_mmap = matches!(&page.lock().backing, Backing::File(fb) if fb.is_mmap);
        let is_swap_already = matches!(page.lock().backing, Backing::Swap(_));

        if is_mmap && dirty {
            self.write_back_file(page, frame);
        } else if is_swap_already || dirty {
            self.swap_out(page, frame);
        } else {
            trace!("page_out: discarding clean page at {address:?}");
        }

        // The directory's descriptor slot already holds this handle (it was
        // never removed, only the hardware PTE was); clearing that PTE and
        // the in-memory residency flags is all that's needed to make the
        // next fault re-run `page_in`.
        dir.lock().clear_page(address);
        let mut p = page.lock();
        p.loaded = false;
        p.kpage = None;
    }

    fn write_back_file(&self, page: &PageHandle, frame: Frame) {
        let (file, ofs, read_bytes) = {
            let p = page.lock();
            match &p.backing {
                Backing::File(fb) => (fb.file.clone(), fb.ofs, fb.read_bytes as usize),
                _ => unreachable!("write_back_file called on a non-FILE descriptor"),
            }
        };

        // Pin around the filesystem call to exclude eviction (§5 pinning
        // discipline (c)).
        self.frames.pin(frame);
        // SAFETY: the frame is pinned for the duration of this write and was
        // resident on entry to `page_out`.
        let src = unsafe {
            core::slice::from_raw_parts(self.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };
        self.fs_lock.with(|| {
            let mut f = file.lock();
            f.seek(ofs);
            f.write(&src[..read_bytes]);
        });
        self.frames.unpin(frame);
        trace!("page_out: wrote back dirty mmap page at ofs {ofs}");
    }

    fn swap_out(&self, page: &PageHandle, frame: Frame) {
        // SAFETY: the frame is still resident; nothing unpins or reallocates
        // it while we hold the out-lock.
        let src = unsafe {
            core::slice::from_raw_parts(self.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };
        let idx = self.swap.save(src);
        let mut p = page.lock();
        p.backing = Backing::Swap(idx);
        debug!("page_out: swapped page at {:?} to slot {:?}", p.address, idx);
    }

    /// `page_free` (§4.3): releases a descriptor's swap slot if it holds one
    /// non-resident, clears its PTE, and removes it from the directory.
    /// Callers must have already paged it out if it was resident (munmap and
    /// process teardown both route through `frame_free`, which calls
    /// `page_out`, before reaching here).
    pub fn page_free(&self, page: &PageHandle) {
        let (pagedir, address) = {
            let p = page.lock();
            if let Backing::Swap(idx) = p.backing {
                if !p.loaded {
                    self.swap.free(idx);
                }
            }
            (p.pagedir, p.address)
        };
        let dir = self.directories.get(pagedir);
        let mut dir = dir.lock();
        dir.clear_page(address);
        dir.remove_page(address);
    }

    /// Allocates a fresh pinned frame, forcing eviction and retrying as many
    /// times as needed (§4.2 `frame_new`). Physical-frame exhaustion is §7's
    /// transient/recoverable case, resolved by eviction rather than an error
    /// return; it is `evict_one`, not this loop, that draws the line at the
    /// genuinely unrecoverable case (every frame pinned).
    pub(super) fn frame_new(&self) -> Frame {
        loop {
            if let Some(frame) = self.frames.try_allocate() {
                return frame;
            }
            self.evict_one();
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    use alloc::boxed::Box;
    use alloc::vec::Vec;

    /// In-memory [`FileHandle`] for tests: a fixed byte buffer plus a cursor.
    pub struct TestFile {
        pub data: Vec<u8>,
        pub pos: u64,
        pub writable: bool,
    }

    impl TestFile {
        pub fn new(data: Vec<u8>, writable: bool) -> Self {
            TestFile {
                data,
                pos: 0,
                writable,
            }
        }
    }

    impl FileHandle for TestFile {
        fn seek(&mut self, offset: u64) {
            self.pos = offset;
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            let start = self.pos as usize;
            let n = buf.len().min(self.data.len().saturating_sub(start));
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            self.pos += n as u64;
            n
        }

        fn write(&mut self, buf: &[u8]) -> usize {
            let start = self.pos as usize;
            if self.data.len() < start + buf.len() {
                self.data.resize(start + buf.len(), 0);
            }
            self.data[start..start + buf.len()].copy_from_slice(buf);
            self.pos += buf.len() as u64;
            buf.len()
        }

        fn length(&self) -> u64 {
            self.data.len() as u64
        }

        fn writable(&self) -> bool {
            self.writable
        }

        fn reopen(&self) -> Box<dyn FileHandle> {
            Box::new(TestFile {
                data: self.data.clone(),
                pos: 0,
                writable: self.writable,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestFile;
    use super::*;

    use alloc::boxed::Box;
    use alloc::vec;

    use crate::vm::testing::{new_test_core, TEST_ADDR};

    #[test_log::test]
    fn zero_page_pages_in_as_zeroes() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let page = core.page_zero(dir_id, TEST_ADDR, true).unwrap();
        core.page_in(&page, false).unwrap();

        assert!(page.lock().loaded);
        let frame = page.lock().kpage.unwrap();
        let bytes = unsafe {
            core::slice::from_raw_parts(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test_log::test]
    fn file_page_reads_and_zero_fills_tail() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let mut data = vec![0xAAu8; 10];
        data.extend(vec![0xBBu8; 10]);
        let file: SharedFile =
            Arc::new(spin::Mutex::new(Box::new(TestFile::new(data, false)) as Box<dyn FileHandle>));

        let page = core
            .page_file(dir_id, TEST_ADDR, file, 0, 20, (PAGE_SIZE_BYTES - 20) as u32, false, NO_SHARE, false)
            .unwrap();
        core.page_in(&page, false).unwrap();

        let frame = page.lock().kpage.unwrap();
        let bytes = unsafe {
            core::slice::from_raw_parts(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };
        assert_eq!(&bytes[..10], &[0xAA; 10]);
        assert_eq!(&bytes[10..20], &[0xBB; 10]);
        assert!(bytes[20..].iter().all(|&b| b == 0));
    }

    #[test_log::test]
    fn short_read_fails_page_in() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let file: SharedFile =
            Arc::new(spin::Mutex::new(Box::new(TestFile::new(vec![1, 2, 3], false)) as Box<dyn FileHandle>));

        let page = core
            .page_file(dir_id, TEST_ADDR, file, 0, 100, 0, false, NO_SHARE, false)
            .unwrap();
        let err = core.page_in(&page, false).unwrap_err();
        assert_eq!(err, VmError::ShortRead);
        assert!(!page.lock().loaded);
    }

    #[test_log::test]
    fn anonymous_write_survives_eviction_round_trip() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let page = core.page_zero(dir_id, TEST_ADDR, true).unwrap();
        core.page_in(&page, false).unwrap();

        let frame = page.lock().kpage.unwrap();
        unsafe {
            let bytes = core::slice::from_raw_parts_mut(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES);
            bytes[0] = 0x42;
        }
        core.directories.get(dir_id).lock().set_dirty(TEST_ADDR, true);

        core.page_out(&page);
        assert!(!page.lock().loaded);
        assert!(matches!(page.lock().backing, Backing::Swap(_)));

        core.page_in(&page, false).unwrap();
        let frame = page.lock().kpage.unwrap();
        let bytes = unsafe {
            core::slice::from_raw_parts(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };
        assert_eq!(bytes[0], 0x42);
    }

    #[test_log::test]
    fn two_private_mappings_of_same_block_share_a_frame() {
        let core = new_test_core();
        let dir_a = core.new_directory();
        let dir_b = core.new_directory();

        let file: SharedFile =
            Arc::new(spin::Mutex::new(Box::new(TestFile::new(vec![7u8; PAGE_SIZE_BYTES], false)) as Box<dyn FileHandle>));

        let bid: Bid = 42;
        let page_a = core
            .page_file(dir_a, TEST_ADDR, file.clone(), 0, PAGE_SIZE_BYTES as u32, 0, false, bid, false)
            .unwrap();
        let page_b = core
            .page_file(dir_b, TEST_ADDR, file, 0, PAGE_SIZE_BYTES as u32, 0, false, bid, false)
            .unwrap();

        core.page_in(&page_a, false).unwrap();
        core.page_in(&page_b, false).unwrap();

        let frame_a = page_a.lock().kpage.unwrap();
        let frame_b = page_b.lock().kpage.unwrap();
        assert_eq!(frame_a, frame_b);
        assert_eq!(core.frames.page_count(frame_a), 2);
    }
}
