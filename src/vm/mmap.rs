//! The memory-mapped-file registry (§4.4): per-process bookkeeping of live
//! `mmap` ranges, laid out lazily as FILE descriptors with frame-sharing
//! suppressed (`bid = NO_SHARE`).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, trace, warn};

use shared::memory::addr::VirtAddress;
use shared::memory::page::PAGE_SIZE;

use super::error::VmError;
use super::file::SharedFile;
use super::page::NO_SHARE;
use super::pagedir::PagedirId;
use super::{VmCore, PAGE_SIZE_BYTES};

/// Identity of a live mapping, scoped to the owning process (§9: per-process
/// generators rather than a global monotonic counter).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MapId(pub u32);

/// One live mapping (§3 `Mfile`): the virtual range it occupies, exclusive
/// of the end address.
struct Mfile {
    addr_init: VirtAddress,
    addr_fin: VirtAddress,
}

/// Per-process mappings plus the per-process `mapid` generator (§9).
#[derive(Default)]
struct ProcessMaps {
    next_id: u32,
    entries: BTreeMap<MapId, Mfile>,
}

/// The registry: one [`ProcessMaps`] per live process, guarded as a whole by
/// `VmCore::mmap` (§5, mmap registry lock).
#[derive(Default)]
pub(crate) struct MmapRegistry {
    by_process: BTreeMap<PagedirId, ProcessMaps>,
}

impl MmapRegistry {
    pub fn new() -> Self {
        MmapRegistry::default()
    }

    fn alloc_id(&mut self, dir_id: PagedirId) -> MapId {
        let proc = self.by_process.entry(dir_id).or_default();
        let id = MapId(proc.next_id);
        proc.next_id += 1;
        id
    }

    fn insert(&mut self, dir_id: PagedirId, id: MapId, mfile: Mfile) {
        self.by_process
            .entry(dir_id)
            .or_default()
            .entries
            .insert(id, mfile);
    }

    fn take(&mut self, dir_id: PagedirId, id: MapId) -> Option<Mfile> {
        self.by_process.get_mut(&dir_id)?.entries.remove(&id)
    }

    /// Drops every mapping owned by `dir_id` without paging anything out,
    /// for use after the caller has already walked and torn each one down.
    fn forget_process(&mut self, dir_id: PagedirId) {
        self.by_process.remove(&dir_id);
    }
}

impl VmCore {
    /// `mmap` (§4.4): lays out `[addr, addr + file.length())` page by page as
    /// lazy FILE descriptors with sharing suppressed, after first checking
    /// that every page in the range is free of an existing descriptor (the
    /// whole range either installs atomically or not at all).
    ///
    /// `mmap` reopens `file` itself rather than storing the caller's handle,
    /// so the mapping's lifetime is independent of the fd that created it
    /// (§4.4): closing or reusing the caller's own fd afterward must not
    /// disturb pages this mapping has yet to read in or write back.
    pub fn mmap(
        &self,
        dir_id: PagedirId,
        addr: VirtAddress,
        file: SharedFile,
    ) -> Result<MapId, VmError> {
        if addr.as_raw() == 0 || !addr.is_aligned_to_length(PAGE_SIZE) {
            return Err(VmError::MmapBadArgs);
        }

        let (length, reopened) = self.fs_lock.with(|| {
            let f = file.lock();
            (f.length(), f.reopen())
        });
        if length == 0 {
            return Err(VmError::MmapBadArgs);
        }
        let file: SharedFile = Arc::new(spin::Mutex::new(reopened));

        let page_count = (length as usize).div_ceil(PAGE_SIZE_BYTES);
        let addr_fin = VirtAddress::from_raw(addr.as_raw() + (page_count * PAGE_SIZE_BYTES) as u64);

        let mut pages = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let page_addr = VirtAddress::from_raw(addr.as_raw() + (i * PAGE_SIZE_BYTES) as u64);
            if self.page_lookup(dir_id, page_addr).is_some() {
                return Err(VmError::MmapRangeOccupied);
            }
            pages.push(page_addr);
        }

        let mut installed = Vec::with_capacity(page_count);
        for (i, page_addr) in pages.iter().enumerate() {
            let ofs = (i * PAGE_SIZE_BYTES) as u64;
            let remaining = length - ofs;
            let read_bytes = remaining.min(PAGE_SIZE_BYTES as u64) as u32;
            let zero_bytes = PAGE_SIZE_BYTES as u32 - read_bytes;

            match self.page_file(
                dir_id,
                *page_addr,
                file.clone(),
                ofs,
                read_bytes,
                zero_bytes,
                true,
                NO_SHARE,
                true,
            ) {
                Ok(page) => installed.push(page),
                Err(err) => {
                    for page in &installed {
                        self.page_free(page);
                    }
                    return Err(err);
                }
            }
        }

        let id = {
            let mut registry = self.mmap.lock();
            let id = registry.alloc_id(dir_id);
            registry.insert(dir_id, id, Mfile { addr_init: addr, addr_fin });
            id
        };

        debug!("mmap: installed {page_count} page(s) at {addr:?} as {id:?}");
        Ok(id)
    }

    /// `munmap` (§4.4): walks the mapping's range, pinning each resident
    /// page to exclude eviction, freeing its frame (which pages it out,
    /// writing back if dirty), then destroying the descriptor.
    pub fn munmap(&self, dir_id: PagedirId, id: MapId) -> Result<(), VmError> {
        let mfile = {
            let mut registry = self.mmap.lock();
            registry.take(dir_id, id).ok_or(VmError::UnknownMapid)?
        };

        let mut addr = mfile.addr_init;
        while addr != mfile.addr_fin {
            if let Some(page) = self.page_lookup(dir_id, addr) {
                let frame = page.lock().kpage;
                if let Some(frame) = frame {
                    self.frames.pin(frame);
                    self.frame_free(frame, Some(dir_id));
                }
                self.page_free(&page);
            }
            addr = VirtAddress::from_raw(addr.as_raw() + PAGE_SIZE_BYTES as u64);
        }

        trace!("munmap: tore down {id:?}");
        Ok(())
    }

    /// Process teardown (§6): tears down every mapping still live for
    /// `dir_id`, then drops the now-empty per-process bookkeeping.
    pub fn munmap_all(&self, dir_id: PagedirId) {
        let ids: Vec<MapId> = {
            let registry = self.mmap.lock();
            registry
                .by_process
                .get(&dir_id)
                .map(|p| p.entries.keys().copied().collect())
                .unwrap_or_default()
        };
        for id in ids {
            if let Err(err) = self.munmap(dir_id, id) {
                warn!("munmap_all: failed to tear down {id:?} for {dir_id:?}: {err}");
            }
        }
        self.mmap.lock().forget_process(dir_id);
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;

    use super::*;
    use crate::vm::file::FileHandle;
    use crate::vm::page::testing::TestFile;
    use crate::vm::testing::{new_test_core, TEST_ADDR};

    fn shared(data: alloc::vec::Vec<u8>) -> SharedFile {
        Arc::new(spin::Mutex::new(
            Box::new(TestFile::new(data, true)) as Box<dyn FileHandle>
        ))
    }

    #[test_log::test]
    fn mmap_lays_out_one_descriptor_per_page() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let id = core
            .mmap(dir_id, TEST_ADDR, shared(vec![1u8; PAGE_SIZE_BYTES + 10]))
            .unwrap();
        assert_eq!(id, MapId(0));

        let page0 = core.page_lookup(dir_id, TEST_ADDR).unwrap();
        assert!(!page0.lock().loaded);
        let second_addr = VirtAddress::from_raw(TEST_ADDR.as_raw() + PAGE_SIZE_BYTES as u64);
        assert!(core.page_lookup(dir_id, second_addr).is_some());
    }

    #[test_log::test]
    fn mmap_rejects_an_occupied_range() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        core.page_zero(dir_id, TEST_ADDR, true).unwrap();

        let err = core
            .mmap(dir_id, TEST_ADDR, shared(vec![1u8; PAGE_SIZE_BYTES]))
            .unwrap_err();
        assert_eq!(err, VmError::MmapRangeOccupied);
    }

    #[test_log::test]
    fn mmap_reopens_the_file_so_mapping_outlives_the_callers_handle() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let original = shared(vec![0xABu8; PAGE_SIZE_BYTES]);
        core.mmap(dir_id, TEST_ADDR, original.clone()).unwrap();

        // Mutate the caller's own handle after `mmap` returns. A mapping
        // that captured the caller's handle directly, instead of reopening
        // its own, would have this disturb the page it's about to read in.
        {
            let mut f = original.lock();
            f.seek(0);
            f.write(&[0xCDu8; PAGE_SIZE_BYTES]);
        }

        let page = core.page_lookup(dir_id, TEST_ADDR).unwrap();
        core.page_in(&page, false).unwrap();
        let frame = page.lock().kpage.unwrap();
        let bytes = unsafe {
            core::slice::from_raw_parts(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES)
        };
        assert!(
            bytes.iter().all(|&b| b == 0xAB),
            "mapping must read through its own reopened handle, not the caller's mutated one"
        );
    }

    #[test_log::test]
    fn mmap_rejects_unaligned_address() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let bad = VirtAddress::from_raw(TEST_ADDR.as_raw() + 1);

        let err = core.mmap(dir_id, bad, shared(vec![1u8; 10])).unwrap_err();
        assert_eq!(err, VmError::MmapBadArgs);
    }

    #[test_log::test]
    fn munmap_writes_back_only_the_dirtied_page() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        let id = core
            .mmap(dir_id, TEST_ADDR, shared(vec![0u8; PAGE_SIZE_BYTES * 2]))
            .unwrap();

        let second_addr = VirtAddress::from_raw(TEST_ADDR.as_raw() + PAGE_SIZE_BYTES as u64);
        let second = core.page_lookup(dir_id, second_addr).unwrap();
        core.page_in(&second, false).unwrap();
        unsafe {
            let frame = second.lock().kpage.unwrap();
            let bytes = core::slice::from_raw_parts_mut(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES);
            bytes[0] = 0x55;
        }
        core.directory(dir_id).lock().set_dirty(second_addr, true);

        core.munmap(dir_id, id).unwrap();

        assert!(core.page_lookup(dir_id, TEST_ADDR).is_none());
        assert!(core.page_lookup(dir_id, second_addr).is_none());
    }

    #[test_log::test]
    fn munmap_unknown_mapid_fails() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let err = core.munmap(dir_id, MapId(7)).unwrap_err();
        assert_eq!(err, VmError::UnknownMapid);
    }
}
