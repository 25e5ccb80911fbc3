//! The virtual-memory core: the mapping between user virtual addresses and
//! physical frames, the backing of those pages by files, zero-fill, or swap
//! storage, and the demand-paging / eviction protocol that underpins them.
//!
//! Five pieces, leaves-first: [`swap`] (the bitmap-backed swap area),
//! [`frame`] (the resident-frame table and eviction clock), [`page`] (page
//! descriptors and the paging protocol), [`mmap`] (memory-mapped-file
//! registry), and [`fault`] (the page-fault handler and the read/write
//! buffer-pinning glue). [`pagedir`] and [`file`] are the narrow seams onto
//! the hardware page tables and the filesystem, both out of scope for this
//! crate and modeled as traits so the rest compiles and tests without them.
//!
//! Every operation hangs off [`VmCore`], which owns the five cooperating
//! tables plus a registry of live page directories (§9's resolution of
//! "descriptor slot in the page directory": a `PagedirId -> PageDirectory`
//! side table, needed because eviction and `page_out` must reach a page's
//! owning directory even when it isn't the thread's own process).

pub mod error;
pub mod fault;
pub mod file;
pub mod frame;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod swap;

pub use error::VmError;
pub use file::{FileHandle, SharedFile};
pub use mmap::MapId;
pub use page::{Bid, PageHandle, NO_SHARE};
pub use pagedir::{PageDirectory, PagedirId};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use shared::memory::alloc::FrameAllocator;
use shared::memory::page::Frame;

use file::FilesystemLock;
use frame::FrameTable;
use mmap::MmapRegistry;
use swap::{SwapArea, SwapDevice};

/// Bytes in a page, as a plain `usize` for slice lengths.
pub const PAGE_SIZE_BYTES: usize = shared::memory::page::PAGE_SIZE.as_raw() as usize;

/// Stack cap from the top of the user address space (§4.3).
pub const STACK_LIMIT_BYTES: u64 = 8 * 1024 * 1024;

/// Slack below `esp` a stack-growing access is still allowed, to accommodate
/// `PUSHA`-family instructions that write below the current stack pointer
/// before it is updated.
pub const STACK_FAULT_SLACK_BYTES: u64 = 32;

/// Bytes per swap-device sector (§4.1).
pub const SECTOR_SIZE: usize = 512;

/// Accessor for the raw bytes backing a resident physical frame. The VM core
/// never assumes pages are mapped into kernel space any particular way;
/// production wires this to the kernel's direct physical-memory mapping
/// (`crate::mm::phys_to_virt`), tests back it with a plain buffer pool (see
/// `testing::TestFrameMemory`). This is an extra seam beyond the four the
/// distilled spec calls out in its ambient-collaborator list, needed because
/// content fill/writeback has to touch a frame's bytes somehow; it follows
/// the same `unsafe trait` shape as `shared::memory::alloc::FrameAllocator`
/// for the same reason: callers rely on it for memory safety.
///
/// # Safety
///
/// Implementations must return a pointer to exactly `PAGE_SIZE_BYTES` bytes
/// that validly and exclusively addresses `frame`'s physical memory for as
/// long as the frame remains allocated.
pub unsafe trait FrameMemory: Send + Sync {
    fn frame_bytes(&self, frame: Frame) -> *mut u8;
}

/// Production [`FrameMemory`]: the kernel's direct, permanent mapping of all
/// physical memory (`crate::mm::VirtualMap::phys_map`).
pub struct KernelFrameMemory;

unsafe impl FrameMemory for KernelFrameMemory {
    fn frame_bytes(&self, frame: Frame) -> *mut u8 {
        // SAFETY: `frame` is resident (the caller only reaches here through
        // the frame table, which only hands out frames it just allocated or
        // already tracks as resident), so its physical memory is reserved and
        // safe to read/write through the kernel's direct mapping.
        crate::mm::phys_to_virt(frame.start()).as_mut_ptr::<u8>()
    }
}

/// Registry of live page directories, addressed by [`PagedirId`]. Eviction
/// and `page_out` reach into an arbitrary process's directory through here
/// (the victim frame's descriptors can belong to any process, not the one
/// whose thread happens to be running the eviction sweep).
pub(crate) struct DirectoryRegistry {
    directories: spin::Mutex<BTreeMap<PagedirId, Arc<spin::Mutex<dyn PageDirectory + Send>>>>,
}

impl DirectoryRegistry {
    fn new() -> Self {
        DirectoryRegistry {
            directories: spin::Mutex::new(BTreeMap::new()),
        }
    }

    fn register(&self, dir: Arc<spin::Mutex<dyn PageDirectory + Send>>) {
        let id = dir.lock().id();
        self.directories.lock().insert(id, dir);
    }

    fn unregister(&self, id: PagedirId) {
        self.directories.lock().remove(&id);
    }

    pub(crate) fn get(&self, id: PagedirId) -> Arc<spin::Mutex<dyn PageDirectory + Send>> {
        self.directories
            .lock()
            .get(&id)
            .cloned()
            .expect("page descriptor references an unregistered page directory")
    }
}

/// The VM core: the five cooperating tables from §2, instantiated once per
/// kernel (or, in tests, once per test case) and shared by every process.
pub struct VmCore {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapArea,
    pub(crate) mmap: spin::Mutex<MmapRegistry>,
    pub(crate) fs_lock: FilesystemLock,
    directories: DirectoryRegistry,
    pub(crate) memory: Box<dyn FrameMemory>,
    /// `page_in`'s frame-selection phase lock (§5, item 7).
    pub(crate) page_in_lock: spin::Mutex<()>,
    /// `page_out`'s eviction-policy phase lock (§5, item 7).
    pub(crate) page_out_lock: spin::Mutex<()>,
}

impl VmCore {
    pub fn new(
        allocator: Box<dyn FrameAllocator + Send>,
        swap_device: Box<dyn SwapDevice>,
        memory: Box<dyn FrameMemory>,
    ) -> Self {
        VmCore {
            frames: FrameTable::new(allocator),
            swap: SwapArea::new(swap_device),
            mmap: spin::Mutex::new(MmapRegistry::new()),
            fs_lock: FilesystemLock::new(),
            directories: DirectoryRegistry::new(),
            memory,
            page_in_lock: spin::Mutex::new(()),
            page_out_lock: spin::Mutex::new(()),
        }
    }

    /// Registers a process's page directory so the VM core can reach it by
    /// id from eviction and `page_out`. Must be called before any
    /// `page_file`/`page_zero`/`mmap` targeting `dir`.
    pub fn register_directory(&self, dir: Arc<spin::Mutex<dyn PageDirectory + Send>>) {
        self.directories.register(dir);
    }

    /// Process teardown (§6): unregisters `id`'s directory. Callers are
    /// expected to have already driven every live `Mfile` through `munmap`
    /// and every resident frame through `frame_free`/`page_free` via the
    /// directory's own destruction walk (§6 "from process teardown").
    pub fn unregister_directory(&self, id: PagedirId) {
        self.directories.unregister(id);
    }

    pub(crate) fn directory(&self, id: PagedirId) -> Arc<spin::Mutex<dyn PageDirectory + Send>> {
        self.directories.get(id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use alloc::vec::Vec;

    use shared::memory::addr::{PhysAddress, VirtAddress};
    use shared::memory::alloc::{BitmapFrameAllocator, FrameAllocator as _};
    use shared::memory::page::PAGE_SIZE;

    use pagedir::SoftPageDirectory;
    use swap::testing::MemorySwapDevice;

    pub const TEST_ADDR: VirtAddress = VirtAddress::from_raw(0x1000_0000);

    /// Backs [`FrameMemory`] with a plain heap buffer pool instead of a real
    /// physical-memory mapping, indexed by frame number within the test
    /// arena.
    pub struct TestFrameMemory {
        base: PhysAddress,
        pages: spin::Mutex<Vec<Box<[u8; PAGE_SIZE_BYTES]>>>,
    }

    unsafe impl FrameMemory for TestFrameMemory {
        fn frame_bytes(&self, frame: Frame) -> *mut u8 {
            let index = frame.start().distance_from(self.base).as_raw() as usize / PAGE_SIZE_BYTES;
            self.pages.lock()[index].as_mut_ptr()
        }
    }

    const TEST_FRAME_COUNT: usize = 64;

    /// Builds a [`VmCore`] wired to in-memory test doubles for every
    /// collaborator: a bitmap frame allocator over a small heap-backed
    /// arena, an in-memory swap device, and a heap buffer pool for frame
    /// contents.
    pub fn new_test_core() -> VmCore {
        let bitmap: &'static mut [u8] =
            alloc::boxed::Box::leak(alloc::vec![0xffu8; TEST_FRAME_COUNT / 8].into_boxed_slice());
        let allocator = unsafe { BitmapFrameAllocator::new(bitmap) };

        let mut pages = Vec::with_capacity(TEST_FRAME_COUNT);
        for _ in 0..TEST_FRAME_COUNT {
            pages.push(Box::new([0u8; PAGE_SIZE_BYTES]));
        }

        let memory = TestFrameMemory {
            base: PhysAddress::zero(),
            pages: spin::Mutex::new(pages),
        };

        VmCore::new(
            Box::new(allocator),
            Box::new(MemorySwapDevice::new(swap::BPP * 16)),
            Box::new(memory),
        )
    }

    static NEXT_PAGEDIR: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

    impl VmCore {
        /// Test convenience: creates and registers a fresh, empty directory,
        /// returning its id.
        pub fn new_directory(&self) -> PagedirId {
            let id = PagedirId(NEXT_PAGEDIR.fetch_add(1, core::sync::atomic::Ordering::Relaxed));
            self.register_directory(Arc::new(spin::Mutex::new(SoftPageDirectory::new(id))));
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{new_test_core, TEST_ADDR};
    use super::*;

    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;

    use shared::memory::addr::VirtAddress;

    use page::testing::TestFile;
    use page::Backing;

    /// §8 scenario 3: exhausting the allocator forces `frame_new` to run one
    /// eviction pass and retry, rather than failing the caller.
    #[test_log::test]
    fn frame_new_forces_eviction_when_allocator_is_exhausted() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        // Fill every frame the test arena has with unpinned zero pages.
        let mut addr = TEST_ADDR;
        let mut pages = Vec::new();
        for _ in 0..64 {
            let page = core.page_zero(dir_id, addr, true).unwrap();
            core.page_in(&page, false).unwrap();
            pages.push(page);
            addr = VirtAddress::from_raw(addr.as_raw() + PAGE_SIZE_BYTES as u64);
        }
        assert_eq!(core.frames.frame_count(), 64);

        // One more page-in has nowhere to go except by evicting an existing,
        // unpinned frame.
        let one_more = core.page_zero(dir_id, addr, true).unwrap();
        core.page_in(&one_more, false).unwrap();

        assert!(one_more.lock().loaded);
        assert_eq!(core.frames.frame_count(), 64, "a victim must have been reclaimed");
        assert_eq!(
            pages.iter().filter(|p| !p.lock().loaded).count(),
            1,
            "exactly one of the original pages should have been evicted"
        );
    }

    /// §8 scenario 6: a process exits while one page sits in swap and another
    /// is a live, dirtied mmap page. Teardown must write back the mmap page,
    /// release the swap slot, and leave both tables empty.
    #[test_log::test]
    fn process_exit_reclaims_swapped_and_mapped_pages() {
        let core = new_test_core();
        let dir_id = core.new_directory();

        // One anonymous page, written and pushed to swap directly.
        let anon = core.page_zero(dir_id, TEST_ADDR, true).unwrap();
        core.page_in(&anon, false).unwrap();
        let frame = anon.lock().kpage.unwrap();
        unsafe {
            let bytes =
                core::slice::from_raw_parts_mut(core.memory.frame_bytes(frame), PAGE_SIZE_BYTES);
            bytes[0] = 0x7E;
        }
        core.directory(dir_id).lock().set_dirty(TEST_ADDR, true);
        core.frame_free(frame, None);
        assert!(matches!(anon.lock().backing, Backing::Swap(_)));
        assert!(!anon.lock().loaded);

        // Fill the rest of swap so a leaked slot would make the final save
        // below fail.
        let filler = vec![0xFFu8; PAGE_SIZE_BYTES];
        let mut filler_slots = Vec::new();
        for _ in 0..15 {
            filler_slots.push(core.swap.save(&filler));
        }

        // A live mmap mapping, dirtied, that teardown must write back.
        let map_addr = VirtAddress::from_raw(TEST_ADDR.as_raw() + 0x10_0000);
        let file: SharedFile = Arc::new(spin::Mutex::new(
            Box::new(TestFile::new(vec![0u8; PAGE_SIZE_BYTES], true)) as Box<dyn FileHandle>
        ));
        let _mapid = core.mmap(dir_id, map_addr, file.clone()).unwrap();
        let mapped = core.page_lookup(dir_id, map_addr).unwrap();
        core.page_in(&mapped, false).unwrap();
        let map_frame = mapped.lock().kpage.unwrap();
        unsafe {
            let bytes =
                core::slice::from_raw_parts_mut(core.memory.frame_bytes(map_frame), PAGE_SIZE_BYTES);
            bytes[0] = 0x99;
        }
        core.directory(dir_id).lock().set_dirty(map_addr, true);

        // Teardown, matching §6 "from process teardown": munmap every live
        // mapping, then free every still-resident frame / descriptor.
        core.munmap_all(dir_id);
        core.page_free(&anon);
        core.unregister_directory(dir_id);

        let mut check = vec![0u8; 1];
        {
            let mut f = file.lock();
            f.seek(0);
            f.read(&mut check);
        }
        assert_eq!(check[0], 0x99, "munmap must have written the dirty page back");
        assert_eq!(core.frames.frame_count(), 0, "no frame should remain resident");

        // The anonymous page's swap slot must have been released: saving one
        // more full page succeeds only if that slot is free again.
        let _ = core.swap.save(&filler);

        for idx in filler_slots {
            core.swap.free(idx);
        }
    }
}
