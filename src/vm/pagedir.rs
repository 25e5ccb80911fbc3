//! The page directory's "descriptor slot" abstraction (see design notes on
//! where a page descriptor lives while its hardware PTE is absent), plus the
//! hardware PTE primitives the VM core needs (`set_page`/`clear_page` and the
//! dirty/accessed bits).
//!
//! A real implementation would wire this to the process's actual page
//! tables (`crate::mm::paging::Mapper`). `SoftPageDirectory` is a
//! side-table implementation backed by a `BTreeMap`, used both by tests and,
//! for now, in production: this kernel's page tables don't yet expose spare
//! software bits for storing a descriptor pointer alongside an absent PTE.

use alloc::collections::BTreeMap;

use shared::memory::addr::VirtAddress;
use shared::memory::page::Frame;

use super::error::VmError;
use super::page::PageHandle;

/// Opaque identity for a virtual address space. Two `PageHandle`s are
/// "owned by the same process" iff their `pagedir` fields are equal.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct PagedirId(pub u64);

pub trait PageDirectory {
    /// This directory's identity, stamped onto every descriptor it creates.
    fn id(&self) -> PagedirId;

    fn add_page(&mut self, addr: VirtAddress, page: PageHandle);
    fn find_page(&self, addr: VirtAddress) -> Option<PageHandle>;
    fn remove_page(&mut self, addr: VirtAddress) -> Option<PageHandle>;

    fn set_page(&mut self, addr: VirtAddress, frame: Frame, writable: bool) -> Result<(), VmError>;
    fn clear_page(&mut self, addr: VirtAddress);
    fn is_dirty(&self, addr: VirtAddress) -> bool;
    fn is_accessed(&self, addr: VirtAddress) -> bool;
    fn set_accessed(&mut self, addr: VirtAddress, accessed: bool);
    fn set_dirty(&mut self, addr: VirtAddress, dirty: bool);
}

#[derive(Clone, Copy, Default)]
struct PteState {
    frame: Option<Frame>,
    writable: bool,
    dirty: bool,
    accessed: bool,
}

pub struct SoftPageDirectory {
    id: PagedirId,
    slots: BTreeMap<VirtAddress, PageHandle>,
    ptes: BTreeMap<VirtAddress, PteState>,
}

impl SoftPageDirectory {
    pub fn new(id: PagedirId) -> Self {
        SoftPageDirectory {
            id,
            slots: BTreeMap::new(),
            ptes: BTreeMap::new(),
        }
    }
}

impl PageDirectory for SoftPageDirectory {
    fn id(&self) -> PagedirId {
        self.id
    }

    fn add_page(&mut self, addr: VirtAddress, page: PageHandle) {
        self.slots.insert(addr, page);
    }

    fn find_page(&self, addr: VirtAddress) -> Option<PageHandle> {
        self.slots.get(&addr).cloned()
    }

    fn remove_page(&mut self, addr: VirtAddress) -> Option<PageHandle> {
        self.slots.remove(&addr)
    }

    fn set_page(
        &mut self,
        addr: VirtAddress,
        frame: Frame,
        writable: bool,
    ) -> Result<(), VmError> {
        self.ptes.insert(
            addr,
            PteState {
                frame: Some(frame),
                writable,
                dirty: false,
                accessed: false,
            },
        );
        Ok(())
    }

    fn clear_page(&mut self, addr: VirtAddress) {
        self.ptes.remove(&addr);
    }

    fn is_dirty(&self, addr: VirtAddress) -> bool {
        self.ptes.get(&addr).map(|p| p.dirty).unwrap_or(false)
    }

    fn is_accessed(&self, addr: VirtAddress) -> bool {
        self.ptes.get(&addr).map(|p| p.accessed).unwrap_or(false)
    }

    fn set_accessed(&mut self, addr: VirtAddress, accessed: bool) {
        if let Some(pte) = self.ptes.get_mut(&addr) {
            pte.accessed = accessed;
        }
    }

    fn set_dirty(&mut self, addr: VirtAddress, dirty: bool) {
        if let Some(pte) = self.ptes.get_mut(&addr) {
            pte.dirty = dirty;
        }
    }
}
