//! The page-fault handler and the read/write buffer-pinning glue (§4.3,
//! §4.5), plus the stack-growth heuristic they both lean on.

use log::{trace, warn};

use shared::memory::addr::VirtAddress;
use shared::memory::page::PAGE_SIZE;

use super::error::VmError;
use super::pagedir::PagedirId;
use super::{VmCore, PAGE_SIZE_BYTES, STACK_FAULT_SLACK_BYTES, STACK_LIMIT_BYTES};

impl VmCore {
    /// True iff `addr` lies within `esp`'s `PUSHA` slack window — the
    /// syntactic "this looks like a stack access" test, independent of the
    /// 8 MiB stack cap.
    fn esp_adjacent(&self, esp: VirtAddress, addr: VirtAddress) -> bool {
        addr.as_raw() + STACK_FAULT_SLACK_BYTES >= esp.as_raw()
    }

    /// `need_grow` (§4.3): true iff `addr` is within `esp`'s `PUSHA` slack and
    /// within the 8 MiB stack cap measured from the top of user space.
    pub fn need_grow(&self, esp: VirtAddress, addr: VirtAddress, stack_top: VirtAddress) -> bool {
        self.esp_adjacent(esp, addr) && stack_top.distance_from(addr).as_raw() <= STACK_LIMIT_BYTES
    }

    /// Creates and pages in a fresh writable zero page at `addr`'s containing
    /// page, for use once `need_grow` has already been checked.
    pub fn stack_grow(&self, dir_id: PagedirId, addr: VirtAddress, pin: bool) -> Result<(), VmError> {
        let page_addr = addr.align_down(PAGE_SIZE.as_raw());
        let page = self.page_zero(dir_id, page_addr, true)?;
        self.page_in(&page, pin)
    }

    /// The page-fault handler's core decision (§4.5): resolve `fa` to a
    /// resident frame, growing the stack on demand, or report that the
    /// access should kill the process.
    pub fn handle_fault(
        &self,
        dir_id: PagedirId,
        fa: VirtAddress,
        esp: VirtAddress,
        stack_top: VirtAddress,
    ) -> Result<(), VmError> {
        let page_addr = fa.align_down(PAGE_SIZE.as_raw());

        if let Some(page) = self.page_lookup(dir_id, page_addr) {
            return self.page_in(&page, false);
        }

        if self.need_grow(esp, fa, stack_top) {
            trace!("handle_fault: growing stack for {fa:?}");
            return self.stack_grow(dir_id, fa, false);
        }

        if self.esp_adjacent(esp, fa) {
            warn!("handle_fault: {fa:?} is esp-adjacent but exceeds the stack-size cap");
            return Err(VmError::StackOverflow);
        }

        warn!("handle_fault: {fa:?} has no descriptor and is outside the stack-growth window");
        Err(VmError::BadPointer)
    }

    /// User-buffer pinning for `read`/`write` syscalls (§4.5): walks `[addr,
    /// addr + len)` page by page, growing the stack on demand, pinning each
    /// page for the duration of `with_page`'s file I/O before moving on.
    ///
    /// `with_page` is called once per page with the page-relative byte range
    /// of the access (`start..end`, both within `0..PAGE_SIZE_BYTES`) and
    /// must perform its I/O before returning; the page is unpinned
    /// immediately afterward regardless of the outcome.
    pub fn with_pinned_user_buffer(
        &self,
        dir_id: PagedirId,
        addr: VirtAddress,
        len: usize,
        esp: VirtAddress,
        stack_top: VirtAddress,
        mut with_page: impl FnMut(VirtAddress, core::ops::Range<usize>),
    ) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }

        let mut cursor = addr.as_raw();
        let end = addr.as_raw() + len as u64;

        while cursor < end {
            let page_addr = VirtAddress::from_raw(cursor).align_down(PAGE_SIZE.as_raw());
            let offset_in_page = (cursor - page_addr.as_raw()) as usize;
            let chunk_end = (page_addr.as_raw() + PAGE_SIZE_BYTES as u64).min(end);
            let chunk_len = (chunk_end - cursor) as usize;

            let page = match self.page_lookup(dir_id, page_addr) {
                Some(page) => page,
                None => {
                    if !self.need_grow(esp, page_addr, stack_top) {
                        if self.esp_adjacent(esp, page_addr) {
                            return Err(VmError::StackOverflow);
                        }
                        return Err(VmError::BadPointer);
                    }
                    self.page_zero(dir_id, page_addr, true)?
                }
            };

            self.page_in(&page, true)?;
            let frame = page.lock().kpage.expect("page_in(pin=true) leaves kpage set");

            with_page(page_addr, offset_in_page..offset_in_page + chunk_len);

            self.frames.unpin(frame);

            cursor = chunk_end;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::vm::testing::{new_test_core, TEST_ADDR};

    fn stack_top() -> VirtAddress {
        VirtAddress::from_raw(TEST_ADDR.as_raw() + STACK_LIMIT_BYTES + 0x1000)
    }

    #[test_log::test]
    fn touching_just_below_esp_grows_the_stack() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let top = stack_top();
        let esp = VirtAddress::from_raw(top.as_raw() - 0x1000);
        let fault_addr = VirtAddress::from_raw(esp.as_raw() - 4);

        core.handle_fault(dir_id, fault_addr, esp, top).unwrap();

        let page_addr = fault_addr.align_down(PAGE_SIZE.as_raw());
        let page = core.page_lookup(dir_id, page_addr).unwrap();
        assert!(page.lock().loaded);
    }

    #[test_log::test]
    fn touching_far_below_esp_kills_the_process() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let top = stack_top();
        let esp = VirtAddress::from_raw(top.as_raw() - 0x1000);
        let fault_addr = VirtAddress::from_raw(esp.as_raw() - 33);

        let err = core.handle_fault(dir_id, fault_addr, esp, top).unwrap_err();
        assert_eq!(err, VmError::BadPointer);
    }

    #[test_log::test]
    fn touching_esp_adjacent_address_beyond_stack_cap_overflows() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let top = stack_top();
        let esp = VirtAddress::from_raw(top.as_raw() - STACK_LIMIT_BYTES - 0x2000);
        let fault_addr = VirtAddress::from_raw(esp.as_raw() - 4);

        let err = core.handle_fault(dir_id, fault_addr, esp, top).unwrap_err();
        assert_eq!(err, VmError::StackOverflow);
    }

    #[test_log::test]
    fn existing_descriptor_is_just_paged_in() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let top = stack_top();
        let esp = VirtAddress::from_raw(top.as_raw() - 0x1000);

        let page = core.page_zero(dir_id, TEST_ADDR, true).unwrap();
        assert!(!page.lock().loaded);

        core.handle_fault(dir_id, TEST_ADDR, esp, top).unwrap();
        assert!(page.lock().loaded);
    }

    #[test_log::test]
    fn pinned_buffer_walk_covers_two_pages_and_unpins_after() {
        let core = new_test_core();
        let dir_id = core.new_directory();
        let top = stack_top();
        let esp = VirtAddress::from_raw(top.as_raw() - 0x1000);

        core.page_zero(dir_id, TEST_ADDR, true).unwrap();
        let second_addr = VirtAddress::from_raw(TEST_ADDR.as_raw() + PAGE_SIZE_BYTES as u64);
        core.page_zero(dir_id, second_addr, true).unwrap();

        let mut chunks_seen = 0;
        core.with_pinned_user_buffer(
            dir_id,
            VirtAddress::from_raw(TEST_ADDR.as_raw() + PAGE_SIZE_BYTES as u64 - 4),
            8,
            esp,
            top,
            |_page_addr, _range| chunks_seen += 1,
        )
        .unwrap();

        assert_eq!(chunks_seen, 2);

        let first = core.page_lookup(dir_id, TEST_ADDR).unwrap();
        let second = core.page_lookup(dir_id, second_addr).unwrap();
        assert!(!core.frames.is_pinned(first.lock().kpage.unwrap()));
        assert!(!core.frames.is_pinned(second.lock().kpage.unwrap()));
    }
}
