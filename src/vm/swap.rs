//! The swap area (§4.1): a fixed-size, sector-addressed block store backing
//! evicted anonymous and private-file pages, allocated a page (`BPP`
//! sectors) at a time by a bitmap.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use log::trace;

use super::{PAGE_SIZE_BYTES, SECTOR_SIZE};

/// Sectors per page-sized swap slot.
pub const BPP: u64 = (PAGE_SIZE_BYTES as u64) / (SECTOR_SIZE as u64);

/// The single "swap" block device (§10.3), addressed by sector.
pub trait SwapDevice: Send {
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8]);
    fn write_sector(&mut self, sector: u64, buf: &[u8]);
}

/// The starting sector of a reserved, page-sized swap slot.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SwapIndex(pub u64);

struct Inner {
    device: Box<dyn SwapDevice>,
    /// One bit per sector; `true` means occupied.
    occupied: Vec<bool>,
}

/// A single global lock serializes the entire component (§4.1).
pub(crate) struct SwapArea {
    inner: spin::Mutex<Inner>,
}

impl SwapArea {
    pub fn new(device: Box<dyn SwapDevice>) -> Self {
        let sectors = device.sector_count() as usize;
        SwapArea {
            inner: spin::Mutex::new(Inner {
                device,
                occupied: vec![false; sectors],
            }),
        }
    }

    /// `swap_save` (§4.1): scans for `BPP` consecutive free, aligned sectors,
    /// reserves them, and writes `buf` out sector by sector.
    ///
    /// # Panics
    ///
    /// Panics if no slot is available. Out-of-swap is unrecoverable in this
    /// kernel (§7: fatal, a programming-bug-equivalent condition).
    pub fn save(&self, buf: &[u8]) -> SwapIndex {
        assert_eq!(buf.len(), PAGE_SIZE_BYTES, "swap_save on a non-page buffer");

        let mut inner = self.inner.lock();
        let start = find_free_run(&inner.occupied).expect("swap area exhausted");
        for i in 0..BPP {
            inner.occupied[(start + i) as usize] = true;
        }
        for i in 0..BPP {
            let chunk = &buf[i as usize * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            inner.device.write_sector(start + i, chunk);
        }
        trace!("swap_save: wrote page to slot {start}");
        SwapIndex(start)
    }

    /// `swap_in` (§4.1): reads `BPP` sectors starting at `idx` into `buf`.
    /// Asserts the bitmap reflects a reserved slot, matching the source's
    /// "all operations assert the bitmap reflects the caller's expected
    /// state" rule (§4.1).
    pub fn read_into(&self, idx: SwapIndex, buf: &mut [u8]) {
        assert_eq!(buf.len(), PAGE_SIZE_BYTES, "swap_in into a non-page buffer");

        let inner = self.inner.lock();
        for i in 0..BPP {
            assert!(
                inner.occupied[(idx.0 + i) as usize],
                "swap_in on an unreserved slot"
            );
        }
        for i in 0..BPP {
            let chunk = &mut buf[i as usize * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            inner.device.read_sector(idx.0 + i, chunk);
        }
    }

    /// `swap_free` (§4.1): clears the `BPP` bits starting at `idx`.
    pub fn free(&self, idx: SwapIndex) {
        let mut inner = self.inner.lock();
        for i in 0..BPP {
            let bit = &mut inner.occupied[(idx.0 + i) as usize];
            assert!(*bit, "double free of swap slot {idx:?}");
            *bit = false;
        }
        trace!("swap_free: released slot {idx:?}");
    }
}

/// Finds the first run of `BPP` free sectors, aligned to `BPP`, per §4.1
/// ("scans the bitmap for `BPP` consecutive free sectors starting at an
/// aligned position").
fn find_free_run(occupied: &[bool]) -> Option<u64> {
    let mut start = 0u64;
    while start + BPP <= occupied.len() as u64 {
        if occupied[start as usize..(start + BPP) as usize]
            .iter()
            .all(|&b| !b)
        {
            return Some(start);
        }
        start += BPP;
    }
    None
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// A plain in-memory block device for tests.
    pub struct MemorySwapDevice {
        sectors: Vec<[u8; SECTOR_SIZE]>,
    }

    impl MemorySwapDevice {
        pub fn new(sector_count: u64) -> Self {
            MemorySwapDevice {
                sectors: vec![[0u8; SECTOR_SIZE]; sector_count as usize],
            }
        }
    }

    impl SwapDevice for MemorySwapDevice {
        fn sector_count(&self) -> u64 {
            self.sectors.len() as u64
        }

        fn read_sector(&self, sector: u64, buf: &mut [u8]) {
            buf.copy_from_slice(&self.sectors[sector as usize]);
        }

        fn write_sector(&mut self, sector: u64, buf: &[u8]) {
            self.sectors[sector as usize].copy_from_slice(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySwapDevice;
    use super::*;

    use alloc::vec::Vec;

    fn area(sectors: u64) -> SwapArea {
        SwapArea::new(Box::new(MemorySwapDevice::new(sectors)))
    }

    #[test_log::test]
    fn save_then_read_round_trips() {
        let area = area(BPP * 4);
        let page: Vec<u8> = (0..PAGE_SIZE_BYTES).map(|i| (i % 251) as u8).collect();

        let idx = area.save(&page);
        let mut out = vec![0u8; PAGE_SIZE_BYTES];
        area.read_into(idx, &mut out);

        assert_eq!(page, out);
    }

    #[test_log::test]
    fn free_allows_slot_reuse() {
        let area = area(BPP);
        let page = vec![1u8; PAGE_SIZE_BYTES];

        let idx = area.save(&page);
        area.free(idx);

        let idx2 = area.save(&page);
        assert_eq!(idx, idx2, "the only slot should be reused after freeing");
    }

    #[test_log::test]
    #[should_panic(expected = "swap area exhausted")]
    fn save_panics_when_full() {
        let area = area(BPP);
        let page = vec![1u8; PAGE_SIZE_BYTES];
        let _ = area.save(&page);
        let _ = area.save(&page);
    }

    #[test_log::test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let area = area(BPP);
        let page = vec![1u8; PAGE_SIZE_BYTES];
        let idx = area.save(&page);
        area.free(idx);
        area.free(idx);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn bitmap_returns_to_prior_state_after_free(n_slots in 1u64..8) {
            let area = area(BPP * n_slots);
            let page = vec![9u8; PAGE_SIZE_BYTES];

            let before = area.inner.lock().occupied.clone();
            let idx = area.save(&page);
            area.free(idx);
            let after = area.inner.lock().occupied.clone();

            prop_assert_eq!(before, after);
        }
    }
}
