//! The narrow filesystem surface the VM core depends on: `file_reopen`,
//! `file_seek`, `file_read`, `file_write`, `file_length`, `file_writable`.
//! The real filesystem is out of scope (§1); this trait is the seam.

use alloc::boxed::Box;
use alloc::sync::Arc;

pub trait FileHandle: Send {
    fn seek(&mut self, offset: u64);
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn write(&mut self, buf: &[u8]) -> usize;
    fn length(&self) -> u64;
    fn writable(&self) -> bool;

    /// Opens an independent handle to the same underlying file, so a
    /// mapping's lifetime does not depend on the fd that created it.
    fn reopen(&self) -> Box<dyn FileHandle>;
}

/// A file handle shared by every page descriptor reading from the same
/// open file (an executable's sections, or one live `mmap`), serialized by
/// an inner lock since `seek`+`read`/`write` must stay paired.
pub type SharedFile = Arc<spin::Mutex<Box<dyn FileHandle>>>;

/// Serializes all file-layer calls, standing in for the kernel's single
/// global filesystem lock (see the lock hierarchy in §5: this sits above
/// every other VM lock).
pub struct FilesystemLock {
    lock: spin::Mutex<()>,
}

impl FilesystemLock {
    pub const fn new() -> Self {
        FilesystemLock {
            lock: spin::Mutex::new(()),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }
}
