//! The module containing the contracts this crate consumes from the
//! surrounding kernel.
//!
//! The physical page allocator, the AHCI disk driver and the host
//! interrupt controllers live outside this crate. The kernel hands a
//! [`HostOps`] table to [`install`] once at boot, before `vmm_init`
//! runs. A function table is used rather than a trait object so the
//! table can live in a `static` without allocation and be shared by
//! every CPU.

use spin::Once;

/// Services provided by the embedding kernel.
pub struct HostOps {
    /// Allocates one zeroed 4 KiB physical page. Returns its 4 KiB
    /// aligned physical address.
    pub alloc_page: fn() -> Option<u64>,

    /// Releases a page obtained from [`HostOps::alloc_page`].
    pub free_page: fn(u64),

    /// Allocates `n` physically contiguous zeroed pages.
    pub alloc_pages: fn(usize) -> Option<u64>,

    /// Reads `nsects` 512-byte sectors starting at `lba` into `buf`.
    pub disk_read: fn(drive: u32, lba: u64, nsects: u64, buf: *mut u8) -> Result<(), ()>,

    /// Writes `nsects` 512-byte sectors starting at `lba` from `buf`.
    pub disk_write: fn(drive: u32, lba: u64, nsects: u64, buf: *const u8) -> Result<(), ()>,

    /// Capacity of the drive in 512-byte sectors.
    pub disk_capacity: fn(drive: u32) -> u64,

    /// Signals end-of-interrupt to the host interrupt controller.
    pub eoi: fn(),

    /// Unmasks an IRQ line at the host interrupt controller.
    pub enable_irq: fn(u8),

    /// Returns and acknowledges the IRQ that forced the most recent
    /// external-interrupt exit, recorded by the kernel trap path while
    /// the guest was running. `None` when the exit was spurious.
    pub claim_irq: fn() -> Option<u8>,

    /// The TSC increment rate in Hz, as calibrated by the kernel.
    pub tsc_freq: fn() -> u64,
}

static HOST_OPS: Once<HostOps> = Once::new();

/// Installs the kernel service table. Later calls are ignored.
pub fn install(ops: HostOps) {
    let _ = HOST_OPS.call_once(|| ops);
}

/// Returns the installed service table.
///
/// # Panics
///
/// Panics if [`install`] has not run. That is a kernel initialization
/// ordering bug, not a runtime condition.
pub(crate) fn ops() -> &'static HostOps {
    HOST_OPS.get().expect("host services not installed")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Std-backed host services for unit tests: pages come from the
    //! process heap (addresses double as "physical" addresses) and the
    //! disk is an in-memory image.

    use super::{install, HostOps};
    use crate::Page;
    use spin::Mutex;

    const SECTOR_SIZE: usize = 512;
    const DISK_SECTORS: usize = 16 * 1024;

    static DISK: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn alloc_page() -> Option<u64> {
        Some(Box::into_raw(Box::new(Page::new())) as u64)
    }

    fn free_page(pa: u64) {
        drop(unsafe { Box::from_raw(pa as *mut Page) });
    }

    fn alloc_pages(n: usize) -> Option<u64> {
        let pages = vec![Page::new(); n].into_boxed_slice();
        Some(Box::into_raw(pages).cast::<Page>() as u64)
    }

    fn ensure_disk(disk: &mut Vec<u8>) {
        if disk.is_empty() {
            disk.resize(DISK_SECTORS * SECTOR_SIZE, 0);
        }
    }

    fn disk_read(_drive: u32, lba: u64, nsects: u64, buf: *mut u8) -> Result<(), ()> {
        let mut disk = DISK.lock();
        ensure_disk(&mut disk);
        let start = lba as usize * SECTOR_SIZE;
        let len = nsects as usize * SECTOR_SIZE;
        if start + len > disk.len() {
            return Err(());
        }
        unsafe { core::ptr::copy_nonoverlapping(disk[start..].as_ptr(), buf, len) };
        Ok(())
    }

    fn disk_write(_drive: u32, lba: u64, nsects: u64, buf: *const u8) -> Result<(), ()> {
        let mut disk = DISK.lock();
        ensure_disk(&mut disk);
        let start = lba as usize * SECTOR_SIZE;
        let len = nsects as usize * SECTOR_SIZE;
        if start + len > disk.len() {
            return Err(());
        }
        unsafe { core::ptr::copy_nonoverlapping(buf, disk[start..].as_mut_ptr(), len) };
        Ok(())
    }

    fn disk_capacity(_drive: u32) -> u64 {
        DISK_SECTORS as u64
    }

    pub(crate) fn install_mock() {
        install(HostOps {
            alloc_page,
            free_page,
            alloc_pages,
            disk_read,
            disk_write,
            disk_capacity,
            eoi: || {},
            enable_irq: |_| {},
            claim_irq: || None,
            tsc_freq: || 1_000_000_000,
        });
    }

    /// Runs `f` over the raw disk image, creating it on first use.
    pub(crate) fn with_disk<R>(f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut disk = DISK.lock();
        ensure_disk(&mut disk);
        f(&mut disk)
    }
}
