//! The module containing the nested page table, the two-dimensional
//! translation from guest-physical to host-physical addresses.
//!
//! AMD nested paging and Intel EPT walk structurally identical 4-level
//! tables of 512 8-byte entries; only the meaning of the low permission
//! bits and the memory-type field differ. A single walker is therefore
//! parameterized by the per-vendor [`EntryFlags`] the driver supplies.

use crate::HvmError;
use alloc::{boxed::Box, vec::Vec};
use bitfield::bitfield;
use x86::current::paging::{BASE_PAGE_SHIFT, PAGE_SIZE_ENTRIES};

/// Guest memory types representable in a leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Ordinary RAM.
    WriteBack,
    /// The VGA window and other device-backed ranges.
    Uncacheable,
}

/// The permission and memory-type bits a vendor wants in an entry.
///
/// On AMD these are the P/RW/US bits of an ordinary page table entry and
/// the memory type is left zero (PAT-controlled); on Intel they are the
/// R/W/X bits and the EPT memory-type field at bits 5:3.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryFlags {
    pub(crate) permission: u8,
    pub(crate) memory_type: u8,
}

/// Per-vendor parameterization of the walker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NptFlavor {
    /// Flags for non-leaf entries.
    pub(crate) table: EntryFlags,
    /// Flags for write-back RAM leaves.
    pub(crate) write_back: EntryFlags,
    /// Flags for uncacheable leaves.
    pub(crate) uncacheable: EntryFlags,
    /// Whether 2 MiB leaves may be used at the PD level (EPT only).
    pub(crate) superpages: bool,
}

/// A single nested paging structure (PML4, PDPT, PD or PT).
#[derive(Clone, Copy, Debug)]
#[repr(C, align(4096))]
pub(crate) struct NestedPagingStructure {
    /// An array of nested paging entries (8 bytes, 512 entries).
    pub(crate) entries: [NestedPagingStructureEntry; PAGE_SIZE_ENTRIES],
}
const _: () = assert!(size_of::<NestedPagingStructure>() == 0x1000);

bitfield! {
    /// Platform independent representation of a nested paging structure entry.
    ///
    /// Because it is platform independent, the layout is not exactly correct.
    /// For example, bit 5:3 `memory_type` exists only on Intel. On AMD, those
    /// are other bits and we set zeros.
    /*
         66665 5     1 110 0 00 000 000
         32109 8.....2 109 8 76 543 210
        +-----+-------+---+---+--+---+---+
        |xxxxx|  PFN  |xxx| L |xx| M | P |
        +-----+-------+---+---+--+---+---+
    */
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct NestedPagingStructureEntry(u64);
    impl Debug;
    permission, set_permission: 2, 0;
    memory_type, set_memory_type: 5, 3;
    ignore_pat, set_ignore_pat: 6;
    large, set_large: 7;
    pub pfn, set_pfn: 58, 12;
}

impl NestedPagingStructureEntry {
    fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the next nested paging structure this non-leaf entry
    /// points to. The kernel runs identity mapped, so the physical
    /// address in the entry is usable as a pointer.
    fn next_table_mut(&mut self) -> &mut NestedPagingStructure {
        let next_table_addr = self.pfn() << BASE_PAGE_SHIFT;
        assert!(next_table_addr != 0);
        let next_table_ptr = next_table_addr as *mut NestedPagingStructure;
        unsafe { next_table_ptr.as_mut() }.unwrap()
    }

    fn next_table(self) -> &'static NestedPagingStructure {
        let next_table_addr = self.pfn() << BASE_PAGE_SHIFT;
        assert!(next_table_addr != 0);
        let next_table_ptr = next_table_addr as *const NestedPagingStructure;
        unsafe { next_table_ptr.as_ref() }.unwrap()
    }

    /// Points this entry at `pa` with the permissions and memory type in
    /// `flags`.
    fn set_translation(&mut self, pa: u64, flags: EntryFlags) {
        self.0 = 0;
        self.set_pfn(pa >> BASE_PAGE_SHIFT);
        self.set_permission(u64::from(flags.permission));
        self.set_memory_type(u64::from(flags.memory_type));
    }
}

const SUPERPAGE_SHIFT: u64 = 21;
const SUPERPAGE_SIZE: u64 = 1 << SUPERPAGE_SHIFT;

fn pml4_index(gpa: u64) -> usize {
    ((gpa >> 39) & 0x1ff) as usize
}
fn pdpt_index(gpa: u64) -> usize {
    ((gpa >> 30) & 0x1ff) as usize
}
fn pd_index(gpa: u64) -> usize {
    ((gpa >> 21) & 0x1ff) as usize
}
fn pt_index(gpa: u64) -> usize {
    ((gpa >> 12) & 0x1ff) as usize
}

/// The nested page table of one guest: the root PML4 plus every
/// intermediate structure allocated while building translations.
pub(crate) struct NestedPageTable {
    pml4: Box<NestedPagingStructure>,
    /// Owns the intermediate tables the walker allocates; entries point
    /// into these boxes by physical address.
    tables: Vec<Box<NestedPagingStructure>>,
    flavor: NptFlavor,
}

impl NestedPageTable {
    pub(crate) fn new(flavor: NptFlavor) -> Self {
        let pml4 = unsafe { Box::<NestedPagingStructure>::new_zeroed().assume_init() };
        Self { pml4, tables: Vec::new(), flavor }
    }

    /// The physical address of the root, for `nCR3`/`EPTP`.
    pub(crate) fn root_addr(&self) -> u64 {
        core::ptr::from_ref(self.pml4.as_ref()) as u64
    }

    fn leaf_flags(&self, mt: MemoryType) -> EntryFlags {
        match mt {
            MemoryType::WriteBack => self.flavor.write_back,
            MemoryType::Uncacheable => self.flavor.uncacheable,
        }
    }

    /// Adds or overwrites the 4 KiB leaf translating `gpa` to `hpa`.
    /// Re-inserting the same `gpa` replaces the leaf in place, so a
    /// given guest page never has more than one translation.
    pub(crate) fn insert(&mut self, gpa: u64, hpa: u64, mt: MemoryType) -> Result<(), HvmError> {
        if gpa & 0xfff != 0 || hpa & 0xfff != 0 {
            return Err(HvmError::Unaligned);
        }

        let flags = self.leaf_flags(mt);
        let table_flags = self.flavor.table;

        let pml4e = walk_entry(&mut self.pml4, pml4_index(gpa), table_flags, &mut self.tables);
        let pdpt = pml4e.next_table_mut();
        let pdpte = walk_entry(pdpt, pdpt_index(gpa), table_flags, &mut self.tables);
        let pd = pdpte.next_table_mut();
        let pde = walk_entry(pd, pd_index(gpa), table_flags, &mut self.tables);

        // A 2 MiB leaf in the way is torn down; the caller asked for
        // fine-grained control of this range.
        if pde.large() {
            pde.0 = 0;
            let _ = walk_entry(pd, pd_index(gpa), table_flags, &mut self.tables);
        }

        let pt = pd.entries[pd_index(gpa)].next_table_mut();
        pt.entries[pt_index(gpa)].set_translation(hpa, flags);
        Ok(())
    }

    /// Installs a 2 MiB leaf at the PD level. Only legal when the
    /// vendor supports superpages, both addresses are 2 MiB aligned,
    /// and the range lies above the fine-grained low 2 MiB.
    pub(crate) fn insert_superpage(
        &mut self,
        gpa: u64,
        hpa: u64,
        mt: MemoryType,
    ) -> Result<(), HvmError> {
        if !self.flavor.superpages
            || gpa & (SUPERPAGE_SIZE - 1) != 0
            || hpa & (SUPERPAGE_SIZE - 1) != 0
            || gpa < SUPERPAGE_SIZE
        {
            return Err(HvmError::Unaligned);
        }

        let flags = self.leaf_flags(mt);
        let table_flags = self.flavor.table;

        let pml4e = walk_entry(&mut self.pml4, pml4_index(gpa), table_flags, &mut self.tables);
        let pdpt = pml4e.next_table_mut();
        let pdpte = walk_entry(pdpt, pdpt_index(gpa), table_flags, &mut self.tables);
        let pd = pdpte.next_table_mut();

        let pde = &mut pd.entries[pd_index(gpa)];
        pde.set_translation(hpa, flags);
        pde.set_large(true);
        Ok(())
    }

    /// Translates a guest-physical address, preserving the offset
    /// within the mapped page. Returns `None` for unmapped addresses.
    pub(crate) fn gpa_to_hpa(&self, gpa: u64) -> Option<u64> {
        let pml4e = self.pml4.entries[pml4_index(gpa)];
        if pml4e.is_empty() {
            return None;
        }
        let pdpte = pml4e.next_table().entries[pdpt_index(gpa)];
        if pdpte.is_empty() {
            return None;
        }
        let pde = pdpte.next_table().entries[pd_index(gpa)];
        if pde.is_empty() {
            return None;
        }
        if pde.large() {
            let base = (pde.pfn() << BASE_PAGE_SHIFT) & !(SUPERPAGE_SIZE - 1);
            return Some(base + (gpa & (SUPERPAGE_SIZE - 1)));
        }
        let pte = pde.next_table().entries[pt_index(gpa)];
        if pte.is_empty() {
            return None;
        }
        Some((pte.pfn() << BASE_PAGE_SHIFT) + (gpa & 0xfff))
    }

    /// How many intermediate structures have been allocated, root
    /// excluded.
    #[cfg(test)]
    pub(crate) fn table_count(&self) -> usize {
        self.tables.len()
    }
}

/// Locates the entry at `index` of `table`, allocating and wiring up the
/// next-level structure if the entry is still empty.
fn walk_entry<'a>(
    table: &'a mut NestedPagingStructure,
    index: usize,
    table_flags: EntryFlags,
    tables: &mut Vec<Box<NestedPagingStructure>>,
) -> &'a mut NestedPagingStructureEntry {
    let entry = &mut table.entries[index];
    if entry.is_empty() {
        let next = unsafe { Box::<NestedPagingStructure>::new_zeroed().assume_init() };
        let next_addr = core::ptr::from_ref(next.as_ref()) as u64;
        tables.push(next);
        entry.set_translation(next_addr, table_flags);
    }
    entry
}

impl core::fmt::Debug for NestedPageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NestedPageTable")
            .field("root", &self.root_addr())
            .field("tables", &self.tables.len())
            .finish()
    }
}

/// Anything that can translate guest-physical to host-physical
/// addresses. Implemented by the table itself and by the vendor
/// drivers, which forward to their owned table.
pub(crate) trait Translate {
    fn translate(&self, gpa: u64) -> Option<u64>;
}

impl Translate for NestedPageTable {
    fn translate(&self, gpa: u64) -> Option<u64> {
        self.gpa_to_hpa(gpa)
    }
}

/// A guest-memory view over a nested page table, used by the device
/// emulators to read and write descriptor rings and data buffers at
/// guest-physical addresses. Accesses are chunked at page boundaries
/// since contiguous guest pages need not be contiguous in host memory.
pub struct GuestMem<'a> {
    npt: &'a dyn Translate,
}

impl<'a> GuestMem<'a> {
    pub(crate) fn new(npt: &'a dyn Translate) -> Self {
        Self { npt }
    }

    pub(crate) fn read_bytes(&self, gpa: u64, buf: &mut [u8]) -> Result<(), HvmError> {
        let mut gpa = gpa;
        let mut done = 0;
        while done < buf.len() {
            let hpa = self.npt.translate(gpa).ok_or(HvmError::BadVring)?;
            let in_page = (0x1000 - (gpa & 0xfff) as usize).min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    hpa as *const u8,
                    buf[done..].as_mut_ptr(),
                    in_page,
                );
            }
            done += in_page;
            gpa += in_page as u64;
        }
        Ok(())
    }

    pub(crate) fn write_bytes(&self, gpa: u64, buf: &[u8]) -> Result<(), HvmError> {
        let mut gpa = gpa;
        let mut done = 0;
        while done < buf.len() {
            let hpa = self.npt.translate(gpa).ok_or(HvmError::BadVring)?;
            let in_page = (0x1000 - (gpa & 0xfff) as usize).min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), hpa as *mut u8, in_page);
            }
            done += in_page;
            gpa += in_page as u64;
        }
        Ok(())
    }

    pub(crate) fn read_u16(&self, gpa: u64) -> Result<u16, HvmError> {
        let mut b = [0u8; 2];
        self.read_bytes(gpa, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub(crate) fn write_u16(&self, gpa: u64, val: u16) -> Result<(), HvmError> {
        self.write_bytes(gpa, &val.to_le_bytes())
    }

    pub(crate) fn read_u32(&self, gpa: u64) -> Result<u32, HvmError> {
        let mut b = [0u8; 4];
        self.read_bytes(gpa, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub(crate) fn write_u32(&self, gpa: u64, val: u32) -> Result<(), HvmError> {
        self.write_bytes(gpa, &val.to_le_bytes())
    }

    pub(crate) fn read_u64(&self, gpa: u64) -> Result<u64, HvmError> {
        let mut b = [0u8; 8];
        self.read_bytes(gpa, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub(crate) fn write_u8(&self, gpa: u64, val: u8) -> Result<(), HvmError> {
        self.write_bytes(gpa, &[val])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ept_flavor() -> NptFlavor {
        NptFlavor {
            table: EntryFlags { permission: 0b111, memory_type: 0 },
            write_back: EntryFlags { permission: 0b111, memory_type: 6 },
            uncacheable: EntryFlags { permission: 0b111, memory_type: 0 },
            superpages: true,
        }
    }

    #[test]
    fn translation_preserves_offsets() {
        let mut npt = NestedPageTable::new(ept_flavor());
        let backing = Box::new([0u8; 4096]);
        let hpa = core::ptr::from_ref(backing.as_ref()) as u64;
        npt.insert(0x7000, hpa, MemoryType::WriteBack).unwrap();

        for k in [0u64, 1, 0x123, 0xfff] {
            assert_eq!(npt.gpa_to_hpa(0x7000 + k), Some(hpa + k));
        }
        assert_eq!(npt.gpa_to_hpa(0x8000), None);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut npt = NestedPageTable::new(ept_flavor());
        let backing = Box::new([0u8; 4096]);
        let hpa = core::ptr::from_ref(backing.as_ref()) as u64;

        npt.insert(0x2000, hpa, MemoryType::WriteBack).unwrap();
        let tables_after_first = npt.table_count();
        npt.insert(0x2000, hpa, MemoryType::WriteBack).unwrap();

        assert_eq!(npt.table_count(), tables_after_first);
        assert_eq!(npt.gpa_to_hpa(0x2000), Some(hpa));
    }

    #[test]
    fn unaligned_insert_rejected() {
        let mut npt = NestedPageTable::new(ept_flavor());
        assert_eq!(npt.insert(0x2001, 0x1000, MemoryType::WriteBack), Err(HvmError::Unaligned));
        assert_eq!(npt.insert(0x2000, 0x1001, MemoryType::WriteBack), Err(HvmError::Unaligned));
    }

    #[test]
    fn superpage_translation() {
        let mut npt = NestedPageTable::new(ept_flavor());
        // Backing does not need to really be 2 MiB for the walk itself.
        let hpa = 0x4020_0000u64;
        npt.insert_superpage(0x0060_0000, hpa, MemoryType::WriteBack).unwrap();
        assert_eq!(npt.gpa_to_hpa(0x0060_0000), Some(hpa));
        assert_eq!(npt.gpa_to_hpa(0x0060_0000 + 0x1234), Some(hpa + 0x1234));
    }

    #[test]
    fn superpage_rejected_in_low_memory() {
        let mut npt = NestedPageTable::new(ept_flavor());
        assert!(npt.insert_superpage(0, 0x4000_0000, MemoryType::WriteBack).is_err());
    }

    #[test]
    fn guest_mem_crosses_pages() {
        let mut npt = NestedPageTable::new(ept_flavor());
        let mut a = Box::new([0u8; 4096]);
        let mut b = Box::new([0u8; 4096]);
        let pa_a = core::ptr::from_mut(a.as_mut()) as u64;
        let pa_b = core::ptr::from_mut(b.as_mut()) as u64;
        npt.insert(0x1000, pa_a, MemoryType::WriteBack).unwrap();
        npt.insert(0x2000, pa_b, MemoryType::WriteBack).unwrap();

        let mem = GuestMem::new(&npt);
        let pattern: Vec<u8> = (0..64).collect();
        mem.write_bytes(0x1fe0, &pattern).unwrap();
        let mut back = [0u8; 64];
        mem.read_bytes(0x1fe0, &mut back).unwrap();
        assert_eq!(&back[..], &pattern[..]);
        // The tail landed in the second backing page.
        assert_eq!(b[0], 32);
    }
}
