use core::fmt;

use kernel_memory_addresses::{PAGE_SIZE, PAGE_SIZE_BYTES, PhysMapper, PhysicalAddress};
use kernel_sync::{Cpu, IrqGuard, SpinLock};

use crate::free_list::FreeList;

/// Byte pattern written over a page when it is handed out.
pub const ALLOC_JUNK: u8 = 0x05;

/// Byte pattern written over a page when it is returned.
pub const FREE_JUNK: u8 = 0x01;

/// An allocated physical page, exclusively owned by its holder.
///
/// Not `Clone`: giving the page back to [`PageAllocator::free`] consumes
/// the token, so the same page can't be freed twice through safe code.
#[must_use = "dropping a Page leaks it; hand it back with PageAllocator::free"]
#[derive(PartialEq, Eq)]
pub struct Page {
    addr: PhysicalAddress,
}

impl Page {
    /// Forge a page token for `addr`.
    ///
    /// # Safety
    /// The caller must own the page at `addr` exclusively, as if it had been
    /// returned by [`PageAllocator::allocate`], and must not create a second
    /// token for it.
    pub const unsafe fn from_raw(addr: PhysicalAddress) -> Self {
        Self { addr }
    }

    /// Physical address of the first byte of the page.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.addr
    }

    /// Give up the token and keep the page for good (e.g. for page tables).
    #[inline]
    #[must_use]
    pub const fn into_raw(self) -> PhysicalAddress {
        self.addr
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({})", self.addr)
    }
}

/// Why a page was refused by [`PageAllocator::free`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPage {
    #[error("free: {0} is not aligned to a 4096-byte page boundary")]
    Misaligned(PhysicalAddress),
    #[error("free: {addr} is outside the managed range [{start}, {end})")]
    OutOfRange {
        addr: PhysicalAddress,
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
}

/// Physical page allocator with one free list per core.
///
/// `C` identifies the executing core and controls its interrupt flag, `M`
/// maps physical pages so their bytes can be written. `CORES` bounds the core
/// indices `C` may report.
pub struct PageAllocator<C: Cpu, M: PhysMapper, const CORES: usize> {
    cpu: C,
    mapper: M,
    lists: [SpinLock<FreeList>; CORES],
    /// First managed page (inclusive).
    start: PhysicalAddress,
    /// End of the last whole managed page (exclusive).
    end: PhysicalAddress,
    initialized: bool,
}

impl<C: Cpu, M: PhysMapper, const CORES: usize> PageAllocator<C, M, CORES> {
    /// An allocator with no memory; see [`init`](Self::init).
    #[must_use]
    pub const fn new(cpu: C, mapper: M) -> Self {
        const { assert!(CORES > 0, "need at least one core") };
        Self {
            cpu,
            mapper,
            lists: [const { SpinLock::new(FreeList::new()) }; CORES],
            start: PhysicalAddress::zero(),
            end: PhysicalAddress::zero(),
            initialized: false,
        }
    }

    /// Hand the physical range `[start, end)` to the allocator.
    ///
    /// `start` is rounded up to a page boundary and every whole page in the
    /// range is freed onto the list of the core running the scan at the time
    /// that page is processed.
    ///
    /// # Safety
    /// The range must be RAM reachable through the mapper, unused by anything
    /// else, and stays owned by the allocator from now on.
    ///
    /// # Panics
    /// When called a second time.
    pub unsafe fn init(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        assert!(!self.initialized, "PageAllocator::init called twice");
        self.initialized = true;

        let end = end.align_down();
        let start = start.checked_align_up().map_or(end, |s| s.min(end));
        self.start = start;
        self.end = end;

        let mut page = start;
        let mut count = 0usize;
        while page < end {
            self.release(page);
            page += PAGE_SIZE;
            count += 1;
        }

        log::info!("page allocator: {count} pages in [{start}, {end}) across {CORES} core lists");
    }

    /// Take one page, preferring the executing core's list.
    ///
    /// Falls back to stealing a single page from the other cores in index
    /// order. Returns `None` only if every list is empty. The page content is
    /// [`ALLOC_JUNK`], not zero.
    #[must_use]
    pub fn allocate(&self) -> Option<Page> {
        let irq = IrqGuard::new(&self.cpu);
        let core = irq.core_id();

        let local = self.list(core).lock().pop(&self.mapper);
        let addr = match local {
            Some(addr) => addr,
            None => self.steal(core)?,
        };
        drop(irq);

        unsafe { self.fill(addr, ALLOC_JUNK) };
        Some(Page { addr })
    }

    /// Return a page to the executing core's list.
    ///
    /// # Panics
    /// If the page is misaligned or outside the managed range (see
    /// [`InvalidPage`]). No list is touched in that case.
    pub fn free(&self, page: Page) {
        let addr = match self.validate(page.addr) {
            Ok(addr) => addr,
            Err(e) => panic!("{e}"),
        };
        self.release(addr);
    }

    /// Check whether `addr` could be a page of this allocator.
    ///
    /// # Errors
    /// The reason [`free`](Self::free) would reject the page.
    pub fn validate(&self, addr: PhysicalAddress) -> Result<PhysicalAddress, InvalidPage> {
        if !addr.is_page_aligned() {
            return Err(InvalidPage::Misaligned(addr));
        }
        if addr < self.start || addr >= self.end {
            return Err(InvalidPage::OutOfRange {
                addr,
                start: self.start,
                end: self.end,
            });
        }
        Ok(addr)
    }

    /// Bytes of an allocated page.
    #[must_use]
    pub fn bytes<'a>(&'a self, page: &'a Page) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.mapper.phys_to_ptr(page.addr), PAGE_SIZE_BYTES) }
    }

    /// Mutable bytes of an allocated page.
    #[must_use]
    pub fn bytes_mut<'a>(&'a self, page: &'a mut Page) -> &'a mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self.mapper.phys_to_ptr(page.addr), PAGE_SIZE_BYTES)
        }
    }

    /// Total number of free pages over all cores.
    ///
    /// A snapshot: the lists are counted one after the other.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        (0..CORES).map(|core| self.free_pages_on(core)).sum()
    }

    /// Number of free pages on `core`'s list.
    #[must_use]
    pub fn free_pages_on(&self, core: usize) -> usize {
        self.list(core).lock_irq(&self.cpu).len()
    }

    /// `[start, end)` of the pages under management.
    #[must_use]
    pub const fn managed_range(&self) -> (PhysicalAddress, PhysicalAddress) {
        (self.start, self.end)
    }

    /// Number of per-core lists.
    #[must_use]
    pub const fn cores(&self) -> usize {
        CORES
    }

    /// Junk-fill `addr` and push it onto the executing core's list.
    fn release(&self, addr: PhysicalAddress) {
        unsafe { self.fill(addr, FREE_JUNK) };

        let irq = IrqGuard::new(&self.cpu);
        let core = irq.core_id();
        // Safety: `addr` is aligned, in range, and owned by the caller.
        unsafe { self.list(core).lock().push(&self.mapper, addr) };
    }

    /// Pop one page from the first non-empty list other than `thief`'s.
    ///
    /// Holds at most one list lock at a time.
    fn steal(&self, thief: usize) -> Option<PhysicalAddress> {
        (0..CORES).filter(|&victim| victim != thief).find_map(|victim| {
            let page = self.lists[victim].lock().pop(&self.mapper);
            if let Some(addr) = page {
                log::trace!("core {thief} stole page {addr} from core {victim}");
            }
            page
        })
    }

    fn list(&self, core: usize) -> &SpinLock<FreeList> {
        assert!(core < CORES, "core index {core} exceeds the {CORES} configured cores");
        &self.lists[core]
    }

    /// # Safety
    /// `addr` must be a managed page exclusively owned by the caller.
    unsafe fn fill(&self, addr: PhysicalAddress, junk: u8) {
        unsafe { self.mapper.phys_to_ptr(addr).write_bytes(junk, PAGE_SIZE_BYTES) };
    }
}
