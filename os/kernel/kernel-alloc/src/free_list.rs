use core::ptr;

use kernel_memory_addresses::{PhysMapper, PhysicalAddress};

/// Written into every free page next to its link; cleared again on pop.
///
/// A page that is written to after being freed (or handed out twice) loses
/// the marker and trips the check in [`FreeList::pop`].
const LINK_MAGIC: u64 = 0x4652_4545_5041_4745;

/// `next` of the last page. Never page aligned, so never a real link.
const END_OF_LIST: u64 = u64::MAX;

/// Link record stored at the beginning of every **free** page.
///
/// ```text
/// +-------+-------------+------------------------------------+
/// | magic | next (phys) |        junk (FREE_JUNK)            |
/// +-------+-------------+------------------------------------+
/// ^ page base                                   page base + 4096 ^
/// ```
#[repr(C)]
struct FreePage {
    magic: u64,
    next: u64,
}

/// A singly linked LIFO stack of free pages.
///
/// Only the head lives outside physical memory; every other link sits in the
/// first bytes of the page it describes.
///
/// # Invariants
/// - Every address on the list is page aligned, owned by the list, and
///   reachable through the mapper passed to [`push`](Self::push) and
///   [`pop`](Self::pop) (always the same one).
/// - No address is on the list twice.
pub(crate) struct FreeList {
    head: Option<PhysicalAddress>,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Number of pages on the list.
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Push `page` onto the list, storing the link inside the page.
    ///
    /// # Safety
    /// - `page` must be page aligned, writable through `mapper`, and owned
    ///   by the caller, who gives it up.
    /// - `page` must not already be on any free list.
    pub(crate) unsafe fn push<M: PhysMapper + ?Sized>(&mut self, mapper: &M, page: PhysicalAddress) {
        let link = link_ptr(mapper, page);
        unsafe {
            ptr::write(
                link,
                FreePage {
                    magic: LINK_MAGIC,
                    next: self.head.map_or(END_OF_LIST, PhysicalAddress::as_u64),
                },
            );
        }
        self.head = Some(page);
        self.len += 1;
    }

    /// Pop the most recently pushed page.
    ///
    /// # Panics
    /// If the link record of the head page was overwritten while the page
    /// was free.
    pub(crate) fn pop<M: PhysMapper + ?Sized>(&mut self, mapper: &M) -> Option<PhysicalAddress> {
        let page = self.head?;
        let link = link_ptr(mapper, page);

        // Safety: the list owns `page` (type invariant) and `link_ptr`
        // checked the alignment.
        let record = unsafe { ptr::read(link) };
        assert!(
            record.magic == LINK_MAGIC,
            "free list corrupted: page {page} was written while free"
        );
        unsafe {
            (&raw mut (*link).magic).write(0);
        }

        self.head = (record.next != END_OF_LIST).then_some(PhysicalAddress::new(record.next));
        self.len -= 1;
        Some(page)
    }
}

/// The invariant-checked view of a page as a link record.
fn link_ptr<M: PhysMapper + ?Sized>(mapper: &M, page: PhysicalAddress) -> *mut FreePage {
    assert!(page.is_page_aligned(), "free list link at unaligned address {page}");
    let link = mapper.phys_to_ptr(page).cast::<FreePage>();
    assert!(link.is_aligned(), "mapper returned a misaligned pointer for {page}");
    link
}
