use kernel_alloc::{ALLOC_JUNK, FREE_JUNK, Page, PageAllocator};
use kernel_memory_addresses::{IdentityMapper, PAGE_SIZE, PAGE_SIZE_BYTES, PhysMapper, PhysicalAddress};
use kernel_sync::{Cpu, InterruptControl};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::{panic, thread};

thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static CORE: Cell<usize> = const { Cell::new(0) };
}

/// Each test thread plays one core.
#[derive(Default)]
struct ThreadCpu;

impl ThreadCpu {
    fn run_on(core: usize) {
        CORE.with(|c| c.set(core));
    }
}

impl InterruptControl for ThreadCpu {
    fn interrupts_enabled(&self) -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    fn disable_interrupts(&self) {
        IRQ_ENABLED.with(|f| f.set(false));
    }

    fn enable_interrupts(&self) {
        IRQ_ENABLED.with(|f| f.set(true));
    }
}

impl Cpu for ThreadCpu {
    fn current_core(&self) -> usize {
        CORE.with(Cell::get)
    }
}

/// Page-aligned host memory standing in for physical RAM.
struct Ram {
    base: *mut u8,
    layout: Layout,
}

// Safety: the allocator under test owns the bytes; the arena only frees them.
unsafe impl Send for Ram {}
unsafe impl Sync for Ram {}

impl Ram {
    fn pages(n: usize) -> Self {
        let layout = Layout::from_size_align(n * PAGE_SIZE_BYTES, PAGE_SIZE_BYTES).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    fn start(&self) -> PhysicalAddress {
        IdentityMapper.virt_to_phys(self.base)
    }

    fn end(&self) -> PhysicalAddress {
        self.start() + self.layout.size() as u64
    }

    fn contains(&self, addr: u64) -> bool {
        (self.start().as_u64()..self.end().as_u64()).contains(&addr)
    }

    /// Base address of every page in the arena.
    fn page_set(&self) -> HashSet<u64> {
        (0..self.layout.size() / PAGE_SIZE_BYTES)
            .map(|i| self.start().as_u64() + i as u64 * PAGE_SIZE)
            .collect()
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

type Alloc<const CORES: usize> = PageAllocator<ThreadCpu, IdentityMapper, CORES>;

fn allocator<const CORES: usize>(ram: &Ram) -> Alloc<CORES> {
    let mut pages = PageAllocator::new(ThreadCpu, IdentityMapper);
    unsafe { pages.init(ram.start(), ram.end()) };
    pages
}

#[test]
fn four_pages_then_empty() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(4);
    let pages = allocator::<1>(&ram);
    assert_eq!(pages.free_pages(), 4);

    let got: Vec<Page> = (0..4).map(|_| pages.allocate().unwrap()).collect();
    let distinct: HashSet<u64> = got.iter().map(|p| p.address().as_u64()).collect();
    assert_eq!(distinct, ram.page_set());
    assert!(pages.allocate().is_none());

    for p in got {
        pages.free(p);
    }
    assert_eq!(pages.free_pages(), 4);
}

#[test]
fn last_freed_is_first_reused() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(4);
    let pages = allocator::<1>(&ram);

    let a = pages.allocate().unwrap();
    let _b = pages.allocate().unwrap();
    let addr = a.address();
    pages.free(a);

    assert_eq!(pages.allocate().unwrap().address(), addr);
}

#[test]
fn init_rounds_start_up_and_skips_partial_pages() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(4);
    let mut pages: Alloc<1> = PageAllocator::new(ThreadCpu, IdentityMapper);
    unsafe { pages.init(ram.start() + 1, PhysicalAddress::new(ram.end().as_u64() - 1)) };

    // Only pages 1 and 2 lie wholly inside [start + 1, end - 1).
    assert_eq!(pages.free_pages(), 2);
    let (start, end) = pages.managed_range();
    assert_eq!(start, ram.start() + PAGE_SIZE);
    assert_eq!(end, ram.start() + 3 * PAGE_SIZE);
}

#[test]
fn single_threaded_init_puts_everything_on_the_boot_core() {
    ThreadCpu::run_on(2);
    let ram = Ram::pages(6);
    let pages = allocator::<4>(&ram);

    assert_eq!(pages.cores(), 4);
    assert_eq!(pages.free_pages_on(2), 6);
    assert_eq!(pages.free_pages_on(0) + pages.free_pages_on(1) + pages.free_pages_on(3), 0);
}

#[test]
fn empty_core_steals_one_page() {
    ThreadCpu::run_on(1);
    let ram = Ram::pages(3);
    let pages = allocator::<4>(&ram);

    ThreadCpu::run_on(0);
    let stolen = pages.allocate().expect("page from core 1");
    assert_eq!(pages.free_pages_on(1), 2);
    assert_eq!(pages.free_pages_on(0), 0);

    // Freeing goes to the freeing core, not the one the page came from.
    pages.free(stolen);
    assert_eq!(pages.free_pages_on(0), 1);
    assert_eq!(pages.free_pages_on(1), 2);
}

#[test]
fn stealing_drains_every_core_before_reporting_empty() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(4);
    let pages = allocator::<4>(&ram);

    // Spread one page onto each core's list through the normal free path.
    let all: Vec<Page> = (0..4).map(|_| pages.allocate().unwrap()).collect();
    for (core, p) in all.into_iter().enumerate() {
        ThreadCpu::run_on(core);
        pages.free(p);
    }
    for core in 0..4 {
        assert_eq!(pages.free_pages_on(core), 1);
    }

    ThreadCpu::run_on(3);
    let got: Vec<Page> = (0..4).map(|_| pages.allocate().unwrap()).collect();
    assert!(pages.allocate().is_none());
    assert_eq!(got.iter().map(Page::address).collect::<HashSet<_>>().len(), 4);
}

#[test]
fn pages_are_junk_filled() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(2);
    let pages = allocator::<1>(&ram);

    let mut page = pages.allocate().unwrap();
    assert!(pages.bytes(&page).iter().all(|&b| b == ALLOC_JUNK));

    pages.bytes_mut(&mut page).fill(0);
    let addr = page.address();
    pages.free(page);

    // The link record occupies the first bytes; the rest is free junk.
    let raw = unsafe { std::slice::from_raw_parts(IdentityMapper.phys_to_ptr(addr), PAGE_SIZE_BYTES) };
    assert!(raw[64..].iter().all(|&b| b == FREE_JUNK));
}

#[test]
fn interrupts_are_restored_after_each_operation() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(2);
    let pages = allocator::<2>(&ram);
    let cpu = ThreadCpu;
    assert!(cpu.interrupts_enabled());

    let p = pages.allocate().unwrap();
    assert!(cpu.interrupts_enabled());
    pages.free(p);
    assert!(cpu.interrupts_enabled());

    // An operation from interrupt context leaves interrupts masked.
    cpu.disable_interrupts();
    let p = pages.allocate().unwrap();
    pages.free(p);
    assert!(!cpu.interrupts_enabled());
    cpu.enable_interrupts();
}

#[test]
#[should_panic(expected = "init called twice")]
fn second_init_panics() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(2);
    let mut pages = allocator::<1>(&ram);
    unsafe { pages.init(ram.start(), ram.end()) };
}

#[test]
fn rejected_free_leaves_lists_untouched() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(4);
    let pages = allocator::<1>(&ram);
    let held = pages.allocate().unwrap();
    let before = pages.free_pages();

    let misaligned = unsafe { Page::from_raw(held.address() + 8) };
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| pages.free(misaligned)));
    let msg = *res.unwrap_err().downcast::<String>().unwrap();
    assert!(msg.contains("not aligned"), "{msg}");
    assert_eq!(pages.free_pages(), before);

    let outside = unsafe { Page::from_raw(ram.end()) };
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| pages.free(outside)));
    let msg = *res.unwrap_err().downcast::<String>().unwrap();
    assert!(msg.contains("outside the managed range"), "{msg}");
    assert_eq!(pages.free_pages(), before);

    // A rejected free doesn't poison anything.
    pages.free(held);
    assert_eq!(pages.free_pages(), before + 1);
}

#[test]
fn validate_reports_reason() {
    ThreadCpu::run_on(0);
    let ram = Ram::pages(1);
    let pages = allocator::<1>(&ram);

    assert!(pages.validate(ram.start()).is_ok());
    assert!(pages.validate(ram.start() + 1).is_err());
    assert!(pages.validate(ram.end()).is_err());
}

#[test]
fn concurrent_allocations_are_unique_and_complete() {
    const CORES: usize = 4;
    const PAGES: usize = 64;

    ThreadCpu::run_on(0);
    let ram = Ram::pages(PAGES);
    let pages = Arc::new(allocator::<CORES>(&ram));
    let start = Arc::new(Barrier::new(CORES));

    let handles: Vec<_> = (0..CORES)
        .map(|core| {
            let pages = Arc::clone(&pages);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                ThreadCpu::run_on(core);
                start.wait();
                let mut mine = Vec::new();
                // Churn a little so pages migrate between core lists.
                for _ in 0..8 {
                    if let Some(p) = pages.allocate() {
                        pages.free(p);
                    }
                }
                while let Some(p) = pages.allocate() {
                    mine.push(p.into_raw().as_u64());
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for h in handles {
        for addr in h.join().unwrap() {
            assert!(ram.contains(addr), "page {addr:#x} is outside the managed range");
            assert!(seen.insert(addr), "page {addr:#x} handed out twice");
        }
    }
    assert_eq!(seen, ram.page_set());
    assert_eq!(pages.free_pages(), 0);
}

#[test]
fn concurrent_free_and_allocate_conserve_pages() {
    const CORES: usize = 4;
    const PAGES: usize = 32;

    ThreadCpu::run_on(0);
    let ram = Ram::pages(PAGES);
    let pages = Arc::new(allocator::<CORES>(&ram));
    let start = Arc::new(Barrier::new(CORES));

    let handles: Vec<_> = (0..CORES)
        .map(|core| {
            let pages = Arc::clone(&pages);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                ThreadCpu::run_on(core);
                start.wait();
                for _ in 0..500 {
                    let a = pages.allocate();
                    let b = pages.allocate();
                    if let Some(a) = a {
                        pages.free(a);
                    }
                    if let Some(b) = b {
                        pages.free(b);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // Lists stay disjoint and their union is the whole range.
    let per_core: usize = (0..CORES).map(|c| pages.free_pages_on(c)).sum();
    assert_eq!(per_core, PAGES);

    ThreadCpu::run_on(0);
    let drained: HashSet<u64> =
        std::iter::from_fn(|| pages.allocate().map(|p| p.into_raw().as_u64())).collect();
    assert_eq!(drained.len(), PAGES);
    assert_eq!(drained, ram.page_set());
}
