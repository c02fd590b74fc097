use kernel_sync::{Cpu, InterruptControl, IrqGuard, SpinLock};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static CORE: Cell<usize> = const { Cell::new(0) };
}

/// Each test thread plays one core with its own interrupt flag.
struct ThreadCpu;

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

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn irq_guard_disables_and_restores() {
    let cpu = ThreadCpu;
    assert!(cpu.interrupts_enabled());
    {
        let g = IrqGuard::new(&cpu);
        assert!(g.restores_interrupts());
        assert!(!cpu.interrupts_enabled());
    }
    assert!(cpu.interrupts_enabled());
}

#[test]
fn nested_irq_guard_keeps_interrupts_masked() {
    let cpu = ThreadCpu;
    let outer = IrqGuard::new(&cpu);
    {
        let inner = IrqGuard::new(&cpu);
        assert!(!inner.restores_interrupts());
    }
    assert!(!cpu.interrupts_enabled(), "inner guard must not unmask");
    drop(outer);
    assert!(cpu.interrupts_enabled());
}

#[test]
fn irq_guard_reports_core() {
    let cpu = ThreadCpu;
    thread::spawn(move || {
        CORE.with(|c| c.set(3));
        let g = IrqGuard::new(&cpu);
        assert_eq!(g.core_id(), 3);
    })
    .join()
    .unwrap();
}

#[test]
fn lock_irq_releases_lock_before_unmasking() {
    let cpu = ThreadCpu;
    let l = SpinLock::new(0u32);
    {
        let mut g = l.lock_irq(&cpu);
        *g = 7;
        assert!(!cpu.interrupts_enabled());
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    assert!(cpu.interrupts_enabled());
    assert_eq!(*l.lock(), 7);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for core in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            CORE.with(|c| c.set(core));
            let cpu = ThreadCpu;
            start.wait();
            for _ in 0..iters {
                let mut v = lock.lock_irq(&cpu);
                let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                assert_eq!(prev, 0, "mutual exclusion violated");
                *v += 1;
                in_cs.fetch_sub(1, Ordering::SeqCst);
                drop(v);
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn x86_cpu_reads_the_interrupt_flag() {
    use kernel_sync::irq::X86Cpu;

    // User-mode code always runs with RFLAGS.IF set.
    assert!(X86Cpu.interrupts_enabled());
}
