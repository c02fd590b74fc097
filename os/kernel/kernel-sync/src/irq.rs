use core::marker::PhantomData;

/// Control over the interrupt flag of the executing core.
///
/// The kernel implements this with privileged instructions (see [`X86Cpu`]);
/// host-side tests implement it with a thread-local flag.
pub trait InterruptControl {
    /// Whether interrupt delivery is currently enabled on this core.
    fn interrupts_enabled(&self) -> bool;

    /// Mask interrupt delivery on this core.
    fn disable_interrupts(&self);

    /// Unmask interrupt delivery on this core.
    fn enable_interrupts(&self);
}

/// A core the kernel runs on.
pub trait Cpu: InterruptControl {
    /// Logical index of the executing core (`0..n`).
    ///
    /// The answer is only stable while the caller can't migrate, i.e. with
    /// interrupts disabled. Prefer [`IrqGuard::core_id`], which makes that
    /// precondition part of the signature.
    fn current_core(&self) -> usize;
}

impl<T: InterruptControl + ?Sized> InterruptControl for &T {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        (**self).interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        (**self).disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        (**self).enable_interrupts();
    }
}

impl<T: Cpu + ?Sized> Cpu for &T {
    #[inline]
    fn current_core(&self) -> usize {
        (**self).current_core()
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were
/// enabled, it disables them. On drop, it re-enables them **only** if they
/// were previously enabled, so guards nest: an inner guard taken inside an
/// interrupt handler leaves interrupts masked when it goes away.
///
/// The guard is `!Send`: it describes the state of the core that created it.
///
/// # Examples
///
/// ```no_run
/// use kernel_sync::irq::{Cpu, IrqGuard};
///
/// fn local_work<C: Cpu>(cpu: &C) -> usize {
///     let irq = IrqGuard::new(cpu); // masked here if previously enabled
///     irq.core_id()                 // can't migrate until `irq` drops
/// }
/// ```
pub struct IrqGuard<'a, I: InterruptControl + ?Sized> {
    ctl: &'a I,
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, I: InterruptControl + ?Sized> IrqGuard<'a, I> {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new(ctl: &'a I) -> Self {
        let enabled = ctl.interrupts_enabled();
        if enabled {
            ctl.disable_interrupts();
        }
        Self {
            ctl,
            were_enabled: enabled,
            _not_send: PhantomData,
        }
    }

    /// Whether interrupts will be re-enabled when this guard drops.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl<C: Cpu + ?Sized> IrqGuard<'_, C> {
    /// Index of the executing core.
    ///
    /// Stable for the lifetime of the guard because the caller can't be
    /// preempted and rescheduled elsewhere.
    #[inline]
    #[must_use]
    pub fn core_id(&self) -> usize {
        self.ctl.current_core()
    }
}

impl<I: InterruptControl + ?Sized> Drop for IrqGuard<'_, I> {
    /// Restores interrupts only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            self.ctl.enable_interrupts();
        }
    }
}

#[cfg(target_arch = "x86_64")]
pub use x86::X86Cpu;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::{Cpu, InterruptControl};

    /// `IA32_TSC_AUX`; holds the logical core index, read back by `rdtscp`.
    const IA32_TSC_AUX: u32 = 0xC000_0103;

    /// `RFLAGS.IF`.
    const RFLAGS_IF: u64 = 1 << 9;

    /// The executing `x86_64` core.
    ///
    /// Uses `cli`/`sti` and `pushfq`/`pop` for the interrupt flag and
    /// `rdtscp` for the core index. Each core must publish its index once
    /// during bring-up via [`X86Cpu::publish_core_index`].
    ///
    /// # Privilege
    ///
    /// Only valid in ring 0.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct X86Cpu;

    impl X86Cpu {
        /// Store `index` in `IA32_TSC_AUX` of the executing core.
        ///
        /// # Safety
        /// Must run in ring 0, once per core, before any allocator or driver
        /// call on that core. Indices must be unique and dense.
        pub unsafe fn publish_core_index(index: u32) {
            unsafe {
                core::arch::asm!(
                    "wrmsr",
                    in("ecx") IA32_TSC_AUX,
                    in("eax") index,
                    in("edx") 0u32,
                    options(nostack, preserves_flags)
                );
            }
        }

        #[inline]
        #[must_use]
        fn rflags() -> u64 {
            let r: u64;
            unsafe {
                core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
            }
            r
        }
    }

    impl InterruptControl for X86Cpu {
        #[inline]
        fn interrupts_enabled(&self) -> bool {
            Self::rflags() & RFLAGS_IF != 0
        }

        #[inline]
        fn disable_interrupts(&self) {
            unsafe { core::arch::asm!("cli", options(nostack)) }
        }

        #[inline]
        fn enable_interrupts(&self) {
            unsafe { core::arch::asm!("sti", options(nostack)) }
        }
    }

    impl Cpu for X86Cpu {
        #[inline]
        fn current_core(&self) -> usize {
            let aux: u32;
            unsafe {
                core::arch::asm!(
                    "rdtscp",
                    out("eax") _,
                    out("edx") _,
                    out("ecx") aux,
                    options(nomem, nostack, preserves_flags)
                );
            }
            aux as usize
        }
    }
}
