//! One collector per thread: the registry, the captured stack origin, and
//! the mark/sweep cycle itself.

use std::cell::RefCell;

use crate::capability::{Capability, CapabilityId};
use crate::error::Result;
use crate::header::Ref;

use super::registry::Registry;
use super::stack::{scan_from_registers_and_stack, StackBounds};

pub struct Collector {
    registry: Registry,
    bounds: StackBounds,
}

impl Collector {
    fn new() -> Self {
        Collector {
            registry: Registry::new(),
            bounds: StackBounds::current_thread(),
        }
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    /// Accepts `r` as a trusted object reference: either a root, or a child
    /// reported by its parent's own `Traverse` capability. Such refs are
    /// never independently registry-tracked when they are `Data`-kind
    /// (embedded inside a container node), so idempotency here is tracked
    /// on the object's own header bit rather than the registry's. When `r`
    /// does happen to also be a registered `Heap` entry, its registry mark
    /// is kept in sync so sweep still treats it as reachable.
    fn mark_trusted(&mut self, r: Ref, worklist: &mut Vec<Ref>, visited: &mut Vec<Ref>) {
        let hdr = unsafe { &mut *crate::header::header_of(r) };
        if hdr.is_marked() {
            return;
        }
        hdr.set_marked(true);
        visited.push(r);
        let _ = self.registry.test_and_set_marked(r);
        worklist.push(r);
    }

    /// Accepts `candidate` as an unvalidated word straight off the native
    /// stack or a conservative body scan: it might not be a pointer at all,
    /// so it is only trusted once the registry confirms it matches a
    /// registered entry exactly.
    fn mark_conservative(&mut self, candidate: usize, worklist: &mut Vec<Ref>, visited: &mut Vec<Ref>) {
        if let Some(r) = std::ptr::NonNull::new(candidate as *mut u8) {
            if self.registry.test_and_set_marked(r) {
                unsafe { (*crate::header::header_of(r)).set_marked(true) };
                visited.push(r);
                worklist.push(r);
            }
        }
    }

    /// Iterative mark. Roots and `Traverse`-reported children are trusted
    /// refs, recursed into via their own header mark bit; raw candidates
    /// from the native stack or an untyped conservative body scan must
    /// additionally clear the registry's membership check before being
    /// dereferenced. Returns every ref whose header bit was set this cycle,
    /// so the caller can clear them again once sweep has run.
    fn mark(&mut self) -> Vec<Ref> {
        let mut visited = Vec::new();
        if self.registry.len() == 0 {
            return visited;
        }

        let mut worklist = Vec::new();
        for r in self.registry.unmarked_roots() {
            unsafe { (*crate::header::header_of(r)).set_marked(true) };
            visited.push(r);
            worklist.push(r);
        }

        let from = self.bounds.origin();
        if !from.is_null() {
            unsafe {
                scan_from_registers_and_stack(from, &mut |candidate| {
                    self.mark_conservative(candidate, &mut worklist, &mut visited);
                });
            }
        }

        while let Some(r) = worklist.pop() {
            let ty = unsafe { crate::header::type_of(r) };
            if ty.leaf {
                continue;
            }
            if let Some(Capability::Traverse(tf)) = ty.instance(CapabilityId::Traverse) {
                let mut children = Vec::new();
                tf(r, &mut |child| children.push(child));
                for c in children {
                    self.mark_trusted(c, &mut worklist, &mut visited);
                }
                continue;
            }
            let size = crate::capability::size(ty);
            let base = r.as_ptr() as usize;
            let mut off = 0;
            while off + std::mem::size_of::<usize>() <= size {
                let word = unsafe { ((base + off) as *const usize).read_unaligned() };
                self.mark_conservative(word, &mut worklist, &mut visited);
                off += std::mem::size_of::<usize>();
            }
        }

        visited
    }

    fn sweep(&mut self) -> Result<Vec<Ref>> {
        self.registry.sweep()
    }

    pub fn add(&mut self, ptr: Ref, root: bool) -> Result<()> {
        self.registry.add(ptr, root)?;
        if self.registry.len() > self.registry.mitems {
            self.run_cycle()?;
        }
        Ok(())
    }

    pub fn remove(&mut self, ptr: Ref) -> Result<()> {
        self.registry.remove(ptr)
    }

    pub fn run_cycle(&mut self) -> Result<()> {
        #[cfg(feature = "gc-tracing")]
        let _span = tracing::info_span!("gc_cycle", live = self.registry.len()).entered();

        let visited = self.mark();
        let freed = self.sweep()?;
        // Every ref in `visited` survived this cycle (sweep only reclaims
        // unmarked non-roots), so it's safe to clear their header bits now,
        // ready for the next cycle's mark phase.
        for r in &visited {
            unsafe { (*crate::header::header_of(*r)).set_marked(false) };
        }
        for r in freed {
            let r = crate::alloc::destruct(r);
            let _ = crate::alloc::dealloc(r);
        }
        Ok(())
    }

    /// Unconditionally destructs and frees every entry, root or not, and
    /// empties the registry. Only correct at thread teardown: unlike
    /// `run_cycle`, this does not check reachability first, since nothing
    /// on this thread will run again to observe a dangling root.
    fn finish(&mut self) {
        #[cfg(feature = "gc-tracing")]
        let _span = tracing::info_span!("gc_finish", live = self.registry.len()).entered();

        for r in self.registry.drain_all() {
            let r = crate::alloc::destruct(r);
            let _ = crate::alloc::dealloc(r);
        }
    }
}

impl Drop for Collector {
    /// Mirrors `gc_finish`'s contract: at thread exit, every object this
    /// collector still tracks is destructed and freed, root or not.
    fn drop(&mut self) {
        self.finish();
    }
}

thread_local! {
    static COLLECTOR: RefCell<Option<Collector>> = RefCell::new(None);
}

fn with_collector<T>(f: impl FnOnce(&mut Collector) -> T) -> T {
    COLLECTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Some(Collector::new());
        }
        f(slot.as_mut().unwrap())
    })
}

/// Registers `ptr` with the current thread's collector, triggering a
/// collection cycle if the registry has grown past its threshold.
pub fn gc_add(ptr: Ref, root: bool) {
    let _ = with_collector(|c| c.add(ptr, root));
}

pub fn gc_rem(ptr: Ref) {
    let _ = with_collector(|c| c.remove(ptr));
}

/// Forces an immediate mark-sweep cycle on the current thread.
pub fn gc_run() -> Result<()> {
    with_collector(|c| c.run_cycle())
}

/// Destructs and frees every remaining object, root or not, and tears the
/// collector down. Runs automatically when the thread-local `Collector` is
/// dropped at thread exit; exposed directly so a caller can force the same
/// teardown earlier without waiting for the thread to end.
pub fn gc_finish() -> Result<()> {
    COLLECTOR.with(|cell| {
        // Dropping the taken `Collector` runs `Drop::drop`, which calls
        // `finish()`. The local binding exists only to extend its lifetime
        // to the end of the statement, so destruction happens with the
        // `RefCell` already released.
        let taken = cell.borrow_mut().take();
        drop(taken);
        Ok(())
    })
}

/// Number of objects currently registered on this thread (roots and
/// reachable non-roots alike). Exposed for tests and diagnostics.
pub fn registered_count() -> usize {
    with_collector(|c| c.registry_len())
}
