//! Allocation and construction/destruction primitives layered on top of
//! [`crate::header`]. This is the layer `new`/`del`/`copy` and the garbage
//! collector's registration hooks are built from.

use std::alloc::{alloc_zeroed, dealloc as raw_dealloc, Layout};
use std::ptr::NonNull;

use crate::capability::{self, Capability, CapabilityId};
use crate::error::{CoreError, Result};
use crate::header::{header_init, header_of, header_size, AllocKind, Header, Ref};

fn layout_for(total: usize) -> Layout {
    Layout::from_size_align(total, std::mem::align_of::<Header>())
        .expect("object size overflowed an allocation layout")
}

/// Allocates zeroed storage for `ty` on the heap and registers its header.
/// Uses the type's own `Alloc` capability when it overrides default
/// placement.
pub fn alloc(ty: &'static crate::capability::TypeDescriptor) -> Result<Ref> {
    if let Some(Capability::Alloc(fns)) = ty.instance(CapabilityId::Alloc) {
        return (fns.alloc)();
    }

    let total = header_size() + capability::size(ty);
    let layout = layout_for(total);
    let buf = unsafe { alloc_zeroed(layout) };
    if buf.is_null() {
        return Err(CoreError::out_of_memory(format!("new '{}'", ty.name)));
    }
    Ok(unsafe { header_init(buf, ty, AllocKind::Heap) })
}

/// Initializes a header in `scratch` (sized for `header_size() + size(ty)`)
/// and copies `data` into the payload, producing a reference with
/// `AllocKind::Stack`. The caller owns `scratch`'s lifetime; this object is
/// never `dealloc`'d.
///
/// # Safety
/// `scratch` must outlive the returned reference and be at least
/// `header_size() + data.len()` bytes, correctly aligned for [`Header`].
pub unsafe fn alloc_stack(
    ty: &'static crate::capability::TypeDescriptor,
    scratch: *mut u8,
    data: &[u8],
) -> Ref {
    let r = header_init(scratch, ty, AllocKind::Stack);
    std::ptr::copy_nonoverlapping(data.as_ptr(), r.as_ptr(), data.len());
    r
}

/// Declares a zeroed `[u8; $n]` scratch buffer on the caller's frame and
/// binds `$name` to the `Stack`-kind reference [`alloc_stack`] installs over
/// it. Sugar over the function, not a new primitive: `$n` must still be
/// supplied by the caller, since an object's size is a runtime property of
/// `$ty` (its `Size` capability) rather than something this macro can
/// compute at expansion time.
#[macro_export]
macro_rules! stack_alloc {
    ($name:ident, $ty:expr, $n:expr, $data:expr) => {
        let mut __comet_core_scratch = [0u8; $n];
        let $name = unsafe {
            $crate::alloc::alloc_stack($ty, __comet_core_scratch.as_mut_ptr(), $data)
        };
    };
}

/// Frees a `Heap`-allocated object's storage. Refuses anything else when
/// `alloc-check` is enabled, since freeing stack/static/data storage here
/// would double-free or corrupt the owner.
pub fn dealloc(r: Ref) -> Result<()> {
    let ty = unsafe { capability::type_of(r) };
    if let Some(Capability::Alloc(fns)) = ty.instance(CapabilityId::Alloc) {
        if let Some(d) = fns.dealloc {
            d(r);
            return Ok(());
        }
    }

    #[cfg(feature = "alloc-check")]
    {
        let kind = unsafe { (*header_of(r)).alloc_kind() };
        match kind {
            AllocKind::Static => {
                return Err(CoreError::resource(format!(
                    "attempt to deallocate '{}' which was allocated statically",
                    ty.name
                )))
            }
            AllocKind::Stack => {
                return Err(CoreError::resource(format!(
                    "attempt to deallocate '{}' which was allocated on the stack",
                    ty.name
                )))
            }
            AllocKind::Data => {
                return Err(CoreError::resource(format!(
                    "attempt to deallocate '{}' which was allocated inside a data structure",
                    ty.name
                )))
            }
            AllocKind::Heap => {}
        }
    }

    let total = header_size() + capability::size(ty);
    let head = unsafe { header_of(r) };
    unsafe { raw_dealloc(head as *mut u8, layout_for(total)) };
    Ok(())
}

/// Runs `ty`'s constructor over already-allocated, zeroed storage. With no
/// registered `New`, a single-argument call degenerates to `assign`.
pub fn construct_with(r: Ref, args: &[Ref]) -> Result<Ref> {
    let ty = unsafe { capability::type_of(r) };
    match ty.instance(CapabilityId::New) {
        Some(Capability::New(fns)) => {
            (fns.construct_with)(r, args)?;
        }
        _ => {
            if args.len() == 1 {
                capability::assign(r, args[0])?;
            }
        }
    }
    Ok(r)
}

/// Runs `ty`'s destructor in place, leaving the storage allocated.
pub fn destruct(r: Ref) -> Ref {
    let ty = unsafe { capability::type_of(r) };
    if let Some(Capability::New(fns)) = ty.instance(CapabilityId::New) {
        (fns.destruct)(r);
    }
    r
}

/// Allocates, constructs, and registers `ty` with the collector as a
/// reachable-only-through-roots object (not itself a root).
pub fn new(ty: &'static crate::capability::TypeDescriptor, args: &[Ref]) -> Result<Ref> {
    let r = construct_with(alloc(ty)?, args)?;
    #[cfg(feature = "gc")]
    crate::gc::gc_add(r, false);
    Ok(r)
}

/// Same as [`new`], but registers the object as a root: it is assumed
/// unreachable from other managed objects and must be freed with [`del`].
pub fn new_root(ty: &'static crate::capability::TypeDescriptor, args: &[Ref]) -> Result<Ref> {
    let r = construct_with(alloc(ty)?, args)?;
    #[cfg(feature = "gc")]
    crate::gc::gc_add(r, true);
    Ok(r)
}

/// Destructs, deallocates, and unregisters `r`.
pub fn del(r: Ref) -> Result<()> {
    let r = destruct(r);
    dealloc(r)?;
    #[cfg(feature = "gc")]
    crate::gc::gc_rem(r);
    Ok(())
}

/// Re-exported so callers building on this layer don't need `NonNull`
/// directly when constructing headers from raw buffers.
pub fn null_checked(p: *mut u8) -> Option<Ref> {
    NonNull::new(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::int::{self, INT_TYPE};
    use crate::header::{header_of, AllocKind};

    #[test]
    fn alloc_installs_a_heap_header_sized_to_the_type() {
        let r = alloc(&INT_TYPE).unwrap();
        unsafe {
            let h = &*header_of(r);
            assert!(std::ptr::eq(h.type_of(), &INT_TYPE));
            assert_eq!(h.alloc_kind(), AllocKind::Heap);
        }
        dealloc(r).unwrap();
    }

    #[test]
    fn dealloc_of_plain_heap_object_succeeds() {
        let r = alloc(&INT_TYPE).unwrap();
        assert!(dealloc(r).is_ok());
    }

    #[test]
    fn stack_alloc_macro_installs_a_stack_header_without_touching_the_heap() {
        crate::stack_alloc!(r, &INT_TYPE, int::STACK_SIZE, &(314i64).to_ne_bytes());
        assert_eq!(int::value(r), 314);
        unsafe {
            assert_eq!((*header_of(r)).alloc_kind(), AllocKind::Stack);
        }
    }

    #[test]
    #[cfg(feature = "alloc-check")]
    fn dealloc_refuses_non_heap_allocations() {
        let mut scratch = [0u8; int::STACK_SIZE];
        let r = unsafe { alloc_stack(&INT_TYPE, scratch.as_mut_ptr(), &(7i64).to_ne_bytes()) };
        let err = dealloc(r).unwrap_err();
        assert!(matches!(err, CoreError::ResourceError(_)));
    }

    #[test]
    fn new_constructs_via_assign_fallback_and_registers_non_root() {
        let before = crate::gc::registered_count();
        let seed = int::new_stack(&mut [0u8; int::STACK_SIZE], 99);
        let r = new(&INT_TYPE, &[seed]).unwrap();
        assert_eq!(int::value(r), 99);
        assert_eq!(crate::gc::registered_count(), before + 1);
        crate::gc::gc_rem(r);
        dealloc(r).unwrap();
    }

    #[test]
    fn new_root_survives_a_collection_with_no_other_references() {
        let r = new_root(&INT_TYPE, &[]).unwrap();
        crate::gc::gc_run().unwrap();
        assert!(crate::gc::registered_count() >= 1);
        del(r).unwrap();
    }

    #[test]
    fn copy_default_allocates_and_assigns_independently() {
        let src = int::new(41).unwrap();
        let dup = capability::copy(src).unwrap();
        assert!(!std::ptr::eq(src.as_ptr(), dup.as_ptr()));
        assert_eq!(int::value(dup), int::value(src));
        del(src).unwrap();
        del(dup).unwrap();
    }

    #[test]
    fn a_types_own_alloc_capability_overrides_the_default_placement() {
        use crate::capability::{AllocFns, Capability, TypeDescriptor};
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

        static ALLOCS: AtomicUsize = AtomicUsize::new(0);
        static DEALLOCS: AtomicUsize = AtomicUsize::new(0);

        fn custom_alloc() -> Result<Ref> {
            ALLOCS.fetch_add(1, AtomicOrdering::SeqCst);
            let total = header_size() + std::mem::size_of::<i64>();
            let buf = unsafe { alloc_zeroed(layout_for(total)) };
            if buf.is_null() {
                return Err(CoreError::out_of_memory("CustomAlloc"));
            }
            Ok(unsafe { header_init(buf, &CUSTOM_TYPE, AllocKind::Heap) })
        }
        fn custom_dealloc(r: Ref) {
            DEALLOCS.fetch_add(1, AtomicOrdering::SeqCst);
            let total = header_size() + std::mem::size_of::<i64>();
            unsafe { raw_dealloc(header_of(r) as *mut u8, layout_for(total)) };
        }
        fn cap_size() -> usize {
            std::mem::size_of::<i64>()
        }

        static CUSTOM_CAPS: &[Capability] = &[
            Capability::Size(cap_size),
            Capability::Alloc(AllocFns {
                alloc: custom_alloc,
                dealloc: Some(custom_dealloc),
            }),
        ];
        static CUSTOM_TYPE: TypeDescriptor = TypeDescriptor {
            name: "CustomAlloc",
            capabilities: CUSTOM_CAPS,
            leaf: true,
        };

        let r = alloc(&CUSTOM_TYPE).unwrap();
        assert_eq!(ALLOCS.load(AtomicOrdering::SeqCst), 1);
        dealloc(r).unwrap();
        assert_eq!(DEALLOCS.load(AtomicOrdering::SeqCst), 1);
    }
}
