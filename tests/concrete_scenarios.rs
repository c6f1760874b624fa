//! The six concrete scenarios from spec.md §8, driven entirely through the
//! public API so they exercise header, capability dispatch, allocation, the
//! collector, and the ordered map together rather than any one module in
//! isolation.

use comet_core::builtins::int::{self, INT_TYPE};
use comet_core::{alloc, capability, gc, map, CoreError};

fn iter_values(m: comet_core::Ref) -> Vec<i64> {
    let mut out = Vec::new();
    let mut curr = capability::iter_init(m);
    while let Some(k) = curr {
        out.push(int::value(k));
        curr = capability::iter_next(m, k);
    }
    out
}

/// Scenario 1: build a three-entry map via `with_pairs`, read one entry
/// back, check its length, and check ascending iteration order.
#[test]
fn scenario_1_three_entry_map_get_len_iter() {
    let pairs = [
        (int::new_member(1).unwrap(), int::new_member(10).unwrap()),
        (int::new_member(2).unwrap(), int::new_member(20).unwrap()),
        (int::new_member(3).unwrap(), int::new_member(30).unwrap()),
    ];
    let m = map::with_pairs(&INT_TYPE, &INT_TYPE, &pairs).unwrap();

    let found = map::get(m, int::new_member(2).unwrap()).unwrap();
    assert_eq!(int::value(found), 20);
    assert_eq!(map::len(m), 3);
    assert_eq!(iter_values(m), vec![1, 2, 3]);

    alloc::del(m).unwrap();
}

/// Scenario 2: adversarial insertion order, then a removal, checked against
/// in-order iteration at each step.
#[test]
fn scenario_2_adversarial_insert_then_remove_stays_ordered() {
    let m = map::new(&INT_TYPE, &INT_TYPE).unwrap();
    for k in [5, 3, 8, 1, 4, 7, 9, 2, 6] {
        map::set(m, int::new_member(k).unwrap(), int::new_member(k).unwrap()).unwrap();
    }
    assert_eq!(iter_values(m), (1..=9).collect::<Vec<_>>());

    map::rem(m, int::new_member(5).unwrap()).unwrap();
    assert_eq!(iter_values(m), vec![1, 2, 3, 4, 6, 7, 8, 9]);

    alloc::del(m).unwrap();
}

/// Scenario 3: a thousand throwaway ints, never retained, are mostly
/// reclaimed by `gc_run`. Tolerant of some residual retention per spec.md
/// §9's accepted conservative-scanning caveat.
#[test]
fn scenario_3_throwaway_ints_are_reclaimed_by_gc_run() {
    let before = gc::registered_count();
    for k in 0..1000 {
        int::new_member(k).unwrap();
    }
    gc::gc_run().unwrap();
    let remaining = gc::registered_count() - before;
    assert!(
        remaining <= 50,
        "expected most of the 1000 throwaway ints to be reclaimed, {} remain",
        remaining
    );
}

/// Scenario 4: `del` on a 100-entry map destructs every key and value
/// exactly once, observed via an instrumented element type.
#[test]
fn scenario_4_del_runs_every_destructor_exactly_once() {
    use comet_core::capability::{Capability, NewFns, TypeDescriptor};
    use comet_core::header::Ref;
    use std::cmp::Ordering;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    static COUNT: AtomicUsize = AtomicUsize::new(0);

    fn cap_size() -> usize {
        std::mem::size_of::<i64>()
    }
    fn cap_assign(dst: Ref, src: Ref) -> comet_core::Result<()> {
        unsafe { *(dst.as_ptr() as *mut i64) = *(src.as_ptr() as *const i64) };
        Ok(())
    }
    fn cap_cmp(a: Ref, b: Ref) -> comet_core::Result<Ordering> {
        let av = unsafe { *(a.as_ptr() as *const i64) };
        let bv = unsafe { *(b.as_ptr() as *const i64) };
        Ok(av.cmp(&bv))
    }
    fn cap_eq(a: Ref, b: Ref) -> comet_core::Result<bool> {
        Ok(cap_cmp(a, b)? == Ordering::Equal)
    }
    fn cap_construct(r: Ref, args: &[Ref]) -> comet_core::Result<()> {
        if args.len() == 1 {
            cap_assign(r, args[0])?;
        }
        Ok(())
    }
    fn cap_destruct(_r: Ref) {
        COUNT.fetch_add(1, AtomicOrdering::SeqCst);
    }

    static COUNTED_CAPS: &[Capability] = &[
        Capability::Size(cap_size),
        Capability::New(NewFns {
            construct_with: cap_construct,
            destruct: cap_destruct,
        }),
        Capability::Assign(cap_assign),
        Capability::Eq(cap_eq),
        Capability::Cmp(cap_cmp),
    ];
    static COUNTED_TYPE: TypeDescriptor = TypeDescriptor {
        name: "Counted",
        capabilities: COUNTED_CAPS,
        leaf: true,
    };

    fn counted(n: i64) -> Ref {
        let r = alloc::alloc(&COUNTED_TYPE).unwrap();
        unsafe { *(r.as_ptr() as *mut i64) = n };
        r
    }

    let m = map::new(&COUNTED_TYPE, &COUNTED_TYPE).unwrap();
    for i in 0..100 {
        map::set(m, counted(i), counted(i * 2)).unwrap();
    }
    assert_eq!(map::len(m), 100);

    alloc::del(m).unwrap();
    assert_eq!(COUNT.load(AtomicOrdering::SeqCst), 200);
}

/// Scenario 5: `del` on a stack-allocated object raises `ResourceError`
/// naming the object's type. Only meaningful with `alloc-check` enabled
/// (the default): without it, `dealloc` has no provenance check to make.
#[test]
#[cfg(feature = "alloc-check")]
fn scenario_5_del_on_stack_object_raises_resource_error() {
    let mut scratch = [0u8; int::STACK_SIZE];
    let r = int::new_stack(&mut scratch, 7);
    let err = alloc::del(r).unwrap_err();
    match err {
        CoreError::ResourceError(msg) => assert!(msg.contains("Int")),
        other => panic!("expected ResourceError, got {other:?}"),
    }
}

/// Scenario 6: removing a missing key raises `KeyError`.
#[test]
fn scenario_6_rem_on_missing_key_raises_key_error() {
    let m = map::new(&INT_TYPE, &INT_TYPE).unwrap();
    let err = map::rem(m, int::new_member(12345).unwrap()).unwrap_err();
    assert!(matches!(err, CoreError::KeyError(_)));
    alloc::del(m).unwrap();
}
