//! A minimal boxed 64-bit integer: the one leaf numeric type this crate
//! ships, just enough to exercise [`crate::map`] end to end. It stands in
//! for the wider numeric/text catalogue a full runtime would carry, which
//! is out of scope here.

use std::cmp::Ordering;

use crate::capability::{Capability, TypeDescriptor};
use crate::error::Result;
use crate::header::{header_init, AllocKind, Ref};

fn cap_size() -> usize {
    std::mem::size_of::<i64>()
}

fn cap_assign(dst: Ref, src: Ref) -> Result<()> {
    unsafe { *(dst.as_ptr() as *mut i64) = *(src.as_ptr() as *const i64) };
    Ok(())
}

fn cap_eq(a: Ref, b: Ref) -> Result<bool> {
    Ok(value(a) == value(b))
}

fn cap_cmp(a: Ref, b: Ref) -> Result<Ordering> {
    Ok(value(a).cmp(&value(b)))
}

fn cap_show(r: Ref, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
    write!(out, "{}", value(r))
}

static INT_CAPS: &[Capability] = &[
    Capability::Size(cap_size),
    Capability::Assign(cap_assign),
    Capability::Eq(cap_eq),
    Capability::Cmp(cap_cmp),
    Capability::Show(cap_show),
];

pub static INT_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Int",
    capabilities: INT_CAPS,
    leaf: true,
};

/// Bytes needed for a [`new_stack`] call's caller-owned scratch buffer.
pub const STACK_SIZE: usize = crate::header::header_size() + std::mem::size_of::<i64>();

/// Reads the boxed value. `r` must be a live `Int` reference.
pub fn value(r: Ref) -> i64 {
    unsafe { *(r.as_ptr() as *const i64) }
}

/// Allocates a heap `Int` and registers it as a root.
pub fn new(n: i64) -> Result<Ref> {
    let r = crate::alloc::alloc(&INT_TYPE)?;
    unsafe { *(r.as_ptr() as *mut i64) = n };
    #[cfg(feature = "gc")]
    crate::gc::gc_add(r, true);
    Ok(r)
}

/// Allocates a heap `Int` registered as a non-root (reachable only through
/// whatever structure holds it).
pub fn new_member(n: i64) -> Result<Ref> {
    let r = crate::alloc::alloc(&INT_TYPE)?;
    unsafe { *(r.as_ptr() as *mut i64) = n };
    #[cfg(feature = "gc")]
    crate::gc::gc_add(r, false);
    Ok(r)
}

/// Builds an `Int` in caller-owned `scratch` (at least [`STACK_SIZE`]
/// bytes). Never registered with the collector; never `dealloc`'d.
pub fn new_stack(scratch: &mut [u8], n: i64) -> Ref {
    assert!(scratch.len() >= STACK_SIZE);
    let buf = scratch.as_mut_ptr();
    let r = unsafe { header_init(buf, &INT_TYPE, AllocKind::Stack) };
    unsafe { *(r.as_ptr() as *mut i64) = n };
    r
}
