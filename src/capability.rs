//! Structural polymorphism: a type is a name plus a small, linearly
//! searched set of capability records. There is no class inheritance —
//! dispatch always goes through [`instance`].

use std::cmp::Ordering;
use std::sync::{Mutex, OnceLock};

use crate::error::{CoreError, Result};
use crate::header::Ref;

/// Identity of one named operation set a type may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityId {
    Size,
    New,
    Assign,
    Copy,
    Eq,
    Cmp,
    Len,
    Get,
    Iter,
    Traverse,
    Show,
    Subtype,
    Alloc,
}

pub struct NewFns {
    pub construct_with: fn(Ref, &[Ref]) -> Result<()>,
    pub destruct: fn(Ref),
}

pub struct GetFns {
    pub get: fn(Ref, Ref) -> Result<Ref>,
    pub set: fn(Ref, Ref, Ref) -> Result<()>,
    pub mem: fn(Ref, Ref) -> bool,
    pub rem: fn(Ref, Ref) -> Result<()>,
}

pub struct IterFns {
    pub init: fn(Ref) -> Option<Ref>,
    pub next: fn(Ref, Ref) -> Option<Ref>,
}

pub struct SubtypeFns {
    pub key_subtype: Option<fn(Ref) -> &'static TypeDescriptor>,
    pub val_subtype: fn(Ref) -> &'static TypeDescriptor,
}

pub struct AllocFns {
    pub alloc: fn() -> Result<Ref>,
    pub dealloc: Option<fn(Ref)>,
}

/// One operation set, named by [`CapabilityId`]. Each variant's payload is
/// the fixed function-pointer record a type registers for it.
pub enum Capability {
    Size(fn() -> usize),
    New(NewFns),
    Assign(fn(Ref, Ref) -> Result<()>),
    Copy(fn(Ref) -> Result<Ref>),
    Eq(fn(Ref, Ref) -> Result<bool>),
    Cmp(fn(Ref, Ref) -> Result<Ordering>),
    Len(fn(Ref) -> usize),
    Get(GetFns),
    Iter(IterFns),
    Traverse(fn(Ref, &mut dyn FnMut(Ref))),
    Show(fn(Ref, &mut dyn std::fmt::Write) -> std::fmt::Result),
    Subtype(SubtypeFns),
    Alloc(AllocFns),
}

impl Capability {
    fn id(&self) -> CapabilityId {
        match self {
            Capability::Size(_) => CapabilityId::Size,
            Capability::New(_) => CapabilityId::New,
            Capability::Assign(_) => CapabilityId::Assign,
            Capability::Copy(_) => CapabilityId::Copy,
            Capability::Eq(_) => CapabilityId::Eq,
            Capability::Cmp(_) => CapabilityId::Cmp,
            Capability::Len(_) => CapabilityId::Len,
            Capability::Get(_) => CapabilityId::Get,
            Capability::Iter(_) => CapabilityId::Iter,
            Capability::Traverse(_) => CapabilityId::Traverse,
            Capability::Show(_) => CapabilityId::Show,
            Capability::Subtype(_) => CapabilityId::Subtype,
            Capability::Alloc(_) => CapabilityId::Alloc,
        }
    }
}

/// A type object: a name plus its capability table. Always `'static` —
/// every type in this crate is a statically defined Rust value, so type
/// objects themselves carry `AllocKind::Static` by construction rather than
/// by a header field.
pub struct TypeDescriptor {
    pub name: &'static str,
    pub capabilities: &'static [Capability],
    /// Types the collector never needs to scan into for embedded
    /// references (numeric/text leaves, and type descriptors themselves,
    /// whose capability table holds code addresses rather than managed
    /// references).
    pub leaf: bool,
}

impl TypeDescriptor {
    /// Linear lookup by capability identity, as the table is expected to
    /// stay small (a handful of entries per type).
    pub fn instance(&self, id: CapabilityId) -> Option<&'static Capability> {
        self.capabilities.iter().find(|c| c.id() == id)
    }
}

/// # Safety
/// `r` must be a live, properly headered reference.
pub unsafe fn type_of(r: Ref) -> &'static TypeDescriptor {
    crate::header::type_of(r)
}

pub fn size(ty: &'static TypeDescriptor) -> usize {
    match ty.instance(CapabilityId::Size) {
        Some(Capability::Size(f)) => f(),
        _ => 0,
    }
}

pub fn instance(ty: &'static TypeDescriptor, id: CapabilityId) -> Option<&'static Capability> {
    ty.instance(id)
}

/// # Safety
/// `r` must be a live, properly headered reference.
pub unsafe fn type_instance(r: Ref, id: CapabilityId) -> Option<&'static Capability> {
    type_of(r).instance(id)
}

pub fn cmp(a: Ref, b: Ref) -> Result<Ordering> {
    let ty = unsafe { type_of(a) };
    match ty.instance(CapabilityId::Cmp) {
        Some(Capability::Cmp(f)) => f(a, b),
        _ => match ty.instance(CapabilityId::Eq) {
            Some(Capability::Eq(f)) => {
                if f(a, b)? {
                    Ok(Ordering::Equal)
                } else {
                    Err(CoreError::type_error(format!(
                        "'{}' has no total order (Eq held but objects differ)",
                        ty.name
                    )))
                }
            }
            _ => Err(CoreError::type_error(format!(
                "'{}' does not implement Cmp or Eq",
                ty.name
            ))),
        },
    }
}

pub fn eq(a: Ref, b: Ref) -> Result<bool> {
    let ty = unsafe { type_of(a) };
    match ty.instance(CapabilityId::Eq) {
        Some(Capability::Eq(f)) => f(a, b),
        _ => Ok(cmp(a, b)? == Ordering::Equal),
    }
}

pub fn neq(a: Ref, b: Ref) -> Result<bool> {
    Ok(!eq(a, b)?)
}

pub fn len(r: Ref) -> Result<usize> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Len) {
        Some(Capability::Len(f)) => Ok(f(r)),
        _ => Err(CoreError::type_error(format!(
            "'{}' does not implement Len",
            ty.name
        ))),
    }
}

pub fn get(r: Ref, key: Ref) -> Result<Ref> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Get) {
        Some(Capability::Get(fns)) => (fns.get)(r, key),
        _ => Err(CoreError::type_error(format!(
            "'{}' does not implement Get",
            ty.name
        ))),
    }
}

pub fn set(r: Ref, key: Ref, val: Ref) -> Result<()> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Get) {
        Some(Capability::Get(fns)) => (fns.set)(r, key, val),
        _ => Err(CoreError::type_error(format!(
            "'{}' does not implement Get",
            ty.name
        ))),
    }
}

pub fn mem(r: Ref, key: Ref) -> bool {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Get) {
        Some(Capability::Get(fns)) => (fns.mem)(r, key),
        _ => false,
    }
}

pub fn rem(r: Ref, key: Ref) -> Result<()> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Get) {
        Some(Capability::Get(fns)) => (fns.rem)(r, key),
        _ => Err(CoreError::type_error(format!(
            "'{}' does not implement Get",
            ty.name
        ))),
    }
}

pub fn iter_init(r: Ref) -> Option<Ref> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Iter) {
        Some(Capability::Iter(fns)) => (fns.init)(r),
        _ => None,
    }
}

pub fn iter_next(r: Ref, curr: Ref) -> Option<Ref> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Iter) {
        Some(Capability::Iter(fns)) => (fns.next)(r, curr),
        _ => None,
    }
}

pub fn traverse(r: Ref, f: &mut dyn FnMut(Ref)) {
    let ty = unsafe { type_of(r) };
    if let Some(Capability::Traverse(tf)) = ty.instance(CapabilityId::Traverse) {
        tf(r, f);
    }
}

pub fn key_subtype(r: Ref) -> Option<&'static TypeDescriptor> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Subtype) {
        Some(Capability::Subtype(fns)) => fns.key_subtype.map(|f| f(r)),
        _ => None,
    }
}

pub fn val_subtype(r: Ref) -> Option<&'static TypeDescriptor> {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Subtype) {
        Some(Capability::Subtype(fns)) => Some((fns.val_subtype)(r)),
        _ => None,
    }
}

/// Deep "set contents" operation. Every mutable type must register
/// `Assign`; there is no default, since copying raw bytes over a managed
/// object would skip its `New`/`Traverse` obligations.
pub fn assign(dst: Ref, src: Ref) -> Result<()> {
    let ty = unsafe { type_of(dst) };
    match ty.instance(CapabilityId::Assign) {
        Some(Capability::Assign(f)) => f(dst, src),
        _ => Err(CoreError::type_error(format!(
            "'{}' does not implement Assign",
            ty.name
        ))),
    }
}

/// Default `Copy` is `alloc(type_of(src)) + assign`; a type overrides by
/// registering its own `Copy` capability.
pub fn copy(src: Ref) -> Result<Ref> {
    let ty = unsafe { type_of(src) };
    match ty.instance(CapabilityId::Copy) {
        Some(Capability::Copy(f)) => f(src),
        _ => {
            let obj = crate::alloc::alloc(ty)?;
            assign(obj, src)?;
            #[cfg(feature = "gc")]
            crate::gc::gc_add(obj, true);
            Ok(obj)
        }
    }
}

pub fn print_to(out: &mut dyn std::fmt::Write, r: Ref) -> std::fmt::Result {
    let ty = unsafe { type_of(r) };
    match ty.instance(CapabilityId::Show) {
        Some(Capability::Show(f)) => f(r, out),
        _ => write!(out, "<'{}' at {:p}>", ty.name, r.as_ptr()),
    }
}

type CastRule = fn(Ref) -> Result<Ref>;

fn cast_rules() -> &'static Mutex<Vec<(&'static str, &'static str, CastRule)>> {
    static RULES: OnceLock<Mutex<Vec<(&'static str, &'static str, CastRule)>>> = OnceLock::new();
    RULES.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a conversion rule consulted by [`cast`] whenever the source
/// isn't already `to`.
pub fn register_cast(from: &'static str, to: &'static str, rule: CastRule) {
    cast_rules().lock().unwrap().push((from, to, rule));
}

/// Converts `r` to `ty`, returning `r` unchanged if it already has that
/// type. Used by the ordered map to coerce lookup keys before comparing.
pub fn cast(r: Ref, ty: &'static TypeDescriptor) -> Result<Ref> {
    let src_ty = unsafe { type_of(r) };
    if std::ptr::eq(src_ty, ty) {
        return Ok(r);
    }
    let rules = cast_rules().lock().unwrap();
    for (from, to, rule) in rules.iter() {
        if *from == src_ty.name && *to == ty.name {
            return rule(r);
        }
    }
    Err(CoreError::type_error(format!(
        "cannot cast '{}' to '{}'",
        src_ty.name, ty.name
    )))
}
