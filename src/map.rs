//! Ordered key -> value map backed by a red-black tree, colour bit packed
//! into the low bit of each node's parent pointer.
//!
//! Each node is one contiguous allocation: `[left, right, parent|colour,
//! Header, key bytes, Header, value bytes]`. Key and value live with
//! `AllocKind::Data` headers, embedded rather than independently
//! allocated, mirroring the layout `spec.md` §3 describes.

use std::alloc::{alloc_zeroed, dealloc as raw_dealloc, Layout};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::ptr::NonNull;

use crate::capability::{
    self, Capability, CapabilityId, GetFns, IterFns, NewFns, SubtypeFns, TypeDescriptor,
};
use crate::error::{CoreError, Result};
use crate::header::{header_init, header_size, AllocKind, Ref};

const WORD: usize = std::mem::size_of::<usize>();

#[repr(C)]
struct MapState {
    root: *mut u8,
    ktype: &'static TypeDescriptor,
    vtype: &'static TypeDescriptor,
    ksize: usize,
    vsize: usize,
    nitems: usize,
}

fn state_of(m: Ref) -> *mut MapState {
    m.as_ptr() as *mut MapState
}

// --- node layout -----------------------------------------------------

fn left_slot(node: *mut u8) -> *mut *mut u8 {
    node as *mut *mut u8
}

fn right_slot(node: *mut u8) -> *mut *mut u8 {
    unsafe { node.add(WORD) as *mut *mut u8 }
}

fn parent_slot(node: *mut u8) -> *mut usize {
    unsafe { node.add(2 * WORD) as *mut usize }
}

fn get_left(node: *mut u8) -> *mut u8 {
    unsafe { *left_slot(node) }
}
fn get_right(node: *mut u8) -> *mut u8 {
    unsafe { *right_slot(node) }
}
fn set_left(node: *mut u8, v: *mut u8) {
    unsafe { *left_slot(node) = v };
}
fn set_right(node: *mut u8, v: *mut u8) {
    unsafe { *right_slot(node) = v };
}

fn is_red(node: *mut u8) -> bool {
    if node.is_null() {
        return false;
    }
    unsafe { *parent_slot(node) & 1 == 1 }
}
fn is_black(node: *mut u8) -> bool {
    !is_red(node)
}

fn get_parent(node: *mut u8) -> *mut u8 {
    (unsafe { *parent_slot(node) } & !1usize) as *mut u8
}

fn set_parent(node: *mut u8, ptr: *mut u8) {
    let bit = if is_red(node) { 1 } else { 0 };
    unsafe { *parent_slot(node) = (ptr as usize) | bit };
}

fn set_color(node: *mut u8, red: bool) {
    let ptr = get_parent(node);
    let bit = if red { 1usize } else { 0 };
    unsafe { *parent_slot(node) = (ptr as usize) | bit };
}
fn set_red(node: *mut u8) {
    set_color(node, true);
}
fn set_black(node: *mut u8) {
    set_color(node, false);
}

fn key_ref(node: *mut u8) -> Ref {
    unsafe { NonNull::new_unchecked(node.add(3 * WORD + header_size())) }
}
fn val_ref(node: *mut u8, ksize: usize) -> Ref {
    unsafe { NonNull::new_unchecked(node.add(3 * WORD + header_size() + ksize + header_size())) }
}

/// Recovers the owning node from a key reference handed back by iteration.
fn node_of_key(key: Ref) -> *mut u8 {
    unsafe { key.as_ptr().sub(3 * WORD + header_size()) }
}

fn node_layout(ksize: usize, vsize: usize) -> Layout {
    let total = 3 * WORD + 2 * header_size() + ksize + vsize;
    Layout::from_size_align(total, WORD).expect("map node size overflowed layout")
}

fn node_alloc(m: &MapState) -> Result<*mut u8> {
    let layout = node_layout(m.ksize, m.vsize);
    let node = unsafe { alloc_zeroed(layout) };
    if node.is_null() {
        return Err(CoreError::out_of_memory("Map entry"));
    }
    unsafe {
        header_init(node.add(3 * WORD), m.ktype, AllocKind::Data);
        header_init(
            node.add(3 * WORD + header_size() + m.ksize),
            m.vtype,
            AllocKind::Data,
        );
    }
    set_red(node);
    Ok(node)
}

fn node_free(node: *mut u8, ksize: usize, vsize: usize) {
    unsafe { raw_dealloc(node, node_layout(ksize, vsize)) };
}

fn clear_entry(node: *mut u8, ksize: usize, vsize: usize) {
    if node.is_null() {
        return;
    }
    clear_entry(get_left(node), ksize, vsize);
    clear_entry(get_right(node), ksize, vsize);
    crate::alloc::destruct(key_ref(node));
    crate::alloc::destruct(val_ref(node, ksize));
    node_free(node, ksize, vsize);
}

// --- rotations and fix-up, CLRS-style ---------------------------------

fn replace(m: &mut MapState, old: *mut u8, new: *mut u8) {
    let parent = get_parent(old);
    if parent.is_null() {
        m.root = new;
    } else if old == get_left(parent) {
        set_left(parent, new);
    } else {
        set_right(parent, new);
    }
    if !new.is_null() {
        set_parent(new, parent);
    }
}

fn rotate_left(m: &mut MapState, node: *mut u8) {
    let r = get_right(node);
    replace(m, node, r);
    set_right(node, get_left(r));
    if !get_left(r).is_null() {
        set_parent(get_left(r), node);
    }
    set_left(r, node);
    set_parent(node, r);
}

fn rotate_right(m: &mut MapState, node: *mut u8) {
    let l = get_left(node);
    replace(m, node, l);
    set_left(node, get_right(l));
    if !get_right(l).is_null() {
        set_parent(get_right(l), node);
    }
    set_right(l, node);
    set_parent(node, l);
}

fn sibling(node: *mut u8) -> *mut u8 {
    if node.is_null() {
        return std::ptr::null_mut();
    }
    let p = get_parent(node);
    if p.is_null() {
        return std::ptr::null_mut();
    }
    if node == get_left(p) {
        get_right(p)
    } else {
        get_left(p)
    }
}

fn grandparent(node: *mut u8) -> *mut u8 {
    if node.is_null() {
        return std::ptr::null_mut();
    }
    let p = get_parent(node);
    if p.is_null() {
        std::ptr::null_mut()
    } else {
        get_parent(p)
    }
}

fn uncle(node: *mut u8) -> *mut u8 {
    let g = grandparent(node);
    if g.is_null() {
        return std::ptr::null_mut();
    }
    if get_parent(node) == get_left(g) {
        get_right(g)
    } else {
        get_left(g)
    }
}

fn insert_fix(m: &mut MapState, mut node: *mut u8) {
    loop {
        let parent = get_parent(node);
        if parent.is_null() {
            set_black(node);
            return;
        }
        if is_black(parent) {
            return;
        }
        let unc = uncle(node);
        if !unc.is_null() && is_red(unc) {
            set_black(parent);
            set_black(unc);
            set_red(grandparent(node));
            node = grandparent(node);
            continue;
        }

        let mut node_var = node;
        let mut parent_var = parent;
        if node_var == get_right(parent_var) && parent_var == get_left(grandparent(node_var)) {
            rotate_left(m, parent_var);
            node_var = get_left(node_var);
        } else if node_var == get_left(parent_var) && parent_var == get_right(grandparent(node_var))
        {
            rotate_right(m, parent_var);
            node_var = get_right(node_var);
        }

        parent_var = get_parent(node_var);
        let gp = grandparent(node_var);
        set_black(parent_var);
        set_red(gp);
        if node_var == get_left(parent_var) {
            rotate_right(m, gp);
        } else {
            rotate_left(m, gp);
        }
        return;
    }
}

fn maximum(mut node: *mut u8) -> *mut u8 {
    while !get_right(node).is_null() {
        node = get_right(node);
    }
    node
}

fn remove_fix(m: &mut MapState, mut node: *mut u8) {
    loop {
        if get_parent(node).is_null() {
            return;
        }

        if is_red(sibling(node)) {
            set_red(get_parent(node));
            set_black(sibling(node));
            if node == get_left(get_parent(node)) {
                rotate_left(m, get_parent(node));
            } else {
                rotate_right(m, get_parent(node));
            }
        }

        let p = get_parent(node);
        let s = sibling(node);
        if is_black(p) && is_black(s) && is_black(get_left(s)) && is_black(get_right(s)) {
            set_red(s);
            node = p;
            continue;
        }

        if is_red(p) && is_black(s) && is_black(get_left(s)) && is_black(get_right(s)) {
            set_red(s);
            set_black(p);
            return;
        }

        if is_black(s) {
            if node == get_left(p) && is_red(get_left(s)) && is_black(get_right(s)) {
                set_red(s);
                set_black(get_left(s));
                rotate_right(m, s);
            } else if node == get_right(p) && is_red(get_right(s)) && is_black(get_left(s)) {
                set_red(s);
                set_black(get_right(s));
                rotate_left(m, s);
            }
        }

        let s = sibling(node);
        let p = get_parent(node);
        set_color(s, is_red(p));
        set_black(p);
        if node == get_left(p) {
            set_black(get_right(s));
            rotate_left(m, p);
        } else {
            set_black(get_left(s));
            rotate_right(m, p);
        }
        return;
    }
}

// --- operations used by the Get/Iter/Traverse/... capabilities --------

fn map_mem(m: &MapState, key: Ref) -> Result<bool> {
    let key = capability::cast(key, m.ktype)?;
    let mut node = m.root;
    while !node.is_null() {
        match capability::cmp(key_ref(node), key)? {
            Ordering::Equal => return Ok(true),
            Ordering::Greater => node = get_left(node),
            Ordering::Less => node = get_right(node),
        }
    }
    Ok(false)
}

fn map_get(m: &MapState, key: Ref) -> Result<Ref> {
    let key = capability::cast(key, m.ktype)?;
    let mut node = m.root;
    while !node.is_null() {
        match capability::cmp(key_ref(node), key)? {
            Ordering::Equal => return Ok(val_ref(node, m.ksize)),
            Ordering::Greater => node = get_left(node),
            Ordering::Less => node = get_right(node),
        }
    }
    Err(CoreError::key_error(format_ref(key)))
}

fn format_ref(r: Ref) -> String {
    let mut s = String::new();
    let _ = capability::print_to(&mut s, r);
    s
}

fn map_set(m: &mut MapState, key: Ref, val: Ref) -> Result<()> {
    let key = capability::cast(key, m.ktype)?;
    let val = capability::cast(val, m.vtype)?;

    if m.root.is_null() {
        let node = node_alloc(m)?;
        capability::assign(key_ref(node), key)?;
        capability::assign(val_ref(node, m.ksize), val)?;
        m.root = node;
        m.nitems += 1;
        insert_fix(m, node);
        return Ok(());
    }

    let mut node = m.root;
    loop {
        match capability::cmp(key_ref(node), key)? {
            Ordering::Equal => {
                capability::assign(key_ref(node), key)?;
                capability::assign(val_ref(node, m.ksize), val)?;
                return Ok(());
            }
            Ordering::Greater => {
                if get_left(node).is_null() {
                    let newn = node_alloc(m)?;
                    capability::assign(key_ref(newn), key)?;
                    capability::assign(val_ref(newn, m.ksize), val)?;
                    set_left(node, newn);
                    set_parent(newn, node);
                    insert_fix(m, newn);
                    m.nitems += 1;
                    return Ok(());
                }
                node = get_left(node);
            }
            Ordering::Less => {
                if get_right(node).is_null() {
                    let newn = node_alloc(m)?;
                    capability::assign(key_ref(newn), key)?;
                    capability::assign(val_ref(newn, m.ksize), val)?;
                    set_right(node, newn);
                    set_parent(newn, node);
                    insert_fix(m, newn);
                    m.nitems += 1;
                    return Ok(());
                }
                node = get_right(node);
            }
        }
    }
}

fn map_rem(m: &mut MapState, key: Ref) -> Result<()> {
    let key = capability::cast(key, m.ktype)?;

    let mut node = m.root;
    let mut found = false;
    while !node.is_null() {
        match capability::cmp(key_ref(node), key)? {
            Ordering::Equal => {
                found = true;
                break;
            }
            Ordering::Greater => node = get_left(node),
            Ordering::Less => node = get_right(node),
        }
    }
    if !found {
        return Err(CoreError::key_error(format_ref(key)));
    }

    crate::alloc::destruct(key_ref(node));
    crate::alloc::destruct(val_ref(node, m.ksize));

    if !get_left(node).is_null() && !get_right(node).is_null() {
        let pred = maximum(get_left(node));
        let ncol = is_red(node);
        unsafe {
            std::ptr::copy_nonoverlapping(
                pred.add(3 * WORD),
                node.add(3 * WORD),
                2 * header_size() + m.ksize + m.vsize,
            );
        }
        set_color(node, ncol);
        node = pred;
    }

    let child = if get_right(node).is_null() {
        get_left(node)
    } else {
        get_right(node)
    };

    if is_black(node) {
        set_color(node, is_red(child));
        remove_fix(m, node);
    }

    replace(m, node, child);

    if get_parent(node).is_null() && !child.is_null() {
        set_black(child);
    }

    m.nitems -= 1;
    node_free(node, m.ksize, m.vsize);
    Ok(())
}

fn map_iter_init(m: &MapState) -> Option<Ref> {
    if m.nitems == 0 {
        return None;
    }
    let mut node = m.root;
    while !get_left(node).is_null() {
        node = get_left(node);
    }
    Some(key_ref(node))
}

fn map_iter_next(_m: &MapState, curr: Ref) -> Option<Ref> {
    let mut node = node_of_key(curr);
    let mut parent = get_parent(node);

    if !get_right(node).is_null() {
        node = get_right(node);
        while !get_left(node).is_null() {
            node = get_left(node);
        }
        return Some(key_ref(node));
    }

    loop {
        if parent.is_null() {
            return None;
        }
        if node == get_left(parent) {
            return Some(key_ref(parent));
        }
        // node == get_right(parent): climb one level and keep looking.
        node = parent;
        parent = get_parent(parent);
    }
}

// --- capability glue ---------------------------------------------------

fn cap_size() -> usize {
    std::mem::size_of::<MapState>()
}

fn cap_construct_with(_m: Ref, _args: &[Ref]) -> Result<()> {
    Err(CoreError::format_error(
        "Map must be constructed via comet_core::map::new/with_pairs, not New::construct_with",
    ))
}

fn cap_destruct(m: Ref) {
    clear(m);
}

fn cap_assign(dst: Ref, src: Ref) -> Result<()> {
    clear(dst);
    let src_state = unsafe { &*state_of(src) };
    {
        let dst_state = unsafe { &mut *state_of(dst) };
        dst_state.ktype = src_state.ktype;
        dst_state.vtype = src_state.vtype;
        dst_state.ksize = src_state.ksize;
        dst_state.vsize = src_state.vsize;
    }
    let mut curr = map_iter_init(src_state);
    while let Some(k) = curr {
        let node = node_of_key(k);
        let v = val_ref(node, src_state.ksize);
        map_set(unsafe { &mut *state_of(dst) }, k, v)?;
        curr = map_iter_next(src_state, k);
    }
    Ok(())
}

fn cap_copy(src: Ref) -> Result<Ref> {
    let src_state = unsafe { &*state_of(src) };
    let out = new(src_state.ktype, src_state.vtype)?;
    let mut curr = map_iter_init(src_state);
    while let Some(k) = curr {
        let node = node_of_key(k);
        let v = val_ref(node, src_state.ksize);
        set(out, k, v)?;
        curr = map_iter_next(src_state, k);
    }
    Ok(out)
}

fn cap_eq(a: Ref, b: Ref) -> Result<bool> {
    let a_state = unsafe { &*state_of(a) };
    let b_state = unsafe { &*state_of(b) };
    if a_state.nitems != b_state.nitems {
        return Ok(false);
    }
    let mut curr = map_iter_init(a_state);
    while let Some(k) = curr {
        let node = node_of_key(k);
        let av = val_ref(node, a_state.ksize);
        if !map_mem(b_state, k)? {
            return Ok(false);
        }
        let bv = map_get(b_state, k)?;
        if capability::neq(av, bv)? {
            return Ok(false);
        }
        curr = map_iter_next(a_state, k);
    }
    Ok(true)
}

fn cap_len(m: Ref) -> usize {
    unsafe { &*state_of(m) }.nitems
}

fn cap_get(m: Ref, key: Ref) -> Result<Ref> {
    map_get(unsafe { &*state_of(m) }, key)
}
fn cap_set(m: Ref, key: Ref, val: Ref) -> Result<()> {
    map_set(unsafe { &mut *state_of(m) }, key, val)
}
fn cap_mem(m: Ref, key: Ref) -> bool {
    map_mem(unsafe { &*state_of(m) }, key).unwrap_or(false)
}
fn cap_rem(m: Ref, key: Ref) -> Result<()> {
    map_rem(unsafe { &mut *state_of(m) }, key)
}

fn cap_iter_init(m: Ref) -> Option<Ref> {
    map_iter_init(unsafe { &*state_of(m) })
}
fn cap_iter_next(m: Ref, curr: Ref) -> Option<Ref> {
    map_iter_next(unsafe { &*state_of(m) }, curr)
}

fn cap_traverse(m: Ref, f: &mut dyn FnMut(Ref)) {
    let state = unsafe { &*state_of(m) };
    let mut curr = map_iter_init(state);
    while let Some(k) = curr {
        let node = node_of_key(k);
        f(k);
        f(val_ref(node, state.ksize));
        curr = map_iter_next(state, k);
    }
}

fn cap_key_subtype(m: Ref) -> &'static TypeDescriptor {
    unsafe { &*state_of(m) }.ktype
}
fn cap_val_subtype(m: Ref) -> &'static TypeDescriptor {
    unsafe { &*state_of(m) }.vtype
}

fn cap_show(m: Ref, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
    let state = unsafe { &*state_of(m) };
    write!(out, "<'Map' at {:p} {{", m.as_ptr())?;
    let mut curr = map_iter_init(state);
    while let Some(k) = curr {
        let node = node_of_key(k);
        capability::print_to(out, k)?;
        write!(out, ":")?;
        capability::print_to(out, val_ref(node, state.ksize))?;
        curr = map_iter_next(state, k);
        if curr.is_some() {
            write!(out, ", ")?;
        }
    }
    write!(out, "}}>")
}

static MAP_CAPS: &[Capability] = &[
    Capability::Size(cap_size),
    Capability::New(NewFns {
        construct_with: cap_construct_with,
        destruct: cap_destruct,
    }),
    Capability::Assign(cap_assign),
    Capability::Copy(cap_copy),
    Capability::Eq(cap_eq),
    Capability::Len(cap_len),
    Capability::Get(GetFns {
        get: cap_get,
        set: cap_set,
        mem: cap_mem,
        rem: cap_rem,
    }),
    Capability::Iter(IterFns {
        init: cap_iter_init,
        next: cap_iter_next,
    }),
    Capability::Traverse(cap_traverse),
    Capability::Subtype(SubtypeFns {
        key_subtype: Some(cap_key_subtype),
        val_subtype: cap_val_subtype,
    }),
    Capability::Show(cap_show),
];

pub static MAP_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Map",
    capabilities: MAP_CAPS,
    leaf: false,
};

/// Clears every entry, running each key's and value's destructor exactly
/// once, without freeing the map object itself.
pub fn clear(m: Ref) {
    let state = unsafe { &mut *state_of(m) };
    clear_entry(state.root, state.ksize, state.vsize);
    state.root = std::ptr::null_mut();
    state.nitems = 0;
}

/// Constructs an empty map for the given key/value types and registers it
/// as a root with the collector.
///
/// `ktype`/`vtype` are plain Rust statics rather than managed references —
/// unlike the dynamically-typed original this crate descends from, every
/// type here is a compile-time value, so there is no `Ref` to pass through
/// a uniform argument list for them.
pub fn new(ktype: &'static TypeDescriptor, vtype: &'static TypeDescriptor) -> Result<Ref> {
    let m = crate::alloc::alloc(&MAP_TYPE)?;
    {
        let state = unsafe { &mut *state_of(m) };
        state.root = std::ptr::null_mut();
        state.ktype = ktype;
        state.vtype = vtype;
        state.ksize = capability::size(ktype);
        state.vsize = capability::size(vtype);
        state.nitems = 0;
    }
    #[cfg(feature = "gc")]
    crate::gc::gc_add(m, true);
    Ok(m)
}

/// Constructs a map and inserts every `(key, value)` pair in order,
/// mirroring `Map_New`'s variadic-argument constructor.
pub fn with_pairs(
    ktype: &'static TypeDescriptor,
    vtype: &'static TypeDescriptor,
    pairs: &[(Ref, Ref)],
) -> Result<Ref> {
    let m = new(ktype, vtype)?;
    for &(k, v) in pairs {
        set(m, k, v)?;
    }
    Ok(m)
}

pub fn get(m: Ref, key: Ref) -> Result<Ref> {
    capability::get(m, key)
}
pub fn set(m: Ref, key: Ref, val: Ref) -> Result<()> {
    capability::set(m, key, val)
}
pub fn mem(m: Ref, key: Ref) -> bool {
    capability::mem(m, key)
}
pub fn rem(m: Ref, key: Ref) -> Result<()> {
    capability::rem(m, key)
}
pub fn len(m: Ref) -> usize {
    capability::len(m).unwrap_or(0)
}
