//! Leaf demonstration types. Not a general numeric/text catalogue — just
//! enough to exercise the header, capability, GC and map machinery.

pub mod int;
