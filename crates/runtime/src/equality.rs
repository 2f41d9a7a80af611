//! Value equality and hashing as the VM sees it (spec §4.2): bitwise for
//! everything except strings, which compare and hash by content. Both
//! `table.rs` (hash-part buckets) and `interpreter.rs` (`==`/`~=`) route
//! through here instead of `Value::raw_eq` directly.

use std::hash::{Hash, Hasher};

use gal_core::Value;

use crate::object::ObjectKind;
use crate::string::GalString;

/// # Safety
/// If `value.as_object_ptr()` is `Some`, the pointer must still point at
/// a live heap object (the header's `kind` byte is always safe to read).
pub unsafe fn values_equal(a: Value, b: Value) -> bool {
    match (a.as_object_ptr(), b.as_object_ptr()) {
        (Some(pa), Some(pb)) => unsafe { object_payload_eq(pa, pb) },
        _ => a.raw_eq(b),
    }
}

unsafe fn object_payload_eq(pa: *mut (), pb: *mut ()) -> bool {
    if pa == pb {
        return true;
    }
    unsafe {
        match (as_gal_string(pa), as_gal_string(pb)) {
            (Some(sa), Some(sb)) => sa.content_eq(sb),
            _ => false,
        }
    }
}

/// # Safety
/// `ptr` must point at a live heap object.
unsafe fn as_gal_string<'a>(ptr: *mut ()) -> Option<&'a GalString> {
    let header = ptr as *const crate::object::GcHeader;
    unsafe {
        if (*header).kind == ObjectKind::String {
            Some(&*(ptr as *const GalString))
        } else {
            None
        }
    }
}

/// Reads `value` as a UTF-8 string slice if it is one, otherwise `None`
/// — used for metatable key lookups (`"__add"`, `"mode"`, ...) where the
/// caller only cares whether a string matches a known name.
///
/// # Safety
/// Any object pointer inside `value` must still be live.
pub unsafe fn value_str<'a>(value: Value) -> Option<&'a str> {
    let ptr = value.as_object_ptr()?;
    unsafe { as_gal_string(ptr) }.and_then(|s| s.as_str())
}

/// A `Value` newtype whose `Hash`/`Eq` follow `values_equal`, so it can
/// key a `HashMap`-backed table hash part.
#[derive(Clone, Copy)]
pub struct TableKey(pub Value);

impl TableKey {
    /// # Safety
    /// Same as `values_equal`: any object pointer inside `self.0` must
    /// still be live.
    pub unsafe fn hash_bits(&self) -> u64 {
        match self.0.as_object_ptr() {
            Some(ptr) => unsafe {
                match as_gal_string(ptr) {
                    Some(s) => s.hash as u64,
                    None => ptr as u64,
                }
            },
            None => self.0.to_bits(),
        }
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &TableKey) -> bool {
        unsafe { values_equal(self.0, other.0) }
    }
}
impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        unsafe { self.hash_bits() }.hash(state);
    }
}
