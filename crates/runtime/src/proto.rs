//! Runtime-resident function prototypes (spec §3.5): `gal_core::Prototype`
//! wrapped with a GC header, its `Constant::Closure` children resolved
//! into pointers, and a shared handle to its chunk's interned string
//! table so the interpreter never has to carry a chunk alongside `pc`.

use std::ptr::NonNull;
use std::rc::Rc;

use gal_core::Prototype as ChunkPrototype;

use crate::object::{GcHeader, GcObject, Mark, ObjectKind};
use crate::string::GalString;

pub struct Proto {
    pub header: GcHeader,
    pub inner: ChunkPrototype,
    /// Every prototype in the chunk this one was loaded from, indexed
    /// exactly the way `gal_core::Constant::Closure`'s `PrototypeIndex`
    /// is — a chunk-global table, shared across every prototype in the
    /// chunk rather than copied or renumbered per-function.
    pub all_protos: Rc<[NonNull<Proto>]>,
    /// Every string literal in the chunk this prototype was loaded
    /// from, indexed the same way `gal_core::chunk::StringIndex` does —
    /// shared across every prototype in the chunk rather than copied.
    pub strings: Rc<[NonNull<GalString>]>,
}

impl Proto {
    pub fn new(inner: ChunkPrototype, strings: Rc<[NonNull<GalString>]>, white: Mark) -> Proto {
        Proto { header: GcHeader::new(ObjectKind::Prototype, white), inner, all_protos: Rc::from([]), strings }
    }

    pub fn string_at(&self, index: u32) -> NonNull<GalString> {
        self.strings[index as usize]
    }

    pub fn child_at(&self, proto_index: u32) -> NonNull<Proto> {
        self.all_protos[proto_index as usize]
    }
}

unsafe impl GcObject for Proto {
    fn header(&self) -> &GcHeader {
        &self.header
    }
}
