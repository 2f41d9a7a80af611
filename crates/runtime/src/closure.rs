//! Closures (spec §3.6): a script closure pairs a `Proto` with the
//! upvalue pointers `NewClosure`'s trailing `Capture` words resolved;
//! a host closure wraps a Rust function registered through
//! `embedder::register_builtin` (spec §6.3) and carries no upvalues of
//! its own, since a host function captures through its own closure
//! environment instead.

use std::ptr::NonNull;

use gal_core::Value;

use crate::object::{GcHeader, GcObject, Mark, ObjectKind};
use crate::proto::Proto;
use crate::thread::Thread;
use crate::upvalue::Upvalue;
use crate::vm::Vm;

/// A builtin takes the `Vm` (to allocate strings/tables and to recurse
/// back into `interpreter::call_value`) and the thread it was called
/// from (to read its arguments' stack slots, for builtins that need
/// more context than the `&[Value]` slice already gives them).
pub type HostFn = fn(&mut Vm, NonNull<Thread>, &[Value]) -> Result<Vec<Value>, crate::error::RuntimeError>;

pub enum ClosureBody {
    Script { proto: NonNull<Proto>, upvalues: Vec<NonNull<Upvalue>> },
    Host { func: HostFn, name: &'static str },
}

pub struct Closure {
    pub header: GcHeader,
    pub body: ClosureBody,
}

impl Closure {
    pub fn script(proto: NonNull<Proto>, upvalues: Vec<NonNull<Upvalue>>, white: Mark) -> Closure {
        Closure { header: GcHeader::new(ObjectKind::Closure, white), body: ClosureBody::Script { proto, upvalues } }
    }

    pub fn host(func: HostFn, name: &'static str, white: Mark) -> Closure {
        Closure { header: GcHeader::new(ObjectKind::Closure, white), body: ClosureBody::Host { func, name } }
    }
}

unsafe impl GcObject for Closure {
    fn header(&self) -> &GcHeader {
        &self.header
    }
}
