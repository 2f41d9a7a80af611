//! Upvalues (spec §3.7): while open, a shared reference to a slot still
//! on some thread's stack; once that stack frame returns or the slot's
//! block ends (`CloseUpvalues`), the value is copied out and the
//! upvalue becomes closed, independent of the stack it came from.
//!
//! Every thread keeps its open upvalues in one singly linked list
//! sorted by descending stack slot so `close_upvalues_from` can walk a
//! prefix and stop at the first slot below the cutoff.

use std::ptr::NonNull;

use gal_core::Value;

use crate::object::{GcHeader, GcObject, Mark, ObjectKind};

pub enum UpvalueState {
    Open { stack_slot: usize },
    Closed(Value),
}

pub struct Upvalue {
    pub header: GcHeader,
    pub state: UpvalueState,
    pub next_open: Option<NonNull<Upvalue>>,
}

impl Upvalue {
    pub fn open(stack_slot: usize, white: Mark) -> Upvalue {
        Upvalue {
            header: GcHeader::new(ObjectKind::Upvalue, white),
            state: UpvalueState::Open { stack_slot },
            next_open: None,
        }
    }

    /// An upvalue that never referenced a stack slot, used for
    /// `CaptureKind::Value` (capture-by-value at closure-creation time).
    pub fn closed(value: Value, white: Mark) -> Upvalue {
        Upvalue { header: GcHeader::new(ObjectKind::Upvalue, white), state: UpvalueState::Closed(value), next_open: None }
    }

    pub fn is_open_at(&self, slot: usize) -> bool {
        matches!(self.state, UpvalueState::Open { stack_slot } if stack_slot == slot)
    }

    /// Copies `value` in and severs the link to the stack.
    pub fn close(&mut self, value: Value) {
        self.state = UpvalueState::Closed(value);
    }
}

unsafe impl GcObject for Upvalue {
    fn header(&self) -> &GcHeader {
        &self.header
    }
}
