//! A thread (spec §3.8): one register stack plus one call-info stack.
//! Every GAL coroutine, including the VM's root thread, is a `Thread`;
//! `resume`/`yield`/`transfer` just swap which one the interpreter loop
//! is currently driving (spec §5, §9) rather than anything scheduler-like
//! — there is no green-thread runtime underneath this.

use std::ptr::NonNull;

use gal_core::Value;

use crate::closure::Closure;
use crate::error::ThreadStatus;
use crate::object::{GcHeader, GcObject, Mark, ObjectKind};
use crate::upvalue::Upvalue;

/// One activation record: which closure is running, where its register
/// window starts in the shared value stack, and where to resume
/// decoding.
pub struct CallInfo {
    pub closure: NonNull<Closure>,
    pub base: usize,
    pub pc: usize,
    /// Extra arguments past `num_params`, stashed here for `LoadVarargs`
    /// rather than left mixed into the register window.
    pub varargs: Vec<Value>,
    /// Absolute stack slot (in the *caller's* frame) where this call's
    /// first return value belongs, and how many the caller's `Call`
    /// instruction asked for.
    pub result_base: usize,
    pub nresults_wanted: u8,
}

pub struct Thread {
    pub header: GcHeader,
    pub stack: Vec<Value>,
    pub call_stack: Vec<CallInfo>,
    pub status: ThreadStatus,
    /// Head of this thread's open-upvalue list, kept sorted by
    /// descending stack slot (spec §3.7).
    pub open_upvalues: Option<NonNull<Upvalue>>,
    pub resumer: Option<NonNull<Thread>>,
    pub single_step: bool,
    /// Set by the `yield` builtin just before it returns: the window
    /// (in this thread's own stack) where the *next* `resume`'s
    /// arguments belong, once one arrives. Only meaningful while
    /// `status == ThreadStatus::Yield`.
    pub pending_resume: Option<(usize, u8)>,
    /// Set by the `transfer` builtin just before it returns: the thread
    /// to switch to next, instead of handing control back to whatever
    /// drove this thread. Consumed by `Embedder`'s resume/transfer loop,
    /// never left set once that loop has acted on it.
    pub pending_transfer_target: Option<NonNull<Thread>>,
    /// Set by `spawn`: the closure a freshly created thread runs the
    /// first time it is resumed or transferred into, since a bare
    /// `new_thread` has no call frame of its own yet.
    pub pending_start: Option<NonNull<Closure>>,
}

impl Thread {
    pub fn new(white: Mark) -> Thread {
        Thread {
            header: GcHeader::new(ObjectKind::Thread, white),
            stack: Vec::with_capacity(64),
            call_stack: Vec::new(),
            status: ThreadStatus::Ok,
            open_upvalues: None,
            resumer: None,
            single_step: false,
            pending_resume: None,
            pending_transfer_target: None,
            pending_start: None,
        }
    }

    pub fn ensure_stack(&mut self, top: usize) {
        if self.stack.len() < top {
            self.stack.resize(top, Value::NULL);
        }
    }

    pub fn current_frame(&self) -> Option<&CallInfo> {
        self.call_stack.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut CallInfo> {
        self.call_stack.last_mut()
    }

    /// Finds (without unlinking) the open upvalue for `slot`, if one
    /// already exists — `Capture::Reference` must share the same
    /// `Upvalue` object as any sibling closure capturing the same local.
    pub fn find_open_upvalue(&self, slot: usize) -> Option<NonNull<Upvalue>> {
        let mut cur = self.open_upvalues;
        while let Some(uv) = cur {
            // SAFETY: every node in this list is a live, still-open upvalue.
            let uv_ref = unsafe { uv.as_ref() };
            if uv_ref.is_open_at(slot) {
                return Some(uv);
            }
            cur = uv_ref.next_open;
        }
        None
    }
}

unsafe impl GcObject for Thread {
    fn header(&self) -> &GcHeader {
        &self.header
    }
}
