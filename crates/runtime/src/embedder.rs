//! The embedder-facing surface (spec §6.3): everything a host
//! application needs to load a chunk, call into it, drive coroutines,
//! and pace the collector, gathered behind one `Embedder` handle so a
//! CLI or host program never has to reach into `Vm`'s GC internals
//! directly.
//!
//! `new_vm`/`destroy_vm` become `Embedder::new`/`Drop` — Rust's ownership
//! already gives a host the lifetime guarantee those two API calls exist
//! to provide by hand in the original.

use std::ptr::NonNull;

use gal_core::{Chunk, Value};

use crate::closure::{Closure, HostFn};
use crate::error::{RuntimeError, ThreadStatus};
use crate::gc;
use crate::interpreter;
use crate::proto::Proto;
use crate::thread::Thread;
use crate::vm::Vm;

/// Mirrors spec §6.4's exit/error codes for a `call`/`resume` outcome
/// that didn't run to a clean `Ok`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("thread is not in a resumable state")]
    NotResumable,
}

/// Owns one `Vm` plus its builtins, wired up and ready for `load`/`call`.
pub struct Embedder {
    pub vm: Vm,
}

impl Embedder {
    pub fn new_vm() -> Embedder {
        let mut vm = Vm::new();
        crate::builtins::install(&mut vm);
        Embedder { vm }
    }

    /// Loads a compiled chunk's prototypes and wraps the main one in a
    /// callable closure, ready for `call`.
    pub fn load(&mut self, chunk: Chunk) -> NonNull<Closure> {
        let proto = self.vm.load_chunk(chunk);
        self.wrap_script(proto)
    }

    fn wrap_script(&mut self, proto: NonNull<Proto>) -> NonNull<Closure> {
        let white = self.vm.collector.current_white;
        let closure = Closure::script(proto, Vec::new(), white);
        let ptr = unsafe { gc::alloc_object(&mut self.vm.allocator, closure) };
        unsafe { self.vm.collector.register(ptr) };
        ptr
    }

    /// Calls `closure` with `args` on the VM's root thread, running it
    /// to completion (or to the first runtime error).
    pub fn call(&mut self, closure: NonNull<Closure>, args: &[Value]) -> Result<Vec<Value>, CallError> {
        let thread = self.vm.root_thread;
        let callee = Value::from_object_ptr(closure.as_ptr() as *mut ());
        let result = interpreter::call_value(&mut self.vm, thread, callee, args);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "call raised a runtime error");
        }
        Ok(result?)
    }

    pub fn new_thread(&mut self) -> NonNull<Thread> {
        self.vm.new_thread()
    }

    /// Resumes `thread` (spec §5/§9). A freshly created thread (no
    /// frames yet, nothing pending) must be given `closure` to start
    /// with `args` as its call arguments, unless it was created by the
    /// `spawn` builtin, which already attached one. A thread previously
    /// suspended — by `yield` or by a `transfer` landing on it earlier —
    /// ignores `closure` and instead delivers `args` as that suspended
    /// call's result, continuing from right after it. If the thread (or
    /// one it `transfer`s to) suspends again via `transfer`, this call
    /// keeps driving whichever thread now has control rather than
    /// returning early — a `transfer` chain is invisible to the
    /// embedder, which only ever observes the chain's first `yield` or
    /// its final return. A thread that merely handed control off via
    /// `transfer` (rather than yielding to the embedder) reports status
    /// `Ok`, not `Yield`, since nothing outside the chain is waiting on
    /// it specifically. Returns the next `yield`'s arguments, or the
    /// final return values once the chain completes.
    pub fn resume(
        &mut self,
        thread: NonNull<Thread>,
        closure: Option<NonNull<Closure>>,
        args: &[Value],
    ) -> Result<Vec<Value>, CallError> {
        let mut thread = thread;
        let mut closure = closure;
        let mut args = args.to_vec();
        loop {
            let status = self.vm.status(thread);
            if status.is_error() || status == ThreadStatus::Breakpoint {
                return Err(CallError::NotResumable);
            }
            let pending = unsafe { thread.as_ref() }.pending_resume;
            let outcome = if let Some((result_base, nresults_wanted)) = pending {
                unsafe { &mut *thread.as_ptr() }.pending_resume = None;
                unsafe { &mut *thread.as_ptr() }.status = ThreadStatus::Ok;
                interpreter::write_results(thread, result_base, nresults_wanted, &args);
                let stop_depth = unsafe { thread.as_ref() }.call_stack.len().saturating_sub(1);
                interpreter::run_outcome(&mut self.vm, thread, stop_depth)?
            } else {
                let start = unsafe { &mut *thread.as_ptr() }.pending_start.take().or(closure);
                let start = start.ok_or(CallError::NotResumable)?;
                let callee = Value::from_object_ptr(start.as_ptr() as *mut ());
                let base = unsafe { thread.as_ref() }.stack.len();
                unsafe { &mut *thread.as_ptr() }.ensure_stack(base + args.len());
                for (i, a) in args.iter().enumerate() {
                    unsafe { &mut *thread.as_ptr() }.stack[base + i] = *a;
                }
                let closure_ptr = interpreter::resolve_callable(thread, callee)?;
                interpreter::push_call(thread, closure_ptr, base, args.len(), base, 1)?;
                interpreter::run_outcome(&mut self.vm, thread, 0)?
            };
            match outcome {
                interpreter::RunResult::Returned(values) | interpreter::RunResult::Yielded(values) => {
                    return Ok(values);
                }
                interpreter::RunResult::Transferred(target, values) => {
                    // This thread is parked, not yielded to us — nothing
                    // outside the chain is waiting on it by name, so it
                    // reads back as `Ok` until something transfers or
                    // resumes into it again.
                    unsafe { &mut *thread.as_ptr() }.status = ThreadStatus::Ok;
                    thread = target;
                    args = values;
                    closure = None;
                }
            }
        }
    }

    pub fn gc_step(&mut self, budget: usize) {
        self.vm.gc_step(budget);
    }

    pub fn gc_full(&mut self) {
        self.vm.gc_full();
    }

    pub fn register_builtin(&mut self, name: &'static str, func: HostFn) {
        let closure = self.vm.new_host_closure(func, name);
        let key = self.vm.intern_value(name.as_bytes());
        let value = Value::from_object_ptr(closure.as_ptr() as *mut ());
        unsafe { self.vm.globals.as_mut().set(key, value) };
    }

    pub fn set_interrupt_callback(&mut self, f: fn(&mut Vm) -> bool) {
        self.vm.callbacks.interrupt = Some(f);
    }

    pub fn set_panic_callback(&mut self, f: fn(&mut Vm, &RuntimeError)) {
        self.vm.callbacks.panic = Some(f);
    }

    pub fn status(&self, thread: NonNull<Thread>) -> ThreadStatus {
        self.vm.status(thread)
    }
}

impl Default for Embedder {
    fn default() -> Embedder {
        Embedder::new_vm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_call_runs_a_chunk_to_completion() {
        let mut embedder = Embedder::new_vm();
        let chunk = gal_compiler::compile(b"return 40 + 2", None).expect("compiles");
        let closure = embedder.load(chunk);
        let results = embedder.call(closure, &[]).expect("runs");
        assert_eq!(results[0].as_number(), Some(42.0));
    }

    #[test]
    fn yield_suspends_and_resume_continues_with_new_arguments() {
        let mut embedder = Embedder::new_vm();
        let chunk = gal_compiler::compile(b"local a = yield(1)\nreturn a + 100", None).expect("compiles");
        let closure = embedder.load(chunk);
        let thread = embedder.new_thread();
        let first = embedder.resume(thread, Some(closure), &[]).expect("yields");
        assert_eq!(first[0].as_number(), Some(1.0));
        assert_eq!(embedder.status(thread), ThreadStatus::Yield);
        let second = embedder.resume(thread, None, &[Value::from_number(41.0)]).expect("completes");
        assert_eq!(second[0].as_number(), Some(141.0));
    }

    #[test]
    fn transfer_switches_symmetrically_between_two_coroutines() {
        let mut embedder = Embedder::new_vm();
        let thread_a = embedder.new_thread();
        let thread_a_value = Value::from_object_ptr(thread_a.as_ptr() as *mut ());

        // B's body closes over `a_thread` as an upvalue, since the only
        // argument `transfer` ever delivers to a freshly started thread
        // is the payload — it never tells the target who transferred in.
        let chunk_b = gal_compiler::compile(
            b"function make_b(a_thread)\n  return function(payload)\n    local got = transfer(a_thread, 2)\n    return got\n  end\nend\nreturn make_b",
            None,
        )
        .expect("compiles");
        let main_b = embedder.load(chunk_b);
        let make_b = embedder.call(main_b, &[]).expect("defines make_b")[0];
        let b_body = embedder.call(
            unsafe { NonNull::new_unchecked(make_b.as_object_ptr().unwrap() as *mut Closure) },
            &[thread_a_value],
        )
        .expect("builds b's body")[0];

        let spawn_key = embedder.vm.intern_value(b"spawn");
        let spawn_value = unsafe { embedder.vm.globals.as_ref().get(spawn_key) };
        let spawned =
            interpreter::call_value(&mut embedder.vm, thread_a, spawn_value, &[b_body]).expect("spawns thread b");
        let thread_b = unsafe { NonNull::new_unchecked(spawned[0].as_object_ptr().unwrap() as *mut Thread) };
        let thread_b_value = spawned[0];

        let chunk_a = gal_compiler::compile(
            b"function body(b_thread)\n  local got = transfer(b_thread, 1)\n  return got\nend\nreturn body",
            None,
        )
        .expect("compiles");
        let main_a = embedder.load(chunk_a);
        let closure_a = embedder.call(main_a, &[]).expect("defines body")[0];
        let closure_a = unsafe { NonNull::new_unchecked(closure_a.as_object_ptr().unwrap() as *mut Closure) };

        let result = embedder.resume(thread_a, Some(closure_a), &[thread_b_value]).expect("chain completes");
        assert_eq!(result[0].as_number(), Some(2.0));
        assert_eq!(embedder.status(thread_a), ThreadStatus::Ok);
        assert_eq!(embedder.status(thread_b), ThreadStatus::Ok);
    }

    #[test]
    fn register_builtin_is_visible_to_loaded_code() {
        fn double(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
            Ok(vec![Value::from_number(args[0].as_number().unwrap_or(0.0) * 2.0)])
        }
        let mut embedder = Embedder::new_vm();
        embedder.register_builtin("double", double);
        let chunk = gal_compiler::compile(b"return double(21)", None).expect("compiles");
        let closure = embedder.load(chunk);
        let results = embedder.call(closure, &[]).expect("runs");
        assert_eq!(results[0].as_number(), Some(42.0));
    }
}
