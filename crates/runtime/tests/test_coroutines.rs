//! End-to-end coroutine behavior compiled from GAL source and driven
//! through `Embedder` (spec §5, §8 scenario 6): `yield`/`resume` and
//! `spawn`/`transfer` are plain global functions, not a separate API,
//! so these tests exercise them the way a host embedding GAL actually
//! would — compile a chunk, load it, resume a thread.

use gal_core::Value;
use gal_runtime::embedder::Embedder;
use gal_runtime::{Closure, ThreadStatus};
use std::ptr::NonNull;

#[test]
fn yield_resume_roundtrip_through_compiled_source() {
    let mut embedder = Embedder::new_vm();
    let chunk = gal_compiler::compile(
        b"function body()\n  local first = yield(1)\n  local second = yield(first + 1)\n  return second * 2\nend\nreturn body",
        None,
    )
    .expect("compiles");
    let main = embedder.load(chunk);
    let body = embedder.call(main, &[]).expect("defines body")[0];
    let body = unsafe { NonNull::new_unchecked(body.as_object_ptr().unwrap() as *mut Closure) };

    let thread = embedder.new_thread();
    let a = embedder.resume(thread, Some(body), &[]).expect("first yield");
    assert_eq!(a[0].as_number(), Some(1.0));
    assert_eq!(embedder.status(thread), ThreadStatus::Yield);

    let b = embedder.resume(thread, None, &[Value::from_number(9.0)]).expect("second yield");
    assert_eq!(b[0].as_number(), Some(10.0));
    assert_eq!(embedder.status(thread), ThreadStatus::Yield);

    let c = embedder.resume(thread, None, &[Value::from_number(5.0)]).expect("final return");
    assert_eq!(c[0].as_number(), Some(10.0));
    assert_eq!(embedder.status(thread), ThreadStatus::Ok);
}

#[test]
fn spawned_thread_runs_its_closure_on_first_resume() {
    let mut embedder = Embedder::new_vm();
    let chunk = gal_compiler::compile(b"function worker(x)\n  return x + 1\nend\nreturn worker", None).expect("compiles");
    let main = embedder.load(chunk);
    let worker = embedder.call(main, &[]).expect("defines worker")[0];

    let spawn_key = embedder.vm.intern_value(b"spawn");
    let spawn_value = unsafe { embedder.vm.globals.as_ref().get(spawn_key) };
    let root = embedder.vm.root_thread;
    let spawned = gal_runtime::interpreter::call_value(&mut embedder.vm, root, spawn_value, &[worker])
        .expect("spawns a thread");
    let child = unsafe { NonNull::new_unchecked(spawned[0].as_object_ptr().unwrap() as *mut gal_runtime::Thread) };

    let result = embedder.resume(child, None, &[Value::from_number(41.0)]).expect("runs the spawned closure");
    assert_eq!(result[0].as_number(), Some(42.0));
    assert_eq!(embedder.status(child), ThreadStatus::Ok);
}

#[test]
fn transfer_chain_of_three_threads_returns_to_the_embedders_caller_only_once() {
    // A -> transfer(B) -> transfer(C) -> returns, and the embedder never
    // sees control until the whole chain bottoms out.
    let mut embedder = Embedder::new_vm();

    let chunk_c = gal_compiler::compile(b"function body(payload)\n  return payload + 1\nend\nreturn body", None)
        .expect("compiles");
    let main_c = embedder.load(chunk_c);
    let closure_c = embedder.call(main_c, &[]).expect("defines c")[0];

    let chunk_b = gal_compiler::compile(
        b"function make_b(c_thread)\n  return function(payload)\n    return transfer(c_thread, payload)\n  end\nend\nreturn make_b",
        None,
    )
    .expect("compiles");
    let main_b = embedder.load(chunk_b);
    let make_b = embedder.call(main_b, &[]).expect("defines make_b")[0];
    let make_b = unsafe { NonNull::new_unchecked(make_b.as_object_ptr().unwrap() as *mut Closure) };

    let spawn_key = embedder.vm.intern_value(b"spawn");
    let spawn_value = unsafe { embedder.vm.globals.as_ref().get(spawn_key) };
    let root = embedder.vm.root_thread;
    let spawned_c = gal_runtime::interpreter::call_value(&mut embedder.vm, root, spawn_value, &[closure_c])
        .expect("spawns c");
    let thread_c_value = spawned_c[0];

    let b_body = embedder.call(make_b, &[thread_c_value]).expect("builds b's body")[0];
    let spawned_b =
        gal_runtime::interpreter::call_value(&mut embedder.vm, root, spawn_value, &[b_body]).expect("spawns b");
    let thread_b_value = spawned_b[0];
    let thread_b = unsafe { NonNull::new_unchecked(thread_b_value.as_object_ptr().unwrap() as *mut gal_runtime::Thread) };
    let thread_c = unsafe { NonNull::new_unchecked(thread_c_value.as_object_ptr().unwrap() as *mut gal_runtime::Thread) };

    let chunk_a = gal_compiler::compile(
        b"function body(b_thread)\n  return transfer(b_thread, 41)\nend\nreturn body",
        None,
    )
    .expect("compiles");
    let main_a = embedder.load(chunk_a);
    let closure_a = embedder.call(main_a, &[]).expect("defines a")[0];
    let closure_a = unsafe { NonNull::new_unchecked(closure_a.as_object_ptr().unwrap() as *mut Closure) };
    let thread_a = embedder.new_thread();

    let result = embedder.resume(thread_a, Some(closure_a), &[thread_b_value]).expect("chain completes");
    assert_eq!(result[0].as_number(), Some(42.0));
    assert_eq!(embedder.status(thread_a), ThreadStatus::Ok);
    assert_eq!(embedder.status(thread_b), ThreadStatus::Ok);
    assert_eq!(embedder.status(thread_c), ThreadStatus::Ok);
}
