//! The supplemental builtin subset (spec §4.10): `assert`, `math.*`,
//! `bits.*`, `typeof`, `string.sub`, `raw_{set,get,equal}`,
//! `table.{insert,unpack}`, and `vector`. The original fastcall table
//! names dozens more (`bootstrap_stl.hpp`/`bootstrap_library.hpp`); the
//! rest is user-level standard library and stays out of scope.
//!
//! Each entry is installed as an ordinary host `Closure` in `vm.globals`
//! (or a namespace table reachable from it) so a call survives even if
//! the name gets shadowed or rebound — the regular `Call` dispatch in
//! `interpreter::dispatch_call` always works. `fastcall_host_fn` below
//! maps the subset the compiler recognizes at known call sites back to
//! these same functions, so `interpreter::dispatch`'s `FastCall*` arms
//! have exactly one implementation of each builtin to call, not two.

use std::ptr::NonNull;

use gal_core::{FastcallBuiltin, Value};

use crate::closure::HostFn;
use crate::equality::value_str;
use crate::error::{RuntimeError, ThreadStatus};
use crate::interpreter::type_name;
use crate::object::GcObject;
use crate::table::Table;
use crate::thread::Thread;
use crate::vm::Vm;

/// Maps a fastcall id to the same host function `install` wires up under
/// its global/namespaced name (spec §4.9). Keeping one function per
/// builtin, rather than duplicating logic inline in the interpreter's
/// dispatch loop, is what lets a rejected fastcall fall through to the
/// ordinary `Call` that follows it and get identical behavior.
pub(crate) fn fastcall_host_fn(builtin: FastcallBuiltin) -> HostFn {
    use FastcallBuiltin::*;
    match builtin {
        Assert => assert_fn,
        Typeof => typeof_fn,
        RawGet => raw_get,
        RawSet => raw_set,
        RawEqual => raw_equal,
        Vector => vector_fn,
        MathAbs => math_abs,
        MathFloor => math_floor,
        MathCeil => math_ceil,
        MathSqrt => math_sqrt,
        MathMin => math_min,
        MathMax => math_max,
        BitsBand => bits_band,
        BitsBor => bits_bor,
        BitsBxor => bits_bxor,
        BitsBnot => bits_bnot,
        BitsLshift => bits_lshift,
        BitsRshift => bits_rshift,
        StringSub => string_sub,
        TableInsert => table_insert,
        TableUnpack => table_unpack,
    }
}

/// Same backward write barrier `interpreter.rs` applies after every
/// table write (spec §4.4) — builtins that mutate a caller-supplied
/// table need it too, since that table may already be black.
fn barrier_table(vm: &mut Vm, table: NonNull<Table>) {
    let header = NonNull::from(unsafe { table.as_ref() }.header());
    unsafe { vm.collector.barrier_back(header) };
}

fn bad_argument(function: &'static str, index: u32, expected: &'static str, got: Value) -> RuntimeError {
    RuntimeError::BadArgument { function, index, expected, got: type_name(got) }
}

fn require_number(function: &'static str, index: u32, v: Value) -> Result<f64, RuntimeError> {
    v.as_number().ok_or_else(|| bad_argument(function, index, "number", v))
}

fn require_table(function: &'static str, index: u32, v: Value) -> Result<NonNull<crate::table::Table>, RuntimeError> {
    let ptr = v.as_object_ptr().ok_or_else(|| bad_argument(function, index, "table", v))?;
    let header = unsafe { &*(ptr as *const crate::object::GcHeader) };
    if header.kind != crate::object::ObjectKind::Table {
        return Err(bad_argument(function, index, "table", v));
    }
    Ok(unsafe { NonNull::new_unchecked(ptr as *mut crate::table::Table) })
}

fn require_closure(function: &'static str, index: u32, v: Value) -> Result<NonNull<crate::closure::Closure>, RuntimeError> {
    let ptr = v.as_object_ptr().ok_or_else(|| bad_argument(function, index, "function", v))?;
    let header = unsafe { &*(ptr as *const crate::object::GcHeader) };
    if header.kind != crate::object::ObjectKind::Closure {
        return Err(bad_argument(function, index, "function", v));
    }
    Ok(unsafe { NonNull::new_unchecked(ptr as *mut crate::closure::Closure) })
}

fn require_thread(function: &'static str, index: u32, v: Value) -> Result<NonNull<Thread>, RuntimeError> {
    let ptr = v.as_object_ptr().ok_or_else(|| bad_argument(function, index, "thread", v))?;
    let header = unsafe { &*(ptr as *const crate::object::GcHeader) };
    if header.kind != crate::object::ObjectKind::Thread {
        return Err(bad_argument(function, index, "thread", v));
    }
    Ok(unsafe { NonNull::new_unchecked(ptr as *mut Thread) })
}

fn install_fn(vm: &mut Vm, table: Option<NonNull<crate::table::Table>>, name: &'static str, f: crate::closure::HostFn) {
    let closure = vm.new_host_closure(f, name);
    let key = vm.intern_value(name.as_bytes());
    let value = Value::from_object_ptr(closure.as_ptr() as *mut ());
    match table {
        Some(mut t) => unsafe { t.as_mut().set(key, value) },
        None => unsafe { vm.globals.as_mut().set(key, value) },
    }
}

fn new_namespace(vm: &mut Vm, name: &'static str) -> NonNull<crate::table::Table> {
    let table = vm.new_table();
    let key = vm.intern_value(name.as_bytes());
    let value = Value::from_object_ptr(table.as_ptr() as *mut ());
    unsafe { vm.globals.as_mut().set(key, value) };
    table
}

/// Installs every builtin this interpreter carries into a freshly
/// created `Vm`'s global table. Called once from `embedder::new_vm`.
pub fn install(vm: &mut Vm) {
    install_fn(vm, None, "assert", assert_fn);
    install_fn(vm, None, "typeof", typeof_fn);
    install_fn(vm, None, "raw_get", raw_get);
    install_fn(vm, None, "raw_set", raw_set);
    install_fn(vm, None, "raw_equal", raw_equal);
    install_fn(vm, None, "vector", vector_fn);
    install_fn(vm, None, "yield", yield_fn);
    install_fn(vm, None, "spawn", spawn_fn);
    install_fn(vm, None, "transfer", transfer_fn);

    let math = new_namespace(vm, "math");
    install_fn(vm, Some(math), "abs", math_abs);
    install_fn(vm, Some(math), "floor", math_floor);
    install_fn(vm, Some(math), "ceil", math_ceil);
    install_fn(vm, Some(math), "sqrt", math_sqrt);
    install_fn(vm, Some(math), "min", math_min);
    install_fn(vm, Some(math), "max", math_max);

    let bits = new_namespace(vm, "bits");
    install_fn(vm, Some(bits), "band", bits_band);
    install_fn(vm, Some(bits), "bor", bits_bor);
    install_fn(vm, Some(bits), "bxor", bits_bxor);
    install_fn(vm, Some(bits), "bnot", bits_bnot);
    install_fn(vm, Some(bits), "lshift", bits_lshift);
    install_fn(vm, Some(bits), "rshift", bits_rshift);

    let string = new_namespace(vm, "string");
    install_fn(vm, Some(string), "sub", string_sub);

    let table = new_namespace(vm, "table");
    install_fn(vm, Some(table), "insert", table_insert);
    install_fn(vm, Some(table), "unpack", table_unpack);
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::NULL)
}

fn assert_fn(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let v = arg(args, 0);
    if v.is_truthy() {
        Ok(args.to_vec())
    } else {
        let msg = match unsafe { value_str(arg(args, 1)) } {
            Some(s) => s.to_string(),
            None => "assertion failed!".to_string(),
        };
        Err(RuntimeError::Custom(msg))
    }
}

fn typeof_fn(vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    Ok(vec![vm.intern_value(type_name(arg(args, 0)).as_bytes())])
}

fn raw_get(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let table = require_table("raw_get", 1, arg(args, 0))?;
    Ok(vec![unsafe { table.as_ref().get(arg(args, 1)) }])
}

fn raw_set(vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let mut table = require_table("raw_set", 1, arg(args, 0))?;
    unsafe { table.as_mut().set(arg(args, 1), arg(args, 2)) };
    barrier_table(vm, table);
    Ok(vec![arg(args, 0)])
}

fn raw_equal(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    Ok(vec![Value::from_bool(arg(args, 0).raw_eq(arg(args, 1)))])
}

/// `vector(x, y, z)`: a fixed 3-field table tagged with a `"vector"`
/// metatable-free shape — a plain table with numeric keys `1..3`, not a
/// distinct GC object kind (spec §4.10 lists it alongside the other
/// fastcalls without carving out new storage for it).
fn vector_fn(vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let x = require_number("vector", 1, arg(args, 0))?;
    let y = require_number("vector", 2, arg(args, 1))?;
    let z = require_number("vector", 3, arg(args, 2))?;
    let mut table = vm.new_table();
    unsafe {
        table.as_mut().insert_list(0, Value::from_number(x));
        table.as_mut().insert_list(1, Value::from_number(y));
        table.as_mut().insert_list(2, Value::from_number(z));
    }
    Ok(vec![Value::from_object_ptr(table.as_ptr() as *mut ())])
}

/// Suspends the thread it runs on (spec §4.10, §5): marks `thread`
/// `Yield`-status and hands its arguments back up to `interpreter::run`,
/// which stops immediately rather than continuing to the next
/// instruction. The next `resume` on this thread resumes right after
/// the call site, with the resume's own arguments landing there instead
/// of these.
fn yield_fn(_vm: &mut Vm, thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    unsafe { &mut *thread.as_ptr() }.status = ThreadStatus::Yield;
    Ok(args.to_vec())
}

/// `spawn(closure)`: allocates a child thread (spec §4.10's `new_thread`)
/// and remembers `closure` as the call it runs the first time something
/// resumes or transfers into it, since a bare thread has no frame yet.
fn spawn_fn(vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let closure = require_closure("spawn", 1, arg(args, 0))?;
    let child = vm.new_thread();
    unsafe { &mut *child.as_ptr() }.pending_start = Some(closure);
    Ok(vec![Value::from_object_ptr(child.as_ptr() as *mut ())])
}

/// Symmetric coroutine switch (spec §4.10): suspends the calling thread,
/// exactly like `yield`, but names the thread that should run next
/// instead of handing control back to whoever resumed this one. No
/// resumer link is recorded — `other` does not automatically return here
/// when it next yields, only when something (this thread or a third
/// party) transfers back to it explicitly.
fn transfer_fn(_vm: &mut Vm, thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let target = require_thread("transfer", 1, arg(args, 0))?;
    unsafe { &mut *thread.as_ptr() }.pending_transfer_target = Some(target);
    unsafe { &mut *thread.as_ptr() }.status = ThreadStatus::Yield;
    Ok(args.get(1..).unwrap_or(&[]).to_vec())
}

fn math_abs(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    Ok(vec![Value::from_number(require_number("math.abs", 1, arg(args, 0))?.abs())])
}

fn math_floor(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    Ok(vec![Value::from_number(require_number("math.floor", 1, arg(args, 0))?.floor())])
}

fn math_ceil(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    Ok(vec![Value::from_number(require_number("math.ceil", 1, arg(args, 0))?.ceil())])
}

fn math_sqrt(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    Ok(vec![Value::from_number(require_number("math.sqrt", 1, arg(args, 0))?.sqrt())])
}

fn math_min(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("math.min", 1, arg(args, 0))?;
    let b = require_number("math.min", 2, arg(args, 1))?;
    Ok(vec![Value::from_number(a.min(b))])
}

fn math_max(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("math.max", 1, arg(args, 0))?;
    let b = require_number("math.max", 2, arg(args, 1))?;
    Ok(vec![Value::from_number(a.max(b))])
}

fn bits_band(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("bits.band", 1, arg(args, 0))? as i64;
    let b = require_number("bits.band", 2, arg(args, 1))? as i64;
    Ok(vec![Value::from_number((a & b) as f64)])
}

fn bits_bor(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("bits.bor", 1, arg(args, 0))? as i64;
    let b = require_number("bits.bor", 2, arg(args, 1))? as i64;
    Ok(vec![Value::from_number((a | b) as f64)])
}

fn bits_bxor(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("bits.bxor", 1, arg(args, 0))? as i64;
    let b = require_number("bits.bxor", 2, arg(args, 1))? as i64;
    Ok(vec![Value::from_number((a ^ b) as f64)])
}

fn bits_bnot(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("bits.bnot", 1, arg(args, 0))? as i64;
    Ok(vec![Value::from_number((!a) as f64)])
}

fn bits_lshift(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("bits.lshift", 1, arg(args, 0))? as i64;
    let b = require_number("bits.lshift", 2, arg(args, 1))? as i64;
    Ok(vec![Value::from_number((a << b) as f64)])
}

fn bits_rshift(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let a = require_number("bits.rshift", 1, arg(args, 0))? as i64;
    let b = require_number("bits.rshift", 2, arg(args, 1))? as i64;
    Ok(vec![Value::from_number((a >> b) as f64)])
}

/// 1-based, inclusive, Lua-style: negative indices count from the end.
fn string_sub(vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let s = unsafe { value_str(arg(args, 0)) }.ok_or_else(|| bad_argument("string.sub", 1, "string", arg(args, 0)))?;
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let resolve = |n: i64| -> i64 {
        if n < 0 { (len + n + 1).max(1) } else if n == 0 { 1 } else { n }
    };
    let i = resolve(require_number("string.sub", 2, arg(args, 1))? as i64);
    let j_arg = arg(args, 2);
    let j = if j_arg.is_null() { len } else { resolve(require_number("string.sub", 3, j_arg)? as i64) }.min(len);
    if i > j || i > len {
        return Ok(vec![vm.intern_value(b"")]);
    }
    let slice: String = chars[(i - 1) as usize..j as usize].iter().collect();
    Ok(vec![vm.intern_value(slice.as_bytes())])
}

fn table_insert(vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let mut table = require_table("table.insert", 1, arg(args, 0))?;
    if args.len() >= 3 {
        let index = require_number("table.insert", 2, arg(args, 1))? as usize;
        unsafe { table.as_mut().insert_list(index.saturating_sub(1), arg(args, 2)) };
    } else {
        let len = unsafe { table.as_ref().len() };
        unsafe { table.as_mut().insert_list(len, arg(args, 1)) };
    }
    barrier_table(vm, table);
    Ok(Vec::new())
}

fn table_unpack(_vm: &mut Vm, _thread: NonNull<Thread>, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    let table = require_table("table.unpack", 1, arg(args, 0))?;
    let len = unsafe { table.as_ref().len() };
    let mut out = Vec::with_capacity(len);
    for i in 1..=len {
        out.push(unsafe { table.as_ref().get(Value::from_number(i as f64)) });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_passes_through_truthy_arguments() {
        let mut vm = Vm::new();
        let thread = vm.root_thread;
        let result = assert_fn(&mut vm, thread, &[Value::from_bool(true), Value::NULL]).unwrap();
        assert_eq!(result[0].as_bool(), Some(true));
    }

    #[test]
    fn assert_fails_on_falsy_with_custom_message() {
        let mut vm = Vm::new();
        let thread = vm.root_thread;
        let msg = vm.intern_value(b"boom");
        let err = assert_fn(&mut vm, thread, &[Value::FALSE, msg]).unwrap_err();
        assert_eq!(err, RuntimeError::Custom("boom".to_string()));
    }

    #[test]
    fn string_sub_handles_negative_indices() {
        let mut vm = Vm::new();
        let thread = vm.root_thread;
        let s = vm.intern_value(b"hello world");
        let result = string_sub(&mut vm, thread, &[s, Value::from_number(-5.0), Value::NULL]).unwrap();
        assert_eq!(unsafe { value_str(result[0]) }, Some("world"));
    }

    #[test]
    fn table_insert_and_unpack_roundtrip() {
        let mut vm = Vm::new();
        let thread = vm.root_thread;
        let table = vm.new_table();
        let table_val = Value::from_object_ptr(table.as_ptr() as *mut ());
        table_insert(&mut vm, thread, &[table_val, Value::from_number(1.0)]).unwrap();
        table_insert(&mut vm, thread, &[table_val, Value::from_number(2.0)]).unwrap();
        let unpacked = table_unpack(&mut vm, thread, &[table_val]).unwrap();
        assert_eq!(unpacked.len(), 2);
        assert_eq!(unpacked[0].as_number(), Some(1.0));
    }
}
