//! The decode-dispatch loop (spec §4.10): one `Thread`'s call-info stack
//! drives execution so a `coroutine.yield` deep in a call chain can
//! suspend without unwinding anything — `run` just returns, leaving
//! every pending frame's `pc`/`base` sitting in `thread.call_stack`
//! for the next `resume` to pick back up.
//!
//! Every register access below goes through `reg`/`set_reg`, which take
//! the thread by `NonNull` and re-dereference on each call rather than
//! threading a long-lived `&mut Thread` through instruction handlers —
//! several handlers (table indexing, arithmetic, calls) can reenter this
//! module through a tagged method and push/pop `thread.call_stack` along
//! the way, which would invalidate a borrow taken before the reentrant
//! call.

use std::ptr::NonNull;

use gal_core::{CaptureKind, Opcode, Operands, TaggedMethod, Value};

use crate::closure::{Closure, ClosureBody};
use crate::equality::{value_str, values_equal};
use crate::error::{RuntimeError, ThreadStatus};
use crate::gc;
use crate::object::{GcObject, ObjectKind};
use crate::proto::Proto;
use crate::table::Table;
use crate::thread::{CallInfo, Thread};
use crate::upvalue::{Upvalue, UpvalueState};
use crate::vm::Vm;

fn reg(thread: NonNull<Thread>, base: usize, r: u8) -> Value {
    unsafe { thread.as_ref() }.stack[base + r as usize]
}

fn set_reg(thread: NonNull<Thread>, base: usize, r: u8, v: Value) {
    unsafe { &mut *thread.as_ptr() }.stack[base + r as usize] = v;
}

fn proto_of(closure: &Closure) -> NonNull<Proto> {
    match &closure.body {
        ClosureBody::Script { proto, .. } => *proto,
        ClosureBody::Host { .. } => unreachable!("host closures never get a call frame pushed"),
    }
}

pub(crate) fn type_name(v: Value) -> &'static str {
    if v.is_null() {
        "null"
    } else if v.is_undefined() {
        "undefined"
    } else if v.is_bool() {
        "boolean"
    } else if v.is_number() {
        "number"
    } else {
        // SAFETY: only live values ever reach here.
        match v.as_object_ptr().map(|p| unsafe { &*(p as *const crate::object::GcHeader) }.kind) {
            Some(ObjectKind::String) => "string",
            Some(ObjectKind::Table) => "table",
            Some(ObjectKind::Closure) => "function",
            Some(ObjectKind::Thread) => "thread",
            _ => "userdata",
        }
    }
}

fn tagged_method_for(op: Opcode) -> Option<TaggedMethod> {
    use Opcode::*;
    Some(match op {
        Plus => TaggedMethod::Add,
        Minus => TaggedMethod::Sub,
        Multiply => TaggedMethod::Mul,
        Divide => TaggedMethod::Div,
        Modulus => TaggedMethod::Mod,
        Pow => TaggedMethod::Pow,
        Unm => TaggedMethod::Unm,
        Len => TaggedMethod::Len,
        _ => return None,
    })
}

/// Invokes a host or script closure fully to completion (blocking this
/// call until it returns), for use by tagged-method dispatch and by
/// builtins that need to call back into GAL code.
pub fn call_value(
    vm: &mut Vm,
    thread: NonNull<Thread>,
    callee: Value,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let closure_ptr = resolve_callable(thread, callee)?;
    let closure = unsafe { closure_ptr.as_ref() };
    match &closure.body {
        ClosureBody::Host { func, .. } => {
            let f = *func;
            f(vm, thread, args)
        }
        ClosureBody::Script { .. } => {
            let stop_depth = unsafe { thread.as_ref() }.call_stack.len();
            let base = unsafe { thread.as_ref() }.stack.len();
            unsafe { &mut *thread.as_ptr() }.ensure_stack(base + args.len());
            for (i, a) in args.iter().enumerate() {
                set_reg(thread, base, i as u8, *a);
            }
            push_call(thread, closure_ptr, base, args.len(), base, 1)?;
            run(vm, thread, stop_depth)
        }
    }
}

/// Resolves a callee value down to the closure actually invoked,
/// chasing a table's `__call` tagged method if it isn't a closure.
pub(crate) fn resolve_callable(thread: NonNull<Thread>, callee: Value) -> Result<NonNull<Closure>, RuntimeError> {
    if let Some(ptr) = callee.as_object_ptr() {
        let header = unsafe { &*(ptr as *const crate::object::GcHeader) };
        if header.kind == ObjectKind::Closure {
            return Ok(unsafe { NonNull::new_unchecked(ptr as *mut Closure) });
        }
        if header.kind == ObjectKind::Table {
            let table = unsafe { &*(ptr as *const Table) };
            if let Some(call_fn) = unsafe { table.tagged_method(TaggedMethod::Call) } {
                return resolve_callable(thread, call_fn);
            }
        }
    }
    Err(RuntimeError::CallNonCallable(type_name(callee)))
}

/// Pushes a new call frame onto `thread`, ready for `run` to execute it
/// next.
pub(crate) fn push_call(
    thread: NonNull<Thread>,
    closure: NonNull<Closure>,
    arg_base: usize,
    nargs: usize,
    result_base: usize,
    nresults_wanted: u8,
) -> Result<(), RuntimeError> {
    let proto = unsafe { proto_of(closure.as_ref()).as_ref() };
    let num_params = proto.inner.num_params as usize;
    let max_stack = proto.inner.max_stack_size as usize;
    let frame_base = arg_base;

    let t = unsafe { &mut *thread.as_ptr() };
    let varargs = if proto.inner.is_vararg && nargs > num_params {
        t.stack[frame_base + num_params..frame_base + nargs].to_vec()
    } else {
        Vec::new()
    };
    t.ensure_stack(frame_base + max_stack.max(nargs));
    for i in nargs..num_params {
        t.stack[frame_base + i] = Value::NULL;
    }
    t.call_stack.push(CallInfo { closure, base: frame_base, pc: 0, varargs, result_base, nresults_wanted });
    if t.call_stack.len() > 200 {
        return Err(RuntimeError::StackOverflow);
    }
    Ok(())
}

/// Runs `thread` until its call stack unwinds back to `stop_depth`
/// (a normal return) or the thread yields. Returns the values the
/// frame at `stop_depth` produced.
pub fn run(vm: &mut Vm, thread: NonNull<Thread>, stop_depth: usize) -> Result<Vec<Value>, RuntimeError> {
    match run_outcome(vm, thread, stop_depth)? {
        RunResult::Returned(values) | RunResult::Yielded(values) => Ok(values),
        // `transfer` hands off to a different thread entirely, which only
        // the embedder's resume/transfer loop knows how to continue
        // driving; a plain `run` caller (call_value, a tagged method) has
        // no such loop, so this is a caller error rather than something
        // to chase here.
        RunResult::Transferred(..) => {
            Err(RuntimeError::Custom("transfer is not valid from this calling context".to_string()))
        }
    }
}

/// Same as `run`, but surfaces `transfer`'s target thread instead of
/// rejecting it — used by `Embedder`'s resume/transfer loop, which *can*
/// switch to driving a different thread.
pub(crate) fn run_outcome(vm: &mut Vm, thread: NonNull<Thread>, stop_depth: usize) -> Result<RunResult, RuntimeError> {
    loop {
        if unsafe { thread.as_ref() }.call_stack.len() <= stop_depth {
            return Ok(RunResult::Returned(Vec::new()));
        }
        match step(vm, thread) {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::Returned(values)) => {
                if unsafe { thread.as_ref() }.call_stack.len() <= stop_depth {
                    return Ok(RunResult::Returned(values));
                }
            }
            // A `yield`/`transfer` deep in the call chain always returns
            // control to the immediate `resume`/`run` caller, regardless
            // of `stop_depth` — suspending across a reentrant `call_value`
            // (e.g. from inside a tagged method) is allowed here, unlike
            // Lua's "yield across a C-call boundary" restriction.
            Ok(StepOutcome::Yielded(values)) => return Ok(RunResult::Yielded(values)),
            Ok(StepOutcome::Transferred(target, values)) => return Ok(RunResult::Transferred(target, values)),
            Err(e) => {
                unsafe { &mut *thread.as_ptr() }.status = ThreadStatus::ErrorRun;
                return Err(e);
            }
        }
    }
}

pub(crate) enum RunResult {
    Returned(Vec<Value>),
    Yielded(Vec<Value>),
    Transferred(NonNull<Thread>, Vec<Value>),
}

enum StepOutcome {
    Continue,
    Returned(Vec<Value>),
    /// The `yield` builtin just ran; `run` should stop immediately and
    /// hand these values back to whoever resumed this thread.
    Yielded(Vec<Value>),
    /// The `transfer` builtin just ran; the thread it names should start
    /// running next, with these values as its resume/start arguments.
    Transferred(NonNull<Thread>, Vec<Value>),
}

fn fetch(proto: &Proto, pc: usize) -> u32 {
    proto.inner.code[pc]
}

fn decode(proto: &Proto, pc: usize) -> gal_core::Instruction {
    let word = fetch(proto, pc);
    let shape = gal_core::Opcode::try_from((word & 0xFF) as u8).expect("loaded bytecode is well-formed").shape();
    gal_core::Instruction::decode(word, shape).expect("loaded bytecode is well-formed")
}

/// Executes exactly one instruction of the thread's topmost frame.
fn step(vm: &mut Vm, thread: NonNull<Thread>) -> Result<StepOutcome, RuntimeError> {
    let (frame_idx, closure, base, pc) = {
        let t = unsafe { thread.as_ref() };
        let frame_idx = t.call_stack.len() - 1;
        let frame = &t.call_stack[frame_idx];
        (frame_idx, frame.closure, frame.base, frame.pc)
    };
    let proto_ptr = proto_of(unsafe { closure.as_ref() });
    let proto = unsafe { proto_ptr.as_ref() };
    let ins = decode(proto, pc);
    let mut next_pc = pc + 1;

    macro_rules! a_reg {
        () => {
            match ins.operands {
                Operands::Abc { a, .. } => a,
                Operands::Ad { a, .. } => a,
                Operands::E { .. } => unreachable!(),
            }
        };
    }

    use Opcode::*;
    match ins.opcode {
        Nop | Coverage | DebuggerBreak => {}
        LoadNull => set_reg(thread, base, a_reg!(), Value::NULL),
        LoadBoolean => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            set_reg(thread, base, a, Value::from_bool(b != 0));
        }
        LoadNumber => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let n = match &proto.inner.constants[d as usize] {
                gal_core::Constant::Number(n) => *n,
                _ => unreachable!("LoadNumber always indexes a Number constant"),
            };
            set_reg(thread, base, a, Value::from_number(n));
        }
        LoadKey => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let chunk_idx = match &proto.inner.constants[d as usize] {
                gal_core::Constant::String(idx) => *idx,
                _ => unreachable!("LoadKey always indexes a String constant"),
            };
            let s = proto.string_at(chunk_idx);
            set_reg(thread, base, a, Value::from_object_ptr(s.as_ptr() as *mut ()));
        }
        Move => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            set_reg(thread, base, a, reg(thread, base, b));
        }
        LoadGlobal => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let key = Value::from_object_ptr(proto.string_at(d as u32).as_ptr() as *mut ());
            let v = unsafe { vm.globals.as_ref().get(key) };
            set_reg(thread, base, a, v);
        }
        SetGlobal => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let key = Value::from_object_ptr(proto.string_at(d as u32).as_ptr() as *mut ());
            let v = reg(thread, base, a);
            let globals = vm.globals;
            unsafe { vm.globals.as_mut().set(key, v) };
            barrier_table(vm, globals);
        }
        LoadUpvalue => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let ClosureBody::Script { upvalues, .. } = &unsafe { closure.as_ref() }.body else { unreachable!() };
            let uv = unsafe { upvalues[d as usize].as_ref() };
            let v = match uv.state {
                UpvalueState::Open { stack_slot } => unsafe { thread.as_ref() }.stack[stack_slot],
                UpvalueState::Closed(v) => v,
            };
            set_reg(thread, base, a, v);
        }
        SetUpvalue => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let v = reg(thread, base, a);
            let ClosureBody::Script { upvalues, .. } = &unsafe { closure.as_ref() }.body else { unreachable!() };
            let mut uv = upvalues[d as usize];
            match unsafe { uv.as_ref() }.state {
                UpvalueState::Open { stack_slot } => unsafe { &mut *thread.as_ptr() }.stack[stack_slot] = v,
                UpvalueState::Closed(_) => {
                    unsafe { uv.as_mut() }.close(v);
                    barrier_upvalue(vm, uv);
                }
            }
        }
        CloseUpvalues => {
            let Operands::Abc { a, .. } = ins.operands else { unreachable!() };
            close_upvalues_from(vm, thread, base, a as usize);
        }
        NewTable => {
            let Operands::Ad { a, .. } = ins.operands else { unreachable!() };
            let table = vm.new_table();
            set_reg(thread, base, a, Value::from_object_ptr(table.as_ptr() as *mut ()));
        }
        LoadTable => {
            let Operands::Abc { a, b, c } = ins.operands else { unreachable!() };
            let obj = reg(thread, base, b);
            let key = reg(thread, base, c);
            let v = index_value(vm, thread, obj, key)?;
            set_reg(thread, base, a, v);
        }
        SetTable => {
            let Operands::Abc { a, b, c } = ins.operands else { unreachable!() };
            let obj = reg(thread, base, a);
            let key = reg(thread, base, b);
            let val = reg(thread, base, c);
            newindex_value(vm, thread, obj, key, val)?;
        }
        LoadTableNumberKey => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let aux = fetch(proto, pc + 1);
            next_pc += 1;
            let key = match &proto.inner.constants[aux as usize] {
                gal_core::Constant::Number(n) => Value::from_number(*n),
                _ => unreachable!(),
            };
            let obj = reg(thread, base, b);
            let v = index_value(vm, thread, obj, key)?;
            set_reg(thread, base, a, v);
        }
        SetTableNumberKey => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let aux = fetch(proto, pc + 1);
            next_pc += 1;
            let key = match &proto.inner.constants[aux as usize] {
                gal_core::Constant::Number(n) => Value::from_number(*n),
                _ => unreachable!(),
            };
            let obj = reg(thread, base, a);
            let val = reg(thread, base, b);
            newindex_value(vm, thread, obj, key, val)?;
        }
        LoadTableStringKey => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let aux = fetch(proto, pc + 1);
            next_pc += 1;
            let name_idx = aux & 0x00FF_FFFF;
            let key = Value::from_object_ptr(proto.string_at(name_idx).as_ptr() as *mut ());
            let obj = reg(thread, base, b);
            let v = index_value(vm, thread, obj, key)?;
            set_reg(thread, base, a, v);
        }
        SetTableStringKey => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let aux = fetch(proto, pc + 1);
            next_pc += 1;
            let name_idx = aux & 0x00FF_FFFF;
            let key = Value::from_object_ptr(proto.string_at(name_idx).as_ptr() as *mut ());
            let obj = reg(thread, base, a);
            let val = reg(thread, base, b);
            newindex_value(vm, thread, obj, key, val)?;
        }
        NewClosure => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let proto_idx = match &proto.inner.constants[d as usize] {
                gal_core::Constant::Closure(idx) => *idx,
                _ => unreachable!("NewClosure always indexes a Closure constant"),
            };
            let child_proto = proto.child_at(proto_idx);
            let num_upvalues = unsafe { child_proto.as_ref() }.inner.num_upvalues as usize;
            let mut upvalues = Vec::with_capacity(num_upvalues);
            for i in 0..num_upvalues {
                let aux = fetch(proto, pc + 1 + i);
                let kind = CaptureKind::try_from((aux & 0xFF) as u8).expect("valid capture kind");
                let src = ((aux >> 8) & 0xFF) as u8;
                let uv = match kind {
                    CaptureKind::Reference => find_or_open_upvalue(vm, thread, base + src as usize),
                    CaptureKind::Upvalue => {
                        let ClosureBody::Script { upvalues, .. } = &unsafe { closure.as_ref() }.body else {
                            unreachable!()
                        };
                        upvalues[src as usize]
                    }
                    CaptureKind::Value => {
                        let v = reg(thread, base, src);
                        let uv = Upvalue::closed(v, vm.collector.current_white);
                        let ptr = unsafe { gc::alloc_object(&mut vm.allocator, uv) };
                        unsafe { vm.collector.register(ptr) };
                        ptr
                    }
                };
                upvalues.push(uv);
            }
            next_pc += num_upvalues;
            let closure_obj = Closure::script(child_proto, upvalues, vm.collector.current_white);
            let ptr = unsafe { gc::alloc_object(&mut vm.allocator, closure_obj) };
            unsafe { vm.collector.register(ptr) };
            set_reg(thread, base, a, Value::from_object_ptr(ptr.as_ptr() as *mut ()));
        }
        NamedCall => {
            let Operands::Abc { a, .. } = ins.operands else { unreachable!() };
            let aux = fetch(proto, pc + 1);
            next_pc += 1;
            let name_idx = aux & 0x00FF_FFFF;
            let key = Value::from_object_ptr(proto.string_at(name_idx).as_ptr() as *mut ());
            let receiver = reg(thread, base, a);
            let method = index_value(vm, thread, receiver, key)?;
            set_reg(thread, base, a, method);
            set_reg(thread, base, a + 1, receiver);
        }
        Call => {
            let Operands::Abc { a, b, c } = ins.operands else { unreachable!() };
            let callee = reg(thread, base, a);
            let nargs = b.saturating_sub(1) as usize;
            unsafe { &mut *thread.as_ptr() }.call_stack[frame_idx].pc = next_pc;
            return dispatch_call(vm, thread, callee, base + a as usize + 1, nargs, base + a as usize, c);
        }
        Return => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let count = b.saturating_sub(1) as usize;
            let values: Vec<Value> = (0..count).map(|i| reg(thread, base, a + i as u8)).collect();
            return Ok(finish_return(vm, thread, values));
        }
        Jump => {
            let Operands::Ad { d, .. } = ins.operands else { unreachable!() };
            next_pc = (pc as i64 + 1 + d as i64) as usize;
        }
        JumpIf => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            if reg(thread, base, a).is_truthy() {
                next_pc = (pc as i64 + 1 + d as i64) as usize;
            }
        }
        JumpIfNot => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            if !reg(thread, base, a).is_truthy() {
                next_pc = (pc as i64 + 1 + d as i64) as usize;
            }
        }
        JumpIfEq | JumpIfNe | JumpIfLt | JumpIfLe => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let aux = fetch(proto, pc + 1) as i32;
            next_pc += 1;
            let lhs = reg(thread, base, a);
            let rhs = reg(thread, base, b);
            let taken = match ins.opcode {
                JumpIfEq => compare_eq(vm, thread, lhs, rhs)?,
                JumpIfNe => !compare_eq(vm, thread, lhs, rhs)?,
                JumpIfLt => compare_order(vm, thread, lhs, rhs, TaggedMethod::Lt)?,
                JumpIfLe => compare_order(vm, thread, lhs, rhs, TaggedMethod::Le)?,
                _ => unreachable!(),
            };
            if taken {
                next_pc = (pc as i64 + 2 + aux as i64) as usize;
            }
        }
        Plus | Minus | Multiply | Divide | Modulus | Pow | BitwiseAnd | BitwiseOr | BitwiseXor
        | BitwiseLeftShift | BitwiseRightShift => {
            let Operands::Abc { a, b, c } = ins.operands else { unreachable!() };
            let lhs = reg(thread, base, b);
            let rhs = reg(thread, base, c);
            let v = binary_arith(vm, thread, ins.opcode, lhs, rhs)?;
            set_reg(thread, base, a, v);
        }
        Unm => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let v = reg(thread, base, b);
            let result = match v.as_number() {
                Some(n) => Value::from_number(-n),
                None => call_unary_metamethod(vm, thread, TaggedMethod::Unm, v)?,
            };
            set_reg(thread, base, a, result);
        }
        Len => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let v = reg(thread, base, b);
            let result = len_value(vm, thread, v)?;
            set_reg(thread, base, a, result);
        }
        Not => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let v = reg(thread, base, b);
            set_reg(thread, base, a, Value::from_bool(!v.is_truthy()));
        }
        LogicalAnd => {
            let Operands::Abc { a, b, c } = ins.operands else { unreachable!() };
            let l = reg(thread, base, b);
            let v = if l.is_truthy() { reg(thread, base, c) } else { l };
            set_reg(thread, base, a, v);
        }
        LogicalOr => {
            let Operands::Abc { a, b, c } = ins.operands else { unreachable!() };
            let l = reg(thread, base, b);
            let v = if l.is_truthy() { l } else { reg(thread, base, c) };
            set_reg(thread, base, a, v);
        }
        // Four consecutive slots `[limit, step, index, variable]` at
        // `a..a+3`; `variable` (the name the body sees) is kept separate
        // from `index` (the loop's own counter) so the body can reassign
        // its loop variable without perturbing the bound test.
        ForNumericLoopPrepare => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let limit = require_number(reg(thread, base, a))?;
            let step = require_number(reg(thread, base, a + 1))?;
            let start = require_number(reg(thread, base, a + 2))?;
            let skip = step == 0.0 || (step > 0.0 && start > limit) || (step < 0.0 && start < limit);
            if skip {
                next_pc = (pc as i64 + 1 + d as i64) as usize;
            }
        }
        ForNumericLoop => {
            let Operands::Ad { a, d } = ins.operands else { unreachable!() };
            let limit = reg(thread, base, a).as_number().expect("ForNumericLoopPrepare validated this");
            let step = reg(thread, base, a + 1).as_number().expect("ForNumericLoopPrepare validated this");
            let index = reg(thread, base, a + 2).as_number().expect("ForNumericLoopPrepare validated this");
            let next = index + step;
            let continues = if step > 0.0 { next <= limit } else { next >= limit };
            if continues {
                set_reg(thread, base, a + 2, Value::from_number(next));
                set_reg(thread, base, a + 3, Value::from_number(next));
                next_pc = (pc as i64 + 1 + d as i64) as usize;
            }
        }
        NextPrepare => {}
        Next => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let iter_fn = reg(thread, base, a);
            let s = reg(thread, base, a + 1);
            let ctrl = reg(thread, base, a + 2);
            unsafe { &mut *thread.as_ptr() }.call_stack[frame_idx].pc = next_pc;
            let results = call_value(vm, thread, iter_fn, &[s, ctrl])?;
            for i in 0..b {
                let v = results.get(i as usize).copied().unwrap_or(Value::NULL);
                set_reg(thread, base, a + 3 + i, v);
            }
            return Ok(StepOutcome::Continue);
        }
        LoadVarargs => {
            let Operands::Abc { a, b, .. } = ins.operands else { unreachable!() };
            let count = b as usize;
            for i in 0..count {
                let v = unsafe { thread.as_ref() }.call_stack[frame_idx].varargs.get(i).copied().unwrap_or(Value::NULL);
                set_reg(thread, base, a + i as u8, v);
            }
        }
        PrepareVarargs => {}
        // An inline attempt at a known builtin (spec §4.9): always emitted
        // directly before the ordinary `Call` that would otherwise run
        // this callee, sharing that `Call`'s `a` register and reading its
        // `b`/`c` fields for argument/result counts rather than carrying
        // its own. Accepting writes the results and jumps past the
        // fallback `Call`; rejecting (an argument of the wrong type, most
        // often) leaves `next_pc` alone so the fallback runs unmodified —
        // every builtin behind `fastcall_host_fn` validates its arguments
        // before mutating anything, so a rejected attempt never needs to
        // be undone.
        FastCall | FastCall1 | FastCall2 | FastCall2Key => {
            let Operands::Abc { a, b: builtin_id, .. } = ins.operands else { unreachable!() };
            let builtin = gal_core::FastcallBuiltin::try_from(builtin_id)
                .map_err(|_| RuntimeError::MalformedChunk("unknown fastcall builtin id"))?;
            let key_arg = if ins.opcode == FastCall2Key {
                let aux = fetch(proto, pc + 1);
                next_pc += 1;
                Some(match &proto.inner.constants[aux as usize] {
                    gal_core::Constant::Number(n) => Value::from_number(*n),
                    _ => unreachable!("FastCall2Key always indexes a Number constant"),
                })
            } else {
                None
            };
            let fallback_pc = next_pc;
            let fallback = decode(proto, fallback_pc);
            let Operands::Abc { a: call_a, b: call_b, c: call_c } = fallback.operands else {
                unreachable!("a fastcall is always immediately followed by its fallback Call")
            };
            debug_assert_eq!(call_a, a, "fastcall and its fallback Call must share a base register");
            let args: Vec<Value> = match ins.opcode {
                FastCall => {
                    let nargs = call_b.saturating_sub(1) as usize;
                    (0..nargs).map(|i| reg(thread, base, a + 1 + i as u8)).collect()
                }
                FastCall1 => vec![reg(thread, base, a + 1)],
                FastCall2 => vec![reg(thread, base, a + 1), reg(thread, base, a + 2)],
                FastCall2Key => vec![reg(thread, base, a + 1), key_arg.expect("decoded above")],
                _ => unreachable!(),
            };
            let host = crate::builtins::fastcall_host_fn(builtin);
            match host(vm, thread, &args) {
                Ok(results) => {
                    write_results(thread, base + a as usize, call_c, &results);
                    next_pc = fallback_pc + 1;
                }
                Err(_) => {
                    next_pc = fallback_pc;
                }
            }
        }
        _ => {
            return Err(RuntimeError::MalformedChunk("opcode not implemented by this interpreter"));
        }
    }

    if let Some(frame) = unsafe { &mut *thread.as_ptr() }.call_stack.get_mut(frame_idx) {
        frame.pc = next_pc;
    }
    Ok(StepOutcome::Continue)
}

fn require_number(v: Value) -> Result<f64, RuntimeError> {
    v.as_number().ok_or(RuntimeError::ArithmeticOnNonNumber(type_name(v)))
}

/// Closes every open upvalue at or above stack slot `from` (spec §3.7):
/// copies the live value out and unlinks it from the thread's open list.
fn close_upvalues_from(vm: &mut Vm, thread: NonNull<Thread>, base: usize, from: usize) {
    let slot = base + from;
    let t = unsafe { &mut *thread.as_ptr() };
    let mut cur = t.open_upvalues;
    let mut prev: Option<NonNull<Upvalue>> = None;
    let mut keep_head = None;
    while let Some(uv) = cur {
        let uv_ref = unsafe { &mut *uv.as_ptr() };
        let next = uv_ref.next_open;
        if let UpvalueState::Open { stack_slot } = uv_ref.state {
            if stack_slot >= slot {
                let value = t.stack[stack_slot];
                uv_ref.close(value);
                barrier_upvalue(vm, uv);
                cur = next;
                continue;
            }
        }
        if keep_head.is_none() {
            keep_head = Some(uv);
        }
        if let Some(mut p) = prev {
            unsafe { p.as_mut() }.next_open = Some(uv);
        }
        prev = Some(uv);
        cur = next;
    }
    t.open_upvalues = keep_head;
}

fn find_or_open_upvalue(vm: &mut Vm, thread: NonNull<Thread>, slot: usize) -> NonNull<Upvalue> {
    if let Some(existing) = unsafe { thread.as_ref() }.find_open_upvalue(slot) {
        return existing;
    }
    let uv = Upvalue::open(slot, vm.collector.current_white);
    let ptr = unsafe { gc::alloc_object(&mut vm.allocator, uv) };
    unsafe { vm.collector.register(ptr) };
    let t = unsafe { &mut *thread.as_ptr() };
    unsafe { &mut *ptr.as_ptr() }.next_open = t.open_upvalues;
    t.open_upvalues = Some(ptr);
    ptr
}

fn dispatch_call(
    vm: &mut Vm,
    thread: NonNull<Thread>,
    callee: Value,
    arg_base: usize,
    nargs: usize,
    result_base: usize,
    nresults_wanted: u8,
) -> Result<StepOutcome, RuntimeError> {
    let closure_ptr = resolve_callable(thread, callee)?;
    let closure = unsafe { closure_ptr.as_ref() };
    match &closure.body {
        ClosureBody::Host { func, .. } => {
            let f = *func;
            let args: Vec<Value> = unsafe { thread.as_ref() }.stack[arg_base..arg_base + nargs].to_vec();
            let results = f(vm, thread, &args)?;
            if unsafe { thread.as_ref() }.status == crate::error::ThreadStatus::Yield {
                unsafe { &mut *thread.as_ptr() }.pending_resume = Some((result_base, nresults_wanted));
                if let Some(target) = unsafe { &mut *thread.as_ptr() }.pending_transfer_target.take() {
                    return Ok(StepOutcome::Transferred(target, results));
                }
                return Ok(StepOutcome::Yielded(results));
            }
            write_results(thread, result_base, nresults_wanted, &results);
            Ok(StepOutcome::Continue)
        }
        ClosureBody::Script { .. } => {
            push_call(thread, closure_ptr, arg_base, nargs, result_base, nresults_wanted)?;
            Ok(StepOutcome::Continue)
        }
    }
}

pub(crate) fn write_results(thread: NonNull<Thread>, result_base: usize, nresults_wanted: u8, results: &[Value]) {
    let wanted = nresults_wanted.saturating_sub(1) as usize;
    let t = unsafe { &mut *thread.as_ptr() };
    t.ensure_stack(result_base + wanted);
    for i in 0..wanted {
        t.stack[result_base + i] = results.get(i).copied().unwrap_or(Value::NULL);
    }
}

/// Pops the current frame, closes any upvalues still open over its
/// registers, and — if another frame on this thread is waiting for it —
/// writes the results into that frame's window. Always reports the raw
/// values too, so `run` can hand them back across a `call_value`
/// boundary at any `stop_depth`, not only when the thread goes fully idle.
fn finish_return(vm: &mut Vm, thread: NonNull<Thread>, values: Vec<Value>) -> StepOutcome {
    let frame = unsafe { &mut *thread.as_ptr() }.call_stack.pop().expect("Return only executes inside a frame");
    close_upvalues_from(vm, thread, frame.base, 0);
    if !unsafe { thread.as_ref() }.call_stack.is_empty() {
        write_results(thread, frame.result_base, frame.nresults_wanted, &values);
    }
    StepOutcome::Returned(values)
}

fn binary_arith(vm: &mut Vm, thread: NonNull<Thread>, op: Opcode, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(Value::from_number(match op {
            Opcode::Plus => a + b,
            Opcode::Minus => a - b,
            Opcode::Multiply => a * b,
            Opcode::Divide => a / b,
            Opcode::Modulus => a - (a / b).floor() * b,
            Opcode::Pow => a.powf(b),
            Opcode::BitwiseAnd => ((a as i64) & (b as i64)) as f64,
            Opcode::BitwiseOr => ((a as i64) | (b as i64)) as f64,
            Opcode::BitwiseXor => ((a as i64) ^ (b as i64)) as f64,
            Opcode::BitwiseLeftShift => ((a as i64) << (b as i64)) as f64,
            Opcode::BitwiseRightShift => ((a as i64) >> (b as i64)) as f64,
            _ => unreachable!("binary_arith only called for arithmetic opcodes"),
        }));
    }
    if op == Opcode::Plus {
        if let Some(s) = try_concat(vm, lhs, rhs) {
            return Ok(s);
        }
    }
    let tm = tagged_method_for(op).expect("binary_arith only called for opcodes with a tagged method");
    call_binary_metamethod(vm, thread, tm, lhs, rhs)
}

/// `Plus` doubles as string concatenation (the compiler lowers `..` to
/// the same opcode as `+`) whenever either side is a string.
fn try_concat(vm: &mut Vm, lhs: Value, rhs: Value) -> Option<Value> {
    let ls = unsafe { value_str(lhs) };
    let rs = unsafe { value_str(rhs) };
    if ls.is_none() && rs.is_none() {
        return None;
    }
    let mut out = String::new();
    match ls {
        Some(s) => out.push_str(s),
        None => out.push_str(&lhs.as_number()?.to_string()),
    }
    match rs {
        Some(s) => out.push_str(s),
        None => out.push_str(&rhs.as_number()?.to_string()),
    }
    Some(vm.intern_value(out.as_bytes()))
}

fn call_binary_metamethod(
    vm: &mut Vm,
    thread: NonNull<Thread>,
    tm: TaggedMethod,
    lhs: Value,
    rhs: Value,
) -> Result<Value, RuntimeError> {
    for side in [lhs, rhs] {
        if let Some(table) = as_table(side) {
            if let Some(method) = unsafe { table.as_ref().tagged_method(tm) } {
                let results = call_value(vm, thread, method, &[lhs, rhs])?;
                return Ok(results.first().copied().unwrap_or(Value::NULL));
            }
        }
    }
    Err(RuntimeError::ArithmeticOnNonNumber(type_name(lhs)))
}

fn call_unary_metamethod(vm: &mut Vm, thread: NonNull<Thread>, tm: TaggedMethod, v: Value) -> Result<Value, RuntimeError> {
    if let Some(table) = as_table(v) {
        if let Some(method) = unsafe { table.as_ref().tagged_method(tm) } {
            let results = call_value(vm, thread, method, &[v])?;
            return Ok(results.first().copied().unwrap_or(Value::NULL));
        }
    }
    Err(RuntimeError::ArithmeticOnNonNumber(type_name(v)))
}

fn as_table(v: Value) -> Option<NonNull<Table>> {
    let ptr = v.as_object_ptr()?;
    let header = unsafe { &*(ptr as *const crate::object::GcHeader) };
    (header.kind == ObjectKind::Table).then(|| unsafe { NonNull::new_unchecked(ptr as *mut Table) })
}

fn len_value(vm: &mut Vm, thread: NonNull<Thread>, v: Value) -> Result<Value, RuntimeError> {
    if let Some(s) = unsafe { value_str(v) } {
        return Ok(Value::from_number(s.len() as f64));
    }
    if let Some(table) = as_table(v) {
        let method = unsafe { table.as_ref().tagged_method(TaggedMethod::Len) };
        if let Some(method) = method {
            let results = call_value(vm, thread, method, &[v])?;
            return Ok(results.first().copied().unwrap_or(Value::NULL));
        }
        return Ok(Value::from_number(unsafe { table.as_ref() }.len() as f64));
    }
    Err(RuntimeError::IndexNonIndexable(type_name(v)))
}

fn compare_eq(vm: &mut Vm, thread: NonNull<Thread>, lhs: Value, rhs: Value) -> Result<bool, RuntimeError> {
    if unsafe { values_equal(lhs, rhs) } {
        return Ok(true);
    }
    if let (Some(a), Some(b)) = (as_table(lhs), as_table(rhs)) {
        let method = unsafe { a.as_ref().tagged_method(TaggedMethod::Eq) }
            .or_else(|| unsafe { b.as_ref().tagged_method(TaggedMethod::Eq) });
        if let Some(method) = method {
            let results = call_value(vm, thread, method, &[lhs, rhs])?;
            return Ok(results.first().is_some_and(|v| v.is_truthy()));
        }
    }
    Ok(false)
}

fn compare_order(
    vm: &mut Vm,
    thread: NonNull<Thread>,
    lhs: Value,
    rhs: Value,
    tm: TaggedMethod,
) -> Result<bool, RuntimeError> {
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return Ok(if tm == TaggedMethod::Lt { a < b } else { a <= b });
    }
    if let (Some(a), Some(b)) = (unsafe { value_str(lhs) }, unsafe { value_str(rhs) }) {
        return Ok(if tm == TaggedMethod::Lt { a < b } else { a <= b });
    }
    if let (Some(a), Some(_)) = (as_table(lhs), as_table(rhs)) {
        if let Some(method) = unsafe { a.as_ref().tagged_method(tm) } {
            let results = call_value(vm, thread, method, &[lhs, rhs])?;
            return Ok(results.first().is_some_and(|v| v.is_truthy()));
        }
    }
    Err(RuntimeError::Incomparable(type_name(lhs), type_name(rhs)))
}

/// Table indexing with `__index` chaining (spec §3.4): a direct hit wins,
/// otherwise a table-valued `__index` is itself indexed (so a prototype
/// chain of any depth resolves), and a function-valued one is called
/// with `(obj, key)`.
fn index_value(vm: &mut Vm, thread: NonNull<Thread>, obj: Value, key: Value) -> Result<Value, RuntimeError> {
    if let Some(table) = as_table(obj) {
        let direct = unsafe { table.as_ref().get(key) };
        if !direct.is_null() {
            return Ok(direct);
        }
        if let Some(handler) = unsafe { table.as_ref().tagged_method(TaggedMethod::Index) } {
            if as_table(handler).is_some() {
                return index_value(vm, thread, handler, key);
            }
            let results = call_value(vm, thread, handler, &[obj, key])?;
            return Ok(results.first().copied().unwrap_or(Value::NULL));
        }
        return Ok(Value::NULL);
    }
    Err(RuntimeError::IndexNonIndexable(type_name(obj)))
}

fn newindex_value(vm: &mut Vm, thread: NonNull<Thread>, obj: Value, key: Value, val: Value) -> Result<(), RuntimeError> {
    if let Some(mut table) = as_table(obj) {
        let exists = !unsafe { table.as_ref().get(key) }.is_null();
        if !exists {
            if let Some(handler) = unsafe { table.as_ref().tagged_method(TaggedMethod::NewIndex) } {
                if let Some(mut meta_table) = as_table(handler) {
                    unsafe { meta_table.as_mut().set(key, val) };
                    barrier_table(vm, meta_table);
                } else {
                    call_value(vm, thread, handler, &[obj, key, val])?;
                }
                return Ok(());
            }
        }
        if !unsafe { table.as_ref() }.mutable {
            return Err(RuntimeError::Custom("attempt to write to a read-only table".into()));
        }
        unsafe { table.as_mut().set(key, val) };
        barrier_table(vm, table);
        return Ok(());
    }
    Err(RuntimeError::IndexNonIndexable(type_name(obj)))
}

/// Re-grays `table` if a mutation just handed a black table a
/// possibly-white value (spec §4.4's backward write barrier); cheap
/// enough to call unconditionally on every table write.
fn barrier_table(vm: &mut Vm, table: NonNull<Table>) {
    let header = NonNull::from(unsafe { table.as_ref() }.header());
    unsafe { vm.collector.barrier_back(header) };
}

fn barrier_upvalue(vm: &mut Vm, uv: NonNull<Upvalue>) {
    let header = NonNull::from(unsafe { uv.as_ref() }.header());
    unsafe { vm.collector.barrier_back(header) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use gal_compiler::compile;

    fn run_source(src: &str) -> Vec<Value> {
        let chunk = compile(src.as_bytes(), None).expect("compiles");
        let mut vm = Vm::new();
        let proto = vm.load_chunk(chunk);
        let closure = Closure::script(proto, Vec::new(), vm.collector.current_white);
        let ptr = unsafe { gc::alloc_object(&mut vm.allocator, closure) };
        unsafe { vm.collector.register(ptr) };
        let thread = vm.root_thread;
        call_value(&mut vm, thread, Value::from_object_ptr(ptr.as_ptr() as *mut ()), &[]).expect("runs")
    }

    #[test]
    fn arithmetic_and_return_roundtrip() {
        let values = run_source("return 1 + 2 * 3");
        assert_eq!(values[0].as_number(), Some(7.0));
    }

    #[test]
    fn string_concatenation_via_plus() {
        let values = run_source("return \"a\" + \"b\"");
        assert!(values[0].as_object_ptr().is_some());
    }

    #[test]
    fn local_variables_and_control_flow() {
        let values = run_source("local x = 0\nfor i = 1, 5 do\n  x = x + i\nend\nreturn x");
        assert_eq!(values[0].as_number(), Some(15.0));
    }
}
