//! Bytecode codegen (spec §4.9, §6): walks the optimized AST once per
//! function body, allocating registers and emitting `gal_core` opcodes
//! into a `Prototype`.
//!
//! Calls and returns share one counting convention throughout this
//! module: a `b`/`c` operand of `n` means "n - 1 values", so `0` is free
//! to mean "every value, multi/vararg passthrough" (unused here, but
//! reserved for the interpreter).

use std::collections::{HashMap, HashSet};

use gal_core::chunk::{Chunk, Constant as KConstant, LineInfo, LocalVarInfo, Prototype};
use gal_core::opcode::{CaptureKind, FastcallBuiltin, Instruction, Opcode};

use crate::ast::{Ast, BinOp, Constant, ExprId, ExprKind, FunctionBody, Param, StatId, StatKind, TableItem, UnOp};
use crate::diagnostics::CompileError;

const MAX_LOCALS: usize = 255;
const MAX_CONSTANTS: usize = 1 << 15;

pub fn compile(ast: &Ast, root: StatId, debug_name: Option<&str>) -> Result<Chunk, CompileError> {
    let mut c = Compiler { builder: ChunkBuilder::default(), ast, frames: Vec::new() };
    let debug_name_idx = debug_name.map(|n| c.builder.intern_string(n));
    let (main, captures) = c.compile_function(&[], false, root, debug_name_idx, false)?;
    debug_assert!(captures.is_empty(), "the top-level chunk body has no enclosing scope to capture from");
    let main_index = c.builder.prototypes.len() as u32;
    c.builder.prototypes.push(main);
    Ok(Chunk { strings: c.builder.strings, prototypes: c.builder.prototypes, main_prototype: main_index })
}

#[derive(Default)]
struct ChunkBuilder {
    strings: Vec<String>,
    string_map: HashMap<String, u32>,
    prototypes: Vec<Prototype>,
}

impl ChunkBuilder {
    fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_map.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_map.insert(s.to_string(), idx);
        idx
    }
}

/// Where a captured free variable lives relative to the function that
/// needs it: either a local register one level up, or an upvalue
/// already (or now newly) threaded through that level.
#[derive(Clone, Copy)]
enum CaptureSource {
    Local(u8),
    Upvalue(u8),
}

enum Resolved {
    Local(u8),
    Upvalue(u8),
    Global,
}

struct LoopContext {
    continue_target: usize,
    break_patches: Vec<usize>,
}

/// Per-function compilation state. One `Frame` is live per level of
/// function nesting currently being compiled; `Compiler::frames` is
/// the nesting stack.
struct Frame {
    code: Vec<u32>,
    lines: Vec<i32>,
    constants: Vec<KConstant>,
    number_const: HashMap<u64, u32>,
    locals: Vec<(String, u8)>,
    scopes: Vec<usize>,
    locals_debug: Vec<LocalVarInfo>,
    next_register: u8,
    max_register: u8,
    captured_registers: HashSet<u8>,
    upvalue_order: Vec<String>,
    upvalue_names: Vec<u32>,
    pending_captures: Vec<(CaptureKind, u8)>,
    loop_stack: Vec<LoopContext>,
    children: Vec<u32>,
    next_cache_slot: u32,
}

impl Frame {
    fn new() -> Frame {
        Frame {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            number_const: HashMap::new(),
            locals: Vec::new(),
            scopes: Vec::new(),
            locals_debug: Vec::new(),
            next_register: 0,
            max_register: 0,
            captured_registers: HashSet::new(),
            upvalue_order: Vec::new(),
            upvalue_names: Vec::new(),
            pending_captures: Vec::new(),
            loop_stack: Vec::new(),
            children: Vec::new(),
            next_cache_slot: 0,
        }
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals.iter().rev().find(|(n, _)| n == name).map(|(_, r)| *r)
    }

    fn upvalue_index(&self, name: &str) -> Option<u8> {
        self.upvalue_order.iter().position(|n| n == name).map(|i| i as u8)
    }
}

struct Compiler<'a> {
    builder: ChunkBuilder,
    ast: &'a Ast,
    frames: Vec<Frame>,
}

impl<'a> Compiler<'a> {
    fn frame(&self) -> &Frame {
        self.frames.last().expect("a frame is always active while compiling")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("a frame is always active while compiling")
    }

    // ---- emission ----

    fn emit_abc(&mut self, op: Opcode, a: u8, b: u8, c: u8, line: i32) -> usize {
        let f = self.frame_mut();
        let pc = f.code.len();
        f.code.push(Instruction::abc(op, a, b, c).encode());
        f.lines.push(line);
        pc
    }

    fn emit_ad(&mut self, op: Opcode, a: u8, d: i16, line: i32) -> usize {
        let f = self.frame_mut();
        let pc = f.code.len();
        f.code.push(Instruction::ad(op, a, d).encode());
        f.lines.push(line);
        pc
    }

    fn emit_raw(&mut self, word: u32, line: i32) -> usize {
        let f = self.frame_mut();
        let pc = f.code.len();
        f.code.push(word);
        f.lines.push(line);
        pc
    }

    fn here(&self) -> usize {
        self.frame().here()
    }

    /// Patches a single-word `Ad`-shaped jump (`Jump`/`JumpIf`/
    /// `JumpIfNot`/`ForNumericLoop`) so its offset lands on `target`.
    fn patch_jump_to(&mut self, pc: usize, target: usize) {
        let f = self.frame_mut();
        let word = f.code[pc];
        let opcode = Opcode::try_from((word & 0xFF) as u8).expect("patched word has a valid opcode");
        let a = ((word >> 8) & 0xFF) as u8;
        let offset = target as i64 - (pc as i64 + 1);
        f.code[pc] = Instruction::ad(opcode, a, offset as i16).encode();
    }

    fn patch_jump_here(&mut self, pc: usize) {
        self.patch_jump_to(pc, self.here());
    }

    /// Patches the trailing aux word of a two-word compare-and-jump
    /// instruction (`JumpIfEq`/`JumpIfLt`/`JumpIfLe`/`JumpIfNe`): the
    /// offset lives in the word right after the `Abc` header, since the
    /// header's three bytes are spent on the two compared registers.
    fn patch_compare_jump(&mut self, header_pc: usize, target: usize) {
        let f = self.frame_mut();
        let offset = target as i64 - (header_pc as i64 + 2);
        f.code[header_pc + 1] = offset as i32 as u32;
    }

    // ---- registers & locals ----

    fn alloc_register(&mut self) -> u8 {
        let f = self.frame_mut();
        let r = f.next_register;
        f.next_register = f.next_register.saturating_add(1);
        f.max_register = f.max_register.max(f.next_register);
        r
    }

    fn free_to(&mut self, mark: u8) {
        self.frame_mut().next_register = mark;
    }

    fn declare_local(&mut self, name: &str) -> Result<u8, CompileError> {
        let name_idx = self.builder.intern_string(name);
        let pc = self.here() as u32;
        let f = self.frame_mut();
        if f.locals.len() >= MAX_LOCALS {
            return Err(CompileError::TooManyLocals);
        }
        let r = f.next_register;
        f.next_register = f.next_register.saturating_add(1);
        f.max_register = f.max_register.max(f.next_register);
        f.locals.push((name.to_string(), r));
        f.locals_debug.push(LocalVarInfo { name: name_idx, begin_pc: pc, end_pc: u32::MAX, register: r });
        Ok(r)
    }

    fn push_scope(&mut self) {
        let f = self.frame_mut();
        let mark = f.locals.len();
        f.scopes.push(mark);
    }

    /// Closes the scope, emitting `CloseUpvalues` only if a nested
    /// closure actually captured one of the locals going out of scope
    /// (spec §8 scenario 4: upvalues must close on early loop exit, not
    /// just on function return).
    fn pop_scope(&mut self) {
        let f = self.frame_mut();
        let mark = f.scopes.pop().expect("unbalanced scope");
        let reg_start = f.locals.get(mark).map(|(_, r)| *r).unwrap_or(f.next_register);
        let any_captured = f.locals[mark..].iter().any(|(_, r)| f.captured_registers.contains(r));
        f.locals.truncate(mark);
        f.next_register = reg_start;
        if any_captured {
            self.emit_abc(Opcode::CloseUpvalues, reg_start, 0, 0, 0);
        }
    }

    fn next_cache_slot(&mut self) -> u32 {
        let f = self.frame_mut();
        let s = f.next_cache_slot;
        f.next_cache_slot += 1;
        s
    }

    // ---- name resolution & upvalue capture ----

    fn resolve_name(&mut self, name: &str) -> Resolved {
        let depth = self.frames.len() - 1;
        if let Some(reg) = self.frames[depth].resolve_local(name) {
            return Resolved::Local(reg);
        }
        if let Some(idx) = self.frames[depth].upvalue_index(name) {
            return Resolved::Upvalue(idx);
        }
        if let Some(idx) = self.build_upvalue_chain(depth, name) {
            return Resolved::Upvalue(idx);
        }
        Resolved::Global
    }

    fn build_upvalue_chain(&mut self, depth: usize, name: &str) -> Option<u8> {
        if depth == 0 {
            return None;
        }
        let source = if let Some(reg) = self.frames[depth - 1].resolve_local(name) {
            self.frames[depth - 1].captured_registers.insert(reg);
            CaptureSource::Local(reg)
        } else if let Some(idx) = self.frames[depth - 1].upvalue_index(name) {
            CaptureSource::Upvalue(idx)
        } else {
            let idx = self.build_upvalue_chain(depth - 1, name)?;
            CaptureSource::Upvalue(idx)
        };
        Some(self.add_upvalue(depth, name, source))
    }

    fn add_upvalue(&mut self, depth: usize, name: &str, source: CaptureSource) -> u8 {
        let name_idx = self.builder.intern_string(name);
        let f = &mut self.frames[depth];
        let idx = f.upvalue_order.len() as u8;
        f.upvalue_order.push(name.to_string());
        f.upvalue_names.push(name_idx);
        let (kind, src) = match source {
            CaptureSource::Local(r) => (CaptureKind::Reference, r),
            CaptureSource::Upvalue(i) => (CaptureKind::Upvalue, i),
        };
        f.pending_captures.push((kind, src));
        idx
    }

    // ---- function bodies ----

    /// Compiles one function body into a `Prototype`, plus the list of
    /// `Capture` records the *caller* must emit right after the
    /// `NewClosure` instruction it uses to build this closure.
    fn compile_function(
        &mut self,
        params: &[Param],
        is_vararg: bool,
        body: StatId,
        debug_name: Option<u32>,
        implicit_self: bool,
    ) -> Result<(Prototype, Vec<(CaptureKind, u8)>), CompileError> {
        self.frames.push(Frame::new());
        if implicit_self {
            self.declare_local("self")?;
        }
        for p in params {
            self.declare_local(&p.name)?;
        }
        let num_params = self.frame().next_register;
        if is_vararg {
            self.emit_abc(Opcode::PrepareVarargs, num_params, 0, 0, 0);
        }
        self.compile_block(body)?;
        self.emit_abc(Opcode::Return, 0, 1, 0, 0);

        let f = self.frames.pop().expect("frame pushed at function entry");
        let proto = Prototype {
            max_stack_size: f.max_register.max(num_params).max(1),
            num_params,
            num_upvalues: f.upvalue_names.len() as u8,
            is_vararg,
            line_info: LineInfo::build(&f.lines, 4),
            code: f.code,
            constants: f.constants,
            children: f.children,
            debug_name,
            locals: f.locals_debug,
            upvalue_names: f.upvalue_names,
        };
        Ok((proto, f.pending_captures))
    }

    fn compile_function_literal(&mut self, body: &FunctionBody, dest: u8, line: i32, implicit_self: bool) -> Result<(), CompileError> {
        let (proto, captures) = self.compile_function(&body.params, body.is_vararg, body.body, None, implicit_self)?;
        let proto_index = self.builder.prototypes.len() as u32;
        self.builder.prototypes.push(proto);
        self.frame_mut().children.push(proto_index);

        let f = self.frame_mut();
        if f.constants.len() >= MAX_CONSTANTS {
            return Err(CompileError::TooManyConstants);
        }
        let const_idx = f.constants.len() as u32;
        f.constants.push(KConstant::Closure(proto_index));
        self.emit_ad(Opcode::NewClosure, dest, const_idx as i16, line);
        for (kind, src) in captures {
            let aux = (u8::from(kind) as u32) | ((src as u32) << 8);
            self.emit_raw(aux, line);
        }
        Ok(())
    }

    // ---- statements ----

    fn compile_block(&mut self, id: StatId) -> Result<(), CompileError> {
        let stats = match &self.ast.stat(id).kind {
            StatKind::Block(stats) => stats.clone(),
            _ => return self.compile_stat(id),
        };
        self.push_scope();
        for s in stats {
            self.compile_stat(s)?;
        }
        self.pop_scope();
        Ok(())
    }

    fn compile_stat(&mut self, id: StatId) -> Result<(), CompileError> {
        let stat = self.ast.stat(id).clone();
        let line = stat.location.start.line as i32;
        match stat.kind {
            StatKind::Block(_) => self.compile_block(id),
            StatKind::ExprStat(e) => {
                let mark = self.frame().next_register;
                self.compile_expr(e, None, line)?;
                self.free_to(mark);
                Ok(())
            }
            StatKind::Local { bindings, init } => {
                let mark = self.frame().next_register;
                let mut tmp = Vec::with_capacity(bindings.len());
                for (i, _) in bindings.iter().enumerate() {
                    let r = self.alloc_register();
                    if let Some(&e) = init.get(i) {
                        self.compile_expr(e, Some(r), line)?;
                    } else {
                        self.emit_abc(Opcode::LoadNull, r, 0, 0, line);
                    }
                    tmp.push(r);
                }
                self.free_to(mark);
                for (b, r) in bindings.iter().zip(tmp) {
                    self.declare_named_local(&b.name, r);
                }
                Ok(())
            }
            StatKind::Assignment { targets, values } => {
                let mark = self.frame().next_register;
                let mut tmp = Vec::with_capacity(values.len());
                for v in &values {
                    let r = self.alloc_register();
                    self.compile_expr(*v, Some(r), line)?;
                    tmp.push(r);
                }
                for (i, target) in targets.iter().enumerate() {
                    let src = match tmp.get(i).copied() {
                        Some(r) => r,
                        None => {
                            let r = self.alloc_register();
                            self.emit_abc(Opcode::LoadNull, r, 0, 0, line);
                            r
                        }
                    };
                    self.compile_assign_target(*target, src, line)?;
                }
                self.free_to(mark);
                Ok(())
            }
            StatKind::CompoundAssignment { op, target, value } => {
                let mark = self.frame().next_register;
                let lhs = self.alloc_register();
                self.compile_expr(target, Some(lhs), line)?;
                let rhs = self.alloc_register();
                self.compile_expr(value, Some(rhs), line)?;
                self.emit_abc(binary_opcode(op), lhs, lhs, rhs, line);
                self.compile_assign_target(target, lhs, line)?;
                self.free_to(mark);
                Ok(())
            }
            StatKind::If { cond, then_branch, elifs, else_branch } => {
                let mut end_patches = Vec::new();
                let mut next_test = self.compile_if_branch(cond, then_branch, line, &mut end_patches)?;
                for (c, b) in elifs {
                    self.patch_jump_here(next_test);
                    next_test = self.compile_if_branch(c, b, line, &mut end_patches)?;
                }
                self.patch_jump_here(next_test);
                if let Some(b) = else_branch {
                    self.compile_block(b)?;
                }
                for p in end_patches {
                    self.patch_jump_here(p);
                }
                Ok(())
            }
            StatKind::While { cond, body } => {
                let test_pc = self.here();
                let mark = self.frame().next_register;
                let cond_reg = self.alloc_register();
                self.compile_expr(cond, Some(cond_reg), line)?;
                let exit_jump = self.emit_ad(Opcode::JumpIfNot, cond_reg, 0, line);
                self.free_to(mark);
                self.frame_mut().loop_stack.push(LoopContext { continue_target: test_pc, break_patches: Vec::new() });
                self.compile_block(body)?;
                let back = self.emit_ad(Opcode::Jump, 0, 0, line);
                self.patch_jump_to(back, test_pc);
                self.patch_jump_here(exit_jump);
                self.end_loop();
                Ok(())
            }
            StatKind::Repeat { body, cond } => {
                let body_start = self.here();
                self.push_scope();
                self.frame_mut().loop_stack.push(LoopContext { continue_target: body_start, break_patches: Vec::new() });
                let stats = match self.ast.stat(body).kind.clone() {
                    StatKind::Block(s) => s,
                    _ => vec![body],
                };
                for s in stats {
                    self.compile_stat(s)?;
                }
                let mark = self.frame().next_register;
                let cond_reg = self.alloc_register();
                self.compile_expr(cond, Some(cond_reg), line)?;
                let back = self.emit_ad(Opcode::JumpIfNot, cond_reg, 0, line);
                self.patch_jump_to(back, body_start);
                self.free_to(mark);
                self.pop_scope();
                self.end_loop();
                Ok(())
            }
            StatKind::NumericFor { var, start, limit, step, body } => {
                self.compile_numeric_for(&var, start, limit, step, body, line)
            }
            StatKind::GenericFor { vars, exprs, body } => self.compile_generic_for(&vars, &exprs, body, line),
            StatKind::Function { name_chain, is_method, body } => {
                let mark = self.frame().next_register;
                let dest = self.alloc_register();
                self.compile_function_literal(&body, dest, line, is_method)?;
                self.compile_name_chain_assign(&name_chain, dest, line)?;
                self.free_to(mark);
                Ok(())
            }
            StatKind::LocalFunction { name, body } => {
                let reg = self.declare_local(&name)?;
                self.compile_function_literal(&body, reg, line, false)?;
                Ok(())
            }
            StatKind::Return(exprs) => {
                let mark = self.frame().next_register;
                let base = self.frame().next_register;
                for e in &exprs {
                    let r = self.alloc_register();
                    self.compile_expr(*e, Some(r), line)?;
                }
                self.emit_abc(Opcode::Return, base, exprs.len() as u8 + 1, 0, line);
                self.free_to(mark);
                Ok(())
            }
            StatKind::Break => {
                let pc = self.emit_ad(Opcode::Jump, 0, 0, line);
                self.frame_mut()
                    .loop_stack
                    .last_mut()
                    .ok_or(CompileError::BreakOutsideLoop)?
                    .break_patches
                    .push(pc);
                Ok(())
            }
            StatKind::Continue => {
                let target = self
                    .frame()
                    .loop_stack
                    .last()
                    .ok_or(CompileError::ContinueOutsideLoop)?
                    .continue_target;
                let pc = self.emit_ad(Opcode::Jump, 0, 0, line);
                self.patch_jump_to(pc, target);
                Ok(())
            }
            StatKind::Declare(_) | StatKind::TypeAlias { .. } | StatKind::Error => Ok(()),
        }
    }

    fn end_loop(&mut self) {
        let ctx = self.frame_mut().loop_stack.pop().expect("loop_stack pushed at loop entry");
        for p in ctx.break_patches {
            self.patch_jump_here(p);
        }
    }

    fn declare_named_local(&mut self, name: &str, reg: u8) {
        let name_idx = self.builder.intern_string(name);
        let pc = self.here() as u32;
        let f = self.frame_mut();
        f.locals.push((name.to_string(), reg));
        f.locals_debug.push(LocalVarInfo { name: name_idx, begin_pc: pc, end_pc: u32::MAX, register: reg });
    }

    /// Compiles one `if`/`elif` test + body; returns the pc of the
    /// `JumpIfNot` the caller must patch to the next test (or to the
    /// `else`/end, for the last one).
    fn compile_if_branch(&mut self, cond: ExprId, branch: StatId, line: i32, end_patches: &mut Vec<usize>) -> Result<usize, CompileError> {
        let mark = self.frame().next_register;
        let cond_reg = self.alloc_register();
        self.compile_expr(cond, Some(cond_reg), line)?;
        let skip = self.emit_ad(Opcode::JumpIfNot, cond_reg, 0, line);
        self.free_to(mark);
        self.compile_block(branch)?;
        end_patches.push(self.emit_ad(Opcode::Jump, 0, 0, line));
        Ok(skip)
    }

    /// `for var = start, limit[, step] do body end`. Lowers to the
    /// dedicated `ForNumericLoopPrepare`/`ForNumericLoop` pair over four
    /// consecutive registers `[limit, step, index, variable]`:
    /// `ForNumericLoopPrepare` is a conditional jump that skips the body
    /// entirely when the range is already exhausted or `step` is zero,
    /// and `ForNumericLoop` bumps `index`, copies it into `variable`,
    /// and jumps back to the body while still in range.
    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: ExprId,
        limit: ExprId,
        step: Option<ExprId>,
        body: StatId,
        line: i32,
    ) -> Result<(), CompileError> {
        self.push_scope();
        let base = self.alloc_register();
        self.compile_expr(limit, Some(base), line)?;
        let step_reg = self.alloc_register();
        match step {
            Some(e) => {
                self.compile_expr(e, Some(step_reg), line)?;
            }
            None => self.emit_load_number(step_reg, 1.0, line),
        }
        let index_reg = self.alloc_register();
        self.compile_expr(start, Some(index_reg), line)?;
        let var_reg = self.alloc_register();
        let skip = self.emit_ad(Opcode::ForNumericLoopPrepare, base, 0, line);
        self.emit_abc(Opcode::Move, var_reg, index_reg, 0, line);
        self.declare_named_local(var, var_reg);

        let body_start = self.here();
        self.frame_mut().loop_stack.push(LoopContext { continue_target: 0, break_patches: Vec::new() });
        self.compile_block(body)?;
        let loop_pc = self.emit_ad(Opcode::ForNumericLoop, base, 0, line);
        self.patch_jump_to(loop_pc, body_start);
        // `continue` re-enters at `ForNumericLoop` so the increment and
        // bound test still run.
        self.frame_mut().loop_stack.last_mut().unwrap().continue_target = loop_pc;
        self.patch_jump_here(skip);
        self.end_loop();
        self.pop_scope();
        Ok(())
    }

    /// `for vars in exprs do body end`, lowered as sugar over a driver
    /// call each iteration (spec §4.7's generic-for desugars the same
    /// way Lua's `TFORCALL`/`TFORLOOP` pair does): `f(s, ctrl)` is
    /// called every pass through `Next`, and the loop stops the first
    /// time the first returned value is falsy.
    fn compile_generic_for(&mut self, vars: &[String], exprs: &[ExprId], body: StatId, line: i32) -> Result<(), CompileError> {
        self.push_scope();
        let f = self.alloc_register();
        self.compile_iter_expr_or_null(exprs, 0, f, line)?;
        let s = self.alloc_register();
        self.compile_iter_expr_or_null(exprs, 1, s, line)?;
        let ctrl = self.alloc_register();
        self.compile_iter_expr_or_null(exprs, 2, ctrl, line)?;
        self.emit_abc(Opcode::NextPrepare, f, 0, 0, line);

        let var_regs: Vec<u8> = vars.iter().map(|_| self.alloc_register()).collect();
        let loop_start = self.here();
        self.emit_abc(Opcode::Next, f, var_regs.len() as u8, 0, line);
        let exit = self.emit_ad(Opcode::JumpIfNot, var_regs[0], 0, line);
        self.emit_abc(Opcode::Move, ctrl, var_regs[0], 0, line);

        for (name, reg) in vars.iter().zip(&var_regs) {
            self.declare_named_local(name, *reg);
        }
        self.frame_mut().loop_stack.push(LoopContext { continue_target: loop_start, break_patches: Vec::new() });
        self.compile_block(body)?;
        let back = self.emit_ad(Opcode::Jump, 0, 0, line);
        self.patch_jump_to(back, loop_start);
        self.patch_jump_here(exit);
        self.end_loop();
        self.pop_scope();
        Ok(())
    }

    fn compile_iter_expr_or_null(&mut self, exprs: &[ExprId], i: usize, dest: u8, line: i32) -> Result<(), CompileError> {
        match exprs.get(i) {
            Some(&e) => {
                self.compile_expr(e, Some(dest), line)?;
            }
            None => {
                self.emit_abc(Opcode::LoadNull, dest, 0, 0, line);
            }
        }
        Ok(())
    }

    fn compile_name_chain_assign(&mut self, name_chain: &[String], src: u8, line: i32) -> Result<(), CompileError> {
        let Some((first, rest)) = name_chain.split_first() else {
            return Ok(());
        };
        if rest.is_empty() {
            return self.assign_name(first, src, line);
        }
        let mark = self.frame().next_register;
        let mut obj = self.alloc_register();
        self.load_name(first, obj, line)?;
        for seg in &rest[..rest.len() - 1] {
            let next = self.alloc_register();
            let name_idx = self.builder.intern_string(seg);
            let slot = self.next_cache_slot();
            self.emit_abc(Opcode::LoadTableStringKey, next, obj, 0, line);
            self.emit_raw((slot << 24) | name_idx, line);
            obj = next;
        }
        let last = rest.last().unwrap();
        let name_idx = self.builder.intern_string(last);
        let slot = self.next_cache_slot();
        self.emit_abc(Opcode::SetTableStringKey, obj, src, 0, line);
        self.emit_raw((slot << 24) | name_idx, line);
        self.free_to(mark);
        Ok(())
    }

    fn load_name(&mut self, name: &str, dest: u8, line: i32) -> Result<(), CompileError> {
        match self.resolve_name(name) {
            Resolved::Local(reg) => {
                if reg != dest {
                    self.emit_abc(Opcode::Move, dest, reg, 0, line);
                }
            }
            Resolved::Upvalue(idx) => {
                self.emit_ad(Opcode::LoadUpvalue, dest, idx as i16, line);
            }
            Resolved::Global => {
                let name_idx = self.builder.intern_string(name);
                self.emit_ad(Opcode::LoadGlobal, dest, name_idx as i16, line);
            }
        }
        Ok(())
    }

    fn assign_name(&mut self, name: &str, src: u8, line: i32) -> Result<(), CompileError> {
        match self.resolve_name(name) {
            Resolved::Local(reg) => {
                self.emit_abc(Opcode::Move, reg, src, 0, line);
            }
            Resolved::Upvalue(idx) => {
                self.emit_ad(Opcode::SetUpvalue, src, idx as i16, line);
            }
            Resolved::Global => {
                let name_idx = self.builder.intern_string(name);
                self.emit_ad(Opcode::SetGlobal, src, name_idx as i16, line);
            }
        }
        Ok(())
    }

    fn compile_assign_target(&mut self, target: ExprId, src: u8, line: i32) -> Result<(), CompileError> {
        match self.ast.expr(target).kind.clone() {
            ExprKind::Local(name) | ExprKind::Global(name) => self.assign_name(&name, src, line),
            ExprKind::IndexName { object, name } => {
                let mark = self.frame().next_register;
                let obj_reg = self.alloc_register();
                self.compile_expr(object, Some(obj_reg), line)?;
                let name_idx = self.builder.intern_string(&name);
                let slot = self.next_cache_slot();
                self.emit_abc(Opcode::SetTableStringKey, obj_reg, src, 0, line);
                self.emit_raw((slot << 24) | name_idx, line);
                self.free_to(mark);
                Ok(())
            }
            ExprKind::IndexExpr { object, index } => {
                let mark = self.frame().next_register;
                let obj_reg = self.alloc_register();
                self.compile_expr(object, Some(obj_reg), line)?;
                let idx_reg = self.alloc_register();
                self.compile_expr(index, Some(idx_reg), line)?;
                self.emit_abc(Opcode::SetTable, obj_reg, idx_reg, src, line);
                self.free_to(mark);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ---- expressions ----

    /// Compiles `id`, landing its value in `dest` (a fresh register
    /// when `None`); returns the register actually used.
    fn compile_expr(&mut self, id: ExprId, dest: Option<u8>, line: i32) -> Result<u8, CompileError> {
        let expr = self.ast.expr(id).clone();
        let line = expr.location.start.line as i32;
        let dest = dest.unwrap_or_else(|| self.alloc_register());
        match expr.kind {
            ExprKind::Constant(Constant::Null) => {
                self.emit_abc(Opcode::LoadNull, dest, 0, 0, line);
            }
            ExprKind::Constant(Constant::Bool(b)) => {
                self.emit_abc(Opcode::LoadBoolean, dest, b as u8, 0, line);
            }
            ExprKind::Constant(Constant::Number(n)) => {
                self.emit_load_number(dest, n, line);
            }
            ExprKind::Constant(Constant::Str(s)) => {
                let idx = self.add_string_constant(&s);
                self.emit_ad(Opcode::LoadKey, dest, idx as i16, line);
            }
            ExprKind::Varargs => {
                self.emit_abc(Opcode::LoadVarargs, dest, 1, 0, line);
            }
            ExprKind::Local(name) | ExprKind::Global(name) => self.load_name(&name, dest, line)?,
            ExprKind::Unary(op, operand) => {
                let mark = self.frame().next_register;
                let src = self.compile_expr(operand, None, line)?;
                match op {
                    UnOp::Neg => self.emit_abc(Opcode::Unm, dest, src, 0, line),
                    UnOp::Not => self.emit_abc(Opcode::Not, dest, src, 0, line),
                    UnOp::Len => self.emit_abc(Opcode::Len, dest, src, 0, line),
                };
                self.free_to(mark);
            }
            ExprKind::Binary(BinOp::And, lhs, rhs) => {
                self.compile_expr(lhs, Some(dest), line)?;
                let skip = self.emit_ad(Opcode::JumpIfNot, dest, 0, line);
                self.compile_expr(rhs, Some(dest), line)?;
                self.patch_jump_here(skip);
            }
            ExprKind::Binary(BinOp::Or, lhs, rhs) => {
                self.compile_expr(lhs, Some(dest), line)?;
                let skip = self.emit_ad(Opcode::JumpIf, dest, 0, line);
                self.compile_expr(rhs, Some(dest), line)?;
                self.patch_jump_here(skip);
            }
            ExprKind::Binary(op @ (BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge), lhs, rhs) => {
                let mark = self.frame().next_register;
                let l = self.compile_expr(lhs, None, line)?;
                let r = self.compile_expr(rhs, None, line)?;
                self.compile_comparison(op, l, r, dest, line);
                self.free_to(mark);
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let mark = self.frame().next_register;
                let l = self.compile_expr(lhs, None, line)?;
                let r = self.compile_expr(rhs, None, line)?;
                self.emit_abc(binary_opcode(op), dest, l, r, line);
                self.free_to(mark);
            }
            ExprKind::TypeAssertion(inner, _) => {
                self.compile_expr(inner, Some(dest), line)?;
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                let mark = self.frame().next_register;
                let cond_reg = self.alloc_register();
                self.compile_expr(cond, Some(cond_reg), line)?;
                let skip = self.emit_ad(Opcode::JumpIfNot, cond_reg, 0, line);
                self.free_to(mark);
                self.compile_expr(then_branch, Some(dest), line)?;
                let end = self.emit_ad(Opcode::Jump, 0, 0, line);
                self.patch_jump_here(skip);
                self.compile_expr(else_branch, Some(dest), line)?;
                self.patch_jump_here(end);
            }
            ExprKind::IndexName { object, name } => {
                let mark = self.frame().next_register;
                let obj = self.compile_expr(object, None, line)?;
                let name_idx = self.builder.intern_string(&name);
                let slot = self.next_cache_slot();
                self.emit_abc(Opcode::LoadTableStringKey, dest, obj, 0, line);
                self.emit_raw((slot << 24) | name_idx, line);
                self.free_to(mark);
            }
            ExprKind::IndexExpr { object, index } => {
                let mark = self.frame().next_register;
                let obj = self.compile_expr(object, None, line)?;
                let idx = self.compile_expr(index, None, line)?;
                self.emit_abc(Opcode::LoadTable, dest, obj, idx, line);
                self.free_to(mark);
            }
            ExprKind::Call { callee, args, method_name } => {
                self.compile_call(callee, &args, method_name.as_deref(), dest, line)?;
            }
            ExprKind::Function(body) => {
                self.compile_function_literal(&body, dest, line, false)?;
            }
            ExprKind::Table(items) => {
                self.compile_table(&items, dest, line)?;
            }
            ExprKind::Error | ExprKind::CompoundAssign(..) => {
                self.emit_abc(Opcode::LoadNull, dest, 0, 0, line);
            }
        }
        Ok(dest)
    }

    /// Lowers `==`/`~=`/`<`/`<=`/`>`/`>=` to a value via test-then-set:
    /// run the two-word compare-jump, default to `false`, and flip to
    /// `true` only along the taken branch.
    fn compile_comparison(&mut self, op: BinOp, lhs: u8, rhs: u8, dest: u8, line: i32) {
        let (opcode, a, b) = match op {
            BinOp::Eq => (Opcode::JumpIfEq, lhs, rhs),
            BinOp::Ne => (Opcode::JumpIfNe, lhs, rhs),
            BinOp::Lt => (Opcode::JumpIfLt, lhs, rhs),
            BinOp::Le => (Opcode::JumpIfLe, lhs, rhs),
            BinOp::Gt => (Opcode::JumpIfLt, rhs, lhs),
            BinOp::Ge => (Opcode::JumpIfLe, rhs, lhs),
            _ => unreachable!("compile_comparison only called for comparison operators"),
        };
        let header = self.emit_abc(opcode, a, b, 0, line);
        self.emit_raw(0, line);
        self.emit_abc(Opcode::LoadBoolean, dest, 0, 0, line);
        let skip = self.emit_ad(Opcode::Jump, 0, 0, line);
        self.patch_compare_jump(header, self.here());
        self.emit_abc(Opcode::LoadBoolean, dest, 1, 0, line);
        self.patch_jump_here(skip);
    }

    fn emit_load_number(&mut self, dest: u8, n: f64, line: i32) {
        let idx = self.number_constant(n);
        self.emit_ad(Opcode::LoadNumber, dest, idx as i16, line);
    }

    fn number_constant(&mut self, n: f64) -> u32 {
        let bits = n.to_bits();
        let f = self.frame_mut();
        if let Some(&idx) = f.number_const.get(&bits) {
            return idx;
        }
        let idx = f.constants.len() as u32;
        f.constants.push(KConstant::Number(n));
        f.number_const.insert(bits, idx);
        idx
    }

    fn add_string_constant(&mut self, s: &str) -> u32 {
        let string_idx = self.builder.intern_string(s);
        let f = self.frame_mut();
        for (i, c) in f.constants.iter().enumerate() {
            if let KConstant::String(existing) = c {
                if *existing == string_idx {
                    return i as u32;
                }
            }
        }
        let idx = f.constants.len() as u32;
        f.constants.push(KConstant::String(string_idx));
        idx
    }

    fn compile_call(&mut self, callee: ExprId, args: &[ExprId], method_name: Option<&str>, dest: u8, line: i32) -> Result<(), CompileError> {
        let mark = self.frame().next_register;
        let func_reg = self.alloc_register();
        self.compile_expr(callee, Some(func_reg), line)?;

        if let Some(name) = method_name {
            // `NamedCall`'s contract: on entry `a` holds the receiver;
            // on completion `a` holds the resolved method and `a + 1`
            // holds a copy of the receiver, ready to serve as `self`.
            let name_idx = self.builder.intern_string(name);
            let slot = self.next_cache_slot();
            self.emit_abc(Opcode::NamedCall, func_reg, 0, 0, line);
            self.emit_raw((slot << 24) | name_idx, line);
            self.alloc_register(); // claims func_reg + 1 (self), already populated by NamedCall
        }

        let fastcall_site = if method_name.is_none() { self.lookup_fastcall(callee) } else { None };

        for a in args {
            let r = self.alloc_register();
            self.compile_expr(*a, Some(r), line)?;
        }
        let nargs = self.frame().next_register - func_reg - 1;
        if let Some(site) = fastcall_site {
            self.emit_fastcall(site, args, func_reg, nargs, line);
        }
        self.emit_abc(Opcode::Call, func_reg, nargs + 1, 2, line);
        if func_reg != dest {
            self.emit_abc(Opcode::Move, dest, func_reg, 0, line);
        }
        self.free_to(mark.max(dest + 1));
        Ok(())
    }

    /// Recognizes a call site the interpreter can attempt inline before
    /// falling back to the ordinary `Call` that follows (spec §4.9):
    /// a bare or namespaced reference to one of the fixed builtins,
    /// still resolving to a global at this point in the function (a
    /// local or upvalue of the same name shadows the optimization, not
    /// just the call). Returns the builtin id, its fixed arity (`0` for
    /// the handful whose argument count varies call to call), and
    /// whether a two-argument form is eligible for the `FastCall2Key`
    /// encoding when its second argument is a literal number.
    fn lookup_fastcall(&mut self, callee: ExprId) -> Option<(FastcallBuiltin, u8, bool)> {
        match self.ast.expr(callee).kind.clone() {
            ExprKind::Local(name) | ExprKind::Global(name) => {
                if !matches!(self.resolve_name(&name), Resolved::Global) {
                    return None;
                }
                bare_fastcall_builtin(&name)
            }
            ExprKind::IndexName { object, name } => {
                let (ExprKind::Local(obj_name) | ExprKind::Global(obj_name)) = self.ast.expr(object).kind.clone() else {
                    return None;
                };
                if !matches!(self.resolve_name(&obj_name), Resolved::Global) {
                    return None;
                }
                namespaced_fastcall_builtin(&obj_name, &name)
            }
            _ => None,
        }
    }

    fn emit_fastcall(&mut self, site: (FastcallBuiltin, u8, bool), args: &[ExprId], func_reg: u8, nargs: u8, line: i32) {
        let (builtin, fixed_arity, key_eligible) = site;
        let builtin_id: u8 = builtin.into();
        if fixed_arity != 0 && nargs != fixed_arity {
            return;
        }
        match fixed_arity {
            0 => {
                self.emit_abc(Opcode::FastCall, func_reg, builtin_id, 0, line);
            }
            1 => {
                self.emit_abc(Opcode::FastCall1, func_reg, builtin_id, 0, line);
            }
            2 => {
                if key_eligible {
                    if let ExprKind::Constant(Constant::Number(n)) = self.ast.expr(args[1]).kind {
                        let idx = self.number_constant(n);
                        self.emit_abc(Opcode::FastCall2Key, func_reg, builtin_id, 0, line);
                        self.emit_raw(idx, line);
                        return;
                    }
                }
                self.emit_abc(Opcode::FastCall2, func_reg, builtin_id, 0, line);
            }
            _ => unreachable!("fastcall sites are only ever 0 (variable), 1, or 2 arity"),
        }
    }

    fn compile_table(&mut self, items: &[TableItem], dest: u8, line: i32) -> Result<(), CompileError> {
        self.emit_ad(Opcode::NewTable, dest, 0, line);
        let mark = self.frame().next_register;
        let mut list_index = 1i64;
        for item in items {
            match item {
                TableItem::List(e) => {
                    let r = self.alloc_register();
                    self.compile_expr(*e, Some(r), line)?;
                    let key_idx = self.number_constant(list_index as f64);
                    self.emit_abc(Opcode::SetTableNumberKey, dest, r, 0, line);
                    self.emit_raw(key_idx, line);
                    list_index += 1;
                    self.free_to(mark);
                }
                TableItem::Record(name, e) => {
                    let r = self.alloc_register();
                    self.compile_expr(*e, Some(r), line)?;
                    let name_idx = self.builder.intern_string(name);
                    let slot = self.next_cache_slot();
                    self.emit_abc(Opcode::SetTableStringKey, dest, r, 0, line);
                    self.emit_raw((slot << 24) | name_idx, line);
                    self.free_to(mark);
                }
                TableItem::General(k, v) => {
                    let kr = self.alloc_register();
                    self.compile_expr(*k, Some(kr), line)?;
                    let vr = self.alloc_register();
                    self.compile_expr(*v, Some(vr), line)?;
                    self.emit_abc(Opcode::SetTable, dest, kr, vr, line);
                    self.free_to(mark);
                }
            }
        }
        Ok(())
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Plus,
        BinOp::Sub => Opcode::Minus,
        BinOp::Mul => Opcode::Multiply,
        BinOp::Div => Opcode::Divide,
        BinOp::Mod => Opcode::Modulus,
        BinOp::Pow => Opcode::Pow,
        BinOp::And => Opcode::LogicalAnd,
        BinOp::Or => Opcode::LogicalOr,
        // String concatenation dispatches through the same tagged-method
        // path as numeric addition; there is no separate opcode for it.
        BinOp::Concat => Opcode::Plus,
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            unreachable!("comparisons are lowered by compile_comparison, not binary_opcode")
        }
    }
}

/// Bare-name fastcall candidates, with the fixed argument count
/// `emit_fastcall` needs to pick `FastCall1`/`FastCall2` over the
/// generic `FastCall` (`0` marks a variable argument count).
fn bare_fastcall_builtin(name: &str) -> Option<(FastcallBuiltin, u8, bool)> {
    use FastcallBuiltin::*;
    Some(match name {
        "assert" => (Assert, 0, false),
        "typeof" => (Typeof, 1, false),
        "raw_get" => (RawGet, 2, false),
        "raw_set" => (RawSet, 0, false),
        "raw_equal" => (RawEqual, 2, false),
        "vector" => (Vector, 0, false),
        _ => return None,
    })
}

/// Namespaced fastcall candidates (`math.abs`, `bits.band`, ...). The
/// `bool` marks the builtins where a literal-number second argument can
/// skip the register entirely via `FastCall2Key`.
fn namespaced_fastcall_builtin(namespace: &str, name: &str) -> Option<(FastcallBuiltin, u8, bool)> {
    use FastcallBuiltin::*;
    Some(match (namespace, name) {
        ("math", "abs") => (MathAbs, 1, false),
        ("math", "floor") => (MathFloor, 1, false),
        ("math", "ceil") => (MathCeil, 1, false),
        ("math", "sqrt") => (MathSqrt, 1, false),
        ("math", "min") => (MathMin, 2, true),
        ("math", "max") => (MathMax, 2, true),
        ("bits", "band") => (BitsBand, 2, true),
        ("bits", "bor") => (BitsBor, 2, true),
        ("bits", "bxor") => (BitsBxor, 2, true),
        ("bits", "bnot") => (BitsBnot, 1, false),
        ("bits", "lshift") => (BitsLshift, 2, true),
        ("bits", "rshift") => (BitsRshift, 2, true),
        ("string", "sub") => (StringSub, 0, false),
        ("table", "insert") => (TableInsert, 0, false),
        ("table", "unpack") => (TableUnpack, 1, false),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::optimize;
    use crate::parser::parse;

    fn compile_source(src: &str) -> Chunk {
        let mut result = parse(src.as_bytes());
        assert!(result.errors.is_empty(), "unexpected parse errors: {:?}", result.errors);
        optimize(&mut result.ast, result.root);
        compile(&result.ast, result.root, Some("test")).expect("compiles")
    }

    fn main_proto(chunk: &Chunk) -> &Prototype {
        &chunk.prototypes[chunk.main_prototype as usize]
    }

    #[test]
    fn compiles_local_arithmetic() {
        let chunk = compile_source("local x = 1 + 2\nreturn x");
        let proto = main_proto(&chunk);
        assert!(proto.max_stack_size > 0);
        assert!(!proto.code.is_empty());
    }

    #[test]
    fn compiles_if_and_loop() {
        let chunk = compile_source("local n = 0\nwhile n < 10 do\n  n = n + 1\nend\nreturn n");
        let proto = main_proto(&chunk);
        let has_jump_if_not = proto.code.iter().any(|w| (*w & 0xFF) as u8 == u8::from(Opcode::JumpIfNot));
        assert!(has_jump_if_not);
    }

    #[test]
    fn compiles_closure_with_upvalue() {
        let chunk = compile_source("local function counter()\n  local n = 0\n  return function()\n    n = n + 1\n    return n\n  end\nend\nreturn counter");
        assert!(chunk.prototypes.len() >= 3); // top level, counter, inner closure
        let inner = chunk.prototypes.iter().find(|p| p.num_upvalues > 0);
        assert!(inner.is_some(), "inner closure should capture `n` as an upvalue");
    }

    #[test]
    fn break_inside_while_closes_upvalues_only_when_captured() {
        let chunk = compile_source("while true do\n  local x = 1\n  break\nend");
        let proto = main_proto(&chunk);
        let closes = proto.code.iter().filter(|w| (**w & 0xFF) as u8 == u8::from(Opcode::CloseUpvalues)).count();
        assert_eq!(closes, 0, "an uncaptured local needs no CloseUpvalues");
    }

    #[test]
    fn every_prototype_respects_the_stack_size_invariant() {
        let chunk = compile_source("local t = {1, 2, x = 3}\nfor i = 1, 10 do\n  t.x = t.x + i\nend\nreturn t");
        for proto in &chunk.prototypes {
            if !proto.code.is_empty() {
                assert!(proto.max_stack_size > 0);
            }
        }
    }
}
