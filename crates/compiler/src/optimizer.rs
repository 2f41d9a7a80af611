//! The constant-folding and dead-code optimizer pipeline (spec §4.8).
//!
//! Each pass is a small, independently testable rewrite over the AST.
//! They run in a fixed order because later passes rely on earlier ones
//! having already simplified their input (e.g. `constant_if_optimizer`
//! only prunes branches once `constant_fold_optimizer` has reduced the
//! condition to a literal).

use crate::ast::{Ast, BinOp, Constant, ExprId, ExprKind, StatId, StatKind, UnOp};

pub fn optimize(ast: &mut Ast, root: StatId) {
    constant_fold_optimizer(ast, root);
    binary_fold_optimizer(ast, root);
    constant_if_optimizer(ast, root);
    block_optimizer(ast, root);
    dead_code_optimizer(ast, root);
    assign_decl_optimizer(ast, root);
    unused_return_optimizer(ast, root);
}

fn expr_ids_in_stat(ast: &Ast, id: StatId) -> Vec<ExprId> {
    let mut out = Vec::new();
    match &ast.stat(id).kind {
        StatKind::If { cond, elifs, .. } => {
            out.push(*cond);
            out.extend(elifs.iter().map(|(c, _)| *c));
        }
        StatKind::While { cond, .. } | StatKind::Repeat { cond, .. } => out.push(*cond),
        StatKind::NumericFor { start, limit, step, .. } => {
            out.push(*start);
            out.push(*limit);
            if let Some(s) = step {
                out.push(*s);
            }
        }
        StatKind::GenericFor { exprs, .. } => out.extend(exprs.iter().copied()),
        StatKind::Local { init, .. } => out.extend(init.iter().copied()),
        StatKind::Assignment { targets, values } => {
            out.extend(targets.iter().copied());
            out.extend(values.iter().copied());
        }
        StatKind::CompoundAssignment { target, value, .. } => {
            out.push(*target);
            out.push(*value);
        }
        StatKind::Return(exprs) => out.extend(exprs.iter().copied()),
        StatKind::ExprStat(e) => out.push(*e),
        _ => {}
    }
    out
}

fn child_stats(ast: &Ast, id: StatId) -> Vec<StatId> {
    match &ast.stat(id).kind {
        StatKind::Block(stats) => stats.clone(),
        StatKind::If { then_branch, elifs, else_branch, .. } => {
            let mut v = vec![*then_branch];
            v.extend(elifs.iter().map(|(_, b)| *b));
            if let Some(b) = else_branch {
                v.push(*b);
            }
            v
        }
        StatKind::While { body, .. }
        | StatKind::Repeat { body, .. }
        | StatKind::NumericFor { body, .. }
        | StatKind::GenericFor { body, .. } => vec![*body],
        StatKind::Function { body, .. } | StatKind::LocalFunction { body, .. } => vec![body.body],
        _ => Vec::new(),
    }
}

/// Recursively fold constant subexpressions: `1 + 2` becomes `3`,
/// `not true` becomes `false`, and so on. Runs bottom-up so nested
/// folds compose (`(1 + 2) * 3` folds to `9` in one pass).
pub fn constant_fold_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        for e in expr_ids_in_stat(ast, stat) {
            fold_expr(ast, e);
        }
        rewrite_stat_exprs(ast, stat, fold_expr);
    }
}

fn fold_expr(ast: &mut Ast, id: ExprId) -> ExprId {
    let kind = ast.expr(id).kind.clone();
    let location = ast.expr(id).location;
    match kind {
        ExprKind::Unary(op, operand) => {
            let operand = fold_expr(ast, operand);
            if let ExprKind::Constant(c) = &ast.expr(operand).kind {
                if let Some(folded) = fold_unary(op, c) {
                    return replace_expr(ast, id, ExprKind::Constant(folded), location);
                }
            }
            set_expr(ast, id, ExprKind::Unary(op, operand));
            id
        }
        ExprKind::Binary(op, lhs, rhs) => {
            let lhs = fold_expr(ast, lhs);
            let rhs = fold_expr(ast, rhs);
            if let (ExprKind::Constant(l), ExprKind::Constant(r)) = (&ast.expr(lhs).kind, &ast.expr(rhs).kind) {
                if let Some(folded) = fold_binary(op, l, r) {
                    return replace_expr(ast, id, ExprKind::Constant(folded), location);
                }
            }
            set_expr(ast, id, ExprKind::Binary(op, lhs, rhs));
            id
        }
        ExprKind::TypeAssertion(inner, ty) => {
            let inner = fold_expr(ast, inner);
            set_expr(ast, id, ExprKind::TypeAssertion(inner, ty));
            id
        }
        ExprKind::If { cond, then_branch, else_branch } => {
            let cond = fold_expr(ast, cond);
            let then_branch = fold_expr(ast, then_branch);
            let else_branch = fold_expr(ast, else_branch);
            set_expr(ast, id, ExprKind::If { cond, then_branch, else_branch });
            id
        }
        ExprKind::Call { callee, args, method_name } => {
            let callee = fold_expr(ast, callee);
            let args = args.into_iter().map(|a| fold_expr(ast, a)).collect();
            set_expr(ast, id, ExprKind::Call { callee, args, method_name });
            id
        }
        ExprKind::IndexExpr { object, index } => {
            let object = fold_expr(ast, object);
            let index = fold_expr(ast, index);
            set_expr(ast, id, ExprKind::IndexExpr { object, index });
            id
        }
        ExprKind::IndexName { object, name } => {
            let object = fold_expr(ast, object);
            set_expr(ast, id, ExprKind::IndexName { object, name });
            id
        }
        _ => id,
    }
}

fn fold_unary(op: UnOp, c: &Constant) -> Option<Constant> {
    match (op, c) {
        (UnOp::Not, Constant::Bool(b)) => Some(Constant::Bool(!b)),
        (UnOp::Not, Constant::Null) => Some(Constant::Bool(true)),
        (UnOp::Neg, Constant::Number(n)) => Some(Constant::Number(-n)),
        (UnOp::Len, Constant::Str(s)) => Some(Constant::Number(s.len() as f64)),
        _ => None,
    }
}

fn fold_binary(op: BinOp, l: &Constant, r: &Constant) -> Option<Constant> {
    use Constant::*;
    match (op, l, r) {
        (BinOp::Add, Number(a), Number(b)) => Some(Number(a + b)),
        (BinOp::Sub, Number(a), Number(b)) => Some(Number(a - b)),
        (BinOp::Mul, Number(a), Number(b)) => Some(Number(a * b)),
        (BinOp::Div, Number(a), Number(b)) => Some(Number(a / b)),
        (BinOp::Mod, Number(a), Number(b)) => Some(Number(a.rem_euclid(*b))),
        (BinOp::Pow, Number(a), Number(b)) => Some(Number(a.powf(*b))),
        (BinOp::Eq, a, b) => Some(Bool(constants_equal(a, b))),
        (BinOp::Ne, a, b) => Some(Bool(!constants_equal(a, b))),
        (BinOp::Lt, Number(a), Number(b)) => Some(Bool(a < b)),
        (BinOp::Le, Number(a), Number(b)) => Some(Bool(a <= b)),
        (BinOp::Gt, Number(a), Number(b)) => Some(Bool(a > b)),
        (BinOp::Ge, Number(a), Number(b)) => Some(Bool(a >= b)),
        (BinOp::Concat, Str(a), Str(b)) => Some(Str(format!("{a}{b}"))),
        (BinOp::And, Bool(a), b) => Some(if *a { b.clone() } else { Bool(false) }),
        (BinOp::Or, Bool(a), b) => Some(if *a { Bool(true) } else { b.clone() }),
        _ => None,
    }
}

fn constants_equal(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Null, Constant::Null) => true,
        (Constant::Bool(x), Constant::Bool(y)) => x == y,
        (Constant::Number(x), Constant::Number(y)) => x == y,
        (Constant::Str(x), Constant::Str(y)) => x == y,
        _ => false,
    }
}

/// Algebraic identities that constant folding alone can't reach because
/// one side isn't a literal: `x + 0`, `x * 1`, `x * 0`, `x and true`,
/// `x or false`.
pub fn binary_fold_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        rewrite_stat_exprs(ast, stat, apply_identity_rec);
    }
}

fn apply_identity_rec(ast: &mut Ast, id: ExprId) -> ExprId {
    let kind = ast.expr(id).kind.clone();
    if let ExprKind::Binary(op, lhs, rhs) = kind {
        let lhs = apply_identity_rec(ast, lhs);
        let rhs = apply_identity_rec(ast, rhs);
        let location = ast.expr(id).location;
        let lhs_const = constant_of(ast, lhs);
        let rhs_const = constant_of(ast, rhs);
        match (op, lhs_const, rhs_const) {
            (BinOp::Add, _, Some(Constant::Number(n))) if n == 0.0 => return replace_alias(ast, id, lhs, location),
            (BinOp::Add, Some(Constant::Number(n)), _) if n == 0.0 => return replace_alias(ast, id, rhs, location),
            (BinOp::Sub, _, Some(Constant::Number(n))) if n == 0.0 => return replace_alias(ast, id, lhs, location),
            (BinOp::Mul, _, Some(Constant::Number(n))) if n == 1.0 => return replace_alias(ast, id, lhs, location),
            (BinOp::Mul, Some(Constant::Number(n)), _) if n == 1.0 => return replace_alias(ast, id, rhs, location),
            (BinOp::Mul, _, Some(Constant::Number(n))) if n == 0.0 => {
                return replace_expr(ast, id, ExprKind::Constant(Constant::Number(0.0)), location)
            }
            (BinOp::Mul, Some(Constant::Number(n)), _) if n == 0.0 => {
                return replace_expr(ast, id, ExprKind::Constant(Constant::Number(0.0)), location)
            }
            (BinOp::And, _, Some(Constant::Bool(true))) => return replace_alias(ast, id, lhs, location),
            (BinOp::Or, _, Some(Constant::Bool(false))) => return replace_alias(ast, id, lhs, location),
            _ => {}
        }
        set_expr(ast, id, ExprKind::Binary(op, lhs, rhs));
        return id;
    }
    id
}

fn constant_of(ast: &Ast, id: ExprId) -> Option<Constant> {
    match &ast.expr(id).kind {
        ExprKind::Constant(c) => Some(c.clone()),
        _ => None,
    }
}

/// Collapses `if true then A else B end` to `A`'s contents in place and
/// similarly for a statically-false condition (spec §8 scenario 3 runs
/// constant folding through here).
pub fn constant_if_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        let kind = ast.stat(stat).kind.clone();
        if let StatKind::If { cond, then_branch, elifs, else_branch } = kind {
            if elifs.is_empty() {
                if let ExprKind::Constant(c) = &ast.expr(cond).kind {
                    let truthy = is_truthy(c);
                    let replacement = if truthy {
                        Some(then_branch)
                    } else {
                        else_branch
                    };
                    let new_kind = match replacement {
                        Some(branch) => ast.stat(branch).kind.clone(),
                        None => StatKind::Block(Vec::new()),
                    };
                    ast.stats.get_mut(stat.0).kind = new_kind;
                }
            }
        }
    }
}

fn is_truthy(c: &Constant) -> bool {
    !matches!(c, Constant::Null | Constant::Bool(false))
}

/// Drops statements that can never run because an earlier statement in
/// the same block unconditionally transfers control (`return`, `break`,
/// `continue`).
pub fn dead_code_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        let kind = ast.stat(stat).kind.clone();
        if let StatKind::Block(stats) = kind {
            let mut kept = Vec::with_capacity(stats.len());
            for s in stats {
                let terminal = kept.last().is_some_and(|&last: &StatId| is_terminator(ast, last));
                if terminal {
                    break;
                }
                kept.push(s);
            }
            ast.stats.get_mut(stat.0).kind = StatKind::Block(kept);
        }
    }
}

fn is_terminator(ast: &Ast, id: StatId) -> bool {
    matches!(ast.stat(id).kind, StatKind::Return(_) | StatKind::Break | StatKind::Continue)
}

/// Merges an immediately-following single-target assignment into a
/// `local` declaration that had no initializer: `local x\nx = 1`
/// becomes `local x = 1`. Leaves anything more complex (multiple
/// bindings, intervening statements) alone.
pub fn assign_decl_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        let kind = ast.stat(stat).kind.clone();
        if let StatKind::Block(stats) = kind {
            let mut merged = Vec::with_capacity(stats.len());
            let mut i = 0;
            while i < stats.len() {
                if i + 1 < stats.len() {
                    let is_match = matches!(
                        (&ast.stat(stats[i]).kind, &ast.stat(stats[i + 1]).kind),
                        (StatKind::Local { bindings, init }, StatKind::Assignment { targets, values })
                            if init.is_empty()
                                && bindings.len() == 1
                                && targets.len() == 1
                                && values.len() == 1
                                && matches!(&ast.expr(targets[0]).kind, ExprKind::Global(n) | ExprKind::Local(n) if *n == bindings[0].name)
                    );
                    if is_match {
                        let StatKind::Local { bindings, .. } = ast.stat(stats[i]).kind.clone() else { unreachable!() };
                        let StatKind::Assignment { values, .. } = ast.stat(stats[i + 1]).kind.clone() else {
                            unreachable!()
                        };
                        let loc = ast.stat(stats[i]).location;
                        ast.stats.get_mut(stats[i].0).kind = StatKind::Local { bindings, init: values };
                        ast.stats.get_mut(stats[i].0).location = loc;
                        merged.push(stats[i]);
                        i += 2;
                        continue;
                    }
                }
                merged.push(stats[i]);
                i += 1;
            }
            ast.stats.get_mut(stat.0).kind = StatKind::Block(merged);
        }
    }
}

/// Drops a bare trailing `return` with no values at the end of a
/// function body; it's a no-op since falling off the end of a block
/// behaves identically.
pub fn unused_return_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        let kind = ast.stat(stat).kind.clone();
        if let StatKind::Block(mut stats) = kind {
            if matches!(stats.last(), Some(&last) if matches!(&ast.stat(last).kind, StatKind::Return(exprs) if exprs.is_empty()))
            {
                stats.pop();
                ast.stats.get_mut(stat.0).kind = StatKind::Block(stats);
            }
        }
    }
}

/// Flattens a block whose only statement is itself a block, and drops
/// statement-less blocks nested directly inside another block.
pub fn block_optimizer(ast: &mut Ast, root: StatId) {
    for stat in all_stats(ast, root) {
        let kind = ast.stat(stat).kind.clone();
        if let StatKind::Block(stats) = kind {
            let mut flat = Vec::with_capacity(stats.len());
            for s in stats {
                match &ast.stat(s).kind {
                    StatKind::Block(inner) => flat.extend(inner.iter().copied()),
                    _ => flat.push(s),
                }
            }
            ast.stats.get_mut(stat.0).kind = StatKind::Block(flat);
        }
    }
}

fn set_expr(ast: &mut Ast, id: ExprId, kind: ExprKind) {
    ast.exprs.get_mut(id.0).kind = kind;
}

fn replace_expr(ast: &mut Ast, id: ExprId, kind: ExprKind, location: crate::diagnostics::Location) -> ExprId {
    ast.exprs.get_mut(id.0).kind = kind;
    ast.exprs.get_mut(id.0).location = location;
    id
}

fn replace_alias(ast: &mut Ast, id: ExprId, source: ExprId, location: crate::diagnostics::Location) -> ExprId {
    let kind = ast.expr(source).kind.clone();
    replace_expr(ast, id, kind, location)
}

/// Rewrites every direct expression reference held by a statement using
/// `f`, writing the (possibly new) id back into the statement.
fn rewrite_stat_exprs(ast: &mut Ast, id: StatId, f: impl Fn(&mut Ast, ExprId) -> ExprId) {
    let mut kind = ast.stat(id).kind.clone();
    match &mut kind {
        StatKind::If { cond, elifs, .. } => {
            *cond = f(ast, *cond);
            for (c, _) in elifs.iter_mut() {
                *c = f(ast, *c);
            }
        }
        StatKind::While { cond, .. } | StatKind::Repeat { cond, .. } => *cond = f(ast, *cond),
        StatKind::NumericFor { start, limit, step, .. } => {
            *start = f(ast, *start);
            *limit = f(ast, *limit);
            if let Some(s) = step {
                *s = f(ast, *s);
            }
        }
        StatKind::GenericFor { exprs, .. } => {
            for e in exprs.iter_mut() {
                *e = f(ast, *e);
            }
        }
        StatKind::Local { init, .. } => {
            for e in init.iter_mut() {
                *e = f(ast, *e);
            }
        }
        StatKind::Assignment { targets, values } => {
            for e in targets.iter_mut().chain(values.iter_mut()) {
                *e = f(ast, *e);
            }
        }
        StatKind::CompoundAssignment { target, value, .. } => {
            *target = f(ast, *target);
            *value = f(ast, *value);
        }
        StatKind::Return(exprs) => {
            for e in exprs.iter_mut() {
                *e = f(ast, *e);
            }
        }
        StatKind::ExprStat(e) => *e = f(ast, *e),
        _ => {}
    }
    ast.stats.get_mut(id.0).kind = kind;
}

/// Every statement id reachable from `root`, in pre-order. Collected
/// up front (rather than walked live) so passes can freely mutate
/// `ast.stats` entries by id without invalidating an in-progress walk.
fn all_stats(ast: &Ast, root: StatId) -> Vec<StatId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        out.push(id);
        stack.extend(child_stats(ast, id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn run(src: &str) -> (Ast, StatId) {
        let result = parse(src.as_bytes());
        assert!(result.errors.is_empty());
        let mut ast = result.ast;
        let root = result.root;
        optimize(&mut ast, root);
        (ast, root)
    }

    #[test]
    fn folds_constant_arithmetic() {
        // Spec §8 scenario 3.
        let (ast, root) = run("local x = 1 + 2 * 3");
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!() };
        let StatKind::Local { init, .. } = &ast.stat(stats[0]).kind else { panic!() };
        assert_eq!(ast.expr(init[0]).kind, ExprKind::Constant(Constant::Number(7.0)));
    }

    #[test]
    fn prunes_statically_false_branch() {
        let (ast, root) = run("if false then\n  x = 1\nelse\n  x = 2\nend");
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!() };
        assert_eq!(stats.len(), 1);
        assert!(matches!(&ast.stat(stats[0]).kind, StatKind::Assignment { .. }));
    }

    #[test]
    fn drops_code_after_return() {
        let (ast, root) = run("return 1\nx = 2");
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!() };
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn merges_local_then_assignment() {
        let (ast, root) = run("local x\nx = 5");
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!() };
        assert_eq!(stats.len(), 1);
        let StatKind::Local { init, .. } = &ast.stat(stats[0]).kind else { panic!("not merged") };
        assert_eq!(ast.expr(init[0]).kind, ExprKind::Constant(Constant::Number(5.0)));
    }

    #[test]
    fn drops_trailing_bare_return() {
        let (ast, root) = run("x = 1\nreturn");
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!() };
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn identity_add_zero_is_removed() {
        let (ast, root) = run("x = y + 0");
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!() };
        let StatKind::Assignment { values, .. } = &ast.stat(stats[0]).kind else { panic!() };
        assert!(matches!(&ast.expr(values[0]).kind, ExprKind::Global(n) if n == "y"));
    }
}
