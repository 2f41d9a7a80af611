//! Recursive-descent parser (spec §4.6). Diagnostics are collected
//! rather than aborting the parse: a syntax error produces an `Error`
//! node and the parser resynchronizes at the next statement boundary,
//! so one bad statement doesn't swallow the rest of the file.

use crate::ast::{
    Ast, Binding, BinOp, Constant, DeclareKind, ExprId, ExprKind, FunctionBody, Param, StatId,
    StatKind, TableItem, TypeId, TypeKind, UnOp,
};
use crate::diagnostics::{Diagnostic, Location, ParseError};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

pub struct ParseResult {
    pub ast: Ast,
    pub root: StatId,
    pub errors: Vec<Diagnostic>,
}

pub fn parse(source: &[u8]) -> ParseResult {
    let mut parser = Parser::new(source);
    let root = parser.parse_block(&TOP_LEVEL_TERMINATORS);
    parser.expect(&TokenKind::Eof);
    ParseResult { ast: parser.ast, root, errors: parser.errors }
}

const TOP_LEVEL_TERMINATORS: [TokenKind; 1] = [TokenKind::Eof];

/// Tokens a synchronization skip stops at: starts of new statements, or
/// the end of the enclosing block.
fn is_recovery_point(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::If
            | TokenKind::While
            | TokenKind::Repeat
            | TokenKind::For
            | TokenKind::Function
            | TokenKind::Local
            | TokenKind::Declare
            | TokenKind::Return
            | TokenKind::Break
            | TokenKind::Continue
            | TokenKind::End
            | TokenKind::Else
            | TokenKind::Elif
            | TokenKind::Until
            | TokenKind::Semicolon
            | TokenKind::Eof
    )
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    ast: Ast,
    errors: Vec<Diagnostic>,
    loop_depth: u32,
}

impl<'a> Parser<'a> {
    fn new(source: &'a [u8]) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next();
        Parser { lexer, current, ast: Ast::new(), errors: Vec::new(), loop_depth: 0 }
    }

    fn loc(&self) -> Location {
        self.current.location
    }

    fn advance(&mut self) -> Token {
        std::mem::replace(&mut self.current, self.lexer.next())
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Location {
        let loc = self.loc();
        if self.check(kind) {
            self.advance();
        } else {
            self.error(ParseError::UnexpectedToken {
                expected: format!("{kind:?}"),
                found: format!("{:?}", self.current.kind),
            });
        }
        loc
    }

    fn expect_identifier(&mut self) -> String {
        if let TokenKind::Identifier(name) = self.current.kind.clone() {
            self.advance();
            name
        } else {
            if let TokenKind::Broken(e) = self.current.kind.clone() {
                self.error(ParseError::Lex(e));
            } else {
                self.error(ParseError::UnexpectedToken {
                    expected: "identifier".into(),
                    found: format!("{:?}", self.current.kind),
                });
            }
            String::from("<error>")
        }
    }

    fn error(&mut self, error: ParseError) {
        self.errors.push(Diagnostic { location: self.loc(), error });
    }

    /// Skip tokens until the next recovery point, without consuming it.
    fn synchronize(&mut self) {
        while !is_recovery_point(&self.current.kind) {
            self.advance();
        }
    }

    fn error_stat(&mut self, location: Location) -> StatId {
        self.synchronize();
        self.ast.alloc_stat(StatKind::Error, location)
    }

    fn error_expr(&mut self, location: Location) -> ExprId {
        self.ast.alloc_expr(ExprKind::Error, location)
    }

    // ---- blocks & statements ----

    fn at_block_end(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::End
                | TokenKind::Else
                | TokenKind::Elif
                | TokenKind::Until
                | TokenKind::Eof
        )
    }

    fn parse_block(&mut self, terminators: &[TokenKind]) -> StatId {
        let start = self.loc();
        let mut stats = Vec::new();
        loop {
            if terminators.iter().any(|t| self.check(t)) || self.at_block_end() {
                break;
            }
            if self.eat(&TokenKind::Semicolon) {
                continue;
            }
            let before = self.current.location;
            stats.push(self.parse_statement());
            // A statement that reports an error but consumes nothing
            // (e.g. an unrecognized token in expression position) would
            // otherwise spin forever; force progress.
            if self.current.location == before
                && !self.at_block_end()
                && !terminators.iter().any(|t| self.check(t))
            {
                self.advance();
            }
        }
        let end = self.loc();
        self.ast.alloc_stat(StatKind::Block(stats), Location::span(start.start, end.start))
    }

    fn parse_statement(&mut self) -> StatId {
        let start = self.loc();
        match &self.current.kind {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::For => self.parse_for(),
            TokenKind::Function => self.parse_function_stat(),
            TokenKind::Local => self.parse_local(),
            TokenKind::Declare => self.parse_declare(),
            TokenKind::Export => self.parse_type_alias(true),
            TokenKind::Using => self.parse_type_alias(false),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error(ParseError::UnexpectedToken {
                        expected: "'break' inside a loop".into(),
                        found: "break".into(),
                    });
                }
                self.ast.alloc_stat(StatKind::Break, start)
            }
            TokenKind::Continue => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error(ParseError::UnexpectedToken {
                        expected: "'continue' inside a loop".into(),
                        found: "continue".into(),
                    });
                }
                self.ast.alloc_stat(StatKind::Continue, start)
            }
            TokenKind::Broken(e) => {
                let e = e.clone();
                self.error(ParseError::Lex(e));
                self.advance();
                self.error_stat(start)
            }
            _ => self.parse_expr_or_assignment_stat(),
        }
    }

    fn parse_if(&mut self) -> StatId {
        let start = self.loc();
        self.advance(); // if
        let cond = self.parse_expr();
        self.expect(&TokenKind::Then);
        let then_branch = self.parse_block(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
        let mut elifs = Vec::new();
        while self.check(&TokenKind::Elif) {
            self.advance();
            let c = self.parse_expr();
            self.expect(&TokenKind::Then);
            let b = self.parse_block(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
            elifs.push((c, b));
        }
        let else_branch = if self.eat(&TokenKind::Else) {
            Some(self.parse_block(&[TokenKind::End]))
        } else {
            None
        };
        self.expect(&TokenKind::End);
        let end = self.loc();
        self.ast.alloc_stat(
            StatKind::If { cond, then_branch, elifs, else_branch },
            Location::span(start.start, end.start),
        )
    }

    fn parse_while(&mut self) -> StatId {
        let start = self.loc();
        self.advance();
        let cond = self.parse_expr();
        self.expect(&TokenKind::Do);
        self.loop_depth += 1;
        let body = self.parse_block(&[TokenKind::End]);
        self.loop_depth -= 1;
        self.expect(&TokenKind::End);
        let end = self.loc();
        self.ast.alloc_stat(StatKind::While { cond, body }, Location::span(start.start, end.start))
    }

    fn parse_repeat(&mut self) -> StatId {
        let start = self.loc();
        self.advance();
        self.loop_depth += 1;
        let body = self.parse_block(&[TokenKind::Until]);
        self.loop_depth -= 1;
        self.expect(&TokenKind::Until);
        let cond = self.parse_expr();
        let end = self.loc();
        self.ast.alloc_stat(StatKind::Repeat { body, cond }, Location::span(start.start, end.start))
    }

    fn parse_for(&mut self) -> StatId {
        let start = self.loc();
        self.advance(); // for
        let first = self.expect_identifier();
        if self.eat(&TokenKind::Assign) {
            let from = self.parse_expr();
            self.expect(&TokenKind::Comma);
            let limit = self.parse_expr();
            let step = if self.eat(&TokenKind::Comma) { Some(self.parse_expr()) } else { None };
            self.expect(&TokenKind::Do);
            self.loop_depth += 1;
            let body = self.parse_block(&[TokenKind::End]);
            self.loop_depth -= 1;
            self.expect(&TokenKind::End);
            let end = self.loc();
            return self.ast.alloc_stat(
                StatKind::NumericFor { var: first, start: from, limit, step, body },
                Location::span(start.start, end.start),
            );
        }
        let mut vars = vec![first];
        while self.eat(&TokenKind::Comma) {
            vars.push(self.expect_identifier());
        }
        self.expect(&TokenKind::In);
        let mut exprs = vec![self.parse_expr()];
        while self.eat(&TokenKind::Comma) {
            exprs.push(self.parse_expr());
        }
        self.expect(&TokenKind::Do);
        self.loop_depth += 1;
        let body = self.parse_block(&[TokenKind::End]);
        self.loop_depth -= 1;
        self.expect(&TokenKind::End);
        let end = self.loc();
        self.ast.alloc_stat(
            StatKind::GenericFor { vars, exprs, body },
            Location::span(start.start, end.start),
        )
    }

    fn parse_function_stat(&mut self) -> StatId {
        let start = self.loc();
        self.advance(); // function
        let mut name_chain = vec![self.expect_identifier()];
        // `function a::b` declares a method on namespace `a`; a bare
        // `function a` declares a plain global function.
        let is_method = self.eat(&TokenKind::DoubleColon);
        if is_method {
            name_chain.push(self.expect_identifier());
        }
        let body = self.parse_function_body();
        let end = self.loc();
        self.ast.alloc_stat(
            StatKind::Function { name_chain, is_method, body: Box::new(body) },
            Location::span(start.start, end.start),
        )
    }

    fn parse_function_body(&mut self) -> FunctionBody {
        self.expect(&TokenKind::LParen);
        let mut params = Vec::new();
        // Varargs (spelled `...`) have no token in the current lexer
        // grammar; `FunctionBody::is_vararg` stays `false` until that
        // lands, matching the rest of the vararg plumbing kept in the
        // AST and bytecode compiler for forward compatibility.
        let is_vararg = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                if matches!(self.current.kind, TokenKind::Identifier(_)) {
                    let name = self.expect_identifier();
                    let type_ann = if self.eat(&TokenKind::Colon) { Some(self.parse_type()) } else { None };
                    params.push(Param { name, type_ann });
                } else {
                    break;
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen);
        let return_type = if self.eat(&TokenKind::Arrow) { Some(self.parse_type()) } else { None };
        let body = self.parse_block(&[TokenKind::End]);
        self.expect(&TokenKind::End);
        FunctionBody { params, is_vararg, return_type, body }
    }

    fn parse_local(&mut self) -> StatId {
        let start = self.loc();
        self.advance(); // local
        if self.eat(&TokenKind::Function) {
            let name = self.expect_identifier();
            let body = self.parse_function_body();
            let end = self.loc();
            return self.ast.alloc_stat(
                StatKind::LocalFunction { name, body: Box::new(body) },
                Location::span(start.start, end.start),
            );
        }
        let mut bindings = vec![self.parse_binding()];
        while self.eat(&TokenKind::Comma) {
            bindings.push(self.parse_binding());
        }
        let init = if self.eat(&TokenKind::Assign) {
            let mut exprs = vec![self.parse_expr()];
            while self.eat(&TokenKind::Comma) {
                exprs.push(self.parse_expr());
            }
            exprs
        } else {
            Vec::new()
        };
        let end = self.loc();
        self.ast.alloc_stat(StatKind::Local { bindings, init }, Location::span(start.start, end.start))
    }

    fn parse_binding(&mut self) -> Binding {
        let name = self.expect_identifier();
        let type_ann = if self.eat(&TokenKind::Colon) { Some(self.parse_type()) } else { None };
        Binding { name, type_ann }
    }

    fn parse_declare(&mut self) -> StatId {
        let start = self.loc();
        self.advance(); // declare
        let kind = if self.eat(&TokenKind::Function) {
            let name = self.expect_identifier();
            self.expect(&TokenKind::LParen);
            let mut params = Vec::new();
            if !self.check(&TokenKind::RParen) {
                params.push(self.parse_type());
                while self.eat(&TokenKind::Comma) {
                    params.push(self.parse_type());
                }
            }
            self.expect(&TokenKind::RParen);
            self.expect(&TokenKind::Arrow);
            let ret = self.parse_type();
            DeclareKind::Function { name, generics: Vec::new(), params, ret }
        } else if self.eat(&TokenKind::Class) {
            let name = self.expect_identifier();
            let superclass = if self.eat(&TokenKind::Colon) { Some(self.expect_identifier()) } else { None };
            DeclareKind::Class { name, superclass }
        } else {
            let name = self.expect_identifier();
            self.expect(&TokenKind::Colon);
            let ty = self.parse_type();
            DeclareKind::Global { name, ty }
        };
        let end = self.loc();
        self.ast.alloc_stat(StatKind::Declare(kind), Location::span(start.start, end.start))
    }

    fn parse_type_alias(&mut self, export: bool) -> StatId {
        let start = self.loc();
        self.advance(); // export | using
        if export {
            self.expect(&TokenKind::Using);
        }
        let name = self.expect_identifier();
        let mut generics = Vec::new();
        if self.eat(&TokenKind::Lt) {
            generics.push(self.expect_identifier());
            while self.eat(&TokenKind::Comma) {
                generics.push(self.expect_identifier());
            }
            self.expect(&TokenKind::Gt);
        }
        self.expect(&TokenKind::Assign);
        let ty = self.parse_type();
        let end = self.loc();
        self.ast.alloc_stat(
            StatKind::TypeAlias { export, name, generics, ty },
            Location::span(start.start, end.start),
        )
    }

    fn parse_return(&mut self) -> StatId {
        let start = self.loc();
        self.advance();
        let mut exprs = Vec::new();
        if !self.at_block_end() && !self.check(&TokenKind::Semicolon) {
            exprs.push(self.parse_expr());
            while self.eat(&TokenKind::Comma) {
                exprs.push(self.parse_expr());
            }
        }
        let end = self.loc();
        self.ast.alloc_stat(StatKind::Return(exprs), Location::span(start.start, end.start))
    }

    /// An expression statement that may turn out to be an assignment,
    /// a compound assignment, or a bare call — these all start the
    /// same way (a "suffixed expression").
    fn parse_expr_or_assignment_stat(&mut self) -> StatId {
        let start = self.loc();
        let first = self.parse_suffixed_expr();

        if let Some(op) = self.compound_assign_op() {
            self.advance();
            let value = self.parse_expr();
            let end = self.loc();
            return self.ast.alloc_stat(
                StatKind::CompoundAssignment { op, target: first, value },
                Location::span(start.start, end.start),
            );
        }

        if self.check(&TokenKind::Assign) || self.check(&TokenKind::Comma) {
            let mut targets = vec![first];
            while self.eat(&TokenKind::Comma) {
                targets.push(self.parse_suffixed_expr());
            }
            self.expect(&TokenKind::Assign);
            let mut values = vec![self.parse_expr()];
            while self.eat(&TokenKind::Comma) {
                values.push(self.parse_expr());
            }
            let end = self.loc();
            return self.ast.alloc_stat(
                StatKind::Assignment { targets, values },
                Location::span(start.start, end.start),
            );
        }

        let end = self.loc();
        if !matches!(self.ast.expr(first).kind, ExprKind::Call { .. } | ExprKind::Error) {
            self.error(ParseError::UnexpectedToken {
                expected: "call or assignment".into(),
                found: format!("{:?}", self.current.kind),
            });
        }
        self.ast.alloc_stat(StatKind::ExprStat(first), Location::span(start.start, end.start))
    }

    fn compound_assign_op(&self) -> Option<BinOp> {
        Some(match self.current.kind {
            TokenKind::PlusAssign => BinOp::Add,
            TokenKind::MinusAssign => BinOp::Sub,
            TokenKind::StarAssign => BinOp::Mul,
            TokenKind::SlashAssign => BinOp::Div,
            TokenKind::PercentAssign => BinOp::Mod,
            TokenKind::CaretAssign => BinOp::Pow,
            _ => return None,
        })
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> ExprId {
        let start = self.loc();
        let e = self.parse_or();
        if self.eat(&TokenKind::DoubleColon) {
            let ty = self.parse_type();
            let end = self.loc();
            return self.ast.alloc_expr(ExprKind::TypeAssertion(e, ty), Location::span(start.start, end.start));
        }
        e
    }

    fn parse_or(&mut self) -> ExprId {
        let start = self.loc();
        let mut lhs = self.parse_and();
        while self.eat(&TokenKind::Or) {
            let rhs = self.parse_and();
            let end = self.loc();
            lhs = self.ast.alloc_expr(ExprKind::Binary(BinOp::Or, lhs, rhs), Location::span(start.start, end.start));
        }
        lhs
    }

    fn parse_and(&mut self) -> ExprId {
        let start = self.loc();
        let mut lhs = self.parse_comparison();
        while self.eat(&TokenKind::And) {
            let rhs = self.parse_comparison();
            let end = self.loc();
            lhs =
                self.ast.alloc_expr(ExprKind::Binary(BinOp::And, lhs, rhs), Location::span(start.start, end.start));
        }
        lhs
    }

    fn comparison_op(&self) -> Option<BinOp> {
        Some(match self.current.kind {
            TokenKind::Eq => BinOp::Eq,
            TokenKind::Ne => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Ge => BinOp::Ge,
            _ => return None,
        })
    }

    fn parse_comparison(&mut self) -> ExprId {
        let start = self.loc();
        let mut lhs = self.parse_additive();
        while let Some(op) = self.comparison_op() {
            self.advance();
            let rhs = self.parse_additive();
            let end = self.loc();
            lhs = self.ast.alloc_expr(ExprKind::Binary(op, lhs, rhs), Location::span(start.start, end.start));
        }
        lhs
    }

    fn parse_additive(&mut self) -> ExprId {
        let start = self.loc();
        let mut lhs = self.parse_multiplicative();
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative();
            let end = self.loc();
            lhs = self.ast.alloc_expr(ExprKind::Binary(op, lhs, rhs), Location::span(start.start, end.start));
        }
        lhs
    }

    fn parse_multiplicative(&mut self) -> ExprId {
        let start = self.loc();
        let mut lhs = self.parse_unary();
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary();
            let end = self.loc();
            lhs = self.ast.alloc_expr(ExprKind::Binary(op, lhs, rhs), Location::span(start.start, end.start));
        }
        lhs
    }

    fn parse_unary(&mut self) -> ExprId {
        let start = self.loc();
        let op = match self.current.kind {
            TokenKind::Not => Some(UnOp::Not),
            TokenKind::Minus => Some(UnOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary();
            let end = self.loc();
            return self.ast.alloc_expr(ExprKind::Unary(op, operand), Location::span(start.start, end.start));
        }
        self.parse_pow()
    }

    /// `**` (spec §4.5) is right-associative and binds tighter than unary.
    fn parse_pow(&mut self) -> ExprId {
        let start = self.loc();
        let base = self.parse_suffixed_expr();
        if self.eat(&TokenKind::Caret) {
            let exponent = self.parse_unary();
            let end = self.loc();
            return self
                .ast
                .alloc_expr(ExprKind::Binary(BinOp::Pow, base, exponent), Location::span(start.start, end.start));
        }
        base
    }

    /// A primary expression followed by any number of calls/indexes.
    fn parse_suffixed_expr(&mut self) -> ExprId {
        let start = self.loc();
        let mut expr = self.parse_primary();
        loop {
            match &self.current.kind {
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_identifier();
                    let args = self.parse_call_args();
                    let end = self.loc();
                    expr = self.ast.alloc_expr(
                        ExprKind::Call { callee: expr, args, method_name: Some(method) },
                        Location::span(start.start, end.start),
                    );
                }
                TokenKind::LParen => {
                    let args = self.parse_call_args();
                    let end = self.loc();
                    expr = self.ast.alloc_expr(
                        ExprKind::Call { callee: expr, args, method_name: None },
                        Location::span(start.start, end.start),
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr();
                    self.expect(&TokenKind::RBracket);
                    let end = self.loc();
                    expr = self.ast.alloc_expr(
                        ExprKind::IndexExpr { object: expr, index },
                        Location::span(start.start, end.start),
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier();
                    let end = self.loc();
                    expr = self
                        .ast
                        .alloc_expr(ExprKind::IndexName { object: expr, name }, Location::span(start.start, end.start));
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_call_args(&mut self) -> Vec<ExprId> {
        if let TokenKind::Str(s) = self.current.kind.clone() {
            let loc = self.loc();
            self.advance();
            return vec![self.ast.alloc_expr(ExprKind::Constant(Constant::Str(s)), loc)];
        }
        if self.check(&TokenKind::LBrace) {
            return vec![self.parse_table()];
        }
        self.expect(&TokenKind::LParen);
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.parse_expr());
            while self.eat(&TokenKind::Comma) {
                args.push(self.parse_expr());
            }
        }
        self.expect(&TokenKind::RParen);
        args
    }

    fn parse_primary(&mut self) -> ExprId {
        let start = self.loc();
        match self.current.kind.clone() {
            TokenKind::Number(n) => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Constant(Constant::Number(n)), start)
            }
            TokenKind::Str(s) => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Constant(Constant::Str(s)), start)
            }
            TokenKind::True => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Constant(Constant::Bool(true)), start)
            }
            TokenKind::False => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Constant(Constant::Bool(false)), start)
            }
            TokenKind::Null => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Constant(Constant::Null), start)
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.ast.alloc_expr(ExprKind::Global(name), start)
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr();
                self.expect(&TokenKind::RParen);
                inner
            }
            TokenKind::LBrace => self.parse_table(),
            TokenKind::Function => {
                self.advance();
                let body = self.parse_function_body();
                let end = self.loc();
                self.ast.alloc_expr(ExprKind::Function(Box::new(body)), Location::span(start.start, end.start))
            }
            TokenKind::If => self.parse_if_expr(),
            TokenKind::Broken(e) => {
                self.error(ParseError::Lex(e));
                self.advance();
                self.error_expr(start)
            }
            _ => {
                self.error(ParseError::UnexpectedToken {
                    expected: "expression".into(),
                    found: format!("{:?}", self.current.kind),
                });
                // Don't consume: let the statement-level synchronize
                // logic find the next recovery point.
                self.error_expr(start)
            }
        }
    }

    fn parse_if_expr(&mut self) -> ExprId {
        let start = self.loc();
        self.advance(); // if
        let cond = self.parse_expr();
        self.expect(&TokenKind::Then);
        let then_branch = self.parse_expr();
        self.expect(&TokenKind::Else);
        let else_branch = self.parse_expr();
        let end = self.loc();
        self.ast.alloc_expr(
            ExprKind::If { cond, then_branch, else_branch },
            Location::span(start.start, end.start),
        )
    }

    fn parse_table(&mut self) -> ExprId {
        let start = self.loc();
        self.expect(&TokenKind::LBrace);
        let mut items = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.check(&TokenKind::LBracket) {
                self.advance();
                let key = self.parse_expr();
                self.expect(&TokenKind::RBracket);
                self.expect(&TokenKind::Assign);
                let value = self.parse_expr();
                items.push(TableItem::General(key, value));
            } else if matches!(self.current.kind, TokenKind::Identifier(_)) && self.next_is_field_assign() {
                let name = self.expect_identifier();
                self.expect(&TokenKind::Assign);
                let value = self.parse_expr();
                items.push(TableItem::Record(name, value));
            } else {
                items.push(TableItem::List(self.parse_expr()));
            }
            if !self.eat(&TokenKind::Comma) && !self.eat(&TokenKind::Semicolon) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace);
        let end = self.loc();
        self.ast.alloc_expr(ExprKind::Table(items), Location::span(start.start, end.start))
    }

    /// True if the upcoming tokens are `identifier =` (a record field),
    /// as opposed to `identifier` starting a larger expression.
    fn next_is_field_assign(&mut self) -> bool {
        self.lexer.peek().kind == TokenKind::Assign
    }

    // ---- types ----

    /// Union and intersection types (`TypeKind::Union`/`Intersection`)
    /// are modeled in the AST but have no surface syntax yet — the
    /// token set carries no `|`/`&` operators — so this always returns
    /// an atomic type for now.
    fn parse_type(&mut self) -> TypeId {
        self.parse_atomic_type()
    }

    fn parse_atomic_type(&mut self) -> TypeId {
        let start = self.loc();
        match self.current.kind.clone() {
            TokenKind::Null => {
                self.advance();
                self.ast.alloc_type(TypeKind::Null, start)
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.ast.alloc_type(TypeKind::Named(name), start)
            }
            TokenKind::LBrace => self.parse_table_type(),
            TokenKind::LParen => self.parse_function_type(),
            _ => {
                self.error(ParseError::UnexpectedToken {
                    expected: "type".into(),
                    found: format!("{:?}", self.current.kind),
                });
                self.ast.alloc_type(TypeKind::Named("unknown".into()), start)
            }
        }
    }

    fn parse_table_type(&mut self) -> TypeId {
        let start = self.loc();
        self.expect(&TokenKind::LBrace);
        let mut props = Vec::new();
        let mut indexer = None;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.eat(&TokenKind::LBracket) {
                let key_ty = self.parse_type();
                self.expect(&TokenKind::RBracket);
                self.expect(&TokenKind::Colon);
                let val_ty = self.parse_type();
                indexer = Some((key_ty, val_ty));
            } else {
                let name = self.expect_identifier();
                self.expect(&TokenKind::Colon);
                let ty = self.parse_type();
                props.push((name, ty));
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace);
        let end = self.loc();
        self.ast.alloc_type(TypeKind::Table { props, indexer }, Location::span(start.start, end.start))
    }

    fn parse_function_type(&mut self) -> TypeId {
        let start = self.loc();
        self.expect(&TokenKind::LParen);
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.parse_type());
            while self.eat(&TokenKind::Comma) {
                params.push(self.parse_type());
            }
        }
        self.expect(&TokenKind::RParen);
        self.expect(&TokenKind::Arrow);
        let ret = self.parse_type();
        let end = self.loc();
        self.ast.alloc_type(
            TypeKind::Function { generics: Vec::new(), params, variadic: None, returns: vec![ret] },
            Location::span(start.start, end.start),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ExprKind, StatKind};

    fn parse_ok(src: &str) -> (Ast, StatId) {
        let result = parse(src.as_bytes());
        assert!(result.errors.is_empty(), "unexpected errors: {:?}", result.errors);
        (result.ast, result.root)
    }

    fn block_stats(ast: &Ast, root: StatId) -> Vec<StatId> {
        let StatKind::Block(stats) = &ast.stat(root).kind else { panic!("root is not a block") };
        stats.clone()
    }

    #[test]
    fn parses_local_and_return() {
        let (ast, root) = parse_ok("local x = 1 + 2\nreturn x");
        assert_eq!(block_stats(&ast, root).len(), 2);
    }

    #[test]
    fn parses_if_chain() {
        let (ast, root) = parse_ok("if x then\n  return 1\nelif y then\n  return 2\nelse\n  return 3\nend");
        let stats = block_stats(&ast, root);
        let StatKind::If { elifs, else_branch, .. } = &ast.stat(stats[0]).kind else { panic!("not an if") };
        assert_eq!(elifs.len(), 1);
        assert!(else_branch.is_some());
    }

    #[test]
    fn parses_numeric_for_with_step() {
        let (ast, root) = parse_ok("for i = 1, 10, 2 do\n  x = i\nend");
        let stats = block_stats(&ast, root);
        assert!(matches!(&ast.stat(stats[0]).kind, StatKind::NumericFor { step: Some(_), .. }));
    }

    #[test]
    fn break_outside_loop_reports_error() {
        let result = parse("break".as_bytes());
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn recovers_after_bad_statement_and_parses_the_rest() {
        // Spec §8 scenario 2: one malformed statement doesn't swallow
        // the rest of the file.
        let result = parse("local = \nreturn 1".as_bytes());
        assert!(!result.errors.is_empty());
        let stats = block_stats(&result.ast, result.root);
        assert_eq!(stats.len(), 2);
        assert!(matches!(&result.ast.stat(stats[1]).kind, StatKind::Return(_)));
    }

    #[test]
    fn parses_method_call_chain() {
        let (ast, root) = parse_ok("x:foo(1):bar()");
        let stats = block_stats(&ast, root);
        let StatKind::ExprStat(e) = &ast.stat(stats[0]).kind else { panic!() };
        let ExprKind::Call { method_name, .. } = &ast.expr(*e).kind else { panic!() };
        assert_eq!(method_name.as_deref(), Some("bar"));
    }

    #[test]
    fn parses_field_access_chain() {
        let (ast, root) = parse_ok("x = a.b.c");
        let stats = block_stats(&ast, root);
        let StatKind::Assignment { values, .. } = &ast.stat(stats[0]).kind else { panic!() };
        assert!(matches!(&ast.expr(values[0]).kind, ExprKind::IndexName { .. }));
    }

    #[test]
    fn parses_table_constructor_mixed_items() {
        let (ast, root) = parse_ok("local t = {1, 2, name = \"a\", [k] = v}");
        let stats = block_stats(&ast, root);
        let StatKind::Local { init, .. } = &ast.stat(stats[0]).kind else { panic!() };
        let ExprKind::Table(items) = &ast.expr(init[0]).kind else { panic!() };
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn type_assertion_binds_loosely() {
        let (ast, root) = parse_ok("local x = 1 + 2 :: number");
        let stats = block_stats(&ast, root);
        let StatKind::Local { init, .. } = &ast.stat(stats[0]).kind else { panic!() };
        assert!(matches!(&ast.expr(init[0]).kind, ExprKind::TypeAssertion(_, _)));
    }
}
