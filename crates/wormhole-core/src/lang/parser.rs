//! Recursive-descent parser producing the syntax tree.

use super::ast::*;
use super::lexer::{Tok, Token};
use super::SyntaxError;

/// Maximum nesting of expressions and blocks.
pub const MAX_NESTING: usize = 64;

/// Keywords that introduce constructs the language does not support.
const UNSUPPORTED: &[&str] = &[
    "class", "with", "yield", "global", "nonlocal", "del", "async", "await", "assert",
];

const AUG_OPS: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
];

type PResult<T> = Result<T, SyntaxError>;

pub struct Parser {
    tokens: Vec<Token>,
    i: usize,
    depth: usize,
    eof: Token,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        let eof_pos = tokens.last().map(|t| t.pos).unwrap_or_default();
        Self {
            tokens,
            i: 0,
            depth: 0,
            eof: Token {
                tok: Tok::Eof,
                pos: eof_pos,
            },
        }
    }

    pub fn parse_program(mut self) -> PResult<Program> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(Program { body })
    }

    // -- token helpers -----------------------------------------------------

    fn token(&self) -> &Token {
        self.tokens.get(self.i).unwrap_or(&self.eof)
    }

    fn peek(&self) -> &Tok {
        &self.token().tok
    }

    fn peek_next(&self) -> &Tok {
        self.tokens.get(self.i + 1).map_or(&self.eof.tok, |t| &t.tok)
    }

    fn pos(&self) -> Pos {
        self.token().pos
    }

    fn advance(&mut self) -> Token {
        let token = self.token().clone();
        if self.i < self.tokens.len() {
            self.i += 1;
        }
        token
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Keyword(k) if *k == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        SyntaxError::new(
            self.pos(),
            format!("expected {expected}, found {}", self.peek()),
        )
    }

    fn expect_op(&mut self, op: &str) -> PResult<Pos> {
        if self.at_op(op) {
            Ok(self.advance().pos)
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<Pos> {
        if self.at_kw(kw) {
            Ok(self.advance().pos)
        } else {
            Err(self.unexpected(&format!("'{kw}'")))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn nest(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(SyntaxError::new(self.pos(), "too many nested expressions or blocks"));
        }
        Ok(())
    }

    fn unnest(&mut self, levels: usize) {
        self.depth = self.depth.saturating_sub(levels);
    }

    fn at_simple_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof) || self.at_op(";")
    }

    fn starts_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str(_) => true,
            Tok::Keyword(kw) => matches!(*kw, "None" | "True" | "False" | "not" | "lambda"),
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    // -- statements --------------------------------------------------------

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let pos = self.pos();
        match self.peek().clone() {
            Tok::Keyword("def") => Ok(vec![self.def_stmt()?]),
            Tok::Keyword("if") => Ok(vec![self.if_stmt()?]),
            Tok::Keyword("for") => Ok(vec![self.for_stmt()?]),
            Tok::Keyword("while") => Ok(vec![self.while_stmt()?]),
            Tok::Keyword("try") => Ok(vec![self.try_stmt()?]),
            Tok::Keyword(kw) if UNSUPPORTED.contains(&kw) => Err(SyntaxError::new(
                pos,
                format!("unsupported construct '{kw}'"),
            )),
            Tok::Keyword(kw @ ("elif" | "else" | "except" | "finally")) => {
                Err(SyntaxError::new(pos, format!("unexpected '{kw}'")))
            }
            Tok::Op("@") => Err(SyntaxError::new(pos, "unsupported construct 'decorator'")),
            Tok::Indent => Err(SyntaxError::new(pos, "unexpected indent")),
            _ => self.simple_statements(),
        }
    }

    fn simple_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.small_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.small_statement()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(stmts)
            }
            Tok::Eof => Ok(stmts),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn small_statement(&mut self) -> PResult<Stmt> {
        let pos = self.pos();
        let kind = match self.peek().clone() {
            Tok::Keyword("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Keyword("break") => {
                self.advance();
                StmtKind::Break
            }
            Tok::Keyword("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Tok::Keyword("return") => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.testlist()?))
                }
            }
            Tok::Keyword("raise") => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.test()?;
                    if self.at_kw("from") {
                        return Err(SyntaxError::new(
                            self.pos(),
                            "unsupported construct 'raise ... from'",
                        ));
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            Tok::Keyword("import") => {
                self.advance();
                self.import_names()?
            }
            Tok::Keyword("from") => {
                self.advance();
                self.import_from()?
            }
            Tok::Keyword(kw) if UNSUPPORTED.contains(&kw) => {
                return Err(SyntaxError::new(
                    pos,
                    format!("unsupported construct '{kw}'"),
                ))
            }
            _ => self.expr_statement()?,
        };
        Ok(Stmt { pos, kind })
    }

    fn dotted_name(&mut self) -> PResult<Vec<String>> {
        let mut path = vec![self.expect_name()?];
        while self.eat_op(".") {
            path.push(self.expect_name()?);
        }
        Ok(path)
    }

    fn import_names(&mut self) -> PResult<StmtKind> {
        let mut names = Vec::new();
        loop {
            let path = self.dotted_name()?;
            let alias = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(ImportName { path, alias });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn import_from(&mut self) -> PResult<StmtKind> {
        if self.at_op(".") {
            return Err(SyntaxError::new(self.pos(), "relative imports are not supported"));
        }
        let module = self.dotted_name()?;
        self.expect_kw("import")?;
        if self.at_op("*") {
            return Err(SyntaxError::new(self.pos(), "wildcard imports are not supported"));
        }
        let parenthesized = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let alias = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat_op(",") {
                break;
            }
            if parenthesized && self.at_op(")") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        Ok(StmtKind::ImportFrom { module, names })
    }

    fn expr_statement(&mut self) -> PResult<StmtKind> {
        let first = self.testlist()?;

        if let Tok::Op(op) = self.peek() {
            if let Some((_, bin)) = AUG_OPS.iter().find(|(sym, _)| sym == op) {
                let bin = *bin;
                if matches!(first.kind, ExprKind::Tuple(_) | ExprKind::List(_))
                    || !first.is_assignable()
                {
                    return Err(SyntaxError::new(
                        first.pos,
                        "illegal expression for augmented assignment",
                    ));
                }
                self.advance();
                let value = self.testlist()?;
                return Ok(StmtKind::AugAssign {
                    target: first,
                    op: bin,
                    value,
                });
            }
        }

        if self.at_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.testlist()?);
            }
            let value = exprs.pop().ok_or_else(|| self.unexpected("expression"))?;
            for target in &exprs {
                if !target.is_assignable() {
                    return Err(SyntaxError::new(target.pos, "cannot assign to expression"));
                }
            }
            return Ok(StmtKind::Assign {
                targets: exprs,
                value,
            });
        }

        if self.at_op(":") {
            return Err(SyntaxError::new(
                self.pos(),
                "unsupported construct 'annotated assignment'",
            ));
        }
        Ok(StmtKind::Expr(first))
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.nest()?;
        let body = if matches!(self.peek(), Tok::Newline) {
            self.advance();
            if !matches!(self.peek(), Tok::Indent) {
                return Err(self.unexpected("an indented block"));
            }
            self.advance();
            let mut body = Vec::new();
            loop {
                match self.peek() {
                    Tok::Dedent => {
                        self.advance();
                        break;
                    }
                    Tok::Eof => break,
                    Tok::Newline => {
                        self.advance();
                    }
                    _ => body.extend(self.statement()?),
                }
            }
            body
        } else {
            self.simple_statements()?
        };
        self.unnest(1);
        Ok(body)
    }

    fn params(&mut self, closing: &str, annotations: bool) -> PResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.at_op(closing) {
            if self.at_op("*") || self.at_op("**") {
                return Err(SyntaxError::new(
                    self.pos(),
                    "unsupported construct 'variadic parameters'",
                ));
            }
            let pos = self.pos();
            let name = self.expect_name()?;
            if params.iter().any(|p| p.name == name) {
                return Err(SyntaxError::new(
                    pos,
                    format!("duplicate argument '{name}' in function definition"),
                ));
            }
            if annotations && self.eat_op(":") {
                // Annotations are accepted and discarded.
                self.test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(SyntaxError::new(
                    pos,
                    "non-default argument follows default argument",
                ));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn def_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.params(")", true)?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        Ok(Stmt {
            pos,
            kind: StmtKind::Def(FunctionDef { name, params, body }),
        })
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.expect_kw("if")?;
        let mut branches = Vec::new();
        let test = self.test()?;
        branches.push((test, self.block()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                let test = self.test()?;
                branches.push((test, self.block()?));
            } else if self.eat_kw("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            pos,
            kind: StmtKind::If { branches, orelse },
        })
    }

    fn target_list(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let first = self.arith()?;
        let target = if self.at_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_kw("in") || self.at_op("=") {
                    break;
                }
                items.push(self.arith()?);
            }
            Expr {
                pos,
                kind: ExprKind::Tuple(items),
            }
        } else {
            first
        };
        if !target.is_assignable() {
            return Err(SyntaxError::new(pos, "cannot assign to expression"));
        }
        Ok(target)
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.expect_kw("for")?;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.block()?;
        if self.at_kw("else") {
            return Err(SyntaxError::new(self.pos(), "unsupported construct 'for ... else'"));
        }
        Ok(Stmt {
            pos,
            kind: StmtKind::For { target, iter, body },
        })
    }

    fn while_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.expect_kw("while")?;
        let test = self.test()?;
        let body = self.block()?;
        if self.at_kw("else") {
            return Err(SyntaxError::new(
                self.pos(),
                "unsupported construct 'while ... else'",
            ));
        }
        Ok(Stmt {
            pos,
            kind: StmtKind::While { test, body },
        })
    }

    fn try_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.at_kw("except") {
            let hpos = self.advance().pos;
            let class = if self.at_op(":") {
                None
            } else {
                Some(self.expect_name()?)
            };
            let name = if class.is_some() && self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            let hbody = self.block()?;
            handlers.push(ExceptHandler {
                pos: hpos,
                class,
                name,
                body: hbody,
            });
        }
        if self.at_kw("else") {
            return Err(SyntaxError::new(self.pos(), "unsupported construct 'try ... else'"));
        }
        let finally = if self.eat_kw("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finally.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }
        Ok(Stmt {
            pos,
            kind: StmtKind::Try {
                body,
                handlers,
                finally,
            },
        })
    }

    // -- expressions -------------------------------------------------------

    fn testlist(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let first = self.test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expr() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr {
            pos,
            kind: ExprKind::Tuple(items),
        })
    }

    fn test(&mut self) -> PResult<Expr> {
        self.nest()?;
        let expr = if self.at_kw("lambda") {
            self.lambda()?
        } else {
            let pos = self.pos();
            let body = self.or_test()?;
            if self.eat_kw("if") {
                let test = self.or_test()?;
                self.expect_kw("else")?;
                let orelse = self.test()?;
                Expr {
                    pos,
                    kind: ExprKind::IfExp {
                        test: Box::new(test),
                        body: Box::new(body),
                        orelse: Box::new(orelse),
                    },
                }
            } else {
                body
            }
        };
        self.unnest(1);
        Ok(expr)
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let pos = self.expect_kw("lambda")?;
        let params = self.params(":", false)?;
        self.expect_op(":")?;
        let body = self.test()?;
        Ok(Expr {
            pos,
            kind: ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
        })
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let mut left = self.and_test()?;
        let mut levels = 0;
        while self.at_kw("or") {
            let pos = self.advance().pos;
            self.nest()?;
            levels += 1;
            let right = self.and_test()?;
            left = Expr {
                pos,
                kind: ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        self.unnest(levels);
        Ok(left)
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let mut left = self.not_test()?;
        let mut levels = 0;
        while self.at_kw("and") {
            let pos = self.advance().pos;
            self.nest()?;
            levels += 1;
            let right = self.not_test()?;
            left = Expr {
                pos,
                kind: ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        self.unnest(levels);
        Ok(left)
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.at_kw("not") {
            let pos = self.advance().pos;
            self.nest()?;
            let operand = self.not_test()?;
            self.unnest(1);
            return Ok(Expr {
                pos,
                kind: ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            });
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek().clone() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Keyword("in") => CmpOp::In,
            Tok::Keyword("not") if matches!(self.peek_next(), Tok::Keyword("in")) => {
                self.advance();
                CmpOp::NotIn
            }
            Tok::Keyword("is") => {
                if matches!(self.peek_next(), Tok::Keyword("not")) {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let left = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            return Ok(left);
        }
        Ok(Expr {
            pos,
            kind: ExprKind::Compare {
                left: Box::new(left),
                rest,
            },
        })
    }

    fn binary_chain(
        &mut self,
        ops: &[(&str, BinOp)],
        operand: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = operand(self)?;
        let mut levels = 0;
        loop {
            let found = match self.peek() {
                Tok::Op(sym) => ops.iter().find(|(s, _)| s == sym).map(|(_, op)| *op),
                _ => None,
            };
            let Some(op) = found else { break };
            let pos = self.advance().pos;
            self.nest()?;
            levels += 1;
            let right = operand(self)?;
            left = Expr {
                pos,
                kind: ExprKind::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        self.unnest(levels);
        Ok(left)
    }

    fn arith(&mut self) -> PResult<Expr> {
        self.binary_chain(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary_chain(
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        let Some(op) = op else {
            return self.power();
        };
        let pos = self.advance().pos;
        self.nest()?;
        let operand = self.factor()?;
        self.unnest(1);
        Ok(Expr {
            pos,
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if !self.at_op("**") {
            return Ok(base);
        }
        let pos = self.advance().pos;
        self.nest()?;
        let exponent = self.factor()?;
        self.unnest(1);
        Ok(Expr {
            pos,
            kind: ExprKind::BinOp {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            },
        })
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        let mut levels = 0;
        loop {
            let pos = self.pos();
            let kind = if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                ExprKind::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                }
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                ExprKind::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                }
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                ExprKind::Attribute {
                    value: Box::new(expr),
                    attr,
                }
            } else {
                break;
            };
            self.nest()?;
            levels += 1;
            expr = Expr { pos, kind };
        }
        self.unnest(levels);
        Ok(expr)
    }

    fn call_args(&mut self) -> PResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            if self.at_op("*") || self.at_op("**") {
                return Err(SyntaxError::new(
                    self.pos(),
                    "unsupported construct 'argument unpacking'",
                ));
            }
            let is_keyword =
                matches!(self.peek(), Tok::Name(_)) && matches!(self.peek_next(), Tok::Op("="));
            if is_keyword {
                let pos = self.pos();
                let name = self.expect_name()?;
                self.expect_op("=")?;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(SyntaxError::new(pos, format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(SyntaxError::new(
                        self.pos(),
                        "positional argument follows keyword argument",
                    ));
                }
                let arg = self.test()?;
                if self.at_kw("for") {
                    let pos = arg.pos;
                    let generators = self.generators()?;
                    args.push(Expr {
                        pos,
                        kind: ExprKind::ListComp {
                            element: Box::new(arg),
                            generators,
                        },
                    });
                    break;
                }
                args.push(arg);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let lower = if self.at_op(":") {
            None
        } else {
            Some(self.test()?)
        };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.unexpected("an index"));
        }
        let upper = if self.at_op("]") {
            None
        } else {
            Some(self.test()?)
        };
        if self.at_op(":") {
            return Err(SyntaxError::new(self.pos(), "unsupported construct 'slice step'"));
        }
        Ok(Expr {
            pos,
            kind: ExprKind::Slice {
                lower: lower.map(Box::new),
                upper: upper.map(Box::new),
            },
        })
    }

    fn generators(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_kw("if") {
                conditions.push(self.or_test()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let kind = match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Tok::Int(i) => {
                self.advance();
                ExprKind::Const(Literal::Int(i))
            }
            Tok::Float(x) => {
                self.advance();
                ExprKind::Const(Literal::Float(x))
            }
            Tok::Str(_) => {
                let mut text = String::new();
                while let Tok::Str(s) = self.peek().clone() {
                    text.push_str(&s);
                    self.advance();
                }
                ExprKind::Const(Literal::Str(text))
            }
            Tok::Keyword("None") => {
                self.advance();
                ExprKind::Const(Literal::None)
            }
            Tok::Keyword("True") => {
                self.advance();
                ExprKind::Const(Literal::Bool(true))
            }
            Tok::Keyword("False") => {
                self.advance();
                ExprKind::Const(Literal::Bool(false))
            }
            Tok::Op("(") => {
                self.advance();
                return self.paren(pos);
            }
            Tok::Op("[") => {
                self.advance();
                return self.list_display(pos);
            }
            Tok::Op("{") => {
                self.advance();
                return self.dict_display(pos);
            }
            Tok::Keyword(kw) if UNSUPPORTED.contains(&kw) => {
                return Err(SyntaxError::new(pos, format!("unsupported construct '{kw}'")))
            }
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(Expr { pos, kind })
    }

    fn paren(&mut self, pos: Pos) -> PResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr {
                pos,
                kind: ExprKind::Tuple(Vec::new()),
            });
        }
        let first = self.test()?;
        if self.at_kw("for") {
            let generators = self.generators()?;
            self.expect_op(")")?;
            return Ok(Expr {
                pos,
                kind: ExprKind::ListComp {
                    element: Box::new(first),
                    generators,
                },
            });
        }
        if !self.at_op(",") {
            self.expect_op(")")?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op(")")?;
        Ok(Expr {
            pos,
            kind: ExprKind::Tuple(items),
        })
    }

    fn list_display(&mut self, pos: Pos) -> PResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr {
                pos,
                kind: ExprKind::List(Vec::new()),
            });
        }
        let first = self.test()?;
        if self.at_kw("for") {
            let generators = self.generators()?;
            self.expect_op("]")?;
            return Ok(Expr {
                pos,
                kind: ExprKind::ListComp {
                    element: Box::new(first),
                    generators,
                },
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("]")?;
        Ok(Expr {
            pos,
            kind: ExprKind::List(items),
        })
    }

    fn dict_display(&mut self, pos: Pos) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr {
                pos,
                kind: ExprKind::Dict(Vec::new()),
            });
        }
        let key = self.test()?;
        if !self.at_op(":") {
            return Err(SyntaxError::new(pos, "unsupported construct 'set literal'"));
        }
        self.advance();
        let value = self.test()?;
        if self.at_kw("for") {
            let generators = self.generators()?;
            self.expect_op("}")?;
            return Ok(Expr {
                pos,
                kind: ExprKind::DictComp {
                    key: Box::new(key),
                    value: Box::new(value),
                    generators,
                },
            });
        }
        let mut entries = vec![(key, value)];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            let key = self.test()?;
            self.expect_op(":")?;
            let value = self.test()?;
            entries.push((key, value));
        }
        self.expect_op("}")?;
        Ok(Expr {
            pos,
            kind: ExprKind::Dict(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::lang::parse;

    use super::*;

    fn body(src: &str) -> Vec<Stmt> {
        parse(src).unwrap().body
    }

    #[test]
    fn parses_function_with_defaults_and_imports() {
        let program = parse(
            "import math\nfrom json import dumps as d\n\ndef area(r, scale=1.0):\n    return math.pi * r ** 2 * scale\n",
        )
        .unwrap();
        assert_eq!(program.body.len(), 3);
        let def = program.function("area").unwrap();
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].default.is_some());
        assert!(matches!(
            program.body[1].kind,
            StmtKind::ImportFrom { ref module, .. } if module == &vec!["json".to_string()]
        ));
    }

    #[test]
    fn precedence_binds_power_tighter_than_unary_minus() {
        let stmts = body("x = -2 ** 2\n");
        let StmtKind::Assign { value, .. } = &stmts[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            value.kind,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn chained_comparison_and_membership() {
        let stmts = body("ok = 0 < x <= 10 and y not in items and z is not None\n");
        let StmtKind::Assign { value, .. } = &stmts[0].kind else {
            panic!("expected assignment");
        };
        let ExprKind::BoolOp { left, .. } = &value.kind else {
            panic!("expected boolean operator");
        };
        assert!(matches!(left.kind, ExprKind::BoolOp { .. }));
    }

    #[test]
    fn control_flow_and_comprehensions() {
        let src = "\
def f(rows):
    total = 0
    for i, row in enumerate(rows):
        if row['n'] > 2:
            total += row['n']
        elif i == 0:
            continue
        else:
            pass
    try:
        x = {k: v for k, v in pairs if v}
    except KeyError as e:
        raise ValueError('bad')
    finally:
        y = [r * 2 for r in rows]
    while total > 100:
        total //= 2
    return total, sum(n for n in rows)
";
        let program = parse(src).unwrap();
        let def = program.function("f").unwrap();
        assert_eq!(def.body.len(), 5);
        assert!(matches!(def.body[1].kind, StmtKind::For { .. }));
        assert!(matches!(def.body[2].kind, StmtKind::Try { .. }));
    }

    #[test]
    fn unsupported_constructs_are_syntax_errors() {
        for src in [
            "class A:\n    pass\n",
            "with open('x') as f:\n    pass\n",
            "def f():\n    yield 1\n",
            "def f():\n    global x\n",
            "del x\n",
            "assert x\n",
            "@decorator\ndef f():\n    pass\n",
        ] {
            let err = parse(src).unwrap_err();
            assert!(
                err.message.contains("unsupported construct"),
                "{src}: {}",
                err.message
            );
        }
    }

    #[test]
    fn grammar_errors_carry_position() {
        let err = parse("def f(:\n    pass\n").unwrap_err();
        assert_eq!(err.line, 1);
        let err = parse("x = (1 + \n").unwrap_err();
        assert!(err.message.contains("expected"));
        let err = parse("1 = x\n").unwrap_err();
        assert!(err.message.contains("cannot assign"));
        let err = parse("def f(a=1, b):\n    pass\n").unwrap_err();
        assert!(err.message.contains("non-default"));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("x = {}1{}\n", "(".repeat(150), ")".repeat(150));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested"));

        let chain = vec!["a"; 150].join(" + ");
        assert!(parse(&format!("x = {chain}\n")).is_err());
    }

    #[test]
    fn tree_survives_serde() {
        let program = parse("def f(a, b=2):\n    return [a * b for _ in range(3)]\n").unwrap();
        let json = serde_json::to_value(&program).unwrap();
        let back: Program = serde_json::from_value(json).unwrap();
        assert_eq!(program, back);
    }
}
