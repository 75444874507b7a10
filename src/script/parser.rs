//! Recursive-descent parser producing [`super::ast`] trees.

use std::rc::Rc;

use super::ParseError;
use super::ast::*;
use super::lexer::{Tok, Token, is_keyword, tokenize};

type PResult<T> = Result<T, ParseError>;

/// Parse a whole module (or interactive chunk).
pub fn parse_module(src: &str) -> PResult<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(src)?);
    parser.file()
}

/// Parse a single expression, as `eval` does.
pub fn parse_expression(src: &str) -> PResult<Expr> {
    let mut parser = Parser::new(tokenize(src.trim())?);
    while parser.at(&Tok::Newline) {
        parser.pos += 1;
    }
    let expr = parser.testlist()?;
    while parser.at(&Tok::Newline) {
        parser.pos += 1;
    }
    if !parser.at(&Tok::Eof) {
        return parser.error("invalid syntax: expected a single expression");
    }
    Ok(expr)
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
    depth: usize,
}

/// Deepest expression nesting the parser accepts.
const MAX_NESTING: usize = 100;
const TOO_DEEP: &str = "expression too deeply nested";

const AUG_OPS: &[(&str, BinOp)] = &[
    ("+=", BinOp::Add),
    ("-=", BinOp::Sub),
    ("*=", BinOp::Mul),
    ("/=", BinOp::Div),
    ("//=", BinOp::FloorDiv),
    ("%=", BinOp::Mod),
    ("**=", BinOp::Pow),
    ("&=", BinOp::BitAnd),
    ("|=", BinOp::BitOr),
    ("^=", BinOp::BitXor),
    ("<<=", BinOp::LShift),
    (">>=", BinOp::RShift),
];

impl Parser {
    fn new(toks: Vec<Token>) -> Self {
        Self {
            toks,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> &Tok {
        self.toks
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.toks
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map_or(1, |t| t.line)
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.toks.len() {
            self.pos += 1;
        }
        tok
    }

    fn error<T>(&self, msg: impl Into<String>) -> PResult<T> {
        Err(ParseError::new(msg, self.line()))
    }

    fn nested<T>(&mut self, msg: &str, body: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return self.error(msg);
        }
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;
        result
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            self.error(format!("invalid syntax: expected '{op}'"))
        }
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.error(format!("invalid syntax: expected '{kw}'"))
        }
    }

    fn ident(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(n) if !is_keyword(&n) => {
                self.pos += 1;
                Ok(n)
            }
            _ => self.error("invalid syntax: expected a name"),
        }
    }

    fn at_stmt_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof) || self.at_op(";")
    }

    // ── Statements ──

    fn file(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                Tok::Indent => return self.error("unexpected indent"),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Tok::Name(n) => match n.as_str() {
                "if" => Some(self.if_stmt()?),
                "while" => Some(self.while_stmt()?),
                "for" => Some(self.for_stmt()?),
                "try" => Some(self.try_stmt()?),
                "with" => Some(self.with_stmt()?),
                "def" => Some(StmtKind::FunctionDef(Rc::new(self.funcdef(Vec::new())?))),
                "class" => Some(StmtKind::ClassDef(Rc::new(self.classdef(Vec::new())?))),
                _ => None,
            },
            Tok::Op("@") => Some(self.decorated()?),
            _ => None,
        };
        match kind {
            Some(kind) => Ok(vec![Stmt::new(line, kind)]),
            None => self.simple_stmt(),
        }
    }

    fn simple_stmt(&mut self) -> PResult<Vec<Stmt>> {
        let mut out = Vec::new();
        loop {
            let line = self.line();
            out.push(Stmt::new(line, self.small_stmt()?));
            if self.eat_op(";") {
                if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(out)
            }
            Tok::Eof => Ok(out),
            _ => self.error("invalid syntax"),
        }
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.at(&Tok::Newline) {
            return self.simple_stmt();
        }
        self.pos += 1;
        if !self.at(&Tok::Indent) {
            return self.error("expected an indented block");
        }
        self.pos += 1;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn small_stmt(&mut self) -> PResult<StmtKind> {
        let Tok::Name(word) = self.peek().clone() else {
            return self.expr_stmt();
        };
        match word.as_str() {
            "pass" => {
                self.pos += 1;
                Ok(StmtKind::Pass)
            }
            "break" => {
                self.pos += 1;
                Ok(StmtKind::Break)
            }
            "continue" => {
                self.pos += 1;
                Ok(StmtKind::Continue)
            }
            "return" => {
                self.pos += 1;
                if self.at_stmt_end() {
                    Ok(StmtKind::Return(None))
                } else {
                    Ok(StmtKind::Return(Some(self.testlist()?)))
                }
            }
            "raise" => {
                self.pos += 1;
                if self.at_stmt_end() {
                    return Ok(StmtKind::Raise {
                        exc: None,
                        cause: None,
                    });
                }
                let exc = self.test()?;
                let cause = if self.eat_kw("from") {
                    Some(self.test()?)
                } else {
                    None
                };
                Ok(StmtKind::Raise {
                    exc: Some(exc),
                    cause,
                })
            }
            "global" | "nonlocal" => {
                self.pos += 1;
                let mut names = vec![self.ident()?];
                while self.eat_op(",") {
                    names.push(self.ident()?);
                }
                Ok(if word == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                })
            }
            "del" => {
                self.pos += 1;
                let mut targets = Vec::new();
                loop {
                    let e = self.expr()?;
                    targets.push(self.to_target(e, Ctx::Del)?);
                    if !self.eat_op(",") || self.at_stmt_end() {
                        break;
                    }
                }
                Ok(StmtKind::Delete(targets))
            }
            "assert" => {
                self.pos += 1;
                let test = self.test()?;
                let msg = if self.eat_op(",") {
                    Some(self.test()?)
                } else {
                    None
                };
                Ok(StmtKind::Assert { test, msg })
            }
            "import" => {
                self.pos += 1;
                let mut names = Vec::new();
                loop {
                    let name = self.dotted_name()?;
                    let asname = if self.eat_kw("as") {
                        Some(self.ident()?)
                    } else {
                        None
                    };
                    names.push(Alias { name, asname });
                    if !self.eat_op(",") {
                        break;
                    }
                }
                Ok(StmtKind::Import(names))
            }
            "from" => self.from_import(),
            "yield" => self.error("generators are not supported"),
            _ => self.expr_stmt(),
        }
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.ident()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.ident()?);
        }
        Ok(name)
    }

    fn from_import(&mut self) -> PResult<StmtKind> {
        self.expect_kw("from")?;
        let mut level = 0;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }
        let module = if self.at_kw("import") {
            None
        } else {
            Some(self.dotted_name()?)
        };
        if module.is_none() && level == 0 {
            return self.error("invalid syntax: expected a module name");
        }
        self.expect_kw("import")?;
        if self.eat_op("*") {
            return Ok(StmtKind::ImportFrom {
                module,
                names: vec![Alias {
                    name: "*".to_string(),
                    asname: None,
                }],
                level,
            });
        }
        let parens = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            if parens && self.at_op(")") {
                break;
            }
            let name = self.ident()?;
            let asname = if self.eat_kw("as") {
                Some(self.ident()?)
            } else {
                None
            };
            names.push(Alias { name, asname });
            if !self.eat_op(",") {
                break;
            }
        }
        if parens {
            self.expect_op(")")?;
        }
        if names.is_empty() {
            return self.error("invalid syntax: expected names to import");
        }
        Ok(StmtKind::ImportFrom {
            module,
            names,
            level,
        })
    }

    fn expr_stmt(&mut self) -> PResult<StmtKind> {
        let first = self.testlist()?;
        for (op, bin) in AUG_OPS {
            if self.eat_op(op) {
                let target = self.to_target(first, Ctx::Store)?;
                if matches!(target, Expr::Tuple(..) | Expr::List(..)) {
                    return self.error("illegal expression for augmented assignment");
                }
                let value = self.testlist()?;
                return Ok(StmtKind::AugAssign {
                    target,
                    op: *bin,
                    value,
                });
            }
        }
        if !self.at_op("=") {
            return Ok(StmtKind::Expr(first));
        }
        let mut chain = vec![first];
        while self.eat_op("=") {
            chain.push(self.testlist()?);
        }
        let value = chain.pop().unwrap_or(Expr::Const(Constant::None));
        let targets = chain
            .into_iter()
            .map(|t| self.to_target(t, Ctx::Store))
            .collect::<PResult<Vec<_>>>()?;
        Ok(StmtKind::Assign { targets, value })
    }

    fn to_target(&self, e: Expr, ctx: Ctx) -> PResult<Expr> {
        Ok(match e {
            Expr::Name(n, _) => Expr::Name(n, ctx),
            Expr::Attribute { value, attr, .. } => Expr::Attribute { value, attr, ctx },
            Expr::Subscript { value, index, .. } => Expr::Subscript { value, index, ctx },
            Expr::Tuple(items, _) => Expr::Tuple(
                items
                    .into_iter()
                    .map(|i| self.to_target(i, ctx))
                    .collect::<PResult<_>>()?,
                ctx,
            ),
            Expr::List(items, _) => Expr::List(
                items
                    .into_iter()
                    .map(|i| self.to_target(i, ctx))
                    .collect::<PResult<_>>()?,
                ctx,
            ),
            _ => return self.error("cannot assign to expression"),
        })
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.pos += 1; // 'if' or 'elif'
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.at_kw("elif") {
            let line = self.line();
            vec![Stmt::new(line, self.if_stmt()?)]
        } else if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn while_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("while")?;
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("for")?;
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.block()?;
        let orelse = if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    /// Loop and comprehension targets stop before `in`.
    fn target_list(&mut self) -> PResult<Expr> {
        let first = self.expr()?;
        if !self.at_op(",") {
            return self.to_target(first, Ctx::Store);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_kw("in") {
                break;
            }
            items.push(self.expr()?);
        }
        self.to_target(Expr::Tuple(items, Ctx::Load), Ctx::Store)
    }

    fn try_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.eat_kw("except") {
            let (kind, name) = if self.at_op(":") {
                (None, None)
            } else {
                let kind = self.test()?;
                let name = if self.eat_kw("as") {
                    Some(self.ident()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            handlers.push(Handler {
                kind,
                name,
                body: self.block()?,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return self.error("expected 'except' or 'finally' block");
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn with_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("with")?;
        let mut items = Vec::new();
        loop {
            let context = self.test()?;
            let target = if self.eat_kw("as") {
                let t = self.expr()?;
                Some(self.to_target(t, Ctx::Store)?)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.block()?;
        Ok(StmtKind::With { items, body })
    }

    fn decorated(&mut self) -> PResult<StmtKind> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.test()?);
            if !self.at(&Tok::Newline) {
                return self.error("invalid syntax after decorator");
            }
            self.pos += 1;
        }
        if self.at_kw("def") {
            Ok(StmtKind::FunctionDef(Rc::new(self.funcdef(decorators)?)))
        } else if self.at_kw("class") {
            Ok(StmtKind::ClassDef(Rc::new(self.classdef(decorators)?)))
        } else {
            self.error("decorators must precede 'def' or 'class'")
        }
    }

    fn funcdef(&mut self, decorators: Vec<Expr>) -> PResult<FunctionDef> {
        let line = self.line();
        self.expect_kw("def")?;
        let name = self.ident()?;
        self.expect_op("(")?;
        let params = self.params(")", true)?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        let doc = docstring(&body);
        Ok(FunctionDef {
            name,
            params,
            body,
            decorators,
            line,
            doc,
        })
    }

    fn classdef(&mut self, decorators: Vec<Expr>) -> PResult<ClassDef> {
        let line = self.line();
        self.expect_kw("class")?;
        let name = self.ident()?;
        let (mut bases, mut keywords) = (Vec::new(), Vec::new());
        if self.eat_op("(") {
            let (args, kws) = self.arglist()?;
            for arg in args {
                match arg {
                    Arg::Positional(e) => bases.push(e),
                    Arg::Starred(_) => return self.error("starred bases are not supported"),
                }
            }
            keywords = kws;
        }
        let body = self.block()?;
        let doc = docstring(&body);
        Ok(ClassDef {
            name,
            bases,
            keywords,
            body,
            decorators,
            line,
            doc,
        })
    }

    /// Parameter list up to (not including) `close`. Annotations are accepted
    /// in `def` headers and discarded.
    fn params(&mut self, close: &str, annotations: bool) -> PResult<Params> {
        let mut params = Params::default();
        let mut seen_star = false;
        while !self.at_op(close) {
            if self.eat_op("**") {
                params.kwarg = Some(self.ident()?);
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
            } else if self.eat_op("*") {
                if seen_star {
                    return self.error("duplicate '*' in parameter list");
                }
                seen_star = true;
                if !self.at_op(",") && !self.at_op(close) {
                    params.vararg = Some(self.ident()?);
                    if annotations && self.eat_op(":") {
                        self.test()?;
                    }
                }
            } else {
                if params.kwarg.is_some() {
                    return self.error("parameter after '**' parameter");
                }
                let name = self.ident()?;
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
                let default = if self.eat_op("=") {
                    Some(self.test()?)
                } else {
                    None
                };
                let param = Param { name, default };
                if seen_star {
                    params.kwonly.push(param);
                } else {
                    if param.default.is_none() && params.args.iter().any(|p| p.default.is_some())
                    {
                        return self.error("non-default argument follows default argument");
                    }
                    params.args.push(param);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    // ── Expressions ──

    fn testlist(&mut self) -> PResult<Expr> {
        let first = self.test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_stmt_end() || self.at_op("=") || self.at_op(")") {
                break;
            }
            if AUG_OPS.iter().any(|(op, _)| self.at_op(op)) {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items, Ctx::Load))
    }

    fn test(&mut self) -> PResult<Expr> {
        self.nested("too many nested parentheses", Self::test_inner)
    }

    fn test_inner(&mut self) -> PResult<Expr> {
        if self.at_kw("lambda") {
            return self.lambda();
        }
        let body = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.expect_kw("lambda")?;
        let params = self.params(":", false)?;
        self.expect_op(":")?;
        let value = self.test()?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt::new(line, StmtKind::Return(Some(value)))],
            decorators: Vec::new(),
            line,
            doc: None,
        })))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let first = self.and_test()?;
        if !self.at_kw("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.and_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let first = self.not_test()?;
        if !self.at_kw("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.not_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.eat_kw("not") {
            let operand = self.nested(TOO_DEEP, Self::not_test)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comp_op(&mut self) -> Option<CmpOp> {
        let next_is_in = matches!(self.peek_next(), Tok::Name(m) if m == "in");
        let op = match self.peek().clone() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Name(n) if n == "in" => CmpOp::In,
            Tok::Name(n) if n == "not" && next_is_in => {
                self.pos += 2;
                return Some(CmpOp::NotIn);
            }
            Tok::Name(n) if n == "is" => {
                self.pos += 1;
                if self.eat_kw("not") {
                    return Some(CmpOp::IsNot);
                }
                return Some(CmpOp::Is);
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.expr()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comp_op() {
            ops.push(op);
            comparators.push(self.expr()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::Compare {
            left: Box::new(left),
            ops,
            comparators,
        })
    }

    fn binary(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> PResult<Expr>,
    ) -> PResult<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (sym, op) in ops {
                if self.eat_op(sym) {
                    let right = next(self)?;
                    left = Expr::BinOp {
                        left: Box::new(left),
                        op: *op,
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.binary(&[("|", BinOp::BitOr)], Self::xor_expr)
    }

    fn xor_expr(&mut self) -> PResult<Expr> {
        self.binary(&[("^", BinOp::BitXor)], Self::and_expr)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        self.binary(&[("&", BinOp::BitAnd)], Self::shift_expr)
    }

    fn shift_expr(&mut self) -> PResult<Expr> {
        self.binary(
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
            Self::arith_expr,
        )
    }

    fn arith_expr(&mut self) -> PResult<Expr> {
        self.binary(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary(
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
        let op = if self.eat_op("-") {
            UnaryOp::Neg
        } else if self.eat_op("+") {
            UnaryOp::Pos
        } else if self.eat_op("~") {
            UnaryOp::Invert
        } else {
            return self.power();
        };
        let operand = self.nested(TOO_DEEP, Self::factor)?;
        // Fold negative literals so that i64::MIN is expressible.
        if op == UnaryOp::Neg
            && let Expr::Const(Constant::Int(v)) = &operand
        {
            return Ok(Expr::Const(Constant::Int(v.wrapping_neg())));
        }
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.atom_expr()?;
        if self.eat_op("**") {
            let exp = self.nested(TOO_DEEP, Self::factor)?;
            return Ok(Expr::BinOp {
                left: Box::new(base),
                op: BinOp::Pow,
                right: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn atom_expr(&mut self) -> PResult<Expr> {
        let mut e = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, keywords) = self.arglist()?;
                e = Expr::Call {
                    func: Box::new(e),
                    args,
                    keywords,
                };
            } else if self.eat_op("[") {
                let index = self.subscript_list()?;
                self.expect_op("]")?;
                e = Expr::Subscript {
                    value: Box::new(e),
                    index: Box::new(index),
                    ctx: Ctx::Load,
                };
            } else if self.eat_op(".") {
                let attr = match self.advance() {
                    Tok::Name(n) => n,
                    _ => return self.error("invalid syntax: expected attribute name"),
                };
                e = Expr::Attribute {
                    value: Box::new(e),
                    attr,
                    ctx: Ctx::Load,
                };
            } else {
                return Ok(e);
            }
        }
    }

    /// Arguments after an opening parenthesis, consuming the closing one.
    fn arglist(&mut self) -> PResult<(Vec<Arg>, Vec<Keyword>)> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        while !self.at_op(")") {
            if self.eat_op("**") {
                keywords.push(Keyword {
                    name: None,
                    value: self.test()?,
                });
            } else if self.eat_op("*") {
                args.push(Arg::Starred(self.test()?));
            } else {
                let e = self.test()?;
                if self.at_op("=")
                    && let Expr::Name(name, _) = &e
                {
                    self.pos += 1;
                    let name = name.clone();
                    if keywords.iter().any(|k| k.name.as_deref() == Some(&name)) {
                        return self.error(format!("keyword argument repeated: {name}"));
                    }
                    keywords.push(Keyword {
                        name: Some(name),
                        value: self.test()?,
                    });
                } else if self.at_kw("for") {
                    let generators = self.comprehension()?;
                    args.push(Arg::Positional(Expr::ListComp {
                        elt: Box::new(e),
                        generators,
                    }));
                } else {
                    if !keywords.is_empty() {
                        return self.error("positional argument follows keyword argument");
                    }
                    args.push(Arg::Positional(e));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, keywords))
    }

    fn subscript_list(&mut self) -> PResult<Expr> {
        let first = self.subscript()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.subscript()?);
        }
        Ok(Expr::Tuple(items, Ctx::Load))
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let lower = if self.at_op(":") {
            None
        } else {
            let e = self.test()?;
            if !self.at_op(":") {
                return Ok(e);
            }
            Some(Box::new(e))
        };
        self.expect_op(":")?;
        let upper = if self.at_op(":") || self.at_op("]") || self.at_op(",") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") && !self.at_op(",") {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn comprehension(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> PResult<Expr> {
        match self.advance() {
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new(), Ctx::Load));
                }
                let first = self.test()?;
                if self.at_kw("for") {
                    let generators = self.comprehension()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        generators,
                    });
                }
                if self.eat_op(")") {
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
                Ok(Expr::Tuple(items, Ctx::Load))
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new(), Ctx::Load));
                }
                let first = self.test()?;
                if self.at_kw("for") {
                    let generators = self.comprehension()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        generators,
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
                Ok(Expr::List(items, Ctx::Load))
            }
            Tok::Op("{") => self.dict_display(),
            Tok::Op("...") => Ok(Expr::Const(Constant::None)),
            Tok::Int(v) => Ok(Expr::Const(Constant::Int(v))),
            Tok::Float(v) => Ok(Expr::Const(Constant::Float(v))),
            Tok::Str(s) => {
                let mut s = s;
                while let Tok::Str(more) = self.peek() {
                    s.push_str(more);
                    self.pos += 1;
                }
                Ok(Expr::Const(Constant::Str(Rc::from(s))))
            }
            Tok::Bytes(b) => {
                let mut b = b;
                while let Tok::Bytes(more) = self.peek() {
                    b.extend_from_slice(more);
                    self.pos += 1;
                }
                Ok(Expr::Const(Constant::Bytes(Rc::from(b))))
            }
            Tok::Name(n) => match n.as_str() {
                "None" => Ok(Expr::Const(Constant::None)),
                "True" => Ok(Expr::Const(Constant::Bool(true))),
                "False" => Ok(Expr::Const(Constant::Bool(false))),
                kw if is_keyword(kw) => {
                    self.pos -= 1;
                    self.error(format!("invalid syntax near '{kw}'"))
                }
                _ => Ok(Expr::Name(n, Ctx::Load)),
            },
            Tok::Indent => self.error("unexpected indent"),
            Tok::Eof | Tok::Newline | Tok::Dedent => {
                self.pos = self.pos.saturating_sub(1);
                self.error("unexpected end of input")
            }
            Tok::Op(op) => {
                self.pos -= 1;
                self.error(format!("invalid syntax near '{op}'"))
            }
        }
    }

    fn dict_display(&mut self) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let key = self.test()?;
        if !self.eat_op(":") {
            return self.error("set displays are not supported");
        }
        let value = self.test()?;
        if self.at_kw("for") {
            let generators = self.comprehension()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                generators,
            });
        }
        let mut pairs = vec![(key, value)];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            let k = self.test()?;
            self.expect_op(":")?;
            let v = self.test()?;
            pairs.push((k, v));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(pairs))
    }
}

fn docstring(body: &[Stmt]) -> Option<Rc<str>> {
    match body.first().map(|s| &s.kind) {
        Some(StmtKind::Expr(Expr::Const(Constant::Str(s)))) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_function_with_defaults_and_varargs() {
        let m = parse_module("def f(a, b=2, *rest, key=None, **kw):\n    return a\n").unwrap();
        let StmtKind::FunctionDef(def) = &m[0].kind else {
            panic!("expected def");
        };
        assert_eq!(def.name, "f");
        assert_eq!(def.params.args.len(), 2);
        assert_eq!(def.params.vararg.as_deref(), Some("rest"));
        assert_eq!(def.params.kwonly.len(), 1);
        assert_eq!(def.params.kwarg.as_deref(), Some("kw"));
        assert_eq!(def.params.signature(), "a, b=..., *rest, key=..., **kw");
    }

    #[test]
    fn test_parse_class_with_keywords() {
        let m = parse_module("class A(B, private_key=k):\n    '''doc'''\n    x = 1\n").unwrap();
        let StmtKind::ClassDef(def) = &m[0].kind else {
            panic!("expected class");
        };
        assert_eq!(def.bases.len(), 1);
        assert_eq!(def.keywords[0].name.as_deref(), Some("private_key"));
        assert_eq!(def.doc.as_deref(), Some("doc"));
    }

    #[test]
    fn test_parse_relative_import() {
        let m = parse_module("from ..pkg.mod import a as b, c\n").unwrap();
        match &m[0].kind {
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => {
                assert_eq!(module.as_deref(), Some("pkg.mod"));
                assert_eq!(*level, 2);
                assert_eq!(names[0].asname.as_deref(), Some("b"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_chained_assignment_and_unpacking() {
        let m = parse_module("a = b = 1\nx, y = y, x\n").unwrap();
        assert!(matches!(&m[0].kind, StmtKind::Assign { targets, .. } if targets.len() == 2));
        assert!(matches!(
            &m[1].kind,
            StmtKind::Assign { targets, .. } if matches!(targets[0], Expr::Tuple(_, Ctx::Store))
        ));
    }

    #[test]
    fn test_parse_try_except_finally() {
        let src = "try:\n    x()\nexcept ValueError as e:\n    pass\nelse:\n    y()\nfinally:\n    z()\n";
        let m = parse_module(src).unwrap();
        assert!(matches!(
            &m[0].kind,
            StmtKind::Try { handlers, orelse, finalbody, .. }
                if handlers.len() == 1 && orelse.len() == 1 && finalbody.len() == 1
        ));
    }

    #[test]
    fn test_parse_comprehensions_and_slices() {
        parse_module("y = [i * 2 for i in xs if i]\nz = {k: v for k, v in d.items()}\nw = s[1:-1:2]\n")
            .unwrap();
    }

    #[test]
    fn test_parse_expression_rejects_statements() {
        assert!(parse_expression("1 + 2").is_ok());
        assert!(parse_expression("x = 1").is_err());
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse_module("x = 1\ny = (\n").unwrap_err();
        assert!(err.line >= 2);
    }

    #[test]
    fn test_one_line_blocks() {
        let m = parse_module("if x: y = 1\nelse: y = 2\n").unwrap();
        assert!(matches!(&m[0].kind, StmtKind::If { orelse, .. } if orelse.len() == 1));
    }

    #[test]
    fn test_parse_wildcard_import() {
        let m = parse_module("from pkg.mod import *\n").unwrap();
        assert!(matches!(
            &m[0].kind,
            StmtKind::ImportFrom { names, .. } if names.len() == 1 && names[0].name == "*"
        ));
        assert!(parse_module("from pkg import *, x\n").is_err());
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let src = format!("x = {}1{}\n", "(".repeat(1000), ")".repeat(1000));
        let err = parse_module(&src).unwrap_err();
        assert_eq!(err.msg, "too many nested parentheses");
        let src = format!("x = {}1\n", "-".repeat(1000));
        assert_eq!(parse_module(&src).unwrap_err().msg, "expression too deeply nested");
        let src = format!("x = {}[1]{}\n", "[".repeat(50), "]".repeat(50));
        parse_module(&src).unwrap();
    }
}
