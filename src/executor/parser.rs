//! 再帰下降構文解析器
//!
//! トークン列から [`Module`] を構築します。
//!
//! ## 演算子の優先順位（低い順）
//! - lambda / 条件式
//! - or, and, not
//! - 比較（連鎖可能、`in` / `not in` / `is` / `is not` を含む）
//! - `+` `-`、`*` `/` `//` `%`、単項 `-` `+`、`**`
//! - 呼び出し・添字・属性参照

use std::sync::Arc;

use super::ast::*;
use super::lexer::{dedent, Lexer};
use super::token::{Token, TokenKind};

/// 式・ブロックの最大入れ子深さ（左結合の演算子連鎖も1段ずつ数える）
pub const MAX_NESTING_DEPTH: usize = 100;

/// 受け付けるソースの最大バイト数
pub const MAX_SOURCE_LEN: usize = 64 * 1024;

/// ソースを字句解析・構文解析してモジュールを得る
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(ParseError {
            message: format!("source is too long ({} bytes, limit {})", source.len(), MAX_SOURCE_LEN),
            line: 1,
            column: 1,
        });
    }
    let normalized = dedent(source);
    let tokens = Lexer::new(&normalized).tokenize()?;
    Parser::new(tokens).parse_module()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    pub fn parse_module(&mut self) -> Result<Module, ParseError> {
        let mut body = Vec::new();
        loop {
            while self.eat(&TokenKind::Newline) {}
            if self.check(&TokenKind::Eof) {
                break;
            }
            body.extend(self.parse_statement()?);
        }
        Ok(Module { body })
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        match self.peek() {
            TokenKind::Def => Ok(vec![self.parse_function_def()?]),
            TokenKind::If => Ok(vec![self.parse_if()?]),
            TokenKind::For => Ok(vec![self.parse_for()?]),
            TokenKind::While => Ok(vec![self.parse_while()?]),
            TokenKind::Reserved(word) => {
                let message = format!("'{}' statements are not supported", word);
                Err(self.error_here(&message))
            }
            TokenKind::Indent => Err(self.error_here("unexpected indent")),
            _ => self.parse_simple_line(),
        }
    }

    // `;` 区切りの単純文を行末まで
    fn parse_simple_line(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.parse_simple_statement()?];
        while self.eat(&TokenKind::Semicolon) {
            if self.check(&TokenKind::Newline) || self.check(&TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_simple_statement()?);
        }
        if !self.eat(&TokenKind::Newline) && !self.check(&TokenKind::Eof) {
            return Err(self.unexpected("end of line"));
        }
        Ok(stmts)
    }

    fn parse_simple_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        let kind = match self.peek() {
            TokenKind::Return => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_expr_list()?))
                }
            }
            TokenKind::Pass => {
                self.advance();
                StmtKind::Pass
            }
            TokenKind::Break => {
                self.advance();
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                StmtKind::Continue
            }
            TokenKind::Import => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.skip_to_statement_end();
                StmtKind::Import { module }
            }
            TokenKind::From => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.expect(&TokenKind::Import, "'import'")?;
                self.skip_to_statement_end();
                StmtKind::Import { module }
            }
            TokenKind::Global | TokenKind::Nonlocal => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat(&TokenKind::Comma) {
                    names.push(self.expect_name()?);
                }
                StmtKind::Global { names }
            }
            _ => self.parse_expression_statement()?,
        };
        Ok(Stmt { kind, line })
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, ParseError> {
        let first = self.parse_expr_list()?;

        // 型注釈付き代入（注釈は読み捨て）
        if self.eat(&TokenKind::Colon) {
            self.parse_expr()?;
            if self.eat(&TokenKind::Assign) {
                let value = self.parse_expr_list()?;
                let target = self.to_target(first)?;
                return Ok(StmtKind::Assign {
                    targets: vec![target],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }

        let aug_op = match self.peek() {
            TokenKind::PlusAssign => Some(BinOp::Add),
            TokenKind::MinusAssign => Some(BinOp::Sub),
            TokenKind::StarAssign => Some(BinOp::Mul),
            TokenKind::SlashAssign => Some(BinOp::Div),
            _ => None,
        };
        if let Some(op) = aug_op {
            self.advance();
            let value = self.parse_expr_list()?;
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.error_here("illegal expression for augmented assignment"));
            }
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        if self.check(&TokenKind::Assign) {
            let mut chain = vec![first];
            while self.eat(&TokenKind::Assign) {
                chain.push(self.parse_expr_list()?);
            }
            let value = chain.pop().unwrap_or(Expr::None);
            let targets = chain
                .into_iter()
                .map(|expr| self.to_target(expr))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(StmtKind::Assign { targets, value });
        }

        Ok(StmtKind::Expr(first))
    }

    fn parse_function_def(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::Def, "'def'")?;
        let name = self.expect_name()?;
        self.expect(&TokenKind::LParen, "'('")?;

        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            if self.check(&TokenKind::Star) || self.check(&TokenKind::DoubleStar) {
                return Err(self.error_here("variadic parameters are not supported"));
            }
            let param_name = self.expect_name()?;
            if self.eat(&TokenKind::Colon) {
                self.parse_expr()?;
            }
            let default = if self.eat(&TokenKind::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name: param_name,
                default,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;

        if self.eat(&TokenKind::Arrow) {
            self.parse_expr()?;
        }
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.parse_suite()?;

        Ok(Stmt {
            kind: StmtKind::FunctionDef(FunctionDef {
                name,
                params,
                body,
                line,
            }),
            line,
        })
    }

    // if と elif を共通に扱う
    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.advance();
        let test = self.parse_expr()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.parse_suite()?;

        let orelse = if self.check(&TokenKind::Elif) {
            self.enter()?;
            let elif = self.parse_if();
            self.leave();
            vec![elif?]
        } else if self.eat(&TokenKind::Else) {
            self.expect(&TokenKind::Colon, "':'")?;
            self.parse_suite()?
        } else {
            Vec::new()
        };

        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::For, "'for'")?;
        let target = self.parse_target_list()?;
        self.expect(&TokenKind::In, "'in'")?;
        let iter = self.parse_expr_list()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.parse_suite()?;

        let orelse = if self.eat(&TokenKind::Else) {
            self.expect(&TokenKind::Colon, "':'")?;
            self.parse_suite()?
        } else {
            Vec::new()
        };

        Ok(Stmt {
            kind: StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::While, "'while'")?;
        let test = self.parse_expr()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.parse_suite()?;
        if self.eat(&TokenKind::Else) {
            self.expect(&TokenKind::Colon, "':'")?;
            self.parse_suite()?;
        }
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            line,
        })
    }

    // ブロック本体（インデントされた文の並び、または同一行の単純文）
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if !self.eat(&TokenKind::Newline) {
            return self.parse_simple_line();
        }

        self.enter()?;
        self.expect(&TokenKind::Indent, "an indented block")?;
        let mut body = Vec::new();
        while !self.check(&TokenKind::Dedent) && !self.check(&TokenKind::Eof) {
            if self.eat(&TokenKind::Newline) {
                continue;
            }
            body.extend(self.parse_statement()?);
        }
        self.eat(&TokenKind::Dedent);
        self.leave();
        Ok(body)
    }

    fn parse_dotted_name(&mut self) -> Result<String, ParseError> {
        let mut name = self.expect_name()?;
        while self.eat(&TokenKind::Dot) {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn to_target(&self, expr: Expr) -> Result<Target, ParseError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Expr::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            Expr::Attribute { attr, .. } => {
                let message = format!("assignment to attribute '{}' is not supported", attr);
                Err(self.error_here(&message))
            }
            _ => Err(self.error_here("cannot assign to expression")),
        }
    }

    // for 文・内包表記の代入先（比較演算子を消費しない）
    fn parse_target_list(&mut self) -> Result<Target, ParseError> {
        let first = self.parse_arith()?;
        if !self.check(&TokenKind::Comma) {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::In) {
                break;
            }
            items.push(self.parse_arith()?);
        }
        self.to_target(Expr::Tuple(items))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// カンマ区切りならタプル
    fn parse_expr_list(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_expr()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if !self.starts_expr() {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = self.parse_expr_inner();
        self.leave();
        result
    }

    fn parse_expr_inner(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Lambda) {
            return self.parse_lambda();
        }
        let body = self.parse_or()?;
        if self.eat(&TokenKind::If) {
            let test = self.parse_or()?;
            self.expect(&TokenKind::Else, "'else'")?;
            let orelse = self.parse_expr()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        self.expect(&TokenKind::Lambda, "'lambda'")?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::Colon) {
            params.push(self.expect_name()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Colon, "':'")?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda {
            params,
            body: Arc::new(body),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        let mut links = 0;
        while self.eat(&TokenKind::Or) {
            self.link(&mut links)?;
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.unlink(links);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        let mut links = 0;
        while self.eat(&TokenKind::And) {
            self.link(&mut links)?;
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.unlink(links);
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&TokenKind::Not) {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand?),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();

        loop {
            let op = match self.peek() {
                TokenKind::EqEq => CmpOp::Eq,
                TokenKind::Ne => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                TokenKind::In => CmpOp::In,
                TokenKind::Not if self.peek_at(1) == &TokenKind::In => {
                    self.advance();
                    CmpOp::NotIn
                }
                TokenKind::Is => {
                    if self.peek_at(1) == &TokenKind::Not {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            ops.push((op, self.parse_arith()?));
        }

        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            self.link(&mut links)?;
            let right = self.parse_term()?;
            left = binop(left, op, right);
        }
        self.unlink(links);
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::DoubleSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.link(&mut links)?;
            let right = self.parse_factor()?;
            left = binop(left, op, right);
        }
        self.unlink(links);
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_factor();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if self.eat(&TokenKind::DoubleStar) {
            // 右結合
            self.enter()?;
            let exponent = self.parse_factor();
            self.leave();
            return Ok(binop(base, BinOp::Pow, exponent?));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        let mut links = 0;
        loop {
            if matches!(self.peek(), TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot) {
                self.link(&mut links)?;
            }
            match self.peek() {
                TokenKind::LParen => {
                    self.advance();
                    let (args, keywords) = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        keywords,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_subscript()?;
                    expr = Expr::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.expect_name()?;
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        attr,
                    };
                }
                _ => break,
            }
        }
        self.unlink(links);
        Ok(expr)
    }

    // '(' の直後から ')' まで
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>), ParseError> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();

        while !self.check(&TokenKind::RParen) {
            if self.check(&TokenKind::Star) || self.check(&TokenKind::DoubleStar) {
                return Err(self.error_here("argument unpacking is not supported"));
            }

            if let TokenKind::Name(name) = self.peek().clone()
                && self.peek_at(1) == &TokenKind::Assign
            {
                self.advance();
                self.advance();
                let value = self.parse_expr()?;
                keywords.push(Keyword { name, value });
            } else {
                if !keywords.is_empty() {
                    return Err(self.error_here("positional argument follows keyword argument"));
                }
                let arg = self.parse_expr()?;
                if self.check(&TokenKind::For) {
                    // ジェネレータ式はリスト内包として扱う
                    let clauses = self.parse_comprehension_clauses()?;
                    args.push(Expr::ListComp {
                        element: Box::new(arg),
                        clauses,
                    });
                } else {
                    args.push(arg);
                }
            }

            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        self.expect(&TokenKind::RParen, "')'")?;
        Ok((args, keywords))
    }

    // '[' の直後から ']' まで
    fn parse_subscript(&mut self) -> Result<Expr, ParseError> {
        let lower = if self.check(&TokenKind::Colon) {
            None
        } else {
            Some(self.parse_expr_list()?)
        };

        let index = if self.eat(&TokenKind::Colon) {
            let upper = if self.check(&TokenKind::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            if self.check(&TokenKind::Colon) {
                return Err(self.error_here("slice steps are not supported"));
            }
            Expr::Slice {
                lower: lower.map(Box::new),
                upper,
            }
        } else {
            match lower {
                Some(expr) => expr,
                None => return Err(self.unexpected("an index")),
            }
        };

        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(index)
    }

    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>, ParseError> {
        let mut clauses = Vec::new();
        while self.eat(&TokenKind::For) {
            let target = self.parse_target_list()?;
            self.expect(&TokenKind::In, "'in'")?;
            let iter = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.eat(&TokenKind::If) {
                conditions.push(self.parse_or()?);
            }
            clauses.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(clauses)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Name(name) => Ok(Expr::Name(name)),
            TokenKind::Int(value) => Ok(Expr::Int(value)),
            TokenKind::Float(value) => Ok(Expr::Float(value)),
            TokenKind::Str(mut value) => {
                // 隣接する文字列リテラルは連結
                while let TokenKind::Str(next) = self.peek() {
                    value.push_str(next);
                    self.advance();
                }
                Ok(Expr::Str(value))
            }
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::None => Ok(Expr::None),
            TokenKind::LParen => self.parse_paren_atom(),
            TokenKind::LBracket => self.parse_list_atom(),
            TokenKind::LBrace => self.parse_dict_atom(),
            TokenKind::Reserved(word) => Err(self.error_at(
                &token.span,
                &format!("'{}' is not supported", word),
            )),
            other => Err(self.error_at(&token.span, &format!("unexpected {}", other))),
        }
    }

    fn parse_paren_atom(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&TokenKind::RParen) {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.parse_expr()?;

        if self.check(&TokenKind::For) {
            let clauses = self.parse_comprehension_clauses()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                clauses,
            });
        }

        if !self.check(&TokenKind::Comma) {
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(first);
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RParen) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(Expr::Tuple(items))
    }

    fn parse_list_atom(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expr()?;

        if self.check(&TokenKind::For) {
            let clauses = self.parse_comprehension_clauses()?;
            self.expect(&TokenKind::RBracket, "']'")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                clauses,
            });
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.check(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expr::List(items))
    }

    fn parse_dict_atom(&mut self) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = self.parse_expr()?;
            if !self.eat(&TokenKind::Colon) {
                return Err(self.error_here("set literals are not supported"));
            }
            let value = self.parse_expr()?;
            if self.check(&TokenKind::For) {
                return Err(self.error_here("dict comprehensions are not supported"));
            }
            entries.push((key, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expr::Dict(entries))
    }

    // ========================================================================
    // Token helpers
    // ========================================================================

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token {
            kind: TokenKind::Eof,
            span: Default::default(),
        });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        if let TokenKind::Name(name) = self.peek().clone() {
            self.advance();
            Ok(name)
        } else {
            Err(self.unexpected("a name"))
        }
    }

    fn starts_expr(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Name(_)
                | TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::Str(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::None
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::Not
                | TokenKind::Lambda
        )
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof
        )
    }

    fn skip_to_statement_end(&mut self) {
        while !self.at_statement_end() {
            self.advance();
        }
    }

    fn current_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.span.line)
            .unwrap_or_default()
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(self.error_here("maximum nesting depth exceeded"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // 連鎖の1段を入れ子1段として数える
    fn link(&mut self, links: &mut usize) -> Result<(), ParseError> {
        self.enter()?;
        *links += 1;
        Ok(())
    }

    fn unlink(&mut self, links: usize) {
        self.depth = self.depth.saturating_sub(links);
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let message = format!("expected {}, found {}", expected, self.peek());
        self.error_here(&message)
    }

    fn error_here(&self, message: &str) -> ParseError {
        let span = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_default();
        self.error_at(&span, message)
    }

    fn error_at(&self, span: &super::token::Span, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            line: span.line,
            column: span.column,
        }
    }
}

fn binop(left: Expr, op: BinOp, right: Expr) -> Expr {
    Expr::BinOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}
