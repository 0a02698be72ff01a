//! 字句解析器
//!
//! インデントを INDENT / DEDENT トークンに変換し、括弧内の改行は無視します。
//! 文字列接頭辞は raw (`r`) と `u` のみ受け付けます。

use std::iter::Peekable;
use std::str::CharIndices;

use super::ast::ParseError;
use super::token::*;

/// 全行に共通する先頭インデントを取り除く（タブは4桁に展開）
///
/// 空行とコメント行は共通インデントの計算から除外します。
pub fn dedent(source: &str) -> String {
    let lines: Vec<String> = source.lines().map(|line| line.replace('\t', "    ")).collect();
    let leading = |line: &str| line.len() - line.trim_start_matches(' ').len();

    let common = lines
        .iter()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|line| leading(line))
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| {
            let strip = common.min(leading(line));
            &line[strip..]
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// ステップ関数ソースの字句解析器
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
    pos: usize,
    indent_stack: Vec<usize>,
    paren_depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            pos: 0,
            indent_stack: vec![0],
            paren_depth: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    /// ソース全体をトークン列に変換
    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        loop {
            if self.at_line_start {
                if !self.scan_line_start()? {
                    break;
                }
                continue;
            }

            let Some(c) = self.peek_char() else { break };
            match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    if self.paren_depth == 0 {
                        self.push_newline();
                        self.at_line_start = true;
                    }
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.advance();
                    if self.peek_char() == Some('\r') {
                        self.advance();
                    }
                    if self.peek_char() == Some('\n') {
                        self.advance();
                    } else {
                        return Err(self.error("unexpected character after line continuation"));
                    }
                }
                _ => {
                    let token = self.scan_token()?;
                    self.tokens.push(token);
                }
            }
        }

        self.push_newline();
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.push_layout(TokenKind::Dedent);
        }
        self.push_layout(TokenKind::Eof);

        Ok(self.tokens)
    }

    // 行頭のインデント処理。EOF に達した場合は false
    fn scan_line_start(&mut self) -> Result<bool, ParseError> {
        let mut width = 0usize;
        while let Some(c) = self.peek_char() {
            match c {
                ' ' => width += 1,
                '\t' => width += 4 - width % 4,
                _ => break,
            }
            self.advance();
        }

        match self.peek_char() {
            None => return Ok(false),
            Some('\n') | Some('\r') => {
                self.advance();
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            Some(_) => {}
        }

        self.at_line_start = false;
        let current = self.indent_stack.last().copied().unwrap_or(0);
        if width > current {
            self.indent_stack.push(width);
            self.push_layout(TokenKind::Indent);
        } else if width < current {
            while width < self.indent_stack.last().copied().unwrap_or(0) {
                self.indent_stack.pop();
                self.push_layout(TokenKind::Dedent);
            }
            if width != self.indent_stack.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }

        Ok(true)
    }

    fn scan_token(&mut self) -> Result<Token, ParseError> {
        let start = self.pos;
        let line = self.line;
        let column = self.column;

        let c = self.peek_char().unwrap_or('\0');
        let kind = match c {
            '(' | '[' | '{' => {
                self.advance();
                self.paren_depth += 1;
                match c {
                    '(' => TokenKind::LParen,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                }
            }
            ')' | ']' | '}' => {
                self.advance();
                self.paren_depth = self.paren_depth.saturating_sub(1);
                match c {
                    ')' => TokenKind::RParen,
                    ']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                }
            }
            ',' => {
                self.advance();
                TokenKind::Comma
            }
            ':' => {
                self.advance();
                TokenKind::Colon
            }
            ';' => {
                self.advance();
                TokenKind::Semicolon
            }
            '.' => {
                if self.peek_next().is_some_and(|n| n.is_ascii_digit()) {
                    self.scan_number()?
                } else {
                    self.advance();
                    TokenKind::Dot
                }
            }
            '+' => {
                self.advance();
                self.with_assign(TokenKind::Plus, TokenKind::PlusAssign)
            }
            '-' => {
                self.advance();
                if self.peek_char() == Some('>') {
                    self.advance();
                    TokenKind::Arrow
                } else {
                    self.with_assign(TokenKind::Minus, TokenKind::MinusAssign)
                }
            }
            '*' => {
                self.advance();
                if self.peek_char() == Some('*') {
                    self.advance();
                    if self.peek_char() == Some('=') {
                        return Err(self.error("operator '**=' is not supported"));
                    }
                    TokenKind::DoubleStar
                } else {
                    self.with_assign(TokenKind::Star, TokenKind::StarAssign)
                }
            }
            '/' => {
                self.advance();
                if self.peek_char() == Some('/') {
                    self.advance();
                    if self.peek_char() == Some('=') {
                        return Err(self.error("operator '//=' is not supported"));
                    }
                    TokenKind::DoubleSlash
                } else {
                    self.with_assign(TokenKind::Slash, TokenKind::SlashAssign)
                }
            }
            '%' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    return Err(self.error("operator '%=' is not supported"));
                }
                TokenKind::Percent
            }
            '=' => {
                self.advance();
                self.with_assign(TokenKind::Assign, TokenKind::EqEq)
            }
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    TokenKind::Ne
                } else {
                    return Err(self.error("unexpected character: !"));
                }
            }
            '<' => {
                self.advance();
                self.with_assign(TokenKind::Lt, TokenKind::Le)
            }
            '>' => {
                self.advance();
                self.with_assign(TokenKind::Gt, TokenKind::Ge)
            }
            '"' | '\'' => self.scan_string(false)?,
            c if c.is_ascii_digit() => self.scan_number()?,
            c if c.is_alphabetic() || c == '_' => self.scan_identifier()?,
            other => {
                return Err(self.error(&format!("unexpected character: {}", other)));
            }
        };

        Ok(Token {
            kind,
            span: Span {
                start,
                end: self.pos,
                line,
                column,
            },
        })
    }

    // 直後が '=' なら複合トークン
    fn with_assign(&mut self, plain: TokenKind, compound: TokenKind) -> TokenKind {
        if self.peek_char() == Some('=') {
            self.advance();
            compound
        } else {
            plain
        }
    }

    fn scan_identifier(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let ident = &self.source[start..self.pos];

        if matches!(self.peek_char(), Some('"') | Some('\'')) {
            match ident.to_ascii_lowercase().as_str() {
                "r" => return self.scan_string(true),
                "u" => return self.scan_string(false),
                "f" | "b" | "rb" | "br" | "fr" | "rf" => {
                    return Err(self.error("formatted and byte strings are not supported"));
                }
                _ => {}
            }
        }

        Ok(TokenKind::keyword(ident).unwrap_or_else(|| TokenKind::Name(ident.to_string())))
    }

    fn scan_number(&mut self) -> Result<TokenKind, ParseError> {
        let start = self.pos;
        let mut is_float = false;

        self.consume_digits();
        if self.peek_char() == Some('.') {
            is_float = true;
            self.advance();
            self.consume_digits();
        }
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            is_float = true;
            self.advance();
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                self.advance();
            }
            if !self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("malformed number exponent"));
            }
            self.consume_digits();
        }
        if self.peek_char().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(self.error("invalid numeric literal"));
        }

        let text: String = self.source[start..self.pos].chars().filter(|c| *c != '_').collect();
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(&format!("invalid number: {}", text)))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.error(&format!("integer literal too large: {}", text)))
        }
    }

    fn consume_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn scan_string(&mut self, raw: bool) -> Result<TokenKind, ParseError> {
        let quote = self.peek_char().unwrap_or('"');
        let triple: String = std::iter::repeat_n(quote, 3).collect();
        let is_triple = self.source[self.pos..].starts_with(&triple);

        let quote_len = if is_triple { 3 } else { 1 };
        for _ in 0..quote_len {
            self.advance();
        }

        let mut value = String::new();
        loop {
            if is_triple && self.source[self.pos..].starts_with(&triple) {
                for _ in 0..3 {
                    self.advance();
                }
                break;
            }

            let Some(c) = self.advance() else {
                return Err(self.error("unterminated string literal"));
            };

            match c {
                c if c == quote && !is_triple => break,
                '\n' if !is_triple => return Err(self.error("unterminated string literal")),
                '\\' if !raw => {
                    let Some(escaped) = self.advance() else {
                        return Err(self.error("unterminated string literal"));
                    };
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '\\' => value.push('\\'),
                        '\'' => value.push('\''),
                        '"' => value.push('"'),
                        '\n' => {}
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                }
                other => value.push(other),
            }
        }

        Ok(TokenKind::Str(value))
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn push_newline(&mut self) {
        if self.tokens.last().is_some_and(|t| t.kind != TokenKind::Newline) {
            self.push_layout(TokenKind::Newline);
        }
    }

    fn push_layout(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            span: Span {
                start: self.pos,
                end: self.pos,
                line: self.line,
                column: self.column,
            },
        });
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next(&self) -> Option<char> {
        let mut rest = self.source[self.pos..].chars();
        rest.next();
        rest.next()
    }

    fn advance(&mut self) -> Option<char> {
        let (index, c) = self.chars.next()?;
        self.pos = index + c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            line: self.line,
            column: self.column,
        }
    }
}
