//! 字句解析のトークン型

use std::fmt;

/// ステップ関数ソースのトークン種別
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    While,
    In,
    Not,
    And,
    Or,
    Is,
    True,
    False,
    None,
    Pass,
    Break,
    Continue,
    Lambda,
    Import,
    From,
    As,
    Global,
    Nonlocal,
    /// 認識はするが常に拒否するキーワード（class, with, try など）
    Reserved(String),

    // Literals
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Operators
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl TokenKind {
    /// 識別子をキーワードに対応付ける
    pub fn keyword(ident: &str) -> Option<TokenKind> {
        let kind = match ident {
            "def" => TokenKind::Def,
            "return" => TokenKind::Return,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "while" => TokenKind::While,
            "in" => TokenKind::In,
            "not" => TokenKind::Not,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "is" => TokenKind::Is,
            "True" => TokenKind::True,
            "False" => TokenKind::False,
            "None" => TokenKind::None,
            "pass" => TokenKind::Pass,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "lambda" => TokenKind::Lambda,
            "import" => TokenKind::Import,
            "from" => TokenKind::From,
            "as" => TokenKind::As,
            "global" => TokenKind::Global,
            "nonlocal" => TokenKind::Nonlocal,
            "class" | "with" | "try" | "except" | "finally" | "raise" | "yield" | "del"
            | "assert" | "async" | "await" => TokenKind::Reserved(ident.to_string()),
            _ => return Option::None,
        };
        Some(kind)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Name(name) => write!(f, "name '{}'", name),
            TokenKind::Int(value) => write!(f, "integer {}", value),
            TokenKind::Float(value) => write!(f, "number {}", value),
            TokenKind::Str(value) => write!(f, "string {:?}", value),
            TokenKind::Reserved(word) => write!(f, "'{}'", word),
            TokenKind::Newline => write!(f, "end of line"),
            TokenKind::Indent => write!(f, "indent"),
            TokenKind::Dedent => write!(f, "dedent"),
            TokenKind::Eof => write!(f, "end of input"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// トークンのソース上の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

/// 種別と位置を持つトークン
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}
