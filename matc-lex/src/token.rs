#![forbid(unsafe_code)]

use matc_ast::Span;

/// One scanned token. Lexeme text is never copied; callers reread it from
/// the source through the span offsets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub span: Span,
}

impl Token {
    pub fn text<'s>(&self, src: &'s str) -> &'s str {
        let start = self.span.offset();
        &src[start..start + self.span.len()]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Eof,
    Newline,

    // Literals / identifiers
    Scalar,
    Str,
    CharArray,
    Ident,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    BackDiv,
    Pow,
    ElemMul,
    ElemDiv,
    ElemBackDiv,
    ElemPow,
    Transpose,
    CTranspose,

    // Comparison / assignment
    Eq,
    EqEq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,

    // Logical
    Amp,
    Pipe,
    AndAnd,
    OrOr,
    Tilde,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semicolon,
    Comma,
    Colon,
    Dot,
    At,
    Metaclass,

    // Whole-line / out-of-band payloads
    OsCall,
    Continuation,
    Comment,
    BlockComment,

    // Keywords
    KwFunction,
    KwEnd,
    KwIf,
    KwElseIf,
    KwElse,
    KwWhile,
    KwFor,
    KwParfor,
    KwSwitch,
    KwCase,
    KwOtherwise,
    KwBreak,
    KwContinue,
    KwReturn,
    KwTry,
    KwCatch,
    KwGlobal,
    KwPersistent,
    KwSpmd,
    KwClassdef,
}

impl TokenKind {
    /// Tokens the parser skips as statement-internal noise.
    pub fn is_trivia(self) -> bool {
        matches!(self, TokenKind::Continuation)
    }

    pub fn keyword(text: &str) -> Option<TokenKind> {
        Some(match text {
            "function" => TokenKind::KwFunction,
            "end" => TokenKind::KwEnd,
            "if" => TokenKind::KwIf,
            "elseif" => TokenKind::KwElseIf,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "for" => TokenKind::KwFor,
            "parfor" => TokenKind::KwParfor,
            "switch" => TokenKind::KwSwitch,
            "case" => TokenKind::KwCase,
            "otherwise" => TokenKind::KwOtherwise,
            "break" => TokenKind::KwBreak,
            "continue" => TokenKind::KwContinue,
            "return" => TokenKind::KwReturn,
            "try" => TokenKind::KwTry,
            "catch" => TokenKind::KwCatch,
            "global" => TokenKind::KwGlobal,
            "persistent" => TokenKind::KwPersistent,
            "spmd" => TokenKind::KwSpmd,
            "classdef" => TokenKind::KwClassdef,
            _ => return None,
        })
    }

    /// Keywords that open an `end`-terminated block, `function` excluded.
    pub fn opens_block(self) -> bool {
        matches!(
            self,
            TokenKind::KwIf
                | TokenKind::KwWhile
                | TokenKind::KwFor
                | TokenKind::KwParfor
                | TokenKind::KwSwitch
                | TokenKind::KwTry
                | TokenKind::KwSpmd
        )
    }
}
