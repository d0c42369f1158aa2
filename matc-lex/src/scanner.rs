#![forbid(unsafe_code)]

use matc_ast::{span_between, Span};
use miette::Diagnostic;
use thiserror::Error;

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Diagnostic)]
#[error("scanner error: {message}")]
#[diagnostic(code(matc::scan))]
pub struct LexError {
    pub message: String,
    #[label]
    pub span: Span,
}

/// Whether function definitions in this file carry a closing `end`.
///
/// Committed file-globally after scanning from the keyword counts; any
/// other relation between the counts is a fatal input error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelimiterStyle {
    /// `num_open + num_functions == num_end`: functions end with `end`.
    Terminated,
    /// `num_open == num_end`: functions run to the next definition or EOF.
    Open,
}

#[derive(Clone, Debug)]
pub struct ScanSummary {
    pub num_functions: u32,
    pub num_open_keywords: u32,
    pub num_end_keywords: u32,
    pub num_idents: u32,
    pub num_globals: u32,
    /// Live-tracked `(` minus `)` count; zero at end of file for any input
    /// the parser will accept.
    pub paren_balance: i32,
    /// The source referenced the implicit result name `ans` somewhere.
    pub saw_ans: bool,
    /// Leading documentation block captured by the preamble pass.
    pub doc_comment: Option<Span>,
    pub delimiter_style: DelimiterStyle,
}

#[derive(Clone, Debug)]
pub struct ScanOutput {
    pub tokens: Vec<Token>,
    pub summary: ScanSummary,
}

pub struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    line_start: usize,
    /// The apostrophe latch: true while an apostrophe would introduce a
    /// char-array literal, false where it is the conjugate-transpose
    /// postfix (after identifiers, numerics, close delimiters).
    apos_is_string: bool,
    /// Depth of `(` and `{` nesting; `end` at depth zero closes a block.
    index_depth: i32,
    paren_balance: i32,
    last_significant: Option<TokenKind>,
    tokens: Vec<Token>,

    num_functions: u32,
    num_open_keywords: u32,
    num_end_keywords: u32,
    num_idents: u32,
    num_globals: u32,
    saw_ans: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
            apos_is_string: true,
            index_depth: 0,
            paren_balance: 0,
            last_significant: None,
            tokens: Vec::new(),
            num_functions: 0,
            num_open_keywords: 0,
            num_end_keywords: 0,
            num_idents: 0,
            num_globals: 0,
            saw_ans: false,
        }
    }

    pub fn scan(mut self) -> Result<ScanOutput, LexError> {
        // Initial pass: capture the leading documentation block, then reset
        // and tokenize from the top.
        let doc_comment = doc_preamble(self.src);

        while self.pos < self.bytes.len() {
            self.scan_one()?;
        }
        let eof = span_between(self.src.len(), self.src.len());
        self.push(TokenKind::Eof, eof, self.line);

        let delimiter_style = if self.num_open_keywords == self.num_end_keywords {
            DelimiterStyle::Open
        } else if self.num_open_keywords + self.num_functions == self.num_end_keywords {
            DelimiterStyle::Terminated
        } else {
            return Err(LexError {
                message: format!(
                    "unbalanced block delimiters: {} openers, {} function definitions, {} ends",
                    self.num_open_keywords, self.num_functions, self.num_end_keywords
                ),
                span: eof,
            });
        };

        let summary = ScanSummary {
            num_functions: self.num_functions,
            num_open_keywords: self.num_open_keywords,
            num_end_keywords: self.num_end_keywords,
            num_idents: self.num_idents,
            num_globals: self.num_globals,
            paren_balance: self.paren_balance,
            saw_ans: self.saw_ans,
            doc_comment,
            delimiter_style,
        };
        Ok(ScanOutput {
            tokens: self.tokens,
            summary,
        })
    }

    fn scan_one(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        let line = self.line;
        let b = self.bytes[self.pos];
        match b {
            b' ' | b'\t' => {
                self.pos += 1;
            }
            b'\r' => {
                // CRLF folds into a single newline token.
                self.pos += 1;
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
                self.emit_newline(start, line);
            }
            b'\n' => {
                self.pos += 1;
                self.emit_newline(start, line);
            }
            b'%' => self.scan_comment(start, line)?,
            b'!' => {
                self.consume_to_eol();
                self.push(TokenKind::OsCall, span_between(start, self.pos), line);
            }
            b'\'' => {
                if self.apos_is_string {
                    self.scan_quoted(start, line, b'\'', TokenKind::CharArray)?;
                } else {
                    self.pos += 1;
                    self.push(TokenKind::CTranspose, span_between(start, self.pos), line);
                }
            }
            b'"' => self.scan_quoted(start, line, b'"', TokenKind::Str)?,
            b'.' => self.scan_dot(start, line)?,
            b'0'..=b'9' => self.scan_number(start, line),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.scan_word(start, line),
            _ => self.scan_symbol(start, line)?,
        }
        Ok(())
    }

    fn scan_comment(&mut self, start: usize, line: u32) -> Result<(), LexError> {
        if self.block_marker_line(b'{') {
            return self.scan_block_comment(start, line);
        }
        self.consume_to_eol();
        self.push(TokenKind::Comment, span_between(start, self.pos), line);
        Ok(())
    }

    /// True when the current `%` begins `%{` (or `%}` for `close`) as the
    /// only non-whitespace content of its line.
    fn block_marker_line(&self, close_or_open: u8) -> bool {
        if self.peek_at(self.pos + 1) != Some(close_or_open) {
            return false;
        }
        let before = &self.bytes[self.line_start..self.pos];
        if !before.iter().all(|b| *b == b' ' || *b == b'\t') {
            return false;
        }
        let mut i = self.pos + 2;
        while let Some(b) = self.peek_at(i) {
            match b {
                b' ' | b'\t' | b'\r' => i += 1,
                b'\n' => return true,
                _ => return false,
            }
        }
        true
    }

    fn scan_block_comment(&mut self, start: usize, line: u32) -> Result<(), LexError> {
        let mut depth = 0i32;
        loop {
            if self.pos >= self.bytes.len() {
                return Err(LexError {
                    message: "unterminated block comment".to_string(),
                    span: span_between(start, self.pos),
                });
            }
            let b = self.bytes[self.pos];
            if b == b'%' && self.block_marker_line(b'{') {
                depth += 1;
            } else if b == b'%' && self.block_marker_line(b'}') {
                depth -= 1;
                if depth == 0 {
                    self.pos += 2;
                    break;
                }
            }
            if b == b'\n' {
                self.line += 1;
                self.line_start = self.pos + 1;
            }
            self.pos += 1;
        }
        self.push(TokenKind::BlockComment, span_between(start, self.pos), line);
        Ok(())
    }

    fn scan_quoted(
        &mut self,
        start: usize,
        line: u32,
        quote: u8,
        kind: TokenKind,
    ) -> Result<(), LexError> {
        self.pos += 1;
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(LexError {
                        message: "unterminated string literal".to_string(),
                        span: span_between(start, self.pos),
                    });
                }
                Some(b) if b == quote => {
                    self.pos += 1;
                    // A doubled delimiter is a literal delimiter.
                    if self.peek() == Some(quote) {
                        self.pos += 1;
                        continue;
                    }
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        self.push(kind, span_between(start, self.pos), line);
        Ok(())
    }

    fn scan_dot(&mut self, start: usize, line: u32) -> Result<(), LexError> {
        match self.peek_at(self.pos + 1) {
            Some(b'0'..=b'9') => {
                self.scan_number(start, line);
                Ok(())
            }
            Some(b'*') => {
                self.pos += 2;
                self.push(TokenKind::ElemMul, span_between(start, self.pos), line);
                Ok(())
            }
            Some(b'/') => {
                self.pos += 2;
                self.push(TokenKind::ElemDiv, span_between(start, self.pos), line);
                Ok(())
            }
            Some(b'\\') => {
                self.pos += 2;
                self.push(TokenKind::ElemBackDiv, span_between(start, self.pos), line);
                Ok(())
            }
            Some(b'^') => {
                self.pos += 2;
                self.push(TokenKind::ElemPow, span_between(start, self.pos), line);
                Ok(())
            }
            Some(b'\'') => {
                self.pos += 2;
                self.push(TokenKind::Transpose, span_between(start, self.pos), line);
                Ok(())
            }
            Some(b'.') if self.peek_at(self.pos + 2) == Some(b'.') => {
                // Line continuation: discard through the end of line and
                // keep scanning the same logical statement.
                self.consume_to_eol();
                self.push(TokenKind::Continuation, span_between(start, self.pos), line);
                if self.peek() == Some(b'\r') {
                    self.pos += 1;
                }
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                    self.line += 1;
                    self.line_start = self.pos;
                }
                Ok(())
            }
            _ => {
                self.pos += 1;
                self.push(TokenKind::Dot, span_between(start, self.pos), line);
                Ok(())
            }
        }
    }

    fn scan_number(&mut self, start: usize, line: u32) {
        let mut seen_dot = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                // A dot joins the literal only when a digit follows, so
                // `10.*20` stays three tokens.
                b'.' if !seen_dot && matches!(self.peek_at(self.pos + 1), Some(b'0'..=b'9')) => {
                    seen_dot = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    let mut i = self.pos + 1;
                    if self.peek_at(i) == Some(b'-') {
                        i += 1;
                    }
                    if !matches!(self.peek_at(i), Some(b'0'..=b'9')) {
                        break;
                    }
                    self.pos = i;
                    while matches!(self.peek(), Some(b'0'..=b'9')) {
                        self.pos += 1;
                    }
                    break;
                }
                _ => break,
            }
        }
        self.push(TokenKind::Scalar, span_between(start, self.pos), line);
    }

    fn scan_word(&mut self, start: usize, line: u32) {
        while matches!(
            self.peek(),
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];

        // After a dot the word is a member name, never a keyword.
        let after_dot = self.last_significant == Some(TokenKind::Dot);
        let kind = if after_dot {
            None
        } else {
            TokenKind::keyword(text)
        };

        match kind {
            Some(kw) => {
                match kw {
                    TokenKind::KwFunction => self.num_functions += 1,
                    TokenKind::KwEnd if self.index_depth == 0 => self.num_end_keywords += 1,
                    TokenKind::KwGlobal => self.num_globals += 1,
                    k if k.opens_block() => self.num_open_keywords += 1,
                    _ => {}
                }
                self.push(kw, span_between(start, self.pos), line);
            }
            None => {
                self.num_idents += 1;
                if text == "ans" {
                    self.saw_ans = true;
                }
                self.push(TokenKind::Ident, span_between(start, self.pos), line);
            }
        }
    }

    fn scan_symbol(&mut self, start: usize, line: u32) -> Result<(), LexError> {
        let b = self.bytes[self.pos];
        let two = self.peek_at(self.pos + 1);
        let (kind, len) = match (b, two) {
            (b'=', Some(b'=')) => (TokenKind::EqEq, 2),
            (b'=', _) => (TokenKind::Eq, 1),
            (b'~', Some(b'=')) => (TokenKind::Neq, 2),
            (b'~', _) => (TokenKind::Tilde, 1),
            (b'<', Some(b'=')) => (TokenKind::Le, 2),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', Some(b'=')) => (TokenKind::Ge, 2),
            (b'>', _) => (TokenKind::Gt, 1),
            (b'&', Some(b'&')) => (TokenKind::AndAnd, 2),
            (b'&', _) => (TokenKind::Amp, 1),
            (b'|', Some(b'|')) => (TokenKind::OrOr, 2),
            (b'|', _) => (TokenKind::Pipe, 1),
            (b'+', _) => (TokenKind::Add, 1),
            (b'-', _) => (TokenKind::Sub, 1),
            (b'*', _) => (TokenKind::Mul, 1),
            (b'/', _) => (TokenKind::Div, 1),
            (b'\\', _) => (TokenKind::BackDiv, 1),
            (b'^', _) => (TokenKind::Pow, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'[', _) => (TokenKind::LBracket, 1),
            (b']', _) => (TokenKind::RBracket, 1),
            (b'{', _) => (TokenKind::LBrace, 1),
            (b'}', _) => (TokenKind::RBrace, 1),
            (b';', _) => (TokenKind::Semicolon, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b'@', _) => (TokenKind::At, 1),
            (b'?', _) => (TokenKind::Metaclass, 1),
            _ => {
                return Err(LexError {
                    message: format!("unexpected character {:?}", b as char),
                    span: span_between(start, start + 1),
                });
            }
        };

        if kind == TokenKind::Comma && self.last_significant == Some(TokenKind::Comma) {
            return Err(LexError {
                message: "two adjacent commas".to_string(),
                span: span_between(start, start + 1),
            });
        }

        match kind {
            TokenKind::LParen => {
                self.paren_balance += 1;
                self.index_depth += 1;
            }
            TokenKind::RParen => {
                self.paren_balance -= 1;
                self.index_depth -= 1;
            }
            TokenKind::LBrace => self.index_depth += 1,
            TokenKind::RBrace => self.index_depth -= 1,
            _ => {}
        }

        self.pos += len;
        self.push(kind, span_between(start, self.pos), line);
        Ok(())
    }

    fn emit_newline(&mut self, start: usize, line: u32) {
        self.push(TokenKind::Newline, span_between(start, self.pos), line);
        self.line += 1;
        self.line_start = self.pos;
    }

    fn consume_to_eol(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' || b == b'\r' {
                break;
            }
            self.pos += 1;
        }
    }

    fn push(&mut self, kind: TokenKind, span: Span, line: u32) {
        match kind {
            TokenKind::Comment | TokenKind::BlockComment | TokenKind::Continuation => {}
            TokenKind::Ident
            | TokenKind::Scalar
            | TokenKind::Str
            | TokenKind::CharArray
            | TokenKind::RParen
            | TokenKind::RBracket
            | TokenKind::RBrace
            | TokenKind::Transpose
            | TokenKind::CTranspose
            | TokenKind::KwEnd => {
                self.apos_is_string = false;
                self.last_significant = Some(kind);
            }
            TokenKind::Newline => {
                self.apos_is_string = true;
                self.last_significant = None;
            }
            _ => {
                self.apos_is_string = true;
                self.last_significant = Some(kind);
            }
        }
        self.tokens.push(Token { kind, line, span });
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, i: usize) -> Option<u8> {
        self.bytes.get(i).copied()
    }
}

/// Capture the leading documentation block: whitespace, optionally a single
/// function header line, then consecutive single-line comments. Block
/// comments and continuations do not join the block.
fn doc_preamble(src: &str) -> Option<Span> {
    let bytes = src.as_bytes();
    let mut pos = 0usize;

    let skip_blank = |pos: &mut usize| {
        while let Some(b) = bytes.get(*pos) {
            if matches!(b, b' ' | b'\t' | b'\r' | b'\n') {
                *pos += 1;
            } else {
                break;
            }
        }
    };
    let eol = |mut i: usize| {
        while i < bytes.len() && bytes[i] != b'\n' {
            i += 1;
        }
        i
    };

    skip_blank(&mut pos);
    if src[pos..].starts_with("function")
        && !matches!(
            bytes.get(pos + "function".len()),
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        )
    {
        pos = eol(pos);
    }
    skip_blank(&mut pos);

    let mut start = None;
    let mut end = pos;
    while bytes.get(pos) == Some(&b'%') {
        // `%{` opening a block comment ends the preamble.
        let line_end = eol(pos);
        let rest = src[pos + 1..line_end].trim();
        if rest.starts_with('{') && rest[1..].trim().is_empty() {
            break;
        }
        start.get_or_insert(pos);
        end = line_end;
        pos = line_end;
        skip_blank(&mut pos);
    }

    start.map(|s| span_between(s, end))
}
