#![forbid(unsafe_code)]

mod scanner;
mod token;

pub use scanner::{DelimiterStyle, LexError, ScanOutput, ScanSummary, Scanner};
pub use token::{Token, TokenKind};

/// Tokenize `src`, producing the token stream and the derived counts the
/// later stages consume.
pub fn scan(src: &str) -> Result<ScanOutput, LexError> {
    Scanner::new(src).scan()
}
