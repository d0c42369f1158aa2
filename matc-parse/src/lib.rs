#![forbid(unsafe_code)]

mod error;
mod parser;

use miette::IntoDiagnostic;

pub use error::ParseError;
pub use parser::{ParseOutput, Parser};

/// Scan and parse in one step, for callers that do not need the token
/// stream afterwards.
pub fn parse_source(src: &str) -> miette::Result<ParseOutput> {
    let scanned = matc_lex::scan(src).into_diagnostic()?;
    Parser::new(src, &scanned.tokens, &scanned.summary)
        .parse_program()
        .into_diagnostic()
}

/// Scan and parse, returning the scan output alongside the tree; the
/// analysis and emission stages need both.
pub fn parse_with_tokens(src: &str) -> miette::Result<(matc_lex::ScanOutput, ParseOutput)> {
    let scanned = matc_lex::scan(src).into_diagnostic()?;
    let parsed = Parser::new(src, &scanned.tokens, &scanned.summary)
        .parse_program()
        .into_diagnostic()?;
    Ok((scanned, parsed))
}
