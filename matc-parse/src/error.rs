#![forbid(unsafe_code)]

use matc_ast::Span;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("parse error: {message}")]
#[diagnostic(code(matc::parse))]
pub struct ParseError {
    pub message: String,
    #[label]
    pub span: Span,
}
