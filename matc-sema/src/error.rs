#![forbid(unsafe_code)]

use matc_ast::Span;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("symbol table error: {message}")]
#[diagnostic(code(matc::resolve))]
pub struct ResolveError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Debug, Error, Diagnostic)]
#[error("shape error: {message}")]
#[diagnostic(code(matc::shape))]
pub struct ShapeError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Debug, Error, Diagnostic)]
#[error("type error: {message}")]
#[diagnostic(code(matc::type_check))]
pub struct TypeError {
    pub message: String,
    #[label]
    pub span: Span,
}

/// Any analysis-stage failure; the variants render through their own
/// diagnostics unchanged.
#[derive(Debug, Error, Diagnostic)]
pub enum AnalyzeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Type(#[from] TypeError),
}
