#![forbid(unsafe_code)]

mod error;
mod resolve;
mod scopes;
mod shape;
mod types;

pub use error::{AnalyzeError, ResolveError, ShapeError, TypeError};
pub use resolve::{is_builtin, Resolver, BUILTINS};
pub use scopes::ScopeBuilder;
pub use shape::ShapeInferrer;
pub use types::{is_statement, TypeInferrer};

use matc_ast::{Ast, NodeId};
use matc_lex::Token;

#[derive(Clone, Copy, Debug, Default)]
pub struct AnalyzeOptions {
    /// Add and subtract require exactly matching shapes; no broadcast.
    pub mathematical_notation: bool,
    /// Report a conflicting reassignment as a fixed-shape violation rather
    /// than an unsupported resize.
    pub disallow_resizing: bool,
}

/// Source text of the identifier or name a node carries. The only node
/// without a token is the synthetic `ans` target.
pub fn node_name<'s>(ast: &Ast, tokens: &[Token], src: &'s str, id: NodeId) -> &'s str {
    match ast.node(id).token {
        Some(t) => tokens[t.0 as usize].text(src),
        None => "ans",
    }
}

/// Run the four analysis passes in order: scope construction, name
/// resolution, shape inference, type inference. Each mutates annotations
/// on the tree in place.
pub fn analyze(
    ast: &mut Ast,
    root: NodeId,
    tokens: &[Token],
    src: &str,
    opts: AnalyzeOptions,
) -> Result<(), AnalyzeError> {
    ScopeBuilder::new(ast, tokens, src).run(root)?;
    Resolver::new(ast, tokens, src).run(root)?;
    ShapeInferrer::new(
        ast,
        tokens,
        src,
        opts.mathematical_notation,
        opts.disallow_resizing,
    )
    .run()?;
    TypeInferrer::new(ast, tokens, src).run()?;
    Ok(())
}
