#![forbid(unsafe_code)]

use matc_ast::{Ast, NodeId, NodeKind};
use matc_lex::Token;

use crate::error::ResolveError;
use crate::node_name;

/// Tag every function (and lambda) with its enclosing lexical scope and
/// reject duplicate function names within one scope.
pub struct ScopeBuilder<'a> {
    ast: &'a mut Ast,
    tokens: &'a [Token],
    src: &'a str,
    /// (scope, name, line) for every function definition seen so far.
    seen: Vec<(NodeId, String, u32)>,
}

impl<'a> ScopeBuilder<'a> {
    pub fn new(ast: &'a mut Ast, tokens: &'a [Token], src: &'a str) -> Self {
        Self {
            ast,
            tokens,
            src,
            seen: Vec::new(),
        }
    }

    pub fn run(mut self, root: NodeId) -> Result<(), ResolveError> {
        self.walk_block(self.ast.child(root, 0), root)?;
        Ok(())
    }

    fn walk_block(&mut self, head: Option<NodeId>, scope: NodeId) -> Result<(), ResolveError> {
        let stmts: Vec<NodeId> = self.ast.list(head).collect();
        for stmt in stmts {
            self.walk_stmt(stmt, scope)?;
        }
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: NodeId, scope: NodeId) -> Result<(), ResolveError> {
        match self.ast.kind(stmt) {
            NodeKind::Function => {
                self.ast.node_mut(stmt).scope_parent = Some(scope);
                self.register(stmt, scope)?;
                // Body statements live in the function's own scope.
                self.walk_block(self.ast.child(stmt, 2), stmt)?;
            }
            NodeKind::If | NodeKind::ElseIf => {
                self.walk_exprs(self.ast.child(stmt, 0), scope)?;
                self.walk_block(self.ast.child(stmt, 1), scope)?;
                if let Some(arm) = self.ast.child(stmt, 2) {
                    self.walk_stmt(arm, scope)?;
                }
            }
            NodeKind::Else | NodeKind::Otherwise | NodeKind::Spmd => {
                self.walk_block(self.ast.child(stmt, 0), scope)?;
            }
            NodeKind::While => {
                self.walk_exprs(self.ast.child(stmt, 0), scope)?;
                self.walk_block(self.ast.child(stmt, 1), scope)?;
            }
            NodeKind::For | NodeKind::Parfor => {
                self.walk_exprs(self.ast.child(stmt, 1), scope)?;
                self.walk_block(self.ast.child(stmt, 2), scope)?;
            }
            NodeKind::Switch => {
                self.walk_exprs(self.ast.child(stmt, 0), scope)?;
                let arms: Vec<NodeId> = self.ast.list(self.ast.child(stmt, 1)).collect();
                for arm in arms {
                    self.walk_stmt(arm, scope)?;
                }
            }
            NodeKind::Case => {
                self.walk_exprs(self.ast.child(stmt, 0), scope)?;
                self.walk_block(self.ast.child(stmt, 1), scope)?;
            }
            NodeKind::TryCatch => {
                self.walk_block(self.ast.child(stmt, 0), scope)?;
                self.walk_block(self.ast.child(stmt, 2), scope)?;
            }
            NodeKind::Assign | NodeKind::ExprStmt | NodeKind::MultiAssign => {
                for slot in 0..matc_ast::MAX_CHILDREN {
                    self.walk_exprs(self.ast.child(stmt, slot), scope)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Lambdas nest scopes inside expressions, so expression trees are
    /// walked too.
    fn walk_exprs(&mut self, head: Option<NodeId>, scope: NodeId) -> Result<(), ResolveError> {
        let nodes: Vec<NodeId> = self.ast.list(head).collect();
        for id in nodes {
            if self.ast.kind(id) == NodeKind::Lambda {
                self.ast.node_mut(id).scope_parent = Some(scope);
                self.walk_exprs(self.ast.child(id, 1), id)?;
                continue;
            }
            for slot in 0..matc_ast::MAX_CHILDREN {
                self.walk_exprs(self.ast.child(id, slot), scope)?;
            }
        }
        Ok(())
    }

    fn register(&mut self, func: NodeId, scope: NodeId) -> Result<(), ResolveError> {
        let name = node_name(self.ast, self.tokens, self.src, func).to_string();
        let line = self.ast.node(func).line;
        if let Some((_, _, first_line)) = self
            .seen
            .iter()
            .find(|(s, n, _)| *s == scope && *n == name)
        {
            return Err(ResolveError {
                message: format!(
                    "duplicate function name `{name}` (first defined on line {first_line}, redefined on line {line})"
                ),
                span: self.ast.node(func).span,
            });
        }
        self.seen.push((scope, name, line));
        Ok(())
    }
}
