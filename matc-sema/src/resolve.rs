#![forbid(unsafe_code)]

use matc_ast::{Ast, NodeId, NodeKind, MAX_CHILDREN};
use matc_lex::Token;

use crate::error::ResolveError;
use crate::node_name;

/// Functions the external runtime provides; a free name invoked as a call
/// resolves here before it becomes an error.
pub const BUILTINS: &[&str] = &["disp", "size", "eye", "zeros", "ones", "numel", "length"];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

struct Frame {
    node: NodeId,
    is_script_root: bool,
    /// Function definitions directly inside this scope, pre-registered so
    /// forward references bind.
    functions: Vec<NodeId>,
    /// Variable declarations in first-use order; mirrored into the scope
    /// node's symbol chain for the emitter.
    symbols: Vec<NodeId>,
    symbol_tail: Option<NodeId>,
}

pub struct Resolver<'a> {
    ast: &'a mut Ast,
    tokens: &'a [Token],
    src: &'a str,
    frames: Vec<Frame>,
    root_functions: Vec<NodeId>,
}

impl<'a> Resolver<'a> {
    pub fn new(ast: &'a mut Ast, tokens: &'a [Token], src: &'a str) -> Self {
        Self {
            ast,
            tokens,
            src,
            frames: Vec::new(),
            root_functions: Vec::new(),
        }
    }

    pub fn run(mut self, root: NodeId) -> Result<(), ResolveError> {
        self.root_functions = self
            .ast
            .list(self.ast.child(root, 0))
            .filter(|id| self.ast.kind(*id) == NodeKind::Function)
            .collect();

        self.push_scope(root)?;
        self.walk_block(self.ast.child(root, 0))?;
        self.pop_scope();

        self.classify_calls()?;
        Ok(())
    }

    fn name(&self, id: NodeId) -> &'a str {
        node_name(self.ast, self.tokens, self.src, id)
    }

    // ---- scope stack ----

    fn push_scope(&mut self, node: NodeId) -> Result<(), ResolveError> {
        let kind = self.ast.kind(node);
        let is_script_root = kind == NodeKind::Root;

        let body = match kind {
            NodeKind::Root => self.ast.child(node, 0),
            NodeKind::Function => self.ast.child(node, 2),
            NodeKind::Lambda => None,
            _ => unreachable!("not a scope node"),
        };
        let functions = self
            .ast
            .list(body)
            .filter(|id| self.ast.kind(*id) == NodeKind::Function)
            .collect();

        if kind == NodeKind::Function {
            self.validate_params(node)?;
        }
        if kind == NodeKind::Lambda {
            self.validate_lambda_params(node)?;
        }

        self.frames.push(Frame {
            node,
            is_script_root,
            functions,
            symbols: Vec::new(),
            symbol_tail: None,
        });
        Ok(())
    }

    fn pop_scope(&mut self) {
        self.frames.pop();
    }

    fn validate_params(&mut self, func: NodeId) -> Result<(), ResolveError> {
        let inputs: Vec<NodeId> = self.ast.list(self.ast.child(func, 1)).collect();
        let outputs: Vec<NodeId> = self.ast.list(self.ast.child(func, 0)).collect();

        let mut seen: Vec<&str> = Vec::new();
        for &p in &inputs {
            let name = self.name(p);
            if name == "varargin" || name == "varargout" {
                return Err(ResolveError {
                    message: "variadic parameters are not supported".to_string(),
                    span: self.ast.node(p).span,
                });
            }
            if seen.contains(&name) {
                return Err(ResolveError {
                    message: format!("duplicate input parameter `{name}`"),
                    span: self.ast.node(p).span,
                });
            }
            seen.push(name);
        }

        let mut seen_out: Vec<&str> = Vec::new();
        for &p in &outputs {
            let name = self.name(p);
            if name == "varargout" || name == "varargin" {
                return Err(ResolveError {
                    message: "variadic parameters are not supported".to_string(),
                    span: self.ast.node(p).span,
                });
            }
            if seen_out.contains(&name) {
                return Err(ResolveError {
                    message: format!("duplicate output parameter `{name}`"),
                    span: self.ast.node(p).span,
                });
            }
            seen_out.push(name);
            // An output spelled like an input is the same slot: assigning
            // the output overwrites the input.
            if let Some(&input) = inputs.iter().find(|&&i| self.name(i) == name) {
                self.ast.node_mut(p).target = Some(input);
            }
        }
        Ok(())
    }

    fn validate_lambda_params(&mut self, lambda: NodeId) -> Result<(), ResolveError> {
        let params: Vec<NodeId> = self.ast.list(self.ast.child(lambda, 0)).collect();
        let mut seen: Vec<&str> = Vec::new();
        for &p in &params {
            let name = self.name(p);
            if seen.contains(&name) {
                return Err(ResolveError {
                    message: format!("duplicate parameter `{name}`"),
                    span: self.ast.node(p).span,
                });
            }
            seen.push(name);
        }
        Ok(())
    }

    // ---- binding search ----

    /// Innermost-out search: input parameters, output parameters, then the
    /// scope's declared symbols. Parameter lists are skipped at a script
    /// root.
    fn lookup(&self, name: &str) -> Option<(NodeId, NodeKind)> {
        for frame in self.frames.iter().rev() {
            if !frame.is_script_root {
                let scope = frame.node;
                let (inputs, outputs) = match self.ast.kind(scope) {
                    NodeKind::Function => (self.ast.child(scope, 1), self.ast.child(scope, 0)),
                    NodeKind::Lambda => (self.ast.child(scope, 0), None),
                    _ => (None, None),
                };
                for p in self.ast.list(inputs) {
                    if self.name(p) == name {
                        return Some((p, NodeKind::VarRef));
                    }
                }
                for p in self.ast.list(outputs) {
                    if self.name(p) == name {
                        // A shared input/output slot binds to the input.
                        let target = self.ast.node(p).target.unwrap_or(p);
                        return Some((target, NodeKind::VarRef));
                    }
                }
            }
            for &s in &frame.symbols {
                if self.name(s) == name {
                    return Some((s, NodeKind::VarRef));
                }
            }
            for &f in &frame.functions {
                if self.name(f) == name {
                    return Some((f, NodeKind::FuncRef));
                }
            }
        }
        // Base-workspace fallback: functions at the file root.
        for &f in &self.root_functions {
            if self.name(f) == name {
                return Some((f, NodeKind::FuncRef));
            }
        }
        None
    }

    fn resolve_read(&mut self, id: NodeId) {
        debug_assert_eq!(self.ast.kind(id), NodeKind::Ident);
        let name = self.name(id);
        match self.lookup(name) {
            Some((target, kind)) => {
                let node = self.ast.node_mut(id);
                node.kind = kind;
                node.target = Some(target);
            }
            None => {
                self.ast.node_mut(id).kind = NodeKind::FreeName;
            }
        }
    }

    /// Bind a written identifier, declaring it in the innermost scope on
    /// first use.
    fn resolve_write(&mut self, id: NodeId) {
        debug_assert_eq!(self.ast.kind(id), NodeKind::Ident);
        let name = self.name(id);
        if let Some((target, kind)) = self.lookup(name) {
            if kind == NodeKind::VarRef {
                let node = self.ast.node_mut(id);
                node.kind = NodeKind::VarRef;
                node.target = Some(target);
                return;
            }
            // Writing a name that resolved to a function shadows it with a
            // fresh variable in this scope.
        }

        let node = self.ast.node_mut(id);
        node.kind = NodeKind::VarRef;
        node.target = Some(id);

        let frame = self.frames.last_mut().expect("scope stack is empty");
        frame.symbols.push(id);
        match frame.symbol_tail {
            None => {
                let scope = frame.node;
                frame.symbol_tail = Some(id);
                self.ast.node_mut(scope).first_symbol = Some(id);
            }
            Some(prev) => {
                frame.symbol_tail = Some(id);
                self.ast.node_mut(prev).symbol_link = Some(id);
            }
        }
    }

    // ---- traversal ----

    fn walk_block(&mut self, head: Option<NodeId>) -> Result<(), ResolveError> {
        let stmts: Vec<NodeId> = self.ast.list(head).collect();
        for stmt in stmts {
            self.walk_stmt(stmt)?;
        }
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: NodeId) -> Result<(), ResolveError> {
        match self.ast.kind(stmt) {
            NodeKind::Function => {
                self.push_scope(stmt)?;
                self.walk_block(self.ast.child(stmt, 2))?;
                self.pop_scope();
            }
            NodeKind::Assign => {
                // Right-hand side first, so `x = x + 1` reads the old
                // binding before the write declares anything.
                self.walk_expr(self.ast.child(stmt, 1).expect("assignment value"))?;
                self.walk_assign_target(self.ast.child(stmt, 0).expect("assignment target"))?;
            }
            NodeKind::MultiAssign => {
                self.walk_expr(self.ast.child(stmt, 1).expect("multi-assignment call"))?;
                let outputs: Vec<NodeId> = self.ast.list(self.ast.child(stmt, 0)).collect();
                for out in outputs {
                    if self.ast.kind(out) == NodeKind::Ident {
                        self.resolve_write(out);
                    }
                }
            }
            NodeKind::ExprStmt | NodeKind::CallStmt => {
                self.walk_expr(self.ast.child(stmt, 0).expect("statement expression"))?;
            }
            NodeKind::If | NodeKind::ElseIf => {
                self.walk_expr(self.ast.child(stmt, 0).expect("condition"))?;
                self.walk_block(self.ast.child(stmt, 1))?;
                if let Some(arm) = self.ast.child(stmt, 2) {
                    self.walk_stmt(arm)?;
                }
            }
            NodeKind::Else | NodeKind::Otherwise | NodeKind::Spmd => {
                self.walk_block(self.ast.child(stmt, 0))?;
            }
            NodeKind::While => {
                self.walk_expr(self.ast.child(stmt, 0).expect("condition"))?;
                self.walk_block(self.ast.child(stmt, 1))?;
            }
            NodeKind::For | NodeKind::Parfor => {
                self.walk_expr(self.ast.child(stmt, 1).expect("loop range"))?;
                self.resolve_write(self.ast.child(stmt, 0).expect("loop iterator"));
                self.walk_block(self.ast.child(stmt, 2))?;
            }
            NodeKind::Switch => {
                self.walk_expr(self.ast.child(stmt, 0).expect("switch subject"))?;
                let arms: Vec<NodeId> = self.ast.list(self.ast.child(stmt, 1)).collect();
                for arm in arms {
                    self.walk_stmt(arm)?;
                }
            }
            NodeKind::Case => {
                self.walk_expr(self.ast.child(stmt, 0).expect("case value"))?;
                self.walk_block(self.ast.child(stmt, 1))?;
            }
            NodeKind::TryCatch => {
                self.walk_block(self.ast.child(stmt, 0))?;
                if let Some(ident) = self.ast.child(stmt, 1) {
                    self.resolve_write(ident);
                }
                self.walk_block(self.ast.child(stmt, 2))?;
            }
            NodeKind::Global => {
                return Err(ResolveError {
                    message: "global variables are not supported".to_string(),
                    span: self.ast.node(stmt).span,
                });
            }
            NodeKind::Persistent => {
                return Err(ResolveError {
                    message: "persistent variables are not supported".to_string(),
                    span: self.ast.node(stmt).span,
                });
            }
            NodeKind::OsCall | NodeKind::Break | NodeKind::Continue | NodeKind::Return => {}
            _ => {}
        }
        Ok(())
    }

    /// An assignment target: the base identifier is the written name; any
    /// subscripts are ordinary reads.
    fn walk_assign_target(&mut self, target: NodeId) -> Result<(), ResolveError> {
        match self.ast.kind(target) {
            NodeKind::Ident => {
                self.resolve_write(target);
                Ok(())
            }
            NodeKind::Call | NodeKind::CellAccess => {
                let args: Vec<NodeId> = self.ast.list(self.ast.child(target, 1)).collect();
                for arg in args {
                    self.walk_expr(arg)?;
                }
                self.walk_assign_target(self.ast.child(target, 0).expect("receiver"))
            }
            NodeKind::Member => self.walk_assign_target(self.ast.child(target, 0).expect("base")),
            _ => Ok(()),
        }
    }

    fn walk_expr(&mut self, id: NodeId) -> Result<(), ResolveError> {
        match self.ast.kind(id) {
            NodeKind::Ident => {
                self.resolve_read(id);
                Ok(())
            }
            NodeKind::Lambda => {
                self.push_scope(id)?;
                self.walk_expr(self.ast.child(id, 1).expect("lambda body"))?;
                self.pop_scope();
                Ok(())
            }
            NodeKind::FuncHandle => {
                let name = self.name(id);
                match self.lookup(name) {
                    Some((target, NodeKind::FuncRef)) => {
                        self.ast.node_mut(id).target = Some(target);
                        Ok(())
                    }
                    // A handle to a runtime builtin carries no target.
                    _ if is_builtin(name) => Ok(()),
                    _ => Err(ResolveError {
                        message: format!("`@{name}` does not name a function"),
                        span: self.ast.node(id).span,
                    }),
                }
            }
            _ => {
                for slot in 0..MAX_CHILDREN {
                    let mut next = self.ast.child(id, slot);
                    while let Some(child) = next {
                        self.walk_expr(child)?;
                        next = self.ast.node(child).list_link;
                    }
                }
                Ok(())
            }
        }
    }

    // ---- call classification ----

    /// Every generic call is a semantic question the parser deferred: a
    /// function-reference callee makes it a function call, anything else a
    /// matrix access.
    fn classify_calls(&mut self) -> Result<(), ResolveError> {
        let ids: Vec<NodeId> = self.ast.ids().collect();
        for id in ids {
            if self.ast.kind(id) != NodeKind::Call {
                continue;
            }
            let callee = self.ast.child(id, 0).expect("call callee");
            match self.ast.kind(callee) {
                NodeKind::FuncRef => {
                    self.ast.node_mut(id).kind = NodeKind::FnCall;
                    self.check_no_end_sentinel(id, callee)?;
                }
                NodeKind::FreeName => {
                    let name = self.name(callee);
                    if is_builtin(name) {
                        self.ast.node_mut(callee).kind = NodeKind::BuiltinRef;
                        self.ast.node_mut(id).kind = NodeKind::FnCall;
                        self.check_no_end_sentinel(id, callee)?;
                    } else {
                        return Err(ResolveError {
                            message: format!("unknown function `{name}`"),
                            span: self.ast.node(callee).span,
                        });
                    }
                }
                _ => {
                    self.ast.node_mut(id).kind = NodeKind::MatrixAccess;
                }
            }
        }

        // A function call spelled as an expression statement is a call
        // statement; a matrix access under a multi-assignment is an error.
        for id in self.ast.ids().collect::<Vec<_>>() {
            match self.ast.kind(id) {
                NodeKind::ExprStmt => {
                    let expr = self.ast.child(id, 0).expect("statement expression");
                    if self.ast.kind(expr) == NodeKind::FnCall {
                        self.ast.node_mut(id).kind = NodeKind::CallStmt;
                    }
                }
                NodeKind::MultiAssign => {
                    let rhs = self.ast.child(id, 1).expect("multi-assignment call");
                    if self.ast.kind(rhs) != NodeKind::FnCall {
                        return Err(ResolveError {
                            message: "a multi-assignment requires a function call".to_string(),
                            span: self.ast.node(rhs).span,
                        });
                    }
                    let callee = self.ast.child(rhs, 0).expect("callee");
                    if self.ast.kind(callee) == NodeKind::FuncRef {
                        let func = self.ast.node(callee).target.expect("function target");
                        let produced = self.ast.list_len(self.ast.child(func, 0));
                        let requested = self.ast.list_len(self.ast.child(id, 0));
                        if requested > produced {
                            return Err(ResolveError {
                                message: format!(
                                    "`{}` returns {} value(s) but {} are requested",
                                    self.name(callee),
                                    produced,
                                    requested
                                ),
                                span: self.ast.node(id).span,
                            });
                        }
                    }
                }
                NodeKind::Assign => {
                    // An expression statement rewritten onto the implicit
                    // `ans` reverts to a call statement when the call
                    // produces nothing to assign.
                    let lhs = self.ast.child(id, 0).expect("assignment target");
                    let rhs = self.ast.child(id, 1).expect("assignment value");
                    if self.ast.node(lhs).token.is_none()
                        && self.ast.kind(rhs) == NodeKind::FnCall
                        && self.call_is_void(rhs)
                    {
                        let node = self.ast.node_mut(id);
                        node.kind = NodeKind::CallStmt;
                        node.child[0] = Some(rhs);
                        node.child[1] = None;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn call_is_void(&self, call: NodeId) -> bool {
        let callee = self.ast.child(call, 0).expect("callee");
        match self.ast.kind(callee) {
            NodeKind::FuncRef => {
                let func = self.ast.node(callee).target.expect("function target");
                self.ast.child(func, 0).is_none()
            }
            NodeKind::BuiltinRef => self.name(callee) == "disp",
            _ => false,
        }
    }

    /// `end` in an argument list is only meaningful when indexing a value;
    /// a function callee makes it a conflict between the two uses.
    fn check_no_end_sentinel(&self, call: NodeId, callee: NodeId) -> Result<(), ResolveError> {
        let args: Vec<NodeId> = self.ast.list(self.ast.child(call, 1)).collect();
        for arg in args {
            if let Some(end) = self.find_end_sentinel(arg) {
                let name = self.name(callee);
                return Err(ResolveError {
                    message: format!(
                        "`{name}` is indexed with `end` here but is used as a function"
                    ),
                    span: self.ast.node(end).span,
                });
            }
        }
        Ok(())
    }

    /// Find an `end` sentinel belonging to this subscript level; nested
    /// calls and accesses own their sentinels.
    fn find_end_sentinel(&self, id: NodeId) -> Option<NodeId> {
        match self.ast.kind(id) {
            NodeKind::EndIndex => Some(id),
            NodeKind::Call | NodeKind::FnCall | NodeKind::MatrixAccess | NodeKind::CellAccess => {
                None
            }
            _ => {
                for slot in 0..MAX_CHILDREN {
                    if let Some(child) = self.ast.child(id, slot) {
                        if let Some(found) = self.find_end_sentinel(child) {
                            return Some(found);
                        }
                    }
                }
                None
            }
        }
    }
}
