#![forbid(unsafe_code)]

use matc_ast::{Ast, DataType, NodeId, NodeKind};
use matc_lex::{ScanSummary, Token};
use matc_sema::node_name;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("C++ backend error: {message}")]
#[diagnostic(code(matc::backend_cpp))]
pub struct CppBackendError {
    pub message: String,
}

/// The three output texts of one translation: the standalone program, the
/// embeddable entry point, and the help sidecar when a doc comment was
/// captured.
pub struct CppArtifacts {
    pub program: String,
    pub embed: String,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EmitOptions<'a> {
    pub embed_base: &'a str,
    pub write_to_workspace: bool,
}

/// Emission predicates computed once on the analyzed tree; they select the
/// include set and feed the translation report.
#[derive(Clone, Copy, Debug, Default)]
pub struct Predicates {
    pub has_dynamic: bool,
    pub has_matrices: bool,
    pub prints: bool,
    pub uses_system: bool,
    pub has_multi_output: bool,
    pub has_nested_functions: bool,
    pub has_ignored_outputs: bool,
    pub uses_strings: bool,
    pub uses_power: bool,
    pub uses_builtins: bool,
}

pub fn compute_predicates(ast: &Ast, root: NodeId, has_ignored_outputs: bool) -> Predicates {
    let mut p = Predicates {
        has_ignored_outputs,
        ..Predicates::default()
    };
    for id in ast.ids() {
        let node = ast.node(id);
        match node.data_type {
            DataType::Dynamic => p.has_dynamic = true,
            DataType::Str => p.uses_strings = true,
            DataType::Char => {
                if node.cols != Some(1) {
                    p.uses_strings = true;
                }
            }
            _ => {}
        }
        if node.rows.map_or(false, |r| r != 1) || node.cols.map_or(false, |c| c != 1) {
            p.has_matrices = true;
        }
        match node.kind {
            NodeKind::Matrix
            | NodeKind::EmptyMatrix
            | NodeKind::CellLit
            | NodeKind::EmptyCell
            | NodeKind::MatrixAccess
            | NodeKind::Range => p.has_matrices = true,
            NodeKind::OsCall => p.uses_system = true,
            NodeKind::MultiAssign => p.has_multi_output = true,
            NodeKind::Lambda => p.has_nested_functions = true,
            NodeKind::Function => {
                if node.scope_parent.is_some() && node.scope_parent != Some(root) {
                    p.has_nested_functions = true;
                }
                if ast.list_len(node.child[0]) > 1 {
                    p.has_multi_output = true;
                }
            }
            NodeKind::Pow | NodeKind::ElemPow => p.uses_power = true,
            NodeKind::BuiltinRef => p.uses_builtins = true,
            _ => {}
        }
        if node.verbose && matc_sema::is_statement(node.kind) {
            match node.kind {
                NodeKind::Assign | NodeKind::MultiAssign | NodeKind::ExprStmt
                | NodeKind::CallStmt => p.prints = true,
                _ => {}
            }
        }
    }
    p
}

impl Predicates {
    fn uses_runtime(&self) -> bool {
        self.has_dynamic
            || self.has_matrices
            || self.has_ignored_outputs
            || self.uses_builtins
            || self.prints
    }
}

pub fn emit_program(
    src: &str,
    tokens: &[Token],
    summary: &ScanSummary,
    ast: &Ast,
    root: NodeId,
    has_ignored_outputs: bool,
    opts: &EmitOptions<'_>,
) -> Result<CppArtifacts, CppBackendError> {
    let preds = compute_predicates(ast, root, has_ignored_outputs);

    let mut standalone = Emitter::new(src, tokens, summary, ast, root, preds);
    let program = standalone.emit(Target::Standalone, opts)?;

    let mut embeddable = Emitter::new(src, tokens, summary, ast, root, preds);
    let embed = embeddable.emit(Target::Embed, opts)?;

    let help = summary.doc_comment.map(|span| {
        let start = span.offset();
        src[start..start + span.len()].to_string()
    });

    Ok(CppArtifacts {
        program,
        embed,
        help,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    Standalone,
    Embed,
}

struct Emitter<'a> {
    src: &'a str,
    tokens: &'a [Token],
    summary: &'a ScanSummary,
    ast: &'a Ast,
    root: NodeId,
    preds: Predicates,
    out: String,
    indent: usize,
    /// Function whose body is being emitted; `None` in the script body.
    current_fn: Option<NodeId>,
}

impl<'a> Emitter<'a> {
    fn new(
        src: &'a str,
        tokens: &'a [Token],
        summary: &'a ScanSummary,
        ast: &'a Ast,
        root: NodeId,
        preds: Predicates,
    ) -> Self {
        Self {
            src,
            tokens,
            summary,
            ast,
            root,
            preds,
            out: String::new(),
            indent: 0,
            current_fn: None,
        }
    }

    fn name(&self, id: NodeId) -> String {
        cpp_ident(node_name(self.ast, self.tokens, self.src, id))
    }

    fn emit(&mut self, target: Target, opts: &EmitOptions<'_>) -> Result<String, CppBackendError> {
        self.header_comment();
        self.includes();

        let functions: Vec<NodeId> = self
            .ast
            .list(self.ast.child(self.root, 0))
            .filter(|id| self.ast.kind(*id) == NodeKind::Function)
            .collect();
        let is_function_file = self
            .ast
            .list(self.ast.child(self.root, 0))
            .next()
            .map_or(false, |first| self.ast.kind(first) == NodeKind::Function);

        // Forward declarations; past the leading function everything gets
        // internal linkage in a function file.
        if !functions.is_empty() {
            let (leading, rest) = functions.split_first().expect("nonempty");
            if is_function_file {
                self.line(&format!("{};", self.signature(*leading)));
                if !rest.is_empty() {
                    self.line("");
                    self.line("namespace {");
                    for &f in rest {
                        self.line(&format!("{};", self.signature(f)));
                    }
                    self.line("}");
                }
            } else {
                for &f in &functions {
                    self.line(&format!("{};", self.signature(f)));
                }
            }
            self.line("");
        }

        // Definitions.
        if is_function_file {
            if let Some((&leading, rest)) = functions.split_first() {
                self.emit_function(leading)?;
                if !rest.is_empty() {
                    self.line("namespace {");
                    self.line("");
                    for &f in rest {
                        self.emit_function(f)?;
                    }
                    self.line("}");
                    self.line("");
                }
            }
        } else {
            for &f in &functions {
                self.emit_function(f)?;
            }
        }

        match target {
            Target::Standalone => self.emit_main(is_function_file, &functions)?,
            Target::Embed => self.emit_entry(is_function_file, &functions, opts)?,
        }

        Ok(std::mem::take(&mut self.out))
    }

    fn header_comment(&mut self) {
        if let Some(span) = self.summary.doc_comment {
            let start = span.offset();
            let text = &self.src[start..start + span.len()];
            for line in text.lines() {
                let body = line.trim_start().trim_start_matches('%').trim_start();
                self.out.push_str("// ");
                self.out.push_str(body);
                self.out.push('\n');
            }
            self.out.push('\n');
        }
    }

    fn includes(&mut self) {
        if self.preds.prints {
            self.line("#include <iostream>");
        }
        if self.preds.uses_strings {
            self.line("#include <string>");
        }
        if self.preds.has_multi_output {
            self.line("#include <tuple>");
        }
        if self.preds.has_nested_functions {
            self.line("#include <functional>");
        }
        if self.preds.uses_power {
            self.line("#include <cmath>");
        }
        if self.preds.uses_system {
            self.line("#include <cstdlib>");
        }
        if self.preds.uses_runtime() {
            self.line("#include \"matc_runtime.h\"");
        }
        self.line("");
    }

    // ---- functions ----

    fn output_nodes(&self, func: NodeId) -> Vec<NodeId> {
        self.ast.list(self.ast.child(func, 0)).collect()
    }

    fn input_nodes(&self, func: NodeId) -> Vec<NodeId> {
        self.ast.list(self.ast.child(func, 1)).collect()
    }

    fn return_type(&self, func: NodeId) -> String {
        let outputs = self.output_nodes(func);
        match outputs.len() {
            0 => "void".to_string(),
            1 => self.cpp_type(outputs[0]),
            _ => {
                let parts: Vec<String> = outputs.iter().map(|&o| self.cpp_type(o)).collect();
                format!("std::tuple<{}>", parts.join(", "))
            }
        }
    }

    fn signature(&self, func: NodeId) -> String {
        let mut sig = format!("{} {}(", self.return_type(func), self.name(func));
        let inputs = self.input_nodes(func);
        for (i, &p) in inputs.iter().enumerate() {
            if i > 0 {
                sig.push_str(", ");
            }
            sig.push_str(&self.param_decl(p));
        }
        sig.push(')');
        sig
    }

    fn param_decl(&self, param: NodeId) -> String {
        let ty = self.cpp_type(param);
        let name = self.name(param);
        if is_by_value(&ty) {
            format!("{ty} {name}")
        } else {
            format!("const {ty}& {name}")
        }
    }

    fn emit_function(&mut self, func: NodeId) -> Result<(), CppBackendError> {
        let sig = self.signature(func);
        self.line(&format!("{sig} {{"));
        self.indent += 1;

        let saved = self.current_fn.replace(func);
        self.emit_scope_body(func, self.ast.child(func, 2))?;
        self.emit_return_outputs(func);
        self.current_fn = saved;

        self.indent -= 1;
        self.line("}");
        self.line("");
        Ok(())
    }

    /// Locals first, then nested functions as by-reference closures, then
    /// the statements in order.
    fn emit_scope_body(
        &mut self,
        scope: NodeId,
        body: Option<NodeId>,
    ) -> Result<(), CppBackendError> {
        self.emit_local_decls(scope);

        // File-level functions were already emitted as definitions; only a
        // function scope turns its inner definitions into closures.
        if scope != self.root {
            let nested: Vec<NodeId> = self
                .ast
                .list(body)
                .filter(|id| self.ast.kind(*id) == NodeKind::Function)
                .collect();
            for &f in &nested {
                self.emit_nested_function(f)?;
            }
        }

        let stmts: Vec<NodeId> = self.ast.list(body).collect();
        for stmt in stmts {
            if self.ast.kind(stmt) != NodeKind::Function {
                self.emit_stmt(stmt)?;
            }
        }
        Ok(())
    }

    fn emit_local_decls(&mut self, scope: NodeId) {
        // Output parameters come first, then body locals in first-use
        // order.
        if self.ast.kind(scope) == NodeKind::Function {
            let outputs = self.output_nodes(scope);
            let inputs = self.input_nodes(scope);
            for out in outputs {
                // An output sharing its input's slot is already in scope.
                if let Some(target) = self.ast.node(out).target {
                    if inputs.contains(&target) {
                        continue;
                    }
                }
                let decl = self.var_decl(out);
                self.line(&decl);
            }
        }

        let mut symbol = self.ast.node(scope).first_symbol;
        while let Some(id) = symbol {
            let decl = self.var_decl(id);
            self.line(&decl);
            symbol = self.ast.node(id).symbol_link;
        }
    }

    fn var_decl(&self, id: NodeId) -> String {
        let ty = self.cpp_type(id);
        format!("{} {}{{}};", ty, self.name(id))
    }

    fn emit_nested_function(&mut self, func: NodeId) -> Result<(), CppBackendError> {
        let ret = self.return_type(func);
        let inputs = self.input_nodes(func);
        let param_list: Vec<String> = inputs.iter().map(|&p| self.param_decl(p)).collect();
        let type_list: Vec<String> = inputs.iter().map(|&p| self.cpp_type(p)).collect();

        self.line(&format!(
            "std::function<{}({})> {} = [&]({}) -> {} {{",
            ret,
            type_list.join(", "),
            self.name(func),
            param_list.join(", "),
            ret
        ));
        self.indent += 1;

        let saved = self.current_fn.replace(func);
        self.emit_scope_body(func, self.ast.child(func, 2))?;
        self.emit_return_outputs(func);
        self.current_fn = saved;

        self.indent -= 1;
        self.line("};");
        Ok(())
    }

    fn emit_return_outputs(&mut self, func: NodeId) {
        // Skip the epilogue return when the body already ends on one.
        let last = self.ast.list(self.ast.child(func, 2)).last();
        if last.map_or(false, |id| self.ast.kind(id) == NodeKind::Return) {
            return;
        }
        let stmt = self.return_stmt(func);
        self.line(&stmt);
    }

    fn return_stmt(&self, func: NodeId) -> String {
        let outputs = self.output_nodes(func);
        match outputs.len() {
            0 => "return;".to_string(),
            1 => format!("return {};", self.output_value(outputs[0])),
            _ => {
                let parts: Vec<String> =
                    outputs.iter().map(|&o| self.output_value(o)).collect();
                format!("return std::make_tuple({});", parts.join(", "))
            }
        }
    }

    fn output_value(&self, out: NodeId) -> String {
        match self.ast.node(out).target {
            Some(target) if target != out => self.name(target),
            _ => self.name(out),
        }
    }

    // ---- program entries ----

    fn emit_main(
        &mut self,
        is_function_file: bool,
        functions: &[NodeId],
    ) -> Result<(), CppBackendError> {
        self.line("int main() {");
        self.indent += 1;
        if is_function_file {
            if let Some(&leading) = functions.first() {
                if self.input_nodes(leading).is_empty() {
                    self.line(&format!("{}();", self.name(leading)));
                } else {
                    self.line("// The leading function takes inputs; nothing to invoke here.");
                }
            }
        } else {
            self.emit_scope_body(self.root, self.ast.child(self.root, 0))?;
        }
        self.line("return 0;");
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    /// Fixed-signature wrapper for linkage into the host interpreter:
    /// unpack inputs, run, package outputs.
    fn emit_entry(
        &mut self,
        is_function_file: bool,
        functions: &[NodeId],
        opts: &EmitOptions<'_>,
    ) -> Result<(), CppBackendError> {
        let base = cpp_ident(opts.embed_base);
        self.line(&format!(
            "extern \"C\" int {base}_entry(int nargout, DynamicType* plhs[], int nargin, const DynamicType* prhs[]) {{"
        ));
        self.indent += 1;

        if is_function_file {
            let Some(&leading) = functions.first() else {
                return Err(CppBackendError {
                    message: "function file has no leading function".to_string(),
                });
            };
            let inputs = self.input_nodes(leading);
            let outputs = self.output_nodes(leading);

            for (i, &p) in inputs.iter().enumerate() {
                let ty = self.cpp_type(p);
                self.line(&format!(
                    "{} {} = rt::arg<{}>(prhs, nargin, {});",
                    ty,
                    self.name(p),
                    ty,
                    i
                ));
            }
            let args: Vec<String> = inputs.iter().map(|&p| self.name(p)).collect();
            let call = format!("{}({})", self.name(leading), args.join(", "));
            match outputs.len() {
                0 => self.line(&format!("{call};")),
                1 => {
                    self.line(&format!("auto result_ = {call};"));
                    self.line("rt::ret(plhs, nargout, 0, result_);");
                }
                n => {
                    self.line(&format!("auto results_ = {call};"));
                    for i in 0..n {
                        self.line(&format!(
                            "rt::ret(plhs, nargout, {i}, std::get<{i}>(results_));"
                        ));
                    }
                }
            }
        } else {
            self.emit_scope_body(self.root, self.ast.child(self.root, 0))?;
            if opts.write_to_workspace {
                // Re-export updated base-scope variables into the host.
                let mut symbol = self.ast.node(self.root).first_symbol;
                while let Some(id) = symbol {
                    let name = self.name(id);
                    self.line(&format!("rt::workspace_set(\"{name}\", {name});"));
                    symbol = self.ast.node(id).symbol_link;
                }
            }
        }

        self.line("return 0;");
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    // ---- statements ----

    fn emit_stmt(&mut self, id: NodeId) -> Result<(), CppBackendError> {
        match self.ast.kind(id) {
            NodeKind::Assign => {
                let lhs = self.ast.child(id, 0).expect("assignment target");
                let rhs = self.ast.child(id, 1).expect("assignment value");
                let target = self.lvalue(lhs)?;
                let value = self.expr(rhs)?;
                self.line(&format!("{target} = {value};"));
                if self.ast.node(id).verbose {
                    self.echo_node(lhs);
                }
            }
            NodeKind::MultiAssign => self.emit_multi_assign(id)?,
            NodeKind::CallStmt => {
                let call = self.ast.child(id, 0).expect("call");
                let text = self.expr(call)?;
                self.line(&format!("{text};"));
            }
            NodeKind::ExprStmt => {
                let expr = self.ast.child(id, 0).expect("expression");
                let text = self.expr(expr)?;
                if self.ast.node(id).verbose {
                    self.line(&format!("rt::echo(\"ans\", {text});"));
                } else {
                    self.line(&format!("(void)({text});"));
                }
            }
            NodeKind::If => self.emit_if(id)?,
            NodeKind::While => {
                let cond = self.ast.child(id, 0).expect("condition");
                let text = self.condition(cond)?;
                self.line(&format!("while ({text}) {{"));
                self.indent += 1;
                self.emit_block(self.ast.child(id, 1))?;
                self.indent -= 1;
                self.line("}");
            }
            NodeKind::For => self.emit_for(id, false)?,
            NodeKind::Parfor => self.emit_for(id, true)?,
            NodeKind::Switch => self.emit_switch(id)?,
            NodeKind::TryCatch => self.emit_try(id)?,
            NodeKind::Spmd => {
                self.line("#pragma omp parallel");
                self.line("{");
                self.indent += 1;
                self.emit_block(self.ast.child(id, 0))?;
                self.indent -= 1;
                self.line("}");
            }
            NodeKind::OsCall => {
                let token = self.ast.node(id).token.expect("command payload");
                let text = self.tokens[token.0 as usize].text(self.src);
                let cmd = text.strip_prefix('!').unwrap_or(text);
                self.line(&format!("std::system(\"{}\");", escape_cpp(cmd)));
            }
            NodeKind::Break => self.line("break;"),
            NodeKind::Continue => self.line("continue;"),
            NodeKind::Return => {
                let stmt = match self.current_fn {
                    Some(func) => self.return_stmt(func),
                    None => "return 0;".to_string(),
                };
                self.line(&stmt);
            }
            NodeKind::Function => {}
            other => {
                return Err(CppBackendError {
                    message: format!("statement kind {other:?} reached the emitter"),
                })
            }
        }
        Ok(())
    }

    fn emit_block(&mut self, head: Option<NodeId>) -> Result<(), CppBackendError> {
        let stmts: Vec<NodeId> = self.ast.list(head).collect();
        for stmt in stmts {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_if(&mut self, mut id: NodeId) -> Result<(), CppBackendError> {
        let cond = self.ast.child(id, 0).expect("condition");
        let text = self.condition(cond)?;
        self.line(&format!("if ({text}) {{"));
        self.indent += 1;
        self.emit_block(self.ast.child(id, 1))?;
        self.indent -= 1;

        while let Some(arm) = self.ast.child(id, 2) {
            match self.ast.kind(arm) {
                NodeKind::ElseIf => {
                    let cond = self.ast.child(arm, 0).expect("condition");
                    let text = self.condition(cond)?;
                    self.line(&format!("}} else if ({text}) {{"));
                    self.indent += 1;
                    self.emit_block(self.ast.child(arm, 1))?;
                    self.indent -= 1;
                    id = arm;
                }
                NodeKind::Else => {
                    self.line("} else {");
                    self.indent += 1;
                    self.emit_block(self.ast.child(arm, 0))?;
                    self.indent -= 1;
                    break;
                }
                _ => break,
            }
        }
        self.line("}");
        Ok(())
    }

    fn emit_for(&mut self, id: NodeId, parallel: bool) -> Result<(), CppBackendError> {
        let iter = self.ast.child(id, 0).expect("iterator");
        let range = self.ast.child(id, 1).expect("range");
        let name = self.name(iter);

        if self.ast.kind(range) == NodeKind::Range {
            let start = self.expr(self.ast.child(range, 0).expect("start"))?;
            let stop = self.expr(self.ast.child(range, 1).expect("stop"))?;
            let step = match self.ast.child(range, 2) {
                Some(s) => self.expr(s)?,
                None => "1".to_string(),
            };
            if parallel {
                self.line("#pragma omp parallel for");
                // The iterator is re-declared so each thread owns it.
                let ty = self.cpp_type(iter);
                self.line(&format!(
                    "for ({ty} {name} = {start}; {name} <= {stop}; {name} += {step}) {{"
                ));
            } else {
                self.line(&format!(
                    "for ({name} = {start}; {name} <= {stop}; {name} += {step}) {{"
                ));
            }
        } else {
            // Iterate the columns of a matrix value.
            let value = self.expr(range)?;
            self.line(&format!(
                "for (int iter_ = 1; iter_ <= rt::numcols({value}); ++iter_) {{"
            ));
            self.indent += 1;
            self.line(&format!("{name} = rt::col({value}, iter_);"));
            self.indent -= 1;
        }
        self.indent += 1;
        self.emit_block(self.ast.child(id, 2))?;
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn emit_switch(&mut self, id: NodeId) -> Result<(), CppBackendError> {
        let subject = self.ast.child(id, 0).expect("switch subject");
        let text = self.expr(subject)?;
        self.line("{");
        self.indent += 1;
        self.line(&format!("const auto& switch_ = {text};"));

        let arms: Vec<NodeId> = self.ast.list(self.ast.child(id, 1)).collect();
        let mut first = true;
        for arm in arms {
            match self.ast.kind(arm) {
                NodeKind::Case => {
                    let value = self.ast.child(arm, 0).expect("case value");
                    let value_text = self.expr(value)?;
                    let keyword = if first { "if" } else { "} else if" };
                    self.line(&format!("{keyword} (switch_ == {value_text}) {{"));
                    first = false;
                    self.indent += 1;
                    self.emit_block(self.ast.child(arm, 1))?;
                    self.indent -= 1;
                }
                NodeKind::Otherwise => {
                    if first {
                        self.line("{");
                    } else {
                        self.line("} else {");
                    }
                    first = false;
                    self.indent += 1;
                    self.emit_block(self.ast.child(arm, 0))?;
                    self.indent -= 1;
                }
                _ => {}
            }
        }
        if !first {
            self.line("}");
        }
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn emit_try(&mut self, id: NodeId) -> Result<(), CppBackendError> {
        self.line("try {");
        self.indent += 1;
        self.emit_block(self.ast.child(id, 0))?;
        self.indent -= 1;
        self.line("} catch (const std::exception& exception_) {");
        self.indent += 1;
        if let Some(ident) = self.ast.child(id, 1) {
            self.line(&format!(
                "{} = rt::exception_value(exception_);",
                self.name(ident)
            ));
        } else {
            self.line("(void)exception_;");
        }
        self.emit_block(self.ast.child(id, 2))?;
        self.indent -= 1;
        self.line("}");
        Ok(())
    }

    fn emit_multi_assign(&mut self, id: NodeId) -> Result<(), CppBackendError> {
        let call = self.ast.child(id, 1).expect("call");
        let callee = self.ast.child(call, 0).expect("callee");
        let targets: Vec<NodeId> = self.ast.list(self.ast.child(id, 0)).collect();

        // A multi-output builtin call routes to the arity-suffixed runtime
        // helper, which returns the matching tuple.
        let call_text = if self.ast.kind(callee) == NodeKind::BuiltinRef && targets.len() > 1 {
            let args = self.arg_list(call)?;
            format!("rt::{}{}({})", self.name(callee), targets.len(), args)
        } else {
            self.expr(call)?
        };

        // Output arity of the callee decides the tie arity; missing
        // trailing targets also land in the sink.
        let produced = match self.ast.kind(callee) {
            NodeKind::FuncRef => {
                let func = self.ast.node(callee).target.expect("function target");
                self.ast.list_len(self.ast.child(func, 0))
            }
            NodeKind::BuiltinRef => targets.len(),
            _ => targets.len(),
        };

        if produced <= 1 && targets.len() == 1 {
            let target = self.lvalue(targets[0])?;
            self.line(&format!("{target} = {call_text};"));
        } else {
            let mut slots: Vec<String> = Vec::with_capacity(produced);
            for i in 0..produced {
                match targets.get(i) {
                    Some(&t) if self.ast.kind(t) != NodeKind::IgnoredOutput => {
                        slots.push(self.name(t));
                    }
                    _ => slots.push("rt::sink()".to_string()),
                }
            }
            self.line(&format!("std::tie({}) = {call_text};", slots.join(", ")));
        }

        if self.ast.node(id).verbose {
            // One echo per named target, in order.
            for &t in &targets {
                if self.ast.kind(t) != NodeKind::IgnoredOutput {
                    self.echo_node(t);
                }
            }
        }
        Ok(())
    }

    fn echo_node(&mut self, target: NodeId) {
        let base = self.echo_base(target);
        let name = self.name(base);
        self.line(&format!("rt::echo(\"{name}\", {name});"));
    }

    /// The echoed variable behind an assignment target (the receiver of an
    /// indexed or member write).
    fn echo_base(&self, target: NodeId) -> NodeId {
        match self.ast.kind(target) {
            NodeKind::MatrixAccess | NodeKind::CellAccess | NodeKind::Member => {
                self.echo_base(self.ast.child(target, 0).expect("receiver"))
            }
            _ => target,
        }
    }

    // ---- expressions ----

    fn lvalue(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        self.expr(id)
    }

    fn condition(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let text = self.expr(id)?;
        if self.is_scalar(id) && self.ast.data_type(id) != DataType::Dynamic {
            Ok(text)
        } else {
            Ok(format!("rt::truthy({text})"))
        }
    }

    fn is_scalar(&self, id: NodeId) -> bool {
        self.ast.rows(id) == Some(1) && self.ast.cols(id) == Some(1)
    }

    fn scalar_operands(&self, l: NodeId, r: NodeId) -> bool {
        self.is_scalar(l) && self.is_scalar(r)
    }

    fn expr(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let kind = self.ast.kind(id);
        match kind {
            NodeKind::Scalar => {
                let token = self.ast.node(id).token.expect("literal token");
                Ok(self.tokens[token.0 as usize].text(self.src).to_string())
            }
            NodeKind::Str => Ok(self.string_literal(id, '"')),
            NodeKind::CharArray => Ok(self.char_literal(id)),
            NodeKind::VarRef | NodeKind::Ident | NodeKind::FreeName => Ok(self.name(id)),
            NodeKind::FuncRef => Ok(self.name(id)),
            NodeKind::BuiltinRef => Ok(format!("rt::{}", self.name(id))),
            NodeKind::FuncHandle => {
                if self.ast.node(id).target.is_none() {
                    // Handle to a runtime builtin.
                    Ok(format!("rt::{}", self.name(id)))
                } else {
                    Ok(self.name(id))
                }
            }
            NodeKind::Group => {
                let inner = self.expr(self.ast.child(id, 0).expect("inner"))?;
                Ok(format!("({inner})"))
            }
            NodeKind::Neg => {
                let inner = self.expr(self.ast.child(id, 0).expect("operand"))?;
                Ok(format!("-({inner})"))
            }
            NodeKind::UnaryPlus => {
                let inner = self.expr(self.ast.child(id, 0).expect("operand"))?;
                Ok(format!("+({inner})"))
            }
            NodeKind::Not => {
                let child = self.ast.child(id, 0).expect("operand");
                let inner = self.expr(child)?;
                if self.is_scalar(child) {
                    Ok(format!("!({inner})"))
                } else {
                    Ok(format!("rt::elem_not({inner})"))
                }
            }
            NodeKind::Transpose | NodeKind::CTranspose => {
                let child = self.ast.child(id, 0).expect("operand");
                let inner = self.expr(child)?;
                if self.is_scalar(child) {
                    Ok(format!("({inner})"))
                } else if kind == NodeKind::Transpose {
                    Ok(format!("rt::transpose({inner})"))
                } else {
                    Ok(format!("rt::ctranspose({inner})"))
                }
            }
            NodeKind::Add
            | NodeKind::Sub
            | NodeKind::Mul
            | NodeKind::Div
            | NodeKind::Eq
            | NodeKind::Ne
            | NodeKind::Lt
            | NodeKind::Le
            | NodeKind::Gt
            | NodeKind::Ge
            | NodeKind::ShortAnd
            | NodeKind::ShortOr
            | NodeKind::And
            | NodeKind::Or => self.emit_binary_op(id, kind),
            NodeKind::ElemMul | NodeKind::ElemDiv | NodeKind::ElemBackDiv
            | NodeKind::ElemPow | NodeKind::BackDiv | NodeKind::Pow => {
                self.emit_runtime_binary(id, kind)
            }
            NodeKind::Range => {
                let start = self.expr(self.ast.child(id, 0).expect("start"))?;
                let stop = self.expr(self.ast.child(id, 1).expect("stop"))?;
                match self.ast.child(id, 2) {
                    Some(s) => {
                        let step = self.expr(s)?;
                        Ok(format!("rt::range({start}, {step}, {stop})"))
                    }
                    None => Ok(format!("rt::range({start}, {stop})")),
                }
            }
            NodeKind::Matrix => self.emit_matrix(id),
            NodeKind::EmptyMatrix => Ok("Matrix<double>{}".to_string()),
            NodeKind::CellLit => self.emit_cell(id),
            NodeKind::EmptyCell => Ok("Cell{}".to_string()),
            NodeKind::MatrixAccess | NodeKind::FnCall | NodeKind::Call => self.emit_call(id),
            NodeKind::CellAccess => {
                let receiver = self.expr(self.ast.child(id, 0).expect("receiver"))?;
                let args = self.arg_list(id)?;
                Ok(format!("rt::cell_get({receiver}, {args})"))
            }
            NodeKind::Member => {
                let base = self.expr(self.ast.child(id, 0).expect("base"))?;
                Ok(format!("{}.field(\"{}\")", base, self.name(id)))
            }
            NodeKind::Lambda => self.emit_lambda(id),
            NodeKind::Colon => Ok("rt::all()".to_string()),
            NodeKind::EndIndex => Ok("rt::end()".to_string()),
            NodeKind::Metaclass => Ok(format!("rt::metaclass(\"{}\")", self.name(id))),
            other => Err(CppBackendError {
                message: format!("expression kind {other:?} reached the emitter"),
            }),
        }
    }

    fn emit_binary_op(&mut self, id: NodeId, kind: NodeKind) -> Result<String, CppBackendError> {
        let l = self.ast.child(id, 0).expect("left operand");
        let r = self.ast.child(id, 1).expect("right operand");
        let lt = self.cast_operand(id, l)?;
        let rt = self.cast_operand(id, r)?;
        let op = match kind {
            NodeKind::Add => "+",
            NodeKind::Sub => "-",
            NodeKind::Mul => "*",
            NodeKind::Div => "/",
            NodeKind::Eq => "==",
            NodeKind::Ne => "!=",
            NodeKind::Lt => "<",
            NodeKind::Le => "<=",
            NodeKind::Gt => ">",
            NodeKind::Ge => ">=",
            NodeKind::ShortAnd => "&&",
            NodeKind::ShortOr => "||",
            NodeKind::And => "&&",
            NodeKind::Or => "||",
            _ => unreachable!(),
        };
        // Elementwise logical on matrices routes through the runtime.
        if matches!(kind, NodeKind::And | NodeKind::Or)
            && !self.scalar_operands(l, r)
        {
            let f = if kind == NodeKind::And {
                "rt::elem_and"
            } else {
                "rt::elem_or"
            };
            return Ok(format!("{f}({lt}, {rt})"));
        }
        Ok(format!("{lt} {op} {rt}"))
    }

    fn emit_runtime_binary(
        &mut self,
        id: NodeId,
        kind: NodeKind,
    ) -> Result<String, CppBackendError> {
        let l = self.ast.child(id, 0).expect("left operand");
        let r = self.ast.child(id, 1).expect("right operand");
        let lt = self.cast_operand(id, l)?;
        let rt = self.cast_operand(id, r)?;
        let scalars = self.scalar_operands(l, r);
        Ok(match kind {
            NodeKind::ElemMul if scalars => format!("{lt} * {rt}"),
            NodeKind::ElemMul => format!("rt::elem_mul({lt}, {rt})"),
            NodeKind::ElemDiv if scalars => format!("{lt} / {rt}"),
            NodeKind::ElemDiv => format!("rt::elem_div({lt}, {rt})"),
            NodeKind::ElemBackDiv if scalars => format!("{rt} / {lt}"),
            NodeKind::ElemBackDiv => format!("rt::elem_div({rt}, {lt})"),
            NodeKind::BackDiv if scalars => format!("{rt} / {lt}"),
            NodeKind::BackDiv => format!("rt::mldivide({lt}, {rt})"),
            NodeKind::Pow if scalars => format!("std::pow({lt}, {rt})"),
            NodeKind::Pow => format!("rt::mpower({lt}, {rt})"),
            NodeKind::ElemPow if scalars => format!("std::pow({lt}, {rt})"),
            NodeKind::ElemPow => format!("rt::elem_pow({lt}, {rt})"),
            _ => unreachable!(),
        })
    }

    /// Operand text with the coercion annotation applied; implicit casts
    /// ride on the target language's conversions.
    fn cast_operand(&mut self, parent: NodeId, child: NodeId) -> Result<String, CppBackendError> {
        let text = self.expr(child)?;
        let wrapped = if needs_parens(self.ast.kind(child)) {
            format!("({text})")
        } else {
            text
        };
        let parent_node = self.ast.node(parent);
        if parent_node.cast_type == DataType::Unknown || parent_node.implicit_cast {
            return Ok(wrapped);
        }
        let child_type = self.ast.data_type(child);
        if child_type == parent_node.cast_type {
            return Ok(wrapped);
        }
        Ok(match (child_type, parent_node.cast_type) {
            (DataType::Char, DataType::Str) => format!("rt::to_str({wrapped})"),
            (_, DataType::Str) => format!("rt::to_str({wrapped})"),
            (_, DataType::Dynamic) => format!("DynamicType({wrapped})"),
            _ => wrapped,
        })
    }

    fn emit_call(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let callee = self.ast.child(id, 0).expect("callee");
        let receiver = self.expr(callee)?;
        let args = self.arg_list(id)?;
        Ok(format!("{receiver}({args})"))
    }

    fn arg_list(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let args: Vec<NodeId> = self.ast.list(self.ast.child(id, 1)).collect();
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(self.expr(arg)?);
        }
        Ok(parts.join(", "))
    }

    fn emit_lambda(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let params: Vec<NodeId> = self.ast.list(self.ast.child(id, 0)).collect();
        let body = self.ast.child(id, 1).expect("lambda body");
        let param_list: Vec<String> = params
            .iter()
            .map(|&p| format!("{} {}", self.cpp_type(p), self.name(p)))
            .collect();
        let body_text = self.expr(body)?;
        Ok(format!(
            "[&]({}) {{ return {}; }}",
            param_list.join(", "),
            body_text
        ))
    }

    /// A bracket literal with all-scalar leaves emits as a braced
    /// initializer; anything else builds through the runtime's
    /// concatenation helpers.
    fn emit_matrix(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let spine = self.ast.child(id, 0).expect("matrix spine");
        let elem = element_cpp_type(self.ast.data_type(id));
        if self.spine_all_scalar(spine) {
            let mut rows = Vec::new();
            self.collect_rows(spine, &mut rows);
            let mut parts = Vec::new();
            for row in rows {
                let mut cells = Vec::new();
                for elem_id in row {
                    cells.push(self.expr(elem_id)?);
                }
                parts.push(format!("{{{}}}", cells.join(", ")));
            }
            Ok(format!("Matrix<{}>{{{}}}", elem, parts.join(", ")))
        } else {
            self.emit_concat(spine)
        }
    }

    fn emit_concat(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        match self.ast.kind(id) {
            NodeKind::VertCat => {
                let l = self.emit_concat(self.ast.child(id, 0).expect("left"))?;
                let r = self.emit_concat(self.ast.child(id, 1).expect("right"))?;
                Ok(format!("rt::vertcat({l}, {r})"))
            }
            NodeKind::HorzCat => {
                let l = self.emit_concat(self.ast.child(id, 0).expect("left"))?;
                let r = self.emit_concat(self.ast.child(id, 1).expect("right"))?;
                Ok(format!("rt::horzcat({l}, {r})"))
            }
            _ => self.expr(id),
        }
    }

    fn spine_all_scalar(&self, id: NodeId) -> bool {
        match self.ast.kind(id) {
            NodeKind::VertCat | NodeKind::HorzCat => {
                self.spine_all_scalar(self.ast.child(id, 0).expect("left"))
                    && self.spine_all_scalar(self.ast.child(id, 1).expect("right"))
            }
            _ => self.is_scalar(id),
        }
    }

    fn collect_rows(&self, id: NodeId, rows: &mut Vec<Vec<NodeId>>) {
        if self.ast.kind(id) == NodeKind::VertCat {
            self.collect_rows(self.ast.child(id, 0).expect("left"), rows);
            self.collect_rows(self.ast.child(id, 1).expect("right"), rows);
        } else {
            let mut row = Vec::new();
            self.collect_cols(id, &mut row);
            rows.push(row);
        }
    }

    fn collect_cols(&self, id: NodeId, row: &mut Vec<NodeId>) {
        if self.ast.kind(id) == NodeKind::HorzCat {
            self.collect_cols(self.ast.child(id, 0).expect("left"), row);
            self.collect_cols(self.ast.child(id, 1).expect("right"), row);
        } else {
            row.push(id);
        }
    }

    fn emit_cell(&mut self, id: NodeId) -> Result<String, CppBackendError> {
        let spine = self.ast.child(id, 0).expect("cell spine");
        let mut rows = Vec::new();
        self.collect_cell_rows(spine, &mut rows);
        let nrows = rows.len();
        let ncols = rows.first().map_or(0, Vec::len);
        let mut parts = Vec::new();
        for row in rows {
            for elem in row {
                let text = self.expr(elem)?;
                parts.push(format!("DynamicType({text})"));
            }
        }
        Ok(format!(
            "rt::cell({nrows}, {ncols}, {{{}}})",
            parts.join(", ")
        ))
    }

    fn collect_cell_rows(&self, id: NodeId, rows: &mut Vec<Vec<NodeId>>) {
        if self.ast.kind(id) == NodeKind::VertCat && self.ast.data_type(id) == DataType::Cell {
            self.collect_cell_rows(self.ast.child(id, 0).expect("left"), rows);
            self.collect_cell_rows(self.ast.child(id, 1).expect("right"), rows);
        } else {
            let mut row = Vec::new();
            self.collect_cell_cols(id, &mut row);
            rows.push(row);
        }
    }

    fn collect_cell_cols(&self, id: NodeId, row: &mut Vec<NodeId>) {
        if self.ast.kind(id) == NodeKind::HorzCat && self.ast.data_type(id) == DataType::Cell {
            self.collect_cell_cols(self.ast.child(id, 0).expect("left"), row);
            self.collect_cell_cols(self.ast.child(id, 1).expect("right"), row);
        } else {
            row.push(id);
        }
    }

    // ---- literals ----

    fn string_literal(&self, id: NodeId, quote: char) -> String {
        let token = self.ast.node(id).token.expect("literal token");
        let text = self.tokens[token.0 as usize].text(self.src);
        let inner = &text[1..text.len() - 1];
        let doubled = format!("{quote}{quote}");
        let unescaped = inner.replace(&doubled, &quote.to_string());
        format!("std::string(\"{}\")", escape_cpp(&unescaped))
    }

    fn char_literal(&self, id: NodeId) -> String {
        let token = self.ast.node(id).token.expect("literal token");
        let text = self.tokens[token.0 as usize].text(self.src);
        let inner = &text[1..text.len() - 1];
        let unescaped = inner.replace("''", "'");
        if unescaped.chars().count() == 1 {
            let c = unescaped.chars().next().expect("one char");
            match c {
                '\'' => "'\\''".to_string(),
                '\\' => "'\\\\'".to_string(),
                _ => format!("'{c}'"),
            }
        } else {
            format!("std::string(\"{}\")", escape_cpp(&unescaped))
        }
    }

    // ---- types ----

    fn cpp_type(&self, id: NodeId) -> String {
        let node = self.ast.node(id);
        let scalar = node.rows == Some(1) && node.cols == Some(1);
        match node.data_type {
            DataType::Dynamic | DataType::Unknown | DataType::Na => "DynamicType".to_string(),
            DataType::Cell => "Cell".to_string(),
            DataType::Str => "std::string".to_string(),
            DataType::Func => self.function_type(id),
            DataType::Char if scalar => "char".to_string(),
            DataType::Char => "std::string".to_string(),
            DataType::Bool if scalar => "bool".to_string(),
            DataType::Bool => "Matrix<bool>".to_string(),
            DataType::Int if scalar => "int".to_string(),
            DataType::Int => "Matrix<int>".to_string(),
            DataType::Real if scalar => "double".to_string(),
            DataType::Real => "Matrix<double>".to_string(),
        }
    }

    /// Closure type for a variable holding a function value, with the
    /// arity discovered from the handle or lambda assigned to it.
    fn function_type(&self, id: NodeId) -> String {
        for other in self.ast.ids() {
            if self.ast.kind(other) != NodeKind::Assign {
                continue;
            }
            let Some(lhs) = self.ast.child(other, 0) else {
                continue;
            };
            if self.ast.kind(lhs) != NodeKind::VarRef || self.ast.node(lhs).target != Some(id) {
                continue;
            }
            let Some(rhs) = self.ast.child(other, 1) else {
                continue;
            };
            match self.ast.kind(rhs) {
                NodeKind::Lambda => {
                    let arity = self.ast.list_len(self.ast.child(rhs, 0));
                    let params = vec!["DynamicType"; arity].join(", ");
                    return format!("std::function<DynamicType({params})>");
                }
                NodeKind::FuncHandle => {
                    if let Some(func) = self.ast.node(rhs).target {
                        let ret = self.return_type(func);
                        let types: Vec<String> = self
                            .input_nodes(func)
                            .iter()
                            .map(|&p| self.cpp_type(p))
                            .collect();
                        return format!("std::function<{}({})>", ret, types.join(", "));
                    }
                }
                _ => {}
            }
        }
        "DynamicType".to_string()
    }

    // ---- output plumbing ----

    fn line(&mut self, text: &str) {
        if text.is_empty() {
            self.out.push('\n');
            return;
        }
        if !text.starts_with('#') {
            for _ in 0..self.indent {
                self.out.push_str("    ");
            }
        }
        self.out.push_str(text);
        self.out.push('\n');
    }
}

fn element_cpp_type(t: DataType) -> &'static str {
    match t {
        DataType::Bool => "bool",
        DataType::Char => "char",
        DataType::Int => "int",
        DataType::Real => "double",
        _ => "double",
    }
}

fn is_by_value(ty: &str) -> bool {
    matches!(ty, "bool" | "char" | "int" | "double")
}

fn needs_parens(kind: NodeKind) -> bool {
    !matches!(
        kind,
        NodeKind::Scalar
            | NodeKind::Str
            | NodeKind::CharArray
            | NodeKind::VarRef
            | NodeKind::Ident
            | NodeKind::FreeName
            | NodeKind::FuncRef
            | NodeKind::BuiltinRef
            | NodeKind::Group
            | NodeKind::Matrix
            | NodeKind::CellLit
            | NodeKind::EmptyMatrix
            | NodeKind::EmptyCell
            | NodeKind::MatrixAccess
            | NodeKind::CellAccess
            | NodeKind::FnCall
            | NodeKind::Call
            | NodeKind::Member
    )
}

fn cpp_ident(name: &str) -> String {
    const RESERVED: &[&str] = &[
        "auto", "bool", "break", "case", "catch", "char", "class", "const", "continue",
        "default", "delete", "do", "double", "else", "enum", "extern", "false", "float",
        "for", "friend", "goto", "if", "inline", "int", "long", "namespace", "new",
        "operator", "private", "protected", "public", "return", "short", "signed",
        "sizeof", "static", "struct", "switch", "template", "this", "throw", "true",
        "try", "typedef", "union", "unsigned", "using", "virtual", "void", "while",
    ];
    if RESERVED.contains(&name) {
        format!("{name}_")
    } else {
        name.to_string()
    }
}

fn escape_cpp(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
