#![forbid(unsafe_code)]

use matc_ast::{span_between, Ast, DataType, NodeId, NodeKind, Span, TokenId};
use matc_lex::{DelimiterStyle, ScanSummary, Token, TokenKind};

use crate::error::ParseError;

/// Parser result: the node arena, its root, and the file-global flags the
/// later stages need.
#[derive(Debug)]
pub struct ParseOutput {
    pub ast: Ast,
    pub root: NodeId,
    pub has_ignored_outputs: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Plain,
    Parallel,
}

pub struct Parser<'a> {
    src: &'a str,
    tokens: &'a [Token],
    summary: &'a ScanSummary,
    idx: usize,
    ast: Ast,
    /// While > 0 an `end` token in a primary expression is the last-index
    /// sentinel rather than a block close.
    call_level: u32,
    loops: Vec<LoopKind>,
    function_depth: u32,
    has_ignored_outputs: bool,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, tokens: &'a [Token], summary: &'a ScanSummary) -> Self {
        Self {
            src,
            tokens,
            summary,
            idx: 0,
            ast: Ast::new(),
            call_level: 0,
            loops: Vec::new(),
            function_depth: 0,
            has_ignored_outputs: false,
        }
    }

    pub fn parse_program(mut self) -> Result<ParseOutput, ParseError> {
        let root = self.ast.add(NodeKind::Root, 1, span_between(0, 0));

        let mut head = None;
        let mut tail = None;
        loop {
            self.skip_separators();
            if self.at(TokenKind::Eof) {
                break;
            }
            let stmt = self.parse_stmt()?;
            self.link(&mut head, &mut tail, stmt);
        }
        self.ast.set_child(root, 0, head);

        debug_assert_eq!(self.call_level, 0);
        Ok(ParseOutput {
            ast: self.ast,
            root,
            has_ignored_outputs: self.has_ignored_outputs,
        })
    }

    // ---- statements ----

    fn parse_stmt(&mut self) -> Result<NodeId, ParseError> {
        match self.peek_kind() {
            TokenKind::KwFunction => self.parse_function(),
            TokenKind::KwIf => self.parse_if(),
            TokenKind::KwWhile => self.parse_while(),
            TokenKind::KwFor => self.parse_for(LoopKind::Plain),
            TokenKind::KwParfor => self.parse_for(LoopKind::Parallel),
            TokenKind::KwSwitch => self.parse_switch(),
            TokenKind::KwTry => self.parse_try(),
            TokenKind::KwSpmd => self.parse_spmd(),
            TokenKind::KwGlobal => self.parse_declaration(NodeKind::Global),
            TokenKind::KwPersistent => {
                if self.function_depth == 0 {
                    let t = self.peek();
                    return Err(ParseError {
                        message: "persistent declaration outside a function".to_string(),
                        span: t.span,
                    });
                }
                self.parse_declaration(NodeKind::Persistent)
            }
            TokenKind::KwBreak => {
                let t = self.next();
                match self.loops.last() {
                    None => {
                        return Err(ParseError {
                            message: "break outside a loop".to_string(),
                            span: t.span,
                        })
                    }
                    Some(LoopKind::Parallel) => {
                        return Err(ParseError {
                            message: "break is not allowed in a parallel for-loop".to_string(),
                            span: t.span,
                        })
                    }
                    Some(LoopKind::Plain) => {}
                }
                let id = self.ast.add(NodeKind::Break, t.line, t.span);
                self.finish_stmt(id)?;
                Ok(id)
            }
            TokenKind::KwContinue => {
                let t = self.next();
                if self.loops.is_empty() {
                    return Err(ParseError {
                        message: "continue outside a loop".to_string(),
                        span: t.span,
                    });
                }
                let id = self.ast.add(NodeKind::Continue, t.line, t.span);
                self.finish_stmt(id)?;
                Ok(id)
            }
            TokenKind::KwReturn => {
                let t = self.next();
                if self.loops.contains(&LoopKind::Parallel) {
                    return Err(ParseError {
                        message: "return is not allowed in a parallel for-loop".to_string(),
                        span: t.span,
                    });
                }
                let id = self.ast.add(NodeKind::Return, t.line, t.span);
                self.finish_stmt(id)?;
                Ok(id)
            }
            TokenKind::KwClassdef => {
                let t = self.peek();
                Err(ParseError {
                    message: "class definitions are not supported".to_string(),
                    span: t.span,
                })
            }
            TokenKind::OsCall => {
                let t = self.next();
                let id = self.ast.add(NodeKind::OsCall, t.line, t.span);
                self.ast.node_mut(id).token = Some(self.prev_id());
                self.finish_stmt(id)?;
                Ok(id)
            }
            TokenKind::KwEnd
            | TokenKind::KwElse
            | TokenKind::KwElseIf
            | TokenKind::KwCase
            | TokenKind::KwOtherwise
            | TokenKind::KwCatch => {
                let t = self.peek();
                Err(ParseError {
                    message: format!("unexpected `{}`", t.text(self.src)),
                    span: t.span,
                })
            }
            _ => self.parse_expr_or_assign(),
        }
    }

    fn parse_expr_or_assign(&mut self) -> Result<NodeId, ParseError> {
        let start = self.peek();
        let lhs = self.parse_expr()?;

        if self.at(TokenKind::Eq) {
            self.next();
            if self.ast.kind(lhs) == NodeKind::Matrix || self.ast.kind(lhs) == NodeKind::EmptyMatrix
            {
                return self.finish_multi_assign(lhs, start.line);
            }
            match self.ast.kind(lhs) {
                NodeKind::Ident | NodeKind::Call | NodeKind::CellAccess | NodeKind::Member => {}
                _ => {
                    return Err(ParseError {
                        message: "invalid assignment target".to_string(),
                        span: self.ast.node(lhs).span,
                    })
                }
            }
            let rhs = self.parse_expr()?;
            let id = self.ast.add(NodeKind::Assign, start.line, start.span);
            self.ast.set_child(id, 0, Some(lhs));
            self.ast.set_child(id, 1, Some(rhs));
            self.finish_stmt(id)?;
            return Ok(id);
        }

        // Expression statement; the result lands in the implicit `ans`
        // whenever the source mentions that name anywhere.
        let id = if self.summary.saw_ans {
            let target = self
                .ast
                .add(NodeKind::Ident, start.line, self.ast.node(lhs).span);
            let id = self.ast.add(NodeKind::Assign, start.line, start.span);
            self.ast.set_child(id, 0, Some(target));
            self.ast.set_child(id, 1, Some(lhs));
            id
        } else {
            let id = self.ast.add(NodeKind::ExprStmt, start.line, start.span);
            self.ast.set_child(id, 0, Some(lhs));
            id
        };
        self.finish_stmt(id)?;
        Ok(id)
    }

    /// The left-hand side of a multi-output call parses as a bracketed
    /// horizontal concatenation; rewrite its spine into an output list.
    fn finish_multi_assign(&mut self, lhs: NodeId, line: u32) -> Result<NodeId, ParseError> {
        let span = self.ast.node(lhs).span;
        if self.ast.kind(lhs) == NodeKind::EmptyMatrix {
            return Err(ParseError {
                message: "a multi-assignment needs at least one output".to_string(),
                span,
            });
        }

        let mut outputs = Vec::new();
        self.collect_horzcat(self.ast.child(lhs, 0).unwrap(), &mut outputs)?;
        for &out in &outputs {
            match self.ast.kind(out) {
                NodeKind::Ident => {}
                NodeKind::IgnoredOutput => self.has_ignored_outputs = true,
                _ => {
                    return Err(ParseError {
                        message: "multi-assignment outputs must be identifiers or `~`"
                            .to_string(),
                        span: self.ast.node(out).span,
                    })
                }
            }
        }
        let mut head = None;
        let mut tail = None;
        for out in outputs {
            self.ast.node_mut(out).list_link = None;
            self.link(&mut head, &mut tail, out);
        }

        let rhs = self.parse_expr()?;
        if self.ast.kind(rhs) != NodeKind::Call {
            return Err(ParseError {
                message: "the right-hand side of a multi-assignment must be a call".to_string(),
                span: self.ast.node(rhs).span,
            });
        }

        let id = self.ast.add(NodeKind::MultiAssign, line, span);
        self.ast.set_child(id, 0, head);
        self.ast.set_child(id, 1, Some(rhs));
        self.finish_stmt(id)?;
        Ok(id)
    }

    fn collect_horzcat(&self, id: NodeId, out: &mut Vec<NodeId>) -> Result<(), ParseError> {
        match self.ast.kind(id) {
            NodeKind::HorzCat => {
                self.collect_horzcat(self.ast.child(id, 0).unwrap(), out)?;
                self.collect_horzcat(self.ast.child(id, 1).unwrap(), out)?;
                Ok(())
            }
            NodeKind::VertCat => Err(ParseError {
                message: "multi-assignment outputs must form a single row".to_string(),
                span: self.ast.node(id).span,
            }),
            _ => {
                out.push(id);
                Ok(())
            }
        }
    }

    fn parse_function(&mut self) -> Result<NodeId, ParseError> {
        let kw = self.next();

        let mut outputs_head = None;
        let mut outputs_tail = None;

        // Signature forms: `function name`, `function name(in)`,
        // `function out = name(in)`, `function [o1, o2] = name(in)`.
        let name_tok;
        let name_id;
        if self.at(TokenKind::LBracket) {
            self.next();
            loop {
                if self.at(TokenKind::RBracket) {
                    break;
                }
                if self.at(TokenKind::Comma) {
                    self.next();
                    continue;
                }
                let id = self.expect_ident_node()?;
                self.link(&mut outputs_head, &mut outputs_tail, id);
            }
            self.expect(TokenKind::RBracket)?;
            self.expect(TokenKind::Eq)?;
            name_tok = self.expect(TokenKind::Ident)?;
            name_id = self.prev_id();
        } else {
            let first = self.expect(TokenKind::Ident)?;
            let first_id = self.prev_id();
            if self.at(TokenKind::Eq) {
                self.next();
                let id = self.leaf_at(NodeKind::Ident, first, first_id);
                self.link(&mut outputs_head, &mut outputs_tail, id);
                name_tok = self.expect(TokenKind::Ident)?;
                name_id = self.prev_id();
            } else {
                name_tok = first;
                name_id = first_id;
            }
        }

        let mut inputs_head = None;
        let mut inputs_tail = None;
        if self.at(TokenKind::LParen) {
            self.next();
            self.call_level += 1;
            loop {
                if self.at(TokenKind::RParen) {
                    break;
                }
                if self.at(TokenKind::Comma) {
                    self.next();
                    continue;
                }
                let id = self.expect_ident_node()?;
                self.link(&mut inputs_head, &mut inputs_tail, id);
            }
            self.expect(TokenKind::RParen)?;
            self.call_level -= 1;
        }
        self.terminate_line()?;

        self.function_depth += 1;
        let saved_loops = std::mem::take(&mut self.loops);
        let body = match self.summary.delimiter_style {
            DelimiterStyle::Terminated => {
                let body = self.parse_block(&[TokenKind::KwEnd])?;
                self.expect(TokenKind::KwEnd)?;
                self.terminate_line()?;
                body
            }
            DelimiterStyle::Open => self.parse_block(&[TokenKind::KwFunction, TokenKind::Eof])?,
        };
        self.loops = saved_loops;
        self.function_depth -= 1;

        let id = self
            .ast
            .add(NodeKind::Function, kw.line, join(kw.span, name_tok.span));
        self.ast.node_mut(id).token = Some(name_id);
        self.ast.set_child(id, 0, outputs_head);
        self.ast.set_child(id, 1, inputs_head);
        self.ast.set_child(id, 2, body);
        Ok(id)
    }

    fn parse_if(&mut self) -> Result<NodeId, ParseError> {
        let kw = self.next();
        let id = self.parse_cond_arm(NodeKind::If, kw)?;

        // Chain elseif/else arms off child 2.
        let mut link_at = id;
        loop {
            match self.peek_kind() {
                TokenKind::KwElseIf => {
                    let kw = self.next();
                    let arm = self.parse_cond_arm(NodeKind::ElseIf, kw)?;
                    self.ast.set_child(link_at, 2, Some(arm));
                    link_at = arm;
                }
                TokenKind::KwElse => {
                    let kw = self.next();
                    self.terminate_line()?;
                    let body = self.parse_block(&[TokenKind::KwEnd])?;
                    let arm = self.ast.add(NodeKind::Else, kw.line, kw.span);
                    self.ast.set_child(arm, 0, body);
                    self.ast.set_child(link_at, 2, Some(arm));
                    break;
                }
                _ => break,
            }
        }
        self.expect(TokenKind::KwEnd)?;
        self.terminate_line()?;
        Ok(id)
    }

    fn parse_cond_arm(&mut self, kind: NodeKind, kw: Token) -> Result<NodeId, ParseError> {
        let cond = self.parse_expr()?;
        self.terminate_line()?;
        let body = self.parse_block(&[
            TokenKind::KwEnd,
            TokenKind::KwElseIf,
            TokenKind::KwElse,
        ])?;
        let id = self.ast.add(kind, kw.line, kw.span);
        self.ast.set_child(id, 0, Some(cond));
        self.ast.set_child(id, 1, body);
        Ok(id)
    }

    fn parse_while(&mut self) -> Result<NodeId, ParseError> {
        let kw = self.next();
        let cond = self.parse_expr()?;
        self.terminate_line()?;
        self.loops.push(LoopKind::Plain);
        let body = self.parse_block(&[TokenKind::KwEnd])?;
        self.loops.pop();
        self.expect(TokenKind::KwEnd)?;
        self.terminate_line()?;
        let id = self.ast.add(NodeKind::While, kw.line, kw.span);
        self.ast.set_child(id, 0, Some(cond));
        self.ast.set_child(id, 1, body);
        Ok(id)
    }

    fn parse_for(&mut self, loop_kind: LoopKind) -> Result<NodeId, ParseError> {
        let kw = self.next();
        // A parenthesized header `for (i = r)` is accepted too.
        let parens = self.at(TokenKind::LParen);
        if parens {
            self.next();
            self.call_level += 1;
        }
        let iter = self.expect_ident_node()?;
        self.expect(TokenKind::Eq)?;
        let range = self.parse_expr()?;
        if parens {
            self.expect(TokenKind::RParen)?;
            self.call_level -= 1;
        }
        self.terminate_line()?;

        if loop_kind == LoopKind::Parallel {
            self.check_parfor_range(range)?;
        }

        self.loops.push(loop_kind);
        let body = self.parse_block(&[TokenKind::KwEnd])?;
        self.loops.pop();
        self.expect(TokenKind::KwEnd)?;
        self.terminate_line()?;

        let kind = match loop_kind {
            LoopKind::Plain => NodeKind::For,
            LoopKind::Parallel => NodeKind::Parfor,
        };
        let id = self.ast.add(kind, kw.line, kw.span);
        self.ast.set_child(id, 0, Some(iter));
        self.ast.set_child(id, 1, Some(range));
        self.ast.set_child(id, 2, body);
        Ok(id)
    }

    /// Stepped-range emission for a parallel loop is only defined for a
    /// unit step; anything else is rejected here.
    fn check_parfor_range(&self, range: NodeId) -> Result<(), ParseError> {
        let node = self.ast.node(range);
        if node.kind != NodeKind::Range {
            return Err(ParseError {
                message: "a parallel for-loop iterator must be a range".to_string(),
                span: node.span,
            });
        }
        if let Some(step) = node.child[2] {
            let step_node = self.ast.node(step);
            let unit = step_node.kind == NodeKind::Scalar
                && step_node
                    .token
                    .map(|t| self.token_text(t) == "1")
                    .unwrap_or(false);
            if !unit {
                return Err(ParseError {
                    message: "a parallel for-loop step must be 1".to_string(),
                    span: step_node.span,
                });
            }
        }
        Ok(())
    }

    fn parse_switch(&mut self) -> Result<NodeId, ParseError> {
        let kw = self.next();
        let subject = self.parse_expr()?;
        self.terminate_line()?;

        let mut head = None;
        let mut tail = None;
        loop {
            self.skip_separators();
            match self.peek_kind() {
                TokenKind::KwCase => {
                    let case_kw = self.next();
                    let value = self.parse_expr()?;
                    self.terminate_line()?;
                    let body = self.parse_block(&[
                        TokenKind::KwCase,
                        TokenKind::KwOtherwise,
                        TokenKind::KwEnd,
                    ])?;
                    let arm = self.ast.add(NodeKind::Case, case_kw.line, case_kw.span);
                    self.ast.set_child(arm, 0, Some(value));
                    self.ast.set_child(arm, 1, body);
                    self.link(&mut head, &mut tail, arm);
                }
                TokenKind::KwOtherwise => {
                    let kw2 = self.next();
                    self.terminate_line()?;
                    let body = self.parse_block(&[TokenKind::KwEnd])?;
                    let arm = self.ast.add(NodeKind::Otherwise, kw2.line, kw2.span);
                    self.ast.set_child(arm, 0, body);
                    self.link(&mut head, &mut tail, arm);
                }
                TokenKind::KwEnd => break,
                _ => {
                    let t = self.peek();
                    return Err(ParseError {
                        message: "expected `case`, `otherwise`, or `end`".to_string(),
                        span: t.span,
                    });
                }
            }
        }
        self.expect(TokenKind::KwEnd)?;
        self.terminate_line()?;

        let id = self.ast.add(NodeKind::Switch, kw.line, kw.span);
        self.ast.set_child(id, 0, Some(subject));
        self.ast.set_child(id, 1, head);
        Ok(id)
    }

    fn parse_try(&mut self) -> Result<NodeId, ParseError> {
        let kw = self.next();
        self.terminate_line()?;
        let body = self.parse_block(&[TokenKind::KwCatch, TokenKind::KwEnd])?;

        let mut catch_ident = None;
        let mut catch_body = None;
        if self.at(TokenKind::KwCatch) {
            self.next();
            if self.at(TokenKind::Ident) {
                let t = self.next();
                catch_ident = Some(self.ident_node(t));
            }
            self.terminate_line()?;
            catch_body = self.parse_block(&[TokenKind::KwEnd])?;
        }
        self.expect(TokenKind::KwEnd)?;
        self.terminate_line()?;

        let id = self.ast.add(NodeKind::TryCatch, kw.line, kw.span);
        self.ast.set_child(id, 0, body);
        self.ast.set_child(id, 1, catch_ident);
        self.ast.set_child(id, 2, catch_body);
        Ok(id)
    }

    fn parse_spmd(&mut self) -> Result<NodeId, ParseError> {
        let kw = self.next();
        self.terminate_line()?;
        let body = self.parse_block(&[TokenKind::KwEnd])?;
        self.expect(TokenKind::KwEnd)?;
        self.terminate_line()?;
        let id = self.ast.add(NodeKind::Spmd, kw.line, kw.span);
        self.ast.set_child(id, 0, body);
        Ok(id)
    }

    fn parse_declaration(&mut self, kind: NodeKind) -> Result<NodeId, ParseError> {
        let kw = self.next();
        let mut head = None;
        let mut tail = None;
        loop {
            if self.at(TokenKind::Ident) {
                let t = self.next();
                let id = self.ident_node(t);
                self.link(&mut head, &mut tail, id);
                if self.at(TokenKind::Comma) {
                    self.next();
                }
                continue;
            }
            break;
        }
        if head.is_none() {
            let t = self.peek();
            return Err(ParseError {
                message: "expected a variable name".to_string(),
                span: t.span,
            });
        }
        let id = self.ast.add(kind, kw.line, kw.span);
        self.ast.set_child(id, 0, head);
        self.finish_stmt(id)?;
        self.ast.node_mut(id).verbose = false;
        Ok(id)
    }

    fn parse_block(&mut self, stop: &[TokenKind]) -> Result<Option<NodeId>, ParseError> {
        let mut head = None;
        let mut tail = None;
        loop {
            self.skip_separators();
            let kind = self.peek_kind();
            if kind == TokenKind::Eof || stop.contains(&kind) {
                break;
            }
            let stmt = self.parse_stmt()?;
            self.link(&mut head, &mut tail, stmt);
        }
        Ok(head)
    }

    // ---- expressions, lowest precedence first ----

    pub fn parse_expr(&mut self) -> Result<NodeId, ParseError> {
        self.parse_short_or()
    }

    fn parse_short_or(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_short_and()?;
        while self.at(TokenKind::OrOr) {
            let t = self.next();
            let right = self.parse_short_and()?;
            left = self.binary(NodeKind::ShortOr, t, left, right);
        }
        Ok(left)
    }

    fn parse_short_and(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_or()?;
        while self.at(TokenKind::AndAnd) {
            let t = self.next();
            let right = self.parse_or()?;
            left = self.binary(NodeKind::ShortAnd, t, left, right);
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_and()?;
        while self.at(TokenKind::Pipe) {
            let t = self.next();
            let right = self.parse_and()?;
            left = self.binary(NodeKind::Or, t, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_cmp()?;
        while self.at(TokenKind::Amp) {
            let t = self.next();
            let right = self.parse_cmp()?;
            left = self.binary(NodeKind::And, t, left, right);
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_range()?;
        loop {
            let kind = match self.peek_kind() {
                TokenKind::EqEq => NodeKind::Eq,
                TokenKind::Neq => NodeKind::Ne,
                TokenKind::Lt => NodeKind::Lt,
                TokenKind::Le => NodeKind::Le,
                TokenKind::Gt => NodeKind::Gt,
                TokenKind::Ge => NodeKind::Ge,
                _ => break,
            };
            let t = self.next();
            let right = self.parse_range()?;
            left = self.binary(kind, t, left, right);
        }
        Ok(left)
    }

    /// The colon is left-associative: `a:b:c` re-forms into the stepped
    /// range (a, b, c), and a further colon wraps the whole range again, so
    /// `a:b:c:d` is `((a:b:c):d)`.
    fn parse_range(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_additive()?;
        while self.at(TokenKind::Colon) {
            let t = self.next();
            let right = self.parse_additive()?;
            let left_node = self.ast.node(left);
            if left_node.kind == NodeKind::Range && left_node.child[2].is_none() {
                let step = self.ast.child(left, 1);
                self.ast.set_child(left, 2, step);
                self.ast.set_child(left, 1, Some(right));
                let wide = join(self.ast.node(left).span, self.ast.node(right).span);
                self.ast.node_mut(left).span = wide;
            } else {
                let id = self.ast.add(NodeKind::Range, t.line, t.span);
                self.ast.set_child(id, 0, Some(left));
                self.ast.set_child(id, 1, Some(right));
                left = id;
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let kind = match self.peek_kind() {
                TokenKind::Add => NodeKind::Add,
                TokenKind::Sub => NodeKind::Sub,
                _ => break,
            };
            let t = self.next();
            let right = self.parse_multiplicative()?;
            left = self.binary(kind, t, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_left_unary()?;
        loop {
            let kind = match self.peek_kind() {
                TokenKind::Mul => NodeKind::Mul,
                TokenKind::ElemMul => NodeKind::ElemMul,
                TokenKind::Div => NodeKind::Div,
                TokenKind::ElemDiv => NodeKind::ElemDiv,
                TokenKind::BackDiv => NodeKind::BackDiv,
                TokenKind::ElemBackDiv => NodeKind::ElemBackDiv,
                _ => break,
            };
            let t = self.next();
            let right = self.parse_left_unary()?;
            left = self.binary(kind, t, left, right);
        }
        Ok(left)
    }

    fn parse_left_unary(&mut self) -> Result<NodeId, ParseError> {
        let kind = match self.peek_kind() {
            TokenKind::Tilde => NodeKind::Not,
            TokenKind::Sub => NodeKind::Neg,
            TokenKind::Add => NodeKind::UnaryPlus,
            _ => return self.parse_power(),
        };
        let t = self.next();
        let operand = self.parse_left_unary()?;
        let id = self.ast.add(kind, t.line, t.span);
        self.ast.set_child(id, 0, Some(operand));
        Ok(id)
    }

    fn parse_power(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.parse_postfix()?;
        loop {
            let kind = match self.peek_kind() {
                TokenKind::Pow => NodeKind::Pow,
                TokenKind::ElemPow => NodeKind::ElemPow,
                _ => break,
            };
            let t = self.next();
            let right = self.parse_power_rhs()?;
            left = self.binary(kind, t, left, right);
        }
        Ok(left)
    }

    // A sign is allowed directly after the power operator.
    fn parse_power_rhs(&mut self) -> Result<NodeId, ParseError> {
        let kind = match self.peek_kind() {
            TokenKind::Sub => NodeKind::Neg,
            TokenKind::Add => NodeKind::UnaryPlus,
            _ => return self.parse_postfix(),
        };
        let t = self.next();
        let operand = self.parse_power_rhs()?;
        let id = self.ast.add(kind, t.line, t.span);
        self.ast.set_child(id, 0, Some(operand));
        Ok(id)
    }

    fn parse_postfix(&mut self) -> Result<NodeId, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::CTranspose => {
                    let t = self.next();
                    let id = self.ast.add(NodeKind::CTranspose, t.line, t.span);
                    self.ast.set_child(id, 0, Some(expr));
                    expr = id;
                }
                TokenKind::Transpose => {
                    let t = self.next();
                    let id = self.ast.add(NodeKind::Transpose, t.line, t.span);
                    self.ast.set_child(id, 0, Some(expr));
                    expr = id;
                }
                TokenKind::LParen => {
                    let t = self.next();
                    let args = self.parse_args(TokenKind::RParen)?;
                    let close = self.expect(TokenKind::RParen)?;
                    let id =
                        self.ast
                            .add(NodeKind::Call, t.line, join(self.ast.node(expr).span, close.span));
                    self.ast.set_child(id, 0, Some(expr));
                    self.ast.set_child(id, 1, args);
                    expr = id;
                }
                TokenKind::LBrace => {
                    let t = self.next();
                    let args = self.parse_args(TokenKind::RBrace)?;
                    let close = self.expect(TokenKind::RBrace)?;
                    let id = self.ast.add(
                        NodeKind::CellAccess,
                        t.line,
                        join(self.ast.node(expr).span, close.span),
                    );
                    self.ast.set_child(id, 0, Some(expr));
                    self.ast.set_child(id, 1, args);
                    expr = id;
                }
                TokenKind::Dot => {
                    let t = self.next();
                    let member = self.expect(TokenKind::Ident)?;
                    let id = self.ast.add(
                        NodeKind::Member,
                        t.line,
                        join(self.ast.node(expr).span, member.span),
                    );
                    self.ast.node_mut(id).token = Some(self.prev_id());
                    self.ast.set_child(id, 0, Some(expr));
                    expr = id;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Comma-separated arguments of a call or brace access; a bare colon is
    /// the whole-dimension subscript, and `end` is live as the last-index
    /// sentinel while the call level is raised.
    fn parse_args(&mut self, close: TokenKind) -> Result<Option<NodeId>, ParseError> {
        self.call_level += 1;
        let mut head = None;
        let mut tail = None;
        loop {
            if self.peek_kind() == close {
                break;
            }
            let arg = if self.at(TokenKind::Colon) {
                let after = self.peek_kind_n(1);
                if after == TokenKind::Comma || after == close {
                    let t = self.next();
                    self.ast.add(NodeKind::Colon, t.line, t.span)
                } else {
                    self.parse_expr()?
                }
            } else {
                self.parse_expr()?
            };
            self.link(&mut head, &mut tail, arg);
            if self.at(TokenKind::Comma) {
                self.next();
                continue;
            }
            break;
        }
        self.call_level -= 1;
        Ok(head)
    }

    fn parse_primary(&mut self) -> Result<NodeId, ParseError> {
        let t = self.peek();
        match t.kind {
            TokenKind::Scalar => {
                let t = self.next();
                Ok(self.leaf(NodeKind::Scalar, t))
            }
            TokenKind::Str => {
                let t = self.next();
                Ok(self.leaf(NodeKind::Str, t))
            }
            TokenKind::CharArray => {
                let t = self.next();
                Ok(self.leaf(NodeKind::CharArray, t))
            }
            TokenKind::Ident => {
                let t = self.next();
                Ok(self.ident_node(t))
            }
            TokenKind::KwEnd if self.call_level > 0 => {
                let t = self.next();
                Ok(self.ast.add(NodeKind::EndIndex, t.line, t.span))
            }
            TokenKind::LParen => {
                let t = self.next();
                // Grouping parentheses do not raise the call level; `end`
                // stays a block close inside them.
                let inner = self.parse_expr()?;
                let close = self.expect(TokenKind::RParen)?;
                let id = self
                    .ast
                    .add(NodeKind::Group, t.line, join(t.span, close.span));
                self.ast.set_child(id, 0, Some(inner));
                Ok(id)
            }
            TokenKind::LBracket => self.parse_bracketed(TokenKind::RBracket),
            TokenKind::LBrace => self.parse_bracketed(TokenKind::RBrace),
            TokenKind::At => {
                let at = self.next();
                if self.at(TokenKind::LParen) {
                    self.next();
                    self.call_level += 1;
                    let mut head = None;
                    let mut tail = None;
                    loop {
                        if self.at(TokenKind::RParen) {
                            break;
                        }
                        if self.at(TokenKind::Comma) {
                            self.next();
                            continue;
                        }
                        let id = self.expect_ident_node()?;
                        self.link(&mut head, &mut tail, id);
                    }
                    self.expect(TokenKind::RParen)?;
                    self.call_level -= 1;
                    let body = self.parse_expr()?;
                    let id = self.ast.add(
                        NodeKind::Lambda,
                        at.line,
                        join(at.span, self.ast.node(body).span),
                    );
                    self.ast.set_child(id, 0, head);
                    self.ast.set_child(id, 1, Some(body));
                    Ok(id)
                } else {
                    let name = self.expect(TokenKind::Ident)?;
                    let id = self
                        .ast
                        .add(NodeKind::FuncHandle, at.line, join(at.span, name.span));
                    self.ast.node_mut(id).token = Some(self.prev_id());
                    Ok(id)
                }
            }
            TokenKind::Metaclass => {
                let q = self.next();
                let name = self.expect(TokenKind::Ident)?;
                let id = self
                    .ast
                    .add(NodeKind::Metaclass, q.line, join(q.span, name.span));
                self.ast.node_mut(id).token = Some(self.prev_id());
                Ok(id)
            }
            _ => Err(ParseError {
                message: "expected an expression".to_string(),
                span: t.span,
            }),
        }
    }

    /// Matrix (brackets) or cell (braces) concatenation. Rows are split on
    /// semicolons or newlines, columns on commas or plain adjacency;
    /// repeated separators collapse.
    fn parse_bracketed(&mut self, close: TokenKind) -> Result<NodeId, ParseError> {
        let open = self.next();
        let is_cell = close == TokenKind::RBrace;

        let mut rows: Vec<NodeId> = Vec::new();
        let mut row_head: Option<NodeId> = None;

        loop {
            match self.peek_kind() {
                k if k == close => break,
                TokenKind::Comma | TokenKind::Comment | TokenKind::BlockComment => {
                    self.next();
                }
                TokenKind::Semicolon | TokenKind::Newline => {
                    self.next();
                    if let Some(head) = row_head.take() {
                        rows.push(head);
                    }
                }
                TokenKind::Eof => {
                    return Err(ParseError {
                        message: "unterminated matrix literal".to_string(),
                        span: open.span,
                    });
                }
                TokenKind::Tilde
                    if matches!(
                        self.peek_kind_n(1),
                        TokenKind::Comma | TokenKind::RBracket | TokenKind::RBrace
                    ) =>
                {
                    let t = self.next();
                    let elem = self.ast.add(NodeKind::IgnoredOutput, t.line, t.span);
                    row_head = Some(self.extend_row(row_head, elem));
                }
                _ => {
                    let elem = self.parse_expr()?;
                    row_head = Some(self.extend_row(row_head, elem));
                }
            }
        }
        let close_tok = self.expect(close)?;
        if let Some(head) = row_head {
            rows.push(head);
        }

        let span = join(open.span, close_tok.span);
        if rows.is_empty() {
            let kind = if is_cell {
                NodeKind::EmptyCell
            } else {
                NodeKind::EmptyMatrix
            };
            return Ok(self.ast.add(kind, open.line, span));
        }

        let mut spine = rows[0];
        for &row in &rows[1..] {
            let id = self.ast.add(NodeKind::VertCat, open.line, span);
            self.ast.set_child(id, 0, Some(spine));
            self.ast.set_child(id, 1, Some(row));
            if is_cell {
                self.ast.node_mut(id).data_type = DataType::Cell;
            }
            spine = id;
        }

        let kind = if is_cell {
            NodeKind::CellLit
        } else {
            NodeKind::Matrix
        };
        let id = self.ast.add(kind, open.line, span);
        self.ast.set_child(id, 0, Some(spine));
        if is_cell {
            // Cell concatenation counts slots, not element sizes; the
            // spine is tagged so the inferrers treat it that way.
            self.ast.node_mut(id).data_type = DataType::Cell;
            self.mark_cell_spine(spine);
        }
        Ok(id)
    }

    fn mark_cell_spine(&mut self, id: NodeId) {
        let kind = self.ast.kind(id);
        if kind == NodeKind::HorzCat || kind == NodeKind::VertCat {
            self.ast.node_mut(id).data_type = DataType::Cell;
            let left = self.ast.child(id, 0);
            let right = self.ast.child(id, 1);
            if let Some(l) = left {
                self.mark_cell_spine(l);
            }
            if let Some(r) = right {
                self.mark_cell_spine(r);
            }
        }
    }

    fn extend_row(&mut self, row: Option<NodeId>, elem: NodeId) -> NodeId {
        match row {
            None => elem,
            Some(left) => {
                let span = join(self.ast.node(left).span, self.ast.node(elem).span);
                let line = self.ast.node(left).line;
                let id = self.ast.add(NodeKind::HorzCat, line, span);
                self.ast.set_child(id, 0, Some(left));
                self.ast.set_child(id, 1, Some(elem));
                id
            }
        }
    }

    // ---- statement termination ----

    /// Commit the verbosity bit and consume the statement terminator: a
    /// semicolon silences the echo; newline, comma, comment, or end of file
    /// leave it on.
    fn finish_stmt(&mut self, stmt: NodeId) -> Result<(), ParseError> {
        let verbose = match self.peek_kind() {
            TokenKind::Semicolon => {
                self.next();
                false
            }
            TokenKind::Comma => {
                self.next();
                true
            }
            TokenKind::Newline => {
                self.next();
                true
            }
            TokenKind::Comment | TokenKind::BlockComment => {
                self.next();
                true
            }
            TokenKind::Eof
            | TokenKind::KwEnd
            | TokenKind::KwElse
            | TokenKind::KwElseIf
            | TokenKind::KwCase
            | TokenKind::KwOtherwise
            | TokenKind::KwCatch => true,
            _ => {
                let t = self.peek();
                return Err(ParseError {
                    message: format!("expected end of statement, found `{}`", t.text(self.src)),
                    span: t.span,
                });
            }
        };
        self.ast.node_mut(stmt).verbose = verbose;
        Ok(())
    }

    /// Consume a line terminator after a block header (`if cond`, a
    /// function signature, ...): comma, semicolon, newline, or a comment.
    fn terminate_line(&mut self) -> Result<(), ParseError> {
        match self.peek_kind() {
            TokenKind::Semicolon
            | TokenKind::Comma
            | TokenKind::Newline
            | TokenKind::Comment
            | TokenKind::BlockComment => {
                self.next();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => {
                let t = self.peek();
                Err(ParseError {
                    message: format!("expected end of line, found `{}`", t.text(self.src)),
                    span: t.span,
                })
            }
        }
    }

    fn skip_separators(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::Comment
                | TokenKind::BlockComment => {
                    self.next();
                }
                _ => break,
            }
        }
    }

    // ---- node helpers ----

    /// Leaf for a token consumed by the immediately preceding `next()` /
    /// `expect()` call.
    fn leaf(&mut self, kind: NodeKind, t: Token) -> NodeId {
        let id = self.prev_id();
        self.leaf_at(kind, t, id)
    }

    fn leaf_at(&mut self, kind: NodeKind, t: Token, token: TokenId) -> NodeId {
        debug_assert_eq!(self.tokens[token.0 as usize].span, t.span);
        let id = self.ast.add(kind, t.line, t.span);
        self.ast.node_mut(id).token = Some(token);
        id
    }

    fn ident_node(&mut self, t: Token) -> NodeId {
        self.leaf(NodeKind::Ident, t)
    }

    fn expect_ident_node(&mut self) -> Result<NodeId, ParseError> {
        let t = self.expect(TokenKind::Ident)?;
        Ok(self.ident_node(t))
    }

    fn binary(&mut self, kind: NodeKind, t: Token, left: NodeId, right: NodeId) -> NodeId {
        let span = join(self.ast.node(left).span, self.ast.node(right).span);
        let id = self.ast.add(kind, t.line, span);
        self.ast.set_child(id, 0, Some(left));
        self.ast.set_child(id, 1, Some(right));
        id
    }

    fn link(&mut self, head: &mut Option<NodeId>, tail: &mut Option<NodeId>, id: NodeId) {
        match tail {
            None => {
                *head = Some(id);
                *tail = Some(id);
            }
            Some(prev) => {
                self.ast.node_mut(*prev).list_link = Some(id);
                *tail = Some(id);
            }
        }
    }

    // ---- token navigation; continuations are transparent ----

    fn cursor(&self) -> usize {
        let mut i = self.idx;
        while i < self.tokens.len() && self.tokens[i].kind.is_trivia() {
            i += 1;
        }
        i.min(self.tokens.len() - 1)
    }

    fn peek(&self) -> Token {
        self.tokens[self.cursor()]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_kind_n(&self, n: usize) -> TokenKind {
        let mut i = self.cursor();
        for _ in 0..n {
            i += 1;
            while i < self.tokens.len() && self.tokens[i].kind.is_trivia() {
                i += 1;
            }
        }
        self.tokens[i.min(self.tokens.len() - 1)].kind
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn next(&mut self) -> Token {
        let i = self.cursor();
        self.idx = i + 1;
        self.tokens[i]
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.at(kind) {
            Ok(self.next())
        } else {
            let t = self.peek();
            Err(ParseError {
                message: format!("expected {:?}, found `{}`", kind, t.text(self.src)),
                span: t.span,
            })
        }
    }

    /// TokenId of the token the immediately preceding `next()` returned.
    fn prev_id(&self) -> TokenId {
        TokenId(self.idx as u32 - 1)
    }

    fn token_text(&self, id: TokenId) -> &str {
        self.tokens[id.0 as usize].text(self.src)
    }
}

fn join(a: Span, b: Span) -> Span {
    let start = a.offset().min(b.offset());
    let end = (a.offset() + a.len()).max(b.offset() + b.len());
    span_between(start, end)
}
