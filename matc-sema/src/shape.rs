#![forbid(unsafe_code)]

use matc_ast::{Ast, DataType, Fill, NodeId, NodeKind};
use matc_lex::Token;

use crate::error::ShapeError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Axis {
    Rows,
    Cols,
}

impl Axis {
    fn label(self) -> &'static str {
        match self {
            Axis::Rows => "rows",
            Axis::Cols => "columns",
        }
    }
}

/// Propagates row/column counts across the tree until a pass makes no
/// modification. Every propagation fills a previously-unknown slot, so the
/// iteration converges; a disagreement with an existing annotation is a
/// shape error.
pub struct ShapeInferrer<'a> {
    ast: &'a mut Ast,
    tokens: &'a [Token],
    src: &'a str,
    mathematical_notation: bool,
    disallow_resizing: bool,
    changed: bool,
}

impl<'a> ShapeInferrer<'a> {
    pub fn new(
        ast: &'a mut Ast,
        tokens: &'a [Token],
        src: &'a str,
        mathematical_notation: bool,
        disallow_resizing: bool,
    ) -> Self {
        Self {
            ast,
            tokens,
            src,
            mathematical_notation,
            disallow_resizing,
            changed: false,
        }
    }

    pub fn run(mut self) -> Result<(), ShapeError> {
        loop {
            self.changed = false;
            for id in self.ast.ids().collect::<Vec<_>>() {
                self.visit(id)?;
            }
            if !self.changed {
                return Ok(());
            }
        }
    }

    // ---- primitive helpers ----

    fn dim(&self, id: NodeId, axis: Axis) -> Option<u32> {
        match axis {
            Axis::Rows => self.ast.rows(id),
            Axis::Cols => self.ast.cols(id),
        }
    }

    fn set_dim(&mut self, id: NodeId, axis: Axis, value: u32) -> Result<(), ShapeError> {
        let fill = match axis {
            Axis::Rows => self.ast.fill_rows(id, value),
            Axis::Cols => self.ast.fill_cols(id, value),
        };
        match fill {
            Fill::Unchanged => Ok(()),
            Fill::Filled => {
                self.changed = true;
                Ok(())
            }
            Fill::Conflict(old) => Err(ShapeError {
                message: format!("{} disagree: {} vs {}", axis.label(), old, value),
                span: self.ast.node(id).span,
            }),
        }
    }

    fn match_axis(
        &mut self,
        a: NodeId,
        a_axis: Axis,
        b: NodeId,
        b_axis: Axis,
    ) -> Result<(), ShapeError> {
        if let Some(v) = self.dim(a, a_axis) {
            self.set_dim(b, b_axis, v)?;
        }
        if let Some(v) = self.dim(b, b_axis) {
            self.set_dim(a, a_axis, v)?;
        }
        Ok(())
    }

    fn match_rows(&mut self, a: NodeId, b: NodeId) -> Result<(), ShapeError> {
        self.match_axis(a, Axis::Rows, b, Axis::Rows)
    }

    fn match_cols(&mut self, a: NodeId, b: NodeId) -> Result<(), ShapeError> {
        self.match_axis(a, Axis::Cols, b, Axis::Cols)
    }

    fn match_rows3(&mut self, p: NodeId, l: NodeId, r: NodeId) -> Result<(), ShapeError> {
        self.match_rows(p, l)?;
        self.match_rows(p, r)?;
        self.match_rows(l, r)
    }

    fn match_cols3(&mut self, p: NodeId, l: NodeId, r: NodeId) -> Result<(), ShapeError> {
        self.match_cols(p, l)?;
        self.match_cols(p, r)?;
        self.match_cols(l, r)
    }

    /// Triadic match with broadcast: an operand dimension of 1 stretches to
    /// the other operand's extent.
    fn soft_match_axis3(
        &mut self,
        p: NodeId,
        l: NodeId,
        r: NodeId,
        axis: Axis,
    ) -> Result<(), ShapeError> {
        match (self.dim(l, axis), self.dim(r, axis)) {
            (Some(a), Some(b)) => {
                if a == b {
                    self.set_dim(p, axis, a)
                } else if a == 1 {
                    self.set_dim(p, axis, b)
                } else if b == 1 {
                    self.set_dim(p, axis, a)
                } else {
                    Err(ShapeError {
                        message: format!("{} disagree: {} vs {}", axis.label(), a, b),
                        span: self.ast.node(p).span,
                    })
                }
            }
            (Some(1), None) => {
                if let Some(pv) = self.dim(p, axis) {
                    self.set_dim(r, axis, pv)?;
                }
                Ok(())
            }
            (None, Some(1)) => {
                if let Some(pv) = self.dim(p, axis) {
                    self.set_dim(l, axis, pv)?;
                }
                Ok(())
            }
            (Some(a), None) => self.set_dim(p, axis, a),
            (None, Some(b)) => self.set_dim(p, axis, b),
            (None, None) => {
                if self.dim(p, axis) == Some(1) {
                    self.set_dim(l, axis, 1)?;
                    self.set_dim(r, axis, 1)?;
                }
                Ok(())
            }
        }
    }

    fn soft_match_rows3(&mut self, p: NodeId, l: NodeId, r: NodeId) -> Result<(), ShapeError> {
        self.soft_match_axis3(p, l, r, Axis::Rows)
    }

    fn soft_match_cols3(&mut self, p: NodeId, l: NodeId, r: NodeId) -> Result<(), ShapeError> {
        self.soft_match_axis3(p, l, r, Axis::Cols)
    }

    fn match_size(&mut self, a: NodeId, b: NodeId) -> Result<(), ShapeError> {
        self.match_rows(a, b)?;
        self.match_cols(a, b)
    }

    fn flip_size(&mut self, a: NodeId, b: NodeId) -> Result<(), ShapeError> {
        self.match_axis(a, Axis::Rows, b, Axis::Cols)?;
        self.match_axis(a, Axis::Cols, b, Axis::Rows)
    }

    fn match_scalar(&mut self, id: NodeId) -> Result<(), ShapeError> {
        self.set_dim(id, Axis::Rows, 1)?;
        self.set_dim(id, Axis::Cols, 1)
    }

    fn match_empty(&mut self, id: NodeId) -> Result<(), ShapeError> {
        self.set_dim(id, Axis::Rows, 0)?;
        self.set_dim(id, Axis::Cols, 0)
    }

    fn match_square(&mut self, id: NodeId) -> Result<(), ShapeError> {
        self.match_axis(id, Axis::Rows, id, Axis::Cols)
    }

    fn match_cols_to_rows(&mut self, left: NodeId, right: NodeId) -> Result<(), ShapeError> {
        self.match_axis(left, Axis::Cols, right, Axis::Rows)
    }

    /// Concatenation arithmetic along one axis: parent = left + right, with
    /// the two inverse propagations.
    fn sum_axis3(
        &mut self,
        p: NodeId,
        l: NodeId,
        r: NodeId,
        axis: Axis,
    ) -> Result<(), ShapeError> {
        match (self.dim(l, axis), self.dim(r, axis), self.dim(p, axis)) {
            (Some(a), Some(b), _) => self.set_dim(p, axis, a + b),
            (Some(a), None, Some(c)) if c >= a => self.set_dim(r, axis, c - a),
            (None, Some(b), Some(c)) if c >= b => self.set_dim(l, axis, c - b),
            (Some(a), None, Some(c)) | (None, Some(a), Some(c)) => Err(ShapeError {
                message: format!(
                    "concatenation {} cannot reach {} from an operand of {}",
                    axis.label(),
                    c,
                    a
                ),
                span: self.ast.node(p).span,
            }),
            _ => Ok(()),
        }
    }

    fn is_scalar(&self, id: NodeId) -> Option<bool> {
        match (self.ast.rows(id), self.ast.cols(id)) {
            (Some(1), Some(1)) => Some(true),
            (Some(r), _) if r != 1 => Some(false),
            (_, Some(c)) if c != 1 => Some(false),
            _ => None,
        }
    }

    // ---- per-node rules ----

    fn visit(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let kind = self.ast.kind(id);
        match kind {
            NodeKind::Scalar | NodeKind::EndIndex => self.match_scalar(id),
            NodeKind::Str => self.match_scalar(id),
            NodeKind::CharArray => {
                self.set_dim(id, Axis::Rows, 1)?;
                let len = self.literal_len(id);
                self.set_dim(id, Axis::Cols, len)
            }
            NodeKind::EmptyMatrix | NodeKind::EmptyCell => self.match_empty(id),

            NodeKind::Matrix => {
                let spine = self.ast.child(id, 0).expect("matrix spine");
                self.match_size(id, spine)
            }
            NodeKind::CellLit => self.visit_cell_lit(id),
            NodeKind::VertCat if self.ast.data_type(id) != DataType::Cell => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                self.match_cols3(id, l, r)?;
                self.sum_axis3(id, l, r, Axis::Rows)
            }
            NodeKind::HorzCat if self.ast.data_type(id) != DataType::Cell => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                self.match_rows3(id, l, r)?;
                self.sum_axis3(id, l, r, Axis::Cols)
            }
            NodeKind::VertCat | NodeKind::HorzCat => Ok(()),

            NodeKind::Group | NodeKind::Not | NodeKind::Neg | NodeKind::UnaryPlus => {
                let c = self.ast.child(id, 0).expect("operand");
                self.match_size(id, c)
            }
            NodeKind::Transpose | NodeKind::CTranspose => {
                let c = self.ast.child(id, 0).expect("operand");
                self.flip_size(id, c)
            }

            NodeKind::ElemMul
            | NodeKind::ElemDiv
            | NodeKind::ElemBackDiv
            | NodeKind::ElemPow
            | NodeKind::Eq
            | NodeKind::Ne
            | NodeKind::Lt
            | NodeKind::Le
            | NodeKind::Gt
            | NodeKind::Ge
            | NodeKind::And
            | NodeKind::Or => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                self.soft_match_rows3(id, l, r)?;
                self.soft_match_cols3(id, l, r)
            }

            NodeKind::ShortAnd | NodeKind::ShortOr => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                self.match_scalar(id)?;
                self.match_scalar(l)?;
                self.match_scalar(r)
            }

            NodeKind::Add | NodeKind::Sub => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                if self.mathematical_notation {
                    self.match_rows3(id, l, r)?;
                    self.match_cols3(id, l, r)
                } else {
                    self.soft_match_rows3(id, l, r)?;
                    self.soft_match_cols3(id, l, r)
                }
            }

            NodeKind::Mul => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                match (self.is_scalar(l), self.is_scalar(r)) {
                    (Some(true), _) => self.match_size(id, r),
                    (_, Some(true)) => self.match_size(id, l),
                    (Some(false), _) | (_, Some(false)) => {
                        self.match_cols_to_rows(l, r)?;
                        self.match_rows(id, l)?;
                        self.match_cols(id, r)
                    }
                    _ => Ok(()),
                }
            }

            // `B / A` solves x * A = B: columns agree, the result takes
            // B's rows and A's rows (pseudoinverse-aware).
            NodeKind::Div => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                match self.is_scalar(r) {
                    Some(true) => self.match_size(id, l),
                    Some(false) => {
                        self.match_axis(l, Axis::Cols, r, Axis::Cols)?;
                        self.match_rows(id, l)?;
                        self.match_axis(id, Axis::Cols, r, Axis::Rows)
                    }
                    None => Ok(()),
                }
            }

            // `A \ B` solves A * x = B: rows agree, the result takes A's
            // columns and B's columns.
            NodeKind::BackDiv => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                match self.is_scalar(l) {
                    Some(true) => self.match_size(id, r),
                    Some(false) => {
                        self.match_rows(l, r)?;
                        self.match_axis(id, Axis::Rows, l, Axis::Cols)?;
                        self.match_cols(id, r)
                    }
                    None => Ok(()),
                }
            }

            NodeKind::Pow => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                match (self.is_scalar(l), self.is_scalar(r)) {
                    (Some(true), Some(true)) => self.match_scalar(id),
                    (Some(false), _) => {
                        self.match_scalar(r)?;
                        self.match_square(l)?;
                        self.match_size(id, l)
                    }
                    (_, Some(false)) => {
                        self.match_scalar(l)?;
                        self.match_square(r)?;
                        self.match_size(id, r)
                    }
                    _ => Ok(()),
                }
            }

            NodeKind::Range => self.visit_range(id),

            NodeKind::VarRef => {
                if let Some(target) = self.ast.node(id).target {
                    if target != id {
                        self.match_size(id, target)?;
                    }
                }
                Ok(())
            }

            NodeKind::Lambda | NodeKind::FuncHandle => self.match_scalar(id),

            NodeKind::MatrixAccess => self.visit_access(id),

            NodeKind::FnCall => self.visit_call(id),

            NodeKind::Assign => self.visit_assign(id),
            NodeKind::MultiAssign => self.visit_multi_assign(id),

            NodeKind::For | NodeKind::Parfor => {
                let iter = self.ast.child(id, 0).expect("loop iterator");
                self.match_scalar(iter)
            }

            _ => Ok(()),
        }
    }

    fn visit_cell_lit(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let spine = self.ast.child(id, 0).expect("cell spine");
        let rows = self.cell_row_count(spine);
        let cols = self.cell_col_count(spine, id)?;
        self.set_dim(id, Axis::Rows, rows)?;
        self.set_dim(id, Axis::Cols, cols)
    }

    fn cell_row_count(&self, id: NodeId) -> u32 {
        if self.ast.kind(id) == NodeKind::VertCat && self.ast.data_type(id) == DataType::Cell {
            self.cell_row_count(self.ast.child(id, 0).unwrap())
                + self.cell_row_count(self.ast.child(id, 1).unwrap())
        } else {
            1
        }
    }

    fn cell_col_count(&self, id: NodeId, lit: NodeId) -> Result<u32, ShapeError> {
        if self.ast.kind(id) == NodeKind::VertCat && self.ast.data_type(id) == DataType::Cell {
            let a = self.cell_col_count(self.ast.child(id, 0).unwrap(), lit)?;
            let b = self.cell_col_count(self.ast.child(id, 1).unwrap(), lit)?;
            if a != b {
                return Err(ShapeError {
                    message: format!("cell rows disagree: {} vs {} elements", a, b),
                    span: self.ast.node(lit).span,
                });
            }
            Ok(a)
        } else if self.ast.kind(id) == NodeKind::HorzCat && self.ast.data_type(id) == DataType::Cell
        {
            Ok(self.cell_col_count(self.ast.child(id, 0).unwrap(), lit)?
                + self.cell_col_count(self.ast.child(id, 1).unwrap(), lit)?)
        } else {
            Ok(1)
        }
    }

    fn visit_range(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let start = self.ast.child(id, 0).expect("range start");
        let stop = self.ast.child(id, 1).expect("range stop");
        let step = self.ast.child(id, 2);

        self.match_scalar(start)?;
        self.match_scalar(stop)?;
        if let Some(step) = step {
            self.match_scalar(step)?;
        }
        self.set_dim(id, Axis::Rows, 1)?;

        // Column count only from literal bounds; no general evaluation.
        let lo = self.literal_value(start);
        let hi = self.literal_value(stop);
        let by = match step {
            None => Some(1.0),
            Some(s) => self.literal_value(s),
        };
        if let (Some(lo), Some(hi), Some(by)) = (lo, hi, by) {
            if by > 0.0 {
                let n = if hi < lo {
                    0.0
                } else {
                    ((hi - lo) / by).floor() + 1.0
                };
                self.set_dim(id, Axis::Cols, n as u32)?;
            }
        }
        Ok(())
    }

    fn visit_access(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let receiver = self.ast.child(id, 0).expect("access receiver");
        let args: Vec<NodeId> = self.ast.list(self.ast.child(id, 1)).collect();
        match args.len() {
            1 => {
                let sub = args[0];
                if self.ast.kind(sub) == NodeKind::Colon {
                    // A(:) is the column-vector reshape.
                    self.set_dim(id, Axis::Cols, 1)?;
                    if let (Some(r), Some(c)) =
                        (self.ast.rows(receiver), self.ast.cols(receiver))
                    {
                        self.set_dim(id, Axis::Rows, r * c)?;
                    }
                    Ok(())
                } else {
                    // The result takes the subscript's orientation.
                    self.match_size(id, sub)
                }
            }
            2 => {
                self.subscript_axis(id, receiver, args[0], Axis::Rows)?;
                self.subscript_axis(id, receiver, args[1], Axis::Cols)
            }
            _ => Ok(()),
        }
    }

    fn subscript_axis(
        &mut self,
        access: NodeId,
        receiver: NodeId,
        sub: NodeId,
        axis: Axis,
    ) -> Result<(), ShapeError> {
        match self.ast.kind(sub) {
            NodeKind::Colon => {
                // The whole dimension comes through.
                self.match_axis(access, axis, receiver, axis)
            }
            NodeKind::EndIndex => self.set_dim(access, axis, 1),
            NodeKind::Range => {
                if let Some(n) = self.ast.cols(sub) {
                    self.set_dim(access, axis, n)?;
                }
                Ok(())
            }
            _ => {
                if self.is_scalar(sub) == Some(true) {
                    self.set_dim(access, axis, 1)?;
                }
                Ok(())
            }
        }
    }

    /// User-function calls propagate sizes through the signature: argument
    /// i matches input parameter i, and the call's own size matches the
    /// leading output.
    fn visit_call(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let callee = self.ast.child(id, 0).expect("callee");
        match self.ast.kind(callee) {
            NodeKind::FuncRef => {
                let func = self.ast.node(callee).target.expect("function target");
                let params: Vec<NodeId> = self.ast.list(self.ast.child(func, 1)).collect();
                let args: Vec<NodeId> = self.ast.list(self.ast.child(id, 1)).collect();
                for (&arg, &param) in args.iter().zip(params.iter()) {
                    self.match_size(arg, param)?;
                }
                let outputs: Vec<NodeId> = self.ast.list(self.ast.child(func, 0)).collect();
                if let Some(&first) = outputs.first() {
                    // An output sharing an input's name is the same slot.
                    let slot = self.ast.node(first).target.unwrap_or(first);
                    self.match_size(id, slot)?;
                }
                Ok(())
            }
            NodeKind::BuiltinRef => self.visit_builtin_call(id, callee),
            _ => Ok(()),
        }
    }

    fn visit_builtin_call(&mut self, id: NodeId, callee: NodeId) -> Result<(), ShapeError> {
        let name = crate::node_name(self.ast, self.tokens, self.src, callee);
        match name {
            // One-output `size` is the 1x2 extent vector.
            "size" => {
                self.set_dim(id, Axis::Rows, 1)?;
                self.set_dim(id, Axis::Cols, 2)
            }
            "numel" | "length" => self.match_scalar(id),
            _ => Ok(()),
        }
    }

    fn visit_assign(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let lhs = self.ast.child(id, 0).expect("assignment target");
        let rhs = self.ast.child(id, 1).expect("assignment value");
        if self.ast.kind(lhs) == NodeKind::VarRef {
            self.match_size(lhs, rhs).map_err(|e| self.resize_error(e))
        } else {
            // Indexed or member writes update elements in place.
            Ok(())
        }
    }

    fn visit_multi_assign(&mut self, id: NodeId) -> Result<(), ShapeError> {
        let call = self.ast.child(id, 1).expect("multi-assignment call");
        let callee = self.ast.child(call, 0).expect("callee");
        let targets: Vec<NodeId> = self.ast.list(self.ast.child(id, 0)).collect();

        match self.ast.kind(callee) {
            NodeKind::FuncRef => {
                let func = self.ast.node(callee).target.expect("function target");
                let outputs: Vec<NodeId> = self.ast.list(self.ast.child(func, 0)).collect();
                for (&target, &out) in targets.iter().zip(outputs.iter()) {
                    if self.ast.kind(target) != NodeKind::IgnoredOutput {
                        let slot = self.ast.node(out).target.unwrap_or(out);
                        self.match_size(target, slot)
                            .map_err(|e| self.resize_error(e))?;
                    }
                }
                Ok(())
            }
            NodeKind::BuiltinRef => {
                let name = crate::node_name(self.ast, self.tokens, self.src, callee);
                if name == "size" {
                    // Each requested extent is a scalar.
                    for &target in &targets {
                        if self.ast.kind(target) != NodeKind::IgnoredOutput {
                            self.match_scalar(target)?;
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn resize_error(&self, e: ShapeError) -> ShapeError {
        let note = if self.disallow_resizing {
            "a variable's size is fixed at its first assignment"
        } else {
            "dynamic resizing is not supported"
        };
        ShapeError {
            message: format!("{} ({note})", e.message),
            span: e.span,
        }
    }

    // ---- literal helpers ----

    fn literal_value(&self, id: NodeId) -> Option<f64> {
        if self.ast.kind(id) != NodeKind::Scalar {
            return None;
        }
        let token = self.ast.node(id).token?;
        self.tokens[token.0 as usize].text(self.src).parse().ok()
    }

    /// Character count of a quoted literal, with doubled delimiters
    /// counting once.
    fn literal_len(&self, id: NodeId) -> u32 {
        let Some(token) = self.ast.node(id).token else {
            return 0;
        };
        let text = self.tokens[token.0 as usize].text(self.src);
        if text.len() < 2 {
            return 0;
        }
        let quote = text.as_bytes()[0];
        let inner = &text.as_bytes()[1..text.len() - 1];
        let mut n = 0u32;
        let mut i = 0;
        while i < inner.len() {
            if inner[i] == quote && i + 1 < inner.len() && inner[i + 1] == quote {
                i += 2;
            } else {
                i += 1;
            }
            n += 1;
        }
        n
    }
}
