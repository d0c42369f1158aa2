#![forbid(unsafe_code)]

use matc_ast::{Ast, DataType, Fill, NodeId, NodeKind};
use matc_lex::Token;

use crate::error::TypeError;
use crate::node_name;

const N: usize = 8;

/// Table index for a value type; `Unknown` and `Na` stay outside the
/// tables.
fn ti(t: DataType) -> Option<usize> {
    Some(match t {
        DataType::Bool => 0,
        DataType::Char => 1,
        DataType::Int => 2,
        DataType::Real => 3,
        DataType::Str => 4,
        DataType::Cell => 5,
        DataType::Func => 6,
        DataType::Dynamic => 7,
        DataType::Unknown | DataType::Na => return None,
    })
}

use DataType::{Bool, Char, Dynamic, Int, Real, Str};

const E: Option<DataType> = None;
const B: Option<DataType> = Some(Bool);
const C: Option<DataType> = Some(Char);
const I: Option<DataType> = Some(Int);
const R: Option<DataType> = Some(Real);
const S: Option<DataType> = Some(Str);
const D: Option<DataType> = Some(Dynamic);

/// result[left][right] for addition, which also concatenates strings with
/// char promotion.
#[rustfmt::skip]
const ADD_RESULT: [[Option<DataType>; N]; N] = [
    //         Bool Char Int Real Str Cell Func Dyn
    /* Bool */ [I,   I,   I,  R,   E,  E,   E,   D],
    /* Char */ [I,   I,   I,  R,   S,  E,   E,   D],
    /* Int  */ [I,   I,   I,  R,   E,  E,   E,   D],
    /* Real */ [R,   R,   R,  R,   E,  E,   E,   D],
    /* Str  */ [E,   S,   E,  E,   S,  E,   E,   D],
    /* Cell */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Func */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Dyn  */ [D,   D,   D,  D,   D,  E,   E,   D],
];

/// result[left][right] for subtraction, multiplication, and power: numeric
/// operands only.
#[rustfmt::skip]
const NUM_RESULT: [[Option<DataType>; N]; N] = [
    //         Bool Char Int Real Str Cell Func Dyn
    /* Bool */ [I,   I,   I,  R,   E,  E,   E,   D],
    /* Char */ [I,   I,   I,  R,   E,  E,   E,   D],
    /* Int  */ [I,   I,   I,  R,   E,  E,   E,   D],
    /* Real */ [R,   R,   R,  R,   E,  E,   E,   D],
    /* Str  */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Cell */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Func */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Dyn  */ [D,   D,   D,  D,   E,  E,   E,   D],
];

/// result[left][right] for the divides: any numeric ratio is real.
#[rustfmt::skip]
const DIV_RESULT: [[Option<DataType>; N]; N] = [
    //         Bool Char Int Real Str Cell Func Dyn
    /* Bool */ [R,   R,   R,  R,   E,  E,   E,   D],
    /* Char */ [R,   R,   R,  R,   E,  E,   E,   D],
    /* Int  */ [R,   R,   R,  R,   E,  E,   E,   D],
    /* Real */ [R,   R,   R,  R,   E,  E,   E,   D],
    /* Str  */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Cell */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Func */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Dyn  */ [D,   D,   D,  D,   E,  E,   E,   D],
];

#[rustfmt::skip]
const CONCAT_RESULT: [[Option<DataType>; N]; N] = [
    //         Bool Char Int Real Str Cell Func Dyn
    /* Bool */ [B,   E,   I,  R,   E,  E,   E,   D],
    /* Char */ [E,   C,   E,  E,   E,  E,   E,   E],
    /* Int  */ [I,   E,   I,  R,   E,  E,   E,   D],
    /* Real */ [R,   E,   R,  R,   E,  E,   E,   D],
    /* Str  */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Cell */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Func */ [E,   E,   E,  E,   E,  E,   E,   E],
    /* Dyn  */ [D,   E,   D,  D,   E,  E,   E,   D],
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpClass {
    Add,
    Num,
    Div,
}

impl OpClass {
    fn result(self, l: DataType, r: DataType) -> Option<DataType> {
        let table = match self {
            OpClass::Add => &ADD_RESULT,
            OpClass::Num => &NUM_RESULT,
            OpClass::Div => &DIV_RESULT,
        };
        table[ti(l)?][ti(r)?]
    }

    /// Result when only one operand is known; `None` when ambiguous.
    fn single(self, known: DataType) -> Option<DataType> {
        match (self, known) {
            (_, Dynamic) => Some(Dynamic),
            (OpClass::Add, Str) => Some(Str),
            (OpClass::Add, Real) | (OpClass::Num, Real) => Some(Real),
            (OpClass::Div, Bool | Char | Int | Real) => Some(Real),
            _ => None,
        }
    }

    /// Required type of the unknown operand given the result and the other
    /// operand; `None` when ambiguous.
    fn operand(self, result: DataType, other: DataType) -> Option<DataType> {
        match (self, result, other) {
            (OpClass::Add | OpClass::Num, Real, Bool | Char | Int) => Some(Real),
            (OpClass::Add, Str, Char) => Some(Str),
            _ => None,
        }
    }
}

/// Fixed-point element-type propagation over the annotated tree, driven by
/// the per-operator tables above.
pub struct TypeInferrer<'a> {
    ast: &'a mut Ast,
    tokens: &'a [Token],
    src: &'a str,
    changed: bool,
}

impl<'a> TypeInferrer<'a> {
    pub fn new(ast: &'a mut Ast, tokens: &'a [Token], src: &'a str) -> Self {
        Self {
            ast,
            tokens,
            src,
            changed: false,
        }
    }

    pub fn run(mut self) -> Result<(), TypeError> {
        loop {
            self.changed = false;
            for id in self.ast.ids().collect::<Vec<_>>() {
                self.visit(id)?;
            }
            if !self.changed {
                break;
            }
        }

        // Whatever stayed unknown at the fixed point is dynamic; the
        // emitted program then carries the runtime variant type.
        for id in self.ast.ids().collect::<Vec<_>>() {
            let node = self.ast.node_mut(id);
            if node.data_type == DataType::Unknown {
                node.data_type = if is_statement(node.kind) {
                    DataType::Na
                } else {
                    DataType::Dynamic
                };
            }
        }
        Ok(())
    }

    fn set(&mut self, id: NodeId, t: DataType) -> Result<(), TypeError> {
        match self.ast.fill_type(id, t) {
            Fill::Unchanged => Ok(()),
            Fill::Filled => {
                self.changed = true;
                Ok(())
            }
            Fill::Conflict(old) => Err(TypeError {
                message: format!("type conflict: {} vs {}", old.display(), t.display()),
                span: self.ast.node(id).span,
            }),
        }
    }

    fn tie(&mut self, a: NodeId, b: NodeId) -> Result<(), TypeError> {
        let ta = self.ast.data_type(a);
        let tb = self.ast.data_type(b);
        if ta != DataType::Unknown && ta != DataType::Na {
            self.set(b, ta)?;
        }
        if tb != DataType::Unknown && tb != DataType::Na {
            self.set(a, tb)?;
        }
        Ok(())
    }

    fn visit(&mut self, id: NodeId) -> Result<(), TypeError> {
        let kind = self.ast.kind(id);
        match kind {
            NodeKind::Scalar => {
                let t = self.scalar_literal_type(id);
                self.set(id, t)
            }
            NodeKind::Str => self.set(id, DataType::Str),
            NodeKind::CharArray => self.set(id, DataType::Char),
            NodeKind::EmptyMatrix => self.set(id, DataType::Real),
            NodeKind::EmptyCell | NodeKind::CellLit => self.set(id, DataType::Cell),

            NodeKind::Matrix => {
                let spine = self.ast.child(id, 0).expect("matrix spine");
                self.tie(id, spine)
            }
            NodeKind::VertCat | NodeKind::HorzCat => {
                if self.ast.data_type(id) == DataType::Cell {
                    return Ok(());
                }
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                let (lt, rt) = (self.ast.data_type(l), self.ast.data_type(r));
                if let (Some(li), Some(ri)) = (ti(lt), ti(rt)) {
                    match CONCAT_RESULT[li][ri] {
                        Some(t) => self.set(id, t)?,
                        None => {
                            return Err(TypeError {
                                message: format!(
                                    "concatenation of {} and {} is not yet supported",
                                    lt.display(),
                                    rt.display()
                                ),
                                span: self.ast.node(id).span,
                            })
                        }
                    }
                }
                Ok(())
            }

            NodeKind::Group | NodeKind::Transpose | NodeKind::CTranspose => {
                let c = self.ast.child(id, 0).expect("operand");
                self.tie(id, c)
            }

            NodeKind::Neg | NodeKind::UnaryPlus => {
                let c = self.ast.child(id, 0).expect("operand");
                match self.ast.data_type(c) {
                    DataType::Str | DataType::Cell | DataType::Func => Err(TypeError {
                        message: format!(
                            "unary minus is not defined for a {} value",
                            self.ast.data_type(c).display()
                        ),
                        span: self.ast.node(id).span,
                    }),
                    DataType::Bool | DataType::Char | DataType::Int => self.set(id, DataType::Int),
                    DataType::Real => self.set(id, DataType::Real),
                    DataType::Dynamic => self.set(id, DataType::Dynamic),
                    DataType::Unknown | DataType::Na => Ok(()),
                }
            }

            NodeKind::Not
            | NodeKind::And
            | NodeKind::Or
            | NodeKind::ShortAnd
            | NodeKind::ShortOr => {
                for slot in 0..2 {
                    if let Some(c) = self.ast.child(id, slot) {
                        let t = self.ast.data_type(c);
                        if matches!(t, DataType::Str | DataType::Cell | DataType::Func) {
                            return Err(TypeError {
                                message: format!(
                                    "logical operator is not defined for a {} value",
                                    t.display()
                                ),
                                span: self.ast.node(id).span,
                            });
                        }
                    }
                }
                self.set(id, DataType::Bool)
            }

            NodeKind::Eq
            | NodeKind::Ne
            | NodeKind::Lt
            | NodeKind::Le
            | NodeKind::Gt
            | NodeKind::Ge => {
                let l = self.ast.child(id, 0).expect("left operand");
                let r = self.ast.child(id, 1).expect("right operand");
                let (lt, rt) = (self.ast.data_type(l), self.ast.data_type(r));
                for t in [lt, rt] {
                    if matches!(t, DataType::Cell | DataType::Func) {
                        return Err(TypeError {
                            message: format!(
                                "comparison is not defined for a {} value",
                                t.display()
                            ),
                            span: self.ast.node(id).span,
                        });
                    }
                }
                if (lt == DataType::Str && rt.is_numeric())
                    || (rt == DataType::Str && lt.is_numeric())
                {
                    return Err(TypeError {
                        message: "comparison between a string and a number".to_string(),
                        span: self.ast.node(id).span,
                    });
                }
                self.set(id, DataType::Bool)
            }

            NodeKind::Add => self.visit_binary(id, OpClass::Add),
            NodeKind::Sub | NodeKind::Mul | NodeKind::ElemMul | NodeKind::Pow
            | NodeKind::ElemPow => self.visit_binary(id, OpClass::Num),
            NodeKind::Div | NodeKind::ElemDiv | NodeKind::BackDiv | NodeKind::ElemBackDiv => {
                self.visit_binary(id, OpClass::Div)
            }

            NodeKind::Range => self.visit_range(id),

            NodeKind::VarRef => {
                if let Some(target) = self.ast.node(id).target {
                    if target != id {
                        self.tie(id, target)?;
                    }
                }
                Ok(())
            }

            NodeKind::Lambda | NodeKind::FuncHandle | NodeKind::FuncRef
            | NodeKind::BuiltinRef => self.set(id, DataType::Func),
            NodeKind::FreeName | NodeKind::Member | NodeKind::Metaclass => {
                self.set(id, DataType::Dynamic)
            }
            NodeKind::CellAccess => self.set(id, DataType::Dynamic),
            NodeKind::EndIndex => self.set(id, DataType::Int),
            NodeKind::Colon => self.set(id, DataType::Na),

            NodeKind::MatrixAccess => {
                let receiver = self.ast.child(id, 0).expect("access receiver");
                match self.ast.data_type(receiver) {
                    DataType::Func => self.set(id, DataType::Dynamic),
                    DataType::Unknown | DataType::Na => Ok(()),
                    t => self.set(id, t),
                }
            }

            NodeKind::For | NodeKind::Parfor => {
                let iter = self.ast.child(id, 0).expect("loop iterator");
                let range = self.ast.child(id, 1).expect("loop range");
                self.tie(iter, range)?;
                self.set(id, DataType::Na)
            }

            NodeKind::FnCall => self.visit_call(id),
            NodeKind::Assign => {
                let lhs = self.ast.child(id, 0).expect("assignment target");
                let rhs = self.ast.child(id, 1).expect("assignment value");
                self.tie(lhs, rhs).map_err(|e| TypeError {
                    message: format!("conflicting assignment: {}", e.message),
                    span: self.ast.node(id).span,
                })
            }
            NodeKind::MultiAssign => self.visit_multi_assign(id),

            _ => {
                if is_statement(kind) {
                    self.set(id, DataType::Na)?;
                }
                Ok(())
            }
        }
    }

    fn visit_binary(&mut self, id: NodeId, class: OpClass) -> Result<(), TypeError> {
        let l = self.ast.child(id, 0).expect("left operand");
        let r = self.ast.child(id, 1).expect("right operand");
        let (lt, rt) = (self.ast.data_type(l), self.ast.data_type(r));
        let known = |t: DataType| t != DataType::Unknown && t != DataType::Na;

        if known(lt) && known(rt) {
            match class.result(lt, rt) {
                Some(t) => {
                    self.set(id, t)?;
                    self.annotate_cast(id, t, lt, rt);
                    Ok(())
                }
                None => {
                    let message = if lt == DataType::Cell || rt == DataType::Cell {
                        "cell arithmetic is not yet supported".to_string()
                    } else {
                        format!(
                            "operator is not defined for {} and {}",
                            lt.display(),
                            rt.display()
                        )
                    };
                    Err(TypeError {
                        message,
                        span: self.ast.node(id).span,
                    })
                }
            }
        } else if known(lt) || known(rt) {
            let one = if known(lt) { lt } else { rt };
            if let Some(t) = class.single(one) {
                self.set(id, t)?;
            }
            // With the result known too, the other operand may follow.
            let result = self.ast.data_type(id);
            if known(result) {
                if let Some(t) = class.operand(result, one) {
                    let other = if known(lt) { r } else { l };
                    self.set(other, t)?;
                }
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    fn annotate_cast(&mut self, id: NodeId, result: DataType, lt: DataType, rt: DataType) {
        if lt == result && rt == result {
            return;
        }
        let implicit = lt.is_numeric() || lt == result;
        let implicit = implicit && (rt.is_numeric() || rt == result);
        let node = self.ast.node_mut(id);
        node.cast_type = result;
        node.implicit_cast = implicit;
    }

    fn visit_range(&mut self, id: NodeId) -> Result<(), TypeError> {
        let mut merged: Option<DataType> = None;
        let mut all_known = true;
        for slot in 0..3 {
            let Some(c) = self.ast.child(id, slot) else {
                continue;
            };
            match self.ast.data_type(c) {
                DataType::Unknown => all_known = false,
                t @ (DataType::Str | DataType::Cell | DataType::Func) => {
                    return Err(TypeError {
                        message: format!("a range over {} values is not supported", t.display()),
                        span: self.ast.node(id).span,
                    })
                }
                DataType::Dynamic => merged = Some(DataType::Dynamic),
                DataType::Real => {
                    if merged != Some(DataType::Dynamic) {
                        merged = Some(DataType::Real);
                    }
                }
                _ => merged = merged.or(Some(DataType::Int)),
            }
        }
        if all_known {
            if let Some(t) = merged {
                self.set(id, t)?;
            }
        }
        Ok(())
    }

    fn visit_call(&mut self, id: NodeId) -> Result<(), TypeError> {
        let callee = self.ast.child(id, 0).expect("callee");
        match self.ast.kind(callee) {
            NodeKind::FuncRef => {
                let func = self.ast.node(callee).target.expect("function target");
                let params: Vec<NodeId> = self.ast.list(self.ast.child(func, 1)).collect();
                let args: Vec<NodeId> = self.ast.list(self.ast.child(id, 1)).collect();
                for (&arg, &param) in args.iter().zip(params.iter()) {
                    self.tie(arg, param)?;
                }
                let outputs: Vec<NodeId> = self.ast.list(self.ast.child(func, 0)).collect();
                if let Some(&first) = outputs.first() {
                    let slot = self.ast.node(first).target.unwrap_or(first);
                    self.tie(id, slot)?;
                }
                Ok(())
            }
            NodeKind::BuiltinRef => {
                let name = node_name(self.ast, self.tokens, self.src, callee);
                match name {
                    "size" | "numel" | "length" => self.set(id, DataType::Int),
                    "zeros" | "ones" | "eye" => self.set(id, DataType::Real),
                    "disp" => self.set(id, DataType::Na),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    fn visit_multi_assign(&mut self, id: NodeId) -> Result<(), TypeError> {
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
                        self.tie(target, slot)?;
                    }
                }
                Ok(())
            }
            NodeKind::BuiltinRef => {
                let name = node_name(self.ast, self.tokens, self.src, callee);
                if name == "size" {
                    for &target in &targets {
                        if self.ast.kind(target) != NodeKind::IgnoredOutput {
                            self.set(target, DataType::Int)?;
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn scalar_literal_type(&self, id: NodeId) -> DataType {
        let Some(token) = self.ast.node(id).token else {
            return DataType::Real;
        };
        let text = self.tokens[token.0 as usize].text(self.src);
        if text.contains(['.', 'e', 'E']) {
            DataType::Real
        } else {
            DataType::Int
        }
    }
}

pub fn is_statement(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Root
            | NodeKind::Function
            | NodeKind::Assign
            | NodeKind::MultiAssign
            | NodeKind::If
            | NodeKind::ElseIf
            | NodeKind::Else
            | NodeKind::While
            | NodeKind::For
            | NodeKind::Parfor
            | NodeKind::Switch
            | NodeKind::Case
            | NodeKind::Otherwise
            | NodeKind::TryCatch
            | NodeKind::Global
            | NodeKind::Persistent
            | NodeKind::Spmd
            | NodeKind::OsCall
            | NodeKind::ExprStmt
            | NodeKind::CallStmt
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::Return
            | NodeKind::IgnoredOutput
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_promotes_and_concatenates() {
        assert_eq!(OpClass::Add.result(Int, Int), Some(Int));
        assert_eq!(OpClass::Add.result(Int, Real), Some(Real));
        assert_eq!(OpClass::Add.result(Bool, Bool), Some(Int));
        assert_eq!(OpClass::Add.result(Str, Str), Some(Str));
        assert_eq!(OpClass::Add.result(Char, Str), Some(Str));
        assert_eq!(OpClass::Add.result(Str, Int), None);
    }

    #[test]
    fn numeric_table_rejects_strings_and_cells() {
        assert_eq!(OpClass::Num.result(Str, Str), None);
        assert_eq!(OpClass::Num.result(DataType::Cell, Int), None);
        assert_eq!(OpClass::Num.result(Int, Real), Some(Real));
    }

    #[test]
    fn divides_are_real_over_numerics() {
        assert_eq!(OpClass::Div.result(Int, Int), Some(Real));
        assert_eq!(OpClass::Div.result(Bool, Real), Some(Real));
        assert_eq!(OpClass::Div.result(Str, Int), None);
    }

    #[test]
    fn single_operand_results() {
        assert_eq!(OpClass::Add.single(Str), Some(Str));
        assert_eq!(OpClass::Add.single(Real), Some(Real));
        assert_eq!(OpClass::Add.single(Int), None);
        assert_eq!(OpClass::Div.single(Int), Some(Real));
    }

    #[test]
    fn operand_back_propagation() {
        assert_eq!(OpClass::Add.operand(Real, Int), Some(Real));
        assert_eq!(OpClass::Add.operand(Str, Char), Some(Str));
        assert_eq!(OpClass::Add.operand(Int, Int), None);
    }
}
