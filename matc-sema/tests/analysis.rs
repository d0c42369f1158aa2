use matc_ast::{Ast, DataType, NodeId, NodeKind};
use matc_sema::{analyze, node_name, AnalyzeOptions};

#[derive(Debug)]
struct Analyzed {
    src: String,
    tokens: Vec<matc_lex::Token>,
    ast: Ast,
    root: NodeId,
}

fn run_with(src: &str, opts: AnalyzeOptions) -> Result<Analyzed, String> {
    let scanned = matc_lex::scan(src).map_err(|e| e.to_string())?;
    let parsed = matc_parse::Parser::new(src, &scanned.tokens, &scanned.summary)
        .parse_program()
        .map_err(|e| e.to_string())?;
    let mut ast = parsed.ast;
    analyze(&mut ast, parsed.root, &scanned.tokens, src, opts).map_err(|e| e.to_string())?;
    Ok(Analyzed {
        src: src.to_string(),
        tokens: scanned.tokens,
        ast,
        root: parsed.root,
    })
}

fn run(src: &str) -> Analyzed {
    run_with(src, AnalyzeOptions::default()).expect("analysis should succeed")
}

fn run_err(src: &str) -> String {
    run_with(src, AnalyzeOptions::default()).expect_err("expected an analysis error")
}

impl Analyzed {
    /// Declaration node of a variable in the root scope.
    fn var(&self, name: &str) -> NodeId {
        let mut symbol = self.ast.node(self.root).first_symbol;
        while let Some(id) = symbol {
            if node_name(&self.ast, &self.tokens, &self.src, id) == name {
                return id;
            }
            symbol = self.ast.node(id).symbol_link;
        }
        panic!("no variable `{name}` in the root scope");
    }

    fn shape(&self, id: NodeId) -> (Option<u32>, Option<u32>) {
        (self.ast.rows(id), self.ast.cols(id))
    }
}

#[test]
fn literal_matrix_and_access_shapes() {
    // A is 2x2; the colon keeps the rows and `end` picks one column.
    let a = run("A = [1 2; 3 4]; v = A(:, end)\n");
    assert_eq!(a.shape(a.var("A")), (Some(2), Some(2)));
    assert_eq!(a.ast.data_type(a.var("A")), DataType::Int);
    assert_eq!(a.shape(a.var("v")), (Some(2), Some(1)));
    assert_eq!(a.ast.data_type(a.var("v")), DataType::Int);
}

#[test]
fn matrix_multiply_infers_the_outer_shape() {
    let a = run("A = [1 2; 3 4]; B = [5; 6]; C = A * B\n");
    assert_eq!(a.shape(a.var("C")), (Some(2), Some(1)));
}

#[test]
fn matrix_multiply_rejects_mismatched_inner_dims() {
    let msg = run_err("A = [1 2; 3 4]; B = [5; 6; 7]; C = A * B\n");
    assert!(msg.contains("shape error"), "{msg}");
}

#[test]
fn transpose_flips_the_shape() {
    let a = run("A = [1 2 3]; B = A.'\n");
    assert_eq!(a.shape(a.var("B")), (Some(3), Some(1)));
}

#[test]
fn concatenation_adds_along_the_axis() {
    let a = run("A = [1 2]; B = [A 3]; C = [A; A]\n");
    assert_eq!(a.shape(a.var("B")), (Some(1), Some(3)));
    assert_eq!(a.shape(a.var("C")), (Some(2), Some(2)));
}

#[test]
fn broadcast_is_allowed_unless_mathematical() {
    let soft = run("A = [1 2; 3 4]; r = [1 2]; S = A + r\n");
    assert_eq!(soft.shape(soft.var("S")), (Some(2), Some(2)));

    let err = run_with(
        "A = [1 2; 3 4]; r = [1 2]; S = A + r\n",
        AnalyzeOptions {
            mathematical_notation: true,
            disallow_resizing: false,
        },
    )
    .expect_err("strict add should reject broadcast");
    assert!(err.contains("shape error"), "{err}");
}

#[test]
fn reassignment_with_a_new_shape_is_rejected() {
    let msg = run_err("x = [1 2]; x = [1 2 3]\n");
    assert!(msg.contains("resizing is not supported"), "{msg}");

    let fixed = run_with(
        "x = [1 2]; x = [1 2 3]\n",
        AnalyzeOptions {
            mathematical_notation: false,
            disallow_resizing: true,
        },
    )
    .expect_err("fixed shapes should reject the resize");
    assert!(fixed.contains("fixed at its first assignment"), "{fixed}");
}

#[test]
fn assignment_type_conflict_is_rejected() {
    let msg = run_err("x = 5; x = 'a'\n");
    assert!(msg.contains("type"), "{msg}");
}

#[test]
fn string_concatenation_promotes_chars() {
    let a = run("s = \"abc\"; t = s + 'd'\n");
    assert_eq!(a.ast.data_type(a.var("t")), DataType::Str);
}

#[test]
fn integer_division_is_real() {
    let a = run("x = 1 / 2\n");
    assert_eq!(a.ast.data_type(a.var("x")), DataType::Real);
}

#[test]
fn unary_minus_on_a_string_is_rejected() {
    let msg = run_err("s = \"abc\"; t = -s\n");
    assert!(msg.contains("unary minus"), "{msg}");
}

#[test]
fn cell_arithmetic_is_not_supported() {
    let msg = run_err("c = {1, 2}; d = c + 1\n");
    assert!(msg.contains("not yet supported"), "{msg}");
}

#[test]
fn cell_literals_count_slots() {
    let a = run("c = {1, [1 2 3]; 'ab', 4}\n");
    assert_eq!(a.shape(a.var("c")), (Some(2), Some(2)));
    assert_eq!(a.ast.data_type(a.var("c")), DataType::Cell);
}

#[test]
fn size_targets_are_integer_scalars() {
    let a = run("[r, ~] = size(eye(3))\n");
    assert_eq!(a.ast.data_type(a.var("r")), DataType::Int);
    assert_eq!(a.shape(a.var("r")), (Some(1), Some(1)));
}

#[test]
fn function_output_follows_its_input() {
    let a = run("x = [1 2; 3 4]; y = sq(x)\nfunction r = sq(m)\nr = m * m;\nend\n");
    assert_eq!(a.shape(a.var("y")), (Some(2), Some(2)));
    assert_eq!(a.ast.data_type(a.var("y")), DataType::Int);
}

#[test]
fn unknown_function_calls_are_rejected() {
    let msg = run_err("y = frobnicate(1)\n");
    assert!(msg.contains("unknown function"), "{msg}");
}

#[test]
fn builtins_resolve_for_free_names() {
    run("disp(3)\n");
}

#[test]
fn duplicate_function_names_cite_both_lines() {
    let msg = run_err("function f()\nend\nfunction f()\nend\n");
    assert!(msg.contains("duplicate function name"), "{msg}");
    assert!(msg.contains("line 1") && msg.contains("line 3"), "{msg}");
}

#[test]
fn duplicate_parameters_are_rejected() {
    let msg = run_err("function r = f(a, a)\nr = a;\nend\n");
    assert!(msg.contains("duplicate input parameter"), "{msg}");
}

#[test]
fn variadic_parameters_are_rejected() {
    let msg = run_err("function f(varargin)\nend\n");
    assert!(msg.contains("variadic"), "{msg}");
}

#[test]
fn global_and_persistent_are_rejected() {
    let msg = run_err("global x\n");
    assert!(msg.contains("global variables are not supported"), "{msg}");
    let msg = run_err("function f()\npersistent y\nend\n");
    assert!(msg.contains("persistent variables are not supported"), "{msg}");
}

#[test]
fn end_subscript_on_a_function_is_a_conflict() {
    let msg = run_err("y = f(end)\nfunction r = f(x)\nr = x;\nend\n");
    assert!(msg.contains("used as a function"), "{msg}");
}

#[test]
fn output_sharing_an_input_binds_the_same_slot() {
    let a = run("y = bump([1 2])\nfunction x = bump(x)\nx = x + 1;\nend\n");
    assert_eq!(a.shape(a.var("y")), (Some(1), Some(2)));
}

#[test]
fn every_identifier_leaf_is_resolved() {
    // After resolution no plain expression identifier remains in a script
    // without parameter lists; each became a variable reference, function
    // reference, or builtin reference.
    let a = run("a = 1; b = a + 2; disp(b)\n");
    let leftover = a
        .ast
        .ids()
        .filter(|&id| a.ast.kind(id) == NodeKind::Ident)
        .count();
    assert_eq!(leftover, 0);
}

#[test]
fn inference_reaches_a_fixed_point_on_loops() {
    let a = run("n = 0;\nfor i = 1:10\n n = n + i;\nend\n");
    assert_eq!(a.shape(a.var("n")), (Some(1), Some(1)));
    assert_eq!(a.ast.data_type(a.var("n")), DataType::Int);
}
