use matc_ast::{Ast, NodeId, NodeKind};
use matc_parse::{parse_source, ParseOutput};

fn parse(src: &str) -> ParseOutput {
    parse_source(src).expect("source should parse")
}

fn parse_err(src: &str) -> String {
    parse_source(src).expect_err("expected a parse error").to_string()
}

fn stmts(out: &ParseOutput) -> Vec<NodeId> {
    out.ast.list(out.ast.child(out.root, 0)).collect()
}

fn count_kind(ast: &Ast, kind: NodeKind) -> usize {
    ast.ids().filter(|&id| ast.kind(id) == kind).count()
}

#[test]
fn three_assignments_with_verbosity_bits() {
    let out = parse("a = 1; b = 2; c = a + b");
    let stmts = stmts(&out);
    assert_eq!(stmts.len(), 3);
    for &s in &stmts {
        assert_eq!(out.ast.kind(s), NodeKind::Assign);
    }
    assert!(!out.ast.node(stmts[0]).verbose);
    assert!(!out.ast.node(stmts[1]).verbose);
    assert!(out.ast.node(stmts[2]).verbose);
}

#[test]
fn trailing_comment_keeps_the_statement_verbose() {
    let out = parse("a = 1 % echoes\n");
    let stmts = stmts(&out);
    assert!(out.ast.node(stmts[0]).verbose);
}

#[test]
fn break_in_parfor_is_rejected() {
    let msg = parse_err("parfor i = 1:5\n disp(i)\n break\n end\n");
    assert!(msg.contains("break is not allowed in a parallel for-loop"), "{msg}");
}

#[test]
fn return_in_parfor_is_rejected() {
    let msg = parse_err("parfor i = 1:5\n return\n end\n");
    assert!(msg.contains("return is not allowed"), "{msg}");
}

#[test]
fn stepped_parfor_requires_a_unit_step() {
    let msg = parse_err("parfor i = 1:2:9\n disp(i)\n end\n");
    assert!(msg.contains("step must be 1"), "{msg}");
    parse("parfor i = 1:1:9\n disp(i)\n end\n");
}

#[test]
fn classdef_is_rejected() {
    let msg = parse_err("classdef Foo\nend\n");
    assert!(msg.contains("class definitions are not supported"), "{msg}");
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let msg = parse_err("break\n");
    assert!(msg.contains("break outside a loop"), "{msg}");
}

#[test]
fn persistent_outside_a_function_is_rejected() {
    let msg = parse_err("persistent x\n");
    assert!(msg.contains("outside a function"), "{msg}");
}

#[test]
fn colon_chains_left_associatively() {
    // a:b:c:d is ((a:b:c):d): a stepped range under a plain one.
    let out = parse("x = 1:2:3:4\n");
    let stmts = stmts(&out);
    let rhs = out.ast.child(stmts[0], 1).unwrap();
    assert_eq!(out.ast.kind(rhs), NodeKind::Range);
    assert!(out.ast.child(rhs, 2).is_none());
    let inner = out.ast.child(rhs, 0).unwrap();
    assert_eq!(out.ast.kind(inner), NodeKind::Range);
    assert!(out.ast.child(inner, 2).is_some());
}

#[test]
fn repeated_matrix_separators_collapse() {
    // [1,;;,;2] is a 2x1 matrix of 1 and 2.
    let out = parse("x = [1,;;,;2]\n");
    let stmts = stmts(&out);
    let rhs = out.ast.child(stmts[0], 1).unwrap();
    assert_eq!(out.ast.kind(rhs), NodeKind::Matrix);
    let spine = out.ast.child(rhs, 0).unwrap();
    assert_eq!(out.ast.kind(spine), NodeKind::VertCat);
    assert_eq!(count_kind(&out.ast, NodeKind::HorzCat), 0);
}

#[test]
fn empty_brackets_are_an_empty_matrix() {
    let out = parse("x = []\ny = {}\n");
    assert_eq!(count_kind(&out.ast, NodeKind::EmptyMatrix), 1);
    assert_eq!(count_kind(&out.ast, NodeKind::EmptyCell), 1);
}

#[test]
fn multi_assignment_converts_to_an_output_list() {
    let out = parse("[a, ~] = size(x)\n");
    let stmts = stmts(&out);
    assert_eq!(out.ast.kind(stmts[0]), NodeKind::MultiAssign);
    let outputs: Vec<NodeId> = out.ast.list(out.ast.child(stmts[0], 0)).collect();
    assert_eq!(outputs.len(), 2);
    assert_eq!(out.ast.kind(outputs[0]), NodeKind::Ident);
    assert_eq!(out.ast.kind(outputs[1]), NodeKind::IgnoredOutput);
    assert!(out.has_ignored_outputs);
}

#[test]
fn multi_assignment_rejects_non_identifier_outputs() {
    let msg = parse_err("[a + 1, b] = size(x)\n");
    assert!(msg.contains("identifiers or `~`"), "{msg}");
}

#[test]
fn multi_assignment_rhs_must_be_a_call() {
    let msg = parse_err("[a, b] = 1 + 2\n");
    assert!(msg.contains("must be a call"), "{msg}");
}

#[test]
fn end_inside_subscripts_is_the_index_sentinel() {
    let out = parse("A = [1 2; 3 4]; v = A(:, end)\n");
    assert_eq!(count_kind(&out.ast, NodeKind::EndIndex), 1);
    assert_eq!(count_kind(&out.ast, NodeKind::Colon), 1);
}

#[test]
fn ignored_output_requires_a_separator_context() {
    // `~` directly before an expression is logical not, which is not a
    // valid multi-assignment output.
    let msg = parse_err("[~ a] = size(x)\n");
    assert!(msg.contains("identifiers or `~`"), "{msg}");
}

#[test]
fn function_signatures_parse_in_all_forms() {
    let out = parse(
        "function noout()\nend\nfunction r = one(x)\nr = x;\nend\nfunction [p, q] = two(a, b)\np = a;\nq = b;\nend\n",
    );
    let stmts = stmts(&out);
    assert_eq!(stmts.len(), 3);
    let outputs: Vec<usize> = stmts
        .iter()
        .map(|&f| out.ast.list_len(out.ast.child(f, 0)))
        .collect();
    assert_eq!(outputs, vec![0, 1, 2]);
}

#[test]
fn open_style_functions_run_to_the_next_definition() {
    let out = parse("function a()\nx = 1;\nfunction b()\ny = 2;\n");
    let stmts = stmts(&out);
    assert_eq!(stmts.len(), 2);
    for &f in &stmts {
        assert_eq!(out.ast.kind(f), NodeKind::Function);
    }
}

#[test]
fn nested_functions_stay_inside_their_parent() {
    let out = parse("function outer()\nx = 1;\nfunction inner()\ny = 2;\nend\nend\n");
    let stmts = stmts(&out);
    assert_eq!(stmts.len(), 1);
    let body: Vec<NodeId> = out.ast.list(out.ast.child(stmts[0], 2)).collect();
    assert!(body
        .iter()
        .any(|&s| out.ast.kind(s) == NodeKind::Function));
}

#[test]
fn lambdas_and_handles_parse() {
    let out = parse("f = @(a, b) a + b; g = @disp\n");
    assert_eq!(count_kind(&out.ast, NodeKind::Lambda), 1);
    assert_eq!(count_kind(&out.ast, NodeKind::FuncHandle), 1);
}

#[test]
fn switch_arms_chain() {
    let out = parse("switch x\ncase 1\ny = 1;\ncase 2\ny = 2;\notherwise\ny = 0;\nend\n");
    let stmts = stmts(&out);
    assert_eq!(out.ast.kind(stmts[0]), NodeKind::Switch);
    let arms: Vec<NodeId> = out.ast.list(out.ast.child(stmts[0], 1)).collect();
    assert_eq!(arms.len(), 3);
    assert_eq!(out.ast.kind(arms[2]), NodeKind::Otherwise);
}

#[test]
fn try_catch_with_binding_parses() {
    let out = parse("try\nx = 1;\ncatch err\ny = 2;\nend\n");
    let stmts = stmts(&out);
    assert_eq!(out.ast.kind(stmts[0]), NodeKind::TryCatch);
    assert!(out.ast.child(stmts[0], 1).is_some());
}

#[test]
fn sibling_lists_terminate() {
    // Every list chain must reach NONE in finitely many steps.
    let out = parse("a = 1; b = 2; c = 3\nif a\nd = 4;\nend\n");
    for id in out.ast.ids() {
        let mut steps = 0usize;
        let mut next = out.ast.node(id).list_link;
        while let Some(n) = next {
            next = out.ast.node(n).list_link;
            steps += 1;
            assert!(steps <= out.ast.len(), "cycle in sibling links");
        }
    }
}
