use matc_backend_cpp::{emit_program, CppArtifacts, EmitOptions};
use matc_sema::AnalyzeOptions;

fn emit(src: &str) -> CppArtifacts {
    emit_with(src, false)
}

fn emit_with(src: &str, write_to_workspace: bool) -> CppArtifacts {
    let scanned = matc_lex::scan(src).expect("scan");
    let parsed = matc_parse::Parser::new(src, &scanned.tokens, &scanned.summary)
        .parse_program()
        .expect("parse");
    let mut ast = parsed.ast;
    matc_sema::analyze(
        &mut ast,
        parsed.root,
        &scanned.tokens,
        src,
        AnalyzeOptions::default(),
    )
    .expect("analyze");
    emit_program(
        src,
        &scanned.tokens,
        &scanned.summary,
        &ast,
        parsed.root,
        parsed.has_ignored_outputs,
        &EmitOptions {
            embed_base: "entry",
            write_to_workspace,
        },
    )
    .expect("emit")
}

#[test]
fn verbose_assignment_echoes_the_target() {
    let out = emit("a = 1; b = 2; c = a + b");
    assert!(out.program.contains("int a{};"), "{}", out.program);
    assert!(out.program.contains("c = a + b;"), "{}", out.program);
    assert!(out.program.contains("rt::echo(\"c\", c);"), "{}", out.program);
    assert!(!out.program.contains("rt::echo(\"a\""), "{}", out.program);
    assert!(out.program.contains("int main()"), "{}", out.program);
}

#[test]
fn a_single_output_function_returns_its_element_type() {
    let out = emit("function r = sq(x)\nr = x * x;\nend\n");
    assert!(
        out.program.contains("DynamicType sq(const DynamicType& x)"),
        "{}",
        out.program
    );
    assert!(out.program.contains("return r;"), "{}", out.program);
    assert!(!out.program.contains("std::tuple"), "{}", out.program);
}

#[test]
fn ignored_outputs_bind_to_the_sink() {
    let out = emit("[a, ~] = size(eye(3))\n");
    assert!(
        out.program
            .contains("std::tie(a, rt::sink()) = rt::size2(rt::eye(3));"),
        "{}",
        out.program
    );
    assert!(out.program.contains("rt::echo(\"a\", a);"), "{}", out.program);
}

#[test]
fn multi_output_functions_return_tuples() {
    let out = emit(
        "[p, q] = pair(3);\nfunction [a, b] = pair(x)\na = x;\nb = x + 1;\nend\n",
    );
    assert!(out.program.contains("std::tuple<int, int>"), "{}", out.program);
    assert!(out.program.contains("std::tie(p, q) = pair(3);"), "{}", out.program);
    assert!(
        out.program.contains("return std::make_tuple(a, b);"),
        "{}",
        out.program
    );
}

#[test]
fn parallel_for_gets_the_pragma() {
    let out = emit("parfor i = 1:5\n disp(i)\n end\n");
    assert!(
        out.program.contains("#pragma omp parallel for"),
        "{}",
        out.program
    );
    assert!(out.program.contains("i <= 5"), "{}", out.program);
}

#[test]
fn spmd_blocks_get_a_parallel_region() {
    let out = emit("spmd\n disp(1)\n end\n");
    assert!(out.program.contains("#pragma omp parallel"), "{}", out.program);
}

#[test]
fn os_calls_go_through_system() {
    let out = emit("!echo hi\n");
    assert!(
        out.program.contains("std::system(\"echo hi\");"),
        "{}",
        out.program
    );
    assert!(out.program.contains("#include <cstdlib>"), "{}", out.program);
}

#[test]
fn matrix_literals_emit_as_initializers() {
    let out = emit("A = [1 2; 3 4];\n");
    assert!(
        out.program.contains("A = Matrix<int>{{1, 2}, {3, 4}};"),
        "{}",
        out.program
    );
    assert!(out.program.contains("Matrix<int> A{};"), "{}", out.program);
}

#[test]
fn matrix_access_uses_call_syntax() {
    let out = emit("A = [1 2; 3 4]; v = A(:, end);\n");
    assert!(
        out.program.contains("v = A(rt::all(), rt::end());"),
        "{}",
        out.program
    );
}

#[test]
fn nested_functions_become_reference_closures() {
    let out = emit(
        "function r = outer(x)\nr = helper(x);\nfunction h = helper(y)\nh = y + 1;\nend\nend\n",
    );
    assert!(out.program.contains("std::function<"), "{}", out.program);
    assert!(out.program.contains("= [&]("), "{}", out.program);
    assert!(out.program.contains("#include <functional>"), "{}", out.program);
}

#[test]
fn later_functions_get_internal_linkage() {
    let out = emit(
        "function main_one()\nhelper_two()\nend\nfunction helper_two()\nend\n",
    );
    assert!(out.program.contains("namespace {"), "{}", out.program);
}

#[test]
fn the_doc_comment_heads_the_program_and_the_sidecar() {
    let out = emit("% Adds one to its input.\n% Nothing else.\nx = 1 + 1;\n");
    assert!(
        out.program.starts_with("// Adds one to its input."),
        "{}",
        out.program
    );
    let help = out.help.expect("help sidecar");
    assert!(help.contains("% Adds one to its input."));
}

#[test]
fn scripts_without_doc_comments_have_no_sidecar() {
    let out = emit("x = 1;\n");
    assert!(out.help.is_none());
}

#[test]
fn the_embeddable_entry_wraps_the_leading_function() {
    let out = emit("function r = sq(x)\nr = x * x;\nend\n");
    assert!(
        out.embed.contains("extern \"C\" int entry_entry("),
        "{}",
        out.embed
    );
    assert!(out.embed.contains("rt::arg<DynamicType>(prhs, nargin, 0)"), "{}", out.embed);
    assert!(out.embed.contains("rt::ret(plhs, nargout, 0, result_);"), "{}", out.embed);
}

#[test]
fn the_embedded_script_can_reexport_its_workspace() {
    let out = emit_with("x = 1; y = x + 1;\n", true);
    assert!(
        out.embed.contains("rt::workspace_set(\"x\", x);"),
        "{}",
        out.embed
    );
    assert!(
        out.embed.contains("rt::workspace_set(\"y\", y);"),
        "{}",
        out.embed
    );

    let silent = emit_with("x = 1; y = x + 1;\n", false);
    assert!(!silent.embed.contains("workspace_set"), "{}", silent.embed);
}

#[test]
fn naked_expression_statements_echo_ans_only_when_referenced() {
    let with_ans = emit("1 + 2\nans\n");
    assert!(
        with_ans.program.contains("rt::echo(\"ans\", ans);"),
        "{}",
        with_ans.program
    );

    let without = emit("x = 1;\nx + 2\n");
    assert!(
        without.program.contains("rt::echo(\"ans\", x + 2);"),
        "{}",
        without.program
    );
}
