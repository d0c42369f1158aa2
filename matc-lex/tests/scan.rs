use matc_lex::{scan, DelimiterStyle, TokenKind};

#[test]
fn apostrophe_after_value_is_conjugate_transpose() {
    let out = scan("A = [1 2]; B = [3 4]; C = A' * B'\n").expect("scan");
    let transposes = out
        .tokens
        .iter()
        .filter(|t| t.kind == TokenKind::CTranspose)
        .count();
    assert_eq!(transposes, 2);
    assert!(!out.tokens.iter().any(|t| t.kind == TokenKind::CharArray));
}

#[test]
fn apostrophe_at_value_start_opens_a_char_array() {
    let out = scan("s = 'hello'\n").expect("scan");
    let lit = out
        .tokens
        .iter()
        .find(|t| t.kind == TokenKind::CharArray)
        .expect("char-array literal");
    assert_eq!(lit.text("s = 'hello'\n"), "'hello'");
    assert!(!out.tokens.iter().any(|t| t.kind == TokenKind::CTranspose));
}

#[test]
fn doubled_quote_stays_inside_the_literal() {
    let src = "s = 'it''s'\n";
    let out = scan(src).expect("scan");
    let lit = out
        .tokens
        .iter()
        .find(|t| t.kind == TokenKind::CharArray)
        .expect("char-array literal");
    assert_eq!(lit.text(src), "'it''s'");
}

#[test]
fn crlf_is_one_newline_token() {
    let out = scan("a = 1\r\nb = 2\r\n").expect("scan");
    let newlines = out
        .tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Newline)
        .count();
    assert_eq!(newlines, 2);
}

#[test]
fn trailing_dot_does_not_join_the_number() {
    let src = "x = 10.*20\n";
    let out = scan(src).expect("scan");
    let kinds: Vec<TokenKind> = out.tokens.iter().map(|t| t.kind).collect();
    assert!(kinds.contains(&TokenKind::ElemMul));
    let scalars: Vec<&str> = out
        .tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Scalar)
        .map(|t| t.text(src))
        .collect();
    assert_eq!(scalars, vec!["10", "20"]);
}

#[test]
fn dot_prefixed_number_scans_as_scalar() {
    let src = "x = .5e-3\n";
    let out = scan(src).expect("scan");
    let lit = out
        .tokens
        .iter()
        .find(|t| t.kind == TokenKind::Scalar)
        .expect("scalar");
    assert_eq!(lit.text(src), ".5e-3");
}

#[test]
fn block_comments_nest() {
    let src = "%{\nouter\n%{\ninner\n%}\nstill outer\n%}\nx = 1\n";
    let out = scan(src).expect("scan");
    assert!(out.tokens.iter().any(|t| t.kind == TokenKind::BlockComment));
    assert!(out.tokens.iter().any(|t| t.kind == TokenKind::Ident));
}

#[test]
fn marker_with_trailing_code_is_a_line_comment() {
    // `%{` only opens a block when it is alone on its line.
    let src = "x = 1 %{ not a block\ny = 2\n";
    let out = scan(src).expect("scan");
    assert!(!out.tokens.iter().any(|t| t.kind == TokenKind::BlockComment));
}

#[test]
fn adjacent_commas_are_rejected() {
    let err = scan("f(1,,2)\n").expect_err("expected lex error");
    assert!(err.to_string().contains("adjacent commas"));
}

#[test]
fn unterminated_string_is_rejected() {
    let err = scan("s = 'oops\n").expect_err("expected lex error");
    assert!(err.to_string().contains("unterminated"));
}

#[test]
fn continuation_consumes_to_end_of_line() {
    let src = "x = 1 + ... carry on\n    2\n";
    let out = scan(src).expect("scan");
    assert!(out.tokens.iter().any(|t| t.kind == TokenKind::Continuation));
    // The continuation swallows its newline, so only the final line break
    // remains.
    let newlines = out
        .tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Newline)
        .count();
    assert_eq!(newlines, 1);
}

#[test]
fn os_call_takes_the_rest_of_the_line() {
    let src = "!ls -la\nx = 1\n";
    let out = scan(src).expect("scan");
    let cmd = out
        .tokens
        .iter()
        .find(|t| t.kind == TokenKind::OsCall)
        .expect("os-call token");
    assert_eq!(cmd.text(src), "!ls -la");
}

#[test]
fn script_blocks_balance_without_function_ends() {
    let out = scan("if x\n  y = 1;\nend\n").expect("scan");
    assert_eq!(out.summary.delimiter_style, DelimiterStyle::Open);
    assert_eq!(out.summary.num_open_keywords, 1);
    assert_eq!(out.summary.num_end_keywords, 1);
}

#[test]
fn terminated_functions_are_detected() {
    let out = scan("function r = f(x)\nr = x;\nend\n").expect("scan");
    assert_eq!(out.summary.delimiter_style, DelimiterStyle::Terminated);
    assert_eq!(out.summary.num_functions, 1);
}

#[test]
fn imbalanced_delimiters_are_a_fatal_input_error() {
    let err = scan("if x\ny = 1;\n").expect_err("expected lex error");
    assert!(err.to_string().contains("unbalanced"));
}

#[test]
fn index_end_does_not_count_as_a_block_closer() {
    let out = scan("if x\n  v = A(1, end);\nend\n").expect("scan");
    assert_eq!(out.summary.num_end_keywords, 1);
    assert_eq!(out.summary.delimiter_style, DelimiterStyle::Open);
}

#[test]
fn paren_balance_is_zero_at_end_of_file() {
    let out = scan("y = f(g(1), (2 + 3))\n").expect("scan");
    assert_eq!(out.summary.paren_balance, 0);
}

#[test]
fn ans_reference_is_noticed() {
    let with = scan("ans + 1\n").expect("scan");
    assert!(with.summary.saw_ans);
    let without = scan("x + 1\n").expect("scan");
    assert!(!without.summary.saw_ans);
}

#[test]
fn doc_preamble_is_captured() {
    let src = "function r = f(x)\n% F computes things.\n% Second line.\nr = x;\nend\n";
    let out = scan(src).expect("scan");
    let span = out.summary.doc_comment.expect("doc comment");
    let text = &src[span.offset()..span.offset() + span.len()];
    assert!(text.starts_with("% F computes"));
    assert!(text.ends_with("Second line."));
}

#[test]
fn token_spans_reproduce_the_source() {
    // Concatenating lexeme spans plus the gaps between them rebuilds the
    // input byte for byte.
    let src = "a = 1; % note\nif a\n  b = a' + [1 2; 3 4];\nend\n";
    let out = scan(src).expect("scan");
    let mut rebuilt = String::new();
    let mut cursor = 0usize;
    for t in &out.tokens {
        let start = t.span.offset();
        rebuilt.push_str(&src[cursor..start]);
        rebuilt.push_str(&src[start..start + t.span.len()]);
        cursor = start + t.span.len();
    }
    rebuilt.push_str(&src[cursor..]);
    assert_eq!(rebuilt, src);
}
