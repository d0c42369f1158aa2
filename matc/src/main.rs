#![forbid(unsafe_code)]

mod report;

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser as ClapParser;
use miette::{Diagnostic, IntoDiagnostic, NamedSource};

use matc_backend_cpp::{compute_predicates, emit_program, CppArtifacts, EmitOptions, Predicates};
use matc_parse::Parser;
use matc_sema::AnalyzeOptions;

use report::{write_report, PredicateReport, ScanCounts, TranslationReport};

#[derive(ClapParser, Debug)]
#[command(name = "matc", version, about = "matrix-script to C++17 translator")]
struct Cli {
    /// Input source file.
    input: PathBuf,

    /// Output path for the standalone program.
    #[arg(short, long)]
    output: PathBuf,

    /// Base name for the embeddable entry point, written next to the
    /// output.
    #[arg(long, default_value = "entry")]
    embed_base: String,

    /// Require exactly matching shapes for add/subtract; no broadcast.
    #[arg(long)]
    mathematical_notation: bool,

    /// Report a conflicting reassignment as a fixed-shape violation.
    #[arg(long)]
    disallow_resizing: bool,

    /// After the embedded script body runs, re-export updated base-scope
    /// variables into the host workspace.
    #[arg(long)]
    write_to_workspace: bool,

    /// Write a JSON translation report to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let src = fs::read_to_string(&cli.input).into_diagnostic()?;

    let mut rep = TranslationReport::new(&cli.input);
    match translate(&cli, &src, &mut rep) {
        Ok(artifacts) => {
            rep.ok = true;
            write_outputs(&cli, &artifacts)?;
            if let Some(path) = &cli.report {
                write_report(path, &rep)?;
            }
            Ok(())
        }
        Err(err) => {
            rep.error = Some(err.to_string());
            if let Some(path) = &cli.report {
                write_report(path, &rep)?;
            }
            Err(err)
        }
    }
}

fn translate(
    cli: &Cli,
    src: &str,
    rep: &mut TranslationReport,
) -> miette::Result<CppArtifacts> {
    let scanned = matc_lex::scan(src).map_err(|e| attach(e, &cli.input, src))?;
    rep.counts = Some(ScanCounts::from(&scanned.summary));

    let parsed = Parser::new(src, &scanned.tokens, &scanned.summary)
        .parse_program()
        .map_err(|e| attach(e, &cli.input, src))?;
    let mut ast = parsed.ast;

    matc_sema::analyze(
        &mut ast,
        parsed.root,
        &scanned.tokens,
        src,
        AnalyzeOptions {
            mathematical_notation: cli.mathematical_notation,
            disallow_resizing: cli.disallow_resizing,
        },
    )
    .map_err(|e| attach(e, &cli.input, src))?;

    let preds: Predicates = compute_predicates(&ast, parsed.root, parsed.has_ignored_outputs);
    rep.predicates = Some(PredicateReport::from(&preds));

    let artifacts = emit_program(
        src,
        &scanned.tokens,
        &scanned.summary,
        &ast,
        parsed.root,
        parsed.has_ignored_outputs,
        &EmitOptions {
            embed_base: &cli.embed_base,
            write_to_workspace: cli.write_to_workspace,
        },
    )
    .map_err(|e| attach(e, &cli.input, src))?;

    Ok(artifacts)
}

fn write_outputs(cli: &Cli, artifacts: &CppArtifacts) -> miette::Result<()> {
    fs::write(&cli.output, &artifacts.program).into_diagnostic()?;

    let dir = cli.output.parent().unwrap_or_else(|| Path::new("."));
    let embed_path = dir.join(format!("{}.cpp", cli.embed_base));
    fs::write(&embed_path, &artifacts.embed).into_diagnostic()?;

    // The help sidecar keeps the captured doc comment where the host
    // interpreter's help command finds it.
    if let Some(help) = &artifacts.help {
        let help_path = dir.join(format!("{}.m", cli.embed_base));
        fs::write(&help_path, help).into_diagnostic()?;
    }
    Ok(())
}

fn attach(
    error: impl Diagnostic + Send + Sync + 'static,
    path: &Path,
    src: &str,
) -> miette::Report {
    miette::Report::new(error)
        .with_source_code(NamedSource::new(path.display().to_string(), src.to_string()))
}
