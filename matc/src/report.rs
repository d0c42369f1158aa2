#![forbid(unsafe_code)]

use std::path::Path;

use matc_backend_cpp::Predicates;
use matc_lex::ScanSummary;
use miette::IntoDiagnostic;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TranslationReport {
    pub schema: &'static str,
    pub input: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<ScanCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicates: Option<PredicateReport>,
}

impl TranslationReport {
    pub fn new(input: &Path) -> Self {
        Self {
            schema: "matc/report@1",
            input: input.display().to_string(),
            ok: false,
            error: None,
            counts: None,
            predicates: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanCounts {
    pub functions: u32,
    pub open_keywords: u32,
    pub end_keywords: u32,
    pub identifiers: u32,
    pub globals: u32,
}

impl From<&ScanSummary> for ScanCounts {
    fn from(s: &ScanSummary) -> Self {
        Self {
            functions: s.num_functions,
            open_keywords: s.num_open_keywords,
            end_keywords: s.num_end_keywords,
            identifiers: s.num_idents,
            globals: s.num_globals,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredicateReport {
    pub has_dynamic: bool,
    pub has_matrices: bool,
    pub prints: bool,
    pub uses_system: bool,
    pub has_multi_output: bool,
    pub has_nested_functions: bool,
    pub has_ignored_outputs: bool,
}

impl From<&Predicates> for PredicateReport {
    fn from(p: &Predicates) -> Self {
        Self {
            has_dynamic: p.has_dynamic,
            has_matrices: p.has_matrices,
            prints: p.prints,
            uses_system: p.uses_system,
            has_multi_output: p.has_multi_output,
            has_nested_functions: p.has_nested_functions,
            has_ignored_outputs: p.has_ignored_outputs,
        }
    }
}

pub fn write_report(path: &Path, report: &TranslationReport) -> miette::Result<()> {
    let json = serde_json::to_string_pretty(report).into_diagnostic()?;
    std::fs::write(path, json).into_diagnostic()
}
