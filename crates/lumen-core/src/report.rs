use crate::model::{CheckResult, FailedTest, TestCase, TestOutcome};
use crate::paths::relative_key;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

pub const MAX_ERROR_MESSAGE_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed report {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ReportError {
    pub fn is_missing(&self) -> bool {
        matches!(self, ReportError::Missing(_))
    }
}

#[derive(Debug, Default, Deserialize)]
struct JsonReport {
    #[serde(default)]
    summary: JsonSummary,
    #[serde(default)]
    tests: Vec<JsonTest>,
}

#[derive(Debug, Default, Deserialize)]
struct JsonSummary {
    #[serde(default)]
    total: u32,
    #[serde(default)]
    passed: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    skipped: u32,
    #[serde(default)]
    error: u32,
}

#[derive(Debug, Deserialize)]
struct JsonTest {
    nodeid: String,
    outcome: String,
    #[serde(default)]
    setup: Option<JsonPhase>,
    #[serde(default)]
    call: Option<JsonPhase>,
}

#[derive(Debug, Deserialize)]
struct JsonPhase {
    #[serde(default)]
    longrepr: Option<serde_json::Value>,
}

impl JsonTest {
    fn outcome(&self) -> TestOutcome {
        match self.outcome.as_str() {
            "passed" | "xpassed" => TestOutcome::Passed,
            "failed" => TestOutcome::Failed,
            "error" => TestOutcome::Error,
            _ => TestOutcome::Skipped,
        }
    }

    fn file_path(&self) -> Option<String> {
        self.nodeid
            .split("::")
            .next()
            .filter(|path| !path.is_empty())
            .map(str::to_string)
    }

    fn longrepr(&self) -> Option<String> {
        let phase = self
            .call
            .as_ref()
            .and_then(|p| p.longrepr.as_ref())
            .or_else(|| self.setup.as_ref().and_then(|p| p.longrepr.as_ref()))?;
        let text = match phase {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Null => return None,
            other => other.to_string(),
        };
        Some(truncate_chars(&text, MAX_ERROR_MESSAGE_CHARS))
    }
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub fn parse_json_report(
    raw: &str,
    duration: f64,
    at: DateTime<Utc>,
) -> Result<CheckResult, serde_json::Error> {
    let report: JsonReport = serde_json::from_str(raw)?;
    let summary = &report.summary;
    let counted = summary
        .passed
        .saturating_add(summary.failed)
        .saturating_add(summary.skipped)
        .saturating_add(summary.error);

    let mut tests = Vec::with_capacity(report.tests.len());
    let mut failed_tests = Vec::new();
    for test in &report.tests {
        let outcome = test.outcome();
        if outcome.is_failing() {
            failed_tests.push(FailedTest {
                test_name: Some(test.nodeid.clone()),
                file_path: test.file_path(),
                error_message: test.longrepr(),
            });
        }
        tests.push(TestCase {
            name: test.nodeid.clone(),
            file_path: test.file_path(),
            outcome,
        });
    }

    Ok(CheckResult {
        total_tests: summary.total.max(counted),
        passed: summary.passed,
        failed: summary.failed,
        skipped: summary.skipped,
        errors: summary.error,
        duration,
        failed_tests,
        tests,
        ..CheckResult::empty(at)
    })
}

pub fn read_json_report(
    path: &Path,
    duration: f64,
    at: DateTime<Utc>,
) -> Result<CheckResult, ReportError> {
    let raw = read_report(path)?;
    parse_json_report(&raw, duration, at).map_err(|source| ReportError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coverage {
    pub overall: f64,
    pub files: BTreeMap<String, f64>,
}

impl Coverage {
    pub fn apply(self, result: &mut CheckResult) {
        result.coverage_percentage = self.overall;
        result.file_coverage = self.files;
    }
}

#[derive(Debug, Deserialize)]
struct CoverageDoc {
    #[serde(default)]
    totals: CoverageSummary,
    #[serde(default)]
    files: BTreeMap<String, CoverageFile>,
}

#[derive(Debug, Default, Deserialize)]
struct CoverageSummary {
    #[serde(default)]
    percent_covered: f64,
}

#[derive(Debug, Deserialize)]
struct CoverageFile {
    #[serde(default)]
    summary: CoverageSummary,
}

pub fn parse_coverage(raw: &str, root: &Path) -> Result<Coverage, serde_json::Error> {
    let doc: CoverageDoc = serde_json::from_str(raw)?;
    let files = doc
        .files
        .into_iter()
        .map(|(path, file)| {
            (
                relative_key(root, Path::new(&path)),
                round2(file.summary.percent_covered),
            )
        })
        .collect();
    Ok(Coverage {
        overall: round2(doc.totals.percent_covered),
        files,
    })
}

pub fn read_coverage(path: &Path, root: &Path) -> Result<Coverage, ReportError> {
    let raw = read_report(path)?;
    parse_coverage(&raw, root).map_err(|source| ReportError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn read_report(path: &Path) -> Result<String, ReportError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ReportError::Missing(path.to_path_buf())
        } else {
            ReportError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

pub fn remove_stale(path: &Path) -> Result<(), ReportError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ReportError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(\d+) (passed|failed|skipped|ignored|errors?)\b").expect("valid regex")
    })
}

fn failed_line_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // pytest short summary: FAILED tests/test_x.py::test_y - AssertionError
            Regex::new(r"(?m)^(?:FAILED|ERROR) (\S+)(?: - (.*))?$").expect("valid regex"),
            // cargo test: test module::name ... FAILED
            Regex::new(r"(?m)^test (\S+) \.\.\. FAILED\s*$").expect("valid regex"),
        ]
    })
}

pub fn parse_text_output(output: &str, duration: f64, at: DateTime<Utc>) -> CheckResult {
    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut skipped = 0u32;
    let mut errors = 0u32;
    for captures in summary_pattern().captures_iter(output) {
        let Ok(count) = captures[1].parse::<u32>() else {
            continue;
        };
        let slot = match &captures[2] {
            "passed" => &mut passed,
            "failed" => &mut failed,
            "skipped" | "ignored" => &mut skipped,
            _ => &mut errors,
        };
        *slot = slot.saturating_add(count);
    }

    let mut failed_tests = Vec::new();
    for pattern in failed_line_patterns() {
        for captures in pattern.captures_iter(output) {
            let name = captures[1].to_string();
            let file_path = name
                .split_once("::")
                .map(|(file, _)| file.to_string())
                .filter(|file| file.contains('.'));
            failed_tests.push(FailedTest {
                test_name: Some(name),
                file_path,
                error_message: captures
                    .get(2)
                    .map(|m| truncate_chars(m.as_str(), MAX_ERROR_MESSAGE_CHARS)),
            });
        }
    }

    CheckResult {
        total_tests: passed
            .saturating_add(failed)
            .saturating_add(skipped)
            .saturating_add(errors),
        passed,
        failed,
        skipped,
        errors,
        duration,
        failed_tests,
        ..CheckResult::empty(at)
    }
}
