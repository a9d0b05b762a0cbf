use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const CHECKS_REGION: &str = "checks";

pub const MAX_BROADCAST_FAILURES: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RegionStatus {
    Offline,
    Healthy,
    Warning,
    Error,
}

impl Default for RegionStatus {
    fn default() -> Self {
        Self::Offline
    }
}

impl RegionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionStatus::Offline => "offline",
            RegionStatus::Healthy => "healthy",
            RegionStatus::Warning => "warning",
            RegionStatus::Error => "error",
        }
    }
}

impl fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub status: RegionStatus,
    pub coverage: f64,
    pub test_count: u32,
    pub passing_tests: u32,
    pub failing_tests: u32,
    pub file_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            status: RegionStatus::Offline,
            coverage: 0.0,
            test_count: 0,
            passing_tests: 0,
            failing_tests: 0,
            file_count: 0,
            last_modified: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Caution,
    Alert,
}

impl DiagnosticLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticLevel::Caution => "caution",
            DiagnosticLevel::Alert => "alert",
        }
    }
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub region: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl Diagnostic {
    pub fn alert(region: impl Into<String>, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            level: DiagnosticLevel::Alert,
            region: region.into(),
            message: message.into(),
            details: None,
            file_path: None,
            line_number: None,
            timestamp: at,
        }
    }

    pub fn caution(
        region: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            level: DiagnosticLevel::Caution,
            ..Self::alert(region, message, at)
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_file(mut self, file_path: Option<String>) -> Self {
        self.file_path = file_path;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub illumination: f64,
    pub regions: BTreeMap<String, Region>,
    pub diagnostics: Vec<Diagnostic>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub has_license: bool,
    #[serde(default)]
    pub has_readme: bool,
    #[serde(default)]
    pub documentation_complete: bool,
    #[serde(default)]
    pub api_configured: bool,
    #[serde(default)]
    pub integration_providers: u32,
}

impl HealthSnapshot {
    pub fn empty(project_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            illumination: 0.0,
            regions: BTreeMap::new(),
            diagnostics: Vec::new(),
            timestamp: at,
            project_name: project_name.into(),
            has_license: false,
            has_readme: false,
            documentation_complete: false,
            api_configured: false,
            integration_providers: 0,
        }
    }

    pub fn total_failing(&self) -> u32 {
        self.regions.values().map(|r| r.failing_tests).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedTest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestOutcome {
    pub fn is_failing(&self) -> bool {
        matches!(self, TestOutcome::Failed | TestOutcome::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub outcome: TestOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
    pub coverage_percentage: f64,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub failed_tests: Vec<FailedTest>,
    #[serde(skip)]
    pub tests: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_coverage: BTreeMap<String, f64>,
}

impl CheckResult {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            total_tests: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            errors: 0,
            coverage_percentage: 0.0,
            duration: 0.0,
            timestamp: at,
            failed_tests: Vec::new(),
            tests: Vec::new(),
            file_coverage: BTreeMap::new(),
        }
    }

    pub fn timed_out(timeout_secs: f64, at: DateTime<Utc>) -> Self {
        Self {
            total_tests: 1,
            failed: 1,
            errors: 1,
            duration: timeout_secs.max(0.0),
            failed_tests: vec![FailedTest {
                test_name: Some("check run".to_string()),
                file_path: None,
                error_message: Some(format!(
                    "check run timed out after {timeout_secs:.0}s and was killed"
                )),
            }],
            ..Self::empty(at)
        }
    }

    pub fn for_broadcast(&self) -> Self {
        let mut wire = self.clone();
        wire.tests = Vec::new();
        wire.failed_tests.truncate(MAX_BROADCAST_FAILURES);
        wire
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Modified => "modified",
            FileEventKind::Deleted => "deleted",
            FileEventKind::Moved => "moved",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    pub event_type: FileEventKind,
    pub file_path: String,
    pub is_test_file: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    RequestCheck,
    Refresh,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::RequestCheck => "request_check",
            CommandKind::Refresh => "refresh",
        }
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "request_check" | "run_tests" => Ok(CommandKind::RequestCheck),
            "refresh" | "refresh_status" => Ok(CommandKind::Refresh),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
