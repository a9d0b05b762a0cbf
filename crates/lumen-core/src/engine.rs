use crate::model::{CheckResult, Diagnostic, HealthSnapshot, Region, RegionStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const WEIGHT_COVERAGE: f64 = 0.35;
pub const WEIGHT_MODULE_COMPLETION: f64 = 0.25;
pub const WEIGHT_DOCUMENTATION: f64 = 0.15;
pub const WEIGHT_INTEGRATION: f64 = 0.15;
pub const WEIGHT_PRODUCTION_READY: f64 = 0.10;

pub const LOW_COVERAGE_THRESHOLD: f64 = 50.0;
pub const PRODUCTION_COVERAGE_THRESHOLD: f64 = 80.0;
pub const DOCUMENTATION_COMPLETE_THRESHOLD: f64 = 80.0;

const DEFAULT_REGION_RULES: &[(&str, &str)] = &[
    ("src/", "core-logic"),
    ("crates/", "core-logic"),
    ("lib/", "core-logic"),
    ("src/components/", "ui-components"),
    ("web/", "ui-components"),
    ("ui/", "ui-components"),
    ("frontend/", "ui-components"),
    ("src/models/", "data-layer"),
    ("schemas/", "data-layer"),
    ("migrations/", "data-layer"),
    ("tests/", "tests"),
    ("docs/", "documentation"),
];
const DEFAULT_TEST_REGION: &str = "tests";

/// Fixed mapping from project-relative path prefix to region name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMap {
    rules: Vec<(String, String)>,
    regions: Vec<String>,
    fallback_test_region: String,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new(
            DEFAULT_REGION_RULES
                .iter()
                .map(|(prefix, region)| (prefix.to_string(), region.to_string())),
            DEFAULT_TEST_REGION,
        )
    }
}

impl RegionMap {
    pub fn new(
        rules: impl IntoIterator<Item = (String, String)>,
        fallback_test_region: impl Into<String>,
    ) -> Self {
        let fallback_test_region = fallback_test_region.into();
        let mut regions: Vec<String> = Vec::new();
        let mut normalized = Vec::new();
        for (prefix, region) in rules {
            if !regions.contains(&region) {
                regions.push(region.clone());
            }
            normalized.push((normalize_path(&prefix), region));
        }
        if !regions.contains(&fallback_test_region) {
            regions.push(fallback_test_region.clone());
        }
        Self {
            rules: normalized,
            regions,
            fallback_test_region,
        }
    }

    pub fn parse_rule(input: &str) -> Result<(String, String), String> {
        let (prefix, region) = input
            .split_once('=')
            .ok_or_else(|| format!("expected prefix=region, got '{input}'"))?;
        let prefix = prefix.trim();
        let region = region.trim();
        if prefix.is_empty() || region.is_empty() {
            return Err(format!("expected prefix=region, got '{input}'"));
        }
        Ok((prefix.to_string(), region.to_string()))
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn fallback_test_region(&self) -> &str {
        &self.fallback_test_region
    }

    pub fn region_for(&self, path: &str) -> Option<&str> {
        let path = normalize_path(path);
        self.rules
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, region)| region.as_str())
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStats {
    pub count: u32,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileStats {
    pub fn count(count: u32) -> Self {
        Self {
            count,
            last_modified: None,
        }
    }
}

pub type FileCounts = BTreeMap<String, FileStats>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticFacts {
    pub project_name: String,
    pub has_license: bool,
    pub has_readme: bool,
    pub documentation_score: f64,
    pub api_configured: bool,
    pub integration_providers: u32,
    pub config_files_present: u32,
    pub config_files_expected: u32,
}

impl StaticFacts {
    pub fn documentation_complete(&self) -> bool {
        clamp_percent(self.documentation_score) >= DOCUMENTATION_COMPLETE_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthTerms {
    pub coverage: f64,
    pub module_completion: f64,
    pub documentation: f64,
    pub integration: f64,
    pub production_ready: bool,
}

impl HealthTerms {
    pub fn illumination(&self) -> f64 {
        let bonus = if self.production_ready { 100.0 } else { 0.0 };
        let weighted = clamp_percent(self.coverage) * WEIGHT_COVERAGE
            + clamp_percent(self.module_completion) * WEIGHT_MODULE_COMPLETION
            + clamp_percent(self.documentation) * WEIGHT_DOCUMENTATION
            + clamp_percent(self.integration) * WEIGHT_INTEGRATION
            + bonus * WEIGHT_PRODUCTION_READY;
        clamp_unit(weighted / 100.0)
    }
}

pub fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn compute_now(
    check: &CheckResult,
    facts: &StaticFacts,
    files: &FileCounts,
    map: &RegionMap,
) -> HealthSnapshot {
    compute(check, facts, files, map, Utc::now())
}

pub fn compute(
    check: &CheckResult,
    facts: &StaticFacts,
    files: &FileCounts,
    map: &RegionMap,
    now: DateTime<Utc>,
) -> HealthSnapshot {
    let tallies = build_regions(check, files, map);
    let diagnostics = build_diagnostics(check, &tallies, map, now);
    let regions: BTreeMap<String, Region> = tallies
        .into_iter()
        .map(|(name, tally)| (name, tally.region))
        .collect();
    HealthSnapshot {
        illumination: health_terms(&regions, facts).illumination(),
        regions,
        diagnostics,
        timestamp: now,
        project_name: facts.project_name.clone(),
        has_license: facts.has_license,
        has_readme: facts.has_readme,
        documentation_complete: facts.documentation_complete(),
        api_configured: facts.api_configured,
        integration_providers: facts.integration_providers,
    }
}

struct RegionTally {
    region: Region,
    first_failing_file: Option<String>,
}

#[derive(Default)]
struct TestTally {
    tests: u32,
    passing: u32,
    failing: u32,
    first_failing_file: Option<String>,
}

fn build_regions(
    check: &CheckResult,
    files: &FileCounts,
    map: &RegionMap,
) -> BTreeMap<String, RegionTally> {
    let tests = tally_tests(check, map);
    let coverage = tally_coverage(check, map);
    let overall_coverage = clamp_percent(check.coverage_percentage);

    let mut regions = BTreeMap::new();
    for name in map.regions() {
        let stats = files.get(name).copied().unwrap_or_default();
        let tally = tests.get(name);
        let test_count = tally.map(|t| t.tests).unwrap_or(0);
        let failing = tally.map(|t| t.failing).unwrap_or(0).min(test_count);
        let passing = tally
            .map(|t| t.passing)
            .unwrap_or(0)
            .min(test_count - failing);
        let populated = stats.count > 0 || test_count > 0;
        let coverage = match coverage.get(name) {
            Some(mean) => clamp_percent(*mean),
            None if populated => overall_coverage,
            None => 0.0,
        };
        let status = if !populated {
            RegionStatus::Offline
        } else if failing > 0 {
            RegionStatus::Error
        } else if coverage < LOW_COVERAGE_THRESHOLD {
            RegionStatus::Warning
        } else {
            RegionStatus::Healthy
        };
        regions.insert(
            name.clone(),
            RegionTally {
                region: Region {
                    status,
                    coverage,
                    test_count,
                    passing_tests: passing,
                    failing_tests: failing,
                    file_count: stats.count,
                    last_modified: stats.last_modified,
                },
                first_failing_file: tally.and_then(|t| t.first_failing_file.clone()),
            },
        );
    }
    regions
}

fn tally_tests(check: &CheckResult, map: &RegionMap) -> BTreeMap<String, TestTally> {
    let mut tallies: BTreeMap<String, TestTally> = BTreeMap::new();
    if check.tests.is_empty() {
        let entry = tallies
            .entry(map.fallback_test_region().to_string())
            .or_default();
        entry.tests = check.total_tests;
        entry.passing = check.passed;
        entry.failing = check.failed.saturating_add(check.errors);
        entry.first_failing_file = check
            .failed_tests
            .iter()
            .find_map(|failed| failed.file_path.clone());
        return tallies;
    }
    for case in &check.tests {
        let region = case
            .file_path
            .as_deref()
            .and_then(|path| map.region_for(path))
            .unwrap_or_else(|| map.fallback_test_region());
        let entry = tallies.entry(region.to_string()).or_default();
        entry.tests = entry.tests.saturating_add(1);
        if case.outcome.is_failing() {
            entry.failing = entry.failing.saturating_add(1);
            if entry.first_failing_file.is_none() {
                entry.first_failing_file = case.file_path.clone();
            }
        } else if case.outcome == crate::model::TestOutcome::Passed {
            entry.passing = entry.passing.saturating_add(1);
        }
    }
    tallies
}

fn tally_coverage(check: &CheckResult, map: &RegionMap) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
    for (path, percent) in &check.file_coverage {
        let Some(region) = map.region_for(path) else {
            continue;
        };
        let entry = sums.entry(region.to_string()).or_insert((0.0, 0));
        entry.0 += clamp_percent(*percent);
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(region, (sum, n))| (region, sum / f64::from(n.max(1))))
        .collect()
}

pub fn health_terms(regions: &BTreeMap<String, Region>, facts: &StaticFacts) -> HealthTerms {
    let live: Vec<&Region> = regions
        .values()
        .filter(|region| region.status != RegionStatus::Offline)
        .collect();
    let coverage = if live.is_empty() {
        0.0
    } else {
        clamp_percent(live.iter().map(|region| region.coverage).sum::<f64>() / live.len() as f64)
    };

    let populated = regions.values().filter(|region| region.file_count > 0).count();
    let region_share = if regions.is_empty() {
        0.0
    } else {
        populated as f64 / regions.len() as f64
    };
    let config_share = if facts.config_files_expected == 0 {
        0.0
    } else {
        f64::from(facts.config_files_present.min(facts.config_files_expected))
            / f64::from(facts.config_files_expected)
    };
    let module_completion = clamp_percent(region_share * 80.0 + config_share * 20.0);

    let documentation = clamp_percent(facts.documentation_score);

    let mut integration = 0.0;
    if facts.api_configured {
        integration += 50.0;
    }
    integration += (f64::from(facts.integration_providers) * 15.0).min(50.0);
    let integration = clamp_percent(integration);

    let tests: u64 = regions.values().map(|region| u64::from(region.test_count)).sum();
    let none_failing = regions.values().all(|region| region.failing_tests == 0);
    let production_ready = tests > 0
        && none_failing
        && coverage >= PRODUCTION_COVERAGE_THRESHOLD
        && facts.documentation_complete();

    HealthTerms {
        coverage,
        module_completion,
        documentation,
        integration,
        production_ready,
    }
}

fn build_diagnostics(
    check: &CheckResult,
    regions: &BTreeMap<String, RegionTally>,
    map: &RegionMap,
    now: DateTime<Utc>,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (name, tally) in regions {
        let region = &tally.region;
        if region.failing_tests > 0 {
            diagnostics.push(
                Diagnostic::alert(
                    name.clone(),
                    format!("{} failing test(s) in {name}", region.failing_tests),
                    now,
                )
                .with_details(failure_details(check, name, map))
                .with_file(tally.first_failing_file.clone()),
            );
        } else if region.status != RegionStatus::Offline
            && region.coverage < LOW_COVERAGE_THRESHOLD
        {
            diagnostics.push(
                Diagnostic::caution(
                    name.clone(),
                    format!("Low test coverage in {name} ({:.1}%)", region.coverage),
                    now,
                )
                .with_details(format!(
                    "Coverage is below {LOW_COVERAGE_THRESHOLD:.0}%. Aim for at least {PRODUCTION_COVERAGE_THRESHOLD:.0}%."
                )),
            );
        }
    }
    diagnostics
}

fn failure_details(check: &CheckResult, region: &str, map: &RegionMap) -> String {
    let in_region = |path: Option<&str>| {
        path.and_then(|p| map.region_for(p))
            .unwrap_or_else(|| map.fallback_test_region())
            == region
    };
    let names: Vec<&str> = check
        .failed_tests
        .iter()
        .filter(|failed| in_region(failed.file_path.as_deref()))
        .filter_map(|failed| failed.test_name.as_deref())
        .take(3)
        .collect();
    if names.is_empty() {
        "Tests must pass before the project is production ready.".to_string()
    } else {
        format!("Failing: {}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiagnosticLevel, FailedTest, TestCase, TestOutcome};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_707_335_222_000)
            .single()
            .expect("valid ts")
    }

    fn check(total: u32, passed: u32, failed: u32, coverage: f64) -> CheckResult {
        CheckResult {
            total_tests: total,
            passed,
            failed,
            coverage_percentage: coverage,
            ..CheckResult::empty(at())
        }
    }

    fn all_regions_populated(map: &RegionMap) -> FileCounts {
        map.regions()
            .iter()
            .map(|name| (name.clone(), FileStats::count(4)))
            .collect()
    }

    fn complete_facts() -> StaticFacts {
        StaticFacts {
            project_name: "demo".to_string(),
            has_license: true,
            has_readme: true,
            documentation_score: 100.0,
            api_configured: true,
            integration_providers: 4,
            config_files_present: 2,
            config_files_expected: 2,
        }
    }

    #[test]
    fn region_map_prefers_longest_prefix() {
        let map = RegionMap::default();
        assert_eq!(map.region_for("src/lib.rs"), Some("core-logic"));
        assert_eq!(map.region_for("src/components/Brain.tsx"), Some("ui-components"));
        assert_eq!(map.region_for("./tests/test_api.py"), Some("tests"));
        assert_eq!(map.region_for("README.md"), None);
        assert_eq!(map.fallback_test_region(), "tests");
        assert!(map.regions().contains(&"documentation".to_string()));
    }

    #[test]
    fn parse_rule_requires_both_sides() {
        assert_eq!(
            RegionMap::parse_rule("app/=frontend"),
            Ok(("app/".to_string(), "frontend".to_string()))
        );
        assert!(RegionMap::parse_rule("app/").is_err());
        assert!(RegionMap::parse_rule("=frontend").is_err());
    }

    #[test]
    fn empty_project_is_dark_and_quiet() {
        let map = RegionMap::default();
        let snapshot = compute(
            &CheckResult::empty(at()),
            &StaticFacts::default(),
            &FileCounts::new(),
            &map,
            at(),
        );
        assert_eq!(snapshot.illumination, 0.0);
        assert_eq!(snapshot.regions.len(), map.regions().len());
        assert!(snapshot
            .regions
            .values()
            .all(|region| region.status == RegionStatus::Offline));
        assert!(snapshot.diagnostics.is_empty());
        assert!(!snapshot.has_license);
        assert!(!snapshot.has_readme);
    }

    #[test]
    fn fully_healthy_project_reaches_full_illumination() {
        let map = RegionMap::default();
        let snapshot = compute(
            &check(10, 10, 0, 100.0),
            &complete_facts(),
            &all_regions_populated(&map),
            &map,
            at(),
        );
        assert!((snapshot.illumination - 1.0).abs() < 1e-9);
        assert!(snapshot.diagnostics.is_empty());
        assert!(snapshot.documentation_complete);

        let terms = health_terms(&snapshot.regions, &complete_facts());
        assert!(terms.production_ready);
    }

    #[test]
    fn bonus_withheld_when_documentation_incomplete() {
        let map = RegionMap::default();
        let facts = StaticFacts {
            documentation_score: 70.0,
            ..complete_facts()
        };
        let snapshot = compute(
            &check(10, 10, 0, 100.0),
            &facts,
            &all_regions_populated(&map),
            &map,
            at(),
        );
        let expected = (100.0 * 0.35 + 100.0 * 0.25 + 70.0 * 0.15 + 100.0 * 0.15) / 100.0;
        assert!((snapshot.illumination - expected).abs() < 1e-9);
    }

    #[test]
    fn failing_region_raises_single_alert() {
        let map = RegionMap::default();
        let mut result = check(10, 7, 3, 60.0);
        result.tests = (0..10)
            .map(|i| TestCase {
                name: format!("tests/test_api.py::test_{i}"),
                file_path: Some("tests/test_api.py".to_string()),
                outcome: if i < 3 {
                    TestOutcome::Failed
                } else {
                    TestOutcome::Passed
                },
            })
            .collect();
        result.failed_tests = vec![FailedTest {
            test_name: Some("tests/test_api.py::test_0".to_string()),
            file_path: Some("tests/test_api.py".to_string()),
            error_message: Some("assert 1 == 2".to_string()),
        }];
        let mut files = FileCounts::new();
        files.insert("tests".to_string(), FileStats::count(3));
        files.insert("core-logic".to_string(), FileStats::count(8));

        let snapshot = compute(&result, &complete_facts(), &files, &map, at());
        let tests = &snapshot.regions["tests"];
        assert_eq!(tests.status, RegionStatus::Error);
        assert_eq!(tests.test_count, 10);
        assert_eq!(tests.failing_tests, 3);
        assert_eq!(tests.passing_tests, 7);
        assert_eq!(snapshot.regions["core-logic"].status, RegionStatus::Healthy);

        let for_tests: Vec<_> = snapshot
            .diagnostics
            .iter()
            .filter(|d| d.region == "tests")
            .collect();
        assert_eq!(for_tests.len(), 1);
        assert_eq!(for_tests[0].level, DiagnosticLevel::Alert);
        assert!(for_tests[0].message.contains('3'));
        assert!(for_tests[0].message.contains("tests"));
        assert_eq!(for_tests[0].file_path.as_deref(), Some("tests/test_api.py"));
        assert_eq!(snapshot.diagnostics.len(), 1);
    }

    #[test]
    fn alert_suppresses_low_coverage_caution() {
        let map = RegionMap::default();
        let mut files = FileCounts::new();
        files.insert("tests".to_string(), FileStats::count(2));
        files.insert("core-logic".to_string(), FileStats::count(2));
        let snapshot = compute(
            &check(4, 2, 2, 20.0),
            &StaticFacts::default(),
            &files,
            &map,
            at(),
        );
        let levels: Vec<_> = snapshot
            .diagnostics
            .iter()
            .map(|d| (d.region.as_str(), d.level))
            .collect();
        assert_eq!(
            levels,
            vec![
                ("core-logic", DiagnosticLevel::Caution),
                ("tests", DiagnosticLevel::Alert),
            ]
        );
        assert_eq!(snapshot.regions["core-logic"].status, RegionStatus::Warning);
    }

    #[test]
    fn file_coverage_is_attributed_per_region() {
        let map = RegionMap::default();
        let mut result = check(2, 2, 0, 70.0);
        result
            .file_coverage
            .insert("src/lib.rs".to_string(), 90.0);
        result
            .file_coverage
            .insert("src/engine.rs".to_string(), 70.0);
        result
            .file_coverage
            .insert("web/app.ts".to_string(), 10.0);
        let mut files = FileCounts::new();
        files.insert("core-logic".to_string(), FileStats::count(2));
        files.insert("ui-components".to_string(), FileStats::count(1));
        files.insert("tests".to_string(), FileStats::count(1));

        let snapshot = compute(&result, &StaticFacts::default(), &files, &map, at());
        assert!((snapshot.regions["core-logic"].coverage - 80.0).abs() < 1e-9);
        assert_eq!(snapshot.regions["ui-components"].status, RegionStatus::Warning);
        assert!((snapshot.regions["tests"].coverage - 70.0).abs() < 1e-9);
    }

    #[test]
    fn outputs_stay_bounded_for_hostile_inputs() {
        let map = RegionMap::default();
        let hostile = [
            check(0, 0, 0, f64::NAN),
            check(0, 0, 5, f64::INFINITY),
            check(3, 10, 10, -40.0),
            check(u32::MAX, u32::MAX, u32::MAX, 1e12),
        ];
        let facts = StaticFacts {
            documentation_score: 900.0,
            integration_providers: u32::MAX,
            config_files_present: 10,
            config_files_expected: 1,
            ..StaticFacts::default()
        };
        for result in hostile {
            let snapshot = compute(&result, &facts, &all_regions_populated(&map), &map, at());
            assert!((0.0..=1.0).contains(&snapshot.illumination));
            for region in snapshot.regions.values() {
                assert!((0.0..=100.0).contains(&region.coverage));
                assert!(
                    u64::from(region.passing_tests) + u64::from(region.failing_tests)
                        <= u64::from(region.test_count)
                );
            }
            crate::protocol::validate_snapshot(&snapshot).expect("engine output is wire-valid");
        }
    }

    #[test]
    fn identical_inputs_produce_identical_snapshots() {
        let map = RegionMap::default();
        let result = check(12, 9, 3, 64.5);
        let files = all_regions_populated(&map);
        let first = compute(&result, &complete_facts(), &files, &map, at());
        let second = compute(&result, &complete_facts(), &files, &map, at());
        assert_eq!(
            serde_json::to_string(&first).expect("json"),
            serde_json::to_string(&second).expect("json")
        );
    }

    #[test]
    fn timed_out_run_marks_fallback_region_as_error() {
        let map = RegionMap::default();
        let snapshot = compute(
            &CheckResult::timed_out(300.0, at()),
            &StaticFacts::default(),
            &FileCounts::new(),
            &map,
            at(),
        );
        let tests = &snapshot.regions["tests"];
        assert_eq!(tests.status, RegionStatus::Error);
        assert_eq!(tests.failing_tests, 1);
        assert_eq!(snapshot.diagnostics.len(), 1);
    }

    #[test]
    fn illumination_is_recomputable_from_snapshot_contents() {
        let map = RegionMap::default();
        let mut result = check(6, 6, 0, 95.0);
        result.file_coverage.insert("src/lib.rs".to_string(), 40.0);
        let mut files = FileCounts::new();
        files.insert("core-logic".to_string(), FileStats::count(3));
        files.insert("tests".to_string(), FileStats::count(2));
        let facts = complete_facts();
        let snapshot = compute(&result, &facts, &files, &map, at());

        assert_eq!(
            health_terms(&snapshot.regions, &facts).illumination(),
            snapshot.illumination
        );
        // core-logic is at 40% so the mean stays below the bonus threshold
        // even though the run reported 95% overall
        let terms = health_terms(&snapshot.regions, &facts);
        assert!((terms.coverage - 67.5).abs() < 1e-9);
        assert!(!terms.production_ready);

        let mut changed = snapshot.regions.clone();
        changed.get_mut("core-logic").expect("region").coverage = 100.0;
        assert!(health_terms(&changed, &facts).illumination() > snapshot.illumination);
    }
}
