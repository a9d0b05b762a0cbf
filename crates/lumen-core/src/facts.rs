use crate::engine::{FileCounts, RegionMap, StaticFacts};
use crate::paths::{relative_key, IgnoreRules};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

pub const README_MIN_BYTES: u64 = 500;

pub const CONFIG_FILES: &[&str] = &["Cargo.toml", "package.json", "pyproject.toml", "requirements.txt"];

const MCP_CONFIG_FILES: &[&str] = &[
    ".mcp.json",
    ".gemini/settings.json",
    ".github/mcp-configuration.json",
];

pub fn scan_static_facts(root: &Path) -> StaticFacts {
    scan_static_facts_with_env(root, std::env::vars())
}

pub fn scan_static_facts_with_env(
    root: &Path,
    env: impl IntoIterator<Item = (String, String)>,
) -> StaticFacts {
    let config_files_present = CONFIG_FILES
        .iter()
        .filter(|name| root.join(name).is_file())
        .count() as u32;
    StaticFacts {
        project_name: project_name(root),
        has_license: has_license(root),
        has_readme: root.join("README.md").is_file(),
        documentation_score: documentation_score(root),
        api_configured: api_configured(root, env),
        integration_providers: integration_providers(root),
        config_files_present,
        config_files_expected: CONFIG_FILES.len() as u32,
    }
}

fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn has_license(root: &Path) -> bool {
    ["LICENSE", "LICENSE.md", "LICENSE.txt"]
        .iter()
        .any(|name| root.join(name).is_file())
}

fn any_file(root: &Path, names: &[&str]) -> bool {
    names.iter().any(|name| root.join(name).is_file())
}

fn has_openapi_doc(root: &Path) -> bool {
    [root.to_path_buf(), root.join("docs")].iter().any(|dir| {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    entry
                        .file_name()
                        .to_string_lossy()
                        .to_ascii_lowercase()
                        .starts_with("openapi")
                })
            })
            .unwrap_or(false)
    })
}

/// Score in [0, 100]: README with content 30, license 20, contributor or
/// agent instructions 20, OpenAPI document 15, setup guide 15.
pub fn documentation_score(root: &Path) -> f64 {
    let mut score = 0.0;
    let readme_len = std::fs::metadata(root.join("README.md"))
        .map(|meta| meta.len())
        .unwrap_or(0);
    if readme_len >= README_MIN_BYTES {
        score += 30.0;
    }
    if has_license(root) {
        score += 20.0;
    }
    if any_file(root, &["CONTRIBUTING.md", "CLAUDE.md", "AGENTS.md"]) {
        score += 20.0;
    }
    if has_openapi_doc(root) {
        score += 15.0;
    }
    if any_file(root, &["SETUP.md", "QUICKSTART.md"]) {
        score += 15.0;
    }
    f64::min(score, 100.0)
}

fn api_variable() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]*_API_(KEY|URL)$").expect("valid regex"))
}

pub fn api_configured(root: &Path, env: impl IntoIterator<Item = (String, String)>) -> bool {
    let pattern = api_variable();
    if env
        .into_iter()
        .any(|(name, value)| pattern.is_match(&name) && !value.trim().is_empty())
    {
        return true;
    }
    let Ok(contents) = std::fs::read_to_string(root.join(".env")) else {
        return false;
    };
    contents.lines().any(|line| {
        let line = line.trim().trim_start_matches("export ").trim();
        if line.starts_with('#') {
            return false;
        }
        line.split_once('=').is_some_and(|(name, value)| {
            pattern.is_match(name.trim())
                && !value.trim().trim_matches(|c| c == '"' || c == '\'').is_empty()
        })
    })
}

pub fn integration_providers(root: &Path) -> u32 {
    let mut providers = BTreeSet::new();
    for name in MCP_CONFIG_FILES {
        let Ok(raw) = std::fs::read_to_string(root.join(name)) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        if let Some(servers) = value.get("mcpServers").and_then(|v| v.as_object()) {
            providers.extend(servers.keys().cloned());
        }
    }
    providers.len() as u32
}

pub fn count_files_by_region(root: &Path, map: &RegionMap, ignore: &IgnoreRules) -> FileCounts {
    let mut counts = FileCounts::new();
    let walker = WalkBuilder::new(root).standard_filters(true).build();
    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel_path) = entry.path().strip_prefix(root) else {
            continue;
        };
        if ignore.should_ignore(rel_path) {
            continue;
        }
        let key = relative_key(root, entry.path());
        let Some(region) = map.region_for(&key) else {
            continue;
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from);
        let stats = counts.entry(region.to_string()).or_default();
        stats.count = stats.count.saturating_add(1);
        stats.last_modified = match (stats.last_modified, modified) {
            (Some(current), Some(seen)) => Some(current.max(seen)),
            (current, seen) => current.or(seen),
        };
    }
    counts
}
