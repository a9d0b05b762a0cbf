use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Component, Path};

const DEFAULT_IGNORED: &[&str] = &[
    ".git",
    ".pytest_cache",
    "__pycache__",
    "node_modules",
    ".coverage",
    ".venv",
    "venv",
    ".DS_Store",
    "*.pyc",
    "*.pyo",
    "*.pyd",
    ".mypy_cache",
    ".ruff_cache",
    "dist",
    "build",
    "target",
    "*.log",
];

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        let patterns: Vec<String> = DEFAULT_IGNORED.iter().map(|p| p.to_string()).collect();
        let set = build_set(&patterns).unwrap_or_else(|_| GlobSet::empty());
        Self { patterns, set }
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let base = pattern.trim_start_matches("./").trim_matches('/');
        for text in [format!("**/{base}"), format!("**/{base}/**")] {
            builder.add(GlobBuilder::new(&text).literal_separator(true).build()?);
        }
    }
    builder.build()
}

impl IgnoreRules {
    pub fn add(&mut self, pattern: &str) -> Result<(), globset::Error> {
        let pattern = pattern.trim();
        if pattern.is_empty() || self.patterns.iter().any(|p| p == pattern) {
            return Ok(());
        }
        self.patterns.push(pattern.to_string());
        match build_set(&self.patterns) {
            Ok(set) => {
                self.set = set;
                Ok(())
            }
            Err(err) => {
                self.patterns.pop();
                Err(err)
            }
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn should_ignore(&self, path: &Path) -> bool {
        self.set.is_match(path)
    }
}

pub fn is_test_file(path: &Path) -> bool {
    let in_tests_dir = path.components().any(|component| {
        matches!(component, Component::Normal(part) if part == "tests" || part == "__tests__")
    });
    if in_tests_dir {
        return true;
    }
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    stem.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with("_tests")
        || stem.ends_with(".test")
        || stem.ends_with(".spec")
}

pub fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    parts.join("/")
}
