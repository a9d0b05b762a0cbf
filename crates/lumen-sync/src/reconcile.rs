use chrono::{DateTime, Utc};
use lumen_core::model::{Diagnostic, HealthSnapshot, Region, RegionStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Status vocabulary of the presentation layer. `Optimal` never comes from
/// the hub; only local demo or default state uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationStatus {
    Optimal,
    Healthy,
    Warning,
    Critical,
    Offline,
}

pub fn presentation_status(status: RegionStatus) -> PresentationStatus {
    match status {
        RegionStatus::Healthy => PresentationStatus::Healthy,
        RegionStatus::Warning => PresentationStatus::Warning,
        RegionStatus::Error => PresentationStatus::Critical,
        RegionStatus::Offline => PresentationStatus::Offline,
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn region_illumination(region: &Region) -> f64 {
    let coverage = unit(region.coverage / 100.0);
    let value = match region.status {
        RegionStatus::Healthy => coverage.max(0.8),
        RegionStatus::Warning => coverage * 0.7,
        RegionStatus::Error => coverage * 0.5,
        RegionStatus::Offline => 0.0,
    };
    unit(value)
}

pub fn region_progress(region: &Region) -> f64 {
    if region.test_count == 0 {
        return 0.0;
    }
    let share = f64::from(region.passing_tests) / f64::from(region.test_count) * 100.0;
    share.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledRegion {
    pub status: PresentationStatus,
    pub illumination: f64,
    pub progress: f64,
    pub coverage: f64,
    pub test_count: u32,
    pub passing_tests: u32,
    pub failing_tests: u32,
    pub file_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledState {
    pub illumination: f64,
    pub regions: BTreeMap<String, ReconciledRegion>,
    pub diagnostics: Vec<Diagnostic>,
    pub timestamp: DateTime<Utc>,
}

impl ReconciledState {
    pub fn demo(region_names: &[&str], at: DateTime<Utc>) -> Self {
        let regions = region_names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    ReconciledRegion {
                        status: PresentationStatus::Optimal,
                        illumination: 1.0,
                        progress: 100.0,
                        coverage: 100.0,
                        test_count: 0,
                        passing_tests: 0,
                        failing_tests: 0,
                        file_count: 0,
                    },
                )
            })
            .collect();
        Self {
            illumination: 1.0,
            regions,
            diagnostics: Vec::new(),
            timestamp: at,
        }
    }
}

pub fn reconcile(snapshot: &HealthSnapshot) -> ReconciledState {
    let regions = snapshot
        .regions
        .iter()
        .map(|(name, region)| {
            (
                name.clone(),
                ReconciledRegion {
                    status: presentation_status(region.status),
                    illumination: region_illumination(region),
                    progress: region_progress(region),
                    coverage: region.coverage,
                    test_count: region.test_count,
                    passing_tests: region.passing_tests,
                    failing_tests: region.failing_tests,
                    file_count: region.file_count,
                },
            )
        })
        .collect();
    ReconciledState {
        illumination: unit(snapshot.illumination),
        regions,
        diagnostics: snapshot.diagnostics.clone(),
        timestamp: snapshot.timestamp,
    }
}
