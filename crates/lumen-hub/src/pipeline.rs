use crate::hub::HubState;
use crate::runner::CheckOutcome;
use crate::watcher::RecheckSignal;
use chrono::Utc;
use lumen_core::engine::{self, FileCounts, RegionMap};
use lumen_core::facts::{count_files_by_region, scan_static_facts};
use lumen_core::model::{CheckResult, Diagnostic, FileChangeEvent, HealthSnapshot};
use lumen_core::paths::IgnoreRules;
use lumen_core::protocol::{WireMessage, WireMsg};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct PipelineInputs {
    pub signals: mpsc::Receiver<RecheckSignal>,
    pub changes: mpsc::Receiver<FileChangeEvent>,
    pub outcomes: mpsc::Receiver<CheckOutcome>,
}

#[derive(Clone)]
pub struct Pipeline {
    hub: Arc<HubState>,
    project_root: PathBuf,
    region_map: Arc<RegionMap>,
    ignore: Arc<IgnoreRules>,
}

impl Pipeline {
    pub fn new(
        hub: Arc<HubState>,
        project_root: PathBuf,
        region_map: RegionMap,
        ignore: IgnoreRules,
    ) -> Self {
        Self {
            hub,
            project_root,
            region_map: Arc::new(region_map),
            ignore: Arc::new(ignore),
        }
    }

    pub async fn run(self, mut inputs: PipelineInputs) {
        self.hub.coordinator().request_run("startup");
        let mut last_result: Option<CheckResult> = None;
        loop {
            tokio::select! {
                Some(signal) = inputs.signals.recv() => {
                    let reason = format!(
                        "{} file change(s){}",
                        signal.changes,
                        if signal.test_files_changed { ", tests touched" } else { "" }
                    );
                    self.hub.coordinator().request_run(&reason);
                }
                Some(change) = inputs.changes.recv() => {
                    self.hub
                        .broadcast(&WireMessage::new(WireMsg::FileChange(change)))
                        .await;
                }
                Some(outcome) = inputs.outcomes.recv() => {
                    match outcome {
                        CheckOutcome::Completed(result) => {
                            let snapshot = self.evaluate(&result, Vec::new()).await;
                            self.hub.publish_snapshot(snapshot).await;
                            self.hub
                                .broadcast(&WireMessage::new(WireMsg::CheckResult(result.for_broadcast())))
                                .await;
                            last_result = Some(result);
                        }
                        CheckOutcome::Unavailable(diagnostic) => {
                            self.report_unavailable(diagnostic, last_result.as_ref()).await;
                        }
                    }
                }
                else => break,
            }
        }
        info!(event = "pipeline_stopped");
    }

    pub async fn report_unavailable(&self, diagnostic: Diagnostic, last: Option<&CheckResult>) {
        warn!(event = "checks_unavailable", message = %diagnostic.message);
        self.hub
            .broadcast(&WireMessage::new(WireMsg::Diagnostic(diagnostic.clone())))
            .await;
        let result = last
            .cloned()
            .unwrap_or_else(|| CheckResult::empty(Utc::now()));
        let snapshot = self.evaluate(&result, vec![diagnostic]).await;
        self.hub.publish_snapshot(snapshot).await;
    }

    pub async fn file_counts(&self) -> FileCounts {
        let root = self.project_root.clone();
        let map = self.region_map.clone();
        let ignore = self.ignore.clone();
        match tokio::task::spawn_blocking(move || count_files_by_region(&root, &map, &ignore)).await
        {
            Ok(counts) => counts,
            Err(err) => {
                warn!(event = "file_count_error", error = %err);
                FileCounts::new()
            }
        }
    }

    async fn evaluate(&self, result: &CheckResult, extra: Vec<Diagnostic>) -> HealthSnapshot {
        let root = self.project_root.clone();
        let map = self.region_map.clone();
        let ignore = self.ignore.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            let facts = scan_static_facts(&root);
            let files = count_files_by_region(&root, &map, &ignore);
            (facts, files)
        })
        .await;
        let (facts, files) = match scanned {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "facts_scan_error", error = %err);
                Default::default()
            }
        };
        let mut snapshot = engine::compute(result, &facts, &files, &self.region_map, Utc::now());
        snapshot.diagnostics.extend(extra);
        snapshot
    }
}
