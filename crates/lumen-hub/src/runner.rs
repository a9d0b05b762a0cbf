use chrono::Utc;
use lumen_core::model::{CheckResult, Diagnostic, FailedTest, CHECKS_REGION};
use lumen_core::report::{
    parse_text_output, read_coverage, read_json_report, remove_stale, truncate_chars,
    MAX_ERROR_MESSAGE_CHARS,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub project_root: PathBuf,
    pub command: Vec<String>,
    pub timeout: Duration,
    pub report_file: PathBuf,
    pub coverage_file: PathBuf,
}

impl RunnerConfig {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

/// Splits a `--check-cmd` value on whitespace. No shell quoting is honoured.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Completed(CheckResult),
    Unavailable(Diagnostic),
}

struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct CheckCoordinator {
    config: RunnerConfig,
    running: Arc<AtomicBool>,
    outcomes: mpsc::Sender<CheckOutcome>,
}

impl CheckCoordinator {
    pub fn new(config: RunnerConfig, outcomes: mpsc::Sender<CheckOutcome>) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            outcomes,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn request_run(self: &Arc<Self>, reason: &str) -> RunRequest {
        let Some(guard) = RunGuard::acquire(&self.running) else {
            info!(event = "check_skipped", reason = reason, "already running, skipped");
            return RunRequest::AlreadyRunning;
        };
        info!(event = "check_start", reason = reason, command = %self.config.command_line());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.run_once().await;
            drop(guard);
            if this.outcomes.send(outcome).await.is_err() {
                warn!(event = "check_outcome_dropped");
            }
        });
        RunRequest::Started
    }

    pub fn preflight(&self) -> Result<PathBuf, Diagnostic> {
        let Some(program) = self.config.command.first() else {
            return Err(unavailable(&self.config, "no check command configured"));
        };
        locate_program(program, &self.config.project_root).ok_or_else(|| {
            unavailable(
                &self.config,
                &format!("`{program}` was not found on PATH"),
            )
        })
    }

    async fn run_once(&self) -> CheckOutcome {
        let Some((program, args)) = self.config.command.split_first() else {
            return CheckOutcome::Unavailable(unavailable(
                &self.config,
                "no check command configured",
            ));
        };
        let report_path = self.config.resolve(&self.config.report_file);
        let coverage_path = self.config.resolve(&self.config.coverage_file);
        for stale in [&report_path, &coverage_path] {
            if let Err(err) = remove_stale(stale) {
                warn!(event = "stale_report", error = %err);
            }
        }

        let started = Instant::now();
        let child = Command::new(program)
            .args(args)
            .current_dir(&self.config.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                error!(event = "check_spawn_error", program = %program, error = %err);
                return CheckOutcome::Unavailable(unavailable(&self.config, &err.to_string()));
            }
        };

        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                error!(event = "check_wait_error", error = %err);
                return CheckOutcome::Unavailable(unavailable(&self.config, &err.to_string()));
            }
            Err(_) => {
                warn!(
                    event = "check_timeout",
                    timeout_secs = self.config.timeout.as_secs_f64()
                );
                return CheckOutcome::Completed(CheckResult::timed_out(
                    self.config.timeout.as_secs_f64(),
                    Utc::now(),
                ));
            }
        };
        let duration = started.elapsed().as_secs_f64();
        let finished = Utc::now();

        let mut result = match read_json_report(&report_path, duration, finished) {
            Ok(result) => result,
            Err(err) => {
                if !err.is_missing() {
                    warn!(event = "report_unreadable", error = %err);
                }
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push('\n');
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                parse_text_output(&text, duration, finished)
            }
        };
        match read_coverage(&coverage_path, &self.config.project_root) {
            Ok(coverage) => coverage.apply(&mut result),
            Err(err) if err.is_missing() => {}
            Err(err) => warn!(event = "coverage_unreadable", error = %err),
        }

        if !output.status.success() && result.total_tests == 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|line| !line.trim().is_empty());
            result.total_tests = 1;
            result.errors = 1;
            result.failed_tests.push(FailedTest {
                test_name: Some("check run".to_string()),
                file_path: None,
                error_message: Some(truncate_chars(
                    &format!(
                        "check command exited with {}{}",
                        output.status,
                        last_line.map(|l| format!(": {l}")).unwrap_or_default()
                    ),
                    MAX_ERROR_MESSAGE_CHARS,
                )),
            });
        }

        info!(
            event = "check_finished",
            status = %output.status,
            total = result.total_tests,
            passed = result.passed,
            failed = result.failed,
            errors = result.errors,
            coverage = result.coverage_percentage,
            duration_secs = duration
        );
        CheckOutcome::Completed(result)
    }
}

fn unavailable(config: &RunnerConfig, reason: &str) -> Diagnostic {
    Diagnostic::alert(
        CHECKS_REGION,
        format!("Check command `{}` is unavailable", config.command_line()),
        Utc::now(),
    )
    .with_details(reason.to_string())
}

pub fn locate_program(program: &str, project_root: &Path) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            project_root.join(candidate)
        };
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let path = dir.join(program);
        if path.is_file() {
            return Some(path);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{program}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
