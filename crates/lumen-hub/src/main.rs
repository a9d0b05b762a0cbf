mod hub;
mod pipeline;
mod runner;
mod store;
mod watcher;

use anyhow::{bail, Context};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use hub::HubState;
use lumen_core::engine::RegionMap;
use lumen_core::model::HealthSnapshot;
use lumen_core::paths::IgnoreRules;
use pipeline::{Pipeline, PipelineInputs};
use runner::{CheckCoordinator, RunRequest, RunnerConfig};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use store::SnapshotStore;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use watcher::{WatchConfig, WatchHandle};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    project_root: PathBuf,
    check_cmd: Vec<String>,
    check_timeout: Duration,
    debounce: Duration,
    watch_roots: Vec<PathBuf>,
    region_map: RegionMap,
    report_file: PathBuf,
    coverage_file: PathBuf,
    status_file: PathBuf,
    write_timeout: Duration,
    log_dir: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "lumen-hub", about = "Watches a project, runs its checks and streams health snapshots")]
struct Args {
    #[arg(long, env = "LUMEN_HUB_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,
    #[arg(long, env = "LUMEN_PROJECT_ROOT", default_value = "")]
    project_root: String,
    #[arg(long, env = "LUMEN_CHECK_CMD", default_value = "cargo test")]
    check_cmd: String,
    /// Seconds before a check run is killed.
    #[arg(long, env = "LUMEN_CHECK_TIMEOUT", default_value_t = 300)]
    check_timeout: u64,
    #[arg(long, env = "LUMEN_DEBOUNCE_MS", default_value_t = 1000)]
    debounce_ms: u64,
    /// Extra directories to watch, relative to the project root.
    #[arg(long = "watch")]
    watch: Vec<String>,
    /// `prefix=region` rule; repeating it replaces the default region map.
    #[arg(long = "region")]
    region: Vec<String>,
    #[arg(long, env = "LUMEN_REPORT_FILE", default_value = "test_results.json")]
    report_file: String,
    #[arg(long, env = "LUMEN_COVERAGE_FILE", default_value = "coverage.json")]
    coverage_file: String,
    #[arg(long, env = "LUMEN_STATUS_FILE", default_value = "neural_status.json")]
    status_file: String,
    /// Seconds a client may take to accept one message.
    #[arg(long, env = "LUMEN_WRITE_TIMEOUT", default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("lumen-hub: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_logging(&config);
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(event = "hub_error", error = %format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid address {}", config.addr))?;
    if !addr.ip().is_loopback() {
        bail!("refusing to bind non-loopback address {addr}");
    }

    let store = SnapshotStore::new(resolve_path(&config.project_root, &config.status_file));
    let initial = match store.load() {
        Ok(Some(snapshot)) => {
            info!(event = "snapshot_loaded", path = %store.path().display());
            snapshot
        }
        Ok(None) => HealthSnapshot::empty(project_name(&config.project_root), Utc::now()),
        Err(err) => {
            warn!(event = "snapshot_load_error", error = %err);
            HealthSnapshot::empty(project_name(&config.project_root), Utc::now())
        }
    };

    let (outcome_tx, outcome_rx) = mpsc::channel(16);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (change_tx, change_rx) = mpsc::channel(256);

    let coordinator = Arc::new(CheckCoordinator::new(
        RunnerConfig {
            project_root: config.project_root.clone(),
            command: config.check_cmd.clone(),
            timeout: config.check_timeout,
            report_file: config.report_file.clone(),
            coverage_file: config.coverage_file.clone(),
        },
        outcome_tx,
    ));
    let hub = Arc::new(HubState::new(
        initial,
        store,
        coordinator.clone(),
        config.write_timeout,
        config.debug,
    ));

    let ignore = ignore_rules(&config)?;
    let pipeline = Pipeline::new(
        hub.clone(),
        config.project_root.clone(),
        config.region_map.clone(),
        ignore.clone(),
    );

    match coordinator.preflight() {
        Ok(path) => info!(event = "check_command", program = %path.display()),
        Err(diagnostic) => {
            error!(
                event = "check_unavailable",
                command = %coordinator.config().command_line(),
                "check command not found; checks will report as unavailable"
            );
            pipeline.report_unavailable(diagnostic, None).await;
        }
    }

    let (_watcher, watch) = watcher::spawn(
        WatchConfig {
            project_root: config.project_root.clone(),
            roots: config.watch_roots.clone(),
            ignore,
            debounce: config.debounce,
        },
        signal_tx,
        change_tx,
    )?;

    tokio::spawn(pipeline.clone().run(PipelineInputs {
        signals: signal_rx,
        changes: change_rx,
        outcomes: outcome_rx,
    }));

    let app = router(AppState {
        hub,
        pipeline,
        watch: Arc::new(watch),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        event = "hub_start",
        addr = %addr,
        project_root = %config.project_root.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;
    info!(event = "hub_stop");
    Ok(())
}

#[derive(Clone)]
struct AppState {
    hub: Arc<HubState>,
    pipeline: Pipeline,
    watch: Arc<WatchHandle>,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status_handler))
        .route("/checks/run", post(run_checks_handler))
        .route("/watcher/status", get(watcher_status_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(loopback_only))
        .with_state(state)
}

async fn loopback_only(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        warn!(event = "remote_refused", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        state.hub.handle_socket(socket, addr).await;
    })
}

async fn root_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.hub.current_snapshot().await;
    Json(json!({
        "service": "lumen-hub",
        "status": "online",
        "version": env!("CARGO_PKG_VERSION"),
        "illumination": snapshot.illumination,
        "connectedClients": state.hub.client_count().await,
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.hub.current_snapshot().await)
}

async fn watcher_status_handler(State(state): State<AppState>) -> Json<Value> {
    let status = state.watch.status();
    let watched: Vec<String> = status
        .watched
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    Json(json!({
        "isRunning": state.watch.is_running(),
        "watchedDirectories": watched,
        "ignoredPatternsCount": status.ignored_patterns,
        "projectRoot": status.project_root.display().to_string(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Json<Value> {
    let counts: BTreeMap<String, u32> = state
        .pipeline
        .file_counts()
        .await
        .into_iter()
        .map(|(region, stats)| (region, stats.count))
        .collect();
    Json(json!({
        "fileCounts": counts,
        "illumination": state.hub.current_snapshot().await.illumination,
        "timestamp": Utc::now(),
    }))
}

async fn run_checks_handler(State(state): State<AppState>) -> Response {
    match state.hub.coordinator().request_run("http") {
        RunRequest::Started => (StatusCode::ACCEPTED, Json(json!({"status": "started"}))).into_response(),
        RunRequest::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(json!({"status": "already_running"})),
        )
            .into_response(),
    }
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let project_root = resolve_project_root(&args.project_root)?;
    let check_cmd = runner::split_command(&args.check_cmd);
    if check_cmd.is_empty() {
        bail!("--check-cmd must not be empty");
    }
    let region_map = if args.region.is_empty() {
        RegionMap::default()
    } else {
        let rules = args
            .region
            .iter()
            .map(|rule| RegionMap::parse_rule(rule).map_err(anyhow::Error::msg))
            .collect::<anyhow::Result<Vec<_>>>()?;
        RegionMap::new(rules, RegionMap::default().fallback_test_region())
    };
    let mut watch_roots: Vec<PathBuf> = watcher::DEFAULT_WATCH_ROOTS
        .iter()
        .map(PathBuf::from)
        .collect();
    for extra in &args.watch {
        let extra = PathBuf::from(extra);
        if !watch_roots.contains(&extra) {
            watch_roots.push(extra);
        }
    }
    Ok(Config {
        addr: args.addr,
        project_root,
        check_cmd,
        check_timeout: Duration::from_secs(args.check_timeout.max(1)),
        debounce: Duration::from_millis(args.debounce_ms),
        watch_roots,
        region_map,
        report_file: PathBuf::from(args.report_file),
        coverage_file: PathBuf::from(args.coverage_file),
        status_file: PathBuf::from(args.status_file),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        log_dir: resolve_log_dir(&args.log_dir),
        debug: args.debug || env_true("LUMEN_HUB_DEBUG"),
    })
}

fn resolve_project_root(flag: &str) -> anyhow::Result<PathBuf> {
    let root = if flag.trim().is_empty() {
        std::env::current_dir().context("cannot determine current directory")?
    } else {
        PathBuf::from(flag)
    };
    root.canonicalize()
        .with_context(|| format!("project root {} is not accessible", root.display()))
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn ignore_rules(config: &Config) -> anyhow::Result<IgnoreRules> {
    let mut rules = IgnoreRules::default();
    for path in [&config.status_file, &config.report_file, &config.coverage_file] {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            rules
                .add(name)
                .with_context(|| format!("cannot ignore {name}"))?;
            rules
                .add(&format!("{name}.tmp"))
                .with_context(|| format!("cannot ignore {name}.tmp"))?;
        }
    }
    Ok(rules)
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("LUMEN_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("lumen-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("LUMEN_LOG_DIR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_default()
}
