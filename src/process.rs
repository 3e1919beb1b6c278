//! Process supervisor for project backends.
//!
//! The supervisor owns the table of live child processes. It spawns each
//! project's binary with `SOCKET_PATH` and `PROJECT_ID` injected, waits for
//! the backend's Unix socket to appear, probes `GET /health` over that
//! socket on an interval, and restarts crashed children with a bounded
//! exponential backoff. Status transitions are written through the project
//! collection, which the supervisor alone is authoritative for.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{now_ms, DbError, ProjectStatus, ProjectStore};

/// Poll interval while waiting for the backend socket to appear.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Poll interval for the per-child exit watcher.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Base delay before restarting a crashed child.
const RESTART_BASE_DELAY: Duration = Duration::from_secs(5);

/// Backoff ceiling for crash restarts.
const RESTART_MAX_DELAY: Duration = Duration::from_secs(80);

/// Uptime after which the crash counter resets.
const RESTART_RESET_UPTIME: Duration = Duration::from_secs(60);

/// Upper bound on a single health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("project {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("project {0} has no live process")]
    NotRunning(Uuid),

    #[error("project {0} not found")]
    UnknownProject(Uuid),

    #[error("failed to spawn {}: {source}", binary.display())]
    SpawnFailed {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// A live child process and its health bookkeeping.
struct SupervisedProcess {
    child: Child,
    pid: u32,
    socket_path: PathBuf,
    started_at: Instant,
    started_at_ms: i64,
    consecutive_health_failures: u32,
    last_unhealthy_ms: Option<i64>,
}

/// Snapshot of one handle for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub project_id: Uuid,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub started_at: i64,
    pub uptime_secs: u64,
    pub consecutive_health_failures: u32,
    pub last_unhealthy_at: Option<i64>,
}

/// Owns every child process and serializes project status transitions.
///
/// Returned as `Arc<Self>` because background tasks (exit watchers, the
/// health loop, crash restarts) each hold a reference.
pub struct Supervisor {
    handles: DashMap<Uuid, Mutex<SupervisedProcess>>,
    crash_counts: DashMap<Uuid, u32>,
    projects: Arc<ProjectStore>,
    start_timeout: Duration,
    health_interval: Duration,
}

impl Supervisor {
    pub fn new(projects: Arc<ProjectStore>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            handles: DashMap::new(),
            crash_counts: DashMap::new(),
            projects,
            start_timeout: config.process_start_timeout,
            health_interval: config.health_check_interval,
        })
    }

    /// True if the project currently has a live handle.
    pub fn is_running(&self, project_id: Uuid) -> bool {
        self.handles.contains_key(&project_id)
    }

    /// The socket a running project was launched with.
    pub fn socket_for(&self, project_id: Uuid) -> Option<PathBuf> {
        self.handles
            .get(&project_id)
            .map(|entry| entry.lock().socket_path.clone())
    }

    pub fn info(&self, project_id: Uuid) -> Option<ProcessInfo> {
        self.handles.get(&project_id).map(|entry| {
            let guard = entry.lock();
            snapshot(project_id, &guard)
        })
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .handles
            .iter()
            .map(|entry| {
                let guard = entry.value().lock();
                snapshot(*entry.key(), &guard)
            })
            .collect();
        infos.sort_by_key(|info| info.project_id);
        infos
    }

    /// Spawns a project's binary and waits for its socket to come up.
    ///
    /// When the socket never appears within the start timeout the handle is
    /// kept and status stays `starting`; the child may still come up late.
    pub async fn start(self: &Arc<Self>, project_id: Uuid) -> Result<()> {
        if self.handles.contains_key(&project_id) {
            return Err(SupervisorError::AlreadyRunning(project_id));
        }
        let project = self
            .projects
            .get(project_id)
            .ok_or(SupervisorError::UnknownProject(project_id))?;

        self.projects.set_status(project_id, ProjectStatus::Starting, None)?;

        // A stale socket file from a previous run would satisfy the
        // readiness poll before the child binds.
        if project.socket_path.exists() {
            std::fs::remove_file(&project.socket_path)?;
        }

        info!(
            project = %project.name,
            binary = %project.binary_path.display(),
            socket = %project.socket_path.display(),
            "starting backend"
        );

        let mut child = match Command::new(&project.binary_path)
            .env("SOCKET_PATH", &project.socket_path)
            .env("PROJECT_ID", project_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                let _ = self.projects.set_status(project_id, ProjectStatus::Error, None);
                return Err(SupervisorError::SpawnFailed {
                    binary: project.binary_path,
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        forward_output(&mut child, &project.name);

        // Wait for the backend to bind its socket.
        let deadline = Instant::now() + self.start_timeout;
        let mut socket_up = false;
        while Instant::now() < deadline {
            if project.socket_path.exists() {
                socket_up = true;
                break;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        if socket_up {
            self.projects.set_status(project_id, ProjectStatus::Running, Some(pid))?;
            info!(project = %project.name, pid, "backend is up");
        } else {
            warn!(
                project = %project.name,
                pid,
                timeout_secs = self.start_timeout.as_secs(),
                "backend socket did not appear; leaving status as starting"
            );
        }

        self.handles.insert(
            project_id,
            Mutex::new(SupervisedProcess {
                child,
                pid,
                socket_path: project.socket_path.clone(),
                started_at: Instant::now(),
                started_at_ms: now_ms(),
                consecutive_health_failures: 0,
                last_unhealthy_ms: None,
            }),
        );

        self.spawn_exit_watcher(project_id);
        Ok(())
    }

    /// Stops a running project: SIGTERM, bounded wait, SIGKILL.
    ///
    /// A crashed project has no handle but is still stoppable; stopping it
    /// moves the record to `stopped`, which cancels the pending restart.
    pub async fn stop(self: &Arc<Self>, project_id: Uuid) -> Result<()> {
        let Some((_, cell)) = self.handles.remove(&project_id) else {
            let project = self
                .projects
                .get(project_id)
                .ok_or(SupervisorError::NotRunning(project_id))?;
            return match project.status {
                ProjectStatus::Error | ProjectStatus::Starting => {
                    self.crash_counts.remove(&project_id);
                    self.projects.set_status(project_id, ProjectStatus::Stopped, None)?;
                    if project.socket_path.exists() {
                        let _ = std::fs::remove_file(&project.socket_path);
                    }
                    info!(%project_id, "cleared crashed backend to stopped");
                    Ok(())
                }
                _ => Err(SupervisorError::NotRunning(project_id)),
            };
        };
        let mut process = cell.into_inner();

        info!(%project_id, pid = process.pid, "sending SIGTERM");
        unsafe {
            libc::kill(process.pid as libc::pid_t, libc::SIGTERM);
        }

        match tokio::time::timeout(STOP_GRACE_PERIOD, process.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%project_id, ?status, "backend exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(%project_id, error = %e, "error waiting for backend exit");
            }
            Err(_) => {
                warn!(%project_id, pid = process.pid, "grace period exceeded, sending SIGKILL");
                let _ = process.child.kill().await;
            }
        }

        self.crash_counts.remove(&project_id);
        match self.projects.set_status(project_id, ProjectStatus::Stopped, None) {
            Ok(_) => {}
            // The record may be gone if this stop is part of a delete.
            Err(DbError::NotFound { .. }) => {
                debug!(%project_id, "stopped a project with no record");
            }
            Err(e) => {
                warn!(%project_id, error = %e, "failed to persist stopped status");
            }
        }
        if process.socket_path.exists() {
            let _ = std::fs::remove_file(&process.socket_path);
        }
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, project_id: Uuid) -> Result<()> {
        match self.stop(project_id).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(other) => return Err(other),
        }
        self.start(project_id).await
    }

    /// Starts every project; failures are logged, not propagated.
    pub async fn start_all(self: &Arc<Self>) {
        for project in self.projects.list() {
            if let Err(e) = self.start(project.id).await {
                error!(project = %project.name, error = %e, "failed to start backend");
            }
        }
    }

    /// Stops every running project concurrently.
    pub async fn stop_all(self: &Arc<Self>) {
        let ids: Vec<Uuid> = self.handles.iter().map(|entry| *entry.key()).collect();
        let mut set = JoinSet::new();
        for id in ids {
            let supervisor = Arc::clone(self);
            set.spawn(async move {
                if let Err(e) = supervisor.stop(id).await {
                    error!(project_id = %id, error = %e, "failed to stop backend");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    fn spawn_exit_watcher(self: &Arc<Self>, project_id: Uuid) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;

                let exited = {
                    let Some(entry) = supervisor.handles.get(&project_id) else {
                        // Stopped or restarted by someone else.
                        return;
                    };
                    let mut guard = entry.lock();
                    match guard.child.try_wait() {
                        Ok(Some(status)) => Some((status, guard.started_at.elapsed())),
                        Ok(None) => None,
                        Err(e) => {
                            warn!(%project_id, error = %e, "failed to poll child exit");
                            None
                        }
                    }
                };

                if let Some((status, uptime)) = exited {
                    supervisor.handle_crash(project_id, status, uptime);
                    return;
                }
            }
        });
    }

    fn handle_crash(self: &Arc<Self>, project_id: Uuid, status: std::process::ExitStatus, uptime: Duration) {
        self.handles.remove(&project_id);
        let _ = self.projects.set_status(project_id, ProjectStatus::Error, None);

        let crashes = {
            let mut entry = self.crash_counts.entry(project_id).or_insert(0);
            if uptime >= RESTART_RESET_UPTIME {
                *entry = 1;
            } else {
                *entry += 1;
            }
            *entry
        };
        let delay = restart_delay(crashes);

        warn!(
            %project_id,
            exit = ?status,
            uptime_secs = uptime.as_secs(),
            crashes,
            delay_secs = delay.as_secs(),
            "backend exited; restart scheduled"
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A stop or delete in the meantime moves the project out of
            // the error state and cancels the restart.
            match supervisor.projects.get(project_id) {
                Some(project) if project.status == ProjectStatus::Error => {
                    if let Err(e) = supervisor.start(project_id).await {
                        error!(%project_id, error = %e, "crash restart failed");
                    }
                }
                _ => {
                    debug!(%project_id, "restart cancelled, project no longer in error state");
                }
            }
        });
    }

    /// Background loop probing `GET /health` on every live backend.
    ///
    /// A single unhealthy observation is recorded, never acted on; only
    /// crash exits restart a child.
    pub async fn run_health_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.health_interval.as_secs(), "health loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.health_interval) => {
                    self.probe_all().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("health loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn probe_all(&self) {
        let targets: Vec<(Uuid, PathBuf)> = self
            .handles
            .iter()
            .map(|entry| (*entry.key(), entry.value().lock().socket_path.clone()))
            .collect();

        for (project_id, socket_path) in targets {
            // A backend whose socket never appeared is still starting;
            // probing it would only add noise.
            let running = self
                .projects
                .get(project_id)
                .map(|p| p.status == ProjectStatus::Running)
                .unwrap_or(false);
            if !running {
                continue;
            }

            let healthy = probe_health(&socket_path).await;
            if let Some(entry) = self.handles.get(&project_id) {
                let mut guard = entry.lock();
                if healthy {
                    if guard.consecutive_health_failures > 0 {
                        info!(%project_id, "backend healthy again");
                    }
                    guard.consecutive_health_failures = 0;
                } else {
                    guard.consecutive_health_failures += 1;
                    guard.last_unhealthy_ms = Some(now_ms());
                    warn!(
                        %project_id,
                        failures = guard.consecutive_health_failures,
                        "backend failed health check"
                    );
                }
            }
        }
    }
}

fn snapshot(project_id: Uuid, process: &SupervisedProcess) -> ProcessInfo {
    ProcessInfo {
        project_id,
        pid: process.pid,
        socket_path: process.socket_path.clone(),
        started_at: process.started_at_ms,
        uptime_secs: process.started_at.elapsed().as_secs(),
        consecutive_health_failures: process.consecutive_health_failures,
        last_unhealthy_at: process.last_unhealthy_ms,
    }
}

fn restart_delay(consecutive_crashes: u32) -> Duration {
    let factor = 1u32 << consecutive_crashes.saturating_sub(1).min(4);
    (RESTART_BASE_DELAY * factor).min(RESTART_MAX_DELAY)
}

/// Streams the child's stdout and stderr into the log.
fn forward_output(child: &mut Child, name: &str) {
    if let Some(stdout) = child.stdout.take() {
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(project = %name, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(project = %name, "{line}");
            }
        });
    }
}

/// One `GET /health` over the backend's Unix socket, bounded at 5s.
pub async fn probe_health(socket_path: &Path) -> bool {
    let request = async {
        let stream = UnixStream::connect(socket_path).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = Request::builder()
            .method(Method::GET)
            .uri("/health")
            .header(hyper::header::HOST, "localhost")
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(req).await?;
        Ok::<_, anyhow::Error>(response.status().is_success())
    };

    match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, request).await {
        Ok(Ok(healthy)) => healthy,
        Ok(Err(_)) | Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn test_config(dir: &Path) -> Config {
        Config::from_lookup(|key| match key {
            "ADMIN_API_KEY" => Some("test-key".to_string()),
            "DATA_DIR" => Some(dir.to_string_lossy().into_owned()),
            // Keep the socket wait short so tests stay fast.
            "PROCESS_START_TIMEOUT" => Some("300".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn setup(dir: &Path) -> (Arc<ProjectStore>, Config) {
        let config = test_config(dir);
        config.ensure_directories().unwrap();
        let projects = Arc::new(ProjectStore::open(config.projects_db_path()).unwrap());
        (projects, config)
    }

    #[test]
    fn restart_delay_backoff() {
        assert_eq!(restart_delay(1), Duration::from_secs(5));
        assert_eq!(restart_delay(2), Duration::from_secs(10));
        assert_eq!(restart_delay(3), Duration::from_secs(20));
        assert_eq!(restart_delay(4), Duration::from_secs(40));
        assert_eq!(restart_delay(5), Duration::from_secs(80));
        assert_eq!(restart_delay(12), Duration::from_secs(80));
    }

    #[tokio::test]
    async fn start_unknown_project_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (projects, config) = setup(dir.path());
        let supervisor = Supervisor::new(projects, &config);

        let result = supervisor.start(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SupervisorError::UnknownProject(_))));
    }

    #[tokio::test]
    async fn stop_without_handle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (projects, config) = setup(dir.path());
        let supervisor = Supervisor::new(projects, &config);

        let result = supervisor.stop(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SupervisorError::NotRunning(_))));
    }

    #[tokio::test]
    async fn start_and_stop_long_running_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (projects, config) = setup(dir.path());
        let binary = write_script(dir.path(), "sleeper", "exec sleep 60");

        let project = projects
            .create(
                "sleeper".to_string(),
                binary,
                config.socket_path_for(Uuid::new_v4()),
            )
            .unwrap();
        let supervisor = Supervisor::new(Arc::clone(&projects), &config);

        supervisor.start(project.id).await.unwrap();
        assert!(supervisor.is_running(project.id));
        // The script never binds a socket, so the status stays starting.
        assert_eq!(projects.get(project.id).unwrap().status, ProjectStatus::Starting);

        // Double start is a conflict.
        assert!(matches!(
            supervisor.start(project.id).await,
            Err(SupervisorError::AlreadyRunning(_))
        ));

        supervisor.stop(project.id).await.unwrap();
        assert!(!supervisor.is_running(project.id));
        assert_eq!(projects.get(project.id).unwrap().status, ProjectStatus::Stopped);
    }

    #[tokio::test]
    async fn socket_binding_backend_reaches_running() {
        let dir = tempfile::tempdir().unwrap();
        let (projects, config) = setup(dir.path());
        let id = Uuid::new_v4();
        let socket = config.socket_path_for(id);
        // A real backend binds the socket; touching the path is enough for
        // the readiness poll.
        let binary = write_script(
            dir.path(),
            "binder",
            "touch \"$SOCKET_PATH\"\nexec sleep 60",
        );

        let project = projects.create("binder".to_string(), binary, socket).unwrap();
        let supervisor = Supervisor::new(Arc::clone(&projects), &config);

        supervisor.start(project.id).await.unwrap();
        let loaded = projects.get(project.id).unwrap();
        assert_eq!(loaded.status, ProjectStatus::Running);
        assert!(loaded.pid.is_some());

        let info = supervisor.info(project.id).unwrap();
        assert_eq!(info.project_id, project.id);
        assert_eq!(info.consecutive_health_failures, 0);

        supervisor.stop(project.id).await.unwrap();
        assert!(!projects.get(project.id).unwrap().socket_path.exists());
    }

    #[tokio::test]
    async fn crashed_backend_enters_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let (projects, config) = setup(dir.path());
        let binary = write_script(dir.path(), "flaky", "exit 1");

        let project = projects
            .create(
                "flaky".to_string(),
                binary,
                config.socket_path_for(Uuid::new_v4()),
            )
            .unwrap();
        let supervisor = Supervisor::new(Arc::clone(&projects), &config);

        supervisor.start(project.id).await.unwrap();

        // The exit watcher polls at 500ms; give it a moment.
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if projects.get(project.id).unwrap().status == ProjectStatus::Error {
                break;
            }
        }
        assert_eq!(projects.get(project.id).unwrap().status, ProjectStatus::Error);
        assert!(!supervisor.is_running(project.id));

        // Stopping a crashed project clears the error state and cancels
        // the pending restart.
        supervisor.stop(project.id).await.unwrap();
        assert_eq!(projects.get(project.id).unwrap().status, ProjectStatus::Stopped);

        // A second stop is a real error: nothing is running.
        assert!(matches!(
            supervisor.stop(project.id).await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn stop_all_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (projects, config) = setup(dir.path());
        let binary = write_script(dir.path(), "sleeper", "exec sleep 60");

        let mut ids = Vec::new();
        for n in 0..3 {
            let project = projects
                .create(
                    format!("sleeper-{n}"),
                    binary.clone(),
                    config.socket_path_for(Uuid::new_v4()),
                )
                .unwrap();
            ids.push(project.id);
        }

        let supervisor = Supervisor::new(Arc::clone(&projects), &config);
        supervisor.start_all().await;
        assert_eq!(supervisor.list().len(), 3);

        supervisor.stop_all().await;
        assert!(supervisor.list().is_empty());
        for id in ids {
            assert_eq!(projects.get(id).unwrap().status, ProjectStatus::Stopped);
        }
    }
}
