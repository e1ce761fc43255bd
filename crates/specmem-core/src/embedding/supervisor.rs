//! Embedding server supervision
//!
//! Owns the lifecycle of the external embedding process and the liveness of
//! its socket. All mutable state sits behind one async mutex, so concurrent
//! failure paths queue up behind a single revalidation instead of each
//! spawning a server of their own.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{EmbeddingError, EmbeddingErrorKind};
use super::protocol::Request;
use super::retry::RespawnBackoff;
use crate::config::{self, EmbeddingConfig, SOCKET_FILE_NAME};

/// Poll interval while waiting for a fresh server during its first seconds
const FAST_POLL: Duration = Duration::from_millis(250);

/// Poll interval once startup is taking a while
const SLOW_POLL: Duration = Duration::from_secs(2);

/// Elapsed time after which polling slows down
const FAST_POLL_WINDOW: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL for a stale server
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const PID_FILE_NAME: &str = "embedding.pid";
const LOG_FILE_NAME: &str = "embedding-autostart.log";
const SERVER_SCRIPT: &str = "embedding-sandbox/frankenstein-embeddings.py";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("embedding server entry point not found")]
    EntryPointNotFound,

    #[error("embedding server not running at {0} and auto-spawn is disabled")]
    NotRunning(PathBuf),

    #[error("failed to spawn embedding server: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("embedding server exited during startup ({0})")]
    ExitedEarly(String),

    #[error("embedding socket not ready after {0:?}")]
    StartupTimeout(Duration),

    #[error("respawn throttled for another {0:?}")]
    Throttled(Duration),
}

impl From<SupervisorError> for EmbeddingError {
    fn from(err: SupervisorError) -> Self {
        EmbeddingError::new(EmbeddingErrorKind::SocketNotFound, err.to_string())
    }
}

/// What happened to a process recorded in the pid file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleProcess {
    /// No pid file, or the recorded process is gone
    None,
    /// The recorded pid is the one this supervisor spawned
    Protected(u32),
    Terminated(u32),
}

/// Supervisor settings resolved for one project
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub project_root: PathBuf,
    /// Where a spawned server is told to listen
    pub socket_path: PathBuf,
    /// Socket locations probed during revalidation, in order
    pub candidates: Vec<PathBuf>,
    pub server_command: Vec<String>,
    pub auto_spawn: bool,
    pub schema: String,
    pub startup_timeout: Duration,
    pub probe_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(project_root: &Path, embedding: &EmbeddingConfig, schema: &str) -> Self {
        let socket_path = embedding.socket_path_for(project_root);
        let mut candidates = vec![
            socket_path.clone(),
            config::project_socket_dir(project_root).join(SOCKET_FILE_NAME),
            config::user_data_dir().join("sockets").join(SOCKET_FILE_NAME),
            std::env::temp_dir()
                .join("specmem-sockets")
                .join(SOCKET_FILE_NAME),
        ];
        candidates.dedup();

        Self {
            project_root: project_root.to_path_buf(),
            socket_path,
            candidates,
            server_command: embedding.server_command.clone(),
            auto_spawn: embedding.auto_spawn,
            schema: schema.to_string(),
            startup_timeout: embedding.startup_timeout(),
            probe_timeout: embedding.probe_timeout(),
        }
    }

    fn socket_dir(&self) -> PathBuf {
        self.socket_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config::project_socket_dir(&self.project_root))
    }

    fn pid_file(&self) -> PathBuf {
        self.socket_dir().join(PID_FILE_NAME)
    }
}

/// Mutable supervision state for one pipeline run
#[derive(Debug, Default)]
pub struct SupervisorState {
    pub active_socket_path: Option<PathBuf>,
    /// Pid of the server this supervisor launched; never terminated by it
    pub spawned_pid: Option<u32>,
    pub consecutive_failures: u32,
    pub backoff: RespawnBackoff,
    pub last_respawn: Option<Instant>,
    /// Backoff window that applied to the last respawn
    pub respawn_window: Duration,
}

impl SupervisorState {
    pub fn may_terminate(&self, pid: u32) -> bool {
        self.spawned_pid != Some(pid)
    }

    /// Time left before another respawn is allowed
    fn respawn_wait(&self) -> Option<Duration> {
        let last = self.last_respawn?;
        self.respawn_window
            .checked_sub(last.elapsed())
            .filter(|wait| !wait.is_zero())
    }
}

/// Owns the embedding server process and the active socket path
pub struct EmbeddingSupervisor {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
}

impl EmbeddingSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Socket requests should go to right now
    pub async fn active_socket(&self) -> PathBuf {
        let state = self.state.lock().await;
        state
            .active_socket_path
            .clone()
            .unwrap_or_else(|| self.config.socket_path.clone())
    }

    pub async fn spawned_pid(&self) -> Option<u32> {
        self.state.lock().await.spawned_pid
    }

    pub async fn may_terminate(&self, pid: u32) -> bool {
        self.state.lock().await.may_terminate(pid)
    }

    /// Count a failed request; returns the consecutive failure count
    pub async fn record_failure(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        state.consecutive_failures
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
    }

    /// Make sure a live server answers on the target socket.
    pub async fn ensure_running(&self) -> Result<PathBuf, SupervisorError> {
        let mut state = self.state.lock().await;
        self.ensure_running_locked(&mut state).await
    }

    /// Re-probe known socket locations after repeated client failures,
    /// respawning the server if none of them is alive.
    pub async fn revalidate(&self) -> Result<PathBuf, SupervisorError> {
        let mut state = self.state.lock().await;

        for candidate in &self.config.candidates {
            if probe_and_clean(candidate, self.config.probe_timeout).await {
                if state.active_socket_path.as_deref() != Some(candidate.as_path()) {
                    info!(socket = %candidate.display(), "Adopting live embedding socket");
                }
                state.active_socket_path = Some(candidate.clone());
                state.consecutive_failures = 0;
                state.backoff.reset();
                return Ok(candidate.clone());
            }
        }

        if let Some(wait) = state.respawn_wait() {
            debug!(?wait, "Embedding server respawn throttled");
            return Err(SupervisorError::Throttled(wait));
        }

        warn!("No live embedding socket found, respawning server");
        state.active_socket_path = None;
        let result = self.ensure_running_locked(&mut state).await;
        if result.is_ok() {
            state.consecutive_failures = 0;
        }
        result
    }

    async fn ensure_running_locked(
        &self,
        state: &mut SupervisorState,
    ) -> Result<PathBuf, SupervisorError> {
        let target = &self.config.socket_path;
        if probe_and_clean(target, self.config.probe_timeout).await {
            debug!(socket = %target.display(), "Embedding server already running");
            state.active_socket_path = Some(target.clone());
            return Ok(target.clone());
        }

        if !self.config.auto_spawn {
            return Err(SupervisorError::NotRunning(target.clone()));
        }

        state.last_respawn = Some(Instant::now());
        state.respawn_window = state.backoff.current();
        state.backoff.bump();
        let command = self
            .locate_entry_point()
            .ok_or(SupervisorError::EntryPointNotFound)?;

        match self.terminate_stale(state).await {
            StaleProcess::Terminated(pid) => info!(pid, "Terminated stale embedding server"),
            StaleProcess::Protected(pid) => {
                debug!(pid, "Stale pid belongs to this run, leaving it alone")
            }
            StaleProcess::None => {}
        }
        remove_socket_file(target);

        let mut child = self.spawn(&command)?;
        let pid = child.id();
        state.spawned_pid = pid;
        if let Some(pid) = pid {
            if let Err(e) = std::fs::write(self.config.pid_file(), pid.to_string()) {
                warn!(error = %e, "Failed to record embedding server pid");
            }
        }
        info!(?pid, socket = %target.display(), "Spawned embedding server");

        self.wait_for_socket(&mut child).await?;
        state.active_socket_path = Some(target.clone());
        state.backoff.reset();
        Ok(target.clone())
    }

    /// Program and arguments for the embedding server, if one can be found
    fn locate_entry_point(&self) -> Option<Vec<String>> {
        if !self.config.server_command.is_empty() {
            return Some(self.config.server_command.clone());
        }

        let mut scripts = Vec::new();
        if let Ok(script) = std::env::var("SPECMEM_EMBEDDING_SCRIPT") {
            scripts.push(PathBuf::from(script));
        }
        scripts.push(self.config.project_root.join(SERVER_SCRIPT));
        scripts.push(
            self.config
                .project_root
                .join(config::PROJECT_DATA_DIR)
                .join(SERVER_SCRIPT),
        );
        scripts.push(config::user_data_dir().join(SERVER_SCRIPT));

        let script = scripts.into_iter().find(|p| p.is_file())?;
        let python = which::which("python3")
            .or_else(|_| which::which("python"))
            .ok()?;

        Some(vec![
            python.to_string_lossy().into_owned(),
            script.to_string_lossy().into_owned(),
            "--service".to_string(),
        ])
    }

    /// Kill the server recorded in the pid file, unless this run spawned it
    pub async fn terminate_stale(&self, state: &SupervisorState) -> StaleProcess {
        let Some(pid) = read_pid_file(&self.config.pid_file()) else {
            return StaleProcess::None;
        };
        if !state.may_terminate(pid) {
            return StaleProcess::Protected(pid);
        }
        if !process_alive(pid) {
            return StaleProcess::None;
        }

        send_signal(pid, libc::SIGTERM);
        let deadline = Instant::now() + TERMINATE_GRACE;
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if process_alive(pid) {
            warn!(pid, "Stale embedding server ignored SIGTERM, killing");
            send_signal(pid, libc::SIGKILL);
        }
        StaleProcess::Terminated(pid)
    }

    fn spawn(&self, command: &[String]) -> Result<tokio::process::Child, SupervisorError> {
        let (program, args) = command
            .split_first()
            .ok_or(SupervisorError::EntryPointNotFound)?;

        let socket_dir = self.config.socket_dir();
        std::fs::create_dir_all(&socket_dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(socket_dir.join(LOG_FILE_NAME))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.config.project_root)
            .env("SPECMEM_EMBEDDING_SOCKET", &self.config.socket_path)
            .env("SPECMEM_SOCKET_DIR", &socket_dir)
            .env("SPECMEM_PROJECT_PATH", &self.config.project_root)
            .env("SPECMEM_DB_SCHEMA", &self.config.schema)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .process_group(0);

        Ok(cmd.spawn()?)
    }

    /// Poll until the socket exists and answers, with an adaptive interval
    async fn wait_for_socket(
        &self,
        child: &mut tokio::process::Child,
    ) -> Result<(), SupervisorError> {
        let started = Instant::now();
        let socket = &self.config.socket_path;

        loop {
            if socket.exists() && probe(socket, self.config.probe_timeout).await {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Embedding server is ready"
                );
                return Ok(());
            }

            if let Ok(Some(status)) = child.try_wait() {
                return Err(SupervisorError::ExitedEarly(status.to_string()));
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.startup_timeout {
                return Err(SupervisorError::StartupTimeout(self.config.startup_timeout));
            }

            let interval = if elapsed < FAST_POLL_WINDOW {
                FAST_POLL
            } else {
                SLOW_POLL
            };
            let remaining = self.config.startup_timeout - elapsed;
            tokio::time::sleep(interval.min(remaining)).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_spawned_pid(&self, pid: u32) {
        self.state.lock().await.spawned_pid = Some(pid);
    }
}

/// Connection-accept liveness probe.
///
/// A health frame is written best-effort; the reply is not awaited.
pub async fn probe(path: &Path, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(mut stream)) => {
            let _ = stream.write_all(Request::Health.encode().as_bytes()).await;
            true
        }
        _ => false,
    }
}

/// Probe, deleting the socket file if nothing is listening behind it
async fn probe_and_clean(path: &Path, timeout: Duration) -> bool {
    if !path.exists() {
        return false;
    }
    if probe(path, timeout).await {
        return true;
    }
    remove_socket_file(path);
    false
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed dead embedding socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    // SAFETY: plain kill(2) on a pid we read from our own pid file.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
