//! PTY process controller.
//!
//! A [`PtyProcess`] owns one pseudo-terminal and the child attached to it.
//! It runs two background tasks for its whole life: a read loop that is the
//! only writer to the output record and screen, and an exit watcher that
//! reaps the child and drives the final `terminated` transition.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::PtyError;
use super::output::{OutputRecord, DEFAULT_MAX_OUTPUT_BYTES};
use super::screen::{Screen, Vt100Screen, DEFAULT_SCROLLBACK_LINES};
use super::PtyId;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the exit watcher waits for the reader to hit EOF after the
/// child has been reaped.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle status of a PTY process.
///
/// Transitions only move forward, except for the advisory
/// `Active <-> Idle` toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyStatus {
    /// Spawn in progress.
    Initializing,
    /// Running.
    Active,
    /// Running, but no input or output for the idle timeout.
    Idle,
    /// A termination request was sent; waiting for the child to exit.
    Terminating,
    /// The child has exited and OS resources have been released.
    Terminated,
}

impl PtyStatus {
    /// Whether the process is on its way out (or already gone).
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

impl std::fmt::Display for PtyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Options for spawning a PTY process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyOptions {
    /// Program to run, or a shell command line in shell mode.
    pub executable: String,
    /// Arguments, passed verbatim (quoted in shell mode).
    pub args: Vec<String>,
    /// Working directory; must exist if given.
    pub cwd: Option<PathBuf>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Run `executable args...` through `<shell> -c`.
    pub shell_mode: bool,
    /// Remove the PTY from its registry as soon as the child exits.
    pub auto_dispose_on_exit: bool,
    /// Initial geometry; falls back to the configured defaults.
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl PtyOptions {
    /// Creates options for running `executable` with no arguments.
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            shell_mode: false,
            auto_dispose_on_exit: false,
            cols: None,
            rows: None,
        }
    }

    /// Sets the arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Enables or disables shell mode.
    pub fn shell_mode(mut self, enabled: bool) -> Self {
        self.shell_mode = enabled;
        self
    }

    /// Enables or disables removal from the registry on exit.
    pub fn auto_dispose_on_exit(mut self, enabled: bool) -> Self {
        self.auto_dispose_on_exit = enabled;
        self
    }

    /// Sets the initial terminal size.
    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }
}

/// Engine-wide defaults applied to every spawned PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyDefaults {
    /// Shell used in shell mode.
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Delay between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Inactivity after which an active PTY reports `idle`.
    pub idle_timeout: Option<Duration>,
    pub scrollback_lines: usize,
    pub max_output_bytes: usize,
}

impl Default for PtyDefaults {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            cols: 80,
            rows: 24,
            kill_grace: DEFAULT_KILL_GRACE,
            idle_timeout: None,
            scrollback_lines: DEFAULT_SCROLLBACK_LINES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Callback fired exactly once when the child exits.
pub type ExitObserver = Box<dyn FnOnce(&PtyId) + Send>;

/// Point-in-time view of a PTY, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyInfo {
    pub id: PtyId,
    pub status: PtyStatus,
    pub executable: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    /// Exit code once reaped. A child killed by a signal reports `1`,
    /// since portable-pty folds the signal into a generic failure code.
    pub exit_code: Option<i32>,
    /// Total bytes of output captured so far.
    pub output_bytes: u64,
}

/// Mutable lifecycle state, guarded by a short-held lock.
struct PtyState {
    status: PtyStatus,
    last_activity: SystemTime,
    last_activity_at: Instant,
    exit_code: Option<i32>,
    cols: u16,
    rows: u16,
}

impl PtyState {
    fn refresh_idle(&mut self, idle_timeout: Option<Duration>) {
        if let (PtyStatus::Active, Some(timeout)) = (self.status, idle_timeout) {
            if self.last_activity_at.elapsed() >= timeout {
                self.status = PtyStatus::Idle;
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity = SystemTime::now();
        self.last_activity_at = Instant::now();
        if self.status == PtyStatus::Idle {
            self.status = PtyStatus::Active;
        }
    }
}

/// Captured output and the screen it feeds. Locked together so the raw and
/// rendered views never disagree about which bytes have arrived.
struct PtyOutput {
    record: OutputRecord,
    screen: Box<dyn Screen>,
}

/// A process running in a pseudo-terminal.
pub struct PtyProcess {
    id: PtyId,
    options: PtyOptions,
    created_at: SystemTime,
    pid: Option<u32>,
    kill_grace: Duration,
    idle_timeout: Option<Duration>,

    state: Mutex<PtyState>,
    output: Mutex<PtyOutput>,

    /// The PTY master handle; `None` once released.
    master: tokio::sync::Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY; `None` once released.
    writer: tokio::sync::Mutex<Option<Box<dyn Write + Send>>>,

    /// Set as soon as the child has been reaped, so signals are never sent
    /// to a recycled pid.
    child_exited: Arc<AtomicBool>,

    /// Stops the read loop.
    reader_cancel: CancellationToken,

    /// Cancelled once the process reached `Terminated`.
    terminated: CancellationToken,

    on_exit: Mutex<Option<ExitObserver>>,
}

impl PtyProcess {
    /// Spawns a new process in a fresh pseudo-terminal.
    ///
    /// Must be called from within a Tokio runtime: the read loop and exit
    /// watcher are spawned onto it. On failure no child is left running.
    pub fn spawn(
        id: PtyId,
        options: PtyOptions,
        defaults: &PtyDefaults,
        on_exit: Option<ExitObserver>,
    ) -> Result<Arc<Self>, PtyError> {
        let cols = options.cols.unwrap_or(defaults.cols);
        let rows = options.rows.unwrap_or(defaults.rows);
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize { cols, rows });
        }

        let cmd = build_command(&options, &defaults.shell)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(format!("failed to allocate pty: {e}")))?;

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        // Only the child should hold the slave side, so EOF follows its exit.
        drop(pair.slave);

        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PtyError::Spawn(e.to_string()));
            }
        };

        let pid = child.process_id();
        let now = SystemTime::now();

        let pty = Arc::new(Self {
            id,
            created_at: now,
            pid,
            kill_grace: defaults.kill_grace,
            idle_timeout: defaults.idle_timeout,
            state: Mutex::new(PtyState {
                status: PtyStatus::Initializing,
                last_activity: now,
                last_activity_at: Instant::now(),
                exit_code: None,
                cols,
                rows,
            }),
            output: Mutex::new(PtyOutput {
                record: OutputRecord::new(defaults.max_output_bytes),
                screen: Box::new(Vt100Screen::new(cols, rows, defaults.scrollback_lines)),
            }),
            master: tokio::sync::Mutex::new(Some(pair.master)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            child_exited: Arc::new(AtomicBool::new(false)),
            reader_cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            on_exit: Mutex::new(on_exit),
            options,
        });

        pty.lock_state().status = PtyStatus::Active;

        let reader_task = pty.start_read_loop(reader);
        pty.start_exit_watcher(child, reader_task);

        info!(
            pty_id = %pty.id,
            pid = ?pid,
            executable = %pty.options.executable,
            cols = cols,
            rows = rows,
            "Spawned PTY process"
        );

        Ok(pty)
    }

    /// Returns the PTY id.
    pub fn id(&self) -> &PtyId {
        &self.id
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the spawn options.
    pub fn options(&self) -> &PtyOptions {
        &self.options
    }

    /// Returns when the PTY was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the current status.
    pub fn status(&self) -> PtyStatus {
        let mut state = self.lock_state();
        state.refresh_idle(self.idle_timeout);
        state.status
    }

    /// Returns the exit code, once the child has exited.
    ///
    /// Death by signal (including our own SIGTERM/SIGKILL) reads as `1` and
    /// cannot be told apart from `exit 1`; check whether [`kill`](Self::kill)
    /// was called if the difference matters.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    /// Returns the time of the last input or output.
    pub fn last_activity(&self) -> SystemTime {
        self.lock_state().last_activity
    }

    /// Returns the current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        let state = self.lock_state();
        (state.cols, state.rows)
    }

    /// Returns a snapshot for status reporting.
    pub fn info(&self) -> PtyInfo {
        let output_bytes = self.lock_output().record.total_bytes();
        let mut state = self.lock_state();
        state.refresh_idle(self.idle_timeout);

        PtyInfo {
            id: self.id.clone(),
            status: state.status,
            executable: self.options.executable.clone(),
            args: self.options.args.clone(),
            pid: self.pid,
            cols: state.cols,
            rows: state.rows,
            created_at: self.created_at,
            last_activity: state.last_activity,
            exit_code: state.exit_code,
            output_bytes,
        }
    }

    /// Writes data to the PTY input, as if typed at the terminal.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut guard = self.writer.lock().await;

        if self.lock_state().status.is_stopping() {
            return Err(PtyError::StaleProcess(self.id.clone()));
        }
        let writer = guard
            .as_mut()
            .ok_or_else(|| PtyError::StaleProcess(self.id.clone()))?;

        writer.write_all(data)?;
        writer.flush()?;
        drop(guard);

        self.lock_state().touch();
        Ok(())
    }

    /// Resizes the PTY and its screen.
    ///
    /// A no-op once the process has terminated.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize { cols, rows });
        }

        match self.status() {
            PtyStatus::Terminated => return Ok(()),
            PtyStatus::Terminating => return Err(PtyError::StaleProcess(self.id.clone())),
            _ => {}
        }

        {
            let master = self.master.lock().await;
            let Some(master) = master.as_ref() else {
                return Ok(());
            };
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| PtyError::Resize(e.to_string()))?;
        }

        self.lock_output().screen.resize(cols, rows);
        {
            let mut state = self.lock_state();
            state.cols = cols;
            state.rows = rows;
        }

        debug!(pty_id = %self.id, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    /// Returns everything captured so far.
    ///
    /// With `strip_ansi` false this is the raw output, escape sequences
    /// intact. With `strip_ansi` true it is the screen's plain-text
    /// rendering. Never waits for more output.
    pub fn get_output_buffer(&self, strip_ansi: bool) -> String {
        let mut output = self.lock_output();
        if strip_ansi {
            output.screen.render_plain_text()
        } else {
            output.record.text()
        }
    }

    /// Returns the raw captured bytes.
    pub fn output_bytes(&self) -> Vec<u8> {
        self.lock_output().record.bytes()
    }

    /// Returns the visible screen with formatting escapes.
    pub fn render_screen(&self) -> Vec<u8> {
        self.lock_output().screen.render_formatted()
    }

    /// Starts terminating the process.
    ///
    /// Sends SIGTERM to the child's process group and arms a background
    /// timer that sends SIGKILL if the child is still alive after the grace
    /// period. Returns `true` if this call started termination and `false`
    /// if the process was already terminating or terminated.
    pub fn kill(self: &Arc<Self>) -> bool {
        {
            let mut state = self.lock_state();
            if state.status.is_stopping() {
                debug!(pty_id = %self.id, status = %state.status, "Kill ignored");
                return false;
            }
            state.status = PtyStatus::Terminating;
        }

        info!(pty_id = %self.id, pid = ?self.pid, "Terminating PTY process");
        self.send_signal(Signal::SIGTERM);

        let pty = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = pty.terminated.cancelled() => {
                    debug!(pty_id = %pty.id, "Process exited within grace period");
                }
                _ = tokio::time::sleep(pty.kill_grace) => {
                    if !pty.child_exited.load(Ordering::Acquire) {
                        warn!(
                            pty_id = %pty.id,
                            grace_ms = pty.kill_grace.as_millis() as u64,
                            "Process ignored SIGTERM, sending SIGKILL"
                        );
                        pty.send_signal(Signal::SIGKILL);
                    }
                }
            }
        });

        true
    }

    /// Waits until the process has terminated and returns its exit code.
    pub async fn wait_for_exit(&self) -> Option<i32> {
        self.terminated.cancelled().await;
        self.exit_code()
    }

    /// Whether the process has reached `Terminated`.
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    fn lock_state(&self) -> MutexGuard<'_, PtyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_output(&self) -> MutexGuard<'_, PtyOutput> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_output(&self, data: &[u8]) {
        {
            let mut output = self.lock_output();
            output.record.append(data);
            output.screen.feed(data);
        }
        self.lock_state().touch();
    }

    /// Sends a signal to the child's process group, falling back to the
    /// child alone. Failures are logged and otherwise ignored.
    fn send_signal(&self, signal: Signal) {
        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            warn!(pty_id = %self.id, signal = %signal, "No usable pid, cannot send signal");
            return;
        };
        if self.child_exited.load(Ordering::Acquire) {
            debug!(pty_id = %self.id, signal = %signal, "Child already exited, skipping signal");
            return;
        }

        // The child is a session leader, so its pid is also its process group.
        let pid = Pid::from_raw(pid);
        if let Err(group_err) = killpg(pid, signal) {
            debug!(pty_id = %self.id, error = %group_err, "killpg failed, signalling child directly");
            if let Err(e) = kill(pid, signal) {
                warn!(pty_id = %self.id, signal = %signal, error = %e, "Failed to signal process");
                return;
            }
        }
        debug!(pty_id = %self.id, signal = %signal, "Sent signal");
    }

    /// Starts the read loop for capturing output.
    ///
    /// Each read runs on the blocking pool; the loop ends on EOF, on a read
    /// error, or when the reader is cancelled.
    fn start_read_loop(self: &Arc<Self>, reader: Box<dyn Read + Send>) -> JoinHandle<()> {
        let pty = Arc::clone(self);
        let reader = Arc::new(Mutex::new(reader));

        tokio::spawn(async move {
            loop {
                let reader_clone = Arc::clone(&reader);
                let read = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader_clone.lock().unwrap_or_else(PoisonError::into_inner);
                    reader.read(&mut buffer).map(|n| {
                        buffer.truncate(n);
                        buffer
                    })
                });

                let result = tokio::select! {
                    _ = pty.reader_cancel.cancelled() => {
                        debug!(pty_id = %pty.id, "Read loop cancelled");
                        break;
                    }
                    result = read => result,
                };

                match result {
                    Ok(Ok(data)) if data.is_empty() => {
                        debug!(pty_id = %pty.id, "PTY EOF");
                        break;
                    }
                    Ok(Ok(data)) => pty.record_output(&data),
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Ok(Err(e)) => {
                        // Linux reports EIO once every slave fd is closed.
                        debug!(pty_id = %pty.id, error = %e, "PTY read ended");
                        break;
                    }
                    Err(e) => {
                        error!(pty_id = %pty.id, error = %e, "Read task panicked");
                        break;
                    }
                }
            }
        })
    }

    /// Reaps the child, lets the reader drain, then finishes termination.
    fn start_exit_watcher(
        self: &Arc<Self>,
        mut child: Box<dyn Child + Send + Sync>,
        reader_task: JoinHandle<()>,
    ) {
        let pty = Arc::clone(self);
        let child_exited = Arc::clone(&self.child_exited);

        tokio::spawn(async move {
            let waited = tokio::task::spawn_blocking(move || {
                let status = child.wait();
                child_exited.store(true, Ordering::Release);
                status
            })
            .await;

            let exit_code = match waited {
                // Signal deaths arrive as code 1; the signal itself is not kept.
                Ok(Ok(status)) => Some(status.exit_code() as i32),
                Ok(Err(e)) => {
                    warn!(pty_id = %pty.id, error = %e, "Failed to wait for child");
                    None
                }
                Err(e) => {
                    error!(pty_id = %pty.id, error = %e, "Exit watcher panicked");
                    None
                }
            };

            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task)
                .await
                .is_err()
            {
                debug!(pty_id = %pty.id, "PTY still open after child exit, stopping reader");
            }

            pty.finish(exit_code).await;
        });
    }

    /// Records the exit, releases OS handles and notifies the exit observer.
    async fn finish(&self, exit_code: Option<i32>) {
        {
            let mut state = self.lock_state();
            state.status = PtyStatus::Terminated;
            state.exit_code = exit_code;
        }

        self.reader_cancel.cancel();
        self.writer.lock().await.take();
        self.master.lock().await.take();
        self.terminated.cancel();

        info!(pty_id = %self.id, exit_code = ?exit_code, "PTY process terminated");

        let observer = self
            .on_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(observer) = observer {
            observer(&self.id);
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("executable", &self.options.executable)
            .field("status", &self.lock_state().status)
            .finish()
    }
}

/// Builds the command for `options`.
///
/// In shell mode the executable is taken as a command line and the
/// arguments are quoted onto it. Otherwise the executable is resolved on
/// `PATH` (or relative to `cwd`) so a missing program fails here rather
/// than as a child that exits immediately.
fn build_command(options: &PtyOptions, shell: &str) -> Result<CommandBuilder, PtyError> {
    if options.executable.trim().is_empty() {
        return Err(PtyError::Spawn("executable must not be empty".to_string()));
    }

    if let Some(cwd) = &options.cwd {
        if !cwd.is_dir() {
            return Err(PtyError::Spawn(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }
    }

    let mut cmd = if options.shell_mode {
        let mut line = options.executable.clone();
        if !options.args.is_empty() {
            line.push(' ');
            line.push_str(&shell_words::join(&options.args));
        }
        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-c");
        cmd.arg(line);
        cmd
    } else {
        let program = resolve_executable(options)?;
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&options.args);
        cmd
    };

    if let Some(cwd) = &options.cwd {
        cmd.cwd(cwd);
    }

    cmd.env("TERM", "xterm-256color");
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    Ok(cmd)
}

fn resolve_executable(options: &PtyOptions) -> Result<PathBuf, PtyError> {
    let cwd = match &options.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()?,
    };
    let search_path = options
        .env
        .get("PATH")
        .map(|path| path.into())
        .or_else(|| std::env::var_os("PATH"));

    which::which_in(Path::new(&options.executable), search_path, &cwd).map_err(|e| {
        PtyError::Spawn(format!(
            "executable not found: {} ({e})",
            options.executable
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn defaults() -> PtyDefaults {
        PtyDefaults {
            shell: "/bin/sh".to_string(),
            ..PtyDefaults::default()
        }
    }

    fn spawn(options: PtyOptions) -> Arc<PtyProcess> {
        PtyProcess::spawn("test-pty".to_string(), options, &defaults(), None)
            .expect("Failed to spawn PTY")
    }

    /// Polls the output buffer until it contains `needle`.
    async fn wait_for_output(pty: &PtyProcess, needle: &str, strip_ansi: bool) -> bool {
        for _ in 0..50 {
            if pty.get_output_buffer(strip_ansi).contains(needle) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[test]
    fn test_status_display() {
        assert_eq!(PtyStatus::Active.to_string(), "active");
        assert_eq!(PtyStatus::Terminating.to_string(), "terminating");
        assert!(PtyStatus::Terminated.is_stopping());
        assert!(!PtyStatus::Idle.is_stopping());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&PtyStatus::Idle).unwrap();
        assert_eq!(json, "\"idle\"");
    }

    #[test]
    fn test_options_builder() {
        let options = PtyOptions::new("ls")
            .args(["-l", "-a"])
            .cwd("/tmp")
            .env("FOO", "bar")
            .shell_mode(true)
            .auto_dispose_on_exit(true)
            .size(100, 30);

        assert_eq!(options.args, vec!["-l", "-a"]);
        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.env.get("FOO").map(String::as_str), Some("bar"));
        assert!(options.shell_mode);
        assert!(options.auto_dispose_on_exit);
        assert_eq!((options.cols, options.rows), (Some(100), Some(30)));
    }

    #[test]
    fn test_build_command_rejects_empty_executable() {
        let result = build_command(&PtyOptions::new("  "), "/bin/sh");
        assert!(matches!(result, Err(PtyError::Spawn(_))));
    }

    #[test]
    fn test_build_command_rejects_missing_cwd() {
        let options = PtyOptions::new("sh").cwd("/definitely/not/here");
        let result = build_command(&options, "/bin/sh");
        assert!(matches!(result, Err(PtyError::Spawn(_))));
    }

    #[test]
    fn test_build_command_rejects_unknown_program() {
        let options = PtyOptions::new("no-such-program-ptyhost-test");
        let result = build_command(&options, "/bin/sh");
        assert!(matches!(result, Err(PtyError::Spawn(_))));
    }

    #[test]
    fn test_build_command_shell_mode_quotes_args() {
        let options = PtyOptions::new("echo")
            .args(["a b", "c"])
            .shell_mode(true);
        let cmd = build_command(&options, "/bin/sh").unwrap();
        let argv: Vec<String> = cmd
            .get_argv()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo 'a b' c"]);
    }

    #[tokio::test]
    async fn test_spawn_is_active() {
        let pty = spawn(PtyOptions::new("cat"));
        assert_eq!(pty.status(), PtyStatus::Active);
        assert!(pty.pid().is_some());
        assert_eq!(pty.size(), (80, 24));

        pty.kill();
        let _ = timeout(Duration::from_secs(5), pty.wait_for_exit()).await;
    }

    #[tokio::test]
    async fn test_spawn_zero_size_rejected() {
        let result = PtyProcess::spawn(
            "p".to_string(),
            PtyOptions::new("cat").size(0, 24),
            &defaults(),
            None,
        );
        assert!(matches!(result, Err(PtyError::InvalidSize { .. })));
    }

    #[tokio::test]
    async fn test_write_echoes_through_cat() {
        let pty = spawn(PtyOptions::new("cat"));

        pty.write(b"abc\n").await.unwrap();
        assert!(wait_for_output(&pty, "abc\r\n", false).await);
        assert!(wait_for_output(&pty, "abc\n", true).await);

        pty.kill();
        let _ = timeout(Duration::from_secs(5), pty.wait_for_exit()).await;
    }

    #[tokio::test]
    async fn test_exit_code_recorded() {
        let pty = spawn(PtyOptions::new("/bin/sh").args(["-c", "exit 7"]));
        let code = timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");
        assert_eq!(code, Some(7));
        assert_eq!(pty.status(), PtyStatus::Terminated);
    }

    #[tokio::test]
    async fn test_signal_death_reports_failure_code() {
        let pty = spawn(PtyOptions::new("cat"));
        assert!(pty.kill());
        let code = timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("SIGTERM should end cat");
        assert_eq!(code, Some(1));
        assert_eq!(pty.info().exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_render_screen_keeps_formatting() {
        let pty = spawn(
            PtyOptions::new("/bin/sh").args(["-c", "printf '\\033[31mred\\033[0m plain\\n'"]),
        );
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");

        let screen = String::from_utf8_lossy(&pty.render_screen()).into_owned();
        assert!(screen.contains("red"));
        assert!(screen.contains("plain"));
        assert!(screen.contains('\x1b'));
        assert!(screen.contains("31m"));
        assert!(pty.get_output_buffer(true).contains("red plain"));
    }

    #[tokio::test]
    async fn test_output_drained_before_terminated() {
        let pty = spawn(PtyOptions::new("/bin/sh").args(["-c", "printf 'last words\\n'"]));
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");
        assert!(pty.get_output_buffer(false).contains("last words"));
        assert!(pty.get_output_buffer(true).contains("last words\n"));
    }

    #[tokio::test]
    async fn test_ansi_stripped_view() {
        let pty = spawn(
            PtyOptions::new("/bin/sh").args(["-c", "printf '\\033[31mred\\033[0m\\n'"]),
        );
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");

        let raw = pty.get_output_buffer(false);
        assert!(raw.contains("\x1b[31mred\x1b[0m"));

        let plain = pty.get_output_buffer(true);
        assert!(plain.contains("red\n"));
        assert!(!plain.contains('\x1b'));
    }

    #[tokio::test]
    async fn test_shell_mode_runs_command_line() {
        let pty = spawn(
            PtyOptions::new("echo one && echo")
                .args(["two words"])
                .shell_mode(true),
        );
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");
        let plain = pty.get_output_buffer(true);
        assert!(plain.contains("one\ntwo words\n"), "got {plain:?}");
    }

    #[tokio::test]
    async fn test_env_override() {
        let pty = spawn(
            PtyOptions::new("echo $PTYHOST_TEST_VAR")
                .shell_mode(true)
                .env("PTYHOST_TEST_VAR", "from_env"),
        );
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");
        assert!(pty.get_output_buffer(true).contains("from_env"));
    }

    #[tokio::test]
    async fn test_write_after_exit_is_stale() {
        let pty = spawn(PtyOptions::new("/bin/sh").args(["-c", "exit 0"]));
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");

        let result = pty.write(b"hello\n").await;
        assert!(matches!(result, Err(PtyError::StaleProcess(_))));
    }

    #[tokio::test]
    async fn test_write_while_terminating_is_stale() {
        let pty = spawn(PtyOptions::new("cat"));
        assert!(pty.kill());
        let result = pty.write(b"late\n").await;
        assert!(matches!(result, Err(PtyError::StaleProcess(_))));
        let _ = timeout(Duration::from_secs(5), pty.wait_for_exit()).await;
    }

    #[tokio::test]
    async fn test_resize() {
        let pty = spawn(PtyOptions::new("cat"));
        pty.resize(120, 40).await.unwrap();
        assert_eq!(pty.size(), (120, 40));
        assert_eq!(pty.info().cols, 120);

        let result = pty.resize(0, 40).await;
        assert!(matches!(result, Err(PtyError::InvalidSize { .. })));

        pty.kill();
        let _ = timeout(Duration::from_secs(5), pty.wait_for_exit()).await;
    }

    #[tokio::test]
    async fn test_resize_after_exit_is_noop() {
        let pty = spawn(PtyOptions::new("/bin/sh").args(["-c", "exit 0"]));
        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("process should exit");
        assert!(pty.resize(100, 50).await.is_ok());
        assert_eq!(pty.size(), (80, 24));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let pty = spawn(PtyOptions::new("cat"));

        assert!(pty.kill());
        assert!(!pty.kill());
        assert_eq!(pty.status(), PtyStatus::Terminating);

        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("cat should exit on SIGTERM");
        assert_eq!(pty.status(), PtyStatus::Terminated);
        assert!(!pty.kill());
    }

    #[tokio::test]
    async fn test_kill_escalates_after_grace() {
        let defaults = PtyDefaults {
            kill_grace: Duration::from_millis(500),
            ..defaults()
        };
        let pty = PtyProcess::spawn(
            "stubborn".to_string(),
            PtyOptions::new("/bin/sh").args(["-c", "trap '' TERM; echo ready; while :; do sleep 1; done"]),
            &defaults,
            None,
        )
        .unwrap();
        assert!(wait_for_output(&pty, "ready", true).await);

        let started = Instant::now();
        pty.kill();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pty.status(), PtyStatus::Terminating);

        timeout(Duration::from_secs(5), pty.wait_for_exit())
            .await
            .expect("SIGKILL should end the process");
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(pty.status(), PtyStatus::Terminated);
    }

    #[tokio::test]
    async fn test_exit_observer_fires_once() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pty = PtyProcess::spawn(
            "observed".to_string(),
            PtyOptions::new("/bin/sh").args(["-c", "exit 0"]),
            &defaults(),
            Some(Box::new(move |id: &PtyId| {
                let _ = tx.send(id.clone());
            })),
        )
        .unwrap();

        let id = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("observer should fire");
        assert_eq!(id.as_deref(), Some("observed"));
        assert!(rx.recv().await.is_none());
        assert!(pty.is_terminated());
    }

    #[tokio::test]
    async fn test_idle_toggle() {
        let defaults = PtyDefaults {
            idle_timeout: Some(Duration::from_millis(200)),
            ..defaults()
        };
        let pty = PtyProcess::spawn("idle".to_string(), PtyOptions::new("cat"), &defaults, None)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pty.status(), PtyStatus::Idle);

        pty.write(b"x").await.unwrap();
        assert_eq!(pty.status(), PtyStatus::Active);

        pty.kill();
        let _ = timeout(Duration::from_secs(5), pty.wait_for_exit()).await;
    }

    #[tokio::test]
    async fn test_info_snapshot() {
        let pty = spawn(PtyOptions::new("cat").args(Vec::<String>::new()));
        let info = pty.info();
        assert_eq!(info.id, "test-pty");
        assert_eq!(info.executable, "cat");
        assert_eq!(info.status, PtyStatus::Active);
        assert!(info.exit_code.is_none());
        assert!(info.last_activity >= info.created_at);

        pty.kill();
        let _ = timeout(Duration::from_secs(5), pty.wait_for_exit()).await;
    }
}
