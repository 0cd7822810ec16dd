//! Language Server Process Supervision
//!
//! Owns one child process and its three standard streams:
//! - stdout and stderr are drained by independent tasks, in bounded chunks
//! - a reaper task owns the `Child` and waits on it
//! - exit is published exactly once through [`ExitSignal`], by whichever of the
//!   stdout drain (end of stream) or a wait call gets there first
//! - the background waiter holds its publish until stdout is drained, bounded
//!   by `exit_grace`, so output already written is delivered before the exit
//!
//! On unix the child leads its own process group so cancellation reaches every
//! descendant it forked.

use std::io;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};

use crate::error::{TransportError, WriteError};

pub type StdoutHandler = Box<dyn FnMut(&[u8]) -> ControlFlow<()> + Send>;
pub type StderrHandler = Box<dyn FnMut(&[u8]) + Send>;
pub type ExitHandler = Box<dyn FnOnce(&ProcessExit) + Send>;

/// Executable, arguments and working directory of the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Upper bound for a single read from stdout or stderr
    pub read_chunk_size: usize,
    /// Bound on joining the background tasks during disposal
    pub join_timeout: Duration,
    /// How long stdout may stay closed before a still-running child is killed
    pub exit_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024,
            join_timeout: Duration::from_secs(1),
            exit_grace: Duration::from_secs(2),
        }
    }
}

/// Callbacks invoked from the drain tasks
pub struct StreamHandlers {
    stdout: StdoutHandler,
    stderr: Option<StderrHandler>,
    exit: Option<ExitHandler>,
}

impl StreamHandlers {
    /// `stdout` receives raw chunks, not aligned to any framing. Returning
    /// `Break` stops the drain and cancels the process.
    pub fn new<F>(stdout: F) -> Self
    where
        F: FnMut(&[u8]) -> ControlFlow<()> + Send + 'static,
    {
        Self {
            stdout: Box::new(stdout),
            stderr: None,
            exit: None,
        }
    }

    /// Without a stderr handler the child's stderr is discarded.
    pub fn on_stderr<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.stderr = Some(Box::new(handler));
        self
    }

    pub fn on_exit<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&ProcessExit) + Send + 'static,
    {
        self.exit = Some(Box::new(handler));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSource {
    StdoutClosed,
    Waited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Termination was asked for through `stop`, `cancel` or disposal
    pub requested: bool,
    pub source: ExitSource,
}

impl ProcessExit {
    fn unknown(source: ExitSource) -> Self {
        Self {
            code: None,
            signal: None,
            requested: false,
            source,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn is_unexpected(&self) -> bool {
        !self.requested
    }

    pub fn to_error(&self) -> TransportError {
        if self.requested {
            TransportError::Cancelled
        } else {
            TransportError::UnexpectedExit {
                code: self.code,
                signal: self.signal,
            }
        }
    }
}

/// One-shot exit latch. The first publisher wins; every observer sees its value.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    slot: Arc<watch::Sender<Option<ProcessExit>>>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Publish `exit`. Returns false if an exit was already published.
    pub(crate) fn fire(&self, exit: ProcessExit) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(exit);
            true
        })
    }

    pub fn get(&self) -> Option<ProcessExit> {
        self.slot.borrow().clone()
    }

    pub fn has_fired(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.slot.subscribe();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(|| ProcessExit::unknown(ExitSource::Waited))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Reaped {
    code: Option<i32>,
    signal: Option<i32>,
}

impl From<ExitStatus> for Reaped {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

struct Shared {
    pid: Option<u32>,
    exit: ExitSignal,
    reaped: watch::Receiver<Option<Reaped>>,
    stdout_drained: watch::Sender<bool>,
    on_exit: std::sync::Mutex<Option<ExitHandler>>,
    stop_requested: AtomicBool,
    cancel_requested: AtomicBool,
    cancel: Notify,
    exit_grace: Duration,
}

impl Shared {
    /// Kill the process tree. Never waits for the process to die.
    fn cancel(&self, requested: bool) {
        if requested {
            self.stop_requested.store(true, Ordering::Release);
        }
        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        // A reaped leader's group id may already belong to someone else
        if self.reaped.borrow().is_some() {
            tracing::debug!("Process {:?} already reaped, not signalling", self.pid);
        } else if let Some(pid) = self.pid {
            tracing::debug!("Cancelling process {:?}", self.pid);
            kill_tree(pid);
        }
        self.cancel.notify_one();
    }

    async fn reaped(&self) -> Reaped {
        let mut rx = self.reaped.clone();
        let reaped = match rx.wait_for(Option::is_some).await {
            Ok(slot) => *slot,
            Err(_) => None,
        };
        reaped.unwrap_or_default()
    }

    async fn observe_exit(&self, source: ExitSource) -> ProcessExit {
        if let Some(exit) = self.exit.get() {
            return exit;
        }
        let reaped = self.reaped().await;
        self.publish(reaped, source)
    }

    /// Publish from the background waiter once stdout has been drained, or
    /// after `exit_grace` if a descendant keeps it open.
    async fn observe_reaped(&self) -> ProcessExit {
        let reaped = self.reaped().await;
        if let Some(exit) = self.exit.get() {
            return exit;
        }
        let mut drained = self.stdout_drained.subscribe();
        if timeout(self.exit_grace, drained.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::debug!(
                "Process {:?} exited but stdout is still open after {:?}",
                self.pid,
                self.exit_grace
            );
        }
        self.publish(reaped, ExitSource::Waited)
    }

    async fn observe_stdout_closed(&self) -> ProcessExit {
        if let Some(exit) = self.exit.get() {
            return exit;
        }
        let reaped = match timeout(self.exit_grace, self.reaped()).await {
            Ok(reaped) => reaped,
            Err(_) => {
                tracing::warn!(
                    "Process {:?} closed stdout but is still running, terminating",
                    self.pid
                );
                self.cancel(false);
                self.reaped().await
            }
        };
        self.publish(reaped, ExitSource::StdoutClosed)
    }

    fn publish(&self, reaped: Reaped, source: ExitSource) -> ProcessExit {
        let exit = ProcessExit {
            code: reaped.code,
            signal: reaped.signal,
            requested: self.stop_requested.load(Ordering::Acquire),
            source,
        };

        if !self.exit.fire(exit.clone()) {
            return self.exit.get().unwrap_or(exit);
        }

        if exit.requested {
            tracing::debug!("Process {:?} exited: {:?}", self.pid, exit);
        } else {
            tracing::warn!("Process {:?} exited unexpectedly: {:?}", self.pid, exit);
        }

        let handler = self
            .on_exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler
            && catch_unwind(AssertUnwindSafe(|| handler(&exit))).is_err()
        {
            tracing::error!("Exit handler panicked");
        }
        exit
    }
}

#[derive(Default)]
struct Tasks {
    reaper: Option<JoinHandle<()>>,
    waiter: Option<JoinHandle<()>>,
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl Tasks {
    fn drain(&mut self) -> Vec<JoinHandle<()>> {
        [
            self.stdout.take(),
            self.stderr.take(),
            self.waiter.take(),
            self.reaper.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Supervisor for one child process
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    stdin: Mutex<Option<ChildStdin>>,
    tasks: std::sync::Mutex<Tasks>,
    join_timeout: Duration,
    disposed: AtomicBool,
}

impl ProcessSupervisor {
    /// Spawn the child and its drain tasks. Must be called inside a tokio runtime.
    pub fn start(
        spec: &ProcessSpec,
        settings: &SupervisorSettings,
        handlers: StreamHandlers,
    ) -> Result<Self, TransportError> {
        let StreamHandlers {
            stdout: on_stdout,
            stderr: on_stderr,
            exit: on_exit,
        } = handlers;

        tracing::info!("Starting process: {} {:?}", spec.command, spec.args);

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if on_stderr.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let spawn_error = |source: io::Error| TransportError::Spawn {
            command: spec.command.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_error)?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdout was not captured")))?;
        let stderr = child.stderr.take();

        let (reaped_tx, reaped_rx) = watch::channel(None);
        let (stdout_drained, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            pid: child.id(),
            exit: ExitSignal::new(),
            reaped: reaped_rx,
            stdout_drained,
            on_exit: std::sync::Mutex::new(on_exit),
            stop_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            cancel: Notify::new(),
            exit_grace: settings.exit_grace,
        });

        let chunk_size = settings.read_chunk_size.max(1);
        let mut tasks = Tasks {
            reaper: Some(tokio::spawn(reap(child, Arc::clone(&shared), reaped_tx))),
            stdout: Some(tokio::spawn(drain_stdout(
                Arc::clone(&shared),
                stdout,
                chunk_size,
                on_stdout,
            ))),
            ..Tasks::default()
        };
        if let (Some(stderr), Some(on_stderr)) = (stderr, on_stderr) {
            tasks.stderr = Some(tokio::spawn(drain_stderr(stderr, chunk_size, on_stderr)));
        }
        let waiter = Arc::clone(&shared);
        tasks.waiter = Some(tokio::spawn(async move {
            waiter.observe_reaped().await;
        }));

        tracing::debug!("Process started with pid {:?}", shared.pid);

        Ok(Self {
            shared,
            stdin: Mutex::new(stdin),
            tasks: std::sync::Mutex::new(tasks),
            join_timeout: settings.join_timeout,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn exit_signal(&self) -> ExitSignal {
        self.shared.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.shared.exit.has_fired()
    }

    /// Wait for the process to exit and publish it if nobody has yet.
    pub async fn wait(&self) -> ProcessExit {
        self.shared.observe_exit(ExitSource::Waited).await
    }

    /// Write to the child's stdin. Concurrent writers are serialized, so one
    /// call's bytes are never interleaved with another's.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let exit = &self.shared.exit;
        if exit.has_fired() {
            return Err(WriteError::ProcessExited);
        }

        let mut guard = tokio::select! {
            guard = self.stdin.lock() => guard,
            _ = exit.wait() => return Err(WriteError::ProcessExited),
        };

        let result = {
            let stdin = guard.as_mut().ok_or(WriteError::PipeClosed)?;
            tokio::select! {
                result = async {
                    stdin.write_all(bytes).await?;
                    stdin.flush().await
                } => result,
                _ = exit.wait() => return Err(WriteError::ProcessExited),
            }
        };

        match result {
            Ok(()) => {
                tracing::trace!("Wrote {} bytes to process {:?}", bytes.len(), self.pid());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                guard.take();
                if exit.has_fired() {
                    Err(WriteError::ProcessExited)
                } else {
                    Err(WriteError::PipeClosed)
                }
            }
            Err(err) => Err(WriteError::Io(err)),
        }
    }

    /// Mark the coming exit as intentional without killing anything, for
    /// children asked to exit through their own protocol.
    pub fn expect_exit(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
    }

    /// Request termination of the process tree. Idempotent and non-blocking;
    /// observe the exit through [`ExitSignal`].
    pub fn cancel(&self) {
        self.shared.cancel(true);
    }

    /// Close stdin and cancel, then wait up to `wait` for the exit to be
    /// published. Returns `None` when the exit was not confirmed in time.
    pub async fn stop(&self, wait: Option<Duration>) -> Option<ProcessExit> {
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
        self.cancel();

        let Some(wait) = wait else {
            return self.shared.exit.get();
        };
        match timeout(wait, self.shared.exit.wait()).await {
            Ok(exit) => Some(exit),
            Err(_) => {
                tracing::warn!(
                    "Process {:?} did not exit within {:?} after cancellation",
                    self.pid(),
                    wait
                );
                None
            }
        }
    }

    /// Tear down: cancel if still running, release stdin, and join the
    /// background tasks within the join timeout. A second call does nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.has_exited() {
            self.cancel();
        }

        let deadline = Instant::now() + self.join_timeout;
        if let Ok(mut stdin) = timeout_at(deadline, self.stdin.lock()).await {
            stdin.take();
        }

        let handles = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for mut handle in handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        tracing::debug!("Process supervisor for {:?} disposed", self.pid());
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if !self.has_exited() {
            self.shared.cancel(true);
            tracing::debug!("Supervisor for {:?} dropped, process killed", self.pid());
        }
        // The reaper and waiter finish on their own once the process is gone;
        // a descendant holding stdout open would keep the drains alive forever.
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in [tasks.stdout.take(), tasks.stderr.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

async fn reap(mut child: Child, shared: Arc<Shared>, reaped: watch::Sender<Option<Reaped>>) {
    let exited = tokio::select! {
        result = child.wait() => Some(result),
        _ = shared.cancel.notified() => None,
    };

    let result = match exited {
        Some(result) => result,
        None => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("start_kill for {:?} failed: {}", shared.pid, e);
            }
            child.wait().await
        }
    };

    let status = match result {
        Ok(status) => Reaped::from(status),
        Err(e) => {
            tracing::warn!("Waiting on process {:?} failed: {}", shared.pid, e);
            Reaped::default()
        }
    };
    reaped.send_replace(Some(status));
}

async fn drain_stdout<R>(
    shared: Arc<Shared>,
    mut reader: R,
    chunk_size: usize,
    mut on_data: StdoutHandler,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                tracing::debug!("Process {:?} closed stdout", shared.pid);
                break;
            }
            Ok(n) => match catch_unwind(AssertUnwindSafe(|| on_data(&buffer[..n]))) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => {
                    tracing::debug!("Stdout handler stopped the drain for {:?}", shared.pid);
                    shared.cancel(false);
                    break;
                }
                Err(_) => tracing::error!("Stdout handler panicked"),
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Stdout read error for {:?}: {}", shared.pid, e);
                break;
            }
        }
    }
    drop(reader);
    shared.stdout_drained.send_replace(true);
    shared.observe_stdout_closed().await;
}

/// Stderr never decides anything about the process: end of stream and read
/// errors only end this loop.
async fn drain_stderr<R>(mut reader: R, chunk_size: usize, mut on_data: StderrHandler)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if catch_unwind(AssertUnwindSafe(|| on_data(&buffer[..n]))).is_err() {
                    tracing::error!("Stderr handler panicked");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Stderr read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // The child leads its own process group, so its descendants share `pgid`
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("Failed to kill process group {}: {}", pgid, err);
        }
    }
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    let spawned = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        tracing::warn!("Failed to run taskkill for {}: {}", pid, e);
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_tree(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").with_args(["-c", script])
    }

    fn collecting() -> (StreamHandlers, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = StreamHandlers::new(move |chunk: &[u8]| {
            let _ = tx.send(chunk.to_vec());
            ControlFlow::Continue(())
        });
        (handlers, rx)
    }

    fn counting(handlers: StreamHandlers) -> (StreamHandlers, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handlers = handlers.on_exit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handlers, count)
    }

    async fn read_until(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, expected: &[u8]) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < expected.len() {
            match timeout(WAIT, rx.recv()).await {
                Ok(Some(chunk)) => received.extend(chunk),
                _ => break,
            }
        }
        received
    }

    async fn read_line(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> String {
        let mut received = Vec::new();
        while !received.contains(&b'\n') {
            match timeout(WAIT, rx.recv()).await {
                Ok(Some(chunk)) => received.extend(chunk),
                _ => break,
            }
        }
        String::from_utf8(received).unwrap()
    }

    #[test]
    fn test_process_spec_builder() {
        let spec = ProcessSpec::new("node")
            .with_arg("server.js")
            .with_args(["--stdio"])
            .with_working_dir("/tmp");
        assert_eq!(spec.command, "node");
        assert_eq!(spec.args, vec!["server.js", "--stdio"]);
        assert_eq!(spec.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exit_signal_fires_once() {
        let signal = ExitSignal::new();
        let mut racers = Vec::new();
        for source in [ExitSource::StdoutClosed, ExitSource::Waited] {
            for _ in 0..8 {
                let signal = signal.clone();
                racers.push(tokio::spawn(async move {
                    signal.fire(ProcessExit {
                        code: Some(0),
                        signal: None,
                        requested: false,
                        source,
                    })
                }));
            }
        }

        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(signal.has_fired());
        assert_eq!(signal.wait().await, signal.get().unwrap());
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let (handlers, _rx) = collecting();
        let result = ProcessSupervisor::start(
            &ProcessSpec::new("/nonexistent/lspipe-test-binary"),
            &SupervisorSettings::default(),
            handlers,
        );
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_write_reaches_stdout() {
        let (handlers, mut rx) = collecting();
        let supervisor =
            ProcessSupervisor::start(&ProcessSpec::new("cat"), &SupervisorSettings::default(), handlers)
                .unwrap();

        supervisor.write(b"hello over stdin").await.unwrap();
        assert_eq!(read_until(&mut rx, b"hello over stdin").await, b"hello over stdin");

        let exit = supervisor.stop(Some(WAIT)).await.expect("exit confirmed");
        assert!(exit.requested);
        supervisor.dispose().await;
    }

    #[tokio::test]
    async fn test_stderr_is_delivered_separately() {
        let (handlers, mut stdout_rx) = collecting();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let handlers = handlers.on_stderr(move |chunk: &[u8]| {
            let _ = err_tx.send(chunk.to_vec());
        });
        let supervisor = ProcessSupervisor::start(
            &sh("echo oops >&2; echo fine"),
            &SupervisorSettings::default(),
            handlers,
        )
        .unwrap();

        assert_eq!(read_until(&mut err_rx, b"oops\n").await, b"oops\n");
        assert_eq!(read_until(&mut stdout_rx, b"fine\n").await, b"fine\n");

        let exit = timeout(WAIT, supervisor.exit_signal().wait()).await.unwrap();
        assert!(exit.success());
        assert!(exit.is_unexpected());
    }

    #[tokio::test]
    async fn test_stderr_close_is_not_exit() {
        let (handlers, mut rx) = collecting();
        let handlers = handlers.on_stderr(|_| {});
        let supervisor = ProcessSupervisor::start(
            &sh("exec 2>&-; sleep 0.3; echo still-here"),
            &SupervisorSettings::default(),
            handlers,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!supervisor.has_exited());
        assert_eq!(read_until(&mut rx, b"still-here\n").await, b"still-here\n");
        let exit = timeout(WAIT, supervisor.wait()).await.unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exit_notified_once_across_paths() {
        let (handlers, _rx) = collecting();
        let (handlers, count) = counting(handlers);
        let supervisor = Arc::new(
            ProcessSupervisor::start(&sh("exit 3"), &SupervisorSettings::default(), handlers)
                .unwrap(),
        );

        let mut waits = Vec::new();
        for _ in 0..4 {
            let supervisor = Arc::clone(&supervisor);
            waits.push(tokio::spawn(async move { supervisor.wait().await }));
        }
        for wait in waits {
            let exit = timeout(WAIT, wait).await.unwrap().unwrap();
            assert_eq!(exit.code, Some(3));
            assert!(!exit.requested);
        }

        supervisor.dispose().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cancel_is_idempotent() {
        let (handlers, _rx) = collecting();
        let (handlers, count) = counting(handlers);
        let supervisor = Arc::new(
            ProcessSupervisor::start(&sh("sleep 30"), &SupervisorSettings::default(), handlers)
                .unwrap(),
        );

        let first = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.cancel() })
        };
        let second = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.cancel() })
        };
        first.await.unwrap();
        second.await.unwrap();

        let exit = timeout(WAIT, supervisor.exit_signal().wait()).await.unwrap();
        assert!(exit.requested);
        assert_eq!(exit.signal, Some(libc::SIGKILL));

        supervisor.dispose().await;
        supervisor.dispose().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_after_exit_fails_fast() {
        let (handlers, _rx) = collecting();
        let supervisor =
            ProcessSupervisor::start(&sh("exit 0"), &SupervisorSettings::default(), handlers)
                .unwrap();
        timeout(WAIT, supervisor.wait()).await.unwrap();

        let result = timeout(WAIT, supervisor.write(b"late")).await.unwrap();
        assert!(matches!(result, Err(WriteError::ProcessExited)));
    }

    #[tokio::test]
    async fn test_stdout_closed_while_running_is_terminated() {
        let (handlers, _rx) = collecting();
        let settings = SupervisorSettings {
            exit_grace: Duration::from_millis(200),
            ..SupervisorSettings::default()
        };
        let supervisor =
            ProcessSupervisor::start(&sh("exec 1>&-; sleep 30"), &settings, handlers).unwrap();

        let exit = timeout(WAIT, supervisor.exit_signal().wait()).await.unwrap();
        assert!(exit.is_unexpected());
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_break_cancels_process() {
        let handlers = StreamHandlers::new(|_: &[u8]| ControlFlow::Break(()));
        let supervisor = ProcessSupervisor::start(
            &sh("echo first; sleep 30"),
            &SupervisorSettings::default(),
            handlers,
        )
        .unwrap();

        let exit = timeout(WAIT, supervisor.exit_signal().wait()).await.unwrap();
        assert!(exit.is_unexpected());
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exit_published_after_stdout_is_delivered() {
        let expected = b"last words before exit";
        for _ in 0..50 {
            let received = Arc::new(std::sync::Mutex::new(Vec::new()));
            let seen_at_exit = Arc::new(std::sync::Mutex::new(None));

            let sink = Arc::clone(&received);
            let snapshot = Arc::clone(&received);
            let at_exit = Arc::clone(&seen_at_exit);
            let handlers = StreamHandlers::new(move |chunk: &[u8]| {
                sink.lock().unwrap().extend_from_slice(chunk);
                ControlFlow::Continue(())
            })
            .on_exit(move |_| {
                *at_exit.lock().unwrap() = Some(snapshot.lock().unwrap().clone());
            });

            let supervisor = ProcessSupervisor::start(
                &sh("printf 'last words before exit'"),
                &SupervisorSettings::default(),
                handlers,
            )
            .unwrap();
            let exit = timeout(WAIT, supervisor.exit_signal().wait()).await.unwrap();
            assert!(exit.success());
            assert_eq!(
                seen_at_exit.lock().unwrap().as_deref(),
                Some(&expected[..]),
                "exit published before stdout was drained"
            );
            supervisor.dispose().await;
        }
    }

    #[tokio::test]
    async fn test_exit_published_when_descendant_holds_stdout() {
        let (handlers, _rx) = collecting();
        let settings = SupervisorSettings {
            exit_grace: Duration::from_millis(200),
            ..SupervisorSettings::default()
        };
        let supervisor =
            ProcessSupervisor::start(&sh("sleep 5 & exit 0"), &settings, handlers).unwrap();

        let exit = timeout(Duration::from_secs(3), supervisor.exit_signal().wait())
            .await
            .expect("exit held back past the grace period");
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.source, ExitSource::Waited);
        supervisor.dispose().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_after_reap_sends_no_signal() {
        let (handlers, mut rx) = collecting();
        let supervisor = ProcessSupervisor::start(
            &sh("sleep 30 </dev/null >/dev/null 2>&1 & echo $!"),
            &SupervisorSettings::default(),
            handlers,
        )
        .unwrap();

        let leftover: u32 = read_line(&mut rx).await.trim().parse().unwrap();
        let exit = timeout(WAIT, supervisor.exit_signal().wait()).await.unwrap();
        assert!(exit.success());

        // The leader is reaped; its old group id must not be signalled
        supervisor.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", leftover));
        let alive = stat.is_ok_and(|stat| stat.split_whitespace().nth(2) != Some("Z"));

        let pid = libc::pid_t::try_from(leftover).unwrap();
        unsafe { libc::kill(pid, libc::SIGKILL) };

        assert!(alive, "group signalled after the leader was reaped");
        assert_eq!(supervisor.exit_signal().get(), Some(exit));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_descendants() {
        let (handlers, mut rx) = collecting();
        let supervisor = ProcessSupervisor::start(
            &sh("sleep 30 & echo $!; wait"),
            &SupervisorSettings::default(),
            handlers,
        )
        .unwrap();

        let grandchild: u32 = read_line(&mut rx).await.trim().parse().unwrap();

        supervisor.stop(Some(WAIT)).await.expect("exit confirmed");

        let gone = async {
            loop {
                let stat = std::fs::read_to_string(format!("/proc/{}/stat", grandchild));
                match stat {
                    Err(_) => break,
                    // Reparented zombies may linger until init reaps them
                    Ok(stat) if stat.split_whitespace().nth(2) == Some("Z") => break,
                    Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        };
        timeout(WAIT, gone).await.expect("grandchild survived cancellation");
    }
}
