//! LSP Transport Layer
//!
//! Wires the frame codec to a supervised process: stdout chunks are fed to a
//! [`FrameDecoder`] owned by the stdout drain, and every completed payload is
//! handed to the message subscribers in arrival order. `send` frames a payload
//! and writes it to stdin.
//!
//! Subscribers run on the stdout drain task. Keep them short, or hand the
//! payload to a channel.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;

use super::codec::{self, FrameDecoder};
use super::process::{
    ExitSignal, ProcessExit, ProcessSpec, ProcessSupervisor, StreamHandlers, SupervisorSettings,
};
use crate::error::{FramingError, TransportError};

type MessageHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;
type DiagnosticHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&CloseReason) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub supervisor: SupervisorSettings,
    /// Largest accepted Content-Length; zero disables the check
    pub max_payload_bytes: usize,
    /// How long `stop` waits for the exit to be confirmed
    pub stop_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSettings::default(),
            max_payload_bytes: 64 * 1024 * 1024,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Why the transport stopped delivering messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Framing(FramingError),
    Exited(ProcessExit),
}

impl CloseReason {
    pub fn to_error(&self) -> TransportError {
        match self {
            Self::Framing(err) => TransportError::Framing(err.clone()),
            Self::Exited(exit) => exit.to_error(),
        }
    }
}

#[derive(Default)]
struct Subscribers {
    messages: RwLock<Vec<MessageHandler>>,
    diagnostics: RwLock<Vec<DiagnosticHandler>>,
    close: RwLock<Vec<CloseHandler>>,
    closed: OnceLock<CloseReason>,
}

impl Subscribers {
    fn deliver(&self, payload: &Bytes) {
        tracing::trace!("LSP <- {}", String::from_utf8_lossy(payload));
        for handler in snapshot(&self.messages) {
            handler(payload);
        }
    }

    fn diagnostic(&self, chunk: &[u8]) {
        for handler in snapshot(&self.diagnostics) {
            handler(chunk);
        }
    }

    fn close(&self, reason: CloseReason) {
        if self.closed.set(reason.clone()).is_err() {
            return;
        }
        match &reason {
            CloseReason::Framing(err) => tracing::error!("Transport closed: {}", err),
            CloseReason::Exited(exit) => tracing::debug!("Transport closed: {:?}", exit),
        }
        for handler in snapshot(&self.close) {
            handler(&reason);
        }
    }

    fn add_close(&self, handler: CloseHandler) {
        // Checked under the write lock so a concurrent close sees the handler
        // either here or in its snapshot, never both
        let reason = {
            let mut handlers = self.close.write().unwrap_or_else(PoisonError::into_inner);
            match self.closed.get() {
                Some(reason) => reason.clone(),
                None => {
                    handlers.push(handler);
                    return;
                }
            }
        };
        handler(&reason);
    }
}

fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Framed message channel to one child process
pub struct Transport {
    settings: TransportSettings,
    subscribers: Arc<Subscribers>,
    supervisor: OnceLock<ProcessSupervisor>,
    starting: AtomicBool,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            subscribers: Arc::new(Subscribers::default()),
            supervisor: OnceLock::new(),
            starting: AtomicBool::new(false),
        }
    }

    /// Called once per decoded payload, in stream order.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.subscribers
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Called with raw stderr chunks of the child.
    pub fn on_diagnostic<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.subscribers
            .diagnostics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Called once when the transport closes. Runs immediately if it already has.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&CloseReason) + Send + Sync + 'static,
    {
        self.subscribers.add_close(Arc::new(handler));
    }

    /// Spawn the child. Only one start per transport.
    pub fn start(&self, spec: &ProcessSpec) -> Result<(), TransportError> {
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }

        let mut decoder = FrameDecoder::with_max_payload(self.settings.max_payload_bytes);
        let messages = Arc::clone(&self.subscribers);
        let on_stdout = move |chunk: &[u8]| {
            for frame in decoder.feed(chunk) {
                match frame {
                    Ok(payload) => messages.deliver(&payload),
                    Err(err) => {
                        messages.close(CloseReason::Framing(err));
                        return ControlFlow::Break(());
                    }
                }
            }
            ControlFlow::Continue(())
        };

        let diagnostics = Arc::clone(&self.subscribers);
        let exits = Arc::clone(&self.subscribers);
        let handlers = StreamHandlers::new(on_stdout)
            .on_stderr(move |chunk: &[u8]| diagnostics.diagnostic(chunk))
            .on_exit(move |exit: &ProcessExit| exits.close(CloseReason::Exited(exit.clone())));

        let supervisor = match ProcessSupervisor::start(spec, &self.settings.supervisor, handlers)
        {
            Ok(supervisor) => supervisor,
            Err(err) => {
                self.starting.store(false, Ordering::Release);
                return Err(err);
            }
        };
        self.supervisor
            .set(supervisor)
            .map_err(|_| TransportError::AlreadyStarted)
    }

    /// Frame `payload` and write it to the child's stdin.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let supervisor = self.supervisor()?;
        if let Some(CloseReason::Framing(err)) = self.subscribers.closed.get() {
            return Err(TransportError::Framing(err.clone()));
        }

        tracing::trace!("LSP -> {}", String::from_utf8_lossy(payload));
        supervisor.write(&codec::encode(payload)).await?;
        Ok(())
    }

    /// Stop the child, waiting up to the configured stop timeout.
    pub async fn stop(&self) -> Option<ProcessExit> {
        self.stop_with_timeout(Some(self.settings.stop_timeout))
            .await
    }

    pub async fn stop_with_timeout(&self, wait: Option<Duration>) -> Option<ProcessExit> {
        match self.supervisor.get() {
            Some(supervisor) => supervisor.stop(wait).await,
            None => None,
        }
    }

    /// Request termination without waiting. Safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.cancel();
        }
    }

    /// The child is about to exit on request; do not report it as unexpected.
    pub fn expect_exit(&self) {
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.expect_exit();
        }
    }

    pub fn exit_signal(&self) -> Result<ExitSignal, TransportError> {
        Ok(self.supervisor()?.exit_signal())
    }

    pub async fn exited(&self) -> Result<ProcessExit, TransportError> {
        Ok(self.supervisor()?.wait().await)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.subscribers.closed.get().cloned()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .get()
            .is_some_and(|supervisor| !supervisor.has_exited())
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.get().and_then(ProcessSupervisor::pid)
    }

    pub async fn dispose(&self) {
        if let Some(supervisor) = self.supervisor.get() {
            supervisor.dispose().await;
        }
    }

    fn supervisor(&self) -> Result<&ProcessSupervisor, TransportError> {
        self.supervisor.get().ok_or(TransportError::NotStarted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_close_fires_once() {
        let subscribers = Subscribers::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        subscribers.add_close(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        subscribers.close(CloseReason::Framing(FramingError::MissingContentLength));
        subscribers.close(CloseReason::Framing(FramingError::InvalidHeader));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            subscribers.closed.get(),
            Some(&CloseReason::Framing(FramingError::MissingContentLength))
        );
    }

    #[test]
    fn test_late_close_subscriber_runs_immediately() {
        let subscribers = Subscribers::default();
        subscribers.close(CloseReason::Framing(FramingError::InvalidHeader));

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        subscribers.add_close(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(snapshot(&subscribers.close).is_empty());
    }

    #[test]
    fn test_late_close_subscriber_may_subscribe_again() {
        let subscribers = Arc::new(Subscribers::default());
        subscribers.close(CloseReason::Framing(FramingError::InvalidHeader));

        let count = Arc::new(AtomicUsize::new(0));
        let inner_count = Arc::clone(&count);
        let inner_subscribers = Arc::clone(&subscribers);
        subscribers.add_close(Arc::new(move |_| {
            let counter = Arc::clone(&inner_count);
            inner_subscribers.add_close(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            inner_count.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_framing_close_maps_to_framing_error() {
        let reason = CloseReason::Framing(FramingError::MissingContentLength);
        assert!(matches!(
            reason.to_error(),
            TransportError::Framing(FramingError::MissingContentLength)
        ));
    }

    #[tokio::test]
    async fn test_send_before_start() {
        let transport = Transport::new(TransportSettings::default());
        assert!(matches!(
            transport.send(b"{}").await,
            Err(TransportError::NotStarted)
        ));
        assert!(!transport.is_running());
        assert!(transport.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let transport = Transport::new(TransportSettings::default());
        let result = transport.start(&ProcessSpec::new("/nonexistent/lspipe-server"));
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_twice() {
        let transport = Transport::new(TransportSettings::default());
        transport.start(&ProcessSpec::new("cat")).unwrap();
        assert!(matches!(
            transport.start(&ProcessSpec::new("cat")),
            Err(TransportError::AlreadyStarted)
        ));
        assert!(transport.stop().await.is_some());
        transport.dispose().await;
    }
}
