use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;

use super::process::{ProcessExit, ProcessSpec};
use super::protocol::{Message, Notification, Request, RequestId, Response, error_codes};
use super::transport::{CloseReason, Transport, TransportSettings};
use crate::error::{ClientError, TransportError};

type PendingRequest = oneshot::Sender<Result<Value, ClientError>>;
type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// LSP MessageType: 1=Error, 2=Warning, 3=Info, 4=Log
    fn from_message_type(value: Option<u64>) -> Self {
        match value {
            Some(1) => Self::Error,
            Some(2) => Self::Warn,
            Some(3) => Self::Info,
            _ => Self::Debug,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    /// Wait for the `shutdown` response
    pub shutdown_timeout: Duration,
    /// Wait for the process to leave after `exit`
    pub exit_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
            exit_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct PendingRequests {
    entries: HashMap<RequestId, PendingRequest>,
    closed: Option<CloseReason>,
}

/// Removes the pending entry if the request future is dropped early
struct PendingGuard<'a> {
    client: &'a Client,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.forget(&self.id);
    }
}

/// JSON-RPC client over a [`Transport`]
///
/// Outstanding requests are keyed by id. When the transport closes, every
/// pending request resolves with the close reason and new requests fail fast.
pub struct Client {
    transport: Transport,
    settings: ClientSettings,
    next_id: AtomicU64,
    pending: Mutex<PendingRequests>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
}

impl Client {
    pub fn new(transport: TransportSettings, settings: ClientSettings) -> Arc<Self> {
        let client = Arc::new(Self {
            transport: Transport::new(transport),
            settings,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingRequests::default()),
            notification_handlers: RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&client);
        client.transport.on_message(move |payload: &Bytes| {
            if let Some(client) = weak.upgrade() {
                client.handle_payload(payload);
            }
        });

        let weak = Arc::downgrade(&client);
        client.transport.on_close(move |reason: &CloseReason| {
            if let Some(client) = weak.upgrade() {
                client.fail_pending(reason);
            }
        });

        client
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn start(&self, spec: &ProcessSpec) -> Result<(), ClientError> {
        tracing::info!("Starting language server: {} {}", spec.command, spec.args.join(" "));
        self.transport.start(spec)?;
        Ok(())
    }

    /// Send a request and deserialize its result
    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let result = self.request_value(method, params).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub async fn request_value(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.request_with_timeout(method, params, self.settings.request_timeout)
            .await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_vec(&Request::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        let guard = self.register(RequestId::Number(id), tx)?;

        tracing::trace!("LSP request {}: {}", id, method);
        if let Err(err) = self.transport.send(&payload).await {
            return Err(self.failure_after(err));
        }

        let result = timeout(limit, rx).await;
        drop(guard);

        match result {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Transport(TransportError::Cancelled)),
            Err(_) => {
                self.cancel_request(id).await;
                Err(ClientError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn cancel_request(&self, id: u64) {
        let _ = self
            .notify("$/cancelRequest", Some(serde_json::json!({ "id": id })))
            .await;
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(&Notification::new(method, params))?;
        tracing::trace!("LSP notification: {}", method);
        self.transport
            .send(&payload)
            .await
            .map_err(|err| self.failure_after(err))
    }

    /// Replace the handler for a server notification method.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.notification_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests().entries.len()
    }

    pub async fn exited(&self) -> Result<ProcessExit, ClientError> {
        Ok(self.transport.exited().await?)
    }

    /// Shut the server down in stages: `shutdown` request, `exit` notification,
    /// bounded wait for the process, then a forced stop.
    pub async fn shutdown(&self) -> Result<Option<ProcessExit>, ClientError> {
        let signal = self.transport.exit_signal()?;

        let acknowledged = !signal.has_fired()
            && match self
                .request_with_timeout("shutdown", None, self.settings.shutdown_timeout)
                .await
            {
                Ok(_) => {
                    self.transport.expect_exit();
                    self.notify("exit", None).await.is_ok()
                }
                Err(err) => {
                    tracing::debug!("LSP shutdown request failed: {}", err);
                    false
                }
            };

        let exit = if signal.has_fired() {
            signal.get()
        } else if acknowledged
            && let Ok(exit) = timeout(self.settings.exit_timeout, signal.wait()).await
        {
            Some(exit)
        } else {
            tracing::warn!("Language server did not exit, forcing kill");
            self.transport.stop().await
        };

        self.transport.dispose().await;
        tracing::info!("Language server stopped");
        Ok(exit)
    }

    fn pending_requests(&self) -> std::sync::MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: RequestId, tx: PendingRequest) -> Result<PendingGuard<'_>, ClientError> {
        let mut pending = self.pending_requests();
        if let Some(reason) = &pending.closed {
            return Err(ClientError::Transport(reason.to_error()));
        }
        pending.entries.insert(id.clone(), tx);
        Ok(PendingGuard { client: self, id })
    }

    fn forget(&self, id: &RequestId) {
        self.pending_requests().entries.remove(id);
    }

    /// Prefer the close reason over the write error it caused
    fn failure_after(&self, err: TransportError) -> ClientError {
        if !matches!(err, TransportError::Write(_)) {
            return ClientError::Transport(err);
        }
        if let Some(reason) = &self.pending_requests().closed {
            return ClientError::Transport(reason.to_error());
        }
        // The exit can be published a moment before the close handlers run
        match self.transport.exit_signal().ok().and_then(|signal| signal.get()) {
            Some(exit) => ClientError::Transport(exit.to_error()),
            None => ClientError::Transport(err),
        }
    }

    fn fail_pending(&self, reason: &CloseReason) {
        let drained: Vec<_> = {
            let mut pending = self.pending_requests();
            pending.closed = Some(reason.clone());
            pending.entries.drain().collect()
        };

        if !drained.is_empty() {
            tracing::debug!(
                "Failing {} pending requests: {}",
                drained.len(),
                reason.to_error()
            );
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(ClientError::Transport(reason.to_error())));
        }
    }

    fn handle_payload(self: &Arc<Self>, payload: &[u8]) {
        match Message::parse(payload) {
            Ok(Message::Response(response)) => self.handle_response(response),
            Ok(Message::Notification(notification)) => self.handle_notification(notification),
            Ok(Message::Request(request)) => {
                let client = Arc::clone(self);
                tokio::spawn(async move { client.handle_server_request(request).await });
            }
            Err(e) => tracing::warn!("Ignoring unparseable LSP message: {}", e),
        }
    }

    fn handle_response(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            tracing::warn!("LSP error response without id: {:?}", response.error);
            return;
        };

        let sender = self.pending_requests().entries.remove(&id);
        match sender {
            Some(sender) => {
                let result = response.into_result().map_err(ClientError::from);
                let _ = sender.send(result);
            }
            None => tracing::debug!("Response for unknown request {:?}", id),
        }
    }

    fn handle_notification(&self, notification: Notification) {
        let params = notification.params.unwrap_or(Value::Null);

        if matches!(
            notification.method.as_str(),
            "window/logMessage" | "window/showMessage"
        ) && let Some(msg) = params.get("message").and_then(|m| m.as_str())
        {
            match LogLevel::from_message_type(params.get("type").and_then(|t| t.as_u64())) {
                LogLevel::Error => tracing::error!("LSP: {}", msg),
                LogLevel::Warn => tracing::warn!("LSP: {}", msg),
                LogLevel::Info => tracing::info!("LSP: {}", msg),
                LogLevel::Debug => tracing::debug!("LSP: {}", msg),
            }
        }

        let handler = self
            .notification_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&notification.method)
            .cloned();
        match handler {
            Some(handler) => handler(params),
            None => tracing::trace!("Unhandled notification: {}", notification.method),
        }
    }

    async fn handle_server_request(&self, request: Request) {
        let response = server_reply(&request);
        match serde_json::to_vec(&response) {
            Ok(payload) => {
                if let Err(e) = self.transport.send(&payload).await {
                    tracing::debug!("Failed to answer '{}': {}", request.method, e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode reply to '{}': {}", request.method, e),
        }
    }
}

/// Default answers to requests initiated by the server
fn server_reply(request: &Request) -> Response {
    match request.method.as_str() {
        "workspace/configuration" => {
            let count = request
                .params
                .as_ref()
                .and_then(|p| p.get("items"))
                .and_then(|items| items.as_array())
                .map_or(0, Vec::len);
            Response::success(request.id.clone(), Value::Array(vec![Value::Null; count]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create"
        | "window/showMessageRequest" => Response::success(request.id.clone(), Value::Null),
        _ => {
            tracing::debug!("Unhandled server request: {}", request.method);
            Response::failure(
                request.id.clone(),
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )
        }
    }
}
