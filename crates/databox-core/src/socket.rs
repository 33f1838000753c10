//! Socket handle shared between the transport and the DataBox engine
//!
//! The transport owns the wire; the engine only sees this handle. Outgoing
//! events are queued on an unbounded channel that the transport drains.

use crate::access::ConnectionContext;
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

pub type SocketId = u64;

/// Handler for client messages sent on one event key
pub type InputHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type DisconnectHook = Box<dyn FnOnce() + Send>;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique socket id
pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Event pushed from the server to the client
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event: String,
    pub payload: Value,
}

/// A connected client as seen by the engine
pub struct Socket {
    id: SocketId,
    context: ConnectionContext,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    handlers: DashMap<String, InputHandler>,
    disconnect_hooks: Mutex<HashMap<String, DisconnectHook>>,
    /// Keys of the DataBoxes (or members) this socket is attached to
    attachments: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

impl Socket {
    pub fn new(
        id: SocketId,
        context: ConnectionContext,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            id,
            context,
            outbound,
            handlers: DashMap::new(),
            disconnect_hooks: Mutex::new(HashMap::new()),
            attachments: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(true),
        });
        (socket, rx)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue an event for the client. Returns false once the client is gone.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound
            .send(OutboundEvent {
                event: event.to_string(),
                payload,
            })
            .is_ok()
    }

    pub fn on(&self, event: impl Into<String>, handler: InputHandler) {
        self.handlers.insert(event.into(), handler);
    }

    pub fn off(&self, event: &str) {
        self.handlers.remove(event);
    }

    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Route a client message to the handler installed for its event
    pub async fn dispatch(&self, event: &str, payload: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(event)
            .map(|h| h.value().clone())
            .ok_or_else(|| Error::InvalidRequest(format!("No handler for event {}", event)))?;
        handler(payload).await
    }

    pub fn on_disconnect(&self, key: impl Into<String>, hook: impl FnOnce() + Send + 'static) {
        self.disconnect_hooks.lock().insert(key.into(), Box::new(hook));
    }

    pub fn off_disconnect(&self, key: &str) {
        self.disconnect_hooks.lock().remove(key);
    }

    /// Mark the socket gone and run every disconnect hook once
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        // hooks unregister themselves, so the lock must be released first
        let hooks = std::mem::take(&mut *self.disconnect_hooks.lock());
        trace!(socket = self.id, hooks = hooks.len(), "Running disconnect hooks");
        for (_, hook) in hooks {
            hook();
        }
        self.handlers.clear();
    }

    /// Whether one more attachment under `key` fits into `limit`
    pub fn can_attach(&self, key: &str, limit: usize) -> bool {
        let attachments = self.attachments.lock();
        attachments.contains(key) || attachments.len() < limit
    }

    pub(crate) fn attach(&self, key: &str) {
        self.attachments.lock().insert(key.to_string());
    }

    pub(crate) fn detach(&self, key: &str) {
        self.attachments.lock().remove(key);
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.lock().len()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_dispatch_routes_to_handler() {
        let (socket, _rx) = Socket::new(next_socket_id(), ConnectionContext::default());
        socket.on(
            "echo",
            Arc::new(|payload: Value| async move { Ok::<_, Error>(payload) }.boxed()),
        );

        assert_eq!(socket.dispatch("echo", json!(5)).await.unwrap(), json!(5));
        socket.off("echo");
        assert!(socket.dispatch("echo", json!(5)).await.is_err());
    }

    #[test]
    fn test_emit_stops_after_disconnect() {
        let (socket, mut rx) = Socket::new(next_socket_id(), ConnectionContext::default());
        assert!(socket.emit("out", json!({ "a": "reload" })));
        assert_eq!(rx.try_recv().unwrap().event, "out");

        socket.disconnect();
        assert!(!socket.emit("out", json!(null)));
    }

    #[test]
    fn test_disconnect_hooks_run_once() {
        let (socket, _rx) = Socket::new(next_socket_id(), ConnectionContext::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        socket.on_disconnect("a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        socket.on_disconnect("b", || {});
        socket.off_disconnect("b");

        socket.disconnect();
        socket.disconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attachment_limit() {
        let (socket, _rx) = Socket::new(next_socket_id(), ConnectionContext::default());
        socket.attach("a");
        socket.attach("b");
        assert!(!socket.can_attach("c", 2));
        assert!(socket.can_attach("a", 2));
        socket.detach("b");
        assert!(socket.can_attach("c", 2));
    }
}
