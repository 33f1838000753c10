//! Per-unit sync machinery: one channel per singleton DataBox, one per
//! active family member.
//!
//! A channel owns the socket registry, the last-cud marker and the watch on
//! its exchange topic.

use crate::action::{Code, CudAction};
use crate::core::{DataBoxCore, FetchRequest};
use crate::error::{Error, Result};
use crate::event::{ClientEvent, ClosePayload};
use crate::exchange::{TopicHandler, WatchId, WorkerAction, WorkerMessage};
use crate::package::{CudPackage, LastCud};
use crate::session::{DbSessionData, SessionTarget};
use crate::socket::{InputHandler, Socket, SocketId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Result of attaching a socket
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Event the client sends session actions on
    pub input_key: String,
    /// Event the client receives cud/close/reload/kickOut on
    pub output_key: String,
    /// Id of the last known change, empty if none
    pub last_cud_id: String,
}

/// Reply of a session fetch
#[derive(Debug, Clone, PartialEq)]
pub struct DataReply {
    pub data: Value,
    /// Re-signed session token the client should keep
    pub token: String,
}

#[derive(Clone)]
struct Registration {
    socket: Arc<Socket>,
    session: Arc<tokio::sync::Mutex<DbSessionData>>,
}

pub(crate) type EmptyHook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Channel {
    core: Arc<DataBoxCore>,
    member: Option<String>,
    topic: String,
    input_key: String,
    output_key: String,
    sockets: DashMap<SocketId, Registration>,
    last_cud: Mutex<LastCud>,
    watch: Mutex<Option<WatchId>>,
    on_empty: Option<EmptyHook>,
}

impl Channel {
    pub(crate) fn new(core: Arc<DataBoxCore>, member: Option<String>, on_empty: Option<EmptyHook>) -> Arc<Self> {
        Arc::new(Self {
            topic: core.topic(member.as_deref()),
            input_key: core.input_key(member.as_deref()),
            output_key: core.output_key(member.as_deref()),
            core,
            member,
            sockets: DashMap::new(),
            last_cud: Mutex::new(LastCud::default()),
            watch: Mutex::new(None),
            on_empty,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub(crate) fn contains(&self, socket_id: SocketId) -> bool {
        self.sockets.contains_key(&socket_id)
    }

    pub(crate) fn last_cud_id(&self) -> String {
        self.last_cud.lock().id().to_string()
    }

    pub(crate) fn last_cud(&self) -> LastCud {
        self.last_cud.lock().clone()
    }

    fn attachment(&self) -> Attachment {
        Attachment {
            input_key: self.input_key.clone(),
            output_key: self.output_key.clone(),
            last_cud_id: self.last_cud_id(),
        }
    }

    /// Register a socket. Registering the same socket twice keeps the
    /// first registration and its session.
    ///
    /// Fails for a socket that is already disconnected; nothing stays
    /// behind in that case and the empty hook is not run.
    pub(crate) fn register(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        session: Option<DbSessionData>,
    ) -> Result<Attachment> {
        if !socket.is_connected() {
            return Err(Error::SocketDisconnected(socket.id()));
        }

        let inserted = match self.sockets.entry(socket.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Registration {
                    socket: socket.clone(),
                    session: Arc::new(tokio::sync::Mutex::new(session.unwrap_or_default())),
                });
                true
            }
        };

        if inserted {
            self.install(socket);
            // a disconnect that ran before the hook was installed never sees it
            if !socket.is_connected() {
                self.remove(socket.id());
                return Err(Error::SocketDisconnected(socket.id()));
            }
            debug!(
                databox = %self.core.name(),
                member = ?self.member,
                socket = socket.id(),
                sockets = self.sockets.len(),
                "Socket registered"
            );
        } else {
            trace!(databox = %self.core.name(), socket = socket.id(), "Socket already registered");
        }

        self.ensure_watching();
        Ok(self.attachment())
    }

    fn install(self: &Arc<Self>, socket: &Arc<Socket>) {
        let socket_id = socket.id();

        let weak = Arc::downgrade(self);
        let handler: InputHandler = Arc::new(move |payload: Value| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(channel) => channel.handle_input(socket_id, payload).await,
                    None => Err(Error::InvalidRequest("DataBox channel is gone".into())),
                }
            }
            .boxed()
        });
        socket.on(self.input_key.clone(), handler);

        let weak: Weak<Channel> = Arc::downgrade(self);
        socket.on_disconnect(self.input_key.clone(), move || {
            if let Some(channel) = weak.upgrade() {
                channel.unregister(socket_id);
            }
        });

        socket.attach(&self.input_key);
    }

    /// Remove a socket. Returns false if it was not registered.
    pub(crate) fn unregister(&self, socket_id: SocketId) -> bool {
        if !self.remove(socket_id) {
            return false;
        }
        if self.sockets.is_empty() {
            if let Some(on_empty) = &self.on_empty {
                on_empty();
            }
        }
        true
    }

    fn remove(&self, socket_id: SocketId) -> bool {
        let Some((_, registration)) = self.sockets.remove(&socket_id) else {
            return false;
        };

        let socket = &registration.socket;
        socket.off(&self.input_key);
        socket.off_disconnect(&self.input_key);
        socket.detach(&self.input_key);

        debug!(
            databox = %self.core.name(),
            member = ?self.member,
            socket = socket_id,
            sockets = self.sockets.len(),
            "Socket unregistered"
        );
        true
    }

    fn registration(&self, socket_id: SocketId) -> Result<Registration> {
        self.sockets
            .get(&socket_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::InvalidRequest(format!("Socket {} is not registered", socket_id)))
    }

    /// Dispatch a session action sent by the client on the input key
    async fn handle_input(&self, socket_id: SocketId, payload: Value) -> Result<Value> {
        let action = payload
            .get("a")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidRequest("Session action is missing".into()))?;

        let target = match payload.get("t") {
            None | Some(Value::Null) => SessionTarget::parse(None)?,
            Some(Value::String(target)) => SessionTarget::parse(Some(target))?,
            Some(other) => return Err(Error::UnknownSessionTarget(other.to_string())),
        };

        match action {
            "getData" => {
                let reply = self.get_data(socket_id, target).await?;
                Ok(json!({ "d": reply.data, "t": reply.token }))
            }
            "resetSession" => {
                let token = self.reset_session(socket_id, target).await?;
                Ok(json!({ "t": token }))
            }
            "copySession" => {
                let token = self.copy_session(socket_id, target).await?;
                Ok(json!({ "t": token }))
            }
            "getLastCudId" => Ok(Value::String(self.last_cud_id())),
            "close" => {
                self.unregister(socket_id);
                Ok(Value::Null)
            }
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }

    /// Fetch the next chunk for a session and advance its counter
    pub(crate) async fn get_data(&self, socket_id: SocketId, target: SessionTarget) -> Result<DataReply> {
        let registration = self.registration(socket_id)?;
        // held across the hook so fetches of one socket never interleave
        let mut session = registration.session.lock().await;

        let current = session.get(target).clone();
        let fetched = self
            .core
            .fetch(FetchRequest {
                member: self.member.clone(),
                counter: current.counter,
                session: current.data,
                context: registration.socket.context().clone(),
            })
            .await?;

        let slot = session.get_mut(target);
        slot.counter += 1;
        slot.data = fetched.session;

        let token = self.core.sign_session_token(&session, self.member.as_deref())?;
        Ok(DataReply {
            data: fetched.data,
            token,
        })
    }

    pub(crate) async fn reset_session(&self, socket_id: SocketId, target: SessionTarget) -> Result<String> {
        let registration = self.registration(socket_id)?;
        let mut session = registration.session.lock().await;
        session.reset(target);
        self.core.sign_session_token(&session, self.member.as_deref())
    }

    pub(crate) async fn copy_session(&self, socket_id: SocketId, target: SessionTarget) -> Result<String> {
        let registration = self.registration(socket_id)?;
        let mut session = registration.session.lock().await;
        session.copy(target);
        self.core.sign_session_token(&session, self.member.as_deref())
    }

    pub(crate) async fn session(&self, socket_id: SocketId) -> Option<DbSessionData> {
        let registration = self.registration(socket_id).ok()?;
        let session = registration.session.lock().await;
        Some(session.clone())
    }

    /// Emit an event to every socket registered on this worker
    pub(crate) fn emit_local(&self, event: &ClientEvent) {
        let payload = event.to_value();
        for entry in self.sockets.iter() {
            entry.value().socket.emit(&self.output_key, payload.clone());
        }
    }

    pub(crate) fn apply_cud(&self, package: &CudPackage) {
        self.last_cud.lock().observe(package);
        self.emit_local(&ClientEvent::Cud {
            package: package.clone(),
        });
    }

    /// Notify and unregister every local socket
    pub(crate) fn close_local(&self, code: Option<Code>, data: Option<Value>) {
        self.emit_local(&ClientEvent::Close { code, data });
        let ids: Vec<SocketId> = self.sockets.iter().map(|e| *e.key()).collect();
        info!(
            databox = %self.core.name(),
            member = ?self.member,
            sockets = ids.len(),
            "Closing DataBox"
        );
        for id in ids {
            self.unregister(id);
        }
    }

    pub(crate) fn kick_out(&self, socket_id: SocketId, code: Option<Code>, data: Option<Value>) -> bool {
        let Ok(registration) = self.registration(socket_id) else {
            return false;
        };
        registration
            .socket
            .emit(&self.output_key, ClientEvent::KickOut { code, data }.to_value());
        self.unregister(socket_id)
    }

    /// Watch the topic once; later calls are no-ops
    fn ensure_watching(self: &Arc<Self>) {
        let mut watch = self.watch.lock();
        if watch.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handler: TopicHandler = Arc::new(move |message: WorkerMessage| {
            if let Some(channel) = weak.upgrade() {
                channel.on_worker_message(message);
            }
        });
        *watch = Some(self.core.exchange().watch(&self.topic, handler));
        debug!(databox = %self.core.name(), topic = %self.topic, "Watching topic");
    }

    pub(crate) fn stop_watching(&self) {
        let watch = self.watch.lock().take();
        if let Some(id) = watch {
            self.core.exchange().unwatch(&self.topic, id);
            debug!(databox = %self.core.name(), topic = %self.topic, "Stopped watching topic");
        }
    }

    fn on_worker_message(&self, message: WorkerMessage) {
        if message.worker_id == self.core.worker_id() {
            // the origin delivered to its own sockets before publishing
            return;
        }
        trace!(
            databox = %self.core.name(),
            topic = %self.topic,
            from = %message.worker_id,
            action = ?message.action,
            "Worker message received"
        );

        match message.action {
            WorkerAction::Cud => match serde_json::from_value::<CudPackage>(message.data) {
                Ok(package) => self.apply_cud(&package),
                Err(e) => warn!(topic = %self.topic, error = %e, "Dropping malformed cud package"),
            },
            WorkerAction::Close => {
                let payload: ClosePayload = serde_json::from_value(message.data).unwrap_or_default();
                self.close_local(payload.code, payload.data);
            }
            WorkerAction::Broadcast => match serde_json::from_value::<ClientEvent>(message.data) {
                Ok(event) => self.emit_local(&event),
                Err(e) => warn!(topic = %self.topic, error = %e, "Dropping malformed broadcast"),
            },
        }
    }
}

/// Build, deliver and publish one package.
///
/// `channel` is resolved only once the before-hooks have passed, so a unit
/// re-created while they ran still gets the package. Local sockets receive
/// it before sibling workers are told about it. Without a channel the
/// package is only published.
pub(crate) async fn emit_cud<F>(
    core: &DataBoxCore,
    member: Option<&str>,
    actions: Vec<CudAction>,
    timestamp: Option<i64>,
    channel: F,
) -> Result<CudPackage>
where
    F: FnOnce() -> Option<Arc<Channel>>,
{
    if actions.is_empty() {
        return Err(Error::InvalidRequest("Cud package without actions".into()));
    }
    let package = core.prepare_package(member, actions, timestamp).await?;
    if let Some(channel) = channel() {
        channel.apply_cud(&package);
    }
    core.publish(member, WorkerAction::Cud, serde_json::to_value(&package)?)
        .await?;
    trace!(
        databox = %core.name(),
        member = ?member,
        cud = %package.cud_id(),
        actions = package.actions().len(),
        "Cud package emitted"
    );
    Ok(package)
}
