//! DataBox families: one logical data set per member id.
//!
//! Members are created on first registration and released again when their
//! last socket leaves, so idle members hold no topic and no marker.

use crate::access::ConnectionContext;
use crate::action::{Code, CudAction, CudOptions, KeyPath};
use crate::channel::{emit_cud, Attachment, Channel, DataReply, EmptyHook};
use crate::core::DataBoxCore;
use crate::error::{Error, Result};
use crate::event::{ClientEvent, ClosePayload};
use crate::exchange::WorkerAction;
use crate::package::CudPackage;
use crate::sequence::{CommitFn, CudActionSequence};
use crate::session::{DbSessionData, SessionTarget};
use crate::socket::{Socket, SocketId};
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub struct DataBoxFamily {
    core: Arc<DataBoxCore>,
    me: Weak<DataBoxFamily>,
    members: DashMap<String, Arc<Channel>>,
    /// Serializes member creation against member release
    lifecycle: Mutex<()>,
}

impl DataBoxFamily {
    pub fn new(core: DataBoxCore) -> Arc<Self> {
        let core = Arc::new(core);
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            members: DashMap::new(),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn core(&self) -> &Arc<DataBoxCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn api_level(&self) -> Option<u32> {
        self.core.api_level()
    }

    pub async fn check_access(&self, ctx: &ConnectionContext) -> Result<()> {
        self.core.check_access(ctx).await
    }

    pub async fn is_id_valid(&self, member: &str, ctx: &ConnectionContext) -> Result<()> {
        self.core.check_id_valid(member, ctx).await
    }

    /// Tokens are scoped to the member they were issued for
    pub fn verify_session_token(&self, member: &str, token: &str) -> Option<DbSessionData> {
        self.core.verify_session_token(token, Some(member))
    }

    /// Key a member occupies in a socket's attachment set
    pub fn attachment_key(&self, member: &str) -> String {
        self.core.input_key(Some(member))
    }

    /// Number of members with at least one local socket
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> Vec<String> {
        self.members.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_member_active(&self, member: &str) -> bool {
        self.members.contains_key(member)
    }

    fn channel(&self, member: &str) -> Option<Arc<Channel>> {
        self.members.get(member).map(|c| c.value().clone())
    }

    fn channel_or_create(&self, member: &str) -> Arc<Channel> {
        self.members
            .entry(member.to_string())
            .or_insert_with(|| {
                let family = self.me.clone();
                let key = member.to_string();
                let on_empty: EmptyHook = Box::new(move || {
                    if let Some(family) = family.upgrade() {
                        family.release_member(&key);
                    }
                });
                debug!(databox = %self.core.name(), member, "Member created");
                Channel::new(self.core.clone(), Some(member.to_string()), Some(on_empty))
            })
            .value()
            .clone()
    }

    /// Drop a member whose registry is empty and stop watching its topic
    fn release_member(&self, member: &str) {
        let _lifecycle = self.lifecycle.lock();
        if let Some((_, channel)) = self.members.remove_if(member, |_, c| c.is_empty()) {
            channel.stop_watching();
            debug!(databox = %self.core.name(), member, "Member released");
        }
    }

    /// Attach a socket to a member, creating the member on first use.
    /// A socket that is already gone leaves no member behind.
    pub fn register_socket(
        &self,
        member: &str,
        socket: &Arc<Socket>,
        session: Option<DbSessionData>,
    ) -> Result<Attachment> {
        let result = {
            let _lifecycle = self.lifecycle.lock();
            self.channel_or_create(member).register(socket, session)
        };
        if result.is_err() {
            self.release_member(member);
        }
        result
    }

    pub fn unregister_socket(&self, member: &str, socket_id: SocketId) -> bool {
        match self.channel(member) {
            Some(channel) => channel.unregister(socket_id),
            None => false,
        }
    }

    pub fn is_registered(&self, member: &str, socket_id: SocketId) -> bool {
        self.channel(member).map_or(false, |c| c.contains(socket_id))
    }

    pub fn registered_sockets(&self, member: &str) -> usize {
        self.channel(member).map_or(0, |c| c.len())
    }

    pub fn last_cud_id(&self, member: &str) -> String {
        self.channel(member).map(|c| c.last_cud_id()).unwrap_or_default()
    }

    fn member_channel(&self, member: &str) -> Result<Arc<Channel>> {
        self.channel(member)
            .ok_or_else(|| Error::InvalidRequest(format!("Member {} has no registered sockets", member)))
    }

    pub async fn get_data(&self, member: &str, socket_id: SocketId, target: SessionTarget) -> Result<DataReply> {
        self.member_channel(member)?.get_data(socket_id, target).await
    }

    pub async fn reset_session(&self, member: &str, socket_id: SocketId, target: SessionTarget) -> Result<String> {
        self.member_channel(member)?.reset_session(socket_id, target).await
    }

    pub async fn copy_session(&self, member: &str, socket_id: SocketId, target: SessionTarget) -> Result<String> {
        self.member_channel(member)?.copy_session(socket_id, target).await
    }

    pub async fn session(&self, member: &str, socket_id: SocketId) -> Option<DbSessionData> {
        self.channel(member)?.session(socket_id).await
    }

    pub async fn insert(
        &self,
        member: &str,
        key_path: impl Into<KeyPath>,
        value: Value,
        options: CudOptions,
    ) -> Result<CudPackage> {
        let timestamp = options.timestamp;
        self.commit(member, vec![CudAction::insert(key_path.into(), value, options)], timestamp)
            .await
    }

    pub async fn update(
        &self,
        member: &str,
        key_path: impl Into<KeyPath>,
        value: Value,
        options: CudOptions,
    ) -> Result<CudPackage> {
        let timestamp = options.timestamp;
        self.commit(member, vec![CudAction::update(key_path.into(), value, options)], timestamp)
            .await
    }

    pub async fn delete(&self, member: &str, key_path: impl Into<KeyPath>, options: CudOptions) -> Result<CudPackage> {
        let timestamp = options.timestamp;
        self.commit(member, vec![CudAction::delete(key_path.into(), options)], timestamp)
            .await
    }

    /// Emit actions for one member. Members without local sockets only
    /// publish.
    pub async fn commit(&self, member: &str, actions: Vec<CudAction>, timestamp: Option<i64>) -> Result<CudPackage> {
        emit_cud(&self.core, Some(member), actions, timestamp, || self.channel(member)).await
    }

    pub fn seq_edit(&self, member: &str, timestamp: Option<i64>) -> CudActionSequence {
        let family = self.me.clone();
        let member = member.to_string();
        let commit: CommitFn = Arc::new(move |actions: Vec<CudAction>, timestamp: Option<i64>| {
            let family = family.clone();
            let member = member.clone();
            async move {
                let family = family
                    .upgrade()
                    .ok_or_else(|| Error::InvalidRequest("DataBox family is gone".into()))?;
                family.commit(&member, actions, timestamp).await.map(|_| ())
            }
            .boxed()
        });
        CudActionSequence::new(commit, timestamp)
    }

    pub async fn close(
        &self,
        member: &str,
        code: Option<Code>,
        data: Option<Value>,
        for_every_worker: bool,
    ) -> Result<()> {
        if let Some(channel) = self.channel(member) {
            channel.close_local(code.clone(), data.clone());
        }
        if for_every_worker {
            let payload = serde_json::to_value(ClosePayload { code, data })?;
            self.core
                .publish(Some(member), WorkerAction::Close, payload)
                .await?;
        }
        Ok(())
    }

    pub async fn do_reload(
        &self,
        member: &str,
        for_every_worker: bool,
        code: Option<Code>,
        data: Option<Value>,
    ) -> Result<()> {
        info!(databox = %self.core.name(), member, for_every_worker, "Reloading member clients");
        self.broadcast(member, ClientEvent::Reload { code, data }, for_every_worker)
            .await
    }

    pub async fn broadcast(&self, member: &str, event: ClientEvent, for_every_worker: bool) -> Result<()> {
        if let Some(channel) = self.channel(member) {
            channel.emit_local(&event);
        }
        if for_every_worker {
            self.core
                .publish(Some(member), WorkerAction::Broadcast, event.to_value())
                .await?;
        }
        Ok(())
    }

    pub fn kick_out(&self, member: &str, socket_id: SocketId, code: Option<Code>, data: Option<Value>) -> bool {
        match self.channel(member) {
            Some(channel) => channel.kick_out(socket_id, code, data),
            None => false,
        }
    }
}

impl std::fmt::Debug for DataBoxFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBoxFamily")
            .field("name", &self.core.name())
            .field("api_level", &self.core.api_level())
            .field("members", &self.members.len())
            .finish()
    }
}
