//! Singleton DataBox: one synchronized data set shared by all its sockets

use crate::access::ConnectionContext;
use crate::action::{Code, CudAction, CudOptions, KeyPath};
use crate::channel::{emit_cud, Attachment, Channel, DataReply};
use crate::core::DataBoxCore;
use crate::error::Result;
use crate::event::{ClientEvent, ClosePayload};
use crate::exchange::WorkerAction;
use crate::package::{CudPackage, LastCud};
use crate::sequence::{CommitFn, CudActionSequence};
use crate::session::{DbSessionData, SessionTarget};
use crate::socket::{Socket, SocketId};
use futures_util::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct DataBox {
    core: Arc<DataBoxCore>,
    channel: Arc<Channel>,
}

impl DataBox {
    pub fn new(core: DataBoxCore) -> Arc<Self> {
        let core = Arc::new(core);
        let channel = Channel::new(core.clone(), None, None);
        Arc::new(Self { core, channel })
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

    pub fn verify_session_token(&self, token: &str) -> Option<DbSessionData> {
        self.core.verify_session_token(token, None)
    }

    /// Key this box occupies in a socket's attachment set
    pub fn attachment_key(&self) -> String {
        self.core.input_key(None)
    }

    /// Attach a socket, resuming `session` if one was verified. Fails with
    /// `SocketDisconnected` once the socket is gone.
    pub fn register_socket(&self, socket: &Arc<Socket>, session: Option<DbSessionData>) -> Result<Attachment> {
        self.channel.register(socket, session)
    }

    pub fn unregister_socket(&self, socket_id: SocketId) -> bool {
        self.channel.unregister(socket_id)
    }

    pub fn is_registered(&self, socket_id: SocketId) -> bool {
        self.channel.contains(socket_id)
    }

    pub fn registered_sockets(&self) -> usize {
        self.channel.len()
    }

    pub fn last_cud_id(&self) -> String {
        self.channel.last_cud_id()
    }

    pub fn last_cud(&self) -> LastCud {
        self.channel.last_cud()
    }

    pub async fn get_data(&self, socket_id: SocketId, target: SessionTarget) -> Result<DataReply> {
        self.channel.get_data(socket_id, target).await
    }

    pub async fn reset_session(&self, socket_id: SocketId, target: SessionTarget) -> Result<String> {
        self.channel.reset_session(socket_id, target).await
    }

    pub async fn copy_session(&self, socket_id: SocketId, target: SessionTarget) -> Result<String> {
        self.channel.copy_session(socket_id, target).await
    }

    /// Current session state of a registered socket
    pub async fn session(&self, socket_id: SocketId) -> Option<DbSessionData> {
        self.channel.session(socket_id).await
    }

    pub async fn insert(&self, key_path: impl Into<KeyPath>, value: Value, options: CudOptions) -> Result<CudPackage> {
        let timestamp = options.timestamp;
        self.commit(vec![CudAction::insert(key_path.into(), value, options)], timestamp)
            .await
    }

    pub async fn update(&self, key_path: impl Into<KeyPath>, value: Value, options: CudOptions) -> Result<CudPackage> {
        let timestamp = options.timestamp;
        self.commit(vec![CudAction::update(key_path.into(), value, options)], timestamp)
            .await
    }

    pub async fn delete(&self, key_path: impl Into<KeyPath>, options: CudOptions) -> Result<CudPackage> {
        let timestamp = options.timestamp;
        self.commit(vec![CudAction::delete(key_path.into(), options)], timestamp)
            .await
    }

    /// Emit prepared actions as one package
    pub async fn commit(&self, actions: Vec<CudAction>, timestamp: Option<i64>) -> Result<CudPackage> {
        let channel = self.channel.clone();
        emit_cud(&self.core, None, actions, timestamp, move || Some(channel)).await
    }

    /// Start a sequence whose actions are emitted as one package on commit
    pub fn seq_edit(&self, timestamp: Option<i64>) -> CudActionSequence {
        let core = self.core.clone();
        let channel = self.channel.clone();
        let commit: CommitFn = Arc::new(move |actions: Vec<CudAction>, timestamp: Option<i64>| {
            let core = core.clone();
            let channel = channel.clone();
            async move {
                emit_cud(&core, None, actions, timestamp, move || Some(channel))
                    .await
                    .map(|_| ())
            }
            .boxed()
        });
        CudActionSequence::new(commit, timestamp)
    }

    /// Close for every local socket, and for every worker if asked to
    pub async fn close(&self, code: Option<Code>, data: Option<Value>, for_every_worker: bool) -> Result<()> {
        self.channel.close_local(code.clone(), data.clone());
        if for_every_worker {
            let payload = serde_json::to_value(ClosePayload { code, data })?;
            self.core.publish(None, WorkerAction::Close, payload).await?;
        }
        Ok(())
    }

    /// Tell clients to drop their state and fetch again
    pub async fn do_reload(&self, for_every_worker: bool, code: Option<Code>, data: Option<Value>) -> Result<()> {
        info!(databox = %self.core.name(), for_every_worker, "Reloading DataBox clients");
        self.broadcast(ClientEvent::Reload { code, data }, for_every_worker)
            .await
    }

    /// Send an event to local sockets and optionally to other workers
    pub async fn broadcast(&self, event: ClientEvent, for_every_worker: bool) -> Result<()> {
        self.channel.emit_local(&event);
        if for_every_worker {
            self.core
                .publish(None, WorkerAction::Broadcast, event.to_value())
                .await?;
        }
        Ok(())
    }

    /// Notify and unregister one socket. Returns false if it was not attached.
    pub fn kick_out(&self, socket_id: SocketId, code: Option<Code>, data: Option<Value>) -> bool {
        self.channel.kick_out(socket_id, code, data)
    }
}

impl std::fmt::Debug for DataBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBox")
            .field("name", &self.core.name())
            .field("api_level", &self.core.api_level())
            .field("sockets", &self.channel.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{no_more_data_available, DataBoxConfig, DataBoxEnv, DataBoxHooks};
    use crate::error::Error;
    use crate::exchange::LocalExchange;
    use crate::socket::{next_socket_id, OutboundEvent};
    use serde_json::{json, Map};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn worker(name: &str, worker_id: &str, exchange: &Arc<LocalExchange>, config: &DataBoxConfig) -> Arc<DataBox> {
        let env = DataBoxEnv::new(worker_id, exchange.clone(), b"secret".to_vec());
        DataBox::new(DataBoxCore::new(name, None, config, &env))
    }

    fn socket() -> (Arc<Socket>, UnboundedReceiver<OutboundEvent>) {
        Socket::new(next_socket_id(), ConnectionContext::default())
    }

    fn drain(rx: &mut UnboundedReceiver<OutboundEvent>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.payload);
        }
        events
    }

    fn paging_hooks() -> DataBoxHooks {
        DataBoxHooks::new().on_fetch(|mut request| async move {
            if request.counter >= 2 {
                return Err(no_more_data_available());
            }
            request.session.insert("page".into(), json!(request.counter + 1));
            let page = request.counter;
            Ok(request.reply(json!({ "page": page })))
        })
    }

    #[tokio::test]
    async fn test_insert_reaches_each_worker_once() {
        let exchange = Arc::new(LocalExchange::new());
        let config = DataBoxConfig::new();
        let w1 = worker("feed", "w1", &exchange, &config);
        let w2 = worker("feed", "w2", &exchange, &config);

        let (s1, mut rx1) = socket();
        let (s2, mut rx2) = socket();
        w1.register_socket(&s1, None).unwrap();
        w2.register_socket(&s2, None).unwrap();

        let package = w1
            .insert("items.a", json!({ "n": 1 }), CudOptions::default())
            .await
            .unwrap();

        let on_w1 = drain(&mut rx1);
        let on_w2 = drain(&mut rx2);
        assert_eq!(on_w1.len(), 1);
        assert_eq!(on_w2.len(), 1);
        assert_eq!(on_w1[0]["a"], "cud");
        assert_eq!(on_w2[0]["d"]["ci"], package.cud_id());
        assert_eq!(w2.last_cud_id(), package.cud_id());
    }

    #[tokio::test]
    async fn test_topic_watched_once_per_process() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new());

        for _ in 0..3 {
            let (s, _rx) = socket();
            data_box.register_socket(&s, None).unwrap();
        }
        assert_eq!(exchange.watcher_count("DB-feed-default"), 1);
        assert_eq!(data_box.registered_sockets(), 3);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new().with_hooks(paging_hooks()));
        let (s, _rx) = socket();

        data_box.register_socket(&s, None).unwrap();
        data_box.get_data(s.id(), SessionTarget::Main).await.unwrap();
        let attachment = data_box.register_socket(&s, None).unwrap();

        assert_eq!(attachment.input_key, "DB-feed-default.in");
        assert_eq!(data_box.registered_sockets(), 1);
        assert_eq!(s.attachment_count(), 1);
        let session = data_box.session(s.id()).await.unwrap();
        assert_eq!(session.main.counter, 1);
    }

    #[tokio::test]
    async fn test_seq_edit_emits_one_package() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new());
        let (s, mut rx) = socket();
        data_box.register_socket(&s, None).unwrap();

        let mut seq = data_box.seq_edit(Some(1_000));
        seq.insert("a", json!(1), CudOptions::default())
            .update("b", json!(2), CudOptions::default())
            .delete("c", CudOptions::default());
        seq.commit().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let kinds: Vec<&str> = events[0]["d"]["a"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["t"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["insert", "update", "delete"]);
        assert_eq!(events[0]["d"]["t"], 1_000);
    }

    #[tokio::test]
    async fn test_rejected_hook_emits_nothing() {
        let exchange = Arc::new(LocalExchange::new());
        let hooks = DataBoxHooks::new().before_delete(|_| async { Err(Error::Hook("no deletes".into())) });
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new().with_hooks(hooks));
        let (s, mut rx) = socket();
        data_box.register_socket(&s, None).unwrap();

        let err = data_box.delete("a", CudOptions::default()).await.unwrap_err();
        assert_eq!(err.name(), "HookFailed");
        assert!(drain(&mut rx).is_empty());
        assert_eq!(data_box.last_cud_id(), "");
    }

    #[tokio::test]
    async fn test_older_package_keeps_marker() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new());

        let newer = data_box
            .insert("a", json!(1), CudOptions::default().timestamp(200))
            .await
            .unwrap();
        data_box
            .insert("b", json!(2), CudOptions::default().timestamp(100))
            .await
            .unwrap();
        assert_eq!(data_box.last_cud_id(), newer.cud_id());
        assert_eq!(data_box.last_cud().timestamp(), Some(200));
    }

    #[tokio::test]
    async fn test_session_actions_over_socket() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new().with_hooks(paging_hooks()));
        let (s, _rx) = socket();
        let attachment = data_box.register_socket(&s, None).unwrap();
        let input = attachment.input_key.as_str();

        let first = s.dispatch(input, json!({ "a": "getData" })).await.unwrap();
        assert_eq!(first["d"], json!({ "page": 0 }));
        let second = s.dispatch(input, json!({ "a": "getData", "t": "main" })).await.unwrap();
        assert_eq!(second["d"], json!({ "page": 1 }));

        let end = s.dispatch(input, json!({ "a": "getData" })).await.unwrap_err();
        assert!(end.is_no_more_data());

        // the token carries the advanced counter
        let token = second["t"].as_str().unwrap();
        let restored = data_box.verify_session_token(token).unwrap();
        assert_eq!(restored.main.counter, 2);

        s.dispatch(input, json!({ "a": "resetSession" })).await.unwrap();
        let session = data_box.session(s.id()).await.unwrap();
        assert_eq!(session.main.counter, 0);
        assert_eq!(session.main.data, Map::new());

        let err = s.dispatch(input, json!({ "a": "getData", "t": 3 })).await.unwrap_err();
        assert_eq!(err.name(), "UnknownSessionTarget");
        let err = s.dispatch(input, json!({ "a": "explode" })).await.unwrap_err();
        assert_eq!(err.name(), "UnknownAction");
    }

    #[tokio::test]
    async fn test_copy_session_is_independent() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new().with_hooks(paging_hooks()));
        let (s, _rx) = socket();
        data_box.register_socket(&s, None).unwrap();

        data_box.get_data(s.id(), SessionTarget::Main).await.unwrap();
        data_box.copy_session(s.id(), SessionTarget::Main).await.unwrap();
        data_box.get_data(s.id(), SessionTarget::Restore).await.unwrap();

        let session = data_box.session(s.id()).await.unwrap();
        assert_eq!(session.main.counter, 1);
        assert_eq!(session.restore.counter, 2);
        assert_eq!(session.main.data["page"], json!(1));
        assert_eq!(session.restore.data["page"], json!(2));
    }

    #[tokio::test]
    async fn test_close_reaches_every_worker() {
        let exchange = Arc::new(LocalExchange::new());
        let config = DataBoxConfig::new();
        let w1 = worker("feed", "w1", &exchange, &config);
        let w2 = worker("feed", "w2", &exchange, &config);
        let (s1, mut rx1) = socket();
        let (s2, mut rx2) = socket();
        w1.register_socket(&s1, None).unwrap();
        w2.register_socket(&s2, None).unwrap();

        w1.close(Some(Code::Number(4001)), Some(json!("deleted")), true)
            .await
            .unwrap();

        let expected = json!({ "a": "close", "c": 4001, "d": "deleted" });
        assert_eq!(drain(&mut rx1), vec![expected.clone()]);
        assert_eq!(drain(&mut rx2), vec![expected]);
        assert_eq!(w1.registered_sockets(), 0);
        assert_eq!(w2.registered_sockets(), 0);
        assert_eq!(s1.attachment_count(), 0);
        assert!(!s2.has_handler("DB-feed-default.in"));
    }

    #[tokio::test]
    async fn test_reload_stays_local_by_default() {
        let exchange = Arc::new(LocalExchange::new());
        let config = DataBoxConfig::new();
        let w1 = worker("feed", "w1", &exchange, &config);
        let w2 = worker("feed", "w2", &exchange, &config);
        let (s1, mut rx1) = socket();
        let (s2, mut rx2) = socket();
        w1.register_socket(&s1, None).unwrap();
        w2.register_socket(&s2, None).unwrap();

        w1.do_reload(false, None, None).await.unwrap();
        assert_eq!(drain(&mut rx1), vec![json!({ "a": "reload" })]);
        assert!(drain(&mut rx2).is_empty());

        w1.do_reload(true, Some("stale".into()), None).await.unwrap();
        assert_eq!(drain(&mut rx2), vec![json!({ "a": "reload", "c": "stale" })]);
    }

    #[tokio::test]
    async fn test_kick_out_and_disconnect() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new());
        let (a, mut rx_a) = socket();
        let (b, mut rx_b) = socket();
        data_box.register_socket(&a, None).unwrap();
        data_box.register_socket(&b, None).unwrap();

        assert!(data_box.kick_out(a.id(), Some(Code::Number(1)), None));
        assert_eq!(drain(&mut rx_a), vec![json!({ "a": "kickOut", "c": 1 })]);
        assert!(drain(&mut rx_b).is_empty());
        assert!(!data_box.kick_out(a.id(), None, None));

        b.disconnect();
        assert_eq!(data_box.registered_sockets(), 0);

        // delivering with no listeners is fine
        assert!(data_box.insert("", json!({}), CudOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnected_socket_is_not_registered() {
        let exchange = Arc::new(LocalExchange::new());
        let data_box = worker("feed", "w1", &exchange, &DataBoxConfig::new());
        let (s, _rx) = socket();
        s.disconnect();

        let err = data_box.register_socket(&s, None).unwrap_err();
        assert_eq!(err.name(), "SocketDisconnected");
        assert!(!data_box.is_registered(s.id()));
        assert!(!s.has_handler("DB-feed-default.in"));
        assert_eq!(s.attachment_count(), 0);
        assert!(!exchange.is_watched("DB-feed-default"));
    }
}
