//! Shared base of DataBox and DataBoxFamily: configuration, hooks, access
//! control and session token cryptography.

use crate::access::{AccessChecker, AccessConfig, ConnectionContext};
use crate::action::{CudAction, CudType};
use crate::error::{Error, Result};
use crate::exchange::{Exchange, WorkerAction, WorkerMessage};
use crate::package::{CudPackage, PreCudPackage};
use crate::registry::AnyDataBox;
use crate::session::DbSessionData;
use crate::token::SessionTokenKey;
use futures_util::future::{try_join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

/// Prefix of every DataBox topic name
pub const TOPIC_PREFIX: &str = "DB";

/// Input handed to a fetch hook
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Family member, `None` for a singleton DataBox
    pub member: Option<String>,
    /// How many times this session has fetched before
    pub counter: u64,
    /// Opaque session state, e.g. pagination cursors
    pub session: Map<String, Value>,
    pub context: ConnectionContext,
}

impl FetchRequest {
    /// Reply with data, keeping the session state as it is
    pub fn reply(self, data: Value) -> Fetched {
        Fetched {
            data,
            session: self.session,
        }
    }
}

/// Output of a fetch hook: the data plus the updated session state
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: Value,
    pub session: Map<String, Value>,
}

/// One action passed to a before-insert/update/delete hook
#[derive(Debug, Clone)]
pub struct CudEvent {
    pub member: Option<String>,
    /// Caller supplied package timestamp, if any
    pub timestamp: Option<i64>,
    pub action: CudAction,
}

/// Outcome of a member id validation
#[derive(Debug, Clone, PartialEq)]
pub enum IdValidity {
    Valid,
    Invalid,
    /// Rejected with structured info for the client
    Rejected(Value),
}

impl From<bool> for IdValidity {
    fn from(valid: bool) -> Self {
        if valid {
            IdValidity::Valid
        } else {
            IdValidity::Invalid
        }
    }
}

pub type FetchHook = Arc<dyn Fn(FetchRequest) -> BoxFuture<'static, Result<Fetched>> + Send + Sync>;
pub type CudHook = Arc<dyn Fn(CudEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type IdValidHook =
    Arc<dyn Fn(String, ConnectionContext) -> BoxFuture<'static, IdValidity> + Send + Sync>;
pub type InitHook = Arc<dyn Fn(AnyDataBox) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Optional closures supplied when a DataBox is defined
#[derive(Clone, Default)]
pub struct DataBoxHooks {
    pub fetch: Option<FetchHook>,
    pub before_insert: Option<CudHook>,
    pub before_update: Option<CudHook>,
    pub before_delete: Option<CudHook>,
    pub is_id_valid: Option<IdValidHook>,
    pub initialize: Option<InitHook>,
}

impl DataBoxHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fetch<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FetchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fetched>> + Send + 'static,
    {
        let hook: FetchHook = Arc::new(move |request: FetchRequest| f(request).boxed());
        self.fetch = Some(hook);
        self
    }

    pub fn before_insert<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CudEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_insert = Some(cud_hook(f));
        self
    }

    pub fn before_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CudEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_update = Some(cud_hook(f));
        self
    }

    pub fn before_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CudEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_delete = Some(cud_hook(f));
        self
    }

    pub fn is_id_valid<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, ConnectionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IdValidity> + Send + 'static,
    {
        let hook: IdValidHook =
            Arc::new(move |id: String, ctx: ConnectionContext| f(id, ctx).boxed());
        self.is_id_valid = Some(hook);
        self
    }

    pub fn on_initialize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(AnyDataBox) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: InitHook = Arc::new(move |data_box: AnyDataBox| f(data_box).boxed());
        self.initialize = Some(hook);
        self
    }

    fn for_kind(&self, kind: CudType) -> Option<&CudHook> {
        match kind {
            CudType::Insert => self.before_insert.as_ref(),
            CudType::Update => self.before_update.as_ref(),
            CudType::Delete => self.before_delete.as_ref(),
        }
    }
}

fn cud_hook<F, Fut>(f: F) -> CudHook
where
    F: Fn(CudEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event: CudEvent| f(event).boxed())
}

impl std::fmt::Debug for DataBoxHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBoxHooks")
            .field("fetch", &self.fetch.is_some())
            .field("before_insert", &self.before_insert.is_some())
            .field("before_update", &self.before_update.is_some())
            .field("before_delete", &self.before_delete.is_some())
            .field("is_id_valid", &self.is_id_valid.is_some())
            .field("initialize", &self.initialize.is_some())
            .finish()
    }
}

/// Definition-time configuration of one DataBox variant
#[derive(Debug, Clone, Default)]
pub struct DataBoxConfig {
    pub access: AccessConfig,
    pub hooks: DataBoxHooks,
}

impl DataBoxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access(mut self, access: AccessConfig) -> Self {
        self.access = access;
        self
    }

    pub fn with_hooks(mut self, hooks: DataBoxHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Process-wide environment shared by every DataBox of a worker
#[derive(Clone)]
pub struct DataBoxEnv {
    /// Identity of this worker process, attached to everything it publishes
    pub worker_id: String,
    pub exchange: Arc<dyn Exchange>,
    /// Global secret from which session token keys are derived
    pub secret: Vec<u8>,
}

impl DataBoxEnv {
    pub fn new(worker_id: impl Into<String>, exchange: Arc<dyn Exchange>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            worker_id: worker_id.into(),
            exchange,
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for DataBoxEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBoxEnv")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// State and behavior shared by singleton and family DataBoxes
pub struct DataBoxCore {
    name: String,
    api_level: Option<u32>,
    worker_id: String,
    exchange: Arc<dyn Exchange>,
    token_key: SessionTokenKey,
    access: AccessChecker,
    hooks: DataBoxHooks,
}

impl DataBoxCore {
    pub fn new(name: impl Into<String>, api_level: Option<u32>, config: &DataBoxConfig, env: &DataBoxEnv) -> Self {
        let name = name.into();
        Self {
            token_key: SessionTokenKey::derive(&env.secret, &name, api_level),
            access: AccessChecker::compile(&config.access),
            hooks: config.hooks.clone(),
            worker_id: env.worker_id.clone(),
            exchange: env.exchange.clone(),
            api_level,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api_level(&self) -> Option<u32> {
        self.api_level
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    /// System, version, then token-state checks
    pub async fn check_access(&self, ctx: &ConnectionContext) -> Result<()> {
        self.access.check(ctx).await
    }

    /// Run the member id validation hook; no hook means every id is valid
    pub async fn check_id_valid(&self, id: &str, ctx: &ConnectionContext) -> Result<()> {
        let Some(hook) = &self.hooks.is_id_valid else {
            return Ok(());
        };
        match hook(id.to_string(), ctx.clone()).await {
            IdValidity::Valid => Ok(()),
            IdValidity::Invalid => Err(Error::IdIsNotValid {
                id: id.to_string(),
                info: None,
            }),
            IdValidity::Rejected(info) => Err(Error::IdIsNotValid {
                id: id.to_string(),
                info: Some(info),
            }),
        }
    }

    pub fn sign_session_token(&self, session: &DbSessionData, key_append: Option<&str>) -> Result<String> {
        self.token_key.sign(session, key_append)
    }

    pub fn verify_session_token(&self, token: &str, key_append: Option<&str>) -> Option<DbSessionData> {
        self.token_key.verify(token, key_append)
    }

    /// `DB-<id>-<apiLevel>[-<member>]`
    pub fn topic(&self, member: Option<&str>) -> String {
        let level = self
            .api_level
            .map(|l| l.to_string())
            .unwrap_or_else(|| "default".to_string());
        match member {
            Some(member) => format!("{}-{}-{}-{}", TOPIC_PREFIX, self.name, level, member),
            None => format!("{}-{}-{}", TOPIC_PREFIX, self.name, level),
        }
    }

    /// Event a client sends session actions on
    pub fn input_key(&self, member: Option<&str>) -> String {
        format!("{}.in", self.topic(member))
    }

    /// Event a client receives cud, close, reload and kickOut on
    pub fn output_key(&self, member: Option<&str>) -> String {
        format!("{}.out", self.topic(member))
    }

    pub(crate) async fn fetch(&self, request: FetchRequest) -> Result<Fetched> {
        match &self.hooks.fetch {
            Some(hook) => hook(request).await,
            None => Err(no_more_data_available()),
        }
    }

    /// Run before-hooks of every action concurrently, then stamp the package.
    /// The first failing hook aborts the batch.
    pub(crate) async fn prepare_package(
        &self,
        member: Option<&str>,
        actions: Vec<CudAction>,
        timestamp: Option<i64>,
    ) -> Result<CudPackage> {
        let pre = PreCudPackage::new(actions, timestamp);

        let pending: Vec<_> = pre
            .actions
            .iter()
            .filter_map(|action| {
                let hook = self.hooks.for_kind(action.kind())?;
                Some(hook(CudEvent {
                    member: member.map(str::to_string),
                    timestamp,
                    action: action.clone(),
                }))
            })
            .collect();
        if !pending.is_empty() {
            try_join_all(pending).await?;
        }

        Ok(pre.finalize())
    }

    /// Publish to the sibling workers, tagged with this worker's id
    pub(crate) async fn publish(&self, member: Option<&str>, action: WorkerAction, data: Value) -> Result<()> {
        let topic = self.topic(member);
        trace!(databox = %self.name, topic = %topic, action = ?action, "Publishing to workers");
        self.exchange
            .publish(
                &topic,
                WorkerMessage {
                    action,
                    data,
                    worker_id: self.worker_id.clone(),
                },
            )
            .await
    }
}

impl std::fmt::Debug for DataBoxCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBoxCore")
            .field("name", &self.name)
            .field("api_level", &self.api_level)
            .field("worker_id", &self.worker_id)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// End-of-stream signal for fetch hooks.
///
/// Return it as `Err(no_more_data_available())` when the session has
/// nothing left to deliver.
pub fn no_more_data_available() -> Error {
    Error::NoMoreDataAvailable
}
