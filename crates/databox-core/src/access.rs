//! Access rules evaluated when a socket attaches to a DataBox

use crate::error::{Error, Result};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Live view of a connection's authentication state.
///
/// Queried on every access check, since auth can change after a session
/// token was issued.
pub trait AuthState: Send + Sync {
    /// Whether the connection's auth token is still valid
    fn is_authenticated(&self) -> bool;

    /// Group of the authenticated user, if any
    fn user_group(&self) -> Option<String> {
        None
    }
}

/// Auth state that never authenticates
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl AuthState for Anonymous {
    fn is_authenticated(&self) -> bool {
        false
    }
}

/// What the DataBox engine knows about a connection
#[derive(Clone)]
pub struct ConnectionContext {
    /// Client system, e.g. "web" or "ios"
    pub system: String,
    /// Client version
    pub version: f64,
    /// Api level negotiated when the socket connected
    pub api_level: Option<u32>,
    pub auth: Arc<dyn AuthState>,
}

impl ConnectionContext {
    pub fn new(system: impl Into<String>, version: f64) -> Self {
        Self {
            system: system.into(),
            version,
            api_level: None,
            auth: Arc::new(Anonymous),
        }
    }

    pub fn with_api_level(mut self, api_level: u32) -> Self {
        self.api_level = Some(api_level);
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthState>) -> Self {
        self.auth = auth;
        self
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new("default", 1.0)
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("system", &self.system)
            .field("version", &self.version)
            .field("api_level", &self.api_level)
            .field("authenticated", &self.auth.is_authenticated())
            .finish()
    }
}

/// Which client systems may attach
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemRule {
    #[default]
    All,
    Only(Vec<String>),
}

/// Minimum client version per system; systems not listed are rejected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionRule {
    #[default]
    All,
    Minimum(HashMap<String, f64>),
}

/// Async access predicate over the connection context
pub type AccessPredicate =
    Arc<dyn Fn(ConnectionContext) -> BoxFuture<'static, bool> + Send + Sync>;

/// Token-state rule
#[derive(Clone, Default)]
pub enum AccessRule {
    #[default]
    All,
    None,
    Authenticated,
    NotAuthenticated,
    Groups(Vec<String>),
    Custom(AccessPredicate),
}

impl std::fmt::Debug for AccessRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessRule::All => write!(f, "All"),
            AccessRule::None => write!(f, "None"),
            AccessRule::Authenticated => write!(f, "Authenticated"),
            AccessRule::NotAuthenticated => write!(f, "NotAuthenticated"),
            AccessRule::Groups(groups) => f.debug_tuple("Groups").field(groups).finish(),
            AccessRule::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Access configuration of a DataBox
#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub system: SystemRule,
    pub version: VersionRule,
    pub access: AccessRule,
}

type SystemCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;
type VersionCheck = Box<dyn Fn(&str, f64) -> bool + Send + Sync>;

/// Access checks compiled once at startup
pub struct AccessChecker {
    system: SystemCheck,
    version: VersionCheck,
    access: AccessRule,
}

impl AccessChecker {
    pub fn compile(config: &AccessConfig) -> Self {
        let system: SystemCheck = match &config.system {
            SystemRule::All => Box::new(|_| true),
            SystemRule::Only(allowed) => {
                let allowed = allowed.clone();
                Box::new(move |system| allowed.iter().any(|s| s == system))
            }
        };

        let version: VersionCheck = match &config.version {
            VersionRule::All => Box::new(|_, _| true),
            VersionRule::Minimum(minimums) => {
                let minimums = minimums.clone();
                Box::new(move |system, version| {
                    minimums.get(system).map_or(false, |min| version >= *min)
                })
            }
        };

        Self {
            system,
            version,
            access: config.access.clone(),
        }
    }

    /// Run system, version, then token-state checks
    pub async fn check(&self, ctx: &ConnectionContext) -> Result<()> {
        if !(self.system)(&ctx.system) {
            return Err(Error::NoAccessWithSystem(ctx.system.clone()));
        }

        if !(self.version)(&ctx.system, ctx.version) {
            return Err(Error::NoAccessWithVersion {
                system: ctx.system.clone(),
                version: ctx.version,
            });
        }

        let allowed = match &self.access {
            AccessRule::All => true,
            AccessRule::None => false,
            AccessRule::Authenticated => ctx.auth.is_authenticated(),
            AccessRule::NotAuthenticated => !ctx.auth.is_authenticated(),
            AccessRule::Groups(groups) => {
                ctx.auth.is_authenticated()
                    && ctx
                        .auth
                        .user_group()
                        .map_or(false, |g| groups.iter().any(|allowed| *allowed == g))
            }
            AccessRule::Custom(predicate) => predicate(ctx.clone()).await,
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }
}

impl std::fmt::Debug for AccessChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessChecker")
            .field("access", &self.access)
            .finish()
    }
}
