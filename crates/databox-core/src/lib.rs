//! DataBox Core - reactive data synchronization engine
//!
//! This crate provides the engine behind DataBoxes:
//! - Cud actions and packages describing insert/update/delete batches
//! - Resumable client sessions carried in signed tokens
//! - Singleton DataBoxes and per-member DataBox families
//! - Cross-worker replication over a pluggable exchange
//! - Access rules re-evaluated against the live auth state

pub mod access;
pub mod action;
mod channel;
pub mod core;
pub mod databox;
pub mod error;
pub mod event;
pub mod exchange;
pub mod family;
pub mod package;
pub mod registry;
pub mod sequence;
pub mod session;
pub mod socket;
pub mod token;

pub use access::{AccessConfig, AccessRule, Anonymous, AuthState, ConnectionContext, SystemRule, VersionRule};
pub use action::{Code, CudAction, CudOptions, CudType, KeyPath};
pub use channel::{Attachment, DataReply};
pub use crate::core::{
    no_more_data_available, CudEvent, DataBoxConfig, DataBoxCore, DataBoxEnv, DataBoxHooks, FetchRequest, Fetched,
    IdValidity,
};
pub use databox::DataBox;
pub use error::{Error, Result};
pub use event::ClientEvent;
pub use exchange::{Exchange, LocalExchange, WorkerAction, WorkerMessage};
pub use family::DataBoxFamily;
pub use package::{CudPackage, LastCud};
pub use registry::{AnyDataBox, DataBoxDefinition, DataBoxKind, DataBoxRegistry};
pub use sequence::CudActionSequence;
pub use session::{DbSession, DbSessionData, SessionTarget};
pub use socket::{next_socket_id, OutboundEvent, Socket, SocketId};
