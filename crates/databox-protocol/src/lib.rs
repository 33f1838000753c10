//! DataBox wire protocol
//!
//! JSON envelopes exchanged between clients and a DataBox host.
//!
//! ## Connect
//! ```text
//! { "d": <name>, "i"?: <member>, "al"?: <apiLevel>, "t"?: <token> }
//! -> { "ut": <usedToken>, "ci": <lastCudId>, "i": <inputKey>, "o": <outputKey> }
//! ```
//!
//! ## Frames
//! ```text
//! client -> server   { "e": <event>, "d": <data>, "r"?: <requestId> }
//! server -> client   { "r": <requestId>, "d": <data> }
//!                    { "r": <requestId>, "err": { "name", "message", "info"? } }
//!                    { "e": <event>, "d": <data> }
//! ```

pub mod connect;
pub mod error;
pub mod frame;

pub use connect::{ConnectRequest, ConnectResponse};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{ClientFrame, ErrorBody, ServerFrame, CONNECT_EVENT, MAX_FRAME_SIZE};
