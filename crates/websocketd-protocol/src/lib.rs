//! websocketd protocol - Wire protocol between WebSocket clients and the gateway
//!
//! This crate provides the JSON frames exchanged over a gateway WebSocket,
//! the encoder/decoder pair that is the single source of truth for that
//! vocabulary, protocol versioning and the close codes sent on errors.

pub mod close;
pub mod codec;
pub mod message;
pub mod version;

pub use close::CloseReason;
pub use codec::{ProtocolError, SessionProtocolDecoder, SessionProtocolEncoder, MAX_MESSAGE_SIZE};
pub use message::{ClientRequest, ServerMessage, ServerOp};
pub use version::{ProtocolVersion, VersionError};
