//! # rencontre-shared
//!
//! Types shared by every crate in the Rencontre chat core: identifier
//! newtypes, message kind/status enums, the WebSocket wire protocol, and
//! protocol-wide constants.

pub mod constants;
pub mod protocol;
pub mod types;

pub use protocol::{ClientCommand, ConnectionSnapshot, MessagePayload, ServerEvent};
pub use types::{ChatId, ConnectionId, DeliveryStatus, MessageId, MessageKind, UserId};
