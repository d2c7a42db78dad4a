//! # rencontre-chat
//!
//! The real-time delivery core of the Rencontre chat service: presence
//! tracking, the connection registry, the buffered ingestion pipeline, the
//! message distribution hub, the automated dialog engine, and the cache /
//! pub-sub backplane seam that lets several server processes act as one
//! messaging cluster.
//!
//! The crate is transport-agnostic.  The server crate owns the sockets and
//! drives everything through [`ChatHub`].

pub mod backplane;
pub mod dialog;
pub mod history;
pub mod hub;
pub mod pipeline;
pub mod presence;
pub mod registry;
pub mod store_gateway;

mod error;

pub use error::ChatError;
pub use hub::{ChatHub, HubOptions, HubStatus};
pub use store_gateway::StoreGateway;
