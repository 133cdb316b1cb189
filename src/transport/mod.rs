//! Websocket connections between tiers.
//!
//! [`client::ClientConnection`] dials a remote tier and keeps the link up;
//! [`server::ServerConnection`] authenticates and tracks inbound tiers.

pub mod client;
pub mod server;
pub mod socket;

pub use client::{ClientConnection, ClientEvent, Connector, WsConnector};
pub use server::{ServerConnection, ServerEvent};
pub use socket::RawSocket;
