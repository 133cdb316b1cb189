//! Multi-tier sync engine: phones, desktops, home servers and the cloud
//! keep shared tables eventually consistent over authenticated websockets.

pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod gateway;
pub mod platform;
pub mod sync;
pub mod transport;

pub use error::SyncError;
