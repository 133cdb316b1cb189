//! Tier-level synchronization: addressing, wire protocol, connection
//! management, and pairing.

pub mod manager;
pub mod pairing;
pub mod protocol;
pub mod tier;

pub use manager::{ClientConfig, MessageHandler, SyncManager, SyncTransport, TierEvent};
pub use pairing::PairedEngineManager;
pub use protocol::{Envelope, SyncMessage};
pub use tier::{Tier, TierAddress};
