#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod common;
pub mod core;

mod actor;
#[cfg(feature = "async")]
pub mod async_dht;
pub mod command;
mod dht;
mod error;

pub use actor::transport::{MemoryNetwork, MemorySocket, Transport, MEMORY_NETWORK_PORT};
pub use actor::{Config, Info, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_PARALLELISM, DEFAULT_REQUEST_TIMEOUT};
pub use bytes::Bytes;
pub use common::{Contact, DhtValue, DhtValueEntity, EntityKey, Kuid, ValueType, Version};
pub use self::core::results::{
    BootstrapResult, BootstrapResultType, FindNodeResult, FindValueResult, PingResult, StoreResult,
};
pub use dht::{Dht, DhtBuilder, DhtFuture, Testnet};
pub use error::{DhtError, ProtocolViolation, Result, ValueError};
