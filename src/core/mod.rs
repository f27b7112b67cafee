//! Core DHT logic - pure computation with no direct I/O.
//!
//! Contains the value `database`, the `server` request handlers, the
//! `message_handler` deciding route table updates and store-forwarding,
//! the `results` of outbound operations, and stateful helpers
//! (`statistics`, `routing_maintenance`).
//! All I/O orchestration lives in `actor/`, which calls into this module.

pub mod database;
pub mod message_handler;
pub mod results;
pub(crate) mod routing_maintenance;
pub mod server;
pub mod statistics;
