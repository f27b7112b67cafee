//! Miscellaneous common structs used throughout the library.

mod bucket;
mod contact;
mod entity;
mod kuid;
pub mod messages;
mod routing_table;
mod security;

pub use bucket::*;
pub use contact::*;
pub use entity::*;
pub use kuid::*;
pub use messages::*;
pub use routing_table::*;
pub use security::*;
