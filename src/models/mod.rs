//! Data models for gateway entities

mod chat;
mod message;
pub mod wire;

pub use chat::*;
pub use message::*;
