//! `StudyChat` real-time chat core.

pub mod api;
pub mod cache;
pub mod chat;
pub mod config;
pub mod error;
pub mod transport;

pub use chat::{ChatClient, ChatEvent, ChatHandle};
pub use error::ChatError;
