//! Shared protocol definitions for the `StudyChat` socket and REST surfaces.

pub mod attachment;
pub mod codec;
pub mod event;
pub mod ids;
pub mod message;
pub mod presence;
pub mod rest;
