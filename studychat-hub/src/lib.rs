//! `StudyChat` reference hub library.
//!
//! Exposes the hub for use in tests and embedding. The hub authenticates
//! sockets by bearer token, fans out typing, presence, message and read
//! events to room members, and serves the REST collaborator API.

pub mod config;
pub mod hub;
pub mod rest;
pub mod socket;
pub mod store;
