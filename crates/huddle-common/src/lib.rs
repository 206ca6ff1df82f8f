//! # huddle-common
//!
//! Shared configuration, error handling, token validation and the signaling
//! wire format used by both the Hub and the SFU.
//! No business logic lives here, only primitives and contracts.

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
