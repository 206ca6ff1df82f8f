//! # huddle-sfu
//!
//! Audio-only selective forwarding unit. It takes its signaling from the Hub
//! over the internal channel and forwards every participant's Opus audio to
//! the rest of their project.

pub mod error;
pub mod forwarding;
pub mod link;
pub mod peer;
pub mod sfu;

pub use error::{SfuError, SfuResult};
pub use link::{HubLink, LinkSettings};
pub use peer::{PeerContext, PeerPhase};
pub use sfu::{Sfu, SfuSettings, SfuStats};
