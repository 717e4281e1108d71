//! Agent identity and presence tracking
//!
//! Presence is the leaf of the coordination stack: the [`presence::PresenceRegistry`]
//! answers exactly one question for the ring broadcaster - which agents are
//! eligible right now - and records ownership changes driven by the claim
//! and park paths.

pub mod presence;
pub mod types;

pub use presence::PresenceRegistry;
pub use types::{AgentId, Availability};
