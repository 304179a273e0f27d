//! Session state and the phase machine
//!
//! Sessions live in memory for the life of the process (minus idle
//! eviction). Each one carries its quota, deadline, phase and history.

pub mod manager;
pub mod phase;
pub mod store;

pub use manager::{SessionStore, SharedSession};
pub use phase::Phase;
pub use store::{ChatMessage, Session, SessionLimits, StateSnapshot};
