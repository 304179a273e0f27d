//! Core types and traits for parley
//!
//! This crate provides the session store and phase machine, the wire
//! protocol, configuration, logging and the event recorder shared by
//! the other parley components.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
