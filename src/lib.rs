//! Remote-state tracking and relation network resolution for a unit agent.

pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod remotestate;
pub mod retry;
pub mod state;
pub mod types;

pub use error::{Error, Result};
