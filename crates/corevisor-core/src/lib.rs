//! corevisor core - platform-independent supervision abstractions
//!
//! This crate provides the process traits, configuration and error types
//! shared by the platform crates and the supervisor itself.

pub mod command;
pub mod config;
pub mod error;
pub mod process;
pub mod status;
pub mod watcher;

pub use command::*;
pub use config::*;
pub use error::*;
pub use process::*;
pub use status::*;
pub use watcher::*;
