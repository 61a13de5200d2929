//! corevisor - supervises a proxy core process.
//!
//! The [`Supervisor`] owns the managed process and serialises every lifecycle
//! transition. Commands reach it through the [`control`] surface or a
//! [`command::CommandSource`]; status changes fan out through the
//! [`bus::StatusBus`].

pub mod bus;
pub mod cli;
pub mod command;
pub mod control;
pub mod factory;
pub mod logging;
pub mod privilege;
pub mod shutdown;
pub mod supervisor;

pub use bus::{StatusBus, StatusSubscription};
pub use command::{CommandSource, FileCommandSource, pump};
pub use control::{ControlClient, ControlReply, ControlRequest, ControlServer};
pub use factory::PlatformProcessManagerFactory;
pub use shutdown::{ShutdownCoordinator, ShutdownReason, wait_for_shutdown_signal};
pub use supervisor::{NoPreflight, Preflight, Supervisor, SupervisorBuilder};

// Re-export core functionality
pub use corevisor_core::*;
