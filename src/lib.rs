//! probe-gdb-server
//!
//! A GDB Remote Serial Protocol server for on-chip debugging. GDB connects
//! over TCP; every target operation is funnelled through a single
//! [`controller::TargetController`] thread that owns the debug probe
//! (probe-rs, or an in-memory simulator for tests and demos).

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod gdb;
pub mod probe;
pub mod target;

pub use config::Config;
pub use controller::{TargetController, TargetControllerService};
pub use error::{DebugError, Result};
pub use events::{Event, EventBus};
pub use gdb::GdbRspServer;
