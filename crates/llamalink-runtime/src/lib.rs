//! Service lifecycle supervisor for the llamalink proxy.
//!
//! The supervisor owns the listening socket and the server task; external
//! callers (the tray UI, the CLI) drive it through `start`, `stop`,
//! `reconfigure` and `status` and never touch server internals directly.

#![deny(unsafe_code)]

pub mod supervisor;

pub use supervisor::{ServiceSupervisor, SupervisorError};
