//! Auditing SSH relay engine.
//!
//! `run_ssh_server` wires up the russh listener; each accepted connection gets a
//! [`handler::ServerHandler`] that authenticates the client against the static allow-list, dials
//! the principal's backend with the same credential and then drives one
//! [`relay::RelaySession`] between the two channels while transcribing backend output.

pub mod audit;
pub mod config;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod identity;
pub mod relay;
mod server_manager;
mod ssh_server;

pub use config::FortressConfig;
pub use error::{RelayError, RelayResult};
pub use identity::{IdentityResolver, StaticResolver};
pub use ssh_server::{build_server_config, run_ssh_server};
