//! nats-runner core - platform-independent abstractions and configuration
//!
//! This crate provides the options, error taxonomy, process traits and
//! output capture shared by the platform-specific process managers and
//! the `nats-runner` facade.

pub mod config;
pub mod error;
pub mod process;
pub mod process_manager_trait;
pub mod stdio;

pub use config::*;
pub use error::*;
pub use process::*;
pub use process_manager_trait::*;
pub use stdio::*;
