//! Unix process management for nats-runner
//!
//! Servers are spawned into their own process group and torn down with
//! SIGKILL to the group plus any descendant that escaped it.

#[cfg(unix)]
mod runner_process_manager;
#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use runner_process_manager::{UnixBrokerProcessManager, UnixBrokerProcessManagerFactory};
#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};
