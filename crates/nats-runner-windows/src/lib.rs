//! Windows process management for nats-runner
//!
//! Process trees are torn down with `taskkill /F /T`.

#[cfg(windows)]
mod runner_process_manager;
#[cfg(windows)]
mod windows_process_manager;

#[cfg(windows)]
pub use runner_process_manager::{WindowsBrokerProcessManager, WindowsBrokerProcessManagerFactory};
#[cfg(windows)]
pub use windows_process_manager::{WindowsProcessHandle, WindowsProcessManager};
