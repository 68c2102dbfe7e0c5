use crate::process::{LaunchSpec, ProcessHandle, ProcessId, TerminationResult};
use crate::stdio::OutputCapture;
use async_trait::async_trait;

/// Platform process manager used by the supervisor
///
/// Implementations live in the platform crates. A manager is created per
/// supervised server and tracks the processes it spawned so that a manager
/// dropped without an explicit termination can still signal them.
///
/// # Implementation Notes
///
/// Implementations should:
/// - Wire the child's stdout and stderr into the given [`OutputCapture`]
/// - Start the child in its own process group (Unix) so the tree can be signalled at once
/// - Never block the runtime while terminating
/// - Provide emergency cleanup in Drop implementations
#[async_trait]
pub trait BrokerProcessManager: Send + Sync + 'static {
    /// The type of process handle returned by this process manager
    type Handle: ProcessHandle + 'static;

    fn new() -> Self
    where
        Self: Sized;

    /// Spawn the server described by `spec` with both output pipes captured
    async fn spawn_process(
        &self,
        spec: &LaunchSpec,
        capture: &OutputCapture,
    ) -> std::io::Result<Self::Handle>;

    /// Whether a spawn failure is the transient "executable busy" condition
    /// seen when another thread forks while the executable is open for writing
    fn is_transient_spawn_error(&self, error: &std::io::Error) -> bool;

    /// Forcibly terminate the process behind `handle` and all of its descendants
    async fn terminate_process_tree(&self, handle: &mut Self::Handle) -> TerminationResult;

    /// Snapshot of the processes this manager still tracks
    fn tracked_processes(&self) -> Vec<(ProcessId, String)>;

    /// Kill every tracked process tree without waiting and stop tracking it.
    ///
    /// Synchronous so that it can run from `Drop`. Returns how many trees
    /// were signalled.
    fn kill_tracked(&self) -> usize;
}

/// Factory trait for creating platform-specific BrokerProcessManager implementations
pub trait BrokerProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: BrokerProcessManager;

    fn create_process_manager() -> Self::Manager;

    /// Platform name for logging
    fn platform_name() -> &'static str;
}
