use crate::windows_process_manager::{WindowsProcessHandle, WindowsProcessManager};
use async_trait::async_trait;
use nats_runner_core::{
    BrokerProcessManager, BrokerProcessManagerFactory, LaunchSpec, OutputCapture, ProcessHandle,
    ProcessId, TerminationResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// ERROR_SHARING_VIOLATION: the executable is still held open by its writer
const ERROR_SHARING_VIOLATION: i32 = 32;

/// Windows implementation of the BrokerProcessManager trait
pub struct WindowsBrokerProcessManager {
    platform_manager: Arc<WindowsProcessManager>,
    active_processes: Arc<Mutex<HashMap<ProcessId, String>>>,
}

#[async_trait]
impl BrokerProcessManager for WindowsBrokerProcessManager {
    type Handle = WindowsProcessHandle;

    fn new() -> Self {
        Self {
            platform_manager: Arc::new(WindowsProcessManager::new()),
            active_processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn spawn_process(
        &self,
        spec: &LaunchSpec,
        capture: &OutputCapture,
    ) -> std::io::Result<Self::Handle> {
        let handle = self.platform_manager.spawn(spec, capture)?;

        if let Some(pid) = handle.get_pid() {
            let mut active = self.active_processes.lock().unwrap();
            active.insert(pid, format!("server:{}", spec.program.display()));
        }

        Ok(handle)
    }

    fn is_transient_spawn_error(&self, error: &std::io::Error) -> bool {
        error.raw_os_error() == Some(ERROR_SHARING_VIOLATION)
    }

    async fn terminate_process_tree(&self, handle: &mut Self::Handle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            if let Some(pid) = handle.spawned_pid() {
                self.active_processes.lock().unwrap().remove(&pid);
            }
            return TerminationResult::ProcessNotFound;
        };

        let result = self.platform_manager.kill_process_tree(pid).await;
        if !result.is_terminated() {
            tracing::warn!("Failed to terminate process {}: {:?}", pid, result);
        }

        if let Err(e) = handle.kill().await {
            tracing::debug!("Reaping process {} after taskkill: {}", pid, e);
        }

        self.active_processes.lock().unwrap().remove(&pid);
        result
    }

    fn tracked_processes(&self) -> Vec<(ProcessId, String)> {
        let active = self.active_processes.lock().unwrap();
        active
            .iter()
            .map(|(pid, cmd)| (*pid, cmd.clone()))
            .collect()
    }

    fn kill_tracked(&self) -> usize {
        let active_processes = std::mem::take(&mut *self.active_processes.lock().unwrap());
        if active_processes.is_empty() {
            return 0;
        }

        tracing::warn!(
            "Emergency cleanup: killing {} process tree(s)",
            active_processes.len()
        );

        // Cannot await here; run taskkill synchronously
        for pid in active_processes.keys() {
            let status = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.0.to_string()])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
            if let Err(e) = status {
                tracing::error!("Failed to run taskkill for {}: {}", pid, e);
            }
        }
        active_processes.len()
    }
}

impl Drop for WindowsBrokerProcessManager {
    fn drop(&mut self) {
        self.kill_tracked();
    }
}

/// Factory for creating Windows BrokerProcessManager instances
pub struct WindowsBrokerProcessManagerFactory;

impl BrokerProcessManagerFactory for WindowsBrokerProcessManagerFactory {
    type Manager = WindowsBrokerProcessManager;

    fn create_process_manager() -> Self::Manager {
        WindowsBrokerProcessManager::new()
    }

    fn platform_name() -> &'static str {
        "windows"
    }
}
