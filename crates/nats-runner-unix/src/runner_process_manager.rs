use crate::unix_process_manager::{UnixProcessHandle, UnixProcessManager};
use async_trait::async_trait;
use nats_runner_core::{
    BrokerProcessManager, BrokerProcessManagerFactory, LaunchSpec, OutputCapture, ProcessHandle,
    ProcessId, TerminationResult,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Unix implementation of the BrokerProcessManager trait
///
/// Composes [`UnixProcessManager`] for the low-level operations and keeps
/// track of spawned processes for emergency cleanup.
pub struct UnixBrokerProcessManager {
    /// The underlying platform-specific process manager
    platform_manager: Arc<UnixProcessManager>,
    /// Thread-safe tracking of active processes
    active_processes: Arc<Mutex<HashMap<ProcessId, String>>>,
}

#[async_trait]
impl BrokerProcessManager for UnixBrokerProcessManager {
    type Handle = UnixProcessHandle;

    fn new() -> Self {
        Self {
            platform_manager: Arc::new(UnixProcessManager::new()),
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
        error.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
    }

    async fn terminate_process_tree(&self, handle: &mut Self::Handle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            // Already reaped
            if let Some(pid) = handle.spawned_pid() {
                self.active_processes.lock().unwrap().remove(&pid);
            }
            return TerminationResult::ProcessNotFound;
        };

        let result = self.platform_manager.kill_process_tree(pid);
        match &result {
            TerminationResult::Success => {
                tracing::info!("Successfully terminated process tree for PID {}", pid);
            }
            TerminationResult::ProcessNotFound => {
                tracing::info!("Process {} already terminated", pid);
            }
            other => {
                tracing::warn!("Failed to terminate process {}: {:?}", pid, other);
            }
        }

        // Reap the child; fails harmlessly when it already exited
        if let Err(e) = handle.kill().await {
            tracing::debug!("Reaping process {} after SIGKILL: {}", pid, e);
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
        // Emergency cleanup using Unix signals
        let active_processes = std::mem::take(&mut *self.active_processes.lock().unwrap());
        if active_processes.is_empty() {
            return 0;
        }

        tracing::warn!(
            "Emergency cleanup: killing {} process group(s)",
            active_processes.len()
        );

        for pid in active_processes.keys() {
            let nix_pid = NixPid::from_raw(pid.0 as i32);

            if let Err(e) = signal::killpg(nix_pid, Signal::SIGKILL) {
                tracing::warn!("Failed to send SIGKILL to process group {}: {}", pid, e);

                if let Err(e) = signal::kill(nix_pid, Signal::SIGKILL) {
                    tracing::error!("Failed to send SIGKILL to process {}: {}", pid, e);
                }
            }
        }
        active_processes.len()
    }
}

impl Drop for UnixBrokerProcessManager {
    fn drop(&mut self) {
        self.kill_tracked();
    }
}

/// Factory for creating Unix BrokerProcessManager instances
pub struct UnixBrokerProcessManagerFactory;

impl BrokerProcessManagerFactory for UnixBrokerProcessManagerFactory {
    type Manager = UnixBrokerProcessManager;

    fn create_process_manager() -> Self::Manager {
        UnixBrokerProcessManager::new()
    }

    fn platform_name() -> &'static str {
        "unix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleep_spec(seconds: &str) -> LaunchSpec {
        let mut spec = LaunchSpec::new("sleep");
        spec.args = vec![seconds.to_string()];
        spec
    }

    #[tokio::test]
    async fn test_spawn_tracks_and_terminates() {
        let manager = UnixBrokerProcessManagerFactory::create_process_manager();
        let capture = OutputCapture::new(None);

        let mut handle = manager
            .spawn_process(&sleep_spec("30"), &capture)
            .await
            .unwrap();
        let pid = handle.get_pid().unwrap();
        assert_eq!(manager.tracked_processes().len(), 1);
        assert_eq!(manager.tracked_processes()[0].0, pid);

        let result = manager.terminate_process_tree(&mut handle).await;
        assert!(result.is_terminated());
        assert!(manager.tracked_processes().is_empty());

        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), None);
    }

    /// Dead or zombie; orphans may linger unreaped when PID 1 does not reap
    #[cfg(target_os = "linux")]
    fn is_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_grandchildren() {
        let manager = UnixBrokerProcessManager::new();
        let capture = OutputCapture::new(None);
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");

        let mut spec = LaunchSpec::new("sh");
        spec.args = vec![
            "-c".to_string(),
            format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
        ];
        let mut handle = manager.spawn_process(&spec, &capture).await.unwrap();

        let mut grandchild = None;
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse::<i32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("grandchild pid");

        manager.terminate_process_tree(&mut handle).await;

        let mut gone = false;
        for _ in 0..100 {
            if is_gone(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} survived tree termination");
    }

    #[tokio::test]
    async fn test_kill_tracked_signals_without_awaiting() {
        let manager = UnixBrokerProcessManager::new();
        let capture = OutputCapture::new(None);
        let mut handle = manager
            .spawn_process(&sleep_spec("30"), &capture)
            .await
            .unwrap();

        assert_eq!(manager.kill_tracked(), 1);
        assert!(manager.tracked_processes().is_empty());
        assert_eq!(manager.kill_tracked(), 0);

        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), None);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_is_not_transient() {
        let manager = UnixBrokerProcessManager::new();
        let capture = OutputCapture::new(None);
        let spec = LaunchSpec::new("/nonexistent/nats-server");

        let err = manager.spawn_process(&spec, &capture).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert!(!manager.is_transient_spawn_error(&err));
        assert!(manager.tracked_processes().is_empty());
    }

    #[test]
    fn test_text_file_busy_is_transient() {
        let manager = UnixBrokerProcessManager::new();
        let busy = std::io::Error::from_raw_os_error(nix::errno::Errno::ETXTBSY as i32);
        assert!(manager.is_transient_spawn_error(&busy));

        let denied = std::io::Error::from_raw_os_error(nix::errno::Errno::EACCES as i32);
        assert!(!manager.is_transient_spawn_error(&denied));
    }

    #[tokio::test]
    async fn test_output_is_captured() {
        let manager = UnixBrokerProcessManager::new();
        let capture = OutputCapture::new(None);

        let mut spec = LaunchSpec::new("sh");
        spec.args = vec!["-c".to_string(), "echo out; echo err >&2".to_string()];
        let mut handle = manager.spawn_process(&spec, &capture).await.unwrap();

        handle.wait().await.unwrap();
        assert!(capture.flush(Duration::from_secs(2)).await);

        let contents = capture.contents();
        assert!(contents.contains("out"));
        assert!(contents.contains("err"));
    }
}
