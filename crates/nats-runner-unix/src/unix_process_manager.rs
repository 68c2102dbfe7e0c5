use anyhow::Result;
use async_trait::async_trait;
use nats_runner_core::{
    LaunchSpec, OutputCapture, OutputStream, ProcessHandle, ProcessId, ProcessStatus,
    TerminationResult,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::process::Stdio;
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Unix-specific process handle implementation
pub struct UnixProcessHandle {
    child: Child,
    spawned_pid: Option<ProcessId>,
    command: String,
    args: Vec<String>,
}

impl UnixProcessHandle {
    pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
        Self {
            spawned_pid: child.id().map(ProcessId::from),
            child,
            command,
            args,
        }
    }

    /// PID assigned at spawn time, still available after the child was reaped
    pub fn spawned_pid(&self) -> Option<ProcessId> {
        self.spawned_pid
    }
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.child.id().map(ProcessId::from)
    }

    fn get_command(&self) -> &str {
        &self.command
    }

    fn get_args(&self) -> &[String] {
        &self.args
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(ProcessStatus::Exited(status))),
            None => Ok(None),
        }
    }

    async fn wait(&mut self) -> Result<ProcessStatus> {
        let status = self.child.wait().await?;
        Ok(ProcessStatus::Exited(status))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
    }
}

/// Low-level Unix process operations: spawning into a fresh process group
/// and SIGKILL-based tree termination
pub struct UnixProcessManager {
    system: std::sync::Mutex<System>,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessManager {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }

    /// Spawn `spec` in its own process group with stdout and stderr captured
    pub fn spawn(
        &self,
        spec: &LaunchSpec,
        capture: &OutputCapture,
    ) -> std::io::Result<UnixProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // New process group so the whole tree can be signalled at once
        cmd.process_group(0);

        let mut child = cmd.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            capture.attach(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            capture.attach(stderr, OutputStream::Stderr);
        }

        let command = spec.program.display().to_string();
        if let Some(pid) = child.id() {
            info!(pid = %pid, command = %command, args = ?spec.args, "Spawned Unix process");
        }

        Ok(UnixProcessHandle::new(child, command, spec.args.clone()))
    }

    /// Find all descendants of `parent_pid`, deepest first
    pub fn find_child_processes(&self, parent_pid: ProcessId) -> Vec<ProcessId> {
        let mut system = self.system.lock().unwrap();
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, parent_pid.0, &mut children);

        children.into_iter().map(ProcessId::from).collect()
    }

    /// SIGKILL every member of the process group led by `pid`
    pub fn kill_process_group(&self, pid: ProcessId) -> TerminationResult {
        let pgid = NixPid::from_raw(pid.0 as i32);

        match signal::killpg(pgid, Signal::SIGKILL) {
            Ok(()) => {
                info!("Sent SIGKILL to process group {}", pid);
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => {
                info!("Process group {} not found (already terminated)", pid);
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied to kill process group {}", pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
                TerminationResult::Failed(format!("SIGKILL to process group failed: {e}"))
            }
        }
    }

    /// SIGKILL a single process
    pub fn kill_single_process(&self, pid: ProcessId) -> TerminationResult {
        let nix_pid = NixPid::from_raw(pid.0 as i32);

        match signal::kill(nix_pid, Signal::SIGKILL) {
            Ok(()) => TerminationResult::Success,
            Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
            Err(nix::errno::Errno::EPERM) => {
                warn!("Permission denied to kill process {}", pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send SIGKILL to process {}: {}", pid, e);
                TerminationResult::Failed(format!("SIGKILL failed: {e}"))
            }
        }
    }

    /// Kill the group led by `root_pid`, then any descendant that left it.
    ///
    /// Descendants are collected before the root dies, since orphans are
    /// re-parented and can no longer be found afterwards.
    pub fn kill_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        info!("Terminating process tree for root PID {}", root_pid);

        let children = self.find_child_processes(root_pid);
        let group = self.kill_process_group(root_pid);

        for child_pid in &children {
            match self.kill_single_process(*child_pid) {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => warn!("Failed to kill child process {}: {:?}", child_pid, result),
            }
        }

        match group {
            TerminationResult::Success => TerminationResult::Success,
            _ => self.kill_single_process(root_pid),
        }
    }

    /// Recursively find all child processes
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                // Grandchildren first so they are killed before their parent
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}
