use anyhow::Result;
use async_trait::async_trait;
use nats_runner_core::{
    LaunchSpec, OutputCapture, OutputStream, ProcessHandle, ProcessId, ProcessStatus,
    TerminationResult,
};
use std::process::Stdio;
use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Keeps console servers from opening a window of their own
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
    spawned_pid: Option<ProcessId>,
    command: String,
    args: Vec<String>,
}

impl WindowsProcessHandle {
    pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
        Self {
            spawned_pid: child.id().map(ProcessId::from),
            child,
            command,
            args,
        }
    }

    pub fn spawned_pid(&self) -> Option<ProcessId> {
        self.spawned_pid
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
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
        Ok(self.child.try_wait()?.map(ProcessStatus::Exited))
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

/// Low-level Windows process operations built on `taskkill`
pub struct WindowsProcessManager {
    system: std::sync::Mutex<System>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsProcessManager {
    pub fn new() -> Self {
        info!("Initializing Windows process manager");
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }

    pub fn spawn(
        &self,
        spec: &LaunchSpec,
        capture: &OutputCapture,
    ) -> std::io::Result<WindowsProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .creation_flags(CREATE_NO_WINDOW);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            capture.attach(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            capture.attach(stderr, OutputStream::Stderr);
        }

        let command = spec.program.display().to_string();
        if let Some(pid) = child.id() {
            info!(pid = %pid, command = %command, args = ?spec.args, "Spawned Windows process");
        }

        Ok(WindowsProcessHandle::new(child, command, spec.args.clone()))
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

    /// `taskkill /F /T`, falling back to killing descendants one by one
    pub async fn kill_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        info!(root_pid = %root_pid, "Terminating process tree");

        let children = self.find_child_processes(root_pid);
        match taskkill(root_pid.0, true).await {
            Ok(true) => TerminationResult::Success,
            Ok(false) => {
                // taskkill also fails when the root is gone; sweep what is left
                for child_pid in &children {
                    if let Err(e) = taskkill(child_pid.0, false).await {
                        warn!(pid = %child_pid, "Failed to kill child process: {e}");
                    }
                }
                TerminationResult::ProcessNotFound
            }
            Err(e) => {
                warn!(root_pid = %root_pid, "taskkill could not be run: {e}");
                TerminationResult::Failed(format!("taskkill failed: {e}"))
            }
        }
    }

    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

/// Force-kill `pid`, including its tree when `tree` is set
pub(crate) async fn taskkill(pid: u32, tree: bool) -> Result<bool> {
    let pid_string = pid.to_string();
    let mut args = vec!["/F"];
    if tree {
        args.push("/T");
    }
    args.extend(["/PID", &pid_string]);

    let output = Command::new("taskkill")
        .args(&args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .await?;

    Ok(output.status.success())
}
