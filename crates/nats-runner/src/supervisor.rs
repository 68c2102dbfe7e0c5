//! Lifecycle of one nats-server subprocess.
//!
//! `Created -> Starting -> Ready | Failed`, and `Disposed` from anywhere.
//! Readiness is a race between a client handshake poll, the process
//! exiting and the connection timeout; whichever finishes first decides.

use crate::data_dir::{DataDirectory, DataDirectoryManager};
use crate::probe::ReadinessProbe;
use crate::teardown::BestEffort;
use backon::{ConstantBuilder, Retryable};
use nats_runner_core::{
    BrokerProcessManager, LaunchSpec, OutputCapture, ProcessHandle, ProcessId, RunnerError,
    RunnerOptions,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const START_RETRIES: usize = 3;
const START_RETRY_DELAY: Duration = Duration::from_millis(100);
const EXIT_WAIT: Duration = Duration::from_secs(5);
const OUTPUT_FLUSH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Starting,
    Ready,
    Failed,
    Disposed,
}

/// Command line for nats-server, generated flags first and extra arguments last
pub fn build_arguments(
    options: &RunnerOptions,
    port: u16,
    monitoring_port: u16,
    data_directory: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--addr".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        port.to_string(),
        "--http_port".to_string(),
        monitoring_port.to_string(),
    ];

    if options.jetstream {
        args.push("--jetstream".to_string());
        args.push("--store_dir".to_string());
        args.push(data_directory.display().to_string());
    }
    if options.debug {
        args.push("-D".to_string());
    }
    if options.trace {
        args.push("-V".to_string());
    }

    args.extend(options.extra_args.iter().cloned());
    args
}

/// Launch description for `program` serving on the given ports
pub fn launch_spec(
    program: PathBuf,
    options: &RunnerOptions,
    port: u16,
    monitoring_port: u16,
    data_directory: &Path,
) -> LaunchSpec {
    LaunchSpec {
        args: build_arguments(options, port, monitoring_port, data_directory),
        working_dir: Some(data_directory.to_path_buf()),
        env: options.env.clone(),
        program,
    }
}

pub struct ProcessSupervisor<M: BrokerProcessManager> {
    manager: M,
    handle: Option<M::Handle>,
    probe: Arc<dyn ReadinessProbe>,
    capture: OutputCapture,
    directories: DataDirectoryManager,
    data_directory: Option<DataDirectory>,
    state: SupervisorState,
}

impl<M: BrokerProcessManager> ProcessSupervisor<M> {
    pub fn new(
        manager: M,
        probe: Arc<dyn ReadinessProbe>,
        capture: OutputCapture,
        directories: DataDirectoryManager,
        data_directory: Option<DataDirectory>,
    ) -> Self {
        Self {
            manager,
            handle: None,
            probe,
            capture,
            directories,
            data_directory,
            state: SupervisorState::Created,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.handle.as_ref().and_then(|h| h.get_pid())
    }

    /// Everything the server has written so far
    pub fn output(&self) -> String {
        self.capture.contents()
    }

    /// Launch the server, retrying only transient "executable busy" failures
    pub async fn start(&mut self, spec: &LaunchSpec) -> Result<(), RunnerError> {
        if self.state != SupervisorState::Created {
            return Err(RunnerError::configuration(format!(
                "supervisor cannot start from state {:?}",
                self.state
            )));
        }
        self.state = SupervisorState::Starting;
        info!(command = %spec.command_line(), "Starting nats-server");

        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let manager = &self.manager;
        let capture = &self.capture;

        let spawned = (move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            manager.spawn_process(spec, capture).await
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(START_RETRY_DELAY)
                .with_max_times(START_RETRIES),
        )
        .when(|e: &std::io::Error| manager.is_transient_spawn_error(e))
        .notify(|e, delay| {
            warn!(program = %spec.program.display(), "Executable busy, retrying in {delay:?}: {e}");
        })
        .await;

        match spawned {
            Ok(handle) => {
                debug!(pid = ?handle.get_pid(), "nats-server spawned");
                self.handle = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.state = SupervisorState::Failed;
                Err(RunnerError::ProcessStartFailed {
                    program: spec.program.clone(),
                    attempts: counter.load(Ordering::SeqCst),
                    source,
                })
            }
        }
    }

    /// Block until `addr` completes a client handshake, the process exits,
    /// or `timeout` elapses
    pub async fn wait_ready(&mut self, addr: SocketAddr, timeout: Duration) -> Result<(), RunnerError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(RunnerError::configuration(format!(
                "supervisor has no running process in state {:?}",
                self.state
            )));
        };

        let probe = self.probe.clone();
        let poll = (move || {
            let probe = probe.clone();
            async move { probe.probe(addr).await }
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(POLL_INTERVAL)
                .without_max_times(),
        )
        .notify(|e: &anyhow::Error, _| trace!(%addr, "nats-server not ready yet: {e:#}"));

        tokio::select! {
            biased;
            _ = poll => {
                self.state = SupervisorState::Ready;
                info!(%addr, pid = ?handle.get_pid(), "nats-server is ready");
                Ok(())
            }
            status = handle.wait() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!("Failed to collect nats-server exit status: {e}");
                        None
                    }
                };
                if !self.capture.flush(OUTPUT_FLUSH).await {
                    debug!("Output capture did not drain before the flush bound");
                }
                self.state = SupervisorState::Failed;
                warn!(?code, "nats-server exited before becoming ready");
                Err(RunnerError::UnexpectedExit {
                    code,
                    output: self.capture.contents(),
                })
            }
            _ = tokio::time::sleep(timeout) => {
                self.state = SupervisorState::Failed;
                warn!(%addr, ?timeout, "nats-server did not become ready in time");
                Err(RunnerError::ReadinessTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Kill the process tree and remove an owned data directory.
    ///
    /// Never fails; only the first call does anything.
    pub async fn dispose(&mut self) {
        if self.state == SupervisorState::Disposed {
            return;
        }
        self.state = SupervisorState::Disposed;

        if let Some(mut handle) = self.handle.take() {
            let result = self.manager.terminate_process_tree(&mut handle).await;
            debug!(?result, "Terminated nats-server process tree");

            tokio::time::timeout(EXIT_WAIT, handle.wait())
                .await
                .map_err(|_| format!("no exit within {EXIT_WAIT:?}"))
                .best_effort("wait for nats-server exit");
        }

        if !self.capture.flush(OUTPUT_FLUSH).await {
            self.capture.abort();
        }

        if let Some(directory) = self.data_directory.take() {
            self.directories
                .release(&directory)
                .best_effort("remove data directory");
        }
    }
}

impl<M: BrokerProcessManager> Drop for ProcessSupervisor<M> {
    fn drop(&mut self) {
        if self.state == SupervisorState::Disposed {
            return;
        }
        if self.handle.is_some() {
            warn!("Supervisor dropped without dispose; cleaning up");
        }
        // Server first: it may still write into the data directory
        let killed = self.manager.kill_tracked();
        debug!(killed, "Killed nats-server before releasing its data directory");
        self.handle = None;
        self.capture.abort();
        if let Some(directory) = self.data_directory.take() {
            self.directories
                .release(&directory)
                .best_effort("remove data directory");
        }
    }
}
