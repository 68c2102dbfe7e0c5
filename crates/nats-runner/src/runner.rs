use crate::cache::CacheManager;
use crate::data_dir::DataDirectoryManager;
use crate::factory::{PlatformBrokerProcessManager, PlatformBrokerProcessManagerFactory};
use crate::ports::{allocate_ephemeral_port, allocate_port_pair};
use crate::probe::{NatsHandshakeProbe, ReadinessProbe};
use crate::supervisor::{ProcessSupervisor, launch_spec};
use nats_runner_core::{
    BrokerProcessManagerFactory, OutputCapture, OutputSink, ProcessId, RunnerError, RunnerOptions,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Starts disposable nats-server instances
pub struct NatsRunner {
    options: RunnerOptions,
    sink: Option<OutputSink>,
    cache: Arc<CacheManager>,
    probe: Arc<dyn ReadinessProbe>,
}

impl NatsRunner {
    /// Runner using the shared cache for `options.cache_root`.
    ///
    /// Convenience over [`NatsRunner::with_cache_manager`]: the manager comes
    /// from [`CacheManager::shared`], so runners in this process that use the
    /// same cache root serialize their downloads on one lock.
    pub fn new(options: RunnerOptions) -> Self {
        let root = options
            .cache_root
            .clone()
            .unwrap_or_else(CacheManager::default_root);
        Self {
            cache: CacheManager::shared(&root),
            options,
            sink: None,
            probe: Arc::new(NatsHandshakeProbe::default()),
        }
    }

    /// Runner that also forwards the server's stdout and stderr to `sink`
    pub fn new_with_output(options: RunnerOptions, sink: OutputSink) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(options)
        }
    }

    /// Use `cache` instead of the shared manager for the configured root
    pub fn with_cache_manager(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Start a server and wait until it accepts clients.
    ///
    /// Yields a ready handle or an error; on error nothing started here is
    /// left running or on disk.
    pub async fn start(&self) -> Result<RunnerHandle, RunnerError> {
        let options = &self.options;
        options.validate()?;

        let (port, monitoring_port) = resolve_ports(options)?;

        // Dropping this future mid-download cancels the transfer
        let cancel = CancellationToken::new();
        let cancel_guard = cancel.clone().drop_guard();

        let program = self.ensure_binary(&cancel).await?;

        let directories = DataDirectoryManager::from_options(options);
        let data_directory = directories.prepare(options.data_directory.as_deref())?;
        let data_path = data_directory.path().to_path_buf();

        let manager = PlatformBrokerProcessManagerFactory::create_process_manager();
        info!(
            platform = PlatformBrokerProcessManagerFactory::platform_name(),
            port,
            monitoring_port,
            data_directory = %data_path.display(),
            "Launching nats-server"
        );

        let mut supervisor = ProcessSupervisor::new(
            manager,
            self.probe.clone(),
            OutputCapture::new(self.sink.clone()),
            directories,
            Some(data_directory),
        );

        let spec = launch_spec(program, options, port, monitoring_port, &data_path);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let started = match supervisor.start(&spec).await {
            Ok(()) => {
                supervisor
                    .wait_ready(addr, options.connection_timeout())
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = started {
            warn!(error = %e, "nats-server failed to start; tearing down");
            supervisor.dispose().await;
            return Err(e);
        }

        cancel_guard.disarm();
        Ok(RunnerHandle {
            url: format!("nats://127.0.0.1:{port}"),
            port,
            monitoring_port,
            data_directory: data_path,
            supervisor,
            cancel,
        })
    }

    /// Resolve the executable, giving the download at most the connection
    /// timeout
    async fn ensure_binary(&self, cancel: &CancellationToken) -> Result<PathBuf, RunnerError> {
        let options = &self.options;
        let download = cancel.child_token();
        let deadline = tokio::spawn({
            let download = download.clone();
            let timeout = options.connection_timeout();
            async move {
                tokio::time::sleep(timeout).await;
                download.cancel();
            }
        });

        let ensured = self.cache.ensure(options, &download).await;
        deadline.abort();

        match ensured {
            Err(e) if download.is_cancelled() && !cancel.is_cancelled() => {
                warn!(error = %e, "nats-server download exceeded the connection timeout");
                Err(RunnerError::acquisition(format!(
                    "nats-server download did not finish within connection_timeout_ms={}",
                    options.connection_timeout_ms
                )))
            }
            ensured => ensured,
        }
    }
}

/// Use explicit ports where configured and allocate the rest, keeping the
/// pair distinct
fn resolve_ports(options: &RunnerOptions) -> Result<(u16, u16), RunnerError> {
    let explicit = |port: Option<i32>| -> Result<Option<u16>, RunnerError> {
        port.map(|p| {
            u16::try_from(p).map_err(|_| RunnerError::configuration(format!("invalid port {p}")))
        })
        .transpose()
    };

    match (explicit(options.port)?, explicit(options.monitoring_port)?) {
        (Some(port), Some(monitoring)) => Ok((port, monitoring)),
        (None, None) => allocate_port_pair(),
        (Some(port), None) => Ok((port, allocate_distinct(port)?)),
        (None, Some(monitoring)) => Ok((allocate_distinct(monitoring)?, monitoring)),
    }
}

fn allocate_distinct(taken: u16) -> Result<u16, RunnerError> {
    loop {
        let port = allocate_ephemeral_port()?;
        if port != taken {
            return Ok(port);
        }
    }
}

/// A running, ready nats-server.
///
/// Call [`RunnerHandle::dispose`] when done. A handle dropped without it
/// still kills the server and removes an automatic data directory.
pub struct RunnerHandle {
    url: String,
    port: u16,
    monitoring_port: u16,
    data_directory: PathBuf,
    supervisor: ProcessSupervisor<PlatformBrokerProcessManager>,
    cancel: CancellationToken,
}

impl RunnerHandle {
    /// `nats://127.0.0.1:<port>`
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn monitoring_port(&self) -> u16 {
        self.monitoring_port
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.supervisor.pid()
    }

    /// Output captured from the server so far
    pub fn output(&self) -> String {
        self.supervisor.output()
    }

    /// Stop the server and clean up; later calls do nothing
    pub async fn dispose(&mut self) {
        self.cancel.cancel();
        self.supervisor.dispose().await;
    }
}

impl std::fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("url", &self.url)
            .field("monitoring_port", &self.monitoring_port)
            .field("data_directory", &self.data_directory)
            .finish()
    }
}
