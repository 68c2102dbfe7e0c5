//! Disposable nats-server instances for tests.
//!
//! [`NatsRunner::start`] resolves a `nats-server` executable (downloading and
//! caching it when needed), launches it on free loopback ports with its own
//! data directory, and returns once a client handshake succeeds. The
//! returned [`RunnerHandle`] tears everything down again on
//! [`RunnerHandle::dispose`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), nats_runner::RunnerError> {
//! use nats_runner::{NatsRunner, RunnerOptions};
//!
//! let options = RunnerOptions::builder().jetstream(true).build().unwrap();
//! let mut server = NatsRunner::new(options).start().await?;
//! println!("connect to {}", server.url());
//! server.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod data_dir;
pub mod download;
pub mod factory;
pub mod platform;
pub mod ports;
pub mod probe;
pub mod runner;
pub mod supervisor;
pub mod teardown;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{ArchiveExtractor, ArchiveKind, FlatteningExtractor};
pub use cache::CacheManager;
pub use data_dir::{DataDirectory, DataDirectoryManager};
pub use download::{DownloadError, DownloadTransport, ReqwestTransport};
pub use factory::{PlatformBrokerProcessManager, PlatformBrokerProcessManagerFactory};
pub use ports::{allocate_ephemeral_port, allocate_port_pair};
pub use probe::{NatsHandshakeProbe, ReadinessProbe};
pub use runner::{NatsRunner, RunnerHandle};
pub use supervisor::{ProcessSupervisor, SupervisorState};

// Re-export core functionality
pub use nats_runner_core::*;
