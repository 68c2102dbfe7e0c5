use nats_runner_core::BrokerProcessManagerFactory;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformBrokerProcessManagerFactory;

impl BrokerProcessManagerFactory for PlatformBrokerProcessManagerFactory {
    #[cfg(unix)]
    type Manager = nats_runner_unix::UnixBrokerProcessManager;

    #[cfg(windows)]
    type Manager = nats_runner_windows::WindowsBrokerProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return nats_runner_unix::UnixBrokerProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return nats_runner_windows::WindowsBrokerProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return nats_runner_unix::UnixBrokerProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return nats_runner_windows::WindowsBrokerProcessManagerFactory::platform_name();
    }
}

/// Process manager type selected for the current platform
pub type PlatformBrokerProcessManager =
    <PlatformBrokerProcessManagerFactory as BrokerProcessManagerFactory>::Manager;
