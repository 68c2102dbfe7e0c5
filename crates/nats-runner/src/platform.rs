use crate::archive::ArchiveKind;
use nats_runner_core::RunnerError;
use std::fmt;

/// Name of the server executable on the current platform
pub const fn executable_name() -> &'static str {
    if cfg!(windows) {
        "nats-server.exe"
    } else {
        "nats-server"
    }
}

/// Normalize a requested version to a release tag with exactly one leading `v`
pub fn version_tag(version: &str) -> String {
    format!("v{}", version.trim().trim_start_matches('v'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
        })
    }
}

/// OS and CPU architecture a release archive is published for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    /// The platform this process runs on
    pub fn current() -> Result<Self, RunnerError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map Rust's `target_os` / `target_arch` names onto release names
    pub fn from_parts(os: &str, arch: &str) -> Result<Self, RunnerError> {
        let os = match os {
            "linux" => Os::Linux,
            "macos" => Os::Darwin,
            "windows" => Os::Windows,
            other => {
                return Err(RunnerError::acquisition(format!(
                    "no nats-server release is published for operating system '{other}'"
                )));
            }
        };
        let arch = match arch {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            "arm" => Arch::Arm,
            other => {
                return Err(RunnerError::acquisition(format!(
                    "no nats-server release is published for architecture '{other}'"
                )));
            }
        };
        Ok(Self { os, arch })
    }

    pub fn binary_name(&self) -> &'static str {
        match self.os {
            Os::Windows => "nats-server.exe",
            _ => "nats-server",
        }
    }

    pub fn archive_kind(&self) -> ArchiveKind {
        match self.os {
            Os::Windows => ArchiveKind::Zip,
            _ => ArchiveKind::TarGz,
        }
    }

    /// File name of the release archive, e.g. `nats-server-v2.10.22-linux-amd64.tar.gz`
    pub fn asset_name(&self, tag: &str) -> String {
        format!(
            "nats-server-{tag}-{}-{}.{}",
            self.os,
            self.arch,
            self.archive_kind().extension()
        )
    }

    pub fn download_url(&self, base_url: &str, tag: &str) -> String {
        format!(
            "{}/{tag}/{}",
            base_url.trim_end_matches('/'),
            self.asset_name(tag)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_tag() {
        assert_eq!(version_tag("2.10.22"), "v2.10.22");
        assert_eq!(version_tag("v2.10.22"), "v2.10.22");
        assert_eq!(version_tag(" 2.9.0 "), "v2.9.0");
    }

    #[test]
    fn test_download_url_linux() {
        let platform = Platform::from_parts("linux", "x86_64").unwrap();
        assert_eq!(
            platform.download_url("https://example.com/releases/", "v2.10.22"),
            "https://example.com/releases/v2.10.22/nats-server-v2.10.22-linux-amd64.tar.gz"
        );
        assert_eq!(platform.binary_name(), "nats-server");
    }

    #[test]
    fn test_download_url_windows_and_darwin() {
        let windows = Platform::from_parts("windows", "aarch64").unwrap();
        assert_eq!(
            windows.asset_name("v2.10.22"),
            "nats-server-v2.10.22-windows-arm64.zip"
        );
        assert_eq!(windows.binary_name(), "nats-server.exe");

        let mac = Platform::from_parts("macos", "aarch64").unwrap();
        assert_eq!(mac.asset_name("v2.9.0"), "nats-server-v2.9.0-darwin-arm64.tar.gz");
    }

    #[test]
    fn test_unsupported_platform() {
        let err = Platform::from_parts("freebsd", "x86_64").unwrap_err();
        assert!(matches!(err, RunnerError::AcquisitionFailed(_)));

        let err = Platform::from_parts("linux", "riscv64").unwrap_err();
        assert!(err.to_string().contains("riscv64"));
    }

    #[test]
    fn test_current_binary_name_matches_executable_name() {
        if let Ok(platform) = Platform::current() {
            assert_eq!(platform.binary_name(), executable_name());
        }
    }
}
