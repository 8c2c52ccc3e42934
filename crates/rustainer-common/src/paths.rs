//! Standard filesystem paths for Rustainer.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Rustainer data.
pub static RUSTAINER_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("RUSTAINER_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/rustainer"))
});

/// Directory where `ip netns` keeps named namespace bind mounts.
pub const NETNS_RUN_DIR: &str = "/run/netns";

/// Drop-in directory read by `systemd-sysctl` at boot.
pub const SYSCTL_DROPIN_DIR: &str = "/etc/sysctl.d";

/// Standard paths used by the network manager.
#[derive(Debug, Clone)]
pub struct RustainerPaths {
    /// Root data directory (default: /var/lib/rustainer).
    pub root: PathBuf,
    /// Directory holding persisted sysctl overrides (default: /etc/sysctl.d).
    pub sysctl_dir: PathBuf,
}

impl RustainerPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    ///
    /// Everything, including the sysctl drop-in directory, is placed under
    /// the root. Useful for tests and unprivileged dry runs.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sysctl_dir = root.join("sysctl.d");
        Self { root, sysctl_dir }
    }

    /// Persisted reverse-path-filter overrides.
    #[must_use]
    pub fn sysctl_conf(&self) -> PathBuf {
        self.sysctl_dir.join("90-rustainer.conf")
    }

    /// Network configuration file.
    #[must_use]
    pub fn network_config(&self) -> PathBuf {
        self.root.join("network.toml")
    }

    /// Bind-mount path of a named network namespace.
    #[must_use]
    pub fn netns(name: &str) -> PathBuf {
        PathBuf::from(NETNS_RUN_DIR).join(name)
    }
}

impl Default for RustainerPaths {
    fn default() -> Self {
        Self {
            root: RUSTAINER_ROOT.clone(),
            sysctl_dir: PathBuf::from(SYSCTL_DROPIN_DIR),
        }
    }
}
