//! Network configuration.
//!
//! Loaded from TOML; every field has a default so an empty file (or no
//! file at all) yields the stock `rustainer0` / `172.18.0.0/16` network.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use rustainer_common::{RustainerError, RustainerPaths, RustainerResult};
use serde::{Deserialize, Serialize};

/// Default bridge device name.
pub const DEFAULT_BRIDGE: &str = "rustainer0";

/// Default container subnet.
pub const DEFAULT_SUBNET: &str = "172.18.0.0/16";

/// Default reserved prefix for owned namespaces, links and rule tags.
pub const DEFAULT_PREFIX: &str = "rst";

/// Longest prefix that still fits veth names into `IFNAMSIZ - 1`.
pub const MAX_PREFIX_LEN: usize = 6;

/// Linux interface name limit, excluding the trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;

/// Bounded polling policy for interfaces that are not yet visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitPolicy {
    /// Number of existence checks before giving up.
    pub attempts: u32,
    /// Delay between checks, in milliseconds.
    pub interval_ms: u64,
}

impl WaitPolicy {
    /// Delay between checks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Worst-case total wait.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.interval() * self.attempts
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            interval_ms: 1000,
        }
    }
}

/// Configuration for the host bridge network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Bridge device name.
    pub bridge: String,
    /// Container subnet in CIDR notation.
    pub subnet: Ipv4Net,
    /// Gateway address assigned to the bridge (default: first host).
    pub gateway: Option<Ipv4Addr>,
    /// Reserved prefix carried by every owned namespace, veth and rule tag.
    pub prefix: String,
    /// File holding persisted sysctl overrides.
    pub sysctl_conf: PathBuf,
    /// Upper bound for any single host command, in seconds.
    pub command_timeout_secs: u64,
    /// Enable `net.ipv4.ip_forward` when installing NAT.
    pub enable_ip_forward: bool,
    /// Policy for waiting on interfaces to appear.
    pub interface_wait: WaitPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            subnet: DEFAULT_SUBNET.parse().unwrap_or_default(),
            gateway: None,
            prefix: DEFAULT_PREFIX.to_string(),
            sysctl_conf: RustainerPaths::default().sysctl_conf(),
            command_timeout_secs: 10,
            enable_ip_forward: true,
            interface_wait: WaitPolicy::default(),
        }
    }
}

impl NetworkConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Config`] if the document does not parse or
    /// fails validation.
    pub fn from_toml_str(content: &str) -> RustainerResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| RustainerError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> RustainerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded network configuration");
        Self::from_toml_str(&content)
    }

    /// Load configuration from a file if it exists, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> RustainerResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Serialization`] if rendering fails.
    pub fn to_toml_string(&self) -> RustainerResult<String> {
        toml::to_string_pretty(self).map_err(|e| RustainerError::Serialization(e.to_string()))
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Config`] describing the first problem found.
    pub fn validate(&self) -> RustainerResult<()> {
        let invalid = |message: String| Err(RustainerError::Config { message });

        if self.bridge.is_empty() || self.bridge.len() > MAX_IFNAME_LEN {
            return invalid(format!(
                "bridge name '{}' must be 1-{MAX_IFNAME_LEN} characters",
                self.bridge
            ));
        }

        if self.prefix.is_empty()
            || self.prefix.len() > MAX_PREFIX_LEN
            || !self
                .prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return invalid(format!(
                "prefix '{}' must be 1-{MAX_PREFIX_LEN} lowercase alphanumeric characters",
                self.prefix
            ));
        }

        if self.bridge.starts_with(&self.prefix) {
            return invalid(format!(
                "bridge name '{}' must not start with the reserved prefix '{}'",
                self.bridge, self.prefix
            ));
        }

        if self.subnet.prefix_len() > 30 {
            return invalid(format!(
                "subnet {} has no room for a gateway and containers",
                self.subnet
            ));
        }

        let gateway = self.gateway();
        if !self.subnet.contains(&gateway)
            || gateway == self.subnet.network()
            || gateway == self.subnet.broadcast()
        {
            return invalid(format!(
                "gateway {gateway} is not a host address of {}",
                self.subnet
            ));
        }

        if self.command_timeout_secs == 0 {
            return invalid("command_timeout_secs must be positive".to_string());
        }

        if self.interface_wait.attempts == 0 {
            return invalid("interface_wait.attempts must be positive".to_string());
        }

        Ok(())
    }

    /// The subnet with host bits cleared.
    #[must_use]
    pub fn network(&self) -> Ipv4Net {
        self.subnet.trunc()
    }

    /// Gateway address, defaulting to the first host in the subnet.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway.unwrap_or_else(|| {
            let base = u32::from(self.subnet.network());
            Ipv4Addr::from(base.saturating_add(1))
        })
    }

    /// Gateway address with the subnet prefix, as assigned to the bridge.
    #[must_use]
    pub fn gateway_cidr(&self) -> Ipv4Net {
        Ipv4Net::new(self.gateway(), self.subnet.prefix_len()).unwrap_or(self.subnet)
    }

    /// Upper bound for a single host command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
