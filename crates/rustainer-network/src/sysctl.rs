//! Kernel parameter tuning.
//!
//! Reverse-path filtering is disabled for the bridge because container
//! traffic enters and leaves through different interfaces. Every value set
//! here is also written to a drop-in file so it survives reboots and can be
//! re-applied when the bridge is recreated.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustainer_common::{RustainerError, RustainerResult};

use crate::config::WaitPolicy;
use crate::host::HostNetwork;

/// IPv4 forwarding switch.
pub const IP_FORWARD: &str = "net.ipv4.ip_forward";

const HEADER: &str = "# Managed by rustainer. Do not edit.";

/// Reverse-path filter key for an interface (or `all` / `default`).
#[must_use]
pub fn rp_filter_key(iface: &str) -> String {
    format!("{CONF_PREFIX}{iface}.rp_filter")
}

const CONF_PREFIX: &str = "net.ipv4.conf.";

/// Split a per-interface key into interface and parameter.
///
/// The parameter is the last segment; everything between the prefix and
/// it is the interface name, dots included.
#[must_use]
pub fn split_conf_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(CONF_PREFIX)?
        .rsplit_once('.')
        .filter(|(iface, param)| !iface.is_empty() && !param.is_empty())
}

/// Applies sysctls and keeps the persisted drop-in file in sync.
pub struct SysctlTuner {
    host: Arc<dyn HostNetwork>,
    conf_path: PathBuf,
    wait: WaitPolicy,
}

impl SysctlTuner {
    /// Create a tuner persisting to `conf_path`.
    pub fn new(host: Arc<dyn HostNetwork>, conf_path: impl Into<PathBuf>, wait: WaitPolicy) -> Self {
        Self {
            host,
            conf_path: conf_path.into(),
            wait,
        }
    }

    /// Path of the persisted drop-in file.
    #[must_use]
    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Set `rp_filter = 0` for `all` and `iface`, then persist both.
    ///
    /// The interface is polled according to the wait policy before its
    /// key is written.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Timeout`] if the interface does not appear
    /// within the bounded wait, [`RustainerError::InterfaceNotFound`] if it
    /// disappears before the write, and I/O errors from persisting.
    pub async fn disable_reverse_path_filter(&self, iface: &str) -> RustainerResult<()> {
        self.wait_for_interface(iface).await?;

        let entries = [
            (rp_filter_key("all"), "0".to_string()),
            (rp_filter_key(iface), "0".to_string()),
        ];
        for (key, value) in &entries {
            self.host.write_sysctl(key, value).await.map_err(|e| {
                if e.is_not_found() {
                    RustainerError::InterfaceNotFound {
                        name: iface.to_string(),
                    }
                } else {
                    e
                }
            })?;
        }
        tracing::debug!(iface, "Disabled reverse path filtering");

        self.persist(&entries)
    }

    /// Turn on IPv4 forwarding and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysctl cannot be written or persisted.
    pub async fn enable_ip_forwarding(&self) -> RustainerResult<()> {
        let current = self.host.read_sysctl(IP_FORWARD).await.ok();
        if current.as_deref() != Some("1") {
            self.host.write_sysctl(IP_FORWARD, "1").await?;
            tracing::info!("IP forwarding enabled");
        }
        self.persist(&[(IP_FORWARD.to_string(), "1".to_string())])
    }

    /// Re-apply every value from the persisted file.
    ///
    /// Keys for interfaces that do not currently exist are skipped with a
    /// warning. Returns the number of keys applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a write fails for a
    /// reason other than a missing interface.
    pub async fn apply_persisted(&self) -> RustainerResult<usize> {
        let entries = match std::fs::read_to_string(&self.conf_path) {
            Ok(content) => parse_conf(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut applied = 0;
        for (key, value) in entries {
            match self.host.write_sysctl(&key, &value).await {
                Ok(()) => applied += 1,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(key = %key, "Skipping sysctl for absent interface");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(applied, path = %self.conf_path.display(), "Applied persisted sysctls");
        Ok(applied)
    }

    /// Merge entries into the drop-in file, rewriting it atomically.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read or replaced.
    pub fn persist(&self, entries: &[(String, String)]) -> RustainerResult<()> {
        let mut merged = match std::fs::read_to_string(&self.conf_path) {
            Ok(content) => parse_conf(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut changed = false;
        for (key, value) in entries {
            match merged.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) if existing == value => {}
                Some((_, existing)) => {
                    existing.clone_from(value);
                    changed = true;
                }
                None => {
                    merged.push((key.clone(), value.clone()));
                    changed = true;
                }
            }
        }
        if !changed {
            return Ok(());
        }

        let dir = self
            .conf_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(render_conf(&merged).as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.conf_path).map_err(|e| e.error)?;

        tracing::debug!(path = %self.conf_path.display(), "Persisted sysctl overrides");
        Ok(())
    }

    async fn wait_for_interface(&self, iface: &str) -> RustainerResult<()> {
        for attempt in 1..=self.wait.attempts {
            if self.host.link_exists(iface).await? {
                return Ok(());
            }
            tracing::debug!(iface, attempt, "Waiting for interface");
            if attempt < self.wait.attempts {
                tokio::time::sleep(self.wait.interval()).await;
            }
        }
        tracing::warn!(iface, attempts = self.wait.attempts, "Interface never appeared");
        Err(RustainerError::Timeout {
            operation: format!("waiting for interface {iface}"),
            after: self.wait.total(),
        })
    }
}

/// Render `key = value` lines under the ownership header.
#[must_use]
pub fn render_conf(entries: &[(String, String)]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for (key, value) in entries {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Parse a sysctl.conf-style file, ignoring comments and blank lines.
#[must_use]
pub fn parse_conf(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().replace('/', "."), value.trim().to_string()))
        .collect()
}
