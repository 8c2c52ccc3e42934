//! Host network backend.
//!
//! [`HostNetwork`] is the only way the rest of the crate touches global
//! host state. [`CommandHost`] implements it with `ip`, `iptables` and
//! `/proc/sys`; every spawned command is bounded by a timeout and killed
//! when it expires.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use rustainer_common::{RustainerError, RustainerResult};
use tokio::process::Command;

/// Operations on host network state.
///
/// Namespaced variants take `netns: Option<&str>`; `None` targets the root
/// namespace. Errors follow a fixed convention: a missing link is
/// [`RustainerError::InterfaceNotFound`], any other missing resource is
/// [`RustainerError::NotFound`], and creating something that exists is
/// [`RustainerError::AlreadyExists`].
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Names of all links in the root namespace.
    async fn list_links(&self) -> RustainerResult<Vec<String>>;

    /// Whether a link exists in the root namespace.
    async fn link_exists(&self, name: &str) -> RustainerResult<bool>;

    /// Create a bridge device.
    async fn add_bridge(&self, name: &str) -> RustainerResult<()>;

    /// Create a veth pair with both ends in the root namespace.
    async fn add_veth_pair(&self, host: &str, peer: &str) -> RustainerResult<()>;

    /// Set a link administratively up.
    async fn set_link_up(&self, netns: Option<&str>, name: &str) -> RustainerResult<()>;

    /// Set a root-namespace link administratively down.
    async fn set_link_down(&self, name: &str) -> RustainerResult<()>;

    /// Enslave a root-namespace link to a bridge.
    async fn set_link_master(&self, name: &str, master: &str) -> RustainerResult<()>;

    /// Move a root-namespace link into a named namespace.
    async fn move_link_to_netns(&self, name: &str, netns: &str) -> RustainerResult<()>;

    /// Delete a root-namespace link (and its veth peer, if any).
    async fn delete_link(&self, name: &str) -> RustainerResult<()>;

    /// IPv4 addresses on a link.
    async fn list_addresses(&self, netns: Option<&str>, name: &str)
    -> RustainerResult<Vec<Ipv4Net>>;

    /// Add an IPv4 address to a link.
    async fn add_address(&self, netns: Option<&str>, name: &str, addr: Ipv4Net)
    -> RustainerResult<()>;

    /// Install (or replace) the default route inside a namespace.
    async fn set_default_route(&self, netns: &str, gateway: Ipv4Addr) -> RustainerResult<()>;

    /// Create a named network namespace.
    async fn add_netns(&self, name: &str) -> RustainerResult<()>;

    /// Delete a named network namespace.
    async fn delete_netns(&self, name: &str) -> RustainerResult<()>;

    /// Names of all named network namespaces.
    async fn list_netns(&self) -> RustainerResult<Vec<String>>;

    /// Rules of a chain in `iptables -S` form (`-A CHAIN ...` lines only).
    async fn list_rules(&self, table: &str, chain: &str) -> RustainerResult<Vec<String>>;

    /// Append a rule to a chain.
    async fn append_rule(&self, table: &str, chain: &str, args: &[String]) -> RustainerResult<()>;

    /// Delete the first rule matching the arguments.
    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> RustainerResult<()>;

    /// Read a sysctl by dotted key.
    async fn read_sysctl(&self, key: &str) -> RustainerResult<String>;

    /// Write a sysctl by dotted key.
    async fn write_sysctl(&self, key: &str, value: &str) -> RustainerResult<()>;
}

/// What a command acts on, used to classify its failures.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Link(&'a str),
    Netns(&'a str),
    Rule(&'a str),
    None,
}

/// [`HostNetwork`] backed by `ip`, `iptables` and `/proc/sys`.
#[derive(Debug, Clone)]
pub struct CommandHost {
    timeout: Duration,
    sysctl_root: PathBuf,
}

impl CommandHost {
    /// Create a backend with a per-command timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sysctl_root: PathBuf::from("/proc/sys"),
        }
    }

    /// Per-command timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, program: &str, args: &[&str], target: Target<'_>) -> RustainerResult<String> {
        let command_line = format!("{program} {}", args.join(" "));
        tracing::trace!(command = %command_line, "Running host command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RustainerError::CommandFailed {
                    command: command_line.clone(),
                    stderr: format!("{program} is not installed"),
                },
                std::io::ErrorKind::PermissionDenied => RustainerError::PermissionDenied {
                    operation: command_line.clone(),
                },
                _ => RustainerError::Io(e),
            })?,
            Err(_) => {
                tracing::warn!(command = %command_line, timeout = ?self.timeout, "Host command timed out");
                return Err(RustainerError::Timeout {
                    operation: command_line,
                    after: self.timeout,
                });
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&command_line, stderr.trim(), target))
        }
    }

    async fn ip(&self, netns: Option<&str>, args: &[&str], target: Target<'_>) -> RustainerResult<String> {
        match netns {
            Some(ns) => {
                let mut full = vec!["-n", ns];
                full.extend_from_slice(args);
                self.run("ip", &full, target).await
            }
            None => self.run("ip", args, target).await,
        }
    }

    async fn iptables(&self, args: &[&str], target: Target<'_>) -> RustainerResult<String> {
        let mut full = vec!["-w"];
        full.extend_from_slice(args);
        self.run("iptables", &full, target).await
    }

    /// Interface names may contain dots (`eth0.100`), so the interface
    /// segment of a `net.ipv4.conf.*` key is kept whole.
    fn sysctl_path(&self, key: &str) -> PathBuf {
        if let Some((iface, param)) = crate::sysctl::split_conf_key(key) {
            return self
                .sysctl_root
                .join("net/ipv4/conf")
                .join(iface)
                .join(param);
        }
        key.split('.')
            .fold(self.sysctl_root.clone(), |path, part| path.join(part))
    }
}

impl Default for CommandHost {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl HostNetwork for CommandHost {
    async fn list_links(&self) -> RustainerResult<Vec<String>> {
        let stdout = self.ip(None, &["-o", "link", "show"], Target::None).await?;
        Ok(parse_link_names(&stdout))
    }

    async fn link_exists(&self, name: &str) -> RustainerResult<bool> {
        match self
            .ip(None, &["link", "show", "dev", name], Target::Link(name))
            .await
        {
            Ok(_) => Ok(true),
            Err(RustainerError::InterfaceNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn add_bridge(&self, name: &str) -> RustainerResult<()> {
        self.ip(
            None,
            &["link", "add", "name", name, "type", "bridge"],
            Target::Link(name),
        )
        .await?;
        Ok(())
    }

    async fn add_veth_pair(&self, host: &str, peer: &str) -> RustainerResult<()> {
        self.ip(
            None,
            &["link", "add", host, "type", "veth", "peer", "name", peer],
            Target::Link(host),
        )
        .await?;
        Ok(())
    }

    async fn set_link_up(&self, netns: Option<&str>, name: &str) -> RustainerResult<()> {
        self.ip(netns, &["link", "set", "dev", name, "up"], Target::Link(name))
            .await?;
        Ok(())
    }

    async fn set_link_down(&self, name: &str) -> RustainerResult<()> {
        self.ip(None, &["link", "set", "dev", name, "down"], Target::Link(name))
            .await?;
        Ok(())
    }

    async fn set_link_master(&self, name: &str, master: &str) -> RustainerResult<()> {
        self.ip(
            None,
            &["link", "set", "dev", name, "master", master],
            Target::Link(name),
        )
        .await?;
        Ok(())
    }

    async fn move_link_to_netns(&self, name: &str, netns: &str) -> RustainerResult<()> {
        self.ip(
            None,
            &["link", "set", "dev", name, "netns", netns],
            Target::Link(name),
        )
        .await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> RustainerResult<()> {
        self.ip(None, &["link", "delete", "dev", name], Target::Link(name))
            .await?;
        Ok(())
    }

    async fn list_addresses(
        &self,
        netns: Option<&str>,
        name: &str,
    ) -> RustainerResult<Vec<Ipv4Net>> {
        let stdout = self
            .ip(netns, &["-o", "-4", "addr", "show", "dev", name], Target::Link(name))
            .await?;
        Ok(parse_inet_addresses(&stdout))
    }

    async fn add_address(
        &self,
        netns: Option<&str>,
        name: &str,
        addr: Ipv4Net,
    ) -> RustainerResult<()> {
        let cidr = addr.to_string();
        self.ip(netns, &["addr", "add", &cidr, "dev", name], Target::Link(name))
            .await?;
        Ok(())
    }

    async fn set_default_route(&self, netns: &str, gateway: Ipv4Addr) -> RustainerResult<()> {
        let via = gateway.to_string();
        self.ip(
            Some(netns),
            &["route", "replace", "default", "via", &via],
            Target::Netns(netns),
        )
        .await?;
        Ok(())
    }

    async fn add_netns(&self, name: &str) -> RustainerResult<()> {
        self.ip(None, &["netns", "add", name], Target::Netns(name))
            .await?;
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> RustainerResult<()> {
        self.ip(None, &["netns", "delete", name], Target::Netns(name))
            .await?;
        Ok(())
    }

    async fn list_netns(&self) -> RustainerResult<Vec<String>> {
        let stdout = self.ip(None, &["netns", "list"], Target::None).await?;
        Ok(parse_netns_names(&stdout))
    }

    async fn list_rules(&self, table: &str, chain: &str) -> RustainerResult<Vec<String>> {
        let stdout = self
            .iptables(&["-t", table, "-S", chain], Target::Rule(chain))
            .await?;
        Ok(stdout
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(str::to_string)
            .collect())
    }

    async fn append_rule(&self, table: &str, chain: &str, args: &[String]) -> RustainerResult<()> {
        let mut full = vec!["-t", table, "-A", chain];
        full.extend(args.iter().map(String::as_str));
        self.iptables(&full, Target::Rule(chain)).await?;
        Ok(())
    }

    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> RustainerResult<()> {
        let mut full = vec!["-t", table, "-D", chain];
        full.extend(args.iter().map(String::as_str));
        self.iptables(&full, Target::Rule(chain)).await?;
        Ok(())
    }

    async fn read_sysctl(&self, key: &str) -> RustainerResult<String> {
        let path = self.sysctl_path(key);
        tokio::fs::read_to_string(&path)
            .await
            .map(|value| value.trim().to_string())
            .map_err(|e| sysctl_error(key, e))
    }

    async fn write_sysctl(&self, key: &str, value: &str) -> RustainerResult<()> {
        let path = self.sysctl_path(key);
        tracing::trace!(key, value, path = %path.display(), "Writing sysctl");
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| sysctl_error(key, e))
    }
}

fn sysctl_error(key: &str, err: std::io::Error) -> RustainerError {
    match err.kind() {
        std::io::ErrorKind::NotFound => RustainerError::NotFound {
            kind: "sysctl".to_string(),
            name: key.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => RustainerError::PermissionDenied {
            operation: format!("write sysctl {key}"),
        },
        _ => RustainerError::Io(err),
    }
}

/// Map a failed command's stderr onto the error taxonomy.
fn classify_failure(command: &str, stderr: &str, target: Target<'_>) -> RustainerError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("you must be root")
    {
        return RustainerError::PermissionDenied {
            operation: command.to_string(),
        };
    }

    if lower.contains("file exists") {
        let (kind, name) = match target {
            Target::Link(name) => ("link", name),
            Target::Netns(name) => ("namespace", name),
            Target::Rule(chain) => ("rule", chain),
            Target::None => ("resource", command),
        };
        return RustainerError::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        };
    }

    let missing = lower.contains("cannot find device")
        || lower.contains("does not exist")
        || lower.contains("no such file")
        || lower.contains("no such device")
        || lower.contains("no chain/target/match by that name")
        || lower.contains("does a matching rule exist");

    if missing {
        return match target {
            Target::Link(name) => RustainerError::InterfaceNotFound {
                name: name.to_string(),
            },
            Target::Netns(name) => RustainerError::NotFound {
                kind: "namespace".to_string(),
                name: name.to_string(),
            },
            Target::Rule(chain) => RustainerError::NotFound {
                kind: "rule".to_string(),
                name: chain.to_string(),
            },
            Target::None => RustainerError::NotFound {
                kind: "resource".to_string(),
                name: command.to_string(),
            },
        };
    }

    RustainerError::CommandFailed {
        command: command.to_string(),
        stderr: stderr.to_string(),
    }
}

/// Link names from `ip -o link show`.
///
/// Lines look like `4: rst1a2b3c4dh@if3: <BROADCAST,...> mtu 1500 ...`.
fn parse_link_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split(": ").nth(1))
        .filter_map(|name| name.split('@').next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// IPv4 addresses from `ip -o -4 addr show`.
fn parse_inet_addresses(stdout: &str) -> Vec<Ipv4Net> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet")?;
            tokens.next()?.parse().ok()
        })
        .collect()
}

/// Namespace names from `ip netns list` (`name (id: 0)` or bare `name`).
fn parse_netns_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
