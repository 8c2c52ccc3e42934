//! Port publishing for containers.
//!
//! A published port becomes three NAT rules tagged with the owning
//! container: a PREROUTING DNAT for external traffic, an OUTPUT DNAT for
//! traffic originating on the host, and a POSTROUTING masquerade so that
//! hairpin traffic returns through the bridge.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use rustainer_common::{ContainerId, RustainerError, RustainerResult};
use serde::{Deserialize, Serialize};

use crate::nat::{NatRuleSet, RuleDescriptor, Table};
use crate::naming::{Naming, RuleTag};

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP protocol.
    #[default]
    Tcp,
    /// UDP protocol.
    Udp,
}

impl Protocol {
    /// Protocol name for iptables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = RustainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(RustainerError::Config {
                message: format!("unsupported protocol '{other}'"),
            }),
        }
    }
}

/// A port published from the host to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port.
    pub host_port: u16,
    /// Container port.
    pub container_port: u16,
    /// Protocol.
    pub protocol: Protocol,
    /// Host address to match; any local address when unset.
    pub host_ip: Option<Ipv4Addr>,
}

impl PortMapping {
    /// A TCP mapping.
    #[must_use]
    pub const fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
            host_ip: None,
        }
    }

    /// A UDP mapping.
    #[must_use]
    pub const fn udp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Udp,
            host_ip: None,
        }
    }

    /// Restrict the mapping to one host address.
    #[must_use]
    pub const fn with_host_ip(mut self, ip: Ipv4Addr) -> Self {
        self.host_ip = Some(ip);
        self
    }

    /// Whether two mappings claim the same host endpoint.
    #[must_use]
    pub fn collides_with(&self, other: &Self) -> bool {
        self.host_port == other.host_port
            && self.protocol == other.protocol
            && (self.host_ip.is_none() || other.host_ip.is_none() || self.host_ip == other.host_ip)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = self.host_ip {
            write!(f, "{ip}:")?;
        }
        write!(
            f,
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

impl FromStr for PortMapping {
    type Err = RustainerError;

    /// Parse `[HOST_IP:]HOST_PORT:CONTAINER_PORT[/PROTO]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RustainerError::Config {
            message: format!("invalid port mapping '{s}', expected [IP:]HOST:CONTAINER[/tcp|udp]"),
        };

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto.parse()?),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [host, container] => (None, *host, *container),
            [ip, host, container] => (
                Some(ip.parse::<Ipv4Addr>().map_err(|_| invalid())?),
                *host,
                *container,
            ),
            _ => return Err(invalid()),
        };

        let port = |p: &str| p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid);
        Ok(Self {
            host_port: port(host_port)?,
            container_port: port(container_port)?,
            protocol,
            host_ip,
        })
    }
}

/// Installs and removes per-container DNAT rules.
pub struct PortMapper {
    nat: Arc<NatRuleSet>,
    naming: Naming,
}

impl PortMapper {
    /// Create a mapper that installs through `nat`.
    pub fn new(nat: Arc<NatRuleSet>, naming: Naming) -> Self {
        Self { nat, naming }
    }

    /// The rules publishing one mapping to a container address.
    #[must_use]
    pub fn rules_for(
        &self,
        id: &ContainerId,
        container_ip: Ipv4Addr,
        mapping: &PortMapping,
    ) -> Vec<(Table, RuleDescriptor)> {
        let tag = self.naming.container_tag(id);
        let proto = mapping.protocol.as_str();
        let host_port = mapping.host_port.to_string();
        let destination = format!("{container_ip}:{}", mapping.container_port);

        let mut prerouting = RuleDescriptor::new("PREROUTING", "DNAT").with("-p", proto);
        if let Some(ip) = mapping.host_ip {
            prerouting = prerouting.with("-d", ip.to_string());
        }
        let prerouting = prerouting
            .with("--dport", host_port.clone())
            .comment(tag.clone())
            .target_arg("--to-destination", destination.clone());

        let local = mapping.host_ip.unwrap_or(Ipv4Addr::LOCALHOST);
        let output = RuleDescriptor::new("OUTPUT", "DNAT")
            .with("-p", proto)
            .with("-d", local.to_string())
            .with("--dport", host_port)
            .comment(tag.clone())
            .target_arg("--to-destination", destination);

        let hairpin = RuleDescriptor::new("POSTROUTING", "MASQUERADE")
            .with("-p", proto)
            .with("-s", container_ip.to_string())
            .with("-d", container_ip.to_string())
            .with("--dport", mapping.container_port.to_string())
            .comment(tag);

        vec![
            (Table::Nat, prerouting),
            (Table::Nat, output),
            (Table::Nat, hairpin),
        ]
    }

    /// Publish every mapping for a container.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::AlreadyExists`] if another container
    /// already publishes one of the host ports, or the host error if a rule
    /// cannot be installed. Rules installed before the failure are left for
    /// the caller to remove with [`PortMapper::remove_container`].
    pub async fn install(
        &self,
        id: &ContainerId,
        container_ip: Ipv4Addr,
        mappings: &[PortMapping],
    ) -> RustainerResult<()> {
        if mappings.is_empty() {
            return Ok(());
        }

        let published = self.published_by_others(id).await?;
        for mapping in mappings {
            if let Some((owner, _)) = published.iter().find(|(_, m)| m.collides_with(mapping)) {
                return Err(RustainerError::AlreadyExists {
                    kind: "port".to_string(),
                    name: format!("{mapping} (published by {owner})"),
                });
            }
        }

        for mapping in mappings {
            for (table, rule) in self.rules_for(id, container_ip, mapping) {
                self.nat.ensure(table, rule).await?;
            }
            tracing::info!(container_id = %id, mapping = %mapping, "Published port");
        }
        Ok(())
    }

    /// Remove every rule tagged with the container.
    ///
    /// Returns the number of rules removed.
    ///
    /// # Errors
    ///
    /// Returns the last deletion error after attempting every rule.
    pub async fn remove_container(&self, id: &ContainerId) -> RustainerResult<usize> {
        let tag = RuleTag::Container(id.to_string());
        let mut removed = 0;
        let mut last_error = None;

        for owned in self.nat.list_owned().await? {
            if owned.tag != tag {
                continue;
            }
            match self.nat.delete(owned.table, &owned.rule).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(container_id = %id, rule = %owned.rule, error = %e, "Failed to remove port rule");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Host endpoints published by other containers, from their PREROUTING rules.
    async fn published_by_others(
        &self,
        id: &ContainerId,
    ) -> RustainerResult<Vec<(String, PortMapping)>> {
        let mut published = Vec::new();
        for owned in self.nat.list_owned().await? {
            let RuleTag::Container(owner) = owned.tag else {
                continue;
            };
            if owner == id.as_str() || owned.rule.chain != "PREROUTING" {
                continue;
            }
            if let Some(mapping) = mapping_from_rule(&owned.rule) {
                published.push((owner, mapping));
            }
        }
        Ok(published)
    }
}

/// Recover the host side of a mapping from its PREROUTING rule.
fn mapping_from_rule(rule: &RuleDescriptor) -> Option<PortMapping> {
    let value = |flag: &str| {
        rule.criteria
            .iter()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.as_str())
    };
    let host_port = value("--dport")?.parse().ok()?;
    let protocol = value("-p").and_then(|p| p.parse().ok()).unwrap_or_default();
    let host_ip = value("-d")
        .and_then(|d| d.trim_end_matches("/32").parse().ok());
    let container_port = rule
        .target_args
        .iter()
        .find(|(f, _)| f == "--to-destination")
        .and_then(|(_, v)| v.rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(host_port);

    Some(PortMapping {
        host_port,
        container_port,
        protocol,
        host_ip,
    })
}
