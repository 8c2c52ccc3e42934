//! Reserved-prefix naming for owned host resources.
//!
//! Every namespace, veth and iptables rule this crate creates carries the
//! configured prefix, so a reconcile pass can tell owned state apart from
//! everything else on the host without any persisted bookkeeping.

use rustainer_common::ContainerId;
use sha2::{Digest, Sha256};

/// Suffix on the host-side veth.
const HOST_SUFFIX: char = 'h';
/// Suffix on the container-side veth.
const CONTAINER_SUFFIX: char = 'c';
/// Hex characters of the ID hash embedded in veth names.
const HASH_LEN: usize = 8;

/// Names of the host resources belonging to one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Network namespace name.
    pub namespace: String,
    /// Veth end left in the root namespace and enslaved to the bridge.
    pub veth_host: String,
    /// Veth end moved into the container namespace.
    pub veth_container: String,
}

/// Tag carried in the comment of an owned iptables rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleTag {
    /// Subnet-wide rule shared by all containers (masquerade, forward).
    Shared(String),
    /// Rule installed for a single container (port publishing).
    Container(String),
}

/// Derives and recognises owned resource names for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
}

impl Naming {
    /// Create a naming scheme for a prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The reserved prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resource names for a container.
    ///
    /// Veth names embed a hash of the ID rather than the ID itself so that
    /// they always fit in 15 bytes.
    #[must_use]
    pub fn for_container(&self, id: &ContainerId) -> ResourceNames {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let hash = &hex::encode(digest)[..HASH_LEN];
        ResourceNames {
            namespace: format!("{}-{}", self.prefix, id),
            veth_host: format!("{}{hash}{HOST_SUFFIX}", self.prefix),
            veth_container: format!("{}{hash}{CONTAINER_SUFFIX}", self.prefix),
        }
    }

    /// Whether a namespace name was produced by this scheme.
    #[must_use]
    pub fn is_owned_netns(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|id| ContainerId::new(id).is_ok())
    }

    /// Whether a link name is a veth end produced by this scheme.
    #[must_use]
    pub fn is_owned_link(&self, name: &str) -> bool {
        let Some(rest) = name.strip_prefix(&self.prefix) else {
            return false;
        };
        if !rest.is_ascii() || rest.len() != HASH_LEN + 1 {
            return false;
        }
        let (hash, suffix) = rest.split_at(HASH_LEN);
        hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            && suffix
                .chars()
                .all(|c| c == HOST_SUFFIX || c == CONTAINER_SUFFIX)
    }

    /// Comment for a shared rule with the given role.
    #[must_use]
    pub fn shared_tag(&self, role: &str) -> String {
        format!("{}:shared:{role}", self.prefix)
    }

    /// Comment for a rule owned by one container.
    #[must_use]
    pub fn container_tag(&self, id: &ContainerId) -> String {
        format!("{}:ctr:{id}", self.prefix)
    }

    /// Parse an iptables comment back into a tag, if it is one of ours.
    #[must_use]
    pub fn parse_tag(&self, comment: &str) -> Option<RuleTag> {
        let rest = comment.strip_prefix(&self.prefix)?.strip_prefix(':')?;
        if let Some(role) = rest.strip_prefix("shared:") {
            return Some(RuleTag::Shared(role.to_string()));
        }
        rest.strip_prefix("ctr:")
            .map(|id| RuleTag::Container(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_IFNAME_LEN;

    fn id(s: &str) -> ContainerId {
        ContainerId::new(s).unwrap()
    }

    #[test]
    fn names_fit_interface_limit() {
        let naming = Naming::new("rstnet");
        let names = naming.for_container(&id(&"x".repeat(64)));
        assert!(names.veth_host.len() <= MAX_IFNAME_LEN);
        assert!(names.veth_container.len() <= MAX_IFNAME_LEN);
        assert!(names.veth_host.ends_with('h'));
        assert!(names.veth_container.ends_with('c'));
    }

    #[test]
    fn names_are_deterministic_and_distinct() {
        let naming = Naming::new("rst");
        let a = naming.for_container(&id("c1"));
        let b = naming.for_container(&id("c2"));
        assert_eq!(a, naming.for_container(&id("c1")));
        assert_ne!(a.veth_host, b.veth_host);
        assert_eq!(a.namespace, "rst-c1");
    }

    #[test]
    fn recognises_owned_resources() {
        let naming = Naming::new("rst");
        let names = naming.for_container(&id("web-1"));
        assert!(naming.is_owned_netns(&names.namespace));
        assert!(naming.is_owned_link(&names.veth_host));
        assert!(naming.is_owned_link(&names.veth_container));

        assert!(!naming.is_owned_netns("cni-1234"));
        assert!(!naming.is_owned_netns("rst-"));
        assert!(!naming.is_owned_link("rustainer0"));
        assert!(!naming.is_owned_link("rst0"));
        assert!(!naming.is_owned_link("eth0"));
        assert!(!naming.is_owned_link("rstzzzzzzzzh"));
    }

    #[test]
    fn tags_round_trip() {
        let naming = Naming::new("rst");
        assert_eq!(
            naming.parse_tag(&naming.shared_tag("masquerade")),
            Some(RuleTag::Shared("masquerade".to_string()))
        );
        assert_eq!(
            naming.parse_tag(&naming.container_tag(&id("c1"))),
            Some(RuleTag::Container("c1".to_string()))
        );
        assert_eq!(naming.parse_tag("docker:shared:masquerade"), None);
        assert_eq!(naming.parse_tag("rst:other"), None);
    }
}
