//! Masquerade and forwarding rules.
//!
//! Rules are identified by a [`RuleDescriptor`]: chain, match criteria,
//! target and the owner tag stored in an iptables comment. Installation
//! lists the chain first and only appends when no equivalent rule exists;
//! removal deletes individual descriptor-matched rules and never flushes a
//! chain.

use std::fmt;
use std::sync::Arc;

use ipnet::Ipv4Net;
use rustainer_common::{RustainerError, RustainerResult};

use crate::host::HostNetwork;
use crate::naming::{Naming, RuleTag};

/// Tag role of the subnet masquerade rule.
pub const ROLE_MASQUERADE: &str = "masquerade";
/// Tag role of the bridge ingress forward rule.
pub const ROLE_FORWARD_IN: &str = "forward-in";
/// Tag role of the bridge egress forward rule.
pub const ROLE_FORWARD_OUT: &str = "forward-out";

/// An iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// `nat`
    Nat,
    /// `filter`
    Filter,
}

impl Table {
    /// Name passed to `iptables -t`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nat => "nat",
            Self::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chains this crate installs rules into.
pub const MANAGED_CHAINS: [(Table, &str); 4] = [
    (Table::Nat, "POSTROUTING"),
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "OUTPUT"),
    (Table::Filter, "FORWARD"),
];

/// Identity of a single iptables rule.
///
/// Two descriptors are equal when they share chain, target, comment and
/// the same set of criteria regardless of order, so a rule read back from
/// `iptables -S` compares equal to the one that was appended.
#[derive(Debug, Clone, Eq)]
pub struct RuleDescriptor {
    /// Chain holding the rule.
    pub chain: String,
    /// Match criteria as `(flag, value)`; negated flags are prefixed `!`.
    pub criteria: Vec<(String, String)>,
    /// Jump target.
    pub target: String,
    /// Options following the target, e.g. `--to-destination`.
    pub target_args: Vec<(String, String)>,
    /// Owner comment.
    pub comment: Option<String>,
}

impl RuleDescriptor {
    /// Start a descriptor for a chain and target.
    pub fn new(chain: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            criteria: Vec::new(),
            target: target.into(),
            target_args: Vec::new(),
            comment: None,
        }
    }

    /// Add a match criterion.
    #[must_use]
    pub fn with(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.criteria.push((flag.to_string(), normalize(flag, value.into())));
        self
    }

    /// Add a negated match criterion.
    #[must_use]
    pub fn without(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.criteria
            .push((format!("!{flag}"), normalize(flag, value.into())));
        self
    }

    /// Add an option after the target.
    #[must_use]
    pub fn target_arg(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.target_args.push((flag.to_string(), value.into()));
        self
    }

    /// Attach an owner comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Arguments after `-A <chain>` / `-D <chain>`.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, value) in &self.criteria {
            match flag.strip_prefix('!') {
                Some(bare) => {
                    args.push("!".to_string());
                    args.push(bare.to_string());
                }
                None => args.push(flag.clone()),
            }
            args.push(value.clone());
        }
        if let Some(comment) = &self.comment {
            args.extend(["-m", "comment", "--comment"].map(String::from));
            args.push(comment.clone());
        }
        args.push("-j".to_string());
        args.push(self.target.clone());
        for (flag, value) in &self.target_args {
            args.push(flag.clone());
            args.push(value.clone());
        }
        args
    }

    /// Parse an `iptables -S` line (`-A CHAIN ...`).
    ///
    /// Returns `None` for policy lines and anything without a target.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let tokens = tokenize(line);
        let mut iter = tokens.iter();
        if iter.next().map(String::as_str) != Some("-A") {
            return None;
        }
        let chain = iter.next()?.clone();
        let rest: Vec<String> = iter.cloned().collect();
        let descriptor = Self::from_args(&chain, &rest);
        (!descriptor.target.is_empty()).then_some(descriptor)
    }

    /// Build a descriptor from rule arguments (without `-A CHAIN`).
    #[must_use]
    pub fn from_args(chain: &str, args: &[String]) -> Self {
        let mut descriptor = Self::new(chain, "");
        let mut negate = false;
        let mut after_target = false;
        let mut iter = args.iter();

        while let Some(token) = iter.next() {
            match token.as_str() {
                "!" => negate = true,
                "-m" | "--match" => {
                    iter.next();
                }
                "-j" | "--jump" => {
                    if let Some(target) = iter.next() {
                        descriptor.target.clone_from(target);
                    }
                    after_target = true;
                }
                "--comment" => {
                    descriptor.comment = iter.next().cloned();
                }
                flag if flag.starts_with('-') => {
                    let value = iter.next().cloned().unwrap_or_default();
                    if after_target {
                        descriptor.target_args.push((flag.to_string(), value));
                    } else {
                        let key = if negate {
                            format!("!{flag}")
                        } else {
                            flag.to_string()
                        };
                        descriptor.criteria.push((key, normalize(flag, value)));
                    }
                    negate = false;
                }
                _ => {}
            }
        }

        descriptor
    }

    fn sorted_criteria(&self) -> Vec<(String, String)> {
        let mut criteria: Vec<_> = self
            .criteria
            .iter()
            .map(|(flag, value)| (canonical_flag(flag), value.clone()))
            .collect();
        criteria.sort();
        criteria
    }

    fn sorted_target_args(&self) -> Vec<(String, String)> {
        let mut args = self.target_args.clone();
        args.sort();
        args
    }
}

impl PartialEq for RuleDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.target == other.target
            && self.comment == other.comment
            && self.sorted_criteria() == other.sorted_criteria()
            && self.sorted_target_args() == other.sorted_target_args()
    }
}

impl fmt::Display for RuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, self.to_args().join(" "))
    }
}

/// Long and short spellings of the same flag compare equal.
fn canonical_flag(flag: &str) -> String {
    let (neg, bare) = flag
        .strip_prefix('!')
        .map_or(("", flag), |bare| ("!", bare));
    let short = match bare {
        "--source" => "-s",
        "--destination" => "-d",
        "--in-interface" => "-i",
        "--out-interface" => "-o",
        "--protocol" => "-p",
        other => other,
    };
    format!("{neg}{short}")
}

/// `iptables -S` prints host addresses with an explicit `/32`.
fn normalize(flag: &str, value: String) -> String {
    let is_address = matches!(
        flag.trim_start_matches('!'),
        "-s" | "-d" | "--source" | "--destination"
    );
    if is_address && !value.contains('/') {
        format!("{value}/32")
    } else {
        value
    }
}

/// Split an `iptables -S` line, honouring double-quoted values.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => quoted = !quoted,
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// An owned rule found on the host.
#[derive(Debug, Clone)]
pub struct OwnedRule {
    /// Table holding the rule.
    pub table: Table,
    /// The parsed rule.
    pub rule: RuleDescriptor,
    /// Owner tag from the comment.
    pub tag: RuleTag,
}

/// Installs and removes the subnet-wide NAT and forward rules.
pub struct NatRuleSet {
    host: Arc<dyn HostNetwork>,
    naming: Naming,
}

impl NatRuleSet {
    /// Create a rule set for the given naming scheme.
    pub fn new(host: Arc<dyn HostNetwork>, naming: Naming) -> Self {
        Self { host, naming }
    }

    /// Descriptor of the masquerade rule for a subnet.
    #[must_use]
    pub fn masquerade_rule(&self, subnet: Ipv4Net, exclude_iface: &str) -> RuleDescriptor {
        RuleDescriptor::new("POSTROUTING", "MASQUERADE")
            .with("-s", subnet.trunc().to_string())
            .without("-o", exclude_iface)
            .comment(self.naming.shared_tag(ROLE_MASQUERADE))
    }

    /// Descriptors of the forward rules for a bridge.
    #[must_use]
    pub fn forward_rules(&self, iface: &str) -> [RuleDescriptor; 2] {
        [
            RuleDescriptor::new("FORWARD", "ACCEPT")
                .with("-i", iface)
                .comment(self.naming.shared_tag(ROLE_FORWARD_IN)),
            RuleDescriptor::new("FORWARD", "ACCEPT")
                .with("-o", iface)
                .comment(self.naming.shared_tag(ROLE_FORWARD_OUT)),
        ]
    }

    /// Every shared descriptor for a subnet and bridge.
    #[must_use]
    pub fn desired(&self, subnet: Ipv4Net, bridge: &str) -> Vec<(Table, RuleDescriptor)> {
        let mut rules = vec![(Table::Nat, self.masquerade_rule(subnet, bridge))];
        rules.extend(
            self.forward_rules(bridge)
                .into_iter()
                .map(|rule| (Table::Filter, rule)),
        );
        rules
    }

    /// Install the masquerade rule unless an equivalent one is present.
    ///
    /// Returns `true` if a rule was appended.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::RuleConflict`] if a rule carrying the same
    /// tag exists with different parameters.
    pub async fn ensure_masquerade(
        &self,
        subnet: Ipv4Net,
        exclude_iface: &str,
    ) -> RustainerResult<bool> {
        let rule = self.masquerade_rule(subnet, exclude_iface);
        self.ensure(Table::Nat, rule).await
    }

    /// Install the forward accept rules for a bridge.
    ///
    /// Returns the number of rules appended.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::RuleConflict`] on tag collisions.
    pub async fn ensure_forward_accept(&self, iface: &str) -> RustainerResult<usize> {
        let mut appended = 0;
        for rule in self.forward_rules(iface) {
            if self.ensure(Table::Filter, rule).await? {
                appended += 1;
            }
        }
        Ok(appended)
    }

    /// Remove every shared rule carrying this system's tag.
    ///
    /// Tagged rules found on the host are removed one by one. Returns the
    /// removed rules.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain cannot be listed. Individual deletions
    /// that fail are logged and skipped.
    pub async fn teardown_all(&self) -> RustainerResult<Vec<String>> {
        let mut removed = Vec::new();
        for owned in self.list_owned().await? {
            if !matches!(owned.tag, RuleTag::Shared(_)) {
                continue;
            }
            match self.delete(owned.table, &owned.rule).await {
                Ok(()) => removed.push(owned.rule.to_string()),
                Err(e) => {
                    tracing::warn!(rule = %owned.rule, error = %e, "Failed to remove NAT rule");
                }
            }
        }
        Ok(removed)
    }

    /// Every rule in the managed chains whose comment carries our prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a chain cannot be listed.
    pub async fn list_owned(&self) -> RustainerResult<Vec<OwnedRule>> {
        let mut owned = Vec::new();
        for (table, chain) in MANAGED_CHAINS {
            for line in self.host.list_rules(table.as_str(), chain).await? {
                let Some(rule) = RuleDescriptor::parse_line(&line) else {
                    continue;
                };
                let Some(tag) = rule
                    .comment
                    .as_deref()
                    .and_then(|comment| self.naming.parse_tag(comment))
                else {
                    continue;
                };
                owned.push(OwnedRule { table, rule, tag });
            }
        }
        Ok(owned)
    }

    /// Delete one rule; a rule that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns the host error for anything other than a missing rule.
    pub async fn delete(&self, table: Table, rule: &RuleDescriptor) -> RustainerResult<()> {
        match self
            .host
            .delete_rule(table.as_str(), &rule.chain, &rule.to_args())
            .await
        {
            Ok(()) => {
                tracing::debug!(table = %table, rule = %rule, "Removed rule");
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(table = %table, rule = %rule, "Rule already absent");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Shared rules carry a tag that must be unique per chain.
    fn is_shared(&self, rule: &RuleDescriptor) -> bool {
        rule.comment
            .as_deref()
            .and_then(|comment| self.naming.parse_tag(comment))
            .is_some_and(|tag| matches!(tag, RuleTag::Shared(_)))
    }

    /// Install a rule if absent; shared with per-container port rules.
    pub(crate) async fn ensure(&self, table: Table, rule: RuleDescriptor) -> RustainerResult<bool> {
        let lines = self.host.list_rules(table.as_str(), &rule.chain).await?;
        for existing in lines.iter().filter_map(|l| RuleDescriptor::parse_line(l)) {
            if existing == rule {
                tracing::debug!(table = %table, rule = %rule, "Rule already present");
                return Ok(false);
            }
            if existing.comment.is_some()
                && existing.comment == rule.comment
                && self.is_shared(&existing)
            {
                return Err(RustainerError::RuleConflict {
                    chain: rule.chain.clone(),
                    expected: rule.to_string(),
                    found: existing.to_string(),
                });
            }
        }

        self.host
            .append_rule(table.as_str(), &rule.chain, &rule.to_args())
            .await?;
        tracing::info!(table = %table, rule = %rule, "Installed rule");
        Ok(true)
    }
}
