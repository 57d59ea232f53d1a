//! Access rules, rulesets and their evaluation across the node graph.
//!
//! Rules are never attached to nodes directly. A node links named rulesets per
//! rule type; ad-hoc rules go into the node's special ruleset. Nodes without
//! own rulesets for a rule type inherit the effective rulesets of all parents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::identity::{User, UserDirectory};
use crate::node_store::{NodeStore, NodeStoreError};
use crate::{GroupId, NodeId, RuleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Read,
    Write,
    Data,
}

impl RuleType {
    pub const ALL: [RuleType; 3] = [RuleType::Read, RuleType::Write, RuleType::Data];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Read => "read",
            RuleType::Write => "write",
            RuleType::Data => "data",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(RuleType::Read),
            "write" => Ok(RuleType::Write),
            "data" => Ok(RuleType::Data),
            other => Err(AccessError::UnknownRuleType(other.to_string())),
        }
    }
}

/// IPv4 or IPv6 network in CIDR notation. A bare address is a host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    addr: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AccessError::InvalidSubnet(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

impl TryFrom<String> for Subnet {
    type Error = AccessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(value: Subnet) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Inclusive date range; a missing bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |d: Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_default();
        write!(f, "{}..{}", bound(self.start), bound(self.end))
    }
}

/// Group / subnet / date predicate. A predicate that is `None` always matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: RuleId,
    pub group_ids: Option<Vec<GroupId>>,
    pub subnets: Option<Vec<Subnet>>,
    pub dateranges: Option<Vec<DateRange>>,
    pub invert_group: bool,
    pub invert_subnet: bool,
    pub invert_date: bool,
}

impl Default for AccessRule {
    fn default() -> Self {
        Self {
            id: Ulid::new(),
            group_ids: None,
            subnets: None,
            dateranges: None,
            invert_group: false,
            invert_subnet: false,
            invert_date: false,
        }
    }
}

impl AccessRule {
    pub fn for_groups(group_ids: impl IntoIterator<Item = GroupId>) -> Self {
        Self {
            group_ids: Some(group_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn for_subnets(subnets: impl IntoIterator<Item = Subnet>) -> Self {
        Self {
            subnets: Some(subnets.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn for_dates(dateranges: impl IntoIterator<Item = DateRange>) -> Self {
        Self {
            dateranges: Some(dateranges.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn matches(&self, ctx: &AccessContext) -> bool {
        let group_ok = self.group_ids.as_ref().map_or(true, |groups| {
            groups.iter().any(|g| ctx.group_ids.contains(g)) != self.invert_group
        });
        let subnet_ok = self.subnets.as_ref().map_or(true, |subnets| {
            let inside = ctx
                .ip
                .map_or(false, |ip| subnets.iter().any(|s| s.contains(ip)));
            inside != self.invert_subnet
        });
        let date_ok = self.dateranges.as_ref().map_or(true, |ranges| {
            ranges.iter().any(|r| r.contains(ctx.date)) != self.invert_date
        });
        group_ok && subnet_ok && date_ok
    }
}

/// Rule membership inside a ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAssoc {
    pub rule_id: RuleId,
    pub invert: bool,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRuleset {
    pub name: String,
    pub description: Option<String>,
    pub rule_assocs: Vec<RuleAssoc>,
}

/// Link between a node and a named ruleset for one rule type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetAssoc {
    pub ruleset_name: String,
    pub ruletype: RuleType,
    pub invert: bool,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRulesetAssoc {
    pub assoc: RulesetAssoc,
    pub inherited: bool,
    pub source: NodeId,
}

/// A rule as it takes part in evaluation, with ruleset and rule flags combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRuleAssoc {
    pub rule_id: RuleId,
    pub ruleset_name: String,
    pub invert: bool,
    pub blocking: bool,
}

/// Who is asking, from where, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub group_ids: Vec<GroupId>,
    pub is_admin: bool,
    pub ip: Option<IpAddr>,
    pub date: NaiveDate,
}

impl AccessContext {
    pub fn anonymous(ip: Option<IpAddr>, date: NaiveDate) -> Self {
        Self {
            group_ids: Vec::new(),
            is_admin: false,
            ip,
            date,
        }
    }

    pub fn for_user(
        directory: &UserDirectory,
        user: &User,
        ip: Option<IpAddr>,
        date: NaiveDate,
    ) -> Self {
        Self {
            group_ids: user.group_ids.clone(),
            is_admin: directory.is_admin(user),
            ip,
            date,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("rule {0} not found")]
    RuleNotFound(RuleId),
    #[error("ruleset {0} not found")]
    RulesetNotFound(String),
    #[error("ruleset {0} already exists")]
    RulesetExists(String),
    #[error("ruleset {name} is still linked to {nodes} node(s)")]
    RulesetInUse { name: String, nodes: usize },
    #[error("unknown rule type {0}")]
    UnknownRuleType(String),
    #[error("invalid subnet {0}")]
    InvalidSubnet(String),
    #[error(transparent)]
    Store(#[from] NodeStoreError),
}

/// Registry of rules, rulesets and node associations.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct AccessControl {
    rules: HashMap<RuleId, AccessRule>,
    rulesets: BTreeMap<String, AccessRuleset>,
    node_rulesets: HashMap<NodeId, Vec<RulesetAssoc>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: AccessRule) -> RuleId {
        let id = rule.id;
        self.rules.insert(id, rule);
        id
    }

    pub fn rule(&self, id: RuleId) -> Result<&AccessRule, AccessError> {
        self.rules.get(&id).ok_or(AccessError::RuleNotFound(id))
    }

    pub fn create_ruleset(
        &mut self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), AccessError> {
        let name = name.into();
        if self.rulesets.contains_key(&name) {
            return Err(AccessError::RulesetExists(name));
        }
        self.rulesets.insert(
            name.clone(),
            AccessRuleset {
                name,
                description,
                rule_assocs: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn ruleset(&self, name: &str) -> Result<&AccessRuleset, AccessError> {
        self.rulesets
            .get(name)
            .ok_or_else(|| AccessError::RulesetNotFound(name.to_string()))
    }

    pub fn rulesets(&self) -> impl Iterator<Item = &AccessRuleset> {
        self.rulesets.values()
    }

    pub fn add_rule_to_ruleset(
        &mut self,
        name: &str,
        rule_id: RuleId,
        invert: bool,
        blocking: bool,
    ) -> Result<(), AccessError> {
        self.rule(rule_id)?;
        let ruleset = self
            .rulesets
            .get_mut(name)
            .ok_or_else(|| AccessError::RulesetNotFound(name.to_string()))?;
        ruleset.rule_assocs.push(RuleAssoc {
            rule_id,
            invert,
            blocking,
        });
        Ok(())
    }

    /// Remove a ruleset that no node links anymore.
    pub fn remove_ruleset(&mut self, name: &str) -> Result<AccessRuleset, AccessError> {
        let nodes = self
            .node_rulesets
            .values()
            .filter(|assocs| assocs.iter().any(|a| a.ruleset_name == name))
            .count();
        if nodes > 0 {
            return Err(AccessError::RulesetInUse {
                name: name.to_string(),
                nodes,
            });
        }
        self.rulesets
            .remove(name)
            .ok_or_else(|| AccessError::RulesetNotFound(name.to_string()))
    }

    /// Link a ruleset to a node. An existing link for the same ruleset and
    /// rule type is left alone and `false` is returned.
    pub fn link_ruleset(
        &mut self,
        store: &NodeStore,
        node: NodeId,
        name: &str,
        ruletype: RuleType,
        invert: bool,
        blocking: bool,
    ) -> Result<bool, AccessError> {
        store.node(node)?;
        self.ruleset(name)?;
        let assocs = self.node_rulesets.entry(node).or_default();
        if let Some(existing) = assocs
            .iter()
            .find(|a| a.ruleset_name == name && a.ruletype == ruletype)
        {
            warn!(
                ruleset = name,
                %ruletype,
                invert = existing.invert,
                %node,
                "ruleset already used by node, ignored"
            );
            return Ok(false);
        }
        assocs.push(RulesetAssoc {
            ruleset_name: name.to_string(),
            ruletype,
            invert,
            blocking,
        });
        debug!(ruleset = name, %ruletype, %node, "linked ruleset");
        Ok(true)
    }

    pub fn unlink_ruleset(&mut self, node: NodeId, name: &str, ruletype: RuleType) -> bool {
        let Some(assocs) = self.node_rulesets.get_mut(&node) else {
            warn!(ruleset = name, %ruletype, %node, "ruleset not used by node, ignored");
            return false;
        };
        let before = assocs.len();
        assocs.retain(|a| !(a.ruleset_name == name && a.ruletype == ruletype));
        let removed = assocs.len() != before;
        if removed {
            debug!(ruleset = name, %ruletype, %node, "unlinked ruleset");
        } else {
            warn!(ruleset = name, %ruletype, %node, "ruleset not used by node, ignored");
        }
        removed
    }

    pub fn own_ruleset_assocs(&self, node: NodeId, ruletype: RuleType) -> Vec<&RulesetAssoc> {
        self.node_rulesets
            .get(&node)
            .map(|assocs| assocs.iter().filter(|a| a.ruletype == ruletype).collect())
            .unwrap_or_default()
    }

    pub fn special_ruleset_name(node: NodeId, ruletype: RuleType) -> String {
        format!("_{ruletype}_{node}")
    }

    pub fn special_ruleset(&self, node: NodeId, ruletype: RuleType) -> Option<&AccessRuleset> {
        self.rulesets
            .get(&Self::special_ruleset_name(node, ruletype))
    }

    /// Add an ad-hoc rule to a node. The rule lands in the node's special
    /// ruleset, which is created and linked on first use.
    pub fn add_node_rule(
        &mut self,
        store: &NodeStore,
        node: NodeId,
        ruletype: RuleType,
        rule: AccessRule,
        invert: bool,
        blocking: bool,
    ) -> Result<RuleId, AccessError> {
        store.node(node)?;
        let name = Self::special_ruleset_name(node, ruletype);
        if !self.rulesets.contains_key(&name) {
            self.create_ruleset(name.clone(), None)?;
        }
        let linked = self
            .own_ruleset_assocs(node, ruletype)
            .iter()
            .any(|a| a.ruleset_name == name);
        if !linked {
            self.link_ruleset(store, node, &name, ruletype, false, false)?;
        }
        let rule_id = self.add_rule(rule);
        self.add_rule_to_ruleset(&name, rule_id, invert, blocking)?;
        Ok(rule_id)
    }

    /// Own ruleset links if the node has any for `ruletype`, otherwise the
    /// union of the parents' effective links.
    pub fn effective_ruleset_assocs(
        &self,
        store: &NodeStore,
        node: NodeId,
        ruletype: RuleType,
    ) -> Vec<EffectiveRulesetAssoc> {
        let mut memo = HashMap::new();
        let mut visiting = HashSet::new();
        self.effective_inner(store, node, ruletype, &mut memo, &mut visiting)
    }

    fn effective_inner(
        &self,
        store: &NodeStore,
        node: NodeId,
        ruletype: RuleType,
        memo: &mut HashMap<NodeId, Vec<EffectiveRulesetAssoc>>,
        visiting: &mut HashSet<NodeId>,
    ) -> Vec<EffectiveRulesetAssoc> {
        if let Some(cached) = memo.get(&node) {
            return cached.clone();
        }

        let own = self.own_ruleset_assocs(node, ruletype);
        let result = if !own.is_empty() {
            own.into_iter()
                .map(|assoc| EffectiveRulesetAssoc {
                    assoc: assoc.clone(),
                    inherited: false,
                    source: node,
                })
                .collect()
        } else {
            if !visiting.insert(node) {
                return Vec::new();
            }
            let mut inherited: Vec<EffectiveRulesetAssoc> = Vec::new();
            for parent in store.parent_ids(node) {
                for eff in self.effective_inner(store, parent, ruletype, memo, visiting) {
                    if !inherited.iter().any(|e| e.assoc == eff.assoc) {
                        inherited.push(EffectiveRulesetAssoc {
                            inherited: true,
                            ..eff
                        });
                    }
                }
            }
            visiting.remove(&node);
            inherited
        };

        memo.insert(node, result.clone());
        result
    }

    /// Flatten effective rulesets into rule associations. Invert flags of
    /// ruleset link and rule membership cancel out; blocking on either side
    /// makes the rule blocking.
    pub fn effective_rule_assocs(
        &self,
        store: &NodeStore,
        node: NodeId,
        ruletype: RuleType,
    ) -> Vec<EffectiveRuleAssoc> {
        self.effective_ruleset_assocs(store, node, ruletype)
            .into_iter()
            .filter_map(|eff| {
                self.rulesets
                    .get(&eff.assoc.ruleset_name)
                    .map(|rs| (eff, rs))
            })
            .flat_map(|(eff, rs)| {
                rs.rule_assocs.iter().map(move |ra| EffectiveRuleAssoc {
                    rule_id: ra.rule_id,
                    ruleset_name: rs.name.clone(),
                    invert: eff.assoc.invert != ra.invert,
                    blocking: eff.assoc.blocking || ra.blocking,
                })
            })
            .collect()
    }

    /// Evaluate access. Admins always pass. Otherwise at least one
    /// non-blocking rule must apply and no blocking rule may apply, where a
    /// rule applies when it matches the context XOR its invert flag.
    pub fn has_access(
        &self,
        store: &NodeStore,
        node: NodeId,
        ruletype: RuleType,
        ctx: &AccessContext,
    ) -> Result<bool, AccessError> {
        store.node(node)?;
        if ctx.is_admin {
            return Ok(true);
        }

        let mut granted = false;
        for assoc in self.effective_rule_assocs(store, node, ruletype) {
            let Some(rule) = self.rules.get(&assoc.rule_id) else {
                warn!(rule = %assoc.rule_id, ruleset = %assoc.ruleset_name, "ruleset references missing rule");
                continue;
            };
            let applies = rule.matches(ctx) != assoc.invert;
            if assoc.blocking && applies {
                return Ok(false);
            }
            if !assoc.blocking && applies {
                granted = true;
            }
        }
        Ok(granted)
    }

    /// Keep only the nodes the context may access.
    pub fn filter_accessible(
        &self,
        store: &NodeStore,
        nodes: impl IntoIterator<Item = NodeId>,
        ruletype: RuleType,
        ctx: &AccessContext,
    ) -> Vec<NodeId> {
        nodes
            .into_iter()
            .filter(|id| matches!(self.has_access(store, *id, ruletype, ctx), Ok(true)))
            .collect()
    }

    /// Human-readable listing of a node's rules for one rule type.
    pub fn describe_rules(
        &self,
        store: &NodeStore,
        node: NodeId,
        ruletype: RuleType,
    ) -> Vec<String> {
        let effective = self.effective_ruleset_assocs(store, node, ruletype);
        let mut lines = Vec::new();
        if !effective.is_empty() {
            lines.push("Rulesets:".to_string());
        }
        let (own, inherited): (Vec<_>, Vec<_>) = effective.iter().partition(|e| !e.inherited);
        for eff in own.into_iter().chain(inherited) {
            lines.push(format!(
                "\t{}{}{} {}",
                inversion_label(eff.assoc.invert),
                blocking_label(eff.assoc.blocking),
                inherited_label(eff.inherited),
                eff.assoc.ruleset_name
            ));
        }
        if let Some(special) = self.special_ruleset(node, ruletype) {
            if !special.rule_assocs.is_empty() {
                lines.push("Special Rules:".to_string());
            }
            for ra in &special.rule_assocs {
                if let Some(rule) = self.rules.get(&ra.rule_id) {
                    lines.push(format!("\t{}", format_rule_assoc(ra, rule)));
                }
            }
        }
        lines
    }

    /// Drop links and special rulesets of a deleted node.
    pub fn forget_node(&mut self, node: NodeId) {
        self.node_rulesets.remove(&node);
        for ruletype in RuleType::ALL {
            if let Some(special) = self.rulesets.remove(&Self::special_ruleset_name(node, ruletype)) {
                for ra in special.rule_assocs {
                    let still_used = self
                        .rulesets
                        .values()
                        .any(|rs| rs.rule_assocs.iter().any(|r| r.rule_id == ra.rule_id));
                    if !still_used {
                        self.rules.remove(&ra.rule_id);
                    }
                }
            }
        }
    }
}

fn inversion_label(invert: bool) -> &'static str {
    if invert {
        "(-)"
    } else {
        ""
    }
}

fn blocking_label(blocking: bool) -> &'static str {
    if blocking {
        "(blocking)"
    } else {
        ""
    }
}

fn inherited_label(inherited: bool) -> &'static str {
    if inherited {
        "(inherited)"
    } else {
        ""
    }
}

fn join_or_dash<T: ToString>(items: Option<&Vec<T>>) -> String {
    match items {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        _ => "-".to_string(),
    }
}

pub fn format_rule_assoc(assoc: &RuleAssoc, rule: &AccessRule) -> String {
    format!(
        "{}{} groups:{} {} subnets:{} {} dateranges:{} {}",
        inversion_label(assoc.invert),
        blocking_label(assoc.blocking),
        inversion_label(rule.invert_group),
        join_or_dash(rule.group_ids.as_ref()),
        inversion_label(rule.invert_subnet),
        join_or_dash(rule.subnets.as_ref()),
        inversion_label(rule.invert_date),
        join_or_dash(rule.dateranges.as_ref()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    struct Fixture {
        store: NodeStore,
        acl: AccessControl,
        root: NodeId,
        collection: NodeId,
        item: NodeId,
        staff: GroupId,
    }

    /// root -> collection -> item; root readable by everyone.
    fn fixture() -> Fixture {
        let mut store = NodeStore::new();
        let root = store.create_root("root").unwrap();
        let collection = store.create_node("collection", "c").unwrap();
        let item = store.create_node("image", "i").unwrap();
        store.link(root, collection).unwrap();
        store.link(collection, item).unwrap();

        let mut acl = AccessControl::new();
        acl.create_ruleset("everybody", None).unwrap();
        let everybody = acl.add_rule(AccessRule::default());
        acl.add_rule_to_ruleset("everybody", everybody, false, false)
            .unwrap();
        acl.link_ruleset(&store, root, "everybody", RuleType::Read, false, false)
            .unwrap();

        Fixture {
            store,
            acl,
            root,
            collection,
            item,
            staff: Ulid::new(),
        }
    }

    fn ctx(groups: Vec<GroupId>) -> AccessContext {
        AccessContext {
            group_ids: groups,
            is_admin: false,
            ip: None,
            date: date(2024, 5, 1),
        }
    }

    #[test]
    fn subnet_matching() {
        let net: Subnet = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.20.30.40".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));
        let host: Subnet = "192.168.1.5".parse().unwrap();
        assert_eq!(host.to_string(), "192.168.1.5/32");
        let v6: Subnet = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains("2001:db8::1".parse().unwrap()));
        let any: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("8.8.8.8".parse().unwrap()));
        assert!("10.0.0.0/33".parse::<Subnet>().is_err());
        assert!("nonsense".parse::<Subnet>().is_err());
    }

    #[test]
    fn subnet_serializes_as_cidr_string() {
        let subnet: Subnet = "192.168.10.0/24".parse().unwrap();
        let json = serde_json::to_string(&subnet).unwrap();
        assert_eq!(json, "\"192.168.10.0/24\"");
        let back: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subnet);

        let host: Subnet = serde_json::from_str("\"2001:db8::1\"").unwrap();
        assert_eq!(host.to_string(), "2001:db8::1/128");
        assert!(serde_json::from_str::<Subnet>("\"10.0.0.0/33\"").is_err());
    }

    #[test]
    fn date_range_bounds_are_inclusive() {
        let range = DateRange {
            start: Some(date(2024, 1, 1)),
            end: Some(date(2024, 12, 31)),
        };
        assert!(range.contains(date(2024, 1, 1)));
        assert!(range.contains(date(2024, 12, 31)));
        assert!(!range.contains(date(2023, 12, 31)));
        assert!(!range.contains(date(2025, 1, 1)));

        let open_start = DateRange {
            start: None,
            end: Some(date(2024, 6, 30)),
        };
        assert!(open_start.contains(date(1900, 1, 1)));
        assert!(!open_start.contains(date(2024, 7, 1)));
    }

    #[test]
    fn rule_predicates_with_inversion() {
        let staff = Ulid::new();
        let mut rule = AccessRule::for_groups([staff]);
        assert!(rule.matches(&ctx(vec![staff])));
        assert!(!rule.matches(&ctx(vec![])));
        rule.invert_group = true;
        assert!(!rule.matches(&ctx(vec![staff])));
        assert!(rule.matches(&ctx(vec![])));

        let mut dated = AccessRule::for_dates([DateRange {
            start: Some(date(2024, 1, 1)),
            end: None,
        }]);
        assert!(dated.matches(&ctx(vec![])));
        dated.invert_date = true;
        assert!(!dated.matches(&ctx(vec![])));

        let subnet = AccessRule::for_subnets(["10.0.0.0/8".parse().unwrap()]);
        assert!(!subnet.matches(&ctx(vec![])));
        let mut inside = ctx(vec![]);
        inside.ip = Some("10.1.1.1".parse().unwrap());
        assert!(subnet.matches(&inside));
    }

    #[test]
    fn inherits_from_ancestors() {
        let f = fixture();
        assert!(f.acl.has_access(&f.store, f.item, RuleType::Read, &ctx(vec![])).unwrap());
        assert!(!f.acl.has_access(&f.store, f.item, RuleType::Write, &ctx(vec![])).unwrap());
        let eff = f.acl.effective_ruleset_assocs(&f.store, f.item, RuleType::Read);
        assert_eq!(eff.len(), 1);
        assert!(eff[0].inherited);
        assert_eq!(eff[0].source, f.root);
    }

    #[test]
    fn own_rules_override_inherited() {
        let mut f = fixture();
        f.acl
            .add_node_rule(
                &f.store,
                f.collection,
                RuleType::Read,
                AccessRule::for_groups([f.staff]),
                false,
                false,
            )
            .unwrap();
        assert!(!f.acl.has_access(&f.store, f.item, RuleType::Read, &ctx(vec![])).unwrap());
        assert!(f
            .acl
            .has_access(&f.store, f.item, RuleType::Read, &ctx(vec![f.staff]))
            .unwrap());
        assert!(f.acl.has_access(&f.store, f.root, RuleType::Read, &ctx(vec![])).unwrap());
    }

    #[test]
    fn blocking_rule_denies_when_it_applies() {
        let mut f = fixture();
        f.acl.create_ruleset("public_no_staff", None).unwrap();
        let everybody = f.acl.add_rule(AccessRule::default());
        let staff_rule = f.acl.add_rule(AccessRule::for_groups([f.staff]));
        f.acl
            .add_rule_to_ruleset("public_no_staff", everybody, false, false)
            .unwrap();
        f.acl
            .add_rule_to_ruleset("public_no_staff", staff_rule, false, true)
            .unwrap();
        f.acl
            .link_ruleset(&f.store, f.item, "public_no_staff", RuleType::Read, false, false)
            .unwrap();

        assert!(f.acl.has_access(&f.store, f.item, RuleType::Read, &ctx(vec![])).unwrap());
        assert!(!f
            .acl
            .has_access(&f.store, f.item, RuleType::Read, &ctx(vec![f.staff]))
            .unwrap());
    }

    #[test]
    fn inverted_ruleset_link_flips_rules() {
        let mut f = fixture();
        f.acl.create_ruleset("staff", None).unwrap();
        let staff_rule = f.acl.add_rule(AccessRule::for_groups([f.staff]));
        f.acl
            .add_rule_to_ruleset("staff", staff_rule, false, false)
            .unwrap();
        f.acl
            .link_ruleset(&f.store, f.item, "staff", RuleType::Data, true, false)
            .unwrap();

        assert!(f.acl.has_access(&f.store, f.item, RuleType::Data, &ctx(vec![])).unwrap());
        assert!(!f
            .acl
            .has_access(&f.store, f.item, RuleType::Data, &ctx(vec![f.staff]))
            .unwrap());
    }

    #[test]
    fn admin_bypasses_rules() {
        let f = fixture();
        let mut admin = ctx(vec![]);
        admin.is_admin = true;
        assert!(f.acl.has_access(&f.store, f.item, RuleType::Write, &admin).unwrap());
    }

    #[test]
    fn unions_rulesets_of_multiple_parents() {
        let mut f = fixture();
        let other = f.store.create_node("collection", "other").unwrap();
        f.store.link(f.root, other).unwrap();
        f.store.link(other, f.item).unwrap();
        f.acl.create_ruleset("staff", None).unwrap();
        let staff_rule = f.acl.add_rule(AccessRule::for_groups([f.staff]));
        f.acl
            .add_rule_to_ruleset("staff", staff_rule, false, false)
            .unwrap();
        f.acl
            .link_ruleset(&f.store, other, "staff", RuleType::Write, false, false)
            .unwrap();
        f.acl
            .link_ruleset(&f.store, f.collection, "staff", RuleType::Write, false, false)
            .unwrap();

        let eff = f.acl.effective_ruleset_assocs(&f.store, f.item, RuleType::Write);
        assert_eq!(eff.len(), 1);
        assert!(f
            .acl
            .has_access(&f.store, f.item, RuleType::Write, &ctx(vec![f.staff]))
            .unwrap());
    }

    #[test]
    fn link_twice_is_ignored_and_unlink_reports() {
        let mut f = fixture();
        assert!(!f
            .acl
            .link_ruleset(&f.store, f.root, "everybody", RuleType::Read, true, false)
            .unwrap());
        assert!(!f.acl.unlink_ruleset(f.item, "everybody", RuleType::Read));
        let err = f.acl.remove_ruleset("everybody").unwrap_err();
        assert!(matches!(err, AccessError::RulesetInUse { nodes: 1, .. }));
        assert!(f.acl.unlink_ruleset(f.root, "everybody", RuleType::Read));
        f.acl.remove_ruleset("everybody").unwrap();
        assert!(!f.acl.has_access(&f.store, f.item, RuleType::Read, &ctx(vec![])).unwrap());
    }

    #[test]
    fn describe_lists_labels() {
        let mut f = fixture();
        f.acl
            .add_node_rule(
                &f.store,
                f.collection,
                RuleType::Read,
                AccessRule::for_groups([f.staff]),
                true,
                true,
            )
            .unwrap();
        f.acl
            .link_ruleset(&f.store, f.collection, "everybody", RuleType::Read, false, false)
            .unwrap();
        let lines = f.acl.describe_rules(&f.store, f.item, RuleType::Read);
        assert_eq!(lines[0], "Rulesets:");
        assert!(lines.iter().any(|l| l == "\t(inherited) everybody"));
        let own = f.acl.describe_rules(&f.store, f.collection, RuleType::Read);
        assert!(own.iter().any(|l| l == "Special Rules:"));
        assert!(own.iter().any(|l| l.starts_with("\t(-)(blocking) groups: ")));
    }

    #[test]
    fn forget_node_removes_special_ruleset() {
        let mut f = fixture();
        let rule = f
            .acl
            .add_node_rule(
                &f.store,
                f.item,
                RuleType::Write,
                AccessRule::default(),
                false,
                false,
            )
            .unwrap();
        f.acl.forget_node(f.item);
        assert!(f.acl.special_ruleset(f.item, RuleType::Write).is_none());
        assert!(f.acl.rule(rule).is_err());
    }
}
