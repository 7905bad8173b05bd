use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::catalog::MetricCatalog;
use crate::matcher::PatternCache;
use crate::registry::GroupRegistry;

/// Why a metric belongs to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Manual,
    Rule,
}

/// One group a metric belongs to, with every reason it is there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub group: String,
    pub manual: bool,
    /// Rule texts of the group that match the metric, in rule order.
    pub rules: Vec<String>,
}

impl Membership {
    pub fn provenance(&self) -> Vec<Provenance> {
        let mut kinds = Vec::with_capacity(2);
        if self.manual {
            kinds.push(Provenance::Manual);
        }
        if !self.rules.is_empty() {
            kinds.push(Provenance::Rule);
        }
        kinds
    }

    /// Present only through rule matching; cannot be removed by manual edits.
    pub fn is_rule_only(&self) -> bool {
        !self.manual && !self.rules.is_empty()
    }
}

/// Resolved members of a single group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupResolution {
    pub name: String,
    pub manual: BTreeSet<String>,
    pub matched: BTreeSet<String>,
    pub union: BTreeSet<String>,
}

/// Snapshot of group membership derived from a catalog and a registry.
///
/// Never patched in place: any registry or catalog change requires a fresh
/// [`IndexBuilder::rebuild`]. Use [`MembershipIndex::is_current`] to detect a
/// stale snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipIndex {
    registry_generation: u64,
    rule_matches: HashMap<String, BTreeSet<String>>,
    groups: Vec<GroupResolution>,
    group_positions: HashMap<String, usize>,
    metric_groups: BTreeMap<String, Vec<Membership>>,
    ungrouped: Vec<String>,
}

impl MembershipIndex {
    /// One-shot rebuild with a throwaway pattern cache.
    pub fn rebuild(catalog: &MetricCatalog, registry: &GroupRegistry) -> Self {
        IndexBuilder::new().rebuild(catalog, registry)
    }

    pub fn is_current(&self, registry: &GroupRegistry) -> bool {
        self.registry_generation == registry.generation()
    }

    /// Metrics matched by a rule pattern (empty for unknown or invalid patterns).
    pub fn rule_matches(&self, pattern: &str) -> Option<&BTreeSet<String>> {
        self.rule_matches.get(pattern)
    }

    pub fn groups(&self) -> &[GroupResolution] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&GroupResolution> {
        self.group_positions.get(name).map(|&idx| &self.groups[idx])
    }

    /// `manual ∪ matched` for a group.
    pub fn resolved_members(&self, group: &str) -> Option<&BTreeSet<String>> {
        self.group(group).map(|g| &g.union)
    }

    /// Number of distinct metrics matched by any rule of the group.
    pub fn rule_match_count(&self, group: &str) -> usize {
        self.group(group).map_or(0, |g| g.matched.len())
    }

    /// Memberships of a metric in registry order; empty if ungrouped.
    pub fn memberships(&self, metric: &str) -> &[Membership] {
        self.metric_groups
            .get(metric)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn membership(&self, metric: &str, group: &str) -> Option<&Membership> {
        self.memberships(metric).iter().find(|m| m.group == group)
    }

    pub fn groups_of(&self, metric: &str) -> Vec<&str> {
        self.memberships(metric)
            .iter()
            .map(|m| m.group.as_str())
            .collect()
    }

    /// For one group, the rule that produced each rule-matched metric. When
    /// several rules match, the later rule is reported.
    pub fn rule_of_metrics(&self, group: &str) -> HashMap<&str, &str> {
        let mut out = HashMap::new();
        for (metric, memberships) in &self.metric_groups {
            if let Some(rule) = memberships
                .iter()
                .find(|m| m.group == group)
                .and_then(|m| m.rules.last())
            {
                out.insert(metric.as_str(), rule.as_str());
            }
        }
        out
    }

    /// Catalog metrics that belong to no group, in catalog order.
    pub fn ungrouped(&self) -> &[String] {
        &self.ungrouped
    }

    pub fn ungrouped_count(&self) -> usize {
        self.ungrouped.len()
    }
}

/// Rebuilds [`MembershipIndex`] snapshots, keeping compiled patterns across
/// rebuilds for the lifetime of the builder.
#[derive(Debug, Default)]
pub struct IndexBuilder {
    cache: PatternCache,
    last_elapsed: Option<Duration>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &PatternCache {
        &self.cache
    }

    /// Wall time of the most recent rebuild.
    pub fn last_elapsed(&self) -> Option<Duration> {
        self.last_elapsed
    }

    pub fn rebuild(&mut self, catalog: &MetricCatalog, registry: &GroupRegistry) -> MembershipIndex {
        let start = Instant::now();

        // Per-rebuild memo: each distinct pattern scans the catalog once.
        let mut rule_matches: HashMap<String, BTreeSet<String>> = HashMap::new();
        for group in registry.iter() {
            for pattern in group.rules() {
                if rule_matches.contains_key(pattern) {
                    continue;
                }
                let matched = match self.cache.get(pattern) {
                    Some(regex) => catalog
                        .names()
                        .filter(|name| regex.is_match(name))
                        .map(str::to_string)
                        .collect(),
                    None => BTreeSet::new(),
                };
                rule_matches.insert(pattern.clone(), matched);
            }
        }

        let mut groups = Vec::with_capacity(registry.len());
        let mut group_positions = HashMap::with_capacity(registry.len());
        let mut metric_groups: BTreeMap<String, Vec<Membership>> = BTreeMap::new();

        for group in registry.iter() {
            let manual: BTreeSet<String> = group.manual_list().iter().cloned().collect();
            let mut matched = BTreeSet::new();
            for pattern in group.rules() {
                if let Some(hits) = rule_matches.get(pattern) {
                    matched.extend(hits.iter().cloned());
                }
            }
            let union: BTreeSet<String> = manual.union(&matched).cloned().collect();

            for metric in &union {
                let rules: Vec<String> = group
                    .rules()
                    .iter()
                    .filter(|p| rule_matches.get(*p).is_some_and(|hits| hits.contains(metric)))
                    .cloned()
                    .collect();
                let rules = dedup_rules(rules);
                metric_groups.entry(metric.clone()).or_default().push(Membership {
                    group: group.name().to_string(),
                    manual: manual.contains(metric),
                    rules,
                });
            }

            group_positions.insert(group.name().to_string(), groups.len());
            groups.push(GroupResolution {
                name: group.name().to_string(),
                manual,
                matched,
                union,
            });
        }

        let ungrouped = catalog
            .names()
            .filter(|name| !metric_groups.contains_key(*name))
            .map(str::to_string)
            .collect();

        self.cache
            .retain_patterns(registry.iter().flat_map(|g| g.rules().iter().map(String::as_str)));

        let elapsed = start.elapsed();
        self.last_elapsed = Some(elapsed);
        debug!(
            groups = groups.len(),
            metrics = catalog.len(),
            patterns = rule_matches.len(),
            elapsed = ?elapsed,
            "membership index rebuilt"
        );

        MembershipIndex {
            registry_generation: registry.generation(),
            rule_matches,
            groups,
            group_positions,
            metric_groups,
            ungrouped,
        }
    }
}

// A group may list the same pattern twice via `set_rules`; report it once.
fn dedup_rules(rules: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(rules.len());
    for rule in rules {
        if !out.contains(&rule) {
            out.push(rule);
        }
    }
    out
}
