use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{Metric, MetricCatalog};
use crate::gateway::{self, GroupPayload};
use crate::index::{IndexBuilder, MembershipIndex};
use crate::matcher::PatternCache;
use crate::metrics::EngineMetrics;
use crate::registry::{Group, GroupId, GroupRegistry, RegistryError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no group name is being edited")]
    NotEditing,
    #[error("metric `{0}` is not in the catalog")]
    UnknownMetric(String),
}

/// Display mode of a group row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowMode {
    Idle,
    EditingName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NameEdit {
    group: GroupId,
    draft: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum BucketKind {
    Manual,
    Rule(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewBucket {
    pub kind: BucketKind,
    pub metrics: Vec<Metric>,
}

/// Members of one group split by origin: the manual bucket first, then one
/// bucket per rule in rule order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewList {
    pub group: String,
    pub buckets: Vec<PreviewBucket>,
}

impl PreviewList {
    pub fn manual(&self) -> &[Metric] {
        self.buckets
            .first()
            .map(|b| b.metrics.as_slice())
            .unwrap_or_default()
    }

    pub fn rule(&self, pattern: &str) -> Option<&[Metric]> {
        self.buckets.iter().find_map(|b| match &b.kind {
            BucketKind::Rule(p) if p == pattern => Some(b.metrics.as_slice()),
            _ => None,
        })
    }
}

/// Outcome of [`GroupEditorSession::bulk_set_groups_for_metric`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl GroupChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Entry of the manual-selection list for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualCandidate {
    pub metric: Metric,
    pub checked: bool,
    /// Rule of the group that already matches this metric, if any.
    pub locked_by_rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub manual_count: usize,
    pub rules: Vec<String>,
    pub rule_match_count: usize,
    pub resolved_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulePreview {
    pub pattern: String,
    pub valid: bool,
    pub metrics: Vec<String>,
}

/// Handle returned by [`GroupEditorSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn Fn(&MembershipIndex) + Send + Sync>;

/// Interactive editing over one fetched snapshot of catalog and groups.
///
/// Every successful mutation bumps [`GroupEditorSession::revision`], rebuilds
/// the membership index and notifies observers. Failed validation leaves all
/// state untouched.
pub struct GroupEditorSession {
    catalog: MetricCatalog,
    registry: GroupRegistry,
    builder: IndexBuilder,
    index: MembershipIndex,
    name_edit: Option<NameEdit>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
    revision: u64,
    metrics: Option<EngineMetrics>,
}

impl std::fmt::Debug for GroupEditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupEditorSession")
            .field("metrics", &self.catalog.len())
            .field("groups", &self.registry.len())
            .field("revision", &self.revision)
            .field("name_edit", &self.name_edit)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl GroupEditorSession {
    pub fn new(catalog: MetricCatalog, registry: GroupRegistry) -> Self {
        let mut builder = IndexBuilder::new();
        let index = builder.rebuild(&catalog, &registry);
        Self {
            catalog,
            registry,
            builder,
            index,
            name_edit: None,
            observers: Vec::new(),
            next_observer: 0,
            revision: 0,
            metrics: None,
        }
    }

    /// Build a session from fetched backend payloads.
    pub fn from_payloads(
        catalog: MetricCatalog,
        groups: Vec<GroupPayload>,
    ) -> Result<Self, SessionError> {
        let registry = gateway::registry_from_payloads(groups)?;
        Ok(Self::new(catalog, registry))
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        if let Some(elapsed) = self.builder.last_elapsed() {
            metrics.observe_rebuild(&self.index, elapsed);
        }
        self.metrics = Some(metrics);
        self
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn index(&self) -> &MembershipIndex {
        &self.index
    }

    /// Content revision; bumped by every successful mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Register a callback invoked with the fresh index after every rebuild.
    pub fn subscribe<F>(&mut self, observer: F) -> ObserverId
    where
        F: Fn(&MembershipIndex) + Send + Sync + 'static,
    {
        self.next_observer += 1;
        let id = ObserverId(self.next_observer);
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    /// Swap in a new catalog revision and rebuild.
    pub fn replace_catalog(&mut self, catalog: MetricCatalog) {
        self.catalog = catalog;
        self.rebuild();
    }

    // ---- preview ---------------------------------------------------------

    pub fn select_group(&self, name: &str) -> Result<PreviewList, SessionError> {
        let group = self.group(name)?;

        // Manual names missing from the catalog have nothing to display.
        let manual = group
            .manual_list()
            .iter()
            .filter_map(|m| self.catalog.get(m).cloned())
            .collect();

        let mut buckets = vec![PreviewBucket {
            kind: BucketKind::Manual,
            metrics: manual,
        }];
        let mut seen = HashSet::new();
        for pattern in group.rules() {
            if !seen.insert(pattern.as_str()) {
                continue;
            }
            let metrics = match self.index.rule_matches(pattern) {
                Some(hits) => self
                    .catalog
                    .iter()
                    .filter(|m| hits.contains(&m.name))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            buckets.push(PreviewBucket {
                kind: BucketKind::Rule(pattern.clone()),
                metrics,
            });
        }

        Ok(PreviewList {
            group: group.name().to_string(),
            buckets,
        })
    }

    pub fn group_summaries(&self) -> Vec<GroupSummary> {
        self.registry
            .iter()
            .map(|group| GroupSummary {
                name: group.name().to_string(),
                manual_count: group.manual_list().len(),
                rules: group.rules().to_vec(),
                rule_match_count: self.index.rule_match_count(group.name()),
                resolved_count: self
                    .index
                    .resolved_members(group.name())
                    .map_or(0, |members| members.len()),
            })
            .collect()
    }

    /// Catalog entries for the manual-selection list of a group, filtered by
    /// `query` (see [`MetricCatalog::search`]).
    pub fn manual_candidates(
        &self,
        group: &str,
        query: &str,
    ) -> Result<Vec<ManualCandidate>, SessionError> {
        let group = self.group(group)?;
        let rule_of = self.index.rule_of_metrics(group.name());
        Ok(self
            .catalog
            .search(query)
            .into_iter()
            .map(|metric| ManualCandidate {
                checked: group.has_manual(&metric.name),
                locked_by_rule: rule_of.get(metric.name.as_str()).map(|r| r.to_string()),
                metric: metric.clone(),
            })
            .collect())
    }

    /// What a candidate rule list would match, without touching any group.
    pub fn preview_rules<I, S>(&self, patterns: I) -> Vec<RulePreview>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cache = PatternCache::new();
        patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                let metrics = match cache.get(pattern) {
                    Some(regex) => self
                        .catalog
                        .names()
                        .filter(|name| regex.is_match(name))
                        .map(str::to_string)
                        .collect(),
                    None => Vec::new(),
                };
                RulePreview {
                    pattern: pattern.to_string(),
                    valid: cache.is_valid(pattern),
                    metrics,
                }
            })
            .collect()
    }

    // ---- group lifecycle -------------------------------------------------

    pub fn add_group(&mut self, name: &str) -> Result<GroupId, SessionError> {
        let id = self.registry.add_group(name)?;
        // A new group row takes focus away from any name edit.
        self.name_edit = None;
        info!(group = %name.trim(), "group added");
        self.commit();
        Ok(id)
    }

    pub fn rename_group(&mut self, name: &str, new_name: &str) -> Result<(), SessionError> {
        let id = self.group_id(name)?;
        self.registry.rename_group(id, new_name)?;
        self.commit();
        Ok(())
    }

    pub fn delete_group(&mut self, name: &str) -> Result<(), SessionError> {
        let id = self.group_id(name)?;
        self.delete_group_by_id(id);
        Ok(())
    }

    /// Delete by handle, which survives renames. Returns `false` if the group
    /// is already gone.
    pub fn delete_group_by_id(&mut self, id: GroupId) -> bool {
        let Some(removed) = self.registry.delete_group(id) else {
            return false;
        };
        if self.name_edit.as_ref().is_some_and(|edit| edit.group == id) {
            self.name_edit = None;
        }
        info!(group = removed.name(), "group deleted");
        self.commit();
        true
    }

    /// Reorder groups by name. Names not listed keep their relative order
    /// after the listed ones; unknown names are ignored.
    pub fn reorder_groups<S: AsRef<str>>(&mut self, new_order: &[S]) -> Vec<String> {
        let ids: Vec<GroupId> = new_order
            .iter()
            .filter_map(|name| self.registry.id_of(name.as_ref()))
            .collect();
        self.registry.reorder(&ids);
        self.commit();
        self.registry.names()
    }

    /// Replace a group's manual list wholesale.
    pub fn set_manual_list<I, S>(&mut self, group: &str, metric_names: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.group_id(group)?;
        self.registry.set_manual_list(id, metric_names)?;
        self.commit();
        Ok(())
    }

    /// Replace a group's rule list wholesale.
    pub fn set_rules<I, S>(&mut self, group: &str, patterns: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.group_id(group)?;
        self.registry.set_rules(id, patterns)?;
        self.commit();
        Ok(())
    }

    // ---- manual membership -----------------------------------------------

    /// Add or remove `metric` from the group's manual list. Removal only
    /// touches the manual component; a matching rule keeps the metric a member.
    pub fn toggle_metric_manual_membership(
        &mut self,
        group: &str,
        metric: &str,
        included: bool,
    ) -> Result<(), SessionError> {
        let g = self.group(group)?;
        let id = g.id();
        let present = g.has_manual(metric);
        if present == included {
            return Ok(());
        }

        let mut manual = g.manual_list().to_vec();
        if included {
            manual.push(metric.to_string());
        } else {
            manual.retain(|m| m != metric);
        }
        self.registry.set_manual_list(id, manual)?;
        self.commit();
        Ok(())
    }

    /// Merge `metrics` into a group's manual list, keeping existing order.
    pub fn batch_add_to_group<I, S>(&mut self, group: &str, metrics: I) -> Result<usize, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let g = self.group(group)?;
        let id = g.id();
        let mut manual = g.manual_list().to_vec();
        let before = manual.len();
        for metric in metrics {
            let metric = metric.into();
            if !manual.contains(&metric) {
                manual.push(metric);
            }
        }
        let added = manual.len() - before;
        if added > 0 {
            self.registry.set_manual_list(id, manual)?;
            self.commit();
        }
        Ok(added)
    }

    /// Set the groups a metric is manually assigned to, from the metric's own
    /// row. Groups where the metric is present only through rule matching are
    /// left untouched in both directions.
    pub fn bulk_set_groups_for_metric<I, S>(
        &mut self,
        metric: &str,
        desired_groups: I,
    ) -> Result<GroupChanges, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.catalog.contains(metric) {
            return Err(SessionError::UnknownMetric(metric.to_string()));
        }
        let mut desired = HashSet::new();
        for name in desired_groups {
            let name = name.as_ref();
            self.group(name)?;
            desired.insert(name.to_string());
        }

        let mut changes = GroupChanges::default();
        let mut updates = Vec::new();
        for group in self.registry.iter() {
            let membership = self.index.membership(metric, group.name());
            if membership.is_some_and(|m| m.is_rule_only()) {
                continue;
            }
            let manual_now = group.has_manual(metric);
            let wanted = desired.contains(group.name());
            if wanted && !manual_now {
                let mut manual = group.manual_list().to_vec();
                manual.push(metric.to_string());
                updates.push((group.id(), manual));
                changes.added.push(group.name().to_string());
            } else if !wanted && manual_now {
                let manual: Vec<String> = group
                    .manual_list()
                    .iter()
                    .filter(|m| *m != metric)
                    .cloned()
                    .collect();
                updates.push((group.id(), manual));
                changes.removed.push(group.name().to_string());
            }
        }

        if changes.is_empty() {
            return Ok(changes);
        }
        for (id, manual) in updates {
            self.registry.set_manual_list(id, manual)?;
        }
        debug!(metric, added = ?changes.added, removed = ?changes.removed, "metric groups updated");
        self.commit();
        Ok(changes)
    }

    // ---- rules -----------------------------------------------------------

    /// Append `new_pattern`, or replace `old_pattern` with it in place.
    /// The new text must be non-blank and not already present in the group.
    pub fn add_or_update_rule(
        &mut self,
        group: &str,
        old_pattern: Option<&str>,
        new_pattern: &str,
    ) -> Result<(), SessionError> {
        let g = self.group(group)?;
        let id = g.id();
        if new_pattern.trim().is_empty() {
            return Err(RegistryError::EmptyRule(g.name().to_string()).into());
        }

        let mut rules = g.rules().to_vec();
        match old_pattern {
            Some(old) if old == new_pattern => {
                if !g.has_rule(old) {
                    return Err(unknown_rule(g, old));
                }
                return Ok(());
            }
            Some(old) => {
                let pos = rules
                    .iter()
                    .position(|r| r == old)
                    .ok_or_else(|| unknown_rule(g, old))?;
                if g.has_rule(new_pattern) {
                    return Err(duplicate_rule(g, new_pattern));
                }
                rules[pos] = new_pattern.to_string();
            }
            None => {
                if g.has_rule(new_pattern) {
                    return Err(duplicate_rule(g, new_pattern));
                }
                rules.push(new_pattern.to_string());
            }
        }

        self.registry.set_rules(id, rules)?;
        self.commit();
        Ok(())
    }

    /// Remove a rule. Returns `false` if the group has no such rule.
    pub fn remove_rule(&mut self, group: &str, pattern: &str) -> Result<bool, SessionError> {
        let g = self.group(group)?;
        let id = g.id();
        if !g.has_rule(pattern) {
            return Ok(false);
        }
        let rules: Vec<String> = g.rules().iter().filter(|r| *r != pattern).cloned().collect();
        self.registry.set_rules(id, rules)?;
        self.commit();
        Ok(true)
    }

    // ---- name editing ----------------------------------------------------

    pub fn row_mode(&self, group: &str) -> RowMode {
        match (&self.name_edit, self.registry.id_of(group)) {
            (Some(edit), Some(id)) if edit.group == id => RowMode::EditingName,
            _ => RowMode::Idle,
        }
    }

    /// Group currently in name-edit mode, if any.
    pub fn editing_group(&self) -> Option<&str> {
        let edit = self.name_edit.as_ref()?;
        self.registry.get(edit.group).map(Group::name)
    }

    pub fn name_draft(&self) -> Option<&str> {
        self.name_edit.as_ref().map(|edit| edit.draft.as_str())
    }

    /// Enter name-edit mode for `group`, leaving it on any other row. The draft
    /// starts from the committed name.
    pub fn begin_name_edit(&mut self, group: &str) -> Result<(), SessionError> {
        let g = self.group(group)?;
        self.name_edit = Some(NameEdit {
            group: g.id(),
            draft: g.name().to_string(),
        });
        Ok(())
    }

    pub fn set_name_draft(&mut self, draft: &str) -> Result<(), SessionError> {
        let edit = self.name_edit.as_mut().ok_or(SessionError::NotEditing)?;
        edit.draft = draft.to_string();
        Ok(())
    }

    /// Validate and apply the draft. On failure the row stays in edit mode with
    /// the draft intact so the error can be shown next to it.
    pub fn confirm_name_edit(&mut self) -> Result<(), SessionError> {
        let edit = self.name_edit.clone().ok_or(SessionError::NotEditing)?;
        self.registry.rename_group(edit.group, &edit.draft)?;
        self.name_edit = None;
        self.commit();
        Ok(())
    }

    /// Leave edit mode, discarding the draft.
    pub fn cancel_name_edit(&mut self) -> Result<(), SessionError> {
        self.name_edit.take().map(|_| ()).ok_or(SessionError::NotEditing)
    }

    // ---- persistence snapshots -------------------------------------------

    /// Complete, validated snapshot of every group for a full save.
    pub fn save_payload(&self) -> Result<Vec<GroupPayload>, RegistryError> {
        self.registry.validate_for_save()?;
        Ok(gateway::snapshot(&self.registry))
    }

    /// Validated snapshot of a single group for the incremental upsert.
    pub fn group_payload(&self, name: &str) -> Result<GroupPayload, RegistryError> {
        let group = self
            .registry
            .get_by_name(name)
            .ok_or_else(|| RegistryError::UnknownGroup(name.to_string()))?;
        if group.rules().iter().any(|r| r.trim().is_empty()) {
            return Err(RegistryError::EmptyRule(group.name().to_string()));
        }
        Ok(GroupPayload::from(group))
    }

    // ---- internals -------------------------------------------------------

    fn group(&self, name: &str) -> Result<&Group, SessionError> {
        self.registry
            .get_by_name(name)
            .ok_or_else(|| RegistryError::UnknownGroup(name.to_string()).into())
    }

    fn group_id(&self, name: &str) -> Result<GroupId, SessionError> {
        self.group(name).map(Group::id)
    }

    fn commit(&mut self) {
        self.revision += 1;
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.index = self.builder.rebuild(&self.catalog, &self.registry);
        if let (Some(metrics), Some(elapsed)) = (&self.metrics, self.builder.last_elapsed()) {
            metrics.observe_rebuild(&self.index, elapsed);
        }
        for (_, observer) in &self.observers {
            observer(&self.index);
        }
    }
}

fn unknown_rule(group: &Group, pattern: &str) -> SessionError {
    RegistryError::UnknownRule {
        group: group.name().to_string(),
        pattern: pattern.to_string(),
    }
    .into()
}

fn duplicate_rule(group: &Group, pattern: &str) -> SessionError {
    RegistryError::DuplicateRule {
        group: group.name().to_string(),
        pattern: pattern.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::index::Provenance;

    fn session() -> GroupEditorSession {
        let catalog = MetricCatalog::new(vec![
            Metric::new("cpu_usage").with_description("CPU busy ratio"),
            Metric::new("cpu_idle"),
            Metric::new("mem_used_bytes").with_description("Resident memory"),
            Metric::new("go_requests_total"),
        ]);
        let mut session = GroupEditorSession::new(catalog, GroupRegistry::new());
        session.add_group("A").expect("add A");
        session
            .add_or_update_rule("A", None, "cpu_.*")
            .expect("rule");
        session
    }

    #[test]
    fn removing_absent_manual_membership_keeps_rule_member() {
        let mut session = session();
        session
            .toggle_metric_manual_membership("A", "cpu_usage", false)
            .expect("toggle");

        let union = session.index().resolved_members("A").expect("group");
        assert!(union.contains("cpu_usage"));
        let membership = session.index().membership("cpu_usage", "A").expect("member");
        assert_eq!(membership.provenance(), vec![Provenance::Rule]);
    }

    #[test]
    fn toggle_adds_and_removes_manual_component_only() {
        let mut session = session();
        session
            .toggle_metric_manual_membership("A", "cpu_usage", true)
            .expect("add");
        assert_eq!(
            session.index().membership("cpu_usage", "A").expect("member").provenance(),
            vec![Provenance::Manual, Provenance::Rule]
        );

        session
            .toggle_metric_manual_membership("A", "cpu_usage", false)
            .expect("remove");
        assert!(session.index().membership("cpu_usage", "A").expect("member").is_rule_only());

        session
            .toggle_metric_manual_membership("A", "mem_used_bytes", true)
            .expect("add");
        session
            .toggle_metric_manual_membership("A", "mem_used_bytes", false)
            .expect("remove");
        assert!(session.index().membership("mem_used_bytes", "A").is_none());
    }

    #[test]
    fn redundant_toggle_does_not_bump_revision() {
        let mut session = session();
        let revision = session.revision();
        session
            .toggle_metric_manual_membership("A", "cpu_usage", false)
            .expect("noop");
        assert_eq!(session.revision(), revision);
    }

    #[test]
    fn preview_lists_manual_bucket_first_then_rules_in_order() {
        let mut session = session();
        session.add_or_update_rule("A", None, "_bytes$").expect("rule");
        session
            .set_manual_list("A", ["go_requests_total", "not_in_catalog"])
            .expect("manual");

        let preview = session.select_group("A").expect("preview");
        assert_eq!(preview.buckets.len(), 3);
        assert_eq!(preview.buckets[0].kind, BucketKind::Manual);
        let manual: Vec<_> = preview.manual().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(manual, vec!["go_requests_total"]);

        let cpu: Vec<_> = preview
            .rule("cpu_.*")
            .expect("bucket")
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(cpu, vec!["cpu_usage", "cpu_idle"]);
        assert_eq!(preview.buckets[2].kind, BucketKind::Rule("_bytes$".into()));
        assert_eq!(
            preview.rule("cpu_.*").expect("bucket")[0].description(),
            Some("CPU busy ratio")
        );

        // Unknown catalog names are still members, just not displayable.
        assert!(session.index().resolved_members("A").expect("group").contains("not_in_catalog"));
    }

    #[test]
    fn select_unknown_group_is_an_error() {
        let session = session();
        assert_eq!(
            session.select_group("missing"),
            Err(SessionError::Registry(RegistryError::UnknownGroup("missing".into())))
        );
    }

    #[test]
    fn duplicate_rule_is_rejected_before_mutation() {
        let mut session = session();
        let revision = session.revision();
        let err = session.add_or_update_rule("A", None, "cpu_.*").unwrap_err();
        assert_eq!(
            err,
            SessionError::Registry(RegistryError::DuplicateRule {
                group: "A".into(),
                pattern: "cpu_.*".into(),
            })
        );
        assert_eq!(session.revision(), revision);
        assert_eq!(session.registry().get_by_name("A").unwrap().rules(), ["cpu_.*"]);
    }

    #[test]
    fn rule_update_replaces_in_place() {
        let mut session = session();
        session.add_or_update_rule("A", None, "^go_").expect("rule");
        session
            .add_or_update_rule("A", Some("cpu_.*"), "^mem_")
            .expect("update");
        assert_eq!(
            session.registry().get_by_name("A").unwrap().rules(),
            ["^mem_", "^go_"]
        );
        assert!(matches!(
            session.add_or_update_rule("A", Some("^mem_"), "^go_"),
            Err(SessionError::Registry(RegistryError::DuplicateRule { .. }))
        ));
        assert!(matches!(
            session.add_or_update_rule("A", Some("nope"), "x"),
            Err(SessionError::Registry(RegistryError::UnknownRule { .. }))
        ));
        assert!(matches!(
            session.add_or_update_rule("A", None, "   "),
            Err(SessionError::Registry(RegistryError::EmptyRule(_)))
        ));
        session
            .add_or_update_rule("A", Some("^go_"), "^go_")
            .expect("unchanged text is a no-op");
    }

    #[test]
    fn remove_rule_shrinks_membership() {
        let mut session = session();
        assert!(session.remove_rule("A", "cpu_.*").expect("remove"));
        assert!(!session.remove_rule("A", "cpu_.*").expect("already gone"));
        assert!(session.index().resolved_members("A").expect("group").is_empty());
        assert_eq!(session.index().ungrouped_count(), 4);
    }

    #[test]
    fn bulk_set_skips_rule_only_groups() {
        let mut session = session();
        session.add_group("B").expect("add B");
        session.add_group("C").expect("add C");
        session
            .toggle_metric_manual_membership("C", "cpu_usage", true)
            .expect("manual in C");

        // A matches cpu_usage by rule only; requesting nothing must not drop it.
        let changes = session
            .bulk_set_groups_for_metric("cpu_usage", ["B"])
            .expect("bulk");
        assert_eq!(changes.added, vec!["B"]);
        assert_eq!(changes.removed, vec!["C"]);

        let groups = session.index().groups_of("cpu_usage");
        assert!(groups.contains(&"A"));
        assert!(groups.contains(&"B"));
        assert!(!groups.contains(&"C"));
        assert!(!session.registry().get_by_name("A").unwrap().has_manual("cpu_usage"));
    }

    #[test]
    fn bulk_set_validates_before_mutating() {
        let mut session = session();
        session.add_group("B").expect("add B");
        let revision = session.revision();
        assert!(matches!(
            session.bulk_set_groups_for_metric("cpu_idle", ["B", "nope"]),
            Err(SessionError::Registry(RegistryError::UnknownGroup(_)))
        ));
        assert_eq!(
            session.bulk_set_groups_for_metric("nope", ["B"]),
            Err(SessionError::UnknownMetric("nope".into()))
        );
        assert_eq!(session.revision(), revision);
        assert!(session
            .bulk_set_groups_for_metric("cpu_idle", Vec::<String>::new())
            .expect("noop")
            .is_empty());
    }

    #[test]
    fn batch_add_merges_without_duplicates() {
        let mut session = session();
        session
            .set_manual_list("A", ["mem_used_bytes"])
            .expect("manual");
        let added = session
            .batch_add_to_group("A", ["go_requests_total", "mem_used_bytes", "go_requests_total"])
            .expect("batch");
        assert_eq!(added, 1);
        assert_eq!(
            session.registry().get_by_name("A").unwrap().manual_list(),
            ["mem_used_bytes", "go_requests_total"]
        );
    }

    #[test]
    fn name_edit_is_exclusive_and_cancel_reverts() {
        let mut session = session();
        session.add_group("B").expect("add B");

        session.begin_name_edit("A").expect("edit A");
        assert_eq!(session.row_mode("A"), RowMode::EditingName);
        session.begin_name_edit("B").expect("edit B");
        assert_eq!(session.row_mode("A"), RowMode::Idle);
        assert_eq!(session.row_mode("B"), RowMode::EditingName);

        session.set_name_draft("renamed").expect("draft");
        session.cancel_name_edit().expect("cancel");
        assert_eq!(session.row_mode("B"), RowMode::Idle);
        assert!(session.registry().get_by_name("B").is_some());
        assert_eq!(session.cancel_name_edit(), Err(SessionError::NotEditing));
    }

    #[test]
    fn failed_confirm_stays_in_edit_mode() {
        let mut session = session();
        session.add_group("B").expect("add B");
        session.begin_name_edit("B").expect("edit");
        session.set_name_draft("A").expect("draft");
        assert_eq!(
            session.confirm_name_edit(),
            Err(SessionError::Registry(RegistryError::NameConflict("A".into())))
        );
        assert_eq!(session.row_mode("B"), RowMode::EditingName);
        assert_eq!(session.name_draft(), Some("A"));

        session.set_name_draft("B_2").expect("draft");
        session.confirm_name_edit().expect("confirm");
        assert_eq!(session.row_mode("B_2"), RowMode::Idle);
        assert!(session.editing_group().is_none());
        assert!(session.index().group("B_2").is_some());
        assert!(session.index().group("B").is_none());
    }

    #[test]
    fn deleting_edited_group_clears_edit_mode() {
        let mut session = session();
        session.begin_name_edit("A").expect("edit");
        session.delete_group("A").expect("delete");
        assert!(session.editing_group().is_none());
        assert!(session.index().group("A").is_none());
        assert_eq!(session.index().ungrouped_count(), 4);
    }

    #[test]
    fn delete_by_id_follows_renames() {
        let mut session = session();
        let id = session.registry().id_of("A").expect("id");
        session.rename_group("A", "cpu").expect("rename");

        assert!(session.delete_group_by_id(id));
        assert!(session.registry().is_empty());
        assert!(!session.delete_group_by_id(id));
    }

    #[test]
    fn observers_see_every_rebuild_until_unsubscribed() {
        let mut session = session();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = session.subscribe(move |index| {
            assert!(index.group("A").is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.add_or_update_rule("A", None, "^go_").expect("rule");
        session.set_manual_list("A", ["cpu_idle"]).expect("manual");
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(session.unsubscribe(id));
        session.remove_rule("A", "^go_").expect("remove");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn manual_candidates_flag_checked_and_rule_locked() {
        let mut session = session();
        session.set_manual_list("A", ["mem_used_bytes"]).expect("manual");
        let candidates = session.manual_candidates("A", "").expect("candidates");
        assert_eq!(candidates.len(), 4);

        let cpu = candidates.iter().find(|c| c.metric.name == "cpu_usage").unwrap();
        assert_eq!(cpu.locked_by_rule.as_deref(), Some("cpu_.*"));
        assert!(!cpu.checked);
        let mem = candidates.iter().find(|c| c.metric.name == "mem_used_bytes").unwrap();
        assert!(mem.checked);
        assert!(mem.locked_by_rule.is_none());

        let filtered = session.manual_candidates("A", "resident").expect("candidates");
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn rule_preview_does_not_mutate() {
        let session = session();
        let revision = session.revision();
        let preview = session.preview_rules(["^cpu", "(", "total"]);
        assert_eq!(preview[0].metrics, vec!["cpu_usage", "cpu_idle"]);
        assert!(!preview[1].valid);
        assert!(preview[1].metrics.is_empty());
        assert_eq!(preview[2].metrics, vec!["go_requests_total"]);
        assert_eq!(session.revision(), revision);
    }

    #[test]
    fn summaries_report_counts_per_group() {
        let mut session = session();
        session.set_manual_list("A", ["cpu_usage", "mem_used_bytes"]).expect("manual");
        let summaries = session.group_summaries();
        assert_eq!(
            summaries,
            vec![GroupSummary {
                name: "A".into(),
                manual_count: 2,
                rules: vec!["cpu_.*".into()],
                rule_match_count: 2,
                resolved_count: 3,
            }]
        );
    }

    #[test]
    fn save_payload_rejects_blank_rules() {
        let mut session = session();
        session.set_rules("A", ["cpu_.*", " "]).expect("rules");
        assert_eq!(
            session.save_payload(),
            Err(RegistryError::EmptyRule("A".into()))
        );
        assert!(session.group_payload("A").is_err());
    }
}
