use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Validation failures for group and rule edits. None of these mutate state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("group name `{0}` may only contain letters, digits, CJK ideographs, `_` or `-`")]
    InvalidCharset(String),
    #[error("group name `{0}` is already in use")]
    NameConflict(String),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("rule `{pattern}` already exists in group `{group}`")]
    DuplicateRule { group: String, pattern: String },
    #[error("rule `{pattern}` not found in group `{group}`")]
    UnknownRule { group: String, pattern: String },
    #[error("group `{0}` has an empty match rule")]
    EmptyRule(String),
}

/// Stable handle for a group within one registry; survives renames and reorders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupId(u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    id: GroupId,
    name: String,
    manual_list: Vec<String>,
    rules: Vec<String>,
}

impl Group {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manually assigned metric names in display (insertion) order.
    pub fn manual_list(&self) -> &[String] {
        &self.manual_list
    }

    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    pub fn has_manual(&self, metric: &str) -> bool {
        self.manual_list.iter().any(|m| m == metric)
    }

    pub fn has_rule(&self, pattern: &str) -> bool {
        self.rules.iter().any(|r| r == pattern)
    }
}

/// Accepts ASCII letters and digits, `_`, `-` and CJK unified ideographs
/// (U+4E00..=U+9FA5).
pub fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|ch| {
            ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ('\u{4E00}'..='\u{9FA5}').contains(&ch)
        })
}

fn dedup_preserving_order<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let item = item.into();
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Ordered, name-unique set of groups.
///
/// Every successful mutation bumps [`GroupRegistry::generation`]; a
/// `MembershipIndex` built from an older generation is stale and must be
/// rebuilt before it is trusted.
#[derive(Debug, Clone, Default)]
pub struct GroupRegistry {
    groups: Vec<Group>,
    next_id: u64,
    generation: u64,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load groups as fetched from the backend, preserving their order.
    ///
    /// Stored names are not charset-checked (they were accepted remotely), but
    /// duplicates are rejected since the name is the join key.
    pub fn from_parts<I>(groups: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (String, Vec<String>, Vec<String>)>,
    {
        let mut registry = Self::new();
        for (name, manual_list, rules) in groups {
            let name = name.trim().to_string();
            if registry.position_by_name(&name).is_some() {
                return Err(RegistryError::NameConflict(name));
            }
            let id = registry.allocate_id();
            registry.groups.push(Group {
                id,
                name,
                manual_list: dedup_preserving_order(manual_list),
                rules,
            });
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn id_of(&self, name: &str) -> Option<GroupId> {
        self.get_by_name(name).map(Group::id)
    }

    /// Create an empty group at the head of the list.
    pub fn add_group(&mut self, name: &str) -> Result<GroupId, RegistryError> {
        let name = self.validate_name(name, None)?;
        let id = self.allocate_id();
        self.groups.insert(
            0,
            Group {
                id,
                name,
                manual_list: Vec::new(),
                rules: Vec::new(),
            },
        );
        self.touch();
        Ok(id)
    }

    pub fn rename_group(&mut self, id: GroupId, new_name: &str) -> Result<(), RegistryError> {
        let pos = self.position(id)?;
        let new_name = self.validate_name(new_name, Some(id))?;
        self.groups[pos].name = new_name;
        self.touch();
        Ok(())
    }

    /// Remove a group. Returns the removed group, or `None` if the id is unknown.
    pub fn delete_group(&mut self, id: GroupId) -> Option<Group> {
        let pos = self.groups.iter().position(|g| g.id == id)?;
        let removed = self.groups.remove(pos);
        self.touch();
        Some(removed)
    }

    /// Apply a new display order. Ids listed in `new_order` come first, in that
    /// order; unknown ids are ignored and unlisted groups keep their relative
    /// order after the listed ones.
    pub fn reorder(&mut self, new_order: &[GroupId]) {
        let mut remaining = std::mem::take(&mut self.groups);
        let mut ordered = Vec::with_capacity(remaining.len());
        for id in new_order {
            if let Some(pos) = remaining.iter().position(|g| g.id == *id) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);
        self.groups = ordered;
        self.touch();
    }

    /// Replace the manual list wholesale. Duplicates are collapsed, first
    /// occurrence wins.
    pub fn set_manual_list<I, S>(&mut self, id: GroupId, metric_names: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pos = self.position(id)?;
        self.groups[pos].manual_list = dedup_preserving_order(metric_names);
        self.touch();
        Ok(())
    }

    /// Replace the rule list wholesale. Emptiness is checked at save time.
    pub fn set_rules<I, S>(&mut self, id: GroupId, patterns: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pos = self.position(id)?;
        self.groups[pos].rules = patterns.into_iter().map(Into::into).collect();
        self.touch();
        Ok(())
    }

    /// Check the invariants a snapshot must satisfy before it is sent anywhere.
    pub fn validate_for_save(&self) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.name.as_str()) {
                return Err(RegistryError::NameConflict(group.name.clone()));
            }
            if group.rules.iter().any(|r| r.trim().is_empty()) {
                return Err(RegistryError::EmptyRule(group.name.clone()));
            }
        }
        Ok(())
    }

    fn validate_name(&self, name: &str, exclude: Option<GroupId>) -> Result<String, RegistryError> {
        let name = name.trim();
        if !is_valid_group_name(name) {
            return Err(RegistryError::InvalidCharset(name.to_string()));
        }
        let taken = self
            .groups
            .iter()
            .any(|g| g.name == name && Some(g.id) != exclude);
        if taken {
            return Err(RegistryError::NameConflict(name.to_string()));
        }
        Ok(name.to_string())
    }

    fn position(&self, id: GroupId) -> Result<usize, RegistryError> {
        self.groups
            .iter()
            .position(|g| g.id == id)
            .ok_or_else(|| RegistryError::UnknownGroup(id.to_string()))
    }

    fn position_by_name(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    fn allocate_id(&mut self) -> GroupId {
        self.next_id += 1;
        GroupId(self.next_id)
    }

    fn touch(&mut self) {
        self.generation += 1;
    }
}
