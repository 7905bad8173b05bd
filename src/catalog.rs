use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A known metric as reported by the custom time series backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Description with blank strings treated as absent.
    pub fn description(&self) -> Option<&str> {
        self.description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}

/// Read-only list of metrics for one revision of the backend catalog.
///
/// Names are unique; when the source list repeats a name the first entry wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricCatalog {
    metrics: Vec<Metric>,
    by_name: HashMap<String, usize>,
}

impl MetricCatalog {
    pub fn new(metrics: impl IntoIterator<Item = Metric>) -> Self {
        let mut catalog = Self::default();
        for metric in metrics {
            if catalog.by_name.contains_key(&metric.name) {
                continue;
            }
            catalog
                .by_name
                .insert(metric.name.clone(), catalog.metrics.len());
            catalog.metrics.push(metric);
        }
        catalog
    }

    /// Build a catalog from bare names (no descriptions).
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(Metric::new))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.by_name.get(name).map(|&idx| &self.metrics[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Case-insensitive substring search over name and description.
    /// An empty (or blank) query returns the whole catalog in order.
    pub fn search(&self, query: &str) -> Vec<&Metric> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.metrics.iter().collect();
        }
        self.metrics
            .iter()
            .filter(|metric| {
                metric.name.to_lowercase().contains(&needle)
                    || metric
                        .description()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

impl FromIterator<Metric> for MetricCatalog {
    fn from_iter<T: IntoIterator<Item = Metric>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricCatalog {
        MetricCatalog::new(vec![
            Metric::new("go_requests_total").with_description("Requests served"),
            Metric::new("go_heap_bytes").with_description("Heap in use"),
            Metric::new("http_requests_total"),
            Metric::new("go_requests_total").with_description("duplicate"),
        ])
    }

    #[test]
    fn duplicate_names_keep_first_entry() {
        let catalog = sample();
        assert_eq!(catalog.len(), 3);
        assert_eq!(
            catalog.get("go_requests_total").and_then(Metric::description),
            Some("Requests served")
        );
    }

    #[test]
    fn search_matches_name_or_description_ignoring_case() {
        let catalog = sample();
        let by_name: Vec<_> = catalog.search("HTTP").iter().map(|m| m.name.as_str()).collect();
        assert_eq!(by_name, vec!["http_requests_total"]);

        let by_description: Vec<_> = catalog.search("heap in").iter().map(|m| m.name.as_str()).collect();
        assert_eq!(by_description, vec!["go_heap_bytes"]);

        assert_eq!(catalog.search("  ").len(), 3);
        assert!(catalog.search("nothing_like_this").is_empty());
    }

    #[test]
    fn blank_description_is_treated_as_absent() {
        let metric = Metric::new("x").with_description("   ");
        assert_eq!(metric.description(), None);
    }
}
