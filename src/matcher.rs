use std::collections::HashMap;

use fancy_regex::{Regex, RegexBuilder};
use tracing::debug;

/// Size limit for the compiled program of user supplied patterns.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;
/// Backtracking budget per match for lookaround and backreference patterns.
const BACKTRACK_LIMIT: usize = 1_000_000;

/// A compiled rule pattern. Supports lookaround and backreferences, so any
/// pattern the product accepts behaves the same here.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    regex: Regex,
}

impl CompiledRule {
    pub fn compile(pattern: &str) -> Option<Self> {
        match RegexBuilder::new(pattern)
            .delegate_size_limit(PATTERN_SIZE_LIMIT)
            .backtrack_limit(BACKTRACK_LIMIT)
            .build()
        {
            Ok(regex) => Some(Self { regex }),
            Err(err) => {
                debug!(pattern, error = %err, "rule pattern failed to compile; treating as match-nothing");
                None
            }
        }
    }

    /// Search semantics (unanchored). A match that exhausts the backtracking
    /// budget counts as no match.
    pub fn is_match(&self, metric_name: &str) -> bool {
        match self.regex.is_match(metric_name) {
            Ok(found) => found,
            Err(err) => {
                debug!(pattern = self.regex.as_str(), metric_name, error = %err, "rule evaluation aborted");
                false
            }
        }
    }
}

/// Test `metric_name` against `pattern` with search semantics (unanchored).
///
/// A pattern that does not compile matches nothing.
pub fn matches(metric_name: &str, pattern: &str) -> bool {
    CompiledRule::compile(pattern).is_some_and(|rule| rule.is_match(metric_name))
}

/// Compiled patterns keyed by their source text.
///
/// Owned by whoever rebuilds indexes (one per editing session), never shared
/// between sessions. Patterns that fail to compile are cached as `None` so they
/// are not recompiled on every rebuild.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: HashMap<String, Option<CompiledRule>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiled rule for `pattern`, or `None` if the pattern is invalid.
    pub fn get(&mut self, pattern: &str) -> Option<&CompiledRule> {
        if !self.compiled.contains_key(pattern) {
            self.compiled
                .insert(pattern.to_string(), CompiledRule::compile(pattern));
        }
        self.compiled.get(pattern).and_then(Option::as_ref)
    }

    pub fn matches(&mut self, metric_name: &str, pattern: &str) -> bool {
        self.get(pattern)
            .is_some_and(|regex| regex.is_match(metric_name))
    }

    pub fn is_valid(&mut self, pattern: &str) -> bool {
        self.get(pattern).is_some()
    }

    /// Drop compiled patterns that are not in `live`. Keeps the cache bounded to
    /// the rules currently present in a session.
    pub fn retain_patterns<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let live: std::collections::HashSet<&str> = live.into_iter().collect();
        self.compiled.retain(|pattern, _| live.contains(pattern.as_str()));
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_semantics_match_substrings() {
        assert!(matches("go_requests_total", "^go_"));
        assert!(matches("http_requests_total", "requests"));
        assert!(matches("http_requests_total", "(.*?)_total"));
        assert!(!matches("http_requests_total", "^go_"));
        assert!(!matches("go_heap_bytes", "_total$"));
    }

    #[test]
    fn malformed_patterns_match_nothing() {
        for name in ["", "(", "cpu_usage", "anything at all"] {
            assert!(!matches(name, "("));
            assert!(!matches(name, "[a-"));
            assert!(!matches(name, "*cpu"));
        }
    }

    #[test]
    fn lookaround_rules_are_supported() {
        assert!(matches("go_requests_total", "^(?!http_)"));
        assert!(!matches("http_requests_total", "^(?!http_)"));
        assert!(matches("disk_read_bytes", "(?<=disk_)read"));
        assert!(!matches("net_read_bytes", "(?<=disk_)read"));
    }

    #[test]
    fn backreference_rules_are_supported() {
        assert!(matches("aa_total", "(a)\\1"));
        assert!(matches("cpu_cpu_seconds", "^(\\w+)_\\1_"));
        assert!(!matches("cpu_mem_seconds", "^(\\w+)_\\1_"));
    }

    #[test]
    fn empty_pattern_matches_everything() {
        assert!(matches("cpu_usage", ""));
    }

    #[test]
    fn cache_compiles_once_and_remembers_invalid_patterns() {
        let mut cache = PatternCache::new();
        assert!(cache.matches("cpu_usage", "cpu_.*"));
        assert!(cache.matches("cpu_idle", "cpu_.*"));
        assert!(!cache.matches("cpu_usage", "("));
        assert!(!cache.is_valid("("));
        assert_eq!(cache.len(), 2);

        cache.retain_patterns(["cpu_.*"]);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_valid("cpu_.*"));
    }
}
