use regex::RegexSet;

use crate::error::ConfigError;

/// Network resources an agent may ask to reach. Anything not matched is
/// refused before an approval request is even created.
#[derive(Debug, Clone)]
pub struct NetworkAllowList {
    patterns: RegexSet,
}

impl NetworkAllowList {
    /// Compile the configured patterns once into a single `RegexSet`.
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns =
            RegexSet::new(patterns).map_err(|e| ConfigError::AllowListPattern(e.to_string()))?;
        Ok(Self { patterns })
    }

    /// An allow-list that permits nothing.
    pub fn deny_all() -> Self {
        Self {
            patterns: RegexSet::empty(),
        }
    }

    pub fn permits(&self, resource: &str) -> bool {
        self.patterns.is_match(resource)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for NetworkAllowList {
    fn default() -> Self {
        Self::deny_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_denies_everything() {
        let list = NetworkAllowList::deny_all();
        assert!(list.is_empty());
        assert!(!list.permits("https://example.com"));
    }

    #[test]
    fn matches_any_pattern() {
        let list = NetworkAllowList::new(&[
            r"^https://docs\.rs/".to_string(),
            r"^https://crates\.io/".to_string(),
        ])
        .unwrap();
        assert!(list.permits("https://docs.rs/tokio"));
        assert!(list.permits("https://crates.io/crates/regex"));
        assert!(!list.permits("https://evil.example/docs.rs/"));
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = NetworkAllowList::new(&["(".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::AllowListPattern(_)));
    }
}
