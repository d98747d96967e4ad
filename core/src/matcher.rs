//! URL relevance predicate.

use regex_lite::Regex;

use crate::config::{ConfigError, MatcherConfig};

/// Decides whether a URL is worth capturing.
///
/// Pure and cheap: it runs inside the host page's response path, so it never
/// allocates more than the URL parse needs and never fails.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    hosts: Vec<String>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::Pattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl PatternMatcher {
    pub fn from_config(config: &MatcherConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            hosts: config
                .hosts
                .iter()
                .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        })
    }

    /// Whether `url` should be captured.
    pub fn matches(&self, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        if !self.hosts.is_empty() && !self.host_allowed(url) {
            return false;
        }
        if self.exclude.iter().any(|re| re.is_match(url)) {
            return false;
        }
        self.include.iter().any(|re| re.is_match(url))
    }

    fn host_allowed(&self, url: &str) -> bool {
        // Relative URLs belong to the page's own origin, which chose to load us.
        if url.starts_with('/') && !url.starts_with("//") {
            return true;
        }
        let host = match url::Url::parse(url) {
            Ok(parsed) => parsed.host_str().map(str::to_ascii_lowercase),
            Err(_) => None,
        };
        let Some(host) = host else {
            return false;
        };
        self.hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }
}
