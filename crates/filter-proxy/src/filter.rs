//! URL filtering.

use crate::{DEFAULT_BLOCKED_TOKEN, config::FilterConfig};

/// Decides whether a requested URL may be fetched.
pub trait FilterPolicy: Send + Sync {
    fn is_blocked(&self, url: &str) -> bool;
}

/// Blocks any URL containing one of its tokens, ignoring case.
///
/// The match is purely textual: the URL is never parsed, so malformed or
/// empty input is fine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstringFilter {
    tokens: Vec<String>,
}

impl SubstringFilter {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|t| t.as_ref().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { tokens }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(&config.blocked_tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl Default for SubstringFilter {
    fn default() -> Self {
        Self::new([DEFAULT_BLOCKED_TOKEN])
    }
}

impl FilterPolicy for SubstringFilter {
    fn is_blocked(&self, url: &str) -> bool {
        if self.tokens.is_empty() {
            return false;
        }
        let url = url.to_lowercase();
        self.tokens.iter().any(|t| url.contains(t.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_bad_in_any_case() {
        let f = SubstringFilter::default();
        for url in [
            "http://bad.example.com/x",
            "BadSite",
            "bAD",
            "https://example.com/BAD/path",
            "http://example.com/?q=badminton",
        ] {
            assert!(f.is_blocked(url), "{url} should be blocked");
        }
    }

    #[test]
    fn allows_everything_else() {
        let f = SubstringFilter::default();
        for url in ["https://google.com", "http://b-a-d.example", "ba d", "", "not a url"] {
            assert!(!f.is_blocked(url), "{url} should pass");
        }
    }

    #[test]
    fn custom_tokens() {
        let f = SubstringFilter::new(["Ads", "tracker"]);
        assert_eq!(f.tokens(), ["ads", "tracker"]);
        assert!(f.is_blocked("http://ADS.example.com"));
        assert!(f.is_blocked("http://cdn.example.com/Tracker.js"));
        assert!(!f.is_blocked("http://bad.example.com"));
    }

    #[test]
    fn empty_tokens_are_ignored() {
        let f = SubstringFilter::new(["", "bad"]);
        assert_eq!(f.tokens(), ["bad"]);
        assert!(!f.is_blocked("http://example.com"));

        let none = SubstringFilter::new(Vec::<String>::new());
        assert!(!none.is_blocked("http://bad.example.com"));
    }

    #[test]
    fn from_config_default_matches_default() {
        assert_eq!(
            SubstringFilter::from_config(&FilterConfig::default()),
            SubstringFilter::default()
        );
    }
}
