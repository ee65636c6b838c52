use regex::Regex;
use serde::{Deserialize, Serialize};

/// A resource query: exact group coordinates plus a regular expression over
/// resource URLs. The pattern is matched from the start of the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRefPattern {
    pub tool_id: String,
    #[serde(rename = "resourceGroupURL")]
    pub resource_group_url: String,
    #[serde(rename = "URLPattern")]
    pub url_pattern: String,
}

impl ResourceRefPattern {
    pub fn new(
        tool_id: impl Into<String>,
        resource_group_url: impl Into<String>,
        url_pattern: impl Into<String>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            resource_group_url: resource_group_url.into(),
            url_pattern: url_pattern.into(),
        }
    }

    /// Compile the URL pattern, anchored at the start of the candidate.
    pub fn compile(&self) -> Result<Regex, regex::Error> {
        Regex::new(&format!("^(?:{})", self.url_pattern))
    }
}

/// A link query: one pattern per endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLinkPattern {
    pub from_res: ResourceRefPattern,
    pub to_res: ResourceRefPattern,
}

impl ResourceLinkPattern {
    pub fn new(from_res: ResourceRefPattern, to_res: ResourceRefPattern) -> Self {
        Self { from_res, to_res }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        let re = ResourceRefPattern::new("git", "rg1", ".*").compile().unwrap();
        assert!(re.is_match("/any/path"));
        assert!(re.is_match(""));
    }

    #[test]
    fn pattern_anchors_at_start() {
        let re = ResourceRefPattern::new("git", "rg1", "/src/.*\\.c")
            .compile()
            .unwrap();
        assert!(re.is_match("/src/main.c"));
        assert!(!re.is_match("/other/src/main.c"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(ResourceRefPattern::new("git", "rg1", "(").compile().is_err());
    }
}
