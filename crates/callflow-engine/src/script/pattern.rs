//! Response pattern compilation and matching.
//!
//! Pattern forms:
//! - `intent:<name>` matches the analyzer's intent label
//! - `re:<regex>` is a case-insensitive regular expression
//! - `*` matches anything
//! - anything else is a `|`-separated list of words or phrases, matched
//!   case-insensitively on word boundaries

use regex::Regex;

use callflow_core::types::Analysis;

#[derive(Debug, Clone)]
enum Matcher {
    Any,
    Intent(String),
    Text(Regex),
}

/// A compiled response pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    matcher: Matcher,
}

impl Pattern {
    /// Compile a pattern. The error string describes why it is invalid.
    pub fn parse(source: &str) -> Result<Self, String> {
        let trimmed = source.trim();
        let matcher = if trimmed == "*" {
            Matcher::Any
        } else if let Some(intent) = trimmed.strip_prefix("intent:") {
            let intent = intent.trim();
            if intent.is_empty() {
                return Err("intent name is empty".to_string());
            }
            Matcher::Intent(intent.to_ascii_lowercase())
        } else if let Some(raw) = trimmed.strip_prefix("re:") {
            let regex = Regex::new(&format!("(?i){}", raw)).map_err(|e| e.to_string())?;
            Matcher::Text(regex)
        } else {
            let alternatives: Vec<String> = trimmed
                .split('|')
                .map(str::trim)
                .filter(|alt| !alt.is_empty())
                .map(regex::escape)
                .collect();
            if alternatives.is_empty() {
                return Err("pattern has no keywords".to_string());
            }
            let regex = Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
                .map_err(|e| e.to_string())?;
            Matcher::Text(regex)
        };

        Ok(Self {
            source: source.to_string(),
            matcher,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, utterance: &str, analysis: Option<&Analysis>) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Text(regex) => regex.is_match(utterance),
            Matcher::Intent(intent) => analysis
                .and_then(|a| a.matched_intent.as_deref())
                .is_some_and(|found| found.eq_ignore_ascii_case(intent)),
        }
    }
}
