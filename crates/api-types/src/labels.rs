//! Label selectors used by listers to filter cached objects

use std::collections::BTreeMap;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(k, values) => labels.get(k).map_or(true, |v| !values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

/// Error returned for a selector string that cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("invalid label selector {selector:?}: {reason}")]
pub struct SelectorParseError {
    pub selector: String,
    pub reason: String,
}

impl core::error::Error for SelectorParseError {}

impl LabelSelector {
    /// Selector that matches every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring each `key=value` pair.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            requirements: labels
                .into_iter()
                .map(|(k, v)| Requirement::Equals(k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Parses `k=v`, `k==v`, `k!=v`, `k`, `!k`, `k in (a,b)` and
    /// `k notin (a,b)` terms separated by commas.
    pub fn parse(selector: &str) -> Result<Self, SelectorParseError> {
        let err = |reason: &str| SelectorParseError {
            selector: selector.to_string(),
            reason: reason.to_string(),
        };

        let mut requirements = Vec::new();
        for term in split_terms(selector) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let requirement = if let Some(key) = term.strip_prefix('!') {
                Requirement::DoesNotExist(parse_key(key).ok_or_else(|| err("empty key"))?)
            } else if let Some((key, values)) = split_set_term(term, " notin ") {
                Requirement::NotIn(
                    parse_key(key).ok_or_else(|| err("empty key"))?,
                    parse_values(values).ok_or_else(|| err("malformed value set"))?,
                )
            } else if let Some((key, values)) = split_set_term(term, " in ") {
                Requirement::In(
                    parse_key(key).ok_or_else(|| err("empty key"))?,
                    parse_values(values).ok_or_else(|| err("malformed value set"))?,
                )
            } else if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(
                    parse_key(key).ok_or_else(|| err("empty key"))?,
                    value.trim().to_string(),
                )
            } else if let Some((key, value)) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
            {
                Requirement::Equals(
                    parse_key(key).ok_or_else(|| err("empty key"))?,
                    value.trim().to_string(),
                )
            } else {
                Requirement::Exists(parse_key(term).ok_or_else(|| err("empty key"))?)
            };
            requirements.push(requirement);
        }
        Ok(Self { requirements })
    }
}

impl std::str::FromStr for LabelSelector {
    type Err = SelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Splits on commas that are not inside a parenthesised value set.
fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&selector[start..]);
    terms
}

fn split_set_term<'a>(term: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, rest) = term.split_once(op)?;
    Some((key, rest.trim()))
}

fn parse_key(key: &str) -> Option<String> {
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

fn parse_values(values: &str) -> Option<BTreeSet<String>> {
    let inner = values.strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::parse("").expect("should parse");
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn equality_and_inequality() {
        let selector = LabelSelector::parse("model=a100, zone != us-east").expect("should parse");
        assert!(selector.matches(&labels(&[("model", "a100"), ("zone", "eu")])));
        assert!(selector.matches(&labels(&[("model", "a100")])));
        assert!(!selector.matches(&labels(&[("model", "a100"), ("zone", "us-east")])));
        assert!(!selector.matches(&labels(&[("model", "h100")])));
    }

    #[test]
    fn set_based_terms() {
        let selector =
            LabelSelector::parse("model in (a100, h100),tier notin (spot)").expect("should parse");
        assert!(selector.matches(&labels(&[("model", "h100")])));
        assert!(!selector.matches(&labels(&[("model", "t4")])));
        assert!(!selector.matches(&labels(&[("model", "a100"), ("tier", "spot")])));
    }

    #[test]
    fn existence_terms() {
        let selector = LabelSelector::parse("healthy,!cordoned").expect("should parse");
        assert!(selector.matches(&labels(&[("healthy", "")])));
        assert!(!selector.matches(&labels(&[("healthy", ""), ("cordoned", "yes")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn malformed_set_is_rejected() {
        assert!(LabelSelector::parse("model in a100").is_err());
        assert!(LabelSelector::parse("=value").is_err());
    }
}
