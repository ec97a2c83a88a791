//! Label selectors for listing package manifests.
//!
//! A selector is a comma-separated list of requirements, all of which must hold:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `key=value`, `key==value` | label present with that value |
//! | `key!=value` | label absent, or present with another value |
//! | `key` | label present |
//! | `!key` | label absent |
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use pkgcat_sync::selector::LabelSelector;
//!
//! let selector = LabelSelector::parse("catalog=community,!deprecated").unwrap();
//! let labels = BTreeMap::from([("catalog".to_string(), "community".to_string())]);
//! assert!(selector.matches(&labels));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use pkgcat_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::Exists(key) => labels.contains_key(key),
            Self::NotExists(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::NotEquals(key, value) => write!(f, "{key}!={value}"),
            Self::Exists(key) => f.write_str(key),
            Self::NotExists(key) => write!(f, "!{key}"),
        }
    }
}

/// A conjunction of label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Returns the selector that matches every label set.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parses a selector string. Blank input selects everything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSelector`] if a requirement is malformed.
    pub fn parse(selector: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidSelector {
            selector: selector.to_string(),
            message: message.to_string(),
        };

        let mut requirements = Vec::new();
        if selector.trim().is_empty() {
            return Ok(Self { requirements });
        }

        for term in selector.split(',').map(str::trim) {
            if term.is_empty() {
                return Err(invalid("empty requirement"));
            }

            let equality = term.split_once("==").or_else(|| term.split_once('='));
            let requirement = if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = equality {
                Requirement::Equals(key.trim().to_string(), value.trim().to_string())
            } else if let Some(key) = term.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };

            let key = match &requirement {
                Requirement::Equals(key, value) | Requirement::NotEquals(key, value) => {
                    if value.contains(['=', '!']) {
                        return Err(invalid("unexpected operator in value"));
                    }
                    key
                }
                Requirement::Exists(key) | Requirement::NotExists(key) => key,
            };
            if !valid_key(key) {
                return Err(invalid(&format!("invalid label key {key:?}")));
            }
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    /// Returns true if this selector matches everything.
    #[must_use]
    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Returns true if `labels` satisfy every requirement.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, requirement) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{requirement}")?;
        }
        Ok(())
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn everything_matches_any_labels() {
        assert!(LabelSelector::everything().matches(&labels(&[])));
        assert!(LabelSelector::parse("  ").unwrap().is_everything());
    }

    #[test]
    fn equality_and_inequality() {
        let set = labels(&[("catalog", "community"), ("provider", "CoreOS")]);

        assert!(LabelSelector::parse("catalog=community").unwrap().matches(&set));
        assert!(LabelSelector::parse("catalog==community").unwrap().matches(&set));
        assert!(!LabelSelector::parse("catalog=certified").unwrap().matches(&set));
        assert!(LabelSelector::parse("catalog!=certified").unwrap().matches(&set));
        assert!(LabelSelector::parse("missing!=x").unwrap().matches(&set));
    }

    #[test]
    fn existence_requirements() {
        let set = labels(&[("operatorframework.io/arch.amd64", "supported")]);

        assert!(LabelSelector::parse("operatorframework.io/arch.amd64").unwrap().matches(&set));
        assert!(LabelSelector::parse("!operatorframework.io/arch.arm64").unwrap().matches(&set));
        assert!(!LabelSelector::parse("!operatorframework.io/arch.amd64").unwrap().matches(&set));
    }

    #[test]
    fn requirements_are_conjunctive() {
        let set = labels(&[("catalog", "community"), ("provider", "CoreOS")]);
        let selector = LabelSelector::parse("catalog=community, provider=Other").unwrap();
        assert!(!selector.matches(&set));
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        for bad in ["catalog=,", "=value", "a=b=c", "!", "bad key", "a,,b"] {
            let err = LabelSelector::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidSelector { .. }), "{bad}");
        }
    }

    #[test]
    fn display_normalizes_requirements() {
        let selector = LabelSelector::parse("a==1, b!=2,c,!d").unwrap();
        assert_eq!(selector.to_string(), "a=1,b!=2,c,!d");
    }
}
