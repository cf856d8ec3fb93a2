//! User/group filters gating placement rules.

use regex::Regex;

use canopy_common::config::FilterConfig;
use canopy_common::security::UserGroup;

use super::PlacementError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FilterType {
    Allow,
    Deny,
}

enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    fn from_entry(entry: &str) -> Result<Self, PlacementError> {
        let is_meta = |c: char| {
            matches!(
                c,
                '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
            )
        };
        if entry.chars().any(is_meta) {
            let pattern = Regex::new(entry).map_err(|e| PlacementError::InvalidRule {
                rule: "filter",
                reason: format!("bad pattern '{entry}': {e}"),
            })?;
            Ok(Matcher::Pattern(pattern))
        } else {
            Ok(Matcher::Literal(entry.to_string()))
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Literal(name) => name == value,
            // patterns must cover the whole name
            Matcher::Pattern(re) => re
                .find(value)
                .is_some_and(|m| m.start() == 0 && m.end() == value.len()),
        }
    }
}

/// A compiled rule filter. A filter without any user or group entries is
/// inactive and lets everyone through.
pub struct Filter {
    filter_type: FilterType,
    users: Vec<Matcher>,
    groups: Vec<Matcher>,
}

impl Filter {
    pub fn from_config(conf: &FilterConfig) -> Result<Self, PlacementError> {
        let filter_type = match conf.filter_type.as_deref() {
            Some("deny") => FilterType::Deny,
            _ => FilterType::Allow,
        };
        Ok(Self {
            filter_type,
            users: conf
                .users
                .iter()
                .map(|e| Matcher::from_entry(e))
                .collect::<Result<_, _>>()?,
            groups: conf
                .groups
                .iter()
                .map(|e| Matcher::from_entry(e))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Evaluate the filter for a submitting identity.
    pub fn allow(&self, user: &UserGroup) -> bool {
        if self.users.is_empty() && self.groups.is_empty() {
            return true;
        }
        let matched = self.users.iter().any(|m| m.matches(&user.user))
            || user
                .groups
                .iter()
                .any(|g| self.groups.iter().any(|m| m.matches(g)));
        match self.filter_type {
            FilterType::Allow => matched,
            FilterType::Deny => !matched,
        }
    }

    pub fn has_group_entries(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Direct group match, used by the secondary-group rule to pick the
    /// first acceptable group.
    pub fn group_matches(&self, group: &str) -> bool {
        let matched = self.groups.iter().any(|m| m.matches(group));
        match self.filter_type {
            FilterType::Allow => matched,
            FilterType::Deny => !matched,
        }
    }
}
