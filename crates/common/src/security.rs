//! User identity and queue access control.
//!
//! An ACL is configured as a single string of up to two whitespace-delimited
//! fields: a comma-separated user list and a comma-separated group list.
//! A field consisting of a single `*` matches everyone; a `*` buried inside
//! a list is rejected at parse time, as are unbalanced quotes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The identity an application is submitted under.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    pub user: String,
    pub groups: Vec<String>,
}

impl UserGroup {
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }

    /// First group of the user, if any.
    pub fn primary_group(&self) -> Option<&str> {
        self.groups.first().map(String::as_str)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("ACL has too many fields, expected at most 2 (users groups): '{0}'")]
    TooManyFields(String),
    #[error("ACL contains an unescaped wildcard inside a list: '{0}'")]
    EmbeddedWildcard(String),
    #[error("ACL contains unbalanced quotes: '{0}'")]
    UnbalancedQuotes(String),
}

/// A parsed access control list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Acl {
    users: HashSet<String>,
    groups: HashSet<String>,
    all_users: bool,
    all_groups: bool,
}

impl Acl {
    /// Parse an ACL string: `"<users-csv> <groups-csv>"`, both fields
    /// optional. The separator is positional: `" sandbox"` has an empty
    /// user list and one group. An empty string matches nobody.
    pub fn parse(value: &str) -> Result<Acl, AclError> {
        if value.chars().filter(|c| *c == '"').count() % 2 != 0 {
            return Err(AclError::UnbalancedQuotes(value.to_string()));
        }
        let fields: Vec<&str> = value.split(' ').collect();
        if fields.len() > 2 {
            return Err(AclError::TooManyFields(value.to_string()));
        }

        let mut acl = Acl::default();
        if let Some(users) = fields.first() {
            acl.all_users = Self::parse_field(users, &mut acl.users, value)?;
        }
        if let Some(groups) = fields.get(1) {
            acl.all_groups = Self::parse_field(groups, &mut acl.groups, value)?;
        }
        Ok(acl)
    }

    fn parse_field(
        field: &str,
        into: &mut HashSet<String>,
        original: &str,
    ) -> Result<bool, AclError> {
        if field == "*" {
            return Ok(true);
        }
        for entry in field.split(',').filter(|e| !e.is_empty()) {
            if entry.contains('*') {
                return Err(AclError::EmbeddedWildcard(original.to_string()));
            }
            into.insert(entry.to_string());
        }
        Ok(false)
    }

    /// True when the given identity is covered by this ACL.
    pub fn allows(&self, user: &UserGroup) -> bool {
        if self.all_users || self.all_groups {
            return true;
        }
        if self.users.contains(&user.user) {
            return true;
        }
        user.groups.iter().any(|g| self.groups.contains(g))
    }
}
