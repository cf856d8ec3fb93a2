//! Structural validation of a configuration snapshot.
//!
//! Validation is all-or-nothing: the first violation aborts with an error
//! naming the offending path and the caller keeps its previous snapshot.

use std::collections::HashSet;

use regex::Regex;

use super::{ConfigError, FilterConfig, PlacementRuleConfig, QueueConfig, SchedulerConfig};
use crate::security::Acl;
use crate::{DOT, ROOT_QUEUE};

const MAX_QUEUE_NAME_LEN: usize = 64;

/// Validate a snapshot in place. Partitions that declare their queues
/// directly get an implicit root inserted so that every partition ends up
/// with exactly one root queue.
pub fn validate(config: &mut SchedulerConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for partition in &mut config.partitions {
        if !seen.insert(partition.name.to_lowercase()) {
            return Err(ConfigError::DuplicatePartition(partition.name.clone()));
        }
        if partition.queues.is_empty() {
            return Err(ConfigError::NoQueues(partition.name.clone()));
        }

        ensure_root(&mut partition.queues);
        let root = &partition.queues[0];
        if !root.resources.max.is_empty() {
            return Err(ConfigError::RootMaxForbidden(format!(
                "{}/{}",
                partition.name, ROOT_QUEUE
            )));
        }
        check_queue(root, ROOT_QUEUE, true)?;

        for rule in &partition.placement_rules {
            check_rule(rule)?;
        }
        for user in &partition.users {
            if !is_identifier(&user.name, true) {
                return Err(ConfigError::InvalidUserLimit {
                    name: user.name.clone(),
                    reason: "not a valid user name".to_string(),
                });
            }
            if let Some((key, _)) = user.max_resources.iter().find(|(_, v)| **v < 0) {
                return Err(ConfigError::InvalidUserLimit {
                    name: user.name.clone(),
                    reason: format!("negative quantity for resource '{key}'"),
                });
            }
        }
    }
    Ok(())
}

/// Wrap top level queues under an implicit root unless the partition already
/// declares a single queue named root.
fn ensure_root(queues: &mut Vec<QueueConfig>) {
    let has_root = queues.len() == 1 && queues[0].name.eq_ignore_ascii_case(ROOT_QUEUE);
    if !has_root {
        let children = std::mem::take(queues);
        queues.push(QueueConfig {
            name: ROOT_QUEUE.to_string(),
            parent: true,
            queues: children,
            ..QueueConfig::default()
        });
    }
}

fn check_queue(queue: &QueueConfig, path: &str, is_root: bool) -> Result<(), ConfigError> {
    if !is_root {
        check_queue_name(&queue.name, path)?;
    }

    for (key, value) in queue.resources.guaranteed.iter().chain(&queue.resources.max) {
        if *value < 0 {
            return Err(ConfigError::NegativeResource {
                path: path.to_string(),
                key: key.clone(),
            });
        }
    }

    for acl in [&queue.admin_acl, &queue.submit_acl].into_iter().flatten() {
        Acl::parse(acl).map_err(|source| ConfigError::InvalidAcl {
            path: path.to_string(),
            source,
        })?;
    }

    let mut seen = HashSet::new();
    for child in &queue.queues {
        if !seen.insert(child.name.to_lowercase()) {
            return Err(ConfigError::DuplicateQueue(format!(
                "{path}{DOT}{}",
                child.name
            )));
        }
        let child_path = format!("{path}{DOT}{}", child.name);
        check_queue(child, &child_path, false)?;
    }
    Ok(())
}

fn check_queue_name(name: &str, path: &str) -> Result<(), ConfigError> {
    let fail = |reason: &str| {
        Err(ConfigError::InvalidQueueName {
            path: path.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return fail("length must be 1-64 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return fail("only alphanumeric characters, '_' and '-' are allowed");
    }
    Ok(())
}

fn check_rule(rule: &PlacementRuleConfig) -> Result<(), ConfigError> {
    check_filter(&rule.filter)?;
    if let Some(parent) = &rule.parent {
        check_rule(parent)?;
    }
    Ok(())
}

fn check_filter(filter: &FilterConfig) -> Result<(), ConfigError> {
    match filter.filter_type.as_deref() {
        None | Some("") | Some("allow") | Some("deny") => {}
        Some(other) => return Err(ConfigError::InvalidFilterType(other.to_string())),
    }
    for entry in &filter.users {
        check_filter_entry(entry, "user", true)?;
    }
    for entry in &filter.groups {
        check_filter_entry(entry, "group", false)?;
    }
    Ok(())
}

/// A filter entry is either a plain name, checked against the identifier
/// rules, or - when it contains regex metacharacters - a pattern that must
/// compile.
fn check_filter_entry(entry: &str, kind: &'static str, is_user: bool) -> Result<(), ConfigError> {
    if entry.chars().any(is_regex_meta) {
        Regex::new(entry).map_err(|e| ConfigError::InvalidFilterEntry {
            kind,
            entry: entry.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(());
    }
    if !is_identifier(entry, is_user) {
        return Err(ConfigError::InvalidFilterEntry {
            kind,
            entry: entry.to_string(),
            reason: "not a valid name".to_string(),
        });
    }
    Ok(())
}

fn is_regex_meta(c: char) -> bool {
    matches!(
        c,
        '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
    )
}

/// Identifier rules: leading letter or underscore, then letters, digits,
/// `_` and `-`; user names additionally allow `.`. An `@` is never valid.
fn is_identifier(name: &str, is_user: bool) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-' || (is_user && c == '.')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("alice", true));
        assert!(is_identifier("_svc-account", true));
        assert!(is_identifier("first.last", true));
        assert!(!is_identifier("first.last", false));
        assert!(!is_identifier("99test", true));
        assert!(!is_identifier("", true));
    }

    #[test]
    fn test_implicit_root_insertion() {
        let mut queues = vec![
            QueueConfig {
                name: "a".to_string(),
                ..QueueConfig::default()
            },
            QueueConfig {
                name: "b".to_string(),
                ..QueueConfig::default()
            },
        ];
        ensure_root(&mut queues);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].name, ROOT_QUEUE);
        assert_eq!(queues[0].queues.len(), 2);
    }

    #[test]
    fn test_explicit_root_untouched() {
        let mut queues = vec![QueueConfig {
            name: "root".to_string(),
            queues: vec![QueueConfig {
                name: "a".to_string(),
                ..QueueConfig::default()
            }],
            ..QueueConfig::default()
        }];
        ensure_root(&mut queues);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].queues.len(), 1);
    }
}
