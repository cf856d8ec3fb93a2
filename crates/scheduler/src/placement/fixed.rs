//! Place every matching application in one configured queue.

use canopy_cache::{ApplicationInfo, PartitionInfo};

use super::{is_qualified, PlacementError, PlacementRule, RuleBase};

pub(crate) struct FixedRule {
    base: RuleBase,
    queue: String,
}

impl FixedRule {
    /// The configured value is the target queue, possibly a multi-level
    /// path. A fully qualified value cannot be combined with a parent rule.
    pub(crate) fn new(base: RuleBase, value: Option<&str>) -> Result<Self, PlacementError> {
        let queue = value.unwrap_or_default().trim().to_lowercase();
        if queue.is_empty() {
            return Err(PlacementError::InvalidRule {
                rule: "fixed",
                reason: "a fixed rule needs a queue value".to_string(),
            });
        }
        if is_qualified(&queue) && base.parent.is_some() {
            return Err(PlacementError::InvalidRule {
                rule: "fixed",
                reason: format!("queue '{queue}' is fully qualified but a parent rule is set"),
            });
        }
        Ok(Self { base, queue })
    }
}

impl PlacementRule for FixedRule {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn create(&self) -> bool {
        self.base.create
    }

    fn place(
        &self,
        app: &ApplicationInfo,
        partition: &PartitionInfo,
    ) -> Result<Option<String>, PlacementError> {
        if !self.base.filter.allow(app.user()) {
            return Ok(None);
        }
        self.base.qualify(&self.queue, app, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_app, test_partition};
    use super::super::{new_rule, PlacementError};
    use canopy_common::config::PlacementRuleConfig;

    fn fixed(value: &str, create: bool) -> PlacementRuleConfig {
        PlacementRuleConfig {
            name: "fixed".to_string(),
            create,
            value: Some(value.to_string()),
            ..PlacementRuleConfig::default()
        }
    }

    #[test]
    fn test_value_required() {
        let conf = PlacementRuleConfig {
            name: "fixed".to_string(),
            ..PlacementRuleConfig::default()
        };
        assert!(matches!(
            new_rule(&conf),
            Err(PlacementError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_qualified_value_rejects_parent() {
        let conf = PlacementRuleConfig {
            name: "fixed".to_string(),
            value: Some("root.testparent".to_string()),
            parent: Some(Box::new(PlacementRuleConfig {
                name: "user".to_string(),
                ..PlacementRuleConfig::default()
            })),
            ..PlacementRuleConfig::default()
        };
        assert!(matches!(
            new_rule(&conf),
            Err(PlacementError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_place() {
        let partition = test_partition();
        let app = test_app("", "alice", &[]);

        let rule = new_rule(&fixed("testparent.testchild", false)).unwrap();
        assert_eq!(
            rule.place(&app, &partition).unwrap().as_deref(),
            Some("root.testparent.testchild")
        );

        // missing queue without create: skipped; with create: path returned
        let rule = new_rule(&fixed("nowhere", false)).unwrap();
        assert_eq!(rule.place(&app, &partition).unwrap(), None);
        let rule = new_rule(&fixed("nowhere", true)).unwrap();
        assert_eq!(
            rule.place(&app, &partition).unwrap().as_deref(),
            Some("root.nowhere")
        );
    }
}
