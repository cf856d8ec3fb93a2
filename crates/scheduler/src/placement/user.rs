//! Place an application in a queue named after the submitting user.

use canopy_cache::{ApplicationInfo, PartitionInfo};

use super::{normalise, PlacementError, PlacementRule, RuleBase};

pub(crate) struct UserRule {
    base: RuleBase,
}

impl UserRule {
    pub(crate) fn new(base: RuleBase) -> Self {
        Self { base }
    }
}

impl PlacementRule for UserRule {
    fn name(&self) -> &'static str {
        "user"
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
        if app.user().user.is_empty() {
            return Ok(None);
        }
        let leaf = normalise(&app.user().user);
        self.base.qualify(&leaf, app, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_app, test_partition};
    use super::super::new_rule;
    use canopy_common::config::PlacementRuleConfig;

    #[test]
    fn test_user_rule_with_parent_group() {
        let partition = test_partition();
        let rule = new_rule(&PlacementRuleConfig {
            name: "user".to_string(),
            create: true,
            parent: Some(Box::new(PlacementRuleConfig {
                name: "primarygroup".to_string(),
                ..PlacementRuleConfig::default()
            })),
            ..PlacementRuleConfig::default()
        })
        .unwrap();

        // pre-existing parent queue root.dev, user alice in group dev
        let app = test_app("", "alice", &["dev"]);
        assert_eq!(
            rule.place(&app, &partition).unwrap().as_deref(),
            Some("root.dev.alice")
        );

        // the parent group queue does not exist and the parent rule cannot
        // create: the whole rule is skipped
        let app = test_app("", "alice", &["unknowngroup"]);
        assert_eq!(rule.place(&app, &partition).unwrap(), None);
    }

    #[test]
    fn test_user_name_is_normalised() {
        let partition = test_partition();
        let rule = new_rule(&PlacementRuleConfig {
            name: "user".to_string(),
            create: true,
            ..PlacementRuleConfig::default()
        })
        .unwrap();
        let app = test_app("", "First.Last", &[]);
        assert_eq!(
            rule.place(&app, &partition).unwrap().as_deref(),
            Some("root.first_last")
        );
    }
}
