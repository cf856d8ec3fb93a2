//! Place an application based on one of its tags.

use canopy_cache::{ApplicationInfo, PartitionInfo};

use super::{is_qualified, normalise, PlacementError, PlacementRule, RuleBase};

pub(crate) struct TagRule {
    base: RuleBase,
    tag_key: String,
}

impl TagRule {
    /// The configured value names the tag whose value becomes the queue.
    pub(crate) fn new(base: RuleBase, value: Option<&str>) -> Result<Self, PlacementError> {
        let tag_key = value.unwrap_or_default().trim().to_string();
        if tag_key.is_empty() {
            return Err(PlacementError::InvalidRule {
                rule: "tag",
                reason: "a tag rule needs the tag name as value".to_string(),
            });
        }
        Ok(Self { base, tag_key })
    }
}

impl PlacementRule for TagRule {
    fn name(&self) -> &'static str {
        "tag"
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
        let Some(value) = app.tag(&self.tag_key) else {
            return Ok(None);
        };
        // a tag may carry a full queue path
        let candidate = if is_qualified(&value) {
            value
        } else {
            normalise(&value)
        };
        self.base.qualify(&candidate, app, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_partition;
    use super::super::{new_rule, PlacementError};
    use canopy_cache::ApplicationInfo;
    use canopy_common::config::PlacementRuleConfig;
    use canopy_common::security::UserGroup;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn tag_rule(create: bool) -> PlacementRuleConfig {
        PlacementRuleConfig {
            name: "tag".to_string(),
            create,
            value: Some("namespace".to_string()),
            ..PlacementRuleConfig::default()
        }
    }

    fn app_with_tag(key: &str, value: &str) -> Arc<ApplicationInfo> {
        Arc::new(ApplicationInfo::new(
            "app-1",
            "default@rm-1",
            "",
            UserGroup::new("alice", vec![]),
            HashMap::from([(key.to_string(), value.to_string())]),
        ))
    }

    #[test]
    fn test_value_required() {
        let conf = PlacementRuleConfig {
            name: "tag".to_string(),
            ..PlacementRuleConfig::default()
        };
        assert!(matches!(
            new_rule(&conf),
            Err(PlacementError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_tag_value_names_queue() {
        let partition = test_partition();
        let rule = new_rule(&tag_rule(true)).unwrap();

        let app = app_with_tag("namespace", "Spark.Jobs");
        assert_eq!(
            rule.place(&app, &partition).unwrap().as_deref(),
            Some("root.spark_jobs")
        );

        // missing tag: skipped
        let app = app_with_tag("other", "value");
        assert_eq!(rule.place(&app, &partition).unwrap(), None);
    }
}
