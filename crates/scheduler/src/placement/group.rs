//! Group based placement: primary group and filtered secondary group.

use canopy_cache::{ApplicationInfo, PartitionInfo};

use super::{normalise, PlacementError, PlacementRule, RuleBase};

pub(crate) struct PrimaryGroupRule {
    base: RuleBase,
}

impl PrimaryGroupRule {
    pub(crate) fn new(base: RuleBase) -> Self {
        Self { base }
    }
}

impl PlacementRule for PrimaryGroupRule {
    fn name(&self) -> &'static str {
        "primarygroup"
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
        let Some(group) = app.user().primary_group() else {
            return Ok(None);
        };
        let leaf = normalise(group);
        self.base.qualify(&leaf, app, partition)
    }
}

pub(crate) struct SecondaryGroupRule {
    base: RuleBase,
}

impl SecondaryGroupRule {
    pub(crate) fn new(base: RuleBase) -> Self {
        Self { base }
    }
}

impl PlacementRule for SecondaryGroupRule {
    fn name(&self) -> &'static str {
        "secondarygroup"
    }

    fn create(&self) -> bool {
        self.base.create
    }

    /// The first secondary group accepted by the rule's filter names the
    /// queue. Without group entries in the filter the first secondary
    /// group wins.
    fn place(
        &self,
        app: &ApplicationInfo,
        partition: &PartitionInfo,
    ) -> Result<Option<String>, PlacementError> {
        let secondary = app.user().groups.iter().skip(1);
        for group in secondary {
            if self.base.filter.has_group_entries() && !self.base.filter.group_matches(group) {
                continue;
            }
            let leaf = normalise(group);
            if let Some(queue) = self.base.qualify(&leaf, app, partition)? {
                return Ok(Some(queue));
            }
        }
        Ok(None)
    }
}
