//! Place an application in the queue submitted with it.

use canopy_cache::{ApplicationInfo, PartitionInfo};

use super::{is_qualified, normalise, PlacementError, PlacementRule, RuleBase};

pub(crate) struct ProvidedRule {
    base: RuleBase,
}

impl ProvidedRule {
    pub(crate) fn new(base: RuleBase) -> Self {
        Self { base }
    }
}

impl PlacementRule for ProvidedRule {
    fn name(&self) -> &'static str {
        "provided"
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
        let submitted = app.queue_name();
        if submitted.is_empty() {
            return Ok(None);
        }
        // a fully qualified queue is taken as is, the parent rule is skipped
        let candidate = if is_qualified(&submitted) {
            submitted
        } else {
            normalise(&submitted)
        };
        self.base.qualify(&candidate, app, partition)
    }
}
