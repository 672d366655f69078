use std::sync::Arc;

use crate::{
    datafile::{Group, GroupPolicy, Rule, TrafficAllocation, Variation},
    decision::DecisionReasons,
    sharder::{Murmur3Sharder, Sharder},
};

/// Deterministic assignment of users to traffic allocation ranges.
#[derive(Clone)]
pub struct Bucketer {
    sharder: Arc<dyn Sharder + Send + Sync>,
}

impl Default for Bucketer {
    fn default() -> Self {
        Bucketer::new(Arc::new(Murmur3Sharder))
    }
}

impl std::fmt::Debug for Bucketer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucketer").finish_non_exhaustive()
    }
}

/// Find the entity whose range contains `bucket_value`. Range ends are exclusive: a value equal to
/// `end_of_range` belongs to the next allocation.
pub(crate) fn find_bucket(
    bucket_value: u32,
    traffic_allocation: &[TrafficAllocation],
) -> Option<&str> {
    traffic_allocation
        .iter()
        .find(|it| it.end_of_range > bucket_value)
        .map(|it| it.entity_id.as_str())
        .filter(|it| !it.is_empty())
}

impl Bucketer {
    #[allow(missing_docs)]
    pub fn new(sharder: Arc<dyn Sharder + Send + Sync>) -> Bucketer {
        Bucketer { sharder }
    }

    /// Bucket value of `bucketing_id` for `entity_id`, in `[0, 10000)`.
    pub fn bucket_value(&self, bucketing_id: &str, entity_id: &str) -> u32 {
        self.sharder
            .bucket_value(&format!("{bucketing_id}{entity_id}"))
    }

    /// Returns the entity id of `traffic_allocation` the user falls into, or `None` if the user
    /// is not bucketed.
    pub fn bucket(
        &self,
        bucketing_id: &str,
        entity_id: &str,
        traffic_allocation: &[TrafficAllocation],
    ) -> Option<String> {
        let bucket_value = self.bucket_value(bucketing_id, entity_id);
        log::trace!(target: "optimizely", entity_id, bucket_value; "assigned bucket");
        find_bucket(bucket_value, traffic_allocation).map(str::to_owned)
    }

    /// Check that the user lands on `rule` within its mutual exclusion group. Always `true` for
    /// rules outside of a group and for overlapping groups.
    pub(crate) fn is_in_group_slot(
        &self,
        rule: &dyn Rule,
        group: Option<&Group>,
        bucketing_id: &str,
        user_id: &str,
        reasons: &mut DecisionReasons,
    ) -> bool {
        let Some(group) = group else {
            return true;
        };
        if group.policy == GroupPolicy::Overlapping {
            return true;
        }

        match self.bucket(bucketing_id, &group.id, &group.traffic_allocation) {
            Some(experiment_id) if experiment_id == rule.id() => {
                reasons.push(format!(
                    "User \"{user_id}\" is in experiment \"{}\" of group \"{}\".",
                    rule.key(),
                    group.id
                ));
                true
            }
            Some(_) => {
                reasons.push(format!(
                    "User \"{user_id}\" is not in experiment \"{}\" of group \"{}\".",
                    rule.key(),
                    group.id
                ));
                false
            }
            None => {
                reasons.push(format!(
                    "User \"{user_id}\" is not in any experiment of group \"{}\".",
                    group.id
                ));
                false
            }
        }
    }

    /// Bucket the user into one of the variations of `rule`.
    pub(crate) fn bucket_to_variation<'r>(
        &self,
        rule: &'r dyn Rule,
        bucketing_id: &str,
        user_id: &str,
        reasons: &mut DecisionReasons,
    ) -> Option<&'r Variation> {
        let Some(variation_id) = self.bucket(bucketing_id, rule.id(), rule.traffic_allocation())
        else {
            reasons.push(format!(
                "User \"{user_id}\" is in no variation of rule \"{}\".",
                rule.key()
            ));
            return None;
        };

        match rule.variation_by_id(&variation_id) {
            Some(variation) => {
                reasons.push(format!(
                    "User \"{user_id}\" is in variation \"{}\" of rule \"{}\".",
                    variation.key,
                    rule.key()
                ));
                Some(variation)
            }
            None => {
                log::warn!(target: "optimizely",
                           rule_key = rule.key(),
                           variation_id:display = variation_id;
                           "traffic allocation references an unknown variation");
                reasons.push(format!(
                    "Variation \"{variation_id}\" of rule \"{}\" is not in the datafile.",
                    rule.key()
                ));
                None
            }
        }
    }
}
