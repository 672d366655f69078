//! Audience targeting: condition trees, leaf match conditions and audience resolution.
mod condition_tree;
mod evaluator;
mod match_condition;
mod version;

pub use condition_tree::{ConditionTree, Tristate};
pub use evaluator::{Audience, AudienceEvaluator};
pub use match_condition::{MatchCondition, MatchType};
