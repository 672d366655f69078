//! Datafile parsing and the immutable [`ProjectConfig`] built from it.
mod models;
mod project_config;

pub use models::{
    Attribute, Cmab, Event, Experiment, FeatureFlag, GroupPolicy, Holdout, Region, Rule,
    RuleStatus, TrafficAllocation, VariableDef, VariableType, VariableValue, Variation,
};
pub use project_config::{Group, ProjectConfig, Rollout};

#[cfg(test)]
pub(crate) const TEST_DATAFILE: &str = include_str!("../../tests/data/datafile.json");
