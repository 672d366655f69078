//! Deciding which variation of a flag a user gets.
mod bucketer;
mod cmab;
mod decision_service;

use std::sync::Arc;

use crate::datafile::{Experiment, Holdout, Variation};

pub use bucketer::Bucketer;
pub use cmab::{CmabDecision, CmabDecisionProvider, HttpCmabClient};
pub use decision_service::{DecisionResponse, DecisionService};

/// Which kind of rule produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionSource {
    /// A plain experiment, decided outside of a flag.
    Experiment,
    /// An experiment attached to a flag.
    FeatureTest,
    /// A rollout rule, or no rule at all.
    Rollout,
    /// A holdout.
    Holdout,
}

impl DecisionSource {
    /// Rule type as reported in impression metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Experiment => "experiment",
            DecisionSource::FeatureTest => "feature-test",
            DecisionSource::Rollout => "rollout",
            DecisionSource::Holdout => "holdout",
        }
    }
}

/// Result of deciding a flag for a user.
///
/// Holdout decisions carry the holdout and leave `experiment` empty.
#[derive(Debug, Clone)]
pub struct FeatureDecision {
    #[allow(missing_docs)]
    pub experiment: Option<Arc<Experiment>>,
    #[allow(missing_docs)]
    pub holdout: Option<Arc<Holdout>>,
    /// `None` if the user did not qualify for any rule.
    pub variation: Option<Variation>,
    #[allow(missing_docs)]
    pub decision_source: DecisionSource,
    /// Set for decisions made by a contextual multi-armed bandit.
    pub cmab_uuid: Option<String>,
}

impl FeatureDecision {
    /// Decision when no rule applied.
    pub fn none() -> FeatureDecision {
        FeatureDecision {
            experiment: None,
            holdout: None,
            variation: None,
            decision_source: DecisionSource::Rollout,
            cmab_uuid: None,
        }
    }

    /// Whether the flag is on for the user.
    pub fn enabled(&self) -> bool {
        self.variation.as_ref().is_some_and(|it| it.feature_enabled)
    }

    /// Key of the experiment, rollout rule or holdout that decided.
    pub fn rule_key(&self) -> Option<&str> {
        match (&self.experiment, &self.holdout) {
            (Some(experiment), _) => Some(&experiment.key),
            (None, Some(holdout)) => Some(&holdout.key),
            (None, None) => None,
        }
    }
}

/// Human-readable log of how a decision was made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionReasons(Vec<String>);

impl DecisionReasons {
    pub(crate) fn push(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::debug!(target: "optimizely", "{reason}");
        self.0.push(reason);
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[allow(missing_docs)]
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}
