use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    audience::AudienceEvaluator,
    datafile::{Experiment, FeatureFlag, ProjectConfig, Rule, TrafficAllocation, Variation},
    decision::{
        bucketer::find_bucket, Bucketer, CmabDecisionProvider, DecisionReasons, DecisionSource,
        FeatureDecision,
    },
    user_context::UserContext,
    Error, Result, UserAttributes,
};

/// Entity id CMAB traffic allocations bucket into.
const CMAB_ENTITY_ID: &str = "$";

/// Decision for a single flag together with the reasons that led to it.
///
/// Reasons are kept on error paths as well.
#[derive(Debug, Clone)]
pub struct DecisionResponse {
    #[allow(missing_docs)]
    pub flag_key: String,
    #[allow(missing_docs)]
    pub result: Result<FeatureDecision>,
    #[allow(missing_docs)]
    pub reasons: DecisionReasons,
}

/// Orchestrates forced variations, holdouts, experiments and rollouts for a flag.
pub struct DecisionService {
    bucketer: Bucketer,
    cmab: Option<Arc<dyn CmabDecisionProvider>>,
    decision_timeout: Duration,
    /// user id -> experiment id -> variation id
    forced_variations: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl DecisionService {
    /// Default upper bound for deciding a single flag.
    pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(10);

    #[allow(missing_docs)]
    pub fn new(bucketer: Bucketer) -> DecisionService {
        DecisionService {
            bucketer,
            cmab: None,
            decision_timeout: DecisionService::DEFAULT_DECISION_TIMEOUT,
            forced_variations: Mutex::new(HashMap::new()),
        }
    }

    /// Provider used for CMAB experiments. Without it, CMAB experiments are skipped.
    pub fn with_cmab_provider(mut self, cmab: Arc<dyn CmabDecisionProvider>) -> Self {
        self.cmab = Some(cmab);
        self
    }

    /// Upper bound for deciding a single flag in
    /// [`DecisionService::get_variations_for_feature_list`].
    pub fn with_decision_timeout(mut self, decision_timeout: Duration) -> Self {
        self.decision_timeout = decision_timeout;
        self
    }

    /// Force `user_id` into `variation_key` of `experiment_key`, or clear the forced variation if
    /// `variation_key` is `None`. Returns `false` if the experiment or variation is unknown.
    pub fn set_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let Some(experiment) = config.get_experiment_by_key(experiment_key) else {
            log::warn!(target: "optimizely", experiment_key, user_id;
                       "cannot force variation of an unknown experiment");
            return false;
        };

        let variation_id = match variation_key {
            None => None,
            Some(variation_key) => match experiment.variation_by_key(variation_key) {
                Some(variation) => Some(variation.id.clone()),
                None => {
                    log::warn!(target: "optimizely", experiment_key, user_id, variation_key;
                               "cannot force an unknown variation");
                    return false;
                }
            },
        };

        let Ok(mut forced_variations) = self.forced_variations.lock() else {
            return false;
        };
        match variation_id {
            Some(variation_id) => {
                forced_variations
                    .entry(user_id.to_owned())
                    .or_default()
                    .insert(experiment.id.clone(), variation_id);
            }
            None => {
                if let Some(user_map) = forced_variations.get_mut(user_id) {
                    user_map.remove(&experiment.id);
                }
            }
        }
        true
    }

    /// Variation `user_id` was forced into with [`DecisionService::set_forced_variation`].
    pub fn get_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
    ) -> Option<Variation> {
        let experiment = config.get_experiment_by_key(experiment_key)?;
        self.forced_variation(experiment, user_id).cloned()
    }

    fn forced_variation<'e>(
        &self,
        experiment: &'e Experiment,
        user_id: &str,
    ) -> Option<&'e Variation> {
        let variation_id = {
            let forced_variations = self.forced_variations.lock().ok()?;
            forced_variations.get(user_id)?.get(&experiment.id)?.clone()
        };
        experiment.variation_by_id(&variation_id)
    }

    /// Decide every flag of `flags` concurrently.
    ///
    /// A flag that fails or does not finish within the decision timeout yields an error response;
    /// other flags are not affected.
    pub async fn get_variations_for_feature_list(
        &self,
        config: &ProjectConfig,
        flags: &[Arc<FeatureFlag>],
        user: &UserContext,
    ) -> Vec<DecisionResponse> {
        let decisions = flags.iter().map(|flag| async move {
            let decision = self.get_variation_for_feature(config, flag, user);
            match tokio::time::timeout(self.decision_timeout, decision).await {
                Ok(response) => response,
                Err(_elapsed) => {
                    log::warn!(target: "optimizely",
                               flag_key:display = flag.key,
                               user_id = user.user_id();
                               "flag decision timed out");
                    let mut reasons = DecisionReasons::default();
                    reasons.push(format!(
                        "Decision for flag \"{}\" timed out after {:?}.",
                        flag.key, self.decision_timeout
                    ));
                    DecisionResponse {
                        flag_key: flag.key.clone(),
                        result: Err(Error::DecisionTimeout(flag.key.clone())),
                        reasons,
                    }
                }
            }
        });
        futures::future::join_all(decisions).await
    }

    /// Decide a single flag for the user.
    pub async fn get_variation_for_feature(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserContext,
    ) -> DecisionResponse {
        let mut reasons = DecisionReasons::default();
        let result = self.decide_flag(config, flag, user, &mut reasons).await;
        if let Err(err) = &result {
            reasons.push(format!("Decision for flag \"{}\" failed: {err}.", flag.key));
        }
        DecisionResponse {
            flag_key: flag.key.clone(),
            result,
            reasons,
        }
    }

    async fn decide_flag(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Result<FeatureDecision> {
        if let Some(decision) = self.forced_decision(config, flag, user, reasons) {
            return Ok(decision);
        }

        if let Some(decision) = self.holdout_decision(config, flag, user, reasons) {
            return Ok(decision);
        }

        if let Some(decision) = self.feature_test_decision(config, flag, user, reasons).await? {
            return Ok(decision);
        }

        if let Some(decision) = self.rollout_decision(config, flag, user, reasons) {
            return Ok(decision);
        }

        reasons.push(format!(
            "User \"{}\" is not in any rule of flag \"{}\".",
            user.user_id(),
            flag.key
        ));
        Ok(FeatureDecision::none())
    }

    /// Forced and whitelisted variations of running feature tests.
    fn forced_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Option<FeatureDecision> {
        let user_id = user.user_id();
        for experiment in feature_tests(config, flag) {
            if !experiment.status.is_running() {
                continue;
            }

            let variation = if let Some(variation) = self.forced_variation(experiment, user_id) {
                reasons.push(format!(
                    "Variation \"{}\" is forced for user \"{user_id}\" in experiment \"{}\".",
                    variation.key, experiment.key
                ));
                variation
            } else if let Some(variation) = whitelisted_variation(experiment, user_id, reasons) {
                variation
            } else {
                continue;
            };

            return Some(FeatureDecision {
                experiment: Some(Arc::clone(experiment)),
                holdout: None,
                variation: Some(variation.clone()),
                decision_source: DecisionSource::FeatureTest,
                cmab_uuid: None,
            });
        }
        None
    }

    fn holdout_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Option<FeatureDecision> {
        let user_id = user.user_id();
        for holdout in config.holdouts_for_flag(&flag.id) {
            if !holdout.status.is_running() {
                reasons.push(format!("Holdout \"{}\" is not running.", holdout.key));
                continue;
            }

            if !self.is_in_audience(config, &**holdout, user, reasons) {
                continue;
            }

            if let Some(variation) =
                self.bucketer
                    .bucket_to_variation(&**holdout, user.bucketing_id(), user_id, reasons)
            {
                reasons.push(format!(
                    "User \"{user_id}\" is in holdout \"{}\" of flag \"{}\".",
                    holdout.key, flag.key
                ));
                return Some(FeatureDecision {
                    experiment: None,
                    holdout: Some(Arc::clone(holdout)),
                    variation: Some(variation.clone()),
                    decision_source: DecisionSource::Holdout,
                    cmab_uuid: None,
                });
            }
        }
        None
    }

    async fn feature_test_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Result<Option<FeatureDecision>> {
        for experiment in feature_tests(config, flag) {
            if let Some((variation, cmab_uuid)) =
                self.get_variation(config, experiment, user, reasons).await?
            {
                return Ok(Some(FeatureDecision {
                    experiment: Some(Arc::clone(experiment)),
                    holdout: None,
                    variation: Some(variation),
                    decision_source: DecisionSource::FeatureTest,
                    cmab_uuid,
                }));
            }
        }
        Ok(None)
    }

    /// Variation of a single experiment for the user, along with the CMAB uuid for CMAB
    /// experiments.
    pub(crate) async fn get_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Result<Option<(Variation, Option<String>)>> {
        let user_id = user.user_id();
        if !experiment.status.is_running() {
            reasons.push(format!("Experiment \"{}\" is not running.", experiment.key));
            return Ok(None);
        }

        if let Some(variation) = self.forced_variation(experiment, user_id) {
            reasons.push(format!(
                "Variation \"{}\" is forced for user \"{user_id}\" in experiment \"{}\".",
                variation.key, experiment.key
            ));
            return Ok(Some((variation.clone(), None)));
        }
        if let Some(variation) = whitelisted_variation(experiment, user_id, reasons) {
            return Ok(Some((variation.clone(), None)));
        }

        if !self.is_in_audience(config, experiment, user, reasons) {
            return Ok(None);
        }

        let group = experiment
            .group_id
            .as_deref()
            .and_then(|group_id| config.get_group(group_id));
        let bucketing_id = user.bucketing_id();
        if !self.bucketer.is_in_group_slot(
            experiment,
            group.map(|it| &**it),
            bucketing_id,
            user_id,
            reasons,
        ) {
            return Ok(None);
        }

        if experiment.cmab.is_some() {
            return self.get_cmab_variation(config, experiment, user, reasons).await;
        }

        Ok(self
            .bucketer
            .bucket_to_variation(experiment, bucketing_id, user_id, reasons)
            .map(|variation| (variation.clone(), None)))
    }

    async fn get_cmab_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Result<Option<(Variation, Option<String>)>> {
        let user_id = user.user_id();
        let Some(cmab) = experiment.cmab.as_ref() else {
            return Ok(None);
        };
        let Some(provider) = self.cmab.as_ref() else {
            reasons.push(format!(
                "Experiment \"{}\" requires a CMAB provider, skipping.",
                experiment.key
            ));
            return Ok(None);
        };

        let traffic = [TrafficAllocation {
            entity_id: CMAB_ENTITY_ID.to_owned(),
            end_of_range: cmab.traffic_allocation,
        }];
        let bucket_value = self.bucketer.bucket_value(user.bucketing_id(), &experiment.id);
        if find_bucket(bucket_value, &traffic).is_none() {
            reasons.push(format!(
                "User \"{user_id}\" is not in CMAB traffic of experiment \"{}\".",
                experiment.key
            ));
            return Ok(None);
        }

        let attributes = cmab
            .attribute_ids
            .iter()
            .filter_map(|attribute_id| {
                let attribute = config.get_attribute_by_id(attribute_id)?;
                let value = user.attributes().get(&attribute.key)?;
                Some((attribute_id.clone(), value.clone()))
            })
            .collect::<UserAttributes>();

        let decision = provider
            .get_decision(&experiment.id, user_id, &attributes)
            .await?;

        match experiment.variation_by_id(&decision.variation_id) {
            Some(variation) => {
                reasons.push(format!(
                    "User \"{user_id}\" is in variation \"{}\" of CMAB experiment \"{}\".",
                    variation.key, experiment.key
                ));
                Ok(Some((variation.clone(), Some(decision.cmab_uuid))))
            }
            None => Err(Error::Cmab {
                rule_id: experiment.id.clone(),
                message: format!("unknown variation {}", decision.variation_id),
            }),
        }
    }

    /// Targeted delivery rules in order, then the "everyone else" rule. A user who matches a
    /// targeted rule's audience but misses its traffic goes straight to "everyone else".
    fn rollout_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> Option<FeatureDecision> {
        let user_id = user.user_id();
        if flag.rollout_id.is_empty() {
            reasons.push(format!("Flag \"{}\" has no rollout.", flag.key));
            return None;
        }
        let Some(rollout) = config.get_rollout(&flag.rollout_id) else {
            log::warn!(target: "optimizely",
                       flag_key:display = flag.key,
                       rollout_id:display = flag.rollout_id;
                       "flag references an unknown rollout");
            return None;
        };
        let (everyone_else, targeted) = rollout.rules.split_last()?;

        let decide = |rule: &Arc<Experiment>, variation: &Variation| FeatureDecision {
            experiment: Some(Arc::clone(rule)),
            holdout: None,
            variation: Some(variation.clone()),
            decision_source: DecisionSource::Rollout,
            cmab_uuid: None,
        };

        for rule in targeted {
            if !self.is_in_audience(config, &**rule, user, reasons) {
                continue;
            }
            match self
                .bucketer
                .bucket_to_variation(&**rule, user.bucketing_id(), user_id, reasons)
            {
                Some(variation) => return Some(decide(rule, variation)),
                None => {
                    reasons.push(format!(
                        "User \"{user_id}\" is not in the traffic of rule \"{}\", \
                         skipping to everyone else.",
                        rule.key
                    ));
                    break;
                }
            }
        }

        if !self.is_in_audience(config, &**everyone_else, user, reasons) {
            return None;
        }
        self.bucketer
            .bucket_to_variation(&**everyone_else, user.bucketing_id(), user_id, reasons)
            .map(|variation| decide(everyone_else, variation))
    }

    fn is_in_audience(
        &self,
        config: &ProjectConfig,
        rule: &dyn Rule,
        user: &UserContext,
        reasons: &mut DecisionReasons,
    ) -> bool {
        let evaluator = AudienceEvaluator::new(user.attributes(), user.qualified_segments());
        let matches = evaluator.evaluate(rule.audience_conditions(), config.audiences());
        reasons.push(format!(
            "Audiences for rule \"{}\" collectively evaluated to {}.",
            rule.key(),
            if matches { "TRUE" } else { "FALSE" }
        ));
        matches
    }
}

fn feature_tests<'a>(
    config: &'a ProjectConfig,
    flag: &'a FeatureFlag,
) -> impl Iterator<Item = &'a Arc<Experiment>> + 'a {
    flag.experiment_ids
        .iter()
        .filter_map(move |experiment_id| config.get_experiment_by_id(experiment_id))
}

fn whitelisted_variation<'e>(
    experiment: &'e Experiment,
    user_id: &str,
    reasons: &mut DecisionReasons,
) -> Option<&'e Variation> {
    let variation_key = experiment.forced_variations.get(user_id)?;
    match experiment.variation_by_key(variation_key) {
        Some(variation) => {
            reasons.push(format!(
                "User \"{user_id}\" is whitelisted into variation \"{variation_key}\" \
                 of experiment \"{}\".",
                experiment.key
            ));
            Some(variation)
        }
        None => {
            reasons.push(format!(
                "Whitelisted variation \"{variation_key}\" is not in experiment \"{}\".",
                experiment.key
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::DecisionService;
    use crate::{
        datafile::{ProjectConfig, TEST_DATAFILE},
        decision::{Bucketer, CmabDecision, CmabDecisionProvider, DecisionSource},
        sharder::DeterministicSharder,
        user_context::UserContext,
        Error, Result, UserAttributes,
    };

    fn config() -> ProjectConfig {
        ProjectConfig::from_datafile(TEST_DATAFILE).unwrap()
    }

    fn service(buckets: &[(&str, u32)]) -> DecisionService {
        let buckets = buckets
            .iter()
            .map(|(k, v)| ((*k).to_owned(), *v))
            .collect::<HashMap<_, _>>();
        DecisionService::new(Bucketer::new(Arc::new(DeterministicSharder(buckets))))
    }

    fn user(user_id: &str, attributes: &[(&str, crate::AttributeValue)]) -> UserContext {
        UserContext::new(
            user_id,
            attributes
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    fn vip(user_id: &str) -> UserContext {
        let mut user = user(user_id, &[]);
        user.set_qualified_segments(Some(vec!["vip".to_owned()]));
        user
    }

    struct FixedCmab {
        variation_id: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CmabDecisionProvider for FixedCmab {
        async fn get_decision(
            &self,
            rule_id: &str,
            _user_id: &str,
            attributes: &UserAttributes,
        ) -> Result<CmabDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(rule_id, "2201");
            assert!(attributes.keys().all(|it| it == "111094"));
            Ok(CmabDecision {
                variation_id: self.variation_id.to_owned(),
                cmab_uuid: "cmab-uuid-1".to_owned(),
            })
        }
    }

    struct FailingCmab;

    #[async_trait]
    impl CmabDecisionProvider for FailingCmab {
        async fn get_decision(
            &self,
            rule_id: &str,
            _: &str,
            _: &UserAttributes,
        ) -> Result<CmabDecision> {
            Err(Error::Cmab {
                rule_id: rule_id.to_owned(),
                message: "boom".to_owned(),
            })
        }
    }

    struct StuckCmab;

    #[async_trait]
    impl CmabDecisionProvider for StuckCmab {
        async fn get_decision(&self, _: &str, _: &str, _: &UserAttributes) -> Result<CmabDecision> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn feature_test_decision() {
        let config = config();
        let flag = config.get_flag("flag_1").unwrap();

        // user-1 + 2001 (exp_1) lands in the second half: variation "b".
        let service = service(&[("user-12001", 7000)]);
        let chrome_user = user("user-1", &[("browser", "chrome".into())]);
        let response = service
            .get_variation_for_feature(&config, flag, &chrome_user)
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.decision_source, DecisionSource::FeatureTest);
        assert_eq!(decision.variation.as_ref().unwrap().key, "b");
        assert_eq!(decision.rule_key(), Some("exp_1"));
        assert!(!decision.enabled());
        assert!(!response.reasons.is_empty());
    }

    #[tokio::test]
    async fn audience_miss_falls_back_to_rollout() {
        let config = config();
        let flag = config.get_flag("flag_1").unwrap();
        let service = service(&[]);

        // Beta user: targeted delivery rule.
        let response = service
            .get_variation_for_feature(&config, flag, &user("user-1", &[("beta", true.into())]))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.decision_source, DecisionSource::Rollout);
        assert_eq!(decision.rule_key(), Some("targeted_delivery"));
        assert!(decision.enabled());

        // Anyone else: everyone else rule.
        let response = service
            .get_variation_for_feature(&config, flag, &user("user-1", &[]))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.rule_key(), Some("everyone_else"));
        assert!(!decision.enabled());
    }

    #[tokio::test]
    async fn rollout_traffic_miss_skips_to_everyone_else() {
        let mut datafile: serde_json::Value = serde_json::from_str(TEST_DATAFILE).unwrap();
        let targeted = &mut datafile["rollouts"][0]["experiments"][0];
        targeted["trafficAllocation"][0]["endOfRange"] = 100.into();
        let config = ProjectConfig::from_datafile(&datafile.to_string()).unwrap();
        let flag = config.get_flag("flag_1").unwrap();

        let service = service(&[("user-16001", 500)]);
        let response = service
            .get_variation_for_feature(&config, flag, &user("user-1", &[("beta", true.into())]))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.rule_key(), Some("everyone_else"));
        assert!(response
            .reasons
            .iter()
            .any(|it| it.contains("skipping to everyone else")));
    }

    #[tokio::test]
    async fn no_rule_matches() {
        let config = config();
        let flag = config.get_flag("flag_3").unwrap();
        let response = service(&[])
            .get_variation_for_feature(&config, flag, &user("user-1", &[]))
            .await;
        let decision = response.result.unwrap();
        assert!(decision.variation.is_none());
        assert!(decision.experiment.is_none());
        assert_eq!(decision.decision_source, DecisionSource::Rollout);
        assert!(!decision.enabled());
        // holdout_3 targets this flag but is not running.
        assert!(response.reasons.iter().any(|it| it.contains("holdout_3")));
    }

    #[tokio::test]
    async fn included_holdout_wins_over_excluding_one() {
        let config = config();
        let service = service(&[]);

        let response = service
            .get_variation_for_feature(&config, config.get_flag("flag_1").unwrap(), &vip("user-1"))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.decision_source, DecisionSource::Holdout);
        assert!(decision.experiment.is_none());
        assert_eq!(decision.holdout.as_ref().unwrap().key, "holdout_2");
        assert_eq!(decision.rule_key(), Some("holdout_2"));
        assert!(!decision.enabled());

        let response = service
            .get_variation_for_feature(&config, config.get_flag("flag_2").unwrap(), &vip("user-1"))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.holdout.as_ref().unwrap().key, "holdout_1");
    }

    #[tokio::test]
    async fn holdout_audience_gates_users() {
        let config = config();
        let flag = config.get_flag("flag_2").unwrap();
        // user-1 + 7001 (group) lands in group_exp_1.
        let response = service(&[("user-17001", 100)])
            .get_variation_for_feature(&config, flag, &user("user-1", &[]))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.decision_source, DecisionSource::FeatureTest);
        assert_eq!(decision.rule_key(), Some("group_exp_1"));
    }

    #[tokio::test]
    async fn group_miss_falls_back_to_rollout() {
        let config = config();
        let flag = config.get_flag("flag_2").unwrap();
        let response = service(&[("user-17001", 9000)])
            .get_variation_for_feature(&config, flag, &user("user-1", &[]))
            .await;
        let decision = response.result.unwrap();
        assert_eq!(decision.rule_key(), Some("everyone_else_2"));
        assert!(decision.enabled());
    }

    #[tokio::test]
    async fn whitelisted_and_forced_variations() {
        let config = config();
        let flag = config.get_flag("flag_1").unwrap();
        let service = service(&[]);

        // Whitelisted users bypass the audience and the holdout.
        let mut forced_user = vip("forced_user");
        forced_user.set_attribute("browser", "safari");
        let decision = service
            .get_variation_for_feature(&config, flag, &forced_user)
            .await
            .result
            .unwrap();
        assert_eq!(decision.variation.unwrap().key, "b");

        assert!(service.set_forced_variation(&config, "exp_1", "user-9", Some("a")));
        assert_eq!(
            service.get_forced_variation(&config, "exp_1", "user-9").unwrap().key,
            "a"
        );
        let decision = service
            .get_variation_for_feature(&config, flag, &user("user-9", &[]))
            .await
            .result
            .unwrap();
        assert_eq!(decision.variation.unwrap().key, "a");
        assert_eq!(decision.decision_source, DecisionSource::FeatureTest);

        assert!(service.set_forced_variation(&config, "exp_1", "user-9", None));
        assert!(service.get_forced_variation(&config, "exp_1", "user-9").is_none());

        assert!(!service.set_forced_variation(&config, "exp_1", "user-9", Some("nope")));
        assert!(!service.set_forced_variation(&config, "nope", "user-9", Some("a")));
    }

    #[tokio::test]
    async fn cmab_decision() {
        let config = config();
        let flag = config.get_flag("cmab_flag").unwrap();
        let cmab = Arc::new(FixedCmab {
            variation_id: "2203",
            calls: AtomicUsize::new(0),
        });
        let service = service(&[]).with_cmab_provider(cmab.clone());

        let decision = service
            .get_variation_for_feature(
                &config,
                flag,
                &user("user-1", &[("browser", "chrome".into()), ("beta", true.into())]),
            )
            .await
            .result
            .unwrap();
        assert_eq!(decision.variation.unwrap().key, "arm_b");
        assert_eq!(decision.cmab_uuid.as_deref(), Some("cmab-uuid-1"));
        assert_eq!(cmab.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flag_errors_are_isolated() {
        let config = config();
        let flags = vec![
            Arc::clone(config.get_flag("cmab_flag").unwrap()),
            Arc::clone(config.get_flag("flag_2").unwrap()),
        ];
        let service = service(&[]).with_cmab_provider(Arc::new(FailingCmab));

        let responses = service
            .get_variations_for_feature_list(&config, &flags, &user("user-1", &[]))
            .await;
        assert_eq!(responses.len(), 2);
        assert!(matches!(responses[0].result, Err(Error::Cmab { .. })));
        assert!(responses[0].reasons.iter().any(|it| it.contains("failed")));
        assert!(responses[1].result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_flag_times_out() {
        let config = config();
        let flags = vec![
            Arc::clone(config.get_flag("cmab_flag").unwrap()),
            Arc::clone(config.get_flag("flag_1").unwrap()),
        ];
        let service = service(&[])
            .with_cmab_provider(Arc::new(StuckCmab))
            .with_decision_timeout(Duration::from_millis(500));

        let responses = service
            .get_variations_for_feature_list(&config, &flags, &user("user-1", &[]))
            .await;
        assert!(matches!(responses[0].result, Err(Error::DecisionTimeout(_))));
        assert_eq!(responses[0].flag_key, "cmab_flag");
        assert!(!responses[0].reasons.is_empty());
        assert!(responses[1].result.is_ok());
    }
}
