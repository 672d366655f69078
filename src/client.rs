use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    configuration_store::ConfigurationStore,
    datafile::{FeatureFlag, ProjectConfig, VariableType, Variation},
    decision::{
        Bucketer, CmabDecisionProvider, DecisionResponse, DecisionService, DecisionSource,
        FeatureDecision, HttpCmabClient,
    },
    events::{
        BatchEventProcessor, DispatchingDrain, DurableRetryStore, EntityRef, EventDispatcher,
        EventDrain, EventTags, HttpEventDispatcher, InMemoryPersistentCache, PersistentCache,
        UserEvent,
    },
    odp::{GraphqlSegmentApiClient, LruCache, SegmentApiClient, SegmentManager, SegmentOption},
    poller::{Poller, PollerStartConfig},
    user_context::UserContext,
    ClientConfig, Error, PollerConfig, Result, UserAttributes,
};

/// User key qualified segments are fetched for.
const ODP_USER_KEY: &str = "fs_user_id";

/// Options of [`Client::decide`], [`Client::decide_for_keys`] and [`Client::decide_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecideOption {
    /// Do not send impression events.
    DisableDecisionEvent,
    /// Leave disabled flags out of [`Client::decide_for_keys`] and [`Client::decide_all`].
    EnabledFlagsOnly,
    /// Fill [`Decision::reasons`].
    IncludeReasons,
    /// Leave [`Decision::variables`] empty.
    ExcludeVariables,
}

/// Value of a feature variable, typed after its declaration.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(untagged)]
pub enum FeatureVariable {
    #[allow(missing_docs)]
    String(String),
    #[allow(missing_docs)]
    Integer(i64),
    #[allow(missing_docs)]
    Double(f64),
    #[allow(missing_docs)]
    Boolean(bool),
    #[allow(missing_docs)]
    Json(serde_json::Value),
}

impl FeatureVariable {
    /// Parse the datafile representation of a `variable_type` value.
    fn parse(variable_type: VariableType, raw: &str) -> Option<FeatureVariable> {
        match variable_type {
            VariableType::String => Some(FeatureVariable::String(raw.to_owned())),
            VariableType::Integer => raw.parse().ok().map(FeatureVariable::Integer),
            VariableType::Double => raw.parse().ok().map(FeatureVariable::Double),
            VariableType::Boolean => raw.parse().ok().map(FeatureVariable::Boolean),
            VariableType::Json => serde_json::from_str(raw).ok().map(FeatureVariable::Json),
        }
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureVariable::String(s) => Some(s),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FeatureVariable::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FeatureVariable::Double(n) => Some(*n),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FeatureVariable::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FeatureVariable::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome of deciding a flag for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// `None` if the user did not qualify for any rule, or the decision failed.
    pub variation_key: Option<String>,
    /// Whether the flag is on for the user.
    pub enabled: bool,
    /// Variables of the flag, keyed by variable key.
    pub variables: HashMap<String, FeatureVariable>,
    /// Key of the experiment, rollout rule or holdout that decided.
    pub rule_key: Option<String>,
    #[allow(missing_docs)]
    pub flag_key: String,
    /// The user the decision was made for.
    pub user_context: UserContext,
    /// How the decision was made. Only filled with [`DecideOption::IncludeReasons`], except for
    /// failed decisions which always carry the failure.
    pub reasons: Vec<String>,
}

impl Decision {
    fn error(flag_key: &str, user: &UserContext, reasons: Vec<String>) -> Decision {
        Decision {
            variation_key: None,
            enabled: false,
            variables: HashMap::new(),
            rule_key: None,
            flag_key: flag_key.to_owned(),
            user_context: user.clone(),
            reasons,
        }
    }
}

/// A client for Optimizely feature flags.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```
/// # use optimizely::{Client, ClientConfig};
/// Client::new(ClientConfig::from_sdk_key("sdk-key"));
/// ```
pub struct Client {
    sdk_key: String,
    configuration_store: Arc<ConfigurationStore>,
    decision_service: DecisionService,
    segment_manager: Arc<SegmentManager>,
    event_processor: BatchEventProcessor,
    default_decide_options: Vec<DecideOption>,
    poller_config: PollerConfig,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("event_processor", &self.event_processor)
            .field("default_decide_options", &self.default_decide_options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use optimizely::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_sdk_key("sdk-key"));
    /// ```
    pub fn new(config: ClientConfig) -> Self {
        Client::with_bucketer(config, Bucketer::default())
    }

    fn with_bucketer(config: ClientConfig, bucketer: Bucketer) -> Self {
        let http_client = reqwest::Client::new();

        let configuration_store = Arc::new(ConfigurationStore::new());
        if let Some(datafile) = &config.datafile {
            match ProjectConfig::from_datafile(datafile) {
                Ok(project_config) => {
                    configuration_store.set_configuration(project_config);
                }
                Err(err) => {
                    log::warn!(target: "optimizely", err:display = err;
                               "ignoring invalid datafile");
                }
            }
        }

        let cmab: Arc<dyn CmabDecisionProvider> = match config.cmab {
            Some(cmab) => cmab,
            None => Arc::new(HttpCmabClient::new()),
        };
        let decision_service = DecisionService::new(bucketer)
            .with_cmab_provider(cmab)
            .with_decision_timeout(config.decision_timeout);

        let odp_config = configuration_store
            .get_configuration()
            .map(|it| it.odp_config().clone())
            .unwrap_or_default();
        let segment_api: Arc<dyn SegmentApiClient> = match config.segment_api {
            Some(segment_api) => segment_api,
            None => Arc::new(GraphqlSegmentApiClient::new(http_client.clone())),
        };
        let segment_manager = Arc::new(SegmentManager::new(
            odp_config,
            Arc::new(LruCache::<Vec<String>>::new(
                config.segment_cache.max_size,
                config.segment_cache.timeout,
            )),
            segment_api,
        ));

        let dispatcher: Arc<dyn EventDispatcher> = match config.event_dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(HttpEventDispatcher::new(http_client.clone())),
        };
        let drain: Arc<dyn EventDrain> = if config.event_processor.durable_store {
            let cache: Arc<dyn PersistentCache> = match config.persistent_cache {
                Some(cache) => cache,
                None => Arc::new(InMemoryPersistentCache::default()),
            };
            Arc::new(DurableRetryStore::new(
                dispatcher,
                cache,
                config.event_processor.store_max_size,
            ))
        } else {
            Arc::new(DispatchingDrain::new(
                dispatcher,
                config.event_processor.max_retries,
            ))
        };
        let event_processor = BatchEventProcessor::new(&config.event_processor, drain);

        Client {
            sdk_key: config.sdk_key,
            configuration_store,
            decision_service,
            segment_manager,
            event_processor,
            default_decide_options: config.default_decide_options,
            poller_config: config.poller,
            http_client,
        }
    }

    /// Start event delivery, replaying events stored by a previous run, and a poller task to fetch
    /// the datafile. Must be called within a tokio runtime.
    pub async fn start(&self) -> Result<Poller> {
        self.event_processor.start().await;
        Poller::start(PollerStartConfig {
            store: Arc::clone(&self.configuration_store),
            segment_manager: Some(Arc::clone(&self.segment_manager)),
            sdk_key: self.sdk_key.clone(),
            config: self.poller_config.clone(),
            client: self.http_client.clone(),
        })
    }

    /// The datafile decisions are currently made with.
    pub fn project_config(&self) -> Option<Arc<ProjectConfig>> {
        self.configuration_store.get_configuration()
    }

    #[allow(missing_docs)]
    pub fn create_user_context(
        &self,
        user_id: impl Into<String>,
        attributes: UserAttributes,
    ) -> UserContext {
        UserContext::new(user_id, attributes)
    }

    /// Decide `flag_key` for the user.
    ///
    /// Never fails: problems are reported as a disabled decision with reasons.
    /// [`DecideOption::EnabledFlagsOnly`] has no effect here.
    pub async fn decide(
        &self,
        user: &UserContext,
        flag_key: &str,
        options: &[DecideOption],
    ) -> Decision {
        let options = self.decide_options(options);
        let Some(config) = self.configuration_store.get_configuration() else {
            log::warn!(target: "optimizely", flag_key, user_id = user.user_id();
                       "deciding a flag before the datafile has been fetched");
            return Decision::error(flag_key, user, vec![not_ready_reason()]);
        };
        let Some(flag) = config.get_flag(flag_key) else {
            log::warn!(target: "optimizely", flag_key; "flag not found");
            return Decision::error(flag_key, user, vec![flag_not_found_reason(flag_key)]);
        };

        let flags = [Arc::clone(flag)];
        self.decide_flags(&config, user, &flags, &options, false)
            .await
            .pop()
            .unwrap_or_else(|| Decision::error(flag_key, user, Vec::new()))
    }

    /// Decide every flag of `flag_keys`. Unknown flags yield a disabled decision with reasons.
    pub async fn decide_for_keys(
        &self,
        user: &UserContext,
        flag_keys: &[&str],
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let options = self.decide_options(options);
        let Some(config) = self.configuration_store.get_configuration() else {
            log::warn!(target: "optimizely", user_id = user.user_id();
                       "deciding flags before the datafile has been fetched");
            return flag_keys
                .iter()
                .map(|flag_key| {
                    let decision = Decision::error(flag_key, user, vec![not_ready_reason()]);
                    ((*flag_key).to_owned(), decision)
                })
                .collect();
        };

        let mut decisions = HashMap::new();
        let mut flags = Vec::with_capacity(flag_keys.len());
        for flag_key in flag_keys {
            match config.get_flag(flag_key) {
                Some(flag) => flags.push(Arc::clone(flag)),
                None => {
                    log::warn!(target: "optimizely", flag_key; "flag not found");
                    let decision =
                        Decision::error(flag_key, user, vec![flag_not_found_reason(flag_key)]);
                    decisions.insert((*flag_key).to_owned(), decision);
                }
            }
        }

        for decision in self
            .decide_flags(&config, user, &flags, &options, true)
            .await
        {
            decisions.insert(decision.flag_key.clone(), decision);
        }
        decisions
    }

    /// Decide every flag of the datafile.
    pub async fn decide_all(
        &self,
        user: &UserContext,
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let Some(config) = self.configuration_store.get_configuration() else {
            log::warn!(target: "optimizely", user_id = user.user_id();
                       "deciding flags before the datafile has been fetched");
            return HashMap::new();
        };
        let flag_keys = config
            .flags()
            .iter()
            .map(|it| it.key.as_str())
            .collect::<Vec<_>>();
        self.decide_for_keys(user, &flag_keys, options).await
    }

    /// Record a conversion of `event_key` for the user.
    pub async fn track(
        &self,
        event_key: &str,
        user: &UserContext,
        tags: Option<EventTags>,
    ) -> Result<()> {
        let Some(config) = self.configuration_store.get_configuration() else {
            log::warn!(target: "optimizely", event_key, user_id = user.user_id();
                       "tracking an event before the datafile has been fetched");
            return Err(Error::ConfigurationMissing);
        };
        let Some(event) = config.get_event(event_key) else {
            log::warn!(target: "optimizely", event_key, user_id = user.user_id();
                       "tracking an unknown event");
            return Err(Error::EventNotFound(event_key.to_owned()));
        };

        let event = UserEvent::conversion(
            &config,
            EntityRef {
                id: event.id.clone(),
                key: event.key.clone(),
            },
            user,
            tags,
        );
        log::trace!(target: "optimizely",
                    event_key,
                    user_id = user.user_id(),
                    event:serde;
                    "tracking conversion");
        self.event_processor.process(event).await
    }

    /// Force `user_id` into `variation_key` of `experiment_key`, or clear the forced variation if
    /// `variation_key` is `None`. Returns `false` if the experiment or variation is unknown.
    pub fn set_forced_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let Some(config) = self.configuration_store.get_configuration() else {
            return false;
        };
        self.decision_service
            .set_forced_variation(&config, experiment_key, user_id, variation_key)
    }

    /// Key of the variation `user_id` was forced into.
    pub fn get_forced_variation(&self, experiment_key: &str, user_id: &str) -> Option<String> {
        let config = self.configuration_store.get_configuration()?;
        self.decision_service
            .get_forced_variation(&config, experiment_key, user_id)
            .map(|it| it.key)
    }

    /// Fetch the ODP segments the user qualifies for and store them in `user`. Returns `false`,
    /// leaving `user` without segments, if they could not be fetched.
    pub async fn fetch_qualified_segments(
        &self,
        user: &mut UserContext,
        options: &[SegmentOption],
    ) -> bool {
        let segments = self
            .segment_manager
            .fetch_qualified_segments(ODP_USER_KEY, user.user_id(), options)
            .await;
        let fetched = segments.is_some();
        user.set_qualified_segments(segments);
        fetched
    }

    /// Flush and deliver pending events. Events tracked afterwards are dropped.
    pub async fn close(&self) {
        self.event_processor.stop().await;
    }

    fn decide_options(&self, options: &[DecideOption]) -> HashSet<DecideOption> {
        self.default_decide_options
            .iter()
            .chain(options)
            .copied()
            .collect()
    }

    async fn decide_flags(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        flags: &[Arc<FeatureFlag>],
        options: &HashSet<DecideOption>,
        filter_disabled: bool,
    ) -> Vec<Decision> {
        let responses = self
            .decision_service
            .get_variations_for_feature_list(config, flags, user)
            .await;

        let mut decisions = Vec::with_capacity(responses.len());
        for (flag, response) in flags.iter().zip(responses) {
            let DecisionResponse {
                flag_key,
                result,
                reasons,
            } = response;

            let decision = match result {
                Ok(decision) => decision,
                Err(err) => {
                    log::warn!(target: "optimizely",
                               flag_key:display = flag_key,
                               user_id = user.user_id(),
                               err:display = err;
                               "failed to decide flag");
                    if !(filter_disabled && options.contains(&DecideOption::EnabledFlagsOnly)) {
                        decisions.push(Decision::error(&flag_key, user, reasons.into_vec()));
                    }
                    continue;
                }
            };

            log::trace!(target: "optimizely",
                        flag_key:display = flag_key,
                        user_id = user.user_id(),
                        attributes:serde = user.attributes(),
                        variation_key:serde = decision.variation.as_ref().map(|it| &it.key),
                        rule_key:serde = decision.rule_key();
                        "decided flag");

            if !options.contains(&DecideOption::DisableDecisionEvent)
                && sends_impression(config, &decision)
            {
                let event = UserEvent::impression(config, &flag_key, &decision, user);
                if let Err(err) = self.event_processor.process(event).await {
                    log::warn!(target: "optimizely",
                               flag_key:display = flag_key,
                               err:display = err;
                               "failed to send impression");
                }
            }

            let enabled = decision.enabled();
            if filter_disabled && !enabled && options.contains(&DecideOption::EnabledFlagsOnly) {
                continue;
            }

            let variables = if options.contains(&DecideOption::ExcludeVariables) {
                HashMap::new()
            } else {
                resolve_variables(flag, decision.variation.as_ref())
            };

            decisions.push(Decision {
                variation_key: decision.variation.as_ref().map(|it| it.key.clone()),
                enabled,
                variables,
                rule_key: decision.rule_key().map(str::to_owned),
                flag_key,
                user_context: user.clone(),
                reasons: if options.contains(&DecideOption::IncludeReasons) {
                    reasons.into_vec()
                } else {
                    Vec::new()
                },
            });
        }
        decisions
    }
}

/// Experiments and holdouts always report impressions, rollouts only when the project asks for
/// flag decisions.
fn sends_impression(config: &ProjectConfig, decision: &FeatureDecision) -> bool {
    match decision.decision_source {
        DecisionSource::FeatureTest | DecisionSource::Experiment | DecisionSource::Holdout => true,
        DecisionSource::Rollout => config.send_flag_decisions(),
    }
}

/// Variable values of a disabled variation fall back to the defaults.
fn resolve_variables(
    flag: &FeatureFlag,
    variation: Option<&Variation>,
) -> HashMap<String, FeatureVariable> {
    let variation = variation.filter(|it| it.feature_enabled);
    flag.variables
        .iter()
        .filter_map(|variable| {
            let raw = variation
                .and_then(|it| it.variable_value(&variable.id))
                .unwrap_or(variable.default_value.as_str());
            let value = FeatureVariable::parse(variable.effective_type(), raw);
            if value.is_none() {
                log::warn!(target: "optimizely",
                           flag_key:display = flag.key,
                           variable_key:display = variable.key,
                           value = raw;
                           "invalid variable value, skipping");
            }
            value.map(|value| (variable.key.clone(), value))
        })
        .collect()
}

fn not_ready_reason() -> String {
    "Optimizely SDK not configured properly yet.".to_owned()
}

fn flag_not_found_reason(flag_key: &str) -> String {
    format!("No flag was found for key \"{flag_key}\".")
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use async_trait::async_trait;

    use super::{Client, DecideOption, FeatureVariable};
    use crate::{
        datafile::TEST_DATAFILE,
        decision::{Bucketer, CmabDecision, CmabDecisionProvider},
        events::RecordingDispatcher,
        odp::SegmentApiClient,
        sharder::DeterministicSharder,
        ClientConfig, Error, Result, UserAttributes,
    };

    fn client_with(
        datafile: Option<&str>,
        configure: impl FnOnce(&mut ClientConfig),
    ) -> (Client, Arc<RecordingDispatcher>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut config = ClientConfig::from_sdk_key("sdk-key");
        config
            .event_dispatcher(dispatcher.clone())
            .cmab_provider(Arc::new(FirstArmCmab));
        if let Some(datafile) = datafile {
            config.datafile(datafile);
        }
        configure(&mut config);

        // Every user lands in bucket 0.
        let bucketer = Bucketer::new(Arc::new(DeterministicSharder(HashMap::new())));
        (Client::with_bucketer(config, bucketer), dispatcher)
    }

    fn client() -> (Client, Arc<RecordingDispatcher>) {
        client_with(Some(TEST_DATAFILE), |_| {})
    }

    fn chrome_user(client: &Client) -> crate::UserContext {
        client.create_user_context(
            "user-1",
            [("browser".to_owned(), "chrome".into())]
                .into_iter()
                .collect::<UserAttributes>(),
        )
    }

    /// Rule types of every delivered impression, in order.
    fn impression_rule_types(dispatcher: &RecordingDispatcher) -> Vec<String> {
        dispatcher
            .delivered_events()
            .iter()
            .flat_map(|it| it.params.visitors.iter())
            .flat_map(|it| it.snapshots.iter())
            .flat_map(|it| it.decisions.iter())
            .map(|it| it.metadata.rule_type.clone())
            .collect()
    }

    struct FirstArmCmab;

    #[async_trait]
    impl CmabDecisionProvider for FirstArmCmab {
        async fn get_decision(
            &self,
            _rule_id: &str,
            _user_id: &str,
            _attributes: &UserAttributes,
        ) -> Result<CmabDecision> {
            Ok(CmabDecision {
                variation_id: "2202".to_owned(),
                cmab_uuid: "cmab-uuid".to_owned(),
            })
        }
    }

    struct FakeSegmentApi;

    #[async_trait]
    impl SegmentApiClient for FakeSegmentApi {
        async fn fetch_segments(
            &self,
            _api_key: &str,
            _api_host: &str,
            user_key: &str,
            user_value: &str,
            segments_to_check: &[String],
        ) -> Result<Vec<String>> {
            assert_eq!(user_key, "fs_user_id");
            assert_eq!(user_value, "user-1");
            Ok(segments_to_check.to_vec())
        }
    }

    #[tokio::test]
    async fn returns_error_decision_while_no_configuration() {
        let (client, _) = client_with(None, |_| {});
        let user = client.create_user_context("user-1", UserAttributes::new());

        let decision = client.decide(&user, "flag_1", &[]).await;
        assert_eq!(decision.variation_key, None);
        assert!(!decision.enabled);
        assert_eq!(
            decision.reasons,
            vec!["Optimizely SDK not configured properly yet.".to_owned()]
        );

        assert!(matches!(
            client.track("purchase", &user, None).await,
            Err(Error::ConfigurationMissing)
        ));
    }

    #[tokio::test]
    async fn decides_feature_test_with_variables() {
        let (client, dispatcher) = client();
        let user = chrome_user(&client);

        let decision = client.decide(&user, "flag_1", &[]).await;
        assert_eq!(decision.variation_key.as_deref(), Some("a"));
        assert!(decision.enabled);
        assert_eq!(decision.rule_key.as_deref(), Some("exp_1"));
        assert_eq!(decision.flag_key, "flag_1");
        assert!(decision.reasons.is_empty());

        let variables = &decision.variables;
        assert_eq!(variables["color"], FeatureVariable::String("red".to_owned()));
        assert_eq!(variables["size"].as_integer(), Some(7));
        assert_eq!(variables["ratio"].as_double(), Some(0.5));
        assert_eq!(variables["dark_mode"].as_boolean(), Some(false));
        assert_eq!(
            variables["settings"].as_json(),
            Some(&serde_json::json!({"level": 1}))
        );

        client.close().await;
        assert_eq!(impression_rule_types(&dispatcher), vec!["feature-test"]);
    }

    #[tokio::test]
    async fn decide_options() {
        let (client, dispatcher) = client();
        let user = chrome_user(&client);

        let decision = client
            .decide(
                &user,
                "flag_1",
                &[
                    DecideOption::DisableDecisionEvent,
                    DecideOption::ExcludeVariables,
                    DecideOption::IncludeReasons,
                ],
            )
            .await;
        assert!(decision.variables.is_empty());
        assert!(!decision.reasons.is_empty());

        client.close().await;
        assert!(dispatcher.delivered_events().is_empty());
    }

    #[tokio::test]
    async fn unknown_flags_yield_error_decisions() {
        let (client, _) = client();
        let user = chrome_user(&client);

        let decisions = client
            .decide_for_keys(&user, &["flag_1", "missing"], &[])
            .await;
        assert!(decisions["flag_1"].enabled);
        assert!(!decisions["missing"].enabled);
        assert_eq!(
            decisions["missing"].reasons,
            vec!["No flag was found for key \"missing\".".to_owned()]
        );

        let decision = client.decide(&user, "missing", &[]).await;
        assert!(!decision.enabled);
        assert_eq!(decision.variation_key, None);
        assert_eq!(decision.flag_key, "missing");
        assert_eq!(decision.reasons.len(), 1);
    }

    #[tokio::test]
    async fn decide_all_enabled_flags_only() {
        let (client, _) = client();
        // Not a chrome user: flag_1 falls back to the disabled "everyone else" rollout rule.
        let user = client.create_user_context("user-1", UserAttributes::new());

        let all = client
            .decide_all(&user, &[DecideOption::DisableDecisionEvent])
            .await;
        assert_eq!(all.len(), 4);
        assert!(!all["flag_1"].enabled);
        assert_eq!(all["flag_1"].rule_key.as_deref(), Some("everyone_else"));

        let enabled = client
            .decide_all(
                &user,
                &[
                    DecideOption::DisableDecisionEvent,
                    DecideOption::EnabledFlagsOnly,
                ],
            )
            .await;
        let mut keys = enabled.keys().map(String::as_str).collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(keys, vec!["cmab_flag", "flag_2"]);
        assert!(enabled.values().all(|it| it.enabled));
    }

    #[tokio::test]
    async fn rollout_impressions_follow_send_flag_decisions() {
        let mut datafile: serde_json::Value = serde_json::from_str(TEST_DATAFILE).unwrap();
        let user_attributes = UserAttributes::new();

        let (client, dispatcher) = client();
        let user = client.create_user_context("user-1", user_attributes.clone());
        client.decide(&user, "flag_1", &[]).await;
        client.close().await;
        assert_eq!(impression_rule_types(&dispatcher), vec!["rollout"]);

        datafile["sendFlagDecisions"] = false.into();
        let datafile = datafile.to_string();
        let (client, dispatcher) = client_with(Some(&datafile), |_| {});
        let user = client.create_user_context("user-1", user_attributes);
        let decision = client.decide(&user, "flag_1", &[]).await;
        client.close().await;
        assert_eq!(decision.rule_key.as_deref(), Some("everyone_else"));
        assert!(dispatcher.delivered_events().is_empty());
    }

    #[tokio::test]
    async fn forced_variation() {
        let (client, _) = client();
        let user = chrome_user(&client);

        assert!(client.set_forced_variation("exp_1", "user-1", Some("b")));
        assert_eq!(
            client.get_forced_variation("exp_1", "user-1").as_deref(),
            Some("b")
        );
        let decision = client.decide(&user, "flag_1", &[]).await;
        assert_eq!(decision.variation_key.as_deref(), Some("b"));
        // Disabled variation: variables keep their defaults.
        assert_eq!(decision.variables["color"].as_str(), Some("blue"));

        assert!(!client.set_forced_variation("exp_1", "user-1", Some("missing")));
        assert!(client.set_forced_variation("exp_1", "user-1", None));
        assert_eq!(client.get_forced_variation("exp_1", "user-1"), None);
    }

    #[tokio::test]
    async fn qualified_segments_enable_holdout() {
        let (client, dispatcher) = client_with(Some(TEST_DATAFILE), |config| {
            config.segment_api(Arc::new(FakeSegmentApi));
        });
        let mut user = chrome_user(&client);

        assert!(client.fetch_qualified_segments(&mut user, &[]).await);
        assert!(user.is_qualified_for("vip"));

        let decision = client.decide(&user, "flag_1", &[]).await;
        assert_eq!(decision.rule_key.as_deref(), Some("holdout_2"));
        assert_eq!(decision.variation_key.as_deref(), Some("holdout_2_off"));
        assert!(!decision.enabled);

        client.close().await;
        assert_eq!(impression_rule_types(&dispatcher), vec!["holdout"]);
    }

    #[tokio::test]
    async fn tracks_conversions() {
        let (client, dispatcher) = client();
        let user = chrome_user(&client);

        let tags = [("revenue".to_owned(), serde_json::json!(4200))]
            .into_iter()
            .collect();
        client.track("purchase", &user, Some(tags)).await.unwrap();
        assert!(matches!(
            client.track("missing", &user, None).await,
            Err(Error::EventNotFound(_))
        ));
        client.close().await;

        let events = dispatcher.delivered_events();
        assert_eq!(events.len(), 1);
        let event = &events[0].params.visitors[0].snapshots[0].events[0];
        assert_eq!(event.key, "purchase");
        assert_eq!(event.revenue, Some(4200));

        assert!(matches!(
            client.track("purchase", &user, None).await,
            Err(Error::ProcessorStopped)
        ));
    }
}
