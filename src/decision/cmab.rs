use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Error, Result, UserAttributes};

/// Variation chosen by a contextual multi-armed bandit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabDecision {
    #[allow(missing_docs)]
    pub variation_id: String,
    /// Identifies this prediction in impression events.
    pub cmab_uuid: String,
}

/// Remote decision maker for CMAB experiments.
#[async_trait]
pub trait CmabDecisionProvider: Send + Sync {
    /// Choose a variation of `rule_id` for the user. `attributes` are keyed by attribute id and
    /// limited to the attributes the experiment declares.
    async fn get_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Result<CmabDecision>;
}

/// [`CmabDecisionProvider`] backed by the prediction endpoint.
#[derive(Debug, Clone)]
pub struct HttpCmabClient {
    client: reqwest::Client,
    prediction_endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionRequest<'a> {
    instances: Vec<PredictionInstance<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionInstance<'a> {
    visitor_id: &'a str,
    experiment_id: &'a str,
    attributes: Vec<PredictionAttribute<'a>>,
    #[serde(rename = "cmabUUID")]
    cmab_uuid: &'a str,
}

#[derive(Serialize)]
struct PredictionAttribute<'a> {
    id: &'a str,
    value: &'a AttributeValue,
    #[serde(rename = "type")]
    attribute_type: &'static str,
}

#[derive(Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    variation_id: String,
}

impl Default for HttpCmabClient {
    fn default() -> Self {
        HttpCmabClient::new()
    }
}

impl HttpCmabClient {
    /// Default prediction endpoint. `{rule_id}` is replaced with the experiment id.
    pub const DEFAULT_PREDICTION_ENDPOINT: &'static str =
        "https://prediction.cmab.optimizely.com/predict/{rule_id}";

    #[allow(missing_docs)]
    pub fn new() -> HttpCmabClient {
        HttpCmabClient {
            client: reqwest::Client::new(),
            prediction_endpoint: HttpCmabClient::DEFAULT_PREDICTION_ENDPOINT.to_owned(),
        }
    }

    /// Override the prediction endpoint template.
    pub fn with_prediction_endpoint(mut self, prediction_endpoint: impl Into<String>) -> Self {
        self.prediction_endpoint = prediction_endpoint.into();
        self
    }
}

#[async_trait]
impl CmabDecisionProvider for HttpCmabClient {
    async fn get_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Result<CmabDecision> {
        let cmab_uuid = uuid::Uuid::new_v4().to_string();
        let request = PredictionRequest {
            instances: vec![PredictionInstance {
                visitor_id: user_id,
                experiment_id: rule_id,
                attributes: attributes
                    .iter()
                    .map(|(id, value)| PredictionAttribute {
                        id,
                        value,
                        attribute_type: "custom_attribute",
                    })
                    .collect(),
                cmab_uuid: &cmab_uuid,
            }],
        };

        let url = self.prediction_endpoint.replace("{rule_id}", rule_id);
        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Cmab {
                rule_id: rule_id.to_owned(),
                message: format!("prediction endpoint replied with {status}"),
            });
        }

        let response: PredictionResponse = response.json().await?;
        let variation_id = response
            .predictions
            .into_iter()
            .next()
            .map(|it| it.variation_id)
            .ok_or_else(|| Error::Cmab {
                rule_id: rule_id.to_owned(),
                message: "prediction response has no predictions".to_owned(),
            })?;

        log::debug!(target: "optimizely", rule_id, user_id, variation_id:display = variation_id;
                    "received CMAB decision");

        Ok(CmabDecision {
            variation_id,
            cmab_uuid,
        })
    }
}
