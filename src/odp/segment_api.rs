use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{Error, Result};

/// Node state of a segment the user qualifies for.
const QUALIFIED_STATE: &str = "qualified";

/// Remote source of qualified segments.
#[async_trait]
pub trait SegmentApiClient: Send + Sync {
    /// Returns the subset of `segments_to_check` the user qualifies for.
    async fn fetch_segments(
        &self,
        api_key: &str,
        api_host: &str,
        user_key: &str,
        user_value: &str,
        segments_to_check: &[String],
    ) -> Result<Vec<String>>;
}

/// [`SegmentApiClient`] querying the ODP GraphQL endpoint.
#[derive(Debug, Clone, Default)]
pub struct GraphqlSegmentApiClient {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
    #[serde(default)]
    extensions: Option<GraphqlErrorExtensions>,
}

#[derive(Deserialize)]
struct GraphqlErrorExtensions {
    classification: Option<String>,
}

#[derive(Deserialize)]
struct GraphqlData {
    customer: Option<Customer>,
}

#[derive(Deserialize)]
struct Customer {
    audiences: Audiences,
}

#[derive(Deserialize)]
struct Audiences {
    edges: Vec<Edge>,
}

#[derive(Deserialize)]
struct Edge {
    node: Node,
}

#[derive(Deserialize)]
struct Node {
    name: String,
    state: String,
}

impl GraphqlSegmentApiClient {
    #[allow(missing_docs)]
    pub fn new(client: reqwest::Client) -> GraphqlSegmentApiClient {
        GraphqlSegmentApiClient { client }
    }
}

fn query(user_key: &str, user_value: &str, segments_to_check: &[String]) -> serde_json::Value {
    json!({
        "query": format!(
            "query($userId: String, $audiences: [String]) {{\
             customer({user_key}: $userId) {{\
             audiences(subset: $audiences) {{edges {{node {{name state}}}}}}}}}}"
        ),
        "variables": {
            "userId": user_value,
            "audiences": segments_to_check,
        },
    })
}

fn parse_segments(response: GraphqlResponse) -> Result<Vec<String>> {
    if let Some(error) = response.errors.into_iter().next() {
        let classification = error
            .extensions
            .and_then(|it| it.classification)
            .unwrap_or_default();
        return Err(Error::SegmentFetch(if classification == "InvalidIdentifierException" {
            "invalid identifier".to_owned()
        } else {
            error.message
        }));
    }

    let customer = response
        .data
        .and_then(|it| it.customer)
        .ok_or_else(|| Error::SegmentFetch("response has no customer".to_owned()))?;

    Ok(customer
        .audiences
        .edges
        .into_iter()
        .filter(|edge| edge.node.state == QUALIFIED_STATE)
        .map(|edge| edge.node.name)
        .collect())
}

#[async_trait]
impl SegmentApiClient for GraphqlSegmentApiClient {
    async fn fetch_segments(
        &self,
        api_key: &str,
        api_host: &str,
        user_key: &str,
        user_value: &str,
        segments_to_check: &[String],
    ) -> Result<Vec<String>> {
        if segments_to_check.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v3/graphql", api_host.trim_end_matches('/'));
        log::debug!(target: "optimizely", url:display = url, user_key;
                    "fetching qualified segments");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .json(&query(user_key, user_value, segments_to_check))
            .send()
            .await?
            .error_for_status()?;

        parse_segments(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_segments, query, GraphqlResponse};
    use crate::Error;

    fn response(value: serde_json::Value) -> GraphqlResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn query_targets_user_key() {
        let query = query("fs_user_id", "user-1", &["a".to_owned(), "b".to_owned()]);
        let text = query["query"].as_str().unwrap();
        assert!(text.contains("customer(fs_user_id: $userId)"));
        assert!(text.contains("audiences(subset: $audiences)"));
        assert_eq!(query["variables"], json!({"userId": "user-1", "audiences": ["a", "b"]}));
    }

    #[test]
    fn keeps_qualified_segments_only() {
        let segments = parse_segments(response(json!({
            "data": {"customer": {"audiences": {"edges": [
                {"node": {"name": "a", "state": "qualified"}},
                {"node": {"name": "b", "state": "not_qualified"}},
                {"node": {"name": "c", "state": "qualified"}}
            ]}}}
        })))
        .unwrap();
        assert_eq!(segments, vec!["a", "c"]);
    }

    #[test]
    fn graphql_errors_fail_the_fetch() {
        let result = parse_segments(response(json!({
            "errors": [{
                "message": "Exception while fetching data (/customer) : \
                            could not resolve _fs_user_id = user-1",
                "extensions": {"classification": "InvalidIdentifierException"}
            }],
            "data": {"customer": null}
        })));
        assert!(matches!(
            result,
            Err(Error::SegmentFetch(message)) if message == "invalid identifier"
        ));

        let result = parse_segments(response(json!({"data": {}})));
        assert!(matches!(result, Err(Error::SegmentFetch(_))));
    }
}
