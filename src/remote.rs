//! Remote evaluation: the server computes variants per request.
use std::collections::HashMap;

use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};
use serde::Serialize;

use crate::backoff::retry_with_backoff;
use crate::config::RemoteEvaluationConfig;
use crate::flag::{ExperimentUser, Variant};
use crate::{Error, Result};

const EVALUATE_ENDPOINT: &str = "/sdk/v2/vardata";

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    user: &'a ExperimentUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    flag_keys: Option<&'a [String]>,
}

/// A client that evaluates users server-side, one API call per request.
///
/// Unlike local evaluation there is no cache to fall back on, so failed requests are retried
/// under the configured backoff policy.
pub struct RemoteEvaluationClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    api_key: String,
    config: RemoteEvaluationConfig,
}

impl RemoteEvaluationClient {
    pub fn new(api_key: impl Into<String>, config: RemoteEvaluationConfig) -> RemoteEvaluationClient {
        RemoteEvaluationClient {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    /// Ask the server which variants `user` falls into, optionally restricted to `flag_keys`.
    pub async fn evaluate(
        &self,
        user: &ExperimentUser,
        flag_keys: Option<&[String]>,
    ) -> Result<HashMap<String, Variant>> {
        retry_with_backoff(&self.config.retry, || async {
            let url = Url::parse(&format!("{}{}", self.config.server_url, EVALUATE_ENDPOINT))?;

            log::debug!(target: "flagwire", "requesting remote evaluation");
            let response = self
                .client
                .post(url)
                .timeout(self.config.fetch_timeout)
                .header(AUTHORIZATION, format!("Api-Key {}", self.api_key))
                .json(&EvaluationRequest { user, flag_keys })
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                return Err(Error::Unauthorized);
            }
            if !status.is_success() {
                return Err(Error::RequestFailed {
                    status: status.as_u16(),
                });
            }
            Ok(response.json().await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_omits_absent_flag_keys() {
        let user = ExperimentUser::from_user_id("u1");
        let body = serde_json::to_value(EvaluationRequest {
            user: &user,
            flag_keys: None,
        })
        .unwrap();

        assert_eq!(body["user"]["user_id"], "u1");
        assert!(body.get("flag_keys").is_none());
    }

    #[test]
    fn request_body_carries_flag_keys_filter() {
        let user = ExperimentUser::from_user_id("u1");
        let keys = vec!["f1".to_owned()];
        let body = serde_json::to_value(EvaluationRequest {
            user: &user,
            flag_keys: Some(&keys),
        })
        .unwrap();

        assert_eq!(body["flag_keys"][0], "f1");
    }

    #[test]
    fn variants_response_parses() {
        let variants: HashMap<String, Variant> = serde_json::from_str(
            r#"{"f1": {"key": "on", "value": true}, "f2": {"key": "off"}}"#,
        )
        .unwrap();

        assert_eq!(variants["f1"].key.as_deref(), Some("on"));
        assert_eq!(variants.len(), 2);
    }
}
