//! 远端授权服务客户端：`POST {base}/authorize`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::authz::{AuthzClient, AuthzDecision, AuthzError, AuthzRequest, Verdict};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthzResponse {
    verdict: Verdict,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    constraints: Option<Value>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct HttpAuthzClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthzClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthzError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthzError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AuthzClient for HttpAuthzClient {
    async fn check(&self, request: &AuthzRequest) -> Result<AuthzDecision, AuthzError> {
        let response = self
            .client
            .post(format!("{}/authorize", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| AuthzError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthzError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let body: AuthzResponse = response
            .json()
            .await
            .map_err(|e| AuthzError::Decode(e.to_string()))?;
        Ok(AuthzDecision {
            principal: request.principal.clone(),
            action: request.action.clone(),
            resource: request.resource.clone(),
            verdict: body.verdict,
            valid_until: body.valid_until,
            constraints: body.constraints,
            reason: body.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> AuthzRequest {
        AuthzRequest {
            principal: "alice".into(),
            action: "tool.invoke".into(),
            resource: "tool:echo#abc".into(),
            context: json!({"taskId": "t1"}),
        }
    }

    #[tokio::test]
    async fn test_decision_is_built_from_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authorize"))
            .and(body_partial_json(json!({"principal": "alice", "action": "tool.invoke"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "verdict": "allow_with_constraints",
                "validUntil": "2030-01-01T00:00:00Z",
                "constraints": {"maxCost": 5}
            })))
            .mount(&server)
            .await;

        let client = HttpAuthzClient::new(&server.uri(), Duration::from_secs(1)).unwrap();
        let decision = client.check(&request()).await.unwrap();
        assert_eq!(decision.verdict, Verdict::AllowWithConstraints);
        assert!(decision.is_allowed());
        assert_eq!(decision.resource, "tool:echo#abc");
        assert_eq!(decision.constraints, Some(json!({"maxCost": 5})));
        assert!(decision.valid_until.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let client = HttpAuthzClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = client.check(&request()).await.unwrap_err();
        assert!(matches!(err, AuthzError::Unavailable(_)));
    }
}
