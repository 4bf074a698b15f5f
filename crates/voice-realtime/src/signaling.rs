//! Obtains short-lived, pre-authorized connection targets from the backend
//! broker. The client never holds a provider credential itself; the broker
//! signs the WebSocket URL server-side.

use crate::error::VoiceError;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Broker request deadline.
pub const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default trusted prefix for signed endpoint URLs. The signed URL is about
/// to receive live microphone audio, so anything outside this prefix is
/// rejected before a socket is ever constructed.
pub const DEFAULT_ENDPOINT_PREFIX: &str = "wss://api.elevenlabs.io";

/// Which conversational persona to connect to. Translation to a concrete
/// provider agent id happens inside [`SignalingClient`]; the primary persona
/// relies on the broker's server-side default and sends no explicit id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentSelector {
    Primary,
    Secondary,
}

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    /// Base URL of the broker, e.g. `https://broker.internal`.
    pub broker_url: String,
    /// Required prefix (scheme + host) of any signed URL the broker returns.
    pub endpoint_prefix: String,
    /// Provider agent id used for [`AgentSelector::Secondary`].
    pub secondary_agent_id: Option<String>,
}

/// An authorized connection target for one session.
#[derive(Clone, Debug)]
pub struct SessionAuthorization {
    pub endpoint_url: Url,
    pub agent_id: Option<String>,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    signed_url: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Deserialize)]
struct BrokerErrorBody {
    error: String,
}

pub struct SignalingClient {
    http: reqwest::Client,
    config: SignalingConfig,
}

impl SignalingClient {
    pub fn new(config: SignalingConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SIGNALING_TIMEOUT)
            .build()?;
        Ok(Self { http, config })
    }

    fn agent_id_for(&self, agent: AgentSelector) -> Result<Option<&str>, VoiceError> {
        match agent {
            AgentSelector::Primary => Ok(None),
            AgentSelector::Secondary => match self.config.secondary_agent_id.as_deref() {
                Some(id) => Ok(Some(id)),
                None => Err(VoiceError::Authorization(
                    "no agent id configured for the secondary persona".to_string(),
                )),
            },
        }
    }

    /// Requests a signed connection target for `agent` from the broker.
    pub async fn get_session_authorization(
        &self,
        agent: AgentSelector,
    ) -> Result<SessionAuthorization, VoiceError> {
        let endpoint = format!("{}/signed-url", self.config.broker_url.trim_end_matches('/'));
        let mut request = self.http.post(&endpoint);
        if let Some(id) = self.agent_id_for(agent)? {
            request = request.query(&[("agent_id", id)]);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                VoiceError::Authorization("broker request timed out".to_string())
            } else {
                VoiceError::Authorization(format!("broker request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<BrokerErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(VoiceError::Authorization(format!(
                "broker returned {}: {}",
                status.as_u16(),
                detail
            )));
        }

        let body: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Authorization(format!("invalid broker response: {}", e)))?;
        let signed_url = body.signed_url.ok_or_else(|| {
            VoiceError::Authorization("broker response missing signed_url".to_string())
        })?;

        if !signed_url.starts_with(&self.config.endpoint_prefix) {
            return Err(VoiceError::InvalidEndpoint(signed_url));
        }
        let endpoint_url = Url::parse(&signed_url)
            .map_err(|e| VoiceError::InvalidEndpoint(format!("{}: {}", signed_url, e)))?;

        debug!(agent = ?agent, host = ?endpoint_url.host_str(), "session authorization obtained");
        Ok(SessionAuthorization {
            endpoint_url,
            agent_id: body.agent_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Query, State},
        http::StatusCode,
        routing::post,
    };
    use serde_json::json;
    use std::{
        collections::HashMap,
        future::IntoFuture,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    type SeenQueries = Arc<Mutex<Vec<HashMap<String, String>>>>;

    /// Stands up a one-route broker stub returning `response` and recording
    /// each request's query parameters.
    async fn spawn_broker(
        response: (StatusCode, serde_json::Value),
    ) -> (SocketAddr, SeenQueries) {
        let seen: SeenQueries = Arc::new(Mutex::new(Vec::new()));
        let state = (seen.clone(), response);
        let app = Router::new()
            .route(
                "/signed-url",
                post(
                    |State((seen, response)): State<(SeenQueries, (StatusCode, serde_json::Value))>,
                     Query(params): Query<HashMap<String, String>>| async move {
                        seen.lock().unwrap().push(params);
                        (response.0, Json(response.1))
                    },
                ),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, app).into_future());
        (addr, seen)
    }

    fn client_for(addr: SocketAddr, secondary_agent_id: Option<&str>) -> SignalingClient {
        SignalingClient::new(SignalingConfig {
            broker_url: format!("http://{}", addr),
            endpoint_prefix: "ws://127.0.0.1".to_string(),
            secondary_agent_id: secondary_agent_id.map(String::from),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_primary_agent_sends_no_agent_id() {
        let (addr, seen) = spawn_broker((
            StatusCode::OK,
            json!({ "signed_url": "ws://127.0.0.1:9/conv?token=abc", "agent_id": "default" }),
        ))
        .await;
        let client = client_for(addr, None);

        let auth = client
            .get_session_authorization(AgentSelector::Primary)
            .await
            .unwrap();
        assert_eq!(auth.endpoint_url.as_str(), "ws://127.0.0.1:9/conv?token=abc");
        assert_eq!(auth.agent_id.as_deref(), Some("default"));
        assert!(seen.lock().unwrap()[0].is_empty());
    }

    #[tokio::test]
    async fn test_secondary_agent_sends_configured_id() {
        let (addr, seen) = spawn_broker((
            StatusCode::OK,
            json!({ "signed_url": "ws://127.0.0.1:9/conv", "agent_id": "agent-2" }),
        ))
        .await;
        let client = client_for(addr, Some("agent-2"));

        client
            .get_session_authorization(AgentSelector::Secondary)
            .await
            .unwrap();
        assert_eq!(
            seen.lock().unwrap()[0].get("agent_id").map(String::as_str),
            Some("agent-2")
        );
    }

    #[tokio::test]
    async fn test_secondary_agent_without_id_fails_before_any_request() {
        let (addr, seen) = spawn_broker((StatusCode::OK, json!({}))).await;
        let client = client_for(addr, None);

        let err = client
            .get_session_authorization(AgentSelector::Secondary)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Authorization(_)));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_2xx_is_authorization_error_with_broker_detail() {
        let (addr, _) =
            spawn_broker((StatusCode::FORBIDDEN, json!({ "error": "quota exceeded" }))).await;
        let client = client_for(addr, None);

        let err = client
            .get_session_authorization(AgentSelector::Primary)
            .await
            .unwrap_err();
        match err {
            VoiceError::Authorization(msg) => {
                assert!(msg.contains("403"));
                assert!(msg.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_signed_url_is_authorization_error() {
        let (addr, _) = spawn_broker((StatusCode::OK, json!({ "agent_id": "x" }))).await;
        let client = client_for(addr, None);

        let err = client
            .get_session_authorization(AgentSelector::Primary)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_untrusted_prefix_is_rejected() {
        let (addr, _) = spawn_broker((
            StatusCode::OK,
            json!({ "signed_url": "wss://evil.example/conv" }),
        ))
        .await;
        let client = client_for(addr, None);

        let err = client
            .get_session_authorization(AgentSelector::Primary)
            .await
            .unwrap_err();
        match err {
            VoiceError::InvalidEndpoint(url) => assert!(url.contains("evil.example")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
