//! Rule sources selected by configuration

use async_trait::async_trait;
use pgc_core::RawRule;
use pgc_policy::{FileRuleSource, RuleSource, SourceError, StaticRuleSource};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{UpstreamConfig, UpstreamKind};
use crate::security::{validate_endpoint, EndpointError, EndpointPolicy};

/// Failure to construct the configured source
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream kind 'http' requires an endpoint")]
    MissingEndpoint,

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Rule store reply: either a bare list or `{"rules": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum RulesPayload {
    List(Vec<RawRule>),
    Wrapped { rules: Vec<RawRule> },
}

impl RulesPayload {
    fn into_rules(self) -> Vec<RawRule> {
        match self {
            RulesPayload::List(rules) | RulesPayload::Wrapped { rules } => rules,
        }
    }
}

/// Rules fetched from the rule store over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpRuleSource {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpRuleSource {
    /// Validate `endpoint` and build a client with `timeout`
    pub fn new(endpoint: &str, timeout: Duration, policy: &EndpointPolicy) -> Result<Self, UpstreamError> {
        let endpoint = validate_endpoint(endpoint, policy)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RuleSource for HttpRuleSource {
    async fn fetch_verified_rules(&self, auth_token: &str) -> Result<Vec<RawRule>, SourceError> {
        let mut request = self.client.get(self.endpoint.clone());
        if !auth_token.is_empty() {
            request = request.bearer_auth(auth_token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else {
                SourceError::Unavailable(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(SourceError::Unauthorized),
            status if !status.is_success() => {
                return Err(SourceError::Unavailable(format!("rule store returned {}", status)))
            }
            _ => {}
        }

        let payload: RulesPayload = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let rules = payload.into_rules();
        debug!(endpoint = %self.endpoint, count = rules.len(), "Fetched rules");
        Ok(rules)
    }

    fn describe(&self) -> String {
        format!("http:{}", self.endpoint)
    }
}

/// Build the rule source named by the upstream configuration
pub fn build_source(config: &UpstreamConfig) -> Result<Arc<dyn RuleSource>, UpstreamError> {
    let source: Arc<dyn RuleSource> = match config.kind {
        UpstreamKind::Http => {
            let endpoint = config.endpoint.as_deref().ok_or(UpstreamError::MissingEndpoint)?;
            Arc::new(HttpRuleSource::new(
                endpoint,
                Duration::from_secs(config.timeout_secs),
                &EndpointPolicy::from_allow_insecure(config.allow_insecure),
            )?)
        }
        UpstreamKind::File => Arc::new(FileRuleSource::new(&config.directory)),
        UpstreamKind::Static => Arc::new(StaticRuleSource::new(Vec::new())),
    };
    Ok(source)
}
