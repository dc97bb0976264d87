//! Request-scoped authentication of outbound calls.
//!
//! Downstream clients don't know about tokens. They hand every request to an
//! [`AuthenticationProvider`], which attaches whatever credential the current
//! caller is entitled to.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

use super::obo::{AssertionRequest, ExchangedToken, OboExchanger};
use super::secure::SecureString;
use super::token_cache::{CacheKey, TokenCache};
use crate::error::ExchangeError;
use crate::identity::{CallerContext, InboundIdentity};

/// Attaches authentication to an outbound request.
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    async fn authenticate_request(&self, request: &mut reqwest::Request)
        -> Result<(), ExchangeError>;

    /// The downstream service refused the credential; don't hand it out again.
    fn credential_rejected(&self) {}
}

/// Authenticates outbound requests with a token obtained on behalf of the caller.
///
/// Built per inbound request from its [`CallerContext`]; the exchanger and
/// cache are shared process-wide.
pub struct OnBehalfOfProvider {
    exchanger: Arc<OboExchanger>,
    cache: Option<Arc<TokenCache>>,
    identity: InboundIdentity,
    inbound_token: Option<SecureString>,
    resource: String,
}

impl OnBehalfOfProvider {
    pub fn new(
        exchanger: Arc<OboExchanger>,
        cache: Option<Arc<TokenCache>>,
        identity: InboundIdentity,
        inbound_token: Option<SecureString>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            exchanger,
            cache,
            identity,
            inbound_token,
            resource: resource.into(),
        }
    }

    /// Provider for the caller of the current request.
    pub fn for_caller(
        exchanger: Arc<OboExchanger>,
        cache: Option<Arc<TokenCache>>,
        caller: &CallerContext,
        resource: impl Into<String>,
    ) -> Self {
        let token = Some(caller.access_token.clone()).filter(|t| !t.is_empty());
        Self::new(exchanger, cache, caller.identity.clone(), token, resource)
    }

    /// Obtain a token for the configured resource, from cache when possible.
    pub async fn acquire_token(&self) -> Result<ExchangedToken, ExchangeError> {
        let inbound_token = self
            .inbound_token
            .clone()
            .ok_or(ExchangeError::MissingInboundToken)?;
        let assertion = AssertionRequest::new(inbound_token, &self.identity);

        match (&self.cache, self.cache_key()) {
            (Some(cache), Some(key)) => {
                cache
                    .get_or_exchange(key, || self.exchanger.exchange(&assertion, &self.resource))
                    .await
            }
            _ => self.exchanger.exchange(&assertion, &self.resource).await,
        }
    }

    fn cache_key(&self) -> Option<CacheKey> {
        self.identity
            .cache_subject()
            .map(|subject| CacheKey::new(subject, self.resource.as_str()))
    }
}

#[async_trait]
impl AuthenticationProvider for OnBehalfOfProvider {
    async fn authenticate_request(
        &self,
        request: &mut reqwest::Request,
    ) -> Result<(), ExchangeError> {
        let token = self.acquire_token().await?;

        let mut value = HeaderValue::from_str(&token.authorization_value())
            .map_err(|e| ExchangeError::InvalidResponse(format!("unusable token: {e}")))?;
        value.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, value);

        debug!(url = %request.url(), "Outbound request authenticated on behalf of caller");
        Ok(())
    }

    fn credential_rejected(&self) {
        if let (Some(cache), Some(key)) = (&self.cache, self.cache_key()) {
            warn!(resource = %key.resource, "Exchanged token rejected downstream, dropping it");
            cache.invalidate(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointVersion, TokenConfig};
    use crate::auth::obo::ClientCredential;
    use crate::identity::Claims;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GRAPH: &str = "https://graph.microsoft.com";

    fn exchanger(server: &MockServer) -> Arc<OboExchanger> {
        let credential = ClientCredential::new("client-1", "secret-1", &server.uri()).unwrap();
        let token = TokenConfig {
            refresh_before_expiry_seconds: 300,
            cache_enabled: true,
            exchange_timeout_seconds: 5,
            max_retries: 0,
        };
        Arc::new(OboExchanger::new(credential, EndpointVersion::V1, &token).unwrap())
    }

    fn identity(claims: serde_json::Value) -> InboundIdentity {
        InboundIdentity::from_claims(&Claims::from(claims))
    }

    async fn mount_success(server: &MockServer, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "G1",
                "token_type": "Bearer",
                "expires_in": "3599"
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    fn request() -> reqwest::Request {
        reqwest::Request::new(
            reqwest::Method::GET,
            "https://graph.microsoft.com/v1.0/me".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_authorization_header_attached() {
        let server = MockServer::start().await;
        mount_success(&server, 1).await;

        let provider = OnBehalfOfProvider::new(
            exchanger(&server),
            None,
            identity(json!({ "upn": "alice@example.com" })),
            Some(SecureString::from("T1")),
            GRAPH,
        );

        let mut req = request();
        provider.authenticate_request(&mut req).await.unwrap();

        let header = req.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer G1");
        assert!(header.is_sensitive());
    }

    #[tokio::test]
    async fn test_missing_inbound_token_leaves_request_untouched() {
        let server = MockServer::start().await;
        mount_success(&server, 0).await;

        let provider = OnBehalfOfProvider::new(
            exchanger(&server),
            None,
            identity(json!({ "upn": "alice@example.com" })),
            None,
            GRAPH,
        );

        let mut req = request();
        let result = provider.authenticate_request(&mut req).await;
        assert!(matches!(result, Err(ExchangeError::MissingInboundToken)));
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_rejected_assertion_attaches_no_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .mount(&server)
            .await;

        let provider = OnBehalfOfProvider::new(
            exchanger(&server),
            None,
            identity(json!({ "upn": "alice@example.com" })),
            Some(SecureString::from("T1")),
            GRAPH,
        );

        let mut req = request();
        let result = provider.authenticate_request(&mut req).await;
        assert!(matches!(result, Err(ExchangeError::AssertionRejected { .. })));
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    // Cached path: an addition over one exchange per outbound call
    #[tokio::test]
    async fn test_cached_token_reused_across_providers() {
        let server = MockServer::start().await;
        mount_success(&server, 1).await;

        let exchanger = exchanger(&server);
        let cache = Arc::new(TokenCache::new(300));

        for _ in 0..2 {
            let provider = OnBehalfOfProvider::new(
                Arc::clone(&exchanger),
                Some(Arc::clone(&cache)),
                identity(json!({ "oid": "oid-alice", "upn": "alice@example.com" })),
                Some(SecureString::from("T1")),
                GRAPH,
            );
            let mut req = request();
            provider.authenticate_request(&mut req).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_rejected_credential_forces_new_exchange() {
        let server = MockServer::start().await;
        mount_success(&server, 2).await;

        let exchanger = exchanger(&server);
        let cache = Arc::new(TokenCache::new(300));
        let provider = OnBehalfOfProvider::new(
            exchanger,
            Some(Arc::clone(&cache)),
            identity(json!({ "oid": "oid-alice" })),
            Some(SecureString::from("T1")),
            GRAPH,
        );

        provider.acquire_token().await.unwrap();
        provider.acquire_token().await.unwrap();
        assert_eq!(cache.len(), 1);

        provider.credential_rejected();
        assert!(cache.is_empty());

        // Next use goes back to the token endpoint
        provider.acquire_token().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_bypassed_without_subject() {
        let server = MockServer::start().await;
        mount_success(&server, 2).await;

        let exchanger = exchanger(&server);
        let cache = Arc::new(TokenCache::new(300));

        for _ in 0..2 {
            let provider = OnBehalfOfProvider::new(
                Arc::clone(&exchanger),
                Some(Arc::clone(&cache)),
                identity(json!({})),
                Some(SecureString::from("T1")),
                GRAPH,
            );
            provider.acquire_token().await.unwrap();
        }
        assert!(cache.is_empty());
    }
}
