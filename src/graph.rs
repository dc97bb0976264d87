//! Microsoft Graph API client for user profile lookups on the caller's behalf.
//!
//! Every request is authenticated by an [`AuthenticationProvider`] before it is
//! sent. If the provider fails, the request is never issued.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::provider::AuthenticationProvider;
use crate::error::GraphError;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound Graph accepts for `$top` on /users.
pub const MAX_PAGE_SIZE: u32 = 999;

/// Microsoft Graph API client. Holds no credentials of its own.
pub struct GraphClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    /// Create a new Graph client for `base_url` (e.g. `https://graph.microsoft.com/v1.0`).
    pub fn new(base_url: &str) -> Result<Self, GraphError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GraphError::RequestFailed(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the signed-in user's profile.
    pub async fn get_me(
        &self,
        auth: &dyn AuthenticationProvider,
    ) -> Result<UserProfile, GraphError> {
        let request = self.http_client.get(format!("{}/me", self.base_url));
        self.send(auth, request).await
    }

    /// List users, optionally filtered by `$filter`, returning at most `top`.
    pub async fn list_users(
        &self,
        auth: &dyn AuthenticationProvider,
        filter: Option<&str>,
        top: Option<u32>,
    ) -> Result<Vec<UserProfile>, GraphError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(filter) = filter {
            query.push(("$filter", filter.to_string()));
        }
        if let Some(top) = top {
            query.push(("$top", top.to_string()));
        }

        let request = self
            .http_client
            .get(format!("{}/users", self.base_url))
            .query(&query);
        let response: UsersResponse = self.send(auth, request).await?;
        Ok(response.value)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        auth: &dyn AuthenticationProvider,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GraphError> {
        let mut request = request
            .build()
            .map_err(|e| GraphError::RequestFailed(e.to_string()))?;

        auth.authenticate_request(&mut request).await?;
        debug!(url = %request.url(), "Calling Microsoft Graph");

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|e| GraphError::RequestFailed(e.to_string()))?;

        match response.status().as_u16() {
            200 => response
                .json()
                .await
                .map_err(|e| GraphError::ParseFailed(e.to_string())),
            401 => {
                // Stale or revoked; the next call must not reuse it
                auth.credential_rejected();
                Err(GraphError::Unauthorized)
            }
            403 => Err(GraphError::Forbidden),
            429 => Err(GraphError::RateLimited),
            // Don't expose raw API error details - just log status code
            status => Err(GraphError::RequestFailed(format!("HTTP {}", status))),
        }
    }
}

/// User lookups performed on behalf of one caller.
pub struct GraphApiService {
    client: Arc<GraphClient>,
    auth: Box<dyn AuthenticationProvider>,
}

impl GraphApiService {
    pub fn new(client: Arc<GraphClient>, auth: Box<dyn AuthenticationProvider>) -> Self {
        Self { client, auth }
    }

    /// Profile of the calling user.
    pub async fn get_current_profile(&self) -> Result<UserProfile, GraphError> {
        self.client.get_me(self.auth.as_ref()).await
    }

    /// Users whose display name or mail starts with `query`.
    ///
    /// `limit` is clamped to 1..=999. An empty query lists users unfiltered.
    pub async fn search_users(&self, query: &str, limit: u32) -> Result<Vec<UserProfile>, GraphError> {
        let query = query.trim();
        let filter = (!query.is_empty()).then(|| {
            let literal = odata_literal(query);
            format!("startswith(displayName,{literal}) or startswith(mail,{literal})")
        });

        self.client
            .list_users(
                self.auth.as_ref(),
                filter.as_deref(),
                Some(limit.clamp(1, MAX_PAGE_SIZE)),
            )
            .await
    }

    /// Users with the given object ids. No request is made for an empty list.
    pub async fn get_users(&self, ids: &[String]) -> Result<Vec<UserProfile>, GraphError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let filter = ids
            .iter()
            .map(|id| format!("id eq {}", odata_literal(id)))
            .collect::<Vec<_>>()
            .join(" or ");

        self.client
            .list_users(self.auth.as_ref(), Some(&filter), None)
            .await
    }
}

/// Quote `value` as an OData string literal.
pub fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// User resource from Microsoft Graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Unique identifier for the user.
    pub id: String,

    /// User's display name.
    pub display_name: Option<String>,

    /// User's given (first) name.
    pub given_name: Option<String>,

    /// User's surname (last name).
    pub surname: Option<String>,

    /// User's email address.
    pub mail: Option<String>,

    /// User Principal Name (typically email-like format).
    pub user_principal_name: Option<String>,

    /// User's job title.
    pub job_title: Option<String>,

    /// User's office location.
    pub office_location: Option<String>,
}

/// Collection response wrapper.
#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    value: Vec<UserProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use async_trait::async_trait;
    use reqwest::header::{HeaderValue, AUTHORIZATION};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Stamps a fixed token, or fails like a rejected exchange.
    struct StaticAuth(Option<&'static str>);

    /// Counts how often Graph refused the credential.
    struct CountingAuth(Arc<AtomicU32>);

    #[async_trait]
    impl AuthenticationProvider for CountingAuth {
        async fn authenticate_request(
            &self,
            request: &mut reqwest::Request,
        ) -> Result<(), ExchangeError> {
            StaticAuth(Some("Bearer G1")).authenticate_request(request).await
        }

        fn credential_rejected(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AuthenticationProvider for StaticAuth {
        async fn authenticate_request(
            &self,
            request: &mut reqwest::Request,
        ) -> Result<(), ExchangeError> {
            match self.0 {
                Some(token) => {
                    request
                        .headers_mut()
                        .insert(AUTHORIZATION, HeaderValue::from_static(token));
                    Ok(())
                }
                None => Err(ExchangeError::AssertionRejected {
                    error: "invalid_grant".into(),
                    description: None,
                }),
            }
        }
    }

    fn service(server: &MockServer, auth: StaticAuth) -> GraphApiService {
        let client = GraphClient::new(&format!("{}/v1.0/", server.uri())).unwrap();
        GraphApiService::new(Arc::new(client), Box::new(auth))
    }

    fn alice() -> serde_json::Value {
        json!({
            "id": "id-alice",
            "displayName": "Alice",
            "mail": "alice@example.com",
            "userPrincipalName": "alice@example.com"
        })
    }

    #[test]
    fn test_odata_literal_escapes_quotes() {
        assert_eq!(odata_literal("alice"), "'alice'");
        assert_eq!(odata_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_user_profile_deserialization() {
        let profile: UserProfile = serde_json::from_value(alice()).unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        assert_eq!(profile.job_title, None);
    }

    #[tokio::test]
    async fn test_get_me_sends_exchanged_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .and(header("authorization", "Bearer G1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alice()))
            .expect(1)
            .mount(&server)
            .await;

        let profile = service(&server, StaticAuth(Some("Bearer G1")))
            .get_current_profile()
            .await
            .unwrap();
        assert_eq!(profile.id, "id-alice");
    }

    #[tokio::test]
    async fn test_failed_authentication_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alice()))
            .expect(0)
            .mount(&server)
            .await;

        let result = service(&server, StaticAuth(None))
            .get_current_profile()
            .await;
        assert!(matches!(
            result,
            Err(GraphError::Authentication(ExchangeError::AssertionRejected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_search_users_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/users"))
            .and(query_param(
                "$filter",
                "startswith(displayName,'o''b') or startswith(mail,'o''b')",
            ))
            .and(query_param("$top", "999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [alice()] })))
            .expect(1)
            .mount(&server)
            .await;

        let users = service(&server, StaticAuth(Some("Bearer G1")))
            .search_users(" o'b ", 5000)
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_get_users_by_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/users"))
            .and(query_param("$filter", "id eq 'a' or id eq 'b'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service(&server, StaticAuth(Some("Bearer G1")));
        let users = svc
            .get_users(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(users.is_empty());

        // Empty id list never reaches Graph
        assert!(svc.get_users(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_reports_rejected_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let rejected = Arc::new(AtomicU32::new(0));
        let client = GraphClient::new(&format!("{}/v1.0", server.uri())).unwrap();
        let svc = GraphApiService::new(
            Arc::new(client),
            Box::new(CountingAuth(Arc::clone(&rejected))),
        );

        assert!(matches!(
            svc.get_current_profile().await,
            Err(GraphError::Unauthorized)
        ));
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/users"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let svc = service(&server, StaticAuth(Some("Bearer G1")));
        assert!(matches!(
            svc.get_current_profile().await,
            Err(GraphError::RateLimited)
        ));
        assert!(matches!(
            svc.search_users("a", 10).await,
            Err(GraphError::Forbidden)
        ));
    }
}
