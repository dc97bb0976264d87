//! Caller identity: claims, roles and the subject hint used for token exchange.
//!
//! Claims are looked up by both their short JWT names and the long claim type
//! URIs, so tokens issued in either style resolve the same way.

pub mod jwt;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::secure::SecureString;
use crate::error::{AppError, AuthError};

/// Claim type names, short form first.
pub mod claim_types {
    pub const ROLE: &[&str] = &[
        "roles",
        "role",
        "http://schemas.microsoft.com/ws/2008/06/identity/claims/role",
    ];
    pub const UPN: &[&str] = &[
        "upn",
        "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/upn",
    ];
    pub const EMAIL: &[&str] = &[
        "email",
        "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
    ];
    pub const SUBJECT: &[&str] = &[
        "oid",
        "http://schemas.microsoft.com/identity/claims/objectidentifier",
        "sub",
    ];
}

/// Raw claims of a validated token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// First string value among the given claim types.
    pub fn find_first(&self, types: &[&str]) -> Option<String> {
        types.iter().find_map(|t| match self.0.get(*t)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Array(values) => values.iter().find_map(|v| v.as_str().map(String::from)),
            _ => None,
        })
    }

    /// All string values among the given claim types, in order, without duplicates.
    pub fn find_all(&self, types: &[&str]) -> Vec<String> {
        let mut values: Vec<String> = Vec::new();
        for t in types {
            let found: Vec<String> = match self.0.get(*t) {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };
            for value in found {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        values
    }
}

impl From<Value> for Claims {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

/// The authenticated caller, extracted once from the request's claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundIdentity {
    subject: Option<String>,
    upn: Option<String>,
    email: Option<String>,
    roles: Vec<String>,
}

impl InboundIdentity {
    /// Build the identity from validated claims.
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            subject: claims.find_first(claim_types::SUBJECT),
            upn: claims.find_first(claim_types::UPN),
            email: claims.find_first(claim_types::EMAIL),
            roles: claims.find_all(claim_types::ROLE),
        }
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn upn(&self) -> Option<&str> {
        self.upn.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Role claims of the caller.
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Whether the caller holds any of `roles`.
    pub fn has_any_role(&self, roles: &[String]) -> bool {
        self.roles.iter().any(|r| roles.contains(r))
    }

    /// Display identifier passed along with the assertion: UPN, then email.
    pub fn subject_hint(&self) -> Option<&str> {
        self.upn().or_else(|| self.email())
    }

    /// Key under which exchanged tokens for this caller are cached.
    pub fn cache_subject(&self) -> Option<&str> {
        self.subject().or_else(|| self.subject_hint())
    }
}

/// Authenticated request context: the caller's identity plus the inbound token.
///
/// Inserted into request extensions by the pipeline middleware.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub identity: InboundIdentity,
    pub access_token: SecureString,
}

impl<S: Send + Sync> FromRequestParts<S> for CallerContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerContext>()
            .cloned()
            .ok_or(AppError::Auth(AuthError::MissingToken))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(value: Value) -> InboundIdentity {
        InboundIdentity::from_claims(&Claims::from(value))
    }

    #[test]
    fn test_subject_hint_prefers_upn() {
        let id = identity(json!({
            "upn": "alice@example.com",
            "email": "alice.mail@example.com"
        }));
        assert_eq!(id.subject_hint(), Some("alice@example.com"));
    }

    #[test]
    fn test_subject_hint_falls_back_to_email() {
        let id = identity(json!({ "email": "bob@example.com" }));
        assert_eq!(id.subject_hint(), Some("bob@example.com"));
    }

    #[test]
    fn test_subject_hint_none() {
        let id = identity(json!({ "oid": "1234" }));
        assert_eq!(id.subject_hint(), None);
        assert_eq!(id.cache_subject(), Some("1234"));
    }

    #[test]
    fn test_long_claim_type_names() {
        let id = identity(json!({
            "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/upn": "carol@example.com",
            "http://schemas.microsoft.com/ws/2008/06/identity/claims/role": ["Reader"],
            "http://schemas.microsoft.com/identity/claims/objectidentifier": "oid-1"
        }));
        assert_eq!(id.upn(), Some("carol@example.com"));
        assert_eq!(id.roles(), &["Reader".to_string()]);
        assert_eq!(id.subject(), Some("oid-1"));
    }

    #[test]
    fn test_roles_merged_without_duplicates() {
        let id = identity(json!({
            "roles": ["Reader", "Writer"],
            "role": "Reader"
        }));
        assert_eq!(id.roles(), &["Reader".to_string(), "Writer".to_string()]);
        assert!(id.has_any_role(&["Writer".to_string()]));
        assert!(!id.has_any_role(&["Admin".to_string()]));
    }

    #[test]
    fn test_oid_preferred_over_sub() {
        let id = identity(json!({ "sub": "pairwise-sub", "oid": "object-id" }));
        assert_eq!(id.subject(), Some("object-id"));
    }
}
