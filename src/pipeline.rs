//! Ordered request pipeline run before every handler.
//!
//! Each [`Stage`] either passes the context on or ends the request with an
//! error. Stages run in the order they were added; nothing is implicit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method};
use tracing::debug;

use crate::auth::secure::SecureString;
use crate::authz::{starts_with_segments, PolicySet, Requirement, RouteTable};
use crate::error::{AppError, AuthError};
use crate::identity::jwt::TokenValidator;
use crate::identity::{CallerContext, InboundIdentity};

/// Token store key of the validated inbound bearer token.
pub const ACCESS_TOKEN: &str = "access_token";

/// Paths that may carry the token in the query string (browser socket clients).
pub const QUERY_TOKEN_PREFIX: &str = "/hub";

/// What the pipeline knows about the request so far.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    identity: Option<InboundIdentity>,
    tokens: HashMap<&'static str, SecureString>,
}

impl RequestContext {
    pub fn new(method: Method, path: &str, query: Option<&str>, headers: HeaderMap) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: query.map(String::from),
            headers,
            identity: None,
            tokens: HashMap::new(),
        }
    }

    pub fn identity(&self) -> Option<&InboundIdentity> {
        self.identity.as_ref()
    }

    pub fn token(&self, key: &str) -> Option<&SecureString> {
        self.tokens.get(key)
    }

    /// Caller context for handlers, once the request is authenticated.
    pub fn caller(&self) -> Option<CallerContext> {
        Some(CallerContext {
            identity: self.identity.clone()?,
            access_token: self.tokens.get(ACCESS_TOKEN)?.clone(),
        })
    }
}

/// Outcome of one stage.
pub enum Flow {
    Continue(RequestContext),
    ShortCircuit(AppError),
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn process(&self, ctx: RequestContext) -> Flow;
}

/// Stages in execution order.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Run every stage until one short-circuits.
    pub async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext, AppError> {
        for stage in &self.stages {
            match stage.process(ctx).await {
                Flow::Continue(next) => ctx = next,
                Flow::ShortCircuit(err) => return Err(err),
            }
        }
        Ok(ctx)
    }
}

/// Validates the bearer token, if any, and records the caller's identity.
pub struct AuthenticationStage {
    validator: Arc<dyn TokenValidator>,
}

impl AuthenticationStage {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for AuthenticationStage {
    async fn process(&self, mut ctx: RequestContext) -> Flow {
        let Some(token) = inbound_token(&ctx) else {
            return Flow::Continue(ctx);
        };

        match self.validator.validate(&token).await {
            Ok(claims) => {
                let identity = InboundIdentity::from_claims(&claims);
                debug!(
                    subject = identity.subject().unwrap_or("-"),
                    roles = ?identity.roles(),
                    "Caller authenticated"
                );
                ctx.identity = Some(identity);
                ctx.tokens.insert(ACCESS_TOKEN, SecureString::new(token));
                Flow::Continue(ctx)
            }
            Err(e) => Flow::ShortCircuit(AppError::Auth(e)),
        }
    }
}

/// Enforces the route table's requirement for the request.
pub struct AuthorizationStage {
    routes: Arc<RouteTable>,
    policies: PolicySet,
}

impl AuthorizationStage {
    pub fn new(routes: Arc<RouteTable>, policies: PolicySet) -> Self {
        Self { routes, policies }
    }
}

#[async_trait]
impl Stage for AuthorizationStage {
    async fn process(&self, ctx: RequestContext) -> Flow {
        let requirement = self.routes.requirement_for(&ctx.method, &ctx.path);

        let result = match (requirement, ctx.identity()) {
            (Requirement::Anonymous, _) => Ok(()),
            (_, None) => Err(AuthError::MissingToken),
            (Requirement::Authenticated, Some(_)) => Ok(()),
            (Requirement::Policy(policy), Some(identity)) => {
                self.policies.authorize(policy, identity)
            }
        };

        match result {
            Ok(()) => Flow::Continue(ctx),
            Err(e) => Flow::ShortCircuit(AppError::Auth(e)),
        }
    }
}

/// Bearer token from the Authorization header, or for hub paths the
/// `access_token` query parameter.
fn inbound_token(ctx: &RequestContext) -> Option<String> {
    let from_header = ctx
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty())
        .map(String::from);

    if from_header.is_some() || !starts_with_segments(&ctx.path, QUERY_TOKEN_PREFIX) {
        return from_header;
    }

    let query = ctx.query.as_deref()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, v)| k == ACCESS_TOKEN && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}
