//! Error types for the azureapi service.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.
//! `AppError` is the handler-facing type and renders itself as a JSON error response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Top-level application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Token exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Inbound authentication and authorization errors.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Signing keys unavailable: {0}")]
    KeysUnavailable(String),

    #[error("Policy {policy} requires one of the roles {required:?}")]
    Forbidden {
        policy: &'static str,
        required: Vec<String>,
    },
}

/// On-behalf-of token exchange errors.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("No inbound access token on the current request")]
    MissingInboundToken,

    #[error("Assertion rejected by identity provider: {error}")]
    AssertionRejected {
        error: String,
        description: Option<String>,
    },

    #[error("Identity provider unavailable: {reason}")]
    ProviderUnavailable { reason: String, timed_out: bool },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Microsoft Graph API errors.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph API request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse API response: {0}")]
    ParseFailed(String),

    #[error("Unauthorized (401): Token may be expired")]
    Unauthorized,

    #[error("Forbidden (403): Insufficient permissions")]
    Forbidden,

    #[error("Rate limited (429): Too many requests")]
    RateLimited,

    #[error("Downstream authentication failed: {0}")]
    Authentication(#[from] ExchangeError),
}

/// Startup configuration errors. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} not configured. Set {env} environment variable or update config.toml")]
    Missing {
        field: &'static str,
        env: &'static str,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to parse config.toml: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ExchangeError {
    /// Returns true if the caller may retry the exchange.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable { .. })
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingInboundToken | Self::AssertionRejected { .. } => {
                (StatusCode::UNAUTHORIZED, "ASSERTION_REJECTED")
            }
            Self::ProviderUnavailable {
                timed_out: true, ..
            } => (StatusCode::GATEWAY_TIMEOUT, "PROVIDER_TIMEOUT"),
            Self::ProviderUnavailable { .. } => (StatusCode::BAD_GATEWAY, "PROVIDER_UNAVAILABLE"),
            Self::InvalidResponse(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_INVALID_RESPONSE"),
            Self::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR"),
        }
    }

    fn user_message(&self) -> &str {
        match self {
            Self::MissingInboundToken => "No access token was presented.",
            Self::AssertionRejected { .. } => {
                "Your session could not be used to call downstream services. Sign in again."
            }
            Self::ProviderUnavailable { .. } => {
                "The identity provider is unavailable. Please try again."
            }
            Self::InvalidResponse(_) => "Unexpected response from the identity provider.",
            Self::Configuration(_) => "Configuration error. Please check settings.",
        }
    }
}

impl AppError {
    /// Returns a user-friendly message for the response body.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Auth(AuthError::MissingToken) => "Authentication required.",
            Self::Auth(AuthError::InvalidToken(_)) => "Invalid or expired access token.",
            Self::Auth(AuthError::KeysUnavailable(_)) => {
                "Token signing keys are unavailable. Please try again."
            }
            Self::Auth(AuthError::Forbidden { .. }) => {
                "Insufficient permissions for this operation."
            }
            Self::Exchange(e) | Self::Graph(GraphError::Authentication(e)) => e.user_message(),
            Self::Graph(GraphError::Forbidden) => "Insufficient permissions for this operation.",
            Self::Graph(GraphError::RateLimited) => "Too many requests. Please wait a moment.",
            Self::Graph(_) => "Microsoft Graph request failed.",
            Self::Config(_) => "Configuration error. Please check settings.",
        }
    }

    /// Returns the HTTP status and machine-readable code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Auth(AuthError::MissingToken) | Self::Auth(AuthError::InvalidToken(_)) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
            }
            Self::Auth(AuthError::KeysUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "KEYS_UNAVAILABLE")
            }
            Self::Auth(AuthError::Forbidden { .. }) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::Exchange(e) | Self::Graph(GraphError::Authentication(e)) => e.status_and_code(),
            Self::Graph(GraphError::Forbidden) => (StatusCode::FORBIDDEN, "GRAPH_FORBIDDEN"),
            Self::Graph(GraphError::RateLimited) => {
                (StatusCode::TOO_MANY_REQUESTS, "GRAPH_RATE_LIMITED")
            }
            Self::Graph(_) => (StatusCode::BAD_GATEWAY, "GRAPH_ERROR"),
            Self::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Internal details go to the log only
        if status.is_server_error() {
            tracing::error!(code, "Request failed: {}", self);
        } else {
            tracing::debug!(code, "Request rejected: {}", self);
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.user_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}
