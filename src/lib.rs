//! azureapi - Azure AD protected web API
//!
//! Validates Azure AD bearer tokens, enforces Reader/Writer role policies and
//! calls Microsoft Graph on the caller's behalf via the OAuth2 on-behalf-of flow.

#![deny(clippy::all)]

pub mod auth;
pub mod authz;
pub mod config;
pub mod error;
pub mod graph;
pub mod health;
pub mod hub;
pub mod identity;
pub mod pipeline;
pub mod server;

pub use config::Config;
pub use error::AppError;
pub use server::AppState;
