//! Outbound authentication.
//!
//! Provides the on-behalf-of token exchange, its cache and retry policy,
//! and the provider that stamps downstream requests with the exchanged token.

pub mod obo;
pub mod provider;
pub mod retry;
pub mod secure;
pub mod token_cache;
