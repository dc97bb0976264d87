//! Retry logic with exponential backoff for identity provider calls.
//!
//! Retries only on errors the provider may recover from (transport failures,
//! timeouts, 429 and 5xx). Rejected assertions and malformed responses are
//! returned immediately without retry.

use std::future::Future;
use std::time::Duration;

use crate::error::ExchangeError;

/// Default base delay between retries (doubles each attempt: 200ms, 400ms, 800ms).
pub const BASE_DELAY: Duration = Duration::from_millis(200);

/// Run `f` with up to `max_retries` retries on retryable exchange errors.
pub(crate) async fn with_backoff<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    f: F,
) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt));
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries,
                    "Token exchange failed, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
