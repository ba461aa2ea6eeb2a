// Retry policy with exponential backoff

use std::time::Duration;

use crate::config::RetryConfig;
use crate::gateway::{Endpoint, GatewayError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    retryable_status_codes: Vec<u16>,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        retryable_status_codes: Vec<u16>,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
            retryable_status_codes,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs_f64(config.base_delay_seconds),
            Duration::from_secs_f64(config.max_delay_seconds),
            config.backoff_factor,
            config.retryable_status_codes.clone(),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt + 1`: base × factor^attempt, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether a failure may be retried under this policy. A new order is
    /// never re-sent when the first attempt may have reached the exchange.
    pub fn should_retry(&self, endpoint: Endpoint, error: &GatewayError) -> bool {
        if endpoint == Endpoint::AddOrder && error.is_ambiguous() {
            return false;
        }
        match error {
            GatewayError::Timeout(_) | GatewayError::Network(_) => true,
            GatewayError::RateLimited(_) => self.retryable_status_codes.contains(&429),
            GatewayError::ServerError(code, _) | GatewayError::ClientError(code, _) => {
                self.retryable_status_codes.contains(code)
            }
            GatewayError::MalformedResponse(_) => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
            vec![429, 503],
        );

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(30), Duration::from_secs(5));
    }

    #[test]
    fn test_retryable_classification() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(Endpoint::Ticker, &GatewayError::Timeout("Ticker".into())));
        assert!(policy.should_retry(Endpoint::Ticker, &GatewayError::RateLimited("EAPI:Rate limit exceeded".into())));
        assert!(policy.should_retry(Endpoint::CancelOrder, &GatewayError::ServerError(503, "unavailable".into())));
        assert!(!policy.should_retry(Endpoint::AddOrder, &GatewayError::ClientError(400, "EOrder:Invalid price".into())));
        assert!(!policy.should_retry(Endpoint::Ticker, &GatewayError::MalformedResponse("missing result".into())));
    }

    #[test]
    fn test_new_orders_are_only_retried_after_a_clear_rejection() {
        let policy = RetryPolicy::default();

        assert!(!policy.should_retry(Endpoint::AddOrder, &GatewayError::Timeout("AddOrder".into())));
        assert!(!policy.should_retry(Endpoint::AddOrder, &GatewayError::Network("reset".into())));
        assert!(!policy.should_retry(Endpoint::AddOrder, &GatewayError::ServerError(504, "gateway timeout".into())));
        assert!(policy.should_retry(Endpoint::AddOrder, &GatewayError::RateLimited("EAPI:Rate limit exceeded".into())));
    }
}
