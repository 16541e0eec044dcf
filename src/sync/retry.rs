//! Call state machine for outbound API calls
//!
//! Every remote call walks through [`CallState`]. Transitions are pure; the
//! HTTP client drives the machine and performs the waits it asks for.
//!
//! ```text
//! Idle -> Calling -+-> Succeeded
//!                  +-> Cooldown -> FinalAttempt -+-> Succeeded
//!                  |                             +-> Failed
//!                  +-> NetworkBackoff -> Calling ...
//!                  +-> Failed
//! ```

use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::error::{RetryableError, SyncError};

/// Classification of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// 2xx (or an empty page)
    Success,
    /// HTTP 429
    RateLimited,
    /// Timeout, refused connection, transport error or 5xx
    Transient,
    /// Anything not worth retrying (auth, bad payload, other 4xx)
    Fatal,
}

impl CallOutcome {
    /// Classify the result of one attempt
    pub fn classify<T>(result: &Result<T, SyncError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(SyncError::RateLimited(_)) => CallOutcome::RateLimited,
            Err(e) if e.is_retryable() => CallOutcome::Transient,
            Err(_) => CallOutcome::Fatal,
        }
    }

    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::RateLimited => "rate_limited",
            CallOutcome::Transient | CallOutcome::Fatal => "error",
        }
    }
}

/// Retry limits applied by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after a 429 and between network retries
    pub backoff: Duration,
    /// Network retries allowed before giving up
    pub max_network_retries: u32,
}

impl RetryPolicy {
    /// Build the policy from rate limit settings
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            backoff: Duration::from_secs(config.backoff_secs),
            max_network_retries: config.max_network_retries,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

/// State of one logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Not started
    Idle,
    /// An attempt may be made; `network_retries` already used
    Calling { network_retries: u32 },
    /// Rejected with 429; waiting out the backoff window
    Cooldown,
    /// The single attempt allowed after a cooldown
    FinalAttempt,
    /// Transient failure; waiting before attempt `network_retries + 1`
    NetworkBackoff { network_retries: u32 },
    /// Done with a response
    Succeeded,
    /// Done with an error
    Failed,
}

impl CallState {
    /// Start a call
    pub fn begin(self) -> Self {
        match self {
            CallState::Idle => CallState::Calling { network_retries: 0 },
            other => other,
        }
    }

    /// Apply the outcome of an attempt
    pub fn on_outcome(self, outcome: CallOutcome, policy: &RetryPolicy) -> Self {
        match (self, outcome) {
            (CallState::Calling { .. }, CallOutcome::Success)
            | (CallState::FinalAttempt, CallOutcome::Success) => CallState::Succeeded,

            (CallState::Calling { .. }, CallOutcome::RateLimited) => CallState::Cooldown,
            (CallState::Calling { network_retries }, CallOutcome::Transient)
                if network_retries < policy.max_network_retries =>
            {
                CallState::NetworkBackoff {
                    network_retries: network_retries + 1,
                }
            }
            (CallState::Calling { .. }, _) | (CallState::FinalAttempt, _) => CallState::Failed,

            // Outcomes only apply while an attempt is in flight
            (other, _) => other,
        }
    }

    /// Leave a waiting state once its wait has elapsed
    pub fn resume(self) -> Self {
        match self {
            CallState::Cooldown => CallState::FinalAttempt,
            CallState::NetworkBackoff { network_retries } => {
                CallState::Calling { network_retries }
            }
            other => other,
        }
    }

    /// How long to wait before [`CallState::resume`], if this is a waiting state
    pub fn wait(&self, policy: &RetryPolicy) -> Option<Duration> {
        match self {
            CallState::Cooldown | CallState::NetworkBackoff { .. } => Some(policy.backoff),
            _ => None,
        }
    }

    /// Whether an attempt should be made now
    #[cfg(test)]
    fn is_attempt(&self) -> bool {
        matches!(self, CallState::Calling { .. } | CallState::FinalAttempt)
    }

    /// Whether the call is finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Succeeded | CallState::Failed)
    }
}
