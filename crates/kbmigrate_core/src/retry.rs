use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;

use crate::config::RunTimings;
use crate::error::{ErrorKind, RemoteError};

/// Anything holding a credential that can be replaced before a retry.
pub trait Reauthenticate {
    fn reauthenticate(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^attempt`
    Exponential { base: Duration },
    /// `step * (attempt + 1)`
    Linear { step: Duration },
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: usize) -> Duration {
        match *self {
            Self::Exponential { base } => {
                let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
                base.saturating_mul(2u32.saturating_pow(exponent))
            }
            Self::Linear { step } => {
                step.saturating_mul(u32::try_from(attempt + 1).unwrap_or(u32::MAX))
            }
            Self::Fixed(delay) => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    Never,
    /// Before every retry.
    Always,
    /// Only when the failure was an authorization rejection or transport fault.
    OnTransient,
    /// Only before the last attempt.
    FinalAttempt,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Backoff,
    pub refresh: RefreshPolicy,
    pub retry_on: fn(&anyhow::Error) -> bool,
}

impl RetryPolicy {
    /// Authorization and transport failures on a single remote call.
    pub fn remote_call(timings: &RunTimings, max_attempts: usize) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base: timings.auth_backoff_base,
            },
            refresh: RefreshPolicy::OnTransient,
            retry_on: is_auth_or_transport,
        }
    }

    /// Rate-limited writes: creation of articles, translations and assets.
    pub fn long_write(timings: &RunTimings) -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(timings.long_write_backoff),
            refresh: RefreshPolicy::Always,
            retry_on: is_retryable,
        }
    }

    /// Category assignment and lifecycle updates.
    pub fn short_write(timings: &RunTimings) -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(timings.short_write_backoff),
            refresh: RefreshPolicy::FinalAttempt,
            retry_on: is_retryable,
        }
    }

    /// Waiting on a destination-generated field.
    pub fn polling(timings: &RunTimings) -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Linear {
                step: timings.number_poll_step,
            },
            refresh: RefreshPolicy::Never,
            retry_on: is_retryable,
        }
    }

    pub fn run<C, T, F>(&self, label: &str, context: &mut C, mut operation: F) -> Result<T>
    where
        C: Reauthenticate + ?Sized,
        F: FnMut(&mut C) -> Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let error = match operation(context) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;
            if attempt >= attempts || !(self.retry_on)(&error) {
                return Err(error);
            }

            let delay = self.backoff.delay(attempt - 1);
            tracing::warn!(
                "{label} failed (attempt {attempt}/{attempts}): {error:#}; retrying in {}s",
                delay.as_secs()
            );
            if !delay.is_zero() {
                sleep(delay);
            }
            let refresh = match self.refresh {
                RefreshPolicy::Never => false,
                RefreshPolicy::Always => true,
                RefreshPolicy::OnTransient => is_auth_or_transport(&error),
                RefreshPolicy::FinalAttempt => attempt + 1 == attempts,
            };
            if refresh && let Err(refresh_error) = context.reauthenticate() {
                tracing::warn!("{label}: credential refresh failed: {refresh_error:#}");
            }
        }
    }
}

pub fn is_retryable(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<RemoteError>()
        .map(RemoteError::is_retryable)
        .unwrap_or(true)
}

pub fn is_auth_or_transport(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<RemoteError>() {
        Some(remote) => matches!(remote.kind(), ErrorKind::TransientAuth),
        None => error.downcast_ref::<reqwest::Error>().is_some(),
    }
}
