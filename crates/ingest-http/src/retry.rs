// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry policy and the per-batch delivery state machine.

use crate::batch::Batch;
use crate::outcome::{DropReason, FailureReason, Outcome};
use crate::transport::{classify, BatchSender};
use rand::Rng;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How many times a batch is sent and how long to wait between sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Up to `n` attempts, back to back.
    Immediate(u32),
    /// Up to `n` attempts, `ms` milliseconds apart.
    LinearBackoff(u32, u64),
    /// Up to `max_attempts` attempts. The wait after the k-th failed attempt is
    /// `base_delay * 2^(k-1)`, capped at `max_delay`, plus a random jitter in `[0, base_delay]`.
    ExponentialBackoff {
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryStrategy {
    pub fn max_attempts(&self) -> u32 {
        let attempts = match self {
            Self::Immediate(n) | Self::LinearBackoff(n, _) => *n,
            Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        };
        attempts.max(1)
    }

    /// Wait after `failed_attempts` failed attempts, without jitter.
    pub fn base_backoff(&self, failed_attempts: u32) -> Duration {
        match self {
            Self::Immediate(_) => Duration::ZERO,
            Self::LinearBackoff(_, ms) => Duration::from_millis(*ms),
            Self::ExponentialBackoff {
                base_delay,
                max_delay,
                ..
            } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                base_delay
                    .checked_mul(1u32 << exponent)
                    .map_or(*max_delay, |delay| delay.min(*max_delay))
            }
        }
    }

    /// Wait after `failed_attempts` failed attempts, jitter included.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let base = self.base_backoff(failed_attempts);
        match self {
            Self::ExponentialBackoff { base_delay, .. } if !base_delay.is_zero() => {
                let jitter_ms = rand::thread_rng().gen_range(0..=base_delay.as_millis() as u64);
                base + Duration::from_millis(jitter_ms)
            }
            _ => base,
        }
    }
}

/// Delivery state of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    RetryPending,
    Delivered,
    PermanentlyFailed,
    Abandoned,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::PermanentlyFailed | Self::Abandoned
        )
    }

    /// State after attempt number `attempt` (1-based) ended with `outcome`.
    pub fn after(outcome: &Outcome, attempt: u32, max_attempts: u32) -> Self {
        match outcome {
            Outcome::Delivered { .. } => Self::Delivered,
            Outcome::PermanentFailure(_) => Self::PermanentlyFailed,
            Outcome::RetryableFailure(_) if attempt < max_attempts => Self::RetryPending,
            Outcome::RetryableFailure(_) => Self::PermanentlyFailed,
        }
    }
}

/// One send of a batch.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based
    pub number: u32,
    pub started_at: SystemTime,
    /// Backoff waited before this attempt
    pub delay: Duration,
    pub outcome: Outcome,
}

/// Everything that happened to a batch until it reached a terminal state.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub state: BatchState,
    pub attempts: Vec<Attempt>,
    /// Set when `state` is `PermanentlyFailed`
    pub failure: Option<FailureReason>,
    /// Set when `state` is `Abandoned`
    pub dropped: Option<DropReason>,
}

impl DeliveryReport {
    /// Attempts that failed and were followed by another attempt or gave up the batch.
    pub fn transient_failures(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome.is_retryable())
            .count()
    }
}

/// Drives a batch through its states, resending the same body until it is delivered, fails
/// permanently, runs out of attempts or is abandoned.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    strategy: RetryStrategy,
}

impl RetryController {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self { strategy }
    }

    /// `abort` is the ingester-wide cancellation; a batch whose records were all cancelled stops
    /// as well, but only between attempts since a request cannot be unsent.
    pub async fn deliver<S>(
        &self,
        sender: &S,
        batch: &Batch,
        abort: &CancellationToken,
    ) -> DeliveryReport
    where
        S: BatchSender + ?Sized,
    {
        let max_attempts = self.strategy.max_attempts();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut delay = Duration::ZERO;

        loop {
            if abort.is_cancelled() || batch.is_abandoned() {
                let reason = if abort.is_cancelled() {
                    DropReason::Aborted
                } else {
                    DropReason::Cancelled
                };
                warn!(
                    destination = %batch.target(),
                    batch = batch.sequence(),
                    attempts = attempts.len(),
                    "Batch abandoned: {reason}"
                );
                return DeliveryReport {
                    state: BatchState::Abandoned,
                    attempts,
                    failure: None,
                    dropped: Some(reason),
                };
            }

            let number = attempts.len() as u32 + 1;
            let started_at = SystemTime::now();
            let outcome = classify(sender.send(batch).await);
            let state = BatchState::after(&outcome, number, max_attempts);
            attempts.push(Attempt {
                number,
                started_at,
                delay,
                outcome: outcome.clone(),
            });

            match outcome {
                Outcome::Delivered { status } => {
                    debug!(
                        destination = %batch.target(),
                        batch = batch.sequence(),
                        records = batch.len(),
                        attempts = number,
                        status,
                        "Payload was ingested"
                    );
                    return DeliveryReport {
                        state,
                        attempts,
                        failure: None,
                        dropped: None,
                    };
                }
                Outcome::RetryableFailure(reason) if state == BatchState::RetryPending => {
                    delay = self.strategy.backoff(number);
                    warn!(
                        destination = %batch.target(),
                        batch = batch.sequence(),
                        attempt = number,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to send payload, retrying: {reason}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = abort.cancelled() => {}
                    }
                }
                Outcome::RetryableFailure(reason) | Outcome::PermanentFailure(reason) => {
                    error!(
                        destination = %batch.target(),
                        batch = batch.sequence(),
                        records = batch.len(),
                        attempts = number,
                        "Failed to send payload: {}",
                        reason.diagnostic()
                    );
                    return DeliveryReport {
                        state,
                        attempts,
                        failure: Some(reason),
                        dropped: None,
                    };
                }
            }
        }
    }
}
