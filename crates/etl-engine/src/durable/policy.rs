//! Retry and timeout policy for pipeline steps

use std::time::Duration;

use crate::models::StepKind;

/// Maximum attempts per step, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub const DEFAULT_BACKOFF_COEFFICIENT: u32 = 2;

pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Timeout for the fetch and save steps
pub const IO_STEP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Timeout for the transform step
pub const TRANSFORM_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Attempts, backoff curve and timeout for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_coefficient: u32,
    pub max_backoff: Duration,
    /// Bound on a single attempt
    pub timeout: Duration,
}

impl StepPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            backoff_coefficient: DEFAULT_BACKOFF_COEFFICIENT,
            max_backoff: DEFAULT_MAX_BACKOFF,
            timeout,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is the 1-based
    /// number of the attempt that just failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff_coefficient.saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Policy for each of the three steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePolicy {
    pub fetch: StepPolicy,
    pub transform: StepPolicy,
    pub save: StepPolicy,
}

impl PipelinePolicy {
    pub fn for_step(&self, kind: StepKind) -> &StepPolicy {
        match kind {
            StepKind::FetchSource => &self.fetch,
            StepKind::Transform => &self.transform,
            StepKind::SaveDestination => &self.save,
        }
    }

    /// Same attempts and timeouts with no waiting between attempts
    pub fn without_backoff(mut self) -> Self {
        for policy in [&mut self.fetch, &mut self.transform, &mut self.save] {
            policy.initial_backoff = Duration::ZERO;
            policy.max_backoff = Duration::ZERO;
        }
        self
    }
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            fetch: StepPolicy::with_timeout(IO_STEP_TIMEOUT),
            transform: StepPolicy::with_timeout(TRANSFORM_STEP_TIMEOUT),
            save: StepPolicy::with_timeout(IO_STEP_TIMEOUT),
        }
    }
}
