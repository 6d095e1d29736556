//! Per-model sliding-window rate limiting
//!
//! Models with a `rate_limit_rpm` are checked before any network I/O. A
//! rejected call is a [`ProviderError::RateLimitExceeded`], which the router
//! never retries against the same model.

use crate::api::ProviderError;
use crate::catalog::Model;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct ModelRateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl ModelRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one slot for `model`, or fail if its window is full
    pub fn acquire(&self, model: &Model) -> Result<(), ProviderError> {
        let Some(rpm) = model.rate_limit_rpm else {
            return Ok(());
        };

        let now = Instant::now();
        let mut window = self.windows.entry(model.id.clone()).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            window.pop_front();
        }

        if window.len() >= rpm as usize {
            return Err(ProviderError::RateLimitExceeded {
                model: model.id.clone(),
            });
        }
        window.push_back(now);
        Ok(())
    }

    /// Calls counted against `model_id` in the current window
    pub fn current(&self, model_id: &str) -> usize {
        let now = Instant::now();
        self.windows
            .get(model_id)
            .map(|w| w.iter().filter(|t| now.duration_since(**t) < WINDOW).count())
            .unwrap_or(0)
    }
}
