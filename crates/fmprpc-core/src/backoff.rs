//! Backoff policies and the retry loop built on them.
//!
//! Connections take a [`BackoffFactory`] for reconnects and another for
//! throttled commands, so tests can swap in deterministic policies.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::Result;

/// Produces successive waits between retries.
pub trait Backoff: Send {
    /// The next wait, or `None` to give up.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Starts over, as if no attempt had been made.
    fn reset(&mut self);
}

/// Builds a fresh policy for each retry loop.
pub type BackoffFactory = Arc<dyn Fn() -> Box<dyn Backoff> + Send + Sync>;

/// Configuration for [`ExponentialBackoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoffConfig {
    /// First wait (default: 500ms).
    pub initial_interval: Duration,
    /// Each wait is drawn from `[i - f*i, i + f*i]` (default: 0.5).
    pub randomization_factor: f64,
    /// Growth per attempt (default: 1.5).
    pub multiplier: f64,
    /// Cap on the un-randomized interval (default: 60 seconds).
    pub max_interval: Duration,
    /// Give up after this long; `None` never gives up (default: 15 minutes).
    pub max_elapsed_time: Option<Duration>,
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl ExponentialBackoffConfig {
    /// The policy connections use by default: never give up, cap the
    /// interval at 10 seconds.
    pub fn unbounded() -> Self {
        Self {
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
            ..Self::default()
        }
    }
}

/// Randomized exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: ExponentialBackoffConfig,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: ExponentialBackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &ExponentialBackoffConfig {
        &self.config
    }

    fn randomize(&self, interval: Duration) -> Duration {
        let factor = self.config.randomization_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return interval;
        }
        let secs = interval.as_secs_f64();
        let delta = factor * secs;
        let low = (secs - delta).max(0.0);
        let high = secs + delta;
        if high <= low {
            return interval;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(ExponentialBackoffConfig::default())
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_elapsed_time {
            if self.started.elapsed() > max {
                return None;
            }
        }
        let wait = self.randomize(self.current);
        let grown = self.current.as_secs_f64() * self.config.multiplier;
        self.current = if grown >= self.config.max_interval.as_secs_f64() {
            self.config.max_interval
        } else {
            Duration::from_secs_f64(grown)
        };
        Some(wait)
    }

    fn reset(&mut self) {
        self.current = self.config.initial_interval;
        self.started = Instant::now();
    }
}

/// The same wait every time.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.0)
    }

    fn reset(&mut self) {}
}

/// Retries immediately, forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroBackoff;

impl Backoff for ZeroBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn reset(&mut self) {}
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBackoff;

impl Backoff for StopBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

/// Caps another policy at `max` retries.
#[derive(Debug, Clone)]
pub struct WithMaxRetries<B> {
    inner: B,
    max: u32,
    attempts: u32,
}

impl<B: Backoff> WithMaxRetries<B> {
    pub fn new(inner: B, max: u32) -> Self {
        Self {
            inner,
            max,
            attempts: 0,
        }
    }
}

impl<B: Backoff> Backoff for WithMaxRetries<B> {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempts >= self.max {
            return None;
        }
        self.attempts += 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.inner.reset();
    }
}

/// Factory for the connection defaults.
pub fn default_backoff_factory() -> BackoffFactory {
    Arc::new(|| -> Box<dyn Backoff> {
        Box::new(ExponentialBackoff::new(ExponentialBackoffConfig::unbounded()))
    })
}

/// Wraps a cloneable policy as a factory.
pub fn backoff_factory<B>(policy: B) -> BackoffFactory
where
    B: Backoff + Clone + Sync + 'static,
{
    Arc::new(move || -> Box<dyn Backoff> { Box::new(policy.clone()) })
}

/// Runs `op` until it succeeds or `backoff` gives up, calling `notify`
/// with each error and the wait before the next attempt. A wait is cut
/// short by `ctx` ending, which returns the context's error.
pub async fn retry_notify<T, F, Fut, N>(
    ctx: &Context,
    backoff: &mut dyn Backoff,
    mut op: F,
    mut notify: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(&crate::error::RpcError, Duration),
{
    backoff.reset();
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let Some(wait) = backoff.next_backoff() else {
            return Err(err);
        };
        notify(&err, wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            e = ctx.done() => return Err(e),
        }
    }
}
