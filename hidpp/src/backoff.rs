//! The retry/backoff engine used by every fallible protocol exchange.
//!
//! A [`BackoffProfile`] turns into a lazy, finite sequence of [`Attempt`]s
//! whose delays and timeouts grow exponentially up to a clamp. The first
//! attempt always carries a zero delay. Each call to
//! [`BackoffProfile::attempts`] yields a fresh sequence.

use std::time::Duration;

use tokio::time::sleep;

use crate::cancel::CancelToken;

/// Parameters controlling the delay and timeout growth of a retryable
/// operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffProfile {
    pub name: &'static str,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

/// One step of a backoff sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,

    /// How long to wait before issuing this attempt. Zero for the first.
    pub delay: Duration,

    /// The request timeout to use for this attempt.
    pub timeout: Duration,
}

impl BackoffProfile {
    /// Constructs a profile, auto-correcting inconsistent parameters: the
    /// maxima are raised to their initial values, the multiplier is forced
    /// above 1 and at least one attempt is granted.
    pub fn new(
        name: &'static str,
        initial_delay: Duration,
        max_delay: Duration,
        initial_timeout: Duration,
        max_timeout: Duration,
        multiplier: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            name,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            initial_timeout,
            max_timeout: max_timeout.max(initial_timeout),
            multiplier: multiplier.max(2),
            max_attempts: max_attempts.max(1),
        }
    }

    fn grown(initial: Duration, max: Duration, multiplier: u32, exponent: u32) -> Duration {
        // Cap the exponent so arbitrary failure counts cannot overflow.
        let factor = (multiplier as u128).saturating_pow(exponent.min(32));
        let millis = (initial.as_millis()).saturating_mul(factor);

        Duration::from_millis(millis.min(max.as_millis()) as u64)
    }

    /// The inter-attempt delay preceding the given 1-based attempt. The
    /// first attempt is issued immediately; the second waits the initial
    /// delay, and growth starts from there.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        Self::grown(
            self.initial_delay,
            self.max_delay,
            self.multiplier,
            attempt - 2,
        )
    }

    /// The request timeout for the given 1-based attempt. The first attempt
    /// uses the initial timeout.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        Self::grown(
            self.initial_timeout,
            self.max_timeout,
            self.multiplier,
            attempt.max(1) - 1,
        )
    }

    /// Yields the full attempt sequence. Restartable: every call starts a
    /// fresh sequence.
    pub fn attempts(&self) -> impl Iterator<Item = Attempt> + '_ {
        (1..=self.max_attempts).map(|number| Attempt {
            number,
            delay: self.delay_for(number),
            timeout: self.timeout_for(number),
        })
    }

    /// Drives an operation through the attempt sequence, sleeping each
    /// attempt's delay first and stopping at the first `Some` result.
    ///
    /// The cancellation token is honored between attempts; a cancelled run
    /// resolves to `None`.
    pub async fn run<T, F, Fut>(&self, cancel: &CancelToken, mut op: F) -> Option<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in self.attempts() {
            if cancel.is_cancelled() {
                return None;
            }

            if !attempt.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = sleep(attempt.delay) => {},
                }
            }

            if let Some(value) = op(attempt).await {
                return Some(value);
            }
        }

        None
    }
}

/// The named profiles used across the daemon, with their default
/// parameters. The configuration layer may override individual fields.
#[derive(Clone, Debug)]
pub struct BackoffProfiles {
    /// Device initialization rounds.
    pub init: BackoffProfile,

    /// Battery queries, polled and on-demand.
    pub battery: BackoffProfile,

    /// Device metadata resolution (name, type, firmware info).
    pub metadata: BackoffProfile,

    /// Feature table enumeration.
    pub feature_enum: BackoffProfile,

    /// Ping probes.
    pub ping: BackoffProfile,

    /// Receiver bring-up register access.
    pub receiver_init: BackoffProfile,
}

impl Default for BackoffProfiles {
    fn default() -> Self {
        let ms = Duration::from_millis;

        Self {
            init: BackoffProfile::new("init", ms(2000), ms(60000), ms(1000), ms(5000), 2, 10),
            battery: BackoffProfile::new("battery", ms(0), ms(10000), ms(1000), ms(5000), 2, 3),
            metadata: BackoffProfile::new("metadata", ms(500), ms(30000), ms(500), ms(3000), 2, 5),
            feature_enum: BackoffProfile::new(
                "feature_enum",
                ms(1000),
                ms(30000),
                ms(1000),
                ms(5000),
                2,
                3,
            ),
            ping: BackoffProfile::new("ping", ms(100), ms(5000), ms(100), ms(1000), 2, 5),
            receiver_init: BackoffProfile::new(
                "receiver_init",
                ms(500),
                ms(5000),
                ms(1000),
                ms(3000),
                2,
                3,
            ),
        }
    }
}

impl BackoffProfiles {
    /// Looks up a profile by its configuration name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut BackoffProfile> {
        match name {
            "init" => Some(&mut self.init),
            "battery" => Some(&mut self.battery),
            "metadata" => Some(&mut self.metadata),
            "feature_enum" => Some(&mut self.feature_enum),
            "ping" => Some(&mut self.ping),
            "receiver_init" => Some(&mut self.receiver_init),
            _ => None,
        }
    }
}
