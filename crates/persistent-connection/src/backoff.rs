//! Reconnect delay policy.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::TimingConfig;

/// Grow `current` by `multiplier`, capped at `ceiling`.
pub fn next_delay(current: Duration, ceiling: Duration, multiplier: f64) -> Duration {
    scale_ms(current, multiplier).min(ceiling)
}

fn scale_ms(d: Duration, factor: f64) -> Duration {
    Duration::from_millis((d.as_millis() as f64 * factor).round() as u64)
}

/// Fraction in `[0, 1)` taken from the wall clock's subsecond nanos.
pub(crate) fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 1_000_000_000.0
}

/// Reconnect backoff state owned by the supervisor.
#[derive(Debug)]
pub(crate) struct Backoff {
    timing: TimingConfig,
    delay: Duration,
    ceiling: Duration,
    admin: bool,
    last_attempt: Option<Instant>,
    last_established: Option<Instant>,
}

impl Backoff {
    pub fn new(timing: TimingConfig) -> Self {
        Self {
            delay: timing.min_reconnect_delay,
            ceiling: timing.max_reconnect_delay,
            admin: false,
            last_attempt: None,
            last_established: None,
            timing,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn reset(&mut self) {
        self.delay = self.timing.min_reconnect_delay;
    }

    /// Switch to the admin ceiling. Never reverts.
    pub fn escalate_to_admin(&mut self) {
        if !self.admin {
            tracing::info!("Admin credential detected, reducing max reconnect delay");
        }
        self.admin = true;
        self.ceiling = self.timing.admin_max_reconnect_delay;
        self.delay = self.delay.min(self.ceiling);
    }

    /// Repeated invalid tokens: recovery is unlikely, so wait a long while.
    pub fn escalate_after_invalid_tokens(&mut self) {
        self.escalate_to_admin();
        self.delay = self.timing.admin_max_reconnect_delay;
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
        self.last_established = None;
    }

    pub fn record_established(&mut self, now: Instant) {
        self.last_established = Some(now);
    }

    /// Becoming visible while parked at the ceiling drops the delay to the
    /// floor. Returns whether it did.
    pub fn on_visible(&mut self) -> bool {
        if self.delay == self.ceiling {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Compute the wait before the next connect attempt after a disconnect,
    /// then grow the delay for the attempt after that.
    ///
    /// `jitter` must be in `[0, 1)`.
    pub fn schedule_after_disconnect(
        &mut self,
        now: Instant,
        visible: bool,
        jitter: f64,
    ) -> Duration {
        if !visible {
            tracing::debug!("Not visible, delaying reconnect");
            self.delay = self.ceiling;
            self.last_attempt = Some(now);
        } else if let Some(established) = self.last_established.take()
            && now.saturating_duration_since(established) >= self.timing.reset_after_connected_for
        {
            self.reset();
        }

        let since_attempt = self
            .last_attempt
            .map_or(Duration::MAX, |t| now.saturating_duration_since(t));
        let wait = self.delay.saturating_sub(since_attempt);
        let wait = scale_ms(wait, jitter.clamp(0.0, 1.0));

        self.delay = next_delay(self.delay, self.ceiling, self.timing.reconnect_multiplier);
        wait
    }
}
