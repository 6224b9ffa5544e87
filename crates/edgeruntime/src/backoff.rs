//! Exponential backoff shared by acquisition retries and remote delivery.

use edgecore::{AcquisitionSettings, DeliverySettings};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
        }
    }

    pub fn for_acquisition(settings: &AcquisitionSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
            settings.backoff_multiplier,
        )
    }

    pub fn for_delivery(settings: &DeliverySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
            settings.backoff_multiplier,
        )
    }

    /// Delay before retry number `attempt` (0-indexed), capped at the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Sum of the delays for the first `attempts` retries.
    pub fn total(&self, attempts: u32) -> Duration {
        (0..attempts).map(|attempt| self.delay(attempt)).sum()
    }
}
