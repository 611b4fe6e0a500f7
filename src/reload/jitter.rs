//! # Jitter policy for reload thresholds.
//!
//! [`JitterPolicy`] randomizes reload thresholds so that sibling processes of
//! one worker definition, started together, do not all recycle at the same moment.
//!
//! - [`JitterPolicy::None`] — no randomization, predictable thresholds
//! - [`JitterPolicy::Full`] — random value in [0, threshold] (most aggressive)
//! - [`JitterPolicy::Equal`] — threshold/2 + random[0, threshold/2] (balanced)

use rand::Rng;
use std::time::Duration;

/// Policy controlling randomization of reload thresholds.
///
/// ## Trade-offs
/// - **None**: Predictable, but siblings reload in lockstep
/// - **Full**: Maximum spread, may reload very early
/// - **Equal**: Balanced (recommended for most use cases)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// No jitter: use the exact threshold.
    #[default]
    None,

    /// Full jitter: random value in [0, threshold].
    Full,

    /// Equal jitter: threshold/2 + random[0, threshold/2].
    ///
    /// Preserves ~75% of the original threshold on average.
    Equal,
}

impl JitterPolicy {
    /// Applies jitter to a time threshold (millisecond resolution).
    pub fn apply(&self, period: Duration) -> Duration {
        let ms = period.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(self.spread(ms))
    }

    /// Applies jitter to a count threshold (e.g. served requests).
    pub fn apply_count(&self, count: u64) -> u64 {
        self.spread(count)
    }

    fn spread(&self, value: u64) -> u64 {
        if value == 0 {
            return 0;
        }
        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => value,
            JitterPolicy::Full => rng.random_range(0..=value),
            JitterPolicy::Equal => {
                let half = value / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                (value - half) + jitter
            }
        }
    }
}
