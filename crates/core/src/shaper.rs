//! Response-timing shaper.
//!
//! Cost estimation and admission take data-dependent time; shaping every
//! terminal response (success and failure alike) blunts timing oracles
//! built on that difference.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use veil_common::config::{TimeAttack, TimeAttackMethod};

#[derive(Debug, Clone, Copy)]
pub struct TimingShaper {
    config: Option<TimeAttack>,
}

impl TimingShaper {
    pub fn new(config: Option<TimeAttack>) -> Self {
        Self { config }
    }

    /// Delay the response according to the configured method: `jitter` adds
    /// a uniform delay in `[0, magnitude)` seconds, `stall` pads the total
    /// wall time since `admitted_at` to at least `magnitude` seconds.
    pub async fn shape(&self, admitted_at: Instant) {
        match self.config {
            None => {}
            Some(TimeAttack {
                method: TimeAttackMethod::Jitter,
                magnitude,
            }) => {
                let delay = magnitude.max(0.0) * rand::thread_rng().gen_range(0.0..1.0);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            Some(TimeAttack {
                method: TimeAttackMethod::Stall,
                magnitude,
            }) => {
                let target = admitted_at + Duration::from_secs_f64(magnitude.max(0.0));
                tokio::time::sleep_until(target).await;
            }
        }
    }
}
