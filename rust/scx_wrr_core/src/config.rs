// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::types::weight_in_range;
use crate::types::TimeNs;
use crate::types::WRR_DEFAULT_WEIGHT;

/// Tunables of the WRR class. A task of weight `w` runs for
/// `w * base_quantum` ticks per turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrrConfig {
    /// Ticks granted per unit of weight.
    pub base_quantum: u32,
    /// Period of the scheduler clock tick.
    pub tick_interval: Duration,
    /// Minimum spacing between two load balancing rounds.
    pub balance_interval: Duration,
    /// Weight given to tasks entering SCHED_WRR.
    pub default_weight: u32,
}

impl Default for WrrConfig {
    fn default() -> Self {
        Self {
            base_quantum: 10,
            tick_interval: Duration::from_millis(1),
            balance_interval: Duration::from_millis(2000),
            default_weight: WRR_DEFAULT_WEIGHT,
        }
    }
}

impl WrrConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_quantum == 0 {
            bail!("base quantum must be at least one tick");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be non-zero");
        }
        if self.balance_interval.is_zero() {
            bail!("balance interval must be non-zero");
        }
        if !weight_in_range(self.default_weight as i64) {
            bail!("default weight {} is out of range", self.default_weight);
        }
        Ok(())
    }

    pub fn tick_ns(&self) -> TimeNs {
        self.tick_interval.as_nanos() as TimeNs
    }

    pub fn balance_interval_ns(&self) -> TimeNs {
        self.balance_interval.as_nanos() as TimeNs
    }

    /// Full timeslice, in ticks, of a task with `weight`.
    pub fn timeslice(&self, weight: u32) -> u32 {
        weight * self.base_quantum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        let cfg = WrrConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.balance_interval_ns(), 2_000_000_000);
        assert_eq!(cfg.timeslice(3), 30);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = WrrConfig::default();
        cfg.base_quantum = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = WrrConfig::default();
        cfg.default_weight = 21;
        assert!(cfg.validate().is_err());

        let mut cfg = WrrConfig::default();
        cfg.tick_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
