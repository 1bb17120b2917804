// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Identifiers, weight bounds and scheduling policies.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Nanosecond timestamp on a runqueue clock.
pub type TimeNs = u64;

/// Process identifier. `Pid(0)` names the calling task at the syscall
/// boundary and is never assigned to a real task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Pid(pub i32);

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const WRR_MIN_WEIGHT: u32 = 1;
pub const WRR_MAX_WEIGHT: u32 = 20;
pub const WRR_DEFAULT_WEIGHT: u32 = 10;

const_assert!(WRR_MIN_WEIGHT >= 1);
const_assert!(WRR_MIN_WEIGHT <= WRR_DEFAULT_WEIGHT);
const_assert!(WRR_DEFAULT_WEIGHT <= WRR_MAX_WEIGHT);

pub const ROOT_UID: u32 = 0;

pub fn weight_in_range(weight: i64) -> bool {
    (WRR_MIN_WEIGHT as i64..=WRR_MAX_WEIGHT as i64).contains(&weight)
}

/// Scheduling policy of a task. Discriminants match the kernel's
/// `SCHED_*` values, with `SCHED_WRR` taking the first free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Policy {
    Normal = 0,
    Fifo = 1,
    Rr = 2,
    Batch = 3,
    Idle = 5,
    Wrr = 7,
}

impl Policy {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Normal),
            1 => Some(Self::Fifo),
            2 => Some(Self::Rr),
            3 => Some(Self::Batch),
            5 => Some(Self::Idle),
            7 => Some(Self::Wrr),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Normal => "SCHED_NORMAL",
            Self::Fifo => "SCHED_FIFO",
            Self::Rr => "SCHED_RR",
            Self::Batch => "SCHED_BATCH",
            Self::Idle => "SCHED_IDLE",
            Self::Wrr => "SCHED_WRR",
        };
        write!(f, "{}", name)
    }
}
