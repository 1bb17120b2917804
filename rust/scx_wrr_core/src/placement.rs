// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::anyhow;
use anyhow::Result;

use crate::cluster::Core;
use crate::cpumask::Cpumask;
use crate::types::CpuId;

/// Online CPU in `allowed` with the smallest aggregate weight. Equal loads
/// resolve to the lowest CPU index.
///
/// Loads are read one CPU at a time without locks. Racing updates can make
/// the choice suboptimal, never invalid.
pub fn select_least_loaded(cores: &[Core], allowed: &Cpumask) -> Result<CpuId> {
    let mut best: Option<(CpuId, u64)> = None;
    for core in cores {
        if !core.is_online() || !allowed.allows(core.id()) {
            continue;
        }
        let load = core.load();
        match best {
            Some((_, min)) if load >= min => {}
            _ => best = Some((core.id(), load)),
        }
    }

    best.map(|(cpu, _)| cpu)
        .ok_or_else(|| anyhow!("no online CPU in affinity mask {}", allowed))
}
