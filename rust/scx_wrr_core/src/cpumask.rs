// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Affinity masks
//!
//! A `Cpumask` is the set of CPUs a task may run on. It is a `BitVec` of
//! u64's sized to the number of CPUs of the cluster it was built for, so
//! the same binary can model clusters of different widths side by side.
//!
//! Masks can be built from a hexadecimal string, with "none" and "all" as
//! shorthands, or from a kernel style cpulist:
//!
//!```
//!     use scx_wrr_core::Cpumask;
//!     let mask = Cpumask::from_str(8, "0xf0").unwrap();
//!     assert!(mask.test_cpu(4));
//!     assert!(!mask.test_cpu(0));
//!
//!     let list = Cpumask::from_cpulist(8, "0-2,6").unwrap();
//!     assert_eq!(list.weight(), 4);
//!     assert_eq!(format!("{}", list), "0-2,6");
//!```

use std::fmt;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;

use crate::types::CpuId;

#[derive(Debug, Eq, Clone, Hash, PartialEq, Serialize, Deserialize)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build an empty mask covering `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a mask with every one of `nr_cpus` CPUs set.
    pub fn all(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask object from a hexadecimal string.
    pub fn from_str(nr_cpus: usize, cpumask: &str) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => return Ok(Self::all(nr_cpus)),
            _ => {}
        }
        let mut hex_str = cpumask
            .strip_prefix("0x")
            .unwrap_or(cpumask)
            .replace(['_', ','], "");
        if hex_str.len() % 2 != 0 {
            hex_str.insert(0, '0');
        }
        let bytes =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpus);
        for (index, &val) in bytes.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                mask.set_cpu(cpu).with_context(|| {
                    format!("cpumask {cpumask} names a CPU beyond the {nr_cpus} modelled")
                })?;
            }
        }

        Ok(mask)
    }

    /// Build a mask from a cpulist such as "0-3,8".
    pub fn from_cpulist(nr_cpus: usize, cpulist: &str) -> Result<Cpumask> {
        let mut mask = Self::new(nr_cpus);
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)
                .with_context(|| format!("cpulist {cpulist} is out of range"))?;
        }

        Ok(mask)
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Out of range CPUs are never set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        self.mask.get(cpu).map(|bit| *bit).unwrap_or(false)
    }

    pub fn allows(&self, cpu: CpuId) -> bool {
        self.test_cpu(cpu.index())
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The number of CPUs the mask covers.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= &other.mask;
        new
    }

    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= &other.mask;
        new
    }

    /// Iterate over the indices of set CPUs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => bail!("Failed to parse cpulist {}", group.trim()),
            },
        };
        if min > max {
            bail!("Reversed range {} in cpulist", group.trim());
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

/// Formats as a cpulist, "0-2,6".
impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = self.mask.as_raw_slice();
        match words.split_last() {
            None => write!(f, "0"),
            Some((top, rest)) => {
                write!(f, "{top:x}")?;
                for word in rest.iter().rev() {
                    write!(f, ",{word:016x}")?;
                }
                Ok(())
            }
        }
    }
}
