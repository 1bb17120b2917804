// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Weight control
//!
//! `sched_setweight(pid, weight)` and `sched_getweight(pid)` as seen by a
//! caller identified by `Credentials`. Pid 0 names the caller itself.
//!
//! Validation runs in a fixed order and the first failure wins. Nothing is
//! mutated unless every check passed. A non-root caller may only lower the
//! weight of its own tasks, root may set any weight on any task.

use std::fmt;

use log::debug;

use crate::cluster::Cluster;
use crate::types::weight_in_range;
use crate::types::Pid;
use crate::types::ROOT_UID;

pub const NR_SCHED_SETWEIGHT: i64 = 294;
pub const NR_SCHED_GETWEIGHT: i64 = 295;

/// Identity of the task issuing a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: Pid,
    pub uid: u32,
}

impl Credentials {
    pub fn root(pid: Pid) -> Self {
        Self { pid, uid: ROOT_UID }
    }

    pub fn is_root(&self) -> bool {
        self.uid == ROOT_UID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Bad argument or task not under SCHED_WRR.
    Inval,
    /// No such task.
    Srch,
    /// Caller may not change this weight.
    Perm,
}

impl SchedError {
    pub fn errno(self) -> i32 {
        match self {
            SchedError::Inval => libc::EINVAL,
            SchedError::Srch => libc::ESRCH,
            SchedError::Perm => libc::EPERM,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Inval => write!(f, "invalid argument"),
            SchedError::Srch => write!(f, "no such process"),
            SchedError::Perm => write!(f, "operation not permitted"),
        }
    }
}

impl std::error::Error for SchedError {}

fn check_pid(call: &str, pid: i64) -> Result<(), SchedError> {
    if pid < 0 {
        debug!("{}: pid {} should be positive", call, pid);
        return Err(SchedError::Inval);
    }
    Ok(())
}

/// Map a non-negative pid argument to a task pid. Pids beyond the pid
/// space name no task.
fn resolve(call: &str, caller: &Credentials, pid: i64) -> Result<Pid, SchedError> {
    match pid {
        0 => Ok(caller.pid),
        _ => i32::try_from(pid).map(Pid).map_err(|_| {
            debug!("{}: process {} not found", call, pid);
            SchedError::Srch
        }),
    }
}

pub fn set_weight(
    cluster: &Cluster,
    caller: &Credentials,
    pid: i64,
    weight: i64,
) -> Result<(), SchedError> {
    const CALL: &str = "sched_setweight";

    check_pid(CALL, pid)?;
    if !weight_in_range(weight) {
        debug!("{}: weight {} should be between 1 and 20", CALL, weight);
        return Err(SchedError::Inval);
    }
    let weight = weight as u32;
    let pid = resolve(CALL, caller, pid)?;

    let mut guard = cluster.task_rq_lock(pid).ok_or_else(|| {
        debug!("{}: process {} not found", CALL, pid);
        SchedError::Srch
    })?;
    let rq = &mut *guard;
    let Some(task) = rq.tasks.get_mut(&pid) else {
        return Err(SchedError::Srch);
    };

    if !task.is_wrr() {
        debug!("{}: process {} policy is {}", CALL, pid, task.policy);
        return Err(SchedError::Inval);
    }
    if !caller.is_root() && caller.uid != task.uid {
        debug!(
            "{}: uid {} may not change process {} owned by uid {}",
            CALL, caller.uid, pid, task.uid
        );
        return Err(SchedError::Perm);
    }
    if !caller.is_root() && weight > task.wrr.weight {
        debug!(
            "{}: only root may raise process {} from {} to {}",
            CALL, pid, task.wrr.weight, weight
        );
        return Err(SchedError::Perm);
    }

    let old = task.wrr.weight;
    rq.wrr.reweight(pid, &mut task.wrr, weight);
    debug!(
        "{}: process {} weight {} -> {} (cpu {} total {})",
        CALL,
        pid,
        old,
        weight,
        rq.cpu,
        rq.wrr.total_weight()
    );
    Ok(())
}

pub fn get_weight(cluster: &Cluster, caller: &Credentials, pid: i64) -> Result<u32, SchedError> {
    const CALL: &str = "sched_getweight";

    check_pid(CALL, pid)?;
    let pid = resolve(CALL, caller, pid)?;
    let rq = cluster.task_rq_lock(pid).ok_or_else(|| {
        debug!("{}: process {} not found", CALL, pid);
        SchedError::Srch
    })?;
    let task = rq.tasks.get(&pid).ok_or(SchedError::Srch)?;
    if !task.is_wrr() {
        debug!("{}: process {} policy is {}", CALL, pid, task.policy);
        return Err(SchedError::Inval);
    }
    Ok(task.wrr.weight)
}

/// Syscall entry. Returns the call's value, or `-errno` on failure.
pub fn syscall(cluster: &Cluster, caller: &Credentials, nr: i64, args: &[i64]) -> i64 {
    let arg = |i: usize| args.get(i).copied().unwrap_or(0);
    let res = match nr {
        NR_SCHED_SETWEIGHT => set_weight(cluster, caller, arg(0), arg(1)).map(|()| 0),
        NR_SCHED_GETWEIGHT => get_weight(cluster, caller, arg(0)).map(|w| w as i64),
        _ => return -(libc::ENOSYS as i64),
    };
    match res {
        Ok(v) => v,
        Err(e) => -(e.errno() as i64),
    }
}
