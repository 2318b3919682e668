//! Device abstraction: a uniform interface over the kernel driver and
//! the in-process simulator.
//!
//! Back ends own the grid/group id spaces and the submit path; jobs only
//! ever talk to [`Device`]. Ids are handed out by the dependency-injected
//! [`IdRegistry`] each back end constructs at startup, with no ambient
//! globals.

pub mod kernel;
mod sim_engine;
pub mod simulator;

use crate::error::{Result, UmdError};
use crate::memory::MemoryManager;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

/// Capacity of the group-id bitmap.
pub const MAX_GROUP_ID: usize = 1024;

/// Job quality-of-service level; selects the command-pool lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    /// Default lane.
    #[default]
    Slow,
    /// Fast lane.
    High,
}

impl QosLevel {
    /// Field value for the scheduler control word.
    pub fn code(self) -> u32 {
        match self {
            Self::Slow => 0,
            Self::High => 1,
        }
    }
}

/// Partition-pool selection mode (`UMD_PART_MODE`: '0', '1', '2').
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// One pool domain for everything.
    #[default]
    Single,
    /// Primary command-pool domain per partition.
    Pcp,
    /// Secondary domain; partition 1 banks its full-bits separately.
    Scp,
}

impl PoolMode {
    /// Parse the `UMD_PART_MODE` environment value.
    pub fn from_env_char(c: char) -> Self {
        match c {
            '1' => Self::Pcp,
            '2' => Self::Scp,
            _ => Self::Single,
        }
    }
}

/// Everything a back end needs to submit one chain.
#[derive(Debug, Clone)]
pub struct JobDesc {
    /// Grid id of the chain.
    pub grid_id: u16,
    /// Target partition.
    pub partition_id: u32,
    /// QoS lane.
    pub qos: QosLevel,
    /// Physical address of the grid-init TCB.
    pub tcb_head: u64,
    /// Physical address of the last task TCB.
    pub tcb_tail: u64,
    /// Number of TCBs in the chain.
    pub tcb_number: u32,
    /// Command pool already bound to this job, if re-scheduling.
    pub bound_pool: Option<u32>,
}

/// Result of a bounded completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The grid completed.
    Done,
    /// The deadline elapsed; nothing changed.
    Timeout,
}

/// Control operations multiplexed over the ioctl surface.
#[derive(Debug, Clone, Copy)]
pub enum IoctlCmd {
    /// Resolve an imported dma-buf to its device address.
    GetDmaBufInfo {
        /// dma-buf file descriptor.
        fd: i32,
    },
    /// Attach an external dma-buf to the device.
    AttachDmaBuf {
        /// dma-buf file descriptor.
        fd: i32,
    },
    /// Detach a previously attached dma-buf.
    DetachDmaBuf {
        /// dma-buf file descriptor.
        fd: i32,
    },
    /// Start the profiling tick counter.
    EnableTickCounter,
    /// Stop the profiling tick counter.
    DisableTickCounter,
}

/// Physical placement of a resolved dma-buf.
#[derive(Debug, Clone, Copy)]
pub struct DmaBufInfo {
    /// Device physical address.
    pub pa: u64,
    /// Buffer length.
    pub bytes: u64,
}

/// Reply of [`Device::ioctl_cmd`].
#[derive(Debug, Clone, Copy)]
pub enum IoctlReply {
    /// dma-buf placement.
    DmaBuf(DmaBufInfo),
    /// Nothing to report.
    None,
}

/// Uniform device interface consumed by graphs and jobs.
pub trait Device: Send + Sync + std::fmt::Debug {
    /// The device's memory manager.
    fn mem(&self) -> &Arc<MemoryManager>;

    /// Whether this device can execute the given target.
    fn has_target(&self, arch: u32, version: u32, config: u32, revision: u32) -> bool;

    /// Number of partitions exposed.
    fn partition_count(&self) -> u32;

    /// Number of cores in a partition.
    fn core_count(&self, partition: u32) -> u32;

    /// Cluster ids of a partition.
    fn cluster_ids(&self, partition: u32) -> Vec<u32>;

    /// Textual configuration code (simulator targets only).
    fn config_code(&self) -> Option<String> {
        None
    }

    /// Simulator configuration, when this device is the simulator.
    fn sim_config(&self) -> Option<&simulator::SimConfig> {
        None
    }

    /// Allocate the next grid id (process-wide monotonic).
    fn grid_id(&self) -> u16;

    /// Reserve a contiguous run of `count` group ids.
    ///
    /// # Errors
    ///
    /// `GroupIdExhausted` when no run of that length is free.
    fn start_group_id(&self, count: u32) -> Result<u16>;

    /// Release a group-id run.
    fn put_start_group_id(&self, start: u16, count: u32);

    /// Submit a chain. Returns the command pool the job was bound to;
    /// either the chain is enqueued or no side effect occurs.
    fn schedule(&self, desc: &JobDesc) -> Result<u32>;

    /// Block until the grid completes or `timeout_ms` elapses
    /// (negative means wait forever).
    fn poll(&self, grid_id: u16, timeout_ms: i64) -> Result<PollOutcome>;

    /// Auxiliary control operations.
    fn ioctl_cmd(&self, cmd: IoctlCmd) -> Result<IoctlReply>;
}

/// Grid and group id spaces, constructed once per back end.
#[derive(Debug)]
pub struct IdRegistry {
    grid: AtomicU16,
    groups: Mutex<Vec<bool>>,
}

impl Default for IdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdRegistry {
    /// Fresh id spaces.
    pub fn new() -> Self {
        Self {
            grid: AtomicU16::new(0),
            groups: Mutex::new(vec![false; MAX_GROUP_ID]),
        }
    }

    /// Next grid id; wraps at 16 bits.
    pub fn next_grid_id(&self) -> u16 {
        self.grid.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve a contiguous run of `count` group ids atomically.
    pub fn alloc_groups(&self, count: u32) -> Result<u16> {
        if count == 0 {
            return Ok(0);
        }
        let count = count as usize;
        let mut bitmap = self.groups.lock().expect("group bitmap lock");
        let mut i = 0;
        while i + count <= MAX_GROUP_ID {
            match bitmap[i..i + count].iter().position(|&used| used) {
                None => {
                    bitmap[i..i + count].iter_mut().for_each(|b| *b = true);
                    return Ok(i as u16);
                }
                Some(p) => i += p + 1,
            }
        }
        tracing::error!("group id bitmap exhausted for run of {count}");
        Err(UmdError::GroupIdExhausted {
            requested: count as u32,
        })
    }

    /// Release a previously reserved run.
    pub fn free_groups(&self, start: u16, count: u32) {
        if count == 0 {
            return;
        }
        let mut bitmap = self.groups.lock().expect("group bitmap lock");
        let start = start as usize;
        let end = (start + count as usize).min(MAX_GROUP_ID);
        bitmap[start..end].iter_mut().for_each(|b| *b = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc as StdArc;

    #[test]
    fn grid_ids_are_monotonic() {
        let ids = IdRegistry::new();
        let a = ids.next_grid_id();
        let b = ids.next_grid_id();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn group_runs_do_not_overlap() {
        let ids = IdRegistry::new();
        let a = ids.alloc_groups(3).unwrap();
        let b = ids.alloc_groups(5).unwrap();
        let ra = a..a + 3;
        assert!(!ra.contains(&b) && !ra.contains(&(b + 4)));
        ids.free_groups(a, 3);
        ids.free_groups(b, 5);
    }

    #[test]
    fn freed_runs_are_reusable() {
        let ids = IdRegistry::new();
        let a = ids.alloc_groups(MAX_GROUP_ID as u32).unwrap();
        assert_eq!(a, 0);
        assert!(ids.alloc_groups(1).is_err());
        ids.free_groups(a, MAX_GROUP_ID as u32);
        assert!(ids.alloc_groups(1).is_ok());
    }

    #[test]
    fn oversized_run_exhausts() {
        let ids = IdRegistry::new();
        assert!(matches!(
            ids.alloc_groups(MAX_GROUP_ID as u32 + 1),
            Err(UmdError::GroupIdExhausted { .. })
        ));
    }

    #[test]
    fn concurrent_runs_never_collide() {
        let ids = StdArc::new(IdRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = StdArc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..16 {
                    got.push(ids.alloc_groups(4).unwrap());
                }
                got
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for start in h.join().unwrap() {
                for id in start..start + 4 {
                    assert!(seen.insert(id), "group id {id} handed out twice");
                }
            }
        }
    }
}
