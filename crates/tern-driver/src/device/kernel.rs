//! Kernel-driver back end.
//!
//! Talks to the character device exported by the kernel-mode driver;
//! `schedule` and `poll` are thin ioctl translations. The ioctl surface
//! is modeled here; the in-kernel side is not part of this crate.

use super::{
    Device, DmaBufInfo, IdRegistry, IoctlCmd, IoctlReply, JobDesc, PollOutcome, QosLevel,
};
use crate::error::{Result, UmdError};
use crate::memory::{MemLayout, MemoryManager};
use rustix::fs::OFlags;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// Schedule request passed to the kernel driver.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct KmdJobDesc {
    head_tcb_pa: u64,
    tail_tcb_pa: u64,
    tcb_number: u32,
    partition_id: u32,
    grid_id: u32,
    exec_flag: u32,
}

/// Completion wait request.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct KmdWait {
    grid_id: u32,
    status: u32,
    timeout_ms: i64,
}

/// dma-buf resolution request.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct KmdDmaBuf {
    fd: i32,
    pad: u32,
    pa: u64,
    bytes: u64,
}

/// Capability report.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct KmdCaps {
    partition_cnt: u32,
    core_cnt: u32,
    cluster_cnt: u32,
    max_cmdpool_cnt: u32,
}

const QOS_FAST: u32 = 1 << 0;

// ioctl numbers of the tern-npu character device. // inferred
const TERN_IOCTL_GET_CAPS: libc::c_ulong = 0x8010_5400;
const TERN_IOCTL_SCHEDULE: libc::c_ulong = 0x4020_5401;
const TERN_IOCTL_WAIT: libc::c_ulong = 0xC018_5402;
const TERN_IOCTL_GET_DMABUF: libc::c_ulong = 0xC018_5403;
const TERN_IOCTL_ATTACH_DMABUF: libc::c_ulong = 0xC018_5404;
const TERN_IOCTL_DETACH_DMABUF: libc::c_ulong = 0x4008_5405;
const TERN_IOCTL_TICK_COUNTER: libc::c_ulong = 0x4004_5406;

const WAIT_STATUS_DONE: u32 = 1;
const WAIT_STATUS_TIMEOUT: u32 = 2;

/// Kernel-driver device handle.
#[derive(Debug)]
pub struct KernelDevice {
    file: File,
    mem: Arc<MemoryManager>,
    ids: IdRegistry,
    caps: KmdCaps,
}

impl KernelDevice {
    /// Open the device node and query its capabilities.
    ///
    /// # Errors
    ///
    /// Returns error if the node is missing or the capability ioctl
    /// fails.
    pub fn open(path: &Path, layout: MemLayout) -> Result<Self> {
        if !path.exists() {
            return Err(UmdError::TargetNotFound {
                reason: format!("device node {}", path.display()),
            });
        }

        #[allow(clippy::cast_possible_wrap)]
        let nonblock_flag = OFlags::NONBLOCK.bits() as i32;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nonblock_flag)
            .open(path)?;

        let mut caps = KmdCaps::default();
        // SAFETY: TERN_IOCTL_GET_CAPS reads a KmdCaps from the driver.
        // The fd is open for the lifetime of the call and caps is a
        // plain-old-data struct owned by this frame.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TERN_IOCTL_GET_CAPS, &mut caps) };
        if ret < 0 {
            return Err(UmdError::Io {
                source: std::io::Error::last_os_error(),
            });
        }
        tracing::info!(
            "kernel device {}: {} partition(s), {} core(s)",
            path.display(),
            caps.partition_cnt,
            caps.core_cnt
        );

        Ok(Self {
            file,
            mem: MemoryManager::new(layout),
            ids: IdRegistry::new(),
            caps,
        })
    }

    fn ioctl<T>(&self, req: libc::c_ulong, arg: &mut T) -> Result<()> {
        // SAFETY: all request codes paired with their #[repr(C)] payload
        // structs above; arg outlives the call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), req, arg) };
        if ret < 0 {
            return Err(UmdError::Io {
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl Device for KernelDevice {
    fn mem(&self) -> &Arc<MemoryManager> {
        &self.mem
    }

    fn has_target(&self, arch: u32, version: u32, _config: u32, revision: u32) -> bool {
        arch == tern_chip::ARCH_TERN && version == tern_chip::ISA_V3_1 && revision == 0
    }

    fn partition_count(&self) -> u32 {
        self.caps.partition_cnt
    }

    fn core_count(&self, _partition: u32) -> u32 {
        self.caps.core_cnt
    }

    fn cluster_ids(&self, partition: u32) -> Vec<u32> {
        if partition < self.caps.partition_cnt {
            (0..self.caps.cluster_cnt).collect()
        } else {
            Vec::new()
        }
    }

    fn grid_id(&self) -> u16 {
        self.ids.next_grid_id()
    }

    fn start_group_id(&self, count: u32) -> Result<u16> {
        self.ids.alloc_groups(count)
    }

    fn put_start_group_id(&self, start: u16, count: u32) {
        self.ids.free_groups(start, count);
    }

    fn schedule(&self, desc: &JobDesc) -> Result<u32> {
        let mut kdesc = KmdJobDesc {
            head_tcb_pa: desc.tcb_head,
            tail_tcb_pa: desc.tcb_tail,
            tcb_number: desc.tcb_number,
            partition_id: desc.partition_id,
            grid_id: u32::from(desc.grid_id),
            exec_flag: if desc.qos == QosLevel::High { QOS_FAST } else { 0 },
        };
        self.ioctl(TERN_IOCTL_SCHEDULE, &mut kdesc)?;
        // the kernel driver owns pool placement
        Ok(desc.bound_pool.unwrap_or(0))
    }

    fn poll(&self, grid_id: u16, timeout_ms: i64) -> Result<PollOutcome> {
        let mut wait = KmdWait {
            grid_id: u32::from(grid_id),
            status: 0,
            timeout_ms,
        };
        self.ioctl(TERN_IOCTL_WAIT, &mut wait)?;
        match wait.status {
            WAIT_STATUS_DONE => Ok(PollOutcome::Done),
            WAIT_STATUS_TIMEOUT => Ok(PollOutcome::Timeout),
            _ => Err(UmdError::JobException { grid_id }),
        }
    }

    fn ioctl_cmd(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        match cmd {
            IoctlCmd::GetDmaBufInfo { fd } => {
                let mut arg = KmdDmaBuf {
                    fd,
                    ..KmdDmaBuf::default()
                };
                self.ioctl(TERN_IOCTL_GET_DMABUF, &mut arg)?;
                Ok(IoctlReply::DmaBuf(DmaBufInfo {
                    pa: arg.pa,
                    bytes: arg.bytes,
                }))
            }
            IoctlCmd::AttachDmaBuf { fd } => {
                let mut arg = KmdDmaBuf {
                    fd,
                    ..KmdDmaBuf::default()
                };
                self.ioctl(TERN_IOCTL_ATTACH_DMABUF, &mut arg)?;
                Ok(IoctlReply::DmaBuf(DmaBufInfo {
                    pa: arg.pa,
                    bytes: arg.bytes,
                }))
            }
            IoctlCmd::DetachDmaBuf { fd } => {
                let mut arg = fd;
                self.ioctl(TERN_IOCTL_DETACH_DMABUF, &mut arg)?;
                Ok(IoctlReply::None)
            }
            IoctlCmd::EnableTickCounter => {
                let mut arg = 1u32;
                self.ioctl(TERN_IOCTL_TICK_COUNTER, &mut arg)?;
                Ok(IoctlReply::None)
            }
            IoctlCmd::DisableTickCounter => {
                let mut arg = 0u32;
                self.ioctl(TERN_IOCTL_TICK_COUNTER, &mut arg)?;
                Ok(IoctlReply::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_reports_target_not_found() {
        let r = KernelDevice::open(Path::new("/dev/tern-npu-nonexistent"), MemLayout::default());
        assert!(matches!(r, Err(UmdError::TargetNotFound { .. })));
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_real_device() {
        let dev = KernelDevice::open(Path::new("/dev/tern-npu0"), MemLayout::default()).unwrap();
        assert!(dev.partition_count() >= 1);
    }
}
