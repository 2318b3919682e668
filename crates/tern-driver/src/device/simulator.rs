//! Simulator back end.
//!
//! Owns the single in-process engine behind a read/write lock and
//! implements the submit-queue + commit-map protocol: at most one
//! dispatch is outstanding per pool at a time; completions arrive on
//! the engine's callback thread and are drained by pollers through a
//! condition variable. The callback only publishes; the poller only
//! consumes.

use super::sim_engine::{SimCode, SimEngine};
use super::{
    Device, DmaBufInfo, IdRegistry, IoctlCmd, IoctlReply, JobDesc, PollOutcome, PoolMode, QosLevel,
};
use crate::error::{Result, UmdError};
use crate::memory::{BufferDesc, MemLayout, MemRegion, MemoryManager};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};
use tern_chip::arch::{hi, lo, ARCH_TERN, ISA_V3_1, PAGE_SIZE};
use tern_chip::regs::{
    self, sched_ctrl, TSM_BUILD_INFO, TSM_CMD_SCHED_ADDR_HI, TSM_CMD_SCHED_ADDR_LO,
    TSM_CMD_SCHED_CTRL, TSM_CMD_TCB_NUMBER, TSM_STATUS,
};
use tern_chip::tcb::GM_MAX_SIZE;

/// Simulator configuration; also feeds the emulation dump's `[COMMON]`
/// section.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Textual target override (`T3_1408`, `T3_1408MP2`, `T3_1408MP4`).
    pub npu_arch_desc: Option<String>,
    /// Log level forwarded to the engine (0..=3).
    pub log_level: u32,
    /// Engine log destination.
    pub log_file_path: PathBuf,
    /// Mirror engine logs to the console.
    pub verbose: bool,
    /// Use AVX in the engine's kernels.
    pub enable_avx: bool,
    /// Zero device memory on allocation.
    pub enable_calloc: bool,
    /// Model the L2D cache.
    pub en_l2d: bool,
    /// GM window size in bytes (0 disables GM).
    pub gm_size: u64,
    /// Engine plugin to load.
    pub plugin_name: Option<String>,
    /// Profiling JSON output.
    pub json_filename: Option<String>,
    /// Enable the fast-perf profile block.
    pub en_fast_perf: bool,
    /// Modeled clock, MHz.
    pub freq_mhz: u32,
    /// Modeled DDR read latency.
    pub ddr_latency_rd: u32,
    /// Modeled DDR write latency.
    pub ddr_latency_wr: u32,
    /// Modeled DDR bus width, bits.
    pub ddr_bw: u32,
    /// Modeled DDR bandwidth derating.
    pub ddr_bw_ratio: f32,
    /// Perf report destination.
    pub perf_report: Option<String>,
    /// Device memory layout.
    pub mem_layout: MemLayout,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            npu_arch_desc: None,
            log_level: 0,
            log_file_path: PathBuf::from("."),
            verbose: false,
            enable_avx: false,
            enable_calloc: false,
            en_l2d: false,
            gm_size: 0,
            plugin_name: None,
            json_filename: None,
            en_fast_perf: false,
            freq_mhz: 1000,
            ddr_latency_rd: 0,
            ddr_latency_wr: 0,
            ddr_bw: 256,
            ddr_bw_ratio: 1.0,
            perf_report: None,
            mem_layout: MemLayout::default(),
        }
    }
}

/// Completed grid ids published by the engine callback.
#[derive(Debug, Default)]
struct DoneSignal {
    pending: Mutex<HashSet<u16>>,
    cv: Condvar,
}

#[derive(Debug)]
struct SimInner {
    engine: Arc<SimEngine>,
    buffer_queue: VecDeque<JobDesc>,
    commit_map: HashMap<u16, JobDesc>,
    done_set: HashSet<u16>,
    /// One dispatch outstanding at a time across the pool.
    busy: bool,
    next_pool: u32,
}

/// In-process simulator device.
#[derive(Debug)]
pub struct SimDevice {
    mem: Arc<MemoryManager>,
    ids: IdRegistry,
    cfg: SimConfig,
    code: SimCode,
    partition_mode: PoolMode,
    max_cmdpool_cnt: u32,
    inner: RwLock<SimInner>,
    done: Arc<DoneSignal>,
    _debug_page: BufferDesc,
}

impl SimDevice {
    /// Create the simulator for the requested target.
    ///
    /// Environment overrides: `UMD_ASID_BASE` (hex PA for ASID0),
    /// `UMD_PART_MODE` ('0'..'2').
    ///
    /// # Errors
    ///
    /// `TargetNotFound` for unknown arch descriptors.
    pub fn new(cfg: SimConfig) -> Result<Arc<Self>> {
        let code = parse_arch_desc(cfg.npu_arch_desc.as_deref())?;
        let mem = MemoryManager::new(cfg.mem_layout.clone());

        if let Ok(base) = std::env::var("UMD_ASID_BASE") {
            let base = base.trim_start_matches("0x");
            if let Ok(pa) = u64::from_str_radix(base, 16) {
                let top = mem.asid_base(crate::memory::ASID_MAX - 1)
                    + mem.region_size(crate::memory::ASID_MAX - 1);
                if pa < top {
                    tracing::warn!(
                        "requested ASID0 base {pa:#x} below configured window top {top:#x}, watch for conflicts"
                    );
                }
                if pa != mem.asid_base(0) {
                    mem.reset_asid_base(MemRegion::Asid0, pa)?;
                }
            }
        }

        if cfg.gm_size > 0 {
            mem.gm_init(cfg.gm_size.min(GM_MAX_SIZE))?;
        }

        let engine = SimEngine::new(code, Arc::clone(&mem));
        // reserve a page so the zero offset of ASID0 is never handed out
        let debug_page = mem.alloc(PAGE_SIZE, 0, "rsv", MemRegion::Asid0)?;

        let max_cmdpool_cnt = regs::max_cmdpool_count(engine.read_register(TSM_BUILD_INFO));

        let partition_mode = std::env::var("UMD_PART_MODE")
            .ok()
            .and_then(|v| v.chars().next())
            .map_or(PoolMode::default(), PoolMode::from_env_char);

        let done = Arc::new(DoneSignal::default());
        {
            let done = Arc::clone(&done);
            engine.set_event_handler(Arc::new(move |event, value| {
                if event == regs::EV_GRID_END {
                    let mut pending = done.pending.lock().expect("pending lock");
                    pending.insert(value as u16);
                    done.cv.notify_all();
                } else {
                    tracing::warn!("unhandled engine event {event}");
                }
            }));
        }

        Ok(Arc::new(Self {
            mem,
            ids: IdRegistry::new(),
            cfg,
            code,
            partition_mode,
            max_cmdpool_cnt,
            inner: RwLock::new(SimInner {
                engine,
                buffer_queue: VecDeque::new(),
                commit_map: HashMap::new(),
                done_set: HashSet::new(),
                busy: false,
                next_pool: 0,
            }),
            done,
            _debug_page: debug_page,
        }))
    }

    fn assign_pool(&self, inner: &mut SimInner, desc: &JobDesc) -> u32 {
        if let Some(pool) = desc.bound_pool {
            return pool;
        }
        let pool = inner.next_pool % self.max_cmdpool_cnt;
        inner.next_pool = inner.next_pool.wrapping_add(1);
        pool
    }

    fn is_cmdpool_full(&self, qos: QosLevel, part_id: u32, cluster_idx: u32, reg_val: u32) -> bool {
        let scp_bank = self.partition_mode == PoolMode::Scp && part_id == 1;
        let bit = match (qos, scp_bank) {
            (QosLevel::Slow, false) => cluster_idx,
            (QosLevel::Slow, true) => cluster_idx + 4,
            (QosLevel::High, false) => cluster_idx + 8,
            (QosLevel::High, true) => cluster_idx + 12,
        };
        reg_val & (1 << bit) != 0
    }

    fn dispatch(&self, inner: &mut SimInner, desc: &JobDesc, pool: u32, create: bool) {
        let engine = &inner.engine;
        engine.write_register(TSM_CMD_SCHED_ADDR_HI, hi(desc.tcb_head));
        engine.write_register(TSM_CMD_SCHED_ADDR_LO, lo(desc.tcb_head));
        engine.write_register(TSM_CMD_TCB_NUMBER, desc.tcb_number);

        let select = sched_ctrl::select(desc.partition_id, pool, desc.qos.code());
        if create {
            engine.write_register(TSM_CMD_SCHED_CTRL, select | sched_ctrl::CREATE_CMD_POOL);
        }
        tracing::debug!("dispatching grid {} to pool {pool}", desc.grid_id);
        engine.write_register(TSM_CMD_SCHED_CTRL, select | sched_ctrl::DISPATCH_CMD_POOL);
        inner.commit_map.insert(desc.grid_id, desc.clone());
        inner.busy = true;
    }

    /// Drain the submit buffer into the hardware pool; at most one batch
    /// in flight at a time.
    fn fill_commit_queue(&self, inner: &mut SimInner) {
        const MAX_LIMIT: usize = 1;
        if inner.commit_map.len() >= 16 {
            return;
        }
        for _ in 0..MAX_LIMIT {
            if inner.busy {
                break;
            }
            let Some(desc) = inner.buffer_queue.front().cloned() else {
                break;
            };
            let reg_val = inner.engine.read_register(TSM_STATUS);
            let pool = desc.bound_pool.unwrap_or(0);
            if self.is_cmdpool_full(desc.qos, desc.partition_id, 0, reg_val) {
                tracing::warn!("command pool {pool} still full");
                break;
            }
            inner.buffer_queue.pop_front();
            self.dispatch(inner, &desc, pool, false);
        }
    }

    fn drain_completions(&self, grids: Vec<u16>) {
        let mut inner = self.inner.write().expect("simulator lock");
        for grid in grids {
            if inner.commit_map.remove(&grid).is_some() {
                inner.done_set.insert(grid);
                inner.busy = false;
            } else {
                // completion raced ahead of the commit bookkeeping;
                // leave it pending for the next drain
                self.done
                    .pending
                    .lock()
                    .expect("pending lock")
                    .insert(grid);
            }
        }
        if !inner.buffer_queue.is_empty() {
            self.fill_commit_queue(&mut inner);
        }
        drop(inner);
        // wake pollers whose grid just reached the done set
        self.done.cv.notify_all();
    }
}

fn parse_arch_desc(desc: Option<&str>) -> Result<SimCode> {
    match desc {
        None | Some("T3_1408") => Ok(SimCode::T3_1408),
        Some("T3_1408MP2") => Ok(SimCode::T3_1408Mp2),
        Some("T3_1408MP4") => Ok(SimCode::T3_1408Mp4),
        Some(other) => {
            tracing::error!("only T3_1408/T3_1408MP2/T3_1408MP4 are supported");
            Err(UmdError::TargetNotFound {
                reason: format!("simulator target {other}"),
            })
        }
    }
}

impl Device for SimDevice {
    fn mem(&self) -> &Arc<MemoryManager> {
        &self.mem
    }

    fn has_target(&self, arch: u32, version: u32, config: u32, revision: u32) -> bool {
        arch == ARCH_TERN && version == ISA_V3_1 && config == 1408 && revision == 0
    }

    fn partition_count(&self) -> u32 {
        1
    }

    fn core_count(&self, _partition: u32) -> u32 {
        self.code.core_count()
    }

    fn cluster_ids(&self, partition: u32) -> Vec<u32> {
        if partition == 0 {
            vec![0]
        } else {
            Vec::new()
        }
    }

    fn config_code(&self) -> Option<String> {
        Some(self.code.config_code().to_string())
    }

    fn sim_config(&self) -> Option<&SimConfig> {
        Some(&self.cfg)
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
        let mut inner = self.inner.write().expect("simulator lock");
        let pool = self.assign_pool(&mut inner, desc);
        let mut desc = desc.clone();
        desc.bound_pool = Some(pool);
        inner.buffer_queue.push_back(desc.clone());

        if !inner.busy {
            let reg_val = inner.engine.read_register(TSM_STATUS);
            if self.is_cmdpool_full(desc.qos, desc.partition_id, 0, reg_val) {
                tracing::warn!("command pool {pool} full, buffering grid {}", desc.grid_id);
            } else {
                inner.buffer_queue.pop_back();
                self.dispatch(&mut inner, &desc, pool, true);
            }
        }
        Ok(pool)
    }

    fn poll(&self, grid_id: u16, timeout_ms: i64) -> Result<PollOutcome> {
        let deadline = (timeout_ms >= 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            {
                let mut inner = self.inner.write().expect("simulator lock");
                if inner.done_set.remove(&grid_id) {
                    if !inner.buffer_queue.is_empty() {
                        self.fill_commit_queue(&mut inner);
                    }
                    return Ok(PollOutcome::Done);
                }
            }

            let drained: Vec<u16> = {
                let pending = self.done.pending.lock().expect("pending lock");
                let wait = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Ok(PollOutcome::Timeout);
                        }
                        (d - now).min(Duration::from_millis(100))
                    }
                    None => Duration::from_millis(100),
                };
                let (mut pending, _timeout) = self
                    .done
                    .cv
                    .wait_timeout(pending, wait)
                    .expect("pending lock");
                pending.drain().collect()
            };

            if !drained.is_empty() {
                self.drain_completions(drained);
            }
        }
    }

    fn ioctl_cmd(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        match cmd {
            IoctlCmd::GetDmaBufInfo { fd } | IoctlCmd::AttachDmaBuf { fd } => {
                let (pa, bytes) = self.mem.dmabuf_info(fd).ok_or_else(|| {
                    UmdError::invalid_op(format!("dma-buf fd {fd} not registered"))
                })?;
                Ok(IoctlReply::DmaBuf(DmaBufInfo { pa, bytes }))
            }
            IoctlCmd::DetachDmaBuf { fd } => {
                self.mem.release_dmabuf(fd)?;
                Ok(IoctlReply::None)
            }
            IoctlCmd::EnableTickCounter | IoctlCmd::DisableTickCounter => Ok(IoctlReply::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_target_is_rejected() {
        let cfg = SimConfig {
            npu_arch_desc: Some("X9_9999".to_string()),
            ..SimConfig::default()
        };
        assert!(matches!(
            SimDevice::new(cfg),
            Err(UmdError::TargetNotFound { .. })
        ));
    }

    #[test]
    fn topology_follows_target() {
        let cfg = SimConfig {
            npu_arch_desc: Some("T3_1408MP4".to_string()),
            ..SimConfig::default()
        };
        let dev = SimDevice::new(cfg).unwrap();
        assert_eq!(dev.core_count(0), 4);
        assert_eq!(dev.partition_count(), 1);
        assert_eq!(dev.cluster_ids(0), vec![0]);
        assert_eq!(dev.config_code().as_deref(), Some("T3_1408MP4"));
        assert!(dev.has_target(ARCH_TERN, ISA_V3_1, 1408, 0));
        assert!(!dev.has_target(ARCH_TERN, 3, 1408, 0));
    }

    #[test]
    fn poll_times_out_without_work() {
        let dev = SimDevice::new(SimConfig::default()).unwrap();
        let r = dev.poll(99, 50).unwrap();
        assert_eq!(r, PollOutcome::Timeout);
    }

    #[test]
    fn dmabuf_ioctls_roundtrip() {
        let dev = SimDevice::new(SimConfig::default()).unwrap();
        let pa = dev.mem().register_dmabuf(5, 0x1000).unwrap();
        match dev.ioctl_cmd(IoctlCmd::GetDmaBufInfo { fd: 5 }).unwrap() {
            IoctlReply::DmaBuf(info) => {
                assert_eq!(info.pa, pa);
                assert_eq!(info.bytes, 0x1000);
            }
            IoctlReply::None => panic!("expected dma-buf info"),
        }
        dev.ioctl_cmd(IoctlCmd::DetachDmaBuf { fd: 5 }).unwrap();
        assert!(dev.ioctl_cmd(IoctlCmd::GetDmaBufInfo { fd: 5 }).is_err());
    }
}
