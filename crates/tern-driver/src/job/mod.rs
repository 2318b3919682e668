//! Job construction and lifecycle.
//!
//! A job owns one run's device working set: rodata and descriptor
//! copies, the TCB chain, per-subgraph stacks and private buffers, the
//! shared reuse buffers, and the optional GM / printf / global-param
//! buffers. Lifecycle: `Created → Init → Sched → Done`, with
//! `Init → Bind → Sched` for debugger-deferred dispatch. Everything
//! allocated in `init` goes back to the memory manager on `destroy`
//! (or drop), success or failure.

mod alloc;
mod chain;

use crate::device::{Device, IoctlCmd, IoctlReply, JobDesc, PollOutcome, QosLevel};
use crate::dump::{DumpConfig, DumpRecords};
use crate::dynshape::DynamicShape;
use crate::error::{Result, UmdError};
use crate::gm::GmHelper;
use crate::loading::LoadedGraph;
use crate::memory::{BufferDesc, MemRegion, MemoryManager};
use std::collections::HashSet;
use std::sync::Arc;
use tern_chip::arch::align_up;
use tern_chip::arch::PAGE_SIZE;
use tern_chip::tcb::TCB_SIZE;
use tern_models::{DataType, SegMmuConfig};

/// Tasks per subgraph group in the v3.1 chain layout.
pub const TASK_PER_SUBGRAPH: u32 = 4;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Constructed, no device resources yet.
    Created,
    /// Buffers allocated and chain built.
    Init,
    /// Bound to a partition, dispatch deferred to the debugger.
    Bind,
    /// Submitted; a dispatch may be outstanding.
    Sched,
    /// Completed successfully.
    Done,
    /// Completed with a device exception.
    Exception,
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The job completed.
    Done,
    /// The deadline elapsed; job state unchanged.
    Timeout,
}

/// Per-job configuration.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    /// Target partition.
    pub partition_id: u32,
    /// QoS lane.
    pub qos: QosLevel,
    /// Region override for feature-map buffers; anything but
    /// `MemRegion::Default` disables centralized allocation.
    pub fm_mem_region: MemRegion,
    /// Reuse-section indexes pinned to `fm_mem_region`.
    pub fm_idxes: Vec<u32>,
    /// Dynamic input shapes, one entry per input (empty list = not set).
    pub input_shapes: Vec<Vec<u32>>,
    /// Debug-dispatch to a fixed core.
    pub dbg_dispatch: bool,
    /// Core for debug dispatch.
    pub dbg_core_id: u32,
    /// Dump/emulation settings.
    pub dump: DumpConfig,
}

/// One tensor's placement within the job's buffers.
#[derive(Debug, Clone)]
pub struct JobIoBuffer {
    /// Tensor id.
    pub id: u32,
    /// Tensor byte size (dynamic outputs are re-sized after completion).
    pub size: u64,
    /// Device physical address.
    pub pa: u64,
    /// ASID-relative aligned address.
    pub align_asid_pa: u64,
    /// Carrying reuse-section index.
    pub ref_section_iter: u32,
    /// Element type.
    pub data_type: DataType,
    /// Quantization scale.
    pub scale: f32,
    /// Quantization zero point.
    pub zero_point: i32,
    /// Backing dma-buf fd, when imported.
    pub dmabuf_fd: Option<i32>,
    /// Excluded from dump files.
    pub dump_ignore: bool,
}

/// The job's tensor table.
#[derive(Debug, Clone, Default)]
pub struct JobIo {
    /// Inputs by id.
    pub inputs: Vec<JobIoBuffer>,
    /// Outputs by id.
    pub outputs: Vec<JobIoBuffer>,
    /// Intermediate dumps by id.
    pub inter_dumps: Vec<JobIoBuffer>,
    /// Profiler buffers.
    pub profiler: Vec<JobIoBuffer>,
    /// Printf buffers.
    pub printf: Vec<JobIoBuffer>,
    /// Layer counters.
    pub layer_counter: Vec<JobIoBuffer>,
    /// Error-code buffers.
    pub err_code: Vec<JobIoBuffer>,
    /// SegMMU-tagged buffers.
    pub segmmus: Vec<JobIoBuffer>,
    /// Output-shape tensors by id.
    pub outputs_shape: Vec<JobIoBuffer>,
}

/// Per-task device slots.
#[derive(Debug)]
pub(crate) struct TaskSlots {
    /// This task's TCB address.
    pub tcb_pa: u64,
    /// Task stack.
    pub stack: BufferDesc,
    /// Private-data buffer, when the subgraph declares one.
    pub private_data: Option<BufferDesc>,
}

/// Per-subgraph task set and private buffers.
#[derive(Debug, Default)]
pub(crate) struct SubGraphTask {
    pub id: u32,
    pub bss_idx: u32,
    pub tasks: Vec<TaskSlots>,
    pub priv_bufs: Vec<BufferDesc>,
}

/// Tensor list selector for shared-buffer import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Input tensor.
    Input,
    /// Output tensor.
    Output,
}

/// How an external buffer replaces an internal I/O allocation.
#[derive(Debug, Clone, Copy)]
pub enum ShareCase {
    /// A device buffer already owned by this process.
    InProcess {
        /// Its physical address.
        pa: u64,
    },
    /// A caller-managed device buffer; excluded from dumps.
    Customed {
        /// Its physical address.
        pa: u64,
    },
    /// An imported dma-buf, resolved through the device.
    DmaBuf {
        /// dma-buf fd.
        fd: i32,
        /// Offset of the tensor within the dma-buf.
        offset: u64,
    },
    /// A dma-buf that must first be attached to the device.
    AttachDmaBuf {
        /// dma-buf fd.
        fd: i32,
        /// Offset of the tensor within the dma-buf.
        offset: u64,
    },
}

/// Shared-tensor import request.
#[derive(Debug, Clone, Copy)]
pub struct SharedTensorInfo {
    /// Which list the tensor lives in.
    pub kind: TensorKind,
    /// Tensor index.
    pub index: u32,
    /// Replacement source.
    pub case: ShareCase,
}

/// A runnable instance of a loaded graph.
#[derive(Debug)]
pub struct Job {
    pub(crate) graph: Arc<LoadedGraph>,
    pub(crate) dev: Arc<dyn Device>,
    pub(crate) mem: Arc<MemoryManager>,
    pub(crate) cfg: JobConfig,
    pub(crate) state: JobState,

    pub(crate) grid_id: u16,
    pub(crate) start_group_id: u16,
    pub(crate) group_id_idx: u16,
    pub(crate) groups_held: bool,
    pub(crate) sg_cnt: u32,
    pub(crate) task_per_sg: u32,
    pub(crate) tot_tcb_cnt: u32,
    pub(crate) core_cnt: u32,

    pub(crate) rodata: Option<BufferDesc>,
    pub(crate) descriptor: Option<BufferDesc>,
    pub(crate) tcbs: Option<BufferDesc>,
    pub(crate) pprint: Option<BufferDesc>,
    pub(crate) model_global_param: Option<BufferDesc>,
    pub(crate) top_reuse: Option<BufferDesc>,
    pub(crate) top_priv: Option<BufferDesc>,
    pub(crate) top_reuse_idx: HashSet<u32>,
    pub(crate) optimized_reuse_alloc: bool,
    pub(crate) reuses: Vec<BufferDesc>,
    pub(crate) dma_buf_idx: HashSet<u32>,
    pub(crate) attached_dmabufs: Vec<i32>,
    pub(crate) sg_tasks: Vec<SubGraphTask>,
    pub(crate) io: JobIo,
    pub(crate) segmmu_sec: Vec<SegMmuConfig>,
    pub(crate) gm: GmHelper,
    pub(crate) dynshape: Option<DynamicShape>,

    pub(crate) backup_tcb: Option<Vec<u8>>,
    pub(crate) backup_used: bool,
    pub(crate) bound_pool: Option<u32>,
    pub(crate) is_defer_run: bool,
    pub(crate) do_trigger: bool,
    pub(crate) dump_records: DumpRecords,
}

impl Job {
    pub(crate) fn new(graph: Arc<LoadedGraph>, dev: Arc<dyn Device>, cfg: JobConfig) -> Self {
        let mem = Arc::clone(graph.mem());
        let gm = GmHelper::new(&mem, graph.graph());
        let dynshape = graph
            .graph()
            .is_dynamic_shape()
            .then(|| DynamicShape::new(cfg.input_shapes.clone()));
        Self {
            graph,
            dev,
            mem,
            cfg,
            state: JobState::Created,
            grid_id: 0,
            start_group_id: 0,
            group_id_idx: 0,
            groups_held: false,
            sg_cnt: 0,
            task_per_sg: TASK_PER_SUBGRAPH,
            tot_tcb_cnt: 0,
            core_cnt: 0,
            rodata: None,
            descriptor: None,
            tcbs: None,
            pprint: None,
            model_global_param: None,
            top_reuse: None,
            top_priv: None,
            top_reuse_idx: HashSet::new(),
            optimized_reuse_alloc: false,
            reuses: Vec::new(),
            dma_buf_idx: HashSet::new(),
            attached_dmabufs: Vec::new(),
            sg_tasks: Vec::new(),
            io: JobIo::default(),
            segmmu_sec: Vec::new(),
            gm,
            dynshape,
            backup_tcb: None,
            backup_used: false,
            bound_pool: None,
            is_defer_run: false,
            do_trigger: false,
            dump_records: DumpRecords::default(),
        }
    }

    /// Allocate the working set, relocate rodata and build the TCB
    /// chain. On failure every partial allocation is unwound; the job
    /// stays valid for destruction or another `init`.
    pub fn init(&mut self) -> Result<()> {
        if self.state != JobState::Created {
            return Err(UmdError::invalid_op(format!(
                "init in state {:?}",
                self.state
            )));
        }

        let graph = Arc::clone(&self.graph);
        let g = graph.graph();

        if g.is_dynamic_shape() {
            let inputs = g.io.inputs.len();
            let configured = self
                .dynshape
                .as_ref()
                .is_some_and(|d| d.fully_configured(inputs));
            if !configured {
                return Err(UmdError::SetShapeFailed {
                    reason: format!("graph wants {inputs} input shape(s)"),
                });
            }
        }

        self.core_cnt = self.dev.core_count(self.cfg.partition_id);
        self.sg_cnt = g.subgraph_cnt();
        self.task_per_sg = TASK_PER_SUBGRAPH;
        self.tot_tcb_cnt = 1 + self.sg_cnt * (self.task_per_sg + 1);

        self.grid_id = self.dev.grid_id();
        self.start_group_id = self.dev.start_group_id(self.sg_cnt)?;
        self.groups_held = self.sg_cnt > 0;
        self.group_id_idx = self.start_group_id;

        if let Err(e) = self.alloc_load_job_buffers() {
            self.free_job_buffers();
            return Err(e);
        }

        if self.sg_cnt == 0 {
            self.state = JobState::Init;
            return Ok(());
        }

        if let Err(e) = self.setup_tcb_chain() {
            self.free_job_buffers();
            return Err(e);
        }

        let tcbs = self.tcbs.as_ref().expect("chain built");
        self.backup_tcb = Some(
            self.mem
                .read_vec(tcbs.pa, u64::from(self.tot_tcb_cnt) * TCB_SIZE as u64)?,
        );

        self.state = JobState::Init;
        tracing::debug!(
            "job init: grid {}, groups {}..{}, {} TCB(s)",
            self.grid_id,
            self.start_group_id,
            self.start_group_id + self.sg_cnt as u16,
            self.tot_tcb_cnt
        );
        Ok(())
    }

    fn validate_schedule_status(&self) -> Result<()> {
        match self.state {
            JobState::Init | JobState::Done | JobState::Bind => Ok(()),
            s => Err(UmdError::invalid_op(format!("schedule in state {s:?}"))),
        }
    }

    /// Submit the chain. Either it is enqueued (or buffered by the
    /// simulator) and the job moves to `Sched`/`Bind`, or no side
    /// effect occurs.
    pub fn schedule(&mut self) -> Result<()> {
        self.validate_schedule_status()?;
        if self.sg_cnt == 0 {
            return Ok(());
        }

        if self.io.err_code.len() == 1 {
            self.mem
                .zeroize(self.io.err_code[0].pa, self.io.err_code[0].size)?;
        }

        // re-prime the chain from backup: the NPU mutates device-side
        // TCBs while consuming them
        if self.backup_used {
            if let (Some(tcbs), Some(backup)) = (&self.tcbs, &self.backup_tcb) {
                self.mem.write(tcbs.pa, backup)?;
            }
        }
        self.backup_used = true;

        self.dump_specific_buffers()?;
        self.dump_for_emulation()?;

        if self.graph.text_len() == 0 {
            tracing::warn!("graph text size is 0, skipping dispatch");
        } else {
            let desc = self.job_desc();
            let pool = self.dev.schedule(&desc)?;
            self.bound_pool = Some(pool);
        }

        self.state = if self.is_defer_run && !self.do_trigger {
            JobState::Bind
        } else {
            JobState::Sched
        };
        Ok(())
    }

    pub(crate) fn job_desc(&self) -> JobDesc {
        let tcbs = self.tcbs.as_ref().expect("job initialized");
        JobDesc {
            grid_id: self.grid_id,
            partition_id: self.cfg.partition_id,
            qos: self.cfg.qos,
            tcb_head: tcbs.pa,
            tcb_tail: tcbs.pa + u64::from(self.tot_tcb_cnt - 1) * TCB_SIZE as u64,
            tcb_number: self.tot_tcb_cnt,
            bound_pool: self.bound_pool,
        }
    }

    /// Wait for completion. A timeout leaves the job state unchanged.
    pub fn wait(&mut self, timeout_ms: i64) -> Result<WaitStatus> {
        if self.sg_cnt == 0 {
            self.state = JobState::Done;
            return Ok(WaitStatus::Done);
        }
        if self.state == JobState::Done {
            return Ok(WaitStatus::Done);
        }
        if self.state != JobState::Sched {
            return Err(UmdError::invalid_op(format!("wait in state {:?}", self.state)));
        }
        match self.dev.poll(self.grid_id, timeout_ms)? {
            PollOutcome::Done => {
                self.state = JobState::Done;
                self.parse_dynamic_out_shape()?;
                Ok(WaitStatus::Done)
            }
            PollOutcome::Timeout => Ok(WaitStatus::Timeout),
        }
    }

    /// Bind to a partition without triggering (debugger flow).
    pub fn bind_partition(&mut self, partition_id: u32) -> Result<()> {
        let cnt = self.dev.partition_count();
        if partition_id >= cnt {
            return Err(UmdError::InvalidPartitionId {
                id: partition_id,
                count: cnt,
            });
        }
        self.validate_schedule_status()?;
        self.is_defer_run = true;
        self.do_trigger = false;
        self.cfg.partition_id = partition_id;
        self.schedule()
    }

    /// Trigger a previously bound job and block until it completes.
    pub fn debugger_run(&mut self) -> Result<()> {
        if self.state != JobState::Bind {
            return Err(UmdError::invalid_op("debugger_run without bind"));
        }
        self.is_defer_run = true;
        self.do_trigger = true;
        self.schedule()?;
        match self.wait(-1)? {
            WaitStatus::Done => Ok(()),
            WaitStatus::Timeout => Err(UmdError::JobException {
                grid_id: self.grid_id,
            }),
        }
    }

    /// Release every owned resource. Only defined when no dispatch is
    /// outstanding; drain with `wait(-1)` first.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == JobState::Sched {
            return Err(UmdError::invalid_op(
                "destroy with outstanding dispatch; drain via wait(-1) first",
            ));
        }
        self.free_job_buffers();
        self.state = JobState::Created;
        Ok(())
    }

    // ── tensor access ───────────────────────────────────────────────────

    fn tensor<'a>(list: &'a [JobIoBuffer], index: u32) -> Result<&'a JobIoBuffer> {
        list.get(index as usize).ok_or(UmdError::InvalidTensorId {
            index,
            count: list.len() as u32,
        })
    }

    /// Number of input tensors.
    pub fn input_count(&self) -> u32 {
        self.io.inputs.len() as u32
    }

    /// Number of output tensors.
    pub fn output_count(&self) -> u32 {
        self.io.outputs.len() as u32
    }

    /// Input tensor descriptor.
    pub fn input(&self, index: u32) -> Result<&JobIoBuffer> {
        Self::tensor(&self.io.inputs, index)
    }

    /// Output tensor descriptor (size reflects dynamic discovery).
    pub fn output(&self, index: u32) -> Result<&JobIoBuffer> {
        Self::tensor(&self.io.outputs, index)
    }

    /// Output-shape tensor descriptor (dynamic-shape graphs).
    pub fn output_shape(&self, index: u32) -> Result<&JobIoBuffer> {
        Self::tensor(&self.io.outputs_shape, index)
    }

    /// Intermediate-dump tensor descriptor.
    pub fn inter_dump(&self, index: u32) -> Result<&JobIoBuffer> {
        Self::tensor(&self.io.inter_dumps, index)
    }

    /// Load input tensor bytes into device memory.
    pub fn write_input(&self, index: u32, data: &[u8]) -> Result<()> {
        let buf = Self::tensor(&self.io.inputs, index)?;
        if data.len() as u64 > buf.size {
            return Err(UmdError::invalid_op(format!(
                "input {index}: {} bytes into a {}-byte tensor",
                data.len(),
                buf.size
            )));
        }
        self.mem.write(buf.pa, data)
    }

    /// Read output tensor bytes back from device memory.
    pub fn read_output(&self, index: u32, out: &mut [u8]) -> Result<()> {
        let buf = Self::tensor(&self.io.outputs, index)?;
        if out.len() as u64 > buf.size {
            return Err(UmdError::invalid_op(format!(
                "output {index}: {} bytes from a {}-byte tensor",
                out.len(),
                buf.size
            )));
        }
        self.mem.read(buf.pa, out)
    }

    // ── shared / dma-buf I/O ────────────────────────────────────────────

    /// Replace an internally allocated I/O buffer with an external one.
    ///
    /// # Errors
    ///
    /// `DmabufSharedIo` when the target reuse section also backs the
    /// opposite direction; fall back to the plain copy path then.
    pub fn specify_io_buffer(&mut self, info: SharedTensorInfo) -> Result<()> {
        let (list, other): (&[JobIoBuffer], &[JobIoBuffer]) = match info.kind {
            TensorKind::Input => (&self.io.inputs, &self.io.outputs),
            TensorKind::Output => (&self.io.outputs, &self.io.inputs),
        };
        let reuse_index = Self::tensor(list, info.index)?.ref_section_iter;
        if other.iter().any(|t| t.ref_section_iter == reuse_index) {
            return Err(UmdError::DmabufSharedIo { reuse_index });
        }

        let old = self
            .reuses
            .get(reuse_index as usize)
            .ok_or_else(|| UmdError::invalid_bin(format!("reuse index {reuse_index}")))?
            .clone();
        // drop the internal allocation (a view under centralized
        // allocation; the carve returns with the top buffer)
        if !self.optimized_reuse_alloc {
            self.mem.release(&old)?;
        }
        self.dma_buf_idx.insert(reuse_index);

        let (pa, fd, dump_ignore) = match info.case {
            ShareCase::InProcess { pa } => (pa, None, false),
            ShareCase::Customed { pa } => (pa, None, true),
            ShareCase::DmaBuf { fd, offset } => {
                let IoctlReply::DmaBuf(inf) = self.dev.ioctl_cmd(IoctlCmd::GetDmaBufInfo { fd })?
                else {
                    return Err(UmdError::invalid_op("dma-buf resolution returned nothing"));
                };
                (inf.pa + offset, Some(fd), false)
            }
            ShareCase::AttachDmaBuf { fd, offset } => {
                let IoctlReply::DmaBuf(inf) = self.dev.ioctl_cmd(IoctlCmd::AttachDmaBuf { fd })?
                else {
                    return Err(UmdError::invalid_op("dma-buf attach returned nothing"));
                };
                self.attached_dmabufs.push(fd);
                (inf.pa + offset, Some(fd), false)
            }
        };

        let asid_base = self.mem.asid_base(0);
        self.reuses[reuse_index as usize] = BufferDesc {
            pa,
            size: old.size,
            req_size: old.req_size,
            asid_base,
            align_asid_pa: asid_base + align_up(pa.saturating_sub(asid_base), PAGE_SIZE),
            region: MemRegion::Asid0,
            owned: false,
            name: format!("shared_io_{reuse_index}"),
        };
        tracing::debug!(
            "specify_io_buffer: reuse {reuse_index} now at {pa:#x} ({:?})",
            info.case
        );

        // refresh every tensor carried by the replaced section
        let new_base = self.reuses[reuse_index as usize].pa;
        let align_base = self.reuses[reuse_index as usize].align_asid_pa;
        let graph = Arc::clone(&self.graph);
        let refresh = |job_list: &mut Vec<JobIoBuffer>, src: &[tern_models::IoTensorDesc]| {
            for (buf, desc) in job_list.iter_mut().zip(src) {
                if buf.ref_section_iter == reuse_index {
                    buf.pa = new_base + u64::from(desc.offset_in_section);
                    buf.align_asid_pa = align_base + u64::from(desc.offset_in_section);
                }
            }
        };
        let gio = &graph.graph().io;
        refresh(&mut self.io.inputs, &gio.inputs);
        refresh(&mut self.io.outputs, &gio.outputs);
        refresh(&mut self.io.inter_dumps, &gio.inter_dumps);

        let target = match info.kind {
            TensorKind::Input => &mut self.io.inputs[info.index as usize],
            TensorKind::Output => &mut self.io.outputs[info.index as usize],
        };
        target.dmabuf_fd = fd;
        target.dump_ignore = dump_ignore;

        self.setup_rodata_global()
    }

    // ── dynamic shape ───────────────────────────────────────────────────

    /// Fold discovered output sizes into the output descriptors after
    /// completion (idempotent per job).
    pub(crate) fn parse_dynamic_out_shape(&mut self) -> Result<()> {
        let Some(ds) = self.dynshape.as_mut() else {
            return Ok(());
        };
        if ds.config_shape_cnt() != self.io.inputs.len() || ds.outputs_updated() {
            return Ok(());
        }
        if self.io.outputs_shape.len() != self.io.outputs.len() {
            return Err(UmdError::OutputShapeMismatch {
                got: self.io.outputs_shape.len() as u32,
                expected: self.io.outputs.len() as u32,
            });
        }
        let views: Vec<(u64, u64)> = self
            .io
            .outputs_shape
            .iter()
            .map(|t| (t.pa, t.size))
            .collect();
        let dtypes: Vec<DataType> = self.io.outputs.iter().map(|t| t.data_type).collect();
        let sizes = ds.discover_output_sizes(&self.mem, &views, &dtypes)?.to_vec();
        for (out, size) in self.io.outputs.iter_mut().zip(sizes) {
            out.size = size;
        }
        Ok(())
    }

    // ── teardown ────────────────────────────────────────────────────────

    pub(crate) fn free_job_buffers(&mut self) {
        for fd in std::mem::take(&mut self.attached_dmabufs) {
            if let Err(e) = self.dev.ioctl_cmd(IoctlCmd::DetachDmaBuf { fd }) {
                tracing::warn!("dma-buf {fd} detach failed on teardown: {e}");
            }
        }

        for buf in [
            self.model_global_param.take(),
            self.rodata.take(),
            self.descriptor.take(),
            self.tcbs.take(),
            self.pprint.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = self.mem.release(&buf);
        }

        for sg in std::mem::take(&mut self.sg_tasks) {
            for task in sg.tasks {
                let _ = self.mem.release(&task.stack);
                if let Some(dp) = task.private_data {
                    let _ = self.mem.release(&dp);
                }
            }
            for buf in sg.priv_bufs {
                let _ = self.mem.release(&buf);
            }
        }

        for buf in std::mem::take(&mut self.reuses) {
            let _ = self.mem.release(&buf);
        }
        for buf in [self.top_priv.take(), self.top_reuse.take()]
            .into_iter()
            .flatten()
        {
            let _ = self.mem.release(&buf);
        }
        self.top_reuse_idx.clear();
        self.optimized_reuse_alloc = false;
        self.dma_buf_idx.clear();

        self.io = JobIo::default();
        self.segmmu_sec.clear();
        self.backup_tcb = None;
        self.backup_used = false;

        if self.groups_held {
            self.dev.put_start_group_id(self.start_group_id, self.sg_cnt);
            self.groups_held = false;
        }
    }

    // ── accessors ───────────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Grid id of this job.
    pub fn grid_id(&self) -> u16 {
        self.grid_id
    }

    /// First group id of this job's run.
    pub fn start_group_id(&self) -> u16 {
        self.start_group_id
    }

    /// Total TCB count of the chain.
    pub fn tot_tcb_cnt(&self) -> u32 {
        self.tot_tcb_cnt
    }

    /// The TCB buffer, once initialized.
    pub fn tcb_buffer(&self) -> Option<&BufferDesc> {
        self.tcbs.as_ref()
    }

    /// The rodata buffer, once initialized.
    pub fn rodata_buffer(&self) -> Option<&BufferDesc> {
        self.rodata.as_ref()
    }

    /// Command pool bound at the last schedule.
    pub fn bound_pool(&self) -> Option<u32> {
        self.bound_pool
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // best effort; a job dropped mid-flight leaks its dispatch but
        // not its memory
        self.free_job_buffers();
    }
}
