//! Offline emulation dump: `runtime.cfg` and `metadata.txt`.
//!
//! The dump reproduces a job's memory image so the standalone emulator
//! can replay it: the common engine configuration, every input file
//! with its base PA, the host dispatch words, and the expected outputs.
//! `metadata.txt` carries a human-readable decode of the TCB chain and
//! the I/O tensor map.

use crate::device::Device;
use crate::error::{Result, UmdError};
use crate::job::Job;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tern_chip::arch::{hi, lo};
use tern_chip::tcb::{Tcb, TCB_SIZE};

/// Per-job dump settings.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Emit `runtime.cfg` / `metadata.txt` on schedule.
    pub enable_emu: bool,
    /// Output directory.
    pub dir: PathBuf,
    /// Input file prefix.
    pub prefix: String,
    /// Output file prefix; anything not starting with `temp` switches
    /// to caller-controlled naming.
    pub output_prefix: String,
    /// Also dump the raw TCB chain.
    pub dump_tcb: bool,
    /// Zero reuse buffers at allocation so dumps are reproducible.
    pub dump_reuse: bool,
    /// Arm the tick counter and reserve the profile data file.
    pub dump_profile: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            enable_emu: false,
            dir: PathBuf::from("."),
            prefix: "temp".to_string(),
            output_prefix: "temp".to_string(),
            dump_tcb: false,
            dump_reuse: false,
            dump_profile: false,
        }
    }
}

/// Host dispatch words recorded for the combined dump.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostRecord {
    pub partition: u32,
    pub tcbp_hi: u32,
    pub tcbp_lo: u32,
    pub pool: u32,
}

/// What one job contributed to its dump, for later aggregation.
#[derive(Debug, Default, Clone)]
pub struct DumpRecords {
    pub(crate) header: String,
    pub(crate) inputs: Vec<(String, u64)>,
    pub(crate) host: Option<HostRecord>,
    pub(crate) outputs: Vec<(String, u64, u64)>,
    pub(crate) meta: String,
}

/// The combined multi-job dump may run at most once per process.
static COMBINED_DUMP_DONE: AtomicBool = AtomicBool::new(false);

fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text).map_err(|source| UmdError::OpenFileFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn gm_size_label(size: u64) -> Option<&'static str> {
    match size {
        0x8_0000 => Some("512K"),
        0x10_0000 => Some("1M"),
        0x20_0000 => Some("2M"),
        0x40_0000 => Some("4M"),
        0x80_0000 => Some("8M"),
        0x100_0000 => Some("16M"),
        0x200_0000 => Some("32M"),
        0x400_0000 => Some("64M"),
        _ => None,
    }
}

impl Job {
    /// Raw-buffer dumps and profiling arm-up, before dispatch.
    pub(crate) fn dump_specific_buffers(&mut self) -> Result<()> {
        if self.cfg.dump.dump_tcb {
            if let Some(tcbs) = self.tcbs.as_ref() {
                let path = self.cfg.dump.dir.join(format!("{}.tcb_dump", self.cfg.dump.prefix));
                self.mem
                    .dump_file(tcbs.pa, &path, u64::from(self.tot_tcb_cnt) * TCB_SIZE as u64)?;
            }
        }

        if self.cfg.dump.dump_profile && !self.io.profiler.is_empty() {
            let path = self
                .cfg
                .dump
                .dir
                .join(format!("{}_PerfData.bin", self.cfg.dump.prefix));
            write_text(&path, "")?;
            let _ = self
                .dev
                .ioctl_cmd(crate::device::IoctlCmd::EnableTickCounter)?;
        }
        Ok(())
    }

    /// Emit `runtime.cfg` and `metadata.txt` for this job.
    pub(crate) fn dump_for_emulation(&mut self) -> Result<()> {
        if !self.cfg.dump.enable_emu {
            return Ok(());
        }
        let dir = self.cfg.dump.dir.clone();
        let prefix = self.cfg.dump.prefix.clone();
        let mut cfg = String::new();
        let mut records = DumpRecords::default();

        // [COMMON]
        cfg.push_str("[COMMON]\n");
        cfg.push_str("#configuration 3:T3_1408, 4:T3_1408MP2, 5:T3_1408MP4\n");
        if let Some(code) = self.dev.config_code() {
            let _ = writeln!(cfg, "CONFIG={code}");
        }
        if let Some(sim) = self.dev.sim_config() {
            cfg.push_str("#if ENABLE_AVX is true then using the intel SIMD instructions to speedup.\n");
            let _ = writeln!(cfg, "ENABLE_AVX={}", sim.enable_avx);
            cfg.push_str("#Where log output to store is.\n");
            let _ = writeln!(cfg, "LOG_FILEPATH={}", sim.log_file_path.display());
            cfg.push_str("#which level is your selected: 0:ERROR, 1: WARN, 2: INFO, 3: DEBUG\n");
            let _ = writeln!(cfg, "LOG_LEVEL={}", sim.log_level);
            cfg.push_str("#if LOG_VERBOSE is true then print log to console. otherwise no\n");
            let _ = writeln!(cfg, "LOG_VERBOSE={}", sim.verbose);
            cfg.push_str("#if ENABLE_CALLOC is true the allocation memory is set to zero.\n");
            let _ = writeln!(cfg, "ENABLE_CALLOC={}", sim.enable_calloc);
            cfg.push_str("#if EN_L2D is true the l2d cache is enabled.\n");
            let _ = writeln!(cfg, "EN_L2D={}", sim.en_l2d);
            cfg.push_str("#GM support: 512KiB,1MiB,2MiB,4MiB,8MiB,16MiB,32MiB,64MiB.\n");
            if let Some(label) = gm_size_label(sim.gm_size) {
                let _ = writeln!(cfg, "GM_SIZE={label}");
            }
            if let Some(plugin) = &sim.plugin_name {
                cfg.push_str("#PLUGIN_FILENAME\n");
                let _ = writeln!(cfg, "PLUGIN_FILENAME={plugin}");
            }
            if sim.en_fast_perf {
                cfg.push_str("\n[PROFILE]\n");
                cfg.push_str("EN_FAST_PERF=1\n");
                let _ = writeln!(cfg, "FREQ_MHZ={}", sim.freq_mhz);
                let _ = writeln!(cfg, "DDR_LATENCY_RD={}", sim.ddr_latency_rd);
                let _ = writeln!(cfg, "DDR_LATENCY_WR={}", sim.ddr_latency_wr);
                let _ = writeln!(cfg, "DDR_BW_BITS={}", sim.ddr_bw);
                let _ = writeln!(cfg, "DDR_BW_RATIO={}", sim.ddr_bw_ratio);
                if let Some(report) = &sim.perf_report {
                    let _ = writeln!(cfg, "PERF_REPORT={report}");
                }
                if self.io.profiler.len() == 1 {
                    let _ = writeln!(cfg, "PROFILE_BUF_ADDR={:#x}", self.io.profiler[0].pa);
                    let _ = writeln!(cfg, "PROFILE_BUF_SIZE={:#x}", self.io.profiler[0].size);
                }
                if let Some(json) = &sim.json_filename {
                    cfg.push_str("#JSON_FILENAME\n");
                    let _ = writeln!(cfg, "JSON_FILENAME={json}");
                }
            }
        }
        cfg.push('\n');
        records.header = cfg.clone();

        // [INPUT]
        let graph = std::sync::Arc::clone(&self.graph);
        let g = graph.graph();
        let mut input_files: Vec<(String, u64)> = Vec::new();

        let text_path = dir.join(format!("{prefix}.text"));
        self.mem
            .dump_file(graph.text().pa, &text_path, graph.text_len().max(1))?;
        input_files.push((format!("{prefix}.text"), graph.text().pa));

        for bss_idx in 0..g.bss_cnt() {
            let info = graph.weight_info(bss_idx);
            if let Some(weight) = &info.wb_weight {
                let path = dir.join(format!("{prefix}.weight{bss_idx}"));
                self.mem.dump_file(weight.pa, &path, weight.req_size)?;
                input_files.push((format!("{prefix}.weight{bss_idx}"), weight.pa));
            }
            if let Some(zc) = &info.wb_zerocpy_const {
                let path = dir.join(format!("{prefix}.zerocpy_const{bss_idx}"));
                self.mem.dump_file(zc.pa, &path, zc.req_size)?;
                input_files.push((format!("{prefix}.zerocpy_const{bss_idx}"), zc.pa));
            }
        }

        if let Some(ro) = self.rodata.as_ref() {
            let path = dir.join(format!("{prefix}.ro"));
            self.mem.dump_file(ro.pa, &path, ro.req_size)?;
            input_files.push((format!("{prefix}.ro"), ro.pa));
        }
        if let Some(dcr) = self.descriptor.as_ref() {
            let path = dir.join(format!("{prefix}.dcr"));
            self.mem.dump_file(dcr.pa, &path, dcr.req_size)?;
            input_files.push((format!("{prefix}.dcr"), dcr.pa));
        }

        let tcbs = self.tcbs.as_ref().expect("initialized job");
        let tcb_bytes = u64::from(self.tot_tcb_cnt) * TCB_SIZE as u64;
        let tcb_path = dir.join(format!("{prefix}.tcb"));
        self.mem.dump_file(tcbs.pa, &tcb_path, tcb_bytes)?;
        input_files.push((format!("{prefix}.tcb"), tcbs.pa));

        for (i, input) in self.io.inputs.iter().enumerate() {
            if input.dump_ignore {
                continue;
            }
            let name = format!("{prefix}.input{i}");
            self.mem.dump_file(input.pa, &dir.join(&name), input.size)?;
            input_files.push((name, input.pa));
        }

        cfg.push_str("[INPUT]\n");
        let _ = writeln!(cfg, "COUNT={}", input_files.len());
        for (i, (file, base)) in input_files.iter().enumerate() {
            let _ = writeln!(cfg, "FILE{i}={file}");
            let _ = writeln!(cfg, "BASE{i}={base:#x}");
        }
        cfg.push('\n');
        records.inputs = input_files;

        // [HOST]
        cfg.push_str("[HOST]\n");
        let _ = writeln!(cfg, "TCBP_HI={:#x}", hi(tcbs.pa));
        let _ = writeln!(cfg, "TCBP_LO={:#x}", lo(tcbs.pa));
        let _ = writeln!(cfg, "TCB_NUM={:#x}", self.tot_tcb_cnt);
        cfg.push('\n');
        records.host = Some(HostRecord {
            partition: self.cfg.partition_id,
            tcbp_hi: hi(tcbs.pa),
            tcbp_lo: lo(tcbs.pa),
            pool: self.bound_pool.unwrap_or(0),
        });

        // [OUTPUT]
        cfg.push_str("[OUTPUT]\n");
        let visible = self.io.outputs.iter().filter(|o| !o.dump_ignore).count();
        let _ = writeln!(cfg, "COUNT={visible}");
        let default_output_prefix = self.cfg.dump.output_prefix.starts_with("temp");
        for (i, output) in self.io.outputs.iter().enumerate() {
            if output.dump_ignore {
                continue;
            }
            if default_output_prefix {
                let name = format!("{}.output{i}", self.cfg.dump.output_prefix);
                let _ = writeln!(cfg, "FILE{i}={name}");
                records
                    .outputs
                    .push((name, output.pa, output.size));
            } else if i == 0 {
                let _ = writeln!(cfg, "FILE{i}={}", self.cfg.dump.output_prefix);
            } else {
                let _ = writeln!(cfg, "FILE{i}={}{i}", self.cfg.dump.output_prefix);
            }
            let _ = writeln!(cfg, "BASE{i}={:#x}", output.pa);
            let _ = writeln!(cfg, "SIZE{i}={:#x}", output.size);
        }

        write_text(&dir.join("runtime.cfg"), &cfg)?;

        // metadata.txt: TCB decode + tensor map
        let meta = self.render_metadata(tcbs.pa)?;
        write_text(&dir.join("metadata.txt"), &meta)?;
        records.meta = meta;

        self.dump_records = records;
        Ok(())
    }

    fn render_metadata(&self, chain_pa: u64) -> Result<String> {
        let mut meta = String::new();
        let _ = writeln!(meta, "Total TCBs Count: {}", self.tot_tcb_cnt);

        for i in 0..u64::from(self.tot_tcb_cnt) {
            let raw = self.mem.read_vec(chain_pa + i * TCB_SIZE as u64, TCB_SIZE as u64)?;
            let mut rec = [0u8; TCB_SIZE];
            rec.copy_from_slice(&raw);
            match Tcb::decode(&rec) {
                Some(Tcb::GridInit(t)) => {
                    let _ = writeln!(meta, "\n***GRID INIT TCB {i} ***");
                    let _ = writeln!(meta, "flag: {:#x}", t.flag);
                    let _ = writeln!(meta, "group_num: {}", t.group_num);
                    let _ = writeln!(meta, "grid_interrupt_en: {:#x}", t.interrupt_en);
                    let _ = writeln!(meta, "grid_groupid: {}", t.group_id);
                    let _ = writeln!(meta, "grid_gridid: {}", t.grid_id);
                    let _ = writeln!(meta, "gm_ctrl: {:#x}", t.gm_ctrl);
                    let _ = writeln!(meta, "gm_sync: {:#x}", t.gm_sync);
                    let _ = writeln!(meta, "gm_addr_low: {:#x}", t.gm_addr_low);
                    let _ = writeln!(meta, "gm_addr_high: {:#x}", t.gm_addr_high);
                }
                Some(Tcb::GroupInit(t)) => {
                    let _ = writeln!(meta, "\n***GROUP INIT TCB {i} ***");
                    let _ = writeln!(meta, "flag: {:#x}", t.flag);
                    let _ = writeln!(meta, "segmmu_ctrl: {:#x}", t.segmmu_ctrl);
                    let _ = writeln!(meta, "segmmu_remap_ctrl0: {:#x}", t.segmmu_remap_ctrl0);
                    let _ = writeln!(meta, "segmmu_remap_ctrl1: {:#x}", t.segmmu_remap_ctrl1);
                    let _ = writeln!(meta, "group_interrupt_en: {:#x}", t.interrupt_en);
                    let _ = writeln!(meta, "group_groupid: {}", t.group_id);
                    let _ = writeln!(meta, "group_gridid: {}", t.grid_id);
                    for seg in 0..4 {
                        let _ = writeln!(
                            meta,
                            "segmmu_seg{seg}_ctrl0: {:#x}",
                            t.segmmu_seg_ctrl[2 * seg]
                        );
                        let _ = writeln!(
                            meta,
                            "segmmu_seg{seg}_ctrl1: {:#x}",
                            t.segmmu_seg_ctrl[2 * seg + 1]
                        );
                    }
                    for slot in 0..4 {
                        let _ = writeln!(meta, "ASID{slot}_LO: {:#x}", t.asids[2 * slot]);
                        let _ = writeln!(meta, "ASID{slot}_HI: {:#x}", t.asids[2 * slot + 1]);
                    }
                    for (slot, dep) in t.group_deps.iter().enumerate() {
                        let _ = writeln!(meta, "group_deps[{slot}]: {dep}");
                    }
                }
                Some(Tcb::Task(t)) => {
                    let _ = writeln!(meta, "\n***TASK TCB {i} ***");
                    let _ = writeln!(meta, "flag: {:#x}", t.flag);
                    let _ = writeln!(meta, "start_pc: {:#x}", t.spc);
                    let _ = writeln!(meta, "interrupt_en: {:#x}", t.interrupt_en);
                    let _ = writeln!(meta, "group_id: {}", t.group_id);
                    let _ = writeln!(meta, "grid_id: {}", t.grid_id);
                    let _ = writeln!(meta, "task_id: {}", t.task_id);
                    let _ = writeln!(meta, "warm_len: {}", t.warmup_len);
                    let _ = writeln!(meta, "grid_dim: {:?}", t.grid_dim);
                    let _ = writeln!(meta, "group_dim: {:?}", t.group_dim);
                    let _ = writeln!(meta, "group_id_xyz: {:?}", t.group_coord);
                    let _ = writeln!(meta, "task_id_xyz: {:?}", t.task_coord);
                    let _ = writeln!(meta, "sp: {:#x}", t.sp);
                    let _ = writeln!(meta, "pp: {:#x}", t.pp);
                    let _ = writeln!(meta, "dp: {:#x}", t.dp);
                    let _ = writeln!(meta, "cp: {:#x}", t.cp);
                    let _ = writeln!(meta, "pprint: {:#x}", t.pprint);
                    let _ = writeln!(meta, "pprofiler: {:#x}", t.pprofiler);
                    let _ = writeln!(meta, "dsize: {:#x}", t.dsize);
                    let _ = writeln!(meta, "tcbp: {:#x}", t.tcbp);
                    for (slot, dep) in t.group_deps.iter().enumerate() {
                        let _ = writeln!(meta, "group_deps[{slot}]: {dep}");
                    }
                }
                None => {
                    tracing::error!("invalid TCB type at chain index {i}");
                }
            }
        }

        let _ = writeln!(meta, "\n***IO Tensors***");
        for (i, input) in self.io.inputs.iter().enumerate() {
            let _ = writeln!(meta, "input{i}_addr: {:#x}", input.pa);
            let _ = writeln!(meta, "input{i}_size: {:#x}", input.size);
        }
        for (i, output) in self.io.outputs.iter().enumerate() {
            let _ = writeln!(meta, "output{i}_addr: {:#x}", output.pa);
            let _ = writeln!(meta, "output{i}_size: {:#x}", output.size);
        }
        Ok(meta)
    }
}

/// Write one combined `runtime.cfg` / `metadata.txt` covering several
/// jobs' dump records. Runs at most once per process; later calls are
/// no-ops.
pub fn dump_combined(jobs: &[&Job], dev: &dyn Device, dir: &Path) -> Result<()> {
    if COMBINED_DUMP_DONE.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let mut cfg = String::new();
    if let Some(first) = jobs.first() {
        cfg.push_str(&first.dump_records.header);
    }

    // [INPUT]
    let mut count = 0usize;
    let mut body = String::new();
    for job in jobs {
        for (file, base) in &job.dump_records.inputs {
            let _ = writeln!(body, "FILE{count}={file}");
            let _ = writeln!(body, "BASE{count}={base:#x}");
            count += 1;
        }
    }
    cfg.push_str("[INPUT]\n");
    let _ = writeln!(cfg, "COUNT={count}");
    cfg.push_str(&body);
    cfg.push('\n');

    // [HOST]: one entry per bound command pool
    let mut body = String::new();
    let mut count = 0usize;
    let mut pools_seen = std::collections::HashSet::new();
    for job in jobs {
        if let Some(host) = &job.dump_records.host {
            if pools_seen.insert(host.pool) {
                let _ = writeln!(body, "SET_PARTITION{count}={}", host.partition);
                let _ = writeln!(body, "TCBP_HI{count}={:#x}", host.tcbp_hi);
                let _ = writeln!(body, "TCBP_LO{count}={:#x}", host.tcbp_lo);
                count += 1;
            }
        }
    }
    cfg.push_str("[HOST]\n");
    let _ = writeln!(cfg, "COUNT={count}");
    cfg.push_str(&body);
    cfg.push('\n');

    // [ALLOCATE_PARTITION]
    cfg.push_str("[ALLOCATE_PARTITION]\n");
    let mut clusters: Vec<(u32, u32)> = Vec::new();
    for part in 0..dev.partition_count() {
        for cluster in dev.cluster_ids(part) {
            clusters.push((cluster, part));
        }
    }
    let _ = writeln!(cfg, "COUNT={}", clusters.len());
    for (cluster, part) in clusters {
        let _ = writeln!(cfg, "CLUSTER{cluster}={part}");
    }
    cfg.push('\n');

    // [OUTPUT]
    let mut body = String::new();
    let mut count = 0usize;
    for job in jobs {
        for (file, base, size) in &job.dump_records.outputs {
            let _ = writeln!(body, "FILE{count}={file}");
            let _ = writeln!(body, "BASE{count}={base:#x}");
            let _ = writeln!(body, "SIZE{count}={size:#x}");
            count += 1;
        }
    }
    cfg.push_str("[OUTPUT]\n");
    let _ = writeln!(cfg, "COUNT={count}");
    cfg.push_str(&body);
    cfg.push('\n');

    write_text(&dir.join("runtime.cfg"), &cfg)?;

    let mut meta = String::new();
    for job in jobs {
        meta.push_str(&job.dump_records.meta);
        meta.push('\n');
    }
    write_text(&dir.join("metadata.txt"), &meta)
}
