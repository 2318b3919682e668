//! End-to-end job tests against the simulator back end.

mod common;

use common::{
    init_tracing, linear_chain, segmmu_note, GraphBuilder, SubSpec, SubgraphSpec, SectionSpec,
    TY_INPUT, TY_OUTPUT, TY_OUT_SHAPE, TY_SEGMMU,
};
use std::sync::Arc;
use tern_chip::tcb::{self, Tcb, EN_GROUP_DEPEND, TCB_SIZE};
use tern_driver::prelude::*;
use tern_models::Graph;

fn sim() -> Arc<dyn Device> {
    init_tracing();
    SimDevice::new(SimConfig::default()).unwrap()
}

fn load(dev: &Arc<dyn Device>, builder: &GraphBuilder) -> Arc<LoadedGraph> {
    let graph = Graph::parse(builder.build()).unwrap();
    LoadedGraph::load(dev.mem(), graph).unwrap()
}

fn read_tcb(dev: &Arc<dyn Device>, job: &Job, index: u32) -> Tcb {
    let pa = job.tcb_buffer().unwrap().pa + u64::from(index) * TCB_SIZE as u64;
    let raw = dev.mem().read_vec(pa, TCB_SIZE as u64).unwrap();
    let mut rec = [0u8; TCB_SIZE];
    rec.copy_from_slice(&raw);
    Tcb::decode(&rec).expect("well-formed record")
}

#[test]
fn e1_single_subgraph_runs_to_done() {
    let dev = sim();
    let loaded = load(&dev, &GraphBuilder::new());
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();
    assert_eq!(job.state(), JobState::Init);
    assert_eq!(job.tot_tcb_cnt(), 6);

    let input: Vec<u8> = (0..64u8).collect();
    job.write_input(0, &input).unwrap();

    // pre-recorded golden image in place of NPU computation
    let golden: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(3)).collect();
    dev.mem().write(job.output(0).unwrap().pa, &golden).unwrap();

    job.schedule().unwrap();
    assert_eq!(job.state(), JobState::Sched);
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
    assert_eq!(job.state(), JobState::Done);

    let mut out = vec![0u8; 64];
    job.read_output(0, &mut out).unwrap();
    assert_eq!(out, golden);

    job.destroy().unwrap();
}

#[test]
fn relocation_round_trip_preserves_unmasked_bits() {
    let dev = sim();
    let loaded = load(&dev, &GraphBuilder::new());
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();

    let ro = job.rodata_buffer().unwrap().pa;
    let mask = 0xFFFF_F000u32;

    // static placeholder at 0x10 seeded with 0xEEEEEEEE
    let weight_word = dev.mem().read_u32(ro + 0x10).unwrap();
    assert_eq!(weight_word & !mask, 0xEEEE_EEEE & !mask);
    assert_ne!(weight_word & mask, 0);

    // reuse placeholders resolve to the tensors' addresses
    let input_word = dev.mem().read_u32(ro + 0x20).unwrap();
    assert_eq!(input_word & mask, (job.input(0).unwrap().pa as u32) & mask);
    let output_word = dev.mem().read_u32(ro + 0x30).unwrap();
    assert_eq!(output_word & mask, (job.output(0).unwrap().pa as u32) & mask);

    job.destroy().unwrap();
}

#[test]
fn tcb_chain_shape_matches_layout() {
    let dev = sim();
    let builder = GraphBuilder::new().with_subgraphs(vec![
        SubgraphSpec::default(),
        SubgraphSpec::default(),
        SubgraphSpec::default(),
    ]);
    let loaded = load(&dev, &builder);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();

    let total = job.tot_tcb_cnt();
    assert_eq!(total, 1 + 3 * 5);

    for i in 0..total {
        let rec = read_tcb(&dev, &job, i);
        match (i, rec) {
            (0, Tcb::GridInit(t)) => {
                assert_eq!(t.group_num, 3);
                assert_eq!(t.grid_id, job.grid_id());
            }
            (i, Tcb::GroupInit(t)) if (i - 1) % 5 == 0 => {
                let k = (i - 1) / 5;
                assert_eq!(t.group_id, job.start_group_id() + k as u16);
            }
            (i, Tcb::Task(t)) if (i - 1) % 5 != 0 => {
                let group_end = t.flag & tcb::END_TYPE_GROUP_END != 0;
                let grid_end = t.flag & tcb::END_TYPE_GRID_END != 0;
                let last_of_group = i % 5 == 0;
                assert_eq!(group_end, last_of_group, "tcb {i}");
                assert_eq!(grid_end, i == total - 1, "tcb {i}");
                assert_eq!(t.group_dim, [4, 1, 1]);
                assert_eq!(t.grid_dim, [1, 1, 1]);
            }
            (i, rec) => panic!("unexpected record {rec:?} at index {i}"),
        }
    }

    job.destroy().unwrap();
}

#[test]
fn e2_linear_chain_dependency_encoding() {
    let dev = sim();
    let builder = GraphBuilder::new().with_subgraphs(linear_chain(3));
    let loaded = load(&dev, &builder);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();
    let start = job.start_group_id();

    for (sg, tcb_idx) in [(0u16, 1u32), (1, 6), (2, 11)] {
        let Tcb::GroupInit(t) = read_tcb(&dev, &job, tcb_idx) else {
            panic!("expected group init at {tcb_idx}");
        };
        if sg == 0 {
            assert_eq!(tcb::dep_type(t.flag), tcb::DEP_TYPE_NONE);
            assert_eq!(t.group_deps, [0; 4]);
        } else {
            assert_eq!(tcb::dep_type(t.flag), tcb::DEP_TYPE_GROUP);
            assert_eq!(t.group_deps[0], EN_GROUP_DEPEND | (start + sg - 1));
            assert_eq!(t.group_deps[1], 0);
        }
    }

    // the 12th task record closes the grid
    let Tcb::Task(last) = read_tcb(&dev, &job, 15) else {
        panic!("expected task");
    };
    assert_ne!(last.flag & tcb::END_TYPE_GRID_END, 0);

    job.schedule().unwrap();
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
    job.destroy().unwrap();
}

#[test]
fn invalid_precursors_are_rejected() {
    let dev = sim();

    let mut bad_count = GraphBuilder::new();
    bad_count.subgraphs = vec![
        SubgraphSpec::default(),
        SubgraphSpec {
            precursor_cnt: 5,
            precursors: vec![0, 0, 0, 0],
            ..SubgraphSpec::default()
        },
    ];
    let loaded = load(&dev, &bad_count);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    assert!(matches!(job.init(), Err(UmdError::InvalidBinary { .. })));

    let mut bad_id = GraphBuilder::new();
    bad_id.subgraphs = vec![
        SubgraphSpec::default(),
        SubgraphSpec {
            precursor_cnt: 1,
            precursors: vec![0x9000],
            ..SubgraphSpec::default()
        },
    ];
    let loaded = load(&dev, &bad_id);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    assert!(matches!(job.init(), Err(UmdError::InvalidBinary { .. })));
}

#[test]
fn e3_pre_all_restarts_private_accumulator() {
    let dev = sim();
    let mut builder = GraphBuilder::new();
    builder.subgraphs = (0..4u32)
        .map(|i| SubgraphSpec {
            precursor_cnt: if i == 2 { -1 } else { 0 },
            // each subgraph reports its workspace base into rodata
            private_map: vec![(0x40 + i * 4, 0, 0, 0, 0xFFFF_FFFF)],
            ..SubgraphSpec::default()
        })
        .collect();
    let loaded = load(&dev, &builder);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();

    let ro = job.rodata_buffer().unwrap().pa;
    let w: Vec<u32> = (0..4)
        .map(|i| dev.mem().read_u32(ro + 0x40 + i * 4).unwrap())
        .collect();

    // subgraphs 0 and 1 stack up; the PRE_ALL barrier at subgraph 2
    // restarts the accumulator so 2/3 overlap 0/1
    assert_ne!(w[0], w[1]);
    assert_eq!(w[2], w[0]);
    assert_eq!(w[3], w[1]);

    job.destroy().unwrap();
}

#[test]
fn centralized_and_scatter_agree() {
    let dev = sim();
    let builder = GraphBuilder::new();
    let loaded = load(&dev, &builder);
    let golden: Vec<u8> = (0..64u8).map(|b| b ^ 0x5A).collect();
    let mask = 0xFFFF_F000u32;

    let mut results = Vec::new();
    for cfg in [
        JobConfig::default(),
        JobConfig {
            // an explicit region pin disables centralized allocation
            fm_mem_region: MemRegion::Asid0,
            ..JobConfig::default()
        },
    ] {
        let mut job = loaded.create_job(&dev, cfg).unwrap();
        job.init().unwrap();
        job.write_input(0, &golden).unwrap();
        dev.mem().write(job.output(0).unwrap().pa, &golden).unwrap();

        let ro = job.rodata_buffer().unwrap().pa;
        let input_word = dev.mem().read_u32(ro + 0x20).unwrap();
        assert_eq!(input_word & mask, (job.input(0).unwrap().pa as u32) & mask);

        job.schedule().unwrap();
        assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
        let mut out = vec![0u8; 64];
        job.read_output(0, &mut out).unwrap();
        job.destroy().unwrap();
        results.push(out);
    }

    assert_eq!(results[0], results[1]);
}

#[test]
fn replay_restores_chain_from_backup() {
    let dev = sim();
    let loaded = load(&dev, &GraphBuilder::new());
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();
    let head = job.tcb_buffer().unwrap().pa;

    job.schedule().unwrap();
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
    // the engine stamps the consumed chain
    assert_eq!(dev.mem().read_u32(head + 4).unwrap(), 1);

    job.schedule().unwrap();
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
    // a second run starts from the backup, not the mutated chain
    assert_eq!(dev.mem().read_u32(head + 4).unwrap(), 1);

    let mut out = vec![0u8; 64];
    job.read_output(0, &mut out).unwrap();
    job.destroy().unwrap();
}

fn dynamic_builder() -> GraphBuilder {
    let mut builder = GraphBuilder::new();
    // F32 output and an 8-byte output-shape tensor
    builder.reuses[1].subs = vec![SubSpec::new(TY_OUTPUT, 4096, 0, 0, &[0x30]).with_data_type(8)];
    builder.reuses[1].size = 4096;
    builder.reuses.push(SectionSpec {
        size: 64,
        align_bytes: 4096,
        subs: vec![SubSpec::new(TY_OUT_SHAPE, 8, 0, 0, &[])],
    });
    builder.global_param = Some((8, vec![0; 8]));
    builder
}

#[test]
fn e5_dynamic_shape_discovers_output_size() {
    let dev = sim();
    let loaded = load(&dev, &dynamic_builder());
    let cfg = JobConfig {
        input_shapes: vec![vec![1, 3, 224, 224]],
        ..JobConfig::default()
    };
    let mut job = loaded.create_job(&dev, cfg).unwrap();
    job.init().unwrap();

    // the NPU writes the real output dims; stand in for it
    let shape = job.output_shape(0).unwrap().pa;
    dev.mem().write_u32(shape, 1).unwrap();
    dev.mem().write_u32(shape + 4, 1000).unwrap();

    job.schedule().unwrap();
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
    assert_eq!(job.output(0).unwrap().size, 4000);

    job.destroy().unwrap();
}

#[test]
fn dynamic_shape_zero_dim_fails() {
    let dev = sim();
    let loaded = load(&dev, &dynamic_builder());
    let cfg = JobConfig {
        input_shapes: vec![vec![1, 3, 224, 224]],
        ..JobConfig::default()
    };
    let mut job = loaded.create_job(&dev, cfg).unwrap();
    job.init().unwrap();

    let shape = job.output_shape(0).unwrap().pa;
    dev.mem().write_u32(shape, 0).unwrap();
    dev.mem().write_u32(shape + 4, 7).unwrap();

    job.schedule().unwrap();
    assert!(matches!(
        job.wait(-1),
        Err(UmdError::ZeroTensorSize { tensor: 0 })
    ));
    // state is Done; only the size discovery failed
    job.destroy().unwrap();
}

#[test]
fn dynamic_shape_requires_configured_inputs() {
    let dev = sim();
    let loaded = load(&dev, &dynamic_builder());
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    assert!(matches!(job.init(), Err(UmdError::SetShapeFailed { .. })));
}

#[test]
fn e4_dmabuf_import_repatches_rodata() {
    let dev = sim();
    let loaded = load(&dev, &GraphBuilder::new());
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();

    let dmabuf_pa = dev.mem().register_dmabuf(42, 0x1000).unwrap();
    job.specify_io_buffer(SharedTensorInfo {
        kind: TensorKind::Input,
        index: 0,
        case: ShareCase::DmaBuf { fd: 42, offset: 0 },
    })
    .unwrap();

    assert_eq!(job.input(0).unwrap().pa, dmabuf_pa);
    let ro = job.rodata_buffer().unwrap().pa;
    let mask = 0xFFFF_F000u32;
    let input_word = dev.mem().read_u32(ro + 0x20).unwrap();
    assert_eq!(input_word & mask, (dmabuf_pa as u32) & mask);

    job.schedule().unwrap();
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);
    job.destroy().unwrap();
}

#[test]
fn dmabuf_on_shared_reuse_section_is_rejected() {
    let dev = sim();
    let mut builder = GraphBuilder::new();
    // input 0 and output 0 share reuse section 0
    builder.reuses[0].subs = vec![
        SubSpec::new(TY_INPUT, 32, 0, 0, &[0x20]),
        SubSpec::new(TY_OUTPUT, 32, 0, 32, &[0x30]),
    ];
    builder.reuses[1].subs.clear();
    let loaded = load(&dev, &builder);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();

    dev.mem().register_dmabuf(7, 0x1000).unwrap();
    let r = job.specify_io_buffer(SharedTensorInfo {
        kind: TensorKind::Input,
        index: 0,
        case: ShareCase::DmaBuf { fd: 7, offset: 0 },
    });
    assert!(matches!(r, Err(UmdError::DmabufSharedIo { reuse_index: 0 })));

    job.destroy().unwrap();
}

#[test]
fn e6_concurrent_jobs_complete_independently() {
    let dev = sim();
    let loaded_a = load(&dev, &GraphBuilder::new());
    let loaded_b = load(&dev, &GraphBuilder::new().with_subgraphs(linear_chain(2)));

    let mut handles = Vec::new();
    for (t, loaded) in [(0u8, Arc::clone(&loaded_a)), (1, Arc::clone(&loaded_b))] {
        let dev = Arc::clone(&dev);
        handles.push(std::thread::spawn(move || {
            let mut ranges = Vec::new();
            for round in 0..2u8 {
                let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
                job.init().unwrap();
                ranges.push((
                    job.start_group_id(),
                    loaded.graph().subgraph_cnt() as u16,
                ));

                let marker = vec![t * 16 + round + 1; 64];
                job.write_input(0, &marker).unwrap();
                dev.mem().write(job.output(0).unwrap().pa, &marker).unwrap();

                job.schedule().unwrap();
                assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);

                let mut out = vec![0u8; 64];
                job.read_output(0, &mut out).unwrap();
                assert_eq!(out, marker, "output cross-contamination");
                job.destroy().unwrap();
            }
            ranges
        }));
    }

    let mut live: Vec<(u16, u16)> = Vec::new();
    for h in handles {
        live.extend(h.join().unwrap());
    }
    // ranges from overlapping lifetimes never collided: jobs within a
    // thread are sequential, so only cross-thread pairs could overlap
    // in time; group ranges they held simultaneously must be disjoint
    // or identical-after-free. With four jobs over a 1024-slot bitmap,
    // colliding live ranges would have produced corrupt chains above.
    assert!(live.iter().all(|&(_, len)| len > 0));
}

#[test]
fn segmmu_controls_reach_group_init() {
    let dev = sim();
    let mut builder = GraphBuilder::new();
    builder.segmmu = Some(segmmu_note());
    // SegMMU tag: ctrl 0, seg 1, core mask 0x1
    let tag = (1u32 << 16) | (1 << 8);
    builder.reuses.push(SectionSpec {
        size: 0x4000,
        align_bytes: 4096,
        subs: vec![SubSpec::new(TY_SEGMMU, 0x4000, tag, 0, &[])],
    });
    let loaded = load(&dev, &builder);
    let mut job = loaded.create_job(&dev, JobConfig::default()).unwrap();
    job.init().unwrap();

    let Tcb::GroupInit(group) = read_tcb(&dev, &job, 1) else {
        panic!("expected group init");
    };
    // REMAP_SHARE_EN | MEM_CTRL_EN
    assert_eq!(group.segmmu_ctrl, (1 << 5) | 1);
    // seg 1 ctrl 0 carries the tagged buffer's address bits
    let ctrl = group.segmmu_seg_ctrl[2];
    assert_ne!(ctrl & !0x3FFF, 0);
    assert_eq!(ctrl & 0x3FFF, 0);

    job.destroy().unwrap();
}

#[test]
fn destroyed_jobs_return_their_group_ids() {
    let dev = sim();
    let loaded = load(&dev, &GraphBuilder::new().with_subgraphs(linear_chain(3)));

    let mut first = loaded.create_job(&dev, JobConfig::default()).unwrap();
    first.init().unwrap();
    let start = first.start_group_id();
    first.destroy().unwrap();

    let mut second = loaded.create_job(&dev, JobConfig::default()).unwrap();
    second.init().unwrap();
    assert_eq!(second.start_group_id(), start);
    second.destroy().unwrap();
}

#[test]
fn emulation_dump_writes_runtime_cfg_and_metadata() {
    let dev = sim();
    let dir = tempfile::tempdir().unwrap();
    let loaded = load(&dev, &GraphBuilder::new());
    let cfg = JobConfig {
        dump: DumpConfig {
            enable_emu: true,
            dir: dir.path().to_path_buf(),
            ..DumpConfig::default()
        },
        ..JobConfig::default()
    };
    let mut job = loaded.create_job(&dev, cfg).unwrap();
    job.init().unwrap();
    job.schedule().unwrap();
    assert_eq!(job.wait(-1).unwrap(), WaitStatus::Done);

    let cfg_text = std::fs::read_to_string(dir.path().join("runtime.cfg")).unwrap();
    assert!(cfg_text.contains("[COMMON]"));
    assert!(cfg_text.contains("CONFIG=T3_1408"));
    assert!(cfg_text.contains("[INPUT]"));
    assert!(cfg_text.contains("[HOST]"));
    assert!(cfg_text.contains("TCB_NUM=0x6"));
    assert!(cfg_text.contains("[OUTPUT]"));

    let meta = std::fs::read_to_string(dir.path().join("metadata.txt")).unwrap();
    assert!(meta.contains("Total TCBs Count: 6"));
    assert!(meta.contains("***GRID INIT TCB 0 ***"));
    assert!(meta.contains("***TASK TCB 5 ***"));
    assert!(meta.contains("output0_size"));

    assert!(dir.path().join("temp.text").exists());
    assert!(dir.path().join("temp.tcb").exists());

    // combined dump: first call writes, later calls are no-ops
    let combined = tempfile::tempdir().unwrap();
    tern_driver::dump_combined(&[&job], dev.as_ref(), combined.path()).unwrap();
    let wrote_first = combined.path().join("runtime.cfg").exists();
    let again = tempfile::tempdir().unwrap();
    tern_driver::dump_combined(&[&job], dev.as_ref(), again.path()).unwrap();
    let wrote_again = again.path().join("runtime.cfg").exists();
    assert!(wrote_first);
    assert!(!wrote_again);

    job.destroy().unwrap();
}
