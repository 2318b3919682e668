//! The instruction simulator, modeled as a black box.
//!
//! The real engine is an instruction-accurate core; to the driver it is
//! only a register file, shared device memory, and a completion
//! callback raised from the engine's own thread. This model honors
//! exactly that contract: a `DISPATCH_CMD_POOL` write latches the
//! programmed chain, a worker walks it out of device memory, stamps the
//! grid-init record (the hardware mutates chains as it consumes them),
//! and fires `EV_GRID_END` with the grid id.

use crate::memory::MemoryManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tern_chip::regs::{
    self, TSM_BUILD_INFO, TSM_CMD_SCHED_ADDR_HI, TSM_CMD_SCHED_ADDR_LO, TSM_CMD_SCHED_CTRL,
    TSM_CMD_TCB_NUMBER, TSM_STATUS,
};
use tern_chip::tcb::{self, Tcb, TCB_SIZE};

/// Completion callback; runs on the engine's worker thread.
pub(crate) type EventHandler = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// Simulated target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCode {
    /// Single-core T3_1408.
    T3_1408,
    /// Dual-core T3_1408MP2.
    T3_1408Mp2,
    /// Quad-core T3_1408MP4.
    T3_1408Mp4,
}

impl SimCode {
    /// Cores per cluster for this target.
    pub fn core_count(self) -> u32 {
        match self {
            Self::T3_1408 => 1,
            Self::T3_1408Mp2 => 2,
            Self::T3_1408Mp4 => 4,
        }
    }

    /// Textual configuration code.
    pub fn config_code(self) -> &'static str {
        match self {
            Self::T3_1408 => "T3_1408",
            Self::T3_1408Mp2 => "T3_1408MP2",
            Self::T3_1408Mp4 => "T3_1408MP4",
        }
    }
}

/// Command pools exposed by the simulated TSM.
const SIM_CMDPOOL_COUNT: u32 = 4;

pub(crate) struct SimEngine {
    mem: Arc<MemoryManager>,
    regs: Mutex<HashMap<u32, u32>>,
    handler: Mutex<Option<EventHandler>>,
}

impl std::fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEngine").finish_non_exhaustive()
    }
}

impl SimEngine {
    pub(crate) fn new(code: SimCode, mem: Arc<MemoryManager>) -> Arc<Self> {
        tracing::info!("simulator engine created for {}", code.config_code());
        Arc::new(Self {
            mem,
            regs: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
        })
    }

    pub(crate) fn set_event_handler(&self, handler: EventHandler) {
        *self.handler.lock().expect("handler lock") = Some(handler);
    }

    pub(crate) fn read_register(&self, offset: u32) -> u32 {
        match offset {
            TSM_BUILD_INFO => (SIM_CMDPOOL_COUNT - 1) << 16,
            // pools never report full; back-pressure is the driver's
            // single-outstanding-dispatch rule
            TSM_STATUS => 0,
            _ => self
                .regs
                .lock()
                .expect("register lock")
                .get(&offset)
                .copied()
                .unwrap_or(0),
        }
    }

    pub(crate) fn write_register(&self, offset: u32, value: u32) {
        let (head, number) = {
            let mut regs = self.regs.lock().expect("register lock");
            regs.insert(offset, value);
            let head = (u64::from(regs.get(&TSM_CMD_SCHED_ADDR_HI).copied().unwrap_or(0)) << 32)
                | u64::from(regs.get(&TSM_CMD_SCHED_ADDR_LO).copied().unwrap_or(0));
            (head, regs.get(&TSM_CMD_TCB_NUMBER).copied().unwrap_or(0))
        };

        if offset == TSM_CMD_SCHED_CTRL && value & regs::sched_ctrl::DISPATCH_CMD_POOL != 0 {
            let mem = Arc::clone(&self.mem);
            let handler = self.handler.lock().expect("handler lock").clone();
            std::thread::spawn(move || execute_chain(&mem, handler, head, number));
        }
    }
}

/// Consume one dispatched chain. Runs on a worker thread.
fn execute_chain(mem: &MemoryManager, handler: Option<EventHandler>, head: u64, tcb_number: u32) {
    let Some(grid_id) = walk_chain(mem, head, tcb_number) else {
        tracing::error!("dispatched chain at {head:#x} is not consumable");
        return;
    };

    // model execution latency so completions interleave like hardware
    std::thread::sleep(Duration::from_millis(2));

    if let Some(h) = handler {
        h(regs::EV_GRID_END, u64::from(grid_id));
    }
}

fn walk_chain(mem: &MemoryManager, head: u64, tcb_number: u32) -> Option<u16> {
    let mut record = [0u8; TCB_SIZE];
    mem.read(head, &mut record).ok()?;
    let Some(Tcb::GridInit(grid)) = Tcb::decode(&record) else {
        return None;
    };

    // the TSM scribbles on chains as it consumes them; the run counter
    // in the first reserved word makes that observable
    if let Ok(runs) = mem.read_u32(head + 4) {
        let _ = mem.write_u32(head + 4, runs.wrapping_add(1));
    }

    let mut groups = 0u32;
    for i in 1..u64::from(tcb_number) {
        if mem.read(head + i * TCB_SIZE as u64, &mut record).is_err() {
            return None;
        }
        match Tcb::decode(&record) {
            Some(Tcb::GroupInit(_)) => groups += 1,
            Some(Tcb::Task(t)) => {
                if i == u64::from(tcb_number) - 1 && t.flag & tcb::END_TYPE_GRID_END == 0 {
                    tracing::warn!("last task of grid {} lacks GRID_END", grid.grid_id);
                }
            }
            _ => {
                tracing::warn!("unexpected record at chain index {i}");
                return None;
            }
        }
    }
    if groups != grid.group_num {
        tracing::warn!(
            "grid {}: chain has {groups} groups, grid-init declares {}",
            grid.grid_id,
            grid.group_num
        );
    }
    Some(grid.grid_id)
}
