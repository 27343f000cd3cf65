//! Lookup table allocation.
//!
//! Activation lookup tables live in a small region at the top of SHRAM, 8
//! slots of 256 bytes. [`LutState`] tracks which tables are resident while
//! walking a subgraph's high-level command stream; DMA commands whose table
//! is already on chip are dropped, everything else gets an address that
//! evicts as few resident tables as possible.

use crate::arch::ArchitectureFeatures;
use crate::consts::{TensorPurpose, LUT_SLOT_COUNT, LUT_SLOT_SIZE};
use crate::graph::{Attr, AttrValue, Graph, Tensor, TensorId};
use crate::pack::{PassId, Schedule};

/// One command of a subgraph's high-level command stream. The stream is
/// produced by the scheduler; the LUT allocator is its only rewriter in
/// this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighLevelCommand {
    /// One stripe of an NPU pass.
    NpuStripe {
        /// The pass the stripe belongs to.
        pass: PassId,
    },
    /// A DMA transfer feeding a pass.
    Dma {
        /// The pass the transfer belongs to.
        pass: PassId,
        /// Source tensor.
        in_tensor: TensorId,
        /// Destination tensor.
        out_tensor: TensorId,
    },
}

fn overlaps(start1: u32, end1: u32, start2: u32, end2: u32) -> bool {
    start1 < end2 && start2 < end1
}

/// The set of lookup tables resident in SHRAM at one point of the command
/// stream.
#[derive(Debug, Clone, Default)]
pub struct LutState {
    tensors: Vec<TensorId>,
}

impl LutState {
    /// An empty state: no tables resident.
    pub fn new() -> Self {
        LutState::default()
    }

    /// Returns a resident table holding the same data as `lut`, if any.
    pub fn get_equivalent(&self, graph: &Graph, lut: TensorId) -> Option<TensorId> {
        self.tensors
            .iter()
            .copied()
            .find(|&t| graph.tensor(t).equivalent(graph.tensor(lut)))
    }

    /// Returns a new state containing `lut` plus every resident table that
    /// does not overlap it; overlapping tables are evicted.
    pub fn put(&self, graph: &Graph, lut: TensorId) -> LutState {
        let start = graph.tensor(lut).address;
        let end = start + graph.tensor(lut).storage_size();
        let mut tensors = vec![lut];
        for &tens in &self.tensors {
            let start2 = graph.tensor(tens).address;
            let end2 = start2 + graph.tensor(tens).storage_size();
            if !overlaps(start, end, start2, end2) {
                tensors.push(tens);
            }
        }
        LutState { tensors }
    }

    /// Finds the address in `[start, stop)`, stepping by `step`, that
    /// overlaps the fewest resident tables. Ties go to the lowest address.
    pub fn find_best_address(&self, graph: &Graph, start: u32, stop: u32, step: u32) -> u32 {
        let mut best_address = start;
        let mut best_overlaps = usize::MAX;
        let mut address = start;
        while address < stop {
            let mut count = 0;
            for &tens in &self.tensors {
                let start2 = graph.tensor(tens).address;
                let end2 = start2 + graph.tensor(tens).storage_size();
                if overlaps(address, address + step, start2, end2) {
                    count += 1;
                }
            }
            if count < best_overlaps {
                best_overlaps = count;
                best_address = address;
            }
            address += step;
        }
        best_address
    }
}

/// The SHRAM slot a resident lookup table occupies.
///
/// # Panics
///
/// Panics if the table's address places it outside the 8 LUT slots.
pub fn lut_slot(arch: &ArchitectureFeatures, lut: &Tensor) -> u32 {
    let slot = (lut.address - arch.shram_lut_address) / lut.storage_size();
    assert!(
        slot < LUT_SLOT_COUNT,
        "lookup table '{}' is outside the SHRAM LUT region",
        lut.name
    );
    slot
}

/// Allocates SHRAM addresses and slot indices to the lookup tables of a
/// subgraph and drops DMA commands whose table is already resident.
///
/// Stripe commands that do not consume a table clear the resident set when
/// the accelerator reserves no unused banks, since such a stripe may have
/// clobbered the banks holding the tables.
pub fn optimize_high_level_cmd_stream(
    graph: &mut Graph,
    schedule: &mut Schedule,
    arch: &ArchitectureFeatures,
) {
    let lut_start = arch.shram_lut_address;
    let lut_end = lut_start + arch.shram_lut_size;
    let mut lut_state = LutState::new();
    let mut cmd_stream = Vec::new();

    for cmd in std::mem::take(&mut schedule.high_level_command_stream) {
        match cmd {
            HighLevelCommand::NpuStripe { pass } => {
                if schedule.pass(pass).lut_tensor.is_none()
                    && arch.shram_reserved_unused_banks == 0
                {
                    // The stripe may have overwritten the banks holding
                    // the tables; the next table needs a fresh DMA.
                    lut_state = LutState::new();
                }
                cmd_stream.push(cmd);
            }
            HighLevelCommand::Dma { pass, out_tensor, .. }
                if graph.tensor(out_tensor).purpose == TensorPurpose::Lut =>
            {
                if let Some(existing) = lut_state.get_equivalent(graph, out_tensor) {
                    // Already in SHRAM; drop the DMA and share the address.
                    let address = graph.tensor(existing).address;
                    graph.tensor_mut(out_tensor).address = address;
                    let slot = lut_slot(arch, graph.tensor(existing));
                    assign_lut_slot(graph, schedule, pass, slot);
                    continue;
                }
                // Alignment is always the size of the table itself: 256 for
                // a 256-byte table, 1K for a 1K table, and so on.
                let size = graph.tensor(out_tensor).storage_size();
                let address = lut_state.find_best_address(graph, lut_start, lut_end, size);
                graph.tensor_mut(out_tensor).address = address;
                let slot = (address - lut_start) / LUT_SLOT_SIZE;
                assign_lut_slot(graph, schedule, pass, slot);
                lut_state = lut_state.put(graph, out_tensor);
                cmd_stream.push(cmd);
            }
            other => cmd_stream.push(other),
        }
    }

    schedule.high_level_command_stream = cmd_stream;
}

fn assign_lut_slot(graph: &mut Graph, schedule: &Schedule, pass: PassId, slot: u32) {
    assert!(slot < LUT_SLOT_COUNT, "lookup table slot {slot} out of range");
    let primary = schedule
        .pass(pass)
        .primary_op
        .expect("pass consuming a lookup table has no primary operator");
    let op = graph.op_mut(primary);
    op.attrs.set(Attr::LutIndex, AttrValue::Int(i64::from(slot)));
    if let Some(activation) = op.activation.as_mut() {
        activation.lut_index = slot as u8;
    }
}
