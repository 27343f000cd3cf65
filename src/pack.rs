//! Packs a subgraph into passes. Each pass groups one or more operators
//! under a single placement and, for NPU passes, a single primary operator
//! that governs the hardware programming.
//!
//! The packer walks the graph in reverse from the subgraph outputs. Each
//! operator is classified by the first row of an ordered table whose
//! operator set contains it and whose incompatibility mask does not
//! intersect the flags gathered for the growing pass; table order matters.

use std::collections::{HashMap, HashSet, VecDeque};

use flagset::FlagSet;

use crate::consts::{NpuBlockType, OpKind, PassFlags, TensorPurpose};
use crate::graph::{Attr, AttrValue, Graph, OpId, Operation, TensorId};
use crate::lut::HighLevelCommand;

/// Where a pass executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassPlacement {
    /// On the NPU.
    Npu,
    /// On the host CPU.
    Cpu,
    /// Nowhere; the pass only rearranges memory.
    MemoryOnly,
    /// At startup, initialising weights and constants.
    StartupInit,
}

/// Index of a pass in its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub usize);

/// A scheduling unit of one or more fused operators.
#[derive(Debug, Clone)]
pub struct Pass {
    /// Name, taken from the first non-DMA operator.
    pub name: String,
    /// Where the pass executes.
    pub placement: PassPlacement,
    /// True when every operator runs on the elementwise engine.
    pub is_element_wise: bool,
    /// Major block type; at most one operator contributes it.
    pub npu_block_type: NpuBlockType,
    /// Operators in execution order.
    pub ops: Vec<OpId>,
    /// The operator whose kernel, weights and block type govern the pass.
    pub primary_op: Option<OpId>,
    /// Ordered input tensors of the pass.
    pub inputs: Vec<TensorId>,
    /// Tensors produced and consumed within the pass.
    pub intermediates: Vec<TensorId>,
    /// Output tensors of the pass.
    pub outputs: Vec<TensorId>,
    /// Input feature map.
    pub ifm_tensor: Option<TensorId>,
    /// Second input feature map of binary elementwise passes.
    pub ifm2_tensor: Option<TensorId>,
    /// Output feature map.
    pub ofm_tensor: Option<TensorId>,
    /// Weight tensor of the primary operator.
    pub weight_tensor: Option<TensorId>,
    /// Bias tensor of the primary operator.
    pub scale_tensor: Option<TensorId>,
    /// Lookup table consumed by the pass, if any.
    pub lut_tensor: Option<TensorId>,
}

/// The result of packing: the passes in execution order, the operator to
/// pass mapping, and the subgraph's high-level command stream (filled in by
/// the scheduler, rewritten by the LUT allocator).
#[derive(Debug, Default)]
pub struct Schedule {
    /// Passes in execution order.
    pub passes: Vec<Pass>,
    scheduled_pass: HashMap<OpId, PassId>,
    /// High-level command stream of the subgraph.
    pub high_level_command_stream: Vec<HighLevelCommand>,
}

impl Schedule {
    /// The pass with the given id.
    pub fn pass(&self, id: PassId) -> &Pass {
        &self.passes[id.0]
    }

    /// Mutable access to the pass with the given id.
    pub fn pass_mut(&mut self, id: PassId) -> &mut Pass {
        &mut self.passes[id.0]
    }

    /// The pass an operator was packed into.
    pub fn pass_of(&self, op: OpId) -> Option<PassId> {
        self.scheduled_pass.get(&op).copied()
    }
}

/// Post-operations the packer fuses behind a main operation.
fn is_pack_post(kind: OpKind) -> bool {
    kind.is_relu() || kind == OpKind::Quantize
}

/// Post-operations that must not share a pass with a main operation.
fn is_pack_post_fuse_limited(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::ConcatSliceWrite | OpKind::Sigmoid | OpKind::Tanh
    )
}

/// Operators that always execute on the CPU.
fn is_pack_cpu(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Softmax
            | OpKind::Lrn
            | OpKind::Shape
            | OpKind::Pad
            | OpKind::AddN
            | OpKind::Dequantize
    )
}

/// Operators the packer treats as memory-only. This is deliberately
/// narrower than the memory-semantic family: concat and split style
/// operators fall through to the CPU fallback row.
fn is_pack_memory_only(kind: OpKind) -> bool {
    matches!(kind, OpKind::Squeeze | OpKind::Reshape | OpKind::ExpandDims)
}

/// Operators allowed in a pass that is marked fully elementwise.
fn is_elem_wise_kind(kind: OpKind) -> bool {
    kind.is_elementwise_main()
        || kind.is_relu()
        || matches!(kind, OpKind::Sigmoid | OpKind::Tanh)
}

struct PackRow {
    /// Operator-set membership; `None` is the wildcard fallback.
    ops: Option<fn(OpKind) -> bool>,
    incompatible: FlagSet<PassFlags>,
    to_set: FlagSet<PassFlags>,
    to_clear: FlagSet<PassFlags>,
}

fn pack_table() -> Vec<PackRow> {
    let none = FlagSet::<PassFlags>::default();
    vec![
        PackRow {
            ops: Some(is_pack_post),
            incompatible: PassFlags::Cpu | PassFlags::MemoryOnly | PassFlags::Pre | PassFlags::Main,
            to_set: PassFlags::Npu | PassFlags::Post,
            to_clear: none,
        },
        PackRow {
            ops: Some(is_pack_post_fuse_limited),
            incompatible: PassFlags::Cpu | PassFlags::MemoryOnly | PassFlags::Pre | PassFlags::Main,
            to_set: PassFlags::Npu | PassFlags::PostFusingLimited,
            to_clear: none,
        },
        PackRow {
            ops: Some(|kind| kind.is_mac_main()),
            incompatible: PassFlags::Cpu
                | PassFlags::MemoryOnly
                | PassFlags::ElementWise
                | PassFlags::Pre
                | PassFlags::Main
                | PassFlags::PostFusingLimited,
            to_set: PassFlags::Npu | PassFlags::Mac | PassFlags::Main,
            to_clear: none,
        },
        PackRow {
            ops: Some(|kind| kind.is_elementwise_main()),
            incompatible: PassFlags::Cpu
                | PassFlags::MemoryOnly
                | PassFlags::Mac
                | PassFlags::Pre
                | PassFlags::Main
                | PassFlags::PostFusingLimited,
            to_set: PassFlags::Npu | PassFlags::ElementWise | PassFlags::Main,
            to_clear: none,
        },
        PackRow {
            ops: Some(|kind| kind.is_npu_pre()),
            incompatible: PassFlags::Cpu | PassFlags::MemoryOnly,
            to_set: PassFlags::Npu | PassFlags::Mac | PassFlags::Pre | PassFlags::ElementWise,
            to_clear: none,
        },
        PackRow {
            ops: Some(|kind| kind == OpKind::Dma),
            incompatible: PassFlags::Cpu | PassFlags::MemoryOnly,
            to_set: PassFlags::Npu | PassFlags::Dma,
            to_clear: none,
        },
        PackRow {
            ops: Some(|kind| kind.is_startup_init()),
            incompatible: PassFlags::Npu | PassFlags::Cpu | PassFlags::MemoryOnly,
            to_set: PassFlags::StartupInit | PassFlags::Main,
            to_clear: none,
        },
        PackRow {
            ops: Some(is_pack_memory_only),
            incompatible: PassFlags::Npu | PassFlags::Cpu,
            to_set: PassFlags::MemoryOnly | PassFlags::Main,
            to_clear: none,
        },
        PackRow {
            ops: Some(is_pack_cpu),
            incompatible: PassFlags::Npu | PassFlags::MemoryOnly | PassFlags::Main,
            to_set: PassFlags::Cpu | PassFlags::Main,
            to_clear: none,
        },
        // Fallback for unrecognised operations.
        PackRow {
            ops: None,
            incompatible: PassFlags::Npu | PassFlags::MemoryOnly | PassFlags::Main,
            to_set: PassFlags::Cpu | PassFlags::Main,
            to_clear: none,
        },
    ]
}

/// Packs the graph into passes, starting from the subgraph outputs.
///
/// Operators must have been annotated by the legality checker first; the
/// NPU rows of the packing table only accept operators whose `run_on_npu`
/// marker is set.
///
/// # Panics
///
/// Panics on structural invariant violations: two block-type operators in
/// one pass, an NPU pass without an OFM tensor, or conflicting placement
/// flags. These indicate bugs, not bad input.
pub fn pack_into_passes(graph: &mut Graph) -> Schedule {
    let mut packer = Packer {
        graph,
        visit_op_refcount: HashMap::new(),
        visit_tensor_refcount: HashMap::new(),
        reverse_pass_list: Vec::new(),
        startup_list: Vec::new(),
        packed: HashSet::new(),
    };

    for tens in packer.graph.outputs.clone() {
        packer.visit_tensor(tens);
    }

    if !packer.startup_list.is_empty() {
        let startup_ops = packer.startup_list.clone();
        let index = packer.build_pass(&startup_ops, None);
        let outputs = startup_ops
            .iter()
            .map(|&op| packer.graph.op(op).outputs[0])
            .collect();
        let pass = &mut packer.reverse_pass_list[index];
        pass.outputs = outputs;
        pass.name = "startup_weight_initialisation".to_string();
    }

    let mut passes = packer.reverse_pass_list;
    passes.reverse();
    let mut scheduled_pass = HashMap::new();
    for (index, pass) in passes.iter().enumerate() {
        for &op in &pass.ops {
            scheduled_pass.insert(op, PassId(index));
        }
    }
    Schedule {
        passes,
        scheduled_pass,
        high_level_command_stream: Vec::new(),
    }
}

struct Packer<'a> {
    graph: &'a mut Graph,
    visit_op_refcount: HashMap<OpId, usize>,
    visit_tensor_refcount: HashMap<TensorId, usize>,
    reverse_pass_list: Vec<Pass>,
    startup_list: Vec<OpId>,
    packed: HashSet<OpId>,
}

impl Packer<'_> {
    /// A tensor is ready when it has been visited once per consumer, plus
    /// once if it is a subgraph output. Readiness triggers a visit of its
    /// producers.
    fn visit_tensor(&mut self, tens: TensorId) {
        let count = {
            let count = self.visit_tensor_refcount.entry(tens).or_insert(0);
            *count += 1;
            *count
        };
        let expected = self.graph.tensor(tens).consumers.len()
            + usize::from(self.graph.outputs.contains(&tens));
        assert!(
            count <= expected,
            "tensor '{}' visited more often than it is consumed",
            self.graph.tensor(tens).name
        );
        if count == expected {
            let mut producers = self.graph.tensor(tens).producers.clone();
            producers.reverse();
            for op in producers {
                self.visit_op(op);
            }
        }
    }

    /// An operator is ready when every output has been visited; outputs
    /// nothing consumes are counted as visited on the first visit. A ready
    /// operator seeds a new pass, or joins the startup pass.
    fn visit_op(&mut self, op: OpId) {
        let first_visit = !self.visit_op_refcount.contains_key(&op);
        let mut count = {
            let entry = self.visit_op_refcount.entry(op).or_insert(0);
            *entry += 1;
            *entry
        };
        if first_visit {
            for out in self.graph.op(op).outputs.clone() {
                if self.graph.tensor(out).consumers.is_empty()
                    && !self.graph.outputs.contains(&out)
                {
                    count += 1;
                }
            }
            self.visit_op_refcount.insert(op, count);
        }
        let outputs = self.graph.op(op).outputs.len();
        assert!(
            count <= outputs,
            "operator '{}' visited more often than it has outputs",
            self.graph.op(op).name
        );
        if count == outputs {
            if self.graph.op(op).kind.is_startup_init() {
                self.startup_list.push(op);
            } else {
                let ofm = self.graph.op(op).ofm().expect("operator has no outputs");
                self.build_pass(&[op], Some(ofm));
            }
        }
    }

    /// Grows a pass around the start operators and appends it to the
    /// reverse pass list, returning its index there.
    fn build_pass(&mut self, start_ops: &[OpId], ofm_tensor: Option<TensorId>) -> usize {
        let table = pack_table();
        let mut reverse_ops_list: Vec<OpId> = Vec::new();
        let mut curr_flags: FlagSet<PassFlags> = FlagSet::default();
        let mut npu_block_type = NpuBlockType::Default;
        let mut reverse_intermediates: Vec<TensorId> = Vec::new();
        let mut input_set: HashSet<TensorId> = HashSet::new();
        let mut ifm_tensor: Option<TensorId> = None;
        let mut primary_op: Option<OpId> = None;

        let mut to_process: VecDeque<(OpId, Option<TensorId>)> =
            start_ops.iter().map(|&op| (op, None)).collect();

        while let Some((curr_op, tens)) = to_process.pop_front() {
            if reverse_ops_list.contains(&curr_op) {
                continue;
            }
            let kind = self.graph.op(curr_op).kind;
            let mut matched = false;
            for row in &table {
                if !row.ops.map_or(true, |in_set| in_set(kind)) {
                    continue;
                }
                if !(curr_flags & row.incompatible).is_empty() {
                    continue;
                }
                if row.to_set.contains(PassFlags::Npu) && !self.graph.op(curr_op).run_on_npu {
                    continue;
                }
                matched = true;
                reverse_ops_list.push(curr_op);
                self.packed.insert(curr_op);

                let new_block_type = self
                    .graph
                    .op(curr_op)
                    .attrs
                    .block_type()
                    .unwrap_or_default();
                if new_block_type != NpuBlockType::Default {
                    // Only one major block type per pass.
                    assert_eq!(
                        npu_block_type,
                        NpuBlockType::Default,
                        "operator '{}' would add a second block type to the pass",
                        self.graph.op(curr_op).name
                    );
                    npu_block_type = new_block_type;
                    assert!(
                        primary_op.is_none(),
                        "operator '{}' would add a second primary operator to the pass",
                        self.graph.op(curr_op).name
                    );
                    primary_op = Some(curr_op);
                }

                curr_flags &= !row.to_clear;
                curr_flags |= row.to_set;

                if row.to_set.contains(PassFlags::Npu)
                    && !(row.to_set
                        & (PassFlags::Mac
                            | PassFlags::ElementWise
                            | PassFlags::Post
                            | PassFlags::PostFusingLimited))
                        .is_empty()
                {
                    let op_ref = self.graph.op(curr_op);
                    assert!(!op_ref.inputs.is_empty());
                    let ifm = op_ref.ifm().unwrap();
                    assert_eq!(
                        self.graph.tensor(ifm).purpose,
                        TensorPurpose::FeatureMap,
                        "IFM of '{}' is not a feature map",
                        self.graph.op(curr_op).name
                    );
                    ifm_tensor = Some(ifm);
                }

                if row.to_set.contains(PassFlags::Dma) {
                    // DMA output buffers stay intermediates of the pass
                    // that consumes the transferred data.
                    if let Some(tens) = tens {
                        reverse_intermediates.push(tens);
                    }
                }

                if row.ops.is_none() {
                    if kind.is_memory_op() {
                        eprintln!(
                            "Warning: {kind:?} operation is memory only \
                             but outside the fusing sets, placing on CPU"
                        );
                    } else {
                        eprintln!(
                            "Warning: {kind:?} operation is unknown or unsupported, \
                             placing on CPU"
                        );
                    }
                }

                for inp in self.graph.op(curr_op).inputs.clone() {
                    let producers = self.graph.tensor(inp).producers.clone();
                    let mut can_pack = producers.len() == 1;
                    if can_pack {
                        let next_op = producers[0];
                        if self.packed.contains(&next_op) {
                            can_pack = false;
                        }
                        for &outp in &self.graph.op(next_op).outputs {
                            if !can_pack {
                                break;
                            }
                            let consumers = &self.graph.tensor(outp).consumers;
                            if consumers.len() > 1
                                || (consumers.len() == 1 && consumers[0] != curr_op)
                            {
                                can_pack = false;
                            }
                        }
                        if can_pack {
                            to_process.push_back((next_op, Some(inp)));
                        }
                    }
                    if !can_pack {
                        input_set.insert(inp);
                    }
                }
                break;
            }

            if !matched {
                // Incompatible with the operators packed so far; the tensor
                // between them becomes a pass input.
                input_set.insert(tens.expect("start operator matched no packing row"));
            }
        }

        if curr_flags.contains(PassFlags::Npu)
            && (curr_flags & (PassFlags::ElementWise | PassFlags::Mac)).is_empty()
        {
            // Without a MAC operation the ambidextrous operations go on the
            // elementwise unit.
            curr_flags |= PassFlags::ElementWise;
        }

        let is_element_wise = reverse_ops_list.iter().all(|&op| {
            let kind = self.graph.op(op).kind;
            is_elem_wise_kind(kind) || kind == OpKind::Dma
        });

        let mut placement: Option<PassPlacement> = None;
        for (flag, value) in [
            (PassFlags::Npu, PassPlacement::Npu),
            (PassFlags::Cpu, PassPlacement::Cpu),
            (PassFlags::MemoryOnly, PassPlacement::MemoryOnly),
            (PassFlags::StartupInit, PassPlacement::StartupInit),
        ] {
            if curr_flags.contains(flag) {
                assert!(
                    placement.is_none(),
                    "pass placement flags are not mutually exclusive: {curr_flags:?}"
                );
                placement = Some(value);
            }
        }
        let placement = placement.expect("pass has no placement flag");

        let mut ops_list = reverse_ops_list;
        ops_list.reverse();
        let mut intermediates = reverse_intermediates;
        intermediates.reverse();

        if primary_op.is_none() {
            primary_op = self.create_primary_op(&mut ops_list);
            if let Some(primary) = primary_op {
                let primary_input = self.graph.op(primary).inputs[0];
                *self.visit_tensor_refcount.entry(primary_input).or_insert(0) += 1;
                npu_block_type = self
                    .graph
                    .op(primary)
                    .attrs
                    .block_type()
                    .expect("synthesized primary operator has no block type");
                for inp in self.graph.op(primary).inputs.clone() {
                    input_set.insert(inp);
                }
            }
        }

        let mut ordered_inputs: Vec<TensorId> = Vec::new();
        let mut input_refcounts: HashMap<TensorId, usize> = HashMap::new();
        for &op in &ops_list {
            for &inp in &self.graph.op(op).inputs {
                if input_set.contains(&inp) {
                    if !input_refcounts.contains_key(&inp) {
                        ordered_inputs.push(inp);
                    }
                    *input_refcounts.entry(inp).or_insert(0) += 1;
                }
            }
        }

        let name = ops_list
            .iter()
            .find(|&&op| self.graph.op(op).kind != OpKind::Dma)
            .or(ops_list.first())
            .map(|&op| self.graph.op(op).name.clone())
            .expect("pass contains no operators");
        let outputs = self.graph.op(*ops_list.last().unwrap()).outputs.clone();

        let primary_is_binary = primary_op
            .map(|op| self.graph.op(op).kind.is_binary_elementwise())
            .unwrap_or(false);
        let (ifm_tensor, ifm2_tensor) = if primary_is_binary {
            let ifm = ordered_inputs.first().copied();
            let ifm2 = if ordered_inputs.len() == 1 {
                ifm
            } else {
                ordered_inputs.get(1).copied()
            };
            (ifm, ifm2)
        } else {
            (ifm_tensor, None)
        };

        assert!(
            placement != PassPlacement::Npu || ofm_tensor.is_some(),
            "NPU pass '{name}' has no OFM tensor"
        );

        let weight_tensor = primary_op.and_then(|op| self.graph.op(op).weights());
        let scale_tensor = primary_op.and_then(|op| self.graph.op(op).bias());

        self.reverse_pass_list.push(Pass {
            name,
            placement,
            is_element_wise,
            npu_block_type,
            ops: ops_list,
            primary_op,
            inputs: ordered_inputs.clone(),
            intermediates,
            outputs,
            ifm_tensor,
            ifm2_tensor,
            ofm_tensor,
            weight_tensor,
            scale_tensor,
            lut_tensor: None,
        });
        let index = self.reverse_pass_list.len() - 1;

        for inp in ordered_inputs {
            for _ in 0..input_refcounts[&inp] {
                self.visit_tensor(inp);
            }
        }
        index
    }

    /// When a pass holds only pre/post operators, synthesizes a 1x1 average
    /// pool in front of the first operator to act as the primary operation.
    /// This is the only change the packer makes to the logical graph.
    fn create_primary_op(&mut self, ops_list: &mut Vec<OpId>) -> Option<OpId> {
        let needs_primary = ops_list.iter().any(|&op| {
            let kind = self.graph.op(op).kind;
            kind.is_npu_pre() || is_pack_post(kind) || is_pack_post_fuse_limited(kind)
        });
        if !needs_primary {
            return None;
        }

        let first = ops_list[0];
        let inp = self.graph.op(first).inputs[0];
        let avgpool_name = format!("{}_avgpool", self.graph.op(first).name);

        let pooled_copy = self.graph.tensor(inp).duplicate("_avgpooled");
        let avgpool_out = self.graph.add_tensor(pooled_copy);

        let mut avgpool = Operation::new(OpKind::AvgPool, avgpool_name);
        avgpool.attrs.set(Attr::Padding, AttrValue::Padding(crate::consts::Padding::Valid));
        avgpool
            .attrs
            .set(Attr::NpuBlockType, AttrValue::Block(NpuBlockType::Pooling));
        avgpool.attrs.set(Attr::StrideW, AttrValue::Int(1));
        avgpool.attrs.set(Attr::StrideH, AttrValue::Int(1));
        avgpool.attrs.set(Attr::FilterWidth, AttrValue::Int(1));
        avgpool.attrs.set(Attr::FilterHeight, AttrValue::Int(1));
        avgpool.attrs.set(Attr::Strides, AttrValue::Ints(vec![1, 1, 1, 1]));
        avgpool.attrs.set(Attr::Ksize, AttrValue::Ints(vec![1, 1, 1, 1]));
        avgpool.attrs.set(Attr::Skirt, AttrValue::Ints(vec![0, 0, 0, 0]));
        avgpool
            .attrs
            .set(Attr::ExplicitPadding, AttrValue::Ints(vec![0, 0, 0, 0]));
        avgpool.run_on_npu = true;
        avgpool.inputs = vec![inp];
        avgpool.outputs = vec![avgpool_out];
        let avgpool_id = self.graph.add_op(avgpool);

        // Reroute the first operator to read the pooled copy. The original
        // input keeps its old consumer link, compensated by the extra visit
        // recorded by the caller.
        self.graph.op_mut(first).inputs[0] = avgpool_out;
        self.graph.tensor_mut(avgpool_out).consumers.push(first);

        ops_list.insert(0, avgpool_id);
        self.packed.insert(avgpool_id);
        Some(avgpool_id)
    }
}
