//! Internal representation of a neural network subgraph.
//!
//! Tensors and operators live in arenas owned by [`Graph`] and refer to each
//! other through stable [`TensorId`]/[`OpId`] indices, so the producer and
//! consumer links can be cyclic without shared ownership. The external graph
//! parser creates the arena contents; the legality checker reads it, the pass
//! packer and LUT allocator mutate it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

use crate::consts::{DataType, MemArea, NpuBlockType, OpKind, Padding, TensorPurpose};

/// Index of a tensor in its graph's tensor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Index of an operator in its graph's operator arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// Opaque token identifying semantically identical tensors. Two lookup
/// tables with equal ids hold the same values and may share a SHRAM slot.
/// Supports equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EquivalenceId(u64);

static NEXT_EQUIVALENCE_ID: AtomicU64 = AtomicU64::new(0);

impl EquivalenceId {
    /// Returns a fresh id, distinct from every id handed out before.
    pub fn fresh() -> Self {
        EquivalenceId(NEXT_EQUIVALENCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Returns the equivalence id associated with `key`, creating one on first
/// use. The mapping is process-wide and append-only, so for example all
/// 256-byte tanh tables can be created under one key and will then share a
/// single id.
pub fn equivalence_id_for(key: &str) -> EquivalenceId {
    static IDS: OnceLock<Mutex<HashMap<String, EquivalenceId>>> = OnceLock::new();
    let mut ids = IDS.get_or_init(Default::default).lock().unwrap();
    *ids.entry(key.to_string())
        .or_insert_with(EquivalenceId::fresh)
}

/// An error raised by graph queries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Dequantization was requested for per-axis quantization parameters.
    #[error("per-axis quantization parameters cannot be dequantized")]
    PerAxisDequantize,
}

/// Zero point of a quantization record; per-axis weights carry one entry per
/// output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ZeroPoint {
    /// One zero point for the whole tensor.
    Scalar(i64),
    /// One zero point per output channel.
    PerAxis(Vec<i64>),
}

/// Quantization parameters of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationParameters {
    /// Scale; `None` if not yet derived. May be non-finite in broken inputs,
    /// which the legality checker rejects.
    pub scale_f32: Option<f32>,
    /// Zero point, scalar or per output channel.
    pub zero_point: ZeroPoint,
    /// Smallest representable real value.
    pub quant_min: Option<f64>,
    /// Largest representable real value.
    pub quant_max: Option<f64>,
}

impl Default for QuantizationParameters {
    fn default() -> Self {
        QuantizationParameters {
            scale_f32: Some(1.0),
            zero_point: ZeroPoint::Scalar(0),
            quant_min: None,
            quant_max: None,
        }
    }
}

impl QuantizationParameters {
    /// True if the record quantizes per output channel rather than per
    /// tensor.
    pub fn is_per_axis(&self) -> bool {
        matches!(&self.zero_point, ZeroPoint::PerAxis(zps) if zps.len() > 1)
    }

    /// The zero point that applies to output channel `channel`.
    pub fn zero_point_for(&self, channel: usize) -> i64 {
        match &self.zero_point {
            ZeroPoint::Scalar(zp) => *zp,
            ZeroPoint::PerAxis(zps) => zps[channel % zps.len()],
        }
    }

    /// Whether two records scale identically (same scale and zero point).
    pub fn scaling_equal(&self, other: &QuantizationParameters) -> bool {
        self.scale_f32 == other.scale_f32 && self.zero_point == other.zero_point
    }

    /// Converts quantized values back to real values.
    ///
    /// Per-axis parameters are rejected: the caller cannot know which axis
    /// the channels run along here, so dequantizing them is an error.
    pub fn dequantize(&self, values: &[i64]) -> Result<Vec<f64>, GraphError> {
        if self.is_per_axis() {
            return Err(GraphError::PerAxisDequantize);
        }
        let zero_point = self.zero_point_for(0);
        let scale = f64::from(self.scale_f32.unwrap_or(1.0));
        Ok(values
            .iter()
            .map(|&v| (v - zero_point) as f64 * scale)
            .collect())
    }
}

/// An activation function fused onto an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationFunction {
    /// Kind of the activation, e.g. [`OpKind::Relu`] or [`OpKind::Lut`].
    pub op: OpKind,
    /// Lower clamp, if any.
    pub min: Option<f32>,
    /// Upper clamp, if any.
    pub max: Option<f32>,
    /// SHRAM slot of the lookup table, filled in by the LUT allocator.
    pub lut_index: u8,
}

impl ActivationFunction {
    /// Creates an activation of the given kind without clamping.
    pub fn new(op: OpKind) -> Self {
        ActivationFunction {
            op,
            min: None,
            max: None,
            lut_index: 0,
        }
    }
}

/// Key of an operator attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Attr {
    /// Padding mode of a windowed operation
    Padding,
    /// Horizontal stride
    StrideW,
    /// Vertical stride
    StrideH,
    /// Pooling window width
    FilterWidth,
    /// Pooling window height
    FilterHeight,
    /// Horizontal dilation factor
    DilationWFactor,
    /// Vertical dilation factor
    DilationHFactor,
    /// Depthwise channel multiplier
    DepthMultiplier,
    /// Concatenation axis
    Axis,
    /// Leaky relu slope
    Alpha,
    /// Softmax temperature
    Beta,
    /// Resize corner alignment
    AlignCorners,
    /// Strided slice begin mask
    BeginMask,
    /// Strided slice end mask
    EndMask,
    /// Strided slice ellipsis mask
    EllipsisMask,
    /// Strided slice new axis mask
    NewAxisMask,
    /// Strided slice shrink axis mask
    ShrinkAxisMask,
    /// Major NPU block type of the operator
    NpuBlockType,
    /// SHRAM slot of the operator's lookup table
    LutIndex,
    /// Four-element stride vector
    Strides,
    /// Four-element pooling window vector
    Ksize,
    /// Skirt padding vector
    Skirt,
    /// Explicit padding vector
    ExplicitPadding,
}

/// Value of an operator attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// Boolean value
    Bool(bool),
    /// Padding mode
    Padding(Padding),
    /// NPU block type
    Block(NpuBlockType),
    /// Integer list value
    Ints(Vec<i64>),
}

/// Attribute map of an operator. Values are tagged; the accessors return
/// `None` both for missing attributes and for attributes of an unexpected
/// type, so generic code never has to match on [`AttrValue`] itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(BTreeMap<Attr, AttrValue>);

impl Attributes {
    /// Creates an empty attribute map.
    pub fn new() -> Self {
        Attributes::default()
    }

    /// Inserts or replaces an attribute.
    pub fn set(&mut self, key: Attr, value: AttrValue) {
        self.0.insert(key, value);
    }

    /// True if the attribute is present, whatever its type.
    pub fn contains(&self, key: Attr) -> bool {
        self.0.contains_key(&key)
    }

    /// The attribute as an integer.
    pub fn int(&self, key: Attr) -> Option<i64> {
        match self.0.get(&key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// The attribute as a float.
    pub fn float(&self, key: Attr) -> Option<f64> {
        match self.0.get(&key) {
            Some(AttrValue::Float(v)) => Some(*v),
            Some(AttrValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// The attribute as a boolean.
    pub fn boolean(&self, key: Attr) -> Option<bool> {
        match self.0.get(&key) {
            Some(AttrValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// The padding mode.
    pub fn padding(&self) -> Option<Padding> {
        match self.0.get(&Attr::Padding) {
            Some(AttrValue::Padding(v)) => Some(*v),
            _ => None,
        }
    }

    /// The major NPU block type.
    pub fn block_type(&self) -> Option<NpuBlockType> {
        match self.0.get(&Attr::NpuBlockType) {
            Some(AttrValue::Block(v)) => Some(*v),
            _ => None,
        }
    }

    /// The attribute as an integer list.
    pub fn ints(&self, key: Attr) -> Option<&[i64]> {
        match self.0.get(&key) {
            Some(AttrValue::Ints(v)) => Some(v),
            _ => None,
        }
    }
}

/// The kernel of a windowed operation, with dilation applied through the
/// `area_*` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kernel {
    /// Kernel width
    pub width: i64,
    /// Kernel height
    pub height: i64,
    /// Horizontal stride
    pub stride_w: i64,
    /// Vertical stride
    pub stride_h: i64,
    /// Horizontal dilation
    pub dilation_w: i64,
    /// Vertical dilation
    pub dilation_h: i64,
}

impl Kernel {
    /// Width of the dilated kernel.
    pub fn area_width(&self) -> i64 {
        (self.width - 1) * self.dilation_w + 1
    }

    /// Height of the dilated kernel.
    pub fn area_height(&self) -> i64 {
        (self.height - 1) * self.dilation_h + 1
    }

    /// Number of undilated kernel elements.
    pub fn elements_wh(&self) -> i64 {
        self.width * self.height
    }
}

/// A tensor in the graph.
///
/// The shape holds one entry per dimension; `None` marks a dimension whose
/// extent is unknown. An empty shape is a scalar; a scalar without values is
/// a dynamic tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Name from the input graph.
    pub name: String,
    /// Dimensions, outermost first.
    pub shape: Vec<Option<u32>>,
    /// Element type.
    pub dtype: DataType,
    /// What the tensor is used for.
    pub purpose: TensorPurpose,
    /// Constant values, if the tensor is constant.
    pub values: Option<Vec<i64>>,
    /// Quantized constant values, if present.
    pub quant_values: Option<Vec<i64>>,
    /// Quantization record; `None` means unquantized.
    pub quantization: Option<QuantizationParameters>,
    /// Memory area the tensor is allocated in.
    pub mem_area: MemArea,
    /// Byte offset within the memory area, filled by an allocator.
    pub address: u32,
    /// Required address alignment in bytes.
    pub alignment: u32,
    /// Operators producing this tensor.
    pub producers: Vec<OpId>,
    /// Operators reading this tensor.
    pub consumers: Vec<OpId>,
    /// Token identifying semantically identical tensors.
    pub equivalence_id: EquivalenceId,
}

impl Tensor {
    /// Allocation granularity of tensor storage, in bytes.
    pub const ALLOCATION_QUANTUM: u32 = 16;

    /// Creates a tensor with fully known dimensions.
    pub fn new(shape: &[u32], dtype: DataType, name: impl Into<String>) -> Self {
        Tensor::with_dims(shape.iter().map(|&d| Some(d)).collect(), dtype, name)
    }

    /// Creates a tensor whose shape may contain unknown dimensions.
    pub fn with_dims(shape: Vec<Option<u32>>, dtype: DataType, name: impl Into<String>) -> Self {
        Tensor {
            name: name.into(),
            shape,
            dtype,
            purpose: TensorPurpose::Unknown,
            values: None,
            quant_values: None,
            quantization: None,
            mem_area: MemArea::Unknown,
            address: 0,
            alignment: Tensor::ALLOCATION_QUANTUM,
            producers: Vec::new(),
            consumers: Vec::new(),
            equivalence_id: EquivalenceId::fresh(),
        }
    }

    /// Copies the tensor under a new name. Producer and consumer links and
    /// the address are reset; the equivalence id is kept, so the copy still
    /// identifies as the same data.
    pub fn duplicate(&self, suffix: &str) -> Tensor {
        let mut res = self.clone();
        res.name.push_str(suffix);
        res.producers = Vec::new();
        res.consumers = Vec::new();
        res.address = 0;
        res
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// True for zero-dimensional tensors.
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// True when neither a shape nor constant values are known.
    pub fn is_dynamic(&self) -> bool {
        self.is_scalar() && self.values.is_none() && self.quant_values.is_none()
    }

    /// True when every dimension extent is known.
    pub fn has_fully_defined_shape(&self) -> bool {
        self.shape.iter().all(Option::is_some)
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> u32 {
        self.dtype.size_in_bytes()
    }

    /// Number of elements, or `None` while any dimension is unknown.
    pub fn elements(&self) -> Option<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, d| d.map(|d| acc * u64::from(d)))
    }

    /// Bytes of storage the tensor occupies: element bytes rounded up to the
    /// tensor's alignment, never zero.
    pub fn storage_size(&self) -> u32 {
        let raw = (self.elements().unwrap_or(0) * u64::from(self.element_size())).max(1) as u32;
        raw.div_ceil(self.alignment) * self.alignment
    }

    /// Whether this tensor holds the same data as `other`.
    pub fn equivalent(&self, other: &Tensor) -> bool {
        self.equivalence_id == other.equivalence_id
    }
}

/// An operator in the graph.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Kind of the operator.
    pub kind: OpKind,
    /// Name from the input graph.
    pub name: String,
    /// Ordered input tensors.
    pub inputs: Vec<TensorId>,
    /// Ordered output tensors.
    pub outputs: Vec<TensorId>,
    /// Typed attribute map.
    pub attrs: Attributes,
    /// Fused activation, if any.
    pub activation: Option<ActivationFunction>,
    /// Verdict of the legality checker; NPU packing rows require it.
    pub run_on_npu: bool,
}

impl Operation {
    /// Creates an operator without tensors attached.
    pub fn new(kind: OpKind, name: impl Into<String>) -> Self {
        Operation {
            kind,
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Attributes::new(),
            activation: None,
            run_on_npu: false,
        }
    }

    fn ifm_index(&self) -> usize {
        match self.kind {
            OpKind::BlockLstm => 3,
            OpKind::Conv2DBackpropInput => 2,
            _ => 0,
        }
    }

    /// The input feature map.
    pub fn ifm(&self) -> Option<TensorId> {
        self.inputs.get(self.ifm_index()).copied()
    }

    /// The second input feature map of a binary operation, or the sizes
    /// tensor of a SplitV.
    pub fn ifm2(&self) -> Option<TensorId> {
        if self.kind.is_binary_elementwise() || self.kind == OpKind::SplitV {
            self.inputs.get(1).copied()
        } else {
            None
        }
    }

    /// The output feature map.
    pub fn ofm(&self) -> Option<TensorId> {
        self.outputs.first().copied()
    }

    /// The weight tensor of weighted operators.
    pub fn weights(&self) -> Option<TensorId> {
        if self.kind.is_convolution_like() || self.kind.is_vector_product() {
            self.inputs.get(1).copied()
        } else {
            None
        }
    }

    /// The bias tensor of weighted operators.
    pub fn bias(&self) -> Option<TensorId> {
        if self.kind.is_convolution()
            || self.kind.is_depthwise_convolution()
            || self.kind.is_vector_product()
        {
            self.inputs.get(2).copied()
        } else {
            None
        }
    }

    /// The IFM, IFM2, weight and OFM tensors that are present, in that
    /// order.
    pub fn feature_tensors(&self) -> Vec<TensorId> {
        [self.ifm(), self.ifm2(), self.weights(), self.ofm()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// The kernel of a windowed operation. Width and height come from the
    /// weight tensor when one exists, otherwise from the filter attributes;
    /// strides and dilation come from the attributes and default to 1.
    pub fn kernel(&self, graph: &Graph) -> Kernel {
        let (width, height) = match self.weights() {
            Some(w) => {
                let shape = &graph.tensor(w).shape;
                let dim = |i: usize| -> i64 {
                    shape
                        .get(i)
                        .copied()
                        .flatten()
                        .map(i64::from)
                        .unwrap_or(1)
                };
                (dim(1), dim(0))
            }
            None => (
                self.attrs.int(Attr::FilterWidth).unwrap_or(1),
                self.attrs.int(Attr::FilterHeight).unwrap_or(1),
            ),
        };
        Kernel {
            width,
            height,
            stride_w: self.attrs.int(Attr::StrideW).unwrap_or(1),
            stride_h: self.attrs.int(Attr::StrideH).unwrap_or(1),
            dilation_w: self.attrs.int(Attr::DilationWFactor).unwrap_or(1),
            dilation_h: self.attrs.int(Attr::DilationHFactor).unwrap_or(1),
        }
    }
}

/// A subgraph: the arenas of tensors and operators plus the subgraph output
/// tensors the pass packer starts its reverse traversal from.
#[derive(Debug, Default)]
pub struct Graph {
    tensors: Vec<Tensor>,
    ops: Vec<Operation>,
    /// Subgraph output tensors.
    pub outputs: Vec<TensorId>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Graph::default()
    }

    /// Adds a tensor to the arena and returns its id.
    pub fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        self.tensors.push(tensor);
        TensorId(self.tensors.len() - 1)
    }

    /// Adds an operator to the arena, wiring the producer link of every
    /// output and the consumer link of every input. Operators whose kind
    /// programs an NPU block get the block type attribute filled in unless
    /// already set. Returns the new id.
    pub fn add_op(&mut self, mut op: Operation) -> OpId {
        let block_type = op.kind.default_block_type();
        if op.attrs.block_type().is_none() && block_type != NpuBlockType::Default {
            op.attrs.set(Attr::NpuBlockType, AttrValue::Block(block_type));
        }
        let id = OpId(self.ops.len());
        for &inp in &op.inputs {
            self.tensors[inp.0].consumers.push(id);
        }
        for &out in &op.outputs {
            self.tensors[out.0].producers.push(id);
        }
        self.ops.push(op);
        id
    }

    /// Appends an input tensor to an existing operator.
    pub fn add_op_input(&mut self, op: OpId, tensor: TensorId) {
        self.ops[op.0].inputs.push(tensor);
        self.tensors[tensor.0].consumers.push(op);
    }

    /// The tensor with the given id.
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0]
    }

    /// Mutable access to the tensor with the given id.
    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.0]
    }

    /// The operator with the given id.
    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.0]
    }

    /// Mutable access to the operator with the given id.
    pub fn op_mut(&mut self, id: OpId) -> &mut Operation {
        &mut self.ops[id.0]
    }

    /// Ids of all operators, in creation order.
    pub fn op_ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.ops.len()).map(OpId)
    }

    /// Number of operators in the arena.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }
}

/// Formats a shape the way diagnostics print it, e.g. `[1, 8, 8, 8]`.
pub(crate) fn format_shape(shape: &[Option<u32>]) -> String {
    let dims: Vec<String> = shape
        .iter()
        .map(|d| match d {
            Some(d) => d.to_string(),
            None => "None".to_string(),
        })
        .collect();
    format!("[{}]", dims.join(", "))
}
