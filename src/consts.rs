use flagset::flags;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;
use phf::phf_map;

/// Size in bytes of one lookup-table slot in SHRAM.
pub const LUT_SLOT_SIZE: u32 = 256;
/// Number of lookup-table slots in the SHRAM LUT region.
pub const LUT_SLOT_COUNT: u32 = 8;

flags! {
    /// Flags accumulated while growing a pass around an operator. A row of
    /// the packing table sets some of these and is rejected when its
    /// incompatibility mask intersects the flags gathered so far.
    pub enum PassFlags: u16 {
        /// Pre-operation, runs before the main operation of the pass.
        Pre = 1,
        /// Main operation; at most one per pass.
        Main = 2,
        /// Post-operation, fused after the main operation.
        Post = 4,
        /// Uses the MAC engine.
        Mac = 8,
        /// DMA transfer.
        Dma = 32,
        /// Uses the elementwise engine.
        ElementWise = 256,
        /// The pass executes on the NPU.
        Npu = 512,
        /// The pass executes on the CPU.
        Cpu = 1024,
        /// The pass initialises weights and constants at startup.
        StartupInit = 2048,
        /// The pass only rearranges memory.
        MemoryOnly = 4096,
        /// Post-operation that must not fuse with a main operation.
        PostFusingLimited = 8192,
    }
}

/// Major block type of an NPU pass. Set by the operator that governs the
/// hardware programming of the pass; at most one such operator per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NpuBlockType {
    /// No block type assigned yet.
    #[default]
    Default,
    /// MxN convolution.
    ConvolutionMxN,
    /// Depthwise convolution.
    ConvolutionDepthWise,
    /// Max/average pooling or resize.
    Pooling,
    /// Elementwise unit.
    ElementWise,
    /// Depth-axis reduction.
    ReduceSum,
    /// Fully connected / matrix-vector product.
    VectorProduct,
}

/// What a tensor is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TensorPurpose {
    /// Not yet classified.
    #[default]
    Unknown,
    /// Convolution or fully-connected weights.
    Weights,
    /// Input/output feature map.
    FeatureMap,
    /// Scratch storage.
    Scratch,
    /// Activation lookup table.
    Lut,
}

/// Memory area a tensor is allocated in. The address field of a tensor is an
/// offset into its area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemArea {
    /// Not yet placed.
    #[default]
    Unknown,
    /// On-chip SRAM.
    Sram,
    /// External DRAM.
    Dram,
    /// On-chip flash.
    OnChipFlash,
    /// External flash.
    OffChipFlash,
    /// The SHRAM scratch memory inside the NPU.
    Shram,
}

/// Element type of a tensor in the input graph. Signedness and bit width are
/// intrinsic to the type. Types outside the NPU's supported set are carried
/// so the legality checker can name them in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer, only valid for bias tensors
    Int64,
    /// 16-bit float, not executable on the NPU
    Float16,
    /// 32-bit float, not executable on the NPU
    Float32,
    /// Boolean
    Bool,
}

impl DataType {
    /// Size of one element in bits.
    pub fn size_in_bits(&self) -> u32 {
        match self {
            DataType::UInt8 | DataType::Int8 | DataType::Bool => 8,
            DataType::UInt16 | DataType::Int16 | DataType::Float16 => 16,
            DataType::Int32 | DataType::Float32 => 32,
            DataType::Int64 => 64,
        }
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        self.size_in_bits() / 8
    }

    /// Whether the type is signed.
    pub fn is_signed(&self) -> bool {
        !matches!(self, DataType::UInt8 | DataType::UInt16 | DataType::Bool)
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Padding mode of a windowed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    /// Output keeps the input size; the window may read outside the input.
    Same,
    /// The window stays within the input.
    Valid,
}

/// The kind of an operator in the input graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum OpKind {
    /// Constant tensor
    Const = 0,
    /// Graph placeholder
    Placeholder = 1,
    /// Subgraph input
    SubgraphInput = 2,
    /// Mutable variable
    Variable = 3,
    /// 2D convolution
    Conv2D = 10,
    /// 2D convolution with fused bias
    Conv2DBias = 11,
    /// Quantized 2D convolution
    QuantizedConv2D = 12,
    /// Depthwise 2D convolution with fused bias
    DepthwiseConv2DBias = 13,
    /// Transpose convolution
    Conv2DBackpropInput = 14,
    /// Matrix multiplication
    MatMul = 20,
    /// Quantized matrix multiplication
    QuantizedMatMul = 21,
    /// Fully connected layer
    FullyConnected = 22,
    /// Block LSTM cell
    BlockLstm = 23,
    /// Average pooling
    AvgPool = 30,
    /// Max pooling
    MaxPool = 31,
    /// Quantized average pooling
    QuantizedAvgPool = 32,
    /// Quantized max pooling
    QuantizedMaxPool = 33,
    /// Sum reduction along the depth axis
    ReduceSum = 34,
    /// Bilinear resize
    ResizeBilinear = 40,
    /// Quantized bilinear resize, lowered to an NPU pre-operation
    QuantizedResizeBilinear = 41,
    /// Elementwise addition
    Add = 50,
    /// Elementwise subtraction
    Sub = 51,
    /// Elementwise multiplication
    Mul = 52,
    /// Elementwise minimum
    Minimum = 53,
    /// Elementwise maximum
    Maximum = 54,
    /// Bitwise shift left
    Shl = 55,
    /// Rounded shift right
    Shr = 56,
    /// Count leading zeros
    Clz = 57,
    /// Elementwise absolute value
    Abs = 58,
    /// Leaky rectified linear unit
    LeakyRelu = 59,
    /// Rectified linear unit
    Relu = 70,
    /// Relu clamped to [0, 6]
    Relu6 = 71,
    /// Relu clamped to [-1, 1]
    ReluN1To1 = 72,
    /// Hyperbolic tangent
    Tanh = 73,
    /// Logistic sigmoid
    Sigmoid = 74,
    /// Softmax
    Softmax = 75,
    /// Activation through a lookup table
    Lut = 76,
    /// Quantize
    Quantize = 80,
    /// Dequantize
    Dequantize = 81,
    /// Concatenation
    Concat = 90,
    /// Write slice of a concatenation result
    ConcatSliceWrite = 91,
    /// Pack along a new axis
    Pack = 92,
    /// Split into equal parts
    Split = 93,
    /// Split into explicitly sized parts
    SplitV = 94,
    /// Strided slice
    StridedSlice = 95,
    /// Slice
    Slice = 96,
    /// Unpack along an axis
    Unpack = 97,
    /// Remove size-1 dimensions
    Squeeze = 100,
    /// Reshape
    Reshape = 101,
    /// Insert a size-1 dimension
    ExpandDims = 102,
    /// Padding
    Pad = 110,
    /// Shape query
    Shape = 111,
    /// N-ary addition
    AddN = 112,
    /// Local response normalisation
    Lrn = 113,
    /// DMA transfer between memory areas
    Dma = 120,
    /// Read slice of a split input, lowered to an NPU pre-operation
    SplitSliceRead = 121,
}

impl OpKind {
    /// Returns the external (TFLite builtin) name of the operator, or
    /// `"UNKNOWN"` for internal operators without an external counterpart.
    pub fn external_name(&self) -> &'static str {
        EXTERNAL_NAMES
            .get(&self.to_u16().unwrap())
            .copied()
            .unwrap_or("UNKNOWN")
    }

    /// Regular (non-depthwise, non-transpose) convolutions.
    pub fn is_convolution(&self) -> bool {
        matches!(
            self,
            OpKind::Conv2D | OpKind::Conv2DBias | OpKind::QuantizedConv2D
        )
    }

    /// Depthwise convolutions.
    pub fn is_depthwise_convolution(&self) -> bool {
        matches!(self, OpKind::DepthwiseConv2DBias)
    }

    /// Transpose convolutions.
    pub fn is_transpose_convolution(&self) -> bool {
        matches!(self, OpKind::Conv2DBackpropInput)
    }

    /// The whole convolution family.
    pub fn is_convolution_like(&self) -> bool {
        self.is_convolution() || self.is_depthwise_convolution() || self.is_transpose_convolution()
    }

    /// Max-pooling operators.
    pub fn is_max_pool(&self) -> bool {
        matches!(self, OpKind::MaxPool | OpKind::QuantizedMaxPool)
    }

    /// Average-pooling operators.
    pub fn is_avg_pool(&self) -> bool {
        matches!(self, OpKind::AvgPool | OpKind::QuantizedAvgPool)
    }

    /// Pooling operators, including depth-axis reduction.
    pub fn is_pooling(&self) -> bool {
        self.is_max_pool() || self.is_avg_pool() || matches!(self, OpKind::ReduceSum)
    }

    /// Fully-connected style matrix-vector products.
    pub fn is_vector_product(&self) -> bool {
        matches!(
            self,
            OpKind::MatMul | OpKind::QuantizedMatMul | OpKind::FullyConnected
        )
    }

    /// Resizing operators.
    pub fn is_resize(&self) -> bool {
        matches!(self, OpKind::ResizeBilinear)
    }

    /// Operators that occupy the MAC engine as the main operation of a pass.
    pub fn is_mac_main(&self) -> bool {
        self.is_convolution_like()
            || self.is_pooling()
            || self.is_vector_product()
            || self.is_resize()
            || matches!(self, OpKind::BlockLstm)
    }

    /// Unary operators executed on the elementwise engine.
    pub fn is_unary_elementwise(&self) -> bool {
        matches!(self, OpKind::Abs | OpKind::LeakyRelu | OpKind::Clz)
    }

    /// Binary minimum/maximum.
    pub fn is_binary_min_max(&self) -> bool {
        matches!(self, OpKind::Minimum | OpKind::Maximum)
    }

    /// Binary shifts.
    pub fn is_binary_shift(&self) -> bool {
        matches!(self, OpKind::Shl | OpKind::Shr)
    }

    /// Binary add/mul/sub.
    pub fn is_binary_add_mul_sub(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Mul | OpKind::Sub)
    }

    /// All binary operators executed on the elementwise engine.
    pub fn is_binary_elementwise(&self) -> bool {
        self.is_binary_min_max() || self.is_binary_shift() || self.is_binary_add_mul_sub()
    }

    /// Operators that occupy the elementwise engine as the main operation.
    pub fn is_elementwise_main(&self) -> bool {
        self.is_binary_elementwise() || self.is_unary_elementwise()
    }

    /// The Relu family of activations.
    pub fn is_relu(&self) -> bool {
        matches!(self, OpKind::Relu | OpKind::Relu6 | OpKind::ReluN1To1)
    }

    /// Activation functions.
    pub fn is_activation(&self) -> bool {
        self.is_relu() || matches!(self, OpKind::Tanh | OpKind::Sigmoid | OpKind::Softmax)
    }

    /// Concatenation-style operators.
    pub fn is_concat(&self) -> bool {
        matches!(self, OpKind::Concat | OpKind::Pack)
    }

    /// Split-style operators.
    pub fn is_split(&self) -> bool {
        matches!(
            self,
            OpKind::Split | OpKind::SplitV | OpKind::StridedSlice | OpKind::Slice | OpKind::Unpack
        )
    }

    /// Operators that only rearrange or alias memory.
    pub fn is_memory_op(&self) -> bool {
        matches!(self, OpKind::Squeeze | OpKind::Reshape | OpKind::ExpandDims)
            || self.is_concat()
            || self.is_split()
    }

    /// Operators that produce constants and graph inputs at startup.
    pub fn is_startup_init(&self) -> bool {
        matches!(
            self,
            OpKind::Const | OpKind::Placeholder | OpKind::SubgraphInput | OpKind::Variable
        )
    }

    /// NPU pre-operations, executed in front of a main operation.
    pub fn is_npu_pre(&self) -> bool {
        matches!(
            self,
            OpKind::QuantizedResizeBilinear | OpKind::SplitSliceRead
        )
    }

    /// The major NPU block type an operator of this kind programs, or
    /// `Default` for operators that do not govern a pass.
    pub fn default_block_type(&self) -> NpuBlockType {
        if self.is_depthwise_convolution() {
            NpuBlockType::ConvolutionDepthWise
        } else if self.is_convolution() || self.is_transpose_convolution() {
            NpuBlockType::ConvolutionMxN
        } else if matches!(self, OpKind::ReduceSum) {
            NpuBlockType::ReduceSum
        } else if self.is_max_pool() || self.is_avg_pool() || self.is_resize() {
            NpuBlockType::Pooling
        } else if self.is_vector_product() || matches!(self, OpKind::BlockLstm) {
            NpuBlockType::VectorProduct
        } else if self.is_elementwise_main() {
            NpuBlockType::ElementWise
        } else {
            NpuBlockType::Default
        }
    }
}

static EXTERNAL_NAMES: phf::Map<u16, &'static str> = phf_map! {
    10u16 => "CONV_2D",
    11u16 => "CONV_2D",
    12u16 => "CONV_2D",
    13u16 => "DEPTHWISE_CONV_2D",
    14u16 => "TRANSPOSE_CONV",
    20u16 => "FULLY_CONNECTED",
    21u16 => "FULLY_CONNECTED",
    22u16 => "FULLY_CONNECTED",
    23u16 => "UNIDIRECTIONAL_SEQUENCE_LSTM",
    30u16 => "AVERAGE_POOL_2D",
    31u16 => "MAX_POOL_2D",
    32u16 => "AVERAGE_POOL_2D",
    33u16 => "MAX_POOL_2D",
    34u16 => "SUM",
    40u16 => "RESIZE_BILINEAR",
    41u16 => "RESIZE_BILINEAR",
    50u16 => "ADD",
    51u16 => "SUB",
    52u16 => "MUL",
    53u16 => "MINIMUM",
    54u16 => "MAXIMUM",
    58u16 => "ABS",
    59u16 => "LEAKY_RELU",
    70u16 => "RELU",
    71u16 => "RELU6",
    72u16 => "RELU_N1_TO_1",
    73u16 => "TANH",
    74u16 => "LOGISTIC",
    75u16 => "SOFTMAX",
    80u16 => "QUANTIZE",
    81u16 => "DEQUANTIZE",
    90u16 => "CONCATENATION",
    92u16 => "PACK",
    93u16 => "SPLIT",
    94u16 => "SPLIT_V",
    95u16 => "STRIDED_SLICE",
    96u16 => "SLICE",
    97u16 => "UNPACK",
    100u16 => "SQUEEZE",
    101u16 => "RESHAPE",
    102u16 => "EXPAND_DIMS",
    110u16 => "PAD",
    111u16 => "SHAPE",
    112u16 => "ADD_N",
    113u16 => "LOCAL_RESPONSE_NORMALIZATION",
};
