//! The public, hardware-shaped API.
//!
//! Everything a host compiler or assembler needs to describe NPU operations
//! lives here, together with the four entry points that turn those
//! descriptions into encoded weights, biases, register command streams and
//! driver payloads.
//!
//! # Examples
//!
//! ```
//! let version = enpu::api::npu_get_api_version();
//! assert_eq!(version >> 16, 1);
//! ```

use crate::arch::Accelerator;
use crate::registers;
use crate::registers::StreamError;
use crate::weights;
use crate::weights::{EncodeError, WeightVolume};

/// Major version of the public API.
pub const API_VERSION_MAJOR: u32 = 1;
/// Minor version of the public API.
pub const API_VERSION_MINOR: u32 = 0;

/// Returns the API version as `(major << 16) | minor`.
pub fn npu_get_api_version() -> u32 {
    (API_VERSION_MAJOR << 16) | (API_VERSION_MINOR & 0xFFFF)
}

/// Supported accelerator configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum NpuAccelerator {
    /// U55 with 32 MACs/cycle
    U55_32,
    /// U55 with 64 MACs/cycle
    U55_64,
    /// U55 with 128 MACs/cycle
    U55_128,
    /// U55 with 256 MACs/cycle
    U55_256,
    /// U65 with 256 MACs/cycle
    U65_256,
    /// U65 with 512 MACs/cycle
    U65_512,
}

/// Elementwise operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NpuElementWiseOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Absolute value
    Abs,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Leaky relu
    Lrelu,
    /// Count leading zeros
    Clz,
    /// Rounded right shift
    Shr,
    /// Bitwise left shift
    Shl,
}

/// Pooling operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NpuPoolingOp {
    /// Max pooling
    Max,
    /// Average pooling
    Average,
    /// Depth-axis sum reduction
    ReduceSum,
}

/// Activation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NpuActivationOp {
    /// No activation, or relu-style clamping via min/max
    NoneOrRelu,
    /// Hyperbolic tangent
    Tanh,
    /// Logistic sigmoid
    Sigmoid,
    /// Table lookup using the activation's lookup table index
    TableLookup,
}

/// Rounding mode of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NpuRoundingMode {
    /// TensorFlow Lite rounding
    #[default]
    Tfl,
    /// Truncate towards zero
    Truncate,
    /// Round to nearest with ties away from zero
    Natural,
}

/// Memory layout of a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NpuLayout {
    /// Plain NHWC
    #[default]
    Nhwc,
    /// NHWC with 16 channels packed into the innermost group
    Nhcwb16,
}

/// IFM resampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NpuResamplingMode {
    /// No resampling
    #[default]
    None,
    /// 2x2 nearest-neighbour upscale
    Nearest,
    /// 2x2 transpose upscale
    Transpose,
}

/// Iteration order over weight sub-kernels. Must match the traversal used
/// when the weights were encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NpuBlockTraversal {
    /// Traverse the kernel depth first
    DepthFirst,
    /// Traverse part of the kernel before descending in depth
    #[default]
    PartKernelFirst,
}

/// Element type of a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NpuDataType {
    /// Unsigned 8-bit
    #[default]
    UInt8,
    /// Signed 8-bit
    Int8,
    /// Unsigned 16-bit
    UInt16,
    /// Signed 16-bit
    Int16,
    /// Signed 32-bit
    Int32,
}

impl NpuDataType {
    /// Whether the type is signed.
    pub fn is_signed(&self) -> bool {
        !matches!(self, NpuDataType::UInt8 | NpuDataType::UInt16)
    }

    /// Size of the type in bits.
    pub fn size_in_bits(&self) -> u32 {
        match self {
            NpuDataType::UInt8 | NpuDataType::Int8 => 8,
            NpuDataType::UInt16 | NpuDataType::Int16 => 16,
            NpuDataType::Int32 => 32,
        }
    }

    /// Size of the type in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        self.size_in_bits() / 8
    }

    /// Smallest representable value.
    pub fn min_value(&self) -> i64 {
        if self.is_signed() {
            -(1 << (self.size_in_bits() - 1))
        } else {
            0
        }
    }

    /// Largest representable value.
    pub fn max_value(&self) -> i64 {
        if self.is_signed() {
            (1 << (self.size_in_bits() - 1)) - 1
        } else {
            (1 << self.size_in_bits()) - 1
        }
    }
}

/// A range of addresses within one memory region. The region index selects a
/// base address register that is set up at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NpuAddressRange {
    /// Memory region, 0-7.
    pub region: u8,
    /// Byte offset from the region's base address.
    pub address: u64,
    /// Length of the range in bytes.
    pub length: u64,
}

/// Addresses and dimensions of the tiles of a feature map. A feature map
/// uses 1 to 4 tiles; unused entries are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NpuTileBox {
    /// Height of tile 0.
    pub height_0: u32,
    /// Height of tile 1, 0 if unused.
    pub height_1: u32,
    /// Width of tiles 0 and 2.
    pub width_0: u32,
    /// One address per tile; unused addresses are 0.
    pub addresses: [u64; 4],
}

/// Shape of (part of) a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NpuShape3D {
    /// Height
    pub height: u32,
    /// Width
    pub width: u32,
    /// Depth
    pub depth: u32,
}

/// Quantization parameters of a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NpuQuantization {
    /// Scale; `None` when not applicable.
    pub scale_f32: Option<f32>,
    /// Zero point.
    pub zero_point: i64,
}

/// Padding applied around a convolution or pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NpuPadding {
    /// Rows of padding above
    pub top: u32,
    /// Columns of padding to the left
    pub left: u32,
    /// Rows of padding below
    pub bottom: u32,
    /// Columns of padding to the right
    pub right: u32,
}

/// An activation function fused with an NPU operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NpuActivation {
    /// The activation to perform.
    pub op: NpuActivationOp,
    /// Lower clamp, e.g. 0.0 for relu.
    pub min: Option<f32>,
    /// Upper clamp, e.g. 6.0 for relu6.
    pub max: Option<f32>,
    /// SHRAM slot of the lookup table, 0-7. Only used for table lookup.
    pub lookup_table_index: u8,
}

impl NpuActivation {
    /// Creates an activation of the given kind without clamping.
    pub fn new(op: NpuActivationOp) -> Self {
        NpuActivation {
            op,
            min: None,
            max: None,
            lookup_table_index: 0,
        }
    }
}

/// Basic information about an IFM, IFM2 or OFM.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NpuFeatureMap {
    /// Element type.
    pub data_type: NpuDataType,
    /// Memory region, 0-7.
    pub region: u8,
    /// Shape of the feature map.
    pub shape: NpuShape3D,
    /// The tiles that make up the feature map. With a single tile,
    /// `height_0`/`width_0` equal the shape and `addresses[1..]` are 0.
    pub tiles: NpuTileBox,
    /// Quantization parameters.
    pub quantization: Option<NpuQuantization>,
    /// Memory layout.
    pub layout: NpuLayout,
    /// Explicit strides; when `None` default strides are derived from the
    /// shape and layout.
    pub strides: Option<NpuShape3D>,
}

/// Kernel information for an NPU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpuKernel {
    /// Kernel width
    pub width: u32,
    /// Kernel height
    pub height: u32,
    /// Horizontal stride, at least 1
    pub stride_x: u32,
    /// Vertical stride, at least 1
    pub stride_y: u32,
    /// Horizontal dilation, at least 1
    pub dilation_x: u32,
    /// Vertical dilation, at least 1
    pub dilation_y: u32,
}

impl NpuKernel {
    /// Creates a kernel with the given size and stride, without dilation.
    ///
    /// # Panics
    ///
    /// Panics if a stride is zero.
    pub fn new(width: u32, height: u32, stride_x: u32, stride_y: u32) -> Self {
        assert!(stride_x > 0 && stride_y > 0);
        NpuKernel {
            width,
            height,
            stride_x,
            stride_y,
            dilation_x: 1,
            dilation_y: 1,
        }
    }
}

/// A DMA transfer between two address ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpuDmaOperation {
    /// Source of the transfer.
    pub src: NpuAddressRange,
    /// Destination of the transfer.
    pub dest: NpuAddressRange,
    /// DMA channel, usually 0 (the user channel).
    pub channel: u8,
    /// Channel mode, 0 = external, 1 = internal.
    pub mode: u8,
}

impl NpuDmaOperation {
    /// Creates a transfer on the user channel in external mode.
    pub fn new(src: NpuAddressRange, dest: NpuAddressRange) -> Self {
        NpuDmaOperation {
            src,
            dest,
            channel: 0,
            mode: 0,
        }
    }
}

/// Fields shared by all OFM-producing operations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NpuBlockOperation {
    /// Input feature map.
    pub ifm: Option<NpuFeatureMap>,
    /// Second input feature map of binary operations.
    pub ifm2: Option<NpuFeatureMap>,
    /// Non-quantized scalar operand; only set when IFM2 is a scalar.
    pub ifm2_scalar: Option<f32>,
    /// Output feature map.
    pub ofm: Option<NpuFeatureMap>,
    /// Kernel of the operation.
    pub kernel: Option<NpuKernel>,
    /// Encoded weights, one address range per NPU core; empty when the
    /// operation has no weights. Must have been produced by
    /// [`npu_encode_weights`].
    pub weights: Vec<NpuAddressRange>,
    /// Encoded biases, one address range per NPU core; empty when the
    /// operation has no bias. Must have been produced by
    /// [`npu_encode_bias`].
    pub biases: Vec<NpuAddressRange>,
    /// Padding around the input window.
    pub padding: Option<NpuPadding>,
    /// Fused activation.
    pub activation: Option<NpuActivation>,
    /// The unit of work in which the OFM is generated. If the operation has
    /// weights, the depth must equal the block depth the weights were
    /// encoded with. `None` lets the compiler choose.
    pub block_config: Option<NpuShape3D>,
    /// Rounding mode.
    pub rounding_mode: NpuRoundingMode,
    /// Set when the operation is fused with a quantize operation.
    pub fused_quantize: bool,
    /// IFM upscaling mode.
    pub ifm_upscale: NpuResamplingMode,
}

/// An NPU convolution operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NpuConv2DOperation {
    /// Shared block operation fields.
    pub block: NpuBlockOperation,
    /// Weight sub-kernel traversal; must match the traversal passed to
    /// [`npu_encode_weights`].
    pub block_traversal: NpuBlockTraversal,
}

/// An NPU depthwise convolution operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NpuConvDepthWiseOperation {
    /// Shared block operation fields.
    pub block: NpuBlockOperation,
}

/// An NPU pooling operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NpuPoolingOperation {
    /// Shared block operation fields.
    pub block: NpuBlockOperation,
    /// The pooling operation to perform.
    pub sub_op: NpuPoolingOp,
    /// Scaling for bilinear resize, else `None`.
    pub rescale: Option<f32>,
}

impl NpuPoolingOperation {
    /// Creates a pooling operation of the given sub-kind.
    pub fn new(sub_op: NpuPoolingOp) -> Self {
        NpuPoolingOperation {
            block: NpuBlockOperation::default(),
            sub_op,
            rescale: None,
        }
    }
}

/// An NPU elementwise operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NpuElementWiseOperation {
    /// Shared block operation fields.
    pub block: NpuBlockOperation,
    /// The elementwise operation to perform.
    pub sub_op: NpuElementWiseOp,
    /// Set when IFM2 is the first operand of a binary operation.
    pub reversed_operands: bool,
    /// Explicit `(scale, shift)` rescale, else `None`.
    pub rescale: Option<(i32, i32)>,
}

impl NpuElementWiseOperation {
    /// Creates an elementwise operation of the given sub-kind.
    pub fn new(sub_op: NpuElementWiseOp) -> Self {
        NpuElementWiseOperation {
            block: NpuBlockOperation::default(),
            sub_op,
            reversed_operands: false,
            rescale: None,
        }
    }
}

/// One operation in the high-level command list handed to
/// [`npu_generate_register_command_stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum NpuOperation {
    /// DMA transfer
    Dma(NpuDmaOperation),
    /// Convolution
    Conv2D(NpuConv2DOperation),
    /// Depthwise convolution
    ConvDepthWise(NpuConvDepthWiseOperation),
    /// Pooling
    Pooling(NpuPoolingOperation),
    /// Elementwise operation
    ElementWise(NpuElementWiseOperation),
}

impl NpuOperation {
    /// The shared block fields, for operations that have them.
    pub fn block(&self) -> Option<&NpuBlockOperation> {
        match self {
            NpuOperation::Dma(_) => None,
            NpuOperation::Conv2D(op) => Some(&op.block),
            NpuOperation::ConvDepthWise(op) => Some(&op.block),
            NpuOperation::Pooling(op) => Some(&op.block),
            NpuOperation::ElementWise(op) => Some(&op.block),
        }
    }
}

/// Encodes a weight volume into the accelerator's internal format.
///
/// `weights` is a rank-4 volume in OHWI layout. `dilation_xy` are the x/y
/// dilation factors, `ifm_bitdepth` the bit depth of the input feature map
/// (8 or 16), and `ofm_block_depth` the block depth that will later be used
/// to process the OFM. Depthwise weights and the block traversal must match
/// the operation the weights are used by.
pub fn npu_encode_weights(
    accelerator: NpuAccelerator,
    weights: &WeightVolume,
    dilation_xy: (u32, u32),
    ifm_bitdepth: u32,
    ofm_block_depth: u32,
    is_depthwise: bool,
    block_traversal: NpuBlockTraversal,
) -> Result<Vec<u8>, EncodeError> {
    let accel = Accelerator::from_npu_accelerator(accelerator);
    weights::encode_weights(
        accel,
        weights,
        dilation_xy,
        ifm_bitdepth,
        ofm_block_depth,
        is_depthwise,
        block_traversal,
    )
}

/// Packs a bias, scale and shift the way the hardware consumes them: a
/// 10-byte little-endian word laid out, low to high, as bias (40 bits),
/// scale (32 bits), shift (6 bits) and 2 zero bits.
pub fn npu_encode_bias(bias: i64, scale: u32, shift: u8) -> [u8; 10] {
    weights::encode_bias(bias, scale, shift)
}

/// Generates a register command stream for the given operations, inserting
/// wait barriers where commands depend on each other. Returns the stream as
/// 32-bit words.
pub fn npu_generate_register_command_stream(
    operations: &[NpuOperation],
    accelerator: NpuAccelerator,
) -> Result<Vec<u32>, StreamError> {
    let accel = Accelerator::from_npu_accelerator(accelerator);
    registers::generate_register_command_stream(operations, accel)
}

/// Wraps a register command stream into a driver payload: a driver header
/// identifying the accelerator followed by the stream, all little-endian.
/// The caller is responsible for placing the payload on a 16-byte aligned
/// address.
pub fn npu_create_driver_payload(
    register_command_stream: &[u32],
    accelerator: NpuAccelerator,
) -> Vec<u8> {
    let accel = Accelerator::from_npu_accelerator(accelerator);
    registers::create_driver_payload(register_command_stream, accel)
}
