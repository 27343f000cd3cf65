//! Register command stream generation and driver payload packaging.
//!
//! The stream is a sequence of 32-bit words. A `cmd0` command is a single
//! word holding a command code in the low half and a 16-bit immediate in the
//! high half; a `cmd1` command is a command word followed by one 32-bit
//! payload word. Every operation is lowered to its setup commands followed
//! by a kick command; wait barriers are inserted where a command consumes
//! the result of an earlier one.

use thiserror::Error;

use crate::api::{
    NpuActivationOp, NpuBlockTraversal, NpuFeatureMap, NpuLayout, NpuOperation, NpuRoundingMode,
    API_VERSION_MAJOR, API_VERSION_MINOR,
};
use crate::arch::{Accelerator, ArchitectureFeatures};
use num_traits::ToPrimitive;

// Kick commands (cmd0).
const NPU_OP_STOP: u32 = 0x000;
const NPU_OP_CONV: u32 = 0x002;
const NPU_OP_DEPTHWISE: u32 = 0x003;
const NPU_OP_POOL: u32 = 0x005;
const NPU_OP_ELEMENTWISE: u32 = 0x006;
const NPU_OP_DMA_START: u32 = 0x010;
const NPU_OP_DMA_WAIT: u32 = 0x011;

// Feature-map setup (cmd0). The OFM registers are the IFM registers offset
// by 0x40, the IFM2 registers by 0x80.
const NPU_SET_IFM_REGION: u32 = 0x100;
const NPU_SET_IFM_HEIGHT0_M1: u32 = 0x101;
const NPU_SET_IFM_WIDTH0_M1: u32 = 0x102;
const NPU_SET_IFM_DEPTH_M1: u32 = 0x103;
const NPU_SET_IFM_ZERO_POINT: u32 = 0x104;
const NPU_SET_IFM_LAYOUT: u32 = 0x105;
const OFM_REGISTER_OFFSET: u32 = 0x40;
const IFM2_REGISTER_OFFSET: u32 = 0x80;

// Kernel and padding setup (cmd0).
const NPU_SET_KERNEL_WIDTH_M1: u32 = 0x200;
const NPU_SET_KERNEL_HEIGHT_M1: u32 = 0x201;
const NPU_SET_KERNEL_STRIDE: u32 = 0x202;
const NPU_SET_PAD_TOP: u32 = 0x210;
const NPU_SET_PAD_LEFT: u32 = 0x211;
const NPU_SET_PAD_BOTTOM: u32 = 0x212;
const NPU_SET_PAD_RIGHT: u32 = 0x213;

// Operation configuration (cmd0).
const NPU_SET_ACTIVATION: u32 = 0x220;
const NPU_SET_ROUNDING_MODE: u32 = 0x221;
const NPU_SET_BLOCK_TRAVERSAL: u32 = 0x222;
const NPU_SET_UPSCALE: u32 = 0x223;
const NPU_SET_BLOCKDEP: u32 = 0x224;

// Address setup (cmd1, payload follows).
const NPU_SET_IFM_BASE0: u32 = 0x400;
const NPU_SET_IFM2_BASE0: u32 = 0x404;
const NPU_SET_OFM_BASE0: u32 = 0x408;
const NPU_SET_WEIGHT_BASE: u32 = 0x40C;
const NPU_SET_WEIGHT_LENGTH: u32 = 0x40D;
const NPU_SET_SCALE_BASE: u32 = 0x40E;
const NPU_SET_SCALE_LENGTH: u32 = 0x40F;
const NPU_SET_DMA0_SRC_REGION: u32 = 0x410;
const NPU_SET_DMA0_SRC: u32 = 0x411;
const NPU_SET_DMA0_DST_REGION: u32 = 0x412;
const NPU_SET_DMA0_DST: u32 = 0x413;
const NPU_SET_DMA0_LEN: u32 = 0x414;

/// Fourcc at the start of a driver payload.
const DRIVER_FOURCC: &[u8; 4] = b"COP1";

/// An error raised while generating a register command stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// A required descriptor field was missing.
    #[error("operation {index} is missing its {what}")]
    Missing {
        /// Index of the operation in the input list.
        index: usize,
        /// Name of the missing field.
        what: &'static str,
    },
    /// A memory region index was outside 0-7.
    #[error("operation {index} uses memory region {region}, valid regions are 0-7")]
    Region {
        /// Index of the operation in the input list.
        index: usize,
        /// The offending region.
        region: u8,
    },
    /// More per-core weight or bias ranges than the accelerator has cores.
    #[error("operation {index} carries {ranges} weight ranges, accelerator has {cores} cores")]
    CoreCount {
        /// Index of the operation in the input list.
        index: usize,
        /// Ranges supplied.
        ranges: usize,
        /// Cores available.
        cores: u32,
    },
}

struct StreamBuilder {
    words: Vec<u32>,
    outstanding_dma: bool,
}

impl StreamBuilder {
    fn new() -> Self {
        StreamBuilder {
            words: Vec::new(),
            outstanding_dma: false,
        }
    }

    fn cmd0(&mut self, code: u32, param: u16) {
        self.words.push(code | (u32::from(param) << 16));
    }

    fn cmd1(&mut self, code: u32, payload: u32) {
        self.words.push(code);
        self.words.push(payload);
    }

    fn feature_map(
        &mut self,
        fm: &NpuFeatureMap,
        register_offset: u32,
        base_register: u32,
        index: usize,
    ) -> Result<(), StreamError> {
        if fm.region > 7 {
            return Err(StreamError::Region {
                index,
                region: fm.region,
            });
        }
        self.cmd0(NPU_SET_IFM_REGION + register_offset, u16::from(fm.region));
        self.cmd0(
            NPU_SET_IFM_HEIGHT0_M1 + register_offset,
            fm.tiles.height_0.max(fm.shape.height).saturating_sub(1) as u16,
        );
        self.cmd0(
            NPU_SET_IFM_WIDTH0_M1 + register_offset,
            fm.tiles.width_0.max(fm.shape.width).saturating_sub(1) as u16,
        );
        self.cmd0(
            NPU_SET_IFM_DEPTH_M1 + register_offset,
            fm.shape.depth.saturating_sub(1) as u16,
        );
        let zero_point = fm.quantization.map(|q| q.zero_point).unwrap_or(0);
        self.cmd0(NPU_SET_IFM_ZERO_POINT + register_offset, zero_point as u16);
        let layout = match fm.layout {
            NpuLayout::Nhwc => 0,
            NpuLayout::Nhcwb16 => 1,
        };
        self.cmd0(NPU_SET_IFM_LAYOUT + register_offset, layout);
        for (slot, &address) in fm.tiles.addresses.iter().enumerate() {
            self.cmd1(base_register + slot as u32, address as u32);
        }
        Ok(())
    }

    fn block_common(
        &mut self,
        op: &NpuOperation,
        index: usize,
    ) -> Result<(), StreamError> {
        let block = op.block().expect("kick emitted for a non-block operation");
        let ifm = block
            .ifm
            .as_ref()
            .ok_or(StreamError::Missing { index, what: "IFM" })?;
        let ofm = block
            .ofm
            .as_ref()
            .ok_or(StreamError::Missing { index, what: "OFM" })?;
        self.feature_map(ifm, 0, NPU_SET_IFM_BASE0, index)?;
        self.feature_map(ofm, OFM_REGISTER_OFFSET, NPU_SET_OFM_BASE0, index)?;
        if let Some(ifm2) = &block.ifm2 {
            self.feature_map(ifm2, IFM2_REGISTER_OFFSET, NPU_SET_IFM2_BASE0, index)?;
        }

        if let Some(kernel) = &block.kernel {
            self.cmd0(NPU_SET_KERNEL_WIDTH_M1, (kernel.width - 1) as u16);
            self.cmd0(NPU_SET_KERNEL_HEIGHT_M1, (kernel.height - 1) as u16);
            // Strides and dilations share one register, 3 bits each.
            let stride = (kernel.stride_x - 1)
                | ((kernel.stride_y - 1) << 3)
                | ((kernel.dilation_x - 1) << 6)
                | ((kernel.dilation_y - 1) << 9);
            self.cmd0(NPU_SET_KERNEL_STRIDE, stride as u16);
        }
        if let Some(padding) = &block.padding {
            self.cmd0(NPU_SET_PAD_TOP, padding.top as u16);
            self.cmd0(NPU_SET_PAD_LEFT, padding.left as u16);
            self.cmd0(NPU_SET_PAD_BOTTOM, padding.bottom as u16);
            self.cmd0(NPU_SET_PAD_RIGHT, padding.right as u16);
        }
        for (core, range) in block.weights.iter().enumerate() {
            self.cmd1(
                NPU_SET_WEIGHT_BASE + 2 * core as u32,
                range.address as u32,
            );
            self.cmd1(NPU_SET_WEIGHT_LENGTH + 2 * core as u32, range.length as u32);
        }
        for (core, range) in block.biases.iter().enumerate() {
            self.cmd1(NPU_SET_SCALE_BASE + 2 * core as u32, range.address as u32);
            self.cmd1(NPU_SET_SCALE_LENGTH + 2 * core as u32, range.length as u32);
        }
        if let Some(act) = &block.activation {
            let function = match act.op {
                NpuActivationOp::NoneOrRelu => 0,
                NpuActivationOp::Tanh => 3,
                NpuActivationOp::Sigmoid => 4,
                NpuActivationOp::TableLookup => 0x10 + u16::from(act.lookup_table_index),
            };
            self.cmd0(NPU_SET_ACTIVATION, function);
        }
        let rounding = match block.rounding_mode {
            NpuRoundingMode::Tfl => 0,
            NpuRoundingMode::Truncate => 1,
            NpuRoundingMode::Natural => 2,
        };
        self.cmd0(NPU_SET_ROUNDING_MODE, rounding);
        let upscale = block.ifm_upscale as u16;
        self.cmd0(NPU_SET_UPSCALE, upscale);
        if let Some(block_config) = &block.block_config {
            self.cmd0(NPU_SET_BLOCKDEP, block_config.depth as u16);
        }
        Ok(())
    }

    fn kick(&mut self, code: u32, param: u16) {
        if self.outstanding_dma && code != NPU_OP_DMA_START {
            self.cmd0(NPU_OP_DMA_WAIT, 0);
            self.outstanding_dma = false;
        }
        self.cmd0(code, param);
    }
}

/// Generates a register command stream for the given operations. Wait
/// barriers are inserted before the first compute command that follows an
/// outstanding DMA. The stream is terminated with a stop command.
pub fn generate_register_command_stream(
    operations: &[NpuOperation],
    accelerator: Accelerator,
) -> Result<Vec<u32>, StreamError> {
    let arch = ArchitectureFeatures::new(accelerator);
    let mut builder = StreamBuilder::new();
    for (index, op) in operations.iter().enumerate() {
        if let Some(block) = op.block() {
            let ranges = block.weights.len().max(block.biases.len());
            if ranges > arch.cores as usize {
                return Err(StreamError::CoreCount {
                    index,
                    ranges,
                    cores: arch.cores,
                });
            }
        }
        match op {
            NpuOperation::Dma(dma) => {
                for range in [&dma.src, &dma.dest] {
                    if range.region > 7 {
                        return Err(StreamError::Region {
                            index,
                            region: range.region,
                        });
                    }
                }
                builder.cmd1(NPU_SET_DMA0_SRC_REGION, u32::from(dma.src.region));
                builder.cmd1(NPU_SET_DMA0_SRC, dma.src.address as u32);
                builder.cmd1(NPU_SET_DMA0_DST_REGION, u32::from(dma.dest.region));
                builder.cmd1(NPU_SET_DMA0_DST, dma.dest.address as u32);
                builder.cmd1(NPU_SET_DMA0_LEN, dma.src.length as u32);
                builder.kick(NPU_OP_DMA_START, u16::from(dma.channel));
                builder.outstanding_dma = true;
            }
            NpuOperation::Conv2D(conv) => {
                builder.block_common(op, index)?;
                let traversal = match conv.block_traversal {
                    NpuBlockTraversal::DepthFirst => 0,
                    NpuBlockTraversal::PartKernelFirst => 1,
                };
                builder.cmd0(NPU_SET_BLOCK_TRAVERSAL, traversal);
                builder.kick(NPU_OP_CONV, 0);
            }
            NpuOperation::ConvDepthWise(_) => {
                builder.block_common(op, index)?;
                builder.kick(NPU_OP_DEPTHWISE, 0);
            }
            NpuOperation::Pooling(pool) => {
                builder.block_common(op, index)?;
                builder.kick(NPU_OP_POOL, pool.sub_op as u16);
            }
            NpuOperation::ElementWise(elem) => {
                builder.block_common(op, index)?;
                builder.kick(NPU_OP_ELEMENTWISE, elem.sub_op as u16);
            }
        }
    }
    builder.cmd0(NPU_OP_STOP, 0xFFFF);
    Ok(builder.words)
}

/// Wraps a register command stream into a driver payload. The header is four
/// little-endian words: the `COP1` fourcc, the API version, a configuration
/// word identifying the accelerator, and the stream length in words; the
/// stream follows.
pub fn create_driver_payload(register_command_stream: &[u32], accelerator: Accelerator) -> Vec<u8> {
    let arch = ArchitectureFeatures::new(accelerator);
    let config = accelerator.to_u32().unwrap()
        | (arch.cores << 8)
        | (arch.macs_per_cycle << 12);
    let mut payload = Vec::with_capacity(16 + register_command_stream.len() * 4);
    payload.extend_from_slice(DRIVER_FOURCC);
    payload.extend_from_slice(&((API_VERSION_MAJOR << 16) | API_VERSION_MINOR).to_le_bytes());
    payload.extend_from_slice(&config.to_le_bytes());
    payload.extend_from_slice(&(register_command_stream.len() as u32).to_le_bytes());
    for word in register_command_stream {
        payload.extend_from_slice(&word.to_le_bytes());
    }
    payload
}
