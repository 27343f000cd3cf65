//! Weight and bias encoding.
//!
//! Weights are delivered to the hardware as one contiguous stream per core,
//! ordered the way the MAC engine consumes them: OFM-depth blocks outermost,
//! then the dilation sub-kernels in the requested traversal order. Biases
//! travel together with their rescale parameters in a packed 10-byte word.

use thiserror::Error;

use crate::api::NpuBlockTraversal;
use crate::arch::Accelerator;

/// Alignment of an encoded weight stream in bytes.
const WEIGHT_STREAM_ALIGNMENT: usize = 16;

/// An error raised while encoding weights.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The weight volume was not rank 4.
    #[error("weight volume must be rank 4 (OHWI), got rank {0}")]
    Rank(usize),
    /// The number of values did not match the volume shape.
    #[error("weight volume of shape {shape:?} needs {expected} values, got {got}")]
    ValueCount {
        /// The volume shape.
        shape: Vec<usize>,
        /// Values required by the shape.
        expected: usize,
        /// Values supplied.
        got: usize,
    },
    /// The IFM bit depth was not 8 or 16.
    #[error("ifm bit depth must be 8 or 16, got {0}")]
    IfmBitdepth(u32),
    /// A dilation factor was outside the supported range.
    #[error("dilation factors must be 1 or 2, got {0}x{1}")]
    Dilation(u32, u32),
    /// The OFM block depth was zero.
    #[error("ofm block depth must be at least 1")]
    BlockDepth,
}

/// A rank-4 weight volume in OHWI layout: output channels, kernel height,
/// kernel width, input channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightVolume {
    /// Extent of each dimension, OHWI order.
    pub shape: Vec<usize>,
    /// Quantized weight values in row-major OHWI order.
    pub values: Vec<i64>,
}

impl WeightVolume {
    /// Creates a volume, checking that the value count matches the shape.
    pub fn new(shape: &[usize], values: Vec<i64>) -> Result<Self, EncodeError> {
        if shape.len() != 4 {
            return Err(EncodeError::Rank(shape.len()));
        }
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(EncodeError::ValueCount {
                shape: shape.to_vec(),
                expected,
                got: values.len(),
            });
        }
        Ok(WeightVolume {
            shape: shape.to_vec(),
            values,
        })
    }

    fn at(&self, o: usize, y: usize, x: usize, i: usize) -> i64 {
        let (_, h, w, c) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        self.values[((o * h + y) * w + x) * c + i]
    }
}

/// Encodes a weight volume into the stream format the accelerator reads.
///
/// The kernel is decomposed into `dilation_y * dilation_x` sub-kernels, so
/// the hardware can step through a dilated convolution without address
/// arithmetic. Output channels are grouped into blocks of `ofm_block_depth`;
/// depth-first traversal walks a whole channel before moving to the next
/// sub-kernel, part-kernel-first walks a sub-kernel across all channels of
/// the block.
pub fn encode_weights(
    accelerator: Accelerator,
    weights: &WeightVolume,
    dilation_xy: (u32, u32),
    ifm_bitdepth: u32,
    ofm_block_depth: u32,
    is_depthwise: bool,
    block_traversal: NpuBlockTraversal,
) -> Result<Vec<u8>, EncodeError> {
    let _ = accelerator;
    if weights.shape.len() != 4 {
        return Err(EncodeError::Rank(weights.shape.len()));
    }
    if !matches!(ifm_bitdepth, 8 | 16) {
        return Err(EncodeError::IfmBitdepth(ifm_bitdepth));
    }
    let (dilation_x, dilation_y) = dilation_xy;
    if !(1..=2).contains(&dilation_x) || !(1..=2).contains(&dilation_y) {
        return Err(EncodeError::Dilation(dilation_x, dilation_y));
    }
    if ofm_block_depth == 0 {
        return Err(EncodeError::BlockDepth);
    }

    let ofm_depth = weights.shape[0];
    let kernel_height = weights.shape[1];
    let kernel_width = weights.shape[2];
    let ifm_depth = weights.shape[3];

    // Depthwise kernels traverse depth-first regardless of the request.
    let traversal = if is_depthwise {
        NpuBlockTraversal::DepthFirst
    } else {
        block_traversal
    };

    let subkernels = subkernel_positions(
        kernel_height,
        kernel_width,
        dilation_y as usize,
        dilation_x as usize,
    );

    let mut stream = Vec::with_capacity(weights.values.len());
    for block_start in (0..ofm_depth).step_by(ofm_block_depth as usize) {
        let block_end = (block_start + ofm_block_depth as usize).min(ofm_depth);
        match traversal {
            NpuBlockTraversal::DepthFirst => {
                for o in block_start..block_end {
                    for subkernel in &subkernels {
                        for &(y, x) in subkernel {
                            for i in 0..ifm_depth {
                                stream.push(weights.at(o, y, x, i) as u8);
                            }
                        }
                    }
                }
            }
            NpuBlockTraversal::PartKernelFirst => {
                for subkernel in &subkernels {
                    for &(y, x) in subkernel {
                        for o in block_start..block_end {
                            for i in 0..ifm_depth {
                                stream.push(weights.at(o, y, x, i) as u8);
                            }
                        }
                    }
                }
            }
        }
    }

    while stream.len() % WEIGHT_STREAM_ALIGNMENT != 0 {
        stream.push(0);
    }
    Ok(stream)
}

/// Groups kernel positions into dilation sub-kernels: sub-kernel `(sy, sx)`
/// holds every position congruent to it modulo the dilation factors.
fn subkernel_positions(
    height: usize,
    width: usize,
    dilation_y: usize,
    dilation_x: usize,
) -> Vec<Vec<(usize, usize)>> {
    let mut subkernels = Vec::with_capacity(dilation_y * dilation_x);
    for sy in 0..dilation_y {
        for sx in 0..dilation_x {
            let mut positions = Vec::new();
            let mut y = sy;
            while y < height {
                let mut x = sx;
                while x < width {
                    positions.push((y, x));
                    x += dilation_x;
                }
                y += dilation_y;
            }
            subkernels.push(positions);
        }
    }
    subkernels
}

/// Packs a bias and its rescale into the 10-byte word the hardware reads:
/// low to high, bias (40 bits), scale (32 bits), shift (6 bits), 2 zero
/// bits. Little-endian.
pub fn encode_bias(bias: i64, scale: u32, shift: u8) -> [u8; 10] {
    let mut word = (bias as u128) & ((1u128 << 40) - 1);
    word |= u128::from(scale) << 40;
    word |= u128::from(shift & 0x3F) << 72;
    word.to_le_bytes()[..10].try_into().unwrap()
}

/// Unpacks a word produced by [`encode_bias`]. The 40-bit bias is sign
/// extended.
pub fn decode_bias(word: &[u8; 10]) -> (i64, u32, u8) {
    let mut bytes = [0u8; 16];
    bytes[..10].copy_from_slice(word);
    let value = u128::from_le_bytes(bytes);
    let mut bias = (value & ((1 << 40) - 1)) as i64;
    if bias & (1 << 39) != 0 {
        bias -= 1 << 40;
    }
    let scale = ((value >> 40) & 0xFFFF_FFFF) as u32;
    let shift = ((value >> 72) & 0x3F) as u8;
    (bias, scale, shift)
}
