//! Accelerator configurations.
//!
//! The compiler core only depends on a small slice of the hardware
//! configuration: the number of cores, the MACs available per cycle, and the
//! SHRAM geometry that the LUT allocator places lookup tables into.

use num_derive::{FromPrimitive, ToPrimitive};

use crate::api::NpuAccelerator;
use crate::consts::LUT_SLOT_COUNT;
use crate::consts::LUT_SLOT_SIZE;

/// Internal accelerator identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[allow(non_camel_case_types)]
pub enum Accelerator {
    /// U55 with 32 MACs/cycle
    U55_32 = 0,
    /// U55 with 64 MACs/cycle
    U55_64 = 1,
    /// U55 with 128 MACs/cycle
    U55_128 = 2,
    /// U55 with 256 MACs/cycle
    U55_256 = 3,
    /// U65 with 256 MACs/cycle
    U65_256 = 4,
    /// U65 with 512 MACs/cycle, dual core
    U65_512 = 5,
}

impl Accelerator {
    /// Maps a public API accelerator to the internal identifier.
    pub fn from_npu_accelerator(accel: NpuAccelerator) -> Self {
        match accel {
            NpuAccelerator::U55_32 => Accelerator::U55_32,
            NpuAccelerator::U55_64 => Accelerator::U55_64,
            NpuAccelerator::U55_128 => Accelerator::U55_128,
            NpuAccelerator::U55_256 => Accelerator::U55_256,
            NpuAccelerator::U65_256 => Accelerator::U65_256,
            NpuAccelerator::U65_512 => Accelerator::U65_512,
        }
    }
}

/// Size of one SHRAM bank in bytes.
pub const SHRAM_BANK_SIZE: u32 = 1024;

/// The hardware properties the core programs against.
#[derive(Debug, Clone)]
pub struct ArchitectureFeatures {
    /// The accelerator configuration.
    pub accelerator: Accelerator,
    /// Number of NPU cores.
    pub cores: u32,
    /// Multiply-accumulate units per cycle.
    pub macs_per_cycle: u32,
    /// Total SHRAM size in bytes.
    pub shram_size: u32,
    /// SHRAM banks that ordinary stripe commands never touch. When this is
    /// zero, a stripe may clobber the banks holding the lookup tables.
    pub shram_reserved_unused_banks: u32,
    /// Byte offset of the LUT region within SHRAM.
    pub shram_lut_address: u32,
    /// Size of the LUT region in bytes.
    pub shram_lut_size: u32,
}

impl ArchitectureFeatures {
    /// Looks up the configuration of the given accelerator.
    pub fn new(accelerator: Accelerator) -> Self {
        let (cores, macs_per_cycle, banks, reserved) = match accelerator {
            Accelerator::U55_32 => (1, 32, 16, 0),
            Accelerator::U55_64 => (1, 64, 16, 0),
            Accelerator::U55_128 => (1, 128, 24, 0),
            Accelerator::U55_256 => (1, 256, 48, 0),
            Accelerator::U65_256 => (1, 256, 48, 2),
            Accelerator::U65_512 => (2, 512, 64, 2),
        };
        let shram_size = banks * SHRAM_BANK_SIZE;
        let shram_lut_size = LUT_SLOT_COUNT * LUT_SLOT_SIZE;
        ArchitectureFeatures {
            accelerator,
            cores,
            macs_per_cycle,
            shram_size,
            shram_reserved_unused_banks: reserved,
            shram_lut_address: shram_size - shram_lut_size,
            shram_lut_size,
        }
    }
}
