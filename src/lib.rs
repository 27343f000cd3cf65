//! enpu is the core of a compiler that lowers quantized neural-network
//! graphs onto a fixed-function NPU.
//!
//! Given a parsed subgraph, the crate decides per operator whether it can
//! run on the NPU ([`check`]), fuses compatible operators into placed
//! passes ([`pack`]), assigns SHRAM slots to activation lookup tables and
//! drops redundant DMA transfers ([`lut`]), and exposes the hardware-shaped
//! descriptors and entry points an assembler uses to produce register
//! command streams and driver payloads ([`api`]).
//!
//! # Limitations
//!
//! The crate does not parse model files and does not plan feature-map
//! memory; callers construct the [`graph::Graph`] themselves and allocate
//! tensor addresses outside the SHRAM LUT region.
//!
//! # Examples
//!
//! See [`check`] and [`pack`].

#![warn(missing_docs)]

pub mod api;
pub mod arch;
pub mod check;
mod consts;
pub mod graph;
pub mod lut;
pub mod pack;
pub mod registers;
pub mod weights;

pub use flagset;

pub use consts::{
    DataType, MemArea, NpuBlockType, OpKind, Padding, PassFlags, TensorPurpose, LUT_SLOT_COUNT,
    LUT_SLOT_SIZE,
};

#[doc(inline)]
pub use check::{annotate_graph, SupportedOperators};
#[doc(inline)]
pub use graph::{Graph, Operation, Tensor};
#[doc(inline)]
pub use pack::{pack_into_passes, Pass, PassPlacement, Schedule};
