//! Post-operation code emitters.
//!
//! One emitter type per post-op kind, plus the composite walker that applies
//! a whole [`crate::post_ops::PostOpList`] to a set of vector registers. The
//! emitters share two register-contract conventions:
//!
//! - static params fix the GPRs and helper vector indices an emitter may
//!   touch, chosen by the surrounding kernel when it plans its register map;
//! - dynamic params describe the current tile (per-register byte offsets,
//!   channel offset, tail shape) and change between application sites.

pub mod binary;
pub mod composite;
pub mod depthwise;
pub mod eltwise;
pub mod quantization;

use std::collections::{BTreeMap, BTreeSet};

use crate::post_ops::{DataType, DstLayout};
use crate::regmap::Gpr;

pub use binary::BinaryInjector;
pub use composite::{
    aux_vec_count, CompositeInjector, EltwiseKeying, InjectorFactory, LambdaInjector,
};
pub use depthwise::DepthwiseInjector;
pub use eltwise::EltwiseInjector;
pub use quantization::QuantizationInjector;

/// Ordered set of vector register indices an application pass covers.
pub type VecIndexSet = BTreeSet<usize>;

/// Register contract for element-wise emitters.
#[derive(Clone, Debug)]
pub struct EltwiseStaticParams {
    /// GPR clobbered with the constant-table address on every compute call.
    pub table_reg: Gpr,
    /// Opmask index for compare/blend sequences on mask-register levels.
    pub mask_reg: usize,
    /// Scratch vector indices. Must cover the algorithm's aux requirement.
    pub aux_vecs: Vec<usize>,
}

/// Register contract for binary/prelu emitters.
#[derive(Clone, Debug)]
pub struct BinaryStaticParams {
    /// GPR holding the kernel argument block.
    pub param_reg: Gpr,
    /// Byte offset of the rhs pointer table within the argument block.
    pub rhs_ptrs_offset: u32,
    /// GPR clobbered with rhs addresses.
    pub addr_reg: Gpr,
    /// Vector index the rhs operand is loaded into.
    pub helper_vec: usize,
    /// Extra scratch vector for the prelu select.
    pub prelu_helper_vec: usize,
    /// Lanes in a partial trailing vector, 0 when the tile is full.
    pub tail_size: usize,
    /// Opmask index guarding tail loads on mask-register levels.
    pub tail_opmask: usize,
    pub dst_layout: DstLayout,
}

/// Per-tile state for binary/prelu application.
#[derive(Clone, Debug, Default)]
pub struct BinaryDynParams {
    /// Byte offset into the rhs tensor per vector index (element-wise rhs).
    pub out_elem_offsets: BTreeMap<usize, u32>,
    /// Vector indices whose load covers only `tail_size` lanes.
    pub tail_lanes: VecIndexSet,
    /// GPR holding the current output-channel index, when a channel-indexed
    /// broadcast is in play.
    pub oc_offset: Option<Gpr>,
}

/// Register contract shared by the depthwise and quantization emitters:
/// two pointer GPRs and two helper vectors for weights/bias traffic.
#[derive(Clone, Copy, Debug)]
pub struct AuxRegParams {
    pub reg_weights: Gpr,
    pub reg_bias: Gpr,
    pub vec_weights: usize,
    pub vec_bias: usize,
}

/// Where the current output-channel index lives.
#[derive(Clone, Copy, Debug)]
pub enum OcOffset {
    Reg(Gpr),
    /// `[base + disp]`, loaded on demand.
    Mem(Gpr, i32),
}

/// Per-tile state for the data-pointer-backed emitters (depthwise and
/// quantization).
#[derive(Clone, Debug)]
pub struct AuxDataParams {
    /// Base of the per-op data pointer table. Defaults to the stack copy
    /// made by the push bracket.
    pub data_reg: Gpr,
    pub oc_offset: Option<OcOffset>,
    /// Additional per-vector byte offset into channel-indexed arrays.
    pub vec_byte_offsets: BTreeMap<usize, u32>,
}

impl Default for AuxDataParams {
    fn default() -> Self {
        Self { data_reg: Gpr::Rsp, oc_offset: None, vec_byte_offsets: BTreeMap::new() }
    }
}

/// Everything an application pass needs beyond the register set itself.
#[derive(Clone, Debug)]
pub struct ApplyParams {
    pub binary: BinaryDynParams,
    pub aux: AuxDataParams,
    /// Final storage type of the destination; decides whether quantization
    /// may skip its last rounding step.
    pub dst_dt: DataType,
    /// Load per-channel arrays with a single-value broadcast per register
    /// instead of a full-width vector load.
    pub broadcast: bool,
}

impl Default for ApplyParams {
    fn default() -> Self {
        Self {
            binary: BinaryDynParams::default(),
            aux: AuxDataParams::default(),
            dst_dt: DataType::F32,
            broadcast: false,
        }
    }
}
