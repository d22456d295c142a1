//! Binary and prelu emitter: loads a right-hand-side operand from a
//! caller-provided tensor and combines it into the value register.
//!
//! The rhs pointer table is reached through the kernel argument block; each
//! slot-consuming post-op owns one slot, in list order. Broadcast shape
//! decides the load: one value for the tensor, one per channel, or a full
//! element-wise vector. Channel-repeated-over-spatial collapses to the
//! per-channel load here; the repetition is the caller's loop structure.

use iced_x86::code_asm::*;

use crate::isa::{IsaLevel, VectorWidth};
use crate::post_ops::{BinaryAlg, BroadcastStrategy, DataType, DstLayout};
use crate::regmap::JitError;
use crate::vecasm::{emit_select_negative, VecAsm};

use super::{BinaryDynParams, BinaryStaticParams};

pub struct BinaryInjector {
    isa: IsaLevel,
    width: VectorWidth,
    params: BinaryStaticParams,
}

impl BinaryInjector {
    /// Whether this (isa, broadcast, data type) combination has an emitter.
    /// Only f32 operands are loaded; element-wise rhs needs the VEX levels.
    pub fn is_supported(isa: IsaLevel, broadcast: BroadcastStrategy, dt: DataType) -> bool {
        if dt != DataType::F32 {
            return false;
        }
        match broadcast {
            BroadcastStrategy::Scalar | BroadcastStrategy::PerChannel => true,
            BroadcastStrategy::PerChannelSpatial | BroadcastStrategy::NoBroadcast => {
                isa.is_superset(IsaLevel::Avx)
            }
        }
    }

    pub fn new(
        isa: IsaLevel,
        width: VectorWidth,
        params: BinaryStaticParams,
    ) -> Result<Self, JitError> {
        assert!(
            params.dst_layout != DstLayout::Any,
            "destination layout must be resolved before code generation"
        );
        debug_assert!(params.helper_vec != params.prelu_helper_vec);
        debug_assert!(params.tail_size < width.f32_lanes());
        if params.tail_size > 0 && isa.has_mask_regs() {
            crate::regmap::kmask_reg(params.tail_opmask)?;
        }
        Ok(Self { isa, width, params })
    }

    pub fn tail_opmask(&self) -> usize {
        self.params.tail_opmask
    }

    pub fn tail_size(&self) -> usize {
        self.params.tail_size
    }

    /// Load the rhs operand for `slot` into the helper vector.
    fn load_rhs(
        &self,
        v: &mut VecAsm<'_>,
        broadcast: BroadcastStrategy,
        slot: usize,
        idx: usize,
        dp: &BinaryDynParams,
    ) -> Result<(), JitError> {
        let h = self.params.helper_vec;
        let p = self.params.param_reg.reg64();
        let a = self.params.addr_reg.reg64();
        v.raw().mov(a, qword_ptr(p + self.params.rhs_ptrs_offset as i32))?;
        v.raw().mov(a, qword_ptr(a + (slot * 8) as i32))?;
        match broadcast {
            BroadcastStrategy::Scalar => v.broadcast_ss(h, ptr(a))?,
            BroadcastStrategy::PerChannel | BroadcastStrategy::PerChannelSpatial => {
                match dp.oc_offset {
                    Some(oc) => v.broadcast_ss(h, ptr(a + oc.reg64() * 4))?,
                    None => v.broadcast_ss(h, ptr(a))?,
                }
            }
            BroadcastStrategy::NoBroadcast => {
                let off = dp.out_elem_offsets.get(&idx).copied().unwrap_or(0) as i32;
                if dp.tail_lanes.contains(&idx) && self.params.tail_size > 0 {
                    if !self.isa.has_mask_regs() {
                        return Err(JitError::Unsupported(
                            "element-wise rhs tail below the mask-register levels".into(),
                        ));
                    }
                    v.load_tail(h, ptr(a + off), self.params.tail_opmask)?;
                } else {
                    v.load(h, ptr(a + off))?;
                }
            }
        }
        Ok(())
    }

    /// `dst[idx] = alg(dst[idx], rhs)`.
    pub fn compute_binary(
        &self,
        asm: &mut CodeAssembler,
        alg: BinaryAlg,
        broadcast: BroadcastStrategy,
        slot: usize,
        idx: usize,
        dp: &BinaryDynParams,
    ) -> Result<(), JitError> {
        if !Self::is_supported(self.isa, broadcast, DataType::F32) {
            return Err(JitError::Unsupported(format!(
                "binary broadcast {broadcast:?} not emittable at {:?}",
                self.isa
            )));
        }
        let mut v = VecAsm::new(asm, self.isa, self.width);
        self.load_rhs(&mut v, broadcast, slot, idx, dp)?;
        let h = self.params.helper_vec;
        match alg {
            BinaryAlg::Add => v.addps(idx, idx, h),
            BinaryAlg::Sub => v.subps(idx, idx, h),
            BinaryAlg::Mul => v.mulps(idx, idx, h),
            BinaryAlg::Div => v.divps(idx, idx, h),
            BinaryAlg::Max => v.maxps(idx, idx, h),
            BinaryAlg::Min => v.minps(idx, idx, h),
        }
    }

    /// `dst[idx] = dst[idx] >= 0 ? dst[idx] : dst[idx] * rhs`.
    pub fn compute_prelu(
        &self,
        asm: &mut CodeAssembler,
        broadcast: BroadcastStrategy,
        slot: usize,
        idx: usize,
        dp: &BinaryDynParams,
    ) -> Result<(), JitError> {
        if !Self::is_supported(self.isa, broadcast, DataType::F32) {
            return Err(JitError::Unsupported(format!(
                "prelu broadcast {broadcast:?} not emittable at {:?}",
                self.isa
            )));
        }
        let mut v = VecAsm::new(asm, self.isa, self.width);
        self.load_rhs(&mut v, broadcast, slot, idx, dp)?;
        emit_select_negative(&mut v, idx, self.params.helper_vec, self.params.prelu_helper_vec)
    }
}
