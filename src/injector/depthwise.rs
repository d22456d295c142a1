//! Depthwise emitter: per-channel scale/shift and per-channel prelu driven
//! by weight (and bias) tensors reached through the post-op data table.
//!
//! Pointer setup and the vector math are split so a caller can hoist the
//! address arithmetic out of its own unrolled loop: `init_ptrs` runs once
//! per entry, `compute` once per value register.

use std::mem;

use iced_x86::code_asm::*;

use crate::isa::{IsaLevel, VectorWidth};
use crate::post_ops::DepthwiseAlg;
use crate::regmap::JitError;
use crate::vecasm::{emit_select_negative, VecAsm};

use super::{ApplyParams, AuxDataParams, AuxRegParams, OcOffset};

pub struct DepthwiseInjector {
    isa: IsaLevel,
    width: VectorWidth,
    alg: DepthwiseAlg,
    weights_offset: u32,
    bias_offset: u32,
}

impl DepthwiseInjector {
    pub fn new(
        isa: IsaLevel,
        width: VectorWidth,
        alg: DepthwiseAlg,
        weights_offset: u32,
        bias_offset: u32,
    ) -> Self {
        debug_assert!(width.is_legal_for(isa));
        Self { isa, width, alg, weights_offset, bias_offset }
    }

    /// Bytes one entry occupies in the post-op data table.
    pub fn memory_step() -> usize {
        mem::size_of::<*const f32>()
    }

    /// Point the auxiliary GPRs at this entry's weights (and, for
    /// scale/shift, biases), adjusted to the current channel.
    pub fn init_ptrs(
        &self,
        asm: &mut CodeAssembler,
        aux_regs: &AuxRegParams,
        aux_data: &AuxDataParams,
        slot: usize,
    ) -> Result<(), JitError> {
        let w = aux_regs.reg_weights.reg64();
        let b = aux_regs.reg_bias.reg64();
        asm.mov(w, qword_ptr(aux_data.data_reg.reg64() + (slot * Self::memory_step()) as i32))?;
        let oc = match aux_data.oc_offset {
            Some(OcOffset::Reg(r)) => Some(r.reg64()),
            Some(OcOffset::Mem(base, disp)) => {
                asm.mov(b, qword_ptr(base.reg64() + disp))?;
                Some(b)
            }
            None => None,
        };
        if let Some(oc) = oc {
            asm.lea(w, ptr(w + oc * 4))?;
        }
        if self.alg == DepthwiseAlg::ScaleShift {
            asm.lea(b, ptr(w + self.bias_offset as i32))?;
        }
        if self.weights_offset != 0 {
            asm.add(w, self.weights_offset as i32)?;
        }
        Ok(())
    }

    /// `dst[idx] = dst[idx] * w + b` (scale/shift) or the negative-lane
    /// multiply (prelu), with `w`/`b` taken from the prepared pointers.
    pub fn compute(
        &self,
        asm: &mut CodeAssembler,
        idx: usize,
        aux_regs: &AuxRegParams,
        apply: &ApplyParams,
    ) -> Result<(), JitError> {
        let mut v = VecAsm::new(asm, self.isa, self.width);
        let w = aux_regs.reg_weights.reg64();
        let b = aux_regs.reg_bias.reg64();
        let byte_off = apply.aux.vec_byte_offsets.get(&idx).copied().unwrap_or(0) as i32;

        if self.isa == IsaLevel::Sse41 && self.alg == DepthwiseAlg::Prelu {
            // Register 0 stages the weights on this path; its previous
            // contents are kept on the stack for the duration.
            debug_assert!(idx != 0 && aux_regs.vec_bias != 0);
            let staging = crate::regmap::xmm_reg(0)?;
            v.raw().sub(rsp, 16)?;
            v.raw().movups(xmmword_ptr(rsp), staging)?;
            if apply.broadcast {
                v.broadcast_ss(0, ptr(w + byte_off))?;
            } else {
                v.load(0, ptr(w + byte_off))?;
            }
            emit_select_negative(&mut v, idx, 0, aux_regs.vec_bias)?;
            v.raw().movups(staging, xmmword_ptr(rsp))?;
            v.raw().add(rsp, 16)?;
            return Ok(());
        }

        if apply.broadcast {
            v.broadcast_ss(aux_regs.vec_weights, ptr(w + byte_off))?;
        } else {
            v.load(aux_regs.vec_weights, ptr(w + byte_off))?;
        }
        match self.alg {
            DepthwiseAlg::ScaleShift => {
                if apply.broadcast {
                    v.broadcast_ss(aux_regs.vec_bias, ptr(b + byte_off))?;
                } else {
                    v.load(aux_regs.vec_bias, ptr(b + byte_off))?;
                }
                v.fmadd213(idx, aux_regs.vec_weights, aux_regs.vec_bias)
            }
            DepthwiseAlg::Prelu => {
                emit_select_negative(&mut v, idx, aux_regs.vec_weights, aux_regs.vec_bias)
            }
        }
    }
}
