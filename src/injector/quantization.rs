//! Fake-quantization emitter: crop to `[crop_low, crop_high]`, apply the
//! input affine and round to nearest-even, then optionally apply the output
//! affine to bring values back to the dequantized domain.
//!
//! Each of the three stages reads a (weights, bias) array pair through the
//! entry's data pointer; a pair shares one pointer-setup routine that folds
//! the channel index into whichever side is per-channel. Array offsets inside
//! the data block stay load-time displacements, so the two auxiliary GPRs
//! only ever hold channel-adjusted bases.

use std::collections::BTreeMap;

use iced_x86::code_asm::*;

use crate::isa::{IsaLevel, VectorWidth};
use crate::post_ops::{DataType, QuantAlg, QuantParam};
use crate::regmap::JitError;
use crate::vecasm::VecAsm;

use super::{ApplyParams, AuxDataParams, AuxRegParams, OcOffset, VecIndexSet};

#[derive(Clone, Copy)]
enum PairOp {
    CropClamp,
    Affine { round: bool },
}

pub struct QuantizationInjector {
    isa: IsaLevel,
    width: VectorWidth,
    alg: QuantAlg,
    crop_low: QuantParam,
    crop_high: QuantParam,
    input_scale: QuantParam,
    input_shift: QuantParam,
    output_scale: QuantParam,
    output_shift: QuantParam,
}

impl QuantizationInjector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        isa: IsaLevel,
        width: VectorWidth,
        alg: QuantAlg,
        crop_low: QuantParam,
        crop_high: QuantParam,
        input_scale: QuantParam,
        input_shift: QuantParam,
        output_scale: QuantParam,
        output_shift: QuantParam,
    ) -> Self {
        debug_assert!(width.is_legal_for(isa));
        Self {
            isa,
            width,
            alg,
            crop_low,
            crop_high,
            input_scale,
            input_shift,
            output_scale,
            output_shift,
        }
    }

    /// Bytes one entry occupies in the post-op data table.
    pub fn memory_step() -> usize {
        std::mem::size_of::<*const f32>()
    }

    pub fn does_dequantize(&self) -> bool {
        self.alg == QuantAlg::QuantizeDequantize
    }

    /// Whether the input affine stage must round. Rounding is skipped only
    /// when this op quantizes for good: last in the chain, integer
    /// destination, no output affine to undo the scaling.
    pub fn do_rounding(&self, dst_dt: DataType, is_last: bool) -> bool {
        self.does_dequantize() || dst_dt == DataType::F32 || !is_last
    }

    /// Point `reg_weights`/`reg_bias` at a stage's array pair, adjusted to
    /// the current channel on whichever side is per-channel.
    fn init_pair_ptrs(
        &self,
        asm: &mut CodeAssembler,
        aux_regs: &AuxRegParams,
        aux_data: &AuxDataParams,
        slot: usize,
        w_pc: bool,
        b_pc: bool,
    ) -> Result<(), JitError> {
        let w = aux_regs.reg_weights.reg64();
        let b = aux_regs.reg_bias.reg64();
        let cell = qword_ptr(aux_data.data_reg.reg64() + (slot * Self::memory_step()) as i32);
        asm.mov(w, cell)?;
        let oc = match aux_data.oc_offset {
            Some(OcOffset::Reg(r)) => Some((r.reg64(), false)),
            Some(OcOffset::Mem(base, disp)) => {
                asm.mov(b, qword_ptr(base.reg64() + disp))?;
                Some((b, true))
            }
            None => None,
        };
        if w_pc {
            if let Some((oc_r, _)) = oc {
                asm.lea(w, ptr(w + oc_r * 4))?;
            }
        }
        match (b_pc, oc) {
            (true, Some((oc_r, oc_in_bias))) => {
                if w_pc {
                    asm.mov(b, w)?;
                } else if oc_in_bias {
                    asm.lea(b, ptr(w + b * 4))?;
                } else {
                    asm.lea(b, ptr(w + oc_r * 4))?;
                }
            }
            _ => {
                if w_pc && oc.is_some() {
                    asm.mov(b, cell)?;
                } else {
                    asm.mov(b, w)?;
                }
            }
        }
        Ok(())
    }

    fn apply_one(
        &self,
        v: &mut VecAsm<'_>,
        idx: usize,
        aux_regs: &AuxRegParams,
        op: PairOp,
    ) -> Result<(), JitError> {
        match op {
            PairOp::CropClamp => {
                v.maxps(idx, idx, aux_regs.vec_weights)?;
                v.minps(idx, idx, aux_regs.vec_bias)
            }
            PairOp::Affine { round } => {
                v.fmadd213(idx, aux_regs.vec_weights, aux_regs.vec_bias)?;
                if round {
                    v.round_even(idx, idx)?;
                }
                Ok(())
            }
        }
    }

    /// One (weights, bias) stage across a register set. A shared parameter
    /// is a single scalar at its declared offset, loaded once up front; only
    /// a per-channel side moves with each register's channel window, and on
    /// the broadcast path registers sharing a byte offset share one load.
    fn compute_pair(
        &self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
        aux_regs: &AuxRegParams,
        apply: &ApplyParams,
        w_par: QuantParam,
        b_par: QuantParam,
        op: PairOp,
    ) -> Result<(), JitError> {
        let mut v = VecAsm::new(asm, self.isa, self.width);
        let w = aux_regs.reg_weights.reg64();
        let b = aux_regs.reg_bias.reg64();
        if !w_par.per_channel {
            v.broadcast_ss(aux_regs.vec_weights, ptr(w + w_par.offset as i32))?;
        }
        if !b_par.per_channel {
            v.broadcast_ss(aux_regs.vec_bias, ptr(b + b_par.offset as i32))?;
        }
        if !w_par.per_channel && !b_par.per_channel {
            for &idx in idxs {
                self.apply_one(&mut v, idx, aux_regs, op)?;
            }
            return Ok(());
        }
        if apply.broadcast {
            let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
            for &idx in idxs {
                let off = apply.aux.vec_byte_offsets.get(&idx).copied().unwrap_or(0);
                groups.entry(off).or_default().push(idx);
            }
            for (off, group) in &groups {
                if w_par.per_channel {
                    v.broadcast_ss(aux_regs.vec_weights, ptr(w + (w_par.offset + off) as i32))?;
                }
                if b_par.per_channel {
                    v.broadcast_ss(aux_regs.vec_bias, ptr(b + (b_par.offset + off) as i32))?;
                }
                for &idx in group {
                    self.apply_one(&mut v, idx, aux_regs, op)?;
                }
            }
        } else {
            for &idx in idxs {
                let off = apply.aux.vec_byte_offsets.get(&idx).copied().unwrap_or(0);
                if w_par.per_channel {
                    v.load(aux_regs.vec_weights, ptr(w + (w_par.offset + off) as i32))?;
                }
                if b_par.per_channel {
                    v.load(aux_regs.vec_bias, ptr(b + (b_par.offset + off) as i32))?;
                }
                self.apply_one(&mut v, idx, aux_regs, op)?;
            }
        }
        Ok(())
    }

    pub fn init_crop_ptrs(
        &self,
        asm: &mut CodeAssembler,
        aux_regs: &AuxRegParams,
        aux_data: &AuxDataParams,
        slot: usize,
    ) -> Result<(), JitError> {
        self.init_pair_ptrs(
            asm,
            aux_regs,
            aux_data,
            slot,
            self.crop_low.per_channel,
            self.crop_high.per_channel,
        )
    }

    pub fn compute_crop(
        &self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
        aux_regs: &AuxRegParams,
        apply: &ApplyParams,
    ) -> Result<(), JitError> {
        self.compute_pair(
            asm,
            idxs,
            aux_regs,
            apply,
            self.crop_low,
            self.crop_high,
            PairOp::CropClamp,
        )
    }

    pub fn init_input_scale_shift_ptrs(
        &self,
        asm: &mut CodeAssembler,
        aux_regs: &AuxRegParams,
        aux_data: &AuxDataParams,
        slot: usize,
    ) -> Result<(), JitError> {
        self.init_pair_ptrs(
            asm,
            aux_regs,
            aux_data,
            slot,
            self.input_scale.per_channel,
            self.input_shift.per_channel,
        )
    }

    pub fn compute_input_scale_shift(
        &self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
        aux_regs: &AuxRegParams,
        apply: &ApplyParams,
        round: bool,
    ) -> Result<(), JitError> {
        self.compute_pair(
            asm,
            idxs,
            aux_regs,
            apply,
            self.input_scale,
            self.input_shift,
            PairOp::Affine { round },
        )
    }

    pub fn init_output_scale_shift_ptrs(
        &self,
        asm: &mut CodeAssembler,
        aux_regs: &AuxRegParams,
        aux_data: &AuxDataParams,
        slot: usize,
    ) -> Result<(), JitError> {
        self.init_pair_ptrs(
            asm,
            aux_regs,
            aux_data,
            slot,
            self.output_scale.per_channel,
            self.output_shift.per_channel,
        )
    }

    pub fn compute_output_scale_shift(
        &self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
        aux_regs: &AuxRegParams,
        apply: &ApplyParams,
    ) -> Result<(), JitError> {
        self.compute_pair(
            asm,
            idxs,
            aux_regs,
            apply,
            self.output_scale,
            self.output_shift,
            PairOp::Affine { round: false },
        )
    }

    /// Crop, input affine (with the rounding decision applied), and the
    /// output affine when this op dequantizes. One data-table slot.
    pub fn emit(
        &self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
        aux_regs: &AuxRegParams,
        apply: &ApplyParams,
        slot: usize,
        is_last: bool,
    ) -> Result<(), JitError> {
        self.init_crop_ptrs(asm, aux_regs, &apply.aux, slot)?;
        self.compute_crop(asm, idxs, aux_regs, apply)?;
        self.init_input_scale_shift_ptrs(asm, aux_regs, &apply.aux, slot)?;
        let round = self.do_rounding(apply.dst_dt, is_last);
        self.compute_input_scale_shift(asm, idxs, aux_regs, apply, round)?;
        if self.does_dequantize() {
            self.init_output_scale_shift_ptrs(asm, aux_regs, &apply.aux, slot)?;
            self.compute_output_scale_shift(asm, idxs, aux_regs, apply)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regmap::Gpr;
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};

    fn injector(alg: QuantAlg) -> QuantizationInjector {
        QuantizationInjector::new(
            IsaLevel::Avx512Core,
            VectorWidth::Zmm,
            alg,
            QuantParam::per_channel(0),
            QuantParam::per_channel(64),
            QuantParam::per_channel(128),
            QuantParam::per_channel(192),
            QuantParam::shared(256),
            QuantParam::shared(260),
        )
    }

    fn aux_regs() -> AuxRegParams {
        AuxRegParams { reg_weights: Gpr::R14, reg_bias: Gpr::R15, vec_weights: 28, vec_bias: 29 }
    }

    fn decode_all(asm: &mut CodeAssembler) -> Vec<Instruction> {
        let bytes = asm.assemble(0x10_0000).unwrap();
        let mut decoder = Decoder::new(64, &bytes, DecoderOptions::NONE);
        let mut out = Vec::new();
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            out.push(instr);
        }
        out
    }

    fn count(instrs: &[Instruction], m: Mnemonic) -> usize {
        instrs.iter().filter(|i| i.mnemonic() == m).count()
    }

    #[test]
    fn rounding_decision() {
        let q = injector(QuantAlg::Quantize);
        assert!(!q.do_rounding(DataType::S8, true));
        assert!(q.do_rounding(DataType::S8, false));
        assert!(q.do_rounding(DataType::F32, true));
        let qdq = injector(QuantAlg::QuantizeDequantize);
        assert!(qdq.do_rounding(DataType::S8, true));
    }

    #[test]
    fn broadcast_groups_share_loads() {
        let q = injector(QuantAlg::Quantize);
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [2, 5].into_iter().collect();
        let mut apply = ApplyParams { broadcast: true, ..Default::default() };
        apply.aux.vec_byte_offsets = [(2, 0), (5, 0)].into_iter().collect();
        q.compute_crop(&mut asm, &idxs, &aux_regs(), &apply).unwrap();
        let instrs = decode_all(&mut asm);
        assert_eq!(count(&instrs, Mnemonic::Vbroadcastss), 2);
        assert_eq!(count(&instrs, Mnemonic::Vmaxps), 2);
        assert_eq!(count(&instrs, Mnemonic::Vminps), 2);
    }

    #[test]
    fn distinct_offsets_reload_per_group() {
        let q = injector(QuantAlg::Quantize);
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [2, 5].into_iter().collect();
        let mut apply = ApplyParams { broadcast: true, ..Default::default() };
        apply.aux.vec_byte_offsets = [(2, 0), (5, 4)].into_iter().collect();
        q.compute_crop(&mut asm, &idxs, &aux_regs(), &apply).unwrap();
        let instrs = decode_all(&mut asm);
        assert_eq!(count(&instrs, Mnemonic::Vbroadcastss), 4);
    }

    #[test]
    fn four_registers_three_offsets_three_passes() {
        // Offsets {0, 0, 4, 8}: the two offset-0 registers share one
        // broadcast pass, so the stage issues 3 passes, not 4. Each crop
        // pass loads two params.
        let q = injector(QuantAlg::Quantize);
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [1, 2, 3, 4].into_iter().collect();
        let mut apply = ApplyParams { broadcast: true, ..Default::default() };
        apply.aux.vec_byte_offsets = [(1, 0), (2, 0), (3, 4), (4, 8)].into_iter().collect();
        q.compute_crop(&mut asm, &idxs, &aux_regs(), &apply).unwrap();
        let instrs = decode_all(&mut asm);
        assert_eq!(count(&instrs, Mnemonic::Vbroadcastss), 6);
        assert_eq!(count(&instrs, Mnemonic::Vmaxps), 4);
        assert_eq!(count(&instrs, Mnemonic::Vminps), 4);
    }

    #[test]
    fn shared_params_ignore_vector_offsets() {
        // A shared parameter is one scalar at its declared offset; the
        // per-register channel windows must not leak into its load.
        let q = QuantizationInjector::new(
            IsaLevel::Avx512Core,
            VectorWidth::Zmm,
            QuantAlg::QuantizeDequantize,
            QuantParam::shared(0),
            QuantParam::shared(4),
            QuantParam::shared(8),
            QuantParam::shared(12),
            QuantParam::shared(16),
            QuantParam::shared(20),
        );
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [2, 5].into_iter().collect();
        let mut apply = ApplyParams { broadcast: true, ..Default::default() };
        apply.aux.vec_byte_offsets = [(2, 0), (5, 64)].into_iter().collect();
        q.emit(&mut asm, &idxs, &aux_regs(), &apply, 0, true).unwrap();
        let instrs = decode_all(&mut asm);
        let disps: Vec<u64> = instrs
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Vbroadcastss)
            .map(|i| i.memory_displacement64())
            .collect();
        assert_eq!(disps, vec![0, 4, 8, 12, 16, 20]);
        assert_eq!(count(&instrs, Mnemonic::Vmovups), 0);
    }

    #[test]
    fn linear_mode_loads_only_the_per_channel_side() {
        let q = QuantizationInjector::new(
            IsaLevel::Avx512Core,
            VectorWidth::Zmm,
            QuantAlg::Quantize,
            QuantParam::per_channel(0),
            QuantParam::shared(640),
            QuantParam::shared(644),
            QuantParam::shared(648),
            QuantParam::shared(652),
            QuantParam::shared(656),
        );
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [2, 5].into_iter().collect();
        let mut apply = ApplyParams { broadcast: false, ..Default::default() };
        apply.aux.vec_byte_offsets = [(2, 0), (5, 64)].into_iter().collect();
        q.compute_crop(&mut asm, &idxs, &aux_regs(), &apply).unwrap();
        let instrs = decode_all(&mut asm);
        let loads: Vec<u64> = instrs
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Vmovups)
            .map(|i| i.memory_displacement64())
            .collect();
        assert_eq!(loads, vec![0, 64]);
        let bcasts: Vec<u64> = instrs
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Vbroadcastss)
            .map(|i| i.memory_displacement64())
            .collect();
        assert_eq!(bcasts, vec![640]);
        assert_eq!(count(&instrs, Mnemonic::Vmaxps), 2);
        assert_eq!(count(&instrs, Mnemonic::Vminps), 2);
    }

    #[test]
    fn input_stage_rounds_only_when_asked() {
        let q = injector(QuantAlg::Quantize);
        let idxs: VecIndexSet = [1].into_iter().collect();
        let apply = ApplyParams { broadcast: true, ..Default::default() };

        let mut asm = CodeAssembler::new(64).unwrap();
        q.compute_input_scale_shift(&mut asm, &idxs, &aux_regs(), &apply, true).unwrap();
        assert_eq!(count(&decode_all(&mut asm), Mnemonic::Vrndscaleps), 1);

        let mut asm = CodeAssembler::new(64).unwrap();
        q.compute_input_scale_shift(&mut asm, &idxs, &aux_regs(), &apply, false).unwrap();
        assert_eq!(count(&decode_all(&mut asm), Mnemonic::Vrndscaleps), 0);
    }

    #[test]
    fn mixed_pair_reloads_base_for_shared_side() {
        // Per-channel weights with a shared bias: the weights register takes
        // the channel adjust, the bias register reloads the raw base.
        let q = QuantizationInjector::new(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            QuantAlg::Quantize,
            QuantParam::per_channel(0),
            QuantParam::shared(64),
            QuantParam::shared(0),
            QuantParam::shared(4),
            QuantParam::shared(8),
            QuantParam::shared(12),
        );
        let mut asm = CodeAssembler::new(64).unwrap();
        let aux_data = AuxDataParams {
            data_reg: Gpr::Rax,
            oc_offset: Some(OcOffset::Reg(Gpr::R9)),
            ..Default::default()
        };
        q.init_crop_ptrs(&mut asm, &aux_regs(), &aux_data, 3).unwrap();
        let instrs = decode_all(&mut asm);
        assert_eq!(instrs[0].mnemonic(), Mnemonic::Mov);
        assert_eq!(instrs[1].mnemonic(), Mnemonic::Lea);
        assert_eq!(instrs[1].memory_index(), Register::R9);
        assert_eq!(instrs[2].mnemonic(), Mnemonic::Mov);
        assert_eq!(instrs[2].memory_base(), Register::RAX);
        assert_eq!(instrs[2].memory_displacement64(), 24);
    }

    #[test]
    fn dequantize_adds_output_affine() {
        let q = injector(QuantAlg::QuantizeDequantize);
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [1].into_iter().collect();
        let apply = ApplyParams { broadcast: true, ..Default::default() };
        let aux_data = AuxDataParams {
            data_reg: Gpr::Rax,
            oc_offset: Some(OcOffset::Reg(Gpr::R9)),
            ..Default::default()
        };
        let apply = ApplyParams { aux: aux_data, ..apply };
        q.emit(&mut asm, &idxs, &aux_regs(), &apply, 0, true).unwrap();
        let instrs = decode_all(&mut asm);
        assert_eq!(count(&instrs, Mnemonic::Vfmadd213ps), 2);
        assert_eq!(count(&instrs, Mnemonic::Vmaxps), 1);
        assert_eq!(count(&instrs, Mnemonic::Vrndscaleps), 1);
    }
}
