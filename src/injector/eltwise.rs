//! Element-wise activation emitter.
//!
//! Scalar parameters and polynomial coefficients live in a per-injector
//! constant table placed after the kernel body; compute sequences reach it
//! RIP-relative through the caller-assigned table GPR. The polynomial
//! algorithms share one exp core: range reduction with a Cody-Waite split
//! of ln2, a degree-5 Horner polynomial, and exponent reconstruction through
//! the integer lanes.

use std::collections::BTreeMap;

use iced_x86::code_asm::*;

use crate::isa::{IsaLevel, VectorWidth};
use crate::post_ops::EltwiseAlg;
use crate::regmap::{Gpr, JitError};
use crate::vecasm::{emit_select_negative, VecAsm};

use super::{EltwiseStaticParams, VecIndexSet};

const EXP_CLAMP_LO: f32 = -88.376_26;
const EXP_CLAMP_HI: f32 = 88.376_26;
const EXP_LOG2E: f32 = 1.442_695_040_888_963_4;
// ln2 split: x - k*ln2 computed as x + k*C1 + k*C2
const EXP_C1: f32 = -0.693_359_375;
const EXP_C2: f32 = 2.121_944_4e-4;
const EXP_P0: f32 = 1.987_569_15e-4;
const EXP_P1: f32 = 1.398_199_950_7e-3;
const EXP_P2: f32 = 8.333_451_907_3e-3;
const EXP_P3: f32 = 4.166_579_589_4e-2;
const EXP_P4: f32 = 1.666_666_545_9e-1;
const EXP_P5: f32 = 5.000_000_120_1e-1;
// 2^23 exponent bias, broadcast as float and converted alongside k
const EXP_MAGIC127: f32 = 127.0;
const GELU_SQRT_2_OVER_PI: f32 = 0.797_884_560_802_865_4;
const GELU_FIT: f32 = 0.044_715;

/// Constant-table slots. One table entry per key actually used by the
/// configured algorithm.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum TblKey {
    Alpha,
    Beta,
    One,
    Two,
    Half,
    NegTwo,
    SignMask,
    AbsMask,
    ExpClampLo,
    ExpClampHi,
    ExpLog2e,
    ExpC1,
    ExpC2,
    ExpP0,
    ExpP1,
    ExpP2,
    ExpP3,
    ExpP4,
    ExpP5,
    ExpMagic,
    GeluC0,
    GeluC1,
}

pub struct EltwiseInjector {
    isa: IsaLevel,
    width: VectorWidth,
    alg: EltwiseAlg,
    alpha: f32,
    table_reg: Gpr,
    mask_reg: usize,
    aux: Vec<usize>,
    offsets: BTreeMap<TblKey, u32>,
    values: Vec<u32>,
    label: Option<CodeLabel>,
}

impl EltwiseInjector {
    /// Whether `alg` has an emitter at `isa`. The polynomial algorithms are
    /// only emitted from the FMA-carrying levels up.
    pub fn is_supported(isa: IsaLevel, alg: EltwiseAlg) -> bool {
        match alg {
            EltwiseAlg::Exp
            | EltwiseAlg::Sigmoid
            | EltwiseAlg::Tanh
            | EltwiseAlg::Swish
            | EltwiseAlg::GeluTanh => isa.is_superset(IsaLevel::Avx2),
            _ => true,
        }
    }

    /// Scratch vector registers `alg` clobbers besides the value register.
    pub fn aux_vecs_needed(alg: EltwiseAlg) -> usize {
        match alg {
            EltwiseAlg::Square | EltwiseAlg::Sqrt | EltwiseAlg::Round => 0,
            EltwiseAlg::Clip | EltwiseAlg::Abs => 1,
            EltwiseAlg::Relu | EltwiseAlg::Linear => 2,
            EltwiseAlg::Exp | EltwiseAlg::Sigmoid | EltwiseAlg::Tanh => 3,
            EltwiseAlg::Swish | EltwiseAlg::GeluTanh => 4,
        }
    }

    pub fn new(
        isa: IsaLevel,
        width: VectorWidth,
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
        params: EltwiseStaticParams,
    ) -> Result<Self, JitError> {
        if !Self::is_supported(isa, alg) {
            return Err(JitError::Unsupported(format!("eltwise {alg:?} not emittable at {isa:?}")));
        }
        if !width.is_legal_for(isa) {
            return Err(JitError::Unsupported(format!("{width:?} not encodable at {isa:?}")));
        }
        let needed = Self::aux_vecs_needed(alg);
        if params.aux_vecs.len() < needed {
            return Err(JitError::Unsupported(format!(
                "eltwise {alg:?} needs {needed} aux vectors, got {}",
                params.aux_vecs.len()
            )));
        }
        if isa.has_mask_regs() && alg == EltwiseAlg::Relu && alpha != 0.0 {
            crate::regmap::kmask_reg(params.mask_reg)?;
        }

        let mut inj = Self {
            isa,
            width,
            alg,
            alpha,
            table_reg: params.table_reg,
            mask_reg: params.mask_reg,
            aux: params.aux_vecs,
            offsets: BTreeMap::new(),
            values: Vec::new(),
            label: None,
        };
        inj.register_constants(alpha, beta);
        Ok(inj)
    }

    pub fn alg(&self) -> EltwiseAlg {
        self.alg
    }

    fn put(&mut self, key: TblKey, bits: u32) {
        if let std::collections::btree_map::Entry::Vacant(e) = self.offsets.entry(key) {
            e.insert((self.values.len() * 4) as u32);
            self.values.push(bits);
        }
    }

    fn put_f32(&mut self, key: TblKey, val: f32) {
        self.put(key, val.to_bits());
    }

    fn register_exp_constants(&mut self) {
        self.put_f32(TblKey::ExpClampLo, EXP_CLAMP_LO);
        self.put_f32(TblKey::ExpClampHi, EXP_CLAMP_HI);
        self.put_f32(TblKey::ExpLog2e, EXP_LOG2E);
        self.put_f32(TblKey::ExpC1, EXP_C1);
        self.put_f32(TblKey::ExpC2, EXP_C2);
        self.put_f32(TblKey::ExpP0, EXP_P0);
        self.put_f32(TblKey::ExpP1, EXP_P1);
        self.put_f32(TblKey::ExpP2, EXP_P2);
        self.put_f32(TblKey::ExpP3, EXP_P3);
        self.put_f32(TblKey::ExpP4, EXP_P4);
        self.put_f32(TblKey::ExpP5, EXP_P5);
        self.put_f32(TblKey::ExpMagic, EXP_MAGIC127);
        self.put_f32(TblKey::One, 1.0);
    }

    fn register_constants(&mut self, alpha: f32, beta: f32) {
        match self.alg {
            EltwiseAlg::Relu => {
                if alpha != 0.0 {
                    self.put_f32(TblKey::Alpha, alpha);
                }
            }
            EltwiseAlg::Linear | EltwiseAlg::Clip => {
                self.put_f32(TblKey::Alpha, alpha);
                self.put_f32(TblKey::Beta, beta);
            }
            EltwiseAlg::Abs => self.put(TblKey::AbsMask, 0x7fff_ffff),
            EltwiseAlg::Square | EltwiseAlg::Sqrt | EltwiseAlg::Round => {}
            EltwiseAlg::Exp => self.register_exp_constants(),
            EltwiseAlg::Sigmoid => {
                self.put(TblKey::SignMask, 0x8000_0000);
                self.put_f32(TblKey::Two, 2.0);
                self.register_exp_constants();
            }
            EltwiseAlg::Tanh => {
                self.put_f32(TblKey::NegTwo, -2.0);
                self.put_f32(TblKey::Two, 2.0);
                self.register_exp_constants();
            }
            EltwiseAlg::Swish => {
                self.put_f32(TblKey::Alpha, alpha);
                self.put(TblKey::SignMask, 0x8000_0000);
                self.put_f32(TblKey::Two, 2.0);
                self.register_exp_constants();
            }
            EltwiseAlg::GeluTanh => {
                self.put_f32(TblKey::GeluC0, GELU_SQRT_2_OVER_PI);
                self.put_f32(TblKey::GeluC1, GELU_FIT);
                self.put_f32(TblKey::Half, 0.5);
                self.put_f32(TblKey::NegTwo, -2.0);
                self.put_f32(TblKey::Two, 2.0);
                self.register_exp_constants();
            }
        }
    }

    fn off(&self, key: TblKey) -> u32 {
        self.offsets[&key]
    }

    fn bcst(&self, v: &mut VecAsm<'_>, dst: usize, key: TblKey) -> Result<(), JitError> {
        v.broadcast_ss(dst, ptr(self.table_reg.reg64() + self.off(key) as i32))
    }

    /// Point `table_reg` at the constant table, creating the label on first
    /// use. No-op for algorithms without constants.
    fn ensure_table_addr(&mut self, asm: &mut CodeAssembler) -> Result<(), JitError> {
        if self.offsets.is_empty() {
            return Ok(());
        }
        let label = match self.label {
            Some(l) => l,
            None => {
                let l = asm.create_label();
                self.label = Some(l);
                l
            }
        };
        asm.lea(self.table_reg.reg64(), ptr(label))?;
        Ok(())
    }

    /// Apply the activation in place to vector register `idx`.
    pub fn compute_vector(&mut self, asm: &mut CodeAssembler, idx: usize) -> Result<(), JitError> {
        self.ensure_table_addr(asm)?;
        let mut v = VecAsm::new(asm, self.isa, self.width);
        self.emit_alg(&mut v, idx)
    }

    /// Apply the activation to every register in `idxs`, sharing one table
    /// address load.
    pub fn compute_vector_set(
        &mut self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
    ) -> Result<(), JitError> {
        self.ensure_table_addr(asm)?;
        let mut v = VecAsm::new(asm, self.isa, self.width);
        for &idx in idxs {
            self.emit_alg(&mut v, idx)?;
        }
        Ok(())
    }

    /// Emit the constant table. Must run after the kernel's `ret` whenever a
    /// compute call was emitted.
    pub fn prepare_table(&mut self, asm: &mut CodeAssembler) -> Result<(), JitError> {
        if self.offsets.is_empty() {
            return Ok(());
        }
        let mut label = match self.label {
            Some(l) => l,
            None => asm.create_label(),
        };
        asm.set_label(&mut label)?;
        for bits in &self.values {
            asm.db(&bits.to_le_bytes())?;
        }
        self.label = Some(label);
        Ok(())
    }

    fn emit_alg(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        debug_assert!(!self.aux.contains(&x), "aux vector v{x} aliases the value register");
        match self.alg {
            EltwiseAlg::Relu => self.emit_relu(v, x),
            EltwiseAlg::Linear => self.emit_linear(v, x),
            EltwiseAlg::Clip => self.emit_clip(v, x),
            EltwiseAlg::Abs => self.emit_abs(v, x),
            EltwiseAlg::Square => v.mulps(x, x, x),
            EltwiseAlg::Sqrt => v.sqrtps(x, x),
            EltwiseAlg::Round => v.round_even(x, x),
            EltwiseAlg::Exp => self.emit_exp(v, x),
            EltwiseAlg::Sigmoid => self.emit_sigmoid(v, x),
            EltwiseAlg::Tanh => self.emit_tanh(v, x),
            EltwiseAlg::Swish => self.emit_swish(v, x),
            EltwiseAlg::GeluTanh => self.emit_gelu_tanh(v, x),
        }
    }

    fn emit_relu(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let a0 = self.aux[0];
        if self.alpha == 0.0 {
            v.xorps_zero(a0)?;
            return v.maxps(x, x, a0);
        }
        let a1 = self.aux[1];
        self.bcst(v, a0, TblKey::Alpha)?;
        if self.isa.has_mask_regs() {
            v.mulps(a0, a0, x)?;
            v.xorps_zero(a1)?;
            v.cmp_lt_to_k(self.mask_reg, x, a1)?;
            v.blendm_with_k(x, self.mask_reg, x, a0)?;
        } else {
            emit_select_negative(v, x, a0, a1)?;
        }
        Ok(())
    }

    fn emit_linear(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let (a0, a1) = (self.aux[0], self.aux[1]);
        self.bcst(v, a0, TblKey::Alpha)?;
        self.bcst(v, a1, TblKey::Beta)?;
        v.fmadd213(x, a0, a1)
    }

    fn emit_clip(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let a0 = self.aux[0];
        self.bcst(v, a0, TblKey::Alpha)?;
        v.maxps(x, x, a0)?;
        self.bcst(v, a0, TblKey::Beta)?;
        v.minps(x, x, a0)
    }

    fn emit_abs(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let a0 = self.aux[0];
        self.bcst(v, a0, TblKey::AbsMask)?;
        v.andps(x, x, a0)
    }

    /// exp(x) in place. Clobbers aux 0..3.
    fn emit_exp_core(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let (a0, a1, a2) = (self.aux[0], self.aux[1], self.aux[2]);
        self.bcst(v, a0, TblKey::ExpClampHi)?;
        v.minps(x, x, a0)?;
        self.bcst(v, a0, TblKey::ExpClampLo)?;
        v.maxps(x, x, a0)?;
        // k = round(x * log2e)
        self.bcst(v, a0, TblKey::ExpLog2e)?;
        v.mulps(a0, a0, x)?;
        v.round_even(a0, a0)?;
        // r = x + k*C1 + k*C2
        self.bcst(v, a1, TblKey::ExpC1)?;
        v.movv(a2, a0)?;
        v.fmadd213(a2, a1, x)?;
        self.bcst(v, a1, TblKey::ExpC2)?;
        v.movv(x, a0)?;
        v.fmadd213(x, a1, a2)?;
        // p = ((((P0*r + P1)*r + P2)*r + P3)*r + P4)*r + P5
        self.bcst(v, a2, TblKey::ExpP0)?;
        for p in [TblKey::ExpP1, TblKey::ExpP2, TblKey::ExpP3, TblKey::ExpP4, TblKey::ExpP5] {
            self.bcst(v, a1, p)?;
            v.fmadd213(a2, x, a1)?;
        }
        // exp(r) = p*r^2 + r + 1
        v.mulps(a2, a2, x)?;
        v.mulps(a2, a2, x)?;
        v.addps(a2, a2, x)?;
        self.bcst(v, a1, TblKey::One)?;
        v.addps(a2, a2, a1)?;
        // scale by 2^k through the int lanes
        v.cvtps2dq(a0, a0)?;
        self.bcst(v, a1, TblKey::ExpMagic)?;
        v.cvtps2dq(a1, a1)?;
        v.paddd(a0, a0, a1)?;
        v.pslld_imm(a0, a0, 23)?;
        v.mulps(x, a2, a0)
    }

    /// 1/d with one Newton-Raphson step on the hardware reciprocal estimate.
    fn emit_recip(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let (a0, a1) = (self.aux[0], self.aux[1]);
        v.rcpps(a1, x)?;
        v.mulps(x, x, a1)?;
        self.bcst(v, a0, TblKey::Two)?;
        v.subps(a0, a0, x)?;
        v.mulps(x, a1, a0)
    }

    /// sigmoid(x) = 1 / (1 + exp(-x)), in place.
    fn emit_sigmoid_core(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let a0 = self.aux[0];
        self.bcst(v, a0, TblKey::SignMask)?;
        v.xorps(x, x, a0)?;
        self.emit_exp_core(v, x)?;
        self.bcst(v, a0, TblKey::One)?;
        v.addps(x, x, a0)?;
        self.emit_recip(v, x)
    }

    fn emit_exp(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        self.emit_exp_core(v, x)
    }

    fn emit_sigmoid(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        self.emit_sigmoid_core(v, x)
    }

    /// tanh(x) = 2 / (1 + exp(-2x)) - 1, in place.
    fn emit_tanh_core(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let a0 = self.aux[0];
        self.bcst(v, a0, TblKey::NegTwo)?;
        v.mulps(x, x, a0)?;
        self.emit_exp_core(v, x)?;
        self.bcst(v, a0, TblKey::One)?;
        v.addps(x, x, a0)?;
        self.emit_recip(v, x)?;
        self.bcst(v, a0, TblKey::Two)?;
        v.mulps(x, x, a0)?;
        self.bcst(v, a0, TblKey::One)?;
        v.subps(x, x, a0)
    }

    fn emit_tanh(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        self.emit_tanh_core(v, x)
    }

    /// swish(x) = x * sigmoid(alpha * x).
    fn emit_swish(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let (a0, a3) = (self.aux[0], self.aux[3]);
        v.movv(a3, x)?;
        self.bcst(v, a0, TblKey::Alpha)?;
        v.mulps(x, x, a0)?;
        self.emit_sigmoid_core(v, x)?;
        v.mulps(x, x, a3)
    }

    /// gelu(x) = 0.5x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 x^3))).
    fn emit_gelu_tanh(&self, v: &mut VecAsm<'_>, x: usize) -> Result<(), JitError> {
        let (a0, a3) = (self.aux[0], self.aux[3]);
        v.movv(a3, x)?;
        v.mulps(x, x, x)?;
        self.bcst(v, a0, TblKey::GeluC1)?;
        v.mulps(x, x, a0)?;
        self.bcst(v, a0, TblKey::One)?;
        v.addps(x, x, a0)?;
        v.mulps(x, x, a3)?;
        self.bcst(v, a0, TblKey::GeluC0)?;
        v.mulps(x, x, a0)?;
        self.emit_tanh_core(v, x)?;
        self.bcst(v, a0, TblKey::One)?;
        v.addps(x, x, a0)?;
        v.mulps(x, x, a3)?;
        self.bcst(v, a0, TblKey::Half)?;
        v.mulps(x, x, a0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

    fn params(aux: &[usize]) -> EltwiseStaticParams {
        EltwiseStaticParams { table_reg: Gpr::R11, mask_reg: 2, aux_vecs: aux.to_vec() }
    }

    fn mnemonics(asm: &mut CodeAssembler) -> Vec<Mnemonic> {
        let bytes = asm.assemble(0x10_0000).unwrap();
        let mut decoder = Decoder::new(64, &bytes, DecoderOptions::NONE);
        let mut out = Vec::new();
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            out.push(instr.mnemonic());
        }
        out
    }

    #[test]
    fn polynomials_rejected_below_avx2() {
        for alg in [EltwiseAlg::Exp, EltwiseAlg::Tanh, EltwiseAlg::GeluTanh] {
            let r = EltwiseInjector::new(
                IsaLevel::Sse41,
                VectorWidth::Xmm,
                alg,
                0.0,
                0.0,
                params(&[1, 2, 3, 4]),
            );
            assert!(r.is_err(), "{alg:?} should not construct on sse41");
        }
        assert!(EltwiseInjector::new(
            IsaLevel::Sse41,
            VectorWidth::Xmm,
            EltwiseAlg::Relu,
            0.0,
            0.0,
            params(&[1, 2]),
        )
        .is_ok());
    }

    #[test]
    fn aux_shortage_rejected() {
        let r = EltwiseInjector::new(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            EltwiseAlg::Sigmoid,
            0.0,
            0.0,
            params(&[1, 2]),
        );
        assert!(r.is_err());
    }

    #[test]
    fn relu_zero_alpha_has_no_table() {
        let mut inj = EltwiseInjector::new(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            EltwiseAlg::Relu,
            0.0,
            0.0,
            params(&[1, 2]),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.compute_vector(&mut asm, 3).unwrap();
        inj.prepare_table(&mut asm).unwrap();
        let m = mnemonics(&mut asm);
        assert_eq!(m, vec![Mnemonic::Vxorps, Mnemonic::Vmaxps]);
    }

    #[test]
    fn leaky_relu_uses_opmask_on_avx512() {
        let mut inj = EltwiseInjector::new(
            IsaLevel::Avx512Core,
            VectorWidth::Zmm,
            EltwiseAlg::Relu,
            0.25,
            0.0,
            params(&[1, 2]),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.compute_vector(&mut asm, 3).unwrap();
        asm.ret().unwrap();
        inj.prepare_table(&mut asm).unwrap();
        let m = mnemonics(&mut asm);
        assert!(m.contains(&Mnemonic::Vcmpps));
        assert!(m.contains(&Mnemonic::Vblendmps));
        assert!(!m.contains(&Mnemonic::Vblendvps));
    }

    #[test]
    fn exp_emits_one_table_address_per_set() {
        let mut inj = EltwiseInjector::new(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            EltwiseAlg::Exp,
            0.0,
            0.0,
            params(&[1, 2, 3]),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        let idxs: VecIndexSet = [4, 5, 6].into_iter().collect();
        inj.compute_vector_set(&mut asm, &idxs).unwrap();
        asm.ret().unwrap();
        inj.prepare_table(&mut asm).unwrap();
        let m = mnemonics(&mut asm);
        assert_eq!(m.iter().filter(|&&x| x == Mnemonic::Lea).count(), 1);
        // two Cody-Waite steps plus the degree-5 Horner chain, per register
        assert_eq!(m.iter().filter(|&&x| x == Mnemonic::Vfmadd213ps).count(), 7 * 3);
    }

    #[test]
    fn table_constants_deduplicate() {
        let inj = EltwiseInjector::new(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            EltwiseAlg::GeluTanh,
            0.0,
            0.0,
            params(&[1, 2, 3, 4]),
        )
        .unwrap();
        assert_eq!(inj.offsets.len(), inj.values.len());
        let mut offs: Vec<u32> = inj.offsets.values().copied().collect();
        offs.sort_unstable();
        offs.dedup();
        assert_eq!(offs.len(), inj.values.len());
    }
}
