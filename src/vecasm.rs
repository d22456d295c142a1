//! Width- and encoding-polymorphic f32 vector emission.
//!
//! Every injector emits through [`VecAsm`], which pins one vector width and
//! one instruction-set level and lowers each logical operation to the right
//! encoding: legacy SSE two-operand forms (with destination staging), VEX
//! three-operand forms, or EVEX forms for 512-bit registers and opmasks.
//! Injector bodies therefore read the same at every width; the capability
//! differences live here and nowhere else.
//!
//! Two lowering rules are not obvious from the op names:
//! - bitwise ops on 512-bit registers use the integer forms (`vpxord` and
//!   friends), since `vxorps zmm` requires AVX512DQ;
//! - `fmadd213` decays to mul+add below the FMA-carrying levels, preserving
//!   the `dst = dst * m + a` contract with one extra rounding step.

use iced_x86::code_asm::*;

use crate::isa::{IsaLevel, VectorWidth};
use crate::regmap::{self, JitError};

/// Instruction encoding family, fixed per (isa, width) pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Enc {
    Sse,
    VexX,
    VexY,
    Evex,
}

#[derive(Clone, Copy)]
enum Op3 {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Xor,
    And,
    Andn,
    Or,
}

pub struct VecAsm<'a> {
    asm: &'a mut CodeAssembler,
    isa: IsaLevel,
    width: VectorWidth,
    enc: Enc,
}

impl<'a> VecAsm<'a> {
    pub fn new(asm: &'a mut CodeAssembler, isa: IsaLevel, width: VectorWidth) -> Self {
        debug_assert!(width.is_legal_for(isa), "{width:?} not encodable at {isa:?}");
        let enc = match width {
            VectorWidth::Zmm => Enc::Evex,
            VectorWidth::Ymm => Enc::VexY,
            VectorWidth::Xmm => {
                if isa.is_superset(IsaLevel::Avx) {
                    Enc::VexX
                } else {
                    Enc::Sse
                }
            }
        };
        Self { asm, isa, width, enc }
    }

    pub fn isa(&self) -> IsaLevel {
        self.isa
    }

    pub fn width(&self) -> VectorWidth {
        self.width
    }

    pub fn lanes(&self) -> usize {
        self.width.f32_lanes()
    }

    /// Scalar/GPR escape hatch for address arithmetic around the vector ops.
    pub fn raw(&mut self) -> &mut CodeAssembler {
        self.asm
    }

    /// Legacy-SSE destination staging: `dst op= b` forms need `dst` to start
    /// as `a`. Staging must not clobber `b` first.
    fn stage_sse(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        debug_assert!(dst == a || dst != b, "sse staging of v{dst} would clobber source v{b}");
        if dst != a {
            self.asm.movaps(regmap::xmm_reg(dst)?, regmap::xmm_reg(a)?)?;
        }
        Ok(())
    }

    fn bin3(&mut self, op: Op3, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                self.stage_sse(dst, a, b)?;
                let d = regmap::xmm_reg(dst)?;
                let s = regmap::xmm_reg(b)?;
                match op {
                    Op3::Add => self.asm.addps(d, s)?,
                    Op3::Sub => self.asm.subps(d, s)?,
                    Op3::Mul => self.asm.mulps(d, s)?,
                    Op3::Div => self.asm.divps(d, s)?,
                    Op3::Max => self.asm.maxps(d, s)?,
                    Op3::Min => self.asm.minps(d, s)?,
                    Op3::Xor => self.asm.xorps(d, s)?,
                    Op3::And => self.asm.andps(d, s)?,
                    Op3::Andn => self.asm.andnps(d, s)?,
                    Op3::Or => self.asm.orps(d, s)?,
                }
            }
            Enc::VexX => {
                let d = regmap::xmm_reg(dst)?;
                let x = regmap::xmm_reg(a)?;
                let y = regmap::xmm_reg(b)?;
                match op {
                    Op3::Add => self.asm.vaddps(d, x, y)?,
                    Op3::Sub => self.asm.vsubps(d, x, y)?,
                    Op3::Mul => self.asm.vmulps(d, x, y)?,
                    Op3::Div => self.asm.vdivps(d, x, y)?,
                    Op3::Max => self.asm.vmaxps(d, x, y)?,
                    Op3::Min => self.asm.vminps(d, x, y)?,
                    Op3::Xor => self.asm.vxorps(d, x, y)?,
                    Op3::And => self.asm.vandps(d, x, y)?,
                    Op3::Andn => self.asm.vandnps(d, x, y)?,
                    Op3::Or => self.asm.vorps(d, x, y)?,
                }
            }
            Enc::VexY => {
                let d = regmap::ymm_reg(dst)?;
                let x = regmap::ymm_reg(a)?;
                let y = regmap::ymm_reg(b)?;
                match op {
                    Op3::Add => self.asm.vaddps(d, x, y)?,
                    Op3::Sub => self.asm.vsubps(d, x, y)?,
                    Op3::Mul => self.asm.vmulps(d, x, y)?,
                    Op3::Div => self.asm.vdivps(d, x, y)?,
                    Op3::Max => self.asm.vmaxps(d, x, y)?,
                    Op3::Min => self.asm.vminps(d, x, y)?,
                    Op3::Xor => self.asm.vxorps(d, x, y)?,
                    Op3::And => self.asm.vandps(d, x, y)?,
                    Op3::Andn => self.asm.vandnps(d, x, y)?,
                    Op3::Or => self.asm.vorps(d, x, y)?,
                }
            }
            Enc::Evex => {
                let d = regmap::zmm_reg(dst)?;
                let x = regmap::zmm_reg(a)?;
                let y = regmap::zmm_reg(b)?;
                match op {
                    Op3::Add => self.asm.vaddps(d, x, y)?,
                    Op3::Sub => self.asm.vsubps(d, x, y)?,
                    Op3::Mul => self.asm.vmulps(d, x, y)?,
                    Op3::Div => self.asm.vdivps(d, x, y)?,
                    Op3::Max => self.asm.vmaxps(d, x, y)?,
                    Op3::Min => self.asm.vminps(d, x, y)?,
                    Op3::Xor => self.asm.vpxord(d, x, y)?,
                    Op3::And => self.asm.vpandd(d, x, y)?,
                    Op3::Andn => self.asm.vpandnd(d, x, y)?,
                    Op3::Or => self.asm.vpord(d, x, y)?,
                }
            }
        }
        Ok(())
    }

    // ── Arithmetic ──────────────────────────────────────────────────────────

    pub fn addps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Add, dst, a, b)
    }

    pub fn subps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Sub, dst, a, b)
    }

    pub fn mulps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Mul, dst, a, b)
    }

    pub fn divps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Div, dst, a, b)
    }

    pub fn maxps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Max, dst, a, b)
    }

    pub fn minps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Min, dst, a, b)
    }

    pub fn xorps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Xor, dst, a, b)
    }

    pub fn xorps_zero(&mut self, dst: usize) -> Result<(), JitError> {
        self.bin3(Op3::Xor, dst, dst, dst)
    }

    pub fn andps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::And, dst, a, b)
    }

    /// `dst = !a & b`.
    pub fn andnps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Andn, dst, a, b)
    }

    pub fn orps(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        self.bin3(Op3::Or, dst, a, b)
    }

    /// `dst = dst * m + a`. One fused instruction when FMA is available,
    /// otherwise mul then add.
    pub fn fmadd213(&mut self, dst: usize, m: usize, a: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                self.asm.mulps(regmap::xmm_reg(dst)?, regmap::xmm_reg(m)?)?;
                self.asm.addps(regmap::xmm_reg(dst)?, regmap::xmm_reg(a)?)?;
            }
            Enc::VexX => {
                if self.isa.is_superset(IsaLevel::Avx2) {
                    self.asm.vfmadd213ps(
                        regmap::xmm_reg(dst)?,
                        regmap::xmm_reg(m)?,
                        regmap::xmm_reg(a)?,
                    )?;
                } else {
                    self.bin3(Op3::Mul, dst, dst, m)?;
                    self.bin3(Op3::Add, dst, dst, a)?;
                }
            }
            Enc::VexY => {
                if self.isa.is_superset(IsaLevel::Avx2) {
                    self.asm.vfmadd213ps(
                        regmap::ymm_reg(dst)?,
                        regmap::ymm_reg(m)?,
                        regmap::ymm_reg(a)?,
                    )?;
                } else {
                    self.bin3(Op3::Mul, dst, dst, m)?;
                    self.bin3(Op3::Add, dst, dst, a)?;
                }
            }
            Enc::Evex => {
                self.asm.vfmadd213ps(
                    regmap::zmm_reg(dst)?,
                    regmap::zmm_reg(m)?,
                    regmap::zmm_reg(a)?,
                )?;
            }
        }
        Ok(())
    }

    pub fn sqrtps(&mut self, dst: usize, src: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => self.asm.sqrtps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexX => self.asm.vsqrtps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexY => self.asm.vsqrtps(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?)?,
            Enc::Evex => self.asm.vsqrtps(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?)?,
        }
        Ok(())
    }

    /// Approximate reciprocal (14-bit form on 512-bit registers).
    pub fn rcpps(&mut self, dst: usize, src: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => self.asm.rcpps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexX => self.asm.vrcpps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexY => self.asm.vrcpps(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?)?,
            Enc::Evex => self.asm.vrcp14ps(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?)?,
        }
        Ok(())
    }

    /// Round to nearest even.
    pub fn round_even(&mut self, dst: usize, src: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => self.asm.roundps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?, 0u32)?,
            Enc::VexX => self.asm.vroundps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?, 0u32)?,
            Enc::VexY => self.asm.vroundps(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?, 0u32)?,
            Enc::Evex => {
                self.asm.vrndscaleps(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?, 0u32)?
            }
        }
        Ok(())
    }

    // ── Integer lane ops (exponent reconstruction) ─────────────────────────

    pub fn cvtps2dq(&mut self, dst: usize, src: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => self.asm.cvtps2dq(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexX => self.asm.vcvtps2dq(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexY => self.asm.vcvtps2dq(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?)?,
            Enc::Evex => self.asm.vcvtps2dq(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?)?,
        }
        Ok(())
    }

    pub fn paddd(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                debug_assert!(dst == a || dst != b);
                if dst != a {
                    self.asm.movdqa(regmap::xmm_reg(dst)?, regmap::xmm_reg(a)?)?;
                }
                self.asm.paddd(regmap::xmm_reg(dst)?, regmap::xmm_reg(b)?)?;
            }
            Enc::VexX => {
                self.asm.vpaddd(regmap::xmm_reg(dst)?, regmap::xmm_reg(a)?, regmap::xmm_reg(b)?)?
            }
            Enc::VexY => {
                debug_assert!(self.isa.is_superset(IsaLevel::Avx2), "256-bit integer op");
                self.asm.vpaddd(regmap::ymm_reg(dst)?, regmap::ymm_reg(a)?, regmap::ymm_reg(b)?)?
            }
            Enc::Evex => {
                self.asm.vpaddd(regmap::zmm_reg(dst)?, regmap::zmm_reg(a)?, regmap::zmm_reg(b)?)?
            }
        }
        Ok(())
    }

    pub fn pslld_imm(&mut self, dst: usize, src: usize, imm: u32) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                if dst != src {
                    self.asm.movdqa(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?;
                }
                self.asm.pslld(regmap::xmm_reg(dst)?, imm)?;
            }
            Enc::VexX => self.asm.vpslld(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?, imm)?,
            Enc::VexY => {
                debug_assert!(self.isa.is_superset(IsaLevel::Avx2), "256-bit integer op");
                self.asm.vpslld(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?, imm)?
            }
            Enc::Evex => self.asm.vpslld(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?, imm)?,
        }
        Ok(())
    }

    pub fn psrad_imm(&mut self, dst: usize, src: usize, imm: u32) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                if dst != src {
                    self.asm.movdqa(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?;
                }
                self.asm.psrad(regmap::xmm_reg(dst)?, imm)?;
            }
            Enc::VexX => self.asm.vpsrad(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?, imm)?,
            Enc::VexY => {
                debug_assert!(self.isa.is_superset(IsaLevel::Avx2), "256-bit integer op");
                self.asm.vpsrad(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?, imm)?
            }
            Enc::Evex => self.asm.vpsrad(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?, imm)?,
        }
        Ok(())
    }

    // ── Moves and memory ────────────────────────────────────────────────────

    pub fn movv(&mut self, dst: usize, src: usize) -> Result<(), JitError> {
        if dst == src {
            return Ok(());
        }
        match self.enc {
            Enc::Sse => self.asm.movaps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexX => self.asm.vmovaps(regmap::xmm_reg(dst)?, regmap::xmm_reg(src)?)?,
            Enc::VexY => self.asm.vmovaps(regmap::ymm_reg(dst)?, regmap::ymm_reg(src)?)?,
            Enc::Evex => self.asm.vmovaps(regmap::zmm_reg(dst)?, regmap::zmm_reg(src)?)?,
        }
        Ok(())
    }

    pub fn load(&mut self, dst: usize, mem: AsmMemoryOperand) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => self.asm.movups(regmap::xmm_reg(dst)?, mem)?,
            Enc::VexX => self.asm.vmovups(regmap::xmm_reg(dst)?, mem)?,
            Enc::VexY => self.asm.vmovups(regmap::ymm_reg(dst)?, mem)?,
            Enc::Evex => self.asm.vmovups(regmap::zmm_reg(dst)?, mem)?,
        }
        Ok(())
    }

    pub fn store(&mut self, mem: AsmMemoryOperand, src: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => self.asm.movups(mem, regmap::xmm_reg(src)?)?,
            Enc::VexX => self.asm.vmovups(mem, regmap::xmm_reg(src)?)?,
            Enc::VexY => self.asm.vmovups(mem, regmap::ymm_reg(src)?)?,
            Enc::Evex => self.asm.vmovups(mem, regmap::zmm_reg(src)?)?,
        }
        Ok(())
    }

    /// Broadcast one f32 from memory into every lane.
    pub fn broadcast_ss(&mut self, dst: usize, mem: AsmMemoryOperand) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                self.asm.movss(regmap::xmm_reg(dst)?, mem)?;
                self.asm.shufps(regmap::xmm_reg(dst)?, regmap::xmm_reg(dst)?, 0u32)?;
            }
            Enc::VexX => self.asm.vbroadcastss(regmap::xmm_reg(dst)?, mem)?,
            Enc::VexY => self.asm.vbroadcastss(regmap::ymm_reg(dst)?, mem)?,
            Enc::Evex => self.asm.vbroadcastss(regmap::zmm_reg(dst)?, mem)?,
        }
        Ok(())
    }

    /// Zero-masked load of the lanes selected by opmask `k`.
    pub fn load_tail(
        &mut self,
        dst: usize,
        mem: AsmMemoryOperand,
        k: usize,
    ) -> Result<(), JitError> {
        debug_assert!(self.isa.has_mask_regs(), "opmask load below avx512");
        match self.width {
            VectorWidth::Xmm => self.asm.vmovups(regmap::masked_xmm(dst, k, true)?, mem)?,
            VectorWidth::Ymm => self.asm.vmovups(regmap::masked_ymm(dst, k, true)?, mem)?,
            VectorWidth::Zmm => self.asm.vmovups(regmap::masked_zmm(dst, k, true)?, mem)?,
        }
        Ok(())
    }

    /// Merge-masked store of the lanes selected by opmask `k`.
    pub fn store_tail(
        &mut self,
        mem: AsmMemoryOperand,
        src: usize,
        k: usize,
    ) -> Result<(), JitError> {
        debug_assert!(self.isa.has_mask_regs(), "opmask store below avx512");
        let mem = regmap::masked_mem(mem, k)?;
        match self.width {
            VectorWidth::Xmm => self.asm.vmovups(mem, regmap::xmm_reg(src)?)?,
            VectorWidth::Ymm => self.asm.vmovups(mem, regmap::ymm_reg(src)?)?,
            VectorWidth::Zmm => self.asm.vmovups(mem, regmap::zmm_reg(src)?)?,
        }
        Ok(())
    }

    // ── Compare and select ──────────────────────────────────────────────────

    /// `dst = all-ones where a < b` as a vector mask. Not available in the
    /// EVEX family, which compares into opmasks instead.
    pub fn cmp_lt(&mut self, dst: usize, a: usize, b: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                self.stage_sse(dst, a, b)?;
                self.asm.cmpps(regmap::xmm_reg(dst)?, regmap::xmm_reg(b)?, 1u32)?;
            }
            Enc::VexX => self.asm.vcmpps(
                regmap::xmm_reg(dst)?,
                regmap::xmm_reg(a)?,
                regmap::xmm_reg(b)?,
                1u32,
            )?,
            Enc::VexY => self.asm.vcmpps(
                regmap::ymm_reg(dst)?,
                regmap::ymm_reg(a)?,
                regmap::ymm_reg(b)?,
                1u32,
            )?,
            Enc::Evex => unreachable!("vector-mask compare requested on evex; use cmp_lt_to_k"),
        }
        Ok(())
    }

    /// `dst = mask ? b : a` with a vector mask. The legacy form hard-wires
    /// xmm0 as the mask register.
    pub fn blendv(&mut self, dst: usize, a: usize, b: usize, mask: usize) -> Result<(), JitError> {
        match self.enc {
            Enc::Sse => {
                debug_assert!(mask == 0, "blendvps reads its mask from xmm0");
                self.stage_sse(dst, a, b)?;
                self.asm.blendvps(regmap::xmm_reg(dst)?, regmap::xmm_reg(b)?)?;
            }
            Enc::VexX => self.asm.vblendvps(
                regmap::xmm_reg(dst)?,
                regmap::xmm_reg(a)?,
                regmap::xmm_reg(b)?,
                regmap::xmm_reg(mask)?,
            )?,
            Enc::VexY => self.asm.vblendvps(
                regmap::ymm_reg(dst)?,
                regmap::ymm_reg(a)?,
                regmap::ymm_reg(b)?,
                regmap::ymm_reg(mask)?,
            )?,
            Enc::Evex => unreachable!("vblendvps has no evex form; use blendm_with_k"),
        }
        Ok(())
    }

    /// `k = a < b`, per lane.
    pub fn cmp_lt_to_k(&mut self, k: usize, a: usize, b: usize) -> Result<(), JitError> {
        debug_assert!(self.isa.has_mask_regs(), "opmask compare below avx512");
        let kr = regmap::kmask_reg(k)?;
        match self.width {
            VectorWidth::Xmm => {
                self.asm.vcmpps(kr, regmap::xmm_reg(a)?, regmap::xmm_reg(b)?, 1u32)?
            }
            VectorWidth::Ymm => {
                self.asm.vcmpps(kr, regmap::ymm_reg(a)?, regmap::ymm_reg(b)?, 1u32)?
            }
            VectorWidth::Zmm => {
                self.asm.vcmpps(kr, regmap::zmm_reg(a)?, regmap::zmm_reg(b)?, 1u32)?
            }
        }
        Ok(())
    }

    /// `dst = k ? b : a`, per lane.
    pub fn blendm_with_k(
        &mut self,
        dst: usize,
        k: usize,
        a: usize,
        b: usize,
    ) -> Result<(), JitError> {
        debug_assert!(self.isa.has_mask_regs(), "opmask blend below avx512");
        match self.width {
            VectorWidth::Xmm => self.asm.vblendmps(
                regmap::masked_xmm(dst, k, false)?,
                regmap::xmm_reg(a)?,
                regmap::xmm_reg(b)?,
            )?,
            VectorWidth::Ymm => self.asm.vblendmps(
                regmap::masked_ymm(dst, k, false)?,
                regmap::ymm_reg(a)?,
                regmap::ymm_reg(b)?,
            )?,
            VectorWidth::Zmm => self.asm.vblendmps(
                regmap::masked_zmm(dst, k, false)?,
                regmap::zmm_reg(a)?,
                regmap::zmm_reg(b)?,
            )?,
        }
        Ok(())
    }
}

/// `x = x >= 0 ? x : x * w`, the shared negative-branch select behind leaky
/// activations. `vblendvps` on the VEX levels; a sign-propagating arithmetic
/// shift elsewhere (`blendvps` pins xmm0, and the blend has no EVEX form).
/// Clobbers `w` and `scratch`.
pub fn emit_select_negative(
    v: &mut VecAsm<'_>,
    x: usize,
    w: usize,
    scratch: usize,
) -> Result<(), JitError> {
    match v.enc {
        Enc::VexX | Enc::VexY => {
            v.xorps_zero(scratch)?;
            v.cmp_lt(scratch, x, scratch)?;
            v.mulps(w, w, x)?;
            v.blendv(x, x, w, scratch)?;
        }
        Enc::Sse | Enc::Evex => {
            // sign mask = x >> 31 (all ones for negative lanes)
            v.psrad_imm(scratch, x, 31)?;
            v.mulps(w, w, x)?;
            v.andps(w, w, scratch)?;
            v.andnps(scratch, scratch, x)?;
            v.orps(x, scratch, w)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

    fn decode(asm: &mut CodeAssembler) -> Vec<Mnemonic> {
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
    fn sse_binop_stages_destination() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Sse41, VectorWidth::Xmm);
        v.addps(2, 1, 3).unwrap();
        v.addps(1, 1, 3).unwrap();
        let m = decode(&mut asm);
        assert_eq!(m, vec![Mnemonic::Movaps, Mnemonic::Addps, Mnemonic::Addps]);
    }

    #[test]
    fn vex_binop_is_three_operand() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx2, VectorWidth::Ymm);
        v.addps(2, 1, 3).unwrap();
        let m = decode(&mut asm);
        assert_eq!(m, vec![Mnemonic::Vaddps]);
    }

    #[test]
    fn evex_bitwise_uses_integer_forms() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx512Core, VectorWidth::Zmm);
        v.xorps_zero(5).unwrap();
        v.andps(4, 5, 6).unwrap();
        let m = decode(&mut asm);
        assert_eq!(m, vec![Mnemonic::Vpxord, Mnemonic::Vpandd]);
    }

    #[test]
    fn fmadd_decays_without_fma() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx, VectorWidth::Ymm);
        v.fmadd213(1, 2, 3).unwrap();
        assert_eq!(decode(&mut asm), vec![Mnemonic::Vmulps, Mnemonic::Vaddps]);

        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx2, VectorWidth::Ymm);
        v.fmadd213(1, 2, 3).unwrap();
        assert_eq!(decode(&mut asm), vec![Mnemonic::Vfmadd213ps]);
    }

    #[test]
    fn round_and_rcp_pick_evex_variants() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx512Core, VectorWidth::Zmm);
        v.round_even(1, 2).unwrap();
        v.rcpps(1, 2).unwrap();
        assert_eq!(decode(&mut asm), vec![Mnemonic::Vrndscaleps, Mnemonic::Vrcp14ps]);
    }

    #[test]
    fn sse_broadcast_is_load_plus_shuffle() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Sse41, VectorWidth::Xmm);
        v.broadcast_ss(3, ptr(rax)).unwrap();
        assert_eq!(decode(&mut asm), vec![Mnemonic::Movss, Mnemonic::Shufps]);
    }

    #[test]
    fn masked_moves_encode_with_opmask() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx512Core, VectorWidth::Zmm);
        v.load_tail(1, ptr(rax), 1).unwrap();
        v.store_tail(ptr(rax), 1, 1).unwrap();
        let bytes = asm.assemble(0x10_0000).unwrap();
        let mut decoder = Decoder::new(64, &bytes, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        decoder.decode_out(&mut instr);
        assert_eq!(instr.mnemonic(), Mnemonic::Vmovups);
        assert_eq!(instr.op_mask(), iced_x86::Register::K1);
        assert!(instr.zeroing_masking());
        decoder.decode_out(&mut instr);
        assert_eq!(instr.mnemonic(), Mnemonic::Vmovups);
        assert_eq!(instr.op_mask(), iced_x86::Register::K1);
        assert!(instr.merging_masking());
    }

    #[test]
    fn select_negative_on_legacy_uses_sign_shift() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Sse41, VectorWidth::Xmm);
        emit_select_negative(&mut v, 3, 4, 0).unwrap();
        let m = decode(&mut asm);
        assert!(m.contains(&Mnemonic::Psrad));
        assert!(!m.contains(&Mnemonic::Blendvps));
    }

    #[test]
    fn select_negative_on_vex_uses_blendv() {
        let mut asm = CodeAssembler::new(64).unwrap();
        let mut v = VecAsm::new(&mut asm, IsaLevel::Avx2, VectorWidth::Ymm);
        emit_select_negative(&mut v, 3, 4, 5).unwrap();
        let m = decode(&mut asm);
        assert!(m.contains(&Mnemonic::Vblendvps));
    }
}
