//! Register-index mapping and the crate-wide emission error type.
//!
//! Emitters address vector registers by plain `usize` index so that register
//! assignment can be decided at kernel-build time (see [`crate::regalloc`]).
//! The helpers here translate those indices into the typed registers the
//! assembler expects, failing on indices the encoding cannot express.

use iced_x86::code_asm::*;
use iced_x86::IcedError;
use thiserror::Error;

/// Errors surfaced while emitting instructions.
///
/// Contract violations (illegal ISA/width pairing, register aliasing, arena
/// exhaustion) are asserts, not variants: a defective injector must never be
/// returned to the caller.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("assembler: {0}")]
    Asm(#[from] IcedError),
    #[error("vector register index {0} out of range")]
    VecIndex(usize),
    #[error("mask register index {0} out of range (k1-k7)")]
    MaskIndex(usize),
    #[error("executable buffer: {0}")]
    Executable(String),
    #[error("unsupported emission request: {0}")]
    Unsupported(String),
}

/// General-purpose registers an emitter may be handed.
///
/// `Rsp` is accepted as an address base (stack-relative auxiliary slots) and
/// must never be used as a scratch destination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Gpr {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    pub fn reg64(self) -> AsmRegister64 {
        match self {
            Gpr::Rax => rax,
            Gpr::Rbx => rbx,
            Gpr::Rcx => rcx,
            Gpr::Rdx => rdx,
            Gpr::Rsi => rsi,
            Gpr::Rdi => rdi,
            Gpr::Rbp => rbp,
            Gpr::Rsp => rsp,
            Gpr::R8 => r8,
            Gpr::R9 => r9,
            Gpr::R10 => r10,
            Gpr::R11 => r11,
            Gpr::R12 => r12,
            Gpr::R13 => r13,
            Gpr::R14 => r14,
            Gpr::R15 => r15,
        }
    }

    pub fn reg32(self) -> AsmRegister32 {
        match self {
            Gpr::Rax => eax,
            Gpr::Rbx => ebx,
            Gpr::Rcx => ecx,
            Gpr::Rdx => edx,
            Gpr::Rsi => esi,
            Gpr::Rdi => edi,
            Gpr::Rbp => ebp,
            Gpr::Rsp => esp,
            Gpr::R8 => r8d,
            Gpr::R9 => r9d,
            Gpr::R10 => r10d,
            Gpr::R11 => r11d,
            Gpr::R12 => r12d,
            Gpr::R13 => r13d,
            Gpr::R14 => r14d,
            Gpr::R15 => r15d,
        }
    }
}

pub fn xmm_reg(idx: usize) -> Result<AsmRegisterXmm, JitError> {
    match idx {
        0 => Ok(xmm0),
        1 => Ok(xmm1),
        2 => Ok(xmm2),
        3 => Ok(xmm3),
        4 => Ok(xmm4),
        5 => Ok(xmm5),
        6 => Ok(xmm6),
        7 => Ok(xmm7),
        8 => Ok(xmm8),
        9 => Ok(xmm9),
        10 => Ok(xmm10),
        11 => Ok(xmm11),
        12 => Ok(xmm12),
        13 => Ok(xmm13),
        14 => Ok(xmm14),
        15 => Ok(xmm15),
        16 => Ok(xmm16),
        17 => Ok(xmm17),
        18 => Ok(xmm18),
        19 => Ok(xmm19),
        20 => Ok(xmm20),
        21 => Ok(xmm21),
        22 => Ok(xmm22),
        23 => Ok(xmm23),
        24 => Ok(xmm24),
        25 => Ok(xmm25),
        26 => Ok(xmm26),
        27 => Ok(xmm27),
        28 => Ok(xmm28),
        29 => Ok(xmm29),
        30 => Ok(xmm30),
        31 => Ok(xmm31),
        _ => Err(JitError::VecIndex(idx)),
    }
}

pub fn ymm_reg(idx: usize) -> Result<AsmRegisterYmm, JitError> {
    match idx {
        0 => Ok(ymm0),
        1 => Ok(ymm1),
        2 => Ok(ymm2),
        3 => Ok(ymm3),
        4 => Ok(ymm4),
        5 => Ok(ymm5),
        6 => Ok(ymm6),
        7 => Ok(ymm7),
        8 => Ok(ymm8),
        9 => Ok(ymm9),
        10 => Ok(ymm10),
        11 => Ok(ymm11),
        12 => Ok(ymm12),
        13 => Ok(ymm13),
        14 => Ok(ymm14),
        15 => Ok(ymm15),
        16 => Ok(ymm16),
        17 => Ok(ymm17),
        18 => Ok(ymm18),
        19 => Ok(ymm19),
        20 => Ok(ymm20),
        21 => Ok(ymm21),
        22 => Ok(ymm22),
        23 => Ok(ymm23),
        24 => Ok(ymm24),
        25 => Ok(ymm25),
        26 => Ok(ymm26),
        27 => Ok(ymm27),
        28 => Ok(ymm28),
        29 => Ok(ymm29),
        30 => Ok(ymm30),
        31 => Ok(ymm31),
        _ => Err(JitError::VecIndex(idx)),
    }
}

pub fn zmm_reg(idx: usize) -> Result<AsmRegisterZmm, JitError> {
    match idx {
        0 => Ok(zmm0),
        1 => Ok(zmm1),
        2 => Ok(zmm2),
        3 => Ok(zmm3),
        4 => Ok(zmm4),
        5 => Ok(zmm5),
        6 => Ok(zmm6),
        7 => Ok(zmm7),
        8 => Ok(zmm8),
        9 => Ok(zmm9),
        10 => Ok(zmm10),
        11 => Ok(zmm11),
        12 => Ok(zmm12),
        13 => Ok(zmm13),
        14 => Ok(zmm14),
        15 => Ok(zmm15),
        16 => Ok(zmm16),
        17 => Ok(zmm17),
        18 => Ok(zmm18),
        19 => Ok(zmm19),
        20 => Ok(zmm20),
        21 => Ok(zmm21),
        22 => Ok(zmm22),
        23 => Ok(zmm23),
        24 => Ok(zmm24),
        25 => Ok(zmm25),
        26 => Ok(zmm26),
        27 => Ok(zmm27),
        28 => Ok(zmm28),
        29 => Ok(zmm29),
        30 => Ok(zmm30),
        31 => Ok(zmm31),
        _ => Err(JitError::VecIndex(idx)),
    }
}

/// Opmask registers. `k0` means "no masking" in EVEX encodings and is
/// therefore not a valid dynamic mask.
pub fn kmask_reg(idx: usize) -> Result<AsmRegisterK, JitError> {
    match idx {
        1 => Ok(k1),
        2 => Ok(k2),
        3 => Ok(k3),
        4 => Ok(k4),
        5 => Ok(k5),
        6 => Ok(k6),
        7 => Ok(k7),
        _ => Err(JitError::MaskIndex(idx)),
    }
}

/// Apply an opmask (and optional zeroing) to a vector register operand.
/// Masked forms force EVEX encoding; callers gate on mask-register support.
pub fn masked_xmm(idx: usize, k: usize, zero: bool) -> Result<AsmRegisterXmm, JitError> {
    let r = xmm_reg(idx)?;
    let r = match k {
        1 => r.k1(),
        2 => r.k2(),
        3 => r.k3(),
        4 => r.k4(),
        5 => r.k5(),
        6 => r.k6(),
        7 => r.k7(),
        _ => return Err(JitError::MaskIndex(k)),
    };
    Ok(if zero { r.z() } else { r })
}

pub fn masked_ymm(idx: usize, k: usize, zero: bool) -> Result<AsmRegisterYmm, JitError> {
    let r = ymm_reg(idx)?;
    let r = match k {
        1 => r.k1(),
        2 => r.k2(),
        3 => r.k3(),
        4 => r.k4(),
        5 => r.k5(),
        6 => r.k6(),
        7 => r.k7(),
        _ => return Err(JitError::MaskIndex(k)),
    };
    Ok(if zero { r.z() } else { r })
}

pub fn masked_zmm(idx: usize, k: usize, zero: bool) -> Result<AsmRegisterZmm, JitError> {
    let r = zmm_reg(idx)?;
    let r = match k {
        1 => r.k1(),
        2 => r.k2(),
        3 => r.k3(),
        4 => r.k4(),
        5 => r.k5(),
        6 => r.k6(),
        7 => r.k7(),
        _ => return Err(JitError::MaskIndex(k)),
    };
    Ok(if zero { r.z() } else { r })
}

/// Apply an opmask to a memory operand (merge-masked stores).
pub fn masked_mem(mem: AsmMemoryOperand, k: usize) -> Result<AsmMemoryOperand, JitError> {
    Ok(match k {
        1 => mem.k1(),
        2 => mem.k2(),
        3 => mem.k3(),
        4 => mem.k4(),
        5 => mem.k5(),
        6 => mem.k6(),
        7 => mem.k7(),
        _ => return Err(JitError::MaskIndex(k)),
    })
}
