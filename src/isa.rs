//! CPU capability catalog: instruction-set levels, vector width classes and
//! the runtime feature probe.
//!
//! Levels form a partial order by feature inclusion. Notably `Avx2Vnni2` and
//! `Avx512Core` are incomparable (the VNNI conversion extensions are not part
//! of the AVX-512 core set), while `Avx512CoreFp16` subsumes both branches.
//!
//! The probe is injected configuration: construct [`CpuFeatures`] once
//! (detect or pin an exact set in tests) and pass it to the factory. The
//! [`host_features`] accessor caches one detection per process for callers
//! that want the ambient answer.

use std::sync::OnceLock;

const F_SSE41: u32 = 1 << 0;
const F_AVX: u32 = 1 << 1;
const F_AVX2: u32 = 1 << 2;
const F_VNNI2: u32 = 1 << 3;
const F_AVX512: u32 = 1 << 4;
const F_BF16: u32 = 1 << 5;
const F_FP16: u32 = 1 << 6;

/// Named instruction-set tiers the injectors can be specialized for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IsaLevel {
    Sse41,
    Avx,
    Avx2,
    Avx2Vnni2,
    Avx512Core,
    Avx512CoreBf16,
    Avx512CoreFp16,
}

impl IsaLevel {
    pub const ALL: [IsaLevel; 7] = [
        IsaLevel::Sse41,
        IsaLevel::Avx,
        IsaLevel::Avx2,
        IsaLevel::Avx2Vnni2,
        IsaLevel::Avx512Core,
        IsaLevel::Avx512CoreBf16,
        IsaLevel::Avx512CoreFp16,
    ];

    fn features(self) -> u32 {
        match self {
            IsaLevel::Sse41 => F_SSE41,
            IsaLevel::Avx => F_SSE41 | F_AVX,
            IsaLevel::Avx2 => F_SSE41 | F_AVX | F_AVX2,
            IsaLevel::Avx2Vnni2 => F_SSE41 | F_AVX | F_AVX2 | F_VNNI2,
            IsaLevel::Avx512Core => F_SSE41 | F_AVX | F_AVX2 | F_AVX512,
            IsaLevel::Avx512CoreBf16 => F_SSE41 | F_AVX | F_AVX2 | F_AVX512 | F_BF16,
            IsaLevel::Avx512CoreFp16 => {
                F_SSE41 | F_AVX | F_AVX2 | F_VNNI2 | F_AVX512 | F_BF16 | F_FP16
            }
        }
    }

    /// Precomputed partial order: does `self` provide everything `other` does?
    pub fn is_superset(self, other: IsaLevel) -> bool {
        self.features() & other.features() == other.features()
    }

    /// Size of the architectural vector register file at this level.
    pub fn max_vec_regs(self) -> usize {
        if self.is_superset(IsaLevel::Avx512Core) {
            32
        } else {
            16
        }
    }

    /// Opmask registers exist from the AVX-512 core level up.
    pub fn has_mask_regs(self) -> bool {
        self.is_superset(IsaLevel::Avx512Core)
    }
}

/// Vector register width classes the emitters can be instantiated for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VectorWidth {
    Xmm,
    Ymm,
    Zmm,
}

impl VectorWidth {
    pub fn bytes(self) -> usize {
        match self {
            VectorWidth::Xmm => 16,
            VectorWidth::Ymm => 32,
            VectorWidth::Zmm => 64,
        }
    }

    pub fn f32_lanes(self) -> usize {
        self.bytes() / 4
    }

    /// Not every width has meaningful instances at every level: Zmm requires
    /// the AVX-512 core set, Ymm requires at least AVX.
    pub fn is_legal_for(self, isa: IsaLevel) -> bool {
        match self {
            VectorWidth::Xmm => true,
            VectorWidth::Ymm => isa.is_superset(IsaLevel::Avx),
            VectorWidth::Zmm => isa.is_superset(IsaLevel::Avx512Core),
        }
    }
}

/// Read-only CPU feature set, established once before any injector is built.
#[derive(Clone, Copy, Debug)]
pub struct CpuFeatures {
    mask: u32,
}

impl CpuFeatures {
    /// Probe the executing CPU.
    pub fn detect() -> Self {
        Self { mask: detect_feature_mask() }
    }

    /// Exact feature set covering precisely the given levels. Intended for
    /// tests and for pinning codegen on heterogeneous fleets.
    pub fn with_levels(levels: &[IsaLevel]) -> Self {
        let mask = levels.iter().fold(0, |m, l| m | l.features());
        Self { mask }
    }

    /// Runtime availability of a level, i.e. every feature it names is
    /// present.
    pub fn mayiuse(&self, isa: IsaLevel) -> bool {
        self.mask & isa.features() == isa.features()
    }

    /// Widest level usable at full vector width, if any.
    pub fn best_level(&self) -> Option<IsaLevel> {
        IsaLevel::ALL.iter().rev().copied().find(|&l| self.mayiuse(l))
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_feature_mask() -> u32 {
    let mut mask = 0;
    if is_x86_feature_detected!("sse4.1") {
        mask |= F_SSE41;
    }
    if is_x86_feature_detected!("avx") {
        mask |= F_AVX;
    }
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        mask |= F_AVX2;
    }
    if is_x86_feature_detected!("avxvnni") {
        mask |= F_VNNI2;
    }
    if is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512vl")
        && is_x86_feature_detected!("avx512bw")
        && is_x86_feature_detected!("avx512dq")
    {
        mask |= F_AVX512;
        if is_x86_feature_detected!("avx512bf16") {
            mask |= F_BF16;
        }
        if is_x86_feature_detected!("avx512fp16") {
            mask |= F_FP16;
        }
    }
    mask
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_feature_mask() -> u32 {
    0
}

/// Process-wide probe cache. Detection runs once; the result never changes.
pub fn host_features() -> &'static CpuFeatures {
    static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();
    FEATURES.get_or_init(CpuFeatures::detect)
}
