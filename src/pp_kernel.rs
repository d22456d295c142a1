//! Fused output-stage kernel: bias add plus a post-op chain applied to one
//! row of f32 destination values, JIT-compiled once per descriptor.
//!
//! The emitted code walks the row a full vector at a time and finishes with
//! a masked tail: an opmask on the 512-bit level, `vmaskmovps` against an
//! in-code mask table on the VEX levels, and on the baseline level a full
//! load with a byte-masked `maskmovdqu` store. The baseline tail load may
//! read up to 12 bytes past the end of the row; callers pad the
//! destination buffer accordingly.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;

use iced_x86::code_asm::*;

use crate::executable::ExecutableBuffer;
use crate::injector::{
    ApplyParams, AuxDataParams, AuxRegParams, BinaryDynParams, BinaryStaticParams,
    EltwiseInjector, EltwiseStaticParams, InjectorFactory, OcOffset, VecIndexSet,
};
use crate::isa::{CpuFeatures, IsaLevel, VectorWidth};
use crate::post_ops::{BroadcastStrategy, DataType, DstLayout, PostOpEntry, PostOpKind, PostOpList};
use crate::regalloc::RegisterArena;
use crate::regmap::{xmm_reg, ymm_reg, Gpr, JitError};
use crate::validator::{post_ops_ok, PostOpsOkArgs};
use crate::vecasm::VecAsm;

/// Argument block read by the emitted code. One invocation finalizes `len`
/// consecutive values of a single output channel.
#[repr(C)]
pub struct PpKernelArgs {
    pub dst: *mut f32,
    /// Ignored when the kernel was built without bias.
    pub bias: *const f32,
    pub len: usize,
    /// Output-channel index used for bias and every per-channel parameter.
    pub oc_offset: usize,
    /// One pointer per depthwise/quantization entry, in list order.
    pub post_ops_data: *const *const c_void,
    /// One pointer per binary/prelu entry, in list order.
    pub binary_rhs: *const *const c_void,
}

/// Signature of a compiled output-stage function.
///
/// ```text
/// fn(args: *const PpKernelArgs)
/// ```
pub type PpKernelFn = unsafe extern "C" fn(*const PpKernelArgs);

/// Build-time description of one fused output stage.
#[derive(Clone, Debug)]
pub struct PpKernelDesc {
    pub post_ops: PostOpList,
    pub with_bias: bool,
    pub dst_layout: DstLayout,
}

const ACCEPTED_KINDS: [PostOpKind; 5] = [
    PostOpKind::Eltwise,
    PostOpKind::Binary,
    PostOpKind::Prelu,
    PostOpKind::Depthwise,
    PostOpKind::Quantization,
];

const ENABLED_BROADCASTS: [BroadcastStrategy; 3] = [
    BroadcastStrategy::Scalar,
    BroadcastStrategy::PerChannel,
    BroadcastStrategy::PerChannelSpatial,
];

const CANDIDATES: [(IsaLevel, VectorWidth); 3] = [
    (IsaLevel::Avx512Core, VectorWidth::Zmm),
    (IsaLevel::Avx2, VectorWidth::Ymm),
    (IsaLevel::Sse41, VectorWidth::Xmm),
];

/// A JIT-compiled fused output stage.
pub struct PpKernel {
    code: ExecutableBuffer,
    entry: PpKernelFn,
    isa: IsaLevel,
    width: VectorWidth,
}

impl PpKernel {
    /// Compile the widest available kernel for `desc`. `Ok(None)` means no
    /// level both runs on this host and accepts the chain; the caller falls
    /// back to an unfused path.
    pub fn create(
        features: &CpuFeatures,
        desc: &PpKernelDesc,
    ) -> Result<Option<Box<Self>>, JitError> {
        for (isa, width) in CANDIDATES {
            if !features.mayiuse(isa) {
                continue;
            }
            let ok = post_ops_ok(&PostOpsOkArgs {
                isa,
                accepted_kinds: &ACCEPTED_KINDS,
                post_ops: &desc.post_ops,
                dst_layout: desc.dst_layout,
                sum_at_pos_0_only: false,
                sum_requires_scale_one: false,
                sum_requires_zp_zero: false,
                sum_requires_same_params: false,
                enabled_broadcasts: &ENABLED_BROADCASTS,
            });
            if !ok {
                log::debug!("Fused output stage fallback: chain rejected at {isa:?}");
                continue;
            }
            return Self::build(features, desc, isa, width).map(|k| Some(Box::new(k)));
        }
        Ok(None)
    }

    pub fn isa(&self) -> IsaLevel {
        self.isa
    }

    pub fn width(&self) -> VectorWidth {
        self.width
    }

    /// Size of the compiled code region in bytes.
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Execute the compiled stage.
    ///
    /// # Safety
    /// Every pointer in `args` must be valid for the built descriptor: `dst`
    /// writable for `len` values (plus tail padding on the baseline level),
    /// one data pointer per depthwise/quantization entry, one rhs pointer
    /// per binary/prelu entry, and per-channel arrays long enough for
    /// `oc_offset`.
    #[inline]
    pub unsafe fn run(&self, args: &PpKernelArgs) {
        (self.entry)(args as *const PpKernelArgs)
    }

    /// Convenience wrapper building the argument block in place.
    ///
    /// # Safety
    /// Same contract as [`PpKernel::run`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn run_row(
        &self,
        dst: *mut f32,
        bias: *const f32,
        len: usize,
        oc_offset: usize,
        post_ops_data: *const *const c_void,
        binary_rhs: *const *const c_void,
    ) {
        let args = PpKernelArgs { dst, bias, len, oc_offset, post_ops_data, binary_rhs };
        self.run(&args)
    }

    fn build(
        features: &CpuFeatures,
        desc: &PpKernelDesc,
        isa: IsaLevel,
        width: VectorWidth,
    ) -> Result<Self, JitError> {
        let mut asm = CodeAssembler::new(64)?;
        let lanes = width.f32_lanes();

        let mut arena = RegisterArena::new(0..isa.max_vec_regs());
        if isa == IsaLevel::Sse41 {
            // The baseline prelu path stages weights in register 0.
            arena.reserve(0);
        }
        let vreg_dst = arena.take_low();
        let vreg_bias = if desc.with_bias { Some(arena.take_low()) } else { None };
        let vreg_mask = if isa.has_mask_regs() { None } else { Some(arena.take_low()) };

        let eltwise_aux = desc
            .post_ops
            .iter()
            .map(|e| match e {
                PostOpEntry::Eltwise { alg, .. } => EltwiseInjector::aux_vecs_needed(*alg),
                _ => 0,
            })
            .max()
            .unwrap_or(0);
        let aux_vecs: Vec<usize> = (0..eltwise_aux).map(|_| arena.take_low()).collect();
        let eltwise_params =
            EltwiseStaticParams { table_reg: Gpr::R11, mask_reg: 2, aux_vecs };

        let binary_params = if desc.post_ops.iter().any(|e| e.takes_rhs_slot()) {
            Some(BinaryStaticParams {
                param_reg: Gpr::Rsi,
                rhs_ptrs_offset: mem::offset_of!(PpKernelArgs, binary_rhs) as u32,
                addr_reg: Gpr::R12,
                helper_vec: arena.take_low(),
                prelu_helper_vec: arena.take_low(),
                tail_size: 0,
                tail_opmask: 1,
                dst_layout: desc.dst_layout,
            })
        } else {
            None
        };

        let aux_regs = AuxRegParams {
            reg_weights: Gpr::R14,
            reg_bias: Gpr::R15,
            vec_weights: arena.take_high(),
            vec_bias: arena.take_high(),
        };

        let mut composite = InjectorFactory::create(
            isa,
            width,
            features,
            &desc.post_ops,
            eltwise_params,
            binary_params,
            aux_regs,
            HashMap::new(),
        )?;

        let apply = ApplyParams {
            binary: BinaryDynParams { oc_offset: Some(Gpr::R9), ..Default::default() },
            aux: AuxDataParams {
                data_reg: Gpr::Rax,
                oc_offset: Some(OcOffset::Reg(Gpr::R9)),
                ..Default::default()
            },
            dst_dt: DataType::F32,
            broadcast: true,
        };
        let idx_set: VecIndexSet = [vreg_dst].into_iter().collect();

        let mut main_loop = asm.create_label();
        let mut tail = asm.create_label();
        let mut done = asm.create_label();
        let mut mask_table = asm.create_label();

        asm.push(rbx)?;
        asm.push(r12)?;
        asm.push(r13)?;
        asm.push(r14)?;
        asm.push(r15)?;
        asm.mov(rsi, rdi)?;
        asm.mov(rdx, qword_ptr(rdi + mem::offset_of!(PpKernelArgs, dst) as i32))?;
        if desc.with_bias {
            asm.mov(rbx, qword_ptr(rdi + mem::offset_of!(PpKernelArgs, bias) as i32))?;
        }
        asm.mov(r8, qword_ptr(rdi + mem::offset_of!(PpKernelArgs, len) as i32))?;
        asm.mov(r9, qword_ptr(rdi + mem::offset_of!(PpKernelArgs, oc_offset) as i32))?;
        asm.mov(rax, qword_ptr(rdi + mem::offset_of!(PpKernelArgs, post_ops_data) as i32))?;

        if let Some(vb) = vreg_bias {
            let mut v = VecAsm::new(&mut asm, isa, width);
            v.broadcast_ss(vb, ptr(rbx + r9 * 4))?;
        }

        asm.set_label(&mut main_loop)?;
        asm.cmp(r8, lanes as i32)?;
        asm.jb(tail)?;
        {
            let mut v = VecAsm::new(&mut asm, isa, width);
            v.load(vreg_dst, ptr(rdx))?;
            if let Some(vb) = vreg_bias {
                v.addps(vreg_dst, vreg_dst, vb)?;
            }
        }
        composite.compute_vector_set(&mut asm, &idx_set, &apply)?;
        {
            let mut v = VecAsm::new(&mut asm, isa, width);
            v.store(ptr(rdx), vreg_dst)?;
        }
        asm.add(rdx, width.bytes() as i32)?;
        asm.sub(r8, lanes as i32)?;
        asm.jmp(main_loop)?;

        asm.set_label(&mut tail)?;
        asm.test(r8, r8)?;
        asm.je(done)?;
        if isa.has_mask_regs() {
            // k1 = (1 << remainder) - 1
            asm.mov(rcx, r8)?;
            asm.mov(r10, 1i64)?;
            asm.shl(r10, cl)?;
            asm.sub(r10, 1i32)?;
            asm.kmovq(k1, r10)?;
            {
                let mut v = VecAsm::new(&mut asm, isa, width);
                v.load_tail(vreg_dst, ptr(rdx), 1)?;
                if let Some(vb) = vreg_bias {
                    v.addps(vreg_dst, vreg_dst, vb)?;
                }
            }
            composite.compute_vector_set(&mut asm, &idx_set, &apply)?;
            let mut v = VecAsm::new(&mut asm, isa, width);
            v.store_tail(ptr(rdx), vreg_dst, 1)?;
        } else {
            let mask = vreg_mask.ok_or_else(|| {
                JitError::Unsupported("tail mask register missing below the opmask levels".into())
            })?;
            // Window into the ones-then-zeros table selecting `remainder`
            // live elements.
            asm.mov(rcx, 8i64)?;
            asm.sub(rcx, r8)?;
            asm.shl(rcx, 2u32)?;
            asm.lea(r13, ptr(mask_table))?;
            if isa == IsaLevel::Sse41 {
                {
                    let mut v = VecAsm::new(&mut asm, isa, width);
                    v.load(vreg_dst, ptr(rdx))?;
                    if let Some(vb) = vreg_bias {
                        v.addps(vreg_dst, vreg_dst, vb)?;
                    }
                }
                composite.compute_vector_set(&mut asm, &idx_set, &apply)?;
                asm.movups(xmm_reg(mask)?, xmmword_ptr(r13 + rcx))?;
                asm.mov(rdi, rdx)?;
                asm.maskmovdqu(xmm_reg(vreg_dst)?, xmm_reg(mask)?)?;
            } else {
                asm.vmovups(ymm_reg(mask)?, ptr(r13 + rcx))?;
                asm.vmaskmovps(ymm_reg(vreg_dst)?, ymm_reg(mask)?, ptr(rdx))?;
                if let Some(vb) = vreg_bias {
                    let mut v = VecAsm::new(&mut asm, isa, width);
                    v.addps(vreg_dst, vreg_dst, vb)?;
                }
                composite.compute_vector_set(&mut asm, &idx_set, &apply)?;
                asm.vmaskmovps(ptr(rdx), ymm_reg(mask)?, ymm_reg(vreg_dst)?)?;
            }
        }

        asm.set_label(&mut done)?;
        asm.pop(r15)?;
        asm.pop(r14)?;
        asm.pop(r13)?;
        asm.pop(r12)?;
        asm.pop(rbx)?;
        asm.ret()?;

        composite.prepare_table(&mut asm, true)?;
        if !isa.has_mask_regs() {
            asm.set_label(&mut mask_table)?;
            asm.db(&[0xFFu8; 32])?;
            asm.db(&[0u8; 32])?;
        }

        let bytes = asm.assemble(0)?;
        let code = ExecutableBuffer::new(&bytes)?;
        // SAFETY: the buffer holds the code assembled above; every
        // label-relative reference is internal, so the blob runs at any
        // load address.
        let entry: PpKernelFn = unsafe { mem::transmute(code.as_ptr()) };
        Ok(PpKernel { code, entry, isa, width })
    }
}
