//! The composite injector: walks an ordered post-op list and asks each
//! entry's emitter to rewrite a set of value registers in place. Owns the
//! per-kind emitter instances for one compiled kernel variant, plus the
//! stack bracket that parks auxiliary data pointers below the frame for the
//! duration of the emitted loop body.
//!
//! `InjectorFactory` sits in front of the constructors and picks the
//! instruction set: the requested level when the host has it, otherwise the
//! first runtime-available level in the width class's priority order.

use std::collections::HashMap;
use std::ops::Range;

use iced_x86::code_asm::*;

use crate::isa::{CpuFeatures, IsaLevel, VectorWidth};
use crate::post_ops::{EltwiseAlg, PostOpEntry, PostOpKind, PostOpList};
use crate::regmap::{Gpr, JitError};

use super::{
    ApplyParams, AuxRegParams, BinaryInjector, BinaryStaticParams, DepthwiseInjector,
    EltwiseInjector, EltwiseStaticParams, QuantizationInjector, VecIndexSet,
};

/// Caller-supplied emitter for op kinds the composite does not own. The
/// closure appends the instructions for one application of its op.
pub type LambdaInjector = Box<dyn Fn(&mut CodeAssembler) -> Result<(), JitError>>;

/// How eltwise emitters are looked up while walking the list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EltwiseKeying {
    /// One emitter per list position. Repeated algorithms with different
    /// scalar parameters stay distinct.
    ByPosition,
    /// One emitter per algorithm; the first entry's parameters win.
    ByAlgorithm,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EltwiseKey {
    Position(usize),
    Algorithm(EltwiseAlg),
}

pub struct CompositeInjector {
    isa: IsaLevel,
    width: VectorWidth,
    post_ops: PostOpList,
    keying: EltwiseKeying,
    eltwise: Vec<(EltwiseKey, EltwiseInjector)>,
    binary: Option<BinaryInjector>,
    depthwise: Vec<DepthwiseInjector>,
    quantization: Vec<QuantizationInjector>,
    lambdas: HashMap<PostOpKind, LambdaInjector>,
    aux_regs: AuxRegParams,
    stack_slots: usize,
}

impl CompositeInjector {
    /// Lookup-by-algorithm form for lists without binary operands: eltwise,
    /// depthwise, quantization, plus silently skipped sum/custom entries.
    pub fn new_simple(
        isa: IsaLevel,
        width: VectorWidth,
        post_ops: PostOpList,
        eltwise_params: EltwiseStaticParams,
        aux_regs: AuxRegParams,
    ) -> Result<Self, JitError> {
        assert!(
            !post_ops.iter().any(|e| e.takes_rhs_slot()),
            "binary and prelu entries need the full constructor"
        );
        let eltwise = Self::build_eltwise(
            isa,
            width,
            &post_ops,
            &eltwise_params,
            EltwiseKeying::ByAlgorithm,
        )?;
        let (depthwise, quantization) = Self::build_channelwise(isa, width, &post_ops);
        Ok(Self {
            isa,
            width,
            post_ops,
            keying: EltwiseKeying::ByAlgorithm,
            eltwise,
            binary: None,
            depthwise,
            quantization,
            lambdas: HashMap::new(),
            aux_regs,
            stack_slots: 0,
        })
    }

    /// Lookup-by-position form carrying the binary collaborator and any
    /// caller-registered emitters for sum/custom entries.
    pub fn new_full(
        isa: IsaLevel,
        width: VectorWidth,
        post_ops: PostOpList,
        eltwise_params: EltwiseStaticParams,
        binary_params: Option<BinaryStaticParams>,
        aux_regs: AuxRegParams,
        lambdas: HashMap<PostOpKind, LambdaInjector>,
    ) -> Result<Self, JitError> {
        let mask_reg = eltwise_params.mask_reg;
        let eltwise =
            Self::build_eltwise(isa, width, &post_ops, &eltwise_params, EltwiseKeying::ByPosition)?;
        let binary = if post_ops.iter().any(|e| e.takes_rhs_slot()) {
            let params = binary_params.ok_or_else(|| {
                JitError::Unsupported(
                    "binary/prelu entries need rhs collaborator parameters".into(),
                )
            })?;
            Some(BinaryInjector::new(isa, width, params)?)
        } else {
            None
        };
        if let Some(b) = &binary {
            if !eltwise.is_empty() && isa.has_mask_regs() && b.tail_size() > 0 {
                assert!(
                    b.tail_opmask() != mask_reg,
                    "eltwise mask register k{mask_reg} aliases the binary tail mask"
                );
            }
        }
        let (depthwise, quantization) = Self::build_channelwise(isa, width, &post_ops);
        Ok(Self {
            isa,
            width,
            post_ops,
            keying: EltwiseKeying::ByPosition,
            eltwise,
            binary,
            depthwise,
            quantization,
            lambdas,
            aux_regs,
            stack_slots: 0,
        })
    }

    fn build_eltwise(
        isa: IsaLevel,
        width: VectorWidth,
        post_ops: &PostOpList,
        params: &EltwiseStaticParams,
        keying: EltwiseKeying,
    ) -> Result<Vec<(EltwiseKey, EltwiseInjector)>, JitError> {
        let mut out: Vec<(EltwiseKey, EltwiseInjector)> = Vec::new();
        for (pos, entry) in post_ops.iter().enumerate() {
            if let PostOpEntry::Eltwise { alg, alpha, beta } = entry {
                let key = match keying {
                    EltwiseKeying::ByPosition => EltwiseKey::Position(pos),
                    EltwiseKeying::ByAlgorithm => EltwiseKey::Algorithm(*alg),
                };
                if out.iter().any(|(k, _)| *k == key) {
                    continue;
                }
                let inj = EltwiseInjector::new(isa, width, *alg, *alpha, *beta, params.clone())?;
                out.push((key, inj));
            }
        }
        Ok(out)
    }

    fn build_channelwise(
        isa: IsaLevel,
        width: VectorWidth,
        post_ops: &PostOpList,
    ) -> (Vec<DepthwiseInjector>, Vec<QuantizationInjector>) {
        let mut depthwise = Vec::new();
        let mut quantization = Vec::new();
        for entry in post_ops {
            match entry {
                PostOpEntry::Depthwise { alg, weights_offset, bias_offset } => {
                    depthwise.push(DepthwiseInjector::new(
                        isa,
                        width,
                        *alg,
                        *weights_offset,
                        *bias_offset,
                    ));
                }
                PostOpEntry::Quantization {
                    alg,
                    crop_low,
                    crop_high,
                    input_scale,
                    input_shift,
                    output_scale,
                    output_shift,
                } => {
                    quantization.push(QuantizationInjector::new(
                        isa,
                        width,
                        *alg,
                        *crop_low,
                        *crop_high,
                        *input_scale,
                        *input_shift,
                        *output_scale,
                        *output_shift,
                    ));
                }
                _ => {}
            }
        }
        (depthwise, quantization)
    }

    fn eltwise_mut(&mut self, key: EltwiseKey) -> Option<&mut EltwiseInjector> {
        self.eltwise.iter_mut().find(|(k, _)| *k == key).map(|(_, inj)| inj)
    }

    pub fn isa(&self) -> IsaLevel {
        self.isa
    }

    pub fn width(&self) -> VectorWidth {
        self.width
    }

    pub fn post_ops(&self) -> &PostOpList {
        &self.post_ops
    }

    pub fn has_binary(&self) -> bool {
        self.binary.is_some()
    }

    /// Auxiliary data-table slots the caller must populate per invocation.
    pub fn aux_slot_count(&self) -> usize {
        self.post_ops.data_slot_count()
    }

    /// Slots currently parked on the stack by the push bracket.
    pub fn stack_slot_count(&self) -> usize {
        self.stack_slots
    }

    /// Register (or replace) the emitter callback for a kind the composite
    /// does not own. Affects every later apply call on this injector.
    pub fn set_lambda_injector(&mut self, kind: PostOpKind, callback: LambdaInjector) {
        self.lambdas.insert(kind, callback);
    }

    /// Apply the whole list to one register with default apply parameters.
    pub fn compute_vector(&mut self, asm: &mut CodeAssembler, idx: usize) -> Result<(), JitError> {
        let idxs: VecIndexSet = [idx].into_iter().collect();
        self.compute_vector_set(asm, &idxs, &ApplyParams::default())
    }

    /// Apply the whole list to a contiguous register range.
    pub fn compute_vector_range(
        &mut self,
        asm: &mut CodeAssembler,
        range: Range<usize>,
    ) -> Result<(), JitError> {
        let idxs: VecIndexSet = range.collect();
        self.compute_vector_set(asm, &idxs, &ApplyParams::default())
    }

    /// Apply every post-op, in list order, to every register in `idxs`.
    ///
    /// Sum and custom entries go to their registered lambda when one exists
    /// and are skipped silently otherwise; sum folding normally lives in the
    /// surrounding kernel's destination load.
    pub fn compute_vector_set(
        &mut self,
        asm: &mut CodeAssembler,
        idxs: &VecIndexSet,
        apply: &ApplyParams,
    ) -> Result<(), JitError> {
        let entries: Vec<PostOpEntry> = self.post_ops.entries().to_vec();
        let total = entries.len();
        let mut rhs_slot = 0usize;
        let mut data_slot = 0usize;
        let mut dw_i = 0usize;
        let mut q_i = 0usize;
        for (pos, entry) in entries.iter().enumerate() {
            let is_last = pos + 1 == total;
            match entry {
                PostOpEntry::Eltwise { alg, .. } => {
                    let key = match self.keying {
                        EltwiseKeying::ByPosition => EltwiseKey::Position(pos),
                        EltwiseKeying::ByAlgorithm => EltwiseKey::Algorithm(*alg),
                    };
                    let inj = self.eltwise_mut(key).ok_or_else(|| {
                        JitError::Unsupported(format!("no eltwise emitter for {alg:?}"))
                    })?;
                    inj.compute_vector_set(asm, idxs)?;
                }
                PostOpEntry::Binary { alg, broadcast, .. } => {
                    let inj = self.binary.as_ref().ok_or_else(|| {
                        JitError::Unsupported("binary entry without collaborator".into())
                    })?;
                    for &idx in idxs {
                        inj.compute_binary(asm, *alg, *broadcast, rhs_slot, idx, &apply.binary)?;
                    }
                    rhs_slot += 1;
                }
                PostOpEntry::Prelu { broadcast } => {
                    let inj = self.binary.as_ref().ok_or_else(|| {
                        JitError::Unsupported("prelu entry without collaborator".into())
                    })?;
                    for &idx in idxs {
                        inj.compute_prelu(asm, *broadcast, rhs_slot, idx, &apply.binary)?;
                    }
                    rhs_slot += 1;
                }
                PostOpEntry::Depthwise { .. } => {
                    let inj = &self.depthwise[dw_i];
                    dw_i += 1;
                    inj.init_ptrs(asm, &self.aux_regs, &apply.aux, data_slot)?;
                    for &idx in idxs {
                        inj.compute(asm, idx, &self.aux_regs, apply)?;
                    }
                    data_slot += 1;
                }
                PostOpEntry::Quantization { .. } => {
                    let inj = &self.quantization[q_i];
                    q_i += 1;
                    inj.emit(asm, idxs, &self.aux_regs, apply, data_slot, is_last)?;
                    data_slot += 1;
                }
                PostOpEntry::Sum { .. } | PostOpEntry::Custom { .. } => {
                    if let Some(f) = self.lambdas.get(&entry.kind()) {
                        f(asm)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy the auxiliary data pointers from the caller's argument block to
    /// freshly reserved stack slots, so emitted code can address them
    /// rsp-relative. A list with no depthwise/quantization entries emits
    /// nothing. Pairs with `reset_stack_pointer`.
    pub fn push_post_ops_data_on_stack(
        &mut self,
        asm: &mut CodeAssembler,
        args_reg: Gpr,
        args_disp: i32,
        tmp_a: Gpr,
        tmp_b: Gpr,
    ) -> Result<(), JitError> {
        let slots = self.post_ops.data_slot_count();
        self.stack_slots = slots;
        if slots == 0 {
            return Ok(());
        }
        let a = tmp_a.reg64();
        let b = tmp_b.reg64();
        // The source block may itself be rsp-relative; take its address
        // before the frame moves.
        asm.lea(a, ptr(args_reg.reg64() + args_disp))?;
        asm.sub(rsp, (slots * 8) as i32)?;
        for i in 0..slots {
            asm.mov(b, qword_ptr(a + (i * 8) as i32))?;
            asm.mov(qword_ptr(rsp + (i * 8) as i32), b)?;
        }
        Ok(())
    }

    /// Release the slots reserved by the matching push. One reset per push.
    pub fn reset_stack_pointer(&self, asm: &mut CodeAssembler) -> Result<(), JitError> {
        if self.stack_slots == 0 {
            return Ok(());
        }
        asm.add(rsp, (self.stack_slots * 8) as i32)?;
        Ok(())
    }

    /// Emit every eltwise constant table. Must run once per kernel, after
    /// the kernel's `ret`. With `generate` false nothing is materialized;
    /// only legal when no emitted instruction referenced a table.
    pub fn prepare_table(
        &mut self,
        asm: &mut CodeAssembler,
        generate: bool,
    ) -> Result<(), JitError> {
        if !generate {
            return Ok(());
        }
        for (_, inj) in self.eltwise.iter_mut() {
            inj.prepare_table(asm)?;
        }
        Ok(())
    }
}

/// Worst-case number of scratch vector registers any single entry needs
/// while it runs. Entries execute serially, so one scratch set is shared
/// across the whole list.
pub fn aux_vec_count(ops: &PostOpList) -> usize {
    ops.iter()
        .map(|e| match e {
            PostOpEntry::Eltwise { alg, .. } => EltwiseInjector::aux_vecs_needed(*alg),
            PostOpEntry::Binary { .. } => 1,
            PostOpEntry::Prelu { .. }
            | PostOpEntry::Depthwise { .. }
            | PostOpEntry::Quantization { .. } => 2,
            PostOpEntry::Sum { .. } | PostOpEntry::Custom { .. } => 0,
        })
        .max()
        .unwrap_or(0)
}

/// Builds composite injectors against what the host actually has.
pub struct InjectorFactory;

impl InjectorFactory {
    pub const ZMM_PRIORITY: [IsaLevel; 3] =
        [IsaLevel::Avx512CoreFp16, IsaLevel::Avx512CoreBf16, IsaLevel::Avx512Core];
    pub const YMM_PRIORITY: [IsaLevel; 5] = [
        IsaLevel::Avx512CoreFp16,
        IsaLevel::Avx512Core,
        IsaLevel::Avx2Vnni2,
        IsaLevel::Avx2,
        IsaLevel::Avx,
    ];
    pub const XMM_PRIORITY: [IsaLevel; 6] = [
        IsaLevel::Avx512CoreFp16,
        IsaLevel::Avx512Core,
        IsaLevel::Avx2Vnni2,
        IsaLevel::Avx2,
        IsaLevel::Avx,
        IsaLevel::Sse41,
    ];

    pub fn priority(width: VectorWidth) -> &'static [IsaLevel] {
        match width {
            VectorWidth::Zmm => &Self::ZMM_PRIORITY,
            VectorWidth::Ymm => &Self::YMM_PRIORITY,
            VectorWidth::Xmm => &Self::XMM_PRIORITY,
        }
    }

    /// Build a composite injector at `requested` when that level belongs to
    /// the width class's priority list; the exact pass does not consult the
    /// host, so a caller can force one specialization deterministically.
    /// Requests outside the list take the first runtime-available level in
    /// priority order instead, since not every level has an instance at every
    /// width. Aborts when no listed level is available at all: the caller
    /// asked for code generation on a host that cannot run any variant.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        requested: IsaLevel,
        width: VectorWidth,
        features: &CpuFeatures,
        post_ops: &PostOpList,
        eltwise_params: EltwiseStaticParams,
        binary_params: Option<BinaryStaticParams>,
        aux_regs: AuxRegParams,
        lambdas: HashMap<PostOpKind, LambdaInjector>,
    ) -> Result<CompositeInjector, JitError> {
        let list = Self::priority(width);
        let selected = if list.contains(&requested) {
            requested
        } else {
            match list.iter().copied().find(|&l| features.mayiuse(l)) {
                Some(l) => {
                    log::debug!(
                        "Post-op injector fallback: {requested:?} has no {width:?} instance, \
                         using {l:?}"
                    );
                    l
                }
                None => panic!("no runtime-available instruction set for {width:?} post-ops"),
            }
        };
        CompositeInjector::new_full(
            selected,
            width,
            post_ops.clone(),
            eltwise_params,
            binary_params,
            aux_regs,
            lambdas,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_zmm(
        requested: IsaLevel,
        features: &CpuFeatures,
        post_ops: &PostOpList,
        eltwise_params: EltwiseStaticParams,
        binary_params: Option<BinaryStaticParams>,
        aux_regs: AuxRegParams,
        lambdas: HashMap<PostOpKind, LambdaInjector>,
    ) -> Result<CompositeInjector, JitError> {
        Self::create(
            requested,
            VectorWidth::Zmm,
            features,
            post_ops,
            eltwise_params,
            binary_params,
            aux_regs,
            lambdas,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_ymm(
        requested: IsaLevel,
        features: &CpuFeatures,
        post_ops: &PostOpList,
        eltwise_params: EltwiseStaticParams,
        binary_params: Option<BinaryStaticParams>,
        aux_regs: AuxRegParams,
        lambdas: HashMap<PostOpKind, LambdaInjector>,
    ) -> Result<CompositeInjector, JitError> {
        Self::create(
            requested,
            VectorWidth::Ymm,
            features,
            post_ops,
            eltwise_params,
            binary_params,
            aux_regs,
            lambdas,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_xmm(
        requested: IsaLevel,
        features: &CpuFeatures,
        post_ops: &PostOpList,
        eltwise_params: EltwiseStaticParams,
        binary_params: Option<BinaryStaticParams>,
        aux_regs: AuxRegParams,
        lambdas: HashMap<PostOpKind, LambdaInjector>,
    ) -> Result<CompositeInjector, JitError> {
        Self::create(
            requested,
            VectorWidth::Xmm,
            features,
            post_ops,
            eltwise_params,
            binary_params,
            aux_regs,
            lambdas,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post_ops::{
        BinaryAlg, BroadcastStrategy, DataType, DepthwiseAlg, DstLayout, QuantAlg, QuantParam,
    };
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

    fn eltwise_params() -> EltwiseStaticParams {
        EltwiseStaticParams { table_reg: Gpr::R11, mask_reg: 2, aux_vecs: vec![8, 9, 10, 11] }
    }

    fn binary_params(tail_size: usize) -> BinaryStaticParams {
        BinaryStaticParams {
            param_reg: Gpr::Rsi,
            rhs_ptrs_offset: 40,
            addr_reg: Gpr::R12,
            helper_vec: 13,
            prelu_helper_vec: 14,
            tail_size,
            tail_opmask: 1,
            dst_layout: DstLayout::ChannelsLast,
        }
    }

    fn aux_regs() -> AuxRegParams {
        AuxRegParams { reg_weights: Gpr::R14, reg_bias: Gpr::R15, vec_weights: 12, vec_bias: 13 }
    }

    fn relu() -> PostOpEntry {
        PostOpEntry::Eltwise { alg: EltwiseAlg::Relu, alpha: 0.0, beta: 0.0 }
    }

    fn add_scalar() -> PostOpEntry {
        PostOpEntry::Binary {
            alg: BinaryAlg::Add,
            broadcast: BroadcastStrategy::Scalar,
            data_type: DataType::F32,
        }
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

    fn mnemonics(asm: &mut CodeAssembler) -> Vec<Mnemonic> {
        decode_all(asm).iter().map(|i| i.mnemonic()).collect()
    }

    #[test]
    fn emission_follows_list_order() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        ops.push(add_scalar()).unwrap();
        let mut inj = CompositeInjector::new_full(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops,
            eltwise_params(),
            Some(binary_params(0)),
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.compute_vector(&mut asm, 3).unwrap();
        assert_eq!(
            mnemonics(&mut asm),
            vec![
                Mnemonic::Vxorps,
                Mnemonic::Vmaxps,
                Mnemonic::Mov,
                Mnemonic::Mov,
                Mnemonic::Vbroadcastss,
                Mnemonic::Vaddps,
            ]
        );

        let mut ops = PostOpList::new();
        ops.push(add_scalar()).unwrap();
        ops.push(relu()).unwrap();
        let mut inj = CompositeInjector::new_full(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops,
            eltwise_params(),
            Some(binary_params(0)),
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.compute_vector(&mut asm, 3).unwrap();
        assert_eq!(
            mnemonics(&mut asm),
            vec![
                Mnemonic::Mov,
                Mnemonic::Mov,
                Mnemonic::Vbroadcastss,
                Mnemonic::Vaddps,
                Mnemonic::Vxorps,
                Mnemonic::Vmaxps,
            ]
        );
    }

    #[test]
    fn unclaimed_sum_is_skipped_and_lambda_runs() {
        let mut ops = PostOpList::new();
        ops.push(PostOpEntry::Sum { scale: 1.0, zero_point: 0 }).unwrap();
        ops.push(relu()).unwrap();

        let mut inj = CompositeInjector::new_simple(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops.clone(),
            eltwise_params(),
            aux_regs(),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.compute_vector(&mut asm, 3).unwrap();
        assert_eq!(mnemonics(&mut asm), vec![Mnemonic::Vxorps, Mnemonic::Vmaxps]);

        let mut inj = CompositeInjector::new_full(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops,
            eltwise_params(),
            None,
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        inj.set_lambda_injector(
            PostOpKind::Sum,
            Box::new(|asm: &mut CodeAssembler| {
                asm.nop()?;
                Ok(())
            }),
        );
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.compute_vector(&mut asm, 3).unwrap();
        assert_eq!(mnemonics(&mut asm), vec![Mnemonic::Nop, Mnemonic::Vxorps, Mnemonic::Vmaxps]);
    }

    #[test]
    fn no_rhs_entries_means_no_collaborator() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        ops.push(PostOpEntry::Quantization {
            alg: QuantAlg::QuantizeDequantize,
            crop_low: QuantParam::shared(0),
            crop_high: QuantParam::shared(4),
            input_scale: QuantParam::shared(8),
            input_shift: QuantParam::shared(12),
            output_scale: QuantParam::shared(16),
            output_shift: QuantParam::shared(20),
        })
        .unwrap();
        let inj = CompositeInjector::new_full(
            IsaLevel::Avx512Core,
            VectorWidth::Zmm,
            ops,
            eltwise_params(),
            Some(binary_params(3)),
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        assert!(!inj.has_binary());
        assert_eq!(inj.aux_slot_count(), 1);
    }

    #[test]
    #[should_panic(expected = "full constructor")]
    fn simple_form_rejects_binary_entries() {
        let mut ops = PostOpList::new();
        ops.push(add_scalar()).unwrap();
        let _ = CompositeInjector::new_simple(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops,
            eltwise_params(),
            aux_regs(),
        );
    }

    #[test]
    #[should_panic(expected = "aliases the binary tail mask")]
    fn mask_aliasing_with_tail_is_fatal() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        ops.push(add_scalar()).unwrap();
        let mut params = binary_params(5);
        params.tail_opmask = 2; // same as the eltwise mask register
        let _ = CompositeInjector::new_full(
            IsaLevel::Avx512Core,
            VectorWidth::Zmm,
            ops,
            eltwise_params(),
            Some(params),
            aux_regs(),
            HashMap::new(),
        );
    }

    #[test]
    fn stack_bracket_balances() {
        let mut ops = PostOpList::new();
        ops.push(PostOpEntry::Depthwise {
            alg: DepthwiseAlg::ScaleShift,
            weights_offset: 0,
            bias_offset: 64,
        })
        .unwrap();
        ops.push(PostOpEntry::Quantization {
            alg: QuantAlg::Quantize,
            crop_low: QuantParam::shared(0),
            crop_high: QuantParam::shared(4),
            input_scale: QuantParam::shared(8),
            input_shift: QuantParam::shared(12),
            output_scale: QuantParam::shared(16),
            output_shift: QuantParam::shared(20),
        })
        .unwrap();
        let mut inj = CompositeInjector::new_simple(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops,
            eltwise_params(),
            aux_regs(),
        )
        .unwrap();

        let mut asm = CodeAssembler::new(64).unwrap();
        inj.push_post_ops_data_on_stack(&mut asm, Gpr::Rdi, 16, Gpr::Rax, Gpr::Rcx).unwrap();
        assert_eq!(inj.stack_slot_count(), 2);
        let instrs = decode_all(&mut asm);
        assert_eq!(instrs[0].mnemonic(), Mnemonic::Lea);
        assert_eq!(instrs[1].mnemonic(), Mnemonic::Sub);
        assert_eq!(instrs[1].immediate32(), 16);
        assert_eq!(instrs.len(), 6);

        let mut asm = CodeAssembler::new(64).unwrap();
        inj.reset_stack_pointer(&mut asm).unwrap();
        let instrs = decode_all(&mut asm);
        assert_eq!(instrs[0].mnemonic(), Mnemonic::Add);
        assert_eq!(instrs[0].immediate32(), 16);
    }

    #[test]
    fn empty_bracket_emits_nothing() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        let mut inj = CompositeInjector::new_simple(
            IsaLevel::Avx2,
            VectorWidth::Ymm,
            ops,
            eltwise_params(),
            aux_regs(),
        )
        .unwrap();
        let mut asm = CodeAssembler::new(64).unwrap();
        inj.push_post_ops_data_on_stack(&mut asm, Gpr::Rdi, 16, Gpr::Rax, Gpr::Rcx).unwrap();
        inj.reset_stack_pointer(&mut asm).unwrap();
        assert_eq!(inj.stack_slot_count(), 0);
        assert!(asm.instructions().is_empty());
    }

    #[test]
    fn factory_prefers_exact_then_falls_back() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        let features =
            CpuFeatures::with_levels(&[IsaLevel::Sse41, IsaLevel::Avx, IsaLevel::Avx2]);

        // Listed at this width: taken as requested.
        let inj = InjectorFactory::create_ymm(
            IsaLevel::Avx,
            &features,
            &ops,
            eltwise_params(),
            None,
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(inj.isa(), IsaLevel::Avx);
        assert_eq!(inj.width(), VectorWidth::Ymm);

        // Sse41 has no Ymm instance: first runtime-available listed level.
        let inj = InjectorFactory::create(
            IsaLevel::Sse41,
            VectorWidth::Ymm,
            &features,
            &ops,
            eltwise_params(),
            None,
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(inj.isa(), IsaLevel::Avx2);
    }

    #[test]
    fn factory_exact_match_ignores_runtime_availability() {
        // A listed level is taken as-is even when the host cannot run it;
        // that is what lets callers force one specialization for testing.
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        let features = CpuFeatures::with_levels(&[IsaLevel::Sse41, IsaLevel::Avx]);
        let inj = InjectorFactory::create(
            IsaLevel::Avx512Core,
            VectorWidth::Ymm,
            &features,
            &ops,
            eltwise_params(),
            None,
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(inj.isa(), IsaLevel::Avx512Core);
    }

    #[test]
    fn factory_out_of_list_request_falls_back() {
        // Avx2 has no Zmm instance, so even on a host that can run Avx2 the
        // factory must substitute a listed level instead of erroring out on
        // an unencodable pair.
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        let features = CpuFeatures::with_levels(&[
            IsaLevel::Sse41,
            IsaLevel::Avx,
            IsaLevel::Avx2,
            IsaLevel::Avx512Core,
        ]);
        let inj = InjectorFactory::create(
            IsaLevel::Avx2,
            VectorWidth::Zmm,
            &features,
            &ops,
            eltwise_params(),
            None,
            aux_regs(),
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(inj.isa(), IsaLevel::Avx512Core);
        assert_eq!(inj.width(), VectorWidth::Zmm);
    }

    #[test]
    #[should_panic(expected = "no runtime-available instruction set")]
    fn factory_aborts_without_any_level() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        let features = CpuFeatures::with_levels(&[]);
        let _ = InjectorFactory::create(
            IsaLevel::Sse41,
            VectorWidth::Zmm,
            &features,
            &ops,
            eltwise_params(),
            None,
            aux_regs(),
            HashMap::new(),
        );
    }

    #[test]
    fn aux_vec_count_is_the_worst_single_entry() {
        let mut ops = PostOpList::new();
        assert_eq!(aux_vec_count(&ops), 0);
        ops.push(relu()).unwrap();
        assert_eq!(aux_vec_count(&ops), 2);
        ops.push(PostOpEntry::Eltwise { alg: EltwiseAlg::Swish, alpha: 1.0, beta: 0.0 }).unwrap();
        assert_eq!(aux_vec_count(&ops), 4);
        ops.push(add_scalar()).unwrap();
        assert_eq!(aux_vec_count(&ops), 4);
    }
}
