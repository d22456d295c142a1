//! Post-operation descriptors.
//!
//! A [`PostOpList`] is the declarative attachment carried by a kernel
//! descriptor: an ordered sequence of fused element-wise stages applied to
//! an accumulator while it is still in vector registers. The list is data
//! only; emission lives in the injector modules.

use crate::regmap::JitError;

/// Hard cap on attached post-ops. Descriptors are small by construction;
/// anything longer is a malformed attachment.
pub const MAX_POST_OPS: usize = 32;

// ── Algorithm catalogs ──────────────────────────────────────────────────────

/// Discriminant used for dispatch tables and accept-lists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PostOpKind {
    Sum,
    Eltwise,
    Binary,
    Prelu,
    Depthwise,
    Quantization,
    Custom,
}

/// Element-wise activation algorithms with native emitters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EltwiseAlg {
    Relu,
    Linear,
    Clip,
    Abs,
    Square,
    Sqrt,
    Round,
    Exp,
    Sigmoid,
    Tanh,
    Swish,
    GeluTanh,
}

/// Per-channel affine stages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DepthwiseAlg {
    ScaleShift,
    Prelu,
}

/// Fake-quantization flavors. `QuantizeDequantize` runs the output affine
/// stage after rounding, mapping values back onto the real axis.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QuantAlg {
    Quantize,
    QuantizeDequantize,
}

/// Two-operand algorithms backed by a right-hand-side tensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinaryAlg {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

/// How a binary/prelu right-hand side maps onto the destination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BroadcastStrategy {
    /// One value for the whole tensor.
    Scalar,
    /// One value per output channel.
    PerChannel,
    /// Per channel, repeated across the spatial extent.
    PerChannelSpatial,
    /// Full tensor, element for element.
    NoBroadcast,
}

/// Storage types the emitters can be asked to produce or consume.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DataType {
    F32,
    Bf16,
    F16,
    S32,
    S8,
    U8,
}

/// Destination memory layout, as far as broadcast legality cares.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DstLayout {
    /// Channels-first plain layout (ncsp).
    ChannelsFirst,
    /// Channels-last plain layout (nspc).
    ChannelsLast,
    /// Channel-blocked layout (nCsp{8,16}c).
    Blocked,
    /// Undecided. Emitters reject this; the layout must be resolved before
    /// code generation starts.
    Any,
}

// ── Entry payloads ──────────────────────────────────────────────────────────

/// One fake-quantization parameter array: where its data lives relative to
/// the op's data pointer, and whether it is indexed by output channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QuantParam {
    pub per_channel: bool,
    /// Byte offset from the op's base data pointer.
    pub offset: u32,
}

impl QuantParam {
    pub const fn shared(offset: u32) -> Self {
        Self { per_channel: false, offset }
    }

    pub const fn per_channel(offset: u32) -> Self {
        Self { per_channel: true, offset }
    }
}

/// One attached post-operation.
#[derive(Clone, PartialEq, Debug)]
pub enum PostOpEntry {
    /// `dst = dst + scale * (prev - zero_point)`, folded into the load of the
    /// existing destination value. Emitted by the surrounding kernel, not by
    /// the injectors; listed here so ordering and validation see it.
    Sum { scale: f32, zero_point: i32 },
    /// `dst = alg(dst)` with up to two scalar parameters.
    Eltwise { alg: EltwiseAlg, alpha: f32, beta: f32 },
    /// `dst = alg(dst, rhs)` with `rhs` loaded from a caller-provided tensor.
    Binary { alg: BinaryAlg, broadcast: BroadcastStrategy, data_type: DataType },
    /// `dst = dst >= 0 ? dst : dst * rhs`, rhs loaded like a binary operand.
    Prelu { broadcast: BroadcastStrategy },
    /// Per-channel affine (`ScaleShift`) or leaky (`Prelu`) stage with
    /// weights/bias arrays reached through the op's data pointer.
    Depthwise { alg: DepthwiseAlg, weights_offset: u32, bias_offset: u32 },
    /// Fake quantization: crop, input affine, round, optional output affine.
    Quantization {
        alg: QuantAlg,
        crop_low: QuantParam,
        crop_high: QuantParam,
        input_scale: QuantParam,
        input_shift: QuantParam,
        output_scale: QuantParam,
        output_shift: QuantParam,
    },
    /// Opaque stage owned by the caller. The composite injector only touches
    /// it through a registered callback.
    Custom { id: u32 },
}

impl PostOpEntry {
    pub fn kind(&self) -> PostOpKind {
        match self {
            PostOpEntry::Sum { .. } => PostOpKind::Sum,
            PostOpEntry::Eltwise { .. } => PostOpKind::Eltwise,
            PostOpEntry::Binary { .. } => PostOpKind::Binary,
            PostOpEntry::Prelu { .. } => PostOpKind::Prelu,
            PostOpEntry::Depthwise { .. } => PostOpKind::Depthwise,
            PostOpEntry::Quantization { .. } => PostOpKind::Quantization,
            PostOpEntry::Custom { .. } => PostOpKind::Custom,
        }
    }

    /// Does this entry consume one slot in the caller's auxiliary data
    /// pointer table? Depthwise and quantization read their parameter blocks
    /// through it. Binary-family ops use the separate rhs pointer table.
    pub fn takes_data_slot(&self) -> bool {
        matches!(self.kind(), PostOpKind::Depthwise | PostOpKind::Quantization)
    }

    /// Does this entry consume one slot in the binary rhs pointer table?
    pub fn takes_rhs_slot(&self) -> bool {
        matches!(self.kind(), PostOpKind::Binary | PostOpKind::Prelu)
    }
}

// ── The list ────────────────────────────────────────────────────────────────

/// Ordered post-op attachment. Application order is list order, always.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct PostOpList {
    entries: Vec<PostOpEntry>,
}

impl PostOpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PostOpEntry) -> Result<(), JitError> {
        if self.entries.len() == MAX_POST_OPS {
            return Err(JitError::Unsupported(format!(
                "post-op list is full ({MAX_POST_OPS} entries)"
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&PostOpEntry> {
        self.entries.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PostOpEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[PostOpEntry] {
        &self.entries
    }

    pub fn contains(&self, kind: PostOpKind) -> bool {
        self.entries.iter().any(|e| e.kind() == kind)
    }

    pub fn count_of(&self, kind: PostOpKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }

    /// Index and payload of the first sum entry, if any. Validation measures
    /// later sums against this one.
    pub fn first_sum(&self) -> Option<(usize, f32, i32)> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            PostOpEntry::Sum { scale, zero_point } => Some((i, *scale, *zero_point)),
            _ => None,
        })
    }

    /// Number of auxiliary data-pointer slots the caller must populate, one
    /// per depthwise/quantization entry in list order.
    pub fn data_slot_count(&self) -> usize {
        self.entries.iter().filter(|e| e.takes_data_slot()).count()
    }

    /// Number of binary rhs-pointer slots, one per binary/prelu entry in
    /// list order.
    pub fn rhs_slot_count(&self) -> usize {
        self.entries.iter().filter(|e| e.takes_rhs_slot()).count()
    }
}

impl<'a> IntoIterator for &'a PostOpList {
    type Item = &'a PostOpEntry;
    type IntoIter = std::slice::Iter<'a, PostOpEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
