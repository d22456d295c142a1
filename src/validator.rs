//! Build-time legality check for a post-op chain against a target
//! instruction set and a caller whitelist of accepted kinds.
//!
//! A `false` answer is a local, recoverable decision: the caller falls back
//! to a less-fused kernel. An unresolved destination layout is a contract
//! violation and aborts instead, the same way the emitters treat it.

use crate::injector::{BinaryInjector, EltwiseInjector};
use crate::isa::IsaLevel;
use crate::post_ops::{
    BroadcastStrategy, DataType, DstLayout, PostOpEntry, PostOpKind, PostOpList,
};

pub struct PostOpsOkArgs<'a> {
    pub isa: IsaLevel,
    pub accepted_kinds: &'a [PostOpKind],
    pub post_ops: &'a PostOpList,
    pub dst_layout: DstLayout,
    /// A sum entry is only legal at list position 0.
    pub sum_at_pos_0_only: bool,
    /// Sum entries must carry `scale == 1.0`.
    pub sum_requires_scale_one: bool,
    /// Sum entries must carry `zero_point == 0`.
    pub sum_requires_zp_zero: bool,
    /// Every sum entry must match the first sum's scale and zero-point. One
    /// folded destination load serves all sums, so they cannot differ.
    pub sum_requires_same_params: bool,
    pub enabled_broadcasts: &'a [BroadcastStrategy],
}

/// Whether the whole chain is implementable. Entries are checked in list
/// order and the first rejection decides.
pub fn post_ops_ok(args: &PostOpsOkArgs<'_>) -> bool {
    assert!(
        args.dst_layout != DstLayout::Any,
        "destination layout must be resolved before fusion checks"
    );
    let first_sum = args.post_ops.first_sum();
    for (pos, entry) in args.post_ops.iter().enumerate() {
        let kind = entry.kind();
        if !args.accepted_kinds.contains(&kind) {
            log::debug!("Post-op fusion reject: entry {pos} kind {kind:?} not accepted");
            return false;
        }
        let ok = match entry {
            PostOpEntry::Sum { scale, zero_point } => {
                let mut ok = true;
                if args.sum_at_pos_0_only && pos != 0 {
                    ok = false;
                }
                if args.sum_requires_scale_one && *scale != 1.0 {
                    ok = false;
                }
                if args.sum_requires_zp_zero && *zero_point != 0 {
                    ok = false;
                }
                if args.sum_requires_same_params {
                    if let Some((_, ref_scale, ref_zp)) = first_sum {
                        if *scale != ref_scale || *zero_point != ref_zp {
                            ok = false;
                        }
                    }
                }
                ok
            }
            PostOpEntry::Eltwise { alg, .. } => EltwiseInjector::is_supported(args.isa, *alg),
            PostOpEntry::Binary { broadcast, data_type, .. } => {
                args.enabled_broadcasts.contains(broadcast)
                    && BinaryInjector::is_supported(args.isa, *broadcast, *data_type)
            }
            PostOpEntry::Prelu { broadcast } => {
                args.enabled_broadcasts.contains(broadcast)
                    && BinaryInjector::is_supported(args.isa, *broadcast, DataType::F32)
            }
            PostOpEntry::Depthwise { .. } | PostOpEntry::Quantization { .. } => true,
            PostOpEntry::Custom { .. } => true,
        };
        if !ok {
            log::debug!("Post-op fusion reject: entry {pos} kind {kind:?} parameters");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post_ops::{BinaryAlg, EltwiseAlg};

    const ALL_KINDS: [PostOpKind; 7] = [
        PostOpKind::Sum,
        PostOpKind::Eltwise,
        PostOpKind::Binary,
        PostOpKind::Prelu,
        PostOpKind::Depthwise,
        PostOpKind::Quantization,
        PostOpKind::Custom,
    ];

    const ALL_BROADCASTS: [BroadcastStrategy; 4] = [
        BroadcastStrategy::Scalar,
        BroadcastStrategy::PerChannel,
        BroadcastStrategy::PerChannelSpatial,
        BroadcastStrategy::NoBroadcast,
    ];

    fn args<'a>(isa: IsaLevel, ops: &'a PostOpList) -> PostOpsOkArgs<'a> {
        PostOpsOkArgs {
            isa,
            accepted_kinds: &ALL_KINDS,
            post_ops: ops,
            dst_layout: DstLayout::ChannelsLast,
            sum_at_pos_0_only: false,
            sum_requires_scale_one: false,
            sum_requires_zp_zero: false,
            sum_requires_same_params: false,
            enabled_broadcasts: &ALL_BROADCASTS,
        }
    }

    fn relu() -> PostOpEntry {
        PostOpEntry::Eltwise { alg: EltwiseAlg::Relu, alpha: 0.0, beta: 0.0 }
    }

    fn sum(scale: f32, zero_point: i32) -> PostOpEntry {
        PostOpEntry::Sum { scale, zero_point }
    }

    fn binary(broadcast: BroadcastStrategy) -> PostOpEntry {
        PostOpEntry::Binary { alg: BinaryAlg::Add, broadcast, data_type: DataType::F32 }
    }

    #[test]
    fn accepts_a_plain_chain() {
        let mut ops = PostOpList::new();
        ops.push(sum(1.0, 0)).unwrap();
        ops.push(relu()).unwrap();
        ops.push(binary(BroadcastStrategy::PerChannel)).unwrap();
        assert!(post_ops_ok(&args(IsaLevel::Avx2, &ops)));
    }

    #[test]
    fn rejects_unlisted_kind() {
        let mut ops = PostOpList::new();
        ops.push(relu()).unwrap();
        ops.push(PostOpEntry::Custom { id: 1 }).unwrap();
        let mut a = args(IsaLevel::Avx2, &ops);
        a.accepted_kinds = &[PostOpKind::Eltwise];
        assert!(!post_ops_ok(&a));
    }

    #[test]
    #[should_panic(expected = "layout must be resolved")]
    fn unresolved_layout_is_fatal() {
        let ops = PostOpList::new();
        let mut a = args(IsaLevel::Avx2, &ops);
        a.dst_layout = DstLayout::Any;
        post_ops_ok(&a);
    }

    #[test]
    fn sum_position_flag_is_order_sensitive() {
        let mut ops = PostOpList::new();
        ops.push(sum(1.0, 0)).unwrap();
        ops.push(binary(BroadcastStrategy::PerChannel)).unwrap();
        let mut a = args(IsaLevel::Avx2, &ops);
        a.sum_at_pos_0_only = true;
        a.sum_requires_scale_one = true;
        assert!(post_ops_ok(&a));

        let mut moved = PostOpList::new();
        moved.push(binary(BroadcastStrategy::PerChannel)).unwrap();
        moved.push(sum(1.0, 0)).unwrap();
        let mut a = args(IsaLevel::Avx2, &moved);
        a.sum_at_pos_0_only = true;
        a.sum_requires_scale_one = true;
        assert!(!post_ops_ok(&a));
    }

    #[test]
    fn sum_scale_and_zero_point_flags() {
        let mut ops = PostOpList::new();
        ops.push(sum(0.5, 3)).unwrap();
        assert!(post_ops_ok(&args(IsaLevel::Avx2, &ops)));

        let mut a = args(IsaLevel::Avx2, &ops);
        a.sum_requires_scale_one = true;
        assert!(!post_ops_ok(&a));

        let mut a = args(IsaLevel::Avx2, &ops);
        a.sum_requires_zp_zero = true;
        assert!(!post_ops_ok(&a));
    }

    #[test]
    fn later_sums_are_measured_against_the_first() {
        let mut ops = PostOpList::new();
        ops.push(sum(0.5, 0)).unwrap();
        ops.push(relu()).unwrap();
        ops.push(sum(1.0, 0)).unwrap();
        assert!(post_ops_ok(&args(IsaLevel::Avx2, &ops)));

        let mut a = args(IsaLevel::Avx2, &ops);
        a.sum_requires_same_params = true;
        assert!(!post_ops_ok(&a));

        let mut same = PostOpList::new();
        same.push(sum(0.5, 0)).unwrap();
        same.push(relu()).unwrap();
        same.push(sum(0.5, 0)).unwrap();
        let mut a = args(IsaLevel::Avx2, &same);
        a.sum_requires_same_params = true;
        assert!(post_ops_ok(&a));
    }

    #[test]
    fn binary_broadcast_legality_follows_isa_and_whitelist() {
        let mut ops = PostOpList::new();
        ops.push(binary(BroadcastStrategy::NoBroadcast)).unwrap();
        assert!(post_ops_ok(&args(IsaLevel::Avx2, &ops)));
        assert!(!post_ops_ok(&args(IsaLevel::Sse41, &ops)));

        let mut a = args(IsaLevel::Avx2, &ops);
        a.enabled_broadcasts = &[BroadcastStrategy::Scalar, BroadcastStrategy::PerChannel];
        assert!(!post_ops_ok(&a));
    }

    #[test]
    fn eltwise_list_follows_isa_support() {
        let mut ops = PostOpList::new();
        ops.push(PostOpEntry::Eltwise { alg: EltwiseAlg::Exp, alpha: 0.0, beta: 0.0 }).unwrap();
        assert!(post_ops_ok(&args(IsaLevel::Avx2, &ops)));
        assert!(!post_ops_ok(&args(IsaLevel::Avx, &ops)));
    }

    #[test]
    fn non_float_binary_operand_rejected() {
        let mut ops = PostOpList::new();
        ops.push(PostOpEntry::Binary {
            alg: BinaryAlg::Add,
            broadcast: BroadcastStrategy::Scalar,
            data_type: DataType::S8,
        })
        .unwrap();
        assert!(!post_ops_ok(&args(IsaLevel::Avx2, &ops)));
    }
}
