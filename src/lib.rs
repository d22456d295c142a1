//! epilogue-jit: JIT-compiled post-op chains for CPU compute kernels.
//!
//! This crate emits the output stage of an f32 compute kernel at runtime:
//! - **Runtime ISA Selection**: probes SSE4.1 through AVX-512 once and picks
//!   the widest level that can run the requested chain
//! - **Composable Post-Ops**: eltwise, binary, prelu, depthwise and
//!   quantization entries applied strictly in list order
//! - **Register Contracts**: the surrounding kernel plans its register map
//!   and hands each emitter a fixed set of GPRs and vector indices
//! - **Graceful Fallback**: capability mismatches fall down a per-width
//!   priority list; unfusable chains are reported before code generation
//!
//! # Quick Start
//!
//! ```ignore
//! use epilogue_jit::{
//!     host_features, DstLayout, EltwiseAlg, PostOpEntry, PostOpList, PpKernel, PpKernelDesc,
//! };
//!
//! let mut post_ops = PostOpList::new();
//! post_ops.push(PostOpEntry::Eltwise { alg: EltwiseAlg::Relu, alpha: 0.0, beta: 0.0 })?;
//! let desc = PpKernelDesc { post_ops, with_bias: true, dst_layout: DstLayout::ChannelsLast };
//! let kernel = PpKernel::create(host_features(), &desc)?.unwrap();
//! unsafe { kernel.run_row(dst, bias, len, oc, data_ptrs, rhs_ptrs) };
//! ```

// Register naming and the shared error type
pub mod regmap;
// Instruction-set levels and runtime feature probing
pub mod isa;
// Post-op descriptors
pub mod post_ops;
// Vector register bookkeeping for kernel planning
pub mod regalloc;
// Width/encoding-polymorphic instruction layer
pub mod vecasm;

// Per-kind emitters, the composite walker and the capability factory
pub mod injector;
// Fusion admission checks
pub mod validator;

// W^X code placement
pub mod executable;
// Fused output-stage kernel
pub mod pp_kernel;

pub use regmap::{Gpr, JitError};

pub use isa::{host_features, CpuFeatures, IsaLevel, VectorWidth};

pub use post_ops::{
    BinaryAlg, BroadcastStrategy, DataType, DepthwiseAlg, DstLayout, EltwiseAlg, PostOpEntry,
    PostOpKind, PostOpList, QuantAlg, QuantParam, MAX_POST_OPS,
};

pub use regalloc::RegisterArena;

// Emitter family exports
pub use injector::{
    aux_vec_count, ApplyParams, AuxDataParams, AuxRegParams, BinaryDynParams, BinaryInjector,
    BinaryStaticParams, CompositeInjector, DepthwiseInjector, EltwiseInjector, EltwiseKeying,
    EltwiseStaticParams, InjectorFactory, LambdaInjector, OcOffset, QuantizationInjector,
    VecIndexSet,
};

pub use validator::{post_ops_ok, PostOpsOkArgs};

pub use executable::ExecutableBuffer;

// Fused output stage exports
pub use pp_kernel::{PpKernel, PpKernelArgs, PpKernelDesc, PpKernelFn};
