//! IR-level code obfuscation.
//!
//! The crate rewrites a small SSA intermediate representation to hinder
//! static analysis of the compiled output: direct references to blocks,
//! callees and globals are hidden behind chains of encrypted lookup tables,
//! scalar constants move into encrypted side globals, control flow is
//! flattened into a keyed dispatcher, and Microsoft RTTI descriptor names
//! are scrambled. Passes are driven by [`passes::ObfuscationPipeline`] from
//! a JSON configuration combined with per-function annotations.

pub mod constenc;
pub mod crypto;
pub mod error;
pub mod ir;
pub mod options;
pub mod pagetable;
pub mod passes;
pub mod transform;

pub mod prelude {
    //! Common imports for driving the pipeline and building test modules.

    pub use crate::crypto::CryptoRandom;
    pub use crate::error::{EvalError, ObfuscationError};
    pub use crate::ir::{
        BasicBlock, BinOp, BlockId, CastKind, Constant, FuncId, Function, FunctionBuilder,
        GlobalId, GlobalVariable, IcmpPred, Inst, InstId, InstKind, Linkage, Module, Operand,
        Signature, Ty, ValueId,
    };
    pub use crate::options::{EffectiveOption, ObfOpt, ObfuscationOptions, PassFlags};
    pub use crate::passes::ObfuscationPipeline;
}
