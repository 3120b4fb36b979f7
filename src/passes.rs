//! The obfuscation passes and their pipeline.
//!
//! Passes come in two shapes, discriminated by variant rather than by an
//! inheritance hierarchy: function passes run module-wide initialization,
//! then visit every function, then finalize; module passes run once per
//! module. The pipeline instantiates them in a fixed order and drives both
//! shapes through [`ObfuscationPipeline::run`].

mod const_fp;
mod const_int;
mod flattening;
mod indirect_branch;
mod indirect_call;
mod indirect_gv;
mod manager;
mod rtti;

pub use const_fp::ConstantFpEncryption;
pub use const_int::ConstantIntEncryption;
pub use flattening::Flattening;
pub use indirect_branch::IndirectBranch;
pub use indirect_call::IndirectCall;
pub use indirect_gv::IndirectGlobalVariable;
pub use manager::{run_obfuscation, ObfuscationPipeline};
pub use rtti::MsRttiScrambler;

use crate::error::ObfuscationError;
use crate::ir::{FuncId, InstKind, Module};

/// A pass that initializes on the module, runs per function, and finalizes
/// on the module.
pub trait FunctionPass {
    /// Pass name for diagnostics.
    fn name(&self) -> &'static str;

    /// Module-wide candidate scan and side-table construction.
    fn do_initialization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError>;

    /// Rewrite one function.
    fn run_on_function(
        &mut self,
        module: &mut Module,
        func: FuncId,
    ) -> Result<bool, ObfuscationError>;

    /// Module-wide cleanup; marks generated globals as compiler-used.
    fn do_finalization(&mut self, _module: &mut Module) -> Result<bool, ObfuscationError> {
        Ok(false)
    }
}

/// A pass that runs once over the whole module.
pub trait ModulePass {
    /// Pass name for diagnostics.
    fn name(&self) -> &'static str;

    /// Rewrite the module.
    fn run_on_module(&mut self, module: &mut Module) -> Result<bool, ObfuscationError>;

    /// Module-wide cleanup.
    fn do_finalization(&mut self, _module: &mut Module) -> Result<bool, ObfuscationError> {
        Ok(false)
    }
}

/// A pipeline entry.
pub enum ObfuscationPass {
    /// Per-function pass.
    Function(Box<dyn FunctionPass>),
    /// Whole-module pass.
    Module(Box<dyn ModulePass>),
}

impl ObfuscationPass {
    /// Pass name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ObfuscationPass::Function(p) => p.name(),
            ObfuscationPass::Module(p) => p.name(),
        }
    }
}

/// Instructions whose operands the constant passes never rewrite.
pub(crate) fn skip_const_site(module: &Module, kind: &InstKind) -> bool {
    kind.is_eh_pad()
        || matches!(kind, InstKind::Alloca { .. } | InstKind::Switch { .. })
        || kind.is_atomic()
        || module.is_intrinsic_call(kind)
}

/// Whether phi operand `index` arrives over an edge whose predecessor ends
/// in a switch; such incomings keep their constants.
pub(crate) fn phi_incoming_from_switch(
    module: &Module,
    func: FuncId,
    kind: &InstKind,
    index: usize,
) -> bool {
    let InstKind::Phi { incomings, .. } = kind else {
        return false;
    };
    let Some((_, pred)) = incomings.get(index) else {
        return false;
    };
    matches!(
        module.func(func).block(*pred).terminator(),
        Some(t) if matches!(t.kind, InstKind::Switch { .. })
    )
}

/// `(is_gep, gep_into_struct)` for the operand skip rules.
pub(crate) fn gep_shape(kind: &InstKind) -> (bool, bool) {
    match kind {
        InstKind::Gep { source_ty, .. } => (true, source_ty.is_struct()),
        _ => (false, false),
    }
}
