//! Pipeline assembly and driving.

use std::sync::Arc;

use tracing::debug;

use super::{
    ConstantFpEncryption, ConstantIntEncryption, Flattening, IndirectBranch,
    IndirectCall, IndirectGlobalVariable, MsRttiScrambler, ObfuscationPass,
};
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::Module;
use crate::options::{ObfuscationOptions, PassFlags};

/// The fixed-order pass pipeline.
///
/// Ordering matters: constant encryption runs before the indirections so
/// the generated cipher globals are never indirected themselves, flattening
/// runs after call and global-variable indirection so the dispatcher blocks
/// stay clean, and before branch indirection so the flattener's own
/// branches are hidden too. The string-encryption slot between the
/// constant-FP pass and call indirection belongs to an external pass.
pub struct ObfuscationPipeline {
    passes: Vec<ObfuscationPass>,
    options: Arc<ObfuscationOptions>,
}

impl ObfuscationPipeline {
    /// Build the pipeline from resolved options, with entropy-seeded
    /// engines.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        Self::build(options, None)
    }

    /// Build the pipeline with deterministic engines derived from `seed`.
    pub fn with_seed(options: Arc<ObfuscationOptions>, seed: u64) -> Self {
        Self::build(options, Some(seed))
    }

    fn build(options: Arc<ObfuscationOptions>, seed: Option<u64>) -> Self {
        let mut stream = seed.map(CryptoRandom::from_u64);
        let mut next_rng = || match &mut stream {
            Some(s) => CryptoRandom::from_u64(s.get_uint64()),
            None => CryptoRandom::from_entropy(),
        };

        let mut passes: Vec<ObfuscationPass> = vec![
            ObfuscationPass::Function(Box::new(ConstantIntEncryption::with_rng(
                options.clone(),
                next_rng(),
            ))),
            ObfuscationPass::Function(Box::new(IndirectGlobalVariable::with_rng(
                options.clone(),
                next_rng(),
            ))),
            ObfuscationPass::Function(Box::new(ConstantFpEncryption::with_rng(
                options.clone(),
                next_rng(),
            ))),
            // String encryption would slot in here; it lives outside this
            // crate.
            ObfuscationPass::Function(Box::new(IndirectCall::with_rng(
                options.clone(),
                next_rng(),
            ))),
            ObfuscationPass::Function(Box::new(Flattening::with_rng(
                options.clone(),
                next_rng(),
            ))),
            ObfuscationPass::Function(Box::new(IndirectBranch::with_rng(
                options.clone(),
                next_rng(),
            ))),
        ];
        if options.rtti_opt().is_enabled() {
            passes.push(ObfuscationPass::Module(Box::new(MsRttiScrambler::new(
                options.clone(),
            ))));
        }
        ObfuscationPipeline { passes, options }
    }

    /// Build from driver flags; `None` when the pipeline is not enabled.
    pub fn from_flags(flags: &PassFlags) -> Result<Option<Self>, ObfuscationError> {
        if !flags.pipeline_enabled() {
            return Ok(None);
        }
        let options = Arc::new(flags.resolve_options()?);
        Ok(Some(Self::new(options)))
    }

    /// The shared options.
    pub fn options(&self) -> &ObfuscationOptions {
        &self.options
    }

    /// Run every pass over the module, then finalize them all.
    pub fn run(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        let mut changed = false;
        for pass in &mut self.passes {
            debug!(pass = pass.name(), "running obfuscation pass");
            match pass {
                ObfuscationPass::Function(p) => {
                    changed |= p.do_initialization(module)?;
                    for f in module.func_ids() {
                        changed |= p.run_on_function(module, f)?;
                    }
                }
                ObfuscationPass::Module(p) => {
                    changed |= p.run_on_module(module)?;
                }
            }
        }
        for pass in &mut self.passes {
            changed |= match pass {
                ObfuscationPass::Function(p) => p.do_finalization(module)?,
                ObfuscationPass::Module(p) => p.do_finalization(module)?,
            };
        }
        Ok(changed)
    }
}

/// Entry point for a host driver: resolve flags, run the pipeline if
/// enabled.
pub fn run_obfuscation(module: &mut Module, flags: &PassFlags) -> Result<bool, ObfuscationError> {
    match ObfuscationPipeline::from_flags(flags)? {
        Some(mut pipeline) => pipeline.run(module),
        None => Ok(false),
    }
}
