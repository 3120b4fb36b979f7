//! Constant floating-point encryption.
//!
//! Same shape as the integer pass: constant expressions are expanded during
//! initialization, candidate instructions are collected module-wide, and
//! every float constant operand is moved into an encrypted side global at
//! rewrite time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::{gep_shape, phi_incoming_from_switch, skip_const_site, FunctionPass};
use crate::constenc::encrypt_constant;
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{Constant, FuncId, InstId, InstKind, Module};
use crate::options::ObfuscationOptions;
use crate::transform::expand_constant_expr;

/// Replaces float constants with encrypted side globals.
pub struct ConstantFpEncryption {
    options: Arc<ObfuscationOptions>,
    rng: CryptoRandom,
    function_sites: HashMap<FuncId, BTreeSet<InstId>>,
}

impl ConstantFpEncryption {
    /// New pass with an entropy-seeded engine.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        Self::with_rng(options, CryptoRandom::from_entropy())
    }

    /// New pass with an explicit engine.
    pub fn with_rng(options: Arc<ObfuscationOptions>, rng: CryptoRandom) -> Self {
        ConstantFpEncryption {
            options,
            rng,
            function_sites: HashMap::new(),
        }
    }
}

impl FunctionPass for ConstantFpEncryption {
    fn name(&self) -> &'static str {
        "ConstantFpEncryption"
    }

    fn do_initialization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        self.function_sites.clear();
        let mut changed = false;
        for f in module.func_ids() {
            let opt = self
                .options
                .to_obfuscate(self.options.cfe_opt(), module, f);
            if !opt.is_enabled() {
                continue;
            }
            changed |= expand_constant_expr(module, f);

            let func = module.func(f);
            for &b in func.layout() {
                for inst in &func.block(b).insts {
                    if skip_const_site(module, &inst.kind) {
                        continue;
                    }
                    let (is_gep, struct_gep) = gep_shape(&inst.kind);
                    for (i, op) in inst.kind.operands().into_iter().enumerate() {
                        if inst.kind.is_bundle_operand(i) {
                            continue;
                        }
                        if is_gep && (i < 2 || struct_gep) {
                            continue;
                        }
                        if phi_incoming_from_switch(module, f, &inst.kind, i) {
                            continue;
                        }
                        if matches!(op.as_const(), Some(Constant::Float(_))) {
                            self.function_sites.entry(f).or_default().insert(inst.id);
                            break;
                        }
                    }
                }
            }
        }
        Ok(changed)
    }

    fn run_on_function(
        &mut self,
        module: &mut Module,
        func: FuncId,
    ) -> Result<bool, ObfuscationError> {
        let opt = self
            .options
            .to_obfuscate(self.options.cfe_opt(), module, func);
        if !opt.is_enabled() {
            return Ok(false);
        }
        let Some(sites) = self.function_sites.get(&func) else {
            return Ok(false);
        };
        if sites.is_empty() {
            return Ok(false);
        }

        for site in sites.clone() {
            let mut op_idx = 0;
            loop {
                let f = module.func(func);
                let Some((block, idx)) = f.find_inst(site) else {
                    break;
                };
                let inst = &f.block(block).insts[idx];
                let (is_gep, _) = gep_shape(&inst.kind);
                let ops = inst.kind.operands();
                if op_idx >= ops.len() {
                    break;
                }
                if inst.kind.is_bundle_operand(op_idx) || (is_gep && op_idx < 2) {
                    op_idx += 1;
                    continue;
                }
                let plain = match ops[op_idx].as_const() {
                    Some(c @ Constant::Float(_)) => c.clone(),
                    _ => {
                        op_idx += 1;
                        continue;
                    }
                };
                if phi_incoming_from_switch(module, func, &inst.kind, op_idx) {
                    op_idx += 1;
                    continue;
                }
                let insert_before = match &inst.kind {
                    InstKind::Phi { incomings, .. } => {
                        let pred = incomings[op_idx].1;
                        match f.block(pred).terminator() {
                            Some(t) => t.id,
                            None => break,
                        }
                    }
                    _ => site,
                };
                let cipher = encrypt_constant(
                    module,
                    func,
                    &plain,
                    insert_before,
                    &mut self.rng,
                    opt.level(),
                )?;
                let f = module.func_mut(func);
                if let Some((block, idx)) = f.find_inst(site) {
                    if let Some(op) = f.block_mut(block).insts[idx]
                        .kind
                        .operands_mut()
                        .into_iter()
                        .nth(op_idx)
                    {
                        *op = cipher;
                    }
                }
                op_idx += 1;
            }
        }
        Ok(true)
    }
}
