//! Indirect-call obfuscation.
//!
//! Every direct callee in the module is registered behind a shared page
//! table; call sites load the function pointer through the decryption
//! chain instead of naming the callee.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::FunctionPass;
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{Constant, FuncId, GlobalId, InstId, InstKind, Module, Operand, Ty};
use crate::options::ObfuscationOptions;
use crate::pagetable::{
    build_decrypt_ir, create_page_table, enhanced_page_table, DecryptArgs, PageTableArgs,
};

/// Rewrites direct calls into page-table-decrypted indirect calls.
pub struct IndirectCall {
    options: Arc<ObfuscationOptions>,
    rng: CryptoRandom,
    function_call_sites: HashMap<FuncId, BTreeSet<InstId>>,
    function_callees: HashMap<FuncId, BTreeSet<FuncId>>,
    callees: Vec<Constant>,
    callee_index: HashMap<Constant, u32>,
    callee_keys: HashMap<Constant, u64>,
    callee_pages: Vec<GlobalId>,
    changed: bool,
}

impl IndirectCall {
    /// New pass with an entropy-seeded engine.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        Self::with_rng(options, CryptoRandom::from_entropy())
    }

    /// New pass with an explicit engine.
    pub fn with_rng(options: Arc<ObfuscationOptions>, rng: CryptoRandom) -> Self {
        IndirectCall {
            options,
            rng,
            function_call_sites: HashMap::new(),
            function_callees: HashMap::new(),
            callees: Vec::new(),
            callee_index: HashMap::new(),
            callee_keys: HashMap::new(),
            callee_pages: Vec::new(),
            changed: false,
        }
    }

    fn number_callees(&mut self, module: &Module) {
        for f in module.func_ids() {
            if module.func(f).is_intrinsic {
                continue;
            }
            let func = module.func(f);
            for &b in func.layout() {
                for inst in &func.block(b).insts {
                    if !matches!(inst.kind, InstKind::Call { .. }) {
                        continue;
                    }
                    let Some(callee) = module.called_function(&inst.kind) else {
                        continue;
                    };
                    if module.func(callee).is_intrinsic {
                        continue;
                    }
                    self.function_call_sites.entry(f).or_default().insert(inst.id);
                    self.function_callees.entry(f).or_default().insert(callee);

                    let obj = Constant::Function(callee);
                    if !self.callee_keys.contains_key(&obj) {
                        self.callees.push(obj.clone());
                        self.callee_keys.insert(obj, self.rng.get_uint64());
                    }
                }
            }
        }
    }
}

impl FunctionPass for IndirectCall {
    fn name(&self) -> &'static str {
        "IndirectCall"
    }

    fn do_initialization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        self.function_call_sites.clear();
        self.function_callees.clear();
        self.callees.clear();
        self.callee_index.clear();
        self.callee_keys.clear();
        self.callee_pages.clear();
        self.changed = false;

        self.number_callees(module);
        if self.callees.is_empty() {
            return Ok(false);
        }

        create_page_table(
            module,
            &mut self.rng,
            &mut PageTableArgs {
                count_loop: 1,
                name_prefix: format!("{}_IndirectCallee", module.name),
                objects: &mut self.callees,
                index_map: &mut self.callee_index,
                object_keys: &self.callee_keys,
                out_pages: &mut self.callee_pages,
            },
        )?;
        Ok(false)
    }

    fn run_on_function(
        &mut self,
        module: &mut Module,
        func: FuncId,
    ) -> Result<bool, ObfuscationError> {
        let opt = self
            .options
            .to_obfuscate(self.options.i_call_opt(), module, func);
        if !opt.is_enabled() || self.callees.is_empty() {
            return Ok(false);
        }
        let Some(sites) = self.function_call_sites.get(&func).cloned() else {
            return Ok(false);
        };
        let Some(callee_set) = self.function_callees.get(&func) else {
            return Ok(false);
        };
        if sites.is_empty() || callee_set.is_empty() {
            return Ok(false);
        }

        let mut func_callees: Vec<Constant> =
            callee_set.iter().map(|c| Constant::Function(*c)).collect();
        let mut func_keys: HashMap<Constant, u64> = HashMap::new();
        for callee in &func_callees {
            func_keys.insert(callee.clone(), self.rng.get_uint64());
        }

        let mut func_pages: Vec<GlobalId> = Vec::new();
        let mut func_index: HashMap<Constant, u32> = HashMap::new();
        if opt.level() > 0 {
            let prefix = format!(
                "{}{}_IndirectCallee",
                module.name,
                module.func(func).name
            );
            enhanced_page_table(
                module,
                &mut self.rng,
                &mut PageTableArgs {
                    count_loop: opt.level(),
                    name_prefix: prefix,
                    objects: &mut func_callees,
                    index_map: &mut self.callee_index,
                    object_keys: &func_keys,
                    out_pages: &mut func_pages,
                },
                &mut func_index,
            )?;
        }

        for site in sites {
            let f = module.func(func);
            let Some((block, idx)) = f.find_inst(site) else {
                continue;
            };
            let Some(callee) = module.called_function(&f.block(block).insts[idx].kind) else {
                continue;
            };
            let obj = Constant::Function(callee);
            let next_index = if opt.level() > 0 {
                func_index[&obj]
            } else {
                self.callee_index[&obj]
            };
            let ptr = build_decrypt_ir(
                module,
                &DecryptArgs {
                    func_loop_count: opt.level(),
                    next_index,
                    next_index_value: None,
                    func,
                    insert_before: site,
                    load_ty: Ty::Ptr,
                    module_pages: &self.callee_pages,
                    func_pages: &func_pages,
                    module_key: self.callee_keys[&obj],
                    func_key: func_keys[&obj],
                },
            )?;
            let f = module.func_mut(func);
            if let Some((block, idx)) = f.find_inst(site) {
                if let InstKind::Call { callee, .. } = &mut f.block_mut(block).insts[idx].kind {
                    *callee = Operand::Value(ptr);
                }
            }
        }
        self.changed = true;
        Ok(true)
    }

    fn do_finalization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        if !self.changed || self.callee_pages.is_empty() {
            return Ok(false);
        }
        for page in &self.callee_pages {
            module.append_compiler_used(*page);
        }
        Ok(true)
    }
}
