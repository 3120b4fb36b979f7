//! Indirect-branch obfuscation.
//!
//! Conditional branches become indirect branches through a page table of
//! block addresses: the branch condition selects between the two
//! successors' encrypted indices, and the decryption chain turns the
//! selected index back into a block address.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::FunctionPass;
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{
    Constant, FuncId, FunctionBuilder, GlobalId, InstId, InstKind, Module, Operand, Ty,
};
use crate::options::ObfuscationOptions;
use crate::pagetable::{
    build_decrypt_ir, create_page_table, enhanced_page_table, DecryptArgs, PageTableArgs,
};
use crate::transform::split_all_critical_edges;

/// Rewrites conditional branches into page-table-driven indirect branches.
pub struct IndirectBranch {
    options: Arc<ObfuscationOptions>,
    rng: CryptoRandom,
    function_targets: HashMap<FuncId, BTreeSet<Constant>>,
    function_branches: HashMap<FuncId, BTreeSet<InstId>>,
    targets: Vec<Constant>,
    target_index: HashMap<Constant, u32>,
    target_keys: HashMap<Constant, u64>,
    target_pages: Vec<GlobalId>,
    changed: bool,
}

impl IndirectBranch {
    /// New pass with an entropy-seeded engine.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        Self::with_rng(options, CryptoRandom::from_entropy())
    }

    /// New pass with an explicit engine.
    pub fn with_rng(options: Arc<ObfuscationOptions>, rng: CryptoRandom) -> Self {
        IndirectBranch {
            options,
            rng,
            function_targets: HashMap::new(),
            function_branches: HashMap::new(),
            targets: Vec::new(),
            target_index: HashMap::new(),
            target_keys: HashMap::new(),
            target_pages: Vec::new(),
            changed: false,
        }
    }

    fn number_basic_blocks(&mut self, module: &mut Module) {
        for f in module.func_ids() {
            {
                let func = module.func(f);
                if func.is_declaration()
                    || func.linkage.is_weak_for_linker()
                    || func.section.as_deref() == Some(".text.startup")
                    || func.is_intrinsic
                {
                    continue;
                }
            }
            split_all_critical_edges(module.func_mut(f));

            // All conditional branches of one function share one key.
            let bb_key = self.rng.get_uint64();
            let func = module.func(f);
            for &b in func.layout() {
                let Some(term) = func.block(b).terminator() else {
                    continue;
                };
                let InstKind::CondBr {
                    on_true, on_false, ..
                } = &term.kind
                else {
                    continue;
                };
                self.function_branches.entry(f).or_default().insert(term.id);
                for succ in [*on_true, *on_false] {
                    let addr = Constant::BlockAddress(f, succ);
                    self.function_targets
                        .entry(f)
                        .or_default()
                        .insert(addr.clone());
                    if !self.target_keys.contains_key(&addr) {
                        self.targets.push(addr.clone());
                        self.target_keys.insert(addr, bb_key);
                    }
                }
            }
        }
    }
}

impl FunctionPass for IndirectBranch {
    fn name(&self) -> &'static str {
        "IndirectBranch"
    }

    fn do_initialization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        self.function_targets.clear();
        self.function_branches.clear();
        self.targets.clear();
        self.target_index.clear();
        self.target_keys.clear();
        self.target_pages.clear();
        self.changed = false;

        self.number_basic_blocks(module);
        if self.targets.is_empty() {
            return Ok(false);
        }

        create_page_table(
            module,
            &mut self.rng,
            &mut PageTableArgs {
                count_loop: 1,
                name_prefix: format!("{}_IndirectBr", module.name),
                objects: &mut self.targets,
                index_map: &mut self.target_index,
                object_keys: &self.target_keys,
                out_pages: &mut self.target_pages,
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
            .to_obfuscate(self.options.ind_br_opt(), module, func);
        if !opt.is_enabled() || self.targets.is_empty() {
            return Ok(false);
        }
        let (Some(target_set), Some(branches)) = (
            self.function_targets.get(&func),
            self.function_branches.get(&func).cloned(),
        ) else {
            return Ok(false);
        };
        if target_set.is_empty() || branches.is_empty() {
            return Ok(false);
        }

        let mut func_targets: Vec<Constant> = target_set.iter().cloned().collect();
        let func_key = self.rng.get_uint64();
        let func_keys: HashMap<Constant, u64> = func_targets
            .iter()
            .map(|t| (t.clone(), func_key))
            .collect();

        let mut func_pages: Vec<GlobalId> = Vec::new();
        let mut func_index: HashMap<Constant, u32> = HashMap::new();
        if opt.level() > 0 {
            let prefix = format!("{}{}_IndirectBr", module.name, module.func(func).name);
            enhanced_page_table(
                module,
                &mut self.rng,
                &mut PageTableArgs {
                    count_loop: opt.level(),
                    name_prefix: prefix,
                    objects: &mut func_targets,
                    index_map: &mut self.target_index,
                    object_keys: &func_keys,
                    out_pages: &mut func_pages,
                },
                &mut func_index,
            )?;
        }

        for branch in branches {
            let f = module.func(func);
            let Some((block, idx)) = f.find_inst(branch) else {
                continue;
            };
            let InstKind::CondBr {
                cond,
                on_true,
                on_false,
            } = f.block(block).insts[idx].kind.clone()
            else {
                continue;
            };
            let addr_t = Constant::BlockAddress(func, on_true);
            let addr_f = Constant::BlockAddress(func, on_false);
            let index_of = |addr: &Constant| {
                if opt.level() > 0 {
                    func_index[addr]
                } else {
                    self.target_index[addr]
                }
            };
            let t_index = Constant::int32(index_of(&addr_t));
            let f_index = Constant::int32(index_of(&addr_f));

            let select = {
                let f = module.func_mut(func);
                let Some(mut b) = FunctionBuilder::before_inst(f, branch) else {
                    continue;
                };
                b.select(cond, t_index, f_index)
            };
            let ptr = build_decrypt_ir(
                module,
                &DecryptArgs {
                    func_loop_count: opt.level(),
                    next_index: 0,
                    next_index_value: Some(select),
                    func,
                    insert_before: branch,
                    load_ty: Ty::Ptr,
                    module_pages: &self.target_pages,
                    func_pages: &func_pages,
                    module_key: self.target_keys[&addr_t],
                    func_key,
                },
            )?;
            let f = module.func_mut(func);
            if let Some((block, idx)) = f.find_inst(branch) {
                f.block_mut(block).insts[idx].kind = InstKind::IndirectBr {
                    address: Operand::Value(ptr),
                    dests: vec![on_true, on_false],
                };
            }
            self.changed = true;
        }
        Ok(true)
    }

    fn do_finalization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        if !self.changed || self.target_pages.is_empty() {
            return Ok(false);
        }
        for page in &self.target_pages {
            module.append_compiler_used(*page);
        }
        Ok(true)
    }
}
