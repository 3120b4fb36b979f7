//! Indirect-global-variable obfuscation.
//!
//! Instruction operands that name a global directly are rewritten to load
//! the global's address out of the page table instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use itertools::Itertools;

use super::FunctionPass;
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{Constant, FuncId, GlobalId, InstKind, Module, Operand, Ty};
use crate::options::ObfuscationOptions;
use crate::pagetable::{
    build_decrypt_ir, create_page_table, enhanced_page_table, DecryptArgs, PageTableArgs, NOOBF,
};
use crate::transform::lower_constant_expr;

/// Rewrites direct global-variable references through the page table.
pub struct IndirectGlobalVariable {
    options: Arc<ObfuscationOptions>,
    rng: CryptoRandom,
    function_globals: HashMap<FuncId, BTreeSet<GlobalId>>,
    globals: Vec<Constant>,
    global_index: HashMap<Constant, u32>,
    global_keys: HashMap<Constant, u64>,
    global_pages: Vec<GlobalId>,
    changed: bool,
}

impl IndirectGlobalVariable {
    /// New pass with an entropy-seeded engine.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        Self::with_rng(options, CryptoRandom::from_entropy())
    }

    /// New pass with an explicit engine.
    pub fn with_rng(options: Arc<ObfuscationOptions>, rng: CryptoRandom) -> Self {
        IndirectGlobalVariable {
            options,
            rng,
            function_globals: HashMap::new(),
            globals: Vec::new(),
            global_index: HashMap::new(),
            global_keys: HashMap::new(),
            global_pages: Vec::new(),
            changed: false,
        }
    }

    fn number_globals(&mut self, module: &mut Module) {
        for f in module.func_ids() {
            if module.func(f).is_intrinsic {
                continue;
            }
            lower_constant_expr(module, f);

            let func = module.func(f);
            for &b in func.layout() {
                for inst in &func.block(b).insts {
                    if inst.kind.is_eh_pad() || matches!(inst.kind, InstKind::Call { .. }) {
                        continue;
                    }
                    for op in inst.kind.operands() {
                        let Some(gv) = op.as_global() else {
                            continue;
                        };
                        let global = module.global(gv);
                        if global.thread_local
                            || global.dll_import
                            || global.has_metadata(NOOBF)
                        {
                            continue;
                        }
                        self.function_globals.entry(f).or_default().insert(gv);
                        let obj = Constant::Global(gv);
                        if !self.global_keys.contains_key(&obj) {
                            self.globals.push(obj.clone());
                            self.global_keys.insert(obj, self.rng.get_uint64());
                        }
                    }
                }
            }
        }
    }
}

impl FunctionPass for IndirectGlobalVariable {
    fn name(&self) -> &'static str {
        "IndirectGlobalVariable"
    }

    fn do_initialization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        self.function_globals.clear();
        self.globals.clear();
        self.global_index.clear();
        self.global_keys.clear();
        self.global_pages.clear();
        self.changed = false;

        self.number_globals(module);
        if self.globals.is_empty() {
            return Ok(false);
        }

        create_page_table(
            module,
            &mut self.rng,
            &mut PageTableArgs {
                count_loop: 1,
                name_prefix: format!("{}_IndirectGVs", module.name),
                objects: &mut self.globals,
                index_map: &mut self.global_index,
                object_keys: &self.global_keys,
                out_pages: &mut self.global_pages,
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
            .to_obfuscate(self.options.ind_gv_opt(), module, func);
        if !opt.is_enabled() || self.globals.is_empty() {
            return Ok(false);
        }
        let Some(func_gv_set) = self.function_globals.get(&func) else {
            return Ok(false);
        };
        if func_gv_set.is_empty() {
            return Ok(false);
        }

        let mut func_globals: Vec<Constant> =
            func_gv_set.iter().map(|g| Constant::Global(*g)).collect();
        let mut func_keys: HashMap<Constant, u64> = HashMap::new();
        for gv in &func_globals {
            func_keys.insert(gv.clone(), self.rng.get_uint64());
        }

        let mut func_pages: Vec<GlobalId> = Vec::new();
        let mut func_index: HashMap<Constant, u32> = HashMap::new();
        if opt.level() > 0 {
            let prefix = format!("{}{}_IndirectGVs", module.name, module.func(func).name);
            enhanced_page_table(
                module,
                &mut self.rng,
                &mut PageTableArgs {
                    count_loop: opt.level(),
                    name_prefix: prefix,
                    objects: &mut func_globals,
                    index_map: &mut self.global_index,
                    object_keys: &func_keys,
                    out_pages: &mut func_pages,
                },
                &mut func_index,
            )?;
        }

        // Fresh scan: sites were not pinned during initialization.
        for b in module.func(func).layout().to_vec() {
            let site_ids = module
                .func(func)
                .block(b)
                .insts
                .iter()
                .map(|i| i.id)
                .collect_vec();
            for site in site_ids {
                let mut op_idx = 0;
                loop {
                    let f = module.func(func);
                    let Some((block, idx)) = f.find_inst(site) else {
                        break;
                    };
                    let inst = &f.block(block).insts[idx];
                    if inst.kind.is_eh_pad() || matches!(inst.kind, InstKind::Call { .. }) {
                        break;
                    }
                    let ops = inst.kind.operands();
                    if op_idx >= ops.len() {
                        break;
                    }
                    let Some(gv) = ops[op_idx].as_global() else {
                        op_idx += 1;
                        continue;
                    };
                    let obj = Constant::Global(gv);
                    if !self.global_index.contains_key(&obj) {
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
                    let is_phi = matches!(inst.kind, InstKind::Phi { .. });
                    let next_index = if opt.level() > 0 {
                        func_index[&obj]
                    } else {
                        self.global_index[&obj]
                    };
                    let ptr = build_decrypt_ir(
                        module,
                        &DecryptArgs {
                            func_loop_count: opt.level(),
                            next_index,
                            next_index_value: None,
                            func,
                            insert_before,
                            load_ty: Ty::Ptr,
                            module_pages: &self.global_pages,
                            func_pages: &func_pages,
                            module_key: self.global_keys[&obj],
                            func_key: func_keys[&obj],
                        },
                    )?;
                    let f = module.func_mut(func);
                    if let Some((block, idx)) = f.find_inst(site) {
                        let kind = &mut f.block_mut(block).insts[idx].kind;
                        if is_phi {
                            if let InstKind::Phi { incomings, .. } = kind {
                                incomings[op_idx].0 = Operand::Value(ptr);
                            }
                        } else {
                            kind.replace_uses_of(
                                &Operand::Const(Constant::Global(gv)),
                                &Operand::Value(ptr),
                            );
                        }
                    }
                    self.changed = true;
                    op_idx += 1;
                }
            }
        }
        Ok(true)
    }

    fn do_finalization(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        if !self.changed || self.global_pages.is_empty() {
            return Ok(false);
        }
        for page in &self.global_pages {
            module.append_compiler_used(*page);
        }
        Ok(true)
    }
}
