//! Control-flow flattening.
//!
//! Rewrites a function's CFG into a dispatcher-driven state machine. The
//! dispatch state lives in two stack cells whose XOR yields the scrambled
//! case id of the next block; every rewritten terminator refreshes both
//! cells with fresh per-edge randomness, so no stored state value repeats
//! across edges.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::FunctionPass;
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{BlockId, Constant, FuncId, FunctionBuilder, InstKind, Module, Ty};
use crate::options::ObfuscationOptions;
use crate::transform::{fix_stack, lower_switch};

/// Flattens eligible functions into a keyed dispatcher.
pub struct Flattening {
    options: Arc<ObfuscationOptions>,
    rng: CryptoRandom,
}

impl Flattening {
    /// New pass with an entropy-seeded engine.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        Self::with_rng(options, CryptoRandom::from_entropy())
    }

    /// New pass with an explicit engine.
    pub fn with_rng(options: Arc<ObfuscationOptions>, rng: CryptoRandom) -> Self {
        Flattening { options, rng }
    }

    fn flatten(&mut self, module: &mut Module, func: FuncId) -> Result<bool, ObfuscationError> {
        let int_bits: u32 = if module.pointer_size == 8 { 64 } else { 32 };
        let int_ty = Ty::Int(int_bits);

        // Reject before mutating anything: EH-bearing functions are left
        // entirely alone.
        {
            let f = module.func(func);
            for &b in f.layout() {
                let block = f.block(b);
                if block.is_eh_pad() {
                    return Ok(false);
                }
                if matches!(
                    block.terminator().map(|t| &t.kind),
                    Some(InstKind::Invoke { .. })
                ) {
                    return Ok(false);
                }
            }
        }

        let mut scrambling_key = [0u8; 16];
        self.rng.get_bytes(&mut scrambling_key);
        let scramble = |index: u64| -> u64 {
            if int_bits == 64 {
                CryptoRandom::scramble64(index, &scrambling_key)
            } else {
                CryptoRandom::scramble32(index as u32, &scrambling_key) as u64
            }
        };

        lower_switch(module.func_mut(func));

        let f = module.func_mut(func);
        let mut orig: Vec<BlockId> = f.layout().to_vec();
        if orig.len() <= 1 {
            return Ok(false);
        }
        orig.remove(0);
        let entry = f.entry();

        // Split the entry's terminator (and the compare feeding it, when
        // present) into the first dispatched block.
        let entry_len = f.block(entry).insts.len();
        let split_at = if entry_len > 1 {
            entry_len - 2
        } else {
            entry_len - 1
        };

        let mut shuffle_rng = StdRng::seed_from_u64(self.rng.get_uint64());
        orig.shuffle(&mut shuffle_rng);

        let first = f.split_block(entry, split_at, "first");
        orig.insert(0, first);
        // Drop the jump the split added; the entry will fall into the
        // dispatcher instead.
        f.block_mut(entry).insts.pop();

        let case_ids: Vec<(BlockId, u64)> = orig
            .iter()
            .enumerate()
            .map(|(i, b)| (*b, crate::ir::mask_to_width(scramble(i as u64), int_bits)))
            .collect();
        let last_case_id = case_ids[case_ids.len() - 1].1;
        let case_of: HashMap<BlockId, u64> = case_ids.iter().copied().collect();

        let loop_entry = f.insert_block_after("loopEntry", entry);
        let loop_end = f.insert_block_after("loopEnd", loop_entry);
        let sw_default = f.insert_block_before("switchDefault", loop_end);

        let entry_xor = crate::ir::mask_to_width(self.rng.get_uint64(), int_bits);
        let (switch_var, switch_xor_var);
        {
            let mut b = FunctionBuilder::at_end(f, entry);
            switch_var = b.alloca(int_ty.clone());
            switch_xor_var = b.alloca(int_ty.clone());
            b.store_volatile(
                Constant::int(int_bits, entry_xor ^ case_ids[0].1),
                switch_var,
            );
            b.store_volatile(Constant::int(int_bits, entry_xor), switch_xor_var);
            b.br(loop_entry);
        }
        {
            let mut b = FunctionBuilder::at_end(f, loop_entry);
            let state = b.load_volatile(int_ty.clone(), switch_var, 1);
            let state_xor = b.load_volatile(int_ty.clone(), switch_xor_var, 1);
            let cond = b.xor(state, state_xor);
            let cases = case_ids
                .iter()
                .map(|(block, id)| (Constant::int(int_bits, *id), *block))
                .collect();
            b.switch(cond, sw_default, cases);
        }
        {
            let mut b = FunctionBuilder::at_end(f, sw_default);
            b.br(loop_end);
        }
        {
            let mut b = FunctionBuilder::at_end(f, loop_end);
            b.br(loop_entry);
        }
        for &b in &orig {
            f.move_block_before(b, loop_end);
        }

        // Replace every dispatched block's terminator with a state update.
        for &b in &orig {
            let Some(term) = f.block(b).terminator() else {
                continue;
            };
            let kind = term.kind.clone();
            match kind {
                InstKind::Br(succ) => {
                    let num_to_case = case_of.get(&succ).copied().unwrap_or(last_case_id);
                    let random_xor =
                        crate::ir::mask_to_width(self.rng.get_uint64(), int_bits);
                    f.block_mut(b).insts.pop();
                    let mut bld = FunctionBuilder::at_end(f, b);
                    bld.store_volatile(
                        Constant::int(int_bits, random_xor ^ num_to_case),
                        switch_var,
                    );
                    bld.store_volatile(Constant::int(int_bits, random_xor), switch_xor_var);
                    bld.br(loop_end);
                }
                InstKind::CondBr {
                    cond,
                    on_true,
                    on_false,
                } => {
                    let num_true = case_of.get(&on_true).copied().unwrap_or(last_case_id);
                    let num_false = case_of.get(&on_false).copied().unwrap_or(last_case_id);
                    let random_xor =
                        crate::ir::mask_to_width(self.rng.get_uint64(), int_bits);
                    f.block_mut(b).insts.pop();
                    let mut bld = FunctionBuilder::at_end(f, b);
                    bld.store_volatile(Constant::int(int_bits, random_xor), switch_xor_var);
                    let sel = bld.select(
                        cond,
                        Constant::int(int_bits, random_xor ^ num_true),
                        Constant::int(int_bits, random_xor ^ num_false),
                    );
                    bld.store_volatile(sel, switch_var);
                    bld.br(loop_end);
                }
                // Returns and unreachables stay; anything with more than
                // two successors cannot appear once switches are lowered.
                _ => {}
            }
        }

        fix_stack(f);
        Ok(true)
    }
}

impl FunctionPass for Flattening {
    fn name(&self) -> &'static str {
        "Flattening"
    }

    fn do_initialization(&mut self, _module: &mut Module) -> Result<bool, ObfuscationError> {
        Ok(false)
    }

    fn run_on_function(
        &mut self,
        module: &mut Module,
        func: FuncId,
    ) -> Result<bool, ObfuscationError> {
        if module.func(func).is_intrinsic {
            return Ok(false);
        }
        let opt = self
            .options
            .to_obfuscate(self.options.fla_opt(), module, func);
        if !opt.is_enabled() {
            return Ok(false);
        }
        self.flatten(module, func)
    }
}
