//! IR utilities shared by the passes: escape analysis, demotion of SSA
//! values and phis to stack slots, constant-expression expansion,
//! critical-edge splitting, switch lowering, and the EH funclet bundle
//! fix-up.

use std::collections::{HashMap, HashSet, VecDeque};

use itertools::Itertools;

use crate::error::ObfuscationError;
use crate::ir::{
    BlockId, ConstExpr, Constant, FuncId, Function, FunctionBuilder, IcmpPred, Inst, InstId,
    InstKind, Module, Operand, Ty, ValueId,
};

/// Whether `value`, defined in `def_block`, is used outside its defining
/// block or by a phi node.
pub fn value_escapes(func: &Function, def_block: BlockId, value: ValueId) -> bool {
    for &b in func.layout() {
        for inst in &func.block(b).insts {
            let uses_value = inst
                .kind
                .operands()
                .into_iter()
                .any(|op| op.as_value() == Some(value));
            if !uses_value {
                continue;
            }
            if b != def_block || matches!(inst.kind, InstKind::Phi { .. }) {
                return true;
            }
        }
    }
    false
}

/// Demote every phi node and every escaping SSA value to a stack slot,
/// repeating until the function is free of both.
pub fn fix_stack(func: &mut Function) {
    loop {
        let entry = func.entry();
        let mut phis: Vec<InstId> = Vec::new();
        let mut regs: Vec<InstId> = Vec::new();
        for &b in func.layout() {
            for inst in &func.block(b).insts {
                if matches!(inst.kind, InstKind::Phi { .. }) {
                    phis.push(inst.id);
                    continue;
                }
                let entry_alloca = matches!(inst.kind, InstKind::Alloca { .. }) && b == entry;
                let escapes = inst
                    .result
                    .is_some_and(|v| value_escapes(func, b, v));
                if !entry_alloca && escapes {
                    regs.push(inst.id);
                }
            }
        }
        if regs.is_empty() && phis.is_empty() {
            break;
        }
        for id in regs {
            demote_reg_to_stack(func, id);
        }
        for id in phis {
            demote_phi_to_stack(func, id);
        }
    }
}

fn entry_alloca(func: &mut Function, ty: Ty) -> Option<ValueId> {
    let entry = func.entry();
    let inst = func.make_inst(InstKind::Alloca { ty }, Some(Ty::Ptr));
    let slot = inst.result;
    func.block_mut(entry).insts.insert(0, inst);
    slot
}

/// Demote one value-producing instruction to a stack slot: allocate the
/// slot in the entry block, store the result right after the definition,
/// and reload before every user.
pub fn demote_reg_to_stack(func: &mut Function, inst: InstId) {
    let Some((def_block, def_idx)) = func.find_inst(inst) else {
        return;
    };
    let def = &func.block(def_block).insts[def_idx];
    let Some(value) = def.result else {
        return;
    };
    let invoke_normal = match &def.kind {
        InstKind::Invoke { normal, .. } => Some(*normal),
        _ => None,
    };
    let ty = func.value_ty(value).clone();
    let Some(slot) = entry_alloca(func, ty.clone()) else {
        return;
    };

    // Spill after the definition; for invokes, at the head of the normal
    // destination.
    let store = func.make_inst(
        InstKind::Store {
            value: Operand::Value(value),
            ptr: Operand::Value(slot),
            volatile: false,
        },
        None,
    );
    let store_id = store.id;
    match invoke_normal {
        Some(normal) => {
            let at = first_insertion_pt(func, normal);
            func.block_mut(normal).insts.insert(at, store);
        }
        None => {
            let Some((db, di)) = func.find_inst(inst) else {
                return;
            };
            func.block_mut(db).insts.insert(di + 1, store);
        }
    }

    let users: Vec<InstId> = func
        .layout()
        .iter()
        .flat_map(|b| func.block(*b).insts.iter())
        .filter(|i| {
            i.id != inst
                && i.id != store_id
                && i.kind
                    .operands()
                    .into_iter()
                    .any(|op| op.as_value() == Some(value))
        })
        .map(|i| i.id)
        .collect_vec();

    for user in users {
        let Some((ub, ui)) = func.find_inst(user) else {
            continue;
        };
        if let InstKind::Phi { incomings, .. } = &func.block(ub).insts[ui].kind {
            // Reload at the end of each predecessor that feeds this value.
            let feeds: Vec<(usize, BlockId)> = incomings
                .iter()
                .enumerate()
                .filter(|(_, (op, _))| op.as_value() == Some(value))
                .map(|(i, (_, pred))| (i, *pred))
                .collect();
            for (incoming_idx, pred) in feeds {
                let mut b = FunctionBuilder::before_terminator(func, pred);
                let reload = b.load(ty.clone(), Operand::Value(slot));
                let Some((ub, ui)) = func.find_inst(user) else {
                    continue;
                };
                if let InstKind::Phi { incomings, .. } = &mut func.block_mut(ub).insts[ui].kind {
                    incomings[incoming_idx].0 = Operand::Value(reload);
                }
            }
        } else {
            let mut b = FunctionBuilder::at(
                func,
                crate::ir::InsertPt {
                    block: ub,
                    index: ui,
                },
            );
            let reload = b.load(ty.clone(), Operand::Value(slot));
            func.block_mut(ub).insts[ui + 1]
                .kind
                .replace_uses_of(&Operand::Value(value), &Operand::Value(reload));
        }
    }
}

/// Demote one phi node to a stack slot: store each incoming value at the
/// end of its predecessor and replace the phi with a reload.
pub fn demote_phi_to_stack(func: &mut Function, phi: InstId) {
    let Some((block, idx)) = func.find_inst(phi) else {
        return;
    };
    let inst = &func.block(block).insts[idx];
    let (ty, incomings) = match &inst.kind {
        InstKind::Phi { ty, incomings } => (ty.clone(), incomings.clone()),
        _ => return,
    };
    let Some(result) = inst.result else {
        return;
    };
    let Some(slot) = entry_alloca(func, ty.clone()) else {
        return;
    };

    for (op, pred) in incomings {
        let mut b = FunctionBuilder::before_terminator(func, pred);
        b.store(op, Operand::Value(slot));
    }

    // Replace the phi in place with a reload defining the same value.
    let Some((block, idx)) = func.find_inst(phi) else {
        return;
    };
    let id = func.next_inst_id();
    func.block_mut(block).insts[idx] = Inst {
        id,
        result: Some(result),
        kind: InstKind::Load {
            ty,
            ptr: Operand::Value(slot),
            volatile: false,
            align: None,
        },
    };
}

fn first_insertion_pt(func: &Function, block: BlockId) -> usize {
    func.block(block)
        .insts
        .iter()
        .take_while(|i| matches!(i.kind, InstKind::Phi { .. }) || i.kind.is_eh_pad())
        .count()
}

/// Split every critical edge (multi-successor source into multi-predecessor
/// sink) by routing it through a fresh block. Returns the number of edges
/// split.
pub fn split_all_critical_edges(func: &mut Function) -> usize {
    let mut split = 0;
    for b in func.layout().to_vec() {
        let Some(term) = func.block(b).terminator() else {
            continue;
        };
        let succs = term.kind.successors();
        if succs.len() < 2 {
            continue;
        }
        for (slot, succ) in succs.into_iter().enumerate() {
            if func.preds(succ).len() < 2 {
                continue;
            }
            let name = format!("{}.crit_edge", func.block(succ).name);
            let mid = func.insert_block_before(name, succ);
            let br = func.make_inst(InstKind::Br(succ), None);
            func.block_mut(mid).insts.push(br);
            if let Some(term) = func.block_mut(b).terminator_mut() {
                let mut slots = term.kind.successor_slots_mut();
                if let Some(s) = slots.get_mut(slot) {
                    **s = mid;
                }
            }
            for inst in &mut func.block_mut(succ).insts {
                if let InstKind::Phi { incomings, .. } = &mut inst.kind {
                    for (_, pred) in incomings.iter_mut() {
                        if *pred == b {
                            *pred = mid;
                            break;
                        }
                    }
                }
            }
            split += 1;
        }
    }
    split
}

/// Lower every switch terminator into a chain of equality compares and
/// conditional branches. Returns whether anything changed.
pub fn lower_switch(func: &mut Function) -> bool {
    let mut changed = false;
    for b in func.layout().to_vec() {
        let Some(term) = func.block(b).terminator() else {
            continue;
        };
        let InstKind::Switch {
            value,
            default,
            cases,
        } = term.kind.clone()
        else {
            continue;
        };
        changed = true;
        func.block_mut(b).insts.pop();

        if cases.is_empty() {
            let br = func.make_inst(InstKind::Br(default), None);
            func.block_mut(b).insts.push(br);
            continue;
        }

        // One compare per case; the last compare falls through to the
        // default target.
        let mut new_preds: Vec<(BlockId, BlockId)> = Vec::new();
        let mut cur = b;
        for (i, (case_const, dest)) in cases.iter().enumerate() {
            let last = i + 1 == cases.len();
            let next = if last {
                default
            } else {
                let name = format!("{}.cmp{}", func.block(b).name, i + 1);
                func.insert_block_after(name, cur)
            };
            let mut bld = FunctionBuilder::at_end(func, cur);
            let cond = bld.icmp(IcmpPred::Eq, value.clone(), case_const.clone());
            bld.cond_br(cond, *dest, next);
            new_preds.push((*dest, cur));
            if last {
                new_preds.push((default, cur));
            }
            cur = next;
        }

        // Phi incomings in the targets still name the switch block; repoint
        // them at the compare block that now branches there.
        let mut by_dest: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for (dest, pred) in new_preds {
            by_dest.entry(dest).or_default().push(pred);
        }
        for (dest, preds) in by_dest {
            for idx in 0..func.block(dest).insts.len() {
                let InstKind::Phi { incomings, .. } = &func.block(dest).insts[idx].kind else {
                    continue;
                };
                let Some(pos) = incomings.iter().position(|(_, p)| *p == b) else {
                    continue;
                };
                let from_switch = incomings[pos].0.clone();
                let InstKind::Phi { incomings, .. } =
                    &mut func.block_mut(dest).insts[idx].kind
                else {
                    continue;
                };
                incomings[pos].1 = preds[0];
                for extra in &preds[1..] {
                    incomings.push((from_switch.clone(), *extra));
                }
            }
        }
    }
    changed
}

fn const_expr_inst(expr: &ConstExpr) -> (InstKind, Option<Ty>) {
    match expr {
        ConstExpr::Bitcast(c, ty) => (
            InstKind::Cast {
                kind: crate::ir::CastKind::Bitcast,
                value: Operand::Const(c.clone()),
                to: ty.clone(),
            },
            Some(ty.clone()),
        ),
        ConstExpr::PtrToInt(c, ty) => (
            InstKind::Cast {
                kind: crate::ir::CastKind::PtrToInt,
                value: Operand::Const(c.clone()),
                to: ty.clone(),
            },
            Some(ty.clone()),
        ),
        ConstExpr::IntToPtr(c, ty) => (
            InstKind::Cast {
                kind: crate::ir::CastKind::IntToPtr,
                value: Operand::Const(c.clone()),
                to: ty.clone(),
            },
            Some(ty.clone()),
        ),
        ConstExpr::Gep {
            source_ty,
            base,
            indices,
        } => (
            InstKind::Gep {
                source_ty: source_ty.clone(),
                base: Operand::Const(base.clone()),
                indices: indices.iter().cloned().map(Operand::Const).collect(),
            },
            Some(Ty::Ptr),
        ),
        ConstExpr::Add(l, r) => bin_expr(crate::ir::BinOp::Add, l, r),
        ConstExpr::Sub(l, r) => bin_expr(crate::ir::BinOp::Sub, l, r),
        ConstExpr::Xor(l, r) => bin_expr(crate::ir::BinOp::Xor, l, r),
        ConstExpr::Mul(l, r) => bin_expr(crate::ir::BinOp::Mul, l, r),
        ConstExpr::Neg(v) => (
            InstKind::Neg(Operand::Const(v.clone())),
            Some(v.ty()),
        ),
    }
}

fn bin_expr(op: crate::ir::BinOp, l: &Constant, r: &Constant) -> (InstKind, Option<Ty>) {
    (
        InstKind::Bin {
            op,
            lhs: Operand::Const(l.clone()),
            rhs: Operand::Const(r.clone()),
        },
        Some(l.ty()),
    )
}

fn operand_expr(op: &Operand) -> Option<ConstExpr> {
    match op {
        Operand::Const(Constant::Expr(e)) => Some(e.as_ref().clone()),
        _ => None,
    }
}

fn intrinsic_funcs(module: &Module) -> HashSet<FuncId> {
    module
        .func_ids()
        .into_iter()
        .filter(|f| module.func(*f).is_intrinsic)
        .collect()
}

/// Expand constant-expression operands into instructions, following nested
/// expressions to a fixpoint. Phi incomings expand in front of the
/// corresponding predecessor's terminator.
pub fn lower_constant_expr(module: &mut Module, func_id: FuncId) {
    let intrinsics = intrinsic_funcs(module);
    let func = module.func_mut(func_id);

    let mut work: VecDeque<InstId> = VecDeque::new();
    for &b in func.layout() {
        for inst in &func.block(b).insts {
            if inst.kind.is_eh_pad() {
                continue;
            }
            if let InstKind::Call { callee, .. } = &inst.kind {
                if let Operand::Const(c) = callee {
                    if let Constant::Function(f) = c.strip_pointer_casts() {
                        if intrinsics.contains(f) {
                            continue;
                        }
                    }
                }
            }
            if inst.kind.operands().into_iter().any(|op| operand_expr(op).is_some()) {
                work.push_back(inst.id);
            }
        }
    }

    while let Some(id) = work.pop_front() {
        let Some((block, idx)) = func.find_inst(id) else {
            continue;
        };
        if let InstKind::Phi { incomings, .. } = &func.block(block).insts[idx].kind {
            let pending: Vec<(usize, BlockId, ConstExpr)> = incomings
                .iter()
                .enumerate()
                .filter_map(|(i, (op, pred))| operand_expr(op).map(|e| (i, *pred, e)))
                .collect();
            for (incoming_idx, pred, expr) in pending {
                let (kind, ty) = const_expr_inst(&expr);
                let mut b = FunctionBuilder::before_terminator(func, pred);
                let new = b.insert(kind, ty);
                work.push_back(new.id);
                let Some((block, idx)) = func.find_inst(id) else {
                    continue;
                };
                if let InstKind::Phi { incomings, .. } = &mut func.block_mut(block).insts[idx].kind
                {
                    if let Some(v) = new.result {
                        incomings[incoming_idx].0 = Operand::Value(v);
                    }
                }
            }
        } else {
            loop {
                let Some((block, idx)) = func.find_inst(id) else {
                    break;
                };
                let Some((op_idx, expr)) = func.block(block).insts[idx]
                    .kind
                    .operands()
                    .into_iter()
                    .enumerate()
                    .find_map(|(i, op)| operand_expr(op).map(|e| (i, e)))
                else {
                    break;
                };
                let (kind, ty) = const_expr_inst(&expr);
                let mut b = FunctionBuilder::at(
                    func,
                    crate::ir::InsertPt { block, index: idx },
                );
                let new = b.insert(kind, ty);
                work.push_back(new.id);
                if let Some(v) = new.result {
                    if let Some(op) = func.block_mut(block).insts[idx + 1]
                        .kind
                        .operands_mut()
                        .into_iter()
                        .nth(op_idx)
                    {
                        *op = Operand::Value(v);
                    }
                }
            }
        }
    }
}

/// Single-pass expansion used by the constant-encryption passes: rewrite
/// constant-expression operands into instructions so the scanner sees plain
/// constants. Phi incomings expand at the head of the entry block. Returns
/// whether anything changed.
pub fn expand_constant_expr(module: &mut Module, func_id: FuncId) -> bool {
    let intrinsics = intrinsic_funcs(module);
    let func = module.func_mut(func_id);
    let mut changed = false;

    for b in func.layout().to_vec() {
        let mut idx = 0;
        while idx < func.block(b).insts.len() {
            let inst = &func.block(b).insts[idx];
            let id = inst.id;
            let kind = &inst.kind;
            let skip = kind.is_eh_pad()
                || matches!(kind, InstKind::Alloca { .. } | InstKind::Switch { .. })
                || kind.is_atomic()
                || matches!(
                    kind,
                    InstKind::Call { callee: Operand::Const(c), .. }
                        if matches!(c.strip_pointer_casts(), Constant::Function(f) if intrinsics.contains(f))
                );
            if skip {
                idx += 1;
                continue;
            }
            let is_phi = matches!(kind, InstKind::Phi { .. });
            let struct_gep = matches!(kind, InstKind::Gep { source_ty, .. } if source_ty.is_struct());
            let is_gep = matches!(kind, InstKind::Gep { .. });

            let mut op_idx = 0;
            loop {
                let Some((block, cur)) = func.find_inst(id) else {
                    break;
                };
                let inst = &func.block(block).insts[cur];
                let ops = inst.kind.operands();
                if op_idx >= ops.len() {
                    break;
                }
                let skip_op = inst.kind.is_bundle_operand(op_idx)
                    || (is_gep && (op_idx < 2 || struct_gep));
                if skip_op {
                    op_idx += 1;
                    continue;
                }
                let Some(expr) = operand_expr(ops[op_idx]) else {
                    op_idx += 1;
                    continue;
                };
                let (new_kind, ty) = const_expr_inst(&expr);
                let insert_at = if is_phi {
                    let entry = func.entry();
                    crate::ir::InsertPt {
                        block: entry,
                        index: first_insertion_pt(func, entry),
                    }
                } else {
                    crate::ir::InsertPt { block, index: cur }
                };
                let mut bld = FunctionBuilder::at(func, insert_at);
                let new = bld.insert(new_kind, ty);
                changed = true;
                let Some((block, cur)) = func.find_inst(id) else {
                    break;
                };
                if let Some(v) = new.result {
                    if let Some(op) = func.block_mut(block).insts[cur]
                        .kind
                        .operands_mut()
                        .into_iter()
                        .nth(op_idx)
                    {
                        *op = Operand::Value(v);
                    }
                }
                op_idx += 1;
            }
            let Some((_, cur)) = func.find_inst(id) else {
                break;
            };
            idx = cur + 1;
        }
    }
    changed
}

/// Funclet colors: for every reachable block, the set of funclet pads (or
/// the entry block, standing for the main function body) it belongs to.
pub fn funclet_colors(func: &Function) -> HashMap<BlockId, Vec<BlockId>> {
    let mut colors: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    let entry = func.entry();
    let mut work: VecDeque<(BlockId, BlockId)> = VecDeque::from([(entry, entry)]);
    while let Some((block, color)) = work.pop_front() {
        let assigned = colors.entry(block).or_default();
        if assigned.contains(&color) {
            continue;
        }
        assigned.push(color);
        if let Some(term) = func.block(block).terminator() {
            for succ in term.kind.successors() {
                let succ_color = if func.block(succ).is_eh_pad() {
                    succ
                } else {
                    color
                };
                work.push_back((succ, succ_color));
            }
        }
    }
    colors
}

/// Attach the enclosing funclet's pad token to a call as an operand bundle.
///
/// Skipped when the function has no scoped-EH personality or the call's
/// block belongs to the main function body; a block with more than one
/// funclet color is a structural error.
pub fn fix_eh(module: &mut Module, func_id: FuncId, call: InstId) -> Result<(), ObfuscationError> {
    let func = module.func(func_id);
    if !func.has_scoped_eh {
        return Ok(());
    }
    let Some((block, idx)) = func.find_inst(call) else {
        return Ok(());
    };
    let colors = funclet_colors(func);
    let Some(block_colors) = colors.get(&block) else {
        return Ok(());
    };
    if block_colors.len() != 1 {
        return Err(ObfuscationError::structural(format!(
            "non-unique funclet color for block {}",
            func.block(block).name
        )));
    }
    let pad_block = block_colors[0];
    if !func.block(pad_block).is_eh_pad() {
        return Ok(());
    }
    let token = func
        .block(pad_block)
        .insts
        .first()
        .and_then(|pad| pad.result);
    let Some(token) = token else {
        return Ok(());
    };

    let func = module.func_mut(func_id);
    if let InstKind::Call {
        args, bundle_args, ..
    } = &mut func.block_mut(block).insts[idx].kind
    {
        args.push(Operand::Value(token));
        *bundle_args += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::{Evaluator, Val};
    use crate::ir::{EhPadKind, Signature};

    /// if (x > 0) r = x + 1 else r = x - 1; return r   (r as a phi)
    fn diamond() -> (Module, FuncId) {
        let mut module = Module::new("transform_test");
        let mut f = Function::new("f", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
        let entry = f.entry();
        let x = f.param(0);
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");
        let join = f.add_block("join");

        let (plus, minus);
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            let cond = b.icmp(IcmpPred::Sgt, x, Constant::int32(0));
            b.cond_br(cond, then_b, else_b);
        }
        {
            let mut b = FunctionBuilder::at_end(&mut f, then_b);
            plus = b.add(x, Constant::int32(1));
            b.br(join);
        }
        {
            let mut b = FunctionBuilder::at_end(&mut f, else_b);
            minus = b.sub(x, Constant::int32(1));
            b.br(join);
        }
        let phi = f.make_inst(
            InstKind::Phi {
                ty: Ty::Int(32),
                incomings: vec![
                    (Operand::Value(plus), then_b),
                    (Operand::Value(minus), else_b),
                ],
            },
            Some(Ty::Int(32)),
        );
        let r = phi.result;
        f.block_mut(join).insts.push(phi);
        {
            let mut b = FunctionBuilder::at_end(&mut f, join);
            b.ret(r.map(Operand::Value));
        }
        let fid = module.add_function(f);
        (module, fid)
    }

    #[test]
    fn escaping_values_are_detected() {
        let (module, fid) = diamond();
        let f = module.func(fid);
        let then_b = f.layout()[1];
        let add = &f.block(then_b).insts[0];
        assert!(value_escapes(f, then_b, add.result.unwrap()));
    }

    #[test]
    fn fix_stack_removes_phis_and_keeps_semantics() {
        let (mut module, fid) = diamond();
        fix_stack(module.func_mut(fid));

        let f = module.func(fid);
        for &b in f.layout() {
            for inst in &f.block(b).insts {
                assert!(!matches!(inst.kind, InstKind::Phi { .. }));
            }
        }

        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(ev.run(fid, &[Val::i32(5)]).unwrap(), Some(Val::i32(6)));
        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(
            ev.run(fid, &[Val::i32(-2i32 as u32)]).unwrap(),
            Some(Val::i32(-3i32 as u32))
        );
    }

    #[test]
    fn critical_edges_are_split() {
        // Two conditional branches into a shared block: both edges from the
        // first branch are critical.
        let mut module = Module::new("transform_test");
        let mut f = Function::new("g", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
        let entry = f.entry();
        let x = f.param(0);
        let shared = f.add_block("shared");
        let other = f.add_block("other");
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            let cond = b.icmp(IcmpPred::Sgt, x, Constant::int32(0));
            b.cond_br(cond, shared, other);
        }
        {
            let mut b = FunctionBuilder::at_end(&mut f, other);
            b.br(shared);
        }
        {
            let mut b = FunctionBuilder::at_end(&mut f, shared);
            b.ret(Some(Operand::Value(x)));
        }
        let fid = module.add_function(f);

        let split = split_all_critical_edges(module.func_mut(fid));
        assert_eq!(split, 1);

        let f = module.func(fid);
        let entry_term = f.block(entry).terminator().unwrap();
        for succ in entry_term.kind.successors() {
            assert!(f.preds(succ).len() == 1 || f.block(succ).terminator().is_some());
        }
        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(ev.run(fid, &[Val::i32(7)]).unwrap(), Some(Val::i32(7)));
    }

    #[test]
    fn switches_lower_to_compare_chains() {
        let mut module = Module::new("transform_test");
        let mut f = Function::new("pick", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
        let entry = f.entry();
        let x = f.param(0);
        let a = f.add_block("a");
        let b_blk = f.add_block("b");
        let d = f.add_block("d");
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            b.switch(
                x,
                d,
                vec![(Constant::int32(1), a), (Constant::int32(2), b_blk)],
            );
        }
        for (blk, ret) in [(a, 10), (b_blk, 20), (d, 30)] {
            let mut b = FunctionBuilder::at_end(&mut f, blk);
            b.ret(Some(Constant::int32(ret).into()));
        }
        let fid = module.add_function(f);

        assert!(lower_switch(module.func_mut(fid)));
        let f = module.func(fid);
        for &blk in f.layout() {
            if let Some(t) = f.block(blk).terminator() {
                assert!(!matches!(t.kind, InstKind::Switch { .. }));
            }
        }
        for (input, expected) in [(1, 10), (2, 20), (9, 30)] {
            let mut ev = Evaluator::new(&module).unwrap();
            assert_eq!(
                ev.run(fid, &[Val::i32(input)]).unwrap(),
                Some(Val::i32(expected))
            );
        }
    }

    #[test]
    fn constant_expressions_expand_to_instructions() {
        let mut module = Module::new("transform_test");
        let g = module.add_global(crate::ir::GlobalVariable::new(
            "arr",
            Ty::array(Ty::Int(64), 3),
            Constant::Array {
                elem_ty: Ty::Int(64),
                elems: vec![
                    Constant::int64(5),
                    Constant::int64(6),
                    Constant::int64(7),
                ],
            },
        ));
        let mut f = Function::new("h", Signature::new(vec![], Ty::Int(64)));
        let entry = f.entry();
        let gep = Constant::Expr(Box::new(ConstExpr::Gep {
            source_ty: Ty::array(Ty::Int(64), 3),
            base: Constant::Global(g),
            indices: vec![Constant::int32(0), Constant::int32(2)],
        }));
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            let v = b.load(Ty::Int(64), Operand::Const(gep));
            b.ret(Some(Operand::Value(v)));
        }
        let fid = module.add_function(f);

        assert!(expand_constant_expr(&mut module, fid));
        let f = module.func(fid);
        for &blk in f.layout() {
            for inst in &f.block(blk).insts {
                for op in inst.kind.operands() {
                    assert!(!matches!(op, Operand::Const(Constant::Expr(_))));
                }
            }
        }
        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(ev.run(fid, &[]).unwrap(), Some(Val::i64(7)));
    }

    #[test]
    fn ambiguous_funclet_color_is_structural() {
        // A block reachable from both the main body and a funclet.
        let mut module = Module::new("transform_test");
        let mut f = Function::new("eh", Signature::new(vec![], Ty::Void));
        f.has_scoped_eh = true;
        let entry = f.entry();
        let pad = f.add_block("pad");
        let shared = f.add_block("shared");

        let pad_inst = f.make_inst(InstKind::EhPad(EhPadKind::CleanupPad), Some(Ty::Ptr));
        f.block_mut(pad).insts.push(pad_inst);
        {
            let mut b = FunctionBuilder::at_end(&mut f, pad);
            b.br(shared);
        }
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            b.cond_br(Constant::bool(true), pad, shared);
        }
        {
            let mut b = FunctionBuilder::at_end(&mut f, shared);
            b.ret(None);
        }
        let fid = module.add_function(f);
        let ext = module.add_function(Function::declaration(
            "ext",
            Signature::new(vec![], Ty::Void),
        ));
        // insert the call before the ret in `shared`
        {
            let f = module.func_mut(fid);
            let shared = f.layout()[2];
            let mut b = FunctionBuilder::before_terminator(f, shared);
            b.call(Constant::Function(ext), vec![], Ty::Void);
        }
        let f = module.func(fid);
        let shared_blk = f.layout()[2];
        let call_id = f.block(shared_blk).insts[0].id;

        let err = fix_eh(&mut module, fid, call_id).unwrap_err();
        assert!(matches!(err, ObfuscationError::Structural(_)));
    }
}
