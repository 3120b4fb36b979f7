use std::collections::HashMap;
use std::sync::Arc;

use irobf::ir::eval::{Evaluator, Val};
use irobf::ir::{
    Constant, FuncId, Function, FunctionBuilder, GlobalVariable, IcmpPred, InstKind, Linkage,
    Module, Operand, Signature, Ty,
};
use irobf::options::{ObfuscationOptions, PassFlags};
use irobf::passes::{FunctionPass, IndirectBranch, IndirectCall, IndirectGlobalVariable};
use irobf::prelude::CryptoRandom;

fn options_with(tag: &str, level: u32) -> Arc<ObfuscationOptions> {
    let mut flags = PassFlags::default();
    match tag {
        "indbr" => {
            flags.indbr = Some(true);
            flags.level_indbr = Some(level);
        }
        "icall" => {
            flags.icall = Some(true);
            flags.level_icall = Some(level);
        }
        "indgv" => {
            flags.indgv = Some(true);
            flags.level_indgv = Some(level);
        }
        other => panic!("unknown tag {other}"),
    }
    Arc::new(flags.resolve_options().unwrap())
}

fn run_function_pass<P: FunctionPass>(pass: &mut P, module: &mut Module) {
    pass.do_initialization(module).unwrap();
    for f in module.func_ids() {
        pass.run_on_function(module, f).unwrap();
    }
    pass.do_finalization(module).unwrap();
}

/// `fn pick(x) { if x != 0 { return 11 } else { return 22 } }`
fn branch_fixture(module: &mut Module) -> FuncId {
    let mut f = Function::new("pick", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
    let entry = f.entry();
    let x = f.param(0);
    let then_b = f.add_block("then");
    let else_b = f.add_block("else");
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        let cond = b.icmp(IcmpPred::Ne, x, Constant::int32(0));
        b.cond_br(cond, then_b, else_b);
    }
    {
        let mut b = FunctionBuilder::at_end(&mut f, then_b);
        b.ret(Some(Constant::int32(11).into()));
    }
    {
        let mut b = FunctionBuilder::at_end(&mut f, else_b);
        b.ret(Some(Constant::int32(22).into()));
    }
    module.add_function(f)
}

fn eval_i32(module: &Module, f: FuncId, arg: u32) -> u32 {
    let mut ev = Evaluator::new(module).unwrap();
    match ev.run(f, &[Val::i32(arg)]).unwrap() {
        Some(Val::Int { bits: 32, value }) => value as u32,
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn conditional_branches_become_indirect() {
    for level in 0..=3u32 {
        let mut module = Module::new("m");
        let f = branch_fixture(&mut module);

        let mut pass = IndirectBranch::with_rng(
            options_with("indbr", level),
            CryptoRandom::from_u64(2322 + level as u64),
        );
        run_function_pass(&mut pass, &mut module);

        let func = module.func(f);
        let entry_term = func.block(func.entry()).terminator().unwrap();
        assert!(
            matches!(entry_term.kind, InstKind::IndirectBr { ref dests, .. } if dests.len() == 2),
            "level {level}: entry should end in an indirect branch"
        );
        for &b in func.layout() {
            for inst in &func.block(b).insts {
                assert!(!matches!(inst.kind, InstKind::CondBr { .. }));
            }
        }

        assert_eq!(eval_i32(&module, f, 1), 11, "level {level}");
        assert_eq!(eval_i32(&module, f, 0), 22, "level {level}");

        let objects = module.global_by_name("m_IndirectBr_objects").unwrap();
        let page0 = module.global_by_name("m_IndirectBr_page_table_0").unwrap();
        assert!(module.global(objects).has_metadata("noobf"));
        assert!(module.global(page0).has_metadata("noobf"));
        assert!(module.compiler_used().contains(&objects));
        assert!(module.compiler_used().contains(&page0));

        let enhanced = module.global_by_name("mpick_IndirectBr_enhanced_page_table_0");
        if level > 0 {
            let enhanced = enhanced.expect("per-function chain expected");
            assert_eq!(module.global(enhanced).linkage, Linkage::Private);
            assert!(module.global(enhanced).has_metadata("noobf"));
            assert!(module
                .global_by_name(&format!(
                    "mpick_IndirectBr_enhanced_page_table_{}",
                    level - 1
                ))
                .is_some());
        } else {
            assert!(enhanced.is_none());
        }
    }
}

#[test]
fn branchless_functions_are_left_alone() {
    let mut module = Module::new("m");
    let mut f = Function::new("flat", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
    let entry = f.entry();
    let x = f.param(0);
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        let v = b.add(x, Constant::int32(3));
        b.ret(Some(Operand::Value(v)));
    }
    let fid = module.add_function(f);
    let before = module.func(fid).inst_count();

    let mut pass = IndirectBranch::with_rng(options_with("indbr", 1), CryptoRandom::from_u64(1));
    run_function_pass(&mut pass, &mut module);

    assert_eq!(module.func(fid).inst_count(), before);
    assert!(module.global_by_name("m_IndirectBr_objects").is_none());
    assert!(module.compiler_used().is_empty());
}

/// caller() { return double(21) }  with double(x) { return x * 2 }
fn call_fixture(module: &mut Module) -> (FuncId, FuncId) {
    let mut double = Function::new("double", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
    let entry = double.entry();
    let y = double.param(0);
    {
        let mut b = FunctionBuilder::at_end(&mut double, entry);
        let v = b.mul(y, Constant::int32(2));
        b.ret(Some(Operand::Value(v)));
    }
    let double = module.add_function(double);

    let mut caller = Function::new("caller", Signature::new(vec![], Ty::Int(32)));
    let entry = caller.entry();
    {
        let mut b = FunctionBuilder::at_end(&mut caller, entry);
        let r = b
            .call(
                Constant::Function(double),
                vec![Constant::int32(21).into()],
                Ty::Int(32),
            )
            .unwrap();
        b.ret(Some(Operand::Value(r)));
    }
    (module.add_function(caller), double)
}

#[test]
fn direct_calls_go_through_the_page_table() {
    for level in 0..=3u32 {
        let mut module = Module::new("m");
        let (caller, double) = call_fixture(&mut module);

        let mut pass = IndirectCall::with_rng(
            options_with("icall", level),
            CryptoRandom::from_u64(7 + level as u64),
        );
        run_function_pass(&mut pass, &mut module);

        // The called operand is now a computed pointer, not the callee.
        let func = module.func(caller);
        let call = func
            .layout()
            .iter()
            .flat_map(|b| func.block(*b).insts.iter())
            .find(|i| matches!(i.kind, InstKind::Call { .. }))
            .unwrap();
        let InstKind::Call { callee, .. } = &call.kind else {
            unreachable!();
        };
        assert!(callee.as_value().is_some());
        let _ = double;

        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(ev.run(caller, &[]).unwrap(), Some(Val::i32(42)));

        let objects = module.global_by_name("m_IndirectCallee_objects").unwrap();
        assert!(module.global(objects).has_metadata("noobf"));
        assert!(module.compiler_used().contains(&objects));
        if level > 0 {
            assert!(module
                .global_by_name("mcaller_IndirectCallee_enhanced_page_table_0")
                .is_some());
        }
    }
}

#[test]
fn external_callees_still_get_called() {
    let mut module = Module::new("m");
    let printf = module.add_function(Function::declaration(
        "printf",
        Signature::new(vec![Ty::Ptr], Ty::Int(32)),
    ));
    let fmt = module.add_global(GlobalVariable::new(
        "fmt",
        Ty::array(Ty::Int(8), 4),
        Constant::Str(b"hi\n\0".to_vec()),
    ));
    let mut f = Function::new("greet", Signature::new(vec![], Ty::Void));
    let entry = f.entry();
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        b.call(
            Constant::Function(printf),
            vec![Constant::Global(fmt).into()],
            Ty::Int(32),
        );
        b.ret(None);
    }
    let greet = module.add_function(f);

    let mut pass = IndirectCall::with_rng(options_with("icall", 1), CryptoRandom::from_u64(5));
    run_function_pass(&mut pass, &mut module);

    let mut ev = Evaluator::new(&module).unwrap();
    ev.run(greet, &[]).unwrap();
    assert_eq!(ev.external_calls.len(), 1);
    assert_eq!(ev.external_calls[0].0, "printf");
}

#[test]
fn intrinsic_only_callers_are_left_alone() {
    let mut module = Module::new("m");
    let mut donothing = Function::declaration("donothing", Signature::new(vec![], Ty::Void));
    donothing.is_intrinsic = true;
    let donothing = module.add_function(donothing);

    let mut f = Function::new("quiet", Signature::new(vec![], Ty::Void));
    let entry = f.entry();
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        b.call(Constant::Function(donothing), vec![], Ty::Void);
        b.ret(None);
    }
    let fid = module.add_function(f);
    let before = module.func(fid).inst_count();

    let mut pass = IndirectCall::with_rng(options_with("icall", 2), CryptoRandom::from_u64(9));
    run_function_pass(&mut pass, &mut module);

    assert_eq!(module.func(fid).inst_count(), before);
    assert!(module.global_by_name("m_IndirectCallee_objects").is_none());
}

/// counter() { return g }  with global g = 7
fn gv_fixture(module: &mut Module) -> FuncId {
    let g = module.add_global(GlobalVariable::new(
        "g",
        Ty::Int(32),
        Constant::int32(7),
    ));
    let mut f = Function::new("counter", Signature::new(vec![], Ty::Int(32)));
    let entry = f.entry();
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        let v = b.load(Ty::Int(32), Constant::Global(g));
        b.ret(Some(Operand::Value(v)));
    }
    module.add_function(f)
}

#[test]
fn global_references_go_through_the_page_table() {
    for level in 0..=3u32 {
        let mut module = Module::new("m");
        let f = gv_fixture(&mut module);

        let mut pass = IndirectGlobalVariable::with_rng(
            options_with("indgv", level),
            CryptoRandom::from_u64(11 + level as u64),
        );
        run_function_pass(&mut pass, &mut module);

        // No instruction in the function names `g` directly any more.
        let g = module.global_by_name("g").unwrap();
        let func = module.func(f);
        for &b in func.layout() {
            for inst in &func.block(b).insts {
                for op in inst.kind.operands() {
                    assert_ne!(op.as_global(), Some(g), "level {level}");
                }
            }
        }

        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(ev.run(f, &[]).unwrap(), Some(Val::i32(7)), "level {level}");

        let objects = module.global_by_name("m_IndirectGVs_objects").unwrap();
        assert!(module.global(objects).has_metadata("noobf"));
        assert!(module.compiler_used().contains(&objects));
        if level > 0 {
            assert!(module
                .global_by_name("mcounter_IndirectGVs_enhanced_page_table_0")
                .is_some());
        }
    }
}

#[test]
fn noobf_globals_are_never_candidates() {
    let mut module = Module::new("m");
    let mut hidden = GlobalVariable::new("hidden", Ty::Int(32), Constant::int32(1));
    hidden.add_metadata("noobf");
    let hidden = module.add_global(hidden);
    let shown = module.add_global(GlobalVariable::new("shown", Ty::Int(32), Constant::int32(2)));

    let mut f = Function::new("mix", Signature::new(vec![], Ty::Int(32)));
    let entry = f.entry();
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        let a = b.load(Ty::Int(32), Constant::Global(hidden));
        let c = b.load(Ty::Int(32), Constant::Global(shown));
        let s = b.add(a, c);
        b.ret(Some(Operand::Value(s)));
    }
    let fid = module.add_function(f);

    let mut pass =
        IndirectGlobalVariable::with_rng(options_with("indgv", 0), CryptoRandom::from_u64(13));
    run_function_pass(&mut pass, &mut module);

    // The tagged global keeps its direct reference; the plain one doesn't.
    let func = module.func(fid);
    let mut directs: HashMap<_, usize> = HashMap::new();
    for &b in func.layout() {
        for inst in &func.block(b).insts {
            for op in inst.kind.operands() {
                if let Some(g) = op.as_global() {
                    *directs.entry(g).or_default() += 1;
                }
            }
        }
    }
    assert!(directs.contains_key(&hidden));
    assert!(!directs.contains_key(&shown));

    // And the object table only holds the plain global.
    let objects = module.global_by_name("m_IndirectGVs_objects").unwrap();
    match &module.global(objects).init {
        Some(Constant::Array { elems, .. }) => {
            assert_eq!(elems.len(), 1);
            assert_eq!(elems[0], Constant::Global(shown));
        }
        other => panic!("unexpected objects initializer {other:?}"),
    }

    let mut ev = Evaluator::new(&module).unwrap();
    assert_eq!(ev.run(fid, &[]).unwrap(), Some(Val::i32(3)));
}
