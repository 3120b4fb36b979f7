use std::path::PathBuf;
use std::sync::Arc;

use irobf::ir::eval::{Evaluator, Val};
use irobf::ir::{
    Constant, FuncId, Function, FunctionBuilder, GlobalVariable, IcmpPred, Module, Operand,
    Signature, Ty,
};
use irobf::options::{ObfuscationOptions, PassFlags};
use irobf::passes::{run_obfuscation, ObfuscationPipeline};

fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "irobf-pipeline-{name}-{}.json",
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

/// The whole program under test:
///
/// ```c
/// int G = 100;
/// static int double_(int y) { return y * 2; }
/// int f(int x) {
///     int r;
///     if (x > 0) r = x + 1; else r = x - 1;
///     return double_(r + G);
/// }
/// ```
fn program(module: &mut Module) -> (FuncId, FuncId) {
    let g = module.add_global(GlobalVariable::new("G", Ty::Int(32), Constant::int32(100)));

    let mut double_ = Function::new("double_", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
    let entry = double_.entry();
    let y = double_.param(0);
    {
        let mut b = FunctionBuilder::at_end(&mut double_, entry);
        let v = b.mul(y, Constant::int32(2));
        b.ret(Some(Operand::Value(v)));
    }
    let double_ = module.add_function(double_);

    let mut f = Function::new("f", Signature::new(vec![Ty::Int(32)], Ty::Int(32)));
    let entry = f.entry();
    let x = f.param(0);
    let then_b = f.add_block("then");
    let else_b = f.add_block("else");
    let join = f.add_block("join");
    let slot;
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        slot = b.alloca(Ty::Int(32));
        let cond = b.icmp(IcmpPred::Sgt, x, Constant::int32(0));
        b.cond_br(cond, then_b, else_b);
    }
    {
        let mut b = FunctionBuilder::at_end(&mut f, then_b);
        let v = b.add(x, Constant::int32(1));
        b.store(v, slot);
        b.br(join);
    }
    {
        let mut b = FunctionBuilder::at_end(&mut f, else_b);
        let v = b.sub(x, Constant::int32(1));
        b.store(v, slot);
        b.br(join);
    }
    {
        let mut b = FunctionBuilder::at_end(&mut f, join);
        let r = b.load(Ty::Int(32), slot);
        let gv = b.load(Ty::Int(32), Constant::Global(g));
        let s = b.add(r, gv);
        let d = b
            .call(Constant::Function(double_), vec![Operand::Value(s)], Ty::Int(32))
            .unwrap();
        b.ret(Some(Operand::Value(d)));
    }
    (module.add_function(f), double_)
}

fn eval_i32(module: &Module, f: FuncId, arg: i32) -> i32 {
    let mut ev = Evaluator::new(module).unwrap();
    match ev.run(f, &[Val::i32(arg as u32)]).unwrap() {
        Some(Val::Int { bits: 32, value }) => value as u32 as i32,
        other => panic!("unexpected result {other:?}"),
    }
}

const FULL_CONFIG: &str = r#"{
    "randomSeed": "0123456789abcdef0123456789abcdef",
    "cie": { "enable": true, "level": 3 },
    "cfe": { "enable": true, "level": 2 },
    "indgv": { "enable": true, "level": 1 },
    "icall": { "enable": true, "level": 2 },
    "fla": { "enable": true },
    "indbr": { "enable": true, "level": 1 }
}"#;

#[test]
fn the_full_pipeline_preserves_program_behavior() {
    for seed in [1u64, 42, 2322] {
        let path = write_config("full", FULL_CONFIG);
        let options = Arc::new(ObfuscationOptions::read_config_file(Some(&path)).unwrap());
        std::fs::remove_file(&path).unwrap();

        let mut module = Module::new("m");
        let (f, _) = program(&mut module);

        let mut pipeline = ObfuscationPipeline::with_seed(options, seed);
        assert!(pipeline.run(&mut module).unwrap());

        for (input, expected) in [(5, 212), (-2, 194), (0, 198), (1000, 2202)] {
            assert_eq!(eval_i32(&module, f, input), expected, "seed {seed}");
        }

        // All page tables were emitted and kept alive.
        for name in [
            "m_IndirectGVs_objects",
            "m_IndirectGVs_page_table_0",
            "m_IndirectCallee_objects",
            "m_IndirectCallee_page_table_0",
        ] {
            let id = module
                .global_by_name(name)
                .unwrap_or_else(|| panic!("seed {seed}: missing {name}"));
            assert!(module.global(id).has_metadata("noobf"));
            assert!(module.compiler_used().contains(&id));
        }

        // Generated globals never become indirection candidates: the object
        // table holds exactly the one user-visible global.
        let objects = module.global_by_name("m_IndirectGVs_objects").unwrap();
        match &module.global(objects).init {
            Some(Constant::Array { elems, .. }) => {
                assert_eq!(elems.len(), 1, "seed {seed}");
                for elem in elems {
                    if let Constant::Global(g) = elem {
                        assert!(!module.global(*g).has_metadata("noobf"));
                    }
                }
            }
            other => panic!("unexpected objects initializer {other:?}"),
        }
    }
}

#[test]
fn constant_int_encryption_hides_the_literal() {
    let path = write_config("cie", r#"{ "cie": { "enable": true, "level": 3 } }"#);
    let options = Arc::new(ObfuscationOptions::read_config_file(Some(&path)).unwrap());
    std::fs::remove_file(&path).unwrap();

    let mut module = Module::new("m");
    let mut f = Function::new("answer", Signature::new(vec![], Ty::Int(32)));
    let entry = f.entry();
    {
        let mut b = FunctionBuilder::at_end(&mut f, entry);
        b.ret(Some(Constant::int32(42).into()));
    }
    let fid = module.add_function(f);

    let mut pipeline = ObfuscationPipeline::with_seed(options, 7);
    assert!(pipeline.run(&mut module).unwrap());

    // 42 appears nowhere in the function's IR any more.
    let func = module.func(fid);
    for &b in func.layout() {
        for inst in &func.block(b).insts {
            for op in inst.kind.operands() {
                assert_ne!(op.as_const(), Some(&Constant::int32(42)));
            }
        }
    }
    // A tagged private global holds the ciphertext instead.
    let cipher = module
        .global_ids()
        .into_iter()
        .find(|g| module.global(*g).name.starts_with("m_cipher"))
        .expect("cipher global expected");
    assert!(module.global(cipher).has_metadata("noobf"));
    assert_ne!(module.global(cipher).init, Some(Constant::int32(42)));

    assert_eq!(eval_i32(&module, fid, 0), 42);
}

#[test]
fn annotations_override_the_config_per_function() {
    let path = write_config("anno", r#"{ "fla": { "enable": true } }"#);
    let options = Arc::new(ObfuscationOptions::read_config_file(Some(&path)).unwrap());
    std::fs::remove_file(&path).unwrap();

    let mut module = Module::new("m");
    let (f, double_) = program(&mut module);
    module.add_annotation(f, "-fla");

    let blocks_before = module.func(f).layout().len();
    let mut pipeline = ObfuscationPipeline::with_seed(options, 3);
    pipeline.run(&mut module).unwrap();

    // `f` opted out; `double_` (single block) is ineligible anyway.
    assert_eq!(module.func(f).layout().len(), blocks_before);
    let names: Vec<&str> = module
        .func(f)
        .layout()
        .iter()
        .map(|b| module.func(f).block(*b).name.as_str())
        .collect();
    assert!(!names.contains(&"loopEntry"));
    let _ = double_;
}

#[test]
fn annotations_enable_against_a_disabled_config() {
    let mut module = Module::new("m");
    let (f, _) = program(&mut module);
    module.add_annotation(f, "+fla");

    // Nothing enabled globally; only the annotation turns flattening on.
    let options = Arc::new(ObfuscationOptions::new());
    let mut pipeline = ObfuscationPipeline::with_seed(options, 5);
    assert!(pipeline.run(&mut module).unwrap());

    let names: Vec<String> = module
        .func(f)
        .layout()
        .iter()
        .map(|b| module.func(f).block(*b).name.clone())
        .collect();
    assert!(names.iter().any(|n| n == "loopEntry"));

    assert_eq!(eval_i32(&module, f, 5), 212);
    assert_eq!(eval_i32(&module, f, -2), 194);
}

#[test]
fn disabled_flags_make_the_pipeline_a_no_op() {
    let mut module = Module::new("m");
    let (f, _) = program(&mut module);
    let before = module.func(f).inst_count();

    let changed = run_obfuscation(&mut module, &PassFlags::default()).unwrap();
    assert!(!changed);
    assert_eq!(module.func(f).inst_count(), before);
}

#[test]
fn flags_enable_the_pipeline_without_a_config() {
    let mut module = Module::new("m");
    let (f, _) = program(&mut module);

    let flags = PassFlags {
        icall: Some(true),
        ..PassFlags::default()
    };
    let changed = run_obfuscation(&mut module, &flags).unwrap();
    assert!(changed);
    assert_eq!(eval_i32(&module, f, 5), 212);
    assert!(module.global_by_name("m_IndirectCallee_objects").is_some());
}

#[test]
fn missing_config_file_aborts() {
    let mut module = Module::new("m");
    program(&mut module);

    let flags = PassFlags {
        config_path: Some(PathBuf::from("/nonexistent/irobf.json")),
        ..PassFlags::default()
    };
    assert!(run_obfuscation(&mut module, &flags).is_err());
}

#[test]
fn rtti_without_a_seed_aborts() {
    let mut module = Module::new("m");
    program(&mut module);

    let flags = PassFlags {
        rtti: Some(true),
        ..PassFlags::default()
    };
    assert!(run_obfuscation(&mut module, &flags).is_err());
}
