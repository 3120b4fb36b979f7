//! Reference evaluator.
//!
//! A typed-slot interpreter over the IR, used by the test suite to check
//! that obfuscated functions still compute what the original did. Memory is
//! a set of objects (one per global and per `alloca`) holding typed slots;
//! pointers are `(object, element)` pairs. Execution is bounded by a step
//! budget so a miscompiled dispatcher loops into an error instead of
//! hanging the suite.

use std::collections::HashMap;

use crate::error::EvalError;

use super::constant::{ConstExpr, Constant, FloatConst};
use super::function::{BlockId, Function, ValueId};
use super::inst::{BinOp, CastKind, IcmpPred, InstKind, Operand};
use super::mask_to_width;
use super::module::{FuncId, GlobalId, Module};
use super::types::Ty;

const DEFAULT_STEP_LIMIT: u64 = 1_000_000;
const CALL_DEPTH_LIMIT: usize = 128;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    /// Integer of a given width.
    Int {
        /// Bit width.
        bits: u32,
        /// Value truncated to `bits`.
        value: u64,
    },
    /// Float, kept as raw bits.
    Float(FloatConst),
    /// Pointer into evaluator memory.
    Ptr(Addr),
    /// Function address.
    Func(FuncId),
    /// Block address.
    BlockAddr(FuncId, BlockId),
    /// Null pointer.
    Null,
    /// Undefined.
    Undef,
}

impl Val {
    /// Integer value masked to `bits`.
    pub const fn int(bits: u32, value: u64) -> Self {
        Val::Int {
            bits,
            value: mask_to_width(value, bits),
        }
    }

    /// `i32` value.
    pub const fn i32(value: u32) -> Self {
        Val::Int {
            bits: 32,
            value: value as u64,
        }
    }

    /// `i64` value.
    pub const fn i64(value: u64) -> Self {
        Val::Int { bits: 64, value }
    }

    /// Width and bits of an integer value.
    pub const fn as_int(&self) -> Option<(u32, u64)> {
        match self {
            Val::Int { bits, value } => Some((*bits, *value)),
            _ => None,
        }
    }

    fn expect_int(&self, what: &str) -> Result<(u32, u64), EvalError> {
        self.as_int()
            .ok_or_else(|| EvalError::TypeMismatch(format!("{what}: expected integer, got {self:?}")))
    }

    fn expect_ptr(&self, what: &str) -> Result<Addr, EvalError> {
        match self {
            Val::Ptr(addr) => Ok(*addr),
            _ => Err(EvalError::TypeMismatch(format!(
                "{what}: expected pointer, got {self:?}"
            ))),
        }
    }
}

/// A memory address: object handle plus element index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    /// Memory object.
    pub obj: usize,
    /// Flattened element index.
    pub elem: usize,
}

#[derive(Debug, Clone)]
struct MemObj {
    slots: Vec<Val>,
}

/// Evaluator over one module.
#[derive(Debug)]
pub struct Evaluator<'m> {
    module: &'m Module,
    mem: Vec<MemObj>,
    global_addr: HashMap<GlobalId, usize>,
    /// Calls to function declarations, recorded in execution order as
    /// `(symbol, arguments)`.
    pub external_calls: Vec<(String, Vec<Val>)>,
    steps_left: u64,
}

impl<'m> Evaluator<'m> {
    /// Evaluator with all globals materialized.
    pub fn new(module: &'m Module) -> Result<Self, EvalError> {
        let mut ev = Evaluator {
            module,
            mem: Vec::new(),
            global_addr: HashMap::new(),
            external_calls: Vec::new(),
            steps_left: DEFAULT_STEP_LIMIT,
        };
        // Two-phase init: globals may point at each other.
        for g in module.global_ids() {
            let obj = ev.mem.len();
            ev.mem.push(MemObj { slots: Vec::new() });
            ev.global_addr.insert(g, obj);
        }
        for g in module.global_ids() {
            let slots = match &module.global(g).init {
                Some(init) => ev.flatten_const(init)?,
                None => vec![Val::Undef],
            };
            let obj = ev.global_addr[&g];
            ev.mem[obj].slots = slots;
        }
        Ok(ev)
    }

    /// Override the step budget.
    pub fn set_step_limit(&mut self, steps: u64) {
        self.steps_left = steps;
    }

    /// Run a function with the given arguments.
    pub fn run(&mut self, func: FuncId, args: &[Val]) -> Result<Option<Val>, EvalError> {
        self.exec(func, args.to_vec(), 0)
    }

    fn consume_step(&mut self) -> Result<(), EvalError> {
        if self.steps_left == 0 {
            return Err(EvalError::StepLimit);
        }
        self.steps_left -= 1;
        Ok(())
    }

    fn flatten_const(&self, c: &Constant) -> Result<Vec<Val>, EvalError> {
        match c {
            Constant::Str(bytes) => Ok(bytes.iter().map(|b| Val::int(8, *b as u64)).collect()),
            Constant::Array { elems, .. } => {
                let mut out = Vec::with_capacity(elems.len());
                for e in elems {
                    out.extend(self.flatten_const(e)?);
                }
                Ok(out)
            }
            Constant::Struct { fields, .. } => {
                let mut out = Vec::new();
                for f in fields {
                    out.extend(self.flatten_const(f)?);
                }
                Ok(out)
            }
            other => Ok(vec![self.scalar_const(other)?]),
        }
    }

    fn scalar_const(&self, c: &Constant) -> Result<Val, EvalError> {
        match c {
            Constant::Int { bits, value } => Ok(Val::int(*bits, *value)),
            Constant::Float(f) => Ok(Val::Float(*f)),
            Constant::NullPtr => Ok(Val::Null),
            Constant::Global(g) => Ok(Val::Ptr(Addr {
                obj: self.global_addr[g],
                elem: 0,
            })),
            Constant::Function(f) => Ok(Val::Func(*f)),
            Constant::BlockAddress(f, b) => Ok(Val::BlockAddr(*f, *b)),
            Constant::Undef(_) => Ok(Val::Undef),
            Constant::Expr(e) => self.eval_const_expr(e),
            Constant::Str(_) | Constant::Array { .. } | Constant::Struct { .. } => Err(
                EvalError::TypeMismatch("aggregate constant used as scalar".into()),
            ),
        }
    }

    fn eval_const_expr(&self, e: &ConstExpr) -> Result<Val, EvalError> {
        match e {
            ConstExpr::Bitcast(inner, to) => bitcast_val(self.scalar_const(inner)?, to),
            ConstExpr::Gep {
                source_ty,
                base,
                indices,
            } => {
                let base = self.scalar_const(base)?.expect_ptr("constant gep")?;
                let idx: Vec<u64> = indices
                    .iter()
                    .map(|c| {
                        c.as_int()
                            .map(|(_, v)| v)
                            .ok_or_else(|| EvalError::TypeMismatch("gep index".into()))
                    })
                    .collect::<Result<_, _>>()?;
                Ok(Val::Ptr(gep_addr(source_ty, base, &idx)?))
            }
            ConstExpr::Add(l, r) => fold_int(l, r, u64::wrapping_add),
            ConstExpr::Sub(l, r) => fold_int(l, r, u64::wrapping_sub),
            ConstExpr::Xor(l, r) => fold_int(l, r, |a, b| a ^ b),
            ConstExpr::Mul(l, r) => fold_int(l, r, u64::wrapping_mul),
            ConstExpr::Neg(v) => {
                let (bits, value) = v
                    .as_int()
                    .ok_or_else(|| EvalError::TypeMismatch("neg operand".into()))?;
                Ok(Val::int(bits, value.wrapping_neg()))
            }
            ConstExpr::PtrToInt(..) | ConstExpr::IntToPtr(..) => Err(EvalError::TypeMismatch(
                "unsupported constant cast".into(),
            )),
        }
    }

    fn eval_operand(
        &self,
        regs: &HashMap<ValueId, Val>,
        op: &Operand,
    ) -> Result<Val, EvalError> {
        match op {
            Operand::Value(v) => regs
                .get(v)
                .cloned()
                .ok_or_else(|| EvalError::MalformedIr(format!("use of undefined value {v:?}"))),
            Operand::Const(c) => self.scalar_const(c),
        }
    }

    fn load_slot(&self, addr: Addr) -> Result<Val, EvalError> {
        self.mem
            .get(addr.obj)
            .and_then(|o| o.slots.get(addr.elem))
            .cloned()
            .ok_or(EvalError::OutOfBounds)
    }

    fn store_slot(&mut self, addr: Addr, value: Val) -> Result<(), EvalError> {
        let slot = self
            .mem
            .get_mut(addr.obj)
            .and_then(|o| o.slots.get_mut(addr.elem))
            .ok_or(EvalError::OutOfBounds)?;
        *slot = value;
        Ok(())
    }

    fn external_result(&mut self, func: &Function, args: Vec<Val>) -> Option<Val> {
        self.external_calls.push((func.name.clone(), args));
        match &func.sig.ret {
            Ty::Void => None,
            Ty::Int(bits) => Some(Val::int(*bits, 0)),
            Ty::Ptr => Some(Val::Null),
            Ty::F32 => Some(Val::Float(FloatConst::from_f32(0.0))),
            Ty::F64 => Some(Val::Float(FloatConst::from_f64(0.0))),
            _ => Some(Val::Undef),
        }
    }

    fn exec(
        &mut self,
        fid: FuncId,
        args: Vec<Val>,
        depth: usize,
    ) -> Result<Option<Val>, EvalError> {
        if depth > CALL_DEPTH_LIMIT {
            return Err(EvalError::StepLimit);
        }
        let module = self.module;
        let func = module.func(fid);
        if func.is_declaration() {
            return Ok(self.external_result(func, args));
        }
        if args.len() != func.sig.params.len() {
            return Err(EvalError::MalformedIr(format!(
                "{}: expected {} arguments, got {}",
                func.name,
                func.sig.params.len(),
                args.len()
            )));
        }

        let mut regs: HashMap<ValueId, Val> = HashMap::new();
        for (i, arg) in args.into_iter().enumerate() {
            regs.insert(func.param(i), arg);
        }

        let mut cur = func.entry();
        let mut prev: Option<BlockId> = None;
        loop {
            let block = func.block(cur);

            // All phis at the head of the block read their inputs
            // atomically before any of them writes.
            let mut idx = 0;
            let mut phi_writes = Vec::new();
            while let Some(inst) = block.insts.get(idx) {
                let InstKind::Phi { incomings, .. } = &inst.kind else {
                    break;
                };
                let pred = prev
                    .ok_or_else(|| EvalError::MalformedIr("phi in entry block".into()))?;
                let (incoming, _) = incomings
                    .iter()
                    .find(|(_, b)| *b == pred)
                    .ok_or_else(|| EvalError::MalformedIr("phi missing incoming".into()))?;
                let value = self.eval_operand(&regs, incoming)?;
                let result = inst
                    .result
                    .ok_or_else(|| EvalError::MalformedIr("phi without result".into()))?;
                phi_writes.push((result, value));
                idx += 1;
            }
            for (r, v) in phi_writes {
                regs.insert(r, v);
            }

            let mut next: Option<BlockId> = None;
            while let Some(inst) = block.insts.get(idx) {
                self.consume_step()?;
                idx += 1;
                let kind = &inst.kind;
                let result = match kind {
                    InstKind::Phi { .. } => {
                        return Err(EvalError::MalformedIr("phi below block head".into()))
                    }
                    InstKind::Alloca { .. } => {
                        let obj = self.mem.len();
                        self.mem.push(MemObj {
                            slots: vec![Val::Undef],
                        });
                        Some(Val::Ptr(Addr { obj, elem: 0 }))
                    }
                    InstKind::Load { ptr, .. } => {
                        let addr = self.eval_operand(&regs, ptr)?.expect_ptr("load")?;
                        Some(self.load_slot(addr)?)
                    }
                    InstKind::Store { value, ptr, .. } => {
                        let v = self.eval_operand(&regs, value)?;
                        let addr = self.eval_operand(&regs, ptr)?.expect_ptr("store")?;
                        self.store_slot(addr, v)?;
                        None
                    }
                    InstKind::Bin { op, lhs, rhs } => {
                        let l = self.eval_operand(&regs, lhs)?;
                        let r = self.eval_operand(&regs, rhs)?;
                        Some(eval_bin(*op, &l, &r)?)
                    }
                    InstKind::Neg(v) => {
                        let (bits, value) = self.eval_operand(&regs, v)?.expect_int("neg")?;
                        Some(Val::int(bits, value.wrapping_neg()))
                    }
                    InstKind::Not(v) => {
                        let (bits, value) = self.eval_operand(&regs, v)?.expect_int("not")?;
                        Some(Val::int(bits, !value))
                    }
                    InstKind::Fshl { hi, lo, amount } => {
                        let (bits, a) = self.eval_operand(&regs, hi)?.expect_int("fshl")?;
                        let (_, b) = self.eval_operand(&regs, lo)?.expect_int("fshl")?;
                        let (_, s) = self.eval_operand(&regs, amount)?.expect_int("fshl")?;
                        Some(Val::int(bits, funnel_shl(a, b, s, bits)))
                    }
                    InstKind::Fshr { hi, lo, amount } => {
                        let (bits, a) = self.eval_operand(&regs, hi)?.expect_int("fshr")?;
                        let (_, b) = self.eval_operand(&regs, lo)?.expect_int("fshr")?;
                        let (_, s) = self.eval_operand(&regs, amount)?.expect_int("fshr")?;
                        Some(Val::int(bits, funnel_shr(a, b, s, bits)))
                    }
                    InstKind::Bswap(v) => {
                        let (bits, value) = self.eval_operand(&regs, v)?.expect_int("bswap")?;
                        Some(Val::int(bits, byte_swap(value, bits)))
                    }
                    InstKind::Icmp { pred, lhs, rhs } => {
                        let l = self.eval_operand(&regs, lhs)?;
                        let r = self.eval_operand(&regs, rhs)?;
                        Some(Val::int(1, eval_icmp(*pred, &l, &r)? as u64))
                    }
                    InstKind::Select {
                        cond,
                        on_true,
                        on_false,
                    } => {
                        let (_, c) = self.eval_operand(&regs, cond)?.expect_int("select")?;
                        let taken = if c != 0 { on_true } else { on_false };
                        Some(self.eval_operand(&regs, taken)?)
                    }
                    InstKind::Gep {
                        source_ty,
                        base,
                        indices,
                    } => {
                        let addr = self.eval_operand(&regs, base)?.expect_ptr("gep")?;
                        let mut idx = Vec::with_capacity(indices.len());
                        for op in indices {
                            let (_, v) = self.eval_operand(&regs, op)?.expect_int("gep index")?;
                            idx.push(v);
                        }
                        Some(Val::Ptr(gep_addr(source_ty, addr, &idx)?))
                    }
                    InstKind::Cast { kind, value, to } => {
                        let v = self.eval_operand(&regs, value)?;
                        Some(eval_cast(*kind, v, to)?)
                    }
                    InstKind::Call { callee, args, .. } => {
                        let target = match self.eval_operand(&regs, callee)? {
                            Val::Func(f) => f,
                            _ => return Err(EvalError::BadCallee),
                        };
                        let mut argv = Vec::with_capacity(args.len());
                        for a in args {
                            argv.push(self.eval_operand(&regs, a)?);
                        }
                        self.exec(target, argv, depth + 1)?
                    }
                    InstKind::AtomicRmw { ptr, value } => {
                        let v = self.eval_operand(&regs, value)?;
                        let addr = self.eval_operand(&regs, ptr)?.expect_ptr("atomicrmw")?;
                        let old = self.load_slot(addr)?;
                        self.store_slot(addr, v)?;
                        Some(old)
                    }
                    InstKind::Br(dest) => {
                        next = Some(*dest);
                        None
                    }
                    InstKind::CondBr {
                        cond,
                        on_true,
                        on_false,
                    } => {
                        let (_, c) = self.eval_operand(&regs, cond)?.expect_int("condbr")?;
                        next = Some(if c != 0 { *on_true } else { *on_false });
                        None
                    }
                    InstKind::Switch {
                        value,
                        default,
                        cases,
                    } => {
                        let (bits, v) = self.eval_operand(&regs, value)?.expect_int("switch")?;
                        let hit = cases
                            .iter()
                            .find(|(c, _)| c.as_int() == Some((bits, v)))
                            .map(|(_, b)| *b);
                        next = Some(hit.unwrap_or(*default));
                        None
                    }
                    InstKind::IndirectBr { address, dests } => {
                        match self.eval_operand(&regs, address)? {
                            Val::BlockAddr(f, b) if f == fid && dests.contains(&b) => {
                                next = Some(b);
                            }
                            _ => return Err(EvalError::BadIndirectTarget),
                        }
                        None
                    }
                    InstKind::Ret(value) => {
                        return match value {
                            Some(op) => Ok(Some(self.eval_operand(&regs, op)?)),
                            None => Ok(None),
                        };
                    }
                    InstKind::Invoke {
                        callee,
                        args,
                        normal,
                        ..
                    } => {
                        let target = match self.eval_operand(&regs, callee)? {
                            Val::Func(f) => f,
                            _ => return Err(EvalError::BadCallee),
                        };
                        let mut argv = Vec::with_capacity(args.len());
                        for a in args {
                            argv.push(self.eval_operand(&regs, a)?);
                        }
                        let r = self.exec(target, argv, depth + 1)?;
                        next = Some(*normal);
                        r
                    }
                    InstKind::EhPad(_) => {
                        return Err(EvalError::MalformedIr("eh pad executed".into()))
                    }
                    InstKind::Unreachable => {
                        return Err(EvalError::MalformedIr("reached unreachable".into()))
                    }
                };
                if let (Some(r), Some(v)) = (inst.result, result) {
                    regs.insert(r, v);
                }
                if let Some(dest) = next {
                    prev = Some(cur);
                    cur = dest;
                    break;
                }
            }
            if next.is_none() {
                return Err(EvalError::MalformedIr(format!(
                    "block {} fell off the end",
                    func.block(cur).name
                )));
            }
        }
    }
}

fn fold_int(l: &Constant, r: &Constant, f: impl Fn(u64, u64) -> u64) -> Result<Val, EvalError> {
    match (l.as_int(), r.as_int()) {
        (Some((bits, a)), Some((_, b))) => Ok(Val::int(bits, f(a, b))),
        _ => Err(EvalError::TypeMismatch("constant fold on non-integers".into())),
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

fn byte_swap(value: u64, bits: u32) -> u64 {
    debug_assert!(bits % 8 == 0);
    value.swap_bytes() >> (64 - bits)
}

fn funnel_shl(hi: u64, lo: u64, amount: u64, bits: u32) -> u64 {
    let s = (amount % bits as u64) as u32;
    if s == 0 {
        hi
    } else {
        mask_to_width((hi << s) | (mask_to_width(lo, bits) >> (bits - s)), bits)
    }
}

fn funnel_shr(hi: u64, lo: u64, amount: u64, bits: u32) -> u64 {
    let s = (amount % bits as u64) as u32;
    if s == 0 {
        lo
    } else {
        mask_to_width((mask_to_width(lo, bits) >> s) | (hi << (bits - s)), bits)
    }
}

fn eval_bin(op: BinOp, l: &Val, r: &Val) -> Result<Val, EvalError> {
    if let (Some((bits, a)), Some((_, b))) = (l.as_int(), r.as_int()) {
        let value = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Xor => a ^ b,
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Shl => a << (b % bits as u64),
            BinOp::LShr => a >> (b % bits as u64),
            BinOp::AShr => (sign_extend(a, bits) >> (b % bits as u64)) as u64,
            _ => return Err(EvalError::TypeMismatch("float op on integers".into())),
        };
        return Ok(Val::int(bits, value));
    }
    if let (Val::Float(a), Val::Float(b)) = (l, r) {
        let value = match (a, b) {
            (FloatConst::F64(x), FloatConst::F64(y)) => {
                let (x, y) = (f64::from_bits(*x), f64::from_bits(*y));
                FloatConst::from_f64(match op {
                    BinOp::FAdd => x + y,
                    BinOp::FSub => x - y,
                    BinOp::FMul => x * y,
                    BinOp::FDiv => x / y,
                    _ => return Err(EvalError::TypeMismatch("integer op on floats".into())),
                })
            }
            (FloatConst::F32(x), FloatConst::F32(y)) => {
                let (x, y) = (f32::from_bits(*x), f32::from_bits(*y));
                FloatConst::from_f32(match op {
                    BinOp::FAdd => x + y,
                    BinOp::FSub => x - y,
                    BinOp::FMul => x * y,
                    BinOp::FDiv => x / y,
                    _ => return Err(EvalError::TypeMismatch("integer op on floats".into())),
                })
            }
            _ => return Err(EvalError::TypeMismatch("mixed float widths".into())),
        };
        return Ok(Val::Float(value));
    }
    Err(EvalError::TypeMismatch(format!(
        "binary op on {l:?} and {r:?}"
    )))
}

fn eval_icmp(pred: IcmpPred, l: &Val, r: &Val) -> Result<bool, EvalError> {
    let (bits, a) = l.expect_int("icmp")?;
    let (_, b) = r.expect_int("icmp")?;
    let (sa, sb) = (sign_extend(a, bits), sign_extend(b, bits));
    Ok(match pred {
        IcmpPred::Eq => a == b,
        IcmpPred::Ne => a != b,
        IcmpPred::Ugt => a > b,
        IcmpPred::Uge => a >= b,
        IcmpPred::Ult => a < b,
        IcmpPred::Ule => a <= b,
        IcmpPred::Sgt => sa > sb,
        IcmpPred::Sge => sa >= sb,
        IcmpPred::Slt => sa < sb,
        IcmpPred::Sle => sa <= sb,
    })
}

fn eval_cast(kind: CastKind, value: Val, to: &Ty) -> Result<Val, EvalError> {
    match kind {
        CastKind::Bitcast => bitcast_val(value, to),
        CastKind::Zext => {
            let (_, v) = value.expect_int("zext")?;
            match to {
                Ty::Int(bits) => Ok(Val::int(*bits, v)),
                _ => Err(EvalError::TypeMismatch("zext to non-integer".into())),
            }
        }
        CastKind::Sext => {
            let (bits, v) = value.expect_int("sext")?;
            match to {
                Ty::Int(to_bits) => Ok(Val::int(*to_bits, sign_extend(v, bits) as u64)),
                _ => Err(EvalError::TypeMismatch("sext to non-integer".into())),
            }
        }
        CastKind::Trunc => {
            let (_, v) = value.expect_int("trunc")?;
            match to {
                Ty::Int(bits) => Ok(Val::int(*bits, v)),
                _ => Err(EvalError::TypeMismatch("trunc to non-integer".into())),
            }
        }
        CastKind::PtrToInt | CastKind::IntToPtr => {
            Err(EvalError::TypeMismatch("unsupported cast".into()))
        }
    }
}

fn bitcast_val(value: Val, to: &Ty) -> Result<Val, EvalError> {
    match (&value, to) {
        (Val::Int { value: v, .. }, Ty::F32) => Ok(Val::Float(FloatConst::F32(*v as u32))),
        (Val::Int { value: v, .. }, Ty::F64) => Ok(Val::Float(FloatConst::F64(*v))),
        (Val::Float(f), Ty::Int(bits)) => Ok(Val::int(*bits, f.bits())),
        (Val::Int { value: v, .. }, Ty::Int(bits)) => Ok(Val::int(*bits, *v)),
        (Val::Ptr(_) | Val::Func(_) | Val::BlockAddr(..) | Val::Null, Ty::Ptr) => Ok(value),
        (Val::Undef, _) => Ok(Val::Undef),
        _ => Err(EvalError::TypeMismatch(format!(
            "bitcast of {value:?} to {to:?}"
        ))),
    }
}

fn flat_count(ty: &Ty) -> usize {
    match ty {
        Ty::Array(elem, len) => flat_count(elem) * *len as usize,
        Ty::Struct { fields, .. } => fields.iter().map(flat_count).sum(),
        _ => 1,
    }
}

fn gep_addr(source_ty: &Ty, base: Addr, indices: &[u64]) -> Result<Addr, EvalError> {
    let mut elem = base.elem;
    let Some((first, rest)) = indices.split_first() else {
        return Ok(base);
    };
    elem += *first as usize * flat_count(source_ty);
    let mut cur = source_ty;
    for idx in rest {
        match cur {
            Ty::Array(inner, _) => {
                elem += *idx as usize * flat_count(inner);
                cur = inner;
            }
            Ty::Struct { fields, .. } => {
                let i = *idx as usize;
                if i >= fields.len() {
                    return Err(EvalError::OutOfBounds);
                }
                elem += fields[..i].iter().map(flat_count).sum::<usize>();
                cur = &fields[i];
            }
            _ => return Err(EvalError::TypeMismatch("gep into scalar".into())),
        }
    }
    Ok(Addr {
        obj: base.obj,
        elem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, GlobalVariable, Signature};

    #[test]
    fn add_function_runs() {
        let mut module = Module::new("eval_test");
        let mut f = Function::new(
            "add1",
            Signature::new(vec![Ty::Int(32)], Ty::Int(32)),
        );
        let entry = f.entry();
        let p = f.param(0);
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            let sum = b.add(p, Constant::int32(1));
            b.ret(Some(Operand::Value(sum)));
        }
        let fid = module.add_function(f);

        let mut ev = Evaluator::new(&module).unwrap();
        let out = ev.run(fid, &[Val::i32(41)]).unwrap();
        assert_eq!(out, Some(Val::i32(42)));
    }

    #[test]
    fn gep_and_load_walk_arrays() {
        let mut module = Module::new("eval_test");
        let table = module.add_global(GlobalVariable::new(
            "table",
            Ty::array(Ty::Int(32), 4),
            Constant::Array {
                elem_ty: Ty::Int(32),
                elems: (0..4).map(|i| Constant::int32(i * 10)).collect(),
            },
        ));

        let mut f = Function::new(
            "pick",
            Signature::new(vec![Ty::Int(32)], Ty::Int(32)),
        );
        let entry = f.entry();
        let p = f.param(0);
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            let slot = b.gep(
                Ty::array(Ty::Int(32), 4),
                Constant::Global(table),
                vec![Constant::int32(0).into(), Operand::Value(p)],
            );
            let v = b.load(Ty::Int(32), slot);
            b.ret(Some(Operand::Value(v)));
        }
        let fid = module.add_function(f);

        let mut ev = Evaluator::new(&module).unwrap();
        assert_eq!(ev.run(fid, &[Val::i32(3)]).unwrap(), Some(Val::i32(30)));
    }

    #[test]
    fn funnel_shifts_rotate() {
        // fshl(x, x, s) rotates left, fshr(x, x, s) rotates right.
        let x = 0x1234_5678u64;
        assert_eq!(funnel_shl(x, x, 8, 32), (x as u32).rotate_left(8) as u64);
        assert_eq!(funnel_shr(x, x, 8, 32), (x as u32).rotate_right(8) as u64);
        assert_eq!(funnel_shl(x, x, 32, 32), x);
        assert_eq!(funnel_shr(x, x, 32, 32), x);
    }

    #[test]
    fn byte_swap_matches_width() {
        assert_eq!(byte_swap(0x1122_3344, 32), 0x4433_2211);
        assert_eq!(byte_swap(0xff00, 16), 0x00ff);
    }
}
