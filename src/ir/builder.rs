//! Instruction builder.
//!
//! The builder inserts at a `(block, index)` point and never folds
//! constants, so every emitted decryption step survives into the output IR.

use super::constant::Constant;
use super::function::{BlockId, Function, ValueId};
use super::inst::{BinOp, CastKind, IcmpPred, Inst, InstId, InstKind, Operand};
use super::types::Ty;

/// An insertion point: before the instruction at `index` in `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertPt {
    /// Target block.
    pub block: BlockId,
    /// Instruction index within the block.
    pub index: usize,
}

/// Builds instructions into a function at a moving insertion point.
#[derive(Debug)]
pub struct FunctionBuilder<'f> {
    func: &'f mut Function,
    at: InsertPt,
}

impl<'f> FunctionBuilder<'f> {
    /// Builder at an explicit insertion point.
    pub fn at(func: &'f mut Function, at: InsertPt) -> Self {
        FunctionBuilder { func, at }
    }

    /// Builder inserting before the instruction with identity `inst`.
    pub fn before_inst(func: &'f mut Function, inst: InstId) -> Option<Self> {
        let (block, index) = func.find_inst(inst)?;
        Some(FunctionBuilder {
            func,
            at: InsertPt { block, index },
        })
    }

    /// Builder appending at the end of `block`.
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        let index = func.block(block).insts.len();
        FunctionBuilder {
            func,
            at: InsertPt { block, index },
        }
    }

    /// Builder inserting before the terminator of `block`.
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Self {
        let len = func.block(block).insts.len();
        let index = if func.block(block).terminator().is_some() {
            len - 1
        } else {
            len
        };
        FunctionBuilder {
            func,
            at: InsertPt { block, index },
        }
    }

    /// The current insertion point.
    pub const fn insert_pt(&self) -> InsertPt {
        self.at
    }

    /// The function being built into.
    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    /// Type of an operand.
    pub fn operand_ty(&self, op: &Operand) -> Ty {
        match op {
            Operand::Value(v) => self.func.value_ty(*v).clone(),
            Operand::Const(c) => c.ty(),
        }
    }

    fn push(&mut self, kind: InstKind, result_ty: Option<Ty>) -> Option<ValueId> {
        let inst = self.func.make_inst(kind, result_ty);
        let result = inst.result;
        self.func.block_mut(self.at.block).insts.insert(self.at.index, inst);
        self.at.index += 1;
        result
    }

    fn push_valued(&mut self, kind: InstKind, result_ty: Ty) -> ValueId {
        self.push(kind, Some(result_ty))
            .unwrap_or_else(|| unreachable!("valued instruction without result"))
    }

    /// Insert a pre-built instruction (used by constant-expression
    /// expansion), allocating its result value.
    pub fn insert(&mut self, kind: InstKind, result_ty: Option<Ty>) -> Inst {
        let inst = self.func.make_inst(kind, result_ty);
        let copy = inst.clone();
        self.func.block_mut(self.at.block).insts.insert(self.at.index, inst);
        self.at.index += 1;
        copy
    }

    /// Stack slot.
    pub fn alloca(&mut self, ty: Ty) -> ValueId {
        self.push_valued(InstKind::Alloca { ty }, Ty::Ptr)
    }

    /// Plain load.
    pub fn load<P: Into<Operand>>(&mut self, ty: Ty, ptr: P) -> ValueId {
        self.push_valued(
            InstKind::Load {
                ty: ty.clone(),
                ptr: ptr.into(),
                volatile: false,
                align: None,
            },
            ty,
        )
    }

    /// Volatile load with explicit alignment.
    pub fn load_volatile<P: Into<Operand>>(&mut self, ty: Ty, ptr: P, align: u32) -> ValueId {
        self.push_valued(
            InstKind::Load {
                ty: ty.clone(),
                ptr: ptr.into(),
                volatile: true,
                align: Some(align),
            },
            ty,
        )
    }

    /// Plain store.
    pub fn store<V: Into<Operand>, P: Into<Operand>>(&mut self, value: V, ptr: P) {
        self.push(
            InstKind::Store {
                value: value.into(),
                ptr: ptr.into(),
                volatile: false,
            },
            None,
        );
    }

    /// Volatile store.
    pub fn store_volatile<V: Into<Operand>, P: Into<Operand>>(&mut self, value: V, ptr: P) {
        self.push(
            InstKind::Store {
                value: value.into(),
                ptr: ptr.into(),
                volatile: true,
            },
            None,
        );
    }

    /// Binary operation; the result type follows the left operand.
    pub fn bin<L: Into<Operand>, R: Into<Operand>>(&mut self, op: BinOp, lhs: L, rhs: R) -> ValueId {
        let lhs = lhs.into();
        let ty = self.operand_ty(&lhs);
        self.push_valued(
            InstKind::Bin {
                op,
                lhs,
                rhs: rhs.into(),
            },
            ty,
        )
    }

    /// Wrapping addition.
    pub fn add<L: Into<Operand>, R: Into<Operand>>(&mut self, lhs: L, rhs: R) -> ValueId {
        self.bin(BinOp::Add, lhs, rhs)
    }

    /// Wrapping subtraction.
    pub fn sub<L: Into<Operand>, R: Into<Operand>>(&mut self, lhs: L, rhs: R) -> ValueId {
        self.bin(BinOp::Sub, lhs, rhs)
    }

    /// Wrapping multiplication.
    pub fn mul<L: Into<Operand>, R: Into<Operand>>(&mut self, lhs: L, rhs: R) -> ValueId {
        self.bin(BinOp::Mul, lhs, rhs)
    }

    /// Exclusive or.
    pub fn xor<L: Into<Operand>, R: Into<Operand>>(&mut self, lhs: L, rhs: R) -> ValueId {
        self.bin(BinOp::Xor, lhs, rhs)
    }

    /// Wrapping negation.
    pub fn neg<V: Into<Operand>>(&mut self, value: V) -> ValueId {
        let value = value.into();
        let ty = self.operand_ty(&value);
        self.push_valued(InstKind::Neg(value), ty)
    }

    /// Bitwise complement.
    pub fn not<V: Into<Operand>>(&mut self, value: V) -> ValueId {
        let value = value.into();
        let ty = self.operand_ty(&value);
        self.push_valued(InstKind::Not(value), ty)
    }

    /// Funnel shift left.
    pub fn fshl<A: Into<Operand>, B: Into<Operand>, S: Into<Operand>>(
        &mut self,
        hi: A,
        lo: B,
        amount: S,
    ) -> ValueId {
        let hi = hi.into();
        let ty = self.operand_ty(&hi);
        self.push_valued(
            InstKind::Fshl {
                hi,
                lo: lo.into(),
                amount: amount.into(),
            },
            ty,
        )
    }

    /// Funnel shift right.
    pub fn fshr<A: Into<Operand>, B: Into<Operand>, S: Into<Operand>>(
        &mut self,
        hi: A,
        lo: B,
        amount: S,
    ) -> ValueId {
        let hi = hi.into();
        let ty = self.operand_ty(&hi);
        self.push_valued(
            InstKind::Fshr {
                hi,
                lo: lo.into(),
                amount: amount.into(),
            },
            ty,
        )
    }

    /// Byte swap.
    pub fn bswap<V: Into<Operand>>(&mut self, value: V) -> ValueId {
        let value = value.into();
        let ty = self.operand_ty(&value);
        self.push_valued(InstKind::Bswap(value), ty)
    }

    /// Integer comparison.
    pub fn icmp<L: Into<Operand>, R: Into<Operand>>(
        &mut self,
        pred: IcmpPred,
        lhs: L,
        rhs: R,
    ) -> ValueId {
        self.push_valued(
            InstKind::Icmp {
                pred,
                lhs: lhs.into(),
                rhs: rhs.into(),
            },
            Ty::Int(1),
        )
    }

    /// Two-way select; the result type follows the true operand.
    pub fn select<C: Into<Operand>, T: Into<Operand>, F: Into<Operand>>(
        &mut self,
        cond: C,
        on_true: T,
        on_false: F,
    ) -> ValueId {
        let on_true = on_true.into();
        let ty = self.operand_ty(&on_true);
        self.push_valued(
            InstKind::Select {
                cond: cond.into(),
                on_true,
                on_false: on_false.into(),
            },
            ty,
        )
    }

    /// Address computation.
    pub fn gep<B: Into<Operand>>(
        &mut self,
        source_ty: Ty,
        base: B,
        indices: Vec<Operand>,
    ) -> ValueId {
        self.push_valued(
            InstKind::Gep {
                source_ty,
                base: base.into(),
                indices,
            },
            Ty::Ptr,
        )
    }

    /// Cast.
    pub fn cast<V: Into<Operand>>(&mut self, kind: CastKind, value: V, to: Ty) -> ValueId {
        self.push_valued(
            InstKind::Cast {
                kind,
                value: value.into(),
                to: to.clone(),
            },
            to,
        )
    }

    /// Bit-preserving cast. A cast to the operand's own type is a no-op and
    /// returns the operand unchanged.
    pub fn bitcast<V: Into<Operand>>(&mut self, value: V, to: Ty) -> Operand {
        let value = value.into();
        if self.operand_ty(&value) == to {
            value
        } else {
            Operand::Value(self.cast(CastKind::Bitcast, value, to))
        }
    }

    /// Call; returns the result value unless the return type is void.
    pub fn call<C: Into<Operand>>(
        &mut self,
        callee: C,
        args: Vec<Operand>,
        ret_ty: Ty,
    ) -> Option<ValueId> {
        let result_ty = match &ret_ty {
            Ty::Void => None,
            other => Some(other.clone()),
        };
        self.push(
            InstKind::Call {
                callee: callee.into(),
                args,
                bundle_args: 0,
                ret_ty,
            },
            result_ty,
        )
    }

    /// Unconditional branch.
    pub fn br(&mut self, dest: BlockId) {
        self.push(InstKind::Br(dest), None);
    }

    /// Conditional branch.
    pub fn cond_br<C: Into<Operand>>(&mut self, cond: C, on_true: BlockId, on_false: BlockId) {
        self.push(
            InstKind::CondBr {
                cond: cond.into(),
                on_true,
                on_false,
            },
            None,
        );
    }

    /// Switch.
    pub fn switch<V: Into<Operand>>(
        &mut self,
        value: V,
        default: BlockId,
        cases: Vec<(Constant, BlockId)>,
    ) {
        self.push(
            InstKind::Switch {
                value: value.into(),
                default,
                cases,
            },
            None,
        );
    }

    /// Indirect branch through a block address.
    pub fn indirect_br<A: Into<Operand>>(&mut self, address: A, dests: Vec<BlockId>) {
        self.push(
            InstKind::IndirectBr {
                address: address.into(),
                dests,
            },
            None,
        );
    }

    /// Return.
    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(InstKind::Ret(value), None);
    }
}
