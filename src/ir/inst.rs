//! Instructions and operands.

use super::constant::Constant;
use super::function::{BlockId, ValueId};
use super::types::Ty;

/// Stable instruction identity within one function.
///
/// Ids survive insertions, block splits and layout moves, so pass state
/// collected in `do_initialization` can still locate its sites after other
/// rewriting has shifted positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// SSA value.
    Value(ValueId),
    /// Inline constant.
    Const(Constant),
}

impl Operand {
    /// The referenced global, if the operand is a direct global constant.
    pub fn as_global(&self) -> Option<super::module::GlobalId> {
        match self {
            Operand::Const(Constant::Global(g)) => Some(*g),
            _ => None,
        }
    }

    /// The operand's constant, if any.
    pub const fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(c) => Some(c),
            _ => None,
        }
    }

    /// The operand's SSA value, if any.
    pub const fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Operand::Value(v)
    }
}

impl From<Constant> for Operand {
    fn from(c: Constant) -> Self {
        Operand::Const(c)
    }
}

/// Binary integer/float operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Wrapping addition.
    Add,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mul,
    /// Exclusive or.
    Xor,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Shift left.
    Shl,
    /// Logical shift right.
    LShr,
    /// Arithmetic shift right.
    AShr,
    /// Float addition.
    FAdd,
    /// Float subtraction.
    FSub,
    /// Float multiplication.
    FMul,
    /// Float division.
    FDiv,
}

/// Cast kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastKind {
    /// Reinterpret bits.
    Bitcast,
    /// Zero extension.
    Zext,
    /// Sign extension.
    Sext,
    /// Truncation.
    Trunc,
    /// Pointer to integer.
    PtrToInt,
    /// Integer to pointer.
    IntToPtr,
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpPred {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned greater than.
    Ugt,
    /// Unsigned greater or equal.
    Uge,
    /// Unsigned less than.
    Ult,
    /// Unsigned less or equal.
    Ule,
    /// Signed greater than.
    Sgt,
    /// Signed greater or equal.
    Sge,
    /// Signed less than.
    Slt,
    /// Signed less or equal.
    Sle,
}

/// Exception-handling pad kinds. Kept skeletal: the passes only detect and
/// skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EhPadKind {
    /// Itanium landing pad.
    LandingPad,
    /// Scoped-EH catch pad.
    CatchPad,
    /// Scoped-EH cleanup pad.
    CleanupPad,
    /// Scoped-EH catch switch.
    CatchSwitch,
}

/// One instruction: optional result value plus operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    /// Stable identity.
    pub id: InstId,
    /// Result value, when the operation produces one.
    pub result: Option<ValueId>,
    /// The operation.
    pub kind: InstKind,
}

/// Instruction operations.
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Stack slot of the given type; yields a pointer.
    Alloca {
        /// Allocated type.
        ty: Ty,
    },
    /// Memory load.
    Load {
        /// Loaded type.
        ty: Ty,
        /// Address.
        ptr: Operand,
        /// Volatile access.
        volatile: bool,
        /// Explicit alignment in bytes.
        align: Option<u32>,
    },
    /// Memory store.
    Store {
        /// Stored value.
        value: Operand,
        /// Address.
        ptr: Operand,
        /// Volatile access.
        volatile: bool,
    },
    /// Binary operation.
    Bin {
        /// Operation.
        op: BinOp,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// Wrapping negation.
    Neg(Operand),
    /// Bitwise complement.
    Not(Operand),
    /// Funnel shift left; with both value operands equal this is a rotate
    /// left by the amount.
    Fshl {
        /// High word.
        hi: Operand,
        /// Low word.
        lo: Operand,
        /// Shift amount, modulo the width.
        amount: Operand,
    },
    /// Funnel shift right; with both value operands equal this is a rotate
    /// right by the amount.
    Fshr {
        /// High word.
        hi: Operand,
        /// Low word.
        lo: Operand,
        /// Shift amount, modulo the width.
        amount: Operand,
    },
    /// Byte swap.
    Bswap(Operand),
    /// Integer comparison; yields `i1`.
    Icmp {
        /// Predicate.
        pred: IcmpPred,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// Two-way select.
    Select {
        /// `i1` condition.
        cond: Operand,
        /// Value when true.
        on_true: Operand,
        /// Value when false.
        on_false: Operand,
    },
    /// Address computation.
    Gep {
        /// Source element type of the base pointer.
        source_ty: Ty,
        /// Base address.
        base: Operand,
        /// Indices.
        indices: Vec<Operand>,
    },
    /// Cast.
    Cast {
        /// Kind.
        kind: CastKind,
        /// Operand.
        value: Operand,
        /// Destination type.
        to: Ty,
    },
    /// Call. The called operand is logically the last operand, after the
    /// arguments; `bundle_args` trailing arguments are operand-bundle
    /// payloads (funclet tokens), not real call arguments.
    Call {
        /// Called operand.
        callee: Operand,
        /// Arguments, bundle payloads last.
        args: Vec<Operand>,
        /// Number of trailing bundle payloads in `args`.
        bundle_args: usize,
        /// Return type.
        ret_ty: Ty,
    },
    /// Atomic read-modify-write; opaque to the obfuscator.
    AtomicRmw {
        /// Address.
        ptr: Operand,
        /// New value.
        value: Operand,
    },
    /// SSA phi.
    Phi {
        /// Result type.
        ty: Ty,
        /// `(value, predecessor)` pairs.
        incomings: Vec<(Operand, BlockId)>,
    },
    /// Unconditional branch.
    Br(BlockId),
    /// Conditional branch.
    CondBr {
        /// `i1` condition.
        cond: Operand,
        /// Taken when true.
        on_true: BlockId,
        /// Taken when false.
        on_false: BlockId,
    },
    /// Multi-way switch.
    Switch {
        /// Scrutinee.
        value: Operand,
        /// Default target.
        default: BlockId,
        /// `(case constant, target)` pairs.
        cases: Vec<(Constant, BlockId)>,
    },
    /// Branch through a block address.
    IndirectBr {
        /// Computed block address.
        address: Operand,
        /// Possible destinations.
        dests: Vec<BlockId>,
    },
    /// Return.
    Ret(Option<Operand>),
    /// Call with EH edges.
    Invoke {
        /// Called operand.
        callee: Operand,
        /// Arguments.
        args: Vec<Operand>,
        /// Normal continuation.
        normal: BlockId,
        /// Unwind destination.
        unwind: BlockId,
        /// Return type.
        ret_ty: Ty,
    },
    /// Exception-handling pad marker.
    EhPad(EhPadKind),
    /// Unreachable terminator.
    Unreachable,
}

impl InstKind {
    /// Whether the instruction ends a block.
    pub const fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br(_)
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::IndirectBr { .. }
                | InstKind::Ret(_)
                | InstKind::Invoke { .. }
                | InstKind::Unreachable
                | InstKind::EhPad(EhPadKind::CatchSwitch)
        )
    }

    /// Whether the instruction is an EH pad.
    pub const fn is_eh_pad(&self) -> bool {
        matches!(self, InstKind::EhPad(_))
    }

    /// Whether the instruction has atomic ordering semantics.
    pub const fn is_atomic(&self) -> bool {
        matches!(self, InstKind::AtomicRmw { .. })
    }

    /// Successor blocks of a terminator, in operand order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br(b) => vec![*b],
            InstKind::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            InstKind::Switch { default, cases, .. } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, b)| *b));
                out
            }
            InstKind::IndirectBr { dests, .. } => dests.clone(),
            InstKind::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
            _ => Vec::new(),
        }
    }

    /// Mutable successor slots of a terminator, in [`InstKind::successors`]
    /// order.
    pub fn successor_slots_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            InstKind::Br(b) => vec![b],
            InstKind::CondBr {
                on_true, on_false, ..
            } => vec![on_true, on_false],
            InstKind::Switch { default, cases, .. } => {
                let mut out = vec![default];
                out.extend(cases.iter_mut().map(|(_, b)| b));
                out
            }
            InstKind::IndirectBr { dests, .. } => dests.iter_mut().collect(),
            InstKind::Invoke { normal, unwind, .. } => vec![normal, unwind],
            _ => Vec::new(),
        }
    }

    /// Redirect every successor edge equal to `from` towards `to`.
    pub fn replace_successor(&mut self, from: BlockId, to: BlockId) {
        let patch = |b: &mut BlockId| {
            if *b == from {
                *b = to;
            }
        };
        match self {
            InstKind::Br(b) => patch(b),
            InstKind::CondBr {
                on_true, on_false, ..
            } => {
                patch(on_true);
                patch(on_false);
            }
            InstKind::Switch { default, cases, .. } => {
                patch(default);
                for (_, b) in cases {
                    patch(b);
                }
            }
            InstKind::IndirectBr { dests, .. } => {
                for b in dests {
                    patch(b);
                }
            }
            InstKind::Invoke { normal, unwind, .. } => {
                patch(normal);
                patch(unwind);
            }
            _ => {}
        }
    }

    /// Value operands in a stable order. Phi nodes expose their incoming
    /// values; calls expose arguments first and the called operand last.
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            InstKind::Alloca { .. }
            | InstKind::Br(_)
            | InstKind::EhPad(_)
            | InstKind::Unreachable => Vec::new(),
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { value, ptr, .. } => vec![value, ptr],
            InstKind::Bin { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Neg(v) | InstKind::Not(v) | InstKind::Bswap(v) => vec![v],
            InstKind::Fshl { hi, lo, amount } | InstKind::Fshr { hi, lo, amount } => {
                vec![hi, lo, amount]
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![cond, on_true, on_false],
            InstKind::Gep { base, indices, .. } => {
                let mut out = vec![base];
                out.extend(indices.iter());
                out
            }
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Call { callee, args, .. } | InstKind::Invoke { callee, args, .. } => {
                let mut out: Vec<&Operand> = args.iter().collect();
                out.push(callee);
                out
            }
            InstKind::AtomicRmw { ptr, value } => vec![ptr, value],
            InstKind::Phi { incomings, .. } => incomings.iter().map(|(v, _)| v).collect(),
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Switch { value, .. } => vec![value],
            InstKind::IndirectBr { address, .. } => vec![address],
            InstKind::Ret(v) => v.iter().collect(),
        }
    }

    /// Mutable view of [`InstKind::operands`], same ordering.
    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match self {
            InstKind::Alloca { .. }
            | InstKind::Br(_)
            | InstKind::EhPad(_)
            | InstKind::Unreachable => Vec::new(),
            InstKind::Load { ptr, .. } => vec![ptr],
            InstKind::Store { value, ptr, .. } => vec![value, ptr],
            InstKind::Bin { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => vec![lhs, rhs],
            InstKind::Neg(v) | InstKind::Not(v) | InstKind::Bswap(v) => vec![v],
            InstKind::Fshl { hi, lo, amount } | InstKind::Fshr { hi, lo, amount } => {
                vec![hi, lo, amount]
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![cond, on_true, on_false],
            InstKind::Gep { base, indices, .. } => {
                let mut out = vec![base];
                out.extend(indices.iter_mut());
                out
            }
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Call { callee, args, .. } | InstKind::Invoke { callee, args, .. } => {
                let mut out: Vec<&mut Operand> = args.iter_mut().collect();
                out.push(callee);
                out
            }
            InstKind::AtomicRmw { ptr, value } => vec![ptr, value],
            InstKind::Phi { incomings, .. } => incomings.iter_mut().map(|(v, _)| v).collect(),
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Switch { value, .. } => vec![value],
            InstKind::IndirectBr { address, .. } => vec![address],
            InstKind::Ret(v) => v.iter_mut().collect(),
        }
    }

    /// Whether operand `index` (in [`InstKind::operands`] order) is a call
    /// bundle payload.
    pub fn is_bundle_operand(&self, index: usize) -> bool {
        match self {
            InstKind::Call {
                args, bundle_args, ..
            } => index < args.len() && index >= args.len() - bundle_args,
            _ => false,
        }
    }

    /// Replace every operand equal to `from` with `to`.
    pub fn replace_uses_of(&mut self, from: &Operand, to: &Operand) {
        for op in self.operands_mut() {
            if op == from {
                *op = to.clone();
            }
        }
    }
}
