//! Functions, basic blocks and SSA values.

use super::inst::{Inst, InstId, InstKind};
use super::types::{Linkage, Signature, Ty};

/// SSA value id, scoped to one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Basic block id, scoped to one function.
///
/// Ids index a slab that never shrinks; the visual/layout order of blocks is
/// tracked separately, so moving a block never invalidates references to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// A basic block: a name and an instruction list ending in a terminator.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Display name.
    pub name: String,
    /// Instructions in execution order.
    pub insts: Vec<Inst>,
}

impl BasicBlock {
    /// The block terminator, when present and well-formed.
    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|i| i.kind.is_terminator())
    }

    /// Mutable access to the terminator.
    pub fn terminator_mut(&mut self) -> Option<&mut Inst> {
        self.insts
            .last_mut()
            .filter(|i| i.kind.is_terminator())
    }

    /// Whether the block starts with an EH pad.
    pub fn is_eh_pad(&self) -> bool {
        self.insts.first().is_some_and(|i| i.kind.is_eh_pad())
    }
}

/// A function definition or declaration.
#[derive(Debug, Clone)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Signature.
    pub sig: Signature,
    /// Linkage.
    pub linkage: Linkage,
    /// Compiler-reserved intrinsic.
    pub is_intrinsic: bool,
    /// Section override, e.g. `.text.startup` for static initializers.
    pub section: Option<String>,
    /// Whether the function uses a scoped (funclet-based) EH personality.
    pub has_scoped_eh: bool,
    blocks: Vec<BasicBlock>,
    layout: Vec<BlockId>,
    value_types: Vec<Ty>,
    params: Vec<ValueId>,
    next_inst: u32,
}

impl Function {
    /// A function definition with an empty entry block.
    pub fn new<S: Into<String>>(name: S, sig: Signature) -> Self {
        let mut f = Self::declaration(name, sig);
        f.linkage = Linkage::External;
        f.add_block("entry");
        f
    }

    /// A bodyless declaration.
    pub fn declaration<S: Into<String>>(name: S, sig: Signature) -> Self {
        let params: Vec<Ty> = sig.params.clone();
        let mut f = Function {
            name: name.into(),
            sig,
            linkage: Linkage::External,
            is_intrinsic: false,
            section: None,
            has_scoped_eh: false,
            blocks: Vec::new(),
            layout: Vec::new(),
            value_types: Vec::new(),
            params: Vec::new(),
            next_inst: 0,
        };
        for ty in params {
            let v = f.new_value(ty);
            f.params.push(v);
        }
        f
    }

    /// Whether the function has no body.
    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    /// The `index`-th parameter value.
    pub fn param(&self, index: usize) -> ValueId {
        self.params[index]
    }

    /// Allocate a fresh SSA value of type `ty`.
    pub fn new_value(&mut self, ty: Ty) -> ValueId {
        let id = ValueId(self.value_types.len() as u32);
        self.value_types.push(ty);
        id
    }

    /// Type of a value.
    pub fn value_ty(&self, value: ValueId) -> &Ty {
        &self.value_types[value.0 as usize]
    }

    /// Allocate a fresh instruction identity.
    pub fn next_inst_id(&mut self) -> InstId {
        let id = InstId(self.next_inst);
        self.next_inst += 1;
        id
    }

    /// Build an instruction, allocating its identity and result value.
    pub fn make_inst(&mut self, kind: InstKind, result_ty: Option<Ty>) -> Inst {
        let id = self.next_inst_id();
        let result = result_ty.map(|ty| self.new_value(ty));
        Inst { id, result, kind }
    }

    /// Append a new block at the end of the layout.
    pub fn add_block<S: Into<String>>(&mut self, name: S) -> BlockId {
        let id = self.push_block(name);
        self.layout.push(id);
        id
    }

    /// Insert a new block into the layout right before `before`.
    pub fn insert_block_before<S: Into<String>>(&mut self, name: S, before: BlockId) -> BlockId {
        let id = self.push_block(name);
        let pos = self.layout_pos(before);
        self.layout.insert(pos, id);
        id
    }

    /// Insert a new block into the layout right after `after`.
    pub fn insert_block_after<S: Into<String>>(&mut self, name: S, after: BlockId) -> BlockId {
        let id = self.push_block(name);
        let pos = self.layout_pos(after);
        self.layout.insert(pos + 1, id);
        id
    }

    fn push_block<S: Into<String>>(&mut self, name: S) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    /// Block access.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    /// Mutable block access.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// Blocks in layout order.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    /// The entry block. Only meaningful for definitions.
    pub fn entry(&self) -> BlockId {
        self.layout[0]
    }

    /// Move `block` directly before `target` in the layout.
    pub fn move_block_before(&mut self, block: BlockId, target: BlockId) {
        let from = self.layout_pos(block);
        self.layout.remove(from);
        let to = self.layout_pos(target);
        self.layout.insert(to, block);
    }

    fn layout_pos(&self, block: BlockId) -> usize {
        self.layout
            .iter()
            .position(|b| *b == block)
            .unwrap_or(self.layout.len())
    }

    /// Split `block` before the instruction at `at`, moving the tail into a
    /// new block that is placed right after it in the layout. The old block
    /// is terminated with a branch to the new one, and phi nodes in the
    /// moved terminator's successors are repointed at the new block.
    pub fn split_block<S: Into<String>>(&mut self, block: BlockId, at: usize, name: S) -> BlockId {
        let new_id = self.push_block(name);
        let pos = self.layout_pos(block);
        self.layout.insert(pos + 1, new_id);

        let tail: Vec<Inst> = self.blocks[block.0 as usize].insts.split_off(at);
        self.blocks[new_id.0 as usize].insts = tail;

        let br = self.make_inst(InstKind::Br(new_id), None);
        self.blocks[block.0 as usize].insts.push(br);

        let succs = self.blocks[new_id.0 as usize]
            .terminator()
            .map(|t| t.kind.successors())
            .unwrap_or_default();
        for succ in succs {
            for inst in &mut self.blocks[succ.0 as usize].insts {
                if let InstKind::Phi { incomings, .. } = &mut inst.kind {
                    for (_, pred) in incomings {
                        if *pred == block {
                            *pred = new_id;
                        }
                    }
                }
            }
        }
        new_id
    }

    /// Locate an instruction by identity.
    pub fn find_inst(&self, id: InstId) -> Option<(BlockId, usize)> {
        for &b in &self.layout {
            if let Some(idx) = self.block(b).insts.iter().position(|i| i.id == id) {
                return Some((b, idx));
            }
        }
        None
    }

    /// Predecessors of `block`, in layout order, with duplicates.
    pub fn preds(&self, block: BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        for &b in &self.layout {
            if let Some(term) = self.block(b).terminator() {
                for succ in term.kind.successors() {
                    if succ == block {
                        out.push(b);
                    }
                }
            }
        }
        out
    }

    /// Number of instructions across all live blocks.
    pub fn inst_count(&self) -> usize {
        self.layout.iter().map(|b| self.block(*b).insts.len()).sum()
    }
}
