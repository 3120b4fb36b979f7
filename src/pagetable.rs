//! Page-table indirection engine.
//!
//! Hides a set of module-level pointers (block addresses, callees, globals)
//! behind a chain of encrypted index tables: a shuffled array of object
//! pointers, plus one or more pages of ciphertext indices. Each reference
//! site gets an inline decryption chain that walks the pages from the last
//! one down to the object array.
//!
//! The index cipher runs a fixed number of rounds; each round selects one
//! of six primitives from a slice of the key's mask half. A round whose
//! selection equals the previous round's cascades to the next primitive in
//! the cycle; the decryption side reproduces the same stream with the
//! bump-by-one correction and replays it inverted, in reverse. Both sides
//! must agree on this exactly.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{
    Constant, FuncId, FunctionBuilder, GlobalId, GlobalVariable, InstId, Linkage, Module, Operand,
    Ty, ValueId,
};

/// Metadata marker attached to every generated global. Passes must skip
/// anything carrying it.
pub const NOOBF: &str = "noobf";

/// Rounds per entry in a module-level page.
pub const MODULE_ROUNDS: u32 = 8;

/// Mask-slice width (bits) for module-level pages.
pub const MODULE_SLICE_BITS: u32 = 3;

/// Mask-slice width (bits) for per-function pages.
pub const FUNC_SLICE_BITS: u32 = 2;

const fn key_low(key: u64) -> u32 {
    key as u32
}

const fn key_mask(key: u64) -> u32 {
    (key >> 32) as u32
}

/// The primitive a round actually applies, given the raw selection and the
/// previous round's effective selection.
const fn effective_mask(mask: u8, last: u8) -> u8 {
    if mask == 0 {
        // Bootstrap: a second consecutive 0 becomes the xor; the first
        // after a 0-run start is a negate.
        if last == 0 {
            1
        } else {
            0
        }
    } else if mask == last {
        if mask < 5 {
            mask + 1
        } else {
            0
        }
    } else {
        mask
    }
}

const fn apply_mask_op(m: u8, x: u32, key: u32, pos: u32) -> u32 {
    match m {
        1 => x.wrapping_neg(),
        2 => x.rotate_left(key.wrapping_add(pos)),
        3 => x.swap_bytes(),
        4 => !x,
        5 => x.rotate_right(key.wrapping_sub(pos)),
        _ => x ^ key,
    }
}

const fn apply_mask_op_inverse(m: u8, x: u32, key: u32, pos: u32) -> u32 {
    match m {
        1 => x.wrapping_neg(),
        2 => x.rotate_right(key.wrapping_add(pos)),
        3 => x.swap_bytes(),
        4 => !x,
        5 => x.rotate_left(key.wrapping_sub(pos)),
        _ => x ^ key,
    }
}

/// Encrypt a page index. `pos` is the position the ciphertext is stored at
/// within its page; it parameterizes the rotation rounds.
pub fn mask_cipher_encrypt(index: u32, key: u64, pos: u32, rounds: u32, slice_bits: u32) -> u32 {
    let low = key_low(key);
    let mask_word = key_mask(key);
    let mut x = index;
    let mut last = 0xffu8;
    for k in 0..rounds {
        let mask = ((mask_word >> (k * slice_bits)) as u8) % 6;
        let m = effective_mask(mask, last);
        x = apply_mask_op(m, x, low, pos);
        last = m;
    }
    x
}

/// The effective round stream the decryptor replays, in encryption order.
pub fn decrypt_mask_stream(key: u64, rounds: u32, slice_bits: u32) -> Vec<u8> {
    let mask_word = key_mask(key);
    let mut out = Vec::with_capacity(rounds as usize);
    let mut last = 0xffu8;
    for k in 0..rounds {
        let mask = ((mask_word >> (k * slice_bits)) as u8) % 6;
        let m = effective_mask(mask, last);
        out.push(m);
        last = m;
    }
    out
}

/// Invert [`mask_cipher_encrypt`]; the host-side mirror of the emitted IR.
pub fn mask_cipher_decrypt(cipher: u32, key: u64, pos: u32, rounds: u32, slice_bits: u32) -> u32 {
    let low = key_low(key);
    let mut x = cipher;
    for &m in decrypt_mask_stream(key, rounds, slice_bits).iter().rev() {
        x = apply_mask_op_inverse(m, x, low, pos);
    }
    x
}

/// Inputs shared by [`create_page_table`] and [`enhanced_page_table`].
#[derive(Debug)]
pub struct PageTableArgs<'a> {
    /// Number of encrypted pages to chain.
    pub count_loop: u32,
    /// Name prefix of the generated globals.
    pub name_prefix: String,
    /// Objects to hide; reshuffled in place.
    pub objects: &'a mut Vec<Constant>,
    /// Object → current index. Updated to the final page's positions.
    pub index_map: &'a mut HashMap<Constant, u32>,
    /// Object → 64-bit key (low half: xor key, high half: round mask).
    pub object_keys: &'a HashMap<Constant, u64>,
    /// Receives the generated globals, object array first.
    pub out_pages: &'a mut Vec<GlobalId>,
}

fn object_key(keys: &HashMap<Constant, u64>, obj: &Constant) -> Result<u64, ObfuscationError> {
    keys.get(obj)
        .copied()
        .ok_or_else(|| ObfuscationError::structural("page-table object registered without a key"))
}

fn page_global(
    module: &mut Module,
    name: String,
    linkage: Linkage,
    entries: Vec<Constant>,
) -> GlobalId {
    let mut gv = GlobalVariable::new(
        name,
        Ty::array(Ty::Int(32), entries.len() as u64),
        Constant::Array {
            elem_ty: Ty::Int(32),
            elems: entries,
        },
    );
    gv.linkage = linkage;
    gv.add_metadata(NOOBF);
    module.add_global(gv)
}

/// Build the module-level chain: shuffle the objects into a pointer-array
/// global, then chain `count_loop` encrypted index pages on top of it.
pub fn create_page_table(
    module: &mut Module,
    rng: &mut CryptoRandom,
    args: &mut PageTableArgs<'_>,
) -> Result<(), ObfuscationError> {
    if args.objects.is_empty() {
        return Err(ObfuscationError::structural("page table over an empty object set"));
    }
    let mut shuffle_rng = StdRng::seed_from_u64(rng.get_uint64());
    args.objects.shuffle(&mut shuffle_rng);

    for (i, obj) in args.objects.iter().enumerate() {
        args.index_map.insert(obj.clone(), i as u32);
    }
    let mut gv = GlobalVariable::new(
        format!("{}_objects", args.name_prefix),
        Ty::array(Ty::Ptr, args.objects.len() as u64),
        Constant::Array {
            elem_ty: Ty::Ptr,
            elems: args.objects.clone(),
        },
    );
    gv.linkage = Linkage::Internal;
    gv.add_metadata(NOOBF);
    args.out_pages.push(module.add_global(gv));

    for i in 0..args.count_loop {
        args.objects.shuffle(&mut shuffle_rng);
        let mut entries = Vec::with_capacity(args.objects.len());
        for (j, obj) in args.objects.iter().enumerate() {
            let key = object_key(args.object_keys, obj)?;
            let pre = args
                .index_map
                .get(obj)
                .copied()
                .ok_or_else(|| ObfuscationError::structural("page-table object missing an index"))?;
            let enc = mask_cipher_encrypt(pre, key, j as u32, MODULE_ROUNDS, MODULE_SLICE_BITS);
            entries.push(Constant::int32(enc));
        }
        for (j, obj) in args.objects.iter().enumerate() {
            args.index_map.insert(obj.clone(), j as u32);
        }
        let name = format!("{}_page_table_{}", args.name_prefix, i);
        args.out_pages
            .push(page_global(module, name, Linkage::Internal, entries));
    }
    Ok(())
}

/// Build a per-function chain layered on top of the module chain. Rounds
/// per entry are `4 * count_loop` with 2-bit mask slices, and each object's
/// starting index comes from `func_index_map` when present, else from the
/// module map.
pub fn enhanced_page_table(
    module: &mut Module,
    rng: &mut CryptoRandom,
    args: &mut PageTableArgs<'_>,
    func_index_map: &mut HashMap<Constant, u32>,
) -> Result<(), ObfuscationError> {
    if args.objects.is_empty() {
        return Err(ObfuscationError::structural("page table over an empty object set"));
    }
    let mut shuffle_rng = StdRng::seed_from_u64(rng.get_uint64());
    let rounds = 4 * args.count_loop;

    for i in 0..args.count_loop {
        args.objects.shuffle(&mut shuffle_rng);
        let mut entries = Vec::with_capacity(args.objects.len());
        for (j, obj) in args.objects.iter().enumerate() {
            let key = object_key(args.object_keys, obj)?;
            let pre = match func_index_map.get(obj) {
                Some(idx) => *idx,
                None => args
                    .index_map
                    .get(obj)
                    .copied()
                    .ok_or_else(|| {
                        ObfuscationError::structural("page-table object missing an index")
                    })?,
            };
            let enc = mask_cipher_encrypt(pre, key, j as u32, rounds, FUNC_SLICE_BITS);
            entries.push(Constant::int32(enc));
        }
        for (j, obj) in args.objects.iter().enumerate() {
            func_index_map.insert(obj.clone(), j as u32);
        }
        let name = format!("{}_enhanced_page_table_{}", args.name_prefix, i);
        args.out_pages
            .push(page_global(module, name, Linkage::Private, entries));
    }
    Ok(())
}

/// Where the decryption chain starts.
#[derive(Debug, Clone, Copy)]
enum Start {
    /// A computed value (e.g. a select over two successor indices).
    Value(ValueId),
    /// A compile-time index, hidden behind a volatile-loaded global.
    Global(GlobalId),
}

/// Inputs to [`build_decrypt_ir`].
#[derive(Debug)]
pub struct DecryptArgs<'a> {
    /// Per-function chain length (the effective level); 0 for none.
    pub func_loop_count: u32,
    /// Compile-time start index; ignored when `next_index_value` is set.
    pub next_index: u32,
    /// Computed start index.
    pub next_index_value: Option<ValueId>,
    /// Function receiving the chain.
    pub func: FuncId,
    /// Instruction the chain is emitted in front of.
    pub insert_before: InstId,
    /// Type loaded from the object array.
    pub load_ty: Ty,
    /// Module chain, object array first.
    pub module_pages: &'a [GlobalId],
    /// Per-function chain, possibly empty.
    pub func_pages: &'a [GlobalId],
    /// The target object's module-level key.
    pub module_key: u64,
    /// The target object's per-function key.
    pub func_key: u64,
}

/// Emit the inline decryption chain and return the decrypted pointer.
///
/// Walks the per-function pages (if any) and then the module pages from the
/// last one down; the bottom-most (object) page is loaded with `load_ty`
/// and returned. Not reaching the object level is a fatal internal error.
pub fn build_decrypt_ir(
    module: &mut Module,
    args: &DecryptArgs<'_>,
) -> Result<ValueId, ObfuscationError> {
    let start = match args.next_index_value {
        Some(v) => Start::Value(v),
        None => {
            let func_name = module.func(args.func).name.clone();
            let mut gv = GlobalVariable::new(
                format!("{}{}_InitIndex{}", module.name, func_name, args.next_index),
                Ty::Int(32),
                Constant::int32(args.next_index),
            );
            gv.linkage = Linkage::Private;
            gv.add_metadata(NOOBF);
            Start::Global(module.add_global(gv))
        }
    };
    let func_pages: Vec<(GlobalId, Ty)> = args
        .func_pages
        .iter()
        .map(|g| (*g, module.global(*g).ty.clone()))
        .collect();
    let module_pages: Vec<(GlobalId, Ty)> = args
        .module_pages
        .iter()
        .map(|g| (*g, module.global(*g).ty.clone()))
        .collect();

    let func = module.func_mut(args.func);
    let Some(mut b) = FunctionBuilder::before_inst(func, args.insert_before) else {
        return Err(ObfuscationError::structural(
            "decrypt chain insertion point not found",
        ));
    };

    let mut next: Operand = match start {
        Start::Value(v) => Operand::Value(v),
        Start::Global(g) => {
            Operand::Value(b.load_volatile(Ty::Int(32), Constant::Global(g), 1))
        }
    };
    let zero = Constant::int32(0);

    if args.func_loop_count > 0 && !func_pages.is_empty() {
        let key = Constant::int32(key_low(args.func_key));
        let stream = decrypt_mask_stream(args.func_key, 4 * args.func_loop_count, FUNC_SLICE_BITS);
        for (page, page_ty) in func_pages.iter().rev() {
            let prev = next.clone();
            let gep = b.gep(
                page_ty.clone(),
                Constant::Global(*page),
                vec![zero.clone().into(), next],
            );
            let mut cur: Operand = Operand::Value(b.load(Ty::Int(32), gep));
            for &m in stream.iter().rev() {
                cur = emit_decrypt_round(&mut b, m, cur, prev.clone(), &key);
            }
            next = cur;
        }
    }

    let key = Constant::int32(key_low(args.module_key));
    let stream = decrypt_mask_stream(args.module_key, MODULE_ROUNDS, MODULE_SLICE_BITS);
    for (i, (page, page_ty)) in module_pages.iter().enumerate().rev() {
        let prev = next.clone();
        let gep = b.gep(
            page_ty.clone(),
            Constant::Global(*page),
            vec![zero.clone().into(), next],
        );
        if i == 0 {
            return Ok(b.load(args.load_ty.clone(), gep));
        }
        let mut cur: Operand = Operand::Value(b.load(Ty::Int(32), gep));
        for &m in stream.iter().rev() {
            cur = emit_decrypt_round(&mut b, m, cur, prev.clone(), &key);
        }
        next = cur;
    }
    Err(ObfuscationError::structural(
        "page-table decrypt chain never reached the object level",
    ))
}

fn emit_decrypt_round(
    b: &mut FunctionBuilder<'_>,
    m: u8,
    value: Operand,
    prev: Operand,
    key: &Constant,
) -> Operand {
    let v = match m {
        1 => b.neg(value),
        2 => {
            let amount = b.add(key.clone(), prev);
            b.fshr(value.clone(), value, amount)
        }
        3 => b.bswap(value),
        4 => b.not(value),
        5 => {
            let amount = b.sub(key.clone(), prev);
            b.fshl(value.clone(), value, amount)
        }
        _ => b.xor(value, key.clone()),
    };
    Operand::Value(v)
}
