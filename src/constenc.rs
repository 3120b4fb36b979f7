//! Scalar constant encryption.
//!
//! A qualifying integer or float constant moves into an encrypted side
//! global; the use site gets a volatile load plus the inverse arithmetic.
//! Levels stack XOR layers on top of the base subtractive mask.

use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{
    Constant, FuncId, FunctionBuilder, GlobalVariable, InstId, Linkage, Module, Operand, Ty,
};
use crate::pagetable::NOOBF;

fn width_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Replace `plain` with an encrypted side global plus inline decryption IR
/// emitted before `insert_before`, returning the operand the use site
/// should reference instead.
///
/// Aggregate and pointer constants, and scalars narrower than 8 bits, are
/// returned unchanged.
pub fn encrypt_constant(
    module: &mut Module,
    func: FuncId,
    plain: &Constant,
    insert_before: InstId,
    rng: &mut CryptoRandom,
    level: u32,
) -> Result<Operand, ObfuscationError> {
    let original_ty = plain.ty();
    if original_ty.is_struct() || original_ty.is_array() || original_ty.is_ptr() {
        return Ok(Operand::Const(plain.clone()));
    }
    let Some(bits) = original_ty.primitive_bits() else {
        return Ok(Operand::Const(plain.clone()));
    };
    if bits < 8 {
        return Ok(Operand::Const(plain.clone()));
    }
    let raw = match plain {
        Constant::Int { value, .. } => *value,
        Constant::Float(f) => f.bits(),
        _ => return Ok(Operand::Const(plain.clone())),
    };

    let mask = width_mask(bits);
    let key = rng.get_uint64() & mask;
    let mut enc = raw.wrapping_sub(key) & mask;
    let mut xor_key = None;
    if level > 0 {
        let x = rng.get_uint64() & mask;
        enc ^= x;
        if level > 1 {
            enc ^= x.wrapping_mul(key) & mask;
        }
        if level > 2 {
            enc ^= x.wrapping_neg() & mask;
        }
        xor_key = Some(x);
    }

    let int_ty = Ty::Int(bits);
    let name = format!("{}_cipher{}", module.name, module.global_ids().len());
    let mut gv = GlobalVariable::new(name, int_ty.clone(), Constant::int(bits, enc));
    gv.linkage = Linkage::Internal;
    gv.add_metadata(NOOBF);
    let gv = module.add_global(gv);

    let f = module.func_mut(func);
    let Some(mut b) = FunctionBuilder::before_inst(f, insert_before) else {
        return Err(ObfuscationError::structural(
            "constant encryption insertion point not found",
        ));
    };
    let mut value: Operand =
        Operand::Value(b.load_volatile(int_ty.clone(), Constant::Global(gv), 1));
    if let Some(x) = xor_key {
        let x = Constant::int(bits, x);
        let key_const = Constant::int(bits, key);
        if level > 2 {
            let neg = b.neg(x.clone());
            value = Operand::Value(b.xor(value, neg));
        }
        if level > 1 {
            let prod = b.mul(x.clone(), key_const);
            value = Operand::Value(b.xor(value, prod));
        }
        value = Operand::Value(b.xor(value, x));
    }
    let value = b.add(value, Constant::int(bits, key));
    Ok(b.bitcast(value, original_ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::{Evaluator, Val};
    use crate::ir::{FloatConst, Function, InstKind, Signature};

    fn ret_const_fixture(c: Constant) -> (Module, FuncId, InstId) {
        let mut module = Module::new("constenc_test");
        let ret_ty = c.ty();
        let mut f = Function::new("f", Signature::new(vec![], ret_ty));
        let entry = f.entry();
        {
            let mut b = FunctionBuilder::at_end(&mut f, entry);
            b.ret(Some(Operand::Const(c)));
        }
        let ret_id = f.block(entry).insts[0].id;
        let fid = module.add_function(f);
        (module, fid, ret_id)
    }

    #[test]
    fn integers_round_trip_at_every_width_and_level() {
        let mut rng = CryptoRandom::from_u64(2322);
        for bits in [8u32, 16, 32, 64] {
            for level in 0..=3u32 {
                let plain = Constant::int(bits, 0xdead_beef_1234_5678);
                let (mut module, fid, ret_id) = ret_const_fixture(plain.clone());
                let new = encrypt_constant(&mut module, fid, &plain, ret_id, &mut rng, level)
                    .unwrap();
                assert!(new.as_value().is_some(), "bits={bits} level={level}");

                let f = module.func_mut(fid);
                let (block, idx) = f.find_inst(ret_id).unwrap();
                f.block_mut(block).insts[idx].kind =
                    InstKind::Ret(Some(new));

                let mut ev = Evaluator::new(&module).unwrap();
                let expected = plain.as_int().map(|(b, v)| Val::int(b, v)).unwrap();
                assert_eq!(ev.run(fid, &[]).unwrap(), Some(expected));
            }
        }
    }

    #[test]
    fn floats_round_trip() {
        let mut rng = CryptoRandom::from_u64(17);
        for level in 0..=3u32 {
            let plain = Constant::Float(FloatConst::from_f64(1234.5625));
            let (mut module, fid, ret_id) = ret_const_fixture(plain.clone());
            let new =
                encrypt_constant(&mut module, fid, &plain, ret_id, &mut rng, level).unwrap();

            let f = module.func_mut(fid);
            let (block, idx) = f.find_inst(ret_id).unwrap();
            f.block_mut(block).insts[idx].kind = InstKind::Ret(Some(new));

            let mut ev = Evaluator::new(&module).unwrap();
            assert_eq!(
                ev.run(fid, &[]).unwrap(),
                Some(Val::Float(FloatConst::from_f64(1234.5625)))
            );
        }
    }

    #[test]
    fn narrow_and_pointer_constants_are_left_alone() {
        let mut rng = CryptoRandom::from_u64(5);
        let (mut module, fid, ret_id) = ret_const_fixture(Constant::int(7, 99));
        let before = module.global_ids().len();
        let out = encrypt_constant(
            &mut module,
            fid,
            &Constant::int(7, 99),
            ret_id,
            &mut rng,
            3,
        )
        .unwrap();
        assert_eq!(out, Operand::Const(Constant::int(7, 99)));
        assert_eq!(module.global_ids().len(), before);

        let out =
            encrypt_constant(&mut module, fid, &Constant::NullPtr, ret_id, &mut rng, 3).unwrap();
        assert_eq!(out, Operand::Const(Constant::NullPtr));
    }

    #[test]
    fn cipher_global_is_tagged_and_holds_no_plaintext() {
        let mut rng = CryptoRandom::from_u64(40);
        let plain = Constant::int(32, 42);
        let (mut module, fid, ret_id) = ret_const_fixture(plain.clone());
        encrypt_constant(&mut module, fid, &plain, ret_id, &mut rng, 3).unwrap();

        let last = *module.global_ids().last().unwrap();
        let gv = module.global(last);
        assert!(gv.has_metadata(NOOBF));
        assert_eq!(gv.linkage, Linkage::Internal);
        assert_ne!(gv.init, Some(Constant::int(32, 42)));
    }
}
