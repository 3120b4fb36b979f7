//! Microsoft RTTI name scrambling.
//!
//! Rewrites the mangled class-name string inside `??_R0…` type descriptors
//! with a keyed transformation, so RTTI survives structurally but leaks no
//! readable type names. Deterministic for a given `(seed, name)` pair.

use std::sync::Arc;

use super::ModulePass;
use crate::crypto::CryptoRandom;
use crate::error::ObfuscationError;
use crate::ir::{Constant, Module, Ty};
use crate::options::ObfuscationOptions;

const ALPHABET: &[u8; 52] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Bytes that carry mangling structure and must survive unchanged.
const fn is_structural(byte: u8) -> bool {
    matches!(byte, b'@' | b'.' | b'?' | b'$')
}

/// Scrambles Microsoft RTTI type-descriptor names.
pub struct MsRttiScrambler {
    options: Arc<ObfuscationOptions>,
}

impl MsRttiScrambler {
    /// New scrambler over the shared options.
    pub fn new(options: Arc<ObfuscationOptions>) -> Self {
        MsRttiScrambler { options }
    }

    fn scramble_name(&self, name: &[u8]) -> Vec<u8> {
        let mut keyed = self.options.random_seed().to_vec();
        keyed.extend_from_slice(name);
        let hash = CryptoRandom::sha256(&keyed);

        let mut out = name.to_vec();
        for i in 4..out.len() {
            let byte = out[i];
            if byte == 0 {
                break;
            }
            if is_structural(byte) {
                continue;
            }
            out[i] = ALPHABET[((byte ^ hash[i % hash.len()]) % ALPHABET.len() as u8) as usize];
        }
        out
    }
}

impl ModulePass for MsRttiScrambler {
    fn name(&self) -> &'static str {
        "MsRttiScrambler"
    }

    fn run_on_module(&mut self, module: &mut Module) -> Result<bool, ObfuscationError> {
        if self.options.random_seed().is_empty() {
            return Err(ObfuscationError::MissingRandomSeed);
        }
        let mut changed = false;
        for g in module.global_ids() {
            let gv = module.global(g);
            if gv.is_constant || gv.init.is_none() {
                continue;
            }
            if !gv.name.starts_with("??_R0") {
                continue;
            }
            let Ty::Struct {
                name: Some(ty_name),
                ..
            } = &gv.ty
            else {
                continue;
            };
            if !ty_name.starts_with("rtti.TypeDescriptor") {
                continue;
            }
            let Some(Constant::Struct { fields, .. }) = &gv.init else {
                return Err(ObfuscationError::structural(format!(
                    "{}: type descriptor initializer is not a struct",
                    gv.name
                )));
            };
            let Some(name_field) = fields.get(2) else {
                return Err(ObfuscationError::structural(format!(
                    "{}: type descriptor has no name operand",
                    gv.name
                )));
            };
            let Constant::Str(bytes) = name_field else {
                return Err(ObfuscationError::structural(format!(
                    "{}: type descriptor operand 2 is not a string",
                    gv.name
                )));
            };
            if !bytes.starts_with(b".?AV") && !bytes.starts_with(b".?AU") {
                continue;
            }
            let scrambled = self.scramble_name(bytes);

            let gv = module.global_mut(g);
            if let Some(Constant::Struct { fields, .. }) = &mut gv.init {
                fields[2] = Constant::Str(scrambled);
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GlobalVariable;

    fn descriptor_module(name_bytes: &[u8]) -> Module {
        let mut module = Module::new("rtti_test");
        let fields = vec![
            Constant::NullPtr,
            Constant::NullPtr,
            Constant::Str(name_bytes.to_vec()),
        ];
        let ty = Ty::Struct {
            name: Some("rtti.TypeDescriptor7".into()),
            fields: fields.iter().map(Constant::ty).collect(),
        };
        let gv = GlobalVariable::new(
            "??_R0?AVFoo@@@8",
            ty,
            Constant::Struct {
                name: Some("rtti.TypeDescriptor7".into()),
                fields,
            },
        );
        module.add_global(gv);
        module
    }

    fn seeded_options() -> Arc<ObfuscationOptions> {
        let mut options = ObfuscationOptions::new();
        options.set_random_seed("deadbeefdeadbeefdeadbeefdeadbeef");
        Arc::new(options)
    }

    fn descriptor_name(module: &Module) -> Vec<u8> {
        let g = module.global_ids()[0];
        match &module.global(g).init {
            Some(Constant::Struct { fields, .. }) => match &fields[2] {
                Constant::Str(bytes) => bytes.clone(),
                _ => panic!("name field is not a string"),
            },
            _ => panic!("initializer is not a struct"),
        }
    }

    #[test]
    fn scrambling_preserves_shape_and_changes_name() {
        let mut module = descriptor_module(b".?AVFoo@@\0");
        let mut pass = MsRttiScrambler::new(seeded_options());
        assert!(pass.run_on_module(&mut module).unwrap());

        let out = descriptor_name(&module);
        assert_eq!(out.len(), b".?AVFoo@@\0".len());
        assert_eq!(&out[..4], b".?AV");
        assert_eq!(&out[7..], b"@@\0");
        assert_ne!(&out[4..7], b"Foo");
        for b in &out[4..7] {
            assert!(b.is_ascii_alphabetic());
        }
    }

    #[test]
    fn scrambling_is_deterministic_per_seed() {
        let mut first = descriptor_module(b".?AVFoo@@\0");
        let mut second = descriptor_module(b".?AVFoo@@\0");
        MsRttiScrambler::new(seeded_options())
            .run_on_module(&mut first)
            .unwrap();
        MsRttiScrambler::new(seeded_options())
            .run_on_module(&mut second)
            .unwrap();
        assert_eq!(descriptor_name(&first), descriptor_name(&second));

        let mut other_seed = descriptor_module(b".?AVFoo@@\0");
        let mut options = ObfuscationOptions::new();
        options.set_random_seed("another-seed");
        MsRttiScrambler::new(Arc::new(options))
            .run_on_module(&mut other_seed)
            .unwrap();
        assert_ne!(descriptor_name(&first), descriptor_name(&other_seed));
    }

    #[test]
    fn non_class_descriptors_are_skipped() {
        let mut module = descriptor_module(b".?AXunrelated\0");
        let mut pass = MsRttiScrambler::new(seeded_options());
        assert!(!pass.run_on_module(&mut module).unwrap());
        assert_eq!(descriptor_name(&module), b".?AXunrelated\0");
    }

    #[test]
    fn missing_seed_is_fatal() {
        let mut module = descriptor_module(b".?AVFoo@@\0");
        let mut pass = MsRttiScrambler::new(Arc::new(ObfuscationOptions::new()));
        let err = pass.run_on_module(&mut module).unwrap_err();
        assert!(matches!(err, ObfuscationError::MissingRandomSeed));
    }

    #[test]
    fn non_string_name_operand_is_structural() {
        let mut module = Module::new("rtti_test");
        let fields = vec![Constant::NullPtr, Constant::NullPtr, Constant::int32(1)];
        let ty = Ty::Struct {
            name: Some("rtti.TypeDescriptor7".into()),
            fields: fields.iter().map(Constant::ty).collect(),
        };
        module.add_global(GlobalVariable::new(
            "??_R0?AVBad@@@8",
            ty,
            Constant::Struct {
                name: Some("rtti.TypeDescriptor7".into()),
                fields,
            },
        ));
        let mut pass = MsRttiScrambler::new(seeded_options());
        let err = pass.run_on_module(&mut module).unwrap_err();
        assert!(matches!(err, ObfuscationError::Structural(_)));
    }
}
