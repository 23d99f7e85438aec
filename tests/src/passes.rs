use crate::fixtures::{init_tracing, object, program, verification};
use shroud_core::{decode_object, emit, EmitOptions, Module};
use shroud_transform::{apply_pass, PassSpec, PassStats};
use shroud_verification::VerificationEngine;

fn decoded() -> Module {
    decode_object(&object(&program())).unwrap()
}

/// Applies one pass, verifies it against the input and checks that the
/// result still emits and loads.
fn apply_and_verify(spec: PassSpec) -> PassStats {
    init_tracing();
    let original = decoded();
    let (transformed, stats) = apply_pass(original.clone(), &spec, 42, 0);
    let stats = stats.unwrap();
    VerificationEngine::new(verification())
        .verify(&original, &transformed)
        .unwrap();
    let bytes = emit(&transformed, &EmitOptions::default()).unwrap();
    decode_object(&bytes).unwrap();
    stats
}

#[test]
fn substitution_preserves_behavior() {
    let stats = apply_and_verify(PassSpec::Subst { percent: 100 });
    assert!(stats.get("substitutions") > 0);
}

#[test]
fn bogus_flow_preserves_behavior() {
    let stats = apply_and_verify(PassSpec::Bogus { percent: 50 });
    assert!(stats.get("bogus_blocks") > 0);
}

#[test]
fn flattening_preserves_behavior() {
    let stats = apply_and_verify(PassSpec::Flatten { cycles: 2 });
    assert!(stats.get("flattened_functions") > 0);
}

#[test]
fn symbol_renaming_leaves_globals_alone() {
    let stats = apply_and_verify(PassSpec::SymbolRename);
    assert_eq!(stats.get("renamed_symbols"), 0);
}

#[test]
fn string_encryption_without_literals_is_a_no_op() {
    let stats = apply_and_verify(PassSpec::StringEncrypt);
    assert_eq!(stats.get("string_encryptions"), 0);
    assert!(!stats.changed);
}

#[test]
fn breakpoint_checks_preserve_behavior() {
    let stats = apply_and_verify(PassSpec::AntiDebug);
    assert!(stats.get("checks") > 0);
}

#[test]
fn zero_percent_passes_change_nothing() {
    for spec in [PassSpec::Bogus { percent: 0 }, PassSpec::Subst { percent: 0 }] {
        let stats = apply_and_verify(spec);
        assert!(!stats.changed, "{stats:?}");
    }
}

#[test]
fn equal_seeds_give_equal_modules() {
    let spec = PassSpec::Bogus { percent: 100 };
    let (a, _) = apply_pass(decoded(), &spec, 7, 0);
    let (b, _) = apply_pass(decoded(), &spec, 7, 0);
    let options = EmitOptions::default();
    assert_eq!(emit(&a, &options).unwrap(), emit(&b, &options).unwrap());
}
