use crate::fixtures::{init_tracing, object, program, verification};
use shroud_analysis::collect_metrics;
use shroud_core::{decode_object, emit, measure, EmitOptions};
use shroud_verification::PracticalTester;

#[test]
fn emitted_program_decodes_with_the_same_functions() {
    init_tracing();
    let built = program();
    let decoded = decode_object(&object(&built)).unwrap();

    let names: Vec<&str> = decoded.functions.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["max", "classify", "sum"]);
    for (before, after) in built.functions.iter().zip(&decoded.functions) {
        assert_eq!(before.blocks.len(), after.blocks.len(), "blocks of {}", before.name);
        assert!(after.validate().is_ok());
        assert!(after.size > 0);
    }
}

#[test]
fn re_emission_reaches_a_fixed_point() {
    let first = object(&program());
    let second = emit(&decode_object(&first).unwrap(), &EmitOptions::default()).unwrap();
    let third = emit(&decode_object(&second).unwrap(), &EmitOptions::default()).unwrap();
    assert_eq!(second, third);
}

#[test]
fn metrics_of_a_decoded_object() {
    let module = decode_object(&object(&program())).unwrap();
    let size = measure(&module).unwrap();
    let metrics = collect_metrics(&module, size).unwrap();
    assert_eq!(metrics.functions.len(), 3);
    assert_eq!(metrics.functions["max"].cyclomatic, 2);
    assert_eq!(metrics.code_size, size);
}

#[test]
fn decoded_program_is_equivalent_to_itself() {
    let module = decode_object(&object(&program())).unwrap();
    let results = PracticalTester::new(verification())
        .test_equivalence(&module, &module)
        .unwrap();
    assert_eq!(results.functions_tested, 3);
    assert!(results.functions_skipped.is_empty());
    assert!(results.cases_executed > 0);
}
