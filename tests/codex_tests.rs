//! Integration tests for the codex language run through hook points

use chrono::{TimeZone, Utc};
use ggg_kernel::{
    Attributes, Caller, CodexExecutor, CodexPermission, CodexSource, ExecutionBudget, HookBinding,
    HookManifest, Kernel, KernelConfig, KernelError, ManualClock, Value,
};
use ggg_kernel::hooks::Codex;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Binds `source` as `proposal_eval` and invokes it on a fresh proposal.
fn eval_with(kernel: &mut Kernel, source: &str, args: Value) -> Result<Value, KernelError> {
    kernel.install_manifest(
        HookManifest::new()
            .with_codex(CodexSource::new("eval", source).with_permissions(CodexPermission::all()))
            .with_binding(HookBinding::new("proposal", "proposal_eval", "eval")),
    )?;
    let alice = Caller::new("alice");
    let id = kernel.create(&alice, "proposal", Attributes::new())?;
    kernel.invoke_hook(&alice, &id, "proposal_eval", args)
}

fn eval(source: &str, args: Value) -> Result<Value, KernelError> {
    eval_with(&mut Kernel::default(), source, args)
}

#[test]
fn test_string_builtins() {
    let source = r#"
        let name = trim(args.name)
        return {
            "upper": upper(name),
            "len": len(name),
            "greeting": format("hi {}, you have {} votes", name, 3),
            "joined": concat("a", 1, true),
            "is_mail": matches(args.email, "^[^@]+@[^@]+$"),
        }
    "#;
    let out = eval(source, json!({"name": "  ann ", "email": "ann@example.org"})).unwrap();
    assert_eq!(out["upper"], "ANN");
    assert_eq!(out["len"], 3);
    assert_eq!(out["greeting"], "hi ann, you have 3 votes");
    assert_eq!(out["joined"], "a1true");
    assert_eq!(out["is_mail"], true);
}

#[test]
fn test_conversions_and_collections() {
    let source = r#"
        let total = 0
        for k in keys(args.weights) { total = total + args.weights[k] }
        return [int("42"), float(1), str(7), total, contains([1, 2, 3], 2), contains("abc", "z")]
    "#;
    let out = eval(source, json!({"weights": {"a": 2, "b": 5}})).unwrap();
    assert_eq!(out, json!([42, 1.0, "7", 7, true, false]));
}

#[test]
fn test_entity_binding() {
    let source = "return [entity.kind, entity.owner, len(entity.id) > 0, entity.relations]";
    let out = eval(source, json!(null)).unwrap();
    assert_eq!(out, json!(["proposal", "alice", true, {}]));
}

#[test]
fn test_time_builtins_use_store_clock() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2030, 6, 1, 8, 0, 0).unwrap());
    let mut kernel = Kernel::default().with_clock(Arc::new(clock));
    let out = eval_with(&mut kernel, "return [now(), now_unix()]", json!(null)).unwrap();
    assert_eq!(out[0], "2030-06-01T08:00:00+00:00");
    assert_eq!(out[1], 1_906_531_200_i64);
}

#[test]
fn test_store_builtins() {
    let source = r#"
        let a = create('trade', {'qty': 5})
        let b = create('trade', {'qty': 50})
        link(entity.id, 'trades', a)
        update(b, {'qty': 60})
        let big = find('trade', {'op': 'gt', 'attr': 'qty', 'value': 10})
        return {
            "big": len(big),
            "qty": big[0].qty,
            "exists": exists(a),
            "linked": len(get(entity.id).relations.trades),
        }
    "#;
    let out = eval(source, json!(null)).unwrap();
    assert_eq!(out, json!({"big": 1, "qty": 60, "exists": true, "linked": 1}));
}

#[test]
fn test_step_budget_stops_runaway_loop() {
    let config = KernelConfig::default().budget(ExecutionBudget::default().max_steps(500));
    let mut kernel = Kernel::new(config);
    let err = eval_with(&mut kernel, "repeat 1000000 { let x = 1 }", json!(null)).unwrap_err();
    assert!(err.is_execution_error());
    assert!(err.to_string().contains("step"));
}

#[test]
fn test_collection_budget() {
    let config = KernelConfig::default().budget(ExecutionBudget::default().max_collection_len(10));
    let mut kernel = Kernel::new(config);
    let source = "let xs = []\nrepeat 20 { xs = xs + [1] }\nreturn xs";
    assert!(eval_with(&mut kernel, source, json!(null)).unwrap_err().is_execution_error());
}

#[test]
fn test_runtime_errors_are_reported_not_raised() {
    for source in [
        "return 1 / 0",
        "return null.field",
        "return [1, 2][-1]",
        "return undefined_var",
        "let entity = 1",
        "fail 'custom'",
        "return upper(1)",
        "set entity.id = 'x'",
    ] {
        let err = eval(source, json!(null)).unwrap_err();
        assert!(err.is_execution_error(), "{} gave {:?}", source, err);
    }
}

#[test]
fn test_compile_errors_name_the_line() {
    let err = Codex::compile("broken", "let a = 1\nlet b = (2 +\n", BTreeSet::new()).unwrap_err();
    match err {
        KernelError::ParseError(message) => {
            assert!(message.starts_with("codex 'broken': Line"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        Codex::compile("io", "return open('/etc/passwd')", BTreeSet::new()),
        Err(KernelError::ParseError(_))
    ));
}

#[test]
fn test_executor_compiles_under_nesting_limit() {
    let executor = CodexExecutor::new(ExecutionBudget::default().max_nesting(3));
    assert!(executor.compile("return ((1))").is_ok());
    assert!(executor.compile("return ((((((1))))))").is_err());
}
