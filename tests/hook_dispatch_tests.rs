//! Integration tests for lifecycle hook dispatch and codex overrides

use ggg_kernel::codex::CodexHost;
use ggg_kernel::hooks::{CodexStatus, DefaultHookHandler};
use ggg_kernel::{
    Attributes, Caller, CodexPermission, CodexSource, Entity, Filter, HookBinding, HookManifest,
    Kernel, KernelError, Value,
};
use serde_json::json;
use std::sync::Arc;

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => panic!("attributes must be an object"),
    }
}

fn install(kernel: &mut Kernel, id: &str, source: &str, kind: &str, hook: &str, mandatory: bool) {
    let mut binding = HookBinding::new(kind, hook, id);
    if mandatory {
        binding = binding.mandatory();
    }
    kernel
        .install_manifest(
            HookManifest::new()
                .with_codex(CodexSource::new(id, source).with_permissions(CodexPermission::all()))
                .with_binding(binding),
        )
        .unwrap();
}

#[test]
fn test_register_posthook_runs_once_with_user_id() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "welcome",
        "create('contract', {'welcomes': entity.id})\nreturn entity.id",
        "user",
        "user_register_posthook",
        false,
    );

    let alice = Caller::new("alice");
    let user = kernel.create(&alice, "user", attrs(json!({"name": "Alice"}))).unwrap();

    let logs = kernel.hook_logs(&alice, &user, 10).unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_success());
    assert_eq!(logs[0].output, Some(json!(user)));
    assert_eq!(logs[0].hook_name, "user_register_posthook");
    assert_eq!(kernel.hook_journal().len(), 1);

    // The codex wrote through the store as the triggering caller.
    let contracts: Vec<_> = kernel
        .query(&alice, "contract", Filter::eq("welcomes", user.as_str()))
        .collect();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].owner.as_deref(), Some("alice"));
}

#[test]
fn test_failing_posthook_does_not_fail_create() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "flaky",
        "create('contract', {})\nfail 'welcome service down'",
        "user",
        "user_register_posthook",
        false,
    );

    let alice = Caller::new("alice");
    let user = kernel.create(&alice, "user", Attributes::new()).unwrap();
    assert!(kernel.get(&alice, &user).is_ok());

    let logs = kernel.hook_logs(&alice, &user, 10).unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].is_success());
    let message = logs[0].error_message.clone().unwrap();
    assert!(message.contains("welcome service down"));
    assert!(message.contains("line 2"));

    // The codex's own partial writes were rolled back.
    assert_eq!(kernel.query(&alice, "contract", Filter::All).count(), 0);
}

#[test]
fn test_mandatory_posthook_rolls_back() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "kyc",
        "if entity.verified != true { fail 'unverified' }",
        "user",
        "user_register_posthook",
        true,
    );

    let alice = Caller::new("alice");
    let err = kernel.create(&alice, "user", Attributes::new()).unwrap_err();
    assert!(matches!(err, KernelError::ExecutionError(ref m) if m.contains("unverified")));
    assert!(kernel.store().is_empty());

    let ok = kernel
        .create(&alice, "user", attrs(json!({"verified": true})))
        .unwrap();
    assert!(kernel.get(&alice, &ok).is_ok());
}

#[test]
fn test_update_prehook_sees_patch() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "no_negative",
        "if args.patch.votes < 0 { fail 'votes must not be negative' }",
        "proposal",
        "proposal_update_prehook",
        true,
    );

    let alice = Caller::new("alice");
    let id = kernel
        .create(&alice, "proposal", attrs(json!({"votes": 1})))
        .unwrap();
    assert!(kernel.update(&alice, &id, attrs(json!({"votes": -5}))).is_err());
    assert_eq!(kernel.get(&alice, &id).unwrap().attribute("votes"), Some(&json!(1)));
    assert!(kernel.update(&alice, &id, attrs(json!({"votes": 2}))).is_ok());
}

#[test]
fn test_posthook_can_set_attributes() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "stamp",
        "set entity.status = 'open'",
        "proposal",
        "proposal_register_posthook",
        false,
    );

    let alice = Caller::new("alice");
    let id = kernel.create(&alice, "proposal", Attributes::new()).unwrap();
    assert_eq!(kernel.get(&alice, &id).unwrap().attribute("status"), Some(&json!("open")));
}

#[test]
fn test_codex_permissions_are_enforced() {
    let mut kernel = Kernel::default();
    kernel
        .install_manifest(
            HookManifest::new()
                .with_codex(CodexSource::new("reader", "create('contract', {})").with_permission(CodexPermission::Read))
                .with_binding(HookBinding::new("user", "user_register_posthook", "reader")),
        )
        .unwrap();

    let alice = Caller::new("alice");
    let user = kernel.create(&alice, "user", Attributes::new()).unwrap();
    let logs = kernel.hook_logs(&alice, &user, 1).unwrap();
    assert!(logs[0].error_message.as_deref().unwrap().contains("permission"));
}

#[test]
fn test_default_handler_and_override() {
    let mut kernel = Kernel::default();
    let handler: DefaultHookHandler = Arc::new(
        |host: &mut dyn CodexHost, entity: Option<&Entity>, _args: &Value| -> ggg_kernel::Result<Value> {
            let mut note = Attributes::new();
            if let Some(entity) = entity {
                note.insert("about".to_string(), json!(entity.id));
            }
            host.create("contract", note)?;
            Ok(Value::Null)
        },
    );
    kernel
        .register_default_hook("user", "user_register_posthook", handler)
        .unwrap();

    let root = Caller::admin("root");
    kernel.create(&root, "user", Attributes::new()).unwrap();
    assert_eq!(kernel.query(&root, "contract", Filter::All).count(), 1);

    // A bound codex replaces the default.
    install(&mut kernel, "quiet", "return null", "user", "user_register_posthook", false);
    kernel.create(&root, "user", Attributes::new()).unwrap();
    assert_eq!(kernel.query(&root, "contract", Filter::All).count(), 1);

    // Disabling the codex restores it.
    kernel.set_codex_status("quiet", CodexStatus::Disabled).unwrap();
    kernel.create(&root, "user", Attributes::new()).unwrap();
    assert_eq!(kernel.query(&root, "contract", Filter::All).count(), 2);
}

#[test]
fn test_manifest_from_json() {
    let mut kernel = Kernel::default();
    let report = kernel
        .install_manifest_json(
            r#"{
                "codexes": [
                    {"id": "tag", "source": "set entity.tagged = true", "permissions": ["update"]}
                ],
                "bindings": [
                    {"entity_kind": "dispute", "hook_name": "dispute_register_posthook", "codex_id": "tag"}
                ]
            }"#,
        )
        .unwrap();
    assert_eq!(report.codexes_installed, 1);

    let alice = Caller::new("alice");
    let id = kernel.create(&alice, "dispute", Attributes::new()).unwrap();
    assert_eq!(kernel.get(&alice, &id).unwrap().attribute("tagged"), Some(&json!(true)));

    let bad = kernel.install_manifest_json(r#"{"codexes": [{"id": "x", "source": "emit ("}]}"#);
    assert!(matches!(bad, Err(KernelError::ParseError(_))));
    assert_eq!(kernel.hooks().codexes().len(), 1);
}

#[test]
fn test_delete_posthook_sees_final_snapshot() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "tombstone",
        "create('contract', {'deleted': entity.id, 'title': entity.title})",
        "proposal",
        "proposal_delete_posthook",
        false,
    );

    let alice = Caller::new("alice");
    let id = kernel
        .create(&alice, "proposal", attrs(json!({"title": "Old"})))
        .unwrap();
    kernel.delete(&alice, &id).unwrap();

    let tombstones: Vec<_> = kernel.query(&alice, "contract", Filter::All).collect();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].attribute("title"), Some(&json!("Old")));

    // Deleted entity: journal visible to admins only.
    assert!(kernel.hook_logs(&alice, &id, 5).unwrap_err().is_not_found());
    assert_eq!(kernel.hook_logs(&Caller::admin("root"), &id, 5).unwrap().len(), 1);
}

#[test]
fn test_failed_link_rolls_back_prehook_writes() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "audit_then_drop",
        "create('contract', {'audited': args.target})\ndelete(args.target)",
        "organization",
        "organization_link_prehook",
        false,
    );

    let alice = Caller::new("alice");
    let org = kernel.create(&alice, "organization", Attributes::new()).unwrap();
    let user = kernel.create(&alice, "user", Attributes::new()).unwrap();

    // The prehook removed the target, so the link itself fails.
    let err = kernel.link(&alice, &org, "members", &user).unwrap_err();
    assert!(matches!(err, KernelError::InvariantViolation(_)));
    assert_eq!(kernel.query(&alice, "contract", Filter::All).count(), 0);
    assert!(kernel.get(&alice, &user).is_ok());
    assert!(kernel.get(&alice, &org).unwrap().targets("members").is_empty());

    // A bad relation name is rejected before any hook runs.
    assert!(matches!(
        kernel.link(&alice, &org, "", &user),
        Err(KernelError::InvalidArgument(_))
    ));
    assert!(matches!(
        kernel.unlink(&alice, &org, " ", &user),
        Err(KernelError::InvalidArgument(_))
    ));
    assert_eq!(kernel.query(&alice, "contract", Filter::All).count(), 0);
    assert_eq!(kernel.hook_logs(&alice, &org, 10).unwrap().len(), 1);
}

#[test]
fn test_failed_update_rolls_back_prehook_writes() {
    let mut kernel = Kernel::default();
    install(
        &mut kernel,
        "self_destruct",
        "create('contract', {})\ndelete(entity.id)",
        "proposal",
        "proposal_update_prehook",
        false,
    );

    let alice = Caller::new("alice");
    let id = kernel.create(&alice, "proposal", attrs(json!({"votes": 1}))).unwrap();
    assert!(kernel.update(&alice, &id, attrs(json!({"votes": 2}))).unwrap_err().is_not_found());
    assert_eq!(kernel.get(&alice, &id).unwrap().attribute("votes"), Some(&json!(1)));
    assert_eq!(kernel.query(&alice, "contract", Filter::All).count(), 0);
}
