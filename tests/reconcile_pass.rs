//! Integration tests for reconciliation passes against the in-memory namespace.
//!
//! Covers operation ordering, idempotent re-entry after partial failure,
//! delete tolerance and the repair cycle driven by persisted state.

mod common;

use busrules::config::BusRulesConfig;
use busrules::gateway::{Fault, GatewayError, GatewayOp};
use busrules::reconcile::{AppliedOperation, PassOptions, ReconcileError, RuleReconciler};
use busrules::rules::{FilterBuilder, FilterExpression, LiveRule, RuleNameCodec};
use busrules::state::{project, Existence, PersistedState};
use common::*;
use std::time::Duration;

#[tokio::test]
async fn test_replacement_creates_before_deleting() {
    let h = Harness::new();
    h.seed(&structured("Orders.Created"));

    h.reconciler
        .reconcile(
            &target(),
            &[structured("Orders.Submitted")],
            &[structured("Orders.Created")],
            PassOptions::default(),
        )
        .await
        .unwrap();

    let mutations = h.namespace.mutations();
    let create = mutations
        .iter()
        .position(|c| c.op == GatewayOp::CreateRule && c.target == "Orders.Submitted")
        .expect("create issued");
    let delete = mutations
        .iter()
        .position(|c| c.op == GatewayOp::DeleteRule && c.target == "Orders.Created")
        .expect("delete issued");
    assert!(create < delete);
    assert_eq!(h.live_names(), vec!["Orders.Submitted".to_string()]);
}

#[tokio::test]
async fn test_single_structured_rule_from_scratch() {
    let h = Harness::new();
    let desired = vec![structured("Orders.Created")];
    let previous = PersistedState::new(TOPIC, ENDPOINT);

    let report = h
        .reconciler
        .reconcile(&target(), &desired, &previous.subscriptions, PassOptions::default())
        .await
        .unwrap();

    let creates: Vec<_> = h
        .namespace
        .mutations()
        .into_iter()
        .filter(|c| c.op == GatewayOp::CreateRule)
        .collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].target, "Orders.Created");

    let live = h.namespace.rule(TOPIC, ENDPOINT, "Orders.Created").unwrap();
    assert!(matches!(
        live.filter,
        FilterExpression::Correlation { ref properties }
            if properties.get("Dg.MessageTypeFullName").map(String::as_str) == Some("Orders.Created")
    ));

    let state = project(&desired, &previous, &report, Existence::present());
    assert_eq!(state.subscriptions, desired);
}

#[tokio::test]
async fn test_removed_text_pattern_rule_is_deleted() {
    let h = Harness::new();
    h.seed(&text("Legacy.Event"));

    h.reconciler
        .reconcile(&target(), &[], &[text("Legacy.Event")], PassOptions::default())
        .await
        .unwrap();

    let mutations = h.namespace.mutations();
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].op, GatewayOp::DeleteRule);
    assert_eq!(mutations[0].target, RuleNameCodec::default().encode("Legacy.Event"));
    assert!(h.live_names().is_empty());
}

#[tokio::test]
async fn test_second_pass_is_mutation_free() {
    let h = Harness::new();
    let desired = vec![
        structured("Orders.Created"),
        text(&format!("Contoso.Sales.{}", "Integration.".repeat(6))),
    ];

    let first = h
        .reconciler
        .reconcile(&target(), &desired, &[], PassOptions::default())
        .await
        .unwrap();
    let applied = first.applied(&desired, &[]);
    h.namespace.clear_calls();

    let second = h
        .reconciler
        .reconcile(&target(), &desired, &applied, PassOptions::default())
        .await
        .unwrap();

    assert!(h.namespace.mutations().is_empty());
    assert!(second.operations.is_empty());
    assert!(second.plan.is_noop());
}

#[tokio::test]
async fn test_failed_delete_of_absent_rule_succeeds() {
    let h = Harness::new();
    // The rule is gone but the delete reports a non-404 failure
    h.namespace.inject(
        Fault::fail(
            GatewayOp::DeleteRule,
            GatewayError::InvalidRequest("precondition failed".to_string()),
        )
        .on("Legacy.Event"),
    );

    let report = h
        .reconciler
        .reconcile(&target(), &[], &[text("Legacy.Event")], PassOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        report.operations.as_slice(),
        [AppliedOperation::AlreadyAbsent { .. }]
    ));
    assert_eq!(report.deleted, vec![text("Legacy.Event")]);
    let ops: Vec<_> = h.namespace.calls().iter().map(|c| c.op).collect();
    assert!(ops.contains(&GatewayOp::GetRule));
}

#[tokio::test]
async fn test_failed_delete_of_present_rule_aborts() {
    let h = Harness::new();
    h.seed(&text("Legacy.Event"));
    h.namespace.inject(
        Fault::fail(
            GatewayOp::DeleteRule,
            GatewayError::InvalidRequest("locked".to_string()),
        ),
    );

    let failure = h
        .reconciler
        .reconcile(&target(), &[], &[text("Legacy.Event")], PassOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        ReconcileError::Gateway { operation: "delete_rule", .. }
    ));
    assert_eq!(
        failure.report.applied(&[], &[text("Legacy.Event")]),
        vec![text("Legacy.Event")]
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let h = Harness::new();
    h.namespace
        .inject(Fault::fail(GatewayOp::CreateRule, GatewayError::Throttled).times(2));

    h.reconciler
        .reconcile(&target(), &[structured("A.B")], &[], PassOptions::default())
        .await
        .unwrap();

    assert_eq!(
        h.sleeper.delays(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(h.live_names(), vec!["A.B".to_string()]);
}

#[tokio::test]
async fn test_partial_failure_then_reentry_converges() {
    let h = Harness::new();
    let desired = vec![structured("A.One"), structured("A.Two"), structured("A.Three")];
    h.namespace.inject(
        Fault::fail(GatewayOp::CreateRule, GatewayError::Throttled)
            .on("A.Two")
            .times(5),
    );

    let previous = PersistedState::new(TOPIC, ENDPOINT);
    let failure = h
        .reconciler
        .reconcile(&target(), &desired, &previous.subscriptions, PassOptions::default())
        .await
        .unwrap_err();
    assert_eq!(failure.report.created, vec![structured("A.One")]);
    assert_eq!(h.sleeper.delays().len(), 4);

    let partial = project(&desired, &previous, &failure.report, Existence::present());
    assert_eq!(partial.subscriptions, vec![structured("A.One")]);

    let report = h
        .reconciler
        .reconcile(&target(), &desired, &partial.subscriptions, PassOptions::default())
        .await
        .unwrap();
    let state = project(&desired, &partial, &report, Existence::present());

    assert_eq!(state.subscriptions, desired);
    let mut live = h.live_names();
    live.sort();
    assert_eq!(live, vec!["A.One", "A.Three", "A.Two"]);
}

#[tokio::test]
async fn test_lost_state_after_create_is_adopted() {
    let h = Harness::new();
    let desired = vec![structured("A.B")];
    // A previous pass created the rule but crashed before persisting
    h.seed(&desired[0]);

    let report = h
        .reconciler
        .reconcile(&target(), &desired, &[], PassOptions::default())
        .await
        .unwrap();

    assert!(h.namespace.mutations().is_empty());
    assert!(matches!(
        report.operations.as_slice(),
        [AppliedOperation::AdoptedExisting { equivalent: true, .. }]
    ));
}

#[tokio::test]
async fn test_drift_is_flagged_then_repaired_next_pass() {
    let h = Harness::new();
    let desired = vec![text("Legacy.Event"), structured("Orders.Created")];
    for rule in &desired {
        h.seed(rule);
    }
    h.namespace.put_rule(
        TOPIC,
        ENDPOINT,
        LiveRule::new(
            "Legacy.Event",
            FilterExpression::Sql {
                expression: "[NServiceBus.EnclosedMessageTypes] LIKE '%Legacy%'".to_string(),
            },
        ),
    );
    h.namespace
        .put_rule(TOPIC, ENDPOINT, LiveRule::new("hand-made", FilterExpression::True));

    let mut previous = PersistedState::new(TOPIC, ENDPOINT);
    previous.subscriptions = desired.clone();

    // First pass only observes
    let report = h
        .reconciler
        .reconcile(&target(), &desired, &previous.subscriptions, PassOptions::default())
        .await
        .unwrap();
    assert!(h.namespace.mutations().is_empty());
    let observed = project(&desired, &previous, &report, Existence::present());
    assert!(observed.has_malformed_filters);
    assert_eq!(observed.unrecognized_rules, vec!["hand-made".to_string()]);

    // Second pass repairs because the persisted flags ask for it
    let flags = observed.pass_flags(&desired);
    assert!(flags.should_repair);
    let report = h
        .reconciler
        .reconcile(&target(), &desired, &observed.subscriptions, flags.pass_options())
        .await
        .unwrap();
    let repaired = project(&desired, &observed, &report, Existence::present());

    assert_eq!(
        h.mutation_ops(),
        vec![GatewayOp::UpdateRule, GatewayOp::DeleteRule]
    );
    assert!(!repaired.has_malformed_filters);
    assert!(repaired.unrecognized_rules.is_empty());
    assert_eq!(
        h.namespace.rule(TOPIC, ENDPOINT, "Legacy.Event").unwrap().filter,
        FilterBuilder::default().build(&text("Legacy.Event"))
    );
    assert!(!repaired.pass_flags(&desired).should_repair);
}

#[tokio::test]
async fn test_long_values_reconcile_under_bounded_names() {
    let h = Harness::new();
    let long = format!("Contoso.Platform.{}OrderLineItemAdded", "Messaging.".repeat(5));
    let desired = vec![structured(&long)];

    let report = h
        .reconciler
        .reconcile(&target(), &desired, &[], PassOptions::default())
        .await
        .unwrap();

    let names = h.live_names();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].chars().count(), 50);
    assert!(names[0].contains("--"));
    assert_eq!(report.diagnosis.unwrap(), Default::default());
}

#[tokio::test]
async fn test_default_rule_is_never_touched() {
    let h = Harness::new();

    h.reconciler
        .reconcile(&target(), &[structured("A.B")], &[], PassOptions { should_repair: true })
        .await
        .unwrap();

    let rules = h.namespace.rules(TOPIC, ENDPOINT);
    assert!(rules.iter().any(LiveRule::is_default));
    assert!(h
        .namespace
        .mutations()
        .iter()
        .all(|c| c.target != "$Default"));
}

#[tokio::test]
async fn test_invalid_pattern_characters_are_rejected_up_front() {
    let h = Harness::new();

    let failure = h
        .reconciler
        .reconcile(&target(), &[text("100%")], &[], PassOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, ReconcileError::InvalidRules(_)));
    assert!(h.namespace.calls().is_empty());
}

#[tokio::test]
async fn test_value_sharing_a_rule_name_keeps_the_route() {
    let h = Harness::new();
    // "Orders Created" and "Orders=Created" both encode to "Orders_Created"
    h.seed(&text("Orders Created"));
    let desired = vec![text("Orders=Created")];
    let mut previous = PersistedState::new(TOPIC, ENDPOINT);
    previous.subscriptions = vec![text("Orders Created")];

    let report = h
        .reconciler
        .reconcile(&target(), &desired, &previous.subscriptions, PassOptions::default())
        .await
        .unwrap();

    assert_eq!(h.mutation_ops(), vec![GatewayOp::UpdateRule]);
    assert_eq!(h.live_names(), vec!["Orders_Created".to_string()]);
    assert_eq!(
        h.namespace.rule(TOPIC, ENDPOINT, "Orders_Created").unwrap().filter,
        FilterBuilder::default().build(&text("Orders=Created"))
    );

    let state = project(&desired, &previous, &report, Existence::present());
    assert_eq!(state.subscriptions, desired);
    assert!(!state.has_malformed_filters);
    assert!(state.unrecognized_rules.is_empty());
}

#[tokio::test]
async fn test_create_rejected_while_busy_is_retried() {
    let h = Harness::new();
    h.namespace.inject(Fault::fail(
        GatewayOp::CreateRule,
        GatewayError::from_status(400, "rule A.B", "another operation is in progress"),
    ));

    h.reconciler
        .reconcile(&target(), &[structured("A.B")], &[], PassOptions::default())
        .await
        .unwrap();

    assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(2)]);
    assert_eq!(h.live_names(), vec!["A.B".to_string()]);
}

#[tokio::test]
async fn test_plain_bad_request_on_create_is_retried() {
    let h = Harness::new();
    h.namespace.inject(Fault::fail(
        GatewayOp::CreateRule,
        GatewayError::from_status(400, "rule A.B", "bad request"),
    ));

    h.reconciler
        .reconcile(&target(), &[structured("A.B")], &[], PassOptions::default())
        .await
        .unwrap();

    assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(2)]);
    assert_eq!(h.live_names(), vec!["A.B".to_string()]);
}

#[tokio::test]
async fn test_conflicting_delete_is_retried() {
    let h = Harness::new();
    h.seed(&text("Legacy.Event"));
    h.namespace.inject(
        Fault::fail(
            GatewayOp::DeleteRule,
            GatewayError::from_status(409, "rule Legacy.Event", "conflict"),
        )
        .on("Legacy.Event"),
    );

    let report = h
        .reconciler
        .reconcile(&target(), &[], &[text("Legacy.Event")], PassOptions::default())
        .await
        .unwrap();

    assert_eq!(h.sleeper.delays(), vec![Duration::from_secs(2)]);
    assert!(matches!(
        report.operations.as_slice(),
        [AppliedOperation::Deleted { .. }]
    ));
    assert!(h.live_names().is_empty());
}

#[tokio::test]
async fn test_orphans_are_kept_when_orphan_repair_is_off() {
    let h = Harness::new();
    let mut config = BusRulesConfig::default();
    config.reconcile.repair_orphans = false;
    let reconciler =
        RuleReconciler::from_config(h.namespace.clone(), &config).with_executor(executor(&h.sleeper));

    let desired = vec![structured("Orders.Created")];
    h.seed(&desired[0]);
    h.namespace
        .put_rule(TOPIC, ENDPOINT, LiveRule::new("manual", FilterExpression::True));
    let mut previous = PersistedState::new(TOPIC, ENDPOINT);
    previous.subscriptions = desired.clone();
    previous.unrecognized_rules = vec!["manual".to_string()];

    let report = reconciler
        .reconcile(&target(), &desired, &previous.subscriptions, PassOptions { should_repair: true })
        .await
        .unwrap();

    assert!(h.namespace.mutations().is_empty());
    assert!(h.namespace.rule(TOPIC, ENDPOINT, "manual").is_some());
    let state = project(&desired, &previous, &report, Existence::present());
    assert_eq!(state.unrecognized_rules, vec!["manual".to_string()]);
    // Nothing converges, so every later pass asks for repair again
    assert!(state.pass_flags(&desired).should_repair);
}
