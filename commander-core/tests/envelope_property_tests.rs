//! Property-Based Tests for Envelope Identity and Authority
//!
//! **Property 1: Content Hash Determinism**
//! The hash depends only on sender, recipient, task id and payload. Two
//! envelopes built from the same fields SHALL carry the same hash, whatever
//! their id, timestamp, priority or message type.
//!
//! **Property 2: Field Boundaries**
//! Moving bytes between adjacent fields SHALL change the hash.
//!
//! **Property 3: Task Claim Resolution**
//! Resolving two claims is symmetric, and an orchestrator claim (priority 0)
//! always beats a claim of any other priority.
//!
//! **Property 4: Wire Round Trip Keeps the Hash Valid**
//! A well-formed envelope SHALL still validate after JSON encoding.
//!
//! **Property 5: Bounded Backoff**
//! Retry delays never exceed the configured cap and never shrink.

use commander_core::{
    authority_order, compute_content_hash, resolve_task_claim, MessageEnvelope, MessageType,
    RoleHierarchy,
};
use commander_test_utils::generators::{
    arb_envelope, arb_message_type, arb_node_id, arb_payload, arb_retry_config,
};
use proptest::prelude::*;
use std::cmp::Ordering;

// ============================================================================
// HELPERS
// ============================================================================

fn build(
    sender: &str,
    recipient: &str,
    task: Option<&String>,
    priority: i32,
    message_type: MessageType,
    payload: &[u8],
) -> MessageEnvelope {
    let mut builder = MessageEnvelope::builder(sender, recipient, message_type)
        .priority(priority)
        .payload(payload.to_vec());
    if let Some(task) = task {
        builder = builder.task_id(task.clone());
    }
    builder.build()
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_hash_ignores_non_content_fields(
        sender in arb_node_id(),
        recipient in arb_node_id(),
        task in proptest::option::of("[a-z0-9-]{0,12}"),
        payload in arb_payload(),
        p1 in 0i32..=2,
        p2 in 0i32..=2,
        t1 in arb_message_type(),
        t2 in arb_message_type(),
    ) {
        let a = build(&sender, &recipient, task.as_ref(), p1, t1, &payload);
        let b = build(&sender, &recipient, task.as_ref(), p2, t2, &payload);
        prop_assert_ne!(a.id, b.id);
        prop_assert_eq!(&a.content_hash, &b.content_hash);
        prop_assert_eq!(a.compute_hash(), a.content_hash.clone());
        prop_assert_eq!(
            compute_content_hash(&sender, &recipient, task.as_deref(), &payload),
            a.content_hash
        );
    }

    #[test]
    fn prop_shifting_field_boundary_changes_hash(
        left in "[a-z]{1,8}",
        right in "[a-z]{1,8}",
        payload in arb_payload(),
    ) {
        // "ab" + "c" versus "abc" + ""
        let joined = format!("{left}{right}");
        let split = compute_content_hash(&left, &right, None, &payload);
        let merged = compute_content_hash(&joined, "", None, &payload);
        prop_assert_ne!(split, merged);
    }

    #[test]
    fn prop_absent_and_empty_task_differ(
        sender in arb_node_id(),
        payload in arb_payload(),
    ) {
        let absent = compute_content_hash(&sender, "relay", None, &payload);
        let empty = compute_content_hash(&sender, "relay", Some(""), &payload);
        prop_assert_ne!(absent, empty);
    }

    #[test]
    fn prop_task_claim_resolution_is_symmetric(
        pa in 0i32..=2,
        pb in 0i32..=2,
        a_sender in arb_node_id(),
        b_sender in arb_node_id(),
    ) {
        let task = "task-1".to_string();
        let a = build(&a_sender, "orchestrator", Some(&task), pa, MessageType::Command, b"a");
        let b = build(&b_sender, "orchestrator", Some(&task), pb, MessageType::Command, b"b");

        let forward = resolve_task_claim(&a, &b).id;
        let backward = resolve_task_claim(&b, &a).id;
        prop_assert_eq!(forward, backward);
        prop_assert_eq!(authority_order(&a, &b), authority_order(&b, &a).reverse());

        if pa != pb {
            let expected = if pa < pb { a.id } else { b.id };
            prop_assert_eq!(forward, expected);
        }
    }

    #[test]
    fn prop_orchestrator_claim_always_wins(
        other_priority in 1i32..=2,
        payload in arb_payload(),
    ) {
        let task = "task-9".to_string();
        let worker = build("htpc", "orchestrator", Some(&task), other_priority, MessageType::Command, &payload);
        let orchestrator = build("main", "orchestrator", Some(&task), 0, MessageType::Command, &payload);
        prop_assert_eq!(resolve_task_claim(&worker, &orchestrator).sender_id.as_str(), "main");
        prop_assert_eq!(authority_order(&orchestrator, &worker), Ordering::Less);
    }

    #[test]
    fn prop_out_of_range_priority_rejected(priority in prop_oneof![i32::MIN..0, 3i32..i32::MAX]) {
        let env = MessageEnvelope::builder("main", "htpc", MessageType::Command)
            .priority(priority)
            .build();
        prop_assert!(env.validate(&RoleHierarchy::default()).is_err());
    }

    #[test]
    fn prop_envelope_survives_json(envelope in arb_envelope()) {
        let json = serde_json::to_string(&envelope).expect("serialize");
        let decoded: MessageEnvelope = serde_json::from_str(&json).expect("deserialize");
        prop_assert!(decoded.validate(&RoleHierarchy::default()).is_ok());
        prop_assert_eq!(decoded.content_hash, envelope.content_hash);
    }

    #[test]
    fn prop_backoff_is_capped_and_monotonic(retry in arb_retry_config(), attempts in 1u32..64) {
        let now = retry.backoff_for(attempts);
        let next = retry.backoff_for(attempts + 1);
        prop_assert!(now <= retry.max_backoff);
        prop_assert!(next >= now);
    }
}
