//! Property-Based Tests for Task Context Windows
//!
//! **Property 1: Windows Fit Their Budget**
//! For any history and token budget, the rendered window SHALL NOT exceed
//! the budget, and every envelope is either included or counted as omitted.
//!
//! **Property 2: Windows Keep the Newest Lines**
//! The window text SHALL be the newest lines of the history in creation
//! order, and the next older line would not have fit.
//!
//! **Property 3: Relay Context Follows Creation Order**
//! The relay returns a task's envelopes oldest first, and its window covers
//! only that task.

use commander_core::{EnvelopeQuery, MessageEnvelope};
use commander_storage::{build_context, context_line, CHARS_PER_TOKEN};
use commander_test_utils::assertions::assert_creation_order;
use commander_test_utils::fixtures::SyncHarness;
use commander_test_utils::generators::arb_envelope;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

// ============================================================================
// GENERATORS
// ============================================================================

fn arb_history() -> impl Strategy<Value = Vec<MessageEnvelope>> {
    prop::collection::vec(arb_envelope(), 0..24)
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_window_fits_budget(history in arb_history(), max_tokens in 0usize..600) {
        let window = build_context("task-1", &history, max_tokens);
        prop_assert!(window.approx_tokens <= max_tokens);
        prop_assert!(window.text.chars().count() <= max_tokens * CHARS_PER_TOKEN);
        prop_assert_eq!(window.included + window.omitted, history.len());
    }

    #[test]
    fn prop_window_keeps_newest_lines(history in arb_history(), max_tokens in 0usize..600) {
        let window = build_context("task-1", &history, max_tokens);
        let kept = &history[window.omitted..];
        let expected: String = kept.iter().map(context_line).collect();
        prop_assert_eq!(&window.text, &expected);

        if window.omitted > 0 {
            let next_older = context_line(&history[window.omitted - 1]).chars().count();
            prop_assert!(
                window.text.chars().count() + next_older > max_tokens * CHARS_PER_TOKEN
            );
        }
    }

    #[test]
    fn prop_relay_context_is_per_task(history in arb_history()) {
        let h = SyncHarness::new("main");
        let store = h.relay_store();
        for env in &history {
            store
                .insert(env)
                .map_err(|e| TestCaseError::fail(format!("insert: {e}")))?;
        }

        let task_id = history
            .iter()
            .find_map(|e| e.task_id.clone())
            .unwrap_or_else(|| "task-1".to_string());
        let page = store
            .query(&EnvelopeQuery {
                task_id: Some(task_id.clone()),
                ..Default::default()
            })
            .map_err(|e| TestCaseError::fail(format!("query: {e}")))?;
        assert_creation_order(&page.envelopes);
        prop_assert!(page.envelopes.iter().all(|e| e.task_id.as_deref() == Some(task_id.as_str())));

        let window = store
            .recent_context(&task_id, usize::MAX / CHARS_PER_TOKEN)
            .map_err(|e| TestCaseError::fail(format!("context: {e}")))?;
        prop_assert_eq!(window.included, page.envelopes.len());
        prop_assert_eq!(window.omitted, 0);
    }
}
