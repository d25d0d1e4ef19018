// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Concurrency planner (§4.G).
//!
//! Turns one assistant message's tool_use blocks into an ordered list of
//! dispatch groups. A group is either a parallel batch of concurrency-safe
//! calls (bounded by the configured cap) or a single concurrency-unsafe
//! call running alone. §4.G's serial gate invariant — at most one
//! concurrency-unsafe tool_use survives per assistant message — is enforced
//! here, before grouping: every unsafe call after the first is dropped and
//! reported back as a synthetic `tool_result` so the model still receives
//! exactly one reply per tool_use it emitted.

use kestrel_tools::tool::ToolCall;
use kestrel_tools::ToolRegistry;

/// One scheduling unit: calls in the same group may run concurrently.
#[derive(Debug, Clone)]
pub struct DispatchGroup {
    pub calls: Vec<ToolCall>,
}

/// The plan for one assistant message's tool_use blocks.
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    pub groups: Vec<DispatchGroup>,
    /// Calls dropped by the serial gate — never dispatched; the loop must
    /// still synthesize a tool_result for each (§3 invariant i).
    pub gated_out: Vec<ToolCall>,
}

/// Plan dispatch order/grouping for `calls`, looking up each call's
/// concurrency safety in `registry` (unknown tools are treated as unsafe —
/// the dispatcher will reject them on lookup anyway, but planning never
/// silently schedules an unregistered tool alongside others).
pub fn plan(calls: Vec<ToolCall>, registry: &ToolRegistry, cap: usize) -> DispatchPlan {
    let cap = cap.max(1);
    let is_safe = |c: &ToolCall| registry.get(&c.name).map(|t| t.is_concurrency_safe()).unwrap_or(false);

    let mut kept = Vec::with_capacity(calls.len());
    let mut gated_out = Vec::new();
    let mut unsafe_seen = false;
    for call in calls {
        if is_safe(&call) {
            kept.push(call);
        } else if !unsafe_seen {
            unsafe_seen = true;
            kept.push(call);
        } else {
            gated_out.push(call);
        }
    }

    let mut groups = Vec::new();
    let mut batch = Vec::new();
    for call in kept {
        if is_safe(&call) {
            batch.push(call);
            if batch.len() == cap {
                groups.push(DispatchGroup { calls: std::mem::take(&mut batch) });
            }
        } else {
            if !batch.is_empty() {
                groups.push(DispatchGroup { calls: std::mem::take(&mut batch) });
            }
            groups.push(DispatchGroup { calls: vec![call] });
        }
    }
    if !batch.is_empty() {
        groups.push(DispatchGroup { calls: batch });
    }

    DispatchPlan { groups, gated_out }
}

/// Reorder `results` (keyed by `tool_use_id`) to match the order `calls`
/// were originally emitted in, so the history the model sees always lists
/// tool_results in tool_use order regardless of completion order (§4.G / P2).
pub fn reorder_to_match<T>(calls: &[ToolCall], mut results: Vec<(String, T)>) -> Vec<T> {
    let mut ordered = Vec::with_capacity(results.len());
    for call in calls {
        if let Some(pos) = results.iter().position(|(id, _)| id == &call.id) {
            ordered.push(results.remove(pos).1);
        }
    }
    ordered
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kestrel_tools::policy::ApprovalPolicy;
    use kestrel_tools::tool::{Tool, ToolOutput};
    use serde_json::{json, Value};

    use super::*;

    struct SafeTool;
    #[async_trait]
    impl Tool for SafeTool {
        fn name(&self) -> &str { "safe" }
        fn description(&self) -> &str { "d" }
        fn parameters_schema(&self) -> Value { json!({"type": "object"}) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput { ToolOutput::ok(&call.id, "ok") }
    }

    struct UnsafeTool;
    #[async_trait]
    impl Tool for UnsafeTool {
        fn name(&self) -> &str { "unsafe" }
        fn description(&self) -> &str { "d" }
        fn parameters_schema(&self) -> Value { json!({"type": "object"}) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }
        async fn execute(&self, call: &ToolCall) -> ToolOutput { ToolOutput::ok(&call.id, "ok") }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(SafeTool);
        r.register(UnsafeTool);
        r
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall { id: id.into(), name: name.into(), args: json!({}) }
    }

    #[test]
    fn all_safe_calls_form_one_group_under_cap() {
        let calls = vec![call("1", "safe"), call("2", "safe")];
        let plan = plan(calls, &registry(), 4);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].calls.len(), 2);
        assert!(plan.gated_out.is_empty());
    }

    #[test]
    fn safe_calls_split_across_groups_at_cap() {
        let calls = vec![call("1", "safe"), call("2", "safe"), call("3", "safe")];
        let plan = plan(calls, &registry(), 2);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].calls.len(), 2);
        assert_eq!(plan.groups[1].calls.len(), 1);
    }

    #[test]
    fn single_unsafe_call_is_its_own_group() {
        let calls = vec![call("1", "unsafe")];
        let plan = plan(calls, &registry(), 4);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].calls.len(), 1);
    }

    #[test]
    fn second_unsafe_call_is_gated_out() {
        let calls = vec![call("1", "unsafe"), call("2", "unsafe")];
        let plan = plan(calls, &registry(), 4);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].calls[0].id, "1");
        assert_eq!(plan.gated_out.len(), 1);
        assert_eq!(plan.gated_out[0].id, "2");
    }

    #[test]
    fn unsafe_call_splits_surrounding_safe_groups() {
        let calls = vec![call("1", "safe"), call("2", "unsafe"), call("3", "safe")];
        let plan = plan(calls, &registry(), 4);
        assert_eq!(plan.groups.len(), 3);
        assert_eq!(plan.groups[0].calls[0].id, "1");
        assert_eq!(plan.groups[1].calls[0].id, "2");
        assert_eq!(plan.groups[2].calls[0].id, "3");
    }

    #[test]
    fn unknown_tool_is_treated_as_unsafe() {
        let calls = vec![call("1", "ghost"), call("2", "safe")];
        let plan = plan(calls, &registry(), 4);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].calls[0].name, "ghost");
    }

    #[test]
    fn cap_is_never_zero() {
        let calls = vec![call("1", "safe"), call("2", "safe")];
        let plan = plan(calls, &registry(), 0);
        assert_eq!(plan.groups.len(), 2);
    }

    #[test]
    fn reorder_restores_original_tool_use_order() {
        let calls = vec![call("a", "safe"), call("b", "safe"), call("c", "safe")];
        let results = vec![("c".to_string(), 3), ("a".to_string(), 1), ("b".to_string(), 2)];
        assert_eq!(reorder_to_match(&calls, results), vec![1, 2, 3]);
    }

    #[test]
    fn reorder_drops_entries_with_no_matching_call() {
        let calls = vec![call("a", "safe")];
        let results = vec![("a".to_string(), 1), ("stray".to_string(), 99)];
        assert_eq!(reorder_to_match(&calls, results), vec![1]);
    }
}
