//! Golden evaluation vectors.
//!
//! Fixed (flag record, user) -> result triples pinning the decision chain
//! and the bucket hashing. Every runtime that evaluates flags client-side
//! must reproduce these results exactly; a change here is a wire-contract
//! change, not a refactor.

use flagpole::evaluation::{evaluate, FlagRecord};
use serde_json::{json, Value};

fn run_vector(flag: Value, user_id: &str, expected: Value) {
    let record: FlagRecord = serde_json::from_value(flag.clone())
        .unwrap_or_else(|e| panic!("invalid flag fixture {flag}: {e}"));
    let result = serde_json::to_value(evaluate(&record, user_id)).unwrap();
    assert_eq!(result, expected, "user {user_id} on flag {}", record.key);
}

#[test]
fn kill_switch_ignores_whitelist_and_rollout() {
    run_vector(
        json!({
            "key": "new-ui",
            "kind": "boolean",
            "enabled": false,
            "rollout_percentage": 100,
            "targeting": { "allowed_users": ["user-42"] }
        }),
        "user-42",
        json!({ "enabled": false, "value": false, "reason": "KILL_SWITCH" }),
    );
}

#[test]
fn kill_switch_resolves_off_variant() {
    run_vector(
        json!({
            "key": "theme",
            "kind": "multivariate",
            "enabled": false,
            "rollout_percentage": 100,
            "variants": [
                { "id": "light", "value": "light", "weight": 50 },
                { "id": "dark", "value": "dark", "weight": 50 }
            ],
            "off_variant_id": "light"
        }),
        "anyone",
        json!({
            "enabled": false,
            "value": "light",
            "variant_id": "light",
            "reason": "KILL_SWITCH"
        }),
    );
}

#[test]
fn blocked_user_wins_over_allowed() {
    run_vector(
        json!({
            "key": "new-ui",
            "kind": "boolean",
            "enabled": true,
            "rollout_percentage": 100,
            "targeting": {
                "allowed_users": ["user-42"],
                "blocked_users": ["user-42"]
            }
        }),
        "user-42",
        json!({ "enabled": false, "value": false, "reason": "BLOCKED_USER" }),
    );
}

#[test]
fn whitelisted_user_bypasses_zero_rollout() {
    run_vector(
        json!({
            "key": "new-ui",
            "kind": "boolean",
            "enabled": true,
            "rollout_percentage": 0,
            "targeting": { "allowed_users": ["vip-1"] }
        }),
        "vip-1",
        json!({ "enabled": true, "value": true, "reason": "WHITELISTED" }),
    );
}

#[test]
fn half_rollout_includes_bucket_12() {
    // user-42 hashes to bucket 12 on "new-ui".
    run_vector(
        json!({
            "key": "new-ui",
            "kind": "boolean",
            "enabled": true,
            "rollout_percentage": 50
        }),
        "user-42",
        json!({
            "enabled": true,
            "value": true,
            "reason": "PERCENTAGE_ROLLOUT: bucket 12 < 50"
        }),
    );
}

#[test]
fn half_rollout_excludes_bucket_74() {
    // user-1 hashes to bucket 74 on "new-ui".
    run_vector(
        json!({
            "key": "new-ui",
            "kind": "boolean",
            "enabled": true,
            "rollout_percentage": 50
        }),
        "user-1",
        json!({
            "enabled": false,
            "value": false,
            "reason": "PERCENTAGE_EXCLUDED: bucket 74 >= 50"
        }),
    );
}

#[test]
fn variant_scan_selects_by_cumulative_weight() {
    let flag = json!({
        "key": "checkout-button",
        "kind": "multivariate",
        "enabled": true,
        "rollout_percentage": 100,
        "variants": [
            { "id": "a", "value": "a", "weight": 30 },
            { "id": "b", "value": "b", "weight": 30 },
            { "id": "c", "value": "c", "weight": 40 }
        ]
    });

    // Pinned buckets on "checkout-button": user-418 -> 25, user-66 -> 55,
    // user-88 -> 85.
    for (user, variant, bucket) in [("user-418", "a", 25), ("user-66", "b", 55), ("user-88", "c", 85)]
    {
        run_vector(
            flag.clone(),
            user,
            json!({
                "enabled": true,
                "value": variant,
                "variant_id": variant,
                "reason": format!("VARIANT_ROLLOUT: variant {variant} at bucket {bucket}")
            }),
        );
    }
}

#[test]
fn uncovered_bucket_falls_back_to_default_variant() {
    // user-69 hashes to bucket 70 on "checkout-button"; the variants only
    // cover [0,50).
    run_vector(
        json!({
            "key": "checkout-button",
            "kind": "multivariate",
            "enabled": true,
            "rollout_percentage": 100,
            "variants": [
                { "id": "a", "value": "a", "weight": 50 }
            ],
            "default_variant_id": "a"
        }),
        "user-69",
        json!({
            "enabled": true,
            "value": "a",
            "variant_id": "a",
            "reason": "FALLBACK_DEFAULT"
        }),
    );
}
