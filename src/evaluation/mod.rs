use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// MODELS

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    Boolean,
    Multivariate,
}

/// One arm of a multivariate flag. Order in the parent record is
/// significant: the rollout scan walks variants left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub value: Value,
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
}

/// Everything the engine needs to evaluate a flag. This is the wire shape
/// shared with the sync clients, so changes here are protocol changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagRecord {
    pub key: String,
    pub kind: FlagKind,
    pub enabled: bool,
    pub rollout_percentage: i32,
    #[serde(default)]
    pub targeting: Targeting,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub default_variant_id: Option<String>,
    #[serde(default)]
    pub off_variant_id: Option<String>,
}

/// Why an evaluation came out the way it did. Serialized as a fixed
/// identifier plus an optional diagnostic suffix, e.g.
/// `PERCENTAGE_ROLLOUT: bucket 12 < 50`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalReason {
    KillSwitch,
    BlockedUser,
    Whitelisted,
    PercentageRollout { bucket: u32, threshold: i32 },
    PercentageExcluded { bucket: u32, threshold: i32 },
    VariantRollout { bucket: u32, variant_id: String },
    FallbackDefault,
    FlagNotFound,
}

impl EvalReason {
    /// The bare identifier, without the diagnostic suffix.
    pub fn code(&self) -> &'static str {
        match self {
            EvalReason::KillSwitch => "KILL_SWITCH",
            EvalReason::BlockedUser => "BLOCKED_USER",
            EvalReason::Whitelisted => "WHITELISTED",
            EvalReason::PercentageRollout { .. } => "PERCENTAGE_ROLLOUT",
            EvalReason::PercentageExcluded { .. } => "PERCENTAGE_EXCLUDED",
            EvalReason::VariantRollout { .. } => "VARIANT_ROLLOUT",
            EvalReason::FallbackDefault => "FALLBACK_DEFAULT",
            EvalReason::FlagNotFound => "FLAG_NOT_FOUND",
        }
    }
}

impl fmt::Display for EvalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalReason::PercentageRollout { bucket, threshold } => {
                write!(f, "PERCENTAGE_ROLLOUT: bucket {} < {}", bucket, threshold)
            }
            EvalReason::PercentageExcluded { bucket, threshold } => {
                write!(f, "PERCENTAGE_EXCLUDED: bucket {} >= {}", bucket, threshold)
            }
            EvalReason::VariantRollout { bucket, variant_id } => {
                write!(f, "VARIANT_ROLLOUT: variant {} at bucket {}", variant_id, bucket)
            }
            other => f.write_str(other.code()),
        }
    }
}

impl Serialize for EvalReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub enabled: bool,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub reason: EvalReason,
}

impl EvaluationResult {
    /// The result handed back when no flag exists for the requested key.
    /// Built here so every caller produces the same shape.
    pub fn not_found(default: Option<&Value>) -> Self {
        EvaluationResult {
            enabled: false,
            value: default.cloned().unwrap_or(Value::Bool(false)),
            variant_id: None,
            reason: EvalReason::FlagNotFound,
        }
    }
}

// HASHING

/// Maps (user_id, flag_key) to a stable bucket in [0,100).
///
/// MD5 over `"{user_id}:{flag_key}"`, low 32 bits of the digest reduced
/// modulo 100. Pure: no process-local seed, so every process and every
/// runtime that implements this definition agrees on the bucket.
pub fn hash_bucket(user_id: &str, flag_key: &str) -> u32 {
    let digest = Md5::digest(format!("{}:{}", user_id, flag_key));
    let low = u32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]]);
    low % 100
}

// EVALUATION

/// Evaluate a flag for a user.
///
/// Pure and infallible: a record with malformed variant data degrades to
/// the fallback rule instead of erroring, because this sits on every
/// request's hot path. The decision chain is checked strictly in order and
/// the first matching rule wins:
///
/// 1. kill switch (`enabled == false`)
/// 2. blocked user
/// 3. allowed user (whitelist)
/// 4. percentage rollout (boolean flags, or multivariate with no variants)
/// 5. cumulative-weight variant scan, in stored variant order
/// 6. fallback to the default (or first) variant
pub fn evaluate(flag: &FlagRecord, user_id: &str) -> EvaluationResult {
    evaluate_with_default(flag, user_id, None)
}

/// Same as [`evaluate`], with a caller-supplied default used as the value
/// when a multivariate flag short-circuits without a resolvable variant.
pub fn evaluate_with_default(
    flag: &FlagRecord,
    user_id: &str,
    default: Option<&Value>,
) -> EvaluationResult {
    // Step 1: kill switch beats everything, including whitelists
    if !flag.enabled {
        let (value, variant_id) = off_value(flag, default);
        return EvaluationResult {
            enabled: false,
            value,
            variant_id,
            reason: EvalReason::KillSwitch,
        };
    }

    // Step 2: blocked before allowed, so a user on both lists stays off
    if flag.targeting.blocked_users.iter().any(|u| u == user_id) {
        let (value, variant_id) = off_value(flag, default);
        return EvaluationResult {
            enabled: false,
            value,
            variant_id,
            reason: EvalReason::BlockedUser,
        };
    }

    // Step 3: whitelist
    if flag.targeting.allowed_users.iter().any(|u| u == user_id) {
        let (value, variant_id) = on_value(flag, default);
        return EvaluationResult {
            enabled: true,
            value,
            variant_id,
            reason: EvalReason::Whitelisted,
        };
    }

    let bucket = hash_bucket(user_id, &flag.key);

    // Step 4: plain percentage rollout
    if flag.kind == FlagKind::Boolean || flag.variants.is_empty() {
        return if (bucket as i64) < flag.rollout_percentage as i64 {
            EvaluationResult {
                enabled: true,
                value: Value::Bool(true),
                variant_id: None,
                reason: EvalReason::PercentageRollout {
                    bucket,
                    threshold: flag.rollout_percentage,
                },
            }
        } else {
            EvaluationResult {
                enabled: false,
                value: Value::Bool(false),
                variant_id: None,
                reason: EvalReason::PercentageExcluded {
                    bucket,
                    threshold: flag.rollout_percentage,
                },
            }
        };
    }

    // Step 5: left-to-right cumulative-weight scan. Variant order is part
    // of the contract, so no sorting and no binary search.
    let mut cumulative = 0u64;
    for variant in &flag.variants {
        cumulative += variant.weight as u64;
        if (bucket as u64) < cumulative {
            return EvaluationResult {
                enabled: true,
                value: variant.value.clone(),
                variant_id: Some(variant.id.clone()),
                reason: EvalReason::VariantRollout {
                    bucket,
                    variant_id: variant.id.clone(),
                },
            };
        }
    }

    // Step 6: weights did not cover the bucket (sum < 100, or operator
    // error). Degrade to the default variant rather than failing.
    let fallback = flag
        .default_variant_id
        .as_deref()
        .and_then(|id| flag.variants.iter().find(|v| v.id == id))
        .or_else(|| flag.variants.first());

    match fallback {
        Some(variant) => EvaluationResult {
            enabled: true,
            value: variant.value.clone(),
            variant_id: Some(variant.id.clone()),
            reason: EvalReason::FallbackDefault,
        },
        // Unreachable while step 4 handles empty variant lists, but the
        // engine must never panic on data it did not expect.
        None => EvaluationResult {
            enabled: true,
            value: default.cloned().unwrap_or(Value::Bool(true)),
            variant_id: None,
            reason: EvalReason::FallbackDefault,
        },
    }
}

/// Value and variant for the "off" outcomes (kill switch, blocked user).
fn off_value(flag: &FlagRecord, default: Option<&Value>) -> (Value, Option<String>) {
    if let Some(id) = flag.off_variant_id.as_deref() {
        if let Some(variant) = flag.variants.iter().find(|v| v.id == id) {
            return (variant.value.clone(), Some(variant.id.clone()));
        }
    }
    match flag.kind {
        FlagKind::Boolean => (Value::Bool(false), None),
        FlagKind::Multivariate => (default.cloned().unwrap_or(Value::Bool(false)), None),
    }
}

/// Value and variant for the whitelist short-circuit.
fn on_value(flag: &FlagRecord, default: Option<&Value>) -> (Value, Option<String>) {
    if let Some(id) = flag.default_variant_id.as_deref() {
        if let Some(variant) = flag.variants.iter().find(|v| v.id == id) {
            return (variant.value.clone(), Some(variant.id.clone()));
        }
    }
    match flag.kind {
        FlagKind::Boolean => (Value::Bool(true), None),
        FlagKind::Multivariate => (default.cloned().unwrap_or(Value::Bool(true)), None),
    }
}
