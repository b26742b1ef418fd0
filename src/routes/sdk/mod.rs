pub mod routes;

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Request body for the single-flag evaluation endpoint. `flag_key` and
/// `user_id` are required but parsed as options so a missing field gets a
/// shape-complete JSON error instead of a deserialization rejection.
#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub flag_key: Option<String>,
    pub user_id: Option<String>,
    pub environment: Option<String>,
    /// Reserved for future targeting conditions; not consulted yet.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub default: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct FlagsQuery {
    pub environment: Option<String>,
}

/// Environment applied when a request leaves it out. Only the HTTP edge
/// defaults; the store always takes an explicit environment.
pub const DEFAULT_ENVIRONMENT: &str = "production";
