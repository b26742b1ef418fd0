pub mod routes;

use serde::Deserialize;

use crate::evaluation::{Targeting, Variant};

/// Partial flag update. Absent fields keep their stored value.
#[derive(Debug, Deserialize)]
pub struct UpdateFlagRequest {
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<i32>,
    pub targeting: Option<Targeting>,
    pub variants: Option<Vec<Variant>>,
    pub default_variant_id: Option<String>,
    pub off_variant_id: Option<String>,
}

// HELPER FUNCTIONS

/// Rollout percentages are a fraction of traffic, 0 to 100 inclusive.
pub fn validate_rollout_percentage(percentage: i32) -> Result<(), String> {
    if !(0..=100).contains(&percentage) {
        return Err("Rollout percentage must be between 0 and 100".to_string());
    }
    Ok(())
}
