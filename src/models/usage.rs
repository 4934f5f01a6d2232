// Usage metering models - per-month counters, metering events, alerts

//! # Usage Models
//!
//! [`UsageTracking`] is the per-(user, organization, month) counter row the
//! meter increments transactionally. Metering events fan out to the billing
//! adapter; alerts fire when a resource crosses its warning threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metered resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResource {
    ApiCalls,
    Tokens,
    WorkflowRuns,
    Storage,
}

impl UsageResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageResource::ApiCalls => "api_calls",
            UsageResource::Tokens => "tokens",
            UsageResource::WorkflowRuns => "workflow_runs",
            UsageResource::Storage => "storage",
        }
    }
}

/// Per-user, per-organization, per-calendar-month usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageTracking {
    pub user_id: String,
    pub organization_id: String,
    pub year: i32,
    pub month: u32,
    pub api_calls: u64,
    pub tokens_used: u64,
    pub workflow_runs: u64,
    pub storage_used: u64,
    pub estimated_cost_cents: u64,
    pub updated_at: DateTime<Utc>,
}

impl UsageTracking {
    pub fn empty(user_id: &str, organization_id: &str, year: i32, month: u32) -> Self {
        UsageTracking {
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            year,
            month,
            api_calls: 0,
            tokens_used: 0,
            workflow_runs: 0,
            storage_used: 0,
            estimated_cost_cents: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn get(&self, resource: UsageResource) -> u64 {
        match resource {
            UsageResource::ApiCalls => self.api_calls,
            UsageResource::Tokens => self.tokens_used,
            UsageResource::WorkflowRuns => self.workflow_runs,
            UsageResource::Storage => self.storage_used,
        }
    }
}

/// Kind of metering event emitted to the billing adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeteringKind {
    ApiCall,
    Tokens,
    WorkflowRun,
    Storage,
    /// A limit was crossed during this increment.
    Overage,
}

/// One metering event. Emitted after the counters commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringEvent {
    pub kind: MeteringKind,
    pub organization_id: String,
    pub user_id: String,
    pub resource: UsageResource,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
}

/// Threshold alert raised by the meter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAlert {
    pub organization_id: String,
    pub user_id: String,
    pub resource: UsageResource,
    pub current: u64,
    pub limit: u64,
    /// Integer percent of the limit currently used.
    pub percent_used: u32,
    pub raised_at: DateTime<Utc>,
}

/// Result of an admission quota check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaCheck {
    pub has_quota: bool,
    /// The resource that failed the check, when `has_quota` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_type: Option<UsageResource>,
    pub current: u64,
    pub limit: u64,
    /// Minimum remaining across the requested resources when the check
    /// passes; remaining of the failed resource otherwise.
    pub remaining: u64,
    pub reset_date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_labels() {
        assert_eq!(UsageResource::ApiCalls.as_str(), "api_calls");
        assert_eq!(UsageResource::WorkflowRuns.as_str(), "workflow_runs");
    }

    #[test]
    fn tracking_accessor_matches_fields() {
        let mut row = UsageTracking::empty("u", "o", 2024, 3);
        row.api_calls = 7;
        row.tokens_used = 11;
        assert_eq!(row.get(UsageResource::ApiCalls), 7);
        assert_eq!(row.get(UsageResource::Tokens), 11);
        assert_eq!(row.get(UsageResource::Storage), 0);
    }
}
