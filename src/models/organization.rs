// Organization tenancy models - plans, quotas, security posture

//! # Organization Models
//!
//! The organization is the tenant root: every workflow, connection, trigger
//! and execution belongs to exactly one. Plan tiers gate connector access
//! and quota ceilings; the quota profile is consulted on every admission.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Billing plan tier.
///
/// Tier ordering matters: connector eligibility compares plan ranks, so the
/// numeric rank (not the enum declaration order) is the contract.
/// `Pro` and `Professional` are the same rank; `professional` is canonical
/// on the wire and `pro` is accepted as an input alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Professional,
    Enterprise,
    EnterprisePlus,
}

impl PlanTier {
    /// Numeric rank used for connector tier gating: free=0 through
    /// enterprise_plus=4. `Pro` and `Professional` share rank 2.
    pub fn rank(&self) -> u8 {
        match self {
            PlanTier::Free => 0,
            PlanTier::Starter => 1,
            PlanTier::Pro | PlanTier::Professional => 2,
            PlanTier::Enterprise => 3,
            PlanTier::EnterprisePlus => 4,
        }
    }

    /// Parse a tier label, accepting the `pro` alias.
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "starter" => Some(PlanTier::Starter),
            "pro" => Some(PlanTier::Pro),
            "professional" => Some(PlanTier::Professional),
            "enterprise" => Some(PlanTier::Enterprise),
            "enterprise_plus" => Some(PlanTier::EnterprisePlus),
            _ => None,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Professional => "professional",
            PlanTier::Enterprise => "enterprise",
            PlanTier::EnterprisePlus => "enterprise_plus",
        };
        write!(f, "{label}")
    }
}

/// Organization lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Trial,
    Active,
    Suspended,
}

/// Member role within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl MemberRole {
    /// Admins and owners may manage triggers, connections and exports.
    pub fn is_admin(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

/// Organization membership row. At most one `is_default` per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub organization_id: String,
    pub user_id: String,
    pub role: MemberRole,
    #[serde(default)]
    pub is_default: bool,
}

/// Egress constraints attached to connector credentials for this tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    /// Hostnames connector clients may reach. Empty means unrestricted.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// CIDR ranges connector clients may reach.
    #[serde(default)]
    pub allowed_ip_ranges: Vec<String>,
}

impl NetworkPolicy {
    /// True when the policy imposes no restriction.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_domains.is_empty() && self.allowed_ip_ranges.is_empty()
    }

    /// Check an egress target against the policy.
    ///
    /// IP-literal hosts are checked against the CIDR allowlist; hostnames
    /// against the domain allowlist (subdomains of an allowlisted domain
    /// are allowed). Under a CIDR-only policy a hostname fails closed: it
    /// cannot be checked against address ranges without resolution.
    pub fn permits_host(&self, host: &str) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        // Bracketed IPv6 literals arrive as `[::1]` from parsed URLs.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return self.permits_ip(ip);
        }
        if self.allowed_domains.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_domains.iter().any(|d| {
            let d = d.to_ascii_lowercase();
            host == d || host.ends_with(&format!(".{d}"))
        })
    }

    /// Check an address against the CIDR allowlist. A restricted policy
    /// with no ranges admits no addresses.
    pub fn permits_ip(&self, ip: IpAddr) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        self.allowed_ip_ranges
            .iter()
            .any(|range| cidr_contains(range, ip))
    }
}

/// Does `range` (`10.0.0.0/8`, `2001:db8::/32`, or a bare address) contain
/// `ip`? Malformed ranges match nothing.
fn cidr_contains(range: &str, ip: IpAddr) -> bool {
    let (base, prefix) = match range.split_once('/') {
        Some((base, prefix)) => match prefix.trim().parse::<u32>() {
            Ok(prefix) => (base.trim(), Some(prefix)),
            Err(_) => return false,
        },
        None => (range.trim(), None),
    };
    let Ok(base_ip) = base.parse::<IpAddr>() else {
        return false;
    };
    match (base_ip, ip) {
        (IpAddr::V4(base), IpAddr::V4(ip)) => {
            let prefix = prefix.unwrap_or(32);
            if prefix == 0 {
                return true;
            }
            if prefix > 32 {
                return false;
            }
            let mask = u32::MAX << (32 - prefix);
            (u32::from(base) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(base), IpAddr::V6(ip)) => {
            let prefix = prefix.unwrap_or(128);
            if prefix == 0 {
                return true;
            }
            if prefix > 128 {
                return false;
            }
            let mask = u128::MAX << (128 - prefix);
            (u128::from(base) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

/// Tenant security settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub network_policy: NetworkPolicy,
    #[serde(default)]
    pub require_mfa: bool,
    /// Session idle timeout in minutes; 0 means provider default.
    #[serde(default)]
    pub session_timeout_minutes: u32,
}

/// Data-residency and compliance posture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComplianceSettings {
    /// Region data must stay in; `None` inherits the platform default.
    pub data_residency: Option<String>,
}

/// The tenant root entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub plan: PlanTier,
    pub region: String,
    pub status: OrganizationStatus,
    /// Feature flags by name; absent means off.
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub compliance: ComplianceSettings,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N, plan: PlanTier, region: &str) -> Self {
        Organization {
            id: id.into(),
            name: name.into(),
            plan,
            region: region.to_string(),
            status: OrganizationStatus::Active,
            feature_flags: HashMap::new(),
            security: SecuritySettings::default(),
            compliance: ComplianceSettings::default(),
            created_at: Utc::now(),
        }
    }

    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.feature_flags.get(flag).copied().unwrap_or(false)
    }
}

/// Quota ceilings for one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_workflows: u64,
    pub max_executions_per_month: u64,
    pub max_concurrent_executions: u64,
    pub max_executions_per_minute: u64,
    pub max_storage_bytes: u64,
    pub max_users: u64,
    pub max_api_calls_per_month: u64,
    pub max_tokens_per_month: u64,
}

impl QuotaLimits {
    /// Plan-tier defaults. Overridable per organization.
    pub fn for_plan(plan: PlanTier) -> Self {
        match plan {
            PlanTier::Free => QuotaLimits {
                max_workflows: 5,
                max_executions_per_month: 500,
                max_concurrent_executions: 1,
                max_executions_per_minute: 5,
                max_storage_bytes: 50 * 1024 * 1024,
                max_users: 2,
                max_api_calls_per_month: 1_000,
                max_tokens_per_month: 50_000,
            },
            PlanTier::Starter => QuotaLimits {
                max_workflows: 20,
                max_executions_per_month: 5_000,
                max_concurrent_executions: 3,
                max_executions_per_minute: 20,
                max_storage_bytes: 500 * 1024 * 1024,
                max_users: 5,
                max_api_calls_per_month: 20_000,
                max_tokens_per_month: 500_000,
            },
            PlanTier::Pro | PlanTier::Professional => QuotaLimits {
                max_workflows: 100,
                max_executions_per_month: 50_000,
                max_concurrent_executions: 10,
                max_executions_per_minute: 60,
                max_storage_bytes: 5 * 1024 * 1024 * 1024,
                max_users: 25,
                max_api_calls_per_month: 200_000,
                max_tokens_per_month: 5_000_000,
            },
            PlanTier::Enterprise => QuotaLimits {
                max_workflows: 1_000,
                max_executions_per_month: 500_000,
                max_concurrent_executions: 50,
                max_executions_per_minute: 300,
                max_storage_bytes: 50 * 1024 * 1024 * 1024,
                max_users: 500,
                max_api_calls_per_month: 2_000_000,
                max_tokens_per_month: 50_000_000,
            },
            PlanTier::EnterprisePlus => QuotaLimits {
                max_workflows: 10_000,
                max_executions_per_month: 5_000_000,
                max_concurrent_executions: 200,
                max_executions_per_minute: 1_000,
                max_storage_bytes: 500 * 1024 * 1024 * 1024,
                max_users: 5_000,
                max_api_calls_per_month: 20_000_000,
                max_tokens_per_month: 500_000_000,
            },
        }
    }
}

/// Usage snapshot inside the current billing window.
///
/// Invariant: `concurrent_executions >= 0` at all times (enforced by
/// saturating decrements in the organization store).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub workflows: u64,
    pub executions_this_month: u64,
    pub concurrent_executions: u64,
    pub executions_in_current_window: u64,
    pub storage_bytes: u64,
    pub users: u64,
    pub api_calls_this_month: u64,
    pub tokens_this_month: u64,
}

/// Quota profile: the billing window, its ceilings, and current usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationQuota {
    pub organization_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub limits: QuotaLimits,
    pub usage: QuotaUsage,
}

impl OrganizationQuota {
    /// Fresh profile for the calendar month containing `now`.
    pub fn for_month(organization_id: &str, plan: PlanTier, now: DateTime<Utc>) -> Self {
        let (start, end) = billing_window(now);
        OrganizationQuota {
            organization_id: organization_id.to_string(),
            period_start: start,
            period_end: end,
            limits: QuotaLimits::for_plan(plan),
            usage: QuotaUsage::default(),
        }
    }

    /// Roll the window forward if `now` has left the current period.
    /// Window counters reset; `concurrent_executions` carries over because
    /// in-flight runs do not end at midnight.
    pub fn roll_window(&mut self, now: DateTime<Utc>) {
        if now < self.period_end {
            return;
        }
        let (start, end) = billing_window(now);
        self.period_start = start;
        self.period_end = end;
        let concurrent = self.usage.concurrent_executions;
        let workflows = self.usage.workflows;
        let storage = self.usage.storage_bytes;
        let users = self.usage.users;
        self.usage = QuotaUsage {
            concurrent_executions: concurrent,
            workflows,
            storage_bytes: storage,
            users,
            ..QuotaUsage::default()
        };
    }
}

/// First and last instant of the calendar month containing `now`.
pub fn billing_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_ranks() {
        assert_eq!(PlanTier::Free.rank(), 0);
        assert_eq!(PlanTier::Pro.rank(), PlanTier::Professional.rank());
        assert_eq!(PlanTier::EnterprisePlus.rank(), 4);
        assert!(PlanTier::Enterprise.rank() > PlanTier::Starter.rank());
    }

    #[test]
    fn plan_parse_accepts_alias() {
        assert_eq!(PlanTier::parse("pro"), Some(PlanTier::Pro));
        assert_eq!(PlanTier::parse("Professional"), Some(PlanTier::Professional));
        assert_eq!(PlanTier::parse("gold"), None);
    }

    #[test]
    fn billing_window_covers_month() {
        let now = Utc.with_ymd_and_hms(2024, 1, 16, 12, 0, 0).unwrap();
        let (start, end) = billing_window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn window_roll_resets_counters_but_not_concurrency() {
        let now = Utc.with_ymd_and_hms(2024, 1, 16, 12, 0, 0).unwrap();
        let mut quota = OrganizationQuota::for_month("org-1", PlanTier::Starter, now);
        quota.usage.executions_this_month = 99;
        quota.usage.concurrent_executions = 2;
        quota.roll_window(Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap());
        assert_eq!(quota.usage.executions_this_month, 0);
        assert_eq!(quota.usage.concurrent_executions, 2);
    }

    #[test]
    fn network_policy_subdomain_match() {
        let policy = NetworkPolicy {
            allowed_domains: vec!["api.example.com".into(), "slack.com".into()],
            allowed_ip_ranges: vec![],
        };
        assert!(policy.permits_host("slack.com"));
        assert!(policy.permits_host("hooks.slack.com"));
        assert!(!policy.permits_host("evil-slack.com"));
        assert!(NetworkPolicy::default().permits_host("anything.example"));
    }

    #[test]
    fn network_policy_cidr_ranges() {
        let policy = NetworkPolicy {
            allowed_domains: vec![],
            allowed_ip_ranges: vec!["10.0.0.0/8".into(), "192.168.1.10".into()],
        };
        assert!(policy.permits_host("10.4.2.1"));
        assert!(policy.permits_host("192.168.1.10"));
        assert!(!policy.permits_host("192.168.1.11"));
        assert!(!policy.permits_host("8.8.8.8"));
        // CIDR-only policy: hostnames fail closed (no resolution here).
        assert!(!policy.permits_host("internal.example.com"));
    }

    #[test]
    fn network_policy_domains_and_ranges_combine() {
        let policy = NetworkPolicy {
            allowed_domains: vec!["slack.com".into()],
            allowed_ip_ranges: vec!["10.0.0.0/8".into()],
        };
        assert!(policy.permits_host("hooks.slack.com"));
        assert!(policy.permits_host("10.1.2.3"));
        // An IP literal is never matched by the domain list.
        assert!(!policy.permits_host("1.2.3.4"));
        assert!(!policy.permits_host("github.com"));
    }

    #[test]
    fn cidr_matching_edges() {
        use std::net::IpAddr;
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        assert!(cidr_contains("10.0.0.0/8", ip("10.255.255.255")));
        assert!(!cidr_contains("10.0.0.0/8", ip("11.0.0.1")));
        assert!(cidr_contains("0.0.0.0/0", ip("203.0.113.9")));
        assert!(cidr_contains("2001:db8::/32", ip("2001:db8::1")));
        assert!(!cidr_contains("2001:db8::/32", ip("2001:db9::1")));
        // Bare address means /32.
        assert!(cidr_contains("192.0.2.1", ip("192.0.2.1")));
        assert!(!cidr_contains("192.0.2.1", ip("192.0.2.2")));
        // Family mismatch and junk match nothing.
        assert!(!cidr_contains("10.0.0.0/8", ip("::1")));
        assert!(!cidr_contains("not-a-range", ip("10.0.0.1")));
        assert!(!cidr_contains("10.0.0.0/64", ip("10.0.0.1")));
    }
}
