//! Dashboard reporting over the grant ledger.
//!
//! Pure read-only aggregation for the operator dashboard: entity totals,
//! grants expiring inside a configurable horizon, recent activity, and the
//! busiest assets. Each figure comes from its own query, so read skew
//! across them is possible and acceptable — the dashboard is eventually
//! consistent with the ledger.

use chrono::Utc;
use serde::Serialize;

use crate::ledger::{AssetUsage, GrantDetail, LedgerCounts, LedgerError, SqliteLedger};

/// Default expiring-soon horizon in days.
pub const DEFAULT_HORIZON_DAYS: u32 = 7;

/// Default number of top assets reported.
pub const DEFAULT_TOP_ASSETS: u32 = 5;

/// Default number of recent grants reported.
const RECENT_GRANTS_LIMIT: u32 = 10;

/// Attention counters derived from the other dashboard figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DashboardAlerts {
    /// Active grants expiring within the horizon.
    pub expiring_count: usize,
    /// Grants already in `expired` state.
    pub expired_count: i64,
}

/// One dashboard snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    /// Entity totals by state.
    pub counts: LedgerCounts,
    /// Active grants expiring within the horizon, soonest first.
    pub expiring_soon: Vec<GrantDetail>,
    /// Most recently created grants.
    pub recent_grants: Vec<GrantDetail>,
    /// Busiest active assets by active grant count.
    pub top_assets: Vec<AssetUsage>,
    /// Derived attention counters.
    pub alerts: DashboardAlerts,
}

impl DashboardStats {
    /// Builds a dashboard snapshot with the default horizon and limits.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when any underlying query fails.
    pub fn build(ledger: &SqliteLedger) -> Result<Self, LedgerError> {
        Self::build_with_horizon(ledger, DEFAULT_HORIZON_DAYS, DEFAULT_TOP_ASSETS)
    }

    /// Builds a dashboard snapshot with an explicit expiring-soon horizon
    /// and top-assets limit.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when any underlying query fails.
    pub fn build_with_horizon(
        ledger: &SqliteLedger,
        horizon_days: u32,
        top_assets_limit: u32,
    ) -> Result<Self, LedgerError> {
        let counts = ledger.counts()?;
        let expiring_soon = ledger.grants_expiring_within(Utc::now(), horizon_days)?;
        let recent_grants = ledger.recent_grants(RECENT_GRANTS_LIMIT)?;
        let top_assets = ledger.top_assets_by_active_grants(top_assets_limit)?;

        let alerts = DashboardAlerts {
            expiring_count: expiring_soon.len(),
            expired_count: counts.grants_expired,
        };

        Ok(Self {
            counts,
            expiring_soon,
            recent_grants,
            top_assets,
            alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::ledger::{GrantKind, NewAsset, NewClient};

    #[test]
    fn dashboard_aggregates_counts_expiring_and_top_assets() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let alpha = ledger
            .insert_asset(&NewAsset {
                pub_id: "PUB;alpha".to_string(),
                name: "Alpha".to_string(),
                ..NewAsset::default()
            })
            .unwrap();
        let beta = ledger
            .insert_asset(&NewAsset {
                pub_id: "PUB;beta".to_string(),
                name: "Beta".to_string(),
                ..NewAsset::default()
            })
            .unwrap();
        let alice = ledger
            .insert_client(&NewClient {
                username: "alice".to_string(),
                ..NewClient::default()
            })
            .unwrap();
        let bob = ledger
            .insert_client(&NewClient {
                username: "bob".to_string(),
                ..NewClient::default()
            })
            .unwrap();

        let now = Utc::now();
        ledger
            .insert_grant(
                alice,
                alpha,
                now,
                Some(now + Duration::days(3)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        ledger
            .insert_grant(bob, alpha, now, None, GrantKind::Permanent, "")
            .unwrap();
        let expired = ledger
            .insert_grant(
                alice,
                beta,
                now - Duration::days(20),
                Some(now - Duration::days(10)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        ledger.sweep_expired(now).unwrap();
        assert!(ledger.grant_by_id(expired).unwrap().is_some());

        let stats = DashboardStats::build(&ledger).unwrap();
        assert_eq!(stats.counts.grants_total, 3);
        assert_eq!(stats.counts.grants_active, 2);
        assert_eq!(stats.counts.grants_expired, 1);

        assert_eq!(stats.expiring_soon.len(), 1);
        assert_eq!(stats.expiring_soon[0].username, "alice");

        assert_eq!(stats.alerts.expiring_count, 1);
        assert_eq!(stats.alerts.expired_count, 1);

        assert_eq!(stats.recent_grants.len(), 3);
        assert_eq!(stats.top_assets[0].pub_id, "PUB;alpha");
        assert_eq!(stats.top_assets[0].active_grants, 2);
    }

    #[test]
    fn empty_ledger_builds_an_empty_dashboard() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let stats = DashboardStats::build(&ledger).unwrap();
        assert_eq!(stats.counts, LedgerCounts::default());
        assert!(stats.expiring_soon.is_empty());
        assert!(stats.top_assets.is_empty());
    }
}
