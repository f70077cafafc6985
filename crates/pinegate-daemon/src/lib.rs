//! pinegate-daemon - Access-grant ledger and synchronization engine
//!
//! Stateful half of the pinegate system: the durable SQLite grant ledger,
//! the engine that reconciles it with the remote authorization service,
//! and read-only dashboard reporting. The HTTP front-end, request
//! authentication, and process bootstrap live outside this workspace and
//! call in through [`engine::SyncEngine`]'s four operations: `grant`,
//! `revoke`, `check`, and `sweep_expired`.
//!
//! # Modules
//!
//! - [`ledger`]: `SQLite`-backed store for assets, clients, and grants,
//!   with the at-most-one-active-grant invariant enforced by a partial
//!   unique index
//! - [`engine`]: the grant lifecycle state machine and remote
//!   reconciliation (local write first, remote best-effort)
//! - [`report`]: dashboard aggregation over the ledger
//! - [`config`]: TOML engine configuration

pub mod config;
pub mod engine;
pub mod ledger;
pub mod report;

pub use config::{ConfigError, EngineConfig};
pub use engine::{AccessReport, EngineError, GrantOutcome, RevokeOutcome, SyncEngine};
pub use ledger::{
    Asset, AssetStats, AssetUsage, Client, ClientAccessCount, EntityState, Grant, GrantDetail,
    GrantKind, GrantState, LedgerCounts, LedgerError, NewAsset, NewClient, SqliteLedger,
};
pub use report::{DashboardAlerts, DashboardStats};
