//! Grant synchronization engine.
//!
//! Orchestrates grant issuance, renewal, revocation, and expiry sweeps,
//! reconciling the local ledger with the remote authorization service.
//!
//! # State machine
//!
//! Per `(client, asset)` pair:
//!
//! ```text
//! NONE --grant--> ACTIVE --sweep--> EXPIRED
//!                    |
//!                    +----revoke--> REVOKED
//! ```
//!
//! `EXPIRED` and `REVOKED` are terminal; a new grant request from either
//! re-enters `ACTIVE` by reusing the same row, which keeps the grant's
//! identity stable across renewals.
//!
//! # Failure policy
//!
//! Validation failures (bad duration, unknown identity, missing entities)
//! are rejected before any write. The local ledger write happens *before*
//! the remote call; a remote failure after the local write is never rolled
//! back — the operation reports partial success so an operator can
//! reconcile later. The ledger records administrative intent; the remote
//! service is the enforcement point, and a failed remote call does not
//! invalidate that intent.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pinegate_core::duration::{ExtensionUnit, InvalidDurationError};
use pinegate_core::remote::{ApplyStatus, GrantSnapshot, RemoteAuthorizer, RemoteError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ledger::{
    Client, GrantDetail, GrantKind, LedgerError, NewClient, SqliteLedger, fmt_ts,
};

/// Errors raised inside engine operations.
///
/// These never cross the operation boundary raw: `grant` and `revoke`
/// convert them into refused outcomes with a message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The extension descriptor was malformed.
    #[error(transparent)]
    InvalidDuration(#[from] InvalidDurationError),

    /// The requested grant length cannot be represented as an expiration
    /// instant.
    #[error("unsupported grant duration: {0} days")]
    UnsupportedDuration(i64),

    /// The remote identity search says the username does not exist.
    #[error("unknown remote identity: {0}")]
    UnknownIdentity(String),

    /// No asset with the given publication id.
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// No client with the given username.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// Revoke was requested with no active grant to revoke.
    #[error("no active grant for {username} on {pine_id}")]
    NoActiveGrant {
        /// The client username.
        username: String,
        /// The asset publication id.
        pine_id: String,
    },

    /// Ledger storage failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Remote adapter failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Structured result of a `grant` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantOutcome {
    /// True only when both the ledger write and the remote sync succeeded.
    pub success: bool,
    /// Human-readable account of what happened, including any
    /// ledger/remote divergence.
    pub message: String,
    /// The ledger grant row, when one was written.
    pub grant_id: Option<i64>,
}

impl GrantOutcome {
    fn refused(message: String) -> Self {
        Self {
            success: false,
            message,
            grant_id: None,
        }
    }
}

/// Structured result of a `revoke` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevokeOutcome {
    /// True only when both the ledger write and the remote removal
    /// succeeded.
    pub success: bool,
    /// Human-readable account of what happened.
    pub message: String,
}

/// Diagnostic access report for a `(client, asset)` pair.
///
/// `has_access` is the local ledger's verdict and the authoritative answer
/// this system gives; `remote` is a best-effort snapshot of the remote
/// service's independent record and is `None` whenever the remote cannot
/// be reached — this report is diagnostic, not a remote health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessReport {
    /// Whether the ledger holds an `active` grant for the pair.
    pub has_access: bool,
    /// The local grant with display detail, when any grant row exists.
    pub local: Option<GrantDetail>,
    /// The remote record, when the remote answered.
    pub remote: Option<GrantSnapshot>,
}

/// The grant synchronization engine.
///
/// Holds its ledger and remote adapter as explicit dependencies; one
/// engine instance can serve concurrent callers, each operation running to
/// completion on the calling thread.
pub struct SyncEngine {
    ledger: Arc<SqliteLedger>,
    remote: Arc<dyn RemoteAuthorizer>,
}

impl SyncEngine {
    /// Creates an engine over the given ledger and remote adapter.
    #[must_use]
    pub fn new(ledger: Arc<SqliteLedger>, remote: Arc<dyn RemoteAuthorizer>) -> Self {
        Self { ledger, remote }
    }

    /// Grants `username` access to the asset published as `pine_id` for
    /// `days` days; `days <= 0` means permanent (unbounded) access.
    ///
    /// The ledger row is written first; the remote service is then brought
    /// in line. A remote failure leaves the row in place and is reported
    /// as `success = false` with the divergence spelled out in `message`.
    pub fn grant(&self, username: &str, pine_id: &str, days: i64) -> GrantOutcome {
        match self.try_grant(username, pine_id, days) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(username, pine_id, %error, "grant refused");
                GrantOutcome::refused(error.to_string())
            },
        }
    }

    fn try_grant(
        &self,
        username: &str,
        pine_id: &str,
        days: i64,
    ) -> Result<GrantOutcome, EngineError> {
        let now = Utc::now();

        // Validation phase: no writes until the duration and both entities
        // resolve.
        let (expires_at, kind, magnitude) = if days > 0 {
            let magnitude =
                u32::try_from(days).map_err(|_| EngineError::UnsupportedDuration(days))?;
            let expires = Duration::try_days(days)
                .and_then(|span| now.checked_add_signed(span))
                .ok_or(EngineError::UnsupportedDuration(days))?;
            (Some(expires), GrantKind::Temporary, magnitude)
        } else {
            (None, GrantKind::Permanent, 0)
        };

        let client = self.resolve_or_create_client(username)?;
        let asset = self
            .ledger
            .asset_by_pub_id(pine_id)?
            .ok_or_else(|| EngineError::AssetNotFound(pine_id.to_string()))?;
        let note_line = match kind {
            GrantKind::Temporary => format!("{} granted {days} days", fmt_ts(now)),
            GrantKind::Permanent => format!("{} granted permanent access", fmt_ts(now)),
        };

        // Local write first: reuse the pair's existing grant row when one
        // exists in any state (a terminal row re-enters active with its id
        // intact), and treat a racing insert's constraint violation as
        // "retry as update" against the row that won the race.
        let grant_id = match self.ledger.latest_grant_for(client.id, asset.id)? {
            Some(existing) => {
                self.ledger
                    .renew_grant(existing.id, now, expires_at, kind, &note_line)?;
                existing.id
            },
            None => match self
                .ledger
                .insert_grant(client.id, asset.id, now, expires_at, kind, &note_line)
            {
                Ok(id) => id,
                Err(LedgerError::Constraint(detail)) => {
                    debug!(%detail, "lost insert race, renewing the winning row");
                    let existing = self
                        .ledger
                        .active_grant_for(client.id, asset.id)?
                        .ok_or(LedgerError::Constraint(detail))?;
                    self.ledger
                        .renew_grant(existing.id, now, expires_at, kind, &note_line)?;
                    existing.id
                },
                Err(error) => return Err(error.into()),
            },
        };
        info!(grant_id, username = %client.username, pine_id, days, "grant recorded in ledger");

        // Remote phase: best effort, never rolls the ledger back.
        let unit = match kind {
            GrantKind::Temporary => ExtensionUnit::Days,
            GrantKind::Permanent => ExtensionUnit::Lifetime,
        };
        match self.sync_remote_grant(&client.username, pine_id, unit, magnitude) {
            Ok(snapshot) if snapshot.status == ApplyStatus::Failed => Ok(GrantOutcome {
                success: false,
                message: format!(
                    "grant {grant_id} recorded in ledger but the remote service rejected the update"
                ),
                grant_id: Some(grant_id),
            }),
            Ok(snapshot) => {
                let message = match (kind, snapshot.status) {
                    (_, ApplyStatus::NotApplied) if snapshot.expiration.is_none() => format!(
                        "grant {grant_id} recorded; remote grant is already unbounded"
                    ),
                    (GrantKind::Temporary, _) => {
                        format!("access granted for {days} days (grant {grant_id})")
                    },
                    (GrantKind::Permanent, _) => {
                        format!("permanent access granted (grant {grant_id})")
                    },
                };
                Ok(GrantOutcome {
                    success: true,
                    message,
                    grant_id: Some(grant_id),
                })
            },
            Err(error) => {
                warn!(grant_id, %error, "ledger updated but remote sync failed");
                Ok(GrantOutcome {
                    success: false,
                    message: format!(
                        "grant {grant_id} recorded in ledger but remote sync failed: {error}"
                    ),
                    grant_id: Some(grant_id),
                })
            },
        }
    }

    fn sync_remote_grant(
        &self,
        username: &str,
        pine_id: &str,
        unit: ExtensionUnit,
        magnitude: u32,
    ) -> Result<GrantSnapshot, RemoteError> {
        let snapshot = self.remote.lookup_grant(username, pine_id)?;
        self.remote.apply_grant(&snapshot, unit, magnitude)
    }

    /// Resolves the client row for `username`, implicitly registering the
    /// identity under its remote canonical spelling on first contact.
    fn resolve_or_create_client(&self, username: &str) -> Result<Client, EngineError> {
        if let Some(client) = self.ledger.client_by_username(username)? {
            return Ok(client);
        }

        let check = self.remote.validate_identity(username)?;
        if !check.exists {
            return Err(EngineError::UnknownIdentity(username.to_string()));
        }

        // A case-variant request may already be registered canonically.
        if let Some(client) = self.ledger.client_by_username(&check.canonical_username)? {
            return Ok(client);
        }

        let new = NewClient {
            username: check.canonical_username.clone(),
            ..NewClient::default()
        };
        match self.ledger.insert_client(&new) {
            Ok(id) => {
                info!(username = %new.username, "client implicitly registered");
                self.ledger
                    .client_by_id(id)?
                    .ok_or_else(|| EngineError::ClientNotFound(new.username.clone()))
            },
            // Racing registration: the other writer's row wins.
            Err(LedgerError::Constraint(_)) => self
                .ledger
                .client_by_username(&check.canonical_username)?
                .ok_or_else(|| EngineError::ClientNotFound(check.canonical_username.clone())),
            Err(error) => Err(error.into()),
        }
    }

    /// Revokes `username`'s access to the asset published as `pine_id`.
    ///
    /// Requires an `active` ledger row; transitions it to `revoked` first,
    /// then removes the remote grant. A remote failure leaves the local
    /// revocation in place and reports partial success.
    pub fn revoke(&self, username: &str, pine_id: &str) -> RevokeOutcome {
        match self.try_revoke(username, pine_id) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(username, pine_id, %error, "revoke refused");
                RevokeOutcome {
                    success: false,
                    message: error.to_string(),
                }
            },
        }
    }

    fn try_revoke(&self, username: &str, pine_id: &str) -> Result<RevokeOutcome, EngineError> {
        let client = self
            .ledger
            .client_by_username(username)?
            .ok_or_else(|| EngineError::ClientNotFound(username.to_string()))?;
        let asset = self
            .ledger
            .asset_by_pub_id(pine_id)?
            .ok_or_else(|| EngineError::AssetNotFound(pine_id.to_string()))?;

        let grant = self.ledger.active_grant_for(client.id, asset.id)?.ok_or(
            EngineError::NoActiveGrant {
                username: username.to_string(),
                pine_id: pine_id.to_string(),
            },
        )?;

        let note_line = format!("{} revoked by operator", fmt_ts(Utc::now()));
        if !self.ledger.revoke_grant(grant.id, &note_line)? {
            // Lost a race with a sweep or another revoke.
            return Err(EngineError::NoActiveGrant {
                username: username.to_string(),
                pine_id: pine_id.to_string(),
            });
        }
        info!(grant_id = grant.id, username = %client.username, pine_id, "grant revoked in ledger");

        let removal = self
            .remote
            .lookup_grant(&client.username, pine_id)
            .and_then(|snapshot| self.remote.remove_grant(&snapshot));
        match removal {
            Ok(ApplyStatus::Failed) => Ok(RevokeOutcome {
                success: false,
                message: format!(
                    "grant {} revoked in ledger but the remote service rejected the removal",
                    grant.id
                ),
            }),
            Ok(_) => Ok(RevokeOutcome {
                success: true,
                message: "access revoked".to_string(),
            }),
            Err(error) => {
                warn!(grant_id = grant.id, %error, "ledger updated but remote removal failed");
                Ok(RevokeOutcome {
                    success: false,
                    message: format!(
                        "grant {} revoked in ledger but remote removal failed: {error}",
                        grant.id
                    ),
                })
            },
        }
    }

    /// Reports the local and (best-effort) remote access state for a pair.
    ///
    /// Read-only. Remote failures are swallowed by contract: this endpoint
    /// is diagnostic, not authoritative, and a remote outage must not make
    /// it fail.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Ledger`] on local storage failure only.
    pub fn check(&self, username: &str, pine_id: &str) -> Result<AccessReport, EngineError> {
        let client = self.ledger.client_by_username(username)?;
        let asset = self.ledger.asset_by_pub_id(pine_id)?;

        let local = match (&client, &asset) {
            (Some(client), Some(asset)) => self
                .ledger
                .active_grant_for(client.id, asset.id)?
                .map(|grant| GrantDetail {
                    username: client.username.clone(),
                    full_name: client.full_name.clone(),
                    asset_name: asset.name.clone(),
                    pub_id: asset.pub_id.clone(),
                    grant,
                }),
            _ => None,
        };
        let has_access = local.is_some();

        let lookup_name = client.as_ref().map_or(username, |c| c.username.as_str());
        let remote = match self.remote.lookup_grant(lookup_name, pine_id) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                debug!(username, pine_id, %error, "remote lookup failed during check");
                None
            },
        };

        Ok(AccessReport {
            has_access,
            local,
            remote,
        })
    }

    /// Transitions every locally `active` grant whose expiration has
    /// passed to `expired` and returns the count.
    ///
    /// No remote call is made: the remote service expires its own grants.
    /// Exposed for an external scheduler to invoke.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Ledger`] on storage failure.
    pub fn sweep_expired(&self) -> Result<u64, EngineError> {
        Ok(self.ledger.sweep_expired(Utc::now())?)
    }
}
