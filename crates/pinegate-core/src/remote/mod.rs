//! Remote authorization adapter.
//!
//! The remote authorization service (TradingView's pine-permission API) is
//! the actual enforcement point for script access. It owns its own record
//! per `(username, pine_id)` pair with its own `has_access` / `expiration`
//! fields — a separate source of truth, not a cache of the local ledger.
//! This module wraps its identity-validation and grant-mutation endpoints
//! behind the [`RemoteAuthorizer`] trait so the synchronization engine never
//! touches transport or JSON concerns directly.
//!
//! All operations are synchronous request/response calls with no automatic
//! retry; callers decide whether and when to retry.

mod tradingview;

pub use tradingview::{SessionProfile, TradingViewAuthorizer, TradingViewEndpoints};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::{ExtensionUnit, InvalidDurationError};

/// Errors emitted by remote authorization operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteError {
    /// The remote service could not be reached or answered non-2xx.
    #[error("remote authorization service unavailable ({status:?}): {message}")]
    Unavailable {
        /// HTTP status code, when a response was received at all.
        status: Option<u16>,
        /// Transport or response error detail.
        message: String,
    },

    /// The remote service answered, but the body was not parseable.
    #[error("remote protocol error: {0}")]
    Protocol(String),

    /// The session credentials were rejected or have expired.
    #[error("remote session invalid: {0}")]
    Session(String),

    /// A renewal descriptor was malformed.
    #[error(transparent)]
    InvalidDuration(#[from] InvalidDurationError),
}

/// Outcome of the most recent mutation attempt carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// No mutation has been attempted (or none was needed).
    NotApplied,
    /// The remote service accepted the mutation.
    Applied,
    /// The remote service rejected the mutation.
    Failed,
}

/// Result of a case-insensitive identity search on the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCheck {
    /// Whether the username exists remotely.
    pub exists: bool,
    /// The remote's canonical spelling of the username; empty when
    /// `exists` is false.
    pub canonical_username: String,
}

/// Typed view of one remote `(username, pine_id)` grant record.
///
/// Replaces the loose JSON dictionaries the original system threaded
/// through its access paths: every field the engine reasons about is an
/// explicit typed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSnapshot {
    /// Username the snapshot was taken for (request spelling).
    pub username: String,
    /// Publication id of the protected script.
    pub pine_id: String,
    /// Whether the remote currently lists this user as a grantee.
    pub has_access: bool,
    /// Remote expiration instant; `None` means the remote grant is
    /// unbounded.
    pub expiration: Option<DateTime<Utc>>,
    /// Outcome of the last mutation attempt made with this snapshot.
    pub status: ApplyStatus,
}

impl GrantSnapshot {
    /// Builds a fresh snapshot with no access and no mutation attempted.
    #[must_use]
    pub fn absent(username: impl Into<String>, pine_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            pine_id: pine_id.into(),
            has_access: false,
            expiration: None,
            status: ApplyStatus::NotApplied,
        }
    }
}

/// Interface to the remote authorization service.
///
/// One instance may be shared across concurrent callers: implementations
/// hold no mutable state beyond their static credentials.
pub trait RemoteAuthorizer: Send + Sync {
    /// Checks whether `username` exists remotely, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unavailable`] on transport failure and
    /// [`RemoteError::Protocol`] on an unparseable response.
    fn validate_identity(&self, username: &str) -> Result<IdentityCheck, RemoteError>;

    /// Reads the current remote grant state for `(username, pine_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unavailable`] on transport failure and
    /// [`RemoteError::Protocol`] on an unparseable response.
    fn lookup_grant(&self, username: &str, pine_id: &str) -> Result<GrantSnapshot, RemoteError>;

    /// Creates or extends the remote grant described by `snapshot`.
    ///
    /// Issues a create call when `snapshot.has_access` is false and a
    /// modify call when it is true. The new expiration is computed from
    /// the snapshot's *remote* expiration via
    /// [`crate::duration::extend_expiration`]; for
    /// [`ExtensionUnit::Lifetime`] no expiration field is sent and the
    /// remote grant becomes unbounded.
    ///
    /// A finite extension of a remote grant that is already unbounded is a
    /// defined no-op: the snapshot is returned unchanged with
    /// [`ApplyStatus::NotApplied`].
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidDuration`] for a malformed extension
    /// and [`RemoteError::Unavailable`] on transport failure. A remote
    /// rejection (non-2xx on the mutation itself) is reported in-band as
    /// [`ApplyStatus::Failed`] on the returned snapshot.
    fn apply_grant(
        &self,
        snapshot: &GrantSnapshot,
        unit: ExtensionUnit,
        magnitude: u32,
    ) -> Result<GrantSnapshot, RemoteError>;

    /// Removes the remote grant described by `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unavailable`] on transport failure. A remote
    /// rejection is reported in-band as [`ApplyStatus::Failed`].
    fn remove_grant(&self, snapshot: &GrantSnapshot) -> Result<ApplyStatus, RemoteError>;
}

/// Scripted in-memory authorizer for engine and adapter tests.
///
/// Records every call it receives and serves responses from tables the
/// test populates. Switching on [`MockRemoteAuthorizer::fail_unavailable`]
/// makes every subsequent operation fail with
/// [`RemoteError::Unavailable`], which is how engine tests exercise the
/// partial-success paths.
#[derive(Default)]
pub struct MockRemoteAuthorizer {
    inner: std::sync::Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    /// Known identities, keyed by lowercase username, valued by canonical
    /// spelling.
    identities: std::collections::HashMap<String, String>,
    /// Remote grants keyed by (lowercase username, pine_id).
    grants: std::collections::HashMap<(String, String), (bool, Option<DateTime<Utc>>)>,
    /// Every call received, in order.
    calls: Vec<MockCall>,
    /// When true, all operations fail with `Unavailable`.
    unavailable: bool,
}

/// A recorded call against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `validate_identity(username)`.
    ValidateIdentity(String),
    /// `lookup_grant(username, pine_id)`.
    LookupGrant(String, String),
    /// `apply_grant(username, pine_id, unit, magnitude)`.
    ApplyGrant(String, String, ExtensionUnit, u32),
    /// `remove_grant(username, pine_id)`.
    RemoveGrant(String, String),
}

impl MockRemoteAuthorizer {
    /// Creates an empty mock with no known identities or grants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a known remote identity with its canonical spelling.
    pub fn add_identity(&self, canonical: &str) {
        let mut state = self.inner.lock().unwrap();
        state
            .identities
            .insert(canonical.to_lowercase(), canonical.to_string());
    }

    /// Seeds a remote grant record.
    pub fn seed_grant(&self, username: &str, pine_id: &str, expiration: Option<DateTime<Utc>>) {
        let mut state = self.inner.lock().unwrap();
        state.grants.insert(
            (username.to_lowercase(), pine_id.to_string()),
            (true, expiration),
        );
    }

    /// Makes every subsequent operation fail with
    /// [`RemoteError::Unavailable`].
    pub fn fail_unavailable(&self, fail: bool) {
        self.inner.lock().unwrap().unavailable = fail;
    }

    /// Returns the calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Returns the remote expiration currently stored for a grant, if the
    /// grant exists.
    #[must_use]
    pub fn remote_expiration(&self, username: &str, pine_id: &str) -> Option<Option<DateTime<Utc>>> {
        let state = self.inner.lock().unwrap();
        state
            .grants
            .get(&(username.to_lowercase(), pine_id.to_string()))
            .filter(|(has, _)| *has)
            .map(|(_, exp)| *exp)
    }

    fn check_available(state: &MockState) -> Result<(), RemoteError> {
        if state.unavailable {
            return Err(RemoteError::Unavailable {
                status: None,
                message: "mock remote unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl RemoteAuthorizer for MockRemoteAuthorizer {
    fn validate_identity(&self, username: &str) -> Result<IdentityCheck, RemoteError> {
        let mut state = self.inner.lock().unwrap();
        state
            .calls
            .push(MockCall::ValidateIdentity(username.to_string()));
        Self::check_available(&state)?;

        match state.identities.get(&username.to_lowercase()) {
            Some(canonical) => Ok(IdentityCheck {
                exists: true,
                canonical_username: canonical.clone(),
            }),
            None => Ok(IdentityCheck {
                exists: false,
                canonical_username: String::new(),
            }),
        }
    }

    fn lookup_grant(&self, username: &str, pine_id: &str) -> Result<GrantSnapshot, RemoteError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(MockCall::LookupGrant(
            username.to_string(),
            pine_id.to_string(),
        ));
        Self::check_available(&state)?;

        let mut snapshot = GrantSnapshot::absent(username, pine_id);
        if let Some((has_access, expiration)) = state
            .grants
            .get(&(username.to_lowercase(), pine_id.to_string()))
        {
            snapshot.has_access = *has_access;
            snapshot.expiration = *expiration;
        }
        Ok(snapshot)
    }

    fn apply_grant(
        &self,
        snapshot: &GrantSnapshot,
        unit: ExtensionUnit,
        magnitude: u32,
    ) -> Result<GrantSnapshot, RemoteError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(MockCall::ApplyGrant(
            snapshot.username.clone(),
            snapshot.pine_id.clone(),
            unit,
            magnitude,
        ));
        Self::check_available(&state)?;

        let mut updated = snapshot.clone();
        if snapshot.has_access && snapshot.expiration.is_none() {
            // Already unbounded remotely: defined no-op.
            updated.status = ApplyStatus::NotApplied;
            return Ok(updated);
        }

        let base = snapshot.expiration.unwrap_or_else(Utc::now);
        let expiration = crate::duration::extend_expiration(base, unit, magnitude)?;
        updated.has_access = true;
        updated.expiration = expiration;
        updated.status = ApplyStatus::Applied;
        state.grants.insert(
            (
                snapshot.username.to_lowercase(),
                snapshot.pine_id.clone(),
            ),
            (true, expiration),
        );
        Ok(updated)
    }

    fn remove_grant(&self, snapshot: &GrantSnapshot) -> Result<ApplyStatus, RemoteError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(MockCall::RemoveGrant(
            snapshot.username.clone(),
            snapshot.pine_id.clone(),
        ));
        Self::check_available(&state)?;

        state.grants.remove(&(
            snapshot.username.to_lowercase(),
            snapshot.pine_id.clone(),
        ));
        Ok(ApplyStatus::Applied)
    }
}
