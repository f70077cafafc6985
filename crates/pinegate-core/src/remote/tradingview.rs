//! TradingView pine-permission HTTP adapter.
//!
//! Production [`RemoteAuthorizer`] backed by TradingView's invite-only
//! script endpoints: identity search via `username_hint`, grantee listing
//! via `pine_perm/list_users`, and create/modify/remove mutations via the
//! `pine_perm` form endpoints. Authentication is two opaque session cookies
//! supplied at construction; they travel only in the `Cookie` header, never
//! in request bodies.

use chrono::{DateTime, SecondsFormat, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use super::{ApplyStatus, GrantSnapshot, IdentityCheck, RemoteAuthorizer, RemoteError};
use crate::credentials::SessionCredentials;
use crate::duration::{ExtensionUnit, extend_expiration};

/// Maximum grantee-page size requested from the listing endpoint.
const LISTING_PAGE_LIMIT: u32 = 10;

/// Endpoint set for the remote service.
///
/// Defaults to the public tradingview.com endpoints; tests and staging
/// deployments can rebase every URL onto a local server with
/// [`TradingViewEndpoints::with_base`].
#[derive(Debug, Clone)]
pub struct TradingViewEndpoints {
    /// Identity search: `GET {username_hint}?s=<username>`.
    pub username_hint: String,
    /// Grantee listing: `POST {list_users}?limit=N&order_by=-created`.
    pub list_users: String,
    /// Grant creation: `POST {add_access}`.
    pub add_access: String,
    /// Grant expiration modification: `POST {modify_access}`.
    pub modify_access: String,
    /// Grant removal: `POST {remove_access}`.
    pub remove_access: String,
    /// Session probe: `GET {session_probe}`.
    pub session_probe: String,
}

impl Default for TradingViewEndpoints {
    fn default() -> Self {
        Self::with_base("https://www.tradingview.com")
    }
}

impl TradingViewEndpoints {
    /// Builds the endpoint set rooted at `base` (no trailing slash).
    #[must_use]
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            username_hint: format!("{base}/username_hint/"),
            list_users: format!("{base}/pine_perm/list_users/"),
            add_access: format!("{base}/pine_perm/add/"),
            modify_access: format!("{base}/pine_perm/modify_user_expiration/"),
            remove_access: format!("{base}/pine_perm/remove/"),
            session_probe: format!("{base}/tvcoins/"),
        }
    }
}

/// Account details returned by the session probe.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionProfile {
    /// Username the session belongs to.
    #[serde(rename = "link", default)]
    pub username: String,
    /// Partner tier reported by the remote.
    #[serde(rename = "partner_status", default)]
    pub partner_status: i64,
    /// Affiliate id, when the account has one.
    #[serde(rename = "aff_id", default)]
    pub affiliate_id: i64,
    /// Fiat balance of the partner account.
    #[serde(rename = "partner_fiat_balance", default)]
    pub fiat_balance: f64,
}

#[derive(Deserialize)]
struct HintEntry {
    username: String,
}

#[derive(Deserialize)]
struct GranteePage {
    results: Vec<GranteeEntry>,
}

#[derive(Deserialize)]
struct GranteeEntry {
    username: String,
    expiration: Option<String>,
}

/// Production TradingView adapter.
///
/// Holds no mutable state beyond its static credentials: one instance can
/// be shared across concurrent callers, serializing only at the transport
/// layer's discretion.
pub struct TradingViewAuthorizer {
    client: reqwest::blocking::Client,
    endpoints: TradingViewEndpoints,
    cookie_header: String,
}

impl TradingViewAuthorizer {
    /// Creates an adapter against the default public endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unavailable`] when the HTTP client cannot be
    /// initialized.
    pub fn new(credentials: &SessionCredentials) -> Result<Self, RemoteError> {
        Self::with_endpoints(credentials, TradingViewEndpoints::default())
    }

    /// Creates an adapter against an explicit endpoint set.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unavailable`] when the HTTP client cannot be
    /// initialized.
    pub fn with_endpoints(
        credentials: &SessionCredentials,
        endpoints: TradingViewEndpoints,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|error| RemoteError::Unavailable {
                status: None,
                message: error.to_string(),
            })?;

        let cookie_header = format!(
            "sessionid={}; sessionid_sign={}",
            credentials.session_id.expose_secret(),
            credentials.session_sign.expose_secret()
        );

        Ok(Self {
            client,
            endpoints,
            cookie_header,
        })
    }

    /// Probes the session by fetching account details.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Session`] when the credentials are rejected,
    /// [`RemoteError::Unavailable`] on transport failure, and
    /// [`RemoteError::Protocol`] when the account payload is unparseable.
    pub fn verify_session(&self) -> Result<SessionProfile, RemoteError> {
        let response = self
            .client
            .get(&self.endpoints.session_probe)
            .header("cookie", &self.cookie_header)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RemoteError::Session(format!(
                "session probe rejected with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(RemoteError::Unavailable {
                status: Some(status.as_u16()),
                message: "session probe failed".to_string(),
            });
        }

        let body = response.text().map_err(transport_error)?;
        serde_json::from_str(&body).map_err(|error| RemoteError::Protocol(error.to_string()))
    }
}

impl RemoteAuthorizer for TradingViewAuthorizer {
    fn validate_identity(&self, username: &str) -> Result<IdentityCheck, RemoteError> {
        let response = self
            .client
            .get(&self.endpoints.username_hint)
            .query(&[("s", username)])
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Unavailable {
                status: Some(status.as_u16()),
                message: "identity search failed".to_string(),
            });
        }

        let body = response.text().map_err(transport_error)?;
        parse_identity_response(&body, username)
    }

    fn lookup_grant(&self, username: &str, pine_id: &str) -> Result<GrantSnapshot, RemoteError> {
        let response = self
            .client
            .post(&self.endpoints.list_users)
            .query(&[
                ("limit", LISTING_PAGE_LIMIT.to_string()),
                ("order_by", "-created".to_string()),
            ])
            .header("origin", "https://www.tradingview.com")
            .header("cookie", &self.cookie_header)
            .form(&[("pine_id", pine_id), ("username", username)])
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        debug!(%status, pine_id, "grantee listing completed");
        if !status.is_success() {
            return Err(RemoteError::Unavailable {
                status: Some(status.as_u16()),
                message: "grantee listing failed".to_string(),
            });
        }

        let body = response.text().map_err(transport_error)?;
        parse_grantee_listing(&body, username, pine_id)
    }

    fn apply_grant(
        &self,
        snapshot: &GrantSnapshot,
        unit: ExtensionUnit,
        magnitude: u32,
    ) -> Result<GrantSnapshot, RemoteError> {
        let mut updated = snapshot.clone();
        updated.status = ApplyStatus::NotApplied;

        if snapshot.has_access && snapshot.expiration.is_none() {
            // The remote grant is already unbounded; a finite extension has
            // nothing to extend and lifetime has nothing to clear.
            return Ok(updated);
        }

        let mut form: Vec<(&str, String)> = vec![
            ("pine_id", snapshot.pine_id.clone()),
            ("username_recip", snapshot.username.clone()),
        ];

        if unit == ExtensionUnit::Lifetime {
            updated.expiration = None;
        } else {
            let base = snapshot.expiration.unwrap_or_else(Utc::now);
            let expiration = extend_expiration(base, unit, magnitude)?;
            if let Some(instant) = expiration {
                form.push(("expiration", format_wire_instant(instant)));
            }
            updated.expiration = expiration;
        }

        let endpoint = if snapshot.has_access {
            &self.endpoints.modify_access
        } else {
            &self.endpoints.add_access
        };

        let response = self
            .client
            .post(endpoint)
            .header("origin", "https://www.tradingview.com")
            .header("cookie", &self.cookie_header)
            .form(&form)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        debug!(%status, pine_id = %snapshot.pine_id, "grant mutation completed");
        if status == reqwest::StatusCode::OK || status == reqwest::StatusCode::CREATED {
            updated.has_access = true;
            updated.status = ApplyStatus::Applied;
        } else {
            updated.status = ApplyStatus::Failed;
        }
        Ok(updated)
    }

    fn remove_grant(&self, snapshot: &GrantSnapshot) -> Result<ApplyStatus, RemoteError> {
        let response = self
            .client
            .post(&self.endpoints.remove_access)
            .header("origin", "https://www.tradingview.com")
            .header("cookie", &self.cookie_header)
            .form(&[
                ("pine_id", snapshot.pine_id.as_str()),
                ("username_recip", snapshot.username.as_str()),
            ])
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        debug!(%status, pine_id = %snapshot.pine_id, "grant removal completed");
        if status == reqwest::StatusCode::OK {
            Ok(ApplyStatus::Applied)
        } else {
            Ok(ApplyStatus::Failed)
        }
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    RemoteError::Unavailable {
        status: error.status().map(|s| s.as_u16()),
        message: error.to_string(),
    }
}

/// Formats an instant the way the remote's form endpoints expect it.
fn format_wire_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Scans an identity-search response for a case-insensitive match.
fn parse_identity_response(body: &str, username: &str) -> Result<IdentityCheck, RemoteError> {
    let entries: Vec<HintEntry> =
        serde_json::from_str(body).map_err(|error| RemoteError::Protocol(error.to_string()))?;

    for entry in entries {
        if entry.username.eq_ignore_ascii_case(username) {
            return Ok(IdentityCheck {
                exists: true,
                canonical_username: entry.username,
            });
        }
    }
    Ok(IdentityCheck {
        exists: false,
        canonical_username: String::new(),
    })
}

/// Scans a grantee-listing page for a case-insensitive username match and
/// builds the corresponding snapshot.
fn parse_grantee_listing(
    body: &str,
    username: &str,
    pine_id: &str,
) -> Result<GrantSnapshot, RemoteError> {
    let page: GranteePage =
        serde_json::from_str(body).map_err(|error| RemoteError::Protocol(error.to_string()))?;

    let mut snapshot = GrantSnapshot::absent(username, pine_id);
    for entry in page.results {
        if !entry.username.eq_ignore_ascii_case(username) {
            continue;
        }
        snapshot.has_access = true;
        snapshot.expiration = match entry.expiration {
            Some(raw) => Some(parse_wire_instant(&raw)?),
            // Missing expiration means the remote grant is unbounded.
            None => None,
        };
    }
    Ok(snapshot)
}

/// Parses an expiration instant from the remote's listing payloads.
fn parse_wire_instant(raw: &str) -> Result<DateTime<Utc>, RemoteError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| RemoteError::Protocol(format!("bad expiration {raw:?}: {error}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn identity_response_matches_case_insensitively() {
        let body = r#"[
            {"username": "TraderAlice", "has_avatar": true},
            {"username": "traderalicia", "has_avatar": false}
        ]"#;

        let check = parse_identity_response(body, "traderalice").unwrap();
        assert!(check.exists);
        assert_eq!(check.canonical_username, "TraderAlice");

        let miss = parse_identity_response(body, "bob").unwrap();
        assert!(!miss.exists);
        assert!(miss.canonical_username.is_empty());
    }

    #[test]
    fn identity_response_rejects_non_json() {
        assert!(matches!(
            parse_identity_response("<html>rate limited</html>", "alice"),
            Err(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn grantee_listing_builds_bounded_snapshot() {
        let body = r#"{"results": [
            {"username": "Bob", "expiration": "2025-04-01T00:00:00.000Z"},
            {"username": "Alice", "expiration": "2025-03-01T00:00:00.000Z"}
        ]}"#;

        let snapshot = parse_grantee_listing(body, "alice", "PUB;1").unwrap();
        assert!(snapshot.has_access);
        assert_eq!(
            snapshot.expiration,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(snapshot.status, ApplyStatus::NotApplied);
    }

    #[test]
    fn grantee_listing_without_expiration_is_unbounded() {
        let body = r#"{"results": [{"username": "alice", "expiration": null}]}"#;
        let snapshot = parse_grantee_listing(body, "Alice", "PUB;1").unwrap();
        assert!(snapshot.has_access);
        assert_eq!(snapshot.expiration, None);
    }

    #[test]
    fn grantee_listing_miss_has_no_access() {
        let body = r#"{"results": []}"#;
        let snapshot = parse_grantee_listing(body, "alice", "PUB;1").unwrap();
        assert!(!snapshot.has_access);
    }

    #[test]
    fn wire_instant_round_trips_through_utc() {
        let instant = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let wire = format_wire_instant(instant);
        assert_eq!(parse_wire_instant(&wire).unwrap(), instant);

        // Offsets normalize to UTC.
        let offset = parse_wire_instant("2025-03-01T03:00:00.000+03:00").unwrap();
        assert_eq!(offset, Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn endpoints_rebase_onto_local_server() {
        let endpoints = TradingViewEndpoints::with_base("http://127.0.0.1:9999/");
        assert_eq!(
            endpoints.list_users,
            "http://127.0.0.1:9999/pine_perm/list_users/"
        );
        assert_eq!(endpoints.session_probe, "http://127.0.0.1:9999/tvcoins/");
    }
}
