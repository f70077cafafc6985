//! Persistent grant ledger backed by `SQLite`.
//!
//! The ledger is the administrative record of intent: which client holds
//! which grant to which asset, and for how long. It is advisory relative to
//! the remote authorization service (the actual enforcement point) — the
//! sync engine continually reconciles the two.
//!
//! # Schema
//!
//! Three tables with referential integrity:
//!
//! - `assets`: protected scripts keyed by their opaque publication id
//! - `clients`: remote usernames with contact metadata
//! - `grants`: one row per entitlement, foreign-keyed to both with
//!   `ON DELETE CASCADE`
//!
//! Grants are never physically deleted by the ledger API; lifecycle state
//! transitions (`active` → `expired` / `revoked`) are the only mutation,
//! and the `note` column accumulates an append-only audit trail.
//!
//! # Invariant
//!
//! At most one `active` grant may exist per `(client, asset)` pair. The
//! partial unique index `ux_grants_one_active` enforces this at the storage
//! layer, so concurrent writers racing on the reuse-vs-create decision
//! surface a [`LedgerError::Constraint`] that the engine retries as an
//! update.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced by ledger operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// Generic storage failure.
    #[error("ledger database error: {0}")]
    Database(String),

    /// A uniqueness or referential constraint was violated.
    #[error("ledger constraint violation: {0}")]
    Constraint(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity kind (`asset`, `client`, `grant`).
        entity: &'static str,
        /// Lookup key that missed.
        key: String,
    },

    /// A stored value could not be decoded (bad enum tag or timestamp).
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

fn map_sql(error: rusqlite::Error) -> LedgerError {
    match &error {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            LedgerError::Constraint(error.to_string())
        },
        _ => LedgerError::Database(error.to_string()),
    }
}

// =============================================================================
// Entity types
// =============================================================================

/// Lifecycle state shared by assets and clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Entity is in service.
    Active,
    /// Entity was soft-deleted.
    Inactive,
}

impl EntityState {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(LedgerError::Corrupt(format!("entity state {other:?}"))),
        }
    }
}

/// Lifecycle state of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    /// The grant currently entitles access.
    Active,
    /// The expiration passed and a sweep relabeled the row.
    Expired,
    /// An operator revoked the grant.
    Revoked,
}

impl GrantState {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "revoked" => Ok(Self::Revoked),
            other => Err(LedgerError::Corrupt(format!("grant state {other:?}"))),
        }
    }
}

/// Whether a grant is time-bounded or unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    /// Carries an expiration instant.
    Temporary,
    /// No expiration; access until revoked.
    Permanent,
}

impl GrantKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
        }
    }

    fn parse(raw: &str) -> Result<Self, LedgerError> {
        match raw {
            "temporary" => Ok(Self::Temporary),
            "permanent" => Ok(Self::Permanent),
            other => Err(LedgerError::Corrupt(format!("grant kind {other:?}"))),
        }
    }
}

/// A protected script an operator sells access to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Asset {
    /// Row id.
    pub id: i64,
    /// Opaque external publication id (unique).
    pub pub_id: String,
    /// Display name.
    pub name: String,
    /// Version tag.
    pub version: String,
    /// Price in cents.
    pub price_cents: i64,
    /// Free-text description.
    pub description: String,
    /// Lifecycle state.
    pub state: EntityState,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last metadata update.
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to register a new asset.
#[derive(Debug, Clone, Default)]
pub struct NewAsset {
    /// Opaque external publication id (unique).
    pub pub_id: String,
    /// Display name.
    pub name: String,
    /// Version tag.
    pub version: String,
    /// Price in cents.
    pub price_cents: i64,
    /// Free-text description.
    pub description: String,
}

/// An external identity entitled to access assets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Client {
    /// Row id.
    pub id: i64,
    /// Remote username (unique; stored in the remote's canonical spelling).
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Display name.
    pub full_name: String,
    /// Lifecycle state.
    pub state: EntityState,
    /// Operator notes.
    pub notes: String,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
}

/// Fields needed to register a new client.
#[derive(Debug, Clone, Default)]
pub struct NewClient {
    /// Remote username.
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Display name.
    pub full_name: String,
}

/// One entitlement row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grant {
    /// Row id (stable across renewals).
    pub id: i64,
    /// Owning client row.
    pub client_id: i64,
    /// Granted asset row.
    pub asset_id: i64,
    /// When the current entitlement period started.
    pub starts_at: DateTime<Utc>,
    /// Expiration instant; `None` means unbounded.
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub state: GrantState,
    /// Temporary or permanent.
    pub kind: GrantKind,
    /// Append-only audit annotation.
    pub note: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last state transition.
    pub updated_at: DateTime<Utc>,
}

/// A grant joined with its client and asset display fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantDetail {
    /// The grant row.
    #[serde(flatten)]
    pub grant: Grant,
    /// Client username.
    pub username: String,
    /// Client display name.
    pub full_name: String,
    /// Asset display name.
    pub asset_name: String,
    /// Asset publication id.
    pub pub_id: String,
}

/// A client joined with its active grant count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientAccessCount {
    /// The client row.
    #[serde(flatten)]
    pub client: Client,
    /// Number of `active` grants the client holds.
    pub active_grants: i64,
}

/// Per-asset usage row for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetUsage {
    /// Asset row id.
    pub asset_id: i64,
    /// Asset display name.
    pub name: String,
    /// Asset publication id.
    pub pub_id: String,
    /// Number of `active` grants on the asset.
    pub active_grants: i64,
}

/// Grant counts by state for one asset, with its most recent grants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetStats {
    /// The asset itself.
    pub asset: Asset,
    /// All grants ever issued.
    pub total_grants: i64,
    /// Currently active grants.
    pub active_grants: i64,
    /// Expired grants.
    pub expired_grants: i64,
    /// Revoked grants.
    pub revoked_grants: i64,
    /// Most recently created grants (up to 10).
    pub recent_grants: Vec<GrantDetail>,
}

/// Entity totals used by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerCounts {
    /// All assets.
    pub assets_total: i64,
    /// Assets in `active` state.
    pub assets_active: i64,
    /// All clients.
    pub clients_total: i64,
    /// Clients in `active` state.
    pub clients_active: i64,
    /// All grants ever issued.
    pub grants_total: i64,
    /// Grants in `active` state.
    pub grants_active: i64,
    /// Grants in `expired` state.
    pub grants_expired: i64,
    /// Grants in `revoked` state.
    pub grants_revoked: i64,
}

// =============================================================================
// Timestamp encoding
// =============================================================================

/// Timestamps are stored as fixed-width RFC 3339 UTC text with microsecond
/// precision, so lexicographic SQL comparison matches chronological order.
pub(crate) fn fmt_ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| LedgerError::Corrupt(format!("timestamp {raw:?}: {error}")))
}

fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    raw.map(parse_ts).transpose()
}

// =============================================================================
// SqliteLedger
// =============================================================================

const SCHEMA_SQL: &str = r"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS assets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pub_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        version TEXT NOT NULL DEFAULT '1.0',
        price_cents INTEGER NOT NULL DEFAULT 0,
        description TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS clients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL DEFAULT '',
        full_name TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL DEFAULT 'active',
        notes TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS grants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        client_id INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
        asset_id INTEGER NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
        starts_at TEXT NOT NULL,
        expires_at TEXT,
        state TEXT NOT NULL DEFAULT 'active',
        kind TEXT NOT NULL DEFAULT 'temporary',
        note TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- At most one active grant per (client, asset) pair.
    CREATE UNIQUE INDEX IF NOT EXISTS ux_grants_one_active
        ON grants(client_id, asset_id) WHERE state = 'active';

    CREATE INDEX IF NOT EXISTS idx_grants_client ON grants(client_id);
    CREATE INDEX IF NOT EXISTS idx_grants_asset ON grants(asset_id);
    CREATE INDEX IF NOT EXISTS idx_grants_state ON grants(state);
    CREATE INDEX IF NOT EXISTS idx_grants_expires ON grants(expires_at);
";

const GRANT_DETAIL_SELECT: &str = "
    SELECT g.id, g.client_id, g.asset_id, g.starts_at, g.expires_at,
           g.state, g.kind, g.note, g.created_at, g.updated_at,
           c.username, c.full_name, a.name, a.pub_id
    FROM grants g
    JOIN clients c ON c.id = g.client_id
    JOIN assets a ON a.id = g.asset_id
";

/// Durable ledger store over a single `SQLite` connection.
///
/// All mutations are single-row transactions; no cross-entity transaction
/// ever spans a remote adapter call. The connection is serialized behind a
/// mutex, which is the write-concurrency model the single-operator design
/// needs.
#[derive(Debug)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Opens (or creates) a ledger database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] when the file cannot be opened or
    /// the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_sql)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory ledger for tests.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(map_sql)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA_SQL).map_err(map_sql)?;
        info!("ledger schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Assets
    // -------------------------------------------------------------------------

    /// Registers a new asset and returns its row id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Constraint`] when `pub_id` already exists.
    pub fn insert_asset(&self, new: &NewAsset) -> Result<i64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO assets (pub_id, name, version, price_cents, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                &new.pub_id,
                &new.name,
                &new.version,
                new.price_cents,
                &new.description,
                &now
            ],
        )
        .map_err(map_sql)?;
        Ok(conn.last_insert_rowid())
    }

    /// Looks up an asset by row id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn asset_by_id(&self, id: i64) -> Result<Option<Asset>, LedgerError> {
        self.one_asset("id = ?1", params![id])
    }

    /// Looks up an asset by publication id (exact match).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn asset_by_pub_id(&self, pub_id: &str) -> Result<Option<Asset>, LedgerError> {
        self.one_asset("pub_id = ?1", params![pub_id])
    }

    fn one_asset(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Asset>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, pub_id, name, version, price_cents, description, state, created_at, updated_at
             FROM assets WHERE {predicate}"
        );
        let raw = conn
            .query_row(&sql, args, raw_asset_row)
            .optional()
            .map_err(map_sql)?;
        raw.map(asset_from_raw).transpose()
    }

    /// Lists all assets, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn list_assets(&self) -> Result<Vec<Asset>, LedgerError> {
        self.many_assets("ORDER BY id DESC", params![])
    }

    /// Lists assets in `active` state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn list_active_assets(&self) -> Result<Vec<Asset>, LedgerError> {
        self.many_assets("WHERE state = 'active' ORDER BY id DESC", params![])
    }

    /// Substring search over name, publication id, and description.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn search_assets(&self, term: &str) -> Result<Vec<Asset>, LedgerError> {
        let pattern = format!("%{term}%");
        self.many_assets(
            "WHERE name LIKE ?1 OR description LIKE ?1 OR pub_id LIKE ?1 ORDER BY name",
            params![pattern],
        )
    }

    fn many_assets(
        &self,
        suffix: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Asset>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, pub_id, name, version, price_cents, description, state, created_at, updated_at
             FROM assets {suffix}"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sql)?;
        let rows = stmt.query_map(args, raw_asset_row).map_err(map_sql)?;
        let mut assets = Vec::new();
        for row in rows {
            assets.push(asset_from_raw(row.map_err(map_sql)?)?);
        }
        Ok(assets)
    }

    /// Updates asset metadata in place.
    ///
    /// Returns false when the asset does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn update_asset_metadata(&self, id: i64, new: &NewAsset) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE assets
                 SET name = ?1, version = ?2, price_cents = ?3, description = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    &new.name,
                    &new.version,
                    new.price_cents,
                    &new.description,
                    fmt_ts(Utc::now()),
                    id
                ],
            )
            .map_err(map_sql)?;
        Ok(changed > 0)
    }

    /// Soft-deletes an asset (state becomes `inactive`).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn deactivate_asset(&self, id: i64) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE assets SET state = 'inactive', updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(Utc::now()), id],
            )
            .map_err(map_sql)?;
        Ok(changed > 0)
    }

    /// Returns grant counts by state plus the most recent grants for one
    /// asset, or `None` when the asset does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn asset_stats(&self, id: i64) -> Result<Option<AssetStats>, LedgerError> {
        let Some(asset) = self.asset_by_id(id)? else {
            return Ok(None);
        };

        let (total, active, expired, revoked) = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(state = 'active'), 0),
                        COALESCE(SUM(state = 'expired'), 0),
                        COALESCE(SUM(state = 'revoked'), 0)
                 FROM grants WHERE asset_id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .map_err(map_sql)?
        };

        let recent = self.many_grant_details(
            "WHERE g.asset_id = ?1 ORDER BY g.created_at DESC LIMIT 10",
            params![id],
        )?;

        Ok(Some(AssetStats {
            asset,
            total_grants: total,
            active_grants: active,
            expired_grants: expired,
            revoked_grants: revoked,
            recent_grants: recent,
        }))
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Registers a new client and returns its row id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Constraint`] when the username already exists.
    pub fn insert_client(&self, new: &NewClient) -> Result<i64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO clients (username, email, full_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![&new.username, &new.email, &new.full_name, fmt_ts(Utc::now())],
        )
        .map_err(map_sql)?;
        Ok(conn.last_insert_rowid())
    }

    /// Looks up a client by row id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn client_by_id(&self, id: i64) -> Result<Option<Client>, LedgerError> {
        self.one_client("id = ?1", params![id])
    }

    /// Looks up a client by username (exact match on the stored canonical
    /// spelling).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn client_by_username(&self, username: &str) -> Result<Option<Client>, LedgerError> {
        self.one_client("username = ?1", params![username])
    }

    fn one_client(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Client>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, username, email, full_name, state, notes, created_at
             FROM clients WHERE {predicate}"
        );
        let raw = conn
            .query_row(&sql, args, raw_client_row)
            .optional()
            .map_err(map_sql)?;
        raw.map(client_from_raw).transpose()
    }

    /// Lists all clients, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn list_clients(&self) -> Result<Vec<Client>, LedgerError> {
        self.many_clients("ORDER BY id DESC", params![])
    }

    /// Lists clients in `active` state.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn list_active_clients(&self) -> Result<Vec<Client>, LedgerError> {
        self.many_clients("WHERE state = 'active' ORDER BY id DESC", params![])
    }

    /// Substring search over username, email, and full name.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn search_clients(&self, term: &str) -> Result<Vec<Client>, LedgerError> {
        let pattern = format!("%{term}%");
        self.many_clients(
            "WHERE username LIKE ?1 OR email LIKE ?1 OR full_name LIKE ?1 ORDER BY username",
            params![pattern],
        )
    }

    fn many_clients(
        &self,
        suffix: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Client>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, username, email, full_name, state, notes, created_at
             FROM clients {suffix}"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sql)?;
        let rows = stmt.query_map(args, raw_client_row).map_err(map_sql)?;
        let mut clients = Vec::new();
        for row in rows {
            clients.push(client_from_raw(row.map_err(map_sql)?)?);
        }
        Ok(clients)
    }

    /// Lists clients with their active grant counts, ordered by username.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn clients_with_active_grant_counts(&self) -> Result<Vec<ClientAccessCount>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.username, c.email, c.full_name, c.state, c.notes, c.created_at,
                        COUNT(g.id)
                 FROM clients c
                 LEFT JOIN grants g ON g.client_id = c.id AND g.state = 'active'
                 GROUP BY c.id
                 ORDER BY c.username",
            )
            .map_err(map_sql)?;
        let rows = stmt
            .query_map([], |row| Ok((raw_client_row(row)?, row.get::<_, i64>(7)?)))
            .map_err(map_sql)?;
        let mut out = Vec::new();
        for row in rows {
            let (raw, count) = row.map_err(map_sql)?;
            out.push(ClientAccessCount {
                client: client_from_raw(raw)?,
                active_grants: count,
            });
        }
        Ok(out)
    }

    /// Updates client contact metadata.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn update_client(
        &self,
        id: i64,
        email: &str,
        full_name: &str,
        notes: &str,
    ) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE clients SET email = ?1, full_name = ?2, notes = ?3 WHERE id = ?4",
                params![email, full_name, notes, id],
            )
            .map_err(map_sql)?;
        Ok(changed > 0)
    }

    /// Soft-deletes a client (state becomes `inactive`).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn deactivate_client(&self, id: i64) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE clients SET state = 'inactive' WHERE id = ?1",
                params![id],
            )
            .map_err(map_sql)?;
        Ok(changed > 0)
    }

    // -------------------------------------------------------------------------
    // Grants
    // -------------------------------------------------------------------------

    /// Returns the single `active` grant for a `(client, asset)` pair, if
    /// one exists.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn active_grant_for(
        &self,
        client_id: i64,
        asset_id: i64,
    ) -> Result<Option<Grant>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT id, client_id, asset_id, starts_at, expires_at, state, kind, note,
                        created_at, updated_at
                 FROM grants
                 WHERE client_id = ?1 AND asset_id = ?2 AND state = 'active'",
                params![client_id, asset_id],
                raw_grant_row,
            )
            .optional()
            .map_err(map_sql)?;
        raw.map(grant_from_raw).transpose()
    }

    /// Returns the most recent grant row for a `(client, asset)` pair in
    /// any state, preferring the `active` row when one exists. This is the
    /// row a fresh grant request reuses, so a pair keeps one stable grant
    /// identity across expiry and revocation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn latest_grant_for(
        &self,
        client_id: i64,
        asset_id: i64,
    ) -> Result<Option<Grant>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT id, client_id, asset_id, starts_at, expires_at, state, kind, note,
                        created_at, updated_at
                 FROM grants
                 WHERE client_id = ?1 AND asset_id = ?2
                 ORDER BY (state = 'active') DESC, updated_at DESC, id DESC
                 LIMIT 1",
                params![client_id, asset_id],
                raw_grant_row,
            )
            .optional()
            .map_err(map_sql)?;
        raw.map(grant_from_raw).transpose()
    }

    /// Looks up a grant by row id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn grant_by_id(&self, id: i64) -> Result<Option<Grant>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT id, client_id, asset_id, starts_at, expires_at, state, kind, note,
                        created_at, updated_at
                 FROM grants WHERE id = ?1",
                params![id],
                raw_grant_row,
            )
            .optional()
            .map_err(map_sql)?;
        raw.map(grant_from_raw).transpose()
    }

    /// Inserts a new `active` grant row and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Constraint`] when an `active` grant already
    /// exists for the pair (the at-most-one invariant) or a referenced
    /// entity is missing.
    pub fn insert_grant(
        &self,
        client_id: i64,
        asset_id: i64,
        starts_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        kind: GrantKind,
        note: &str,
    ) -> Result<i64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO grants (client_id, asset_id, starts_at, expires_at, kind, note,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                client_id,
                asset_id,
                fmt_ts(starts_at),
                expires_at.map(fmt_ts),
                kind.as_str(),
                note,
                &now
            ],
        )
        .map_err(map_sql)?;
        debug!(client_id, asset_id, "grant row inserted");
        Ok(conn.last_insert_rowid())
    }

    /// Renews a grant in place, preserving its row id, and appends
    /// `note_line` to the audit annotation. The row re-enters `active`
    /// state, so renewals out of a terminal state reuse the same row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] when the grant does not exist and
    /// [`LedgerError::Constraint`] when reactivating it would violate the
    /// at-most-one-active invariant.
    pub fn renew_grant(
        &self,
        grant_id: i64,
        starts_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        kind: GrantKind,
        note_line: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE grants
                 SET state = 'active', starts_at = ?1, expires_at = ?2, kind = ?3,
                     note = CASE WHEN note = '' THEN ?4 ELSE note || char(10) || ?4 END,
                     updated_at = ?5
                 WHERE id = ?6",
                params![
                    fmt_ts(starts_at),
                    expires_at.map(fmt_ts),
                    kind.as_str(),
                    note_line,
                    fmt_ts(Utc::now()),
                    grant_id
                ],
            )
            .map_err(map_sql)?;
        if changed == 0 {
            return Err(LedgerError::NotFound {
                entity: "grant",
                key: grant_id.to_string(),
            });
        }
        debug!(grant_id, "grant renewed in place");
        Ok(())
    }

    /// Transitions an `active` grant to `revoked`, appending `note_line`.
    ///
    /// Returns false when the grant is not currently active.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn revoke_grant(&self, grant_id: i64, note_line: &str) -> Result<bool, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE grants
                 SET state = 'revoked',
                     note = CASE WHEN note = '' THEN ?1 ELSE note || char(10) || ?1 END,
                     updated_at = ?2
                 WHERE id = ?3 AND state = 'active'",
                params![note_line, fmt_ts(Utc::now()), grant_id],
            )
            .map_err(map_sql)?;
        Ok(changed > 0)
    }

    /// Lists a client's grants with asset detail, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn grants_for_client(&self, client_id: i64) -> Result<Vec<GrantDetail>, LedgerError> {
        self.many_grant_details(
            "WHERE g.client_id = ?1 ORDER BY g.created_at DESC",
            params![client_id],
        )
    }

    /// Lists an asset's grants with client detail, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn grants_for_asset(&self, asset_id: i64) -> Result<Vec<GrantDetail>, LedgerError> {
        self.many_grant_details(
            "WHERE g.asset_id = ?1 ORDER BY g.created_at DESC",
            params![asset_id],
        )
    }

    /// Lists all `active` grants, soonest expiration first; unbounded
    /// grants sort last.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn list_active_grants(&self) -> Result<Vec<GrantDetail>, LedgerError> {
        self.many_grant_details(
            "WHERE g.state = 'active'
             ORDER BY g.expires_at IS NULL, g.expires_at ASC",
            params![],
        )
    }

    /// Lists `active` grants whose expiration falls within `days` of `now`
    /// (inclusive), soonest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn grants_expiring_within(
        &self,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<Vec<GrantDetail>, LedgerError> {
        let deadline = now + Duration::days(i64::from(days));
        self.many_grant_details(
            "WHERE g.state = 'active' AND g.expires_at IS NOT NULL AND g.expires_at <= ?1
             ORDER BY g.expires_at ASC",
            params![fmt_ts(deadline)],
        )
    }

    /// Lists the most recently created grants.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn recent_grants(&self, limit: u32) -> Result<Vec<GrantDetail>, LedgerError> {
        self.many_grant_details("ORDER BY g.created_at DESC LIMIT ?1", params![limit])
    }

    fn many_grant_details(
        &self,
        suffix: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<GrantDetail>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{GRANT_DETAIL_SELECT} {suffix}");
        let mut stmt = conn.prepare(&sql).map_err(map_sql)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    raw_grant_row(row)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, String>(13)?,
                ))
            })
            .map_err(map_sql)?;
        let mut details = Vec::new();
        for row in rows {
            let (raw, username, full_name, asset_name, pub_id) = row.map_err(map_sql)?;
            details.push(GrantDetail {
                grant: grant_from_raw(raw)?,
                username,
                full_name,
                asset_name,
                pub_id,
            });
        }
        Ok(details)
    }

    /// Transitions every `active` grant whose expiration is at or before
    /// `now` to `expired` and returns the count. Inclusive boundary: a
    /// grant expiring exactly at `now` transitions.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let line = format!("{} expired by sweep", fmt_ts(now));
        let changed = conn
            .execute(
                "UPDATE grants
                 SET state = 'expired',
                     note = CASE WHEN note = '' THEN ?1 ELSE note || char(10) || ?1 END,
                     updated_at = ?2
                 WHERE state = 'active' AND expires_at IS NOT NULL AND expires_at <= ?2",
                params![line, fmt_ts(now)],
            )
            .map_err(map_sql)?;
        if changed > 0 {
            info!(count = changed, "expired grants swept");
        }
        Ok(changed as u64)
    }

    /// Returns the top `limit` active assets by active grant count.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn top_assets_by_active_grants(&self, limit: u32) -> Result<Vec<AssetUsage>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT a.id, a.name, a.pub_id, COUNT(g.id) AS active_grants
                 FROM assets a
                 LEFT JOIN grants g ON g.asset_id = a.id AND g.state = 'active'
                 WHERE a.state = 'active'
                 GROUP BY a.id, a.name, a.pub_id
                 ORDER BY active_grants DESC, a.name
                 LIMIT ?1",
            )
            .map_err(map_sql)?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AssetUsage {
                    asset_id: row.get(0)?,
                    name: row.get(1)?,
                    pub_id: row.get(2)?,
                    active_grants: row.get(3)?,
                })
            })
            .map_err(map_sql)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sql)
    }

    /// Returns entity totals for the dashboard.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on query failure.
    pub fn counts(&self) -> Result<LedgerCounts, LedgerError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM assets),
                (SELECT COUNT(*) FROM assets WHERE state = 'active'),
                (SELECT COUNT(*) FROM clients),
                (SELECT COUNT(*) FROM clients WHERE state = 'active'),
                (SELECT COUNT(*) FROM grants),
                (SELECT COUNT(*) FROM grants WHERE state = 'active'),
                (SELECT COUNT(*) FROM grants WHERE state = 'expired'),
                (SELECT COUNT(*) FROM grants WHERE state = 'revoked')",
            [],
            |row| {
                Ok(LedgerCounts {
                    assets_total: row.get(0)?,
                    assets_active: row.get(1)?,
                    clients_total: row.get(2)?,
                    clients_active: row.get(3)?,
                    grants_total: row.get(4)?,
                    grants_active: row.get(5)?,
                    grants_expired: row.get(6)?,
                    grants_revoked: row.get(7)?,
                })
            },
        )
        .map_err(map_sql)
    }
}

// =============================================================================
// Row decoding
// =============================================================================

type RawAsset = (
    i64,
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    String,
);

fn raw_asset_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAsset> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn asset_from_raw(raw: RawAsset) -> Result<Asset, LedgerError> {
    let (id, pub_id, name, version, price_cents, description, state, created_at, updated_at) = raw;
    Ok(Asset {
        id,
        pub_id,
        name,
        version,
        price_cents,
        description,
        state: EntityState::parse(&state)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

type RawClient = (i64, String, String, String, String, String, String);

fn raw_client_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawClient> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn client_from_raw(raw: RawClient) -> Result<Client, LedgerError> {
    let (id, username, email, full_name, state, notes, created_at) = raw;
    Ok(Client {
        id,
        username,
        email,
        full_name,
        state: EntityState::parse(&state)?,
        notes,
        created_at: parse_ts(&created_at)?,
    })
}

type RawGrant = (
    i64,
    i64,
    i64,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
);

fn raw_grant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawGrant> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn grant_from_raw(raw: RawGrant) -> Result<Grant, LedgerError> {
    let (id, client_id, asset_id, starts_at, expires_at, state, kind, note, created_at, updated_at) =
        raw;
    Ok(Grant {
        id,
        client_id,
        asset_id,
        starts_at: parse_ts(&starts_at)?,
        expires_at: parse_opt_ts(expires_at.as_deref())?,
        state: GrantState::parse(&state)?,
        kind: GrantKind::parse(&kind)?,
        note,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ledger() -> SqliteLedger {
        SqliteLedger::open_in_memory().unwrap()
    }

    fn seed_pair(ledger: &SqliteLedger) -> (i64, i64) {
        let asset_id = ledger
            .insert_asset(&NewAsset {
                pub_id: "PUB;alpha".to_string(),
                name: "Alpha Momentum".to_string(),
                version: "2.1".to_string(),
                price_cents: 4_900,
                description: "momentum oscillator".to_string(),
            })
            .unwrap();
        let client_id = ledger
            .insert_client(&NewClient {
                username: "TraderAlice".to_string(),
                email: "alice@example.com".to_string(),
                full_name: "Alice".to_string(),
            })
            .unwrap();
        (client_id, asset_id)
    }

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn asset_round_trip_and_exact_pub_id_lookup() {
        let ledger = ledger();
        let (_, asset_id) = seed_pair(&ledger);

        let asset = ledger.asset_by_pub_id("PUB;alpha").unwrap().unwrap();
        assert_eq!(asset.id, asset_id);
        assert_eq!(asset.name, "Alpha Momentum");
        assert_eq!(asset.state, EntityState::Active);
        assert_eq!(asset.price_cents, 4_900);

        // Exact match only: substring keys miss.
        assert!(ledger.asset_by_pub_id("PUB;al").unwrap().is_none());
    }

    #[test]
    fn duplicate_pub_id_is_a_constraint_violation() {
        let ledger = ledger();
        seed_pair(&ledger);
        let err = ledger
            .insert_asset(&NewAsset {
                pub_id: "PUB;alpha".to_string(),
                name: "Duplicate".to_string(),
                ..NewAsset::default()
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::Constraint(_)));
    }

    #[test]
    fn search_matches_name_description_and_pub_id() {
        let ledger = ledger();
        seed_pair(&ledger);

        assert_eq!(ledger.search_assets("momentum").unwrap().len(), 1);
        assert_eq!(ledger.search_assets("oscillator").unwrap().len(), 1);
        assert_eq!(ledger.search_assets("PUB;").unwrap().len(), 1);
        assert!(ledger.search_assets("nothing").unwrap().is_empty());

        assert_eq!(ledger.search_clients("alice@").unwrap().len(), 1);
    }

    #[test]
    fn deactivated_asset_leaves_active_listing() {
        let ledger = ledger();
        let (_, asset_id) = seed_pair(&ledger);

        assert_eq!(ledger.list_active_assets().unwrap().len(), 1);
        assert!(ledger.deactivate_asset(asset_id).unwrap());
        assert!(ledger.list_active_assets().unwrap().is_empty());
        assert_eq!(ledger.list_assets().unwrap().len(), 1);
    }

    #[test]
    fn at_most_one_active_grant_per_pair() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let start = at(2025, 6, 1, 0);

        ledger
            .insert_grant(
                client_id,
                asset_id,
                start,
                Some(at(2025, 7, 1, 0)),
                GrantKind::Temporary,
                "initial",
            )
            .unwrap();

        let err = ledger
            .insert_grant(
                client_id,
                asset_id,
                start,
                Some(at(2025, 8, 1, 0)),
                GrantKind::Temporary,
                "duplicate",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Constraint(_)));
    }

    #[test]
    fn renew_preserves_row_id_and_appends_note() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);

        let id = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                Some(at(2025, 7, 1, 0)),
                GrantKind::Temporary,
                "granted 30 days",
            )
            .unwrap();

        ledger
            .renew_grant(
                id,
                at(2025, 6, 15, 0),
                Some(at(2025, 7, 15, 0)),
                GrantKind::Temporary,
                "renewed 30 days",
            )
            .unwrap();

        let grant = ledger.grant_by_id(id).unwrap().unwrap();
        assert_eq!(grant.state, GrantState::Active);
        assert_eq!(grant.expires_at, Some(at(2025, 7, 15, 0)));
        assert_eq!(grant.note, "granted 30 days\nrenewed 30 days");

        // Still exactly one grant row for the pair.
        assert_eq!(ledger.grants_for_client(client_id).unwrap().len(), 1);
    }

    #[test]
    fn renew_reactivates_a_terminal_row() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);

        let id = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                Some(at(2025, 6, 2, 0)),
                GrantKind::Temporary,
                "short",
            )
            .unwrap();
        assert!(ledger.revoke_grant(id, "revoked manually").unwrap());
        assert!(ledger.active_grant_for(client_id, asset_id).unwrap().is_none());

        ledger
            .renew_grant(id, at(2025, 6, 3, 0), None, GrantKind::Permanent, "re-granted")
            .unwrap();
        let grant = ledger.active_grant_for(client_id, asset_id).unwrap().unwrap();
        assert_eq!(grant.id, id);
        assert_eq!(grant.kind, GrantKind::Permanent);
        assert_eq!(grant.expires_at, None);
    }

    #[test]
    fn latest_grant_finds_terminal_rows_and_prefers_active() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        assert!(ledger.latest_grant_for(client_id, asset_id).unwrap().is_none());

        let first = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                Some(at(2025, 6, 2, 0)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        ledger.revoke_grant(first, "done").unwrap();

        // No active row: the terminal row is still found.
        let latest = ledger.latest_grant_for(client_id, asset_id).unwrap().unwrap();
        assert_eq!(latest.id, first);
        assert_eq!(latest.state, GrantState::Revoked);

        // With both a terminal and an active row, the active one wins.
        let second = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 3, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();
        let latest = ledger.latest_grant_for(client_id, asset_id).unwrap().unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.state, GrantState::Active);
    }

    #[test]
    fn revoke_requires_an_active_row() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let id = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();

        assert!(ledger.revoke_grant(id, "first").unwrap());
        // Second revoke is a no-op.
        assert!(!ledger.revoke_grant(id, "second").unwrap());

        let grant = ledger.grant_by_id(id).unwrap().unwrap();
        assert_eq!(grant.state, GrantState::Revoked);
        assert_eq!(grant.note, "first");
    }

    #[test]
    fn sweep_boundary_is_inclusive_at_now() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let other_client = ledger
            .insert_client(&NewClient {
                username: "bob".to_string(),
                ..NewClient::default()
            })
            .unwrap();

        let now = at(2025, 6, 15, 12);
        // Expires exactly at now: must transition.
        ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                Some(now),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        // One microsecond in the future: must survive.
        ledger
            .insert_grant(
                other_client,
                asset_id,
                at(2025, 6, 1, 0),
                Some(now + Duration::microseconds(1)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();

        assert_eq!(ledger.sweep_expired(now).unwrap(), 1);

        let swept = ledger.active_grant_for(client_id, asset_id).unwrap();
        assert!(swept.is_none());
        let survivor = ledger.active_grant_for(other_client, asset_id).unwrap();
        assert!(survivor.is_some());

        // Sweeping again finds nothing new.
        assert_eq!(ledger.sweep_expired(now).unwrap(), 0);
    }

    #[test]
    fn sweep_ignores_unbounded_grants() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2020, 1, 1, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();

        assert_eq!(ledger.sweep_expired(at(2030, 1, 1, 0)).unwrap(), 0);
    }

    #[test]
    fn expiring_within_orders_by_soonest() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let bob = ledger
            .insert_client(&NewClient {
                username: "bob".to_string(),
                ..NewClient::default()
            })
            .unwrap();
        let carol = ledger
            .insert_client(&NewClient {
                username: "carol".to_string(),
                ..NewClient::default()
            })
            .unwrap();

        let now = at(2025, 6, 1, 0);
        ledger
            .insert_grant(
                client_id,
                asset_id,
                now,
                Some(now + Duration::days(6)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        ledger
            .insert_grant(
                bob,
                asset_id,
                now,
                Some(now + Duration::days(2)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        // Outside the horizon.
        ledger
            .insert_grant(
                carol,
                asset_id,
                now,
                Some(now + Duration::days(30)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();

        let expiring = ledger.grants_expiring_within(now, 7).unwrap();
        assert_eq!(expiring.len(), 2);
        assert_eq!(expiring[0].username, "bob");
        assert_eq!(expiring[1].username, "TraderAlice");
    }

    #[test]
    fn active_grant_listing_sorts_unbounded_last() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let bob = ledger
            .insert_client(&NewClient {
                username: "bob".to_string(),
                ..NewClient::default()
            })
            .unwrap();

        ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();
        ledger
            .insert_grant(
                bob,
                asset_id,
                at(2025, 6, 1, 0),
                Some(at(2025, 7, 1, 0)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();

        let active = ledger.list_active_grants().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].username, "bob");
        assert_eq!(active[1].username, "TraderAlice");
    }

    #[test]
    fn deleting_a_client_cascades_its_grants() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();

        {
            let conn = ledger.conn.lock().unwrap();
            conn.execute("DELETE FROM clients WHERE id = ?1", params![client_id])
                .unwrap();
        }

        assert_eq!(ledger.counts().unwrap().grants_total, 0);
    }

    #[test]
    fn grant_referencing_missing_entities_is_rejected() {
        let ledger = ledger();
        let err = ledger
            .insert_grant(99, 98, at(2025, 6, 1, 0), None, GrantKind::Permanent, "")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Constraint(_)));
    }

    #[test]
    fn counts_and_top_assets_aggregate_by_state() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let beta = ledger
            .insert_asset(&NewAsset {
                pub_id: "PUB;beta".to_string(),
                name: "Beta Bands".to_string(),
                ..NewAsset::default()
            })
            .unwrap();

        let id = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                Some(at(2025, 6, 2, 0)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        ledger.revoke_grant(id, "done").unwrap();
        ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 3, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();
        ledger
            .insert_grant(
                client_id,
                beta,
                at(2025, 6, 3, 0),
                None,
                GrantKind::Permanent,
                "",
            )
            .unwrap();

        let counts = ledger.counts().unwrap();
        assert_eq!(counts.assets_total, 2);
        assert_eq!(counts.clients_total, 1);
        assert_eq!(counts.grants_total, 3);
        assert_eq!(counts.grants_active, 2);
        assert_eq!(counts.grants_revoked, 1);

        let top = ledger.top_assets_by_active_grants(5).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].active_grants, 1);

        let counts_by_client = ledger.clients_with_active_grant_counts().unwrap();
        assert_eq!(counts_by_client.len(), 1);
        assert_eq!(counts_by_client[0].active_grants, 2);
    }

    #[test]
    fn asset_stats_reports_per_state_counts() {
        let ledger = ledger();
        let (client_id, asset_id) = seed_pair(&ledger);
        let id = ledger
            .insert_grant(
                client_id,
                asset_id,
                at(2025, 6, 1, 0),
                Some(at(2025, 6, 2, 0)),
                GrantKind::Temporary,
                "",
            )
            .unwrap();
        ledger.sweep_expired(at(2025, 6, 2, 0)).unwrap();
        ledger
            .renew_grant(id, at(2025, 6, 5, 0), None, GrantKind::Permanent, "again")
            .unwrap();

        let stats = ledger.asset_stats(asset_id).unwrap().unwrap();
        assert_eq!(stats.total_grants, 1);
        assert_eq!(stats.active_grants, 1);
        assert_eq!(stats.expired_grants, 0);
        assert_eq!(stats.recent_grants.len(), 1);

        assert!(ledger.asset_stats(404).unwrap().is_none());
    }
}
