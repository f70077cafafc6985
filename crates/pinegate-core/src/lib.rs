//! pinegate-core - Access-grant domain library
//!
//! Pure domain pieces of the pinegate access-grant synchronization system:
//! expiration arithmetic, the remote authorization adapter, and session
//! credential storage. Stateful orchestration (the SQLite ledger and the
//! sync engine) lives in `pinegate-daemon`.
//!
//! # Modules
//!
//! - [`duration`]: expiration-extension arithmetic with real calendar
//!   month/year units and an explicit `Lifetime` unit
//! - [`remote`]: [`remote::RemoteAuthorizer`] trait, the TradingView HTTP
//!   implementation, typed [`remote::GrantSnapshot`] values, and a
//!   scripted mock for tests
//! - [`credentials`]: session cookie persistence with secrecy-wrapped
//!   values

pub mod credentials;
pub mod duration;
pub mod remote;

pub use credentials::{CredentialError, CredentialFile, SessionCredentials};
pub use duration::{ExtensionUnit, InvalidDurationError, extend_expiration};
pub use remote::{
    ApplyStatus, GrantSnapshot, IdentityCheck, MockCall, MockRemoteAuthorizer, RemoteAuthorizer,
    RemoteError, SessionProfile, TradingViewAuthorizer, TradingViewEndpoints,
};
