//! Expiration-extension arithmetic for access grants.
//!
//! The remote authorization service stores an expiration instant per grant.
//! Renewals advance that instant by a `(unit, magnitude)` extension, where
//! month and year units follow real calendar arithmetic rather than fixed
//! 30/365-day approximations. The `Lifetime` unit clears the expiration
//! entirely; an unbounded grant carries no instant at all.
//!
//! All functions here are pure: no clocks, no I/O.

use chrono::{DateTime, Days, Months, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when an extension descriptor is malformed or the
/// resulting instant is unrepresentable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidDurationError {
    /// The unit mnemonic is not one of `d`, `w`, `M`, `y`, `L`.
    #[error("unknown extension unit: {0:?}")]
    UnknownUnit(String),

    /// A finite unit was given a zero magnitude.
    #[error("extension magnitude must be positive for unit {unit}")]
    ZeroMagnitude {
        /// The finite unit that was requested.
        unit: ExtensionUnit,
    },

    /// The extended instant falls outside the representable range.
    #[error("extension of {magnitude} {unit} from {current} is out of range")]
    OutOfRange {
        /// The expiration the extension started from.
        current: DateTime<Utc>,
        /// The finite unit that was requested.
        unit: ExtensionUnit,
        /// The requested magnitude.
        magnitude: u32,
    },
}

/// A calendar unit by which a grant expiration can be advanced.
///
/// `Days` and `CalendarMonths` are deliberately distinct units: a 30-day
/// extension and a one-month extension land on different instants for most
/// of the year, and the caller chooses which one it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionUnit {
    /// Fixed 24-hour days.
    Days,
    /// Fixed 7-day weeks.
    Weeks,
    /// Calendar months (e.g. Jan 31 + 1 month = Feb 28/29).
    CalendarMonths,
    /// Calendar years.
    Years,
    /// No expiration: the grant becomes unbounded.
    Lifetime,
}

impl ExtensionUnit {
    /// Parses the single-letter wire mnemonic used by renewal requests.
    ///
    /// Accepted mnemonics: `d` (days), `w`/`W` (weeks), `M` (calendar
    /// months), `y`/`Y` (years), `L` (lifetime). `m` is rejected rather
    /// than guessed at: minutes were never a valid grant unit and a
    /// lowercase month mnemonic would silently shadow them.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidDurationError::UnknownUnit`] for anything else.
    pub fn parse(mnemonic: &str) -> Result<Self, InvalidDurationError> {
        match mnemonic {
            "d" | "D" => Ok(Self::Days),
            "w" | "W" => Ok(Self::Weeks),
            "M" => Ok(Self::CalendarMonths),
            "y" | "Y" => Ok(Self::Years),
            "L" => Ok(Self::Lifetime),
            other => Err(InvalidDurationError::UnknownUnit(other.to_string())),
        }
    }

    /// Returns the canonical wire mnemonic for this unit.
    #[must_use]
    pub const fn as_mnemonic(self) -> &'static str {
        match self {
            Self::Days => "d",
            Self::Weeks => "w",
            Self::CalendarMonths => "M",
            Self::Years => "y",
            Self::Lifetime => "L",
        }
    }
}

impl std::fmt::Display for ExtensionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Days => "days",
            Self::Weeks => "weeks",
            Self::CalendarMonths => "calendar months",
            Self::Years => "years",
            Self::Lifetime => "lifetime",
        };
        f.write_str(label)
    }
}

/// Computes the new expiration for a grant currently expiring at `current`.
///
/// Returns `Ok(None)` for [`ExtensionUnit::Lifetime`] regardless of input:
/// the grant becomes unbounded and no arithmetic occurs. For finite units
/// the result is `current` advanced by `magnitude` units, using calendar
/// month/year arithmetic.
///
/// # Errors
///
/// Returns [`InvalidDurationError::ZeroMagnitude`] when a finite unit is
/// paired with a zero magnitude, and [`InvalidDurationError::OutOfRange`]
/// when the advanced instant cannot be represented.
pub fn extend_expiration(
    current: DateTime<Utc>,
    unit: ExtensionUnit,
    magnitude: u32,
) -> Result<Option<DateTime<Utc>>, InvalidDurationError> {
    if unit == ExtensionUnit::Lifetime {
        return Ok(None);
    }
    if magnitude == 0 {
        return Err(InvalidDurationError::ZeroMagnitude { unit });
    }

    let out_of_range = || InvalidDurationError::OutOfRange {
        current,
        unit,
        magnitude,
    };

    let advanced = match unit {
        ExtensionUnit::Days => current.checked_add_days(Days::new(u64::from(magnitude))),
        ExtensionUnit::Weeks => current.checked_add_days(Days::new(7 * u64::from(magnitude))),
        ExtensionUnit::CalendarMonths => current.checked_add_months(Months::new(magnitude)),
        ExtensionUnit::Years => {
            let months = magnitude.checked_mul(12).ok_or_else(out_of_range)?;
            current.checked_add_months(Months::new(months))
        },
        ExtensionUnit::Lifetime => unreachable!("handled above"),
    };

    advanced.map(Some).ok_or_else(out_of_range)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn lifetime_always_clears_expiration() {
        let base = at(2025, 6, 15);
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Lifetime, 0).unwrap(),
            None
        );
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Lifetime, 999).unwrap(),
            None
        );
    }

    #[test]
    fn days_and_weeks_are_fixed_length() {
        let base = at(2025, 6, 15);
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Days, 30).unwrap(),
            Some(at(2025, 7, 15))
        );
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Weeks, 2).unwrap(),
            Some(at(2025, 6, 29))
        );
    }

    #[test]
    fn calendar_month_is_not_thirty_days() {
        // Jan 31 + 1 month clamps to Feb 28; 30 days lands on Mar 2.
        let base = at(2025, 1, 31);
        assert_eq!(
            extend_expiration(base, ExtensionUnit::CalendarMonths, 1).unwrap(),
            Some(at(2025, 2, 28))
        );
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Days, 30).unwrap(),
            Some(at(2025, 3, 2))
        );
    }

    #[test]
    fn leap_year_february_is_preserved() {
        let base = at(2024, 1, 31);
        assert_eq!(
            extend_expiration(base, ExtensionUnit::CalendarMonths, 1).unwrap(),
            Some(at(2024, 2, 29))
        );
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Years, 1).unwrap(),
            Some(at(2025, 1, 31))
        );
    }

    #[test]
    fn zero_magnitude_is_rejected_for_finite_units() {
        let base = at(2025, 6, 15);
        assert_eq!(
            extend_expiration(base, ExtensionUnit::Days, 0),
            Err(InvalidDurationError::ZeroMagnitude {
                unit: ExtensionUnit::Days
            })
        );
    }

    #[test]
    fn mnemonic_round_trip() {
        for unit in [
            ExtensionUnit::Days,
            ExtensionUnit::Weeks,
            ExtensionUnit::CalendarMonths,
            ExtensionUnit::Years,
            ExtensionUnit::Lifetime,
        ] {
            assert_eq!(ExtensionUnit::parse(unit.as_mnemonic()).unwrap(), unit);
        }
        assert!(matches!(
            ExtensionUnit::parse("m"),
            Err(InvalidDurationError::UnknownUnit(_))
        ));
        assert!(matches!(
            ExtensionUnit::parse(""),
            Err(InvalidDurationError::UnknownUnit(_))
        ));
    }

    #[test]
    fn far_future_extension_reports_out_of_range() {
        let base = at(2025, 6, 15);
        let err = extend_expiration(base, ExtensionUnit::Years, u32::MAX).unwrap_err();
        assert!(matches!(err, InvalidDurationError::OutOfRange { .. }));
    }
}
