//! Record validation
//!
//! Maps a CSV row onto an [`LeiRecord`] by header name and checks it against
//! the shape the record store expects. A failure here is local to the row:
//! the processor counts it and moves on.

use chrono::{DateTime, Utc};
use csv::StringRecord;
use std::collections::HashMap;
use thiserror::Error;

use super::models::LeiRecord;

pub const COL_LEI: &str = "LEI";
pub const COL_LEGAL_NAME: &str = "LegalName";
pub const COL_JURISDICTION: &str = "Jurisdiction";
pub const COL_COUNTRY: &str = "LegalAddressCountry";
pub const COL_ENTITY_STATUS: &str = "EntityStatus";
pub const COL_REGISTRATION_STATUS: &str = "RegistrationStatus";
pub const COL_LAST_UPDATE: &str = "LastUpdateDate";

/// Columns every snapshot header must name
pub const REQUIRED_COLUMNS: [&str; 6] = [
    COL_LEI,
    COL_LEGAL_NAME,
    COL_COUNTRY,
    COL_ENTITY_STATUS,
    COL_REGISTRATION_STATUS,
    COL_LAST_UPDATE,
];

pub const ENTITY_STATUSES: [&str; 2] = ["ACTIVE", "INACTIVE"];

pub const REGISTRATION_STATUSES: [&str; 10] = [
    "ISSUED",
    "LAPSED",
    "PENDING_TRANSFER",
    "PENDING_ARCHIVAL",
    "RETIRED",
    "ANNULLED",
    "MERGED",
    "DUPLICATE",
    "TRANSFERRED",
    "PENDING_VALIDATION",
];

const LEI_LEN: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing value for {0}")]
    Missing(&'static str),

    #[error("Invalid LEI '{0}'")]
    InvalidLei(String),

    #[error("Invalid country code '{0}'")]
    InvalidCountry(String),

    #[error("Unknown {field} '{value}'")]
    UnknownStatus { field: &'static str, value: String },

    #[error("Invalid last update date '{0}'")]
    InvalidDate(String),
}

/// Column positions resolved from a header row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    lei: usize,
    legal_name: usize,
    jurisdiction: Option<usize>,
    country: usize,
    entity_status: usize,
    registration_status: usize,
    last_update: usize,
}

impl RowLayout {
    /// Resolve positions by name; `Err` lists every required column absent
    pub fn from_header(header: &StringRecord) -> Result<Self, Vec<&'static str>> {
        let index: HashMap<&str, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().trim_start_matches('\u{feff}'), i))
            .collect();

        let missing: Vec<&'static str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !index.contains_key(c))
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let at = |c: &str| index.get(c).copied().unwrap_or_default();
        Ok(Self {
            lei: at(COL_LEI),
            legal_name: at(COL_LEGAL_NAME),
            jurisdiction: index.get(COL_JURISDICTION).copied(),
            country: at(COL_COUNTRY),
            entity_status: at(COL_ENTITY_STATUS),
            registration_status: at(COL_REGISTRATION_STATUS),
            last_update: at(COL_LAST_UPDATE),
        })
    }

    /// The row's natural key as written, before any validation
    pub fn key<'a>(&self, row: &'a StringRecord) -> &'a str {
        row.get(self.lei).map(str::trim).unwrap_or_default()
    }

    fn field<'a>(&self, row: &'a StringRecord, idx: usize) -> &'a str {
        row.get(idx).map(str::trim).unwrap_or_default()
    }
}

/// Validate and normalise one row
pub fn validate(layout: &RowLayout, row: &StringRecord) -> Result<LeiRecord, ValidationError> {
    let lei = layout.key(row);
    if lei.is_empty() {
        return Err(ValidationError::Missing(COL_LEI));
    }
    if !is_valid_lei(lei) {
        return Err(ValidationError::InvalidLei(lei.to_string()));
    }

    let legal_name = layout.field(row, layout.legal_name);
    if legal_name.is_empty() {
        return Err(ValidationError::Missing(COL_LEGAL_NAME));
    }

    let country = layout.field(row, layout.country);
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidCountry(country.to_string()));
    }

    let entity_status = closed_set(
        layout.field(row, layout.entity_status),
        COL_ENTITY_STATUS,
        &ENTITY_STATUSES,
    )?;
    let registration_status = closed_set(
        layout.field(row, layout.registration_status),
        COL_REGISTRATION_STATUS,
        &REGISTRATION_STATUSES,
    )?;

    let raw_date = layout.field(row, layout.last_update);
    if raw_date.is_empty() {
        return Err(ValidationError::Missing(COL_LAST_UPDATE));
    }
    let last_update = DateTime::parse_from_rfc3339(raw_date)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidDate(raw_date.to_string()))?;

    let jurisdiction = layout
        .jurisdiction
        .map(|idx| layout.field(row, idx))
        .filter(|j| !j.is_empty())
        .map(str::to_string);

    Ok(LeiRecord {
        lei: lei.to_string(),
        legal_name: legal_name.to_string(),
        jurisdiction,
        country: country.to_ascii_uppercase(),
        entity_status,
        registration_status,
        last_update,
    })
}

fn closed_set(
    value: &str,
    field: &'static str,
    allowed: &[&str],
) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    let normalised = value.to_ascii_uppercase();
    if allowed.contains(&normalised.as_str()) {
        Ok(normalised)
    } else {
        Err(ValidationError::UnknownStatus {
            field,
            value: value.to_string(),
        })
    }
}

/// ISO 7064 MOD 97-10 remainder over an alphanumeric string (A=10 .. Z=35)
fn mod97(value: &str) -> Option<u32> {
    value.chars().try_fold(0u32, |rem, c| {
        let digit = c.to_digit(36)?;
        Some(if digit >= 10 {
            (rem * 100 + digit) % 97
        } else {
            (rem * 10 + digit) % 97
        })
    })
}

/// Whether `lei` is 20 upper-case alphanumerics with valid check digits
pub fn is_valid_lei(lei: &str) -> bool {
    lei.len() == LEI_LEN
        && lei.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        && lei[LEI_LEN - 2..].chars().all(|c| c.is_ascii_digit())
        && mod97(lei) == Some(1)
}

/// Two check digits completing an 18-character LEI prefix
///
/// Returns `None` when the prefix is not 18 upper-case alphanumerics.
pub fn lei_check_digits(prefix: &str) -> Option<String> {
    if prefix.len() != LEI_LEN - 2
        || !prefix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
    {
        return None;
    }
    let rem = mod97(&format!("{}00", prefix))?;
    Some(format!("{:02}", 98 - rem))
}
