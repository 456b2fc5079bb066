//! Candidate records and the pipe-delimited import format.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// End date assumed when an import row omits the fifth field.
pub const DEFAULT_END_DATE: &str = "2025-01-01";

/// Service affiliation of a candidate record.
///
/// Each branch carries the organization id the provider expects in the
/// submit payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    /// Army (active duty).
    Army,
    /// Navy (active duty).
    Navy,
    /// Air Force (active duty).
    AirForce,
    /// Marine Corps (active duty).
    MarineCorps,
    /// Coast Guard (active duty).
    CoastGuard,
    /// Space Force.
    SpaceForce,
    /// Army National Guard.
    ArmyNationalGuard,
    /// Army Reserve.
    ArmyReserve,
    /// Air National Guard.
    AirNationalGuard,
    /// Air Force Reserve.
    AirForceReserve,
    /// Navy Reserve.
    NavyReserve,
    /// Marine Corps Forces Reserve.
    MarineCorpsReserve,
    /// Coast Guard Reserve.
    CoastGuardReserve,
}

impl Branch {
    /// Organization id used by the provider for this branch.
    pub fn organization_id(self) -> u64 {
        match self {
            Branch::Army => 4070,
            Branch::MarineCorps => 4071,
            Branch::Navy => 4072,
            Branch::AirForce => 4073,
            Branch::CoastGuard => 4074,
            Branch::ArmyNationalGuard => 4075,
            Branch::ArmyReserve => 4076,
            Branch::MarineCorpsReserve => 4077,
            Branch::NavyReserve => 4078,
            Branch::AirNationalGuard => 4079,
            Branch::AirForceReserve => 4080,
            Branch::CoastGuardReserve => 4081,
            Branch::SpaceForce => 4544268,
        }
    }

    /// Canonical display label, as written in import rows.
    pub fn label(self) -> &'static str {
        match self {
            Branch::Army => "Army",
            Branch::Navy => "Navy",
            Branch::AirForce => "Air Force",
            Branch::MarineCorps => "Marine Corps",
            Branch::CoastGuard => "Coast Guard",
            Branch::SpaceForce => "Space Force",
            Branch::ArmyNationalGuard => "Army National Guard",
            Branch::ArmyReserve => "Army Reserve",
            Branch::AirNationalGuard => "Air National Guard",
            Branch::AirForceReserve => "Air Force Reserve",
            Branch::NavyReserve => "Navy Reserve",
            Branch::MarineCorpsReserve => "Marine Corps Reserve",
            Branch::CoastGuardReserve => "Coast Guard Reserve",
        }
    }

    /// Match free-form input against a branch, tolerating prefixes like
    /// "US " and partial names ("marine" matches Marine Corps). Unmatched
    /// input falls back to Army, mirroring upstream import behavior.
    pub fn match_label(input: &str) -> Branch {
        let normalized = input.to_uppercase().replace("US ", "").trim().to_string();

        for branch in Self::ALL {
            if branch.label().to_uppercase() == normalized {
                return branch;
            }
        }

        let has = |needle: &str| normalized.contains(needle);
        if has("MARINE") && !has("RESERVE") {
            return Branch::MarineCorps;
        }
        if has("ARMY") && has("NATIONAL") {
            return Branch::ArmyNationalGuard;
        }
        if has("ARMY") && has("RESERVE") {
            return Branch::ArmyReserve;
        }
        if has("ARMY") {
            return Branch::Army;
        }
        if has("NAVY") && has("RESERVE") {
            return Branch::NavyReserve;
        }
        if has("NAVY") {
            return Branch::Navy;
        }
        if has("AIR") && has("NATIONAL") {
            return Branch::AirNationalGuard;
        }
        if has("AIR") && has("RESERVE") {
            return Branch::AirForceReserve;
        }
        if has("AIR") {
            return Branch::AirForce;
        }
        if has("COAST") && has("RESERVE") {
            return Branch::CoastGuardReserve;
        }
        if has("COAST") {
            return Branch::CoastGuard;
        }
        if has("MARINE") {
            return Branch::MarineCorpsReserve;
        }
        if has("SPACE") {
            return Branch::SpaceForce;
        }
        Branch::Army
    }

    const ALL: [Branch; 13] = [
        Branch::Army,
        Branch::Navy,
        Branch::AirForce,
        Branch::MarineCorps,
        Branch::CoastGuard,
        Branch::SpaceForce,
        Branch::ArmyNationalGuard,
        Branch::ArmyReserve,
        Branch::AirNationalGuard,
        Branch::AirForceReserve,
        Branch::NavyReserve,
        Branch::MarineCorpsReserve,
        Branch::CoastGuardReserve,
    ];
}

/// One identity dossier submitted for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Given name, as imported.
    pub first_name: String,
    /// Family name, as imported.
    pub last_name: String,
    /// Service affiliation.
    pub branch: Branch,
    /// Start of the affiliation period (birth date in the import format).
    pub start_date: NaiveDate,
    /// End of the affiliation period (separation date).
    pub end_date: NaiveDate,
}

impl CandidateRecord {
    /// Identity key used for dedup and the consumed set:
    /// `FIRST|LAST|start-date`, uppercased.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.first_name.to_uppercase(),
            self.last_name.to_uppercase(),
            self.start_date
        )
    }

    /// Full display name.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Render back into the import row format.
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.first_name,
            self.last_name,
            self.branch.label(),
            self.start_date,
            self.end_date
        )
    }
}

/// Why an import row was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordParseError {
    /// Fewer than the four required pipe-delimited fields.
    #[error("expected at least 4 '|' fields, got {0}")]
    TooFewFields(usize),
    /// A name field was empty after trimming.
    #[error("empty name field")]
    EmptyName,
    /// A date field did not parse as `YYYY-MM-DD`.
    #[error("invalid date {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),
}

/// Parse one import row: `FIRST|LAST|branch|YYYY-MM-DD[|YYYY-MM-DD]`.
///
/// A missing end date defaults to [`DEFAULT_END_DATE`]. Callers are
/// expected to skip blank lines and `#` comments before calling this.
pub fn parse_record_line(line: &str) -> Result<CandidateRecord, RecordParseError> {
    let parts: Vec<&str> = line.split('|').map(str::trim).collect();
    if parts.len() < 4 {
        return Err(RecordParseError::TooFewFields(parts.len()));
    }
    if parts[0].is_empty() || parts[1].is_empty() {
        return Err(RecordParseError::EmptyName);
    }

    let start_date = parse_date(parts[3])?;
    let end_date = match parts.get(4) {
        Some(raw) if !raw.is_empty() => parse_date(raw)?,
        _ => parse_date(DEFAULT_END_DATE)?,
    };

    Ok(CandidateRecord {
        first_name: parts[0].to_string(),
        last_name: parts[1].to_string(),
        branch: Branch::match_label(parts[2]),
        start_date,
        end_date,
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate, RecordParseError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| RecordParseError::InvalidDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_row() {
        let rec = parse_record_line("JOHN|SMITH|Army|1990-05-15|2020-06-01").unwrap();
        assert_eq!(rec.first_name, "JOHN");
        assert_eq!(rec.branch, Branch::Army);
        assert_eq!(rec.start_date.to_string(), "1990-05-15");
        assert_eq!(rec.end_date.to_string(), "2020-06-01");
    }

    #[test]
    fn missing_end_date_gets_default() {
        let rec = parse_record_line("JANE|DOE|Navy|1988-01-02").unwrap();
        assert_eq!(rec.end_date.to_string(), DEFAULT_END_DATE);
    }

    #[test]
    fn fuzzy_branch_matching() {
        assert_eq!(Branch::match_label("US ARMY"), Branch::Army);
        assert_eq!(Branch::match_label("marine"), Branch::MarineCorps);
        assert_eq!(Branch::match_label("air national guard"), Branch::AirNationalGuard);
        assert_eq!(Branch::match_label("navy reserve"), Branch::NavyReserve);
        assert_eq!(Branch::match_label("space force"), Branch::SpaceForce);
        // Unknown input falls back to Army.
        assert_eq!(Branch::match_label("unknown"), Branch::Army);
    }

    #[test]
    fn rejects_bad_dates_and_short_rows() {
        assert_eq!(
            parse_record_line("JOHN|SMITH|Army|15-05-1990"),
            Err(RecordParseError::InvalidDate("15-05-1990".to_string()))
        );
        assert_eq!(
            parse_record_line("JOHN|SMITH|Army"),
            Err(RecordParseError::TooFewFields(3))
        );
        assert_eq!(parse_record_line("|SMITH|Army|1990-05-15"), Err(RecordParseError::EmptyName));
    }

    #[test]
    fn key_is_uppercased_identity() {
        let rec = parse_record_line("john|smith|Army|1990-05-15").unwrap();
        assert_eq!(rec.key(), "JOHN|SMITH|1990-05-15");
    }

    #[test]
    fn line_round_trips() {
        let rec = parse_record_line("JOHN|SMITH|Coast Guard|1990-05-15|2021-02-03").unwrap();
        assert_eq!(parse_record_line(&rec.to_line()).unwrap(), rec);
    }
}
