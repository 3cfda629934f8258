//! Input file parsing and validation
//!
//! The input of a run is a CSV file whose header names the seven fields of a
//! [`PackageRecord`] (in any order). Every data line is checked before a
//! single task file is created, and the first problem is reported together
//! with its line number.

use crate::error::{OriginError, Result};
use crate::types::{PackageRecord, Restriction, CSV_HEADER};
use csv::StringRecord;
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Values every input line must agree with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputExpectations {
    /// Registry domain the run targets
    pub domain: String,
    /// Repository the run targets
    pub repository: String,
}

/// A parsed record and the line it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLine {
    /// 1-based line number in the source file
    pub line: u64,
    /// Parsed record
    pub record: PackageRecord,
}

/// Validate an input file against the expected domain and repository
///
/// Returns the parsed lines on success. Fails with
/// [`OriginError::Validation`] on the first offending line.
pub fn validate_input(path: &Path, expected: &InputExpectations) -> Result<Vec<InputLine>> {
    let data = fs::read(path)?;
    debug!("Read {} bytes from {:?}", data.len(), path);
    validate_data(&data, expected)
}

/// Same as [`validate_input`] for input bytes already in memory
#[instrument(skip(data, expected), fields(domain = %expected.domain, repository = %expected.repository))]
pub fn validate_data(data: &[u8], expected: &InputExpectations) -> Result<Vec<InputLine>> {
    let lines = parse_input(data, Some(expected))?;
    info!("File is valid and contains {} records", lines.len());
    Ok(lines)
}

/// Parse an input file without domain or repository expectations
///
/// Header, flag values and key fields are still checked.
pub fn read_input(path: &Path) -> Result<Vec<InputLine>> {
    parse_data(&fs::read(path)?)
}

/// Same as [`read_input`] for input bytes already in memory
pub fn parse_data(data: &[u8]) -> Result<Vec<InputLine>> {
    parse_input(data, None)
}

fn parse_input(data: &[u8], expected: Option<&InputExpectations>) -> Result<Vec<InputLine>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(data);

    let headers = reader.headers()?.clone();
    let columns = column_positions(&headers)?;

    let mut lines = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            OriginError::validation(line, e.to_string())
        })?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let record = parse_row(&row, &columns, line)?;
        if let Some(expected) = expected {
            check_expectations(&record, expected, line)?;
        }
        lines.push(InputLine { line, record });
    }

    Ok(lines)
}

/// Map each field of [`CSV_HEADER`] to its column index
fn column_positions(headers: &StringRecord) -> Result<[usize; 7]> {
    if headers.is_empty() || (headers.len() == 1 && headers.get(0) == Some("")) {
        return Err(OriginError::validation(1, "No header detected!"));
    }

    let mut found: Vec<&str> = headers.iter().collect();
    found.sort_unstable();
    let mut wanted: Vec<&str> = CSV_HEADER.to_vec();
    wanted.sort_unstable();
    if found != wanted {
        return Err(OriginError::validation(
            1,
            "Check your header, some fields are missing!",
        ));
    }

    let mut columns = [0usize; 7];
    for (slot, name) in columns.iter_mut().zip(CSV_HEADER.iter()) {
        *slot = headers
            .iter()
            .position(|h| h == *name)
            .ok_or_else(|| OriginError::internal(format!("header lost column {}", name)))?;
    }
    Ok(columns)
}

fn parse_row(row: &StringRecord, columns: &[usize; 7], line: u64) -> Result<PackageRecord> {
    let field = |idx: usize| row.get(columns[idx]).unwrap_or("").to_string();

    let upstream_raw = field(5);
    let publish_raw = field(6);
    let upstream: Restriction = upstream_raw.parse().map_err(|_| {
        OriginError::validation(
            line,
            format!("\"upstream\" must be either ALLOW or BLOCK, cannot be {}", upstream_raw),
        )
    })?;
    let publish: Restriction = publish_raw.parse().map_err(|_| {
        OriginError::validation(
            line,
            format!("\"publish\" must be either ALLOW or BLOCK, cannot be {}", publish_raw),
        )
    })?;

    let record = PackageRecord {
        domain: field(0),
        repository: field(1),
        format: field(2),
        namespace: field(3),
        package: field(4),
        upstream,
        publish,
    };
    check_key_fields(&record, line)?;
    Ok(record)
}

/// Key fields become part of a filename, so they must be path-safe
fn check_key_fields(record: &PackageRecord, line: u64) -> Result<()> {
    let fields = [
        ("domain", &record.domain, false),
        ("repository", &record.repository, false),
        ("format", &record.format, false),
        ("namespace", &record.namespace, true),
        ("package", &record.package, false),
    ];
    for (name, value, may_be_empty) in fields {
        if value.is_empty() && !may_be_empty {
            return Err(OriginError::validation(line, format!("\"{}\" cannot be empty", name)));
        }
        if value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
            return Err(OriginError::validation(
                line,
                format!("\"{}\" cannot contain path separators: {}", name, value),
            ));
        }
    }
    Ok(())
}

fn check_expectations(record: &PackageRecord, expected: &InputExpectations, line: u64) -> Result<()> {
    if record.domain != expected.domain {
        return Err(OriginError::validation(
            line,
            format!(
                "Domain {} is different from expected value of {}",
                record.domain, expected.domain
            ),
        ));
    }
    if record.repository != expected.repository {
        return Err(OriginError::validation(
            line,
            format!(
                "Repository {} is different from expected value of {}",
                record.repository, expected.repository
            ),
        ));
    }
    Ok(())
}
