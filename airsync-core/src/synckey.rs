//! Sync key: the opaque continuation token `{GUID}N`.
//!
//! The GUID names a series, the trailing integer a generation within it.
//! Generation 0 is the bootstrap key: the client presents it (or no key
//! at all) to start a series, and the server answers with generation 1.

use crate::{Error, Result};
use rusqlite::Connection;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A parsed sync key: series GUID plus generation counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    series: String,
    counter: u64,
}

impl SyncKey {
    /// Start a fresh series at generation 1.
    ///
    /// Callers must run [`check_collision`] against the device's other
    /// folders and mint again on a hit.
    pub fn new() -> Self {
        Self {
            series: Uuid::new_v4().to_string(),
            counter: 1,
        }
    }

    /// Parse a key of the form `{GUID}N`.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('{')
            .ok_or_else(|| Error::Protocol(s.to_string()))?;
        let close = rest.find('}').ok_or_else(|| Error::Protocol(s.to_string()))?;
        let (series, counter) = rest.split_at(close);
        let counter = &counter[1..];

        if series.is_empty()
            || !series.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(Error::Protocol(s.to_string()));
        }
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol(s.to_string()));
        }
        let counter: u64 = counter
            .parse()
            .map_err(|_| Error::Protocol(s.to_string()))?;

        Ok(Self {
            series: series.to_string(),
            counter,
        })
    }

    /// The next generation of the same series.
    pub fn next(&self) -> Self {
        Self {
            series: self.series.clone(),
            counter: self.counter + 1,
        }
    }

    /// The immediately preceding generation, if any.
    pub fn previous(&self) -> Option<Self> {
        self.counter.checked_sub(1).map(|counter| Self {
            series: self.series.clone(),
            counter,
        })
    }

    /// Series GUID.
    pub fn series(&self) -> &str {
        &self.series
    }

    /// Generation counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Whether this is the bootstrap generation (`N = 0`).
    pub fn is_initial(&self) -> bool {
        self.counter == 0
    }

    /// Whether two keys belong to the same series.
    pub fn same_series(&self, other: &SyncKey) -> bool {
        self.series == other.series
    }
}

impl Default for SyncKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.series, self.counter)
    }
}

impl FromStr for SyncKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// True iff any state row exists for `device` on a folder other than
/// `current_folder` whose key belongs to `series`. On a hit the caller
/// must mint a new series.
pub fn check_collision(
    conn: &Connection,
    series: &str,
    device: &str,
    current_folder: &str,
) -> Result<bool> {
    let pattern = format!("{{{}}}%", series);
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM state
         WHERE sync_devid = ?1 AND sync_folderid != ?2 AND sync_key LIKE ?3",
        rusqlite::params![device, current_folder, pattern],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
