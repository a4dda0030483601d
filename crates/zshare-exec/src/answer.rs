//! Parsing of `zfs` tabular answers
//!
//! `zfs list` and `zfs get` emit whitespace-aligned columns under a
//! header line. The parser turns that into an ordered sequence of
//! immutable rows keyed by the header; listing order is preserved so
//! callers keep first-match semantics. Row values are not validated,
//! but a row whose column count disagrees with the header is a fatal
//! parse error.

use zshare_common::{Error, Result};

/// One parsed answer row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, String)>,
}

impl Row {
    /// Value of a column by header name
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `NAME` column
    #[must_use]
    pub fn name(&self) -> &str {
        self.get("NAME").unwrap_or_default()
    }

    /// The `USED` column of a `zfs list` answer
    #[must_use]
    pub fn used(&self) -> Option<&str> {
        self.get("USED")
    }

    /// The `MOUNTPOINT` column of a `zfs list` answer
    #[must_use]
    pub fn mountpoint(&self) -> Option<&str> {
        self.get("MOUNTPOINT")
    }

    /// The `VALUE` column of a `zfs get` / `zpool get` answer
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.get("VALUE")
    }
}

/// Parse a whitespace-aligned table into ordered rows.
///
/// Output with no data rows parses to an empty vector. A data row with
/// a column count different from the header fails with `Error::Parse`.
pub fn parse_table(stdout: &str) -> Result<Vec<Row>> {
    let mut lines = stdout.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<&str> = header_line.split_whitespace().collect();

    let mut rows = Vec::new();
    for line in lines {
        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() != headers.len() {
            return Err(Error::Parse(format!(
                "row `{line}` has {} columns, header has {}",
                values.len(),
                headers.len()
            )));
        }
        let columns = headers
            .iter()
            .zip(values)
            .map(|(k, v)| ((*k).to_string(), v.to_string()))
            .collect();
        rows.push(Row { columns });
    }
    Ok(rows)
}
