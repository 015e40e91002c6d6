//! Zero-point correction table: `scan_id -> (w1_dmag, w2_dmag)`, plus the
//! minimum MJD present in the table (the ingest-time cutoff).

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nwlc_types::Band;
use snafu::{Backtrace, ResultExt, Snafu};

/// Number of header/comment lines the NEOWISE zero-point table ships before
/// its real CSV header row.
const PREAMBLE_LINES: usize = 12;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to open zp table {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    Open { path: std::path::PathBuf, source: std::io::Error, backtrace: Backtrace },

    #[snafu(display("failed to read zp table {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    Read { path: std::path::PathBuf, source: std::io::Error, backtrace: Backtrace },

    #[snafu(display("zp table {} is missing a required column: {}\nBacktrace:\n{}", path.display(), column, backtrace))]
    MissingColumn { path: std::path::PathBuf, column: String, backtrace: Backtrace },

    #[snafu(display("malformed row in zp table {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    Parse { path: std::path::PathBuf, source: csv::Error, backtrace: Backtrace },
}

/// Read-only lookup loaded once at process start and shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct ZpTable {
    by_scan: HashMap<String, (f64, f64)>,
    min_mjd: Option<f64>,
}

impl ZpTable {
    pub fn empty() -> ZpTable {
        ZpTable::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scan.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_scan.len()
    }

    /// Minimum MJD present in the table, or `None` when there is no cutoff
    /// (table empty).
    pub fn min_mjd(&self) -> Option<f64> {
        self.min_mjd
    }

    /// Per-band zero-point offset for `scan_id`. Unknown scans contribute
    /// zero, matching the reference behaviour of treating a missing merge
    /// key as "no correction".
    pub fn dmag(&self, scan_id: &str, band: Band) -> f64 {
        match self.by_scan.get(scan_id) {
            Some((w1, w2)) => match band {
                Band::W1 => *w1,
                Band::W2 => *w2,
            },
            None => 0.0,
        }
    }

    /// Loads the table from `path`. A missing file is not an error: the
    /// table is simply empty, which makes zero-point correction and the MJD
    /// cutoff no-ops downstream.
    pub fn load(path: &Path) -> Result<ZpTable, Error> {
        if !path.exists() {
            log::warn!("zp table {} not found; zero-point correction disabled", path.display());
            return Ok(ZpTable::empty());
        }

        let file = std::fs::File::open(path).context(OpenSnafu { path: path.to_path_buf() })?;
        let mut reader = BufReader::new(file);

        let mut line = String::new();
        for _ in 0..PREAMBLE_LINES {
            line.clear();
            let n = reader.read_line(&mut line).context(ReadSnafu { path: path.to_path_buf() })?;
            if n == 0 {
                break;
            }
        }

        let mut rest = String::new();
        std::io::Read::read_to_string(&mut reader, &mut rest)
            .context(ReadSnafu { path: path.to_path_buf() })?;

        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(rest.as_bytes());
        let headers = csv_reader.headers().context(ParseSnafu { path: path.to_path_buf() })?.clone();

        let idx = |name: &str| {
            headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
                MissingColumnSnafu { path: path.to_path_buf(), column: name.to_string() }.build()
            })
        };
        let scan_idx = idx("scan")?;
        let mjd_idx = idx("mjd")?;
        let w1_idx = idx("w1dmag")?;
        let w2_idx = idx("w2dmag")?;

        let mut by_scan = HashMap::new();
        let mut min_mjd: Option<f64> = None;

        for record in csv_reader.records() {
            let record = record.context(ParseSnafu { path: path.to_path_buf() })?;
            let scan_id = record.get(scan_idx).unwrap_or_default().trim().to_string();
            let mjd: f64 = record.get(mjd_idx).unwrap_or_default().trim().parse().unwrap_or(f64::NAN);
            let w1: f64 = record.get(w1_idx).unwrap_or_default().trim().parse().unwrap_or(0.0);
            let w2: f64 = record.get(w2_idx).unwrap_or_default().trim().parse().unwrap_or(0.0);

            if scan_id.is_empty() {
                continue;
            }
            by_scan.insert(scan_id, (w1, w2));
            if !mjd.is_nan() {
                min_mjd = Some(match min_mjd {
                    Some(cur) => cur.min(mjd),
                    None => mjd,
                });
            }
        }

        log::info!("loaded zp table {} with {} entries", path.display(), by_scan.len());
        Ok(ZpTable { by_scan, min_mjd })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_table(preamble_lines: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for i in 0..preamble_lines {
            writeln!(f, "# preamble line {i}").unwrap();
        }
        writeln!(f, "scan,mjd,w1dmag,w2dmag").unwrap();
        writeln!(f, "01234a,55600.1,0.01,-0.02").unwrap();
        writeln!(f, "01235a,55700.2,0.03,0.04").unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn loads_after_skipping_preamble() {
        let f = write_table(PREAMBLE_LINES);
        let table = ZpTable::load(f.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.dmag("01234a", Band::W1), 0.01);
        assert_eq!(table.dmag("01234a", Band::W2), -0.02);
        assert_eq!(table.min_mjd(), Some(55600.1));
    }

    #[test]
    fn unknown_scan_has_zero_offset() {
        let f = write_table(PREAMBLE_LINES);
        let table = ZpTable::load(f.path()).unwrap();
        assert_eq!(table.dmag("nope", Band::W1), 0.0);
    }

    #[test]
    fn missing_file_is_empty_not_an_error() {
        let table = ZpTable::load(Path::new("/nonexistent/zp.csv")).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.min_mjd(), None);
    }
}
