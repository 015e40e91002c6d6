//! File-backed persistence for sources, raw observations and epoch
//! summaries, on top of `rusqlite`.
//!
//! SQLite allows only one writer at a time; every worker opens its own
//! [`Connection`] against the shared file, but all of them serialise writes
//! through the same process-wide [`std::sync::Mutex`] handed out by
//! [`Store::connect`]. Reads need no coordination beyond SQLite's own
//! locking.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use nwlc_types::{Band, EpochSummary, RawObservation, Source};
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};
use snafu::{Backtrace, ResultExt, Snafu};

const BUSY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to open store at {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    Open { path: PathBuf, source: rusqlite::Error, backtrace: Backtrace },

    #[snafu(display("failed to initialise schema: {}\nBacktrace:\n{}", source, backtrace))]
    Schema { source: rusqlite::Error, backtrace: Backtrace },

    #[snafu(display("failed to remove store file {}: {}\nBacktrace:\n{}", path.display(), source, backtrace))]
    RemoveFile { path: PathBuf, source: std::io::Error, backtrace: Backtrace },

    #[snafu(display("query failed: {}\nBacktrace:\n{}", source, backtrace))]
    Query { source: rusqlite::Error, backtrace: Backtrace },

    #[snafu(display("write failed: {}\nBacktrace:\n{}", source, backtrace))]
    Write { source: rusqlite::Error, backtrace: Backtrace },

    #[snafu(display("stored band value {} is not a recognised band\nBacktrace:\n{}", value, backtrace))]
    UnknownBand { value: String, backtrace: Backtrace },
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// A handle to the database file. Cheap to clone; cloning shares the write
/// mutex, so every clone still serialises against every other.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// schema and indexes exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Store, Error> {
        let path = path.as_ref().to_path_buf();
        let conn = SqliteConnection::open(&path).context(OpenSnafu { path: path.clone() })?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .context(SchemaSnafu)?;
        init_schema(&conn)?;
        log::info!("opened store at {}", path.display());
        Ok(Store { path, write_lock: Arc::new(Mutex::new(())) })
    }

    /// Opens a fresh connection against the same file. Workers should call
    /// this once per worker rather than sharing a `Connection`.
    pub fn connect(&self) -> Result<StoreConnection, Error> {
        let conn = SqliteConnection::open(&self.path).context(OpenSnafu { path: self.path.clone() })?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .context(SchemaSnafu)?;
        Ok(StoreConnection { conn, write_lock: self.write_lock.clone() })
    }

    /// Truncates all three tables and compacts free space; schema is kept.
    pub fn clear(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = SqliteConnection::open(&self.path).context(OpenSnafu { path: self.path.clone() })?;
        conn.execute_batch(
            "DELETE FROM epoch_summary; DELETE FROM raw_observations; DELETE FROM sources; VACUUM;",
        )
        .context(WriteSnafu)?;
        log::info!("cleared store at {}", self.path.display());
        Ok(())
    }

    /// Removes the database file (and any WAL/SHM sidecar files) entirely.
    pub fn drop_database(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().unwrap();
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let candidate = PathBuf::from(format!("{}{}", self.path.display(), suffix));
            if candidate.exists() {
                std::fs::remove_file(&candidate).context(RemoveFileSnafu { path: candidate })?;
            }
        }
        log::info!("dropped store at {}", self.path.display());
        Ok(())
    }
}

fn init_schema(conn: &SqliteConnection) -> Result<(), Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sources (
            source_id     TEXT PRIMARY KEY,
            ra            REAL NOT NULL,
            dec           REAL NOT NULL,
            allwise_cntr  INTEGER,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS raw_observations (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id       TEXT NOT NULL,
            mjd             REAL NOT NULL,
            band            TEXT NOT NULL,
            mpro            REAL NOT NULL,
            sigmpro         REAL NOT NULL,
            cc_flags        TEXT NOT NULL,
            ph_qual         TEXT NOT NULL,
            moon_masked     TEXT NOT NULL,
            sso_flg         INTEGER NOT NULL,
            qi_fact         REAL NOT NULL,
            saa_sep         REAL NOT NULL,
            sat             REAL NOT NULL,
            rchi2           REAL NOT NULL,
            qual_frame      REAL NOT NULL,
            sky             REAL,
            scan_id         TEXT NOT NULL,
            mpro_corrected  REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS epoch_summary (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id       TEXT NOT NULL,
            band            TEXT NOT NULL,
            epoch_id        INTEGER NOT NULL,
            mjd_mean        INTEGER NOT NULL,
            mag_mean        REAL NOT NULL,
            mag_se          REAL NOT NULL,
            mag_lim         REAL,
            n_points        INTEGER NOT NULL,
            snr             REAL,
            filter_applied  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sources_source_id ON sources (source_id);
        CREATE INDEX IF NOT EXISTS idx_raw_source_id ON raw_observations (source_id);
        CREATE INDEX IF NOT EXISTS idx_raw_band ON raw_observations (band);
        CREATE INDEX IF NOT EXISTS idx_raw_mjd ON raw_observations (mjd);
        CREATE INDEX IF NOT EXISTS idx_epoch_source_id ON epoch_summary (source_id);
        CREATE INDEX IF NOT EXISTS idx_epoch_band ON epoch_summary (band);
        ",
    )
    .context(SchemaSnafu)
}

fn parse_band(value: &str) -> Result<Band, Error> {
    Band::parse(value).ok_or_else(|| UnknownBandSnafu { value: value.to_string() }.build())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

/// A per-worker connection sharing the store's write mutex.
pub struct StoreConnection {
    conn: SqliteConnection,
    write_lock: Arc<Mutex<()>>,
}

impl StoreConnection {
    /// Inserts `source` unless a row with the same `source_id` already
    /// exists, in which case the existing row is left untouched.
    pub fn upsert_source(&self, source: &Source) -> Result<(), Error> {
        let _guard = self.write_lock.lock().unwrap();
        self.conn
            .execute(
                "INSERT INTO sources (source_id, ra, dec, allwise_cntr, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_id) DO NOTHING",
                params![
                    source.source_id,
                    source.ra,
                    source.dec,
                    source.allwise_cntr,
                    source.created_at.to_rfc3339(),
                ],
            )
            .context(WriteSnafu)?;
        Ok(())
    }

    /// Bulk-inserts `rows` inside a single transaction, rounding magnitudes
    /// and uncertainties to 4 decimals as they are written.
    pub fn insert_raw_batch(&mut self, rows: &[RawObservation]) -> Result<(), Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap();
        let tx = self.conn.transaction().context(WriteSnafu)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO raw_observations
                        (source_id, mjd, band, mpro, sigmpro, cc_flags, ph_qual, moon_masked,
                         sso_flg, qi_fact, saa_sep, sat, rchi2, qual_frame, sky, scan_id, mpro_corrected)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                )
                .context(WriteSnafu)?;
            for row in rows {
                stmt.execute(params![
                    row.source_id,
                    row.mjd,
                    row.band.as_str(),
                    round_to(row.mpro, 4),
                    round_to(row.sigmpro, 4),
                    row.cc_flags,
                    row.ph_qual,
                    row.moon_masked,
                    row.sso_flg,
                    row.qi_fact,
                    row.saa_sep,
                    row.sat,
                    row.rchi2,
                    row.qual_frame,
                    row.sky,
                    row.scan_id,
                    round_to(row.mpro_corrected, 4),
                ])
                .context(WriteSnafu)?;
            }
        }
        tx.commit().context(WriteSnafu)?;
        Ok(())
    }

    /// Bulk-inserts `rows` inside a single transaction, rounding
    /// magnitudes/uncertainties to 4 decimals and SNR to 2 decimals.
    pub fn insert_epoch_batch(&mut self, rows: &[EpochSummary]) -> Result<(), Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap();
        let tx = self.conn.transaction().context(WriteSnafu)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO epoch_summary
                        (source_id, band, epoch_id, mjd_mean, mag_mean, mag_se, mag_lim,
                         n_points, snr, filter_applied)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context(WriteSnafu)?;
            for row in rows {
                stmt.execute(params![
                    row.source_id,
                    row.band.as_str(),
                    row.epoch_id,
                    row.mjd_mean,
                    round_to(row.mag_mean, 4),
                    round_to(row.mag_se, 4),
                    row.mag_lim.map(|v| round_to(v, 4)),
                    row.n_points,
                    row.snr.map(|v| round_to(v, 2)),
                    row.filter_applied,
                ])
                .context(WriteSnafu)?;
            }
        }
        tx.commit().context(WriteSnafu)?;
        Ok(())
    }

    /// Raw observations for `source_id`, ordered by `mjd` ascending.
    pub fn fetch_raw_for_source(&self, source_id: &str) -> Result<Vec<RawObservation>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_id, mjd, band, mpro, sigmpro, cc_flags, ph_qual, moon_masked,
                        sso_flg, qi_fact, saa_sep, sat, rchi2, qual_frame, sky, scan_id, mpro_corrected
                 FROM raw_observations WHERE source_id = ?1 ORDER BY mjd ASC",
            )
            .context(QuerySnafu)?;
        #[allow(clippy::type_complexity)]
        let rows: Vec<(
            String, f64, String, f64, f64, String, String, String, i64, f64, f64, f64, f64, f64,
            Option<f64>, String, f64,
        )> = stmt
            .query_map(params![source_id], |r| {
                Ok((
                    r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?,
                    r.get(7)?, r.get(8)?, r.get(9)?, r.get(10)?, r.get(11)?, r.get(12)?,
                    r.get(13)?, r.get(14)?, r.get(15)?, r.get(16)?,
                ))
            })
            .context(QuerySnafu)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context(QuerySnafu)?;

        rows.into_iter()
            .map(
                |(
                    source_id, mjd, band, mpro, sigmpro, cc_flags, ph_qual, moon_masked, sso_flg,
                    qi_fact, saa_sep, sat, rchi2, qual_frame, sky, scan_id, mpro_corrected,
                )| {
                    Ok(RawObservation {
                        source_id,
                        mjd,
                        band: parse_band(&band)?,
                        mpro,
                        sigmpro,
                        cc_flags,
                        ph_qual,
                        moon_masked,
                        sso_flg,
                        qi_fact,
                        saa_sep,
                        sat,
                        rchi2,
                        qual_frame,
                        sky,
                        scan_id,
                        mpro_corrected,
                    })
                },
            )
            .collect()
    }

    /// Epoch summaries for `source_id`, ordered by `mjd_mean` ascending.
    pub fn fetch_epoch_for_source(&self, source_id: &str) -> Result<Vec<EpochSummary>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_id, band, epoch_id, mjd_mean, mag_mean, mag_se, mag_lim,
                        n_points, snr, filter_applied
                 FROM epoch_summary WHERE source_id = ?1 ORDER BY mjd_mean ASC",
            )
            .context(QuerySnafu)?;
        #[allow(clippy::type_complexity)]
        let rows: Vec<(String, String, i64, i64, f64, f64, Option<f64>, i64, Option<f64>, String)> = stmt
            .query_map(params![source_id], |r| {
                Ok((
                    r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?,
                    r.get(7)?, r.get(8)?, r.get(9)?,
                ))
            })
            .context(QuerySnafu)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context(QuerySnafu)?;

        rows.into_iter()
            .map(
                |(source_id, band, epoch_id, mjd_mean, mag_mean, mag_se, mag_lim, n_points, snr, filter_applied)| {
                    Ok(EpochSummary {
                        source_id,
                        band: parse_band(&band)?,
                        epoch_id,
                        mjd_mean,
                        mag_mean,
                        mag_se,
                        mag_lim,
                        n_points,
                        snr,
                        filter_applied,
                    })
                },
            )
            .collect()
    }

    /// All persisted sources, in no particular order.
    pub fn list_sources(&self) -> Result<Vec<Source>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT source_id, ra, dec, allwise_cntr, created_at FROM sources")
            .context(QuerySnafu)?;
        let rows = stmt
            .query_map([], |r| {
                let created_at: String = r.get(4)?;
                Ok(Source {
                    source_id: r.get(0)?,
                    ra: r.get(1)?,
                    dec: r.get(2)?,
                    allwise_cntr: r.get(3)?,
                    created_at: parse_timestamp(&created_at),
                })
            })
            .context(QuerySnafu)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context(QuerySnafu)?;
        Ok(rows)
    }

    /// Looks up a single source by id, if present.
    pub fn find_source(&self, source_id: &str) -> Result<Option<Source>, Error> {
        self.conn
            .query_row(
                "SELECT source_id, ra, dec, allwise_cntr, created_at FROM sources WHERE source_id = ?1",
                params![source_id],
                |r| {
                    let created_at: String = r.get(4)?;
                    Ok(Source {
                        source_id: r.get(0)?,
                        ra: r.get(1)?,
                        dec: r.get(2)?,
                        allwise_cntr: r.get(3)?,
                        created_at: parse_timestamp(&created_at),
                    })
                },
            )
            .optional()
            .context(QuerySnafu)
    }
}
