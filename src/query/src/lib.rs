//! Read side of the pipeline: resolve a source by id or coordinates, then
//! hand back either the persisted per-epoch aggregate or a freshly
//! re-filtered per-observation series.
//!
//! Everything here is synchronous — the [`Store`] connection it opens does
//! its own blocking I/O, and there is no network or CPU-heavy work on this
//! path worth spawning off a thread.

use std::sync::Arc;

use nwlc_kernel::{clean_series, CleanedObservation};
use nwlc_store::Store;
use nwlc_types::{Band, BandRow, FilterToggles, Source, NEAREST_SOURCE_RADIUS_DEG};
use nwlc_zp_table::ZpTable;
use snafu::{Backtrace, IntoError, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no source selector given: need either source_id or ra/dec\nBacktrace:\n{backtrace}"))]
    MissingSelector { backtrace: Backtrace },

    #[snafu(display("no sources are stored yet\nBacktrace:\n{backtrace}"))]
    NoSources { backtrace: Backtrace },

    #[snafu(display("nearest source to ({ra}, {dec}) is more than 3 arcseconds away\nBacktrace:\n{backtrace}"))]
    NoNearbySource { ra: f64, dec: f64, backtrace: Backtrace },

    #[snafu(display("no source with id {source_id}\nBacktrace:\n{backtrace}"))]
    SourceNotFound { source_id: String, backtrace: Backtrace },

    #[snafu(display("store error: {source}\nBacktrace:\n{backtrace}"))]
    Store { source: nwlc_store::Error, backtrace: Backtrace },
}

impl From<nwlc_store::Error> for Error {
    fn from(source: nwlc_store::Error) -> Error {
        StoreSnafu.into_error(source)
    }
}

/// What the caller wants resolved into a [`Source`]: an id, or a coordinate
/// pair to match against the nearest stored source.
pub enum Selector<'a> {
    SourceId(&'a str),
    Coordinates { ra: f64, dec: f64 },
}

/// One band's worth of a unified per-MJD record. `None` where that band has
/// no epoch summary at exactly this `mjd_mean`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PivotedEpoch {
    pub mjd_mean: i64,
    pub w1_mag: Option<f64>,
    pub w1_mag_err: Option<f64>,
    pub w2_mag: Option<f64>,
    pub w2_mag_err: Option<f64>,
}

/// One cleaned observation tagged with the band it came from, for the
/// `raw=true` response.
#[derive(Debug, Clone, PartialEq)]
pub struct BandedObservation {
    pub band: Band,
    pub observation: CleanedObservation,
}

/// Holds the store handle and the zero-point table needed to re-run the
/// kernel on demand. Cheap to clone: both fields are reference-counted or
/// already `Clone`.
#[derive(Clone)]
pub struct QueryService {
    store: Store,
    zp: Arc<ZpTable>,
}

impl QueryService {
    pub fn new(store: Store, zp: Arc<ZpTable>) -> QueryService {
        QueryService { store, zp }
    }

    /// Resolves a [`Selector`] to a stored [`Source`].
    ///
    /// For coordinates, picks the minimum small-angle Euclidean distance
    /// `sqrt(dra^2 + ddec^2)` over every stored source and rejects only when
    /// that minimum strictly exceeds [`NEAREST_SOURCE_RADIUS_DEG`] — a
    /// source sitting exactly on the boundary still matches.
    pub fn resolve_source(&self, selector: Selector<'_>) -> Result<Source, Error> {
        match selector {
            Selector::SourceId(source_id) => {
                let conn = self.store.connect()?;
                conn.find_source(source_id)?.ok_or_else(|| {
                    SourceNotFoundSnafu { source_id: source_id.to_string() }.build()
                })
            }
            Selector::Coordinates { ra, dec } => {
                let conn = self.store.connect()?;
                let sources = conn.list_sources()?;
                if sources.is_empty() {
                    return Err(NoSourcesSnafu.build());
                }
                let nearest = sources
                    .into_iter()
                    .map(|s| {
                        let dra = s.ra - ra;
                        let ddec = s.dec - dec;
                        let distance = (dra * dra + ddec * ddec).sqrt();
                        (distance, s)
                    })
                    .min_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap())
                    .unwrap();
                let (distance, source) = nearest;
                if distance > NEAREST_SOURCE_RADIUS_DEG {
                    return Err(NoNearbySourceSnafu { ra, dec }.build());
                }
                Ok(source)
            }
        }
    }

    /// The persisted, ingest-time-filtered light curve, pivoted into
    /// unified per-MJD records. Records where neither band has a row at
    /// that exact `mjd_mean` are never produced in the first place, since
    /// every record here starts from at least one band's row.
    pub fn epoch_series(&self, source_id: &str) -> Result<Vec<PivotedEpoch>, Error> {
        let conn = self.store.connect()?;
        let rows = conn.fetch_epoch_for_source(source_id)?;
        Ok(pivot_epochs(&rows))
    }

    /// Re-runs the filter & aggregation kernel's cleaning stage (quality
    /// filter, zero-point correction, sigma clipping — no epoch grouping)
    /// over the raw observations for `source_id`, under `toggles` supplied
    /// by the caller at query time rather than the ingest-time defaults.
    pub fn raw_series(
        &self,
        source_id: &str,
        toggles: &FilterToggles,
    ) -> Result<Vec<BandedObservation>, Error> {
        let conn = self.store.connect()?;
        let raw = conn.fetch_raw_for_source(source_id)?;

        let mut out = Vec::new();
        for band in Band::ALL {
            let band_rows: Vec<BandRow> =
                raw.iter().filter(|r| r.band == band).map(BandRow::from_raw_observation).collect();
            let cleaned = clean_series(&band_rows, band, &self.zp, toggles);
            out.extend(cleaned.into_iter().map(|observation| BandedObservation { band, observation }));
        }
        out.sort_by(|a, b| a.observation.mjd.partial_cmp(&b.observation.mjd).unwrap());
        Ok(out)
    }
}

fn pivot_epochs(rows: &[nwlc_types::EpochSummary]) -> Vec<PivotedEpoch> {
    let mut mjds: Vec<i64> = rows.iter().map(|r| r.mjd_mean).collect();
    mjds.sort_unstable();
    mjds.dedup();

    mjds.into_iter()
        .filter_map(|mjd_mean| {
            let w1 = rows.iter().find(|r| r.band == Band::W1 && r.mjd_mean == mjd_mean);
            let w2 = rows.iter().find(|r| r.band == Band::W2 && r.mjd_mean == mjd_mean);
            if w1.is_none() && w2.is_none() {
                return None;
            }
            Some(PivotedEpoch {
                mjd_mean,
                w1_mag: w1.map(|r| r.mag_mean),
                w1_mag_err: w1.map(|r| r.mag_se),
                w2_mag: w2.map(|r| r.mag_mean),
                w2_mag_err: w2.map(|r| r.mag_se),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nwlc_types::{EpochSummary, DEFAULT_FILTER_TAG};

    fn sample_epoch(band: Band, mjd_mean: i64, mag_mean: f64) -> EpochSummary {
        EpochSummary {
            source_id: "S1".to_string(),
            band,
            epoch_id: 0,
            mjd_mean,
            mag_mean,
            mag_se: 0.01,
            mag_lim: None,
            n_points: 3,
            snr: Some(50.0),
            filter_applied: DEFAULT_FILTER_TAG.to_string(),
        }
    }

    fn sample_raw(source_id: &str, band: Band, mjd: f64, mpro: f64) -> nwlc_types::RawObservation {
        nwlc_types::RawObservation {
            source_id: source_id.to_string(),
            mjd,
            band,
            mpro,
            sigmpro: 0.02,
            cc_flags: "00".to_string(),
            ph_qual: "AA".to_string(),
            moon_masked: "00".to_string(),
            sso_flg: 0,
            qi_fact: 1.0,
            saa_sep: 10.0,
            sat: 0.0,
            rchi2: 1.0,
            qual_frame: 1.0,
            sky: Some(0.5),
            scan_id: "scan1".to_string(),
            mpro_corrected: mpro,
        }
    }

    fn service() -> (tempfile::NamedTempFile, QueryService) {
        let f = tempfile::NamedTempFile::new().unwrap();
        let store = Store::open(f.path()).unwrap();
        (f, QueryService::new(store, Arc::new(ZpTable::empty())))
    }

    #[test]
    fn resolve_by_source_id_finds_exact_match() {
        let (_f, svc) = service();
        let conn = svc.store.connect().unwrap();
        conn.upsert_source(&Source::new("S1", 10.0, 20.0, None)).unwrap();
        let source = svc.resolve_source(Selector::SourceId("S1")).unwrap();
        assert_eq!(source.source_id, "S1");
    }

    #[test]
    fn resolve_by_source_id_missing_is_an_error() {
        let (_f, svc) = service();
        let err = svc.resolve_source(Selector::SourceId("nope")).unwrap_err();
        assert!(matches!(err, Error::SourceNotFound { .. }));
    }

    #[test]
    fn resolve_by_coordinates_picks_nearest_within_radius() {
        let (_f, svc) = service();
        let conn = svc.store.connect().unwrap();
        conn.upsert_source(&Source::new("far", 10.0, 20.0, None)).unwrap();
        conn.upsert_source(&Source::new("near", 10.0002, 20.0001, None)).unwrap();
        let source = svc.resolve_source(Selector::Coordinates { ra: 10.0, dec: 20.0 }).unwrap();
        assert_eq!(source.source_id, "near");
    }

    #[test]
    fn resolve_by_coordinates_boundary_distance_is_accepted() {
        let (_f, svc) = service();
        let conn = svc.store.connect().unwrap();
        conn.upsert_source(&Source::new("S1", 10.0 + NEAREST_SOURCE_RADIUS_DEG, 20.0, None)).unwrap();
        let source = svc.resolve_source(Selector::Coordinates { ra: 10.0, dec: 20.0 }).unwrap();
        assert_eq!(source.source_id, "S1");
    }

    #[test]
    fn resolve_by_coordinates_beyond_radius_is_rejected() {
        let (_f, svc) = service();
        let conn = svc.store.connect().unwrap();
        conn.upsert_source(&Source::new("S1", 11.0, 20.0, None)).unwrap();
        let err = svc.resolve_source(Selector::Coordinates { ra: 10.0, dec: 20.0 }).unwrap_err();
        assert!(matches!(err, Error::NoNearbySource { .. }));
    }

    #[test]
    fn resolve_by_coordinates_with_no_sources_errors() {
        let (_f, svc) = service();
        let err = svc.resolve_source(Selector::Coordinates { ra: 10.0, dec: 20.0 }).unwrap_err();
        assert!(matches!(err, Error::NoSources { .. }));
    }

    #[test]
    fn epoch_series_pivots_matching_mjds_across_bands() {
        let (_f, svc) = service();
        let mut conn = svc.store.connect().unwrap();
        conn.insert_epoch_batch(&[
            sample_epoch(Band::W1, 55500, 15.0),
            sample_epoch(Band::W2, 55500, 14.0),
            sample_epoch(Band::W1, 55600, 15.5),
        ])
        .unwrap();
        let pivoted = svc.epoch_series("S1").unwrap();
        assert_eq!(pivoted.len(), 2);
        assert_eq!(pivoted[0].mjd_mean, 55500);
        assert_eq!(pivoted[0].w1_mag, Some(15.0));
        assert_eq!(pivoted[0].w2_mag, Some(14.0));
        assert_eq!(pivoted[1].mjd_mean, 55600);
        assert_eq!(pivoted[1].w1_mag, Some(15.5));
        assert_eq!(pivoted[1].w2_mag, None);
    }

    #[test]
    fn raw_series_reapplies_toggles_at_query_time() {
        let (_f, svc) = service();
        let mut conn = svc.store.connect().unwrap();
        let mut bad = sample_raw("S1", Band::W1, 55500.0, 15.0);
        bad.cc_flags = "D0".to_string();
        conn.insert_raw_batch(&[sample_raw("S1", Band::W1, 55400.0, 14.0), bad]).unwrap();

        let strict = svc.raw_series("S1", &FilterToggles::all_enabled()).unwrap();
        assert_eq!(strict.len(), 1);

        let mut lenient = FilterToggles::all_enabled();
        lenient.cc_flags = false;
        let all = svc.raw_series("S1", &lenient).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.windows(2).all(|w| w[0].observation.mjd <= w[1].observation.mjd));
    }

    #[test]
    fn raw_series_with_no_rows_is_empty() {
        let (_f, svc) = service();
        let rows = svc.raw_series("missing", &FilterToggles::all_enabled()).unwrap();
        assert!(rows.is_empty());
    }
}
