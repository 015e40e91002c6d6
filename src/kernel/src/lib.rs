//! The deterministic quality-filter / epoch-aggregation recipe.
//!
//! Every function here is a pure computation over in-memory rows: no I/O, no
//! shared state, nothing async. That is what lets both the ingest worker and
//! the query service call the same code with different toggles and trust
//! the result is reproducible.

use nwlc_types::{Band, BandRow, EpochSummary, FilterToggles, RawObservation, DEFAULT_FILTER_TAG};
use nwlc_zp_table::ZpTable;

/// One cleaned, per-exposure point: quality-filtered, optionally
/// zero-point-corrected and sigma-clipped, but not yet aggregated into an
/// epoch. This is what the query service returns for `raw=true` requests.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedObservation {
    pub mjd: f64,
    pub mag: f64,
    pub mag_err: f64,
}

/// Step 2: retains rows with `mjd > zp.min_mjd()`. A no-op when the zero
/// point table is empty.
pub fn apply_mjd_cutoff(rows: &[BandRow], zp: &ZpTable) -> Vec<BandRow> {
    match zp.min_mjd() {
        Some(min_mjd) => rows.iter().filter(|r| r.mjd > min_mjd).cloned().collect(),
        None => rows.to_vec(),
    }
}

/// Builds the rows written to `raw_observations`: every surviving
/// measurement (after the MJD cutoff) gets a zero-point-corrected magnitude,
/// independent of the quality filter — a row that would fail every quality
/// predicate is still stored raw.
pub fn build_raw_observations(
    source_id: &str,
    rows: &[BandRow],
    band: Band,
    zp: &ZpTable,
) -> Vec<RawObservation> {
    rows.iter()
        .map(|row| {
            let mpro_corrected = row.mpro - zp.dmag(&row.scan_id, band);
            RawObservation {
                source_id: source_id.to_string(),
                mjd: row.mjd,
                band,
                mpro: row.mpro,
                sigmpro: row.sigmpro,
                cc_flags: row.cc_flags.clone(),
                ph_qual: row.ph_qual.clone(),
                moon_masked: row.moon_masked.clone(),
                sso_flg: row.sso_flg,
                qi_fact: row.qi_fact,
                saa_sep: row.saa_sep,
                sat: row.sat,
                rchi2: row.rchi2,
                qual_frame: row.qual_frame,
                sky: row.sky,
                scan_id: row.scan_id.clone(),
                mpro_corrected,
            }
        })
        .collect()
}

fn passes_quality_filter(row: &BandRow, band: Band, toggles: &FilterToggles) -> bool {
    let idx = band.flag_index();

    if toggles.cc_flags && BandRow::flag_char(&row.cc_flags, idx) != Some('0') {
        return false;
    }
    if toggles.sso_flg && row.sso_flg != 0 {
        return false;
    }
    if toggles.qi_fact && row.qi_fact != 1.0 {
        return false;
    }
    if toggles.saa_sep && row.saa_sep < 5.0 {
        return false;
    }
    if toggles.ph_qual && BandRow::flag_char(&row.ph_qual, idx) != Some('A') {
        return false;
    }
    if toggles.moon_masked && BandRow::flag_char(&row.moon_masked, idx) != Some('0') {
        return false;
    }
    if toggles.sat && row.sat > 0.05 {
        return false;
    }
    if toggles.rchi2 && row.rchi2 > 50.0 {
        return false;
    }
    if toggles.qual_frame && row.qual_frame <= 0.0 {
        return false;
    }
    if toggles.sky && row.sky.is_none() {
        return false;
    }
    true
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (ddof=1). `NaN` for fewer than two values,
/// matching `pandas.Series.std()`.
fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (sum_sq / (n as f64 - 1.0)).sqrt()
}

fn sigma_clip(mags: &[f64]) -> Vec<bool> {
    let std_mag = sample_std(mags);
    if std_mag > 0.0 && std_mag.is_finite() {
        let mean_mag = mean(mags);
        let lo = mean_mag - 3.0 * std_mag;
        let hi = mean_mag + 3.0 * std_mag;
        mags.iter().map(|m| *m >= lo && *m <= hi).collect()
    } else {
        vec![true; mags.len()]
    }
}

/// Steps 3-5: quality filter, zero-point correction, 3-sigma clipping. The
/// output is sorted by `mjd` as a side effect of how callers use it (epoch
/// grouping requires the sort; the query service is happy with it too).
pub fn clean_series(
    rows: &[BandRow],
    band: Band,
    zp: &ZpTable,
    toggles: &FilterToggles,
) -> Vec<CleanedObservation> {
    let mut filtered: Vec<CleanedObservation> = rows
        .iter()
        .filter(|row| passes_quality_filter(row, band, toggles))
        .map(|row| {
            let mag = if toggles.zp_correction {
                row.mpro - zp.dmag(&row.scan_id, band)
            } else {
                row.mpro
            };
            CleanedObservation { mjd: row.mjd, mag, mag_err: row.sigmpro }
        })
        .collect();

    if toggles.sigma_clipping {
        let mags: Vec<f64> = filtered.iter().map(|o| o.mag).collect();
        let keep = sigma_clip(&mags);
        let mut kept = Vec::with_capacity(filtered.len());
        for (obs, keep) in filtered.into_iter().zip(keep) {
            if keep {
                kept.push(obs);
            }
        }
        filtered = kept;
    }

    filtered.sort_by(|a, b| a.mjd.partial_cmp(&b.mjd).unwrap());
    filtered
}

struct FluxPoint {
    mjd: f64,
    mag: f64,
    flux: f64,
    flux_err: f64,
    epoch_id: i64,
}

/// Step 7: cumulative-gap epoch assignment over an mjd-sorted sequence.
fn assign_epoch_ids(mjds: &[f64]) -> Vec<i64> {
    let mut ids = Vec::with_capacity(mjds.len());
    let mut current = 0i64;
    for (i, mjd) in mjds.iter().enumerate() {
        if i > 0 && (*mjd - mjds[i - 1]) >= 100.0 {
            current += 1;
        }
        ids.push(current);
    }
    ids
}

/// Steps 6-9: flux transform, epoch grouping, SNR-driven epoch selection,
/// aggregation. Always runs with every quality predicate enabled — this is
/// the ingest-time "default filter" recipe.
pub fn default_epoch_summaries(
    source_id: &str,
    rows: &[BandRow],
    band: Band,
    zp: &ZpTable,
) -> Vec<EpochSummary> {
    let cleaned = clean_series(rows, band, zp, &FilterToggles::all_enabled());
    if cleaned.is_empty() {
        return Vec::new();
    }

    let mjds: Vec<f64> = cleaned.iter().map(|o| o.mjd).collect();
    let epoch_ids = assign_epoch_ids(&mjds);

    let points: Vec<FluxPoint> = cleaned
        .iter()
        .zip(epoch_ids.iter())
        .map(|(o, &epoch_id)| {
            let flux = 10f64.powf(-0.4 * o.mag);
            let flux_err = flux * (10f64.powf(0.4 * o.mag_err) - 1.0);
            FluxPoint { mjd: o.mjd, mag: o.mag, flux, flux_err, epoch_id }
        })
        .collect();

    // Contiguous runs: `points` is sorted by mjd, and `epoch_id` is
    // non-decreasing over that order, so grouping is a single linear pass.
    let mut groups: Vec<Vec<&FluxPoint>> = Vec::new();
    for p in &points {
        match groups.last_mut() {
            Some(last) if last[0].epoch_id == p.epoch_id => last.push(p),
            _ => groups.push(vec![p]),
        }
    }

    let snr_of = |group: &[&FluxPoint]| -> f64 {
        let flux_sum: f64 = group.iter().map(|p| p.flux).sum();
        let flux_err_sq_sum: f64 = group.iter().map(|p| p.flux_err.powi(2)).sum();
        flux_sum / flux_err_sq_sum.sqrt()
    };

    let snrs: Vec<f64> = groups.iter().map(|g| snr_of(g)).collect();

    let mut selected: Vec<usize> = (0..groups.len()).filter(|&i| snrs[i] >= 300.0).collect();
    if selected.is_empty() {
        selected = (0..groups.len()).filter(|&i| snrs[i] >= 10.0).collect();
    }
    if selected.is_empty() {
        return Vec::new();
    }

    selected
        .into_iter()
        .map(|i| {
            let group = &groups[i];
            let n = group.len();
            let mags: Vec<f64> = group.iter().map(|p| p.mag).collect();
            let mjd_mean = mean(&group.iter().map(|p| p.mjd).collect::<Vec<_>>());
            let mag_mean = mean(&mags);
            let mag_se = if n > 1 { sample_std(&mags) / (n as f64).sqrt() } else { 0.0 };
            let flux_mean = mean(&group.iter().map(|p| p.flux).collect::<Vec<_>>());
            let flux_err_sq_sum: f64 = group.iter().map(|p| p.flux_err.powi(2)).sum();
            let mag_lim_raw = -2.5
                * ((flux_mean - flux_err_sq_sum.sqrt() / n as f64) / flux_mean).log10();
            let mag_lim = if mag_lim_raw.is_finite() { Some(mag_lim_raw) } else { None };

            EpochSummary {
                source_id: source_id.to_string(),
                band,
                epoch_id: group[0].epoch_id,
                mjd_mean: mjd_mean.round() as i64,
                mag_mean,
                mag_se,
                mag_lim,
                n_points: n as i64,
                snr: if snrs[i].is_finite() { Some(snrs[i]) } else { None },
                filter_applied: DEFAULT_FILTER_TAG.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(mjd: f64, mpro: f64) -> BandRow {
        BandRow {
            mjd,
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
        }
    }

    #[test]
    fn clean_series_drops_rows_failing_default_filter() {
        let mut bad = row(55500.0, 15.0);
        bad.ph_qual = "BB".to_string();
        let rows = vec![row(55500.0, 15.0), bad];
        let zp = ZpTable::empty();
        let cleaned = clean_series(&rows, Band::W1, &zp, &FilterToggles::all_enabled());
        assert_eq!(cleaned.len(), 1);
    }

    #[test]
    fn toggle_off_skips_predicate() {
        let mut bad = row(55500.0, 15.0);
        bad.ph_qual = "BB".to_string();
        let rows = vec![bad];
        let zp = ZpTable::empty();
        let mut toggles = FilterToggles::all_enabled();
        toggles.ph_qual = false;
        let cleaned = clean_series(&rows, Band::W1, &zp, &toggles);
        assert_eq!(cleaned.len(), 1);
    }

    #[test]
    fn sigma_zero_keeps_all_rows() {
        let rows = vec![row(55500.0, 15.0), row(55501.0, 15.0), row(55502.0, 15.0)];
        let zp = ZpTable::empty();
        let cleaned = clean_series(&rows, Band::W1, &zp, &FilterToggles::all_enabled());
        assert_eq!(cleaned.len(), 3);
    }

    #[test]
    fn single_point_epoch_has_zero_standard_error() {
        let rows = vec![row(55500.0, 10.0)];
        let zp = ZpTable::empty();
        let epochs = default_epoch_summaries("S1", &rows, Band::W1, &zp);
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].mag_se, 0.0);
        assert_eq!(epochs[0].n_points, 1);
    }

    #[test]
    fn gap_over_100_days_starts_new_epoch() {
        let rows = vec![row(55500.0, 10.0), row(55501.0, 10.0), row(55700.0, 10.0)];
        let zp = ZpTable::empty();
        let epochs = default_epoch_summaries("S1", &rows, Band::W1, &zp);
        let ids: Vec<i64> = epochs.iter().map(|e| e.epoch_id).collect();
        assert!(ids.contains(&0));
        assert!(ids.contains(&1));
    }

    #[test]
    fn low_snr_epoch_is_dropped_entirely() {
        // A single very faint point has far too much flux error relative to
        // flux for either SNR threshold to be met.
        let rows = vec![row(55500.0, 25.0)];
        let zp = ZpTable::empty();
        let epochs = default_epoch_summaries("S1", &rows, Band::W1, &zp);
        assert!(epochs.is_empty());
    }

    #[test]
    fn zero_point_correction_shifts_magnitude() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..12 {
            writeln!(f, "# preamble").unwrap();
        }
        writeln!(f, "scan,mjd,w1dmag,w2dmag").unwrap();
        writeln!(f, "scan1,50000.0,0.1,0.2").unwrap();
        f.flush().unwrap();
        let zp = ZpTable::load(f.path()).unwrap();

        let rows = vec![row(55500.0, 10.0)];
        let corrected = build_raw_observations("S1", &rows, Band::W1, &zp);
        assert_eq!(corrected[0].mpro_corrected, 10.0 - 0.1);
    }

    #[test]
    fn raw_observations_are_built_even_when_every_row_fails_quality_filter() {
        let mut bad = row(55500.0, 10.0);
        bad.ph_qual = "BB".to_string();
        let rows = vec![bad];
        let zp = ZpTable::empty();
        let raw = build_raw_observations("S1", &rows, Band::W1, &zp);
        assert_eq!(raw.len(), 1);
        let epochs = default_epoch_summaries("S1", &rows, Band::W1, &zp);
        assert!(epochs.is_empty());
    }
}
