//! Python bindings, built with the `python` feature.
//!
//! Series cross the boundary as `(t0, sample_rate, samples)` tuples.

use std::path::PathBuf;

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::checkpoint::ScanCheckpoint;
use crate::conditioning;
use crate::primary;
use crate::types::{CorrelationFeatures, LoudestTileRecord, TimeSeries};

type PySeries = (f64, f64, Vec<f64>);

fn into_tuple(series: TimeSeries) -> PySeries {
    (series.t0, series.sample_rate, series.data)
}

/// Read the records of a `summary.csv` checkpoint.
#[pyfunction]
#[pyo3(signature = (path, correlated = false))]
fn load_summary(path: PathBuf, correlated: bool) -> PyResult<Vec<LoudestTileRecord>> {
    let (table, _) = ScanCheckpoint::new(path, correlated)
        .load()
        .map_err(|e| PyIOError::new_err(e.to_string()))?;
    Ok(table.iter().cloned().collect())
}

/// Whiten a series; returns the whitened series.
#[pyfunction]
#[pyo3(signature = (t0, sample_rate, data, fftlength, resample = None, f_low = None))]
fn condition(
    t0: f64,
    sample_rate: f64,
    data: Vec<f64>,
    fftlength: f64,
    resample: Option<f64>,
    f_low: Option<f64>,
) -> PyResult<PySeries> {
    let series = TimeSeries::new("python", t0, sample_rate, data);
    let conditioned = conditioning::condition(&series, fftlength, None, resample, f_low)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(into_tuple(conditioned.whitened))
}

/// Matched-filter `xoft` against `template`.
#[pyfunction]
fn cross_correlate(xoft: PySeries, template: PySeries) -> PyResult<PySeries> {
    let xoft = TimeSeries::new("xoft", xoft.0, xoft.1, xoft.2);
    let template = TimeSeries::new("template", template.0, template.1, template.2);
    primary::cross_correlate(&xoft, &template)
        .map(into_tuple)
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

/// The top-level Python module exposed by this crate.
#[pymodule]
fn omegascan_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<LoudestTileRecord>()?;
    m.add_class::<CorrelationFeatures>()?;
    m.add_function(wrap_pyfunction!(load_summary, m)?)?;
    m.add_function(wrap_pyfunction!(condition, m)?)?;
    m.add_function(wrap_pyfunction!(cross_correlate, m)?)?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Omega scan engine core.")?;

    Ok(())
}
