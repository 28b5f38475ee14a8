/// Source localization by inverse-distance-weighted grid search.
///
/// After ingestion ends, every location contributes its overall average as
/// a sample. The bounding box of the locations is divided into a grid, each
/// cell is scored with the IDW-interpolated value at that point, and the
/// highest-scoring cell is reported as the estimated source.
///
/// Scoring goes through `FieldEstimator`. `InverseDistance` is a plain scan
/// over every sample per cell, which is fine for a few hundred locations; a
/// spatial index can replace it without touching the grid search.

use serde::Serialize;

use crate::config::LocalizationConfig;
use crate::ledger::Ledger;
use crate::model::PotentialSource;

// ---------------------------------------------------------------------------
// Bounding box and grid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// Bounding box of `points`.
///
/// With `include_origin` the box is seeded at (0, 0) and therefore always
/// contains the origin, even when every point lies on one side of it; this
/// is the historical behavior and changes results, so it is the default.
/// Without it the box is seeded at the first point, and an empty input has
/// no box.
pub fn bounding_box<I>(points: I, include_origin: bool) -> Option<Bounds>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut points = points.into_iter();
    let seed = if include_origin { Some((0.0, 0.0)) } else { points.next() };
    let (x0, y0) = seed?;

    let mut bounds = Bounds { x_min: x0, x_max: x0, y_min: y0, y_max: y0 };
    for (x, y) in points {
        bounds.x_min = bounds.x_min.min(x);
        bounds.x_max = bounds.x_max.max(x);
        bounds.y_min = bounds.y_min.min(y);
        bounds.y_max = bounds.y_max.max(y);
    }
    Some(bounds)
}

/// Grid coordinates along one axis: `min + i * step` for `i` in
/// `0..divisions`, with `step = (max - min) / divisions`. The upper edge is
/// not included. A zero-width axis collapses to the single value `min`.
pub fn axis_values(min: f64, max: f64, divisions: usize) -> Vec<f64> {
    if divisions == 0 || !(max > min) {
        return vec![min];
    }
    let step = (max - min) / divisions as f64;
    (0..divisions).map(|i| min + i as f64 * step).collect()
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

/// A known value at a known point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub value: f64,
}

pub trait FieldEstimator {
    /// Estimated field value at `(x, y)`, or `None` if there is nothing to
    /// estimate from.
    fn expected_value(&self, x: f64, y: f64) -> Option<f64>;
}

/// Inverse-distance weighting with power 2: `wᵢ = 1 / dᵢ²`.
#[derive(Debug, Clone, Default)]
pub struct InverseDistance {
    samples: Vec<Sample>,
}

impl InverseDistance {
    pub fn new(samples: Vec<Sample>) -> Self {
        InverseDistance { samples }
    }

    /// One sample per location: its coordinates and overall average value.
    pub fn from_ledger(ledger: &Ledger) -> Self {
        InverseDistance::new(
            ledger
                .iter()
                .map(|location| Sample {
                    x: location.x,
                    y: location.y,
                    value: location.overall_average_value(),
                })
                .collect(),
        )
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl FieldEstimator for InverseDistance {
    /// A point on top of a sample has an unbounded weight there. Such points
    /// take the mean of the coincident samples, which is the limit of the
    /// weighted mean as the distance goes to zero.
    fn expected_value(&self, x: f64, y: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut weight_sum = 0.0;
        let mut weighted_value_sum = 0.0;
        let mut coincident_sum = 0.0;
        let mut coincident_count = 0usize;

        for sample in &self.samples {
            let distance_squared = (x - sample.x).powi(2) + (y - sample.y).powi(2);
            let weight = 1.0 / distance_squared;
            if !weight.is_finite() {
                coincident_sum += sample.value;
                coincident_count += 1;
                continue;
            }
            weight_sum += weight;
            weighted_value_sum += sample.value * weight;
        }

        if coincident_count > 0 {
            Some(coincident_sum / coincident_count as f64)
        } else {
            Some(weighted_value_sum / weight_sum)
        }
    }
}

// ---------------------------------------------------------------------------
// Grid search
// ---------------------------------------------------------------------------

/// Scores every cell of the grid over `bounds` and returns the cells in
/// descending order of value. Ties keep grid order (x-major), so the first
/// cell reached wins. Cells the estimator cannot score are left out.
pub fn grid_search(bounds: &Bounds, divisions: usize, estimator: &dyn FieldEstimator) -> Vec<PotentialSource> {
    let xs = axis_values(bounds.x_min, bounds.x_max, divisions);
    let ys = axis_values(bounds.y_min, bounds.y_max, divisions);

    let mut cells = Vec::with_capacity(xs.len() * ys.len());
    for &x in &xs {
        for &y in &ys {
            if let Some(value) = estimator.expected_value(x, y).filter(|v| v.is_finite()) {
                cells.push(PotentialSource { x, y, value });
            }
        }
    }

    cells.sort_by(|a, b| b.value.total_cmp(&a.value));
    cells
}

#[derive(Debug, Clone)]
pub struct Localization {
    pub best: PotentialSource,
    /// Every scored cell, best first.
    pub grid: Vec<PotentialSource>,
    pub bounds: Bounds,
}

/// Estimates the source location from the overall averages in `ledger`.
/// Returns `None` when there are no locations to estimate from.
pub fn localize(ledger: &Ledger, config: &LocalizationConfig) -> Option<Localization> {
    if ledger.is_empty() {
        return None;
    }
    let estimator = InverseDistance::from_ledger(ledger);
    let bounds = bounding_box(estimator.samples().iter().map(|s| (s.x, s.y)), config.include_origin)?;
    let grid = grid_search(&bounds, config.grid_divisions, &estimator);
    let best = *grid.first()?;
    Some(Localization { best, grid, bounds })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
