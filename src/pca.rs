// pca.rs
//
// The numerical PCA engine: matrix assembly, per-gene z-score normalization,
// covariance, eigendecomposition, top-component selection, and the projection
// and variance metrics built from the selected eigenpairs.

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rayon::prelude::*;
use thiserror::Error;

use crate::model::{CellLine, FeatureSchema};

/// Eigenvalues of a covariance matrix are non-negative in exact arithmetic;
/// anything more negative than this is treated as a real defect rather than
/// floating-point noise.
pub const EIGENVALUE_NOISE_TOLERANCE: f64 = 1e-9;

/// Max absolute residual allowed when checking `cov . v = lambda * v`.
pub const EIGEN_RESIDUAL_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum PcaError {
    #[error("cell line '{entity}' carries {got} expression values but the schema defines {expected} genes")]
    ShapeMismatch {
        entity: String,
        got: usize,
        expected: usize,
    },
    #[error("feature column {column} has zero standard deviation and cannot be z-score normalized")]
    DegenerateFeature { column: usize },
    #[error("covariance requires at least 2 samples, found {rows}")]
    InsufficientSamples { rows: usize },
    #[error("requested {requested} components but only {available} usable eigenvalues are available")]
    InvalidComponentCount { requested: usize, available: usize },
    #[error("no non-NaN candidate remains while scanning for a maximum")]
    NoFiniteCandidate,
    #[error("eigenvalue {index} is {value}, more negative than floating-point noise can explain")]
    NegativeEigenvalue { index: usize, value: f64 },
    #[error("eigenpair {index} failed the round-trip check (max residual {residual:e})")]
    EigenCheck { index: usize, residual: f64 },
    #[error("eigendecomposition failed: {0}")]
    Eigen(#[from] ndarray_linalg::error::LinalgError),
}

/// Builds the M x N data matrix from an ordered cell-line list: row i is
/// entity i's expression values in schema order.
///
/// Each entity's own schema handle is checked against the run schema's
/// length, so no partial matrix can escape if a record built against a
/// different schema slipped into the working set.
pub fn assemble_matrix(
    schema: &FeatureSchema,
    cell_lines: &[CellLine],
) -> Result<Array2<f64>, PcaError> {
    let n_genes = schema.len();
    let mut matrix = Array2::<f64>::zeros((cell_lines.len(), n_genes));
    for (row, line) in cell_lines.iter().enumerate() {
        if line.schema().len() != n_genes {
            return Err(PcaError::ShapeMismatch {
                entity: line.name().to_string(),
                got: line.schema().len(),
                expected: n_genes,
            });
        }
        matrix.row_mut(row).assign(&ArrayView1::from(line.expression()));
    }
    Ok(matrix)
}

/// Z-score normalizes a matrix per column into a fresh copy; the input is
/// never mutated.
///
/// Population-style statistics: mean over M, variance = mean squared
/// deviation over M (not M-1), std = sqrt(variance). A zero or non-finite
/// column std is surfaced as an error instead of leaking infinities into the
/// covariance step.
pub fn normalize_matrix(matrix: &Array2<f64>) -> Result<Array2<f64>, PcaError> {
    let m = matrix.nrows();
    if m == 0 {
        return Err(PcaError::InsufficientSamples { rows: 0 });
    }
    let m = m as f64;

    let mut normalized = matrix.clone();
    for (column, mut col) in normalized.axis_iter_mut(Axis(1)).enumerate() {
        let mean = col.sum() / m;
        let variance = col.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / m;
        let std = variance.sqrt();
        if std == 0.0 || !std.is_finite() {
            return Err(PcaError::DegenerateFeature { column });
        }
        col.mapv_inplace(|x| (x - mean) / std);
    }
    Ok(normalized)
}

/// Unbiased sample covariance of two columns, in the re-centering form: both
/// columns are mean-subtracted before the cross product, so the result is
/// correct whether or not the input happens to be pre-centered.
///
/// On already-mean-zero columns this reduces to the raw-moment shortcut
/// `sum(x*y) / (M-1)`; the equivalence on normalized input is covered by a
/// test rather than relied on here.
fn column_covariance(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
    let m = x.len() as f64;
    let x_mean = x.sum() / m;
    let y_mean = y.sum() / m;
    let cross: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(a, b)| (a - x_mean) * (b - y_mean))
        .sum();
    cross / (m - 1.0)
}

/// Computes the N x N covariance matrix of the columns of an M x N matrix.
///
/// Only the upper triangle (including the diagonal) is computed; each entry
/// is copied to its mirror slot, so `cov[[i, j]]` and `cov[[j, i]]` are the
/// same value exactly, not two independent computations. Upper-triangle rows
/// are independent and computed in parallel.
pub fn covariance_matrix(normalized: &Array2<f64>) -> Result<Array2<f64>, PcaError> {
    let m = normalized.nrows();
    if m <= 1 {
        return Err(PcaError::InsufficientSamples { rows: m });
    }
    let n = normalized.ncols();

    let triangle_rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let xi = normalized.column(i);
            (i..n)
                .map(|j| column_covariance(xi, normalized.column(j)))
                .collect()
        })
        .collect();

    let mut cov = Array2::<f64>::zeros((n, n));
    for (i, row) in triangle_rows.into_iter().enumerate() {
        for (offset, value) in row.into_iter().enumerate() {
            let j = i + offset;
            cov[[i, j]] = value;
            cov[[j, i]] = value;
        }
    }
    Ok(cov)
}

/// Eigendecomposition of the symmetric covariance matrix.
///
/// Uses the symmetric-specialized solver, so eigenvalues and eigenvectors are
/// real by construction and no complex intermediates reach the callers.
/// Eigenvectors are the columns of the returned matrix; no ordering is
/// guaranteed here, ordering is imposed by `top_component_indices`.
pub fn eigendecompose(cov: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>), PcaError> {
    let (values, vectors) = cov.eigh(UPLO::Upper)?;
    Ok((values, vectors))
}

/// Checks every eigenpair against `cov . v = lambda * v`, rejects
/// non-finite results, and rejects eigenvalues more negative than
/// floating-point noise can explain, so an ill-conditioned or non-PSD
/// input is reported instead of contaminating the projection downstream.
///
/// The negative check runs over the whole spectrum here, not only the
/// selected components: a non-PSD covariance poisons the explained-variance
/// denominator (the sum of all eigenvalues) even when the negative
/// eigenvalue itself is never selected.
pub fn verify_eigenpairs(
    cov: &Array2<f64>,
    values: &Array1<f64>,
    vectors: &Array2<f64>,
) -> Result<(), PcaError> {
    for (index, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(PcaError::EigenCheck {
                index,
                residual: f64::NAN,
            });
        }
        if value < -EIGENVALUE_NOISE_TOLERANCE {
            return Err(PcaError::NegativeEigenvalue { index, value });
        }
        let v = vectors.column(index);
        let av = cov.dot(&v);
        let residual = av
            .iter()
            .zip(v.iter())
            .map(|(a, x)| (a - value * x).abs())
            .fold(0.0_f64, f64::max);
        if !residual.is_finite() || residual > EIGEN_RESIDUAL_TOLERANCE {
            return Err(PcaError::EigenCheck { index, residual });
        }
    }
    Ok(())
}

/// Index of the largest non-NaN value, first occurrence winning ties.
///
/// Seeds from the first non-NaN entry, then linear-scans with a strict `>`
/// comparison, skipping NaN candidates. The strict comparison is what makes
/// the tie-break-to-first-index behavior a firm contract.
fn max_index(values: &[f64]) -> Result<usize, PcaError> {
    let mut best = values
        .iter()
        .position(|v| !v.is_nan())
        .ok_or(PcaError::NoFiniteCandidate)?;
    let mut max = values[best];
    for (index, &value) in values.iter().enumerate() {
        if !value.is_nan() && value > max {
            max = value;
            best = index;
        }
    }
    Ok(best)
}

/// Indices of the K largest eigenvalues, highest first, never selecting a NaN
/// entry. The input is copied, never mutated; each selected slot in the copy
/// is overwritten with NaN so it cannot be selected again. O(K*L).
pub fn top_component_indices(eigenvalues: &[f64], k: usize) -> Result<Vec<usize>, PcaError> {
    let available = eigenvalues.iter().filter(|v| !v.is_nan()).count();
    if k == 0 || k > eigenvalues.len() || k > available {
        return Err(PcaError::InvalidComponentCount {
            requested: k,
            available,
        });
    }

    let mut scratch = eigenvalues.to_vec();
    let mut indices = Vec::with_capacity(k);
    for _ in 0..k {
        let index = max_index(&scratch)?;
        indices.push(index);
        scratch[index] = f64::NAN;
    }
    Ok(indices)
}

/// Stacks the selected eigenvectors as columns into the N x K projection
/// matrix.
pub fn projection_matrix(vectors: &Array2<f64>, selected: &[usize]) -> Array2<f64> {
    let n = vectors.nrows();
    let mut projection = Array2::<f64>::zeros((n, selected.len()));
    for (col, &index) in selected.iter().enumerate() {
        projection.column_mut(col).assign(&vectors.column(index));
    }
    projection
}

/// Projects the normalized M x N matrix into the K-dimensional subspace.
pub fn project(normalized: &Array2<f64>, projection: &Array2<f64>) -> Array2<f64> {
    normalized.dot(projection)
}

/// Loadings for the selected components: each eigenvector scaled by the
/// square root of its eigenvalue.
///
/// Eigenvalues within noise tolerance of zero are clamped to zero before the
/// square root; materially negative eigenvalues are an error, not a NaN.
pub fn component_loadings(
    values: &Array1<f64>,
    vectors: &Array2<f64>,
    selected: &[usize],
) -> Result<Vec<Array1<f64>>, PcaError> {
    selected
        .iter()
        .map(|&index| {
            let value = values[index];
            if value < -EIGENVALUE_NOISE_TOLERANCE {
                return Err(PcaError::NegativeEigenvalue { index, value });
            }
            let scale = value.max(0.0).sqrt();
            Ok(vectors.column(index).mapv(|x| x * scale))
        })
        .collect()
}

/// Explained-variance fraction per selected component: eigenvalue divided by
/// the sum of all eigenvalues.
pub fn explained_variance(values: &Array1<f64>, selected: &[usize]) -> Vec<f64> {
    let total: f64 = values.sum();
    selected.iter().map(|&index| values[index] / total).collect()
}

/// Running prefix sums of the fractions, in selection order, with a leading
/// zero: the result has length K+1 and `cumulative[0] == 0`.
pub fn cumulative_explained_variance(fractions: &[f64]) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(fractions.len() + 1);
    cumulative.push(0.0);
    let mut running = 0.0;
    for &fraction in fractions {
        running += fraction;
        cumulative.push(running);
    }
    cumulative
}

/// Everything the plotting collaborator consumes for one run.
#[derive(Debug)]
pub struct PcaRun {
    /// Indices into the eigenpair set, highest eigenvalue first.
    pub selected: Vec<usize>,
    /// Eigenvalues of the selected components, in selection order.
    pub eigenvalues: Vec<f64>,
    /// M x K subspace coordinates, row-aligned with the cell-line list.
    pub scores: Array2<f64>,
    /// Per-component loading vectors (length N), in selection order.
    pub loadings: Vec<Array1<f64>>,
    /// Explained-variance fraction per selected component.
    pub explained: Vec<f64>,
    /// Length K+1 prefix sums of `explained`, leading zero included.
    pub cumulative: Vec<f64>,
}

/// Runs the full engine: assemble, normalize, covariance, eigendecompose,
/// verify, select the top K components, and build projection and metrics.
pub fn run_pca(
    schema: &FeatureSchema,
    cell_lines: &[CellLine],
    components: usize,
) -> Result<PcaRun, PcaError> {
    info!(
        "Assembling {} x {} expression matrix...",
        cell_lines.len(),
        schema.len()
    );
    let matrix = assemble_matrix(schema, cell_lines)?;

    info!("Z-score normalizing {} gene columns...", matrix.ncols());
    let normalized = normalize_matrix(&matrix)?;

    info!("Computing {n} x {n} covariance matrix...", n = normalized.ncols());
    let cov = covariance_matrix(&normalized)?;

    info!("Eigendecomposing the covariance matrix...");
    let (values, vectors) = eigendecompose(&cov)?;
    verify_eigenpairs(&cov, &values, &vectors)?;
    debug!(
        "Eigenvalue range: [{:.6}, {:.6}]",
        values.iter().cloned().fold(f64::INFINITY, f64::min),
        values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    );

    let selected = top_component_indices(&values.to_vec(), components)?;
    info!(
        "Selected top {} components (eigenpair indices {:?}).",
        components, selected
    );

    let projection = projection_matrix(&vectors, &selected);
    let scores = project(&normalized, &projection);
    let loadings = component_loadings(&values, &vectors, &selected)?;
    let explained = explained_variance(&values, &selected);
    let cumulative = cumulative_explained_variance(&explained);

    Ok(PcaRun {
        eigenvalues: selected.iter().map(|&i| values[i]).collect(),
        selected,
        scores,
        loadings,
        explained,
        cumulative,
    })
}
