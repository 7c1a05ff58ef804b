use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use ndarray_linalg::Inverse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("The design matrix is singular; regressors are collinear or constant.")]
    SingularDesign,

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Least squares needs more observations ({observations}) than parameters ({parameters})."
    )]
    InsufficientObservations {
        observations: usize,
        parameters: usize,
    },

    #[error("The regression target has zero (weighted) variance, so R^2 is undefined.")]
    DegenerateTarget,
}

/// Everything the pipeline needs from a fitted linear model.
#[derive(Debug, Clone)]
pub struct RegressionFit {
    pub coefficients: Array1<f64>,
    pub standard_errors: Array1<f64>,
    pub covariance: Array2<f64>,
    pub r_squared: f64,
}

/// A least-squares fitting collaborator.
///
/// The design matrix is used as given, so callers append an intercept column
/// themselves (see [`with_intercept`]).
pub trait Regressor: Send + Sync {
    fn fit(
        &self,
        target: ArrayView1<f64>,
        design: ArrayView2<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<RegressionFit, RegressionError>;
}

/// Ordinary or weighted least squares through the normal equations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastSquares;

impl Regressor for LeastSquares {
    fn fit(
        &self,
        target: ArrayView1<f64>,
        design: ArrayView2<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<RegressionFit, RegressionError> {
        let (n, p) = design.dim();
        if target.len() != n {
            return Err(RegressionError::DimensionMismatch {
                context: "regression target",
                expected: n,
                found: target.len(),
            });
        }
        if n <= p {
            return Err(RegressionError::InsufficientObservations {
                observations: n,
                parameters: p,
            });
        }
        let w = match weights {
            Some(w) if w.len() != n => {
                return Err(RegressionError::DimensionMismatch {
                    context: "regression weights",
                    expected: n,
                    found: w.len(),
                });
            }
            Some(w) => w.to_owned(),
            None => Array1::ones(n),
        };

        // X^T W, one weight per column of the transposed design.
        let xtw = &design.t() * &w;
        let xtwx = xtw.dot(&design);
        let xtwy = xtw.dot(&target);

        let xtwx_inv = xtwx.inv().map_err(|_| RegressionError::SingularDesign)?;
        if xtwx_inv.iter().any(|x| !x.is_finite()) {
            return Err(RegressionError::SingularDesign);
        }
        let coefficients = xtwx_inv.dot(&xtwy);

        let residuals = &target - &design.dot(&coefficients);
        let weighted_sse: f64 = residuals
            .iter()
            .zip(w.iter())
            .map(|(r, wi)| wi * r * r)
            .sum();

        let total_weight = w.sum();
        if total_weight <= 0.0 {
            return Err(RegressionError::DegenerateTarget);
        }
        let weighted_mean = w.dot(&target) / total_weight;
        let weighted_sst: f64 = target
            .iter()
            .zip(w.iter())
            .map(|(y, wi)| wi * (y - weighted_mean).powi(2))
            .sum();
        if weighted_sst <= 0.0 {
            return Err(RegressionError::DegenerateTarget);
        }

        let scale = weighted_sse / (n - p) as f64;
        let covariance = xtwx_inv * scale;
        let standard_errors = covariance.diag().mapv(|v| v.max(0.0).sqrt());

        Ok(RegressionFit {
            coefficients,
            standard_errors,
            covariance,
            r_squared: 1.0 - weighted_sse / weighted_sst,
        })
    }
}

/// Appends a constant column as the last regressor.
pub fn with_intercept(columns: ArrayView2<f64>) -> Array2<f64> {
    let (n, p) = columns.dim();
    let mut design = Array2::ones((n, p + 1));
    design.slice_mut(s![.., ..p]).assign(&columns);
    design
}
