// ========================================================================================
//
//                     Correction matrix construction and application
//
// ========================================================================================
//
// Regressors are laid out as `G` (the standardized proxy followed by its
// interaction columns) and then `Z` (covariates). Every matrix here follows that
// order: index 0 is the proxy, indices `1..k` are interactions, the rest are
// covariates.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Inverse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorrectionError {
    #[error("The reliability ratio rho must be finite and non-zero, got {0}.")]
    InvalidReliability(f64),

    #[error(
        "The center matrix is singular and cannot be inverted. This usually means the interaction covariates are nearly collinear."
    )]
    SingularCenterMatrix,

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "The corrected variance of coefficient {index} is negative ({value}); the coefficient covariance is not positive semi-definite."
    )]
    NegativeVariance { index: usize, value: f64 },
}

/// Negative corrected variances within this fraction of the largest diagonal
/// entry are treated as round-off and clamped to zero.
pub const NEGATIVE_VARIANCE_TOLERANCE: f64 = 1e-10;

/// Mean vector and population covariance of the covariates that interaction
/// columns were built from, in the same order as the interaction columns.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionMoments {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl InteractionMoments {
    /// Moments of the given columns (one observation per row).
    pub fn from_columns(sources: ArrayView2<f64>) -> Self {
        let width = sources.ncols();
        let mean = sources
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(width));
        Self {
            mean,
            covariance: covariance_matrix(sources),
        }
    }

    pub fn none() -> Self {
        Self {
            mean: Array1::zeros(0),
            covariance: Array2::zeros((0, 0)),
        }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

/// Column covariance with divisor `n`, matching the divisor used to standardize the proxy.
pub fn covariance_matrix(data: ArrayView2<f64>) -> Array2<f64> {
    let (n, width) = data.dim();
    if n == 0 {
        return Array2::zeros((width, width));
    }
    let mean = data
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(width));
    let centered = &data - &mean;
    centered.t().dot(&centered) / n as f64
}

/// Builds and inverts the center matrix of the correction product.
///
/// Starting from `v`, the proxy variance is replaced by `rho^-2`, and the
/// proxy/interaction block is shifted by `(1 - rho^-2)` times the interaction
/// source moments. The number of interaction columns is taken from `moments`.
pub fn center_matrix(
    v: ArrayView2<f64>,
    rho: f64,
    moments: &InteractionMoments,
) -> Result<Array2<f64>, CorrectionError> {
    if !rho.is_finite() || rho == 0.0 {
        return Err(CorrectionError::InvalidReliability(rho));
    }
    if v.nrows() != v.ncols() {
        return Err(CorrectionError::DimensionMismatch {
            context: "regressor covariance (columns)",
            expected: v.nrows(),
            found: v.ncols(),
        });
    }
    let interactions = moments.len();
    if moments.covariance.dim() != (interactions, interactions) {
        return Err(CorrectionError::DimensionMismatch {
            context: "interaction source covariance",
            expected: interactions,
            found: moments.covariance.nrows(),
        });
    }
    if v.nrows() < interactions + 1 {
        return Err(CorrectionError::DimensionMismatch {
            context: "regressor covariance (proxy and interaction terms)",
            expected: interactions + 1,
            found: v.nrows(),
        });
    }

    let rho_sq_recip = rho.powi(-2);
    let shrink = 1.0 - rho_sq_recip;

    let mut c = v.to_owned();
    c[[0, 0]] = rho_sq_recip;
    for j in 0..interactions {
        let shifted = c[[0, j + 1]] - shrink * moments.mean[j];
        c[[0, j + 1]] = shifted;
        c[[j + 1, 0]] = shifted;
    }
    for i in 0..interactions {
        for j in 0..interactions {
            let second_moment = moments.covariance[[i, j]] + moments.mean[i] * moments.mean[j];
            c[[i + 1, j + 1]] -= shrink * second_moment;
        }
    }
    debug!("uninverted center matrix = \n{c:?}");

    let inverse = c
        .inv()
        .map_err(|_| CorrectionError::SingularCenterMatrix)?;
    if inverse.iter().any(|x| !x.is_finite()) {
        return Err(CorrectionError::SingularCenterMatrix);
    }
    Ok(inverse)
}

/// The full correction operator `M`: center matrix times `v`, with the first
/// `proxy_terms` rows scaled by `1 / rho`.
pub fn build_correction_matrix(
    v: ArrayView2<f64>,
    rho: f64,
    moments: &InteractionMoments,
    proxy_terms: usize,
) -> Result<Array2<f64>, CorrectionError> {
    if proxy_terms != moments.len() + 1 {
        return Err(CorrectionError::DimensionMismatch {
            context: "proxy terms versus interaction sources",
            expected: moments.len() + 1,
            found: proxy_terms,
        });
    }

    let center = center_matrix(v, rho, moments)?;
    debug!("center matrix = \n{center:?}");

    let mut m = center.dot(&v);
    m.slice_mut(s![0..proxy_terms, ..])
        .mapv_inplace(|x| x / rho);
    debug!("correction matrix = \n{m:?}");
    Ok(m)
}

/// `M * raw`.
pub fn correct_coefficients(
    m: ArrayView2<f64>,
    raw: ArrayView1<f64>,
) -> Result<Array1<f64>, CorrectionError> {
    if raw.len() != m.ncols() {
        return Err(CorrectionError::DimensionMismatch {
            context: "coefficient vector",
            expected: m.ncols(),
            found: raw.len(),
        });
    }
    Ok(m.dot(&raw))
}

/// `sqrt(diag(M * cov * M^T))`. Negative round-off within
/// [`NEGATIVE_VARIANCE_TOLERANCE`] is clamped to zero; anything larger is an error.
pub fn correct_standard_errors(
    m: ArrayView2<f64>,
    covariance: ArrayView2<f64>,
) -> Result<Array1<f64>, CorrectionError> {
    if m.nrows() != m.ncols() {
        return Err(CorrectionError::DimensionMismatch {
            context: "correction matrix (columns)",
            expected: m.nrows(),
            found: m.ncols(),
        });
    }
    if covariance.nrows() != covariance.ncols() {
        return Err(CorrectionError::DimensionMismatch {
            context: "coefficient covariance (columns)",
            expected: covariance.nrows(),
            found: covariance.ncols(),
        });
    }
    if covariance.nrows() != m.ncols() {
        return Err(CorrectionError::DimensionMismatch {
            context: "coefficient covariance",
            expected: m.ncols(),
            found: covariance.nrows(),
        });
    }

    let product = m.dot(&covariance).dot(&m.t());
    let diagonal = product.diag();
    let scale = diagonal.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));
    if let Some((index, &value)) = diagonal
        .iter()
        .enumerate()
        .find(|&(_, &x)| x < -NEGATIVE_VARIANCE_TOLERANCE * scale)
    {
        return Err(CorrectionError::NegativeVariance { index, value });
    }
    Ok(diagonal.mapv(|x| x.max(0.0).sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    fn assert_matrix_close(actual: &Array2<f64>, expected: &Array2<f64>, epsilon: f64) {
        assert_eq!(actual.dim(), expected.dim());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = epsilon);
        }
    }

    fn moments(mean: Array1<f64>, covariance: Array2<f64>) -> InteractionMoments {
        InteractionMoments { mean, covariance }
    }

    #[test]
    fn center_matrix_is_identity_when_rho_is_one() {
        let v = Array2::eye(5);
        let m = moments(Array1::zeros(2), Array2::eye(2));
        let center = center_matrix(v.view(), 1.0, &m).unwrap();
        assert_matrix_close(&center, &Array2::eye(5), 1e-12);
    }

    #[test]
    fn center_matrix_scales_proxy_block_by_rho_squared() {
        let v = Array2::eye(5);
        let m = moments(Array1::zeros(2), Array2::eye(2));
        let center = center_matrix(v.view(), 2.0, &m).unwrap();
        let expected = Array2::from_diag(&array![4.0, 4.0, 4.0, 1.0, 1.0]);
        assert_matrix_close(&center, &expected, 1e-12);
    }

    #[test]
    fn center_matrix_accounts_for_interaction_means() {
        let v = Array2::eye(5);
        let m = moments(
            array![-2.0 / 3.0, -1.0 / 3.0],
            array![[-10.0 / 9.0, 4.0 / 9.0], [4.0 / 9.0, -4.0 / 9.0]],
        );
        let center = center_matrix(v.view(), 2.0, &m).unwrap();
        let expected = array![
            [-13.0, 6.0, 5.0, 0.0, 0.0],
            [6.0, -2.0, -2.0, 0.0, 0.0],
            [5.0, -2.0, -1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 0.0, 1.0]
        ];
        assert_matrix_close(&center, &expected, 1e-9);
    }

    #[test]
    fn zero_rho_is_rejected() {
        let v = Array2::eye(2);
        let result = center_matrix(v.view(), 0.0, &InteractionMoments::none());
        assert!(matches!(result, Err(CorrectionError::InvalidReliability(_))));
        let result = center_matrix(v.view(), f64::NAN, &InteractionMoments::none());
        assert!(matches!(result, Err(CorrectionError::InvalidReliability(_))));
    }

    #[test]
    fn singular_center_matrix_is_surfaced() {
        // With rho = 1 the center matrix equals v, which is rank one here.
        let v = array![[1.0, 1.0], [1.0, 1.0]];
        let result = build_correction_matrix(v.view(), 1.0, &InteractionMoments::none(), 1);
        assert!(matches!(result, Err(CorrectionError::SingularCenterMatrix)));
    }

    #[test]
    fn single_proxy_with_diagonal_covariance_scales_only_the_proxy() {
        let rho = 1.7;
        let v = Array2::from_diag(&array![1.0, 2.0, 3.0]);
        let m = build_correction_matrix(v.view(), rho, &InteractionMoments::none(), 1).unwrap();
        assert_matrix_close(&m, &Array2::from_diag(&array![rho, 1.0, 1.0]), 1e-12);

        let raw = array![0.8, -0.3, 1.1];
        let corrected = correct_coefficients(m.view(), raw.view()).unwrap();
        assert_abs_diff_eq!(corrected[0], raw[0] * rho, epsilon = 1e-12);
        assert_abs_diff_eq!(corrected[1], raw[1], epsilon = 1e-12);
        assert_abs_diff_eq!(corrected[2], raw[2], epsilon = 1e-12);

        let raw_se = array![0.05, 0.02, 0.07];
        let raw_cov = Array2::from_diag(&raw_se.mapv(|se: f64| se * se));
        let corrected_se = correct_standard_errors(m.view(), raw_cov.view()).unwrap();
        assert_abs_diff_eq!(corrected_se[0], raw_se[0] * rho, epsilon = 1e-12);
        assert_abs_diff_eq!(corrected_se[1], raw_se[1], epsilon = 1e-12);
        assert_abs_diff_eq!(corrected_se[2], raw_se[2], epsilon = 1e-12);
    }

    #[test]
    fn proxy_term_count_must_match_interactions() {
        let v = Array2::eye(3);
        let result = build_correction_matrix(v.view(), 1.5, &InteractionMoments::none(), 2);
        assert!(matches!(
            result,
            Err(CorrectionError::DimensionMismatch { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn coefficient_correction_is_a_matrix_product() {
        let identity = Array2::eye(5);
        for c in [Array1::zeros(5), Array1::ones(5), array![1.0, -2.0, 3.5, 0.0, 9.0]] {
            let corrected = correct_coefficients(identity.view(), c.view()).unwrap();
            assert_eq!(corrected, c);
        }
        let ones = Array2::ones((5, 5));
        let corrected = correct_coefficients(ones.view(), Array1::ones(5).view()).unwrap();
        assert_eq!(corrected, Array1::from_elem(5, 5.0));
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let identity: Array2<f64> = Array2::eye(5);
        let short = Array1::ones(4);
        assert!(matches!(
            correct_coefficients(identity.view(), short.view()),
            Err(CorrectionError::DimensionMismatch { expected: 5, found: 4, .. })
        ));

        let non_square = Array2::<f64>::zeros((5, 4));
        assert!(matches!(
            correct_standard_errors(identity.view(), non_square.view()),
            Err(CorrectionError::DimensionMismatch { .. })
        ));
        let wrong_size = Array2::<f64>::eye(3);
        assert!(matches!(
            correct_standard_errors(identity.view(), wrong_size.view()),
            Err(CorrectionError::DimensionMismatch { expected: 5, found: 3, .. })
        ));
    }

    #[test]
    fn covariance_uses_population_divisor() {
        let data = Array::from_shape_vec((4, 2), vec![1.0, 2.0, -1.0, 2.0, 1.0, -2.0, -1.0, -2.0])
            .unwrap();
        let cov = covariance_matrix(data.view());
        assert_matrix_close(&cov, &array![[1.0, 0.0], [0.0, 4.0]], 1e-12);

        let m = InteractionMoments::from_columns(data.view());
        assert_abs_diff_eq!(m.mean[0], 0.0, epsilon = 1e-12);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn negative_corrected_variance_is_an_error() {
        let identity = Array2::eye(2);
        let indefinite = array![[1.0, 0.0], [0.0, -0.5]];
        assert!(matches!(
            correct_standard_errors(identity.view(), indefinite.view()),
            Err(CorrectionError::NegativeVariance { index: 1, .. })
        ));

        let round_off = array![[1.0, 0.0], [0.0, -1e-14]];
        let se = correct_standard_errors(identity.view(), round_off.view()).unwrap();
        assert_eq!(se, array![1.0, 0.0]);
    }
}
