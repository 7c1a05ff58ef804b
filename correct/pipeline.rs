// ========================================================================================
//
//                               The estimation pipeline
//
// ========================================================================================
//
// One pass: acquire h^2 and R^2, compute rho, fit the base regression, build the
// correction matrix, and correct. The jackknife engine calls `estimate` once per
// block with a block-scoped context.

use crate::correction::{
    CorrectionError, InteractionMoments, build_correction_matrix, correct_coefficients,
    correct_standard_errors, covariance_matrix,
};
use crate::data::{PersonId, RegressionData};
use crate::errors::{PipelineError, WarningPolicy};
use crate::heritability::{HeritabilityEstimator, HeritabilityRequest};
use crate::jackknife::JackknifeErrors;
use crate::regression::{Regressor, with_intercept};
use crate::reliability::reliability_ratio;
use log::{debug, info};
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ========================================================================================
//                                    Configuration
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JackknifeConfig {
    pub num_blocks: usize,
    /// Fixed seed for the block permutation; fresh entropy when absent.
    pub seed: Option<u64>,
    /// Worker threads for running blocks concurrently.
    pub threads: usize,
}

/// Immutable run configuration shared by every pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Supplied heritability; estimated by the heritability backend when absent.
    pub h2: Option<f64>,
    /// Supplied R^2; estimated by regressing the proxy phenotype on the proxy when absent.
    pub r2: Option<f64>,
    pub strict: bool,
    pub jackknife: Option<JackknifeConfig>,
}

impl CorrectionConfig {
    pub fn policy(&self) -> WarningPolicy {
        WarningPolicy {
            strict: self.strict,
        }
    }
}

/// Everything one pipeline invocation needs besides the data.
///
/// Block contexts are derived with [`PipelineContext::for_block`]; the base
/// context is never changed.
#[derive(Clone)]
pub struct PipelineContext<'a> {
    pub config: &'a CorrectionConfig,
    pub regressor: &'a dyn Regressor,
    pub heritability: Option<&'a dyn HeritabilityEstimator>,
    pub scratch_dir: PathBuf,
    pub excluded: Vec<PersonId>,
    pub label: String,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        config: &'a CorrectionConfig,
        regressor: &'a dyn Regressor,
        heritability: Option<&'a dyn HeritabilityEstimator>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            regressor,
            heritability,
            scratch_dir: scratch_dir.into(),
            excluded: Vec::new(),
            label: "full sample".to_string(),
        }
    }

    /// A context for jackknife block `block` that leaves out `excluded`.
    pub fn for_block(&self, block: usize, excluded: Vec<PersonId>) -> Self {
        Self {
            config: self.config,
            regressor: self.regressor,
            heritability: self.heritability,
            scratch_dir: self.scratch_dir.join(format!("jk_block_{block}")),
            excluded,
            label: format!("jackknife block {block}"),
        }
    }

    /// True when h^2 has to come from the heritability backend.
    pub fn estimates_heritability(&self) -> bool {
        self.config.h2.is_none()
    }
}

// ========================================================================================
//                                     Estimate record
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Supplied,
    Estimated,
}

/// h^2 or R^2 together with where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reliability {
    pub value: f64,
    pub provenance: Provenance,
    pub jackknife_se: Option<f64>,
}

impl Reliability {
    pub fn supplied(value: f64) -> Self {
        Self {
            value,
            provenance: Provenance::Supplied,
            jackknife_se: None,
        }
    }

    pub fn estimated(value: f64) -> Self {
        Self {
            value,
            provenance: Provenance::Estimated,
            jackknife_se: None,
        }
    }

    pub fn is_supplied(&self) -> bool {
        self.provenance == Provenance::Supplied
    }
}

/// Jackknife standard errors of the raw and corrected coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientErrors {
    pub raw: Array1<f64>,
    pub corrected: Array1<f64>,
}

/// The result of one pipeline pass, optionally carrying jackknife errors.
#[derive(Debug, Clone)]
pub struct EstimateRecord {
    pub n: usize,
    pub variables: Vec<String>,
    pub h2: Reliability,
    pub r2: Reliability,
    pub rho: f64,
    pub rho_se: Option<f64>,
    pub raw_coefficients: Array1<f64>,
    pub raw_standard_errors: Array1<f64>,
    pub raw_covariance: Array2<f64>,
    pub corrected_coefficients: Array1<f64>,
    pub corrected_standard_errors: Array1<f64>,
    pub jackknife: Option<CoefficientErrors>,
}

impl EstimateRecord {
    /// A record carrying jackknife errors. Errors for supplied quantities stay unset.
    pub fn with_jackknife(self, errors: JackknifeErrors) -> Self {
        let h2 = Reliability {
            jackknife_se: (!self.h2.is_supplied()).then_some(errors.h2),
            ..self.h2
        };
        let r2 = Reliability {
            jackknife_se: (!self.r2.is_supplied()).then_some(errors.r2),
            ..self.r2
        };
        let rho_se = (!(self.h2.is_supplied() && self.r2.is_supplied())).then_some(errors.rho);
        Self {
            h2,
            r2,
            rho_se,
            jackknife: Some(CoefficientErrors {
                raw: errors.raw,
                corrected: errors.corrected,
            }),
            ..self
        }
    }
}

// ========================================================================================
//                                        Pipeline
// ========================================================================================

/// Runs one full estimation pass on `data`.
pub fn estimate(
    ctx: &PipelineContext<'_>,
    data: &RegressionData,
) -> Result<EstimateRecord, PipelineError> {
    internal::check_shapes(data)?;
    let policy = ctx.config.policy();

    let h2 = match ctx.config.h2 {
        Some(value) => Reliability::supplied(value),
        None => {
            let estimator = ctx.heritability.ok_or(PipelineError::MissingEstimator)?;
            let request = HeritabilityRequest {
                scratch_dir: &ctx.scratch_dir,
                excluded: &ctx.excluded,
                label: &ctx.label,
            };
            Reliability::estimated(estimator.estimate(&request)?)
        }
    };

    let r2 = match ctx.config.r2 {
        Some(value) => Reliability::supplied(value),
        None => {
            let design = with_intercept(data.regressors.slice(s![.., 0..1]));
            let fit = ctx
                .regressor
                .fit(data.proxy_phenotype.view(), design.view(), None)?;
            Reliability::estimated(fit.r_squared)
        }
    };

    let rho = reliability_ratio(h2.value, r2.value, &policy)?;

    debug!("Calculating uncorrected coefficient(s) and standard error(s)...");
    let p = data.regressors.ncols();
    let design = with_intercept(data.regressors.view());
    let fit = ctx.regressor.fit(
        data.outcome.view(),
        design.view(),
        data.weights.as_ref().map(|w| w.view()),
    )?;
    if fit.coefficients.len() != p + 1 || fit.covariance.dim() != (p + 1, p + 1) {
        return Err(CorrectionError::DimensionMismatch {
            context: "fitted coefficients",
            expected: p + 1,
            found: fit.coefficients.len(),
        }
        .into());
    }
    // The intercept is the last design column.
    let raw_coefficients = fit.coefficients.slice(s![..p]).to_owned();
    let raw_standard_errors = fit.standard_errors.slice(s![..p]).to_owned();
    let raw_covariance = fit.covariance.slice(s![..p, ..p]).to_owned();

    debug!("Getting correction matrix...");
    let v = covariance_matrix(data.regressors.view());
    let moments = InteractionMoments::from_columns(data.interaction_sources.view());
    let m = build_correction_matrix(v.view(), rho, &moments, data.layout.proxy_terms)?;

    debug!("Correcting coefficients and standard error(s)...");
    let corrected_coefficients = correct_coefficients(m.view(), raw_coefficients.view())?;
    let corrected_standard_errors = correct_standard_errors(m.view(), raw_covariance.view())?;

    info!(
        "[{}] n = {}, h2 = {:.6}, R2 = {:.6}, rho = {:.6}",
        ctx.label,
        data.n(),
        h2.value,
        r2.value,
        rho
    );

    Ok(EstimateRecord {
        n: data.n(),
        variables: data.layout.variables.clone(),
        h2,
        r2,
        rho,
        rho_se: None,
        raw_coefficients,
        raw_standard_errors,
        raw_covariance,
        corrected_coefficients,
        corrected_standard_errors,
        jackknife: None,
    })
}

mod internal {
    use super::*;

    fn mismatch(context: &'static str, expected: usize, found: usize) -> Result<(), PipelineError> {
        if expected == found {
            return Ok(());
        }
        Err(CorrectionError::DimensionMismatch {
            context,
            expected,
            found,
        }
        .into())
    }

    pub(super) fn check_shapes(data: &RegressionData) -> Result<(), PipelineError> {
        let n = data.n();
        let p = data.regressors.ncols();
        mismatch("proxy phenotype rows", n, data.proxy_phenotype.len())?;
        mismatch("regressor rows", n, data.regressors.nrows())?;
        mismatch("interaction source rows", n, data.interaction_sources.nrows())?;
        if let Some(weights) = &data.weights {
            mismatch("weight rows", n, weights.len())?;
        }
        if let Some(ids) = &data.ids {
            mismatch("identifier rows", n, ids.len())?;
        }
        mismatch("regressor names", p, data.layout.variables.len())?;
        mismatch(
            "proxy terms",
            data.interaction_sources.ncols() + 1,
            data.layout.proxy_terms,
        )?;
        if p < data.layout.proxy_terms {
            return mismatch("regressor columns", data.layout.proxy_terms, p);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RegressorLayout;
    use crate::errors::ErrorCategory;
    use crate::heritability::HeritabilityError;
    use crate::regression::LeastSquares;
    use approx::assert_abs_diff_eq;
    use std::sync::Mutex;

    struct FixedHeritability {
        value: f64,
        seen: Mutex<Vec<(String, usize)>>,
    }

    impl HeritabilityEstimator for FixedHeritability {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn estimate(&self, request: &HeritabilityRequest<'_>) -> Result<f64, HeritabilityError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((request.label.to_string(), request.excluded.len()));
            }
            Ok(self.value)
        }
    }

    fn small_data() -> RegressionData {
        let n = 40;
        let mut regressors = Array2::zeros((n, 2));
        let mut outcome = Array1::zeros(n);
        for i in 0..n {
            let g = ((i * 7) % 11) as f64 - 5.0;
            let z = ((i * 3) % 5) as f64 - 2.0;
            regressors[[i, 0]] = g / 3.0;
            regressors[[i, 1]] = z;
            outcome[i] = 0.4 * g + 0.2 * z + (((i * 13) % 7) as f64 - 3.0) * 0.1;
        }
        RegressionData {
            proxy_phenotype: outcome.clone(),
            outcome,
            regressors,
            interaction_sources: Array2::zeros((n, 0)),
            weights: None,
            ids: None,
            layout: RegressorLayout {
                variables: vec!["pgi".to_string(), "z".to_string()],
                proxy_terms: 1,
            },
        }
    }

    #[test]
    fn supplied_values_skip_the_collaborators() {
        let config = CorrectionConfig {
            h2: Some(0.5),
            r2: Some(0.125),
            ..CorrectionConfig::default()
        };
        let ctx = PipelineContext::new(&config, &LeastSquares, None, "unused");
        let record = estimate(&ctx, &small_data()).unwrap();
        assert_abs_diff_eq!(record.rho, 2.0, epsilon = 1e-12);
        assert!(record.h2.is_supplied() && record.r2.is_supplied());
        assert_eq!(record.rho_se, None);
        assert_eq!(record.raw_coefficients.len(), 2);
        assert!(record.jackknife.is_none());
    }

    #[test]
    fn missing_estimator_is_a_collaborator_failure() {
        let config = CorrectionConfig::default();
        let ctx = PipelineContext::new(&config, &LeastSquares, None, "unused");
        let err = estimate(&ctx, &small_data()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingEstimator));
        assert_eq!(err.category(), ErrorCategory::Collaborator);
    }

    #[test]
    fn estimated_h2_comes_from_the_backend_with_the_context_label() {
        let backend = FixedHeritability {
            value: 0.6,
            seen: Mutex::new(Vec::new()),
        };
        let config = CorrectionConfig::default();
        let ctx = PipelineContext::new(&config, &LeastSquares, Some(&backend), "scratch");
        let record = estimate(&ctx, &small_data()).unwrap();
        assert_abs_diff_eq!(record.h2.value, 0.6, epsilon = 1e-12);
        assert!(!record.h2.is_supplied());
        assert!(record.r2.value > 0.0 && record.r2.value < 1.0);

        let block = ctx.for_block(4, vec![PersonId::single("x")]);
        assert_eq!(block.scratch_dir, PathBuf::from("scratch").join("jk_block_4"));
        assert!(ctx.excluded.is_empty());
        estimate(&block, &small_data()).unwrap();

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen[0], ("full sample".to_string(), 0));
        assert_eq!(seen[1], ("jackknife block 4".to_string(), 1));
    }

    #[test]
    fn zero_r2_is_a_numerical_error() {
        let config = CorrectionConfig {
            h2: Some(0.5),
            r2: Some(0.0),
            ..CorrectionConfig::default()
        };
        let ctx = PipelineContext::new(&config, &LeastSquares, None, "unused");
        let err = estimate(&ctx, &small_data()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Numerical);
    }

    #[test]
    fn strict_mode_escalates_rho_below_one() {
        let config = CorrectionConfig {
            h2: Some(0.1),
            r2: Some(0.4),
            strict: true,
            ..CorrectionConfig::default()
        };
        let ctx = PipelineContext::new(&config, &LeastSquares, None, "unused");
        let err = estimate(&ctx, &small_data()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::DataQuality);
    }

    #[test]
    fn inconsistent_layout_is_rejected() {
        let mut data = small_data();
        data.layout.variables.pop();
        let config = CorrectionConfig {
            h2: Some(0.5),
            r2: Some(0.25),
            ..CorrectionConfig::default()
        };
        let ctx = PipelineContext::new(&config, &LeastSquares, None, "unused");
        assert!(matches!(
            estimate(&ctx, &data),
            Err(PipelineError::Correction(CorrectionError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn jackknife_errors_respect_provenance() {
        let config = CorrectionConfig {
            h2: Some(0.5),
            r2: None,
            ..CorrectionConfig::default()
        };
        let ctx = PipelineContext::new(&config, &LeastSquares, None, "unused");
        let record = estimate(&ctx, &small_data()).unwrap();
        let errors = JackknifeErrors {
            h2: 0.1,
            r2: 0.2,
            rho: 0.3,
            raw: Array1::from_elem(2, 0.01),
            corrected: Array1::from_elem(2, 0.02),
        };
        let record = record.with_jackknife(errors);
        assert_eq!(record.h2.jackknife_se, None);
        assert_eq!(record.r2.jackknife_se, Some(0.2));
        assert_eq!(record.rho_se, Some(0.3));
        assert_eq!(record.jackknife.unwrap().corrected[1], 0.02);
    }
}
