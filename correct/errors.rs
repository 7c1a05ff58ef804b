//! # Warnings, Strictness, and the Top-Level Error
//!
//! Every data-quality concern in the crate is expressed as a [`QualityWarning`]
//! and routed through a single [`WarningPolicy`]. A lenient policy logs the
//! warning and lets the run continue; a strict policy hands it back as an error.
//!
//! [`PipelineError`] is what the estimation pipeline and the jackknife engine
//! return. Its [`PipelineError::category`] accessor lets callers tell
//! collaborator failures apart from the crate's own numerical contract
//! violations.

use crate::correction::CorrectionError;
use crate::heritability::HeritabilityError;
use crate::regression::RegressionError;
use crate::reliability::ReliabilityError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A condition that is suspicious but not necessarily fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityWarning {
    #[error(
        "It is unexpected that rho ({rho}) = sqrt({h2}/{r2}) is less than 1.0. You should double-check that the dependent variable in the R^2 calculation corresponds to the PGI phenotype."
    )]
    RhoBelowOne { rho: f64, h2: f64, r2: f64 },

    #[error(
        "The ratio h^2/R^2 = {h2}/{r2} is negative, so rho is undefined. You should double-check that the dependent variable in the R^2 calculation corresponds to the PGI phenotype."
    )]
    NegativeRatio { h2: f64, r2: f64 },

    #[error("The requested number of jackknife blocks ({blocks}) should be at least {recommended}.")]
    FewJackknifeBlocks { blocks: usize, recommended: usize },

    #[error("Interaction columns {0:?} are not in the set of covariates.")]
    InteractionNotCovariate(Vec<String>),

    #[error("Could not match any column name against column flag value [{0}].")]
    UnmatchedColumnPattern(String),

    #[error("The following unneeded flags were specified and will be ignored: {0:?}")]
    UnneededFlags(Vec<String>),

    #[error("Specified executable [{found}] is not the expected one: [{expected}].")]
    UnexpectedExecutable { found: String, expected: &'static str },
}

/// Decides whether a [`QualityWarning`] is logged or escalated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningPolicy {
    pub strict: bool,
}

impl WarningPolicy {
    pub fn lenient() -> Self {
        Self { strict: false }
    }

    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Logs the warning and returns `Ok(())`, or returns it as an error under strict mode.
    pub fn raise(&self, warning: QualityWarning) -> Result<(), QualityWarning> {
        if self.strict {
            return Err(warning);
        }
        warn!("{warning}");
        Ok(())
    }
}

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The regression or heritability collaborator failed.
    Collaborator,
    /// Singular matrices, dimension mismatches, zero R^2 and similar.
    Numerical,
    /// A data-quality warning escalated by strict mode.
    DataQuality,
    /// Invalid run parameters, such as more jackknife blocks than observations.
    Validation,
    /// Scratch space or worker threads could not be set up.
    Resource,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Collaborator => "collaborator failure",
            ErrorCategory::Numerical => "numerical contract violation",
            ErrorCategory::DataQuality => "data-quality error",
            ErrorCategory::Validation => "validation error",
            ErrorCategory::Resource => "resource error",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Reliability ratio could not be computed: {0}")]
    Reliability(#[from] ReliabilityError),

    #[error("Regression failed: {0}")]
    Regression(#[from] RegressionError),

    #[error("Heritability estimation failed: {0}")]
    Heritability(#[from] HeritabilityError),

    #[error("Correction failed: {0}")]
    Correction(#[from] CorrectionError),

    #[error("{0}")]
    Quality(#[from] QualityWarning),

    #[error("h^2 was not supplied and no heritability estimator is configured.")]
    MissingEstimator,

    #[error("Jackknife block {block} failed: {source}")]
    Jackknife {
        block: usize,
        #[source]
        source: Box<PipelineError>,
    },

    #[error(
        "You cannot specify more jackknife blocks than there are observations. You specified {blocks} blocks, and your data has {observations} rows."
    )]
    TooManyBlocks { blocks: usize, observations: usize },

    #[error("The specified number of jackknife blocks ({0}) is invalid; at least 2 are required.")]
    TooFewBlocks(usize),

    #[error("Person identifiers are required to re-estimate h^2 within jackknife blocks.")]
    MissingIdentifiers,

    #[error("Could not build the jackknife worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Scratch directory error: {0}")]
    Scratch(#[from] std::io::Error),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Regression(_)
            | PipelineError::Heritability(_)
            | PipelineError::MissingEstimator => ErrorCategory::Collaborator,
            PipelineError::Reliability(ReliabilityError::Quality(_)) | PipelineError::Quality(_) => {
                ErrorCategory::DataQuality
            }
            PipelineError::Reliability(_) | PipelineError::Correction(_) => ErrorCategory::Numerical,
            PipelineError::Jackknife { source, .. } => source.category(),
            PipelineError::TooManyBlocks { .. }
            | PipelineError::TooFewBlocks(_)
            | PipelineError::MissingIdentifiers => ErrorCategory::Validation,
            PipelineError::ThreadPool(_) | PipelineError::Scratch(_) => ErrorCategory::Resource,
        }
    }
}
