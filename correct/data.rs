//! # Regression Data Loading and Preparation
//!
//! This module is the only entry point for the user's regression table. It
//! resolves the requested column names (with `*`/`?` wildcards) against the
//! file header, validates the column roles, and turns the table into the
//! cleaned [`RegressionData`] the estimation pipeline works on.
//!
//! - Missing rows: any row with a missing or `NaN` value in a used column is
//!   dropped before anything is computed.
//! - Proxy: standardized to mean 0 and unit (population) variance.
//! - Interactions: each interaction source `z` yields a column `z_int` equal
//!   to `z` times the standardized proxy.

use crate::errors::{QualityWarning, WarningPolicy};
use itertools::Itertools;
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use thiserror::Error;

/// Absolute tolerance below which a column variance counts as zero.
pub const LOW_VARIANCE_TOLERANCE: f64 = 1e-8;

/// Suffix given to generated interaction columns.
pub const INTERACTION_SUFFIX: &str = "_int";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(
        "Could not find column '{column}' specified using the flag --{flag} in the regression data file."
    )]
    ColumnNotFound { column: String, flag: &'static str },

    #[error("No value(s) specified for needed flag --{0}!")]
    MissingColumns(&'static str),

    #[error(
        "Columns listed for flag --{first} and columns listed for flag --{second} share columns {shared:?}, and these sets must be disjoint."
    )]
    OverlappingColumns {
        first: &'static str,
        second: &'static str,
        shared: Vec<String>,
    },

    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error("Infinite values were found in column '{0}'. This tool requires all data to be finite.")]
    NonFiniteValuesFound(String),

    #[error("The weights column '{column}' has a negative value {value} at row {row}.")]
    NegativeWeight { column: String, value: f64, row: usize },

    #[error("No rows without missing values remain in the regression data.")]
    NoCompleteRows,

    #[error("PGI column \"{0}\" has variance zero! Unable to proceed.")]
    ZeroVarianceProxy(String),

    #[error(
        "Column(s) {0:?} in data has/have a very low variance. Please remove it to allow matrices to invert."
    )]
    LowVariance(Vec<String>),

    #[error("{0}")]
    Quality(#[from] QualityWarning),
}

/// A person as GCTA and BOLT identify them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonId {
    pub fid: String,
    pub iid: String,
}

impl PersonId {
    pub fn new(fid: impl Into<String>, iid: impl Into<String>) -> Self {
        Self {
            fid: fid.into(),
            iid: iid.into(),
        }
    }

    /// A single identifier used as both family and individual id.
    pub fn single(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            fid: id.clone(),
            iid: id,
        }
    }
}

/// Column roles as the user requested them. Interaction and covariate entries may
/// contain `*` and `?` wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub outcome: String,
    pub proxy: String,
    pub proxy_phenotype: Option<String>,
    pub interactions: Vec<String>,
    pub covariates: Vec<String>,
    pub weights: Option<String>,
    pub id_columns: Vec<String>,
}

/// Column roles after wildcard resolution and validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedColumns {
    pub outcome: String,
    pub proxy: String,
    /// Target of the R^2 regression; the outcome unless set explicitly.
    pub proxy_phenotype: String,
    pub interaction_sources: Vec<String>,
    pub covariates: Vec<String>,
    pub weights: Option<String>,
    pub id_columns: Vec<String>,
}

impl ResolvedColumns {
    pub fn interaction_names(&self) -> Vec<String> {
        self.interaction_sources
            .iter()
            .map(|source| format!("{source}{INTERACTION_SUFFIX}"))
            .collect()
    }

    /// `G` then `Z`: proxy, interaction columns, covariates.
    pub fn variable_names(&self) -> Vec<String> {
        std::iter::once(self.proxy.clone())
            .chain(self.interaction_names())
            .chain(self.covariates.iter().cloned())
            .collect()
    }
}

/// Names and grouping of the regressor columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressorLayout {
    /// Regressor names in matrix order.
    pub variables: Vec<String>,
    /// `|G|`: the proxy plus its interaction columns.
    pub proxy_terms: usize,
}

/// The cleaned table the estimation pipeline runs on. Rows are observations.
#[derive(Debug, Clone)]
pub struct RegressionData {
    pub outcome: Array1<f64>,
    pub proxy_phenotype: Array1<f64>,
    /// `G` followed by `Z`, in `layout.variables` order.
    pub regressors: Array2<f64>,
    /// Raw values of the interaction source covariates, one column per interaction.
    pub interaction_sources: Array2<f64>,
    pub weights: Option<Array1<f64>>,
    pub ids: Option<Vec<PersonId>>,
    pub layout: RegressorLayout,
}

impl RegressionData {
    pub fn n(&self) -> usize {
        self.outcome.len()
    }

    /// A new table holding only `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            outcome: self.outcome.select(Axis(0), rows),
            proxy_phenotype: self.proxy_phenotype.select(Axis(0), rows),
            regressors: self.regressors.select(Axis(0), rows),
            interaction_sources: self.interaction_sources.select(Axis(0), rows),
            weights: self.weights.as_ref().map(|w| w.select(Axis(0), rows)),
            ids: self
                .ids
                .as_ref()
                .map(|ids| rows.iter().map(|&i| ids[i].clone()).collect()),
            layout: self.layout.clone(),
        }
    }
}

/// Expands wildcard patterns against `available`, keeping file order within each
/// pattern and dropping repeats.
pub fn resolve_patterns(
    patterns: &[String],
    available: &[String],
    policy: &WarningPolicy,
) -> Result<Vec<String>, DataError> {
    let mut resolved: Vec<String> = Vec::new();
    for pattern in patterns {
        let matcher = internal::wildcard_regex(pattern)?;
        let matching: Vec<&String> = available.iter().filter(|c| matcher.is_match(c)).collect();
        if matching.is_empty() {
            policy.raise(QualityWarning::UnmatchedColumnPattern(pattern.clone()))?;
        }
        for column in matching {
            if !resolved.contains(column) {
                resolved.push(column.clone());
            }
        }
    }
    Ok(resolved)
}

/// Resolves wildcards and checks the column roles against each other.
pub fn resolve_columns(
    spec: &ColumnSpec,
    available: &[String],
    policy: &WarningPolicy,
) -> Result<ResolvedColumns, DataError> {
    debug!("Found the following columns in regression data: {available:?}");
    let interaction_sources = resolve_patterns(&spec.interactions, available, policy)?;
    let covariates = resolve_patterns(&spec.covariates, available, policy)?;
    if covariates.is_empty() {
        return Err(DataError::MissingColumns("covariates"));
    }

    let file_columns: HashSet<&str> = available.iter().map(String::as_str).collect();
    let mut roles: Vec<(&'static str, Vec<String>)> = vec![
        ("outcome", vec![spec.outcome.clone()]),
        ("pgi-var", vec![spec.proxy.clone()]),
    ];
    if let Some(pheno) = &spec.proxy_phenotype {
        roles.push(("pgi-pheno-var", vec![pheno.clone()]));
    }
    if let Some(weights) = &spec.weights {
        roles.push(("weights", vec![weights.clone()]));
    }
    if !spec.id_columns.is_empty() {
        roles.push(("id-col", spec.id_columns.clone()));
    }
    if !interaction_sources.is_empty() {
        roles.push(("pgi-interact-vars", interaction_sources.clone()));
    }
    roles.push(("covariates", covariates.clone()));

    for (flag, columns) in &roles {
        if let Some(missing) = columns.iter().find(|c| !file_columns.contains(c.as_str())) {
            return Err(DataError::ColumnNotFound {
                column: missing.clone(),
                flag: *flag,
            });
        }
    }

    let not_covariates: Vec<String> = interaction_sources
        .iter()
        .filter(|source| !covariates.contains(source))
        .cloned()
        .collect();
    if !not_covariates.is_empty() {
        policy.raise(QualityWarning::InteractionNotCovariate(not_covariates))?;
    }

    for ((first, a), (second, b)) in roles.iter().tuple_combinations() {
        if matches!(
            (*first, *second),
            ("pgi-interact-vars", "covariates") | ("covariates", "pgi-interact-vars")
        ) {
            continue;
        }
        let shared: Vec<String> = a.iter().filter(|c| b.contains(c)).cloned().collect();
        if !shared.is_empty() {
            return Err(DataError::OverlappingColumns {
                first: *first,
                second: *second,
                shared,
            });
        }
    }

    debug!("Identified the following covariate columns: {covariates:?}");
    debug!("Identified the following interaction columns: {interaction_sources:?}");

    Ok(ResolvedColumns {
        outcome: spec.outcome.clone(),
        proxy: spec.proxy.clone(),
        proxy_phenotype: spec
            .proxy_phenotype
            .clone()
            .unwrap_or_else(|| spec.outcome.clone()),
        interaction_sources,
        covariates,
        weights: spec.weights.clone(),
        id_columns: spec.id_columns.clone(),
    })
}

/// Reads a delimited table. The delimiter is taken from the header line: a tab,
/// else a comma, else runs of spaces as in aligned whitespace tables.
pub fn read_table(path: &Path) -> Result<DataFrame, DataError> {
    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    let delimiter = internal::detect_delimiter(&header);
    debug!("Reading {} as {:?}-delimited", path.display(), delimiter);

    let options = |separator: u8| {
        CsvReadOptions::default()
            .with_has_header(true)
            .with_parse_options(CsvParseOptions::default().with_separator(separator))
    };
    let df = match delimiter {
        internal::Delimiter::Char(separator) => CsvReader::new(File::open(path)?)
            .with_options(options(separator))
            .finish()?,
        internal::Delimiter::Whitespace => {
            let text = std::fs::read_to_string(path)?;
            CsvReader::new(Cursor::new(internal::collapse_whitespace(&text)))
                .with_options(options(b'\t'))
                .finish()?
        }
    };
    Ok(df)
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

/// Turns a loaded table into [`RegressionData`].
pub fn prepare(df: &DataFrame, columns: &ResolvedColumns) -> Result<RegressionData, DataError> {
    let mut numeric_names: Vec<&str> = vec![
        columns.outcome.as_str(),
        columns.proxy.as_str(),
        columns.proxy_phenotype.as_str(),
    ];
    numeric_names.extend(columns.interaction_sources.iter().map(String::as_str));
    numeric_names.extend(columns.covariates.iter().map(String::as_str));
    if let Some(weights) = &columns.weights {
        numeric_names.push(weights.as_str());
    }
    let numeric_names: Vec<&str> = numeric_names.into_iter().unique().collect();

    let mut numeric: Vec<(&str, Vec<Option<f64>>)> = Vec::with_capacity(numeric_names.len());
    for &name in &numeric_names {
        numeric.push((name, internal::numeric_column(df, name)?));
    }
    let id_values: Vec<Vec<Option<String>>> = columns
        .id_columns
        .iter()
        .map(|name| internal::text_column(df, name))
        .collect::<Result<_, _>>()?;

    let complete: Vec<usize> = (0..df.height())
        .filter(|&row| {
            numeric.iter().all(|(_, values)| values[row].is_some())
                && id_values.iter().all(|values| values[row].is_some())
        })
        .collect();
    let dropped = df.height() - complete.len();
    if dropped > 0 {
        info!("Dropped {dropped} rows with missing values.");
    }
    if complete.is_empty() {
        return Err(DataError::NoCompleteRows);
    }
    let n = complete.len();

    let take = |name: &str| -> Array1<f64> {
        numeric
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, values)| {
                complete
                    .iter()
                    .map(|&row| values[row].unwrap_or(f64::NAN))
                    .collect()
            })
            .unwrap_or_else(|| Array1::from_elem(n, f64::NAN))
    };

    let outcome = take(&columns.outcome);
    let proxy_phenotype = take(&columns.proxy_phenotype);
    let raw_proxy = take(&columns.proxy);

    let weights = match &columns.weights {
        Some(name) => {
            let weights = take(name);
            if let Some((row, &value)) = weights.iter().enumerate().find(|(_, w)| **w < 0.0) {
                return Err(DataError::NegativeWeight {
                    column: name.clone(),
                    value,
                    row: complete[row] + 1,
                });
            }
            Some(weights)
        }
        None => None,
    };

    let mean = raw_proxy.mean().unwrap_or(0.0);
    let std = raw_proxy.std(0.0);
    if std == 0.0 || internal::is_low_variance(std * std) {
        return Err(DataError::ZeroVarianceProxy(columns.proxy.clone()));
    }
    let proxy = raw_proxy.mapv(|x| (x - mean) / std);

    let interaction_names = columns.interaction_names();
    let k = columns.interaction_sources.len();
    let p = 1 + k + columns.covariates.len();

    let mut regressors = Array2::zeros((n, p));
    let mut interaction_sources = Array2::zeros((n, k));
    regressors.column_mut(0).assign(&proxy);
    for (j, source) in columns.interaction_sources.iter().enumerate() {
        let values = take(source);
        regressors.column_mut(1 + j).assign(&(&values * &proxy));
        interaction_sources.column_mut(j).assign(&values);
    }
    for (j, covariate) in columns.covariates.iter().enumerate() {
        regressors.column_mut(1 + k + j).assign(&take(covariate));
    }

    let variables = columns.variable_names();
    let mut low_variance: Vec<String> = Vec::new();
    for (j, name) in variables.iter().enumerate() {
        if internal::is_low_variance(regressors.column(j).var(1.0)) {
            low_variance.push(name.clone());
        }
    }
    if internal::is_low_variance(outcome.var(1.0)) {
        low_variance.push(columns.outcome.clone());
    }
    if columns.proxy_phenotype != columns.outcome && internal::is_low_variance(proxy_phenotype.var(1.0))
    {
        low_variance.push(columns.proxy_phenotype.clone());
    }
    if !low_variance.is_empty() {
        return Err(DataError::LowVariance(low_variance));
    }

    let ids = match id_values.as_slice() {
        [] => None,
        [single] => Some(
            complete
                .iter()
                .map(|&row| PersonId::single(single[row].clone().unwrap_or_default()))
                .collect(),
        ),
        [fid, iid, ..] => Some(
            complete
                .iter()
                .map(|&row| {
                    PersonId::new(
                        fid[row].clone().unwrap_or_default(),
                        iid[row].clone().unwrap_or_default(),
                    )
                })
                .collect(),
        ),
    };

    debug!("Interaction columns: {interaction_names:?}");
    Ok(RegressionData {
        outcome,
        proxy_phenotype,
        regressors,
        interaction_sources,
        weights,
        ids,
        layout: RegressorLayout {
            variables,
            proxy_terms: 1 + k,
        },
    })
}

/// Reads, resolves, and prepares the regression table in one go.
pub fn load_regression_data(
    path: &Path,
    spec: &ColumnSpec,
    policy: &WarningPolicy,
) -> Result<(ResolvedColumns, RegressionData), DataError> {
    info!("Loading regression data into memory...");
    let df = read_table(path)?;
    let columns = resolve_columns(spec, &column_names(&df), policy)?;
    let data = prepare(&df, &columns)?;
    info!("Read in data for {} individuals.", data.n());
    Ok((columns, data))
}

mod internal {
    use super::*;

    pub(super) fn wildcard_regex(pattern: &str) -> Result<Regex, DataError> {
        let body: String = pattern
            .chars()
            .map(|c| match c {
                '*' => ".*".to_string(),
                '?' => ".".to_string(),
                other => regex::escape(&other.to_string()),
            })
            .collect();
        Regex::new(&format!("^(?:{body})$")).map_err(|e| DataError::ColumnWrongType {
            column_name: pattern.to_string(),
            expected_type: "column name pattern",
            found_type: e.to_string(),
        })
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Delimiter {
        Char(u8),
        Whitespace,
    }

    pub(super) fn detect_delimiter(header: &str) -> Delimiter {
        if header.contains('\t') {
            Delimiter::Char(b'\t')
        } else if header.contains(',') {
            Delimiter::Char(b',')
        } else {
            Delimiter::Whitespace
        }
    }

    /// Rewrites a whitespace-aligned table as tab-separated text.
    pub(super) fn collapse_whitespace(text: &str) -> Vec<u8> {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split_whitespace().join("\t"))
            .join("\n")
            .into_bytes()
    }

    pub(super) fn is_low_variance(variance: f64) -> bool {
        variance.abs() <= LOW_VARIANCE_TOLERANCE
    }

    /// A numeric column with missing entries (null or `NaN`) as `None`.
    pub(super) fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let series = df.column(name)?;
        let nulls_before = series.null_count();
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| wrong_type(name, series.dtype()))?;
        if casted.null_count() > nulls_before {
            return Err(wrong_type(name, series.dtype()));
        }

        let values: Vec<Option<f64>> = casted
            .f64()?
            .into_iter()
            .map(|v| v.filter(|x| !x.is_nan()))
            .collect();
        if values.iter().flatten().any(|x| x.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound(name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, DataError> {
        let casted = df.column(name)?.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect();
        Ok(values)
    }

    fn wrong_type(name: &str, dtype: &DataType) -> DataError {
        DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{dtype:?}"),
        }
    }
}
