// ========================================================================================
//
//                                  Result reporting
//
// ========================================================================================
//
// `<out>.res` holds a short summary followed by a tab-separated coefficient table.
// `<out>.toml` echoes the run configuration next to the same numbers in a
// machine-readable form. When the jackknife ran, its per-block table is written to
// `<out>.jk.tsv`.

use crate::jackknife::JackknifeTable;
use crate::pipeline::{EstimateRecord, Reliability};
use crate::settings::RunSettings;
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Printed in the standard error slot of a supplied quantity.
pub const ASSUMED: &str = "assumed";

/// Printed in the standard error slot of an estimated quantity without a jackknife.
pub const NOT_COMPUTED: &str = "no jackknife";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Could not write results to [{}]: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write the coefficient table: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to serialize results as TOML: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("Output variable [{0}] is not among the regressors.")]
    UnknownOutputVariable(String),
}

/// One line of the coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientRow {
    pub variable_name: String,
    pub uncorrected_coef: f64,
    pub uncorrected_se: f64,
    pub corrected_coef: f64,
    pub corrected_se: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub n: usize,
    pub h2: f64,
    pub h2_se: Option<f64>,
    pub h2_supplied: bool,
    #[serde(rename = "R2")]
    pub r2: f64,
    #[serde(rename = "R2_se")]
    pub r2_se: Option<f64>,
    #[serde(rename = "R2_supplied")]
    pub r2_supplied: bool,
    pub rho: f64,
    pub rho_se: Option<f64>,
}

impl Summary {
    pub fn from_record(record: &EstimateRecord) -> Self {
        Self {
            n: record.n,
            h2: record.h2.value,
            h2_se: record.h2.jackknife_se,
            h2_supplied: record.h2.is_supplied(),
            r2: record.r2.value,
            r2_se: record.r2.jackknife_se,
            r2_supplied: record.r2.is_supplied(),
            rho: record.rho,
            rho_se: record.rho_se,
        }
    }
}

#[derive(Serialize)]
struct TomlReport<'a> {
    version: &'a str,
    settings: &'a RunSettings,
    summary: Summary,
    coefficients: &'a [CoefficientRow],
}

/// Coefficient rows for `output_vars` in that order, or for every regressor when empty.
///
/// Jackknife standard errors replace the analytic ones when present.
pub fn coefficient_rows(
    record: &EstimateRecord,
    output_vars: &[String],
) -> Result<Vec<CoefficientRow>, ReportError> {
    let (raw_se, corrected_se) = match &record.jackknife {
        Some(errors) => (&errors.raw, &errors.corrected),
        None => (
            &record.raw_standard_errors,
            &record.corrected_standard_errors,
        ),
    };
    let row = |i: usize| CoefficientRow {
        variable_name: record.variables[i].clone(),
        uncorrected_coef: record.raw_coefficients[i],
        uncorrected_se: raw_se[i],
        corrected_coef: record.corrected_coefficients[i],
        corrected_se: corrected_se[i],
    };

    if output_vars.is_empty() {
        return Ok((0..record.variables.len()).map(row).collect());
    }
    output_vars
        .iter()
        .map(|name| {
            record
                .variables
                .iter()
                .position(|v| v == name)
                .map(row)
                .ok_or_else(|| ReportError::UnknownOutputVariable(name.clone()))
        })
        .collect()
}

fn se_slot(quantity: &Reliability) -> String {
    match quantity.jackknife_se {
        Some(se) => se.to_string(),
        None if quantity.is_supplied() => ASSUMED.to_string(),
        None => NOT_COMPUTED.to_string(),
    }
}

/// The summary block at the top of the `.res` file.
pub fn format_summary(record: &EstimateRecord) -> String {
    let rho_se = match record.rho_se {
        Some(se) => se.to_string(),
        None if record.h2.is_supplied() && record.r2.is_supplied() => ASSUMED.to_string(),
        None => NOT_COMPUTED.to_string(),
    };
    format!(
        "N = {}\nHeritability = {} ({})\nR Squared = {} ({})\nRho = {} ({})\n",
        record.n,
        record.h2.value,
        se_slot(&record.h2),
        record.r2.value,
        se_slot(&record.r2),
        record.rho,
        rho_se
    )
}

/// Writes the coefficient table as tab-separated values with a header line.
pub fn write_coefficient_table<W: Write>(
    writer: W,
    rows: &[CoefficientRow],
) -> Result<(), ReportError> {
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Writes `<out>.res`, `<out>.toml` and, when present, `<out>.jk.tsv`.
pub fn write_reports(
    settings: &RunSettings,
    record: &EstimateRecord,
    table: Option<&JackknifeTable>,
) -> Result<Vec<PathBuf>, ReportError> {
    let rows = coefficient_rows(record, &settings.output_vars)?;
    let summary = format_summary(record);
    info!("\n\nResults summary:\n{summary}");

    let res_path = settings.output_path(".res");
    let mut res = String::new();
    res.push_str(&summary);
    res.push_str(&"=".repeat(20));
    res.push_str("\n\n");
    let mut table_bytes = Vec::new();
    write_coefficient_table(&mut table_bytes, &rows)?;
    let table_text = String::from_utf8_lossy(&table_bytes);
    info!("\n{table_text}");
    res.push_str(&table_text);
    write_file(&res_path, res.as_bytes())?;

    let toml_path = settings.output_path(".toml");
    let doc = TomlReport {
        version: env!("CARGO_PKG_VERSION"),
        settings,
        summary: Summary::from_record(record),
        coefficients: &rows,
    };
    write_file(&toml_path, toml::to_string_pretty(&doc)?.as_bytes())?;

    let mut written = vec![res_path, toml_path];
    if let Some(table) = table {
        let jk_path = settings.output_path(".jk.tsv");
        let file = File::create(&jk_path).map_err(|source| ReportError::Io {
            path: jk_path.clone(),
            source,
        })?;
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
        let mut header = vec!["block".to_string()];
        header.extend(table.columns.iter().cloned());
        wtr.write_record(&header)?;
        for (block, row) in table.rows.outer_iter().enumerate() {
            let mut fields = vec![block.to_string()];
            fields.extend(row.iter().map(f64::to_string));
            wtr.write_record(&fields)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        written.push(jk_path);
    }

    info!(
        "Check output file [{}] for recorded results, including corrected coefficients.",
        written[0].display()
    );
    Ok(written)
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), ReportError> {
    fs::write(path, contents).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}
