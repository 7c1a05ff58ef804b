//! # Command-Line Settings
//!
//! The flags of the `pgic` binary and their validation. Parsing produces a
//! [`CliArgs`]; [`RunSettings::from_args`] checks bounds, heritability-software
//! flag consistency, and the existence of every referenced file, and yields the
//! immutable configuration the rest of the run works from.

use crate::data::ColumnSpec;
use crate::errors::{QualityWarning, WarningPolicy};
use crate::heritability::{bolt, gcta};
use crate::jackknife::DEFAULT_NUM_BLOCKS;
use crate::pipeline::{CorrectionConfig, JackknifeConfig};
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Output prefix used when `--out` is not given.
pub const DEFAULT_OUT_PREFIX: &str = "pgi_correct";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("The specified {name} value ({value}) should lie in {interval}.")]
    OutOfBounds {
        name: &'static str,
        value: f64,
        interval: &'static str,
    },

    #[error("The specified num-blocks ({0}) is invalid; at least 2 are required.")]
    InvalidBlockCount(usize),

    #[error("For {software} to run, please specify the following missing flags: {flags:?}")]
    MissingFlags {
        software: &'static str,
        flags: Vec<&'static str>,
    },

    #[error("Need to specify one and only one of: {0:?}")]
    NeedExactlyOne(Vec<&'static str>),

    #[error("The designated {what} [{}] does not exist.", path.display())]
    MissingPath { what: &'static str, path: PathBuf },

    #[error("One or more of the expected {what} files is missing for prefix [{}].", prefix.display())]
    MissingFileSet { what: &'static str, prefix: PathBuf },

    #[error("{0}")]
    Quality(#[from] QualityWarning),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Warn,
}

impl LoggingLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LoggingLevel::Debug => LevelFilter::Debug,
            LoggingLevel::Info => LevelFilter::Info,
            LoggingLevel::Warn => LevelFilter::Warn,
        }
    }
}

/// Polygenic Index (PGI) measurement-error correction.
#[derive(Parser, Debug, Clone)]
#[command(name = "pgic", version)]
pub struct CliArgs {
    /// Dataset with the outcome, PGI, interaction sources, covariates, weights and IDs
    #[arg(long, value_name = "FILE_PATH")]
    pub reg_data_file: PathBuf,

    /// Dependent variable column
    #[arg(long, value_name = "COLUMN_NAME")]
    pub outcome: String,

    /// PGI column
    #[arg(long, value_name = "COLUMN_NAME")]
    pub pgi_var: String,

    /// Column holding the phenotype the PGI was built for (defaults to the outcome)
    #[arg(long, value_name = "COLUMN_NAME")]
    pub pgi_pheno_var: Option<String>,

    /// Covariates to interact with the PGI; "*" and "?" act as wildcards
    #[arg(long, value_name = "COLUMN_NAME", num_args = 0..)]
    pub pgi_interact_vars: Vec<String>,

    /// Covariates to control for; "*" and "?" act as wildcards
    #[arg(long, value_name = "COLUMN_NAME", num_args = 1.., required = true)]
    pub covariates: Vec<String>,

    /// Column of weights for weighted least squares
    #[arg(long, value_name = "COLUMN_NAME")]
    pub weights: Option<String>,

    /// Prefix of the output files (.res, .toml, .log)
    #[arg(long, value_name = "FILE_PREFIX", default_value = DEFAULT_OUT_PREFIX)]
    pub out: PathBuf,

    /// Report only these variables, in this order
    #[arg(long, value_name = "COLUMN_NAME", num_args = 0..)]
    pub output_vars: Vec<String>,

    /// Heritability of the PGI phenotype; estimated with GCTA or BOLT when absent
    #[arg(long, value_name = "PARAM")]
    pub h2: Option<f64>,

    /// R^2 of the PGI phenotype on the PGI; estimated when absent
    #[arg(long = "R2", value_name = "PARAM")]
    pub r2: Option<f64>,

    /// Relatedness cutoff for GCTA heritability estimation [default: 0.025]
    #[arg(long, value_name = "PARAM")]
    pub grm_cutoff: Option<f64>,

    /// Path to the GCTA executable (gcta64)
    #[arg(long, value_name = "FILE_PATH", conflicts_with = "bolt_exec")]
    pub gcta_exec: Option<PathBuf>,

    /// Path to the BOLT-LMM executable (bolt)
    #[arg(long, value_name = "FILE_PATH")]
    pub bolt_exec: Option<PathBuf>,

    /// Prefix of a prebuilt GRM (without .grm.bin, .grm.id, .grm.N.bin)
    #[arg(long, value_name = "FILE_PREFIX")]
    pub grm: Option<PathBuf>,

    /// Prefix of the PLINK bed/bim/fam files
    #[arg(long, value_name = "FILE_PREFIX")]
    pub bfile: Option<PathBuf>,

    /// Phenotype file for heritability estimation
    #[arg(long, value_name = "FILE_PATH")]
    pub pheno_file: Option<PathBuf>,

    /// Phenotype column in --pheno-file (BOLT only) [default: PHENOTYPE]
    #[arg(long, value_name = "COLUMN_NAME")]
    pub pheno_file_pheno_col: Option<String>,

    /// Compute block-jackknife standard errors for h^2, R^2, rho and the coefficients
    #[arg(long)]
    pub jk_se: bool,

    /// Number of jackknife blocks [default: 100]
    #[arg(long, value_name = "N")]
    pub num_blocks: Option<usize>,

    /// Person ID column(s): FID then IID, or a single column used for both
    #[arg(long, value_name = "COLUMN_NAME", num_args = 1..=2)]
    pub id_col: Vec<String>,

    /// Treat data-quality warnings as errors
    #[arg(long)]
    pub strict: bool,

    #[arg(long, value_enum, default_value_t = LoggingLevel::Info)]
    pub logging_level: LoggingLevel,

    /// Threads handed to GCTA/BOLT
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub num_threads: usize,

    /// Jackknife blocks run concurrently
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub jk_threads: usize,

    /// Seed for the jackknife block permutation
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,
}

/// Where GCTA gets its relatedness matrix from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrmSource {
    Prebuilt(PathBuf),
    /// Built once per run from PLINK files.
    Bfile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "software", rename_all = "lowercase")]
pub enum HeritabilitySoftware {
    Gcta {
        executable: PathBuf,
        grm: GrmSource,
        pheno_file: PathBuf,
        grm_cutoff: f64,
        threads: usize,
    },
    Bolt {
        executable: PathBuf,
        bfile: PathBuf,
        pheno_file: PathBuf,
        pheno_column: String,
        threads: usize,
    },
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub reg_data_file: PathBuf,
    pub out: PathBuf,
    pub output_vars: Vec<String>,
    pub logging_level: LoggingLevel,
    pub columns: ColumnSpec,
    pub correction: CorrectionConfig,
    pub heritability: Option<HeritabilitySoftware>,
}

impl RunSettings {
    pub fn from_args(args: CliArgs) -> Result<Self, SettingsError> {
        let policy = WarningPolicy {
            strict: args.strict,
        };
        internal::validate_numeric(&args)?;
        internal::validate_run_paths(&args)?;
        let heritability = internal::heritability_software(&args, &policy)?;
        internal::validate_jackknife(&args, &policy)?;
        internal::validate_paths(heritability.as_ref())?;

        let jackknife = args.jk_se.then(|| JackknifeConfig {
            num_blocks: args.num_blocks.unwrap_or(DEFAULT_NUM_BLOCKS),
            seed: args.seed,
            threads: args.jk_threads.max(1),
        });

        Ok(Self {
            columns: ColumnSpec {
                outcome: args.outcome,
                proxy: args.pgi_var,
                proxy_phenotype: args.pgi_pheno_var,
                interactions: args.pgi_interact_vars,
                covariates: args.covariates,
                weights: args.weights,
                id_columns: args.id_col,
            },
            correction: CorrectionConfig {
                h2: args.h2,
                r2: args.r2,
                strict: args.strict,
                jackknife,
            },
            reg_data_file: args.reg_data_file,
            out: args.out,
            output_vars: args.output_vars,
            logging_level: args.logging_level,
            heritability,
        })
    }

    pub fn policy(&self) -> WarningPolicy {
        self.correction.policy()
    }

    /// Directory the output prefix lives in.
    pub fn out_dir(&self) -> PathBuf {
        internal::parent_dir(&self.out)
    }

    /// `<out><suffix>`, e.g. `<out>.res`.
    pub fn output_path(&self, suffix: &str) -> PathBuf {
        let mut raw = self.out.as_os_str().to_owned();
        raw.push(suffix);
        PathBuf::from(raw)
    }
}

mod internal {
    use super::*;

    pub(super) fn parent_dir(prefix: &Path) -> PathBuf {
        match prefix.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn check_unit_interval(name: &'static str, value: Option<f64>) -> Result<(), SettingsError> {
        match value {
            Some(value) if !(0.0..=1.0).contains(&value) => Err(SettingsError::OutOfBounds {
                name,
                value,
                interval: "[0, 1]",
            }),
            _ => Ok(()),
        }
    }

    // A zero h^2 or R^2 leaves the reliability ratio undefined.
    fn check_proportion(name: &'static str, value: Option<f64>) -> Result<(), SettingsError> {
        match value {
            Some(value) if !(value > 0.0 && value <= 1.0) => Err(SettingsError::OutOfBounds {
                name,
                value,
                interval: "(0, 1]",
            }),
            _ => Ok(()),
        }
    }

    pub(super) fn validate_numeric(args: &CliArgs) -> Result<(), SettingsError> {
        check_proportion("h^2", args.h2)?;
        check_proportion("R^2", args.r2)?;
        check_unit_interval("grm-cutoff", args.grm_cutoff)?;
        if let Some(blocks) = args.num_blocks {
            if blocks < 2 {
                return Err(SettingsError::InvalidBlockCount(blocks));
            }
        }
        Ok(())
    }

    fn check_executable(
        path: &Path,
        expected: &'static str,
        policy: &WarningPolicy,
    ) -> Result<(), SettingsError> {
        let found = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if found != expected {
            policy.raise(QualityWarning::UnexpectedExecutable { found, expected })?;
        }
        Ok(())
    }

    pub(super) fn heritability_software(
        args: &CliArgs,
        policy: &WarningPolicy,
    ) -> Result<Option<HeritabilitySoftware>, SettingsError> {
        let threads = args.num_threads.max(1);

        if args.h2.is_some() {
            let unneeded: Vec<String> = [
                ("--gcta-exec", args.gcta_exec.is_some()),
                ("--bolt-exec", args.bolt_exec.is_some()),
                ("--grm", args.grm.is_some()),
                ("--bfile", args.bfile.is_some()),
                ("--pheno-file", args.pheno_file.is_some()),
                ("--pheno-file-pheno-col", args.pheno_file_pheno_col.is_some()),
                ("--grm-cutoff", args.grm_cutoff.is_some()),
            ]
            .into_iter()
            .filter(|(_, given)| *given)
            .map(|(flag, _)| flag.to_string())
            .collect();
            if !unneeded.is_empty() {
                policy.raise(QualityWarning::UnneededFlags(unneeded))?;
            }
            return Ok(None);
        }

        if let Some(executable) = &args.bolt_exec {
            let mut missing = Vec::new();
            if args.pheno_file.is_none() {
                missing.push("--pheno-file");
            }
            if args.bfile.is_none() {
                missing.push("--bfile");
            }
            let (Some(pheno_file), Some(bfile)) = (&args.pheno_file, &args.bfile) else {
                return Err(SettingsError::MissingFlags {
                    software: "BOLT",
                    flags: missing,
                });
            };
            check_executable(executable, bolt::EXPECTED_EXECUTABLE, policy)?;
            return Ok(Some(HeritabilitySoftware::Bolt {
                executable: executable.clone(),
                bfile: bfile.clone(),
                pheno_file: pheno_file.clone(),
                pheno_column: args
                    .pheno_file_pheno_col
                    .clone()
                    .unwrap_or_else(|| bolt::DEFAULT_PHENO_COLUMN.to_string()),
                threads,
            }));
        }

        let mut missing = Vec::new();
        if args.gcta_exec.is_none() {
            missing.push("--gcta-exec");
        }
        if args.pheno_file.is_none() {
            missing.push("--pheno-file");
        }
        let (Some(executable), Some(pheno_file)) = (&args.gcta_exec, &args.pheno_file) else {
            return Err(SettingsError::MissingFlags {
                software: "GCTA",
                flags: missing,
            });
        };
        let grm = match (&args.grm, &args.bfile) {
            (Some(grm), None) => GrmSource::Prebuilt(grm.clone()),
            (None, Some(bfile)) => GrmSource::Bfile(bfile.clone()),
            _ => return Err(SettingsError::NeedExactlyOne(vec!["--bfile", "--grm"])),
        };
        check_executable(executable, gcta::EXPECTED_EXECUTABLE, policy)?;
        Ok(Some(HeritabilitySoftware::Gcta {
            executable: executable.clone(),
            grm,
            pheno_file: pheno_file.clone(),
            grm_cutoff: args.grm_cutoff.unwrap_or(gcta::DEFAULT_GRM_CUTOFF),
            threads,
        }))
    }

    pub(super) fn validate_jackknife(
        args: &CliArgs,
        policy: &WarningPolicy,
    ) -> Result<(), SettingsError> {
        if args.jk_se {
            if args.h2.is_none() && args.id_col.is_empty() {
                return Err(SettingsError::MissingFlags {
                    software: "the jackknife",
                    flags: vec!["--id-col"],
                });
            }
            return Ok(());
        }
        let unneeded: Vec<String> = [
            ("--num-blocks", args.num_blocks.is_some()),
            ("--seed", args.seed.is_some()),
        ]
        .into_iter()
        .filter(|(_, given)| *given)
        .map(|(flag, _)| flag.to_string())
        .collect();
        if !unneeded.is_empty() {
            policy.raise(QualityWarning::UnneededFlags(unneeded))?;
        }
        Ok(())
    }

    fn require(what: &'static str, path: &Path) -> Result<(), SettingsError> {
        if path.exists() {
            Ok(())
        } else {
            Err(SettingsError::MissingPath {
                what,
                path: path.to_path_buf(),
            })
        }
    }

    fn require_set(
        what: &'static str,
        prefix: &Path,
        suffixes: &[&str],
    ) -> Result<(), SettingsError> {
        require(what, &parent_dir(prefix))?;
        let complete = suffixes.iter().all(|suffix| {
            let mut raw = prefix.as_os_str().to_owned();
            raw.push(suffix);
            Path::new(&raw).exists()
        });
        if complete {
            Ok(())
        } else {
            Err(SettingsError::MissingFileSet {
                what,
                prefix: prefix.to_path_buf(),
            })
        }
    }

    pub(super) fn validate_run_paths(args: &CliArgs) -> Result<(), SettingsError> {
        require("output directory", &parent_dir(&args.out))?;
        require("data file", &args.reg_data_file)
    }

    pub(super) fn validate_paths(
        software: Option<&HeritabilitySoftware>,
    ) -> Result<(), SettingsError> {
        match software {
            Some(HeritabilitySoftware::Gcta {
                executable,
                grm,
                pheno_file,
                ..
            }) => {
                require("GCTA executable", executable)?;
                require("phenotype file", pheno_file)?;
                match grm {
                    GrmSource::Prebuilt(prefix) => {
                        require_set("GRM", prefix, &[".grm.bin", ".grm.id", ".grm.N.bin"])?
                    }
                    GrmSource::Bfile(prefix) => {
                        require_set("bed/bim/fam", prefix, &[".bed", ".bim", ".fam"])?
                    }
                }
            }
            Some(HeritabilitySoftware::Bolt {
                executable,
                bfile,
                pheno_file,
                ..
            }) => {
                require("BOLT executable", executable)?;
                require("phenotype file", pheno_file)?;
                require_set("bed/bim/fam", bfile, &[".bed", ".bim", ".fam"])?;
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn fixture() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data.tsv");
        fs::write(&data, "y\tpgi\tz\n1\t2\t3\n").unwrap();
        (dir, data)
    }

    fn base_args(data: &Path, out: &Path) -> Vec<String> {
        [
            "pgic",
            "--reg-data-file",
            &data.to_string_lossy(),
            "--outcome",
            "y",
            "--pgi-var",
            "pgi",
            "--covariates",
            "z",
            "--out",
            &out.to_string_lossy(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn parse(args: Vec<String>) -> Result<RunSettings, SettingsError> {
        RunSettings::from_args(CliArgs::try_parse_from(args).unwrap())
    }

    #[test]
    fn supplied_h2_needs_no_software() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--h2", "0.5", "--R2", "0.2"].map(String::from));
        let settings = parse(args).unwrap();
        assert_eq!(settings.correction.h2, Some(0.5));
        assert_eq!(settings.correction.r2, Some(0.2));
        assert!(settings.heritability.is_none());
        assert!(settings.correction.jackknife.is_none());
        assert_eq!(settings.columns.proxy, "pgi");
        assert_eq!(settings.output_path(".res"), dir.path().join("res.res"));
    }

    #[test]
    fn bounds_are_checked() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--h2", "1.5"].map(String::from));
        assert!(matches!(
            parse(args),
            Err(SettingsError::OutOfBounds { name: "h^2", .. })
        ));

        for zero in [["--h2", "0", "--R2", "0.2"], ["--h2", "0.5", "--R2", "0"]] {
            let mut args = base_args(&data, &dir.path().join("res"));
            args.extend(zero.map(String::from));
            assert!(matches!(
                parse(args),
                Err(SettingsError::OutOfBounds {
                    interval: "(0, 1]",
                    ..
                })
            ));
        }

        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--h2", "0.5", "--jk-se", "--num-blocks", "1"].map(String::from));
        assert!(matches!(
            parse(args),
            Err(SettingsError::InvalidBlockCount(1))
        ));
    }

    #[test]
    fn gcta_needs_exactly_one_relatedness_source() {
        let (dir, data) = fixture();
        let exec = dir.path().join("gcta64");
        let pheno = dir.path().join("pheno.txt");
        fs::write(&exec, "").unwrap();
        fs::write(&pheno, "").unwrap();

        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend([
            "--gcta-exec".to_string(),
            exec.to_string_lossy().into_owned(),
            "--pheno-file".to_string(),
            pheno.to_string_lossy().into_owned(),
        ]);
        assert!(matches!(
            parse(args.clone()),
            Err(SettingsError::NeedExactlyOne(_))
        ));

        let grm = dir.path().join("grm");
        for suffix in [".grm.bin", ".grm.id", ".grm.N.bin"] {
            fs::write(dir.path().join(format!("grm{suffix}")), "").unwrap();
        }
        args.extend(["--grm".to_string(), grm.to_string_lossy().into_owned()]);
        let settings = parse(args).unwrap();
        match settings.heritability {
            Some(HeritabilitySoftware::Gcta {
                grm: GrmSource::Prebuilt(prefix),
                grm_cutoff,
                ..
            }) => {
                assert_eq!(prefix, grm);
                assert_eq!(grm_cutoff, gcta::DEFAULT_GRM_CUTOFF);
            }
            other => panic!("unexpected software: {other:?}"),
        }
    }

    #[test]
    fn incomplete_grm_trio_is_reported() {
        let (dir, data) = fixture();
        let exec = dir.path().join("gcta64");
        fs::write(&exec, "").unwrap();
        fs::write(dir.path().join("grm.grm.bin"), "").unwrap();

        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend([
            "--gcta-exec".to_string(),
            exec.to_string_lossy().into_owned(),
            "--pheno-file".to_string(),
            data.to_string_lossy().into_owned(),
            "--grm".to_string(),
            dir.path().join("grm").to_string_lossy().into_owned(),
        ]);
        assert!(matches!(
            parse(args),
            Err(SettingsError::MissingFileSet { what: "GRM", .. })
        ));
    }

    #[test]
    fn bolt_requires_plink_files() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--bolt-exec", "/opt/bolt/bolt"].map(String::from));
        match parse(args) {
            Err(SettingsError::MissingFlags { software, flags }) => {
                assert_eq!(software, "BOLT");
                assert_eq!(flags, vec!["--pheno-file", "--bfile"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn gcta_and_bolt_conflict() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--gcta-exec", "gcta64", "--bolt-exec", "bolt"].map(String::from));
        assert!(CliArgs::try_parse_from(args).is_err());
    }

    #[test]
    fn unneeded_flags_follow_the_warning_policy() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--h2", "0.5", "--grm-cutoff", "0.05", "--num-blocks", "30"].map(String::from));
        assert!(parse(args.clone()).is_ok());

        args.push("--strict".to_string());
        assert!(matches!(
            parse(args),
            Err(SettingsError::Quality(QualityWarning::UnneededFlags(_)))
        ));
    }

    #[test]
    fn jackknife_with_estimated_h2_needs_ids() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--bolt-exec", "bolt", "--jk-se"].map(String::from));
        args.extend([
            "--pheno-file".to_string(),
            data.to_string_lossy().into_owned(),
            "--bfile".to_string(),
            dir.path().join("geno").to_string_lossy().into_owned(),
        ]);
        assert!(matches!(
            parse(args),
            Err(SettingsError::MissingFlags {
                software: "the jackknife",
                ..
            })
        ));
    }

    #[test]
    fn jackknife_defaults() {
        let (dir, data) = fixture();
        let mut args = base_args(&data, &dir.path().join("res"));
        args.extend(["--h2", "0.5", "--jk-se", "--jk-threads", "4"].map(String::from));
        let settings = parse(args).unwrap();
        let jackknife = settings.correction.jackknife.unwrap();
        assert_eq!(jackknife.num_blocks, DEFAULT_NUM_BLOCKS);
        assert_eq!(jackknife.threads, 4);
        assert_eq!(jackknife.seed, None);
    }

    #[test]
    fn missing_output_directory_is_an_error() {
        let (dir, data) = fixture();
        let out = dir.path().join("nope").join("res");
        // Reported before the heritability flags are inspected.
        for extra in [&[][..], &["--h2", "0.5"][..]] {
            let mut args = base_args(&data, &out);
            args.extend(extra.iter().map(|s| s.to_string()));
            assert!(matches!(
                parse(args),
                Err(SettingsError::MissingPath {
                    what: "output directory",
                    ..
                })
            ));
        }
    }
}
