#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::Parser;
use log::{debug, error, info};
use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use pgic::data::load_regression_data;
use pgic::errors::PipelineError;
use pgic::heritability::{Bolt, Gcta, HeritabilityEstimator};
use pgic::jackknife::run_jackknife;
use pgic::pipeline::{PipelineContext, estimate};
use pgic::regression::LeastSquares;
use pgic::report::write_reports;
use pgic::settings::{CliArgs, GrmSource, HeritabilitySoftware, LoggingLevel, RunSettings};

const BANNER_RULE: &str = "<><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><><>";

/// Sends every log line to stderr and to `<out>.log`.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(out: &Path, level: LoggingLevel) -> io::Result<PathBuf> {
    let mut raw = out.as_os_str().to_owned();
    raw.push(".log");
    let log_path = PathBuf::from(raw);
    let file = File::create(&log_path)?;

    env_logger::Builder::new()
        .filter_level(level.filter())
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .init();
    Ok(log_path)
}

fn log_banner(log_path: &Path) {
    info!(
        "\n{BANNER_RULE}\n<>\n<> Polygenic Index (PGI) Measurement Error Correction\n<> Version: {}\n<>\n{BANNER_RULE}\n",
        env!("CARGO_PKG_VERSION")
    );
    info!("See full log at: {}", log_path.display());
    let command: Vec<String> = std::env::args().collect();
    info!("{}", command.join(" "));
}

fn build_estimator(
    software: &HeritabilitySoftware,
    scratch: &Path,
) -> Result<Box<dyn HeritabilityEstimator>, Box<dyn Error>> {
    let estimator: Box<dyn HeritabilityEstimator> = match software {
        HeritabilitySoftware::Gcta {
            executable,
            grm,
            pheno_file,
            grm_cutoff,
            threads,
        } => {
            let grm = match grm {
                GrmSource::Prebuilt(prefix) => prefix.clone(),
                GrmSource::Bfile(bfile) => {
                    info!("Constructing GRM using GCTA...");
                    Gcta::build_grm(executable, bfile, &scratch.join("grm"), *threads)?
                }
            };
            Box::new(Gcta {
                executable: executable.clone(),
                grm,
                pheno_file: pheno_file.clone(),
                grm_cutoff: *grm_cutoff,
                threads: *threads,
            })
        }
        HeritabilitySoftware::Bolt {
            executable,
            bfile,
            pheno_file,
            pheno_column,
            threads,
        } => Box::new(Bolt {
            executable: executable.clone(),
            bfile: bfile.clone(),
            pheno_file: pheno_file.clone(),
            pheno_column: pheno_column.clone(),
            threads: *threads,
        }),
    };
    Ok(estimator)
}

fn run(settings: &RunSettings) -> Result<(), Box<dyn Error>> {
    let policy = settings.policy();

    // Removed when dropped, also on the error path.
    let scratch = tempfile::Builder::new()
        .prefix("pgic_scratch_")
        .tempdir_in(settings.out_dir())?;
    debug!("Scratch directory: {}", scratch.path().display());

    let (columns, data) =
        load_regression_data(&settings.reg_data_file, &settings.columns, &policy)?;
    info!(
        "You've specified {} covariates to control for.",
        columns.covariates.len()
    );
    info!(
        "You've specified {} interaction variables.",
        columns.interaction_sources.len()
    );

    let estimator = match &settings.heritability {
        Some(software) => Some(build_estimator(software, scratch.path())?),
        None => None,
    };
    let ctx = PipelineContext::new(
        &settings.correction,
        &LeastSquares,
        estimator.as_deref(),
        scratch.path(),
    );

    let baseline = estimate(&ctx, &data)?;
    let (record, table) = match &settings.correction.jackknife {
        Some(config) => {
            info!("Beginning jackknife estimation.");
            let (table, record) = run_jackknife(&ctx, &data, &baseline, config)?;
            debug!("Jackknife result table columns: {:?}", table.columns);
            debug!("Jackknife result table:\n{:?}", table.rows);
            (record, Some(table))
        }
        None => (baseline, None),
    };

    write_reports(settings, &record, table.as_ref())?;
    Ok(())
}

fn report_failure(err: &(dyn Error + 'static)) {
    if let Some(pipeline) = err.downcast_ref::<PipelineError>() {
        error!("{} ({})", err, pipeline.category());
    } else {
        error!("{err}");
    }
    let mut source = err.source();
    while let Some(cause) = source {
        error!("  caused by: {cause}");
        source = cause.source();
    }
}

fn main() {
    let args = CliArgs::parse();

    let log_path = match init_logging(&args.out, args.logging_level) {
        Ok(path) => path,
        Err(e) => {
            eprintln!(
                "Error: could not open the log file for output prefix [{}]: {e}",
                args.out.display()
            );
            process::exit(1);
        }
    };
    log_banner(&log_path);

    let result = RunSettings::from_args(args)
        .map_err(|e| Box::new(e) as Box<dyn Error>)
        .and_then(|settings| run(&settings));

    if let Err(e) = result {
        report_failure(e.as_ref());
        process::exit(1);
    }
}
