use super::{
    Capture, HeritabilityError, HeritabilityEstimator, HeritabilityRequest, MarkerLine, flag_value,
    run_tool, write_removal_file,
};
use log::info;
use std::ffi::OsString;
use std::path::PathBuf;

const TOOL: &str = "BOLT";

/// Executable name BOLT-LMM ships under.
pub const EXPECTED_EXECUTABLE: &str = "bolt";

pub const DEFAULT_PHENO_COLUMN: &str = "PHENOTYPE";

const MAX_MODEL_SNPS: u32 = 2_000_000;

/// BOLT-LMM REML straight from PLINK files.
#[derive(Debug, Clone)]
pub struct Bolt {
    pub executable: PathBuf,
    pub bfile: PathBuf,
    pub pheno_file: PathBuf,
    pub pheno_column: String,
    pub threads: usize,
}

impl HeritabilityEstimator for Bolt {
    fn name(&self) -> &'static str {
        TOOL
    }

    fn estimate(&self, request: &HeritabilityRequest<'_>) -> Result<f64, HeritabilityError> {
        info!("Estimating heritability using {TOOL} ({})...", request.label);
        let mut args: Vec<OsString> = vec![
            "--reml".into(),
            flag_value("--phenoFile=", &self.pheno_file),
            flag_value("--phenoCol=", &self.pheno_column),
            flag_value("--numThreads=", self.threads.to_string()),
            flag_value("--bfile=", &self.bfile),
            flag_value("--maxModelSnps=", MAX_MODEL_SNPS.to_string()),
        ];
        if !request.excluded.is_empty() {
            let removal = request.scratch_dir.join("removed.txt");
            write_removal_file(&removal, request.excluded)
                .map_err(|source| HeritabilityError::Io { tool: TOOL, source })?;
            args.push(flag_value("--remove=", &removal));
        }

        // BOLT has no log file of its own; its standard output is the report.
        let report = request.scratch_dir.join("h2est.log");
        run_tool(TOOL, &self.executable, &args, Capture::File(&report))?;

        MarkerLine::Bolt.read_from(TOOL, &report)
    }
}
